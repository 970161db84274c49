//! Canonical formatting for the fully accumulated response text.
//!
//! The text is scanned once, line by line. Fenced code blocks are copied
//! through byte for byte. Outside fences, `#`..`###` headings get a blank
//! line before and after them; bold and italic spans are emitted verbatim.
//! Blank lines that are already present are never duplicated, so the pass
//! is idempotent.

use regex::Regex;
use std::sync::LazyLock;

static FENCE_OPEN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^ {0,3}```[^`]*$").expect("fence open pattern"));
static FENCE_CLOSE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^ {0,3}```+[ \t]*$").expect("fence close pattern"));
static HEADING: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^#{1,3} +\S").expect("heading pattern"));

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Line {
    Blank,
    Heading,
    FenceOpen,
    FenceBody,
    FenceClose,
    Text,
}

fn classify(line: &str, in_fence: bool) -> Line {
    let line = line.strip_suffix('\r').unwrap_or(line);
    if in_fence {
        if FENCE_CLOSE.is_match(line) {
            Line::FenceClose
        } else {
            Line::FenceBody
        }
    } else if line.trim().is_empty() {
        Line::Blank
    } else if FENCE_OPEN.is_match(line) {
        Line::FenceOpen
    } else if HEADING.is_match(line) {
        Line::Heading
    } else {
        Line::Text
    }
}

pub fn normalize(text: &str) -> String {
    let mut out: Vec<&str> = Vec::new();
    let mut in_fence = false;
    let mut blank_pending = false;

    for line in text.split('\n') {
        let kind = classify(line, in_fence);
        match kind {
            Line::FenceOpen => in_fence = true,
            Line::FenceClose => in_fence = false,
            _ => {}
        }

        if blank_pending {
            blank_pending = false;
            if kind != Line::Blank {
                out.push("");
            }
        }

        if kind == Line::Heading {
            let after_blank = out.last().is_none_or(|prev| prev.trim().is_empty());
            if !after_blank {
                out.push("");
            }
            blank_pending = true;
        }
        out.push(line);
    }

    out.join("\n")
}
