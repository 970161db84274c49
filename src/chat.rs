use crate::error::RelayError;
use serde::{Deserialize, Serialize};

pub const MISSING_INPUT_MESSAGE: &str = "Требуется текст или изображение";

/// One inbound chat turn as posted by the browser client.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatRequest {
    #[serde(default)]
    pub user_input: Option<String>,
    #[serde(default)]
    pub image_url: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub stream: Option<bool>,
}

impl ChatRequest {
    pub fn text(&self) -> Option<&str> {
        non_blank(self.user_input.as_deref())
    }

    pub fn image(&self) -> Option<&str> {
        non_blank(self.image_url.as_deref())
    }

    pub fn wants_stream(&self) -> bool {
        self.stream.unwrap_or(true)
    }
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.filter(|v| !v.trim().is_empty())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ImageUrl {
    pub url: String,
}

/// Part of the user message content, in the provider's multi-part shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    ImageUrl { image_url: ImageUrl },
}

impl ContentPart {
    pub fn text(text: impl Into<String>) -> Self {
        ContentPart::Text { text: text.into() }
    }

    pub fn image(url: impl Into<String>) -> Self {
        ContentPart::ImageUrl {
            image_url: ImageUrl { url: url.into() },
        }
    }
}

/// Rejects requests carrying neither text nor an image.
pub fn validate(req: &ChatRequest) -> Result<(), RelayError> {
    if req.text().is_none() && req.image().is_none() {
        return Err(RelayError::Validation(MISSING_INPUT_MESSAGE.to_string()));
    }
    Ok(())
}

/// Text part first, then image part. Callers must have run [`validate`].
pub fn assemble_content(req: &ChatRequest) -> Vec<ContentPart> {
    let mut parts = Vec::with_capacity(2);
    if let Some(text) = req.text() {
        parts.push(ContentPart::text(text));
    }
    if let Some(url) = req.image() {
        parts.push(ContentPart::image(url));
    }
    parts
}
