use axum::response::sse::Event;
use serde_json::json;
use tokio::sync::mpsc;

pub const DONE_SENTINEL: &str = "[DONE]";

/// One logical item of the outbound event stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    Delta { text: String },
    Final { text: String },
    Done,
    Error { message: String },
}

impl StreamEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamEvent::Done | StreamEvent::Error { .. })
    }

    /// The `data:` field of the event.
    pub fn payload(&self) -> String {
        match self {
            StreamEvent::Delta { text } | StreamEvent::Final { text } => {
                json!({ "content": text }).to_string()
            }
            StreamEvent::Done => DONE_SENTINEL.to_string(),
            StreamEvent::Error { message } => json!({ "error": message }).to_string(),
        }
    }

    pub fn into_event(self) -> Event {
        Event::default().data(self.payload())
    }
}

/// The client went away; nothing more can be delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientGone;

/// Write half of one response stream. Drops everything after the first terminal event.
pub struct EventSink {
    tx: mpsc::Sender<Event>,
    terminated: bool,
}

impl EventSink {
    pub fn new(tx: mpsc::Sender<Event>) -> Self {
        Self {
            tx,
            terminated: false,
        }
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated
    }

    pub async fn send(&mut self, event: StreamEvent) -> Result<(), ClientGone> {
        if self.terminated {
            tracing::debug!(?event, "event after terminal event dropped");
            return Ok(());
        }
        self.terminated = event.is_terminal();
        self.tx.send(event.into_event()).await.map_err(|_| ClientGone)
    }

    /// Resolves once the receiving side has been dropped.
    pub async fn closed(&self) {
        self.tx.closed().await
    }
}
