//! Per-request relay pipeline.
//!
//! A request moves through `Validating -> Resolving -> Streaming ->
//! Finalizing -> Done`, or drops into `Failed` from any of the first four.
//! The state is owned by the single task serving the request; nothing here
//! is shared between requests except the read-only catalog.

use crate::chat::{self, ChatRequest, ContentPart};
use crate::error::RelayError;
use crate::markdown;
use crate::model_catalog::ModelCatalog;
use crate::sse::{EventSink, StreamEvent};
use futures_util::{Stream, StreamExt};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayPhase {
    Validating,
    Resolving,
    Streaming,
    Finalizing,
    Done,
    Failed,
}

/// Buffers deltas for the final normalization pass while forwarding them as-is.
#[derive(Debug, Default)]
pub struct ChunkAccumulator {
    buffer: String,
    chunks: usize,
}

impl ChunkAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, delta: String) -> String {
        self.buffer.push_str(&delta);
        self.chunks += 1;
        delta
    }

    pub fn chunks(&self) -> usize {
        self.chunks
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn finalize(self) -> String {
        self.buffer
    }
}

#[derive(Debug)]
pub struct RelayState {
    phase: RelayPhase,
    pub content: Vec<ContentPart>,
    pub model: String,
    accumulator: ChunkAccumulator,
}

impl RelayState {
    pub fn phase(&self) -> RelayPhase {
        self.phase
    }

    fn advance(&mut self, next: RelayPhase) {
        tracing::trace!(from = ?self.phase, to = ?next, "relay phase");
        self.phase = next;
    }
}

/// How a streamed relay ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayOutcome {
    Completed { chunks: usize, bytes: usize },
    Failed(RelayError),
    Cancelled,
}

/// Validating and Resolving: checks the request, picks the provider model and
/// assembles the user turn. No upstream call is made on failure.
pub fn prepare(req: &ChatRequest, catalog: &ModelCatalog) -> Result<RelayState, RelayError> {
    chat::validate(req)?;
    let mut state = RelayState {
        phase: RelayPhase::Validating,
        content: Vec::new(),
        model: String::new(),
        accumulator: ChunkAccumulator::new(),
    };
    state.advance(RelayPhase::Resolving);
    state.model = catalog.resolve(req.model.as_deref()).to_string();
    state.content = chat::assemble_content(req);
    Ok(state)
}

/// Streaming through Done. Forwards every delta as it arrives, then emits the
/// normalized `Final` event and the `[DONE]` sentinel. A failure emits one
/// `Error` event and nothing else. Returns early, dropping `deltas`, as soon
/// as the client disconnects. Upstream stalls surface as errors from `deltas`.
pub async fn run_stream<S>(mut state: RelayState, deltas: S, mut sink: EventSink) -> RelayOutcome
where
    S: Stream<Item = Result<String, RelayError>>,
{
    state.advance(RelayPhase::Streaming);
    let mut deltas = std::pin::pin!(deltas);

    loop {
        let next = tokio::select! {
            biased;
            _ = sink.closed() => {
                tracing::info!(model = %state.model, chunks = state.accumulator.chunks(), "client disconnected, abandoning upstream stream");
                return RelayOutcome::Cancelled;
            }
            next = deltas.next() => next,
        };
        let delta = match next {
            Some(Ok(delta)) => delta,
            None => break,
            Some(Err(err)) => return fail(state, sink, err).await,
        };
        let text = state.accumulator.append(delta);
        metrics::counter!("chatrelay_stream_deltas_total").increment(1);
        if sink.send(StreamEvent::Delta { text }).await.is_err() {
            tracing::info!(model = %state.model, "client disconnected during delta");
            return RelayOutcome::Cancelled;
        }
    }

    state.advance(RelayPhase::Finalizing);
    let chunks = state.accumulator.chunks();
    let bytes = state.accumulator.len();
    let text = markdown::normalize(&std::mem::take(&mut state.accumulator).finalize());
    if sink.send(StreamEvent::Final { text }).await.is_err() {
        return RelayOutcome::Cancelled;
    }
    if sink.send(StreamEvent::Done).await.is_err() {
        return RelayOutcome::Cancelled;
    }
    state.advance(RelayPhase::Done);
    tracing::debug!(model = %state.model, chunks, bytes, "relay stream completed");
    RelayOutcome::Completed { chunks, bytes }
}

async fn fail(mut state: RelayState, mut sink: EventSink, err: RelayError) -> RelayOutcome {
    state.advance(RelayPhase::Failed);
    tracing::warn!(
        model = %state.model,
        chunks = state.accumulator.chunks(),
        "relay stream failed: {err}"
    );
    let message = err.to_string();
    if sink.send(StreamEvent::Error { message }).await.is_err() {
        return RelayOutcome::Cancelled;
    }
    RelayOutcome::Failed(err)
}

/// Buffered variant: normalizes a complete upstream answer.
pub fn finish_buffered(mut state: RelayState, text: String) -> String {
    state.advance(RelayPhase::Finalizing);
    state.accumulator.append(text);
    let normalized = markdown::normalize(&std::mem::take(&mut state.accumulator).finalize());
    tracing::debug!(model = %state.model, bytes = normalized.len(), "relay response completed");
    normalized
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::response::sse::Event;
    use futures_util::stream;
    use tokio::sync::mpsc;

    fn hello() -> ChatRequest {
        ChatRequest {
            user_input: Some("hello".to_string()),
            model: Some("gemma".to_string()),
            ..ChatRequest::default()
        }
    }

    async fn drain(mut rx: mpsc::Receiver<Event>) -> usize {
        let mut n = 0;
        while rx.recv().await.is_some() {
            n += 1;
        }
        n
    }

    #[test]
    fn accumulator_concatenates_in_arrival_order() {
        let mut acc = ChunkAccumulator::new();
        assert_eq!(acc.len(), 0);
        assert_eq!(acc.append("He".to_string()), "He");
        assert_eq!(acc.append("llo".to_string()), "llo");
        assert_eq!(acc.append("He".to_string()), "He");
        assert_eq!(acc.chunks(), 3);
        assert_eq!(acc.finalize(), "HelloHe");
    }

    #[test]
    fn prepare_resolves_model_and_content() {
        let state = prepare(&hello(), &ModelCatalog::builtin()).unwrap();
        assert_eq!(state.phase(), RelayPhase::Resolving);
        assert_eq!(state.model, "google/gemma-3-27b-it:free");
        assert_eq!(state.content, vec![ContentPart::text("hello")]);
    }

    #[test]
    fn prepare_rejects_empty_request() {
        let err = prepare(&ChatRequest::default(), &ModelCatalog::builtin()).unwrap_err();
        assert!(matches!(err, RelayError::Validation(_)));
    }

    #[tokio::test]
    async fn successful_stream_ends_with_final_and_done() {
        let state = prepare(&hello(), &ModelCatalog::builtin()).unwrap();
        let deltas = stream::iter(vec![
            Ok("intro\n".to_string()),
            Ok("# Head".to_string()),
            Ok("er\nbody".to_string()),
        ]);
        let (tx, rx) = mpsc::channel(16);
        let outcome = run_stream(state, deltas, EventSink::new(tx)).await;
        assert_eq!(
            outcome,
            RelayOutcome::Completed {
                chunks: 3,
                bytes: "intro\n# Header\nbody".len()
            }
        );
        assert_eq!(drain(rx).await, 5);
    }

    #[tokio::test]
    async fn upstream_error_is_the_last_event() {
        let state = prepare(&hello(), &ModelCatalog::builtin()).unwrap();
        let deltas = stream::iter(vec![
            Ok("a".to_string()),
            Ok("b".to_string()),
            Err(RelayError::Upstream("connection dropped".to_string())),
            Ok("never".to_string()),
        ]);
        let (tx, rx) = mpsc::channel(16);
        let outcome = run_stream(state, deltas, EventSink::new(tx)).await;
        assert_eq!(
            outcome,
            RelayOutcome::Failed(RelayError::Upstream("connection dropped".to_string()))
        );
        assert_eq!(drain(rx).await, 3);
    }

    #[tokio::test]
    async fn client_disconnect_stops_consuming_upstream() {
        let state = prepare(&hello(), &ModelCatalog::builtin()).unwrap();
        let deltas = stream::pending::<Result<String, RelayError>>();
        let (tx, rx) = mpsc::channel(16);
        drop(rx);
        let outcome = run_stream(state, deltas, EventSink::new(tx)).await;
        assert_eq!(outcome, RelayOutcome::Cancelled);
    }

    #[test]
    fn buffered_text_is_normalized() {
        let state = prepare(&hello(), &ModelCatalog::builtin()).unwrap();
        assert_eq!(finish_buffered(state, "a\n## b\nc".to_string()), "a\n\n## b\n\nc");
    }
}
