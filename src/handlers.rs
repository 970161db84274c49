use crate::app::AppState;
use crate::chat::ChatRequest;
use crate::error::{AppError, AppResult, RelayError};
use crate::relay::{self, RelayOutcome};
use crate::sse::EventSink;
use axum::Json;
use axum::extract::State;
use axum::extract::rejection::JsonRejection;
use axum::response::sse::Event;
use axum::response::{IntoResponse, Response, Sse};
use futures_util::StreamExt;
use serde_json::{Value, json};
use std::convert::Infallible;
use std::time::Instant;
use tokio::sync::mpsc;

const SERVICE_NAME: &str = "AI Assistant";

pub async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "OK",
        "service": SERVICE_NAME,
        "version": env!("CARGO_PKG_VERSION"),
        "port": state.runtime.port(),
    }))
}

pub async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    state.metrics.render()
}

pub async fn chat(
    State(state): State<AppState>,
    payload: Result<Json<ChatRequest>, JsonRejection>,
) -> AppResult<Response> {
    let started_at = Instant::now();
    let Json(req) = payload.map_err(|rejection| {
        reject(
            "unknown",
            started_at,
            RelayError::Validation(rejection.body_text()),
        )
    })?;
    let mode = if req.wants_stream() { "stream" } else { "buffered" };
    tracing::info!(
        model = req.model.as_deref().unwrap_or_default(),
        has_text = req.text().is_some(),
        has_image = req.image().is_some(),
        mode,
        "chat request"
    );

    let relay_state =
        relay::prepare(&req, &state.catalog).map_err(|err| reject(mode, started_at, err))?;
    tracing::debug!(model = %relay_state.model, parts = relay_state.content.len(), "model resolved");

    if req.wants_stream() {
        let deltas = state
            .upstream
            .open_stream(&relay_state.model, &relay_state.content)
            .await
            .map_err(|err| reject(mode, started_at, err))?;
        let (tx, rx) = mpsc::channel::<Event>(64);
        tokio::spawn(async move {
            let outcome = relay::run_stream(relay_state, deltas, EventSink::new(tx)).await;
            let label = match outcome {
                RelayOutcome::Completed { .. } => "success",
                RelayOutcome::Failed(_) => "upstream_error",
                RelayOutcome::Cancelled => "cancelled",
            };
            record_request(mode, label, started_at);
        });
        let events = tokio_stream::wrappers::ReceiverStream::new(rx).map(Ok::<_, Infallible>);
        return Ok(Sse::new(events).into_response());
    }

    let text = state
        .upstream
        .complete(&relay_state.model, &relay_state.content)
        .await
        .map_err(|err| reject(mode, started_at, err))?;
    let content = relay::finish_buffered(relay_state, text);
    record_request(mode, "success", started_at);
    Ok(Json(json!({ "content": content })).into_response())
}

fn reject(mode: &'static str, started_at: Instant, err: RelayError) -> AppError {
    match &err {
        RelayError::Validation(message) => tracing::warn!("invalid request data: {message}"),
        _ => tracing::error!("chat request failed: {err}"),
    }
    record_request(mode, err.code(), started_at);
    err.into()
}

fn record_request(mode: &'static str, outcome: &'static str, started_at: Instant) {
    metrics::counter!("chatrelay_requests_total", "mode" => mode, "outcome" => outcome)
        .increment(1);
    metrics::histogram!("chatrelay_request_duration_seconds", "mode" => mode)
        .record(started_at.elapsed().as_secs_f64());
}
