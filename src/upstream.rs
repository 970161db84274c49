use crate::chat::ContentPart;
use crate::config::{GenerationParams, UpstreamConfig};
use crate::error::{AppError, RelayError};
use crate::sse::DONE_SENTINEL;
use axum::http::StatusCode;
use eventsource_stream::Eventsource;
use futures_util::{Stream, StreamExt, future};
use serde_json::{Value, json};
use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

const COMPLETIONS_PATH: &str = "/chat/completions";

/// Text deltas of one streaming completion, in arrival order.
pub type DeltaStream = Pin<Box<dyn Stream<Item = Result<String, RelayError>> + Send>>;

/// Chat-completion client for the configured provider. Cheap to clone; the
/// underlying connection pool is shared.
#[derive(Clone)]
pub struct UpstreamClient {
    http: reqwest::Client,
    config: Arc<UpstreamConfig>,
    generation: Arc<GenerationParams>,
}

impl UpstreamClient {
    pub fn new(config: UpstreamConfig, generation: GenerationParams) -> Result<Self, AppError> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("chatrelay/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(config.connect_timeout)
            .read_timeout(config.idle_timeout)
            .build()
            .map_err(|err| {
                AppError::new(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "http_client_init_failed",
                    err.to_string(),
                )
            })?;
        Ok(Self {
            http,
            config: Arc::new(config),
            generation: Arc::new(generation),
        })
    }

    pub fn request_body(&self, model: &str, content: &[ContentPart], stream: bool) -> Value {
        json!({
            "model": model,
            "messages": [
                { "role": "system", "content": self.generation.system_prompt },
                { "role": "user", "content": content }
            ],
            "max_tokens": self.generation.max_tokens,
            "temperature": self.generation.temperature,
            "stream": stream
        })
    }

    /// Opens a streaming completion. Exactly one attempt is made.
    pub async fn open_stream(
        &self,
        model: &str,
        content: &[ContentPart],
    ) -> Result<DeltaStream, RelayError> {
        let body = self.request_body(model, content, true);
        let resp = self.send(&body).await?;
        let deltas = with_idle_timeout(resp.bytes_stream(), self.config.idle_timeout)
            .eventsource()
            .take_while(|ev| {
                future::ready(!matches!(ev, Ok(ev) if ev.data.trim() == DONE_SENTINEL))
            })
            .filter_map(|ev| future::ready(parse_stream_event(ev)));
        Ok(Box::pin(deltas))
    }

    /// Non-streaming completion; returns the raw (unnormalized) message text.
    pub async fn complete(&self, model: &str, content: &[ContentPart]) -> Result<String, RelayError> {
        let body = self.request_body(model, content, false);
        let resp = self.send(&body).await?;
        let value: Value = resp
            .json()
            .await
            .map_err(|err| RelayError::Upstream(format!("invalid upstream response: {err}")))?;
        if let Some(message) = error_message(&value) {
            return Err(RelayError::Upstream(message));
        }
        value
            .get("choices")
            .and_then(|v| v.as_array())
            .and_then(|arr| arr.first())
            .and_then(|c| c.get("message"))
            .and_then(|m| m.get("content"))
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .ok_or_else(|| RelayError::Upstream("upstream response has no message content".to_string()))
    }

    async fn send(&self, body: &Value) -> Result<reqwest::Response, RelayError> {
        let url = join_url(&self.config.base_url, COMPLETIONS_PATH);
        let mut req = self
            .http
            .post(url)
            .bearer_auth(self.config.api_key.expose())
            .json(body);
        if let Some(referer) = &self.config.referer {
            req = req.header("HTTP-Referer", referer);
        }
        if let Some(title) = &self.config.title {
            req = req.header("X-Title", title);
        }
        let resp = req
            .send()
            .await
            .map_err(|err| RelayError::Upstream(format!("upstream request failed: {err}")))?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            let message = serde_json::from_str::<Value>(&text)
                .ok()
                .and_then(|v| error_message(&v))
                .unwrap_or(text);
            return Err(RelayError::Upstream(format!(
                "upstream status {status}: {message}"
            )));
        }
        Ok(resp)
    }
}

/// Fails the byte stream once no bytes arrive for `idle`. Applied before SSE
/// parsing so comments and content-free chunks keep the stream alive.
fn with_idle_timeout<S, T, E>(
    inner: S,
    idle: Duration,
) -> impl Stream<Item = Result<T, String>> + Send
where
    S: Stream<Item = Result<T, E>> + Send + 'static,
    T: Send + 'static,
    E: fmt::Display + Send + 'static,
{
    futures_util::stream::unfold(Some(Box::pin(inner)), move |inner| async move {
        let mut inner = inner?;
        match tokio::time::timeout(idle, inner.next()).await {
            Ok(Some(Ok(bytes))) => Some((Ok(bytes), Some(inner))),
            Ok(Some(Err(err))) => Some((Err(err.to_string()), None)),
            Ok(None) => None,
            Err(_) => Some((
                Err(format!("upstream idle for more than {}ms", idle.as_millis())),
                None,
            )),
        }
    })
}

fn parse_stream_event<E: fmt::Display>(
    ev: Result<eventsource_stream::Event, E>,
) -> Option<Result<String, RelayError>> {
    let ev = match ev {
        Ok(ev) => ev,
        Err(err) => {
            return Some(Err(RelayError::Upstream(format!(
                "upstream stream failed: {err}"
            ))));
        }
    };
    let value: Value = match serde_json::from_str(&ev.data) {
        Ok(value) => value,
        Err(err) => {
            return Some(Err(RelayError::Upstream(format!(
                "malformed upstream chunk: {err}"
            ))));
        }
    };
    if let Some(message) = error_message(&value) {
        return Some(Err(RelayError::Upstream(message)));
    }
    value
        .get("choices")
        .and_then(|v| v.as_array())
        .and_then(|arr| arr.first())
        .and_then(|c| c.get("delta"))
        .and_then(|d| d.get("content"))
        .and_then(|v| v.as_str())
        .filter(|t| !t.is_empty())
        .map(|t| Ok(t.to_string()))
}

fn error_message(value: &Value) -> Option<String> {
    let err = value.get("error").filter(|e| !e.is_null())?;
    err.get("message")
        .and_then(|v| v.as_str())
        .or_else(|| err.as_str())
        .map(str::to_string)
        .or_else(|| Some(err.to_string()))
}

fn join_url(base: &str, path: &str) -> String {
    let base = base.trim_end_matches('/');
    let path = path.trim_start_matches('/');
    if path.is_empty() {
        base.to_string()
    } else {
        format!("{}/{}", base, path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ApiKey;

    fn event(data: &str) -> eventsource_stream::Event {
        eventsource_stream::Event {
            data: data.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn request_body_carries_fixed_generation_params() {
        let client = UpstreamClient::new(
            UpstreamConfig::new("http://127.0.0.1:1", ApiKey::new("k")),
            GenerationParams::default(),
        )
        .unwrap();
        let body = client.request_body("m/x", &[ContentPart::text("hello")], true);
        assert_eq!(body["model"], "m/x");
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["messages"][1]["content"][0]["text"], "hello");
        assert_eq!(body["max_tokens"], 4096);
        assert_eq!(body["temperature"], 0.5);
        assert_eq!(body["stream"], true);
    }

    #[test]
    fn configured_temperature_is_sent_verbatim() {
        let generation = GenerationParams {
            temperature: 0.7,
            ..GenerationParams::default()
        };
        let client = UpstreamClient::new(
            UpstreamConfig::new("http://127.0.0.1:1", ApiKey::new("k")),
            generation,
        )
        .unwrap();
        let body = client.request_body("m/x", &[ContentPart::text("hi")], false);
        assert_eq!(body["temperature"].as_f64(), Some(0.7));
        assert_eq!(body["temperature"].to_string(), "0.7");
    }

    #[tokio::test]
    async fn idle_timeout_resets_on_every_item() {
        let steady = futures_util::stream::iter(0..5).then(|i| async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            Ok::<_, String>(i)
        });
        let items: Vec<_> = with_idle_timeout(steady, Duration::from_millis(200))
            .collect()
            .await;
        assert_eq!(items, (0..5).map(Ok).collect::<Vec<_>>());

        let stalled = futures_util::stream::iter(vec![Ok::<_, String>(1)])
            .chain(futures_util::stream::pending());
        let items: Vec<_> = with_idle_timeout(stalled, Duration::from_millis(20))
            .collect()
            .await;
        assert_eq!(items.len(), 2);
        assert_eq!(items[0], Ok(1));
        assert!(matches!(&items[1], Err(msg) if msg.contains("idle")));
    }

    #[test]
    fn stream_events_yield_content_deltas() {
        let chunk = r#"{"choices":[{"index":0,"delta":{"content":"Hel"}}]}"#;
        assert_eq!(
            parse_stream_event::<String>(Ok(event(chunk))),
            Some(Ok("Hel".to_string()))
        );

        let role_only = r#"{"choices":[{"index":0,"delta":{"role":"assistant"}}]}"#;
        assert_eq!(parse_stream_event::<String>(Ok(event(role_only))), None);
    }

    #[test]
    fn stream_errors_become_upstream_errors() {
        let provider = r#"{"error":{"message":"Rate limit exceeded","code":429}}"#;
        assert_eq!(
            parse_stream_event::<String>(Ok(event(provider))),
            Some(Err(RelayError::Upstream("Rate limit exceeded".to_string())))
        );
        assert!(matches!(
            parse_stream_event::<String>(Ok(event("not json"))),
            Some(Err(RelayError::Upstream(_)))
        ));
        assert!(matches!(
            parse_stream_event(Err("connection reset".to_string())),
            Some(Err(RelayError::Upstream(msg))) if msg.contains("connection reset")
        ));
    }

    #[test]
    fn join_url_handles_slashes() {
        assert_eq!(
            join_url("https://openrouter.ai/api/v1/", "/chat/completions"),
            "https://openrouter.ai/api/v1/chat/completions"
        );
        assert_eq!(join_url("http://h", ""), "http://h");
    }
}
