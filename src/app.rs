use crate::config::RuntimeConfig;
use crate::error::{AppError, AppResult};
use crate::model_catalog::ModelCatalog;
use crate::upstream::UpstreamClient;
use axum::Router;
use axum::extract::DefaultBodyLimit;
use axum::http::{HeaderName, HeaderValue, StatusCode};
use axum::routing::{get, post};
use metrics_exporter_prometheus::PrometheusHandle;
use regex::Regex;
use std::sync::{Arc, Once, OnceLock};
use std::time::Duration;
use tower_http::cors::{AllowHeaders, AllowMethods, AllowOrigin, CorsLayer};
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;

const MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

/// Shared by every request; everything inside is immutable after startup.
#[derive(Clone)]
pub struct AppState {
    pub runtime: Arc<RuntimeConfig>,
    pub catalog: Arc<ModelCatalog>,
    pub upstream: UpstreamClient,
    pub metrics: PrometheusHandle,
}

static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();
static METRICS_ERROR: OnceLock<AppError> = OnceLock::new();
static METRICS_INIT: Once = Once::new();

pub fn load_state() -> AppResult<AppState> {
    load_state_with_runtime(RuntimeConfig::from_env()?)
}

pub fn load_state_with_runtime(runtime: RuntimeConfig) -> AppResult<AppState> {
    let upstream = UpstreamClient::new(runtime.upstream.clone(), runtime.generation.clone())?;
    let catalog = ModelCatalog::builtin_with_default(runtime.default_model.as_deref());
    let metrics = init_metrics()?;

    tracing::info!(
        upstream = %runtime.upstream.base_url,
        models = ?catalog.keys(),
        default_model = catalog.default_key(),
        "relay configured"
    );

    Ok(AppState {
        runtime: Arc::new(runtime),
        catalog: Arc::new(catalog),
        upstream,
        metrics,
    })
}

fn init_metrics() -> AppResult<PrometheusHandle> {
    METRICS_INIT.call_once(|| {
        match metrics_exporter_prometheus::PrometheusBuilder::new().install_recorder() {
            Ok(handle) => {
                metrics::describe_counter!(
                    "chatrelay_requests_total",
                    "Chat requests by mode and outcome"
                );
                metrics::describe_counter!(
                    "chatrelay_stream_deltas_total",
                    "Upstream deltas forwarded to clients"
                );
                metrics::describe_histogram!(
                    "chatrelay_request_duration_seconds",
                    metrics::Unit::Seconds,
                    "Time from request receipt to the terminal event"
                );
                let _ = METRICS_HANDLE.set(handle);
            }
            Err(err) => {
                let _ = METRICS_ERROR.set(AppError::new(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "metrics_init_failed",
                    err.to_string(),
                ));
            }
        }
    });

    if let Some(err) = METRICS_ERROR.get() {
        return Err(err.clone());
    }
    METRICS_HANDLE.get().cloned().ok_or_else(|| {
        AppError::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            "metrics_init_failed",
            "metrics recorder not available",
        )
    })
}

pub fn build_app(state: AppState) -> Router {
    let metrics_path = state.runtime.metrics_path.clone();
    let cors = cors_layer(&state.runtime.allowed_origins);
    Router::new()
        .route("/", get(crate::handlers::health))
        .route("/chat", post(crate::handlers::chat))
        .route(&metrics_path, get(crate::handlers::metrics))
        .with_state(state)
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .layer(PropagateRequestIdLayer::new(HeaderName::from_static(
            "x-request-id",
        )))
        .layer(SetRequestIdLayer::new(
            HeaderName::from_static("x-request-id"),
            MakeRequestUuid,
        ))
}

fn cors_layer(allowed_origins: &[String]) -> CorsLayer {
    let patterns: Vec<Regex> = allowed_origins
        .iter()
        .filter_map(|origin| match origin_pattern(origin) {
            Ok(re) => Some(re),
            Err(err) => {
                tracing::warn!(origin = %origin, "ignoring invalid CORS origin: {err}");
                None
            }
        })
        .collect();
    CorsLayer::new()
        .allow_origin(AllowOrigin::predicate(
            move |origin: &HeaderValue, _parts: &axum::http::request::Parts| {
                origin
                    .to_str()
                    .map(|origin| patterns.iter().any(|re| re.is_match(origin)))
                    .unwrap_or(false)
            },
        ))
        .allow_credentials(true)
        .allow_methods(AllowMethods::mirror_request())
        .allow_headers(AllowHeaders::mirror_request())
        .expose_headers([HeaderName::from_static("x-request-id")])
        .max_age(Duration::from_secs(3600))
}

/// `*` matches any run of characters other than `/`.
fn origin_pattern(origin: &str) -> Result<Regex, regex::Error> {
    let mut regex = String::from("^");
    for (i, part) in origin.trim_end_matches('/').split('*').enumerate() {
        if i > 0 {
            regex.push_str("[^/]*");
        }
        regex.push_str(&regex::escape(part));
    }
    regex.push('$');
    Regex::new(&regex)
}

#[cfg(test)]
mod tests {
    use super::origin_pattern;

    #[test]
    fn origin_wildcards_match_one_segment() {
        let localhost = origin_pattern("http://localhost:*").unwrap();
        assert!(localhost.is_match("http://localhost:5173"));
        assert!(!localhost.is_match("http://localhost.evil.com/x:1"));

        let netlify = origin_pattern("https://*.netlify.app").unwrap();
        assert!(netlify.is_match("https://w5model.netlify.app"));
        assert!(!netlify.is_match("https://netlify.app.evil.com"));
        assert!(!netlify.is_match("http://w5model.netlify.app"));

        let exact = origin_pattern("https://hdghs.onrender.com/").unwrap();
        assert!(exact.is_match("https://hdghs.onrender.com"));
        assert!(!exact.is_match("https://hdghs.onrender.com.evil"));
    }
}
