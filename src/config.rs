use crate::error::AppError;
use axum::http::StatusCode;
use std::fmt;
use std::time::Duration;

const DEFAULT_PORT: &str = "10000";
const DEFAULT_BASE_URL: &str = "https://openrouter.ai/api/v1";
const DEFAULT_REFERER: &str = "https://w5model.netlify.app/";
const DEFAULT_TITLE: &str = "My AI Assistant";
const DEFAULT_SYSTEM_PROMPT: &str = "Вы очень полезный помощник отвечающий на русском языке!";
const DEFAULT_ALLOWED_ORIGINS: &[&str] = &[
    "https://w5model.netlify.app",
    "http://localhost:*",
    "https://*.netlify.app",
    "https://hdghs.onrender.com",
    "http://localhost:5174",
];

/// Bearer credential for the completion provider. `Debug` never prints the value.
#[derive(Clone)]
pub struct ApiKey(String);

impl ApiKey {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for ApiKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ApiKey(***)")
    }
}

/// Fixed per-deployment generation parameters; callers cannot override them.
#[derive(Debug, Clone)]
pub struct GenerationParams {
    pub system_prompt: String,
    pub max_tokens: u32,
    pub temperature: f64,
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            max_tokens: 4096,
            temperature: 0.5,
        }
    }
}

#[derive(Debug, Clone)]
pub struct UpstreamConfig {
    pub base_url: String,
    pub api_key: ApiKey,
    pub referer: Option<String>,
    pub title: Option<String>,
    pub idle_timeout: Duration,
    pub connect_timeout: Duration,
}

impl UpstreamConfig {
    pub fn new(base_url: impl Into<String>, api_key: ApiKey) -> Self {
        Self {
            base_url: base_url.into(),
            api_key,
            referer: Some(DEFAULT_REFERER.to_string()),
            title: Some(DEFAULT_TITLE.to_string()),
            idle_timeout: Duration::from_millis(60_000),
            connect_timeout: Duration::from_millis(10_000),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub listen: String,
    pub metrics_path: String,
    pub allowed_origins: Vec<String>,
    pub default_model: Option<String>,
    pub upstream: UpstreamConfig,
    pub generation: GenerationParams,
}

impl RuntimeConfig {
    /// Configuration with defaults for everything except the provider endpoint.
    pub fn new(upstream: UpstreamConfig) -> Self {
        Self {
            listen: format!("0.0.0.0:{DEFAULT_PORT}"),
            metrics_path: "/metrics".to_string(),
            allowed_origins: DEFAULT_ALLOWED_ORIGINS
                .iter()
                .map(|s| s.to_string())
                .collect(),
            default_model: None,
            upstream,
            generation: GenerationParams::default(),
        }
    }

    pub fn from_env() -> Result<Self, AppError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the configuration from a key lookup. Blank values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, AppError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let api_key = get("AI_TOKEN").ok_or_else(|| {
            AppError::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                "upstream_token_missing",
                "AI_TOKEN must be set",
            )
        })?;
        let base_url = get("CHATRELAY_UPSTREAM_BASE_URL")
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());

        let mut upstream = UpstreamConfig::new(base_url, ApiKey::new(api_key));
        if let Some(referer) = get("CHATRELAY_REFERER") {
            upstream.referer = Some(referer);
        }
        if let Some(title) = get("CHATRELAY_TITLE") {
            upstream.title = Some(title);
        }
        if let Some(ms) = parse_var::<u64>(&get, "CHATRELAY_IDLE_TIMEOUT_MS")? {
            upstream.idle_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_var::<u64>(&get, "CHATRELAY_CONNECT_TIMEOUT_MS")? {
            upstream.connect_timeout = Duration::from_millis(ms);
        }

        let mut config = Self::new(upstream);
        config.listen = get("CHATRELAY_LISTEN").unwrap_or_else(|| {
            let port = get("PORT").unwrap_or_else(|| DEFAULT_PORT.to_string());
            format!("0.0.0.0:{}", port.trim())
        });
        if let Some(path) = get("CHATRELAY_METRICS_PATH") {
            config.metrics_path = path;
        }
        if let Some(origins) = get("CHATRELAY_ALLOWED_ORIGINS") {
            config.allowed_origins = origins
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }
        config.default_model = get("CHATRELAY_DEFAULT_MODEL");
        if let Some(prompt) = get("CHATRELAY_SYSTEM_PROMPT") {
            config.generation.system_prompt = prompt;
        }
        if let Some(max_tokens) = parse_var::<u32>(&get, "CHATRELAY_MAX_TOKENS")? {
            config.generation.max_tokens = max_tokens;
        }
        if let Some(temperature) = parse_var::<f64>(&get, "CHATRELAY_TEMPERATURE")? {
            config.generation.temperature = temperature;
        }
        Ok(config)
    }

    /// Port component of the listen address, reported by the health check.
    pub fn port(&self) -> &str {
        self.listen
            .rsplit_once(':')
            .map(|(_, port)| port)
            .unwrap_or(self.listen.as_str())
    }
}

fn parse_var<T>(get: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>, AppError>
where
    T: std::str::FromStr,
    T::Err: fmt::Display,
{
    match get(key) {
        None => Ok(None),
        Some(raw) => raw.trim().parse::<T>().map(Some).map_err(|err| {
            AppError::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                "config_invalid",
                format!("{key}: {err}"),
            )
        }),
    }
}
