use std::collections::HashMap;

const BUILTIN_MODELS: &[(&str, &str)] = &[
    ("deepseek", "deepseek/deepseek-chat-v3-0324:free"),
    ("gemini", "google/gemini-2.0-flash-exp:free"),
    ("gemma", "google/gemma-3-27b-it:free"),
    ("qwen", "qwen/qwen2.5-vl-72b-instruct:free"),
    ("llama-4-maverick", "meta-llama/llama-4-maverick:free"),
];
const BUILTIN_DEFAULT: &str = "deepseek";

/// Logical model key to provider model id. Immutable once built.
#[derive(Debug, Clone)]
pub struct ModelCatalog {
    entries: HashMap<String, String>,
    default_key: String,
}

impl ModelCatalog {
    pub fn builtin() -> Self {
        Self {
            entries: BUILTIN_MODELS
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            default_key: BUILTIN_DEFAULT.to_string(),
        }
    }

    /// Built-in catalog with the fallback entry switched to `default_key` when it is known.
    pub fn builtin_with_default(default_key: Option<&str>) -> Self {
        let mut catalog = Self::builtin();
        if let Some(key) = default_key {
            if catalog.entries.contains_key(key) {
                catalog.default_key = key.to_string();
            } else {
                tracing::warn!(
                    default_model = key,
                    "unknown default model key, keeping {}",
                    catalog.default_key
                );
            }
        }
        catalog
    }

    pub fn default_key(&self) -> &str {
        &self.default_key
    }

    pub fn default_model(&self) -> &str {
        self.entries
            .get(&self.default_key)
            .map(String::as_str)
            .unwrap_or_default()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    pub fn keys(&self) -> Vec<&str> {
        let mut keys: Vec<&str> = self.entries.keys().map(String::as_str).collect();
        keys.sort_unstable();
        keys
    }

    /// Never fails: unknown, empty or absent keys resolve to the default model.
    ///
    /// A provider-qualified name such as `qwen/qwen2.5-vl-72b-instruct` or
    /// `gemini:free` resolves through the text before its first `/` or `:`.
    pub fn resolve(&self, requested: Option<&str>) -> &str {
        let Some(requested) = requested.map(str::trim).filter(|s| !s.is_empty()) else {
            return self.default_model();
        };
        if let Some(model) = self.get(requested) {
            return model;
        }
        let prefix = requested
            .split(['/', ':'])
            .next()
            .unwrap_or(requested);
        self.get(prefix).unwrap_or_else(|| self.default_model())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_keys_resolve_to_their_provider_model() {
        let catalog = ModelCatalog::builtin();
        for &(key, model) in BUILTIN_MODELS {
            assert_eq!(catalog.resolve(Some(key)), model);
        }
    }

    #[test]
    fn unknown_and_empty_keys_fall_back_to_default() {
        let catalog = ModelCatalog::builtin();
        let default = "deepseek/deepseek-chat-v3-0324:free";
        assert_eq!(catalog.resolve(None), default);
        assert_eq!(catalog.resolve(Some("")), default);
        assert_eq!(catalog.resolve(Some("   ")), default);
        assert_eq!(catalog.resolve(Some("gpt-4o")), default);
        assert_eq!(catalog.resolve(Some("/gemini")), default);
        assert_eq!(catalog.resolve(Some("Gemini")), default);
    }

    #[test]
    fn qualified_names_resolve_by_prefix() {
        let catalog = ModelCatalog::builtin();
        assert_eq!(
            catalog.resolve(Some("gemini:free")),
            "google/gemini-2.0-flash-exp:free"
        );
        assert_eq!(
            catalog.resolve(Some("qwen/qwen3-235b")),
            "qwen/qwen2.5-vl-72b-instruct:free"
        );
        assert_eq!(
            catalog.resolve(Some("llama-4-maverick:extended")),
            "meta-llama/llama-4-maverick:free"
        );
    }

    #[test]
    fn default_can_be_switched_to_a_known_key() {
        let catalog = ModelCatalog::builtin_with_default(Some("gemma"));
        assert_eq!(catalog.resolve(Some("nope")), "google/gemma-3-27b-it:free");

        let catalog = ModelCatalog::builtin_with_default(Some("nope"));
        assert_eq!(catalog.default_key(), "deepseek");
    }
}
