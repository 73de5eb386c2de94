use serde::{Deserialize, Serialize};
use std::env;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use crate::errors::AssistantError;

pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
pub const DEFAULT_MODEL: &str = "gpt-4o-mini";
pub const DEFAULT_TEMPERATURE: f32 = 0.7;
pub const DEFAULT_LANGUAGE: &str = "en";

/// The credential record. Only the privileged broker process ever holds one.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    pub api_key: String,
    #[serde(default)]
    pub base_url: String,
}

impl Config {
    #[must_use]
    pub fn new(api_key: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            base_url: base_url.into(),
        }
    }

    #[must_use]
    pub fn is_configured(&self) -> bool {
        !self.api_key.trim().is_empty()
    }

    /// Base URL with the default substituted for an empty value.
    #[must_use]
    pub fn effective_base_url(&self) -> &str {
        let trimmed = self.base_url.trim();
        if trimmed.is_empty() {
            DEFAULT_BASE_URL
        } else {
            trimmed
        }
    }

    /// The chat-completions endpoint derived from the base URL.
    #[must_use]
    pub fn completions_url(&self) -> String {
        let base = self.effective_base_url().trim_end_matches('/');
        if base.ends_with("/chat/completions") {
            base.to_string()
        } else {
            format!("{base}/chat/completions")
        }
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("api_key", &"<redacted>")
            .field("base_url", &self.base_url)
            .finish()
    }
}

/// Picks a model for the provider behind `base_url`.
#[must_use]
pub fn resolve_model(base_url: &str) -> &'static str {
    if base_url.to_ascii_lowercase().contains("open.bigmodel.cn") {
        "glm-4-flash"
    } else {
        DEFAULT_MODEL
    }
}

/// Runtime knobs for the host process, read from the environment.
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    /// Overrides the model picked by [`resolve_model`].
    pub model: Option<String>,
    pub temperature: f32,
    /// Target language used when a caller does not name one.
    pub default_language: String,
    /// `None` means remote calls never time out and only cancellation ends them.
    pub request_timeout: Option<Duration>,
    pub storage_path: Option<PathBuf>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            model: None,
            temperature: DEFAULT_TEMPERATURE,
            default_language: DEFAULT_LANGUAGE.to_string(),
            request_timeout: None,
            storage_path: None,
        }
    }
}

impl Settings {
    /// # Errors
    ///
    /// Returns `ConfigError` when a numeric variable cannot be parsed.
    pub fn from_env() -> Result<Self, AssistantError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// # Errors
    ///
    /// Returns `ConfigError` when a numeric variable cannot be parsed.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, AssistantError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let temperature = match non_empty("READER_TEMPERATURE") {
            Some(raw) => raw.trim().parse::<f32>().map_err(|e| {
                AssistantError::ConfigError(format!("READER_TEMPERATURE: {e}"))
            })?,
            None => DEFAULT_TEMPERATURE,
        };

        let request_timeout = match non_empty("READER_REQUEST_TIMEOUT_SECS") {
            Some(raw) => {
                let secs = raw.trim().parse::<u64>().map_err(|e| {
                    AssistantError::ConfigError(format!("READER_REQUEST_TIMEOUT_SECS: {e}"))
                })?;
                (secs > 0).then(|| Duration::from_secs(secs))
            }
            None => None,
        };

        Ok(Self {
            model: non_empty("READER_MODEL"),
            temperature,
            default_language: non_empty("READER_DEFAULT_LANGUAGE")
                .unwrap_or_else(|| DEFAULT_LANGUAGE.to_string()),
            request_timeout,
            storage_path: non_empty("READER_STORAGE_PATH").map(PathBuf::from),
        })
    }

    /// The model to request for `config`, honouring the override.
    #[must_use]
    pub fn model_for(&self, config: &Config) -> String {
        self.model
            .clone()
            .unwrap_or_else(|| resolve_model(config.effective_base_url()).to_string())
    }
}
