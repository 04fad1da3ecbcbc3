//! Application configuration

pub mod models;

use std::env;
use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub use models::{ModelEntry, ModelRegistry};

/// Seconds to wait for a complete model reply
const DEFAULT_TIMEOUT_SECS: u64 = 360;
const DEFAULT_MAX_CONTEXT_CHARS: usize = 16_000;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub host: String,
    pub port: u16,

    /// Model runtime backend ("ollama")
    pub provider: String,
    pub ollama_url: String,
    pub request_timeout: Duration,

    /// Directory holding the chat database
    pub data_dir: PathBuf,

    /// Optional TOML file extending the model registry
    pub models_file: Option<PathBuf>,

    /// Upper bound on document text merged into a prompt
    pub max_context_chars: usize,

    /// Refuse anything but a local model runtime
    pub offline: bool,

    /// Local embedding model used by an external retrieval pipeline
    pub embed_model_path: Option<PathBuf>,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build the configuration from an arbitrary variable source
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let port = match lookup("PORT") {
            Some(p) => p
                .parse()
                .map_err(|_| ConfigError::Validation(format!("PORT is not a port number: {p}")))?,
            None => 3000,
        };

        let request_timeout = match lookup("LAAMA_REQUEST_TIMEOUT_SECS") {
            Some(s) => s.parse().map_err(|_| {
                ConfigError::Validation(format!("LAAMA_REQUEST_TIMEOUT_SECS is not a number: {s}"))
            })?,
            None => DEFAULT_TIMEOUT_SECS,
        };

        let max_context_chars = match lookup("LAAMA_MAX_CONTEXT_CHARS") {
            Some(s) => s.parse().map_err(|_| {
                ConfigError::Validation(format!("LAAMA_MAX_CONTEXT_CHARS is not a number: {s}"))
            })?,
            None => DEFAULT_MAX_CONTEXT_CHARS,
        };

        let offline = ["LAAMA_OFFLINE", "HF_HUB_OFFLINE", "TRANSFORMERS_OFFLINE"]
            .iter()
            .any(|key| lookup(key).map(|v| is_truthy(&v)).unwrap_or(false));

        let config = Self {
            host: lookup("HOST").unwrap_or_else(|| "127.0.0.1".into()),
            port,
            provider: lookup("LAAMA_PROVIDER").unwrap_or_else(|| "ollama".into()),
            ollama_url: lookup("OLLAMA_URL").unwrap_or_else(|| "http://localhost:11434".into()),
            request_timeout: Duration::from_secs(request_timeout),
            data_dir: lookup("LAAMA_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./data")),
            models_file: lookup("LAAMA_MODELS_FILE").map(PathBuf::from),
            max_context_chars,
            offline,
            embed_model_path: lookup("LAAMA_EMBED_MODEL_PATH").map(PathBuf::from),
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.request_timeout.is_zero() {
            return Err(ConfigError::Validation(
                "LAAMA_REQUEST_TIMEOUT_SECS must be greater than zero".into(),
            ));
        }

        if self.max_context_chars == 0 {
            return Err(ConfigError::Validation(
                "LAAMA_MAX_CONTEXT_CHARS must be greater than zero".into(),
            ));
        }

        if self.offline && !is_loopback_url(&self.ollama_url) {
            return Err(ConfigError::Validation(format!(
                "offline mode requires a local model runtime, got {}",
                self.ollama_url
            )));
        }

        Ok(())
    }

    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("chats.db")
    }

    /// Load the model registry: the configured file, or the built-in table
    pub fn model_registry(&self) -> Result<ModelRegistry, ConfigError> {
        match &self.models_file {
            Some(path) => ModelRegistry::from_file(path),
            None => Ok(ModelRegistry::builtin()),
        }
    }
}

fn is_truthy(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

fn is_loopback_url(url: &str) -> bool {
    let Ok(url) = reqwest::Url::parse(url) else {
        return false;
    };
    match url.host_str() {
        Some("localhost") => true,
        Some(host) => host
            .trim_start_matches('[')
            .trim_end_matches(']')
            .parse::<IpAddr>()
            .map(|ip| ip.is_loopback())
            .unwrap_or(false),
        None => false,
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Validation error: {0}")]
    Validation(String),
}
