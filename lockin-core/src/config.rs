use config::{Config, Environment, File};
use serde::Deserialize;

use crate::error::LockinError;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct LockinConfig {
    #[serde(default)]
    pub service: ServiceConfig,
    #[serde(default)]
    pub openai: OpenAiConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub analysis: AnalysisConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub http: HttpConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ServiceConfig {
    pub log_level: String,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

/// Remote LLM endpoint settings. The API key is not part of the file config;
/// it comes from `OPENAI_API_KEY`.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct OpenAiConfig {
    pub base_url: String,
    pub vision_model: String,
    pub reasoning_model: String,
    /// Per-call deadline applied to every outbound request.
    pub timeout_seconds: u64,
    pub vision_max_tokens: u32,
    pub nudge_max_tokens: u32,
}

impl Default for OpenAiConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".to_string(),
            vision_model: "gpt-4o".to_string(),
            reasoning_model: "gpt-4o-mini".to_string(),
            timeout_seconds: 30,
            vision_max_tokens: 300,
            nudge_max_tokens: 150,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub base_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay_ms: 1000,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct AnalysisConfig {
    /// Window title the vision model is told to ignore.
    pub ignored_window: String,
    pub request_timeout_seconds: u64,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            ignored_window: "LockIn".to_string(),
            request_timeout_seconds: 120,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct StorageConfig {
    pub database_url: String,
    pub max_connections: u32,
    pub screenshot_dir: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite://screenshots.db?mode=rwc".to_string(),
            max_connections: 5,
            screenshot_dir: "screenshots".to_string(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct HttpConfig {
    pub host: String,
    pub port: u16,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8000,
        }
    }
}

impl LockinConfig {
    /// Load `path` (optional) and overlay `LOCKIN_<SECTION>__<KEY>` variables.
    pub fn load(path: &str) -> Result<Self, LockinError> {
        let s = Config::builder()
            .add_source(File::with_name(path).required(false))
            .add_source(
                Environment::with_prefix("LOCKIN")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;
        Ok(s.try_deserialize()?)
    }
}
