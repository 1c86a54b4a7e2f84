pub mod config;
pub mod db;
pub mod error;
pub mod llm;
pub mod models;
pub mod pipeline;
pub mod retry;

pub use config::LockinConfig;
pub use error::LockinError;
pub use llm::{LanguageModel, LlmError, OpenAiClient, OpenAiClientConfig};
pub use models::{AnalysisRequest, AnalysisResponse, RecentActivity};
pub use pipeline::{AnalysisPipeline, PipelineError, DESCRIPTION_FALLBACK};
pub use retry::{
    backoff_delay, classify, BackoffKind, CallOutcome, CallTimedOut, Classify, FailureKind,
    ResilientExecutor, RetryPolicy,
};
