use thiserror::Error;

/// Raised while building [`crate::config::AppConfig`], before any model or
/// embedding call can happen.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing API key for the {provider} provider; set {env_var}")]
    MissingApiKey {
        provider: &'static str,
        env_var: &'static str,
    },

    #[error("unknown LLM provider: {0} (expected \"huggingface\" or \"gemini\")")]
    UnknownProvider(String),

    #[error("invalid value for {name}: {value}")]
    InvalidValue { name: &'static str, value: String },
}

/// Adding a PDF/link/YouTube item to the knowledge base failed. Callers turn
/// this into a user-visible message; the item stays un-added so it can be
/// retried.
#[derive(Debug, Error)]
pub enum IngestionError {
    #[error("knowledge base rejected {item}: {reason}")]
    Rejected { item: String, reason: String },

    #[error("failed to reach knowledge base: {0}")]
    Transport(#[from] reqwest::Error),
}

/// A chat invocation failed. Must be observable by the foreground despite the
/// background-worker boundary.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("model invocation failed: {0}")]
    Provider(String),

    #[error("failed to reach model provider: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("malformed stream payload: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("chat worker terminated abnormally: {0}")]
    Worker(String),

    #[error("chat invocation cancelled")]
    Cancelled,
}
