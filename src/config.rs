use std::env;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::ConfigError;

/// Tagged per-provider LLM configuration. The API key is validated when the
/// config is built, so a missing key fails before any model call.
#[derive(Clone, Debug)]
pub enum LlmProvider {
    HuggingFace { model: String, api_key: String },
    Gemini { model: String, api_key: String },
}

impl LlmProvider {
    pub fn from_parts(
        provider: &str,
        model: Option<String>,
        api_key: Option<String>,
    ) -> Result<Self, ConfigError> {
        match provider {
            "huggingface" => {
                let api_key = require_key(api_key, "huggingface", "HF_API_KEY")?;
                Ok(LlmProvider::HuggingFace {
                    model: model
                        .unwrap_or_else(|| "mistralai/Mistral-7B-Instruct-v0.2".to_string()),
                    api_key,
                })
            }
            "gemini" => {
                let api_key = require_key(api_key, "gemini", "GEMINI_API_KEY")?;
                Ok(LlmProvider::Gemini {
                    model: model.unwrap_or_else(|| "gemini-1.5-flash".to_string()),
                    api_key,
                })
            }
            other => Err(ConfigError::UnknownProvider(other.to_string())),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            LlmProvider::HuggingFace { .. } => "huggingface",
            LlmProvider::Gemini { .. } => "gemini",
        }
    }

    pub fn model(&self) -> &str {
        match self {
            LlmProvider::HuggingFace { model, .. } => model,
            LlmProvider::Gemini { model, .. } => model,
        }
    }

    pub fn api_key(&self) -> &str {
        match self {
            LlmProvider::HuggingFace { api_key, .. } => api_key,
            LlmProvider::Gemini { api_key, .. } => api_key,
        }
    }

    fn default_embedding_model(&self) -> String {
        match self {
            LlmProvider::HuggingFace { .. } => "sentence-transformers/all-mpnet-base-v2".to_string(),
            LlmProvider::Gemini { .. } => "embedding-001".to_string(),
        }
    }
}

fn require_key(
    api_key: Option<String>,
    provider: &'static str,
    env_var: &'static str,
) -> Result<String, ConfigError> {
    match api_key {
        Some(key) if !key.trim().is_empty() => Ok(key),
        _ => Err(ConfigError::MissingApiKey { provider, env_var }),
    }
}

#[derive(Clone, Debug)]
pub struct GenerationConfig {
    pub temperature: f32,
    pub max_tokens: usize,
    pub top_p: f32,
    pub stream: bool,
}

#[derive(Clone, Debug)]
pub struct VectorStoreConfig {
    pub collection: String,
    /// Fixed storage directory; when absent each session gets its own
    /// temporary directory.
    pub dir: Option<PathBuf>,
    pub allow_reset: bool,
}

#[derive(Clone, Debug)]
pub struct EmbedderConfig {
    pub model: String,
}

#[derive(Clone, Debug)]
pub struct ChunkerConfig {
    pub chunk_size: usize,
    pub chunk_overlap: usize,
}

#[derive(Clone, Debug)]
pub struct CacheConfig {
    pub ttl: Duration,
    pub capacity: usize,
}

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub bind_addr: String,
    pub kb_base_url: String,
    pub llm: LlmProvider,
    pub generation: GenerationConfig,
    pub vector_store: VectorStoreConfig,
    pub embedder: EmbedderConfig,
    pub chunker: ChunkerConfig,
    pub cache: CacheConfig,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let provider_name =
            env::var("LLM_PROVIDER").unwrap_or_else(|_| "gemini".to_string());
        let api_key = match provider_name.as_str() {
            "huggingface" => env::var("HF_API_KEY").ok(),
            _ => env::var("GEMINI_API_KEY").ok(),
        };
        let llm = LlmProvider::from_parts(
            &provider_name,
            env::var("LLM_MODEL").ok(),
            api_key,
        )?;

        let embedder = EmbedderConfig {
            model: env::var("EMBEDDING_MODEL")
                .unwrap_or_else(|_| llm.default_embedding_model()),
        };

        Ok(Self {
            bind_addr: env::var("RAVEN_BIND").unwrap_or_else(|_| "127.0.0.1:8080".to_string()),
            kb_base_url: env::var("KNOWLEDGE_BASE_URL")
                .unwrap_or_else(|_| "http://127.0.0.1:8090".to_string()),
            llm,
            generation: GenerationConfig {
                temperature: parse_env("LLM_TEMPERATURE", 0.7)?,
                max_tokens: parse_env("LLM_MAX_TOKENS", 2_048)?,
                top_p: parse_env("LLM_TOP_P", 1.0)?,
                stream: parse_env("LLM_STREAM", true)?,
            },
            vector_store: VectorStoreConfig {
                collection: env::var("VECTOR_COLLECTION")
                    .unwrap_or_else(|_| "chat-pdf".to_string()),
                dir: env::var("VECTOR_STORE_DIR").map(PathBuf::from).ok(),
                allow_reset: parse_env("VECTOR_ALLOW_RESET", true)?,
            },
            embedder,
            chunker: ChunkerConfig {
                chunk_size: parse_env("CHUNK_SIZE", 2_000)?,
                chunk_overlap: parse_env("CHUNK_OVERLAP", 0)?,
            },
            cache: CacheConfig {
                ttl: Duration::from_secs(parse_env("RESPONSE_CACHE_TTL_SECS", 300u64)?),
                capacity: parse_env("RESPONSE_CACHE_CAPACITY", 100)?,
            },
        })
    }
}

fn parse_env<T: std::str::FromStr>(name: &'static str, default: T) -> Result<T, ConfigError> {
    match env::var(name) {
        Ok(raw) => raw
            .parse()
            .map_err(|_| ConfigError::InvalidValue { name, value: raw }),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_requires_api_key() {
        let err = LlmProvider::from_parts("gemini", None, None).unwrap_err();
        assert!(matches!(err, ConfigError::MissingApiKey { provider: "gemini", .. }));

        let err = LlmProvider::from_parts("huggingface", None, Some("  ".to_string())).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::MissingApiKey { provider: "huggingface", .. }
        ));
    }

    #[test]
    fn provider_defaults_model_per_kind() {
        let llm = LlmProvider::from_parts("gemini", None, Some("key".to_string())).unwrap();
        assert_eq!(llm.model(), "gemini-1.5-flash");
        assert_eq!(llm.name(), "gemini");

        let llm =
            LlmProvider::from_parts("huggingface", None, Some("key".to_string())).unwrap();
        assert_eq!(llm.model(), "mistralai/Mistral-7B-Instruct-v0.2");
    }

    #[test]
    fn unknown_provider_is_rejected() {
        let err = LlmProvider::from_parts("openai", None, Some("key".to_string())).unwrap_err();
        assert!(matches!(err, ConfigError::UnknownProvider(_)));
    }
}
