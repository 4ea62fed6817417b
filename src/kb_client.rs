use std::path::Path;

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};

use crate::config::AppConfig;
use crate::engine::{ChatEngine, KnowledgeBase, TokenSink};
use crate::error::{EngineError, IngestionError};
use crate::models::{ChatResult, Citation, IngestKind};

/// Client for one app instance on the knowledge-base service. Each session
/// registers its own app so ingested sources stay scoped to that session.
#[derive(Clone)]
pub struct KnowledgeBaseClient {
    client: Client,
    base_url: String,
    app_id: String,
}

impl KnowledgeBaseClient {
    /// Registers a new app configured with the session's LLM, vector-store,
    /// embedder, and chunker settings.
    pub async fn create(base_url: &str, config: &AppConfig, storage_dir: &Path) -> Result<Self> {
        #[derive(Serialize)]
        struct ProviderSection<'a, T: Serialize> {
            provider: &'a str,
            config: T,
        }

        #[derive(Serialize)]
        struct LlmSettings<'a> {
            model: &'a str,
            temperature: f32,
            max_tokens: usize,
            top_p: f32,
            stream: bool,
            api_key: &'a str,
        }

        #[derive(Serialize)]
        struct VectordbSettings<'a> {
            collection_name: &'a str,
            dir: String,
            allow_reset: bool,
        }

        #[derive(Serialize)]
        struct EmbedderSettings<'a> {
            model: &'a str,
            api_key: &'a str,
        }

        #[derive(Serialize)]
        struct ChunkerSettings {
            chunk_size: usize,
            chunk_overlap: usize,
        }

        #[derive(Serialize)]
        struct CreateAppReq<'a> {
            llm: ProviderSection<'a, LlmSettings<'a>>,
            vectordb: ProviderSection<'a, VectordbSettings<'a>>,
            embedder: ProviderSection<'a, EmbedderSettings<'a>>,
            chunker: ChunkerSettings,
        }

        #[derive(Deserialize)]
        struct CreateAppResp {
            app_id: String,
        }

        let payload = CreateAppReq {
            llm: ProviderSection {
                provider: config.llm.name(),
                config: LlmSettings {
                    model: config.llm.model(),
                    temperature: config.generation.temperature,
                    max_tokens: config.generation.max_tokens,
                    top_p: config.generation.top_p,
                    stream: config.generation.stream,
                    api_key: config.llm.api_key(),
                },
            },
            vectordb: ProviderSection {
                provider: "chroma",
                config: VectordbSettings {
                    collection_name: &config.vector_store.collection,
                    dir: storage_dir.display().to_string(),
                    allow_reset: config.vector_store.allow_reset,
                },
            },
            embedder: ProviderSection {
                provider: config.llm.name(),
                config: EmbedderSettings {
                    model: &config.embedder.model,
                    api_key: config.llm.api_key(),
                },
            },
            chunker: ChunkerSettings {
                chunk_size: config.chunker.chunk_size,
                chunk_overlap: config.chunker.chunk_overlap,
            },
        };

        let client = Client::new();
        let url = format!("{base_url}/apps");
        let response = client
            .post(url)
            .json(&payload)
            .send()
            .await
            .context("failed to contact knowledge-base service while creating app")?;

        if response.status() != StatusCode::OK {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!(
                "knowledge-base service refused app creation ({status}): {}",
                normalize_err_body(&body)
            );
        }

        let created = response
            .json::<CreateAppResp>()
            .await
            .context("failed to decode app creation response")?;

        Ok(Self {
            client,
            base_url: base_url.to_string(),
            app_id: created.app_id,
        })
    }
}

#[async_trait]
impl KnowledgeBase for KnowledgeBaseClient {
    async fn add(&self, source: &str, kind: IngestKind) -> Result<(), IngestionError> {
        #[derive(Serialize)]
        struct AddReq<'a> {
            source: &'a str,
            data_type: &'a str,
        }

        let url = format!("{}/apps/{}/add", self.base_url, self.app_id);
        let response = self
            .client
            .post(url)
            .json(&AddReq {
                source,
                data_type: kind.as_str(),
            })
            .send()
            .await?;

        if response.status() != StatusCode::OK {
            let body = response.text().await.unwrap_or_default();
            return Err(IngestionError::Rejected {
                item: source.to_string(),
                reason: normalize_err_body(&body),
            });
        }

        Ok(())
    }
}

#[async_trait]
impl ChatEngine for KnowledgeBaseClient {
    /// Streams one chat invocation. Token lines are forwarded into `sink`
    /// while the request body is still arriving; the final line carries the
    /// answer and its citations.
    async fn chat(&self, prompt: &str, sink: TokenSink) -> Result<ChatResult, EngineError> {
        #[derive(Serialize)]
        struct ChatReq<'a> {
            prompt: &'a str,
            citations: bool,
            stream: bool,
        }

        let url = format!("{}/apps/{}/chat", self.base_url, self.app_id);
        let response = self
            .client
            .post(url)
            .json(&ChatReq {
                prompt,
                citations: true,
                stream: true,
            })
            .send()
            .await?;

        if response.status() != StatusCode::OK {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(EngineError::Provider(format!(
                "chat endpoint returned {status}: {}",
                normalize_err_body(&body)
            )));
        }

        let mut body = response.bytes_stream();
        let mut buffer = String::new();
        let mut result = None;

        while let Some(piece) = body.next().await {
            let piece = piece?;
            buffer.push_str(&String::from_utf8_lossy(&piece));

            while let Some(newline) = buffer.find('\n') {
                let line = buffer[..newline].trim().to_string();
                buffer.drain(..=newline);
                if !line.is_empty() {
                    consume_stream_line(&line, &sink, &mut result)?;
                }
            }
        }

        let trailing = buffer.trim().to_string();
        if !trailing.is_empty() {
            consume_stream_line(&trailing, &sink, &mut result)?;
        }

        result.ok_or_else(|| {
            EngineError::Provider("stream ended without a final answer".to_string())
        })
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum StreamLine {
    Token {
        token: String,
    },
    Final {
        answer: String,
        #[serde(default)]
        citations: Vec<CitationLine>,
    },
}

#[derive(Deserialize)]
struct CitationLine {
    #[serde(default)]
    context: String,
    metadata: crate::models::CitationMetadata,
}

fn consume_stream_line(
    line: &str,
    sink: &TokenSink,
    result: &mut Option<ChatResult>,
) -> Result<(), EngineError> {
    match serde_json::from_str::<StreamLine>(line)? {
        StreamLine::Token { token } => sink.send(token),
        StreamLine::Final { answer, citations } => {
            *result = Some(ChatResult {
                answer,
                citations: citations
                    .into_iter()
                    .map(|line| Citation {
                        snippet: line.context,
                        metadata: line.metadata,
                    })
                    .collect(),
            });
            Ok(())
        }
    }
}

fn normalize_err_body(body: &str) -> String {
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return "<empty body>".to_string();
    }

    if let Ok(json) = serde_json::from_str::<serde_json::Value>(trimmed) {
        if let Some(err) = json.get("error").and_then(|v| v.as_str()) {
            return err.to_string();
        }
    }

    trimmed.to_string()
}

#[cfg(test)]
mod tests {
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;

    use super::*;

    #[test]
    fn stream_lines_decode_tokens_and_final_answer() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sink = TokenSink::new(tx, CancellationToken::new());
        let mut result = None;

        consume_stream_line(r#"{"token": "Hel"}"#, &sink, &mut result).unwrap();
        consume_stream_line(r#"{"token": "lo"}"#, &sink, &mut result).unwrap();
        consume_stream_line(
            r#"{"answer": "Hello", "citations": [{"context": "frag", "metadata": {"url": "docs/a.chunk1.pdf"}}]}"#,
            &sink,
            &mut result,
        )
        .unwrap();

        assert_eq!(rx.try_recv().unwrap(), "Hel");
        assert_eq!(rx.try_recv().unwrap(), "lo");

        let result = result.expect("final line populates the result");
        assert_eq!(result.answer, "Hello");
        assert_eq!(result.citations.len(), 1);
        assert_eq!(result.citations[0].metadata.url, "docs/a.chunk1.pdf");
    }

    #[test]
    fn malformed_stream_line_is_a_decode_error() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let sink = TokenSink::new(tx, CancellationToken::new());
        let mut result = None;

        let err = consume_stream_line("not json", &sink, &mut result).unwrap_err();
        assert!(matches!(err, EngineError::Decode(_)));
    }

    #[test]
    fn error_bodies_are_normalized() {
        assert_eq!(normalize_err_body(""), "<empty body>");
        assert_eq!(normalize_err_body(r#"{"error": "rate limited"}"#), "rate limited");
        assert_eq!(normalize_err_body("plain failure"), "plain failure");
    }
}
