use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::{EngineError, IngestionError};
use crate::models::{ChatResult, IngestKind};

/// Streaming sink handed to a chat engine. Token deltas pushed here are
/// relayed to the foreground in FIFO order while the call is still running.
#[derive(Clone)]
pub struct TokenSink {
    tx: mpsc::UnboundedSender<String>,
    cancel: CancellationToken,
}

impl TokenSink {
    pub(crate) fn new(tx: mpsc::UnboundedSender<String>, cancel: CancellationToken) -> Self {
        Self { tx, cancel }
    }

    /// Push one token delta. Fails once the invocation is cancelled or the
    /// consumer is gone; engines should stop generating at that point.
    pub fn send(&self, token: impl Into<String>) -> Result<(), EngineError> {
        if self.cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }
        self.tx
            .send(token.into())
            .map_err(|_| EngineError::Cancelled)
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// The blocking-style "ask the model" capability. Implementations stream
/// token deltas into `sink` as a side effect and return the final answer
/// plus citations when generation completes.
#[async_trait]
pub trait ChatEngine: Send + Sync {
    async fn chat(&self, prompt: &str, sink: TokenSink) -> Result<ChatResult, EngineError>;
}

/// Ingestion side of the external knowledge base.
#[async_trait]
pub trait KnowledgeBase: Send + Sync {
    async fn add(&self, source: &str, kind: IngestKind) -> Result<(), IngestionError>;
}

/// A session's handle to the external app: both halves behind one object.
pub trait KnowledgeApp: ChatEngine + KnowledgeBase {}

impl<T: ChatEngine + KnowledgeBase> KnowledgeApp for T {}
