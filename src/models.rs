use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
}

/// One entry in a session transcript. Append-only while the session lives;
/// cleared wholesale on reset.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub role: Role,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

impl ConversationTurn {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
            created_at: Utc::now(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum IngestKind {
    PdfFile,
    Link,
    Youtube,
}

impl IngestKind {
    pub fn as_str(self) -> &'static str {
        match self {
            IngestKind::PdfFile => "pdf_file",
            IngestKind::Link => "link",
            IngestKind::Youtube => "youtube",
        }
    }
}

/// Source pointer attached to a generated answer. Several citations may
/// reference different chunks of the same document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Citation {
    pub snippet: String,
    pub metadata: CitationMetadata,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CitationMetadata {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<f32>,
}

/// Final structured result of one chat invocation, written once by the
/// background worker and read by the foreground after it has joined.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChatResult {
    pub answer: String,
    pub citations: Vec<Citation>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRequest {
    pub session_id: String,
    pub prompt: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatResponse {
    pub reply: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddSourceRequest {
    pub session_id: String,
    pub source: String,
    pub kind: IngestKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddSourceResponse {
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRequest {
    pub session_id: Option<String>,
    pub reset: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionResponse {
    pub session_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryResponse {
    pub turns: Vec<ConversationTurn>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadResponse {
    pub messages: Vec<String>,
}
