use std::collections::HashSet;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::bridge::{self, StreamOutcome};
use crate::cache::SharedCache;
use crate::engine::KnowledgeApp;
use crate::models::{ConversationTurn, IngestKind};
use crate::sources;

const WELCOME_MESSAGE: &str = "Hey there! I'm Raven. Drop your PDFs, links, or YouTube videos \
here and ask me anything about them. Even without a link, we can still chat!";

/// Owns one conversation: the ordered transcript, the knowledge-base app
/// handle, the set of already-ingested file names, and a handle to the
/// process-wide response cache.
///
/// All mutation goes through `&mut self`, so chat invocations are never
/// pipelined within a session; callers that share a controller across tasks
/// wrap it in a `tokio::Mutex`.
pub struct SessionController {
    app: Arc<dyn KnowledgeApp>,
    cache: SharedCache,
    turns: Vec<ConversationTurn>,
    ingested_files: HashSet<String>,
    cancel: CancellationToken,
}

impl SessionController {
    pub fn new(app: Arc<dyn KnowledgeApp>, cache: SharedCache) -> Self {
        Self {
            app,
            cache,
            turns: vec![ConversationTurn::assistant(WELCOME_MESSAGE)],
            ingested_files: HashSet::new(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn turns(&self) -> &[ConversationTurn] {
        &self.turns
    }

    /// Appends the user turn, answers from cache when the prompt was seen
    /// recently, and otherwise streams a fresh answer through the bridge.
    /// Returns the text of the assistant turn that was appended; failures
    /// become a visible error turn rather than terminating the session.
    pub async fn submit<F>(&mut self, prompt: &str, mut on_progress: F) -> String
    where
        F: FnMut(&str),
    {
        self.turns.push(ConversationTurn::user(prompt));

        let cached = match self.cache.lock() {
            Ok(cache) => cache.lookup(prompt),
            Err(_) => None,
        };
        if let Some(answer) = cached {
            on_progress(&answer);
            self.turns.push(ConversationTurn::assistant(&answer));
            return answer;
        }

        let invocation = self.cancel.child_token();
        match bridge::stream_chat(Arc::clone(&self.app), prompt, invocation, &mut on_progress)
            .await
        {
            Ok(StreamOutcome { streamed, result }) => {
                // A non-streaming provider yields zero deltas; fall back to
                // the final answer so the turn is still rendered.
                let mut full = if streamed.is_empty() {
                    result.answer.clone()
                } else {
                    streamed
                };
                full.push_str(&sources::format_sources(&result.citations));
                on_progress(&full);

                self.turns.push(ConversationTurn::assistant(&full));
                // The cached text includes the source list, so a cache hit
                // replays exactly what was rendered the first time.
                if let Ok(mut cache) = self.cache.lock() {
                    cache.insert(prompt, &full);
                }
                full
            }
            Err(err) => {
                tracing::error!("chat invocation failed: {err}");
                let message = format!("Error answering that: {err}");
                on_progress(&message);
                self.turns.push(ConversationTurn::assistant(&message));
                message
            }
        }
    }

    /// Clears the transcript. The response cache, the ingested-file set, and
    /// the knowledge base itself are untouched. Any in-flight invocation is
    /// cancelled.
    pub fn reset(&mut self) {
        self.cancel.cancel();
        self.cancel = CancellationToken::new();
        self.turns.clear();
    }

    /// Adds a source to the knowledge base and reports the outcome. An
    /// already-ingested PDF file name is a no-op: no external call, no new
    /// transcript turn. Failures are returned to the caller without marking
    /// the item added, so it can be retried.
    pub async fn ingest(&mut self, source: &str, display_name: &str, kind: IngestKind) -> String {
        if kind == IngestKind::PdfFile && self.ingested_files.contains(display_name) {
            return format!("{display_name} is already in the knowledge base.");
        }

        match self.app.add(source, kind).await {
            Ok(()) => {
                let message = match kind {
                    IngestKind::Youtube => {
                        format!("Added YouTube link {display_name} to knowledge base!")
                    }
                    _ => format!("Added {display_name} to knowledge base!"),
                };
                if kind == IngestKind::PdfFile {
                    self.ingested_files.insert(display_name.to_string());
                }
                self.turns.push(ConversationTurn::assistant(&message));
                message
            }
            Err(err) => {
                tracing::warn!("ingestion failed for {display_name}: {err}");
                match kind {
                    IngestKind::Youtube => {
                        format!("Error adding YouTube link {display_name} to knowledge base: {err}")
                    }
                    _ => format!("Error adding {display_name} to knowledge base: {err}"),
                }
            }
        }
    }
}
