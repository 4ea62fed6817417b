use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::engine::{ChatEngine, TokenSink};
use crate::error::EngineError;
use crate::models::ChatResult;

/// Output of one streamed chat invocation. `streamed` is the concatenation
/// of every token delta in arrival order; `result.answer` is whatever the
/// engine returned when it finished. Both are kept because providers do not
/// guarantee the streamed deltas and the final answer are identical.
#[derive(Debug, Clone)]
pub struct StreamOutcome {
    pub streamed: String,
    pub result: ChatResult,
}

/// Runs one chat invocation on a background worker while the caller consumes
/// the live token stream.
///
/// Exactly one worker task is spawned per call. It owns the only sender for
/// the token channel, so the channel closes as soon as the worker returns —
/// success, error, or zero tokens — and the drain loop below can never hang
/// waiting for a terminal delta that will not come. After the channel
/// closes the worker is joined before its result is read; the channel
/// closing only proves the sender was dropped, not that the return value is
/// ready.
///
/// `on_progress` is invoked with the full accumulated text after every
/// token, matching a replace-in-place render surface.
pub async fn stream_chat<E, F>(
    engine: Arc<E>,
    prompt: &str,
    cancel: CancellationToken,
    mut on_progress: F,
) -> Result<StreamOutcome, EngineError>
where
    E: ChatEngine + ?Sized + 'static,
    F: FnMut(&str),
{
    let (tx, mut rx) = mpsc::unbounded_channel();
    let sink = TokenSink::new(tx, cancel.clone());

    let worker = {
        let engine = Arc::clone(&engine);
        let prompt = prompt.to_string();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if cancel.is_cancelled() {
                return Err(EngineError::Cancelled);
            }
            engine.chat(&prompt, sink).await
        })
    };

    let mut streamed = String::new();
    loop {
        tokio::select! {
            delta = rx.recv() => match delta {
                Some(token) => {
                    streamed.push_str(&token);
                    on_progress(&streamed);
                }
                None => break,
            },
            _ = cancel.cancelled() => {
                worker.abort();
                let _ = worker.await;
                return Err(EngineError::Cancelled);
            }
        }
    }

    let result = worker
        .await
        .map_err(|join_err| EngineError::Worker(join_err.to_string()))??;

    Ok(StreamOutcome { streamed, result })
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;

    use super::*;

    struct ScriptedEngine {
        tokens: Vec<&'static str>,
        answer: &'static str,
        delay_before_result: Option<Duration>,
        fail_after_tokens: bool,
    }

    impl ScriptedEngine {
        fn new(tokens: Vec<&'static str>, answer: &'static str) -> Self {
            Self {
                tokens,
                answer,
                delay_before_result: None,
                fail_after_tokens: false,
            }
        }
    }

    #[async_trait]
    impl ChatEngine for ScriptedEngine {
        async fn chat(&self, _prompt: &str, sink: TokenSink) -> Result<ChatResult, EngineError> {
            for token in &self.tokens {
                sink.send(*token)?;
                tokio::task::yield_now().await;
            }
            if self.fail_after_tokens {
                return Err(EngineError::Provider("scripted failure".to_string()));
            }
            if let Some(delay) = self.delay_before_result {
                tokio::time::sleep(delay).await;
            }
            Ok(ChatResult {
                answer: self.answer.to_string(),
                citations: vec![],
            })
        }
    }

    #[tokio::test]
    async fn tokens_accumulate_in_fifo_order() {
        let engine = Arc::new(ScriptedEngine::new(vec!["Hel", "lo", " world"], "Hello world"));
        let mut snapshots = Vec::new();

        let outcome = stream_chat(
            engine,
            "greet",
            CancellationToken::new(),
            |partial: &str| snapshots.push(partial.to_string()),
        )
        .await
        .unwrap();

        assert_eq!(snapshots, vec!["Hel", "Hello", "Hello world"]);
        assert_eq!(outcome.streamed, "Hello world");
        assert_eq!(outcome.result.answer, "Hello world");
    }

    #[tokio::test]
    async fn result_is_read_only_after_worker_joins() {
        // The worker sleeps after its last token; a bridge that read the
        // result as soon as the channel drained would miss the answer.
        let mut engine = ScriptedEngine::new(vec!["partial"], "final answer");
        engine.delay_before_result = Some(Duration::from_millis(50));

        let outcome = stream_chat(
            Arc::new(engine),
            "slow finish",
            CancellationToken::new(),
            |_: &str| {},
        )
        .await
        .unwrap();

        assert_eq!(outcome.streamed, "partial");
        assert_eq!(outcome.result.answer, "final answer");
    }

    #[tokio::test]
    async fn zero_tokens_still_terminates() {
        let engine = Arc::new(ScriptedEngine::new(vec![], "quiet answer"));

        let outcome = tokio::time::timeout(
            Duration::from_secs(1),
            stream_chat(engine, "quiet", CancellationToken::new(), |_: &str| {}),
        )
        .await
        .expect("bridge must terminate without any tokens")
        .unwrap();

        assert_eq!(outcome.streamed, "");
        assert_eq!(outcome.result.answer, "quiet answer");
    }

    #[tokio::test]
    async fn failing_worker_surfaces_error_without_deadlock() {
        let mut engine = ScriptedEngine::new(vec!["tok"], "never returned");
        engine.fail_after_tokens = true;

        let err = tokio::time::timeout(
            Duration::from_secs(1),
            stream_chat(Arc::new(engine), "boom", CancellationToken::new(), |_: &str| {}),
        )
        .await
        .expect("bridge must terminate when the worker fails")
        .unwrap_err();

        assert!(matches!(err, EngineError::Provider(_)));
    }

    #[tokio::test]
    async fn cancelled_invocation_returns_cancelled() {
        let cancel = CancellationToken::new();
        cancel.cancel();

        let engine = Arc::new(ScriptedEngine::new(vec!["tok"], "answer"));
        let err = stream_chat(engine, "cancelled", cancel, |_: &str| {})
            .await
            .unwrap_err();

        assert!(matches!(err, EngineError::Cancelled));
    }
}
