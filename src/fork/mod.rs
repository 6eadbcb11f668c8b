//! Session forking via summarization
//!
//! When a session approaches its context limit, the fork engine carries
//! the conversation into a fresh session: older messages are condensed
//! into a single summary message, the most recent messages are kept
//! verbatim, and the original session is sealed read-only with full
//! lineage back to it.
//!
//! Forking is strictly copy-then-seal: the new session is created first
//! and the original is only marked `forked` after the copy is durable, so
//! a failure at any point leaves the original untouched and usable.
//! At most one fork per session runs at a time; a second fork request for
//! an already-forked session replays the retained result of the first
//! rather than failing.

use crate::budget::{BudgetTracker, TokenEstimator};
use crate::config::ForkConfig;
use crate::error::{FlowError, Result};
use crate::session::{Message, Role, Session, SessionState, SessionStore, TokenUsage};
use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

/// Framing prefix for the summary message placed at the head of a forked
/// session, so both models and humans can tell condensed history from
/// verbatim messages.
const SUMMARY_PREFIX: &str = "[Conversation Summary]";

/// Condenses a message sequence into a short prose summary.
///
/// Usually backed by a model call through the dispatch layer; tests use
/// deterministic implementations.
#[async_trait]
pub trait Summarizer: Send + Sync {
    async fn summarize(&self, messages: &[Message]) -> Result<String>;
}

/// Non-destructive description of what a fork would do.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForkPreview {
    pub session_id: String,
    /// Messages currently in the session
    pub total_messages: usize,
    /// How many head messages would be condensed into the summary
    pub summarize_count: usize,
    /// How many tail messages would be kept verbatim
    pub keep_count: usize,
    /// Estimated tokens across the whole message history
    pub current_tokens: u64,
    /// Estimated tokens across the kept tail
    pub kept_tokens: u64,
    /// Estimated tokens dropped by condensing the head (before the
    /// summary itself is accounted for)
    pub estimated_reduction: u64,
    /// False when the session is short enough that forking would be a
    /// no-op
    pub fork_needed: bool,
}

/// A suggested follow-up action presented to the user after a fork.
///
/// Opaque to this core: selecting one is an external collaborator's
/// concern.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NextStep {
    /// Stable machine-readable action token
    pub action: String,
    /// Short human-readable title
    pub title: String,
    /// Longer human-readable description
    pub description: String,
}

impl NextStep {
    fn new(action: &str, title: &str, description: &str) -> Self {
        Self {
            action: action.to_string(),
            title: title.to_string(),
            description: description.to_string(),
        }
    }
}

/// The record of a completed fork.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForkResult {
    pub source_session_id: String,
    pub new_session_id: String,
    /// The generated summary text (without framing)
    pub summary: String,
    pub summarized_count: usize,
    pub kept_count: usize,
    /// Estimated context tokens before the fork
    pub tokens_before: u64,
    /// Recomputed context tokens in the new session
    pub tokens_after: u64,
    /// Follow-up menu for the caller to present
    pub next_steps: Vec<NextStep>,
}

/// Outcome of a fork request.
#[derive(Debug, Clone)]
pub enum ForkOutcome {
    /// A new session was created (or an earlier result replayed)
    Forked(ForkResult),
    /// The session is short enough that forking would discard nothing
    NotNeeded {
        message_count: usize,
        keep_last_n: usize,
    },
}

/// Orchestrates session forks.
pub struct ForkEngine {
    store: Arc<dyn SessionStore>,
    summarizer: Arc<dyn Summarizer>,
    estimator: Arc<dyn TokenEstimator>,
    budget: Arc<BudgetTracker>,
    config: ForkConfig,
    /// Sessions with a fork currently running
    in_progress: DashMap<String, ()>,
    /// Completed forks, keyed by source session, for replay
    results: DashMap<String, ForkResult>,
}

impl ForkEngine {
    pub fn new(
        store: Arc<dyn SessionStore>,
        summarizer: Arc<dyn Summarizer>,
        estimator: Arc<dyn TokenEstimator>,
        budget: Arc<BudgetTracker>,
        config: ForkConfig,
    ) -> Self {
        Self {
            store,
            summarizer,
            estimator,
            budget,
            config,
            in_progress: DashMap::new(),
            results: DashMap::new(),
        }
    }

    /// Describe what a fork would do, without performing it.
    pub async fn preview(
        &self,
        session_id: &str,
        keep_last_n: Option<usize>,
    ) -> Result<ForkPreview> {
        let session = self.store.require(session_id).await?;
        let keep = keep_last_n.unwrap_or(self.config.keep_last_n);
        let total = session.messages.len();
        let summarize_count = total.saturating_sub(keep);

        let current_tokens = self.estimator.estimate_messages(&session.messages);
        let kept_tokens = self.estimator.estimate_messages(session.tail(keep));

        Ok(ForkPreview {
            session_id: session_id.to_string(),
            total_messages: total,
            summarize_count,
            keep_count: total.min(keep),
            current_tokens,
            kept_tokens,
            estimated_reduction: current_tokens - kept_tokens,
            fork_needed: summarize_count > 0,
        })
    }

    /// Fork a session: condense the head, keep the tail, seal the source.
    ///
    /// Returns [`ForkOutcome::NotNeeded`] when the session holds no more
    /// messages than would be kept. A request against an already-forked
    /// session replays the retained [`ForkResult`]. A concurrent fork of
    /// the same session fails with [`FlowError::ForkInProgress`].
    pub async fn fork(&self, session_id: &str, keep_last_n: Option<usize>) -> Result<ForkOutcome> {
        let session = self.store.require(session_id).await?;
        match session.state {
            SessionState::Active => {}
            SessionState::Forked => {
                return self
                    .results
                    .get(session_id)
                    .map(|r| ForkOutcome::Forked(r.clone()))
                    .ok_or_else(|| {
                        FlowError::Session(format!(
                            "session '{}' was forked outside this process",
                            session_id
                        ))
                    });
            }
            SessionState::Closed => {
                return Err(FlowError::Session(format!(
                    "session '{}' is closed",
                    session_id
                )));
            }
        }

        let keep = keep_last_n.unwrap_or(self.config.keep_last_n);
        if session.messages.len() <= keep {
            return Ok(ForkOutcome::NotNeeded {
                message_count: session.messages.len(),
                keep_last_n: keep,
            });
        }

        let _guard = self.begin(session_id)?;

        let split = session.messages.len() - keep;
        let (head, tail) = session.messages.split_at(split);

        // Summarize first: a summarizer failure must leave the source
        // session untouched.
        let summary = self
            .summarizer
            .summarize(head)
            .await
            .map_err(|e| FlowError::SummarizationFailed(e.to_string()))?;

        let summary_body = format!("{}\n\n{}", SUMMARY_PREFIX, summary);
        let summary_tokens = self.estimator.estimate(&summary_body);

        let mut forked = Session::with_id(&Uuid::new_v4().to_string());
        forked.forked_from = Some(session_id.to_string());
        forked.append(Message::system(&summary_body).with_tokens(summary_tokens));
        for message in tail {
            forked.append(message.clone());
        }
        let usage_after = self.recompute_usage(&forked.messages);
        forked.usage = usage_after;

        let tokens_before = self.estimator.estimate_messages(&session.messages);
        let result = ForkResult {
            source_session_id: session_id.to_string(),
            new_session_id: forked.id.clone(),
            summary,
            summarized_count: head.len(),
            kept_count: tail.len(),
            tokens_before,
            tokens_after: usage_after.total_tokens,
            next_steps: Self::next_steps(),
        };

        // Copy first, then seal; the source only becomes read-only once
        // the continuation exists.
        self.store.create(forked).await?;
        self.store
            .set_state(session_id, SessionState::Forked)
            .await?;
        self.budget.seed(&result.new_session_id, usage_after);
        self.results.insert(session_id.to_string(), result.clone());

        tracing::info!(
            source = session_id,
            new_session = %result.new_session_id,
            summarized = result.summarized_count,
            kept = result.kept_count,
            tokens_before = result.tokens_before,
            tokens_after = result.tokens_after,
            "session forked"
        );

        Ok(ForkOutcome::Forked(result))
    }

    /// The retained result of a completed fork, if this process performed
    /// one for the session.
    pub fn result_for(&self, session_id: &str) -> Option<ForkResult> {
        self.results.get(session_id).map(|r| r.clone())
    }

    fn begin(&self, session_id: &str) -> Result<ForkGuard<'_>> {
        use dashmap::mapref::entry::Entry;
        match self.in_progress.entry(session_id.to_string()) {
            Entry::Occupied(_) => Err(FlowError::ForkInProgress(session_id.to_string())),
            Entry::Vacant(slot) => {
                slot.insert(());
                Ok(ForkGuard {
                    engine: self,
                    session_id: session_id.to_string(),
                })
            }
        }
    }

    /// Recompute usage from the message history: user/system content
    /// counts as input, assistant content as output.
    fn recompute_usage(&self, messages: &[Message]) -> TokenUsage {
        let mut input = 0u64;
        let mut output = 0u64;
        for message in messages {
            let tokens = message
                .tokens
                .unwrap_or_else(|| self.estimator.estimate(&message.content));
            match message.role {
                Role::Assistant => output += tokens,
                Role::User | Role::System => input += tokens,
            }
        }
        TokenUsage::new(input, output)
    }

    fn next_steps() -> Vec<NextStep> {
        vec![
            NextStep::new(
                "continue_implementation",
                "Continue implementation",
                "Pick up where the conversation left off in the new session",
            ),
            NextStep::new(
                "run_tests",
                "Run tests",
                "Validate the current state of the work before continuing",
            ),
            NextStep::new(
                "review_for_issues",
                "Review for issues",
                "Look over the recent changes for problems",
            ),
        ]
    }
}

/// Clears the in-progress mark when a fork finishes, on every path.
struct ForkGuard<'a> {
    engine: &'a ForkEngine,
    session_id: String,
}

impl Drop for ForkGuard<'_> {
    fn drop(&mut self) {
        self.engine.in_progress.remove(&self.session_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::budget::WordCountEstimator;
    use crate::config::BudgetConfig;
    use crate::session::MemoryStore;
    use std::time::Duration;

    /// Summarizes by counting, deterministically.
    struct CountingSummarizer;

    #[async_trait]
    impl Summarizer for CountingSummarizer {
        async fn summarize(&self, messages: &[Message]) -> Result<String> {
            Ok(format!("Discussed {} earlier messages.", messages.len()))
        }
    }

    struct FailingSummarizer;

    #[async_trait]
    impl Summarizer for FailingSummarizer {
        async fn summarize(&self, _messages: &[Message]) -> Result<String> {
            Err(FlowError::Provider("model unavailable".to_string()))
        }
    }

    /// Takes long enough that a second fork attempt overlaps.
    struct SlowSummarizer;

    #[async_trait]
    impl Summarizer for SlowSummarizer {
        async fn summarize(&self, messages: &[Message]) -> Result<String> {
            tokio::time::sleep(Duration::from_millis(100)).await;
            Ok(format!("Discussed {} earlier messages.", messages.len()))
        }
    }

    fn engine(store: MemoryStore, summarizer: Arc<dyn Summarizer>) -> ForkEngine {
        ForkEngine::new(
            Arc::new(store),
            summarizer,
            Arc::new(WordCountEstimator),
            Arc::new(BudgetTracker::new(BudgetConfig::default())),
            ForkConfig { keep_last_n: 10 },
        )
    }

    async fn seeded_store(n: usize) -> MemoryStore {
        let store = MemoryStore::new();
        store.create(Session::with_id("s1")).await.unwrap();
        for i in 0..n {
            let message = if i % 2 == 0 {
                Message::user(&format!("question number {}", i))
            } else {
                Message::assistant(&format!("answer number {}", i))
            };
            store.append_message("s1", message).await.unwrap();
        }
        store
    }

    #[tokio::test]
    async fn test_preview_split() {
        let store = seeded_store(12).await;
        let engine = engine(store, Arc::new(CountingSummarizer));

        let preview = engine.preview("s1", None).await.unwrap();
        assert_eq!(preview.total_messages, 12);
        assert_eq!(preview.summarize_count, 2);
        assert_eq!(preview.keep_count, 10);
        assert!(preview.fork_needed);
        assert!(preview.estimated_reduction > 0);
        assert_eq!(
            preview.current_tokens,
            preview.kept_tokens + preview.estimated_reduction
        );
    }

    #[tokio::test]
    async fn test_preview_short_session() {
        let store = seeded_store(4).await;
        let engine = engine(store, Arc::new(CountingSummarizer));

        let preview = engine.preview("s1", None).await.unwrap();
        assert!(!preview.fork_needed);
        assert_eq!(preview.summarize_count, 0);
        assert_eq!(preview.keep_count, 4);
        assert_eq!(preview.estimated_reduction, 0);
    }

    #[tokio::test]
    async fn test_fork_happy_path() {
        let store = seeded_store(12).await;
        let engine = engine(store.clone(), Arc::new(CountingSummarizer));

        let outcome = engine.fork("s1", None).await.unwrap();
        let result = match outcome {
            ForkOutcome::Forked(result) => result,
            other => panic!("expected fork, got {:?}", other),
        };
        assert_eq!(result.summarized_count, 2);
        assert_eq!(result.kept_count, 10);
        assert_eq!(result.summary, "Discussed 2 earlier messages.");
        assert_eq!(result.next_steps.len(), 3);

        // Source is sealed with lineage preserved in the continuation
        let source = store.load("s1").await.unwrap().unwrap();
        assert_eq!(source.state, SessionState::Forked);
        assert_eq!(source.messages.len(), 12);

        let forked = store.load(&result.new_session_id).await.unwrap().unwrap();
        assert_eq!(forked.forked_from.as_deref(), Some("s1"));
        assert_eq!(forked.messages.len(), 11);
        assert_eq!(forked.messages[0].role, Role::System);
        assert!(forked.messages[0].content.starts_with("[Conversation Summary]"));
        // Tail kept verbatim, repositioned contiguously
        assert_eq!(forked.messages[1].content, "question number 2");
        let positions: Vec<usize> = forked.messages.iter().map(|m| m.position).collect();
        assert_eq!(positions, (0..11).collect::<Vec<_>>());
        // Recomputed usage matches the new history
        assert_eq!(forked.usage.total_tokens, result.tokens_after);
        assert!(result.tokens_after < result.tokens_before + forked.messages[0].tokens.unwrap());
    }

    #[tokio::test]
    async fn test_fork_not_needed() {
        let store = seeded_store(10).await;
        let engine = engine(store.clone(), Arc::new(CountingSummarizer));

        let outcome = engine.fork("s1", None).await.unwrap();
        match outcome {
            ForkOutcome::NotNeeded {
                message_count,
                keep_last_n,
            } => {
                assert_eq!(message_count, 10);
                assert_eq!(keep_last_n, 10);
            }
            other => panic!("expected not-needed, got {:?}", other),
        }
        // Nothing changed
        let session = store.load("s1").await.unwrap().unwrap();
        assert_eq!(session.state, SessionState::Active);
    }

    #[tokio::test]
    async fn test_fork_keep_override() {
        let store = seeded_store(12).await;
        let engine = engine(store.clone(), Arc::new(CountingSummarizer));

        let outcome = engine.fork("s1", Some(4)).await.unwrap();
        let result = match outcome {
            ForkOutcome::Forked(result) => result,
            other => panic!("expected fork, got {:?}", other),
        };
        assert_eq!(result.summarized_count, 8);
        assert_eq!(result.kept_count, 4);
    }

    #[tokio::test]
    async fn test_refork_replays_first_result() {
        let store = seeded_store(12).await;
        let engine = engine(store, Arc::new(CountingSummarizer));

        let first = match engine.fork("s1", None).await.unwrap() {
            ForkOutcome::Forked(result) => result,
            other => panic!("expected fork, got {:?}", other),
        };
        let second = match engine.fork("s1", None).await.unwrap() {
            ForkOutcome::Forked(result) => result,
            other => panic!("expected replay, got {:?}", other),
        };
        // Same continuation, no second session created
        assert_eq!(first.new_session_id, second.new_session_id);
        assert_eq!(engine.result_for("s1").unwrap().new_session_id, first.new_session_id);
    }

    #[tokio::test]
    async fn test_summarizer_failure_leaves_source_untouched() {
        let store = seeded_store(12).await;
        let engine = engine(store.clone(), Arc::new(FailingSummarizer));

        let err = engine.fork("s1", None).await.unwrap_err();
        assert!(matches!(err, FlowError::SummarizationFailed(_)));

        let session = store.load("s1").await.unwrap().unwrap();
        assert_eq!(session.state, SessionState::Active);
        assert_eq!(session.messages.len(), 12);
        assert_eq!(store.len().await, 1);
        // The in-progress mark is released, so a later attempt may run
        assert!(engine.in_progress.is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_fork_single_winner() {
        let store = seeded_store(12).await;
        let engine = Arc::new(engine(store.clone(), Arc::new(SlowSummarizer)));

        let a = tokio::spawn({
            let engine = Arc::clone(&engine);
            async move { engine.fork("s1", None).await }
        });
        let b = tokio::spawn({
            let engine = Arc::clone(&engine);
            async move { engine.fork("s1", None).await }
        });
        let (a, b) = (a.await.unwrap(), b.await.unwrap());

        let mut forked = 0;
        let mut rejected = 0;
        for outcome in [a, b] {
            match outcome {
                Ok(ForkOutcome::Forked(_)) => forked += 1,
                Err(FlowError::ForkInProgress(_)) => rejected += 1,
                other => panic!("unexpected outcome {:?}", other),
            }
        }
        assert_eq!(forked, 1);
        assert_eq!(rejected, 1);
        // Exactly one continuation session exists
        assert_eq!(store.len().await, 2);
    }

    #[tokio::test]
    async fn test_fork_closed_session_is_error() {
        let store = seeded_store(12).await;
        store.set_state("s1", SessionState::Closed).await.unwrap();
        let engine = engine(store, Arc::new(CountingSummarizer));

        let err = engine.fork("s1", None).await.unwrap_err();
        assert!(matches!(err, FlowError::Session(_)));
    }
}
