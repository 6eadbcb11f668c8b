//! Provider dispatch routing
//!
//! Maps a requested `(agent_type, provider, model)` tuple to a registered
//! provider adapter, falling back to the agent type's configured default
//! profile when provider/model are unset, and enforces the profile's
//! dispatch deadline.
//!
//! The router performs exactly one dispatch attempt with a bounded
//! deadline. Retry policy, if any, belongs to the caller of this core.

use crate::error::{FlowError, Result};
use crate::session::{Message, TokenUsage};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Static configuration for one upstream backend. Read-only at runtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderProfile {
    /// Stable identifier (e.g. "anthropic", "openai")
    pub provider_id: String,
    /// Model used when the request does not name one
    pub default_model: String,
    /// Hard deadline for one dispatch attempt
    pub timeout_secs: f64,
    /// Whether the backend can deliver incremental fragments
    pub supports_streaming: bool,
    /// Context window of the default model, in tokens
    pub context_limit_tokens: u64,
}

/// Options passed through to the provider adapter.
#[derive(Debug, Clone, Default)]
pub struct GenerateOptions {
    /// Resolved model identifier
    pub model: String,
    /// Maximum number of tokens to generate
    pub max_tokens: Option<u32>,
    /// Sampling temperature
    pub temperature: Option<f32>,
}

/// Final result of one generation call.
#[derive(Debug, Clone)]
pub struct Generation {
    /// The full response text
    pub text: String,
    /// Token usage as reported by the provider, when available
    pub usage: Option<TokenUsage>,
}

/// The opaque integration point to one upstream text-generation backend.
///
/// When `fragments` is supplied and the profile supports streaming, the
/// adapter delivers incremental output through it before returning the
/// final result. The adapter is expected to check `cancel` between
/// fragments and stop generation early; honoring it is best-effort, and
/// the transport manager independently discards post-cancellation
/// fragments.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    /// Stable identifier matching the registered [`ProviderProfile`].
    fn id(&self) -> &str;

    /// Run one generation over the given prompt.
    async fn generate(
        &self,
        messages: Vec<Message>,
        options: GenerateOptions,
        fragments: Option<mpsc::Sender<String>>,
        cancel: CancellationToken,
    ) -> Result<Generation>;
}

/// A resolved dispatch: the adapter to call, its profile, and the
/// effective model.
#[derive(Clone)]
pub struct Dispatch {
    pub adapter: Arc<dyn ProviderAdapter>,
    pub profile: ProviderProfile,
    /// The model that will actually be used for this request
    pub model: String,
}

impl std::fmt::Debug for Dispatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatch")
            .field("adapter", &self.adapter.id())
            .field("profile", &self.profile)
            .field("model", &self.model)
            .finish()
    }
}

impl Dispatch {
    /// Whether the transport manager may use incremental delivery.
    pub fn supports_streaming(&self) -> bool {
        self.profile.supports_streaming
    }
}

/// Routes requests to provider adapters under per-provider policy.
pub struct DispatchRouter {
    adapters: HashMap<String, (Arc<dyn ProviderAdapter>, ProviderProfile)>,
    agent_defaults: HashMap<String, String>,
}

impl DispatchRouter {
    /// Create an empty router.
    pub fn new() -> Self {
        Self {
            adapters: HashMap::new(),
            agent_defaults: HashMap::new(),
        }
    }

    /// Register an adapter together with its profile.
    ///
    /// The adapter is keyed by `profile.provider_id`; registering the same
    /// id again replaces the previous adapter.
    pub fn register(&mut self, adapter: Arc<dyn ProviderAdapter>, profile: ProviderProfile) {
        self.adapters
            .insert(profile.provider_id.clone(), (adapter, profile));
    }

    /// Set the default provider for an agent type.
    pub fn set_agent_default(&mut self, agent_type: &str, provider_id: &str) {
        self.agent_defaults
            .insert(agent_type.to_string(), provider_id.to_string());
    }

    /// Resolve a concrete adapter and effective model.
    ///
    /// Falls back to the agent type's default provider when
    /// `requested_provider` is unset, and to the profile's default model
    /// when `requested_model` is unset.
    pub fn resolve(
        &self,
        agent_type: &str,
        requested_provider: Option<&str>,
        requested_model: Option<&str>,
    ) -> Result<Dispatch> {
        let provider_id = match requested_provider {
            Some(id) => id,
            None => self.agent_defaults.get(agent_type).map(String::as_str).ok_or_else(|| {
                FlowError::Config(format!(
                    "no default provider configured for agent type '{}'",
                    agent_type
                ))
            })?,
        };

        let (adapter, profile) = self.adapters.get(provider_id).ok_or_else(|| {
            FlowError::Config(format!("unknown provider '{}'", provider_id))
        })?;

        let model = requested_model
            .map(str::to_string)
            .unwrap_or_else(|| profile.default_model.clone());

        tracing::debug!(
            agent_type,
            provider = provider_id,
            %model,
            "dispatch resolved"
        );

        Ok(Dispatch {
            adapter: Arc::clone(adapter),
            profile: profile.clone(),
            model,
        })
    }

    /// Run one generation through a resolved dispatch, enforcing the
    /// profile's deadline.
    ///
    /// On deadline expiry the cancellation token is triggered (so the
    /// adapter can stop work) and [`FlowError::ProviderTimeout`] is
    /// returned. No retries are performed here.
    pub async fn generate(
        &self,
        dispatch: &Dispatch,
        messages: Vec<Message>,
        options: GenerateOptions,
        fragments: Option<mpsc::Sender<String>>,
        cancel: CancellationToken,
    ) -> Result<Generation> {
        let deadline = Duration::from_secs_f64(dispatch.profile.timeout_secs);
        let call = dispatch
            .adapter
            .generate(messages, options, fragments, cancel.clone());

        match tokio::time::timeout(deadline, call).await {
            Ok(result) => result,
            Err(_) => {
                cancel.cancel();
                tracing::warn!(
                    provider = %dispatch.profile.provider_id,
                    timeout_secs = dispatch.profile.timeout_secs,
                    "provider dispatch deadline exceeded"
                );
                Err(FlowError::ProviderTimeout {
                    provider: dispatch.profile.provider_id.clone(),
                    timeout_secs: dispatch.profile.timeout_secs,
                })
            }
        }
    }

    /// Provider ids with a registered adapter.
    pub fn provider_ids(&self) -> Vec<&str> {
        self.adapters.keys().map(String::as_str).collect()
    }
}

impl Default for DispatchRouter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    fn profile(id: &str, streaming: bool, timeout_secs: f64) -> ProviderProfile {
        ProviderProfile {
            provider_id: id.to_string(),
            default_model: format!("{}-default", id),
            timeout_secs,
            supports_streaming: streaming,
            context_limit_tokens: 100_000,
        }
    }

    /// Echoes the last message back, reporting fixed usage.
    struct EchoAdapter {
        id: String,
    }

    #[async_trait]
    impl ProviderAdapter for EchoAdapter {
        fn id(&self) -> &str {
            &self.id
        }

        async fn generate(
            &self,
            messages: Vec<Message>,
            _options: GenerateOptions,
            fragments: Option<mpsc::Sender<String>>,
            _cancel: CancellationToken,
        ) -> Result<Generation> {
            let text = messages
                .last()
                .map(|m| format!("echo: {}", m.content))
                .unwrap_or_default();
            if let Some(tx) = fragments {
                let _ = tx.send(text.clone()).await;
            }
            Ok(Generation {
                text,
                usage: Some(TokenUsage::new(10, 5)),
            })
        }
    }

    /// Never responds until cancelled.
    struct HangingAdapter;

    #[async_trait]
    impl ProviderAdapter for HangingAdapter {
        fn id(&self) -> &str {
            "hanging"
        }

        async fn generate(
            &self,
            _messages: Vec<Message>,
            _options: GenerateOptions,
            _fragments: Option<mpsc::Sender<String>>,
            cancel: CancellationToken,
        ) -> Result<Generation> {
            cancel.cancelled().await;
            Err(FlowError::Provider("cancelled".to_string()))
        }
    }

    fn router() -> DispatchRouter {
        let mut router = DispatchRouter::new();
        router.register(
            Arc::new(EchoAdapter {
                id: "anthropic".to_string(),
            }),
            profile("anthropic", true, 30.0),
        );
        router.register(
            Arc::new(EchoAdapter {
                id: "legacy".to_string(),
            }),
            profile("legacy", false, 30.0),
        );
        router.set_agent_default("chat", "anthropic");
        router
    }

    #[test]
    fn test_resolve_agent_default() {
        let router = router();
        let dispatch = router.resolve("chat", None, None).unwrap();
        assert_eq!(dispatch.profile.provider_id, "anthropic");
        assert_eq!(dispatch.model, "anthropic-default");
        assert!(dispatch.supports_streaming());
    }

    #[test]
    fn test_resolve_explicit_provider_and_model() {
        let router = router();
        let dispatch = router
            .resolve("chat", Some("legacy"), Some("legacy-large"))
            .unwrap();
        assert_eq!(dispatch.profile.provider_id, "legacy");
        assert_eq!(dispatch.model, "legacy-large");
        assert!(!dispatch.supports_streaming());
    }

    #[test]
    fn test_resolve_unknown_provider() {
        let router = router();
        let err = router.resolve("chat", Some("nope"), None).unwrap_err();
        assert!(matches!(err, FlowError::Config(_)));
    }

    #[test]
    fn test_resolve_unknown_agent_type() {
        let router = router();
        let err = router.resolve("unknown-agent", None, None).unwrap_err();
        assert!(matches!(err, FlowError::Config(_)));
    }

    #[tokio::test]
    async fn test_generate_happy_path() {
        let router = router();
        let dispatch = router.resolve("chat", None, None).unwrap();
        let generation = router
            .generate(
                &dispatch,
                vec![Message::user("hello")],
                GenerateOptions::default(),
                None,
                CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(generation.text, "echo: hello");
        assert_eq!(generation.usage.unwrap().total_tokens, 15);
    }

    #[tokio::test]
    async fn test_generate_timeout_is_bounded() {
        let mut router = DispatchRouter::new();
        router.register(Arc::new(HangingAdapter), profile("hanging", true, 0.2));
        router.set_agent_default("chat", "hanging");

        let dispatch = router.resolve("chat", None, None).unwrap();
        let cancel = CancellationToken::new();
        let start = Instant::now();
        let err = router
            .generate(
                &dispatch,
                vec![Message::user("hello")],
                GenerateOptions::default(),
                None,
                cancel.clone(),
            )
            .await
            .unwrap_err();

        // Deadline enforced: caller gets ProviderTimeout promptly, not hung
        assert!(matches!(err, FlowError::ProviderTimeout { .. }));
        assert!(start.elapsed() < Duration::from_secs(1));
        // The adapter was asked to stop
        assert!(cancel.is_cancelled());
    }

    #[test]
    fn test_register_replaces() {
        let mut router = router();
        router.register(
            Arc::new(EchoAdapter {
                id: "anthropic".to_string(),
            }),
            profile("anthropic", false, 5.0),
        );
        let dispatch = router.resolve("chat", None, None).unwrap();
        assert!(!dispatch.supports_streaming());
        assert_eq!(dispatch.profile.timeout_secs, 5.0);
    }
}
