//! Streaming transport management
//!
//! Owns the lifecycle of one client-facing stream: opens the channel,
//! forwards incremental output fragments in arrival order, handles
//! cooperative cancellation, and degrades to a single-shot response when
//! the channel cannot be established or the chosen provider does not
//! support streaming.
//!
//! Per in-flight request the manager moves through
//! `Idle -> Opening -> Streaming -> Completed`, with alternates
//! `Opening -> Degraded` (channel setup failed, fall back to single-shot),
//! `Streaming -> Cancelled` (caller-initiated), `Streaming -> Failed`
//! (provider error or transport drop mid-flight) and
//! `Degraded -> Completed | Failed`.
//!
//! Streaming and single-shot share one generation pipeline; single-shot
//! simply never forwards `chunk` events, so budget tracking and message
//! construction are identical in both modes. Degradation is transparent:
//! the same logical response (full text, usage, provider/model) is
//! eventually delivered either way.

pub mod frames;

pub use frames::Frame;

use crate::budget::{BudgetTracker, TokenEstimator};
use crate::config::TransportConfig;
use crate::dispatch::{Dispatch, DispatchRouter, GenerateOptions, Generation};
use crate::error::{FlowError, Result};
use crate::session::{Message, SessionStore, TokenUsage};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// The persistent bidirectional channel to one client.
///
/// Implementations wrap whatever the embedding application uses
/// (WebSocket, SSE, in-process queue). `send` delivers frames in call
/// order; a failed `send` is treated as a dropped channel.
#[async_trait]
pub trait ClientChannel: Send {
    /// Establish the channel. Called at most once per request.
    async fn open(&mut self) -> Result<()>;

    /// Deliver one frame to the client.
    async fn send(&mut self, frame: Frame) -> Result<()>;
}

/// How the response was (or will be) delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryMode {
    /// Incremental `chunk` frames followed by a terminal frame
    Streaming,
    /// Only the terminal frame, returned through the request/response path
    SingleShot,
}

/// Lifecycle phases of one in-flight stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamPhase {
    Idle,
    Opening,
    Streaming,
    Degraded,
    Completed,
    Cancelled,
    Failed,
}

/// One inbound generation request.
#[derive(Debug, Clone)]
pub struct StreamRequest {
    /// Target session
    pub session_id: String,
    /// Agent type used for provider default resolution
    pub agent_type: String,
    /// Explicit provider override
    pub provider: Option<String>,
    /// Explicit model override
    pub model: Option<String>,
    /// The user's turn
    pub input: String,
    /// Maximum tokens to generate
    pub max_tokens: Option<u32>,
    /// Sampling temperature
    pub temperature: Option<f32>,
}

impl StreamRequest {
    /// Create a request with defaults for everything but the essentials.
    pub fn new(session_id: &str, agent_type: &str, input: &str) -> Self {
        Self {
            session_id: session_id.to_string(),
            agent_type: agent_type.to_string(),
            provider: None,
            model: None,
            input: input.to_string(),
            max_tokens: None,
            temperature: None,
        }
    }

    /// Request a specific provider.
    pub fn with_provider(mut self, provider: &str) -> Self {
        self.provider = Some(provider.to_string());
        self
    }

    /// Request a specific model.
    pub fn with_model(mut self, model: &str) -> Self {
        self.model = Some(model.to_string());
        self
    }
}

/// Terminal result of a stream run.
///
/// Errors (provider failure, timeout, dropped channel) are returned as
/// `Err` from [`TransportManager::run`]; this type covers the two
/// non-error terminals.
#[derive(Debug)]
pub enum StreamOutcome {
    /// The turn finished. In single-shot mode the caller delivers `frame`
    /// through its request/response path; in streaming mode the same
    /// frame was already sent on the channel.
    Completed { mode: DeliveryMode, frame: Frame },
    /// The caller cancelled mid-stream. Any non-empty partial output has
    /// been recorded as an incomplete message.
    Cancelled { partial: String },
}

/// Drives one request from dispatch through delivery.
pub struct TransportManager {
    router: Arc<DispatchRouter>,
    store: Arc<dyn SessionStore>,
    budget: Arc<BudgetTracker>,
    estimator: Arc<dyn TokenEstimator>,
    config: TransportConfig,
}

impl TransportManager {
    pub fn new(
        router: Arc<DispatchRouter>,
        store: Arc<dyn SessionStore>,
        budget: Arc<BudgetTracker>,
        estimator: Arc<dyn TokenEstimator>,
        config: TransportConfig,
    ) -> Self {
        Self {
            router,
            store,
            budget,
            estimator,
            config,
        }
    }

    /// Run one request to a terminal state.
    ///
    /// The caller owns `cancel` and may trigger it at any time; the
    /// provider adapter is asked to stop (best-effort) and no frame is
    /// forwarded after the cancellation is observed.
    pub async fn run(
        &self,
        request: StreamRequest,
        channel: &mut dyn ClientChannel,
        cancel: CancellationToken,
    ) -> Result<StreamOutcome> {
        let session = self.store.require(&request.session_id).await?;
        if !session.is_active() {
            return Err(FlowError::Session(format!(
                "session '{}' is {}, not accepting requests",
                session.id, session.state
            )));
        }
        self.budget.seed(&session.id, session.usage);

        let dispatch = self.router.resolve(
            &request.agent_type,
            request.provider.as_deref(),
            request.model.as_deref(),
        )?;

        let user_message = Message::user(&request.input)
            .with_tokens(self.estimator.estimate(&request.input));
        self.store
            .append_message(&request.session_id, user_message)
            .await?;
        let prompt = self.store.require(&request.session_id).await?.messages;

        let options = GenerateOptions {
            model: dispatch.model.clone(),
            max_tokens: request.max_tokens,
            temperature: request.temperature,
        };

        // Mode selection: a non-streaming profile skips the channel
        // entirely; a streaming profile degrades if the channel cannot be
        // opened within the deadline.
        let mode = if !dispatch.supports_streaming() {
            tracing::debug!(
                session = %request.session_id,
                provider = %dispatch.profile.provider_id,
                "provider does not stream, using single-shot mode"
            );
            DeliveryMode::SingleShot
        } else {
            self.transition(&request.session_id, StreamPhase::Idle, StreamPhase::Opening);
            let open_deadline = Duration::from_secs_f64(self.config.open_timeout_secs);
            match tokio::time::timeout(open_deadline, channel.open()).await {
                Ok(Ok(())) => DeliveryMode::Streaming,
                Ok(Err(e)) => {
                    self.transition(&request.session_id, StreamPhase::Opening, StreamPhase::Degraded);
                    tracing::warn!(
                        session = %request.session_id,
                        error = %e,
                        "channel open failed, degrading to single-shot"
                    );
                    DeliveryMode::SingleShot
                }
                Err(_) => {
                    self.transition(&request.session_id, StreamPhase::Opening, StreamPhase::Degraded);
                    tracing::warn!(
                        session = %request.session_id,
                        timeout_secs = self.config.open_timeout_secs,
                        "channel open timed out, degrading to single-shot"
                    );
                    DeliveryMode::SingleShot
                }
            }
        };

        match mode {
            DeliveryMode::Streaming => {
                self.run_streaming(&request, &dispatch, prompt, options, channel, cancel)
                    .await
            }
            DeliveryMode::SingleShot => {
                self.run_single_shot(&request, &dispatch, prompt, options, cancel)
                    .await
            }
        }
    }

    async fn run_streaming(
        &self,
        request: &StreamRequest,
        dispatch: &Dispatch,
        prompt: Vec<Message>,
        options: GenerateOptions,
        channel: &mut dyn ClientChannel,
        cancel: CancellationToken,
    ) -> Result<StreamOutcome> {
        self.transition(&request.session_id, StreamPhase::Opening, StreamPhase::Streaming);

        let (frag_tx, mut frag_rx) = mpsc::channel::<String>(self.config.fragment_buffer);
        // The generation task gets a child token: a caller cancellation
        // propagates down to the adapter, while a deadline expiry inside
        // the router cancels only the adapter, never the caller's token.
        let gen_cancel = cancel.child_token();
        let router = Arc::clone(&self.router);
        let gen_dispatch = dispatch.clone();
        let gen_prompt = prompt.clone();
        let task_cancel = gen_cancel.clone();
        let handle = tokio::spawn(async move {
            router
                .generate(&gen_dispatch, gen_prompt, options, Some(frag_tx), task_cancel)
                .await
        });

        let mut accumulated = String::new();
        loop {
            tokio::select! {
                // Checked first so a cancellation is never lost behind an
                // in-flight forward.
                biased;
                _ = cancel.cancelled() => {
                    self.transition(&request.session_id, StreamPhase::Streaming, StreamPhase::Cancelled);
                    // Stop receiving: late-arriving fragments are discarded,
                    // not forwarded and not re-appended beyond the capture.
                    // The generation task is not killed; it winds down on
                    // its own once the adapter observes the token.
                    drop(frag_rx);
                    self.preserve_partial(&request.session_id, &accumulated).await;
                    return Ok(StreamOutcome::Cancelled { partial: accumulated });
                }
                fragment = frag_rx.recv() => match fragment {
                    Some(fragment) => {
                        accumulated.push_str(&fragment);
                        if let Err(e) = channel.send(Frame::Chunk { content: fragment }).await {
                            self.transition(&request.session_id, StreamPhase::Streaming, StreamPhase::Failed);
                            gen_cancel.cancel();
                            drop(frag_rx);
                            self.preserve_partial(&request.session_id, &accumulated).await;
                            return Err(FlowError::ChannelDropped(e.to_string()));
                        }
                    }
                    // Fragment sender dropped: generation is finishing.
                    None => break,
                },
            }
        }

        let generation = match handle.await {
            Ok(Ok(generation)) => generation,
            Ok(Err(e)) => {
                self.transition(&request.session_id, StreamPhase::Streaming, StreamPhase::Failed);
                self.preserve_partial(&request.session_id, &accumulated).await;
                let _ = channel
                    .send(Frame::Error {
                        message: e.to_string(),
                    })
                    .await;
                return Err(e);
            }
            Err(e) => {
                self.transition(&request.session_id, StreamPhase::Streaming, StreamPhase::Failed);
                let err = FlowError::Provider(format!("generation task failed: {}", e));
                let _ = channel
                    .send(Frame::Error {
                        message: err.to_string(),
                    })
                    .await;
                return Err(err);
            }
        };

        let frame = self
            .finalize(request, dispatch, &prompt, &generation)
            .await?;
        if let Err(e) = channel.send(frame.clone()).await {
            // The completed message is already durable; only delivery failed.
            return Err(FlowError::ChannelDropped(e.to_string()));
        }
        self.transition(&request.session_id, StreamPhase::Streaming, StreamPhase::Completed);
        Ok(StreamOutcome::Completed {
            mode: DeliveryMode::Streaming,
            frame,
        })
    }

    async fn run_single_shot(
        &self,
        request: &StreamRequest,
        dispatch: &Dispatch,
        prompt: Vec<Message>,
        options: GenerateOptions,
        cancel: CancellationToken,
    ) -> Result<StreamOutcome> {
        let call = self
            .router
            .generate(dispatch, prompt.clone(), options, None, cancel.child_token());
        tokio::pin!(call);

        let generation: Generation = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                self.transition(&request.session_id, StreamPhase::Degraded, StreamPhase::Cancelled);
                return Ok(StreamOutcome::Cancelled {
                    partial: String::new(),
                });
            }
            result = &mut call => match result {
                Ok(generation) => generation,
                Err(e) => {
                    self.transition(&request.session_id, StreamPhase::Degraded, StreamPhase::Failed);
                    return Err(e);
                }
            },
        };

        let frame = self
            .finalize(request, dispatch, &prompt, &generation)
            .await?;
        self.transition(&request.session_id, StreamPhase::Degraded, StreamPhase::Completed);
        Ok(StreamOutcome::Completed {
            mode: DeliveryMode::SingleShot,
            frame,
        })
    }

    /// Shared completion path: append the assistant message, record usage,
    /// and build the terminal frame. Identical for both delivery modes.
    async fn finalize(
        &self,
        request: &StreamRequest,
        dispatch: &Dispatch,
        prompt: &[Message],
        generation: &Generation,
    ) -> Result<Frame> {
        let usage = self.turn_usage(prompt, generation);
        let assistant = Message::assistant(&generation.text).with_tokens(usage.output_tokens);
        self.store
            .append_message(&request.session_id, assistant)
            .await?;
        self.store
            .record_usage(&request.session_id, &usage)
            .await?;
        let headroom = self.budget.record(
            &request.session_id,
            &usage,
            dispatch.profile.context_limit_tokens,
        );

        Ok(Frame::Complete {
            full_content: generation.text.clone(),
            usage,
            provider: dispatch.profile.provider_id.clone(),
            model: dispatch.model.clone(),
            headroom,
        })
    }

    /// Usage for a completed turn: the provider's report where available,
    /// a local estimate otherwise.
    fn turn_usage(&self, prompt: &[Message], generation: &Generation) -> TokenUsage {
        generation.usage.unwrap_or_else(|| {
            TokenUsage::new(
                self.estimator.estimate_messages(prompt),
                self.estimator.estimate(&generation.text),
            )
        })
    }

    /// Record partial output as an incomplete message, if non-empty.
    ///
    /// Called on failure paths only; storage errors here are logged, not
    /// propagated over the original failure.
    async fn preserve_partial(&self, session_id: &str, accumulated: &str) {
        if accumulated.trim().is_empty() {
            return;
        }
        let partial = Message::assistant(accumulated)
            .with_tokens(self.estimator.estimate(accumulated))
            .incomplete();
        if let Err(e) = self.store.append_message(session_id, partial).await {
            tracing::warn!(session = session_id, error = %e, "failed to preserve partial output");
        }
    }

    fn transition(&self, session_id: &str, from: StreamPhase, to: StreamPhase) {
        tracing::debug!(session = session_id, ?from, ?to, "stream transition");
    }
}
