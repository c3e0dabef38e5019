//! Streaming completion engine.
//!
//! Accepts prompts through a bounded ingress channel, drives one streaming
//! generation per user at a time, and forwards every chunk to the delivery
//! sink as it arrives.  Distinct users stream in parallel; the per-session
//! turn lock serializes turns for the same user.
//!
//! Suspension protocol: when the turn gate is cancelled (transport down) or
//! the backend is not ready, incoming prompts route into the per-user queue
//! instead of generating.  The next accepted turn first drains that backlog
//! in round-robin order across users, so no single user's backlog starves
//! the others.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::backend::{GenerationEvent, InferenceBackend};
use crate::config::{RelayConfig, RelayMode};
use crate::relay::bridge::ConnectivityBridge;
use crate::relay::registry::SessionRegistry;
use crate::relay::supervisor::ReadinessCell;
use crate::relay::types::{GenerationChunk, RelayError};
use crate::sink::DeliverySink;

/// One inbound prompt, as handed to the engine by the prompt source.
#[derive(Debug)]
pub struct PromptEnvelope {
    pub user: String,
    pub prompt: String,
}

/// Cloneable submission handle for inbound prompts.
#[derive(Debug, Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<PromptEnvelope>,
}

impl EngineHandle {
    pub(crate) fn new(tx: mpsc::Sender<PromptEnvelope>) -> Self {
        Self { tx }
    }

    /// Hand a prompt to the engine.
    ///
    /// Non-blocking: returns [`RelayError::QueueFull`] when the ingress
    /// queue is saturated rather than waiting for space.
    pub fn submit(
        &self,
        user: impl Into<String>,
        prompt: impl Into<String>,
    ) -> Result<(), RelayError> {
        let capacity = self.tx.max_capacity();
        self.tx
            .try_send(PromptEnvelope {
                user: user.into(),
                prompt: prompt.into(),
            })
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => RelayError::QueueFull { capacity },
                mpsc::error::TrySendError::Closed(_) => RelayError::EngineShutdown,
            })
    }
}

struct EngineInner {
    backend: Arc<dyn InferenceBackend>,
    sink: Arc<dyn DeliverySink>,
    registry: SessionRegistry,
    bridge: ConnectivityBridge,
    readiness: ReadinessCell,
    model: String,
    mode: RelayMode,
    /// Process shutdown token; carried into backend calls so an in-flight
    /// stream aborts on exit.  The turn gate is deliberately not used here:
    /// a transport drop does not abort a turn already past the gate check.
    shutdown: CancellationToken,
}

/// The streaming completion engine.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl Engine {
    pub fn new(
        backend: Arc<dyn InferenceBackend>,
        sink: Arc<dyn DeliverySink>,
        registry: SessionRegistry,
        bridge: ConnectivityBridge,
        readiness: ReadinessCell,
        config: &RelayConfig,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                backend,
                sink,
                registry,
                bridge,
                readiness,
                model: config.model.clone(),
                mode: config.mode,
                shutdown,
            }),
        }
    }

    /// Start the dispatch loop and return the submission handle.
    ///
    /// Each received prompt is served on its own task so distinct users
    /// stream in parallel; same-user turns are serialized by the session
    /// turn lock inside [`Engine::stream_turn`].
    pub fn start(&self, queue_capacity: usize) -> EngineHandle {
        let (tx, mut rx) = mpsc::channel::<PromptEnvelope>(queue_capacity);
        let engine = self.clone();
        tokio::spawn(async move {
            while let Some(envelope) = rx.recv().await {
                let engine = engine.clone();
                tokio::spawn(async move {
                    if let Err(e) = engine.stream_turn(&envelope.user, &envelope.prompt).await {
                        warn!(user = %envelope.user, error = %e, "turn failed");
                    }
                });
            }
            info!("engine dispatch loop stopped");
        });
        EngineHandle::new(tx)
    }

    /// Serve one prompt for one user.
    ///
    /// If the turn gate is already cancelled or the backend is not ready,
    /// the prompt is queued and the call returns without contacting the
    /// backend.  Otherwise any backlog is drained first (round-robin across
    /// all users), then this prompt is generated.
    pub async fn stream_turn(&self, user: &str, prompt: &str) -> Result<(), RelayError> {
        let gate = self.inner.bridge.current_token();
        if gate.is_cancelled() {
            self.enqueue(user, prompt, "transport down").await;
            return Ok(());
        }
        if !self.inner.readiness.snapshot().await.is_ready() {
            self.enqueue(user, prompt, "backend not ready").await;
            return Ok(());
        }

        self.drain_backlog(&gate).await;

        // The gate may have tripped or readiness lapsed mid-drain; this
        // prompt then joins the backlog instead of generating.
        if gate.is_cancelled() {
            self.enqueue(user, prompt, "transport down").await;
            return Ok(());
        }
        if !self.inner.readiness.snapshot().await.is_ready() {
            self.enqueue(user, prompt, "backend not ready").await;
            return Ok(());
        }

        self.run_turn(user, prompt).await
    }

    async fn enqueue(&self, user: &str, prompt: &str, reason: &'static str) {
        if self.inner.registry.enqueue_prompt(user, prompt).await {
            info!(user, reason, "prompt queued");
        } else {
            warn!(user, reason, "prompt queue full; prompt dropped");
        }
    }

    /// Drain all pending prompts, at most one per user per pass, repeating
    /// passes until every queue is empty or the gate trips.
    ///
    /// Prompts left queued by a mid-drain cancellation stay queued for the
    /// drain that follows reconnection.
    async fn drain_backlog(&self, gate: &CancellationToken) {
        loop {
            let users = self.inner.registry.users_with_pending().await;
            if users.is_empty() {
                return;
            }
            for user in users {
                if gate.is_cancelled() {
                    debug!("gate tripped mid-drain; leaving backlog queued");
                    return;
                }
                if let Some(prompt) = self.inner.registry.pop_pending(&user).await {
                    if let Err(e) = self.run_turn(&user, &prompt).await {
                        warn!(user = %user, error = %e, "queued turn failed");
                    }
                }
            }
        }
    }

    /// One generation turn: a single streaming backend call with per-chunk
    /// forwarding to the sink.  Holds the user's turn lock throughout.
    async fn run_turn(&self, user: &str, prompt: &str) -> Result<(), RelayError> {
        let turn_lock = self.inner.registry.turn_lock(user).await;
        let _turn = turn_lock.lock().await;

        let stream = match self.inner.mode {
            RelayMode::Completion => {
                let context = self.inner.registry.context(user).await;
                self.inner
                    .backend
                    .stream_generate(&self.inner.model, prompt, context, &self.inner.shutdown)
                    .await
            }
            RelayMode::Chat => {
                let handle = match self.inner.registry.chat_handle(user).await {
                    Some(h) => h,
                    None => {
                        let h = self.inner.backend.open_chat(&self.inner.model).await?;
                        self.inner.registry.set_chat_handle(user, h).await;
                        h
                    }
                };
                self.inner
                    .backend
                    .stream_chat(&handle, prompt, &self.inner.shutdown)
                    .await
            }
        };

        let mut stream = match stream {
            Ok(s) => s,
            // TODO: retry with exponential backoff keyed on this error class
            // once the supervisor exposes a "pull finished" signal to wait on.
            Err(e) if e.is_model_missing() => {
                warn!(user, error = %e, "model not found; turn dropped");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        let mut answer = String::new();
        while let Some(event) = stream.recv().await {
            match event {
                GenerationEvent::Token(text) => {
                    answer.push_str(&text);
                    self.deliver(GenerationChunk {
                        user: user.to_owned(),
                        text,
                        is_final: false,
                    })
                    .await;
                }
                GenerationEvent::Done { context } => {
                    self.deliver(GenerationChunk {
                        user: user.to_owned(),
                        text: String::new(),
                        is_final: true,
                    })
                    .await;
                    if let Some(context) = context {
                        // Context grows without bound across turns; log the
                        // length so the growth is at least observable.
                        debug!(user, context_len = context.len(), "context updated");
                        self.inner.registry.set_context(user, context).await;
                    }
                    break;
                }
                GenerationEvent::Error(e) if e.is_model_missing() => {
                    warn!(user, error = %e, "model not found mid-stream; turn dropped");
                    break;
                }
                GenerationEvent::Error(e) => {
                    warn!(user, error = %e, "generation stream error");
                    break;
                }
            }
        }

        info!(user, answer = %answer, "turn complete");
        Ok(())
    }

    /// Forward one chunk to the delivery sink.  Failures are logged, never
    /// retried; the turn is not requeued.
    async fn deliver(&self, chunk: GenerationChunk) {
        if let Err(e) = self.inner.sink.deliver(&chunk).await {
            error!(user = %chunk.user, error = %e, "delivery failed");
        }
    }
}
