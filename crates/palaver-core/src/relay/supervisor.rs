//! Model readiness supervisor.
//!
//! Keeps the inference backend ready before traffic is served: waits for the
//! backend to become reachable, verifies the configured model is resident,
//! and triggers a progress-reporting pull when it is missing.  Nothing here
//! is fatal; every failure degrades to "log and retry on the next tick".

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{RwLock, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::backend::{BackendError, InferenceBackend, LocalModel};
use crate::config::RelayConfig;
use crate::relay::bridge::ConnectivityBridge;
use crate::relay::types::{PullProgress, ReadinessState, RelayError};
use crate::sink::TransportMonitor;

/// Shared-read access to the process-wide [`ReadinessState`].
///
/// The supervisor holds the only mutation rights; everyone else takes
/// snapshots.
#[derive(Debug, Clone, Default)]
pub struct ReadinessCell {
    inner: Arc<RwLock<ReadinessState>>,
}

impl ReadinessCell {
    pub fn new() -> Self {
        Self::default()
    }

    /// A copy of the current readiness state.
    pub async fn snapshot(&self) -> ReadinessState {
        self.inner.read().await.clone()
    }

    pub(crate) async fn update(&self, f: impl FnOnce(&mut ReadinessState)) {
        let mut state = self.inner.write().await;
        f(&mut state);
    }
}

/// Supervises backend readiness and drives the outer tick loop.
pub struct ReadinessSupervisor {
    backend: Arc<dyn InferenceBackend>,
    monitor: Arc<dyn TransportMonitor>,
    bridge: ConnectivityBridge,
    state: ReadinessCell,
    config: RelayConfig,
    shutdown: CancellationToken,
}

impl ReadinessSupervisor {
    pub fn new(
        backend: Arc<dyn InferenceBackend>,
        monitor: Arc<dyn TransportMonitor>,
        bridge: ConnectivityBridge,
        state: ReadinessCell,
        config: RelayConfig,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            backend,
            monitor,
            bridge,
            state,
            config,
            shutdown,
        }
    }

    /// Make sure the backend is reachable and the configured model resident.
    ///
    /// Idempotent; safe to call once per supervisory tick.  Short-circuits
    /// on the cached model name, so a second call after success performs no
    /// backend calls at all.  While the backend is unreachable this retries
    /// indefinitely at `retry_backoff` intervals; only shutdown interrupts
    /// it.
    pub async fn ensure_ready(&self, must_pull: bool) -> Result<ReadinessState, RelayError> {
        let model = &self.config.model;

        let cached = self.state.snapshot().await;
        if cached.loaded_model.as_deref() == Some(model.as_str()) {
            return Ok(cached);
        }

        let local_models = self.wait_for_backend().await?;

        if local_models.iter().any(|m| m.name.starts_with(model)) {
            info!(%model, "local model ready");
            self.state
                .update(|s| s.loaded_model = Some(model.clone()))
                .await;
            return Ok(self.state.snapshot().await);
        }

        if !must_pull {
            info!(%model, "model absent; bailing out from pulling as instructed");
            return Ok(self.state.snapshot().await);
        }

        self.pull_model().await?;
        Ok(self.state.snapshot().await)
    }

    /// Loop "list local models" until the backend answers.
    async fn wait_for_backend(&self) -> Result<Vec<LocalModel>, RelayError> {
        loop {
            match self.backend.list_local_models(&self.shutdown).await {
                Ok(models) => {
                    self.state.update(|s| s.backend_reachable = true).await;
                    return Ok(models);
                }
                Err(BackendError::Cancelled) => return Err(RelayError::Cancelled),
                Err(e) => {
                    error!(error = %e, "backend is not running; retrying");
                    self.state.update(|s| s.backend_reachable = false).await;
                    tokio::select! {
                        _ = tokio::time::sleep(self.config.retry_backoff) => {}
                        _ = self.shutdown.cancelled() => return Err(RelayError::Cancelled),
                    }
                }
            }
        }
    }

    /// Pull the configured model, forwarding progress to the log, then
    /// re-verify it is actually present.
    async fn pull_model(&self) -> Result<(), RelayError> {
        let model = self.config.model.clone();
        info!(%model, "pulling model");
        self.state.update(|s| s.pull_in_progress = true).await;
        let started = Instant::now();

        let (progress_tx, mut progress_rx) = mpsc::channel::<PullProgress>(32);
        let progress_model = model.clone();
        let forwarder = tokio::spawn(async move {
            while let Some(p) = progress_rx.recv().await {
                info!(
                    model = %progress_model,
                    percent = p.percent.round() as i64,
                    status = %p.status,
                    "pull progress"
                );
            }
        });

        let pull_result = self
            .backend
            .pull_model(&model, progress_tx, &self.shutdown)
            .await;
        let _ = forwarder.await;

        if let Err(e) = pull_result {
            // Disconnecting mid-pull invalidates anything we thought we knew;
            // the next tick re-verifies from scratch.
            warn!(%model, error = %e, "pull interrupted");
            self.state
                .update(|s| {
                    s.pull_in_progress = false;
                    s.loaded_model = None;
                    s.backend_reachable = false;
                })
                .await;
            return match e {
                BackendError::Cancelled => Err(RelayError::Cancelled),
                _ => Ok(()),
            };
        }

        let elapsed = started.elapsed();
        let local_models = self.wait_for_backend().await?;
        if local_models
            .iter()
            .any(|m| m.name.eq_ignore_ascii_case(&model))
        {
            debug!(
                %model,
                elapsed_secs = elapsed.as_secs(),
                "model pulled successfully"
            );
            self.state
                .update(|s| {
                    s.pull_in_progress = false;
                    s.loaded_model = Some(model.clone());
                })
                .await;
        } else {
            // Known gap: a pull that silently left the model absent is only
            // logged; the next tick retries the whole verification.
            warn!(%model, "pull completed but model is still absent");
            self.state.update(|s| s.pull_in_progress = false).await;
        }
        Ok(())
    }

    /// The outer supervisory loop: one readiness pass and one transport
    /// probe per tick, until shutdown.
    pub async fn run(self) {
        info!(
            model = %self.config.model,
            tick = ?self.config.supervisor_tick,
            "readiness supervisor started"
        );
        while !self.shutdown.is_cancelled() {
            match self.ensure_ready(self.config.must_pull).await {
                Ok(state) if !state.is_ready() => {
                    debug!("backend not ready; serving deferred until next tick");
                }
                Ok(_) => {}
                Err(RelayError::Cancelled) => break,
                Err(e) => warn!(error = %e, "readiness pass failed"),
            }

            let transport = self.monitor.probe().await;
            self.bridge.on_transport_state_changed(transport);

            tokio::select! {
                _ = tokio::time::sleep(self.config.supervisor_tick) => {}
                _ = self.shutdown.cancelled() => break,
            }
        }
        info!("readiness supervisor stopped");
    }
}
