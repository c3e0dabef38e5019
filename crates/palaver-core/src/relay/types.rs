use strum::{Display, EnumString};
use thiserror::Error;

use crate::backend::BackendError;

/// One incremental unit of model output within a turn.
///
/// Produced by the backend streaming call, consumed exactly once by the
/// delivery step.  Chunks for a given user are delivered in the order
/// produced; `is_final = true` is always the last chunk of a turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationChunk {
    /// Opaque user key the chunk belongs to.
    pub user: String,
    /// Generated text fragment.  Empty for the final marker chunk.
    pub text: String,
    /// `true` on the last chunk of a turn.
    pub is_final: bool,
}

/// Process-wide readiness of the inference backend.
///
/// Owned exclusively by the [`ReadinessSupervisor`]; the engine reads
/// snapshots before any generation attempt and must never issue a
/// generation call while `backend_reachable` is `false`.
///
/// [`ReadinessSupervisor`]: crate::relay::supervisor::ReadinessSupervisor
#[derive(Debug, Clone, Default)]
pub struct ReadinessState {
    /// The backend answered its last "list local models" call.
    pub backend_reachable: bool,
    /// Name of the confirmed-resident model, once verified.
    pub loaded_model: Option<String>,
    /// A model pull is currently running.
    pub pull_in_progress: bool,
}

impl ReadinessState {
    /// Returns `true` when the backend is reachable and the configured
    /// model is confirmed resident.
    pub fn is_ready(&self) -> bool {
        self.backend_reachable && self.loaded_model.is_some()
    }
}

/// Progress of an in-flight model pull.  Ephemeral; forwarded to the
/// observability sink and not retained after the pull completes.
#[derive(Debug, Clone)]
pub struct PullProgress {
    /// Completion percentage, `0.0..=100.0`.
    pub percent: f64,
    /// Backend-supplied status line (e.g. `"downloading layer …"`).
    pub status: String,
}

/// Health of the outbound delivery transport as observed by the
/// [`TransportMonitor`](crate::sink::TransportMonitor).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum TransportState {
    Connected,
    Connecting,
    Disconnected,
}

/// Errors produced by the relay layer.
#[derive(Debug, Error)]
pub enum RelayError {
    /// The engine's ingress queue is at capacity.
    #[error("engine queue full (capacity {capacity})")]
    QueueFull { capacity: usize },

    /// The engine's dispatch loop has stopped.
    #[error("engine shutdown")]
    EngineShutdown,

    /// The operation was interrupted by the shutdown token.
    #[error("operation cancelled by shutdown")]
    Cancelled,

    /// Propagated from the inference backend.
    #[error(transparent)]
    Backend(#[from] BackendError),
}
