//! Inference backend capability contract.
//!
//! The relay never talks HTTP directly; it drives an [`InferenceBackend`]
//! trait object.  [`ollama::OllamaClient`] is the production implementation;
//! tests script their own.

pub mod ollama;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::relay::types::PullProgress;

/// Errors produced by an inference backend.
#[derive(Debug, Error)]
pub enum BackendError {
    /// The backend did not answer (connection refused, DNS, timeout).
    #[error("backend unreachable: {0}")]
    Unreachable(String),

    /// The requested model is not present on the backend (HTTP 404 class).
    #[error("model not found: {model}")]
    ModelMissing { model: String },

    /// The backend answered with a frame the client could not interpret.
    #[error("backend protocol error: {0}")]
    Protocol(String),

    /// The byte stream broke off before the terminal frame arrived.
    #[error("backend disconnected mid-stream: {0}")]
    Disconnected(String),

    /// The operation was interrupted by its cancellation token.
    #[error("backend call cancelled")]
    Cancelled,

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
}

impl BackendError {
    /// Returns `true` for the "model not found" error class (the one the
    /// engine swallows without retry).
    pub fn is_model_missing(&self) -> bool {
        match self {
            BackendError::ModelMissing { .. } => true,
            BackendError::Http(e) => e.status() == Some(reqwest::StatusCode::NOT_FOUND),
            _ => false,
        }
    }
}

/// One model resident on the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalModel {
    pub name: String,
}

/// Opaque accumulated dialogue state for completion mode.
///
/// Returned by the backend after each turn and threaded into the next call.
/// Grows without bound across turns; the engine logs its length each turn.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TurnContext(pub Vec<i64>);

impl TurnContext {
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Handle to a backend-held multi-turn conversation (chat mode).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChatHandle(Uuid);

impl ChatHandle {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ChatHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ChatHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// A single event emitted by a streaming generation call.
#[derive(Debug)]
pub enum GenerationEvent {
    /// A piece of generated output.
    Token(String),
    /// Generation completed normally.  In completion mode `context` carries
    /// the updated conversation context for the next turn.
    Done { context: Option<TurnContext> },
    /// Generation terminated due to a backend error.
    Error(BackendError),
}

/// A handle to a streaming generation response.
///
/// The receiver yields [`GenerationEvent`] items as they are produced.
/// The stream ends with [`GenerationEvent::Done`] or
/// [`GenerationEvent::Error`].
pub type GenerationStream = mpsc::Receiver<GenerationEvent>;

/// Capability contract for a locally hosted inference server.
#[async_trait]
pub trait InferenceBackend: Send + Sync {
    /// List the models currently resident on the backend.
    async fn list_local_models(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Vec<LocalModel>, BackendError>;

    /// Fetch/install a model into the backend, reporting progress as it goes.
    ///
    /// Potentially long-running.  Progress events are best-effort; a closed
    /// `progress` receiver must not abort the pull.
    async fn pull_model(
        &self,
        name: &str,
        progress: mpsc::Sender<PullProgress>,
        cancel: &CancellationToken,
    ) -> Result<(), BackendError>;

    /// Start one streaming completion turn.  `context` is the opaque state
    /// returned by the previous turn's terminal event, if any.
    async fn stream_generate(
        &self,
        model: &str,
        prompt: &str,
        context: Option<TurnContext>,
        cancel: &CancellationToken,
    ) -> Result<GenerationStream, BackendError>;

    /// Open a backend-held conversation for chat mode.
    async fn open_chat(&self, model: &str) -> Result<ChatHandle, BackendError>;

    /// Start one streaming chat turn against a previously opened conversation.
    async fn stream_chat(
        &self,
        handle: &ChatHandle,
        prompt: &str,
        cancel: &CancellationToken,
    ) -> Result<GenerationStream, BackendError>;
}
