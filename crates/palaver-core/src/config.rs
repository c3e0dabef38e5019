//! Programmatic relay configuration.

use std::time::Duration;

use strum::{Display, EnumString};

/// Where conversation state lives between turns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Display, EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum RelayMode {
    /// Stateless per call; the opaque context is threaded turn-to-turn by
    /// the engine.
    #[default]
    Completion,
    /// The backend owns multi-turn history, keyed by a chat handle created
    /// once per user and reused.
    Chat,
}

/// Configuration for the relay core.
///
/// Every field except `model` has a sensible default so embedders only have
/// to name the model they serve.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Base address of the inference backend (default `http://localhost:11434`).
    pub backend_url: String,

    /// Name of the model to serve.  Readiness is matched by prefix against
    /// the backend's local model list (`"llama3"` matches `"llama3:8b"`).
    pub model: String,

    /// Pull the model when it is absent.  When `false` the supervisor
    /// reports not-ready and the relay proceeds without serving.
    pub must_pull: bool,

    /// Conversation-state placement.
    pub mode: RelayMode,

    /// Interval between supervisory ticks (readiness + transport probe).
    pub supervisor_tick: Duration,

    /// Backoff between "list local models" retries while the backend is
    /// unreachable.
    pub retry_backoff: Duration,

    /// Idle timeout for pooled backend connections.
    pub client_idle_timeout: Duration,
}

impl RelayConfig {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            backend_url: "http://localhost:11434".to_owned(),
            model: model.into(),
            must_pull: true,
            mode: RelayMode::Completion,
            supervisor_tick: Duration::from_secs(5),
            retry_backoff: Duration::from_secs(3),
            client_idle_timeout: Duration::from_secs(15 * 60),
        }
    }
}
