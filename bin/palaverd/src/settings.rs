//! Daemon configuration, loaded from environment variables at startup.

use std::time::Duration;

use palaver_core::{RelayConfig, RelayMode};

/// Runtime configuration for palaverd.
///
/// Every field except the model name has a sensible default so the daemon
/// works out-of-the-box against a local Ollama.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Base address of the inference backend (default `http://localhost:11434`).
    pub backend_url: String,

    /// Model to serve (default `"llama3"`).
    pub model: String,

    /// Pull the model on startup when absent (default `true`).
    pub must_pull: bool,

    /// `completion` or `chat` (default `completion`).
    pub mode: RelayMode,

    /// Seconds between supervisory ticks (default `5`).
    pub tick_secs: u64,

    /// Seconds between backend-unreachable retries (default `3`).
    pub retry_backoff_secs: u64,

    /// Seconds before idle backend connections are dropped (default `900`).
    pub idle_timeout_secs: u64,

    /// Engine ingress queue capacity (default `64`).
    pub engine_queue: usize,

    /// `tracing` filter string, e.g. `"info"` or `"debug,reqwest=warn"`.
    pub log_level: String,

    /// When `true`, emit log records as newline-delimited JSON.
    pub log_json: bool,
}

impl Settings {
    /// Build [`Settings`] from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self {
            backend_url: env_or("PALAVER_BACKEND_URL", "http://localhost:11434"),
            model: env_or("PALAVER_MODEL", "llama3"),
            must_pull: std::env::var("PALAVER_MUST_PULL")
                .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                .unwrap_or(true),
            mode: parse_env("PALAVER_MODE", RelayMode::Completion),
            tick_secs: parse_env("PALAVER_TICK_SECS", 5),
            retry_backoff_secs: parse_env("PALAVER_RETRY_BACKOFF_SECS", 3),
            idle_timeout_secs: parse_env("PALAVER_IDLE_TIMEOUT_SECS", 900),
            engine_queue: parse_env("PALAVER_ENGINE_QUEUE", 64),
            log_level: env_or("PALAVER_LOG", "info"),
            log_json: std::env::var("PALAVER_LOG_JSON")
                .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                .unwrap_or(false),
        }
    }

    /// The relay-core view of these settings.
    pub fn relay_config(&self) -> RelayConfig {
        let mut config = RelayConfig::new(self.model.clone());
        config.backend_url = self.backend_url.clone();
        config.must_pull = self.must_pull;
        config.mode = self.mode;
        config.supervisor_tick = Duration::from_secs(self.tick_secs);
        config.retry_backoff = Duration::from_secs(self.retry_backoff_secs);
        config.client_idle_timeout = Duration::from_secs(self.idle_timeout_secs);
        config
    }
}

// ── private helpers ──────────────────────────────────────────────────────────

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_owned())
}

fn parse_env<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
