//! palaverd – entry point.
//!
//! Startup order:
//! 1. Parse configuration from environment variables.
//! 2. Initialise structured tracing (JSON optional).
//! 3. Build the Ollama client, session registry, bridge, and engine.
//! 4. Start the readiness supervisor loop in a background task.
//! 5. Serve console prompts until SIGINT/SIGTERM, then shut down.

mod console;
mod settings;

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use palaver_core::backend::InferenceBackend;
use palaver_core::backend::ollama::OllamaClient;
use palaver_core::sink::DeliverySink;
use palaver_core::{ConnectivityBridge, Engine, ReadinessCell, ReadinessSupervisor, SessionRegistry};

use crate::console::{ConsoleMonitor, ConsoleSink};
use crate::settings::Settings;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Configuration ───────────────────────────────────────────────────────
    let settings = Settings::from_env();
    let config = settings.relay_config();

    // ── 2. Tracing ─────────────────────────────────────────────────────────────
    // Build the log-level filter, warning loudly if the configured value is
    // not a valid tracing filter expression.
    let env_filter = match tracing_subscriber::EnvFilter::try_from_default_env() {
        Ok(f) => f,
        Err(_) => match settings.log_level.parse::<tracing_subscriber::EnvFilter>() {
            Ok(f) => f,
            Err(e) => {
                eprintln!(
                    "WARN: PALAVER_LOG='{}' is not a valid tracing filter ({}); \
                     falling back to 'info'",
                    settings.log_level, e
                );
                tracing_subscriber::EnvFilter::new("info")
            }
        },
    };

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(true);

    if settings.log_json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }

    info!(
        version = env!("CARGO_PKG_VERSION"),
        model = %config.model,
        mode = %config.mode,
        backend = %config.backend_url,
        "palaverd starting"
    );

    // ── 3. Relay wiring ────────────────────────────────────────────────────────
    let shutdown = CancellationToken::new();
    let backend: Arc<dyn InferenceBackend> = Arc::new(OllamaClient::new(
        config.backend_url.clone(),
        Some(config.client_idle_timeout),
    ));
    let sink: Arc<dyn DeliverySink> = Arc::new(ConsoleSink);
    let registry = SessionRegistry::new();
    let bridge = ConnectivityBridge::new();
    let readiness = ReadinessCell::new();

    let engine = Engine::new(
        Arc::clone(&backend),
        sink,
        registry.clone(),
        bridge.clone(),
        readiness.clone(),
        &config,
        shutdown.clone(),
    );
    let handle = engine.start(settings.engine_queue);

    // ── 4. Readiness supervisor ────────────────────────────────────────────────
    let supervisor = ReadinessSupervisor::new(
        backend,
        Arc::new(ConsoleMonitor),
        bridge,
        readiness,
        config,
        shutdown.clone(),
    );
    let supervisor_task = tokio::spawn(supervisor.run());

    // ── 5. Console prompt source until shutdown ────────────────────────────────
    let console_shutdown = shutdown.clone();
    let console_task = tokio::spawn(console::run(handle, console_shutdown));

    shutdown_signal().await;
    shutdown.cancel();

    if let Err(e) = supervisor_task.await {
        warn!(error = %e, "supervisor task join failed");
    }
    console_task.abort();

    info!(sessions = registry.len().await, "palaverd stopped");
    Ok(())
}

/// Returns a future that resolves when SIGINT (Ctrl-C) or SIGTERM is received.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to install CTRL+C signal handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut s) => {
                s.recv().await;
            }
            Err(e) => warn!(error = %e, "failed to install SIGTERM handler"),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    info!("shutdown signal received; starting graceful shutdown");
}
