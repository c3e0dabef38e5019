//! Console prompt source and delivery sink.
//!
//! A stand-in for the out-of-scope hub transport: prompts arrive as stdin
//! lines (`user: prompt`, or a bare prompt attributed to `local`) and
//! answers stream to stdout per user.  The transport is a terminal, so the
//! monitor always reports connected.

use std::io::Write;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use palaver_core::relay::types::{GenerationChunk, TransportState};
use palaver_core::sink::{DeliverySink, SinkError, TransportMonitor};
use palaver_core::{EngineHandle, RelayError};

/// Streams chunks to stdout, prefixed per user at turn boundaries.
#[derive(Debug, Default)]
pub struct ConsoleSink;

#[async_trait]
impl DeliverySink for ConsoleSink {
    async fn deliver(&self, chunk: &GenerationChunk) -> Result<(), SinkError> {
        let mut out = std::io::stdout().lock();
        let result = if chunk.is_final {
            writeln!(out)
        } else {
            write!(out, "{}", chunk.text).and_then(|()| out.flush())
        };
        result.map_err(|e| SinkError::Transport(e.to_string()))
    }
}

/// The console is always attached.
#[derive(Debug, Default)]
pub struct ConsoleMonitor;

#[async_trait]
impl TransportMonitor for ConsoleMonitor {
    async fn probe(&self) -> TransportState {
        TransportState::Connected
    }
}

/// Read `user: prompt` lines from stdin and feed them to the engine until
/// EOF or shutdown.
pub async fn run(handle: EngineHandle, shutdown: CancellationToken) {
    let stdin = BufReader::new(tokio::io::stdin());
    let mut lines = stdin.lines();

    loop {
        let line = tokio::select! {
            l = lines.next_line() => l,
            _ = shutdown.cancelled() => break,
        };
        let line = match line {
            Ok(Some(l)) => l,
            Ok(None) => break,
            Err(e) => {
                warn!(error = %e, "stdin read failed");
                break;
            }
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let (user, prompt) = match line.split_once(':') {
            Some((user, prompt)) if !user.trim().is_empty() => {
                (user.trim().to_owned(), prompt.trim().to_owned())
            }
            _ => ("local".to_owned(), line.to_owned()),
        };
        info!(user = %user, "prompt received");

        match handle.submit(user, prompt) {
            Ok(()) => {}
            Err(e @ RelayError::QueueFull { .. }) => warn!(error = %e, "prompt rejected"),
            Err(e) => {
                warn!(error = %e, "engine gone; console source stopping");
                break;
            }
        }
    }
    info!("console prompt source stopped");
}
