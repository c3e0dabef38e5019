//! Delivery and transport-health capability contracts.
//!
//! The relay treats the outbound transport abstractly: chunks go out through
//! a [`DeliverySink`] and connectivity is observed through a
//! [`TransportMonitor`].  The concrete hub/socket wiring lives with the
//! embedding application.

use async_trait::async_trait;
use thiserror::Error;
use tracing::info;

use crate::relay::types::{GenerationChunk, TransportState};

/// Errors produced by a delivery sink.
///
/// Delivery failures are logged by the engine and never retried; the turn is
/// not requeued.
#[derive(Debug, Error)]
pub enum SinkError {
    /// No active connection is registered for the user.
    #[error("no connection registered for user: {user}")]
    NoConnection { user: String },

    /// The transport rejected the write.
    #[error("transport error: {0}")]
    Transport(String),
}

/// Delivers generation chunks to the originating user.
#[async_trait]
pub trait DeliverySink: Send + Sync {
    async fn deliver(&self, chunk: &GenerationChunk) -> Result<(), SinkError>;
}

/// Reports the current health of the outbound transport.
///
/// Polled once per supervisory tick; the result drives the
/// [`ConnectivityBridge`](crate::relay::bridge::ConnectivityBridge).
#[async_trait]
pub trait TransportMonitor: Send + Sync {
    async fn probe(&self) -> TransportState;
}

/// A sink that only emits chunks to the log.  Useful as a stand-in while no
/// real transport is wired up.
#[derive(Debug, Default)]
pub struct TracingSink;

#[async_trait]
impl DeliverySink for TracingSink {
    async fn deliver(&self, chunk: &GenerationChunk) -> Result<(), SinkError> {
        info!(
            user = %chunk.user,
            text = %chunk.text,
            is_final = chunk.is_final,
            "chunk delivered"
        );
        Ok(())
    }
}
