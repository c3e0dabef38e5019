//! Connectivity cancellation bridge.
//!
//! Owns the turn gate: a single shared [`CancellationToken`] consulted by
//! the engine at turn entry.  Tokens are single-use; once cancelled they can
//! never be un-cancelled, so reconnection swaps in a fresh token.  The swap
//! happens under a `std::sync::Mutex` because readers (turn entry) and the
//! writer (this bridge, driven from the supervisor tick) run concurrently.
//! The lock is never held across an await.

use std::sync::{Arc, Mutex, PoisonError};

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::relay::types::TransportState;

#[derive(Debug)]
struct BridgeInner {
    gate: Mutex<CancellationToken>,
    last_state: Mutex<Option<TransportState>>,
}

/// Watches transport health transitions and cancels/renews the turn gate.
#[derive(Debug, Clone)]
pub struct ConnectivityBridge {
    inner: Arc<BridgeInner>,
}

impl ConnectivityBridge {
    /// Start with a fresh (uncancelled) gate: generation is allowed until
    /// the first observed disconnect.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(BridgeInner {
                gate: Mutex::new(CancellationToken::new()),
                last_state: Mutex::new(None),
            }),
        }
    }

    /// A clone of the current turn gate.
    ///
    /// Holders observe cancellation of the token they cloned; a later swap
    /// does not revive clones of the old token.  A poisoned lock still holds
    /// a valid token, so its state is propagated rather than replaced.
    pub fn current_token(&self) -> CancellationToken {
        self.inner
            .gate
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Feed one observed transport state into the bridge.
    pub fn on_transport_state_changed(&self, state: TransportState) {
        let changed = {
            let mut last = self
                .inner
                .last_state
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            let changed = *last != Some(state);
            *last = Some(state);
            changed
        };

        let mut gate = self
            .inner
            .gate
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        match state {
            TransportState::Connected => {
                if gate.is_cancelled() {
                    *gate = CancellationToken::new();
                    info!("transport reconnected; turn gate renewed");
                } else if changed {
                    info!("transport connected");
                }
            }
            TransportState::Connecting | TransportState::Disconnected => {
                if !gate.is_cancelled() {
                    warn!(%state, "transport down; suspending generation");
                }
                gate.cancel();
            }
        }
    }

    /// Panic while holding the gate lock, leaving it poisoned.
    #[cfg(test)]
    pub(crate) fn poison_gate_lock(&self) {
        let inner = Arc::clone(&self.inner);
        let _ = std::thread::spawn(move || {
            let _guard = inner.gate.lock().unwrap();
            panic!("poisoning gate lock");
        })
        .join();
    }
}

impl Default for ConnectivityBridge {
    fn default() -> Self {
        Self::new()
    }
}
