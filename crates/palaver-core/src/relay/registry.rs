//! Per-user session registry.
//!
//! Maps a user key to its conversation state and pending-prompt queue.  The
//! registry is the only structure mutated concurrently from multiple logical
//! streams (new users arriving while others stream), so it lives behind a
//! `tokio::sync::RwLock` with narrow async accessors.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use tokio::sync::{Mutex, RwLock};
use tracing::debug;

use crate::backend::{ChatHandle, TurnContext};

/// Maximum queued prompts per user.  A further enqueue while the queue is
/// full is silently discarded (back-pressure by dropping, not blocking).
pub const PENDING_CAPACITY: usize = 3;

#[derive(Debug, Default)]
struct Session {
    /// Prompts received while generation was suspended, oldest first.
    pending: VecDeque<String>,
    /// Completion-mode conversation context from the last finished turn.
    context: Option<TurnContext>,
    /// Chat-mode backend conversation handle, created on first turn.
    chat: Option<ChatHandle>,
    /// Held for the duration of a turn; enforces at most one active
    /// generation per user.
    turn_lock: Arc<Mutex<()>>,
}

/// Registry of all user sessions.
///
/// Sessions are created on the first prompt from a new user and persist for
/// the process lifetime (no eviction).
#[derive(Debug, Clone, Default)]
pub struct SessionRegistry {
    inner: Arc<RwLock<HashMap<String, Session>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a prompt for later replay.  Returns `false` when the user's
    /// queue is already at [`PENDING_CAPACITY`] and the prompt was dropped.
    pub async fn enqueue_prompt(&self, user: &str, prompt: &str) -> bool {
        let mut sessions = self.inner.write().await;
        let session = sessions.entry(user.to_owned()).or_default();
        if session.pending.len() >= PENDING_CAPACITY {
            debug!(user, "pending queue full; prompt dropped");
            return false;
        }
        session.pending.push_back(prompt.to_owned());
        true
    }

    /// Dequeue the oldest pending prompt for a user, if any.
    pub async fn pop_pending(&self, user: &str) -> Option<String> {
        self.inner.write().await.get_mut(user)?.pending.pop_front()
    }

    /// Number of prompts queued for a user.
    pub async fn pending_count(&self, user: &str) -> usize {
        self.inner
            .read()
            .await
            .get(user)
            .map_or(0, |s| s.pending.len())
    }

    /// Snapshot of users with a nonempty queue, in a fixed cyclic order.
    ///
    /// Sorted so that repeated drain passes visit users in the same order;
    /// round-robin fairness comes from taking at most one prompt per user
    /// per pass.
    pub async fn users_with_pending(&self) -> Vec<String> {
        let sessions = self.inner.read().await;
        let mut users: Vec<String> = sessions
            .iter()
            .filter(|(_, s)| !s.pending.is_empty())
            .map(|(u, _)| u.clone())
            .collect();
        users.sort();
        users
    }

    /// The per-session turn lock, creating the session if needed.
    pub async fn turn_lock(&self, user: &str) -> Arc<Mutex<()>> {
        let mut sessions = self.inner.write().await;
        Arc::clone(&sessions.entry(user.to_owned()).or_default().turn_lock)
    }

    /// Completion-mode context stored by the last finished turn.
    pub async fn context(&self, user: &str) -> Option<TurnContext> {
        self.inner.read().await.get(user)?.context.clone()
    }

    /// Replace the stored completion-mode context after a finished turn.
    pub async fn set_context(&self, user: &str, context: TurnContext) {
        let mut sessions = self.inner.write().await;
        sessions.entry(user.to_owned()).or_default().context = Some(context);
    }

    /// Chat-mode conversation handle, if one has been opened.
    pub async fn chat_handle(&self, user: &str) -> Option<ChatHandle> {
        self.inner.read().await.get(user)?.chat
    }

    /// Record the chat handle opened for a user.
    pub async fn set_chat_handle(&self, user: &str, handle: ChatHandle) {
        let mut sessions = self.inner.write().await;
        sessions.entry(user.to_owned()).or_default().chat = Some(handle);
    }

    /// Number of live sessions.  Sessions are never evicted, so this only
    /// grows; exposed so an operator can watch it.
    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.is_empty()
    }
}
