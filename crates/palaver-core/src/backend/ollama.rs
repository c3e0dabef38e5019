//! Ollama HTTP client.
//!
//! Talks to an Ollama-compatible server over its NDJSON streaming API:
//! `/api/tags`, `/api/pull`, `/api/generate`, `/api/chat`.  In chat mode the
//! multi-turn message history is held here, keyed by [`ChatHandle`], so the
//! caller only threads the handle between turns.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde::de::DeserializeOwned;
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::backend::{
    BackendError, ChatHandle, GenerationEvent, GenerationStream, InferenceBackend, LocalModel,
    TurnContext,
};
use crate::relay::types::PullProgress;

#[derive(Debug, Clone, Serialize)]
struct ChatMessage {
    role: &'static str,
    content: String,
}

#[derive(Debug)]
struct ChatSession {
    model: String,
    messages: Vec<ChatMessage>,
}

/// Client for a locally hosted Ollama-compatible inference server.
pub struct OllamaClient {
    http: reqwest::Client,
    base_url: String,
    /// Backend-owned chat histories (chat mode).  One entry per open handle;
    /// entries live for process lifetime, like the sessions that own them.
    chats: Arc<Mutex<HashMap<ChatHandle, ChatSession>>>,
}

impl OllamaClient {
    /// Build a client for `base_url` (e.g. `http://localhost:11434`).
    ///
    /// `idle_timeout` bounds how long pooled connections are kept alive.
    /// Streaming requests themselves carry no overall timeout since a pull
    /// or a long generation may legitimately run for minutes.
    pub fn new(base_url: impl Into<String>, idle_timeout: Option<Duration>) -> Self {
        let mut builder = reqwest::Client::builder();
        if let Some(idle) = idle_timeout {
            builder = builder.pool_idle_timeout(idle);
        }
        Self {
            // The builder only fails on an invalid TLS/proxy setup, which we
            // never configure; fall back to the default client.
            http: builder.build().unwrap_or_default(),
            base_url: base_url.into(),
            chats: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), path)
    }

    /// Issue a request, racing it against the cancellation token.
    async fn send(
        &self,
        req: reqwest::RequestBuilder,
        cancel: &CancellationToken,
    ) -> Result<reqwest::Response, BackendError> {
        tokio::select! {
            r = req.send() => r.map_err(classify),
            _ = cancel.cancelled() => Err(BackendError::Cancelled),
        }
    }
}

/// Map transport-level reqwest errors to [`BackendError::Unreachable`] so the
/// supervisor's retry loop can treat "server down" uniformly.
fn classify(e: reqwest::Error) -> BackendError {
    if e.is_connect() || e.is_timeout() {
        BackendError::Unreachable(e.to_string())
    } else {
        BackendError::Http(e)
    }
}

// ── NDJSON wire frames ───────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct TagsResponse {
    #[serde(default)]
    models: Vec<TagEntry>,
}

#[derive(Debug, Deserialize)]
struct TagEntry {
    name: String,
}

#[derive(Debug, Deserialize)]
struct PullFrame {
    #[serde(default)]
    status: String,
    #[serde(default)]
    total: Option<u64>,
    #[serde(default)]
    completed: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct GenerateFrame {
    #[serde(default)]
    response: String,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    context: Option<Vec<i64>>,
}

#[derive(Debug, Deserialize)]
struct ChatFrame {
    #[serde(default)]
    message: Option<ChatFrameMessage>,
    #[serde(default)]
    done: bool,
}

#[derive(Debug, Deserialize)]
struct ChatFrameMessage {
    #[serde(default)]
    content: String,
}

/// Reassembles NDJSON lines out of a streaming response body.
///
/// Frames can be split across byte chunks, so raw bytes are buffered until a
/// full line is available; decoding happens per whole line, which keeps
/// multi-byte UTF-8 sequences straddling a chunk boundary intact.  Yields
/// `Err(Disconnected)` if the body breaks off mid-stream and
/// `Err(Cancelled)` if the token fires first.
struct NdjsonLines {
    stream: futures::stream::BoxStream<'static, reqwest::Result<bytes::Bytes>>,
    buf: Vec<u8>,
    exhausted: bool,
}

fn parse_line<T: DeserializeOwned>(line: &[u8]) -> Result<Option<T>, BackendError> {
    serde_json::from_slice(line)
        .map(Some)
        .map_err(|e| BackendError::Protocol(format!("bad stream frame: {e}")))
}

impl NdjsonLines {
    fn new(resp: reqwest::Response) -> Self {
        Self::from_stream(resp.bytes_stream().boxed())
    }

    fn from_stream(
        stream: futures::stream::BoxStream<'static, reqwest::Result<bytes::Bytes>>,
    ) -> Self {
        Self {
            stream,
            buf: Vec::new(),
            exhausted: false,
        }
    }

    async fn next_frame<T: DeserializeOwned>(
        &mut self,
        cancel: &CancellationToken,
    ) -> Result<Option<T>, BackendError> {
        loop {
            if let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
                let line: Vec<u8> = self.buf.drain(..=pos).collect();
                if line.iter().all(u8::is_ascii_whitespace) {
                    continue;
                }
                return parse_line(&line);
            }
            if self.exhausted {
                // Trailing partial line without a newline terminator.
                let rest = std::mem::take(&mut self.buf);
                if rest.iter().all(u8::is_ascii_whitespace) {
                    return Ok(None);
                }
                return parse_line(&rest);
            }

            let chunk = tokio::select! {
                c = self.stream.next() => c,
                _ = cancel.cancelled() => return Err(BackendError::Cancelled),
            };
            match chunk {
                Some(Ok(bytes)) => self.buf.extend_from_slice(&bytes),
                Some(Err(e)) => return Err(BackendError::Disconnected(e.to_string())),
                None => self.exhausted = true,
            }
        }
    }
}

#[async_trait]
impl InferenceBackend for OllamaClient {
    async fn list_local_models(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Vec<LocalModel>, BackendError> {
        let resp = self
            .send(self.http.get(self.url("/api/tags")), cancel)
            .await?
            .error_for_status()
            .map_err(BackendError::Http)?;

        let tags: TagsResponse = resp.json().await.map_err(BackendError::Http)?;
        Ok(tags
            .models
            .into_iter()
            .map(|m| LocalModel { name: m.name })
            .collect())
    }

    async fn pull_model(
        &self,
        name: &str,
        progress: mpsc::Sender<PullProgress>,
        cancel: &CancellationToken,
    ) -> Result<(), BackendError> {
        let body = serde_json::json!({ "name": name, "stream": true });
        let resp = self
            .send(self.http.post(self.url("/api/pull")).json(&body), cancel)
            .await?
            .error_for_status()
            .map_err(BackendError::Http)?;

        let mut lines = NdjsonLines::new(resp);
        while let Some(frame) = lines.next_frame::<PullFrame>(cancel).await? {
            let percent = match (frame.completed, frame.total) {
                (Some(c), Some(t)) if t > 0 => (c as f64 / t as f64) * 100.0,
                _ => 0.0,
            };
            // Progress is best-effort; a dropped receiver never aborts the pull.
            let _ = progress
                .send(PullProgress {
                    percent,
                    status: frame.status.clone(),
                })
                .await;
            if frame.status == "success" {
                break;
            }
        }
        Ok(())
    }

    async fn stream_generate(
        &self,
        model: &str,
        prompt: &str,
        context: Option<TurnContext>,
        cancel: &CancellationToken,
    ) -> Result<GenerationStream, BackendError> {
        let body = serde_json::json!({
            "model": model,
            "prompt": prompt,
            "context": context.map(|c| c.0),
            "stream": true,
        });
        let resp = self
            .send(self.http.post(self.url("/api/generate")).json(&body), cancel)
            .await?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(BackendError::ModelMissing {
                model: model.to_owned(),
            });
        }
        let resp = resp.error_for_status().map_err(BackendError::Http)?;

        let (tx, rx) = mpsc::channel(32);
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let mut lines = NdjsonLines::new(resp);
            loop {
                match lines.next_frame::<GenerateFrame>(&cancel).await {
                    Ok(Some(frame)) => {
                        if !frame.response.is_empty() {
                            if tx
                                .send(GenerationEvent::Token(frame.response))
                                .await
                                .is_err()
                            {
                                // Consumer went away; stop reading.
                                return;
                            }
                        }
                        if frame.done {
                            let _ = tx
                                .send(GenerationEvent::Done {
                                    context: frame.context.map(TurnContext),
                                })
                                .await;
                            return;
                        }
                    }
                    Ok(None) => {
                        let _ = tx
                            .send(GenerationEvent::Error(BackendError::Disconnected(
                                "generate stream ended without terminal frame".to_owned(),
                            )))
                            .await;
                        return;
                    }
                    Err(e) => {
                        let _ = tx.send(GenerationEvent::Error(e)).await;
                        return;
                    }
                }
            }
        });
        Ok(rx)
    }

    async fn open_chat(&self, model: &str) -> Result<ChatHandle, BackendError> {
        let handle = ChatHandle::new();
        self.chats.lock().await.insert(
            handle,
            ChatSession {
                model: model.to_owned(),
                messages: Vec::new(),
            },
        );
        debug!(%handle, model, "chat session opened");
        Ok(handle)
    }

    async fn stream_chat(
        &self,
        handle: &ChatHandle,
        prompt: &str,
        cancel: &CancellationToken,
    ) -> Result<GenerationStream, BackendError> {
        let (model, messages) = {
            let mut chats = self.chats.lock().await;
            let session = chats
                .get_mut(handle)
                .ok_or_else(|| BackendError::Protocol(format!("unknown chat handle: {handle}")))?;
            session.messages.push(ChatMessage {
                role: "user",
                content: prompt.to_owned(),
            });
            (session.model.clone(), session.messages.clone())
        };

        let body = serde_json::json!({
            "model": model,
            "messages": messages,
            "stream": true,
        });
        let resp = self
            .send(self.http.post(self.url("/api/chat")).json(&body), cancel)
            .await?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(BackendError::ModelMissing { model });
        }
        let resp = resp.error_for_status().map_err(BackendError::Http)?;

        let (tx, rx) = mpsc::channel(32);
        let cancel = cancel.clone();
        let chats = Arc::clone(&self.chats);
        let handle = *handle;
        tokio::spawn(async move {
            let mut lines = NdjsonLines::new(resp);
            let mut answer = String::new();
            loop {
                match lines.next_frame::<ChatFrame>(&cancel).await {
                    Ok(Some(frame)) => {
                        if let Some(msg) = frame.message {
                            if !msg.content.is_empty() {
                                answer.push_str(&msg.content);
                                if tx
                                    .send(GenerationEvent::Token(msg.content))
                                    .await
                                    .is_err()
                                {
                                    return;
                                }
                            }
                        }
                        if frame.done {
                            // Record the assistant turn so the next call carries it.
                            if let Some(session) = chats.lock().await.get_mut(&handle) {
                                session.messages.push(ChatMessage {
                                    role: "assistant",
                                    content: answer,
                                });
                            }
                            let _ = tx.send(GenerationEvent::Done { context: None }).await;
                            return;
                        }
                    }
                    Ok(None) => {
                        let _ = tx
                            .send(GenerationEvent::Error(BackendError::Disconnected(
                                "chat stream ended without terminal frame".to_owned(),
                            )))
                            .await;
                        return;
                    }
                    Err(e) => {
                        warn!(%handle, error = %e, "chat stream failed");
                        let _ = tx.send(GenerationEvent::Error(e)).await;
                        return;
                    }
                }
            }
        });
        Ok(rx)
    }
}
