#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::{Duration, Instant};

    use async_trait::async_trait;
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;
    use tracing_test::traced_test;

    use crate::backend::{
        BackendError, ChatHandle, GenerationEvent, GenerationStream, InferenceBackend, LocalModel,
        TurnContext,
    };
    use crate::config::{RelayConfig, RelayMode};
    use crate::relay::bridge::ConnectivityBridge;
    use crate::relay::engine::{Engine, EngineHandle, PromptEnvelope};
    use crate::relay::registry::{PENDING_CAPACITY, SessionRegistry};
    use crate::relay::supervisor::{ReadinessCell, ReadinessSupervisor};
    use crate::relay::types::{GenerationChunk, PullProgress, RelayError, TransportState};
    use crate::sink::{DeliverySink, SinkError, TracingSink, TransportMonitor};

    // ── Scripted fakes ────────────────────────────────────────────────────────

    /// Scriptable in-memory inference backend.
    #[derive(Default)]
    struct FakeBackend {
        /// Models the backend reports as locally resident.
        models: Mutex<Vec<LocalModel>>,
        /// Total "list local models" calls observed.
        list_calls: AtomicUsize,
        /// Fail this many list calls with `Unreachable` before succeeding.
        list_failures: AtomicUsize,
        /// Pull invocations, by requested model name.
        pulls: Mutex<Vec<String>>,
        /// Error to return from the next pull, if any.
        pull_error: Mutex<Option<BackendError>>,
        /// Model name to add to `models` after a successful pull.
        add_on_pull: Mutex<Option<String>>,
        /// Prompts passed to streaming calls, in invocation order.
        prompts: Mutex<Vec<String>>,
        /// Readiness cell to mark not-ready when the next generation starts,
        /// simulating a supervisor losing the backend mid-drain.
        unready_on_generate: Mutex<Option<ReadinessCell>>,
        /// Contexts passed to `stream_generate`, in invocation order.
        contexts: Mutex<Vec<Option<TurnContext>>>,
        /// `open_chat` invocations.
        chats_opened: AtomicUsize,
        /// Handles passed to `stream_chat`, in invocation order.
        chat_handles: Mutex<Vec<ChatHandle>>,
    }

    #[async_trait]
    impl InferenceBackend for FakeBackend {
        async fn list_local_models(
            &self,
            _cancel: &CancellationToken,
        ) -> Result<Vec<LocalModel>, BackendError> {
            self.list_calls.fetch_add(1, Ordering::SeqCst);
            if self.list_failures.load(Ordering::SeqCst) > 0 {
                self.list_failures.fetch_sub(1, Ordering::SeqCst);
                return Err(BackendError::Unreachable("connection refused".to_owned()));
            }
            Ok(self.models.lock().unwrap().clone())
        }

        async fn pull_model(
            &self,
            name: &str,
            progress: mpsc::Sender<PullProgress>,
            _cancel: &CancellationToken,
        ) -> Result<(), BackendError> {
            self.pulls.lock().unwrap().push(name.to_owned());
            if let Some(e) = self.pull_error.lock().unwrap().take() {
                return Err(e);
            }
            for percent in [0.0, 50.0, 100.0] {
                let _ = progress
                    .send(PullProgress {
                        percent,
                        status: "downloading".to_owned(),
                    })
                    .await;
            }
            if let Some(name) = self.add_on_pull.lock().unwrap().clone() {
                self.models.lock().unwrap().push(LocalModel { name });
            }
            Ok(())
        }

        async fn stream_generate(
            &self,
            _model: &str,
            prompt: &str,
            context: Option<TurnContext>,
            _cancel: &CancellationToken,
        ) -> Result<GenerationStream, BackendError> {
            self.prompts.lock().unwrap().push(prompt.to_owned());
            self.contexts.lock().unwrap().push(context.clone());
            let unready = self.unready_on_generate.lock().unwrap().take();
            if let Some(cell) = unready {
                cell.update(|s| s.loaded_model = None).await;
            }

            let words: Vec<String> = prompt.split_whitespace().map(str::to_owned).collect();
            let next_len = context.map_or(0, |c| c.len()) + 1;
            let (tx, rx) = mpsc::channel(8);
            tokio::spawn(async move {
                for word in words {
                    let _ = tx.send(GenerationEvent::Token(word)).await;
                }
                let _ = tx
                    .send(GenerationEvent::Done {
                        context: Some(TurnContext(vec![0; next_len])),
                    })
                    .await;
            });
            Ok(rx)
        }

        async fn open_chat(&self, _model: &str) -> Result<ChatHandle, BackendError> {
            self.chats_opened.fetch_add(1, Ordering::SeqCst);
            Ok(ChatHandle::new())
        }

        async fn stream_chat(
            &self,
            handle: &ChatHandle,
            prompt: &str,
            _cancel: &CancellationToken,
        ) -> Result<GenerationStream, BackendError> {
            self.prompts.lock().unwrap().push(prompt.to_owned());
            self.chat_handles.lock().unwrap().push(*handle);

            let prompt = prompt.to_owned();
            let (tx, rx) = mpsc::channel(8);
            tokio::spawn(async move {
                let _ = tx.send(GenerationEvent::Token(prompt)).await;
                let _ = tx.send(GenerationEvent::Done { context: None }).await;
            });
            Ok(rx)
        }
    }

    /// Records every delivered chunk.
    #[derive(Default)]
    struct RecordingSink {
        chunks: Mutex<Vec<GenerationChunk>>,
    }

    impl RecordingSink {
        fn chunks(&self) -> Vec<GenerationChunk> {
            self.chunks.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl DeliverySink for RecordingSink {
        async fn deliver(&self, chunk: &GenerationChunk) -> Result<(), SinkError> {
            self.chunks.lock().unwrap().push(chunk.clone());
            Ok(())
        }
    }

    /// Monitor that always reports the same state.
    struct StaticMonitor(TransportState);

    #[async_trait]
    impl TransportMonitor for StaticMonitor {
        async fn probe(&self) -> TransportState {
            self.0
        }
    }

    // ── Harness ───────────────────────────────────────────────────────────────

    struct Harness {
        engine: Engine,
        backend: Arc<FakeBackend>,
        sink: Arc<RecordingSink>,
        registry: SessionRegistry,
        bridge: ConnectivityBridge,
        readiness: ReadinessCell,
    }

    fn test_config(mode: RelayMode) -> RelayConfig {
        let mut config = RelayConfig::new("llama3");
        config.mode = mode;
        // Shrink timings so retry tests run in milliseconds, not seconds.
        config.retry_backoff = Duration::from_millis(20);
        config.supervisor_tick = Duration::from_millis(20);
        config
    }

    async fn harness(mode: RelayMode) -> Harness {
        let backend = Arc::new(FakeBackend::default());
        let sink = Arc::new(RecordingSink::default());
        let registry = SessionRegistry::new();
        let bridge = ConnectivityBridge::new();
        let readiness = ReadinessCell::new();
        readiness
            .update(|s| {
                s.backend_reachable = true;
                s.loaded_model = Some("llama3".to_owned());
            })
            .await;

        let engine = Engine::new(
            Arc::clone(&backend) as Arc<dyn InferenceBackend>,
            Arc::clone(&sink) as Arc<dyn DeliverySink>,
            registry.clone(),
            bridge.clone(),
            readiness.clone(),
            &test_config(mode),
            CancellationToken::new(),
        );
        Harness {
            engine,
            backend,
            sink,
            registry,
            bridge,
            readiness,
        }
    }

    fn supervisor(backend: Arc<FakeBackend>, model: &str) -> ReadinessSupervisor {
        let mut config = test_config(RelayMode::Completion);
        config.model = model.to_owned();
        ReadinessSupervisor::new(
            backend,
            Arc::new(StaticMonitor(TransportState::Connected)),
            ConnectivityBridge::new(),
            ReadinessCell::new(),
            config,
            CancellationToken::new(),
        )
    }

    // ── Registry tests ────────────────────────────────────────────────────────

    #[tokio::test]
    async fn registry_drops_fourth_pending_prompt() {
        let registry = SessionRegistry::new();
        assert!(registry.enqueue_prompt("alice", "p1").await);
        assert!(registry.enqueue_prompt("alice", "p2").await);
        assert!(registry.enqueue_prompt("alice", "p3").await);
        assert!(
            !registry.enqueue_prompt("alice", "p4").await,
            "fourth enqueue should be dropped"
        );
        assert_eq!(registry.pending_count("alice").await, PENDING_CAPACITY);
    }

    #[tokio::test]
    async fn registry_round_robin_drain_order() {
        let registry = SessionRegistry::new();
        for prompt in ["a1", "a2"] {
            registry.enqueue_prompt("alice", prompt).await;
        }
        registry.enqueue_prompt("bob", "b1").await;
        for prompt in ["c1", "c2", "c3"] {
            registry.enqueue_prompt("carol", prompt).await;
        }

        // One prompt per user per pass, passes repeating until empty.
        let mut drained = Vec::new();
        loop {
            let users = registry.users_with_pending().await;
            if users.is_empty() {
                break;
            }
            for user in users {
                if let Some(prompt) = registry.pop_pending(&user).await {
                    drained.push(prompt);
                }
            }
        }
        assert_eq!(drained, ["a1", "b1", "c1", "a2", "c2", "c3"]);
    }

    // ── Supervisor tests ──────────────────────────────────────────────────────

    #[tokio::test]
    async fn ensure_ready_short_circuits_on_cached_model() {
        let backend = Arc::new(FakeBackend::default());
        backend.models.lock().unwrap().push(LocalModel {
            name: "llama3:8b".to_owned(),
        });
        let sup = supervisor(Arc::clone(&backend), "llama3");

        let first = sup.ensure_ready(false).await.expect("first pass");
        assert!(first.is_ready());
        assert_eq!(backend.list_calls.load(Ordering::SeqCst), 1);

        let second = sup.ensure_ready(false).await.expect("second pass");
        assert!(second.is_ready());
        assert_eq!(
            backend.list_calls.load(Ordering::SeqCst),
            1,
            "cached model name should short-circuit the second pass"
        );
    }

    #[tokio::test]
    async fn ensure_ready_retries_while_backend_down() {
        let backend = Arc::new(FakeBackend::default());
        backend.models.lock().unwrap().push(LocalModel {
            name: "llama3:8b".to_owned(),
        });
        backend.list_failures.store(2, Ordering::SeqCst);
        let sup = supervisor(Arc::clone(&backend), "llama3");

        let started = Instant::now();
        let state = sup.ensure_ready(false).await.expect("should succeed");
        assert!(state.is_ready());
        assert_eq!(
            backend.list_calls.load(Ordering::SeqCst),
            3,
            "two failures then one success"
        );
        assert!(
            started.elapsed() >= Duration::from_millis(40),
            "two retries should each wait one backoff"
        );
    }

    #[tokio::test]
    async fn ensure_ready_prefix_match_issues_no_pull() {
        let backend = Arc::new(FakeBackend::default());
        backend.models.lock().unwrap().push(LocalModel {
            name: "llama3:8b".to_owned(),
        });
        let sup = supervisor(Arc::clone(&backend), "llama3");

        let state = sup.ensure_ready(true).await.expect("should succeed");
        assert_eq!(state.loaded_model.as_deref(), Some("llama3"));
        assert!(backend.pulls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn ensure_ready_without_pull_reports_not_ready() {
        let backend = Arc::new(FakeBackend::default());
        let sup = supervisor(Arc::clone(&backend), "llama3");

        let state = sup.ensure_ready(false).await.expect("should succeed");
        assert!(state.backend_reachable);
        assert!(!state.is_ready());
        assert!(backend.pulls.lock().unwrap().is_empty());
    }

    #[traced_test]
    #[tokio::test]
    async fn ensure_ready_pulls_absent_model_and_reverifies() {
        let backend = Arc::new(FakeBackend::default());
        // Post-pull listing reports a different case; the re-check matches
        // case-insensitively.
        *backend.add_on_pull.lock().unwrap() = Some("LLaMA3".to_owned());
        let sup = supervisor(Arc::clone(&backend), "llama3");

        let state = sup.ensure_ready(true).await.expect("should succeed");
        assert_eq!(state.loaded_model.as_deref(), Some("llama3"));
        assert!(!state.pull_in_progress);
        assert_eq!(*backend.pulls.lock().unwrap(), ["llama3"]);
        // Progress must be forwarded in the order the pull reports it, with
        // percentages never going backwards.
        logs_assert(|lines: &[&str]| {
            let percents: Vec<i64> = lines
                .iter()
                .filter(|l| l.contains("pull progress"))
                .filter_map(|l| {
                    l.split("percent=")
                        .nth(1)
                        .and_then(|rest| rest.split_whitespace().next())
                        .and_then(|p| p.parse().ok())
                })
                .collect();
            if percents != [0, 50, 100] {
                return Err(format!("unexpected progress sequence: {percents:?}"));
            }
            if percents.windows(2).any(|w| w[1] < w[0]) {
                return Err(format!("progress went backwards: {percents:?}"));
            }
            Ok(())
        });
    }

    #[tokio::test]
    async fn ensure_ready_pull_leaving_model_absent_is_not_an_error() {
        let backend = Arc::new(FakeBackend::default());
        // Pull "succeeds" but never makes the model appear.
        let sup = supervisor(Arc::clone(&backend), "llama3");

        let state = sup.ensure_ready(true).await.expect("should not error");
        assert!(state.loaded_model.is_none());
        assert!(!state.pull_in_progress);
        assert_eq!(*backend.pulls.lock().unwrap(), ["llama3"]);
    }

    #[tokio::test]
    async fn pull_interrupted_by_disconnect_resets_cached_model() {
        let backend = Arc::new(FakeBackend::default());
        *backend.pull_error.lock().unwrap() = Some(BackendError::Disconnected(
            "connection reset".to_owned(),
        ));
        let sup = supervisor(Arc::clone(&backend), "llama3");

        let state = sup.ensure_ready(true).await.expect("should not error");
        assert!(state.loaded_model.is_none());
        assert!(
            !state.backend_reachable,
            "disconnect mid-pull should force re-verification next tick"
        );
        assert!(!state.pull_in_progress);
    }

    // ── Engine tests ──────────────────────────────────────────────────────────

    #[tokio::test]
    async fn chunks_delivered_in_order_with_final_marker() {
        let h = harness(RelayMode::Completion).await;
        h.engine
            .stream_turn("alice", "hello brave world")
            .await
            .expect("turn should succeed");

        let chunks = h.sink.chunks();
        let texts: Vec<&str> = chunks.iter().map(|c| c.text.as_str()).collect();
        assert_eq!(texts, ["hello", "brave", "world", ""]);
        assert!(chunks.iter().all(|c| c.user == "alice"));
        assert!(chunks.last().unwrap().is_final, "last chunk must be final");
        assert!(
            chunks[..chunks.len() - 1].iter().all(|c| !c.is_final),
            "only the last chunk may be final"
        );
    }

    #[tokio::test]
    async fn completion_context_threads_between_turns() {
        let h = harness(RelayMode::Completion).await;
        h.engine.stream_turn("alice", "one").await.unwrap();
        h.engine.stream_turn("alice", "two").await.unwrap();

        let contexts = h.backend.contexts.lock().unwrap().clone();
        assert_eq!(contexts.len(), 2);
        assert!(contexts[0].is_none(), "first turn starts with no context");
        assert_eq!(
            contexts[1].as_ref().map(|c| c.len()),
            Some(1),
            "second turn must carry the context produced by the first"
        );
    }

    #[tokio::test]
    async fn chat_mode_opens_one_conversation_per_user() {
        let h = harness(RelayMode::Chat).await;
        h.engine.stream_turn("alice", "hi").await.unwrap();
        h.engine.stream_turn("alice", "again").await.unwrap();

        assert_eq!(h.backend.chats_opened.load(Ordering::SeqCst), 1);
        let handles = h.backend.chat_handles.lock().unwrap().clone();
        assert_eq!(handles.len(), 2);
        assert_eq!(handles[0], handles[1], "both turns reuse the same handle");
        assert!(h.registry.chat_handle("alice").await.is_some());
    }

    #[tokio::test]
    async fn cancelled_gate_queues_instead_of_generating() {
        let h = harness(RelayMode::Completion).await;
        h.bridge
            .on_transport_state_changed(TransportState::Disconnected);

        h.engine.stream_turn("alice", "p1").await.unwrap();
        assert!(h.backend.prompts.lock().unwrap().is_empty());
        assert_eq!(h.registry.pending_count("alice").await, 1);
    }

    #[tokio::test]
    async fn backend_not_ready_queues_instead_of_generating() {
        let h = harness(RelayMode::Completion).await;
        h.readiness.update(|s| s.loaded_model = None).await;

        h.engine.stream_turn("alice", "p1").await.unwrap();
        assert!(h.backend.prompts.lock().unwrap().is_empty());
        assert_eq!(h.registry.pending_count("alice").await, 1);
    }

    #[tokio::test]
    async fn reconnect_drains_backlog_round_robin_before_new_prompt() {
        let h = harness(RelayMode::Completion).await;
        h.bridge
            .on_transport_state_changed(TransportState::Disconnected);

        h.engine.stream_turn("alice", "a1").await.unwrap();
        h.engine.stream_turn("bob", "b1").await.unwrap();
        h.engine.stream_turn("alice", "a2").await.unwrap();
        assert!(h.backend.prompts.lock().unwrap().is_empty());

        h.bridge.on_transport_state_changed(TransportState::Connected);
        h.engine.stream_turn("alice", "a3").await.unwrap();

        // One prompt per user per pass, then the freshly submitted prompt.
        let prompts = h.backend.prompts.lock().unwrap().clone();
        assert_eq!(prompts, ["a1", "b1", "a2", "a3"]);
        assert_eq!(h.registry.pending_count("alice").await, 0);
        assert_eq!(h.registry.pending_count("bob").await, 0);
    }

    #[tokio::test]
    async fn readiness_lapse_mid_drain_queues_fresh_prompt() {
        let h = harness(RelayMode::Completion).await;
        h.registry.enqueue_prompt("alice", "a1").await;
        // The backlog turn knocks readiness out, as a supervisor tick would
        // after losing the backend mid-drain.
        *h.backend.unready_on_generate.lock().unwrap() = Some(h.readiness.clone());

        h.engine.stream_turn("bob", "b1").await.unwrap();

        let prompts = h.backend.prompts.lock().unwrap().clone();
        assert_eq!(prompts, ["a1"], "only the backlog turn may generate");
        assert_eq!(
            h.registry.pending_count("bob").await,
            1,
            "the fresh prompt must wait for readiness to return"
        );
    }

    #[traced_test]
    #[tokio::test]
    async fn turn_completion_logs_accumulated_answer() {
        let h = harness(RelayMode::Completion).await;
        h.engine
            .stream_turn("alice", "hello brave world")
            .await
            .unwrap();

        logs_assert(|lines: &[&str]| {
            match lines.iter().find(|l| l.contains("turn complete")) {
                Some(l) if l.contains("answer=hellobraveworld") => Ok(()),
                Some(l) => Err(format!("turn log lacks the accumulated answer: {l}")),
                None => Err("no turn completion log".to_owned()),
            }
        });
    }

    #[tokio::test]
    async fn engine_start_serves_submitted_prompts() {
        let h = harness(RelayMode::Completion).await;
        let handle = h.engine.start(8);
        handle.submit("alice", "hi there").expect("submit");

        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if h.sink.chunks().iter().any(|c| c.is_final) {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("submitted prompt should be served within 2 s");

        let texts: Vec<String> = h.sink.chunks().iter().map(|c| c.text.clone()).collect();
        assert_eq!(texts, ["hi", "there", ""]);
    }

    #[tokio::test]
    async fn submit_on_full_ingress_queue_returns_queue_full() {
        // A handle whose receiver is never drained: the first submit fills
        // the single slot, the second must surface QueueFull.
        let (tx, _rx) = mpsc::channel::<PromptEnvelope>(1);
        let handle = EngineHandle::new(tx);

        handle.submit("alice", "p1").expect("first submit fits");
        let err = handle.submit("alice", "p2").unwrap_err();
        assert!(
            matches!(err, RelayError::QueueFull { capacity: 1 }),
            "expected QueueFull, got {err:?}"
        );
    }

    // ── Bridge tests ──────────────────────────────────────────────────────────

    #[tokio::test]
    async fn bridge_swaps_in_fresh_token_on_reconnect() {
        let bridge = ConnectivityBridge::new();
        let original = bridge.current_token();
        assert!(!original.is_cancelled());

        bridge.on_transport_state_changed(TransportState::Disconnected);
        assert!(original.is_cancelled(), "disconnect cancels the live token");

        bridge.on_transport_state_changed(TransportState::Connected);
        let renewed = bridge.current_token();
        assert!(!renewed.is_cancelled(), "reconnect issues a fresh token");
        assert!(
            original.is_cancelled(),
            "tokens are single-use; in-flight clones of the old one stay cancelled"
        );
    }

    #[tokio::test]
    async fn bridge_reconnect_without_prior_cancel_keeps_token() {
        let bridge = ConnectivityBridge::new();
        let before = bridge.current_token();
        bridge.on_transport_state_changed(TransportState::Connected);
        // Still the same uncancelled gate; no spurious swap.
        assert!(!before.is_cancelled());
        assert!(!bridge.current_token().is_cancelled());
    }

    #[tokio::test]
    async fn bridge_poisoned_lock_keeps_gate_state() {
        let bridge = ConnectivityBridge::new();
        bridge.on_transport_state_changed(TransportState::Disconnected);
        bridge.poison_gate_lock();

        assert!(
            bridge.current_token().is_cancelled(),
            "a poisoned lock must not fabricate an uncancelled gate"
        );
        // The bridge keeps working after the poison.
        bridge.on_transport_state_changed(TransportState::Connected);
        assert!(!bridge.current_token().is_cancelled());
    }

    // ── Sink tests ────────────────────────────────────────────────────────────

    #[traced_test]
    #[tokio::test]
    async fn tracing_sink_logs_chunks() {
        let sink = TracingSink;
        sink.deliver(&GenerationChunk {
            user: "alice".to_owned(),
            text: "hi".to_owned(),
            is_final: false,
        })
        .await
        .expect("tracing sink never fails");
        assert!(logs_contain("chunk delivered"));
    }
}
