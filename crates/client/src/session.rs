use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{Duration, sleep};

use salon_chat::{
    BotMessage, ChatMessage, CitationStore, ConversationId, ConversationStore, FoldStep,
    LiveMessage, StreamFold, StreamSessionId, StreamState, StreamTransition, StreamingStore,
    UserMessage, should_update_title,
};
use salon_transport::{
    ChatEventStream, ChatRequest, ChatTransport, DeploymentHeaders, StreamMode, ToolSpec,
    TransportError,
};

use crate::params::{ChatOverrides, ChatParams, DEFAULT_AGENT_TOOLS, ParamsStore};
use crate::settings::{DEFAULT_TITLE_REVEAL_DELAY_MS, DEFAULT_TYPING_VELOCITY_MS};

/// Generic annotation shown next to failed requests.
pub const USER_ERROR_MESSAGE: &str = "Something went wrong. This has been reported. ";
const FALLBACK_ERROR_MESSAGE: &str =
    "Unable to generate a response since an error was encountered.";

/// Timing knobs for the conversation-title typing animation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TitleTimings {
    pub reveal_delay: Duration,
    pub typing_interval: Duration,
}

impl Default for TitleTimings {
    fn default() -> Self {
        Self {
            reveal_delay: Duration::from_millis(DEFAULT_TITLE_REVEAL_DELAY_MS),
            typing_interval: Duration::from_millis(DEFAULT_TYPING_VELOCITY_MS),
        }
    }
}

/// What a submit call did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    Started,
    /// Whitespace-only input is never sent.
    EmptyMessage,
    /// One stream per conversation view; submits during streaming are no-ops.
    AlreadyStreaming,
    /// Retry/regenerate found no user message to resend.
    NothingToResend,
}

/// The stores the session publishes into, injected rather than ambient.
pub struct SessionStores {
    pub conversation: Arc<dyn ConversationStore>,
    pub citations: Arc<dyn CitationStore>,
    pub streaming: Arc<dyn StreamingStore>,
}

/// Session-level configuration.
#[derive(Debug, Clone, Default)]
pub struct SessionConfig {
    pub agent_id: Option<String>,
    pub title_timings: Option<TitleTimings>,
}

struct SessionState {
    stream: StreamState,
    next_session: u64,
    reader: Option<JoinHandle<()>>,
    worker: Option<JoinHandle<()>>,
    title: Option<JoinHandle<()>>,
}

struct SessionInner {
    transport: Arc<dyn ChatTransport>,
    conversation: Arc<dyn ConversationStore>,
    citations: Arc<dyn CitationStore>,
    streaming: Arc<dyn StreamingStore>,
    params: Arc<ParamsStore>,
    agent_id: Option<String>,
    title_timings: TitleTimings,
    state: Mutex<SessionState>,
    idle: Notify,
}

/// Orchestrates one conversation view's streams: submit guard, fold-to-store
/// plumbing, stop/retry/regenerate, failure mapping, and the title refresh.
pub struct ChatSession {
    inner: Arc<SessionInner>,
}

impl ChatSession {
    pub fn new(
        transport: Arc<dyn ChatTransport>,
        stores: SessionStores,
        params: Arc<ParamsStore>,
        config: SessionConfig,
    ) -> Self {
        Self {
            inner: Arc::new(SessionInner {
                transport,
                conversation: stores.conversation,
                citations: stores.citations,
                streaming: stores.streaming,
                params,
                agent_id: config.agent_id,
                title_timings: config.title_timings.unwrap_or_default(),
                state: Mutex::new(SessionState {
                    stream: StreamState::Idle,
                    next_session: 1,
                    reader: None,
                    worker: None,
                    title: None,
                }),
                idle: Notify::new(),
            }),
        }
    }

    /// Sends one user message, streaming the response into the stores.
    pub fn send_message(&self, text: impl AsRef<str>) -> SubmitOutcome {
        self.send_message_with(text, ChatOverrides::default())
    }

    pub fn send_message_with(&self, text: impl AsRef<str>, overrides: ChatOverrides) -> SubmitOutcome {
        let message = text.as_ref().trim();
        if message.is_empty() {
            return SubmitOutcome::EmptyMessage;
        }
        self.inner
            .clone()
            .start_stream(Some(message.to_string()), StreamMode::Chat, None, overrides)
    }

    /// Re-submits the most recent user message after stripping the failed or
    /// aborted tail of the conversation.
    pub fn retry(&self) -> SubmitOutcome {
        let messages = self.inner.conversation.snapshot().messages;
        let Some(last) = messages.last() else {
            return SubmitOutcome::NothingToResend;
        };

        let (text, base) = match last {
            // Last message is an annotated user message: strip it and resend.
            ChatMessage::User(user) => {
                (user.text.clone(), messages[..messages.len() - 1].to_vec())
            }
            // Last message is an aborted/errored bot message: strip it and
            // the user message that triggered it.
            ChatMessage::Bot(_) => {
                if messages.len() < 2 {
                    return SubmitOutcome::NothingToResend;
                }
                let ChatMessage::User(user) = &messages[messages.len() - 2] else {
                    return SubmitOutcome::NothingToResend;
                };
                (user.text.clone(), messages[..messages.len() - 2].to_vec())
            }
        };

        self.inner.clone().start_stream(
            Some(text),
            StreamMode::Chat,
            Some(base),
            ChatOverrides::default(),
        )
    }

    /// Regenerates the response to the last user message, discarding every
    /// message after it. The user message itself is kept untouched.
    pub fn regenerate(&self) -> SubmitOutcome {
        let messages = self.inner.conversation.snapshot().messages;
        let Some(last_user) = messages.iter().rposition(ChatMessage::is_user) else {
            return SubmitOutcome::NothingToResend;
        };

        self.inner.clone().start_stream(
            None,
            StreamMode::Regenerate,
            Some(messages[..=last_user].to_vec()),
            ChatOverrides::default(),
        )
    }

    /// User-initiated stop: synthesizes an aborted message from the
    /// accumulated text and tears the stream down without waiting for
    /// further events.
    pub fn stop(&self) {
        let Some(session) = self.inner.teardown_active_stream(StreamTransition::Abort) else {
            return;
        };

        let aborted = match self.inner.streaming.current() {
            Some(live) => {
                let mut message = BotMessage::aborted(live.text);
                message.generation_id = live.generation_id;
                message.citations = live.citations;
                message.tool_events = live.tool_events;
                message
            }
            None => BotMessage::aborted(String::new()),
        };

        let mut messages = self.inner.conversation.snapshot().messages;
        messages.push(ChatMessage::Bot(aborted));
        self.inner.conversation.replace_messages(messages);
        self.inner.streaming.clear();
        self.inner.conversation.set_pending(None);
        self.inner.idle.notify_waiters();
        tracing::info!(session = session.0, "stream aborted by user");
    }

    /// Activates another conversation: cancels any in-flight stream and
    /// resets the per-conversation stores.
    pub fn switch_conversation(&self, id: Option<ConversationId>) {
        let _ = self.inner.teardown_active_stream(StreamTransition::Abort);
        {
            let mut state = self.inner.lock_state();
            if let Some(title) = state.title.take() {
                title.abort();
            }
        }
        self.inner.streaming.clear();
        self.inner.conversation.set_pending(None);
        self.inner.citations.reset();
        self.inner.conversation.switch_to(id);
        self.inner.idle.notify_waiters();
    }

    pub fn is_streaming(&self) -> bool {
        self.inner.lock_state().stream.active_session().is_some()
    }

    /// Resolves once no stream is active.
    pub async fn wait_for_idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            if !self.is_streaming() {
                return;
            }
            notified.await;
        }
    }

    /// Waits for a pending title refresh to finish, if one is running.
    pub async fn wait_for_title(&self) {
        let handle = self.inner.lock_state().title.take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

impl Drop for ChatSession {
    fn drop(&mut self) {
        // Component teardown cancels the in-flight stream and animations.
        let mut state = self.inner.lock_state();
        for handle in [
            state.reader.take(),
            state.worker.take(),
            state.title.take(),
        ]
        .into_iter()
        .flatten()
        {
            handle.abort();
        }
    }
}

impl SessionInner {
    fn lock_state(&self) -> std::sync::MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn accepts(&self, session: StreamSessionId) -> bool {
        self.lock_state().stream.accepts_stream_event(session)
    }

    /// Applies a terminal transition and aborts the stream tasks. Returns
    /// the session that was torn down, or `None` when nothing was active.
    fn teardown_active_stream(
        self: &Arc<Self>,
        transition: fn(StreamSessionId) -> StreamTransition,
    ) -> Option<StreamSessionId> {
        let mut state = self.lock_state();
        let session = state.stream.active_session()?;
        let next = state.stream.apply(transition(session)).ok()?;
        state.stream = next;
        if let Some(reader) = state.reader.take() {
            reader.abort();
        }
        if let Some(worker) = state.worker.take() {
            worker.abort();
        }
        Some(session)
    }

    fn start_stream(
        self: Arc<Self>,
        message: Option<String>,
        mode: StreamMode,
        base_override: Option<Vec<ChatMessage>>,
        overrides: ChatOverrides,
    ) -> SubmitOutcome {
        let session = {
            let mut state = self.lock_state();
            if state.stream.active_session().is_some() {
                return SubmitOutcome::AlreadyStreaming;
            }
            let session = StreamSessionId::new(state.next_session);
            state.next_session = state.next_session.saturating_add(1);
            match state.stream.apply(StreamTransition::Start(session)) {
                Ok(next) => state.stream = next,
                Err(rejection) => {
                    tracing::error!(?rejection, "stream start rejected");
                    return SubmitOutcome::AlreadyStreaming;
                }
            }
            session
        };

        let mut base = base_override.unwrap_or_else(|| self.conversation.snapshot().messages);
        if let Some(text) = &message {
            base.push(ChatMessage::user(text.clone()));
            self.conversation.set_pending(Some(UserMessage::new(text.clone())));
        }
        self.conversation.replace_messages(base.clone());
        self.streaming.publish(LiveMessage::loading());

        let conversation_id = self.conversation.snapshot().id;
        let params = self.params.current();
        let request = self.build_request(
            message.unwrap_or_default(),
            &params,
            &overrides,
            conversation_id.clone(),
        );
        let headers = DeploymentHeaders {
            name: params.deployment.clone(),
            config: params.deployment_config.clone(),
        };

        match self.transport.open_stream(request, mode, &headers) {
            Ok(handle) => {
                let mut state = self.lock_state();
                state.worker = Some(tokio::spawn(handle.worker));
                state.reader = Some(tokio::spawn(Self::run_reader(
                    self.clone(),
                    handle.stream,
                    session,
                    base,
                    conversation_id,
                )));
                SubmitOutcome::Started
            }
            Err(error) => {
                self.fail_stream(error, String::new(), &base, session);
                SubmitOutcome::Started
            }
        }
    }

    fn build_request(
        &self,
        message: String,
        params: &ChatParams,
        overrides: &ChatOverrides,
        conversation_id: Option<ConversationId>,
    ) -> ChatRequest {
        let mut tools: Vec<ToolSpec> = overrides
            .tools
            .clone()
            .unwrap_or_else(|| params.tools.clone())
            .into_iter()
            .map(ToolSpec::new)
            .collect();
        for default_tool in DEFAULT_AGENT_TOOLS {
            if !tools.iter().any(|tool| tool.name == default_tool) {
                tools.push(ToolSpec::new(default_tool));
            }
        }

        ChatRequest {
            message,
            conversation_id,
            agent_id: self.agent_id.clone(),
            tools,
            temperature: overrides.temperature.or(params.temperature),
            preamble: overrides.preamble.clone().or_else(|| params.preamble.clone()),
            model: overrides.model.clone().or_else(|| params.model.clone()),
            file_ids: params.file_ids.clone(),
            interviews: overrides
                .interviews
                .clone()
                .unwrap_or_else(|| params.interviews.clone()),
        }
    }

    /// Sequential event pump: one consumer per stream, so the fold state is
    /// never mutated concurrently.
    async fn run_reader(
        inner: Arc<Self>,
        mut stream: ChatEventStream,
        session: StreamSessionId,
        base: Vec<ChatMessage>,
        requested_conversation_id: Option<ConversationId>,
    ) {
        let mut fold = StreamFold::new(requested_conversation_id);

        while let Some(item) = stream.recv().await {
            if !inner.accepts(session) {
                tracing::debug!(session = session.0, "dropping event for superseded stream");
                return;
            }
            match item {
                Ok(event) => {
                    let step = fold.apply(event);
                    let finished = step.finalization.is_some();
                    inner.apply_step(step, &base, session);
                    if finished {
                        return;
                    }
                }
                Err(error) => {
                    inner.fail_stream(error, fold.accumulated_text().to_string(), &base, session);
                    return;
                }
            }
        }

        if !fold.is_finished() {
            inner.fail_stream(
                TransportError::StreamProtocol {
                    stage: "reader-closed",
                    code: "truncated",
                    details: "stream ended before a terminal event".to_string(),
                },
                fold.accumulated_text().to_string(),
                &base,
                session,
            );
        }
    }

    fn apply_step(self: &Arc<Self>, step: FoldStep, base: &[ChatMessage], session: StreamSessionId) {
        if let Some(snapshot) = step.snapshot {
            self.streaming.publish(snapshot);
        }
        for record in step.citations {
            self.citations
                .add_citation(&record.generation_id, &record.span_key, record.documents);
        }
        for file in step.output_files {
            self.citations.save_output_file(file);
        }
        if !step.search_results.is_empty() {
            self.citations.add_search_results(&step.search_results);
        }
        if let Some(finalization) = step.finalization {
            self.finalize(finalization, base, session);
        }
    }

    fn finalize(
        self: &Arc<Self>,
        finalization: salon_chat::Finalization,
        base: &[ChatMessage],
        session: StreamSessionId,
    ) {
        {
            let mut state = self.lock_state();
            // The transition doubles as the stale gate: a superseded stream
            // can no longer complete.
            let Ok(next) = state.stream.apply(StreamTransition::Complete(session)) else {
                return;
            };
            state.stream = next;
            state.worker = None;
        }

        let mut messages = base.to_vec();
        messages.push(ChatMessage::Bot(finalization.message));
        self.conversation.replace_messages(messages.clone());

        let title_conversation = finalization.conversation_id.clone();
        if let Some(conversation_id) = finalization.conversation_id {
            if self.conversation.snapshot().id.as_ref() != Some(&conversation_id) {
                self.conversation.set_id(conversation_id.clone());
            }
            if finalization.conversation_id_changed {
                // The conversation now exists server-side under a fresh id;
                // list views must refetch.
                self.conversation.invalidate_list();
            }
        }

        self.streaming.clear();
        self.conversation.set_pending(None);
        self.idle.notify_waiters();

        if should_update_title(&messages) {
            if let Some(conversation_id) = title_conversation {
                let mut state = self.lock_state();
                state.title = Some(tokio::spawn(Self::run_title_update(
                    self.clone(),
                    conversation_id,
                )));
            }
        }
    }

    /// Fetches a generated title and types it in character by character,
    /// abandoning the animation when the user navigated away.
    async fn run_title_update(inner: Arc<Self>, conversation_id: ConversationId) {
        match inner.transport.generate_title(&conversation_id).await {
            Ok(Some(title)) => {
                sleep(inner.title_timings.reveal_delay).await;
                let mut typed = String::new();
                for character in title.chars() {
                    sleep(inner.title_timings.typing_interval).await;
                    if inner.conversation.snapshot().id.as_ref() != Some(&conversation_id) {
                        tracing::debug!(conversation = %conversation_id, "title animation abandoned");
                        return;
                    }
                    typed.push(character);
                    inner.conversation.set_title(typed.clone());
                }
            }
            Ok(None) => {}
            Err(error) => {
                tracing::warn!(conversation = %conversation_id, error = %error, "title generation failed");
            }
        }
    }

    /// Converts a transport failure into its message-list annotation. Every
    /// path clears the live snapshot and the pending marker, so no dangling
    /// in-progress state survives a failure.
    fn fail_stream(
        self: &Arc<Self>,
        error: TransportError,
        partial_text: String,
        base: &[ChatMessage],
        session: StreamSessionId,
    ) {
        {
            let mut state = self.lock_state();
            let Ok(next) = state.stream.apply(StreamTransition::Fail {
                session,
                message: error.to_string(),
            }) else {
                return;
            };
            state.stream = next;
            state.worker = None;
        }

        tracing::warn!(session = session.0, error = %error, "chat stream failed");

        let messages = match &error {
            TransportError::Network { status, .. } => {
                // Pre-stream rejection: annotate the user message that
                // triggered the request.
                let mut messages = base.to_vec();
                if let Some(ChatMessage::User(user)) = messages.last_mut() {
                    user.error = Some(format!("[{status}] {USER_ERROR_MESSAGE}"));
                }
                messages
            }
            TransportError::StreamProtocol { code, .. } => {
                let mut messages = base.to_vec();
                messages.push(ChatMessage::Bot(BotMessage::errored(
                    partial_text,
                    format!("[{code}] {USER_ERROR_MESSAGE}"),
                )));
                messages
            }
            other => {
                let mut messages = base.to_vec();
                let detail = other.to_string();
                let detail = if detail.is_empty() {
                    FALLBACK_ERROR_MESSAGE.to_string()
                } else {
                    detail
                };
                messages.push(ChatMessage::Bot(BotMessage::errored(partial_text, detail)));
                messages
            }
        };

        self.conversation.replace_messages(messages);
        self.streaming.clear();
        self.conversation.set_pending(None);
        self.idle.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use salon_chat::{
        BotState, ChatEvent, Citation, FinishReason, MemoryCitationStore, MemoryConversationStore,
        MemoryStreamingStore, StreamEnd,
    };
    use salon_transport::{BoxFuture, ChatStreamHandle, TransportResult, event_channel};

    use super::*;

    enum Script {
        Events {
            items: Vec<TransportResult<ChatEvent>>,
            hang: bool,
        },
        OpenError(TransportError),
    }

    struct MockTransport {
        scripts: Mutex<VecDeque<Script>>,
        title: Option<String>,
        title_calls: AtomicUsize,
        last_request: Mutex<Option<(ChatRequest, StreamMode)>>,
    }

    impl MockTransport {
        fn new(scripts: Vec<Script>) -> Self {
            Self {
                scripts: Mutex::new(scripts.into_iter().collect()),
                title: None,
                title_calls: AtomicUsize::new(0),
                last_request: Mutex::new(None),
            }
        }

        fn with_title(mut self, title: &str) -> Self {
            self.title = Some(title.to_string());
            self
        }

        fn title_calls(&self) -> usize {
            self.title_calls.load(Ordering::SeqCst)
        }

        fn last_request(&self) -> Option<(ChatRequest, StreamMode)> {
            self.last_request.lock().unwrap().clone()
        }
    }

    impl ChatTransport for MockTransport {
        fn open_stream(
            &self,
            request: ChatRequest,
            mode: StreamMode,
            _headers: &DeploymentHeaders,
        ) -> TransportResult<ChatStreamHandle> {
            *self.last_request.lock().unwrap() = Some((request, mode));
            let script = self
                .scripts
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Script::Events {
                    items: Vec::new(),
                    hang: false,
                });
            match script {
                Script::OpenError(error) => Err(error),
                Script::Events { items, hang } => {
                    let (event_tx, stream, _cancel_rx) = event_channel();
                    let worker = Box::pin(async move {
                        for item in items {
                            if event_tx.send(item).is_err() {
                                return;
                            }
                        }
                        if hang {
                            std::future::pending::<()>().await;
                        }
                    });
                    Ok(ChatStreamHandle { stream, worker })
                }
            }
        }

        fn generate_title<'a>(
            &'a self,
            _conversation_id: &'a ConversationId,
        ) -> BoxFuture<'a, TransportResult<Option<String>>> {
            self.title_calls.fetch_add(1, Ordering::SeqCst);
            Box::pin(async move { Ok(self.title.clone()) })
        }
    }

    struct Harness {
        session: ChatSession,
        transport: Arc<MockTransport>,
        conversation: Arc<MemoryConversationStore>,
        citations: Arc<MemoryCitationStore>,
        streaming: Arc<MemoryStreamingStore>,
    }

    fn harness(transport: MockTransport) -> Harness {
        let transport = Arc::new(transport);
        let conversation = Arc::new(MemoryConversationStore::new());
        let citations = Arc::new(MemoryCitationStore::new());
        let streaming = Arc::new(MemoryStreamingStore::new());
        let session = ChatSession::new(
            transport.clone(),
            SessionStores {
                conversation: conversation.clone(),
                citations: citations.clone(),
                streaming: streaming.clone(),
            },
            Arc::new(ParamsStore::default()),
            SessionConfig {
                agent_id: None,
                title_timings: Some(TitleTimings {
                    reveal_delay: Duration::ZERO,
                    typing_interval: Duration::ZERO,
                }),
            },
        );
        Harness {
            session,
            transport,
            conversation,
            citations,
            streaming,
        }
    }

    fn full_stream(final_text: &str) -> Script {
        Script::Events {
            items: vec![
                Ok(ChatEvent::StreamStart {
                    conversation_id: Some(ConversationId::new("conv-1")),
                    generation_id: Some(salon_chat::GenerationId::new("gen-1")),
                }),
                Ok(ChatEvent::TextGeneration {
                    text: final_text.to_string(),
                }),
                Ok(ChatEvent::StreamEnd(StreamEnd {
                    conversation_id: Some(ConversationId::new("conv-1")),
                    text: final_text.to_string(),
                    finish_reason: Some(FinishReason::Complete),
                    ..StreamEnd::default()
                })),
            ],
            hang: false,
        }
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        for _ in 0..1_000 {
            if condition() {
                return;
            }
            sleep(Duration::from_millis(1)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test]
    async fn full_stream_yields_fulfilled_message_and_clears_live_state() {
        let h = harness(MockTransport::new(vec![full_stream("Hello world")]));
        assert_eq!(h.session.send_message("hi"), SubmitOutcome::Started);
        h.session.wait_for_idle().await;

        let snapshot = h.conversation.snapshot();
        assert_eq!(snapshot.messages.len(), 2);
        let ChatMessage::Bot(bot) = &snapshot.messages[1] else {
            panic!("expected bot message");
        };
        assert_eq!(bot.state, BotState::Fulfilled);
        assert_eq!(bot.text, "Hello world");
        assert_eq!(snapshot.id, Some(ConversationId::new("conv-1")));
        assert!(snapshot.pending.is_none());
        assert!(h.streaming.current().is_none());
    }

    #[tokio::test]
    async fn assigned_conversation_id_invalidates_the_list() {
        let h = harness(MockTransport::new(vec![full_stream("hello")]));
        h.session.send_message("hi");
        h.session.wait_for_idle().await;
        assert_eq!(h.conversation.list_revision(), 1);
    }

    #[tokio::test]
    async fn empty_and_concurrent_submits_are_ignored() {
        let h = harness(MockTransport::new(vec![Script::Events {
            items: vec![Ok(ChatEvent::TextGeneration {
                text: "busy".to_string(),
            })],
            hang: true,
        }]));

        assert_eq!(h.session.send_message("   "), SubmitOutcome::EmptyMessage);
        assert_eq!(h.session.send_message("go"), SubmitOutcome::Started);
        assert_eq!(
            h.session.send_message("again"),
            SubmitOutcome::AlreadyStreaming
        );
        h.session.stop();
    }

    #[tokio::test]
    async fn stop_synthesizes_aborted_message_from_partial_text() {
        let h = harness(MockTransport::new(vec![Script::Events {
            items: vec![Ok(ChatEvent::TextGeneration {
                text: "partial".to_string(),
            })],
            hang: true,
        }]));

        h.session.send_message("question");
        wait_until(|| {
            h.streaming
                .current()
                .is_some_and(|live| live.text == "partial")
        })
        .await;

        h.session.stop();
        assert!(!h.session.is_streaming());

        let snapshot = h.conversation.snapshot();
        let ChatMessage::Bot(bot) = snapshot.messages.last().unwrap() else {
            panic!("expected bot message");
        };
        assert_eq!(bot.state, BotState::Aborted);
        assert_eq!(bot.text, "partial");
        assert!(h.streaming.current().is_none());
        assert!(snapshot.pending.is_none());
    }

    #[tokio::test]
    async fn network_error_annotates_the_user_message() {
        let h = harness(MockTransport::new(vec![Script::OpenError(
            TransportError::Network {
                stage: "open-stream-status",
                status: 401,
            },
        )]));

        h.session.send_message("secret question");
        h.session.wait_for_idle().await;

        let snapshot = h.conversation.snapshot();
        assert_eq!(snapshot.messages.len(), 1);
        let ChatMessage::User(user) = &snapshot.messages[0] else {
            panic!("expected user message");
        };
        assert!(user.error.as_deref().unwrap().contains("401"));
        assert!(h.streaming.current().is_none());
        assert!(snapshot.pending.is_none());
    }

    #[tokio::test]
    async fn protocol_error_keeps_partial_text_in_error_message() {
        let h = harness(MockTransport::new(vec![Script::Events {
            items: vec![
                Ok(ChatEvent::TextGeneration {
                    text: "partial thought".to_string(),
                }),
                Err(TransportError::StreamProtocol {
                    stage: "decode-stream-payload",
                    code: "decode",
                    details: "bad payload".to_string(),
                }),
            ],
            hang: false,
        }]));

        h.session.send_message("question");
        h.session.wait_for_idle().await;

        let snapshot = h.conversation.snapshot();
        let ChatMessage::Bot(bot) = snapshot.messages.last().unwrap() else {
            panic!("expected bot message");
        };
        assert_eq!(bot.state, BotState::Error);
        assert_eq!(bot.text, "partial thought");
        assert!(bot.error.as_deref().unwrap().contains("[decode]"));
    }

    #[tokio::test]
    async fn stream_closing_without_terminal_event_fails_as_truncated() {
        let h = harness(MockTransport::new(vec![Script::Events {
            items: vec![Ok(ChatEvent::TextGeneration {
                text: "cut ".to_string(),
            })],
            hang: false,
        }]));

        h.session.send_message("question");
        h.session.wait_for_idle().await;

        let snapshot = h.conversation.snapshot();
        let ChatMessage::Bot(bot) = snapshot.messages.last().unwrap() else {
            panic!("expected bot message");
        };
        assert!(bot.error.as_deref().unwrap().contains("[truncated]"));
        assert_eq!(bot.text, "cut ");
    }

    #[tokio::test]
    async fn first_exchange_triggers_exactly_one_title_refresh() {
        let h = harness(MockTransport::new(vec![full_stream("hello")]).with_title("Greetings"));
        h.session.send_message("hi");
        h.session.wait_for_idle().await;
        h.session.wait_for_title().await;

        assert_eq!(h.transport.title_calls(), 1);
        assert_eq!(h.conversation.snapshot().title, "Greetings");
    }

    #[tokio::test]
    async fn second_exchange_does_not_refresh_the_title() {
        let h = harness(
            MockTransport::new(vec![full_stream("one"), full_stream("two")])
                .with_title("Greetings"),
        );
        h.session.send_message("first");
        h.session.wait_for_idle().await;
        h.session.wait_for_title().await;
        h.session.send_message("second");
        h.session.wait_for_idle().await;
        h.session.wait_for_title().await;

        assert_eq!(h.transport.title_calls(), 1);
    }

    #[tokio::test]
    async fn fifth_fulfilled_response_refreshes_the_title_again() {
        let h = harness(
            MockTransport::new((0..5).map(|i| full_stream(&format!("answer {i}"))).collect())
                .with_title("Study chat"),
        );
        for turn in 0..5 {
            h.session.send_message(format!("question {turn}"));
            h.session.wait_for_idle().await;
            h.session.wait_for_title().await;
        }
        // Once after the first exchange, once at the fifth response.
        assert_eq!(h.transport.title_calls(), 2);
    }

    #[tokio::test]
    async fn retry_after_user_error_strips_one_message() {
        let h = harness(MockTransport::new(vec![
            Script::OpenError(TransportError::Network {
                stage: "open-stream-status",
                status: 500,
            }),
            full_stream("recovered"),
        ]));

        h.session.send_message("flaky question");
        h.session.wait_for_idle().await;
        assert_eq!(h.conversation.snapshot().messages.len(), 1);

        assert_eq!(h.session.retry(), SubmitOutcome::Started);
        h.session.wait_for_idle().await;

        let messages = h.conversation.snapshot().messages;
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].text(), "flaky question");
        assert!(messages[1].is_fulfilled_bot());
        let (request, _) = h.transport.last_request().unwrap();
        assert_eq!(request.message, "flaky question");
    }

    #[tokio::test]
    async fn retry_after_aborted_bot_strips_the_pair() {
        let h = harness(MockTransport::new(vec![
            Script::Events {
                items: vec![Ok(ChatEvent::TextGeneration {
                    text: "half".to_string(),
                })],
                hang: true,
            },
            full_stream("full answer"),
        ]));

        h.session.send_message("question");
        wait_until(|| h.streaming.current().is_some_and(|live| !live.text.is_empty())).await;
        h.session.stop();
        assert_eq!(h.conversation.snapshot().messages.len(), 2);

        h.session.retry();
        h.session.wait_for_idle().await;

        let messages = h.conversation.snapshot().messages;
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].text(), "question");
        assert!(messages[1].is_fulfilled_bot());
    }

    #[tokio::test]
    async fn regenerate_discards_messages_after_the_last_user_message() {
        let h = harness(MockTransport::new(vec![
            full_stream("first answer"),
            full_stream("better answer"),
        ]));

        h.session.send_message("question");
        h.session.wait_for_idle().await;

        assert_eq!(h.session.regenerate(), SubmitOutcome::Started);
        h.session.wait_for_idle().await;

        let messages = h.conversation.snapshot().messages;
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].text(), "question");
        assert_eq!(messages[1].text(), "better answer");

        let (request, mode) = h.transport.last_request().unwrap();
        assert_eq!(mode, StreamMode::Regenerate);
        assert!(request.message.is_empty());
    }

    #[tokio::test]
    async fn regenerate_without_user_message_is_a_no_op() {
        let h = harness(MockTransport::new(vec![]));
        assert_eq!(h.session.regenerate(), SubmitOutcome::NothingToResend);
    }

    #[tokio::test]
    async fn conversation_switch_cancels_stream_and_resets_citations() {
        let h = harness(MockTransport::new(vec![Script::Events {
            items: vec![Ok(ChatEvent::TextGeneration {
                text: "going".to_string(),
            })],
            hang: true,
        }]));

        h.session.send_message("question");
        wait_until(|| h.streaming.current().is_some_and(|live| !live.text.is_empty())).await;
        h.citations.add_citation(
            &salon_chat::GenerationId::new("gen-0"),
            "0-4",
            vec![],
        );

        h.session.switch_conversation(Some(ConversationId::new("conv-2")));

        assert!(!h.session.is_streaming());
        assert!(h.streaming.current().is_none());
        assert!(!h.citations.has_citations());
        let snapshot = h.conversation.snapshot();
        assert_eq!(snapshot.id, Some(ConversationId::new("conv-2")));
        assert!(snapshot.messages.is_empty());
    }

    #[tokio::test]
    async fn citations_from_the_stream_land_in_the_citation_store() {
        let h = harness(MockTransport::new(vec![Script::Events {
            items: vec![
                Ok(ChatEvent::StreamStart {
                    conversation_id: Some(ConversationId::new("conv-1")),
                    generation_id: Some(salon_chat::GenerationId::new("gen-9")),
                }),
                Ok(ChatEvent::TextGeneration {
                    text: "Rust is fast".to_string(),
                }),
                Ok(ChatEvent::CitationGeneration {
                    citations: vec![Citation::new(0, 4, "Rust").with_document("doc_1")],
                }),
                Ok(ChatEvent::StreamEnd(StreamEnd {
                    conversation_id: Some(ConversationId::new("conv-1")),
                    text: "Rust is fast".to_string(),
                    finish_reason: Some(FinishReason::Complete),
                    documents: vec![salon_chat::Document::new("doc_1")],
                    ..StreamEnd::default()
                })),
            ],
            hang: false,
        }]));

        h.session.send_message("tell me about rust");
        h.session.wait_for_idle().await;

        let spans = h
            .citations
            .citations_for(&salon_chat::GenerationId::new("gen-9"));
        assert_eq!(spans.len(), 1);
        assert_eq!(spans["0-4"].len(), 1);
    }
}
