use serde::{Deserialize, Serialize};

use crate::event::{Citation, ToolEvent};
use crate::ids::{GenerationId, MessageId};

/// Identifier for one streaming generation session.
///
/// This must change on every submit/retry/regenerate so stale events can be
/// rejected after the stream they belong to was superseded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamSessionId(pub u64);

impl StreamSessionId {
    /// Creates a typed stream session identifier.
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }
}

/// Lifecycle state of a bot response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BotState {
    /// Stream opened, no response byte received yet.
    Loading,
    /// Text or tool bytes are arriving.
    Typing,
    Fulfilled,
    Error,
    Aborted,
}

impl BotState {
    /// Returns true for states a stream can no longer leave.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Fulfilled | Self::Error | Self::Aborted)
    }
}

impl Default for BotState {
    fn default() -> Self {
        Self::Loading
    }
}

/// A message authored by the user.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UserMessage {
    pub text: String,
    /// Error annotation attached when the request this message triggered
    /// failed before the stream produced a bot message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl UserMessage {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            error: None,
        }
    }
}

/// The immutable, stored representation of a bot response.
///
/// During streaming the in-progress counterpart is [`LiveMessage`]; a
/// `BotMessage` supersedes it in the conversation's message list once the
/// stream reaches a terminal state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BotMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<MessageId>,
    pub state: BotState,
    /// Display text; citation markers are injected here at finalization.
    pub text: String,
    /// The chosen final text without citation markup.
    pub original_text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generation_id: Option<GenerationId>,
    #[serde(default)]
    pub citations: Vec<Citation>,
    #[serde(default)]
    pub tool_events: Vec<ToolEvent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl BotMessage {
    /// Creates an aborted message from whatever text had accumulated when the
    /// user stopped the stream.
    pub fn aborted(text: impl Into<String>) -> Self {
        let text = text.into();
        Self {
            state: BotState::Aborted,
            original_text: text.clone(),
            text,
            ..Self::default()
        }
    }

    /// Creates an errored message carrying the partial text accumulated
    /// before the failure.
    pub fn errored(text: impl Into<String>, error: impl Into<String>) -> Self {
        let text = text.into();
        Self {
            state: BotState::Error,
            original_text: text.clone(),
            text,
            error: Some(error.into()),
            ..Self::default()
        }
    }
}

/// One entry of a conversation's message list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ChatMessage {
    User(UserMessage),
    Bot(BotMessage),
}

impl ChatMessage {
    pub fn user(text: impl Into<String>) -> Self {
        Self::User(UserMessage::new(text))
    }

    pub fn text(&self) -> &str {
        match self {
            Self::User(message) => &message.text,
            Self::Bot(message) => &message.text,
        }
    }

    pub fn is_user(&self) -> bool {
        matches!(self, Self::User(_))
    }

    /// Returns true for user messages that did not fail.
    pub fn is_clean_user(&self) -> bool {
        matches!(self, Self::User(message) if message.error.is_none())
    }

    pub fn is_fulfilled_bot(&self) -> bool {
        matches!(self, Self::Bot(message) if message.state == BotState::Fulfilled)
    }
}

/// The mutable in-progress representation of a streaming bot response.
///
/// Exactly one `LiveMessage` exists per in-flight stream; it is replaced by a
/// [`BotMessage`] when the stream ends, errors, or is aborted.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LiveMessage {
    pub state: BotState,
    pub text: String,
    pub generation_id: Option<GenerationId>,
    pub citations: Vec<Citation>,
    pub tool_events: Vec<ToolEvent>,
    /// True while tool-call deltas are streaming; flips off on the first
    /// subsequent text delta.
    pub streaming_tool_events: bool,
}

impl LiveMessage {
    /// The placeholder snapshot published when a stream is opened, before any
    /// response byte arrives.
    pub fn loading() -> Self {
        Self::default()
    }
}

/// Stream lifecycle boundary for one conversation view.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum StreamState {
    #[default]
    Idle,
    Streaming(StreamSessionId),
    Done(StreamSessionId),
    Error {
        session: StreamSessionId,
        message: String,
    },
    Aborted(StreamSessionId),
}

/// State transition input for the stream lifecycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamTransition {
    Start(StreamSessionId),
    Complete(StreamSessionId),
    Fail {
        session: StreamSessionId,
        message: String,
    },
    Abort(StreamSessionId),
    ResetToIdle,
}

/// Rejection reason for illegal stream transitions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamTransitionRejection {
    AlreadyStreaming {
        active: StreamSessionId,
        attempted: StreamSessionId,
    },
    NoActiveStream,
    SessionMismatch {
        active: StreamSessionId,
        attempted: StreamSessionId,
    },
}

/// Result type for stream transition application.
pub type StreamTransitionResult = Result<StreamState, StreamTransitionRejection>;

impl StreamState {
    /// Returns the active session if and only if state is `Streaming`.
    pub fn active_session(&self) -> Option<StreamSessionId> {
        match self {
            Self::Streaming(session) => Some(*session),
            Self::Idle | Self::Done(_) | Self::Error { .. } | Self::Aborted(_) => None,
        }
    }

    /// Returns true when incoming stream data belongs to the active session.
    pub fn accepts_stream_event(&self, session: StreamSessionId) -> bool {
        matches!(self, Self::Streaming(active) if *active == session)
    }

    /// Applies one transition deterministically.
    ///
    /// Non-streaming states may start a new session directly. Any terminal
    /// transition (`Complete`/`Fail`/`Abort`) must match the currently active
    /// session exactly.
    pub fn apply(&self, transition: StreamTransition) -> StreamTransitionResult {
        match transition {
            StreamTransition::Start(session) => self.apply_start(session),
            StreamTransition::Complete(session) => self.apply_complete(session),
            StreamTransition::Fail { session, message } => self.apply_fail(session, message),
            StreamTransition::Abort(session) => self.apply_abort(session),
            StreamTransition::ResetToIdle => Ok(Self::Idle),
        }
    }

    fn apply_start(&self, session: StreamSessionId) -> StreamTransitionResult {
        match self {
            Self::Streaming(active) if *active != session => {
                Err(StreamTransitionRejection::AlreadyStreaming {
                    active: *active,
                    attempted: session,
                })
            }
            Self::Streaming(_) => Ok(self.clone()),
            Self::Idle | Self::Done(_) | Self::Error { .. } | Self::Aborted(_) => {
                Ok(Self::Streaming(session))
            }
        }
    }

    fn apply_complete(&self, session: StreamSessionId) -> StreamTransitionResult {
        match self {
            Self::Streaming(active) if *active == session => Ok(Self::Done(session)),
            Self::Streaming(active) => Err(StreamTransitionRejection::SessionMismatch {
                active: *active,
                attempted: session,
            }),
            Self::Idle | Self::Done(_) | Self::Error { .. } | Self::Aborted(_) => {
                Err(StreamTransitionRejection::NoActiveStream)
            }
        }
    }

    fn apply_fail(&self, session: StreamSessionId, message: String) -> StreamTransitionResult {
        match self {
            Self::Streaming(active) if *active == session => Ok(Self::Error { session, message }),
            Self::Streaming(active) => Err(StreamTransitionRejection::SessionMismatch {
                active: *active,
                attempted: session,
            }),
            Self::Idle | Self::Done(_) | Self::Error { .. } | Self::Aborted(_) => {
                Err(StreamTransitionRejection::NoActiveStream)
            }
        }
    }

    fn apply_abort(&self, session: StreamSessionId) -> StreamTransitionResult {
        match self {
            Self::Streaming(active) if *active == session => Ok(Self::Aborted(session)),
            Self::Streaming(active) => Err(StreamTransitionRejection::SessionMismatch {
                active: *active,
                attempted: session,
            }),
            Self::Idle | Self::Done(_) | Self::Error { .. } | Self::Aborted(_) => {
                Err(StreamTransitionRejection::NoActiveStream)
            }
        }
    }
}
