/// Wire-level chat stream events and their payload types.
pub mod event;
/// Stream fold engine: pure reducer from chat events to message state.
pub mod fold;
/// Typed identifiers for server-assigned entities.
pub mod ids;
/// Domain entities and deterministic stream state boundaries.
pub mod message;
/// Store seams the fold's effects are applied to, plus in-memory implementations.
pub mod store;
/// Conversation-title update heuristic.
pub mod title;

pub use event::{
    CODE_EXECUTION_TOOL, ChatEvent, Citation, Document, FinishReason, SearchResult, StreamEnd,
    ToolCall, ToolCallDelta, ToolEvent,
};
pub use fold::{CitationRecord, Finalization, FoldStep, OutputFile, StreamFold};
pub use ids::{ConversationId, DocumentId, GenerationId, MessageId};
pub use message::{
    BotMessage, BotState, ChatMessage, LiveMessage, StreamSessionId, StreamState, StreamTransition,
    StreamTransitionRejection, StreamTransitionResult, UserMessage,
};
pub use store::{
    CitationStore, ConversationSnapshot, ConversationStore, MemoryCitationStore,
    MemoryConversationStore, MemoryStreamingStore, StreamingStore,
};
pub use title::should_update_title;
