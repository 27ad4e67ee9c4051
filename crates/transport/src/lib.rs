/// Streaming connection against the chat backend.
pub mod client;
/// Transport failure taxonomy.
pub mod error;
/// Request payload and header types for opening a stream.
pub mod request;
/// Incremental decoder for `text/event-stream` bodies.
pub mod sse;

pub use client::{
    BoxFuture, ChatEventStream, ChatStreamHandle, ChatTransport, HttpChatTransport,
    TransportConfig, TransportWorker, event_channel,
};
pub use error::{TransportError, TransportResult};
pub use request::{
    ChatRequest, DeploymentHeaders, HEADER_DEPLOYMENT_CONFIG, HEADER_DEPLOYMENT_NAME, StreamMode,
    ToolSpec,
};
pub use sse::SseDecoder;
