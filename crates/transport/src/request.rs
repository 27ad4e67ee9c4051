use serde::Serialize;
use serde_json::Value;

use salon_chat::ConversationId;

/// Header carrying the model deployment the backend should route to.
pub const HEADER_DEPLOYMENT_NAME: &str = "Deployment-Name";
/// Header carrying serialized deployment configuration overrides.
pub const HEADER_DEPLOYMENT_CONFIG: &str = "Deployment-Config";

/// Whether a stream is a fresh turn or a regeneration of the last response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamMode {
    Chat,
    Regenerate,
}

/// A tool made available to the request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ToolSpec {
    pub name: String,
}

impl ToolSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

/// Payload sent to open a chat stream.
///
/// Optional fields are omitted from the wire entirely so the backend applies
/// its own defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ChatRequest {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<ConversationId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<ToolSpec>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preamble: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub file_ids: Vec<String>,
    /// Interview payloads are forwarded opaquely; the client never inspects
    /// them.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub interviews: Vec<Value>,
}

impl ChatRequest {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ..Self::default()
        }
    }
}

/// Per-request deployment routing headers, read from the params store.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeploymentHeaders {
    pub name: Option<String>,
    pub config: Option<String>,
}
