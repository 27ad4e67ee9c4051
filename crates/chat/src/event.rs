use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ids::{ConversationId, DocumentId, GenerationId, MessageId};

/// Reserved tool whose search results are synthetic bookkeeping rather than
/// user-facing sources. The fold hides them from the visible tool-event list
/// and instead harvests the output files they carry.
pub const CODE_EXECUTION_TOOL: &str = "toolkit_python_interpreter";

/// One retrieved source snippet referenced by citations.
///
/// Unknown payload fields are preserved in `fields` because code-execution
/// documents smuggle their output-file payloads through them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Document {
    #[serde(default)]
    pub document_id: DocumentId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    #[serde(flatten)]
    pub fields: serde_json::Map<String, Value>,
}

impl Document {
    pub fn new(document_id: impl Into<DocumentId>) -> Self {
        Self {
            document_id: document_id.into(),
            ..Self::default()
        }
    }

    /// Returns true when this document was produced by the reserved
    /// code-execution tool.
    pub fn is_code_execution(&self) -> bool {
        self.tool_name.as_deref() == Some(CODE_EXECUTION_TOOL)
    }
}

/// A cited span of the accumulated response text.
///
/// `start`/`end` are byte offsets into the text the citation was resolved
/// against. The fold keeps its citation list sorted ascending by `start`
/// after every insertion.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Citation {
    #[serde(default)]
    pub start: usize,
    #[serde(default)]
    pub end: usize,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub document_ids: Vec<DocumentId>,
}

impl Citation {
    pub fn new(start: usize, end: usize, text: impl Into<String>) -> Self {
        Self {
            start,
            end,
            text: text.into(),
            document_ids: Vec::new(),
        }
    }

    pub fn with_document(mut self, document_id: impl Into<DocumentId>) -> Self {
        self.document_ids.push(document_id.into());
        self
    }

    /// Citation-store key in the `"{start}-{end}"` format.
    pub fn span_key(&self) -> String {
        format!("{}-{}", self.start, self.end)
    }
}

/// Incremental update for one tool call inside a `ToolCallsChunk` event.
///
/// `parameters` is a raw JSON fragment; consecutive fragments concatenate
/// into the call's parameter string.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCallDelta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<String>,
}

/// One resolved tool invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    #[serde(default)]
    pub name: String,
    #[serde(default = "empty_parameters")]
    pub parameters: Value,
}

impl Default for ToolCall {
    fn default() -> Self {
        Self {
            name: String::new(),
            parameters: empty_parameters(),
        }
    }
}

fn empty_parameters() -> Value {
    Value::Object(serde_json::Map::new())
}

/// One tool invocation's streamed text plus its resolved tool calls.
///
/// Search-result batches that are shown as their own step in the tool trace
/// carry their documents in `search_results`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolEvent {
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub tool_calls: Vec<ToolCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub search_results: Option<Vec<Document>>,
}

/// Terminal search-result entry delivered with `StreamEnd`; fans out to the
/// citation store's per-document search-result map.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SearchResult {
    #[serde(default)]
    pub document_ids: Vec<DocumentId>,
    #[serde(flatten)]
    pub fields: serde_json::Map<String, Value>,
}

/// Why the server closed the generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FinishReason {
    Complete,
    MaxTokens,
    Error,
    #[serde(other)]
    Unknown,
}

/// Payload of the terminal `stream-end` event.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StreamEnd {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<ConversationId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generation_id: Option<GenerationId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<MessageId>,
    #[serde(default)]
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<FinishReason>,
    #[serde(default)]
    pub documents: Vec<Document>,
    #[serde(default)]
    pub search_results: Vec<SearchResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Tagged union over every event kind one chat stream can deliver, in the
/// `{"event": "...", "data": {...}}` envelope the transport decodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ChatEvent {
    StreamStart {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        conversation_id: Option<ConversationId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        generation_id: Option<GenerationId>,
    },
    TextGeneration {
        #[serde(default)]
        text: String,
    },
    SearchResults {
        #[serde(default)]
        documents: Vec<Document>,
    },
    ToolCallsChunk {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        text: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tool_call_delta: Option<ToolCallDelta>,
    },
    ToolCallsGeneration {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        text: Option<String>,
        #[serde(default)]
        tool_calls: Vec<ToolCall>,
    },
    CitationGeneration {
        #[serde(default)]
        citations: Vec<Citation>,
    },
    StreamEnd(StreamEnd),
}

impl ChatEvent {
    /// Returns true for the terminal event of a stream.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::StreamEnd(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_text_generation_envelope() {
        let event: ChatEvent =
            serde_json::from_str(r#"{"event":"text-generation","data":{"text":"Hello"}}"#).unwrap();
        assert_eq!(
            event,
            ChatEvent::TextGeneration {
                text: "Hello".to_string()
            }
        );
    }

    #[test]
    fn decodes_stream_end_with_unknown_finish_reason() {
        let event: ChatEvent = serde_json::from_str(
            r#"{"event":"stream-end","data":{"text":"done","finish_reason":"ERROR_TOXIC"}}"#,
        )
        .unwrap();
        let ChatEvent::StreamEnd(end) = event else {
            panic!("expected stream-end");
        };
        assert_eq!(end.finish_reason, Some(FinishReason::Unknown));
        assert_eq!(end.text, "done");
    }

    #[test]
    fn decodes_tool_calls_chunk_with_delta() {
        let event: ChatEvent = serde_json::from_str(
            r#"{"event":"tool-calls-chunk","data":{"text":"I will search","tool_call_delta":{"index":0,"name":"web_search","parameters":"{\"query\":\"ru"}}}"#,
        )
        .unwrap();
        let ChatEvent::ToolCallsChunk {
            text,
            tool_call_delta,
        } = event
        else {
            panic!("expected tool-calls-chunk");
        };
        assert_eq!(text.as_deref(), Some("I will search"));
        let delta = tool_call_delta.unwrap();
        assert_eq!(delta.index, Some(0));
        assert_eq!(delta.name.as_deref(), Some("web_search"));
        assert_eq!(delta.parameters.as_deref(), Some("{\"query\":\"ru"));
    }

    #[test]
    fn document_round_trips_extra_fields() {
        let raw = r#"{"document_id":"doc_1","title":"Interview 3","snippet":"...","tool_name":"search_file"}"#;
        let document: Document = serde_json::from_str(raw).unwrap();
        assert_eq!(document.document_id.as_str(), "doc_1");
        assert_eq!(document.fields.get("snippet"), Some(&Value::from("...")));
        let encoded = serde_json::to_value(&document).unwrap();
        assert_eq!(encoded["snippet"], Value::from("..."));
    }

    #[test]
    fn citation_span_key_uses_start_end_format() {
        let citation = Citation::new(4, 11, "source");
        assert_eq!(citation.span_key(), "4-11");
    }
}
