use std::collections::HashMap;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde_json::Value;

use crate::event::{
    ChatEvent, Citation, Document, FinishReason, SearchResult, StreamEnd, ToolCall, ToolCallDelta,
    ToolEvent,
};
use crate::ids::{ConversationId, DocumentId, GenerationId};
use crate::message::{BotMessage, BotState, LiveMessage};

/// One citation-store registration produced by a fold step.
#[derive(Debug, Clone, PartialEq)]
pub struct CitationRecord {
    pub generation_id: GenerationId,
    pub span_key: String,
    pub documents: Vec<Document>,
}

/// Decoded output file harvested from a code-execution document.
#[derive(Debug, Clone, PartialEq)]
pub struct OutputFile {
    pub name: String,
    pub data: Vec<u8>,
    pub document_id: Option<DocumentId>,
}

/// Terminal outcome of a stream fold.
#[derive(Debug, Clone, PartialEq)]
pub struct Finalization {
    pub message: BotMessage,
    pub conversation_id: Option<ConversationId>,
    /// True when the server assigned a conversation id that differs from the
    /// one the request was opened with, so the caller must update its routing
    /// state and refresh the conversation list.
    pub conversation_id_changed: bool,
    pub finish_reason: Option<FinishReason>,
}

/// Effects emitted by one [`StreamFold::apply`] call.
///
/// The fold itself never touches a store; the caller applies these to its
/// injected stores in arrival order.
#[derive(Debug, Default)]
pub struct FoldStep {
    pub snapshot: Option<LiveMessage>,
    pub citations: Vec<CitationRecord>,
    pub search_results: Vec<SearchResult>,
    pub output_files: Vec<OutputFile>,
    pub finalization: Option<Finalization>,
}

/// Pure reducer that folds an ordered chat event sequence into a
/// monotonically improving message.
///
/// The fold owns the accumulated state of exactly one stream. It reads no
/// clock and performs no IO, so replaying the same ordered event sequence
/// through a fresh fold yields an identical final message.
#[derive(Debug)]
pub struct StreamFold {
    requested_conversation_id: Option<ConversationId>,
    conversation_id: Option<ConversationId>,
    generation_id: Option<GenerationId>,
    state: BotState,
    text: String,
    citations: Vec<Citation>,
    documents: HashMap<DocumentId, Document>,
    tool_events: Vec<ToolEvent>,
    tool_event_index: usize,
    // Shared accumulator for the currently streaming tool call's parameter
    // fragments; reset whenever a new tool call is created.
    parameter_buffer: String,
    streaming_tool_events: bool,
    finished: bool,
}

impl StreamFold {
    /// Starts a fold for one stream opened with the given conversation id
    /// (absent for a brand-new conversation).
    pub fn new(requested_conversation_id: Option<ConversationId>) -> Self {
        Self {
            requested_conversation_id,
            conversation_id: None,
            generation_id: None,
            state: BotState::Loading,
            text: String::new(),
            citations: Vec::new(),
            documents: HashMap::new(),
            tool_events: Vec::new(),
            tool_event_index: 0,
            parameter_buffer: String::new(),
            streaming_tool_events: false,
            finished: false,
        }
    }

    /// Text accumulated so far; error paths preserve this as the partial
    /// response shown next to the failure annotation.
    pub fn accumulated_text(&self) -> &str {
        &self.text
    }

    pub fn generation_id(&self) -> Option<&GenerationId> {
        self.generation_id.as_ref()
    }

    /// True once the terminal event has been folded.
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Folds one event and returns the effects to apply downstream.
    pub fn apply(&mut self, event: ChatEvent) -> FoldStep {
        if self.finished {
            tracing::warn!(?event, "ignoring event after stream end");
            return FoldStep::default();
        }

        match event {
            ChatEvent::StreamStart {
                conversation_id,
                generation_id,
            } => self.apply_stream_start(conversation_id, generation_id),
            ChatEvent::TextGeneration { text } => self.apply_text(text),
            ChatEvent::SearchResults { documents } => self.apply_search_results(documents),
            ChatEvent::ToolCallsChunk {
                text,
                tool_call_delta,
            } => self.apply_tool_calls_chunk(text, tool_call_delta),
            ChatEvent::ToolCallsGeneration { text, tool_calls } => {
                self.apply_tool_calls_generation(text, tool_calls)
            }
            ChatEvent::CitationGeneration { citations } => self.apply_citations(citations),
            ChatEvent::StreamEnd(end) => self.apply_stream_end(end),
        }
    }

    /// Synthesizes the aborted final message from the accumulated text,
    /// consuming the fold.
    pub fn into_aborted(self) -> BotMessage {
        let mut message = BotMessage::aborted(self.text);
        message.generation_id = self.generation_id;
        message.citations = self.citations;
        message.tool_events = self.tool_events;
        message
    }

    fn apply_stream_start(
        &mut self,
        conversation_id: Option<ConversationId>,
        generation_id: Option<GenerationId>,
    ) -> FoldStep {
        self.conversation_id = conversation_id;
        self.generation_id = generation_id;
        FoldStep::default()
    }

    fn apply_text(&mut self, delta: String) -> FoldStep {
        // Text and tool-call deltas do not interleave inside one tool call:
        // the first text delta after a tool-call chunk closes that chunk.
        self.streaming_tool_events = false;
        self.text.push_str(&delta);
        self.state = BotState::Typing;
        FoldStep {
            snapshot: Some(self.snapshot()),
            ..FoldStep::default()
        }
    }

    fn apply_search_results(&mut self, documents: Vec<Document>) -> FoldStep {
        let output_files = collect_output_files(&documents);
        self.merge_documents(documents.clone());

        // Search results following a code-execution call are synthetic
        // bookkeeping, not user-facing sources.
        let preceding_is_code_execution = self.tool_event_index > 0
            && self
                .tool_events
                .get(self.tool_event_index - 1)
                .and_then(|event| event.tool_calls.first())
                .is_some_and(|call| call.name == crate::event::CODE_EXECUTION_TOOL);

        if !preceding_is_code_execution {
            self.tool_events.push(ToolEvent {
                text: String::new(),
                tool_calls: Vec::new(),
                search_results: Some(documents),
            });
            self.tool_event_index += 1;
        }

        FoldStep {
            output_files,
            ..FoldStep::default()
        }
    }

    fn apply_tool_calls_chunk(
        &mut self,
        text: Option<String>,
        delta: Option<ToolCallDelta>,
    ) -> FoldStep {
        self.streaming_tool_events = true;
        self.state = BotState::Typing;

        let index = self.tool_event_index;
        if self.tool_events.len() <= index {
            self.tool_events.push(ToolEvent::default());
        }

        if let Some(text) = text {
            self.tool_events[index].text.push_str(&text);
        }

        if let Some(delta) = delta {
            let call_index = delta.index.unwrap_or(0);
            if self.tool_events[index].tool_calls.len() <= call_index {
                while self.tool_events[index].tool_calls.len() <= call_index {
                    self.tool_events[index].tool_calls.push(ToolCall::default());
                }
                self.parameter_buffer.clear();
            }

            let call = &mut self.tool_events[index].tool_calls[call_index];
            if let Some(name) = delta.name {
                call.name = name;
            }
            if let Some(fragment) = delta.parameters {
                self.parameter_buffer.push_str(&fragment);
                if let Some(parsed) = parse_partial_parameters(&self.parameter_buffer) {
                    call.parameters = parsed;
                }
            }
        }

        FoldStep {
            snapshot: Some(self.snapshot()),
            ..FoldStep::default()
        }
    }

    fn apply_tool_calls_generation(
        &mut self,
        text: Option<String>,
        tool_calls: Vec<ToolCall>,
    ) -> FoldStep {
        let event = ToolEvent {
            text: text.unwrap_or_default(),
            tool_calls,
            search_results: None,
        };

        // This event finalizes what the chunk events were building; the index
        // always advances by one past the finalized entry.
        if let Some(slot) = self.tool_events.get_mut(self.tool_event_index) {
            *slot = event;
        } else {
            self.tool_events.push(event);
        }
        self.tool_event_index += 1;

        FoldStep::default()
    }

    fn apply_citations(&mut self, citations: Vec<Citation>) -> FoldStep {
        let mut records = Vec::new();
        for citation in citations {
            let Some(citation) = clamp_citation(citation, &self.text) else {
                continue;
            };
            records.push(self.citation_record(&citation));
            self.citations.push(citation);
        }
        // Stable sort keeps arrival order among citations with equal starts.
        self.citations.sort_by_key(|citation| citation.start);

        self.state = BotState::Typing;
        FoldStep {
            snapshot: Some(self.snapshot()),
            citations: records,
            ..FoldStep::default()
        }
    }

    fn apply_stream_end(&mut self, end: StreamEnd) -> FoldStep {
        self.finished = true;

        if let Some(generation_id) = end.generation_id.clone() {
            self.generation_id.get_or_insert(generation_id);
        }

        let conversation_id = end
            .conversation_id
            .clone()
            .or_else(|| self.conversation_id.clone());
        let conversation_id_changed = match (&conversation_id, &self.requested_conversation_id) {
            (Some(finalized), Some(requested)) => finalized != requested,
            (Some(_), None) => true,
            (None, _) => false,
        };

        let output_files = collect_output_files(&end.documents);
        self.merge_documents(end.documents);

        // The terminal payload is truncated when generation hit the token
        // limit, so the streamed accumulation is the fuller text.
        let final_text = match end.finish_reason {
            Some(FinishReason::MaxTokens) => self.text.clone(),
            _ => end.text,
        };

        // Re-resolve every citation against the chosen final text and the now
        // fuller document map; snippets cited before their documents arrived
        // backfill here.
        self.citations = std::mem::take(&mut self.citations)
            .into_iter()
            .filter_map(|citation| clamp_citation(citation, &final_text))
            .collect();
        self.citations.sort_by_key(|citation| citation.start);
        let citation_records = self
            .citations
            .iter()
            .map(|citation| self.citation_record(citation))
            .collect();

        let failed = end.error.is_some() || end.finish_reason == Some(FinishReason::Error);
        let message = if failed {
            let mut message = BotMessage::errored(
                self.text.clone(),
                end.error
                    .unwrap_or_else(|| "generation finished with an error".to_string()),
            );
            message.id = end.message_id;
            message.generation_id = self.generation_id.clone();
            message.tool_events = self.tool_events.clone();
            message
        } else {
            let display_text = if self.citations.is_empty() {
                final_text.clone()
            } else {
                inject_citation_markers(&final_text, &self.citations, self.generation_id.as_ref())
            };
            BotMessage {
                id: end.message_id,
                state: BotState::Fulfilled,
                text: display_text,
                original_text: final_text,
                generation_id: self.generation_id.clone(),
                citations: self.citations.clone(),
                tool_events: self.tool_events.clone(),
                error: None,
            }
        };

        FoldStep {
            citations: citation_records,
            search_results: end.search_results,
            output_files,
            finalization: Some(Finalization {
                message,
                conversation_id,
                conversation_id_changed,
                finish_reason: end.finish_reason,
            }),
            ..FoldStep::default()
        }
    }

    fn snapshot(&self) -> LiveMessage {
        LiveMessage {
            state: self.state,
            text: self.text.clone(),
            generation_id: self.generation_id.clone(),
            citations: self.citations.clone(),
            tool_events: self.tool_events.clone(),
            streaming_tool_events: self.streaming_tool_events,
        }
    }

    fn merge_documents(&mut self, documents: Vec<Document>) {
        for document in documents {
            // Last write wins on id collisions.
            self.documents
                .insert(document.document_id.clone(), document);
        }
    }

    fn citation_record(&self, citation: &Citation) -> CitationRecord {
        let documents = citation
            .document_ids
            .iter()
            .filter_map(|id| self.documents.get(id).cloned())
            .collect();
        CitationRecord {
            generation_id: self.generation_id.clone().unwrap_or_default(),
            span_key: citation.span_key(),
            documents,
        }
    }
}

/// Best-effort preview parse of a streaming parameter fragment buffer.
///
/// Tries the buffer as-is, then with the naive `"}` closer that turns a
/// buffer cut after an object value into valid JSON. Returns `None` when
/// neither parses; the caller keeps the previous value. Never errors.
fn parse_partial_parameters(buffer: &str) -> Option<Value> {
    if let Ok(parsed) = serde_json::from_str::<Value>(buffer) {
        return Some(parsed);
    }
    serde_json::from_str::<Value>(&format!("{buffer}\"}}")).ok()
}

/// Clamps a citation span to the text it is being resolved against.
///
/// Offsets are pulled onto char boundaries and bounded by the text length;
/// spans that collapse to nothing are dropped.
fn clamp_citation(mut citation: Citation, text: &str) -> Option<Citation> {
    let mut start = citation.start.min(text.len());
    let mut end = citation.end.min(text.len());
    while start > 0 && !text.is_char_boundary(start) {
        start -= 1;
    }
    while end < text.len() && !text.is_char_boundary(end) {
        end += 1;
    }
    if start >= end {
        tracing::warn!(
            start = citation.start,
            end = citation.end,
            text_len = text.len(),
            "dropping citation span outside the accumulated text"
        );
        return None;
    }
    citation.start = start;
    citation.end = end;
    Some(citation)
}

/// Injects citation markers into the display text as inline links keyed the
/// same way citations are registered in the citation store.
///
/// Overlapping spans keep the earlier citation; later overlapping spans stay
/// in the citation list but are not marked inline.
fn inject_citation_markers(
    text: &str,
    citations: &[Citation],
    generation_id: Option<&GenerationId>,
) -> String {
    let generation = generation_id.map(|id| id.as_str()).unwrap_or_default();
    let mut output = String::with_capacity(text.len());
    let mut cursor = 0usize;

    for citation in citations {
        if citation.start < cursor || citation.end > text.len() {
            continue;
        }
        output.push_str(&text[cursor..citation.start]);
        output.push('[');
        output.push_str(&text[citation.start..citation.end]);
        output.push_str("](cite://");
        output.push_str(generation);
        output.push('/');
        output.push_str(&citation.span_key());
        output.push(')');
        cursor = citation.end;
    }
    output.push_str(&text[cursor..]);
    output
}

/// Harvests decoded output files from code-execution documents.
fn collect_output_files(documents: &[Document]) -> Vec<OutputFile> {
    let mut files = Vec::new();
    for document in documents {
        if !document.is_code_execution() {
            continue;
        }
        let Some(raw) = document.fields.get("output_file") else {
            continue;
        };
        // The payload arrives either inline or as a JSON-encoded string.
        let payload = match raw {
            Value::String(encoded) => match serde_json::from_str::<Value>(encoded) {
                Ok(parsed) => parsed,
                Err(error) => {
                    tracing::warn!(
                        document_id = %document.document_id,
                        error = %error,
                        "skipping undecodable output-file payload"
                    );
                    continue;
                }
            },
            other => other.clone(),
        };
        let Some(name) = payload.get("filename").and_then(Value::as_str) else {
            continue;
        };
        let Some(encoded) = payload.get("b64_data").and_then(Value::as_str) else {
            continue;
        };
        match BASE64.decode(encoded) {
            Ok(data) => files.push(OutputFile {
                name: name.to_string(),
                data,
                document_id: Some(document.document_id.clone()),
            }),
            Err(error) => {
                tracing::warn!(
                    document_id = %document.document_id,
                    error = %error,
                    "skipping output file with invalid base64 data"
                );
            }
        }
    }
    files
}
