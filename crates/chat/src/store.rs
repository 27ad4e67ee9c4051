use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use crate::event::{Document, SearchResult};
use crate::fold::OutputFile;
use crate::ids::{ConversationId, DocumentId, GenerationId};
use crate::message::{ChatMessage, LiveMessage, UserMessage};

/// Read-only view of the active conversation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConversationSnapshot {
    pub id: Option<ConversationId>,
    pub title: String,
    pub messages: Vec<ChatMessage>,
    pub pending: Option<UserMessage>,
}

/// Owns the active conversation's message list and routing state.
pub trait ConversationStore: Send + Sync {
    fn snapshot(&self) -> ConversationSnapshot;
    fn replace_messages(&self, messages: Vec<ChatMessage>);
    fn set_id(&self, id: ConversationId);
    fn set_title(&self, title: String);
    fn set_pending(&self, pending: Option<UserMessage>);
    /// Flags the cross-conversation list as stale so it gets refetched.
    fn invalidate_list(&self);
    /// Activates another conversation, clearing per-conversation state.
    fn switch_to(&self, id: Option<ConversationId>);
}

/// Owns citation-to-document mappings, cumulative per conversation.
pub trait CitationStore: Send + Sync {
    /// Registers the documents backing one cited span of one generation.
    fn add_citation(&self, generation_id: &GenerationId, span_key: &str, documents: Vec<Document>);
    fn add_search_results(&self, results: &[SearchResult]);
    fn save_output_file(&self, file: OutputFile);
    /// Clears everything; only called on conversation switch.
    fn reset(&self);
    fn citations_for(&self, generation_id: &GenerationId) -> HashMap<String, Vec<Document>>;
    fn has_citations(&self) -> bool;
}

/// Holds the in-progress message snapshot the UI renders while streaming.
pub trait StreamingStore: Send + Sync {
    fn publish(&self, message: LiveMessage);
    fn clear(&self);
    fn current(&self) -> Option<LiveMessage>;
}

// Poisoning carries no meaning for these stores; the last consistent value
// is always safe to hand out.
fn read_lock<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write_lock<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Default)]
struct ConversationState {
    snapshot: ConversationSnapshot,
    list_revision: u64,
}

/// In-memory [`ConversationStore`].
#[derive(Debug, Default)]
pub struct MemoryConversationStore {
    state: RwLock<ConversationState>,
}

impl MemoryConversationStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Monotonic counter bumped by [`ConversationStore::invalidate_list`];
    /// list views refetch when it moves.
    pub fn list_revision(&self) -> u64 {
        read_lock(&self.state).list_revision
    }
}

impl ConversationStore for MemoryConversationStore {
    fn snapshot(&self) -> ConversationSnapshot {
        read_lock(&self.state).snapshot.clone()
    }

    fn replace_messages(&self, messages: Vec<ChatMessage>) {
        write_lock(&self.state).snapshot.messages = messages;
    }

    fn set_id(&self, id: ConversationId) {
        write_lock(&self.state).snapshot.id = Some(id);
    }

    fn set_title(&self, title: String) {
        write_lock(&self.state).snapshot.title = title;
    }

    fn set_pending(&self, pending: Option<UserMessage>) {
        write_lock(&self.state).snapshot.pending = pending;
    }

    fn invalidate_list(&self) {
        write_lock(&self.state).list_revision += 1;
    }

    fn switch_to(&self, id: Option<ConversationId>) {
        let mut state = write_lock(&self.state);
        state.snapshot = ConversationSnapshot {
            id,
            ..ConversationSnapshot::default()
        };
    }
}

#[derive(Debug, Default)]
struct CitationState {
    references: HashMap<GenerationId, HashMap<String, Vec<Document>>>,
    search_results: HashMap<DocumentId, SearchResult>,
    output_files: HashMap<String, OutputFile>,
    has_citations: bool,
}

/// In-memory [`CitationStore`].
#[derive(Debug, Default)]
pub struct MemoryCitationStore {
    state: RwLock<CitationState>,
}

impl MemoryCitationStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn output_file(&self, name: &str) -> Option<OutputFile> {
        read_lock(&self.state).output_files.get(name).cloned()
    }

    pub fn search_result(&self, document_id: &DocumentId) -> Option<SearchResult> {
        read_lock(&self.state)
            .search_results
            .get(document_id)
            .cloned()
    }
}

impl CitationStore for MemoryCitationStore {
    fn add_citation(&self, generation_id: &GenerationId, span_key: &str, documents: Vec<Document>) {
        let mut state = write_lock(&self.state);
        state
            .references
            .entry(generation_id.clone())
            .or_default()
            .insert(span_key.to_string(), documents);
        state.has_citations = true;
    }

    fn add_search_results(&self, results: &[SearchResult]) {
        let mut state = write_lock(&self.state);
        for result in results {
            for document_id in &result.document_ids {
                state
                    .search_results
                    .insert(document_id.clone(), result.clone());
            }
        }
    }

    fn save_output_file(&self, file: OutputFile) {
        write_lock(&self.state)
            .output_files
            .insert(file.name.clone(), file);
    }

    fn reset(&self) {
        *write_lock(&self.state) = CitationState::default();
    }

    fn citations_for(&self, generation_id: &GenerationId) -> HashMap<String, Vec<Document>> {
        read_lock(&self.state)
            .references
            .get(generation_id)
            .cloned()
            .unwrap_or_default()
    }

    fn has_citations(&self) -> bool {
        read_lock(&self.state).has_citations
    }
}

/// In-memory [`StreamingStore`].
#[derive(Debug, Default)]
pub struct MemoryStreamingStore {
    current: RwLock<Option<LiveMessage>>,
}

impl MemoryStreamingStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StreamingStore for MemoryStreamingStore {
    fn publish(&self, message: LiveMessage) {
        *write_lock(&self.current) = Some(message);
    }

    fn clear(&self) {
        *write_lock(&self.current) = None;
    }

    fn current(&self) -> Option<LiveMessage> {
        read_lock(&self.current).clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn citation_references_are_keyed_by_generation_then_span() {
        let store = MemoryCitationStore::new();
        let generation = GenerationId::new("gen-1");
        store.add_citation(&generation, "0-4", vec![Document::new("doc_1")]);
        store.add_citation(&generation, "9-14", vec![]);

        let spans = store.citations_for(&generation);
        assert_eq!(spans.len(), 2);
        assert_eq!(spans["0-4"][0].document_id.as_str(), "doc_1");
        assert!(store.has_citations());
    }

    #[test]
    fn re_registering_a_span_overwrites_its_documents() {
        let store = MemoryCitationStore::new();
        let generation = GenerationId::new("gen-1");
        store.add_citation(&generation, "0-4", vec![]);
        store.add_citation(&generation, "0-4", vec![Document::new("doc_late")]);

        let spans = store.citations_for(&generation);
        assert_eq!(spans["0-4"].len(), 1);
    }

    #[test]
    fn search_results_fan_out_per_document_id() {
        let store = MemoryCitationStore::new();
        let result = SearchResult {
            document_ids: vec![DocumentId::new("doc_1"), DocumentId::new("doc_2")],
            ..SearchResult::default()
        };
        store.add_search_results(&[result]);
        assert!(store.search_result(&DocumentId::new("doc_1")).is_some());
        assert!(store.search_result(&DocumentId::new("doc_2")).is_some());
    }

    #[test]
    fn conversation_switch_clears_messages_and_title() {
        let store = MemoryConversationStore::new();
        store.set_title("First".to_string());
        store.replace_messages(vec![ChatMessage::user("hello")]);
        store.switch_to(Some(ConversationId::new("conv-2")));

        let snapshot = store.snapshot();
        assert_eq!(snapshot.id, Some(ConversationId::new("conv-2")));
        assert!(snapshot.messages.is_empty());
        assert!(snapshot.title.is_empty());
    }

    #[test]
    fn list_invalidation_bumps_revision() {
        let store = MemoryConversationStore::new();
        assert_eq!(store.list_revision(), 0);
        store.invalidate_list();
        store.invalidate_list();
        assert_eq!(store.list_revision(), 2);
    }

    #[test]
    fn streaming_store_holds_at_most_one_snapshot() {
        let store = MemoryStreamingStore::new();
        assert!(store.current().is_none());
        store.publish(LiveMessage::loading());
        assert!(store.current().is_some());
        store.clear();
        assert!(store.current().is_none());
    }
}
