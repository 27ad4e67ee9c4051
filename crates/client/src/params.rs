use std::sync::Arc;

use arc_swap::ArcSwap;
use serde_json::Value;

/// Backend default temperature when the user never touched the slider.
pub const DEFAULT_CHAT_TEMPERATURE: f64 = 0.3;

/// Tools every request carries in addition to the user's selection.
pub const DEFAULT_AGENT_TOOLS: [&str; 3] = ["search_file", "read_document", "web_scrape"];

/// Configurable request parameters the session reads per submit.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatParams {
    pub model: Option<String>,
    pub temperature: Option<f64>,
    pub preamble: Option<String>,
    pub tools: Vec<String>,
    pub file_ids: Vec<String>,
    pub interviews: Vec<Value>,
    pub deployment: Option<String>,
    pub deployment_config: Option<String>,
}

impl Default for ChatParams {
    fn default() -> Self {
        Self {
            model: None,
            temperature: Some(DEFAULT_CHAT_TEMPERATURE),
            preamble: None,
            tools: Vec::new(),
            file_ids: Vec::new(),
            interviews: Vec::new(),
            deployment: None,
            deployment_config: None,
        }
    }
}

/// Per-submit overrides layered on top of the stored params.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChatOverrides {
    pub model: Option<String>,
    pub temperature: Option<f64>,
    pub preamble: Option<String>,
    pub tools: Option<Vec<String>>,
    pub interviews: Option<Vec<Value>>,
}

/// Hot-swappable parameter store shared between the UI surface and the
/// session; reads are lock-free.
#[derive(Debug, Default)]
pub struct ParamsStore {
    params: ArcSwap<ChatParams>,
}

impl ParamsStore {
    pub fn new(params: ChatParams) -> Self {
        Self {
            params: ArcSwap::from_pointee(params),
        }
    }

    pub fn current(&self) -> Arc<ChatParams> {
        self.params.load_full()
    }

    pub fn set(&self, params: ChatParams) {
        self.params.store(Arc::new(params));
    }

    /// Applies a partial update against the current value.
    pub fn update(&self, apply: impl FnOnce(&mut ChatParams)) {
        let mut next = (*self.params.load_full()).clone();
        apply(&mut next);
        self.params.store(Arc::new(next));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_params_carry_backend_temperature() {
        let params = ChatParams::default();
        assert_eq!(params.temperature, Some(DEFAULT_CHAT_TEMPERATURE));
        assert!(params.tools.is_empty());
    }

    #[test]
    fn update_swaps_in_a_modified_copy() {
        let store = ParamsStore::default();
        store.update(|params| params.tools.push("web_search".to_string()));
        assert_eq!(store.current().tools, vec!["web_search".to_string()]);
    }
}
