/// Hot-swappable per-request chat parameters.
pub mod params;
/// Stdout rendering of streaming snapshots.
pub mod render;
/// Chat session orchestration: submit, stop, retry, regenerate, titles.
pub mod session;
/// Persisted client settings.
pub mod settings;

pub use params::{ChatOverrides, ChatParams, DEFAULT_AGENT_TOOLS, ParamsStore};
pub use render::StdoutStreamingPrinter;
pub use session::{
    ChatSession, SessionConfig, SessionStores, SubmitOutcome, TitleTimings, USER_ERROR_MESSAGE,
};
pub use settings::{ClientSettings, SettingsError, SettingsStore};
