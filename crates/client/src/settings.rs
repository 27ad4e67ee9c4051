use std::path::PathBuf;
use std::sync::Arc;

use arc_swap::ArcSwap;
use figment::Figment;
use figment::providers::{Env, Format, Json, Serialized};
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};

use salon_transport::{DeploymentHeaders, TransportConfig};

/// Default backend origin for local development.
pub const DEFAULT_BASE_URL: &str = "http://localhost:8000";
/// Delay before a freshly generated title starts typing in, so the list
/// animation finishes first.
pub const DEFAULT_TITLE_REVEAL_DELAY_MS: u64 = 1500;
/// Interval between typed title characters.
pub const DEFAULT_TYPING_VELOCITY_MS: u64 = 35;

/// Settings that persist across client restarts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientSettings {
    pub base_url: String,
    pub auth_token: String,
    pub deployment: String,
    pub deployment_config: String,
    pub agent_id: String,
    pub title_reveal_delay_ms: u64,
    pub title_typing_interval_ms: u64,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            auth_token: String::new(),
            deployment: String::new(),
            deployment_config: String::new(),
            agent_id: String::new(),
            title_reveal_delay_ms: DEFAULT_TITLE_REVEAL_DELAY_MS,
            title_typing_interval_ms: DEFAULT_TYPING_VELOCITY_MS,
        }
    }
}

impl ClientSettings {
    /// Returns a copy with every text field trimmed.
    pub fn normalized(&self) -> Self {
        Self {
            base_url: self.base_url.trim().to_string(),
            auth_token: self.auth_token.trim().to_string(),
            deployment: self.deployment.trim().to_string(),
            deployment_config: self.deployment_config.trim().to_string(),
            agent_id: self.agent_id.trim().to_string(),
            ..self.clone()
        }
    }

    pub fn to_transport_config(&self) -> TransportConfig {
        TransportConfig {
            base_url: self.base_url.clone(),
            auth_token: (!self.auth_token.is_empty()).then(|| self.auth_token.clone()),
        }
    }

    pub fn deployment_headers(&self) -> DeploymentHeaders {
        DeploymentHeaders {
            name: (!self.deployment.is_empty()).then(|| self.deployment.clone()),
            config: (!self.deployment_config.is_empty()).then(|| self.deployment_config.clone()),
        }
    }

    pub fn agent_id(&self) -> Option<String> {
        (!self.agent_id.is_empty()).then(|| self.agent_id.clone())
    }
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum SettingsError {
    #[snafu(display("failed to create config directory at {path:?}"))]
    CreateDir {
        stage: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("failed to serialize settings"))]
    SerializeConfig {
        stage: &'static str,
        source: serde_json::Error,
    },
    #[snafu(display("failed to write settings file to {path:?}"))]
    WriteFile {
        stage: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("failed to move settings file from {from:?} to {to:?}"))]
    RenameTempFile {
        stage: &'static str,
        from: PathBuf,
        to: PathBuf,
        source: std::io::Error,
    },
}

/// Settings persistence with lock-free reads.
///
/// Defaults are overlaid with the JSON config file and then with
/// `SALON_`-prefixed environment variables, so deployments can configure the
/// client without touching disk.
pub struct SettingsStore {
    settings: ArcSwap<ClientSettings>,
    config_path: PathBuf,
}

impl SettingsStore {
    /// Returns the default config file path in the user's config directory.
    pub fn default_config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("salon")
            .join("settings.json")
    }

    pub fn new(config_path: PathBuf) -> Self {
        let settings = Self::load_from_disk(&config_path);
        Self {
            settings: ArcSwap::from_pointee(settings),
            config_path,
        }
    }

    pub fn load() -> Self {
        Self::new(Self::default_config_path())
    }

    pub fn settings(&self) -> Arc<ClientSettings> {
        self.settings.load_full()
    }

    /// Persists and swaps in new settings.
    pub fn update(&self, settings: ClientSettings) -> Result<(), SettingsError> {
        let normalized = settings.normalized();
        self.persist(&normalized)?;
        self.settings.store(Arc::new(normalized));
        Ok(())
    }

    fn load_from_disk(path: &PathBuf) -> ClientSettings {
        let figment = Figment::from(Serialized::defaults(ClientSettings::default()))
            .merge(Json::file(path))
            .merge(Env::prefixed("SALON_"));

        match figment.extract::<ClientSettings>() {
            Ok(settings) => settings.normalized(),
            Err(error) => {
                tracing::warn!(
                    "failed to parse settings from {:?}: {}. using defaults",
                    path,
                    error
                );
                ClientSettings::default()
            }
        }
    }

    fn persist(&self, settings: &ClientSettings) -> Result<(), SettingsError> {
        if let Some(parent) = self.config_path.parent() {
            std::fs::create_dir_all(parent).context(CreateDirSnafu {
                stage: "create-settings-directory",
                path: parent.to_path_buf(),
            })?;
        }

        let content = serde_json::to_string_pretty(settings).context(SerializeConfigSnafu {
            stage: "serialize-settings-json",
        })?;

        let temp_path = self.config_path.with_extension("json.tmp");
        std::fs::write(&temp_path, content).context(WriteFileSnafu {
            stage: "write-temporary-settings-file",
            path: temp_path.clone(),
        })?;

        std::fs::rename(&temp_path, &self.config_path).context(RenameTempFileSnafu {
            stage: "rename-temporary-settings-file",
            from: temp_path,
            to: self.config_path.clone(),
        })?;

        tracing::info!("saved settings to {:?}", self.config_path);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_config_path(tag: &str) -> PathBuf {
        std::env::temp_dir()
            .join(format!("salon-settings-test-{}-{tag}", std::process::id()))
            .join("settings.json")
    }

    #[test]
    fn missing_file_yields_defaults() {
        let store = SettingsStore::new(temp_config_path("missing"));
        let settings = store.settings();
        assert_eq!(settings.base_url, DEFAULT_BASE_URL);
        assert_eq!(settings.title_typing_interval_ms, DEFAULT_TYPING_VELOCITY_MS);
    }

    #[test]
    fn update_persists_and_reloads() {
        let path = temp_config_path("roundtrip");
        let store = SettingsStore::new(path.clone());

        let settings = ClientSettings {
            base_url: " http://salon.internal ".to_string(),
            deployment: "TGI".to_string(),
            ..ClientSettings::default()
        };
        store.update(settings).unwrap();

        // Normalization trims before persisting.
        assert_eq!(store.settings().base_url, "http://salon.internal");

        let reloaded = SettingsStore::new(path);
        assert_eq!(reloaded.settings().deployment, "TGI");
    }

    #[test]
    fn empty_fields_map_to_absent_transport_options() {
        let settings = ClientSettings::default();
        assert!(settings.to_transport_config().auth_token.is_none());
        assert_eq!(settings.deployment_headers(), DeploymentHeaders::default());
        assert!(settings.agent_id().is_none());
    }
}
