use lesson_sync_core::Lesson;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Port the app listens on unless told otherwise.
pub const DEFAULT_PORT: u16 = 8080;

/// Seed data and identity for one peer.
///
/// Loaded from a JSON seed file:
/// `{"username": "...", "port": 8080, "preferences": ["2"], "lessons": [...]}`.
/// Every field is optional.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct SyncConfig {
    /// Display name announced to peers (generated if missing)
    #[serde(default = "default_username")]
    pub username: String,
    /// Listen and advertise port
    #[serde(default = "default_port")]
    pub port: u16,
    /// Lessons this peer starts with
    #[serde(default)]
    pub lessons: Vec<Lesson>,
    /// Topic ids this peer wants to pull
    #[serde(default)]
    pub preferences: Vec<String>,
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

/// `peer-xxxxxxxx` from a fresh UUID.
pub fn default_username() -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    format!("peer-{}", &id[..8])
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            username: default_username(),
            port: default_port(),
            lessons: Vec::new(),
            preferences: Vec::new(),
        }
    }
}

impl SyncConfig {
    /// Load and validate a seed file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&text)
    }

    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.username.trim().is_empty() {
            return Err(ConfigError::EmptyUsername);
        }
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read seed file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid seed file: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Username must not be empty")]
    EmptyUsername,
}
