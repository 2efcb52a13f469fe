use crate::RemoteError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Endpoint and credentials of an HTTP update feed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedConfig {
    pub url: String,
    #[serde(default)]
    pub auth_token: Option<String>,
}

impl FeedConfig {
    pub fn new(url: &str) -> Self {
        Self {
            url: url.trim_end_matches('/').to_owned(),
            auth_token: None,
        }
    }

    #[must_use]
    pub fn with_token(mut self, token: &str) -> Self {
        self.auth_token = Some(token.to_owned());
        self
    }

    /// Load config from `~/.config/hearth/feed.json`.
    pub fn load_default() -> Result<Self, RemoteError> {
        let path = default_config_path()?;
        Self::load(&path)
    }

    pub fn load(path: &Path) -> Result<Self, RemoteError> {
        let content = std::fs::read_to_string(path)?;
        let mut config: Self = serde_json::from_str(&content)
            .map_err(|e| RemoteError::Config(format!("invalid feed config: {e}")))?;
        config.url = config.url.trim_end_matches('/').to_owned();
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<(), RemoteError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(self)
            .map_err(|e| RemoteError::Serialization(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }
}

pub fn default_config_path() -> Result<PathBuf, RemoteError> {
    let home = std::env::var("HOME").map_err(|_| RemoteError::Config("HOME not set".to_owned()))?;
    Ok(PathBuf::from(home).join(".config/hearth/feed.json"))
}
