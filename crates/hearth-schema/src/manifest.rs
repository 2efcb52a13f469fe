use crate::identity::ServiceIdentity;
use crate::product::ProductCard;
use crate::version::Version;
use crate::SchemaError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

pub const MANIFEST_FILE: &str = "hearth.toml";
pub const MIN_WORKERS: usize = 2;

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("failed to read manifest file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse manifest: {0}")]
    ParseToml(#[from] toml::de::Error),
    #[error("unsupported manifest_version: {0}, expected 1")]
    UnsupportedVersion(u32),
    #[error("service.name must not be empty")]
    EmptyName,
    #[error("runtime.workers must be at least {MIN_WORKERS}, got {0}")]
    TooFewWorkers(usize),
    #[error("update.interval_secs must be positive for the scheduled policy")]
    ZeroInterval,
    #[error("invalid service field: {0}")]
    Schema(#[from] SchemaError),
}

/// When the runtime looks for updates on its own.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum UpdatePolicy {
    #[default]
    OnStartup,
    Scheduled,
    Manual,
    Disabled,
}

impl FromStr for UpdatePolicy {
    type Err = SchemaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "on-startup" => Ok(Self::OnStartup),
            "scheduled" => Ok(Self::Scheduled),
            "manual" => Ok(Self::Manual),
            "disabled" => Ok(Self::Disabled),
            other => Err(SchemaError::InvalidPolicy(other.to_owned())),
        }
    }
}

impl fmt::Display for UpdatePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OnStartup => f.write_str("on-startup"),
            Self::Scheduled => f.write_str("scheduled"),
            Self::Manual => f.write_str("manual"),
            Self::Disabled => f.write_str("disabled"),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ServiceManifest {
    pub manifest_version: u32,
    pub service: ServiceSection,
    #[serde(default)]
    pub runtime: RuntimeSection,
    #[serde(default)]
    pub update: UpdateSection,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ServiceSection {
    pub namespace: String,
    pub artifact: String,
    pub name: String,
    pub version: Version,
    #[serde(default)]
    pub released: Option<String>,
    #[serde(default)]
    pub descriptor: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct RuntimeSection {
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default)]
    pub runtime_dir: Option<PathBuf>,
    #[serde(default = "default_peer_retries")]
    pub peer_retries: u32,
    #[serde(default = "default_peer_retry_delay_ms")]
    pub peer_retry_delay_ms: u64,
    #[serde(default = "default_ack_timeout_ms")]
    pub ack_timeout_ms: u64,
}

impl Default for RuntimeSection {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            runtime_dir: None,
            peer_retries: default_peer_retries(),
            peer_retry_delay_ms: default_peer_retry_delay_ms(),
            ack_timeout_ms: default_ack_timeout_ms(),
        }
    }
}

impl RuntimeSection {
    pub fn peer_retry_delay(&self) -> Duration {
        Duration::from_millis(self.peer_retry_delay_ms)
    }

    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct UpdateSection {
    #[serde(default)]
    pub policy: UpdatePolicy,
    #[serde(default)]
    pub interval_secs: Option<u64>,
    /// http(s) URL or local directory of an update feed.
    #[serde(default)]
    pub feed: Option<String>,
    /// Installed artifact replaced on apply. Defaults to the running executable.
    #[serde(default)]
    pub target: Option<PathBuf>,
}

impl UpdateSection {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.unwrap_or(3600))
    }
}

fn default_workers() -> usize {
    4
}

fn default_peer_retries() -> u32 {
    20
}

fn default_peer_retry_delay_ms() -> u64 {
    100
}

fn default_ack_timeout_ms() -> u64 {
    5000
}

impl ServiceManifest {
    /// Reject manifests that parse but cannot be run.
    pub fn validate(&self) -> Result<(), ManifestError> {
        if self.manifest_version != 1 {
            return Err(ManifestError::UnsupportedVersion(self.manifest_version));
        }
        if self.service.name.trim().is_empty() {
            return Err(ManifestError::EmptyName);
        }
        if self.runtime.workers < MIN_WORKERS {
            return Err(ManifestError::TooFewWorkers(self.runtime.workers));
        }
        if self.update.policy == UpdatePolicy::Scheduled && self.update.interval_secs == Some(0) {
            return Err(ManifestError::ZeroInterval);
        }
        self.identity()?;
        Ok(())
    }

    pub fn identity(&self) -> Result<ServiceIdentity, ManifestError> {
        Ok(ServiceIdentity::new(
            &self.service.namespace,
            &self.service.artifact,
        )?)
    }

    pub fn product_card(&self) -> Result<ProductCard, ManifestError> {
        let mut card = ProductCard::new(
            self.identity()?,
            &self.service.name,
            self.service.version.clone(),
        );
        card.released.clone_from(&self.service.released);
        card.descriptor.clone_from(&self.service.descriptor);
        Ok(card)
    }
}

pub fn parse_manifest_str(input: &str) -> Result<ServiceManifest, ManifestError> {
    let manifest: ServiceManifest = toml::from_str(input)?;
    manifest.validate()?;
    Ok(manifest)
}

pub fn parse_manifest_file(path: impl AsRef<Path>) -> Result<ServiceManifest, ManifestError> {
    let content = fs::read_to_string(path)?;
    parse_manifest_str(&content)
}
