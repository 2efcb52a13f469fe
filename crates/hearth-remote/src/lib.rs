//! Update transport for hearth: where new releases come from.
//!
//! An [`UpdateSource`] lists the releases published for a service identity
//! and fetches the artifact bytes of one of them. Two sources ship here: an
//! [`HttpSource`] speaking the feed protocol served by `hearth-server`, and a
//! [`DirectorySource`] reading the same layout from a local directory.

pub mod config;
pub mod directory;
pub mod http;

pub use config::FeedConfig;
pub use directory::DirectorySource;
pub use http::HttpSource;

use hearth_schema::{ArtifactDigest, ServiceIdentity, Version};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Protocol version sent as `X-Hearth-Protocol` header on all HTTP requests.
pub const PROTOCOL_VERSION: u32 = 1;
pub const PROTOCOL_HEADER: &str = "X-Hearth-Protocol";

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("remote I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("HTTP error: {0}")]
    Http(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("feed config error: {0}")]
    Config(String),
    #[error("integrity failure for '{key}': expected {expected}, got {actual}")]
    IntegrityFailure {
        key: String,
        expected: String,
        actual: String,
    },
}

/// One published version of a service artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Release {
    pub version: Version,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub released: Option<String>,
    pub digest: ArtifactDigest,
    pub size: u64,
}

impl Release {
    /// Describe `data` as the artifact of `version`.
    pub fn for_artifact(version: Version, data: &[u8]) -> Self {
        Self {
            version,
            released: None,
            digest: ArtifactDigest::of(data),
            size: data.len() as u64,
        }
    }

    /// Check fetched bytes against the advertised size and digest.
    pub fn verify(&self, data: &[u8]) -> Result<(), RemoteError> {
        if data.len() as u64 != self.size {
            return Err(RemoteError::IntegrityFailure {
                key: self.digest.to_string(),
                expected: format!("{} bytes", self.size),
                actual: format!("{} bytes", data.len()),
            });
        }
        let actual = ArtifactDigest::of(data);
        if actual != self.digest {
            return Err(RemoteError::IntegrityFailure {
                key: self.digest.to_string(),
                expected: self.digest.to_string(),
                actual: actual.into_inner(),
            });
        }
        Ok(())
    }
}

/// Source of releases for the update protocol.
pub trait UpdateSource: Send + Sync {
    /// All releases published for `identity`, in no particular order.
    fn list_releases(&self, identity: &ServiceIdentity) -> Result<Vec<Release>, RemoteError>;

    /// Download the artifact of `release`.
    fn fetch_artifact(&self, release: &Release) -> Result<Vec<u8>, RemoteError>;
}

/// The highest release strictly newer than `current`.
pub fn newest_release<'a>(releases: &'a [Release], current: &Version) -> Option<&'a Release> {
    releases
        .iter()
        .filter(|r| r.version > *current)
        .max_by(|a, b| a.version.cmp(&b.version))
}

/// Add `release` to a listing, replacing any entry with the same version.
/// The listing stays sorted by version.
pub fn merge_release(listing: &mut Vec<Release>, release: Release) {
    listing.retain(|r| r.version != release.version);
    listing.push(release);
    listing.sort_by(|a, b| a.version.cmp(&b.version));
}

/// Pick a source for a manifest `feed` value: http(s) URLs use [`HttpSource`],
/// anything else is treated as a directory path.
pub fn source_for_feed(
    feed: &str,
    auth_token: Option<&str>,
    proxy_url: Option<&str>,
) -> Result<Box<dyn UpdateSource>, RemoteError> {
    if feed.starts_with("http://") || feed.starts_with("https://") {
        let mut config = FeedConfig::new(feed);
        if let Some(token) = auth_token {
            config = config.with_token(token);
        }
        let source = match proxy_url {
            Some(proxy) => HttpSource::with_proxy(config, proxy)?,
            None => HttpSource::new(config),
        };
        Ok(Box::new(source))
    } else {
        Ok(Box::new(DirectorySource::new(feed)))
    }
}
