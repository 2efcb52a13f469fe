//! Durable state owned by the hearth service runtime.
//!
//! Everything lives below one [`RuntimeLayout`] per service identity: the
//! pending [`UpdateRecord`] and its [`StagingArea`], the [`ApplyJournal`]
//! that makes artifact swaps recoverable, the pid/status files of the
//! primary, and the hierarchical [`SettingsStore`]. All writes go through a
//! temporary file in the destination directory followed by a rename.

pub mod journal;
pub mod layout;
pub mod proxy;
pub mod records;
pub mod settings;
pub mod staging;
pub mod status;

pub use journal::{ApplyJournal, JournalEntry, JournalPhase, RecoveryReport, RollbackStep};
pub use layout::{RuntimeLayout, LAYOUT_FORMAT_VERSION};
pub use proxy::{ProxyCredentials, ProxySettings};
pub use records::{RecordStore, UpdateRecord};
pub use settings::{SettingsNode, SettingsStore, UPDATE_POLICY_KEY};
pub use staging::StagingArea;
pub use status::{StatusFiles, StatusSnapshot};

use std::path::Path;
use thiserror::Error;

/// Fsync a directory so that a preceding `rename()` is durable.
///
/// POSIX does not promise a rename survives a crash until the parent
/// directory itself has been synced.
pub(crate) fn fsync_dir(dir: &Path) -> Result<(), std::io::Error> {
    let f = std::fs::File::open(dir)?;
    f.sync_all()
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("integrity check failed for '{key}': expected {expected}, got {actual}")]
    IntegrityFailure {
        key: String,
        expected: String,
        actual: String,
    },
    #[error("size mismatch for '{key}': expected {expected} bytes, got {actual}")]
    SizeMismatch {
        key: String,
        expected: u64,
        actual: u64,
    },
    #[error("staged artifact not found: {0}")]
    ArtifactNotFound(String),
    #[error("runtime directory format version mismatch: expected {expected}, found {found}")]
    VersionMismatch { expected: u32, found: u32 },
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("invalid settings key: {0:?}")]
    InvalidKey(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_error_display_integrity_failure() {
        let e = StoreError::IntegrityFailure {
            key: "pending.json".to_owned(),
            expected: "exp".to_owned(),
            actual: "act".to_owned(),
        };
        let msg = e.to_string();
        assert!(msg.contains("pending.json"));
        assert!(msg.contains("exp"));
        assert!(msg.contains("act"));
    }

    #[test]
    fn store_error_display_size_mismatch() {
        let e = StoreError::SizeMismatch {
            key: "d".to_owned(),
            expected: 10,
            actual: 3,
        };
        let msg = e.to_string();
        assert!(msg.contains("10"));
        assert!(msg.contains('3'));
    }

    #[test]
    fn store_error_display_version_mismatch() {
        let e = StoreError::VersionMismatch {
            expected: 2,
            found: 1,
        };
        let msg = e.to_string();
        assert!(msg.contains('2'));
        assert!(msg.contains('1'));
    }

    #[test]
    fn store_error_display_invalid_key() {
        let e = StoreError::InvalidKey("a//b".to_owned());
        assert!(e.to_string().contains("a//b"));
    }
}
