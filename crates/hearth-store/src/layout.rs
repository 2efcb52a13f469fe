use crate::StoreError;
use hearth_schema::ServiceIdentity;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

/// Current runtime directory format version. Incremented on incompatible layout changes.
pub const LAYOUT_FORMAT_VERSION: u32 = 1;
const VERSION_FILE: &str = "version";

/// Directory layout owned by one product's runtime.
///
/// Holds the instance lock, the command channel endpoint, the pid and status
/// files, the settings file and everything the update protocol persists.
/// All subdirectories are created lazily on [`initialize`](Self::initialize).
#[derive(Debug, Clone)]
pub struct RuntimeLayout {
    root: PathBuf,
}

#[derive(Debug, Serialize, Deserialize)]
struct LayoutVersion {
    format_version: u32,
}

impl RuntimeLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// `<base>/<namespace>/<artifact>`: unrelated products never share a directory.
    pub fn for_identity(base: impl AsRef<Path>, identity: &ServiceIdentity) -> Self {
        Self::new(
            base.as_ref()
                .join(identity.namespace().as_str())
                .join(identity.artifact().as_str()),
        )
    }

    #[inline]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[inline]
    pub fn lock_file(&self) -> PathBuf {
        self.root.join("instance.lock")
    }

    #[inline]
    pub fn pid_file(&self) -> PathBuf {
        self.root.join("instance.pid")
    }

    #[inline]
    pub fn status_file(&self) -> PathBuf {
        self.root.join("status.json")
    }

    /// Unix socket of the primary's command channel.
    #[inline]
    pub fn socket_path(&self) -> PathBuf {
        self.root.join("channel.sock")
    }

    /// Loopback port of the command channel on platforms without Unix sockets.
    #[inline]
    pub fn channel_port_file(&self) -> PathBuf {
        self.root.join("channel.port")
    }

    #[inline]
    pub fn settings_file(&self) -> PathBuf {
        self.root.join("settings.json")
    }

    #[inline]
    pub fn update_dir(&self) -> PathBuf {
        self.root.join("update")
    }

    /// Verified artifacts waiting to be applied, named by digest.
    #[inline]
    pub fn staging_dir(&self) -> PathBuf {
        self.update_dir().join("staging")
    }

    #[inline]
    pub fn records_dir(&self) -> PathBuf {
        self.update_dir().join("records")
    }

    #[inline]
    pub fn journal_dir(&self) -> PathBuf {
        self.update_dir().join("journal")
    }

    /// Copies of replaced artifacts, kept until an apply commits.
    #[inline]
    pub fn backup_dir(&self) -> PathBuf {
        self.update_dir().join("backup")
    }

    /// Written by a successful apply, consumed by the next launch.
    #[inline]
    pub fn applied_marker(&self) -> PathBuf {
        self.update_dir().join("applied.json")
    }

    /// Present while a running primary has asked for its staged update to be applied.
    #[inline]
    pub fn apply_request_file(&self) -> PathBuf {
        self.update_dir().join("apply.pending")
    }

    pub fn initialize(&self) -> Result<(), StoreError> {
        fs::create_dir_all(&self.root)?;
        fs::create_dir_all(self.staging_dir())?;
        fs::create_dir_all(self.records_dir())?;
        fs::create_dir_all(self.journal_dir())?;
        fs::create_dir_all(self.backup_dir())?;

        let version_path = self.root.join(VERSION_FILE);
        if version_path.exists() {
            self.verify_version()?;
        } else {
            let ver = LayoutVersion {
                format_version: LAYOUT_FORMAT_VERSION,
            };
            let content = serde_json::to_string_pretty(&ver)?;
            let mut tmp = NamedTempFile::new_in(&self.root)?;
            tmp.write_all(content.as_bytes())?;
            tmp.as_file().sync_all()?;
            tmp.persist(&version_path)
                .map_err(|e| StoreError::Io(e.error))?;
            crate::fsync_dir(&self.root)?;
        }

        Ok(())
    }

    pub fn verify_version(&self) -> Result<(), StoreError> {
        let version_path = self.root.join(VERSION_FILE);
        let content = fs::read_to_string(&version_path)?;
        let ver: LayoutVersion = serde_json::from_str(&content)?;

        if ver.format_version != LAYOUT_FORMAT_VERSION {
            return Err(StoreError::VersionMismatch {
                expected: LAYOUT_FORMAT_VERSION,
                found: ver.format_version,
            });
        }
        Ok(())
    }
}
