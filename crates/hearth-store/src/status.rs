use crate::layout::RuntimeLayout;
use crate::{fsync_dir, StoreError};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{self, Write};
use std::path::Path;
use tempfile::NamedTempFile;
use tracing::{debug, warn};

/// What the primary last reported about itself.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StatusSnapshot {
    pub identity: String,
    pub state: String,
    pub pid: u32,
    pub version: String,
    pub updated_at: String,
}

impl StatusSnapshot {
    pub fn new(identity: impl Into<String>, state: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            identity: identity.into(),
            state: state.into(),
            pid: std::process::id(),
            version: version.into(),
            updated_at: chrono::Utc::now().to_rfc3339(),
        }
    }
}

/// PID and status files of the primary instance.
pub struct StatusFiles {
    layout: RuntimeLayout,
}

impl StatusFiles {
    pub fn new(layout: RuntimeLayout) -> Self {
        Self { layout }
    }

    pub fn write_pid(&self, pid: u32) -> Result<(), StoreError> {
        write_atomic(&self.layout.pid_file(), format!("{pid}\n").as_bytes())?;
        debug!(pid, "pid file written");
        Ok(())
    }

    pub fn read_pid(&self) -> Option<u32> {
        let content = fs::read_to_string(self.layout.pid_file()).ok()?;
        content.trim().parse::<u32>().ok()
    }

    pub fn write_status(&self, snapshot: &StatusSnapshot) -> Result<(), StoreError> {
        let mut content = serde_json::to_vec_pretty(snapshot)?;
        content.push(b'\n');
        write_atomic(&self.layout.status_file(), &content)?;
        debug!(state = %snapshot.state, "status snapshot updated");
        Ok(())
    }

    pub fn read_status(&self) -> Option<StatusSnapshot> {
        let content = fs::read_to_string(self.layout.status_file()).ok()?;
        serde_json::from_str(&content).ok()
    }

    /// Remove both files. Missing files are not an error.
    pub fn clear(&self) {
        for path in [self.layout.pid_file(), self.layout.status_file()] {
            match fs::remove_file(&path) {
                Err(e) if e.kind() != io::ErrorKind::NotFound => {
                    warn!("failed to remove {}: {e}", path.display());
                }
                _ => {}
            }
        }
    }
}

fn write_atomic(dest: &Path, content: &[u8]) -> Result<(), StoreError> {
    let dir = dest.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(dir)?;
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(content)?;
    tmp.as_file().sync_all()?;
    tmp.persist(dest).map_err(|e| StoreError::Io(e.error))?;
    fsync_dir(dir)?;
    Ok(())
}
