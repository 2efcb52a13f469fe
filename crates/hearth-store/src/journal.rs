use crate::layout::RuntimeLayout;
use crate::StoreError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

/// A single rollback step that can undo part of an artifact swap.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum RollbackStep {
    /// Put the saved copy back over the installed artifact.
    RestoreFile { backup: PathBuf, target: PathBuf },
    /// Remove a file that did not exist before the swap.
    RemoveFile(PathBuf),
}

/// How far an apply got before it was interrupted.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum JournalPhase {
    /// Artifacts may be partially swapped; the record is still pending.
    Swapping,
    /// The record has been consumed; the swap must be kept.
    Consumed,
}

/// A journal entry representing an in-flight apply.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JournalEntry {
    pub op_id: String,
    pub target: PathBuf,
    pub version: String,
    pub timestamp: String,
    pub phase: JournalPhase,
    pub rollback_steps: Vec<RollbackStep>,
}

/// Outcome of [`ApplyJournal::recover`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RecoveryReport {
    pub rolled_back: usize,
    pub rolled_forward: usize,
}

impl RecoveryReport {
    pub fn is_empty(&self) -> bool {
        self.rolled_back == 0 && self.rolled_forward == 0
    }
}

/// Write-ahead journal for artifact swaps.
///
/// An apply creates an entry before touching the installation, appends
/// rollback steps as side effects occur, marks the entry consumed once the
/// update record is gone, and removes the entry on completion. On the next
/// startup an unconsumed entry is rolled back and a consumed one is rolled
/// forward, so the installation is never left half-updated.
pub struct ApplyJournal {
    journal_dir: PathBuf,
}

impl ApplyJournal {
    pub fn new(layout: &RuntimeLayout) -> Self {
        Self {
            journal_dir: layout.journal_dir(),
        }
    }

    /// Begin a new entry for swapping `target`. Returns the op_id.
    pub fn begin(&self, target: &Path, version: &str) -> Result<String, StoreError> {
        let op_id = format!(
            "{}-{}",
            chrono::Utc::now().format("%Y%m%d%H%M%S%3f"),
            &blake3::hash(target.to_string_lossy().as_bytes()).to_hex()[..8]
        );
        let entry = JournalEntry {
            op_id: op_id.clone(),
            target: target.to_path_buf(),
            version: version.to_owned(),
            timestamp: chrono::Utc::now().to_rfc3339(),
            phase: JournalPhase::Swapping,
            rollback_steps: Vec::new(),
        };
        self.write_entry(&entry)?;
        debug!("journal begin: apply {version} to {} (op_id={op_id})", target.display());
        Ok(op_id)
    }

    /// Append a rollback step to an existing entry.
    pub fn add_rollback_step(&self, op_id: &str, step: RollbackStep) -> Result<(), StoreError> {
        let mut entry = self.read_entry(op_id)?;
        entry.rollback_steps.push(step);
        self.write_entry(&entry)
    }

    /// Record that the update record was consumed: from here on, recovery keeps the swap.
    pub fn mark_consumed(&self, op_id: &str) -> Result<(), StoreError> {
        let mut entry = self.read_entry(op_id)?;
        entry.phase = JournalPhase::Consumed;
        self.write_entry(&entry)
    }

    /// Complete an entry: drop backups and remove it.
    pub fn commit(&self, op_id: &str) -> Result<(), StoreError> {
        let path = self.entry_path(op_id);
        if path.exists() {
            let entry = self.read_entry(op_id)?;
            discard_backups(&entry);
            fs::remove_file(&path)?;
            debug!("journal commit: {op_id}");
        }
        Ok(())
    }

    /// List all incomplete entries, oldest first.
    pub fn list_incomplete(&self) -> Result<Vec<JournalEntry>, StoreError> {
        if !self.journal_dir.exists() {
            return Ok(Vec::new());
        }
        let mut entries = Vec::new();
        for dir_entry in fs::read_dir(&self.journal_dir)? {
            let dir_entry = dir_entry?;
            let path = dir_entry.path();
            if path.extension().is_some_and(|e| e == "json") {
                match fs::read_to_string(&path) {
                    Ok(content) => match serde_json::from_str::<JournalEntry>(&content) {
                        Ok(entry) => entries.push(entry),
                        Err(e) => {
                            warn!("corrupt journal entry {}: {e}", path.display());
                            let _ = fs::remove_file(&path);
                        }
                    },
                    Err(e) => {
                        warn!("unreadable journal entry {}: {e}", path.display());
                        let _ = fs::remove_file(&path);
                    }
                }
            }
        }
        entries.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));
        Ok(entries)
    }

    /// Settle every incomplete entry left by an interrupted apply.
    pub fn recover(&self) -> Result<RecoveryReport, StoreError> {
        let mut report = RecoveryReport::default();
        for entry in &self.list_incomplete()? {
            match entry.phase {
                JournalPhase::Swapping => {
                    info!(
                        "journal recovery: rolling back apply of {} to {} (op_id={})",
                        entry.version,
                        entry.target.display(),
                        entry.op_id
                    );
                    rollback_entry(entry);
                    report.rolled_back += 1;
                }
                JournalPhase::Consumed => {
                    info!(
                        "journal recovery: keeping applied {} at {} (op_id={})",
                        entry.version,
                        entry.target.display(),
                        entry.op_id
                    );
                    discard_backups(entry);
                    report.rolled_forward += 1;
                }
            }
            let _ = fs::remove_file(self.entry_path(&entry.op_id));
        }
        if !report.is_empty() {
            info!(
                "journal recovery complete: {} rolled back, {} rolled forward",
                report.rolled_back, report.rolled_forward
            );
        }
        Ok(report)
    }

    fn entry_path(&self, op_id: &str) -> PathBuf {
        self.journal_dir.join(format!("{op_id}.json"))
    }

    fn write_entry(&self, entry: &JournalEntry) -> Result<(), StoreError> {
        fs::create_dir_all(&self.journal_dir)?;
        let content = serde_json::to_string_pretty(entry)?;
        let mut tmp = NamedTempFile::new_in(&self.journal_dir)?;
        tmp.write_all(content.as_bytes())?;
        tmp.as_file().sync_all()?;
        let dest = self.entry_path(&entry.op_id);
        tmp.persist(&dest).map_err(|e| StoreError::Io(e.error))?;
        crate::fsync_dir(&self.journal_dir)?;
        Ok(())
    }

    fn read_entry(&self, op_id: &str) -> Result<JournalEntry, StoreError> {
        let content = fs::read_to_string(self.entry_path(op_id))?;
        Ok(serde_json::from_str(&content)?)
    }
}

fn rollback_entry(entry: &JournalEntry) {
    // Undo in reverse order
    for step in entry.rollback_steps.iter().rev() {
        match step {
            RollbackStep::RestoreFile { backup, target } => {
                if !backup.exists() {
                    continue;
                }
                if let Err(e) = fs::rename(backup, target) {
                    warn!(
                        "journal rollback: failed to restore {} from {}: {e}",
                        target.display(),
                        backup.display()
                    );
                } else {
                    debug!("journal rollback: restored {}", target.display());
                }
            }
            RollbackStep::RemoveFile(path) => {
                if path.exists() {
                    if let Err(e) = fs::remove_file(path) {
                        warn!(
                            "journal rollback: failed to remove file {}: {e}",
                            path.display()
                        );
                    } else {
                        debug!("journal rollback: removed file {}", path.display());
                    }
                }
            }
        }
    }
}

fn discard_backups(entry: &JournalEntry) {
    for step in &entry.rollback_steps {
        if let RollbackStep::RestoreFile { backup, .. } = step {
            if backup.exists() {
                if let Err(e) = fs::remove_file(backup) {
                    warn!("failed to remove backup {}: {e}", backup.display());
                }
            }
        }
    }
}
