use crate::layout::RuntimeLayout;
use crate::{fsync_dir, StoreError};
use hearth_schema::{ArtifactDigest, ProductCard};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::PathBuf;
use tempfile::NamedTempFile;
use tracing::{debug, warn};

const PENDING_RECORD: &str = "pending.json";

/// Durable marker of a staged-but-not-yet-applied update.
///
/// Published only after the artifact it points at has been written and
/// verified, and removed when the update is applied.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UpdateRecord {
    pub card: ProductCard,
    pub artifact: PathBuf,
    pub digest: ArtifactDigest,
    pub size: u64,
    pub staged_at: String,
    /// blake3 checksum over the record content.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
}

impl UpdateRecord {
    pub fn new(card: ProductCard, artifact: PathBuf, digest: ArtifactDigest, size: u64) -> Self {
        Self {
            card,
            artifact,
            digest,
            size,
            staged_at: chrono::Utc::now().to_rfc3339(),
            checksum: None,
        }
    }

    /// Compute the checksum over the record content (excluding the checksum field itself).
    fn compute_checksum(&self) -> Result<String, StoreError> {
        let mut copy = self.clone();
        copy.checksum = None;
        let json = serde_json::to_string_pretty(&copy)?;
        Ok(blake3::hash(json.as_bytes()).to_hex().to_string())
    }
}

/// Holds at most one pending [`UpdateRecord`] per runtime directory.
pub struct RecordStore {
    layout: RuntimeLayout,
}

impl RecordStore {
    pub fn new(layout: RuntimeLayout) -> Self {
        Self { layout }
    }

    fn record_path(&self) -> PathBuf {
        self.layout.records_dir().join(PENDING_RECORD)
    }

    /// Atomically publish `record`, replacing any previously pending one.
    pub fn publish(&self, record: &UpdateRecord) -> Result<(), StoreError> {
        let mut with_checksum = record.clone();
        with_checksum.checksum = Some(with_checksum.compute_checksum()?);
        let content = serde_json::to_string_pretty(&with_checksum)?;

        let dir = self.layout.records_dir();
        fs::create_dir_all(&dir)?;
        let mut tmp = NamedTempFile::new_in(&dir)?;
        tmp.write_all(content.as_bytes())?;
        tmp.as_file().sync_all()?;
        tmp.persist(self.record_path())
            .map_err(|e| StoreError::Io(e.error))?;
        fsync_dir(&dir)?;

        debug!(
            "published update record for {} {}",
            record.card.identity, record.card.version
        );
        Ok(())
    }

    /// Read the pending record, verifying its checksum.
    pub fn get(&self) -> Result<Option<UpdateRecord>, StoreError> {
        let path = self.record_path();
        if !path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(&path)?;
        let record: UpdateRecord = serde_json::from_str(&content)?;

        let Some(ref expected) = record.checksum else {
            return Err(StoreError::IntegrityFailure {
                key: PENDING_RECORD.to_owned(),
                expected: "checksum".to_owned(),
                actual: "none".to_owned(),
            });
        };
        let actual = record.compute_checksum()?;
        if actual != *expected {
            return Err(StoreError::IntegrityFailure {
                key: PENDING_RECORD.to_owned(),
                expected: expected.clone(),
                actual,
            });
        }
        Ok(Some(record))
    }

    /// Like [`get`](Self::get), but a corrupt record is removed and treated as absent.
    pub fn pending(&self) -> Result<Option<UpdateRecord>, StoreError> {
        match self.get() {
            Ok(record) => Ok(record),
            Err(e @ (StoreError::IntegrityFailure { .. } | StoreError::Serialization(_))) => {
                warn!("discarding corrupt update record: {e}");
                self.discard()?;
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Remove the pending record and return it. After this returns `Some`, the
    /// same record can never be observed again.
    pub fn consume(&self) -> Result<Option<UpdateRecord>, StoreError> {
        let Some(record) = self.pending()? else {
            return Ok(None);
        };
        self.discard()?;
        debug!("consumed update record for {}", record.card.version);
        Ok(Some(record))
    }

    pub fn discard(&self) -> Result<(), StoreError> {
        let path = self.record_path();
        if path.exists() {
            fs::remove_file(&path)?;
            fsync_dir(&self.layout.records_dir())?;
        }
        Ok(())
    }

    pub fn exists(&self) -> bool {
        self.record_path().exists()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hearth_schema::{ServiceIdentity, Version};

    fn setup() -> (tempfile::TempDir, RecordStore) {
        let dir = tempfile::tempdir().unwrap();
        let layout = RuntimeLayout::new(dir.path());
        layout.initialize().unwrap();
        (dir, RecordStore::new(layout))
    }

    fn sample(version: &str) -> UpdateRecord {
        let card = ProductCard::new(
            ServiceIdentity::new("org.example", "heartbeat").unwrap(),
            "Heartbeat",
            Version::parse(version).unwrap(),
        );
        UpdateRecord::new(
            card,
            PathBuf::from("/staging/abc"),
            ArtifactDigest::of(b"artifact"),
            8,
        )
    }

    #[test]
    fn publish_and_read_back() {
        let (_dir, store) = setup();
        store.publish(&sample("1.1.0")).unwrap();
        let read = store.pending().unwrap().unwrap();
        assert_eq!(read.card.version, Version::new(1, 1, 0));
        assert!(read.checksum.is_some());
    }

    #[test]
    fn publish_replaces_previous_record() {
        let (_dir, store) = setup();
        store.publish(&sample("1.1.0")).unwrap();
        store.publish(&sample("1.2.0")).unwrap();
        let read = store.pending().unwrap().unwrap();
        assert_eq!(read.card.version, Version::new(1, 2, 0));
    }

    #[test]
    fn consume_removes_record() {
        let (_dir, store) = setup();
        store.publish(&sample("1.1.0")).unwrap();
        assert!(store.consume().unwrap().is_some());
        assert!(!store.exists());
        assert!(store.consume().unwrap().is_none());
    }

    #[test]
    fn tampered_record_is_an_integrity_failure() {
        let (dir, store) = setup();
        store.publish(&sample("1.1.0")).unwrap();
        let path = RuntimeLayout::new(dir.path())
            .records_dir()
            .join(PENDING_RECORD);
        let content = fs::read_to_string(&path).unwrap();
        fs::write(&path, content.replace("1.1.0", "9.9.9")).unwrap();

        assert!(matches!(
            store.get(),
            Err(StoreError::IntegrityFailure { .. })
        ));
        assert!(store.pending().unwrap().is_none());
        assert!(!store.exists());
    }

    #[test]
    fn truncated_record_is_treated_as_absent() {
        let (dir, store) = setup();
        let path = RuntimeLayout::new(dir.path())
            .records_dir()
            .join(PENDING_RECORD);
        fs::write(&path, "{\"card\":").unwrap();
        assert!(store.pending().unwrap().is_none());
    }

    #[test]
    fn empty_store_has_no_record() {
        let (_dir, store) = setup();
        assert!(store.pending().unwrap().is_none());
        assert!(store.discard().is_ok());
    }
}
