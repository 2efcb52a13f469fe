use crate::layout::RuntimeLayout;
use crate::{fsync_dir, StoreError};
use hearth_schema::ArtifactDigest;
use std::fs;
use std::io::Write;
use std::path::PathBuf;
use tempfile::NamedTempFile;
use tracing::debug;

/// Side-by-side area where downloaded update artifacts are verified and kept.
///
/// Artifacts are named by their blake3 digest. Writes go through a
/// `NamedTempFile` in the same directory and are only renamed into place after
/// the content matched the expected digest, so a partially written artifact is
/// never visible under its final name.
pub struct StagingArea {
    layout: RuntimeLayout,
}

impl StagingArea {
    pub fn new(layout: RuntimeLayout) -> Self {
        Self { layout }
    }

    pub fn path_for(&self, digest: &ArtifactDigest) -> PathBuf {
        self.layout.staging_dir().join(digest.as_str())
    }

    /// Verify `data` against `expected` (and `expected_size` when known), then
    /// write it atomically. Returns the staged path.
    pub fn stage(
        &self,
        data: &[u8],
        expected: &ArtifactDigest,
        expected_size: Option<u64>,
    ) -> Result<PathBuf, StoreError> {
        if let Some(size) = expected_size {
            let actual = data.len() as u64;
            if actual != size {
                return Err(StoreError::SizeMismatch {
                    key: expected.to_string(),
                    expected: size,
                    actual,
                });
            }
        }
        let actual = ArtifactDigest::of(data);
        if actual != *expected {
            return Err(StoreError::IntegrityFailure {
                key: expected.to_string(),
                expected: expected.to_string(),
                actual: actual.into_inner(),
            });
        }

        let dir = self.layout.staging_dir();
        fs::create_dir_all(&dir)?;
        let dest = self.path_for(expected);
        if dest.exists() && self.verify(expected).is_ok() {
            debug!("artifact {expected} already staged");
            return Ok(dest);
        }

        let mut tmp = NamedTempFile::new_in(&dir)?;
        tmp.write_all(data)?;
        tmp.as_file().sync_all()?;
        tmp.persist(&dest).map_err(|e| StoreError::Io(e.error))?;
        fsync_dir(&dir)?;

        debug!("staged {} bytes as {}", data.len(), dest.display());
        Ok(dest)
    }

    /// Re-hash a staged artifact.
    pub fn verify(&self, digest: &ArtifactDigest) -> Result<PathBuf, StoreError> {
        let path = self.path_for(digest);
        if !path.exists() {
            return Err(StoreError::ArtifactNotFound(digest.to_string()));
        }
        let data = fs::read(&path)?;
        let actual = ArtifactDigest::of(&data);
        if actual != *digest {
            return Err(StoreError::IntegrityFailure {
                key: digest.to_string(),
                expected: digest.to_string(),
                actual: actual.into_inner(),
            });
        }
        Ok(path)
    }

    pub fn remove(&self, digest: &ArtifactDigest) -> Result<(), StoreError> {
        let path = self.path_for(digest);
        if path.exists() {
            fs::remove_file(path)?;
        }
        Ok(())
    }

    pub fn list(&self) -> Result<Vec<ArtifactDigest>, StoreError> {
        let dir = self.layout.staging_dir();
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut digests = Vec::new();
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            if let Some(name) = entry.file_name().to_str() {
                if !name.starts_with('.') {
                    digests.push(ArtifactDigest::new(name));
                }
            }
        }
        digests.sort();
        Ok(digests)
    }

    /// Remove every staged artifact except `keep`. Returns how many were removed.
    pub fn prune(&self, keep: Option<&ArtifactDigest>) -> Result<usize, StoreError> {
        let mut removed = 0;
        for digest in self.list()? {
            if Some(&digest) != keep {
                self.remove(&digest)?;
                removed += 1;
            }
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (tempfile::TempDir, StagingArea) {
        let dir = tempfile::tempdir().unwrap();
        let layout = RuntimeLayout::new(dir.path());
        layout.initialize().unwrap();
        (dir, StagingArea::new(layout))
    }

    #[test]
    fn stage_verified_artifact() {
        let (_dir, staging) = setup();
        let data = b"new binary";
        let digest = ArtifactDigest::of(data);
        let path = staging.stage(data, &digest, Some(data.len() as u64)).unwrap();
        assert_eq!(fs::read(&path).unwrap(), data);
        assert_eq!(staging.verify(&digest).unwrap(), path);
    }

    #[test]
    fn digest_mismatch_leaves_nothing_behind() {
        let (_dir, staging) = setup();
        let wrong = ArtifactDigest::of(b"something else");
        let err = staging.stage(b"new binary", &wrong, None).unwrap_err();
        assert!(matches!(err, StoreError::IntegrityFailure { .. }));
        assert!(staging.list().unwrap().is_empty());
    }

    #[test]
    fn size_mismatch_rejected() {
        let (_dir, staging) = setup();
        let data = b"abc";
        let digest = ArtifactDigest::of(data);
        let err = staging.stage(data, &digest, Some(4)).unwrap_err();
        assert!(matches!(
            err,
            StoreError::SizeMismatch {
                expected: 4,
                actual: 3,
                ..
            }
        ));
    }

    #[test]
    fn stage_is_idempotent() {
        let (_dir, staging) = setup();
        let data = b"same";
        let digest = ArtifactDigest::of(data);
        let a = staging.stage(data, &digest, None).unwrap();
        let b = staging.stage(data, &digest, None).unwrap();
        assert_eq!(a, b);
        assert_eq!(staging.list().unwrap().len(), 1);
    }

    #[test]
    fn corrupted_staged_file_fails_verify() {
        let (_dir, staging) = setup();
        let data = b"payload";
        let digest = ArtifactDigest::of(data);
        let path = staging.stage(data, &digest, None).unwrap();
        fs::write(&path, b"tampered").unwrap();
        assert!(matches!(
            staging.verify(&digest),
            Err(StoreError::IntegrityFailure { .. })
        ));
    }

    #[test]
    fn verify_missing_artifact() {
        let (_dir, staging) = setup();
        assert!(matches!(
            staging.verify(&ArtifactDigest::of(b"x")),
            Err(StoreError::ArtifactNotFound(_))
        ));
    }

    #[test]
    fn prune_keeps_requested_digest() {
        let (_dir, staging) = setup();
        let keep = ArtifactDigest::of(b"keep");
        staging.stage(b"keep", &keep, None).unwrap();
        staging
            .stage(b"drop", &ArtifactDigest::of(b"drop"), None)
            .unwrap();
        assert_eq!(staging.prune(Some(&keep)).unwrap(), 1);
        assert_eq!(staging.list().unwrap(), vec![keep]);
    }
}
