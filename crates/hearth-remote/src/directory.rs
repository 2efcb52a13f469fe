use crate::{merge_release, Release, RemoteError, UpdateSource};
use hearth_schema::ServiceIdentity;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::debug;

/// Update feed laid out on a local filesystem.
///
/// ```text
/// <root>/releases/<namespace>/<artifact>.json   JSON array of releases
/// <root>/artifacts/<digest>                     artifact bytes
/// ```
///
/// This is the same layout `hearth-server` keeps on disk, so a server data
/// directory can be used as a directory feed directly.
#[derive(Debug, Clone)]
pub struct DirectorySource {
    root: PathBuf,
}

impl DirectorySource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn listing_path(&self, identity: &ServiceIdentity) -> PathBuf {
        self.root
            .join("releases")
            .join(identity.namespace().as_str())
            .join(format!("{}.json", identity.artifact()))
    }

    pub fn artifact_path(&self, digest: &str) -> PathBuf {
        self.root.join("artifacts").join(digest)
    }

    /// Store `data` and add its release to the listing of `identity`.
    pub fn publish(
        &self,
        identity: &ServiceIdentity,
        release: &Release,
        data: &[u8],
    ) -> Result<(), RemoteError> {
        release.verify(data)?;
        write_atomic(&self.artifact_path(release.digest.as_str()), data)?;
        self.add_release(identity, release.clone())
    }

    /// Add a release to the listing without touching artifacts.
    pub fn add_release(
        &self,
        identity: &ServiceIdentity,
        release: Release,
    ) -> Result<(), RemoteError> {
        let mut listing = self.read_listing(identity)?;
        let version = release.version.clone();
        merge_release(&mut listing, release);
        let json = serde_json::to_vec_pretty(&listing)
            .map_err(|e| RemoteError::Serialization(e.to_string()))?;
        write_atomic(&self.listing_path(identity), &json)?;
        debug!("published {identity} {version} to {}", self.root.display());
        Ok(())
    }

    fn read_listing(&self, identity: &ServiceIdentity) -> Result<Vec<Release>, RemoteError> {
        let path = self.listing_path(identity);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let content = fs::read_to_string(&path)?;
        serde_json::from_str(&content)
            .map_err(|e| RemoteError::Serialization(format!("{}: {e}", path.display())))
    }
}

impl UpdateSource for DirectorySource {
    fn list_releases(&self, identity: &ServiceIdentity) -> Result<Vec<Release>, RemoteError> {
        self.read_listing(identity)
    }

    fn fetch_artifact(&self, release: &Release) -> Result<Vec<u8>, RemoteError> {
        let path = self.artifact_path(release.digest.as_str());
        match fs::read(&path) {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(RemoteError::NotFound(path.display().to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }
}

fn write_atomic(dest: &Path, data: &[u8]) -> Result<(), RemoteError> {
    let dir = dest.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(dir)?;
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(data)?;
    tmp.as_file().sync_all()?;
    tmp.persist(dest).map_err(|e| RemoteError::Io(e.error))?;
    Ok(())
}
