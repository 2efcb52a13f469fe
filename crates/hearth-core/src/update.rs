//! Stage-then-restart self-update.
//!
//! Detection and staging run as engine tasks and never disturb the running
//! service: a release is downloaded, verified against its advertised digest,
//! written side by side in the staging area, and only then published as an
//! [`UpdateRecord`]. Applying happens with the service stopped, under the
//! apply journal, followed by a relaunch of the process. The relaunched
//! process logs one `successful update` event for the applied artifact.

use crate::executor::{AsyncResult, TaskEngine};
use crate::lifecycle::Lifecycle;
use crate::CoreError;
use hearth_remote::{newest_release, Release, UpdateSource};
use hearth_schema::{ArtifactDigest, CommandLine, ProductCard, Version};
use hearth_store::{
    ApplyJournal, RecordStore, RecoveryReport, RollbackStep, RuntimeLayout, StagingArea,
    UpdateRecord,
};
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

const UPDATE_TARGET: &str = "hearth::update";

/// Where the update protocol stands for this process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateState {
    None,
    Available(Release),
    Staged(UpdateRecord),
    Applied { version: Version },
    Verified { version: Version },
    Failed(String),
}

/// Written by a successful apply, read once by the relaunched process.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AppliedMarker {
    pub version: Version,
    /// Canonical path of the replaced artifact.
    pub path: PathBuf,
    pub applied_at: String,
}

/// Detects, stages and applies updates of one product.
pub struct Updater {
    card: ProductCard,
    layout: RuntimeLayout,
    source: Option<Arc<dyn UpdateSource>>,
    target: PathBuf,
    records: RecordStore,
    staging: StagingArea,
    journal: ApplyJournal,
    state: Mutex<UpdateState>,
}

impl Updater {
    pub fn new(
        card: ProductCard,
        layout: RuntimeLayout,
        source: Option<Arc<dyn UpdateSource>>,
        target: PathBuf,
    ) -> Self {
        Self {
            records: RecordStore::new(layout.clone()),
            staging: StagingArea::new(layout.clone()),
            journal: ApplyJournal::new(&layout),
            card,
            layout,
            source,
            target,
            state: Mutex::new(UpdateState::None),
        }
    }

    pub fn state(&self) -> UpdateState {
        self.state.lock().clone()
    }

    /// Installed artifact replaced on apply.
    pub fn target(&self) -> &Path {
        &self.target
    }

    fn set_state(&self, state: UpdateState) {
        *self.state.lock() = state;
    }

    /// Look for a newer release and stage it, as an engine task.
    ///
    /// Failures are logged and leave any previously staged update untouched;
    /// the next check simply tries again.
    pub fn check_now(self: &Arc<Self>, engine: &TaskEngine) -> AsyncResult<Option<UpdateRecord>> {
        let updater = Arc::clone(self);
        engine.submit(move || {
            updater.check().inspect_err(|e| {
                warn!(target: UPDATE_TARGET, "update check failed: {e}");
                updater.set_state(UpdateState::Failed(e.to_string()));
            })
        })
    }

    /// Blocking body of [`check_now`](Self::check_now).
    pub fn check(&self) -> Result<Option<UpdateRecord>, CoreError> {
        let Some(source) = &self.source else {
            debug!(target: UPDATE_TARGET, "no update feed configured");
            return Ok(None);
        };
        let releases = source.list_releases(&self.card.identity)?;
        let Some(release) = newest_release(&releases, &self.card.version) else {
            debug!(target: UPDATE_TARGET, current = %self.card.version, "no newer release");
            self.set_state(UpdateState::None);
            return Ok(None);
        };

        if let Some(pending) = self.records.pending()? {
            if pending.card.identity == self.card.identity && pending.card.version >= release.version {
                debug!(target: UPDATE_TARGET, version = %pending.card.version, "update already staged");
                self.set_state(UpdateState::Staged(pending.clone()));
                return Ok(Some(pending));
            }
        }
        if self.installed_digest().as_ref() == Some(&release.digest) {
            debug!(target: UPDATE_TARGET, version = %release.version, "release already installed");
            self.set_state(UpdateState::None);
            return Ok(None);
        }

        info!(target: UPDATE_TARGET, version = %release.version, "update available");
        self.set_state(UpdateState::Available(release.clone()));
        let data = source.fetch_artifact(release)?;
        self.stage(release, &data).map(Some)
    }

    fn installed_digest(&self) -> Option<ArtifactDigest> {
        fs::read(&self.target).ok().map(|data| ArtifactDigest::of(&data))
    }

    /// Verify `data` as the artifact of `release`, write it to the staging
    /// area and publish the record. Nothing is published if any step fails.
    pub fn stage(&self, release: &Release, data: &[u8]) -> Result<UpdateRecord, CoreError> {
        let staged = release
            .verify(data)
            .map_err(|e| CoreError::Staging(e.to_string()))
            .and_then(|()| {
                self.staging
                    .stage(data, &release.digest, Some(release.size))
                    .map_err(|e| CoreError::Staging(e.to_string()))
            });
        let path = match staged {
            Ok(path) => path,
            Err(e) => {
                self.set_state(UpdateState::Failed(e.to_string()));
                return Err(e);
            }
        };

        let mut card = self.card.clone();
        card.version = release.version.clone();
        card.released.clone_from(&release.released);
        let record = UpdateRecord::new(card, path, release.digest.clone(), release.size);
        self.records.publish(&record)?;
        let pruned = self.staging.prune(Some(&release.digest))?;
        if pruned > 0 {
            debug!(target: UPDATE_TARGET, pruned, "removed superseded staged artifacts");
        }

        info!(target: UPDATE_TARGET, version = %release.version, "update staged");
        self.set_state(UpdateState::Staged(record.clone()));
        Ok(record)
    }

    pub fn pending(&self) -> Result<Option<UpdateRecord>, CoreError> {
        Ok(self.records.pending()?)
    }

    /// Ask the running primary to apply its staged update: flag the request
    /// and stop the service. Returns false when nothing is staged.
    pub fn request_apply(&self, lifecycle: &Lifecycle) -> Result<bool, CoreError> {
        let Some(record) = self.pending()? else {
            return Ok(false);
        };
        let flag = self.layout.apply_request_file();
        if let Some(dir) = flag.parent() {
            fs::create_dir_all(dir)?;
        }
        fs::write(&flag, record.card.version.to_string())?;
        info!(target: UPDATE_TARGET, version = %record.card.version, "apply requested, stopping service");
        let _ = lifecycle.request_stop();
        Ok(true)
    }

    pub fn apply_requested(&self) -> bool {
        self.layout.apply_request_file().exists()
    }

    pub fn clear_apply_request(&self) {
        let flag = self.layout.apply_request_file();
        if let Err(e) = fs::remove_file(&flag) {
            if e.kind() != io::ErrorKind::NotFound {
                warn!("failed to remove {}: {e}", flag.display());
            }
        }
    }

    /// Settle an apply interrupted by a crash.
    pub fn recover(&self) -> Result<RecoveryReport, CoreError> {
        Ok(self.journal.recover()?)
    }

    /// Swap the staged artifact into place. Must run with the service
    /// stopped. Returns the applied version, or `None` when nothing usable
    /// was staged.
    ///
    /// The journal marks the swap consumed before the record is deleted:
    /// an interrupted apply is either rolled back with the record still
    /// pending, or rolled forward with the record stale to the new version.
    pub fn apply_pending(&self) -> Result<Option<Version>, CoreError> {
        let Some(record) = self.records.pending()? else {
            return Ok(None);
        };
        let version = record.card.version.clone();
        if record.card.identity != self.card.identity {
            warn!(target: UPDATE_TARGET, identity = %record.card.identity, "discarding update record of another product");
            self.discard(&record)?;
            return Ok(None);
        }
        if version <= self.card.version {
            info!(target: UPDATE_TARGET, %version, current = %self.card.version, "discarding stale update record");
            self.discard(&record)?;
            return Ok(None);
        }
        let staged = match self.staging.verify(&record.digest) {
            Ok(path) => path,
            Err(e) => {
                warn!(target: UPDATE_TARGET, %version, "staged artifact unusable: {e}");
                self.discard(&record)?;
                self.set_state(UpdateState::Failed(e.to_string()));
                return Err(CoreError::Staging(e.to_string()));
            }
        };

        let op_id = self.journal.begin(&self.target, &version.to_string())?;
        let swapped = self
            .swap(&op_id, &staged)
            .and_then(|()| self.journal.mark_consumed(&op_id).map_err(CoreError::from));
        if let Err(e) = swapped {
            if let Err(re) = self.journal.recover() {
                warn!(target: UPDATE_TARGET, "rollback after failed apply: {re}");
            }
            self.set_state(UpdateState::Failed(e.to_string()));
            return Err(CoreError::Apply(format!("{version}: {e}")));
        }
        // From here the swap is kept whatever happens. A record left behind
        // is stale to the relaunched version and gets discarded there.
        if let Err(e) = self.records.consume() {
            warn!(target: UPDATE_TARGET, %version, "failed to consume update record: {e}");
        }

        let marker = AppliedMarker {
            version: version.clone(),
            path: fs::canonicalize(&self.target).unwrap_or_else(|_| self.target.clone()),
            applied_at: chrono::Utc::now().to_rfc3339(),
        };
        write_marker(&self.layout.applied_marker(), &marker)?;
        self.journal.commit(&op_id)?;
        self.staging.remove(&record.digest)?;

        info!(target: UPDATE_TARGET, %version, target = %self.target.display(), "update applied");
        self.set_state(UpdateState::Applied {
            version: version.clone(),
        });
        Ok(Some(version))
    }

    fn discard(&self, record: &UpdateRecord) -> Result<(), CoreError> {
        self.records.discard()?;
        self.staging.remove(&record.digest)?;
        self.set_state(UpdateState::None);
        Ok(())
    }

    fn swap(&self, op_id: &str, staged: &Path) -> Result<(), CoreError> {
        let dir = self
            .target
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map_or_else(|| PathBuf::from("."), Path::to_path_buf);
        fs::create_dir_all(&dir)?;

        let previous = fs::metadata(&self.target).ok();
        if previous.is_some() {
            // Backup sits next to the target so restoring it is a rename
            let backup = backup_path(&self.target);
            fs::copy(&self.target, &backup)?;
            File::open(&backup)?.sync_all()?;
            self.journal.add_rollback_step(
                op_id,
                RollbackStep::RestoreFile {
                    backup,
                    target: self.target.clone(),
                },
            )?;
        } else {
            self.journal
                .add_rollback_step(op_id, RollbackStep::RemoveFile(self.target.clone()))?;
        }

        let mut tmp = NamedTempFile::new_in(&dir)?;
        io::copy(&mut File::open(staged)?, tmp.as_file_mut())?;
        match &previous {
            Some(meta) => tmp.as_file().set_permissions(meta.permissions())?,
            None => set_executable(tmp.as_file())?,
        }
        tmp.as_file().sync_all()?;
        tmp.persist(&self.target).map_err(|e| e.error)?;
        File::open(&dir)?.sync_all()?;
        debug!(target: UPDATE_TARGET, "swapped {} into {}", staged.display(), self.target.display());
        Ok(())
    }

    /// Read and remove the marker left by the apply that launched this
    /// process, logging the `successful update` event exactly once.
    pub fn take_verification_marker(&self) -> Result<Option<AppliedMarker>, CoreError> {
        let path = self.layout.applied_marker();
        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        fs::remove_file(&path)?;
        let marker: AppliedMarker = match serde_json::from_str(&content) {
            Ok(marker) => marker,
            Err(e) => {
                warn!(target: UPDATE_TARGET, "ignoring corrupt applied marker: {e}");
                return Ok(None);
            }
        };

        info!(
            target: UPDATE_TARGET,
            version = %marker.version,
            path = %marker.path.display(),
            applied_at = %marker.applied_at,
            "successful update"
        );
        if marker.version != self.card.version {
            warn!(
                target: UPDATE_TARGET,
                applied = %marker.version,
                running = %self.card.version,
                "running version differs from the applied update"
            );
        }
        self.set_state(UpdateState::Verified {
            version: marker.version.clone(),
        });
        Ok(Some(marker))
    }
}

fn backup_path(target: &Path) -> PathBuf {
    let name = target
        .file_name()
        .map_or_else(|| "artifact".into(), |n| n.to_string_lossy().into_owned());
    target.with_file_name(format!(".{name}.hearth-backup"))
}

#[cfg(unix)]
fn set_executable(file: &File) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    file.set_permissions(fs::Permissions::from_mode(0o755))
}

#[cfg(not(unix))]
fn set_executable(_file: &File) -> io::Result<()> {
    Ok(())
}

fn write_marker(dest: &Path, marker: &AppliedMarker) -> Result<(), CoreError> {
    let dir = dest.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(dir)?;
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(serde_json::to_string_pretty(marker)?.as_bytes())?;
    tmp.as_file().sync_all()?;
    tmp.persist(dest).map_err(|e| e.error)?;
    Ok(())
}

/// Periodic update checks for the `scheduled` policy.
pub struct UpdateScheduler {
    stop: Arc<(Mutex<bool>, Condvar)>,
    handle: Option<JoinHandle<()>>,
}

impl UpdateScheduler {
    pub fn spawn(updater: Arc<Updater>, engine: Arc<TaskEngine>, interval: Duration) -> io::Result<Self> {
        let stop = Arc::new((Mutex::new(false), Condvar::new()));
        let signal = Arc::clone(&stop);
        let handle = thread::Builder::new()
            .name("hearth-update-scheduler".to_owned())
            .spawn(move || {
                let (stopped, wake) = &*signal;
                loop {
                    let mut flag = stopped.lock();
                    if !*flag {
                        wake.wait_for(&mut flag, interval);
                    }
                    if *flag {
                        break;
                    }
                    drop(flag);
                    debug!(target: UPDATE_TARGET, "scheduled update check");
                    let _ = updater.check_now(&engine).wait();
                }
            })?;
        info!(target: UPDATE_TARGET, interval_secs = interval.as_secs(), "update checks scheduled");
        Ok(Self {
            stop,
            handle: Some(handle),
        })
    }

    pub fn stop(mut self) {
        self.halt();
    }

    fn halt(&mut self) {
        let (stopped, wake) = &*self.stop;
        *stopped.lock() = true;
        wake.notify_all();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("update scheduler thread panicked");
            }
        }
    }
}

impl Drop for UpdateScheduler {
    fn drop(&mut self) {
        self.halt();
    }
}

/// Starts the fresh process image after an apply.
pub trait Relauncher: Send + Sync {
    fn relaunch(&self, executable: &Path, args: &CommandLine) -> Result<(), CoreError>;
}

/// Spawns the executable as a detached child and returns.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessRelauncher;

impl Relauncher for ProcessRelauncher {
    fn relaunch(&self, executable: &Path, args: &CommandLine) -> Result<(), CoreError> {
        let child = Command::new(executable).args(args.args()).spawn()?;
        info!(
            target: UPDATE_TARGET,
            pid = child.id(),
            executable = %executable.display(),
            "relaunched after update"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hearth_remote::{DirectorySource, RemoteError};
    use hearth_schema::ServiceIdentity;

    struct Fixture {
        _dir: tempfile::TempDir,
        feed: DirectorySource,
        updater: Arc<Updater>,
    }

    fn identity() -> ServiceIdentity {
        ServiceIdentity::new("org.example", "heartbeat").unwrap()
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let feed = DirectorySource::new(dir.path().join("feed"));
        let layout = RuntimeLayout::new(dir.path().join("rt"));
        layout.initialize().unwrap();
        let target = dir.path().join("bin/heartbeat");
        fs::create_dir_all(target.parent().unwrap()).unwrap();
        fs::write(&target, b"heartbeat 1.0.0").unwrap();
        let card = ProductCard::new(identity(), "Heartbeat", Version::new(1, 0, 0));
        let source: Arc<dyn UpdateSource> = Arc::new(DirectorySource::new(dir.path().join("feed")));
        let updater = Arc::new(Updater::new(card, layout, Some(source), target));
        Fixture {
            _dir: dir,
            feed,
            updater,
        }
    }

    fn publish(feed: &DirectorySource, version: &str, data: &[u8]) -> Release {
        let release = Release::for_artifact(Version::parse(version).unwrap(), data);
        feed.publish(&identity(), &release, data).unwrap();
        release
    }

    #[test]
    fn check_without_newer_release_stages_nothing() {
        let f = fixture();
        publish(&f.feed, "1.0.0", b"heartbeat 1.0.0");
        assert!(f.updater.check().unwrap().is_none());
        assert_eq!(f.updater.state(), UpdateState::None);
        assert!(f.updater.pending().unwrap().is_none());
    }

    #[test]
    fn check_stages_newest_release() {
        let f = fixture();
        publish(&f.feed, "1.1.0", b"heartbeat 1.1.0");
        publish(&f.feed, "1.2.0", b"heartbeat 1.2.0");

        let engine = TaskEngine::new(2).unwrap();
        engine.start();
        let record = f.updater.check_now(&engine).wait().unwrap().unwrap();
        assert_eq!(record.card.version, Version::new(1, 2, 0));
        assert_eq!(fs::read(&record.artifact).unwrap(), b"heartbeat 1.2.0");
        assert!(matches!(f.updater.state(), UpdateState::Staged(_)));

        // A second check finds the same release already staged
        let again = f.updater.check().unwrap().unwrap();
        assert_eq!(again.digest, record.digest);
    }

    #[test]
    fn corrupt_download_is_never_staged() {
        let f = fixture();
        let mut release = Release::for_artifact(Version::new(1, 1, 0), b"good bytes");
        assert!(matches!(
            f.updater.stage(&release, b"evil bytes"),
            Err(CoreError::Staging(_))
        ));
        release.size = 3;
        assert!(f.updater.stage(&release, b"good bytes").is_err());
        assert!(f.updater.pending().unwrap().is_none());
        assert!(matches!(f.updater.state(), UpdateState::Failed(_)));
    }

    #[test]
    fn apply_swaps_target_and_consumes_record() {
        let f = fixture();
        publish(&f.feed, "1.1.0", b"heartbeat 1.1.0");
        f.updater.check().unwrap().unwrap();

        assert_eq!(f.updater.apply_pending().unwrap(), Some(Version::new(1, 1, 0)));
        assert_eq!(fs::read(f.updater.target()).unwrap(), b"heartbeat 1.1.0");
        assert!(f.updater.pending().unwrap().is_none());
        assert!(!backup_path(f.updater.target()).exists());

        // Same record cannot be applied twice
        assert_eq!(f.updater.apply_pending().unwrap(), None);
    }

    #[test]
    fn marker_is_reported_once() {
        let f = fixture();
        publish(&f.feed, "1.1.0", b"heartbeat 1.1.0");
        f.updater.check().unwrap().unwrap();
        f.updater.apply_pending().unwrap();

        let marker = f.updater.take_verification_marker().unwrap().unwrap();
        assert_eq!(marker.version, Version::new(1, 1, 0));
        assert_eq!(marker.path, fs::canonicalize(f.updater.target()).unwrap());
        assert!(f.updater.take_verification_marker().unwrap().is_none());
    }

    #[test]
    fn installed_release_is_not_staged_again() {
        let f = fixture();
        publish(&f.feed, "1.1.0", b"heartbeat 1.0.0");
        assert!(f.updater.check().unwrap().is_none());
    }

    #[test]
    fn missing_staged_artifact_discards_record() {
        let f = fixture();
        publish(&f.feed, "1.1.0", b"heartbeat 1.1.0");
        let record = f.updater.check().unwrap().unwrap();
        fs::remove_file(&record.artifact).unwrap();

        assert!(matches!(f.updater.apply_pending(), Err(CoreError::Staging(_))));
        assert!(f.updater.pending().unwrap().is_none());
        assert_eq!(fs::read(f.updater.target()).unwrap(), b"heartbeat 1.0.0");
    }

    #[test]
    fn failed_swap_rolls_back_and_keeps_record() {
        let f = fixture();
        publish(&f.feed, "1.1.0", b"heartbeat 1.1.0");
        f.updater.check().unwrap().unwrap();

        // Target replaced by a directory: the final rename cannot succeed
        let target = f.updater.target().to_path_buf();
        fs::remove_file(&target).unwrap();
        fs::create_dir_all(target.join("busy")).unwrap();

        assert!(matches!(f.updater.apply_pending(), Err(CoreError::Apply(_))));
        assert!(f.updater.pending().unwrap().is_some());
        assert!(target.join("busy").is_dir());
        assert!(f.updater.recover().unwrap().is_empty());
    }

    #[test]
    fn stale_record_is_discarded() {
        let f = fixture();
        let data = b"heartbeat 0.9.0";
        let release = Release::for_artifact(Version::new(0, 9, 0), data);
        f.updater.stage(&release, data).unwrap();
        assert_eq!(f.updater.apply_pending().unwrap(), None);
        assert!(f.updater.pending().unwrap().is_none());
        assert_eq!(fs::read(f.updater.target()).unwrap(), b"heartbeat 1.0.0");
    }

    #[test]
    fn feed_errors_surface_from_check() {
        struct Broken;
        impl UpdateSource for Broken {
            fn list_releases(&self, _: &ServiceIdentity) -> Result<Vec<Release>, RemoteError> {
                Err(RemoteError::Http("503".to_owned()))
            }
            fn fetch_artifact(&self, _: &Release) -> Result<Vec<u8>, RemoteError> {
                unreachable!()
            }
        }
        let dir = tempfile::tempdir().unwrap();
        let layout = RuntimeLayout::new(dir.path());
        layout.initialize().unwrap();
        let updater = Arc::new(Updater::new(
            ProductCard::new(identity(), "Heartbeat", Version::new(1, 0, 0)),
            layout,
            Some(Arc::new(Broken)),
            dir.path().join("bin"),
        ));
        let engine = TaskEngine::new(2).unwrap();
        engine.start();
        assert!(updater.check_now(&engine).wait().is_err());
        assert!(matches!(updater.state(), UpdateState::Failed(_)));
    }

    #[test]
    fn scheduler_runs_checks_until_stopped() {
        let f = fixture();
        publish(&f.feed, "1.1.0", b"heartbeat 1.1.0");
        let engine = Arc::new(TaskEngine::new(2).unwrap());
        engine.start();

        let scheduler =
            UpdateScheduler::spawn(Arc::clone(&f.updater), Arc::clone(&engine), Duration::from_millis(20))
                .unwrap();
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while f.updater.pending().unwrap().is_none() && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        scheduler.stop();
        assert!(f.updater.pending().unwrap().is_some());
    }
}
