//! Stage, apply and verify against a directory feed.

use hearth_core::{CoreError, UpdateState, Updater};
use hearth_remote::{DirectorySource, Release, UpdateSource};
use hearth_schema::{ProductCard, ServiceIdentity, Version};
use hearth_store::{ApplyJournal, RollbackStep, RuntimeLayout};
use parking_lot::Mutex;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Clone, Default)]
struct Capture(Arc<Mutex<Vec<u8>>>);

impl io::Write for Capture {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Capture {
    fn text(&self) -> String {
        String::from_utf8_lossy(&self.0.lock()).into_owned()
    }
}

fn identity() -> ServiceIdentity {
    ServiceIdentity::new("org.example", "heartbeat").unwrap()
}

struct Install {
    _dir: tempfile::TempDir,
    root: PathBuf,
    layout: RuntimeLayout,
    target: PathBuf,
}

impl Install {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().to_path_buf();
        let layout = RuntimeLayout::for_identity(root.join("state"), &identity());
        layout.initialize().unwrap();
        let target = root.join("opt/heartbeat/bin/heartbeat");
        fs::create_dir_all(target.parent().unwrap()).unwrap();
        fs::write(&target, b"heartbeat 1.0.0").unwrap();
        Self {
            _dir: dir,
            root,
            layout,
            target,
        }
    }

    fn feed(&self) -> DirectorySource {
        DirectorySource::new(self.root.join("feed"))
    }

    fn updater(&self, version: Version) -> Updater {
        let source: Arc<dyn UpdateSource> = Arc::new(self.feed());
        Updater::new(
            ProductCard::new(identity(), "Heartbeat", version),
            self.layout.clone(),
            Some(source),
            self.target.clone(),
        )
    }
}

fn publish(feed: &DirectorySource, version: Version, data: &[u8]) {
    feed.publish(&identity(), &Release::for_artifact(version, data), data)
        .unwrap();
}

#[test]
fn update_round_trip_logs_one_marker() {
    let install = Install::new();
    publish(&install.feed(), Version::new(1, 1, 0), b"heartbeat 1.1.0");

    let running = install.updater(Version::new(1, 0, 0));
    let record = running.check().unwrap().unwrap();
    assert_eq!(record.card.version, Version::new(1, 1, 0));
    assert!(record.artifact.starts_with(install.layout.staging_dir()));

    assert_eq!(running.apply_pending().unwrap(), Some(Version::new(1, 1, 0)));
    assert_eq!(fs::read(&install.target).unwrap(), b"heartbeat 1.1.0");
    assert!(running.pending().unwrap().is_none());
    assert_eq!(running.apply_pending().unwrap(), None);

    // The relaunched process reads the marker
    let capture = Capture::default();
    let writer = capture.clone();
    let subscriber = tracing_subscriber::fmt()
        .with_writer(move || writer.clone())
        .with_ansi(false)
        .finish();
    let relaunched = install.updater(Version::new(1, 1, 0));
    tracing::subscriber::with_default(subscriber, || {
        relaunched.take_verification_marker().unwrap();
        relaunched.take_verification_marker().unwrap();
    });

    let logs = capture.text();
    assert_eq!(logs.matches("successful update").count(), 1, "{logs}");
    let canonical = fs::canonicalize(&install.target).unwrap();
    assert!(logs.contains(&canonical.display().to_string()), "{logs}");
    assert_eq!(
        relaunched.state(),
        UpdateState::Verified {
            version: Version::new(1, 1, 0)
        }
    );
}

#[test]
fn crash_before_consume_rolls_back_and_keeps_record() {
    let install = Install::new();
    publish(&install.feed(), Version::new(1, 1, 0), b"heartbeat 1.1.0");
    let updater = install.updater(Version::new(1, 0, 0));
    updater.check().unwrap().unwrap();

    // Swap interrupted after the backup and a torn write of the target
    let journal = ApplyJournal::new(&install.layout);
    let op = journal.begin(&install.target, "1.1.0").unwrap();
    let backup = sibling(&install.target, ".heartbeat.hearth-backup");
    fs::copy(&install.target, &backup).unwrap();
    journal
        .add_rollback_step(
            &op,
            RollbackStep::RestoreFile {
                backup: backup.clone(),
                target: install.target.clone(),
            },
        )
        .unwrap();
    fs::write(&install.target, b"heart").unwrap();

    let report = updater.recover().unwrap();
    assert_eq!(report.rolled_back, 1);
    assert_eq!(fs::read(&install.target).unwrap(), b"heartbeat 1.0.0");
    assert!(!backup.exists());

    // Still pending, so the next start retries
    assert_eq!(updater.apply_pending().unwrap(), Some(Version::new(1, 1, 0)));
    assert_eq!(fs::read(&install.target).unwrap(), b"heartbeat 1.1.0");
}

#[test]
fn crash_after_consume_keeps_new_artifact() {
    let install = Install::new();
    let journal = ApplyJournal::new(&install.layout);
    let op = journal.begin(&install.target, "1.1.0").unwrap();
    let backup = sibling(&install.target, ".heartbeat.hearth-backup");
    fs::copy(&install.target, &backup).unwrap();
    journal
        .add_rollback_step(
            &op,
            RollbackStep::RestoreFile {
                backup: backup.clone(),
                target: install.target.clone(),
            },
        )
        .unwrap();
    fs::write(&install.target, b"heartbeat 1.1.0").unwrap();
    journal.mark_consumed(&op).unwrap();

    let report = install.updater(Version::new(1, 1, 0)).recover().unwrap();
    assert_eq!(report.rolled_forward, 1);
    assert_eq!(fs::read(&install.target).unwrap(), b"heartbeat 1.1.0");
    assert!(!backup.exists());
}

#[test]
fn crash_between_mark_and_consume_keeps_update() {
    let install = Install::new();
    publish(&install.feed(), Version::new(1, 1, 0), b"heartbeat 1.1.0");
    let old = install.updater(Version::new(1, 0, 0));
    old.check().unwrap().unwrap();

    // Swap done and marked consumed, process dies before deleting the record
    let journal = ApplyJournal::new(&install.layout);
    let op = journal.begin(&install.target, "1.1.0").unwrap();
    let backup = sibling(&install.target, ".heartbeat.hearth-backup");
    fs::copy(&install.target, &backup).unwrap();
    journal
        .add_rollback_step(
            &op,
            RollbackStep::RestoreFile {
                backup: backup.clone(),
                target: install.target.clone(),
            },
        )
        .unwrap();
    fs::write(&install.target, b"heartbeat 1.1.0").unwrap();
    journal.mark_consumed(&op).unwrap();
    assert!(old.pending().unwrap().is_some());

    let relaunched = install.updater(Version::new(1, 1, 0));
    let report = relaunched.recover().unwrap();
    assert_eq!(report.rolled_forward, 1);
    assert_eq!(report.rolled_back, 0);
    assert_eq!(fs::read(&install.target).unwrap(), b"heartbeat 1.1.0");

    // The leftover record is stale for the new version and never reapplied
    assert_eq!(relaunched.apply_pending().unwrap(), None);
    assert!(relaunched.pending().unwrap().is_none());
    assert_eq!(fs::read(&install.target).unwrap(), b"heartbeat 1.1.0");
}

#[test]
fn tampered_feed_never_stages() {
    let install = Install::new();
    let feed = install.feed();
    let data = b"heartbeat 1.1.0";
    let release = Release::for_artifact(Version::new(1, 1, 0), data);
    feed.publish(&identity(), &release, data).unwrap();
    fs::write(feed.artifact_path(release.digest.as_str()), b"heartbeat 6.6.6").unwrap();

    let updater = install.updater(Version::new(1, 0, 0));
    let err = updater.check().unwrap_err();
    assert!(matches!(err, CoreError::Staging(_) | CoreError::Remote(_)), "{err}");
    assert!(updater.pending().unwrap().is_none());
    assert!(fs::read_dir(install.layout.staging_dir()).unwrap().next().is_none());
}

fn sibling(path: &Path, name: &str) -> PathBuf {
    path.with_file_name(name)
}
