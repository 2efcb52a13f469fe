//! Process entry for a hearth service.
//!
//! [`ServiceRuntime::run`] is the whole control flow of one invocation:
//! decide primary or peer, settle any interrupted or pending update, start
//! the lifecycle, open the command channel, serve until stopped, and relaunch
//! the process if an update was applied on the way out.

use crate::channel::{Ack, CommandHandler, CommandListener, ListenerHandle};
use crate::concurrency::{shutdown_requested, InstanceLock};
use crate::coordinator::{Coordinator, CoordinatorOptions, Role};
use crate::executor::{TaskEngine, TaskError};
use crate::lifecycle::{Lifecycle, LifecycleConfig, ProcessMode};
use crate::plugins::{Plugin, PluginRegistry};
use crate::service::{Service, ServiceContext};
use crate::telemetry::{TelemetryConfig, TelemetryHandle};
use crate::update::{ProcessRelauncher, Relauncher, UpdateScheduler, Updater};
use crate::CoreError;
use hearth_remote::{source_for_feed, FeedConfig, UpdateSource};
use hearth_schema::{
    CommandLine, ProductCard, RuntimeCommand, ServiceIdentity, ServiceManifest, UpdatePolicy,
};
use hearth_store::{ProxySettings, RuntimeLayout, SettingsStore, StatusFiles, UPDATE_POLICY_KEY};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

const SHUTDOWN_POLL: Duration = Duration::from_millis(200);

/// How one invocation ended.
#[derive(Debug)]
pub enum RunOutcome {
    /// Another instance was running and took our arguments.
    Peer(Ack),
    /// Ran as primary until stopped.
    Stopped,
    /// Applied an update and started the new executable.
    Relaunched,
}

/// Everything needed to run one product.
pub struct ServiceRuntime {
    manifest: ServiceManifest,
    identity: ServiceIdentity,
    card: ProductCard,
    layout: RuntimeLayout,
    service: Arc<dyn Service>,
    plugins: PluginRegistry,
    source: Option<Arc<dyn UpdateSource>>,
    relauncher: Arc<dyn Relauncher>,
    telemetry: TelemetryHandle,
    target: PathBuf,
    executable: PathBuf,
}

pub struct RuntimeBuilder {
    manifest: ServiceManifest,
    service: Arc<dyn Service>,
    runtime_dir: Option<PathBuf>,
    plugins: PluginRegistry,
    source: Option<Arc<dyn UpdateSource>>,
    relauncher: Option<Arc<dyn Relauncher>>,
    telemetry: Option<TelemetryHandle>,
    target: Option<PathBuf>,
    executable: Option<PathBuf>,
}

impl RuntimeBuilder {
    /// Base directory holding one runtime directory per identity.
    /// Overrides `runtime.runtime_dir` of the manifest.
    #[must_use]
    pub fn runtime_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.runtime_dir = Some(dir.into());
        self
    }

    #[must_use]
    pub fn plugin(mut self, plugin: Box<dyn Plugin>) -> Self {
        self.plugins.add(plugin);
        self
    }

    /// Use `source` instead of the manifest feed.
    #[must_use]
    pub fn update_source(mut self, source: Arc<dyn UpdateSource>) -> Self {
        self.source = Some(source);
        self
    }

    #[must_use]
    pub fn relauncher(mut self, relauncher: Arc<dyn Relauncher>) -> Self {
        self.relauncher = Some(relauncher);
        self
    }

    #[must_use]
    pub fn telemetry(mut self, handle: TelemetryHandle) -> Self {
        self.telemetry = Some(handle);
        self
    }

    /// Artifact replaced by updates. Overrides `update.target`.
    #[must_use]
    pub fn update_target(mut self, target: impl Into<PathBuf>) -> Self {
        self.target = Some(target.into());
        self
    }

    /// Executable started after an update. Defaults to the current one.
    #[must_use]
    pub fn executable(mut self, exe: impl Into<PathBuf>) -> Self {
        self.executable = Some(exe.into());
        self
    }

    pub fn build(self) -> Result<ServiceRuntime, CoreError> {
        self.manifest.validate()?;
        let identity = self.manifest.identity()?;
        let card = self.manifest.product_card()?;

        let base = self
            .runtime_dir
            .or_else(|| self.manifest.runtime.runtime_dir.clone())
            .unwrap_or_else(default_base_dir);
        let layout = RuntimeLayout::for_identity(&base, &identity);

        let executable = match self.executable {
            Some(exe) => exe,
            None => std::env::current_exe()?,
        };
        let target = self
            .target
            .or_else(|| self.manifest.update.target.clone())
            .unwrap_or_else(|| executable.clone());

        Ok(ServiceRuntime {
            identity,
            card,
            layout,
            service: self.service,
            plugins: self.plugins,
            source: self.source,
            relauncher: self
                .relauncher
                .unwrap_or_else(|| Arc::new(ProcessRelauncher)),
            telemetry: self
                .telemetry
                .unwrap_or_else(|| TelemetryHandle::detached(TelemetryConfig::default())),
            target,
            executable,
            manifest: self.manifest,
        })
    }
}

fn default_base_dir() -> PathBuf {
    if let Some(state) = std::env::var_os("XDG_STATE_HOME").filter(|v| !v.is_empty()) {
        return PathBuf::from(state).join("hearth");
    }
    match std::env::var_os("HOME") {
        Some(home) => PathBuf::from(home).join(".local/state/hearth"),
        None => std::env::temp_dir().join("hearth"),
    }
}

/// Pieces alive while the primary serves.
struct Primary {
    engine: Arc<TaskEngine>,
    lifecycle: Lifecycle,
    updater: Arc<Updater>,
    status: StatusFiles,
    listener: Option<ListenerHandle>,
    scheduler: Option<UpdateScheduler>,
}

impl ServiceRuntime {
    pub fn builder(manifest: ServiceManifest, service: Arc<dyn Service>) -> RuntimeBuilder {
        RuntimeBuilder {
            manifest,
            service,
            runtime_dir: None,
            plugins: PluginRegistry::new(),
            source: None,
            relauncher: None,
            telemetry: None,
            target: None,
            executable: None,
        }
    }

    pub fn identity(&self) -> &ServiceIdentity {
        &self.identity
    }

    pub fn layout(&self) -> &RuntimeLayout {
        &self.layout
    }

    /// Run this invocation to completion with its command line `args`.
    pub fn run(mut self, args: CommandLine) -> Result<RunOutcome, CoreError> {
        let commands = args.commands()?;
        let coordinator = Coordinator::new(
            self.identity.clone(),
            self.layout.clone(),
            CoordinatorOptions::from(&self.manifest.runtime),
        );
        let lock = match coordinator.claim(&args)? {
            Role::Peer(ack) => return Ok(RunOutcome::Peer(ack)),
            Role::Primary(lock) => lock,
        };
        self.layout.verify_version()?;

        let settings = SettingsStore::open(self.layout.settings_file())?;
        let source = self.feed_source(&settings)?;
        let updater = Arc::new(Updater::new(
            self.card.clone(),
            self.layout.clone(),
            source,
            self.target.clone(),
        ));
        let recovered = updater.recover()?;
        if !recovered.is_empty() {
            info!(
                rolled_back = recovered.rolled_back,
                rolled_forward = recovered.rolled_forward,
                "recovered interrupted update"
            );
        }
        updater.take_verification_marker()?;

        if !commands.contains(&RuntimeCommand::NoUpdate) {
            match updater.apply_pending() {
                Ok(Some(version)) => {
                    info!(%version, "applied staged update before start");
                    drop(lock);
                    return self.relaunch(&args);
                }
                Ok(None) => {}
                Err(e) => warn!("staged update not applied: {e}"),
            }
        }

        let ctx = ServiceContext::new(self.card.clone(), settings);
        ctx.flags().set_watch(self.telemetry.watch());
        let primary = self.start_primary(ctx, lock, updater, &args, &commands)?;
        self.serve(primary, &args)
    }

    fn start_primary(
        &mut self,
        ctx: ServiceContext,
        lock: InstanceLock,
        updater: Arc<Updater>,
        args: &CommandLine,
        commands: &[RuntimeCommand],
    ) -> Result<Primary, CoreError> {
        let engine = Arc::new(TaskEngine::new(self.manifest.runtime.workers)?);
        let status = StatusFiles::new(self.layout.clone());
        status.write_pid(std::process::id())?;

        let lifecycle = Lifecycle::with_config(
            Arc::clone(&engine),
            Arc::clone(&self.service),
            ctx,
            LifecycleConfig {
                plugins: std::mem::take(&mut self.plugins),
                lock_path: Some(self.layout.lock_file()),
                status: Some(StatusFiles::new(self.layout.clone())),
            },
        );
        lifecycle.adopt_lock(lock);

        let mut primary = Primary {
            engine,
            lifecycle,
            updater,
            status,
            listener: None,
            scheduler: None,
        };
        if let Err(e) = primary
            .lifecycle
            .request_start(args.clone(), ProcessMode::Inline)
            .wait()
        {
            primary.teardown();
            return Err(CoreError::Lifecycle(e.to_string()));
        }

        self.schedule_checks(&mut primary, commands);

        // A startup `stop` may already have released the lock
        if primary.lifecycle.holds_lock() {
            let handler = Arc::new(RuntimeHandler {
                lifecycle: primary.lifecycle.clone(),
                updater: Arc::clone(&primary.updater),
                engine: Arc::clone(&primary.engine),
                policy: self.policy(&primary.lifecycle),
                reply_wait: self.manifest.runtime.ack_timeout() / 2,
            });
            match CommandListener::bind(&self.layout, &self.identity).and_then(|l| l.start(handler)) {
                Ok(handle) => primary.listener = Some(handle),
                Err(e) => {
                    primary.teardown();
                    return Err(e.into());
                }
            }
        }
        Ok(primary)
    }

    /// Update policy: the settings store overrides the manifest.
    fn policy(&self, lifecycle: &Lifecycle) -> UpdatePolicy {
        let settings = lifecycle.context().settings().lock();
        match settings.get(UPDATE_POLICY_KEY).map(str::parse::<UpdatePolicy>) {
            Some(Ok(policy)) => policy,
            Some(Err(e)) => {
                warn!("ignoring {UPDATE_POLICY_KEY} setting: {e}");
                self.manifest.update.policy
            }
            None => self.manifest.update.policy,
        }
    }

    fn schedule_checks(&self, primary: &mut Primary, commands: &[RuntimeCommand]) {
        let policy = self.policy(&primary.lifecycle);
        let flags = primary.lifecycle.context().flags();
        if flags.no_update_check() || policy == UpdatePolicy::Disabled {
            debug!(%policy, "update checks off");
            return;
        }
        let asked = commands.contains(&RuntimeCommand::UpdateCheck);
        match policy {
            UpdatePolicy::OnStartup => {
                let _ = primary.updater.check_now(&primary.engine);
            }
            UpdatePolicy::Scheduled => {
                if asked {
                    let _ = primary.updater.check_now(&primary.engine);
                }
                match UpdateScheduler::spawn(
                    Arc::clone(&primary.updater),
                    Arc::clone(&primary.engine),
                    self.manifest.update.interval(),
                ) {
                    Ok(scheduler) => primary.scheduler = Some(scheduler),
                    Err(e) => warn!("failed to start update scheduler: {e}"),
                }
            }
            UpdatePolicy::Manual if asked => {
                let _ = primary.updater.check_now(&primary.engine);
            }
            UpdatePolicy::Manual | UpdatePolicy::Disabled => {}
        }
        if commands.contains(&RuntimeCommand::UpdateApply) {
            if let Err(e) = primary.updater.request_apply(&primary.lifecycle) {
                warn!("update-apply: {e}");
            }
        }
    }

    fn serve(&self, mut primary: Primary, args: &CommandLine) -> Result<RunOutcome, CoreError> {
        let mut stop_sent = false;
        while primary.lifecycle.wait_for_shutdown_timeout(SHUTDOWN_POLL).is_err() {
            if shutdown_requested() && !stop_sent {
                info!("shutdown requested");
                let _ = primary.lifecycle.request_stop();
                stop_sent = true;
            }
        }
        primary.teardown();

        if !primary.updater.apply_requested() {
            info!(identity = %self.identity, "service stopped");
            return Ok(RunOutcome::Stopped);
        }
        primary.updater.clear_apply_request();
        let Some(lock) = InstanceLock::try_acquire(&self.layout.lock_file())? else {
            warn!("another instance started before the update could be applied");
            return Ok(RunOutcome::Stopped);
        };
        match primary.updater.apply_pending() {
            Ok(Some(version)) => {
                info!(%version, "applied staged update after stop");
                drop(lock);
                self.relaunch(args)
            }
            Ok(None) => Ok(RunOutcome::Stopped),
            Err(e) => {
                warn!("staged update not applied: {e}");
                Ok(RunOutcome::Stopped)
            }
        }
    }

    fn relaunch(&self, args: &CommandLine) -> Result<RunOutcome, CoreError> {
        self.relauncher
            .relaunch(&self.executable, &args.without_one_shot())?;
        Ok(RunOutcome::Relaunched)
    }

    fn feed_source(&self, settings: &SettingsStore) -> Result<Option<Arc<dyn UpdateSource>>, CoreError> {
        if let Some(source) = &self.source {
            return Ok(Some(Arc::clone(source)));
        }
        let Some(feed) = self.manifest.update.feed.as_deref() else {
            return Ok(None);
        };
        let token = FeedConfig::load_default()
            .ok()
            .filter(|config| !config.url.is_empty() && feed.starts_with(&config.url))
            .and_then(|config| config.auth_token);
        let proxy = ProxySettings::lookup(settings).map(|p| p.url());
        let source = source_for_feed(feed, token.as_deref(), proxy.as_deref())?;
        debug!(feed, proxied = proxy.is_some(), "update feed configured");
        Ok(Some(Arc::from(source)))
    }
}

impl Primary {
    fn teardown(&mut self) {
        if let Some(listener) = self.listener.take() {
            listener.shutdown();
            if let Err(e) = listener.join() {
                warn!("command channel: {e}");
            }
        }
        if let Some(scheduler) = self.scheduler.take() {
            scheduler.stop();
        }
        self.engine.shutdown();
        self.lifecycle.close();
        self.status.clear();
    }
}

/// Serves peer command lines: lifecycle dispatch plus the update words.
struct RuntimeHandler {
    lifecycle: Lifecycle,
    updater: Arc<Updater>,
    engine: Arc<TaskEngine>,
    policy: UpdatePolicy,
    /// How long a reply may wait on a check. The listener is serial and
    /// the peer gives up after its ack timeout.
    reply_wait: Duration,
}

impl RuntimeHandler {
    fn update_check(&self) -> Result<String, CoreError> {
        if self.policy == UpdatePolicy::Disabled {
            return Ok("update checks are disabled".to_owned());
        }
        let check = self.updater.check_now(&self.engine);
        match check.wait_timeout(self.reply_wait) {
            Ok(Some(record)) => Ok(format!("update {} staged", record.card.version)),
            Ok(None) => Ok("no update available".to_owned()),
            // Still running on the engine; its outcome lands in the update state
            Err(TaskError::Timeout) => Ok("update check started".to_owned()),
            Err(e) => Err(e.into()),
        }
    }

    fn update_apply(&self) -> Result<String, CoreError> {
        match self.updater.pending()? {
            Some(record) if self.updater.request_apply(&self.lifecycle)? => {
                Ok(format!("applying update {}", record.card.version))
            }
            _ => Ok("no staged update".to_owned()),
        }
    }
}

impl CommandHandler for RuntimeHandler {
    fn handle(&self, args: CommandLine) -> Result<String, String> {
        let mut replies = Vec::new();
        let reply = self.lifecycle.dispatch(&args).map_err(|e| e.to_string())?;
        if !reply.is_empty() {
            replies.push(reply);
        }
        if args.contains(&RuntimeCommand::UpdateCheck) {
            replies.push(self.update_check().map_err(|e| e.to_string())?);
        }
        if args.contains(&RuntimeCommand::UpdateApply) {
            replies.push(self.update_apply().map_err(|e| e.to_string())?);
        }
        Ok(replies.join("\n"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::AckStatus;
    use crate::service::HookError;
    use hearth_remote::{DirectorySource, Release, RemoteError};
    use hearth_schema::{parse_manifest_str, Version};
    use parking_lot::Mutex;
    use std::fs;
    use std::path::Path;
    use std::thread;
    use std::time::Instant;

    #[derive(Default)]
    struct Heartbeat {
        events: Mutex<Vec<String>>,
    }

    impl Service for Heartbeat {
        fn start(&self, _ctx: &ServiceContext) -> Result<(), HookError> {
            self.events.lock().push("start".to_owned());
            Ok(())
        }

        fn process(&self, _ctx: &ServiceContext, args: &CommandLine) -> Result<Option<String>, HookError> {
            self.events.lock().push(format!("process {args}"));
            Ok(Some(format!("beat {args}")))
        }

        fn stop(&self, _ctx: &ServiceContext) -> Result<(), HookError> {
            self.events.lock().push("stop".to_owned());
            Ok(())
        }
    }

    #[derive(Default)]
    struct RecordingRelauncher {
        calls: Mutex<Vec<(PathBuf, CommandLine)>>,
    }

    impl Relauncher for RecordingRelauncher {
        fn relaunch(&self, executable: &Path, args: &CommandLine) -> Result<(), CoreError> {
            self.calls.lock().push((executable.to_path_buf(), args.clone()));
            Ok(())
        }
    }

    fn manifest(version: &str, policy: &str) -> ServiceManifest {
        parse_manifest_str(&format!(
            r#"
manifest_version = 1
[service]
namespace = "org.example"
artifact = "heartbeat"
name = "Heartbeat"
version = "{version}"
[runtime]
workers = 2
peer_retries = 40
peer_retry_delay_ms = 25
[update]
policy = "{policy}"
"#
        ))
        .unwrap()
    }

    fn runtime(
        dir: &Path,
        version: &str,
        service: Arc<Heartbeat>,
        relauncher: Arc<RecordingRelauncher>,
    ) -> ServiceRuntime {
        ServiceRuntime::builder(manifest(version, "manual"), service)
            .runtime_dir(dir.join("state"))
            .update_source(Arc::new(DirectorySource::new(dir.join("feed"))))
            .update_target(dir.join("bin/heartbeat"))
            .executable(dir.join("bin/heartbeat"))
            .relauncher(relauncher)
            .build()
            .unwrap()
    }

    fn wait_started(layout: &RuntimeLayout) {
        let status = StatusFiles::new(layout.clone());
        let deadline = Instant::now() + Duration::from_secs(10);
        while Instant::now() < deadline {
            if status.read_status().is_some_and(|s| s.state == "started")
                && layout.socket_path().exists()
            {
                return;
            }
            thread::sleep(Duration::from_millis(10));
        }
        panic!("primary never started");
    }

    #[test]
    fn peer_stop_ends_primary() {
        let dir = tempfile::tempdir().unwrap();
        let service = Arc::new(Heartbeat::default());
        let relauncher = Arc::new(RecordingRelauncher::default());
        let primary = runtime(dir.path(), "1.0.0", Arc::clone(&service), Arc::clone(&relauncher));
        let layout = primary.layout().clone();

        let running = thread::spawn(move || primary.run(CommandLine::new(["execution-mode=test"])));
        wait_started(&layout);

        let peer = runtime(dir.path(), "1.0.0", Arc::new(Heartbeat::default()), Arc::clone(&relauncher));
        match peer.run(CommandLine::new(["ping", "stop"])).unwrap() {
            RunOutcome::Peer(ack) => {
                assert_eq!(ack.status, AckStatus::Accepted);
                assert_eq!(ack.message, "beat ping\nstopping");
            }
            other => panic!("expected peer, got {other:?}"),
        }

        assert!(matches!(running.join().unwrap().unwrap(), RunOutcome::Stopped));
        assert_eq!(*service.events.lock(), vec!["start", "process ping", "stop"]);
        assert!(StatusFiles::new(layout.clone()).read_pid().is_none());

        // The lock was released: a third invocation becomes primary
        let third = runtime(dir.path(), "1.0.0", Arc::new(Heartbeat::default()), relauncher);
        assert!(matches!(third.run(CommandLine::new(["stop"])).unwrap(), RunOutcome::Stopped));
    }

    #[test]
    fn staged_update_is_applied_then_relaunched() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("bin/heartbeat");
        fs::create_dir_all(target.parent().unwrap()).unwrap();
        fs::write(&target, b"heartbeat 1.0.0").unwrap();

        let feed = DirectorySource::new(dir.path().join("feed"));
        let data = b"heartbeat 1.1.0";
        let release = Release::for_artifact(Version::new(1, 1, 0), data);
        let identity = ServiceIdentity::new("org.example", "heartbeat").unwrap();
        feed.publish(&identity, &release, data).unwrap();

        let relauncher = Arc::new(RecordingRelauncher::default());
        let first = runtime(dir.path(), "1.0.0", Arc::new(Heartbeat::default()), Arc::clone(&relauncher));
        let layout = first.layout().clone();
        layout.initialize().unwrap();
        let updater = Updater::new(
            ProductCard::new(identity, "Heartbeat", Version::new(1, 0, 0)),
            layout.clone(),
            Some(Arc::new(feed)),
            target.clone(),
        );
        updater.check().unwrap().unwrap();

        let outcome = first
            .run(CommandLine::new(["watch", "status", "no-update-check"]))
            .unwrap();
        assert!(matches!(outcome, RunOutcome::Relaunched));
        assert_eq!(fs::read(&target).unwrap(), data);
        let calls = relauncher.calls.lock().clone();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, target);
        assert_eq!(calls[0].1, CommandLine::new(["watch", "no-update-check"]));

        // The relaunched version consumes the marker and finds nothing to apply
        let second = runtime(dir.path(), "1.1.0", Arc::new(Heartbeat::default()), Arc::clone(&relauncher));
        assert!(matches!(second.run(CommandLine::new(["stop"])).unwrap(), RunOutcome::Stopped));
        assert!(!layout.applied_marker().exists());
        assert_eq!(relauncher.calls.lock().len(), 1);
    }

    #[test]
    fn no_update_keeps_staged_record() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("bin/heartbeat");
        fs::create_dir_all(target.parent().unwrap()).unwrap();
        fs::write(&target, b"old").unwrap();

        let relauncher = Arc::new(RecordingRelauncher::default());
        let rt = runtime(dir.path(), "1.0.0", Arc::new(Heartbeat::default()), Arc::clone(&relauncher));
        let layout = rt.layout().clone();
        layout.initialize().unwrap();
        let identity = ServiceIdentity::new("org.example", "heartbeat").unwrap();
        let updater = Updater::new(
            ProductCard::new(identity, "Heartbeat", Version::new(1, 0, 0)),
            layout,
            None,
            target.clone(),
        );
        let release = Release::for_artifact(Version::new(2, 0, 0), b"new");
        updater.stage(&release, b"new").unwrap();

        let outcome = rt.run(CommandLine::new(["no-update", "stop"])).unwrap();
        assert!(matches!(outcome, RunOutcome::Stopped));
        assert_eq!(fs::read(&target).unwrap(), b"old");
        assert!(updater.pending().unwrap().is_some());
        assert!(relauncher.calls.lock().is_empty());
    }

    #[test]
    fn failing_start_is_a_lifecycle_error() {
        struct Broken;
        impl Service for Broken {
            fn start(&self, _ctx: &ServiceContext) -> Result<(), HookError> {
                Err("port in use".into())
            }
            fn stop(&self, _ctx: &ServiceContext) -> Result<(), HookError> {
                Ok(())
            }
        }
        let dir = tempfile::tempdir().unwrap();
        let rt = ServiceRuntime::builder(manifest("1.0.0", "disabled"), Arc::new(Broken))
            .runtime_dir(dir.path())
            .executable(dir.path().join("exe"))
            .build()
            .unwrap();
        let layout = rt.layout().clone();
        let err = rt.run(CommandLine::default()).unwrap_err();
        assert!(err.is_lifecycle(), "{err}");
        assert!(InstanceLock::try_acquire(&layout.lock_file()).unwrap().is_some());
    }

    #[test]
    fn settings_policy_overrides_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let rt = runtime(
            dir.path(),
            "1.0.0",
            Arc::new(Heartbeat::default()),
            Arc::new(RecordingRelauncher::default()),
        );
        let mut settings = SettingsStore::open(dir.path().join("s.json")).unwrap();
        settings.set(UPDATE_POLICY_KEY, "disabled").unwrap();
        let engine = Arc::new(TaskEngine::new(2).unwrap());
        let lifecycle = Lifecycle::new(
            engine,
            Arc::new(Heartbeat::default()),
            ServiceContext::new(rt.card.clone(), settings),
        );
        assert_eq!(rt.policy(&lifecycle), UpdatePolicy::Disabled);
    }

    struct SlowFeed;

    impl UpdateSource for SlowFeed {
        fn list_releases(&self, _identity: &ServiceIdentity) -> Result<Vec<Release>, RemoteError> {
            thread::sleep(Duration::from_millis(500));
            Ok(Vec::new())
        }

        fn fetch_artifact(&self, release: &Release) -> Result<Vec<u8>, RemoteError> {
            Err(RemoteError::NotFound(release.digest.to_string()))
        }
    }

    fn update_handler(dir: &Path, source: Arc<dyn UpdateSource>) -> RuntimeHandler {
        let card = manifest("1.0.0", "manual").product_card().unwrap();
        let layout = RuntimeLayout::for_identity(dir.join("state"), &card.identity);
        layout.initialize().unwrap();
        let engine = Arc::new(TaskEngine::new(2).unwrap());
        engine.start();
        let settings = SettingsStore::open(layout.settings_file()).unwrap();
        let lifecycle = Lifecycle::new(
            Arc::clone(&engine),
            Arc::new(Heartbeat::default()),
            ServiceContext::new(card.clone(), settings),
        );
        RuntimeHandler {
            lifecycle,
            updater: Arc::new(Updater::new(card, layout, Some(source), dir.join("exe"))),
            engine,
            policy: UpdatePolicy::Manual,
            reply_wait: Duration::from_millis(50),
        }
    }

    #[test]
    fn slow_update_check_does_not_hold_the_channel() {
        let dir = tempfile::tempdir().unwrap();
        let handler = update_handler(dir.path(), Arc::new(SlowFeed));

        let begun = Instant::now();
        let reply = handler.handle(CommandLine::new(["update-check"])).unwrap();
        assert_eq!(reply, "update check started");
        assert!(begun.elapsed() < Duration::from_millis(400));
        handler.engine.shutdown();
    }

    #[test]
    fn quick_update_check_reports_outcome() {
        let dir = tempfile::tempdir().unwrap();
        let feed = Arc::new(DirectorySource::new(dir.path().join("feed")));
        let mut handler = update_handler(dir.path(), feed);
        handler.reply_wait = Duration::from_secs(5);
        let reply = handler.handle(CommandLine::new(["update-check"])).unwrap();
        assert_eq!(reply, "no update available");
        handler.engine.shutdown();
    }

    #[test]
    fn unknown_reserved_word_is_rejected_before_claim() {
        let dir = tempfile::tempdir().unwrap();
        let rt = runtime(
            dir.path(),
            "1.0.0",
            Arc::new(Heartbeat::default()),
            Arc::new(RecordingRelauncher::default()),
        );
        let layout = rt.layout().clone();
        assert!(matches!(
            rt.run(CommandLine::new(["execution-mode=bogus"])),
            Err(CoreError::Schema(_))
        ));
        assert!(!layout.lock_file().exists());
    }
}
