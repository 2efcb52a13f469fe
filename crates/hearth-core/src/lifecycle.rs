//! Service lifecycle state machine.
//!
//! Every transition request becomes an operation in a FIFO queue drained by
//! the task engine, one operation at a time. Start and stop hooks therefore
//! never overlap, requests are served in the order they were made, and a
//! slow hook never blocks the thread that asked for the transition.

use crate::channel::CommandHandler;
use crate::concurrency::InstanceLock;
use crate::executor::{panic_message, AsyncResult, TaskEngine, TaskError};
use crate::plugins::PluginRegistry;
use crate::service::{HookError, Service, ServiceContext};
use crate::CoreError;
use hearth_schema::{CommandLine, RuntimeCommand};
use hearth_store::{StatusFiles, StatusSnapshot};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::convert::Infallible;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServiceState {
    Stopped,
    Starting,
    Started,
    Stopping,
}

impl fmt::Display for ServiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stopped => f.write_str("stopped"),
            Self::Starting => f.write_str("starting"),
            Self::Started => f.write_str("started"),
            Self::Stopping => f.write_str("stopping"),
        }
    }
}

pub fn validate_transition(from: ServiceState, to: ServiceState) -> Result<(), CoreError> {
    let valid = matches!(
        (from, to),
        (ServiceState::Stopped, ServiceState::Starting)
            | (
                ServiceState::Starting,
                ServiceState::Started | ServiceState::Stopped
            )
            | (ServiceState::Started, ServiceState::Stopping)
            | (ServiceState::Stopping, ServiceState::Stopped)
    );

    if valid {
        Ok(())
    } else {
        Err(CoreError::InvalidTransition {
            from: from.to_string(),
            to: to.to_string(),
        })
    }
}

/// Result of a transition request that did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionOutcome {
    Started,
    Stopped,
    Restarted,
    AlreadyActive,
    AlreadyInactive,
}

/// When the process hook handles the starting command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessMode {
    /// Before the start request resolves; for callers waiting on startup.
    Inline,
    /// As a separate task once the service is started.
    Deferred,
}

enum Op {
    Start { args: CommandLine, mode: ProcessMode },
    Stop,
    Restart,
}

impl Op {
    fn is_start(&self) -> bool {
        matches!(self, Self::Start { .. } | Self::Restart)
    }
}

struct Machine {
    state: ServiceState,
    /// Start and restart operations queued or in progress.
    pending_starts: usize,
    /// Outcome of the most recent completed start attempt.
    last_start: Option<Result<(), String>>,
}

/// Optional collaborators of a [`Lifecycle`].
#[derive(Default)]
pub struct LifecycleConfig {
    pub plugins: PluginRegistry,
    /// Lock re-acquired by a start when none is held.
    pub lock_path: Option<PathBuf>,
    pub status: Option<StatusFiles>,
}

struct Shared {
    engine: Arc<TaskEngine>,
    service: Arc<dyn Service>,
    ctx: ServiceContext,
    plugins: PluginRegistry,
    status: Option<StatusFiles>,
    lock_path: Option<PathBuf>,
    lock: Mutex<Option<InstanceLock>>,
    machine: Mutex<Machine>,
    changed: Condvar,
    ops: Mutex<VecDeque<(Op, AsyncResult<TransitionOutcome>)>>,
    transition: Mutex<()>,
    dispatch: Mutex<()>,
}

/// Drives one service through STOPPED, STARTING, STARTED and STOPPING.
#[derive(Clone)]
pub struct Lifecycle {
    shared: Arc<Shared>,
}

impl Lifecycle {
    pub fn new(engine: Arc<TaskEngine>, service: Arc<dyn Service>, ctx: ServiceContext) -> Self {
        Self::with_config(engine, service, ctx, LifecycleConfig::default())
    }

    pub fn with_config(
        engine: Arc<TaskEngine>,
        service: Arc<dyn Service>,
        ctx: ServiceContext,
        config: LifecycleConfig,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                engine,
                service,
                ctx,
                plugins: config.plugins,
                status: config.status,
                lock_path: config.lock_path,
                lock: Mutex::new(None),
                machine: Mutex::new(Machine {
                    state: ServiceState::Stopped,
                    pending_starts: 0,
                    last_start: None,
                }),
                changed: Condvar::new(),
                ops: Mutex::new(VecDeque::new()),
                transition: Mutex::new(()),
                dispatch: Mutex::new(()),
            }),
        }
    }

    /// Hand over an instance lock acquired by the coordinator.
    pub fn adopt_lock(&self, lock: InstanceLock) {
        *self.shared.lock.lock() = Some(lock);
    }

    pub fn holds_lock(&self) -> bool {
        self.shared.lock.lock().is_some()
    }

    pub fn context(&self) -> &ServiceContext {
        &self.shared.ctx
    }

    pub fn state(&self) -> ServiceState {
        self.shared.machine.lock().state
    }

    /// True only while STARTED.
    pub fn is_running(&self) -> bool {
        self.state() == ServiceState::Started
    }

    /// Queue a start. `args` is the primary's own command line: its
    /// environment words are applied before the start hook, the rest goes
    /// to the process hook once started.
    pub fn request_start(&self, args: CommandLine, mode: ProcessMode) -> AsyncResult<TransitionOutcome> {
        self.shared.engine.start();
        self.shared.enqueue(Op::Start { args, mode })
    }

    /// Queue a stop. Resolves to `AlreadyInactive` when nothing is running.
    pub fn request_stop(&self) -> AsyncResult<TransitionOutcome> {
        self.shared.engine.start();
        self.shared.enqueue(Op::Stop)
    }

    /// Stop then start in one operation. The instance lock is kept across it.
    pub fn request_restart(&self) -> AsyncResult<TransitionOutcome> {
        self.shared.engine.start();
        self.shared.enqueue(Op::Restart)
    }

    /// Block until STARTED. Returns at once if a start already completed, and
    /// fails if the most recent start attempt failed with nothing else queued.
    pub fn wait_for_startup(&self) -> Result<(), CoreError> {
        let mut m = self.shared.machine.lock();
        loop {
            if let Some(outcome) = startup_reached(&m) {
                return outcome;
            }
            self.shared.changed.wait(&mut m);
        }
    }

    pub fn wait_for_startup_timeout(&self, timeout: Duration) -> Result<(), CoreError> {
        let deadline = Instant::now() + timeout;
        let mut m = self.shared.machine.lock();
        loop {
            if let Some(outcome) = startup_reached(&m) {
                return outcome;
            }
            if self.shared.changed.wait_until(&mut m, deadline).timed_out() {
                return startup_reached(&m)
                    .unwrap_or_else(|| Err(CoreError::WaitTimeout("service startup".to_owned())));
            }
        }
    }

    /// Block until STOPPED with no start queued.
    pub fn wait_for_shutdown(&self) {
        let mut m = self.shared.machine.lock();
        while !shutdown_reached(&m) {
            self.shared.changed.wait(&mut m);
        }
    }

    pub fn wait_for_shutdown_timeout(&self, timeout: Duration) -> Result<(), CoreError> {
        let deadline = Instant::now() + timeout;
        let mut m = self.shared.machine.lock();
        while !shutdown_reached(&m) {
            if self.shared.changed.wait_until(&mut m, deadline).timed_out() && !shutdown_reached(&m) {
                return Err(CoreError::WaitTimeout("service shutdown".to_owned()));
            }
        }
        Ok(())
    }

    /// Wait until the state differs from `current` or `timeout` elapses.
    /// Returns the state observed last.
    pub fn wait_for_change(&self, current: ServiceState, timeout: Duration) -> ServiceState {
        let deadline = Instant::now() + timeout;
        let mut m = self.shared.machine.lock();
        while m.state == current {
            if self.shared.changed.wait_until(&mut m, deadline).timed_out() {
                break;
            }
        }
        m.state
    }

    /// Handle one command line from a peer: environment words, the process
    /// hook, then lifecycle words. Calls are serialized.
    pub fn dispatch(&self, args: &CommandLine) -> Result<String, CoreError> {
        let commands = args.commands()?;
        self.shared.apply_environment(&commands)?;
        self.shared.handle_commands(&commands)
    }

    /// `<identity> <state> pid=<pid> version=<version>`
    pub fn status_line(&self) -> String {
        self.shared.status_line()
    }

    /// Cancel operations still queued, e.g. after the engine was shut down.
    pub fn close(&self) {
        let dropped: Vec<_> = self.shared.ops.lock().drain(..).collect();
        for (op, result) in dropped {
            result.cancel();
            if op.is_start() {
                self.shared.finish_start(None);
            }
        }
    }
}

impl CommandHandler for Lifecycle {
    fn handle(&self, args: CommandLine) -> Result<String, String> {
        self.dispatch(&args).map_err(|e| e.to_string())
    }
}

fn startup_reached(m: &Machine) -> Option<Result<(), CoreError>> {
    if m.state == ServiceState::Started {
        return Some(Ok(()));
    }
    if m.pending_starts > 0 {
        return None;
    }
    match &m.last_start {
        Some(Ok(())) => Some(Ok(())),
        Some(Err(msg)) => Some(Err(CoreError::Lifecycle(msg.clone()))),
        None => None,
    }
}

fn shutdown_reached(m: &Machine) -> bool {
    m.state == ServiceState::Stopped && m.pending_starts == 0
}

impl Shared {
    fn enqueue(self: &Arc<Self>, op: Op) -> AsyncResult<TransitionOutcome> {
        let result = AsyncResult::pending();
        if op.is_start() {
            self.machine.lock().pending_starts += 1;
        }
        self.ops.lock().push_back((op, result.clone()));
        let shared = Arc::clone(self);
        // Each queued job drains exactly one operation, oldest first
        let _ = self.engine.submit(move || {
            shared.drain_one();
            Ok::<(), Infallible>(())
        });
        result
    }

    fn drain_one(self: &Arc<Self>) {
        let _turn = self.transition.lock();
        let Some((op, result)) = self.ops.lock().pop_front() else {
            return;
        };
        let is_start = op.is_start();
        if !result.begin() {
            debug!("skipping cancelled lifecycle request");
            if is_start {
                self.finish_start(None);
            }
            return;
        }

        let outcome = match op {
            Op::Start { args, mode } => self.run_start(&args, mode),
            Op::Stop => self.run_stop(true),
            Op::Restart => self.run_restart(),
        };
        if is_start {
            let attempt = match &outcome {
                Ok(TransitionOutcome::AlreadyActive) => None,
                Ok(_) => Some(Ok(())),
                Err(e) => Some(Err(e.to_string())),
            };
            self.finish_start(attempt);
        }
        result.resolve(outcome.map_err(TaskError::failed));
    }

    fn finish_start(&self, attempt: Option<Result<(), String>>) {
        let mut m = self.machine.lock();
        m.pending_starts = m.pending_starts.saturating_sub(1);
        if attempt.is_some() {
            m.last_start = attempt;
        }
        drop(m);
        self.changed.notify_all();
    }

    fn run_start(self: &Arc<Self>, args: &CommandLine, mode: ProcessMode) -> Result<TransitionOutcome, CoreError> {
        if matches!(
            self.machine.lock().state,
            ServiceState::Starting | ServiceState::Started
        ) {
            return Ok(TransitionOutcome::AlreadyActive);
        }
        let commands = args.commands()?;
        self.apply_environment(&commands)?;
        self.start_phase()?;

        match mode {
            ProcessMode::Inline => self.process_startup(&commands),
            ProcessMode::Deferred => {
                let shared = Arc::clone(self);
                let _ = self.engine.submit(move || {
                    shared.process_startup(&commands);
                    Ok::<(), Infallible>(())
                });
            }
        }
        Ok(TransitionOutcome::Started)
    }

    /// STOPPED to STARTED, or back to STOPPED if anything fails.
    fn start_phase(&self) -> Result<(), CoreError> {
        self.set_state(ServiceState::Starting)?;
        if let Err(e) = self.ensure_lock() {
            self.set_state(ServiceState::Stopped)?;
            return Err(e);
        }

        self.plugins.start_all(&self.ctx);
        if let Err(e) = self.call_hook("start", || self.service.start(&self.ctx)) {
            warn!("{e}");
            self.plugins.stop_all(&self.ctx);
            self.lock.lock().take();
            self.set_state(ServiceState::Stopped)?;
            return Err(e);
        }
        self.set_state(ServiceState::Started)
    }

    fn run_stop(&self, release_lock: bool) -> Result<TransitionOutcome, CoreError> {
        if matches!(
            self.machine.lock().state,
            ServiceState::Stopping | ServiceState::Stopped
        ) {
            return Ok(TransitionOutcome::AlreadyInactive);
        }
        self.set_state(ServiceState::Stopping)?;
        let hook = self.call_hook("stop", || self.service.stop(&self.ctx));
        if let Err(e) = &hook {
            warn!("{e}");
        }
        self.plugins.stop_all(&self.ctx);
        if release_lock {
            self.lock.lock().take();
        }
        self.set_state(ServiceState::Stopped)?;
        hook.map(|()| TransitionOutcome::Stopped)
    }

    fn run_restart(&self) -> Result<TransitionOutcome, CoreError> {
        if let Err(e) = self.run_stop(false) {
            warn!("restart continues after failed stop: {e}");
        }
        self.start_phase()?;
        Ok(TransitionOutcome::Restarted)
    }

    fn ensure_lock(&self) -> Result<(), CoreError> {
        let mut slot = self.lock.lock();
        if slot.is_some() {
            return Ok(());
        }
        let Some(path) = &self.lock_path else {
            return Ok(());
        };
        match InstanceLock::try_acquire(path)? {
            Some(lock) => {
                *slot = Some(lock);
                Ok(())
            }
            None => Err(CoreError::Lifecycle(format!(
                "instance lock {} is held by another process",
                path.display()
            ))),
        }
    }

    fn call_hook<T>(&self, name: &str, hook: impl FnOnce() -> Result<T, HookError>) -> Result<T, CoreError> {
        let _enter = self.ctx.span().enter();
        match catch_unwind(AssertUnwindSafe(hook)) {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(CoreError::Lifecycle(format!("{name} hook failed: {e}"))),
            Err(panic) => Err(CoreError::Lifecycle(format!(
                "{name} hook panicked: {}",
                panic_message(panic.as_ref())
            ))),
        }
    }

    fn apply_environment(&self, commands: &[RuntimeCommand]) -> Result<(), CoreError> {
        for command in commands {
            match command {
                RuntimeCommand::ExecutionMode(mode) => {
                    debug!(%mode, "execution mode selected");
                    self.ctx.set_execution_mode(*mode);
                }
                RuntimeCommand::SettingsReset => {
                    let mut settings = self.ctx.settings().lock();
                    settings.reset();
                    settings.flush()?;
                    info!("settings reset");
                }
                RuntimeCommand::NoUpdate => self.ctx.flags().set_no_update(true),
                RuntimeCommand::NoUpdateCheck => self.ctx.flags().set_no_update_check(true),
                RuntimeCommand::Watch => self.ctx.flags().set_watch(true),
                _ => {}
            }
        }
        Ok(())
    }

    fn process_startup(self: &Arc<Self>, commands: &[RuntimeCommand]) {
        match self.handle_commands(commands) {
            Ok(reply) if !reply.is_empty() => info!("{reply}"),
            Ok(_) => {}
            Err(e) => warn!("startup command line: {e}"),
        }
    }

    fn handle_commands(self: &Arc<Self>, commands: &[RuntimeCommand]) -> Result<String, CoreError> {
        let _serial = self.dispatch.lock();
        let mut replies = Vec::new();

        let service_args = CommandLine::new(commands.iter().filter_map(|c| match c {
            RuntimeCommand::Argument(arg) => Some(arg.clone()),
            _ => None,
        }));
        if !service_args.is_empty() {
            if self.machine.lock().state != ServiceState::Started {
                return Err(CoreError::Lifecycle(format!(
                    "{} is not running",
                    self.ctx.identity()
                )));
            }
            if let Some(reply) = self.call_hook("process", || {
                self.service.process(&self.ctx, &service_args)
            })? {
                replies.push(reply);
            }
        }

        for command in commands {
            match command {
                RuntimeCommand::Stop => {
                    let _ = self.enqueue(Op::Stop);
                    replies.push("stopping".to_owned());
                }
                RuntimeCommand::Restart => {
                    self.engine.start();
                    let _ = self.enqueue(Op::Restart);
                    replies.push("restarting".to_owned());
                }
                RuntimeCommand::Status => replies.push(self.status_line()),
                _ => {}
            }
        }
        Ok(replies.join("\n"))
    }

    fn set_state(&self, to: ServiceState) -> Result<(), CoreError> {
        let from = {
            let mut m = self.machine.lock();
            let from = m.state;
            validate_transition(from, to)?;
            m.state = to;
            from
        };
        self.changed.notify_all();
        info!(identity = %self.ctx.identity(), %from, %to, "service state changed");
        if self.ctx.flags().watch() {
            eprintln!("[watch] {}: {from} -> {to}", self.ctx.identity());
        }
        if let Some(status) = &self.status {
            let snapshot = StatusSnapshot::new(
                self.ctx.identity().to_string(),
                to.to_string(),
                self.ctx.card().version.to_string(),
            );
            if let Err(e) = status.write_status(&snapshot) {
                warn!("failed to write status file: {e}");
            }
        }
        Ok(())
    }

    fn status_line(&self) -> String {
        format!(
            "{} {} pid={} version={}",
            self.ctx.identity(),
            self.machine.lock().state,
            std::process::id(),
            self.ctx.card().version
        )
    }
}
