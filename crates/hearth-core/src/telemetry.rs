//! Process-wide diagnostics setup.
//!
//! Components only ever use `tracing` macros. The host installs the
//! subscriber once through [`init`] and hands the returned
//! [`TelemetryHandle`] to the runtime, which asks it whether watch output is
//! wanted instead of consulting any global level.

use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

/// Environment variable holding an `EnvFilter` directive.
pub const LOG_ENV: &str = "HEARTH_LOG";

static INSTALLED: AtomicBool = AtomicBool::new(false);

#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("invalid {LOG_ENV} filter: {0}")]
    Filter(String),
    #[error("failed to install log subscriber: {0}")]
    Subscriber(String),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TelemetryConfig {
    pub verbose: bool,
    pub trace: bool,
    /// Print lifecycle changes while the primary runs in the foreground.
    pub watch: bool,
}

impl TelemetryConfig {
    pub fn default_level(&self) -> &'static str {
        if self.trace {
            "trace"
        } else if self.verbose || self.watch {
            "debug"
        } else {
            "info"
        }
    }
}

/// Proof that diagnostics are set up, carried into the runtime.
#[derive(Debug, Clone)]
pub struct TelemetryHandle {
    config: TelemetryConfig,
}

impl TelemetryHandle {
    /// A handle for code paths that never installed a subscriber.
    pub fn detached(config: TelemetryConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &TelemetryConfig {
        &self.config
    }

    pub fn watch(&self) -> bool {
        self.config.watch
    }

    /// Last event of the process.
    pub fn shutdown(&self) {
        info!("telemetry shutting down");
    }
}

/// Install the fmt subscriber on stderr. A second call keeps the first
/// subscriber and only returns a handle for the new config.
pub fn init(config: &TelemetryConfig) -> Result<TelemetryHandle, TelemetryError> {
    let filter = build_filter(std::env::var(LOG_ENV).ok().as_deref(), config.default_level())?;
    if INSTALLED.swap(true, Ordering::SeqCst) {
        debug!("log subscriber already installed");
        return Ok(TelemetryHandle::detached(*config));
    }

    let installed = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .without_time()
        .with_writer(std::io::stderr)
        .try_init();
    if let Err(e) = installed {
        INSTALLED.store(false, Ordering::SeqCst);
        return Err(TelemetryError::Subscriber(e.to_string()));
    }
    Ok(TelemetryHandle::detached(*config))
}

fn build_filter(directive: Option<&str>, default_level: &str) -> Result<EnvFilter, TelemetryError> {
    match directive {
        Some(d) if !d.trim().is_empty() => {
            EnvFilter::try_new(d).map_err(|e| TelemetryError::Filter(e.to_string()))
        }
        _ => Ok(EnvFilter::new(default_level)),
    }
}
