//! The hearth service runtime.
//!
//! This crate ties the schema, store and remote layers into the pieces a
//! single-instance service needs: the lifecycle-gated [`TaskEngine`], the
//! [`Lifecycle`] state machine, the [`InstanceLock`] plus command channel
//! pair that lets later invocations forward their arguments to the primary,
//! the [`Updater`] implementing stage-then-restart self-update, and the
//! [`ServiceRuntime`] that wires them together at process entry.

pub mod channel;
pub mod concurrency;
pub mod coordinator;
pub mod executor;
pub mod lifecycle;
pub mod plugins;
pub mod runtime;
pub mod service;
pub mod telemetry;
pub mod update;

pub use channel::{
    connect_to_holder, resolve_endpoint, send_command, Ack, AckStatus, ChannelError,
    CommandHandler, CommandListener, CommandRequest, Endpoint, HolderConnection, ListenerHandle,
    CHANNEL_PROTOCOL_VERSION,
};
pub use concurrency::{install_signal_handler, shutdown_requested, InstanceLock};
pub use coordinator::{Coordinator, CoordinatorOptions, Role};
pub use executor::{AsyncResult, TaskEngine, TaskError, TaskState};
pub use lifecycle::{
    validate_transition, Lifecycle, LifecycleConfig, ProcessMode, ServiceState, TransitionOutcome,
};
pub use plugins::{Plugin, PluginRegistry};
pub use runtime::{RunOutcome, RuntimeBuilder, ServiceRuntime};
pub use service::{HookError, RuntimeFlags, Service, ServiceContext};
pub use telemetry::{TelemetryConfig, TelemetryError, TelemetryHandle, LOG_ENV};
pub use update::{
    AppliedMarker, ProcessRelauncher, Relauncher, UpdateScheduler, UpdateState, Updater,
};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("manifest error: {0}")]
    Manifest(#[from] hearth_schema::ManifestError),
    #[error("invalid argument: {0}")]
    Schema(#[from] hearth_schema::SchemaError),
    #[error("store error: {0}")]
    Store(#[from] hearth_store::StoreError),
    #[error("remote error: {0}")]
    Remote(#[from] hearth_remote::RemoteError),
    #[error("invalid state transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },
    #[error("lifecycle failure: {0}")]
    Lifecycle(String),
    #[error("cannot reach primary instance of {identity} after {attempts} attempts")]
    PrimaryUnreachable { identity: String, attempts: u32 },
    #[error("command channel error: {0}")]
    Channel(#[from] ChannelError),
    #[error("staging failure: {0}")]
    Staging(String),
    #[error("apply failure: {0}")]
    Apply(String),
    #[error("timed out waiting for {0}")]
    WaitTimeout(String),
    #[error("task error: {0}")]
    Task(#[from] TaskError),
    #[error("telemetry error: {0}")]
    Telemetry(#[from] TelemetryError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl CoreError {
    /// Whether this is a coordination failure: the process could neither
    /// become primary nor hand its arguments to the primary.
    pub fn is_coordination(&self) -> bool {
        matches!(self, Self::PrimaryUnreachable { .. } | Self::Channel(_))
    }

    pub fn is_lifecycle(&self) -> bool {
        matches!(
            self,
            Self::Lifecycle(_) | Self::InvalidTransition { .. } | Self::WaitTimeout(_)
        )
    }
}
