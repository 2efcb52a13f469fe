//! Service identity, versions, product cards, manifests and the command vocabulary for hearth.
//!
//! This crate defines the schema layer shared by every other crate: the
//! `ServiceIdentity` that scopes locks, channels and settings, the totally
//! ordered `Version`, the `ProductCard` describing a deployable unit, the
//! TOML `ServiceManifest`, and the `CommandLine` vocabulary reserved by the
//! runtime (`stop`, `restart`, `status`, ...).

pub mod command;
pub mod identity;
pub mod manifest;
pub mod product;
pub mod types;
pub mod version;

pub use command::{CommandLine, ExecutionMode, RuntimeCommand};
pub use identity::ServiceIdentity;
pub use manifest::{
    parse_manifest_file, parse_manifest_str, ManifestError, RuntimeSection, ServiceManifest,
    ServiceSection, UpdatePolicy, UpdateSection, MANIFEST_FILE, MIN_WORKERS,
};
pub use product::ProductCard;
pub use types::{ArtifactDigest, ArtifactName, Namespace};
pub use version::Version;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("invalid service identity '{0}', expected '<namespace>/<artifact>'")]
    InvalidIdentity(String),
    #[error("invalid {field} '{value}': {reason}")]
    InvalidComponent {
        field: &'static str,
        value: String,
        reason: &'static str,
    },
    #[error("invalid version '{0}', expected major.minor.micro[.qualifier]")]
    InvalidVersion(String),
    #[error("unknown execution mode '{0}', expected 'production' or 'test'")]
    InvalidExecutionMode(String),
    #[error("unknown update policy '{0}'")]
    InvalidPolicy(String),
}
