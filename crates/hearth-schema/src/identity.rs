use crate::types::{ArtifactName, Namespace};
use crate::SchemaError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Stable (namespace, artifact) pair identifying a product.
///
/// Used as the key for the instance lock, the command channel and the
/// per-product runtime directory, so both halves are restricted to characters
/// that are safe as a single path component.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ServiceIdentity {
    namespace: Namespace,
    artifact: ArtifactName,
}

impl ServiceIdentity {
    pub fn new(namespace: &str, artifact: &str) -> Result<Self, SchemaError> {
        validate_component("namespace", namespace)?;
        validate_component("artifact", artifact)?;
        Ok(Self {
            namespace: Namespace::new(namespace),
            artifact: ArtifactName::new(artifact),
        })
    }

    /// Parse the `<namespace>/<artifact>` form produced by `Display`.
    pub fn parse(input: &str) -> Result<Self, SchemaError> {
        let (namespace, artifact) = input
            .split_once('/')
            .ok_or_else(|| SchemaError::InvalidIdentity(input.to_owned()))?;
        Self::new(namespace, artifact)
    }

    pub fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    pub fn artifact(&self) -> &ArtifactName {
        &self.artifact
    }

    /// Short blake3-derived token, unique per identity.
    ///
    /// Used where the full identity would be too long, e.g. Unix socket names.
    pub fn key(&self) -> String {
        let hex = blake3::hash(self.to_string().as_bytes()).to_hex();
        hex[..12].to_owned()
    }
}

impl fmt::Display for ServiceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.artifact)
    }
}

impl TryFrom<String> for ServiceIdentity {
    type Error = SchemaError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<ServiceIdentity> for String {
    fn from(id: ServiceIdentity) -> Self {
        id.to_string()
    }
}

fn validate_component(field: &'static str, value: &str) -> Result<(), SchemaError> {
    if value.is_empty() || value.len() > 64 {
        return Err(SchemaError::InvalidComponent {
            field,
            value: value.to_owned(),
            reason: "must be 1-64 characters",
        });
    }
    if value == "." || value == ".." {
        return Err(SchemaError::InvalidComponent {
            field,
            value: value.to_owned(),
            reason: "must not be a relative path component",
        });
    }
    if !value
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_' | b'-'))
    {
        return Err(SchemaError::InvalidComponent {
            field,
            value: value.to_owned(),
            reason: "must match [A-Za-z0-9._-]",
        });
    }
    Ok(())
}
