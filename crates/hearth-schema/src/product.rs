use crate::identity::ServiceIdentity;
use crate::version::Version;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::path::PathBuf;

/// Describes a deployable unit: who it is, what it is called, which version.
///
/// `released` is advisory metadata only; ordering between cards is decided by
/// [`Version`] alone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductCard {
    pub identity: ServiceIdentity,
    pub name: String,
    pub version: Version,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub released: Option<String>,
    /// Reference to the product's descriptor data (opaque to the runtime).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub descriptor: Option<PathBuf>,
}

impl ProductCard {
    pub fn new(identity: ServiceIdentity, name: &str, version: Version) -> Self {
        Self {
            identity,
            name: name.to_owned(),
            version,
            released: None,
            descriptor: None,
        }
    }

    /// Compare by version only. Cards of different identities are unordered.
    pub fn compare_version(&self, other: &Self) -> Option<Ordering> {
        if self.identity != other.identity {
            return None;
        }
        Some(self.version.cmp(&other.version))
    }

    /// Whether `other` is a strictly newer release of the same product.
    pub fn is_superseded_by(&self, other: &Self) -> bool {
        self.compare_version(other) == Some(Ordering::Less)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn card(artifact: &str, version: &str, released: Option<&str>) -> ProductCard {
        let mut card = ProductCard::new(
            ServiceIdentity::new("org.example", artifact).unwrap(),
            "Heartbeat",
            Version::parse(version).unwrap(),
        );
        card.released = released.map(str::to_owned);
        card
    }

    #[test]
    fn release_timestamp_does_not_affect_ordering() {
        let old_but_late = card("hb", "1.0.0", Some("2030-01-01T00:00:00Z"));
        let new_but_early = card("hb", "1.1.0", Some("2001-01-01T00:00:00Z"));
        assert!(old_but_late.is_superseded_by(&new_but_early));
        assert!(!new_but_early.is_superseded_by(&old_but_late));
    }

    #[test]
    fn different_products_are_unordered() {
        let a = card("hb", "1.0.0", None);
        let b = card("other", "2.0.0", None);
        assert_eq!(a.compare_version(&b), None);
        assert!(!a.is_superseded_by(&b));
    }

    #[test]
    fn equal_versions_do_not_supersede() {
        let a = card("hb", "1.0.0", None);
        let b = card("hb", "1.0.0", None);
        assert!(!a.is_superseded_by(&b));
    }

    #[test]
    fn json_omits_absent_optionals() {
        let json = serde_json::to_string(&card("hb", "1.0.0", None)).unwrap();
        assert!(!json.contains("released"));
        assert!(!json.contains("descriptor"));
    }
}
