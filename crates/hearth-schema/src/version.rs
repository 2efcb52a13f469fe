use crate::SchemaError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// Structured product version: `major.minor.micro` plus an optional qualifier.
///
/// Ordering is total: major, then minor, then micro, then the qualifier
/// compared lexically (an empty qualifier sorts first). The field order below
/// is what the derived `Ord` relies on.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Version {
    pub major: u32,
    pub minor: u32,
    pub micro: u32,
    pub qualifier: String,
}

impl Version {
    pub fn new(major: u32, minor: u32, micro: u32) -> Self {
        Self {
            major,
            minor,
            micro,
            qualifier: String::new(),
        }
    }

    #[must_use]
    pub fn with_qualifier(mut self, qualifier: &str) -> Self {
        qualifier.clone_into(&mut self.qualifier);
        self
    }

    /// Accepts `1`, `1.2`, `1.2.3`, `1.2.3.qualifier` and `1.2.3-qualifier`.
    pub fn parse(input: &str) -> Result<Self, SchemaError> {
        let invalid = || SchemaError::InvalidVersion(input.to_owned());
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Err(invalid());
        }

        let (numbers, dash_qualifier) = match trimmed.split_once('-') {
            Some((head, tail)) => (head, Some(tail)),
            None => (trimmed, None),
        };

        let mut parts = numbers.splitn(4, '.');
        let mut next_number = |required: bool| -> Result<u32, SchemaError> {
            match parts.next() {
                Some(p) => p.parse::<u32>().map_err(|_| invalid()),
                None if required => Err(invalid()),
                None => Ok(0),
            }
        };
        let major = next_number(true)?;
        let minor = next_number(false)?;
        let micro = next_number(false)?;
        let dot_qualifier = parts.next();

        let qualifier = match (dot_qualifier, dash_qualifier) {
            (Some(_), Some(_)) => return Err(invalid()),
            (Some(q), None) | (None, Some(q)) => q,
            (None, None) => "",
        };
        if !qualifier
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'_' | b'-' | b'.'))
        {
            return Err(invalid());
        }

        Ok(Self {
            major,
            minor,
            micro,
            qualifier: qualifier.to_owned(),
        })
    }
}

impl FromStr for Version {
    type Err = SchemaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.micro)?;
        if !self.qualifier.is_empty() {
            write!(f, ".{}", self.qualifier)?;
        }
        Ok(())
    }
}

impl Serialize for Version {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Version {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Self::parse(&raw).map_err(serde::de::Error::custom)
    }
}
