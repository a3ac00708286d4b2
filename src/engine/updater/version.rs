//! Firmware Version Ordering
//!
//! Versions are `major.minor` pairs compared lexicographically. Parsing never
//! fails: anything unreadable collapses to `0.0`, which is never newer than an
//! installed version.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::cmp::Ordering;
use std::fmt;

/// A `major.minor` firmware version
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct VersionId {
    pub major: u32,
    pub minor: u32,
}

impl VersionId {
    /// Sentinel returned for unparseable input
    pub const MIN: VersionId = VersionId { major: 0, minor: 0 };

    pub const fn new(major: u32, minor: u32) -> Self {
        Self { major, minor }
    }

    /// Parse `"<major>.<minor>"`, splitting on the first `.`
    pub fn parse(text: &str) -> Self {
        let Some((major, minor)) = text.trim().split_once('.') else {
            return Self::MIN;
        };

        match (major.parse::<u32>(), minor.parse::<u32>()) {
            (Ok(major), Ok(minor)) => Self { major, minor },
            _ => Self::MIN,
        }
    }

    /// Total order over versions
    pub fn compare(a: &VersionId, b: &VersionId) -> Ordering {
        a.cmp(b)
    }

    /// Check if this version is strictly newer than `other`
    pub fn is_newer_than(&self, other: &VersionId) -> bool {
        Self::compare(self, other) == Ordering::Greater
    }
}

impl fmt::Display for VersionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

impl From<&str> for VersionId {
    fn from(text: &str) -> Self {
        Self::parse(text)
    }
}

impl Serialize for VersionId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for VersionId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        Ok(Self::parse(&text))
    }
}
