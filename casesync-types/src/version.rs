//! Server-issued version tokens.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Opaque, totally ordered version of an entity as seen by the server.
///
/// Returned by the persistence backend on every successful write and carried
/// by every change-feed push. Only used to tell newer state from older state;
/// it carries no business meaning.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Version(u64);

impl Version {
    /// The version of an entity nobody has written yet.
    pub const ZERO: Version = Version(0);

    /// Creates a version from its raw counter (or millisecond timestamp).
    #[must_use]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Returns the raw counter.
    #[must_use]
    pub const fn get(&self) -> u64 {
        self.0
    }

    /// Returns the version that follows this one.
    #[must_use]
    pub const fn next(&self) -> Self {
        Self(self.0.saturating_add(1))
    }

    /// Returns true if this version is strictly newer than `other`.
    #[must_use]
    pub fn is_newer_than(&self, other: &Self) -> bool {
        self > other
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

impl FromStr for Version {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let digits = s.strip_prefix('v').unwrap_or(s);
        digits
            .parse::<u64>()
            .map(Self)
            .map_err(|e| crate::Error::InvalidVersion(format!("{s}: {e}")))
    }
}

impl From<u64> for Version {
    fn from(raw: u64) -> Self {
        Self(raw)
    }
}
