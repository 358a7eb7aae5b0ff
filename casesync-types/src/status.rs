//! Save status shown to the user.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Persistence status of one entity, or of a whole screen when aggregated.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SaveStatus {
    /// Nothing to report.
    #[default]
    Idle,
    /// At least one write is queued or in flight.
    Saving,
    /// The last write was acknowledged.
    Saved,
    /// A write failed and needs attention.
    Error,
    /// Connectivity is lost; writes are held back.
    Offline,
}

impl SaveStatus {
    /// All statuses, in declaration order.
    pub const ALL: [SaveStatus; 5] = [
        SaveStatus::Idle,
        SaveStatus::Saving,
        SaveStatus::Saved,
        SaveStatus::Error,
        SaveStatus::Offline,
    ];

    /// Lowercase name, as used on the wire.
    pub const fn as_str(&self) -> &'static str {
        match self {
            SaveStatus::Idle => "idle",
            SaveStatus::Saving => "saving",
            SaveStatus::Saved => "saved",
            SaveStatus::Error => "error",
            SaveStatus::Offline => "offline",
        }
    }

    /// Whether this status reports the outcome of a write (`saved`/`error`).
    pub const fn is_terminal(&self) -> bool {
        matches!(self, SaveStatus::Saved | SaveStatus::Error)
    }
}

impl fmt::Display for SaveStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SaveStatus {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SaveStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| crate::Error::UnknownStatus(s.to_string()))
    }
}
