use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Lifecycle status of an execution lock.
///
/// A lock with no status at all is "unset": its run was created but never
/// started, and batch cleanup removes it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LockStatus {
    Success,
    Failed,
    Paused,
    /// Claimed by a replay job, or a replayed run still re-checking the gate
    /// it was paused at
    Resumed,
}

impl LockStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Paused => "paused",
            Self::Resumed => "resumed",
        }
    }

    /// Whether the run behind the lock has finished for good
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Failed)
    }
}

impl fmt::Display for LockStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LockStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "success" => Ok(Self::Success),
            "failed" => Ok(Self::Failed),
            "paused" => Ok(Self::Paused),
            "resumed" => Ok(Self::Resumed),
            other => Err(format!("unknown lock status '{other}'")),
        }
    }
}
