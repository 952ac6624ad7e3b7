use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ModelError;

/// Lifecycle state of a file-queue row.
///
/// `Pending` rows are claimable; `InProgress` rows are owned by exactly one
/// worker; the remaining states are terminal until an operator acts on them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileStatus {
    Pending,
    InProgress,
    Completed,
    Error,
    Conflict,
}

impl FileStatus {
    pub const ALL: [FileStatus; 5] = [
        FileStatus::Pending,
        FileStatus::InProgress,
        FileStatus::Completed,
        FileStatus::Error,
        FileStatus::Conflict,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            FileStatus::Pending => "pending",
            FileStatus::InProgress => "in_progress",
            FileStatus::Completed => "completed",
            FileStatus::Error => "error",
            FileStatus::Conflict => "conflict",
        }
    }

    /// Terminal states are left only by explicit operator action.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            FileStatus::Completed | FileStatus::Error | FileStatus::Conflict
        )
    }
}

impl FromStr for FileStatus {
    type Err = ModelError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw {
            "pending" => Ok(FileStatus::Pending),
            "in_progress" => Ok(FileStatus::InProgress),
            "completed" => Ok(FileStatus::Completed),
            "error" => Ok(FileStatus::Error),
            "conflict" => Ok(FileStatus::Conflict),
            other => Err(ModelError::UnknownStatus(other.to_string())),
        }
    }
}

impl std::fmt::Display for FileStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Operational state of a bucket's scheduler, persisted in the bucket row so
/// it survives restarts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BucketStatus {
    Stopped,
    Running,
    Paused,
}

impl BucketStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BucketStatus::Stopped => "stopped",
            BucketStatus::Running => "running",
            BucketStatus::Paused => "paused",
        }
    }
}

impl FromStr for BucketStatus {
    type Err = ModelError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw {
            "stopped" => Ok(BucketStatus::Stopped),
            "running" => Ok(BucketStatus::Running),
            "paused" => Ok(BucketStatus::Paused),
            other => Err(ModelError::UnknownStatus(other.to_string())),
        }
    }
}

impl std::fmt::Display for BucketStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
