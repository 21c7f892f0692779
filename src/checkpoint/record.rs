//! Checkpoint keys, stages and statuses.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use super::CheckpointError;

/// Pipeline stage a checkpoint belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Archive transfer into the staging area.
    Download,
    /// Integrity check of a staged archive.
    Validate,
    /// Decompression into the working directory.
    Extract,
    /// Rows of one extracted file inserted into its table.
    LoadEntry,
    /// A whole destination table loaded and indexed.
    Load,
}

impl Stage {
    /// All stages in pipeline order.
    pub const ALL: [Stage; 5] = [
        Stage::Download,
        Stage::Validate,
        Stage::Extract,
        Stage::LoadEntry,
        Stage::Load,
    ];

    /// Returns the database string representation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Download => "download",
            Self::Validate => "validate",
            Self::Extract => "extract",
            Self::LoadEntry => "load_entry",
            Self::Load => "load",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = CheckpointError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "download" => Ok(Self::Download),
            "validate" => Ok(Self::Validate),
            "extract" => Ok(Self::Extract),
            "load_entry" => Ok(Self::LoadEntry),
            "load" => Ok(Self::Load),
            _ => Err(CheckpointError::invalid_stage(s)),
        }
    }
}

/// Progress of one key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointStatus {
    Pending,
    InProgress,
    Done,
    Failed,
}

impl CheckpointStatus {
    /// Returns the database string representation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for CheckpointStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CheckpointStatus {
    type Err = CheckpointError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "in_progress" => Ok(Self::InProgress),
            "done" => Ok(Self::Done),
            "failed" => Ok(Self::Failed),
            _ => Err(CheckpointError::invalid_status(s)),
        }
    }
}

/// Identity of a checkpoint: `(period, stage, logical_name)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CheckpointKey {
    pub period: String,
    pub stage: Stage,
    pub logical_name: String,
}

impl CheckpointKey {
    #[must_use]
    pub fn new(period: impl Into<String>, stage: Stage, logical_name: impl Into<String>) -> Self {
        Self {
            period: period.into(),
            stage,
            logical_name: logical_name.into(),
        }
    }
}

impl fmt::Display for CheckpointKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.period, self.stage, self.logical_name)
    }
}

/// Raw row as stored.
#[derive(Debug, Clone, FromRow)]
pub(super) struct CheckpointRow {
    pub period: String,
    pub stage: String,
    pub logical_name: String,
    pub status: String,
    pub detail: Option<String>,
    pub updated_at: String,
}

/// A persisted checkpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointRecord {
    pub key: CheckpointKey,
    pub status: CheckpointStatus,
    /// Failure reason, or stage output such as the extracted entry list.
    pub detail: Option<String>,
    /// SQLite `datetime('now')` of the last write (UTC).
    pub updated_at: String,
}

impl TryFrom<CheckpointRow> for CheckpointRecord {
    type Error = CheckpointError;

    fn try_from(row: CheckpointRow) -> Result<Self, Self::Error> {
        Ok(Self {
            key: CheckpointKey::new(row.period, row.stage.parse()?, row.logical_name),
            status: row.status.parse()?,
            detail: row.detail,
            updated_at: row.updated_at,
        })
    }
}
