//! Lifecycle status values

use serde::{Deserialize, Serialize};
use std::fmt::{self, Display, Formatter};

/// Status of an acquisition task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Planned, not yet running
    #[default]
    Created,
    /// Running on an instrument
    Started,
    /// Finished successfully (terminal)
    Completed,
    /// Finished with an error (terminal)
    Failed,
}

impl TaskStatus {
    /// Terminal states admit no further transitions
    #[inline]
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Stable lowercase name
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Started => "started",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl Display for TaskStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome label of an acquisition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum AcquisitionStatus {
    /// Imaging in progress (or not yet finished)
    #[default]
    #[serde(rename = "imaging")]
    Imaging,
    /// Imaged, awaiting QC
    #[serde(rename = "acquired")]
    Acquired,
    /// Stopped before completion
    #[serde(rename = "aborted")]
    Aborted,
    /// Failed quality control
    #[serde(rename = "failed")]
    QcFailed,
    /// Passed quality control
    #[serde(rename = "qc-passed")]
    QcPassed,
    /// Flagged for re-imaging
    #[serde(rename = "to-be-reimaged")]
    ToBeReimaged,
}

impl AcquisitionStatus {
    /// Stable name as serialized
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Imaging => "imaging",
            Self::Acquired => "acquired",
            Self::Aborted => "aborted",
            Self::QcFailed => "failed",
            Self::QcPassed => "qc-passed",
            Self::ToBeReimaged => "to-be-reimaged",
        }
    }
}

impl Display for AcquisitionStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Phase of an acquisition, derived from its timestamps
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AcquisitionPhase {
    /// No `start_time`
    Planned,
    /// `start_time` set, no `end_time`
    Imaging,
    /// `end_time` set (terminal)
    Finished,
}

impl Display for AcquisitionPhase {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Planned => "planned",
            Self::Imaging => "imaging",
            Self::Finished => "finished",
        };
        f.write_str(s)
    }
}
