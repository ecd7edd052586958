use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{ProcessingError, Result};

/// One (source, location, sensor) download target
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkUnit {
    pub source: String,
    pub location_id: u64,
    pub sensor_id: u64,
    pub parameter: String,
}

impl WorkUnit {
    pub fn new(source: &str, location_id: u64, sensor_id: u64, parameter: &str) -> Self {
        Self {
            source: source.to_string(),
            location_id,
            sensor_id,
            parameter: parameter.to_string(),
        }
    }
}

impl fmt::Display for WorkUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/location {}/sensor {} ({})",
            self.source, self.location_id, self.sensor_id, self.parameter
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TruncationReason {
    /// Page index passed the configured ceiling
    PageCeiling,
    /// A single page request outlived the page timeout
    PageTimeout,
}

impl fmt::Display for TruncationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TruncationReason::PageCeiling => write!(f, "page ceiling reached"),
            TruncationReason::PageTimeout => write!(f, "page request timed out"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum UnitState {
    Pending,
    InProgress,
    Complete,
    Truncated { reason: TruncationReason },
    Failed { error: String },
}

impl UnitState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            UnitState::Complete | UnitState::Truncated { .. } | UnitState::Failed { .. }
        )
    }

    /// Complete and truncated units both count as done for checkpointing
    pub fn is_done(&self) -> bool {
        matches!(self, UnitState::Complete | UnitState::Truncated { .. })
    }

    pub fn label(&self) -> &'static str {
        match self {
            UnitState::Pending => "pending",
            UnitState::InProgress => "in_progress",
            UnitState::Complete => "complete",
            UnitState::Truncated { .. } => "truncated",
            UnitState::Failed { .. } => "failed",
        }
    }

    /// pending -> in_progress -> {complete | truncated | failed}
    pub fn transition(&mut self, next: UnitState) -> Result<()> {
        let allowed = match (&*self, &next) {
            (UnitState::Pending, UnitState::InProgress) => true,
            (UnitState::InProgress, n) => n.is_terminal(),
            _ => false,
        };

        if !allowed {
            return Err(ProcessingError::InvalidTransition {
                from: self.label(),
                to: next.label(),
            });
        }

        *self = next;
        Ok(())
    }
}

/// Final report for one work unit
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnitOutcome {
    pub unit: WorkUnit,
    pub state: UnitState,
    pub pages_fetched: u32,
    pub measurements_written: u64,
}
