//! Execution phase state machine.
//!
//! The ten UWS phases and the legality rules for every transition. A job
//! moves through these phases under the control of its list's execution
//! manager, its worker supervisor, and client requests; every transition
//! goes through [`crate::kernel::job::Job::set_phase`], which enforces
//! the table below unless `force` is set (backup restoration and explicit
//! administrative actions).

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::error::UwsError;

/// Position of a job in the lifecycle automaton.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum ExecutionPhase {
    #[default]
    Pending,
    Queued,
    Executing,
    Held,
    Suspended,
    Completed,
    Aborted,
    Error,
    Archived,
    Unknown,
}

impl ExecutionPhase {
    pub const ALL: [ExecutionPhase; 10] = [
        ExecutionPhase::Pending,
        ExecutionPhase::Queued,
        ExecutionPhase::Executing,
        ExecutionPhase::Held,
        ExecutionPhase::Suspended,
        ExecutionPhase::Completed,
        ExecutionPhase::Aborted,
        ExecutionPhase::Error,
        ExecutionPhase::Archived,
        ExecutionPhase::Unknown,
    ];

    /// Whether a `force=false` transition from `self` to `target` is legal.
    pub fn can_transition_to(self, target: ExecutionPhase) -> bool {
        use ExecutionPhase::*;
        match target {
            Pending => matches!(self, Pending | Unknown),
            Queued => matches!(self, Pending | Held | Queued | Unknown),
            Executing => matches!(self, Queued | Held | Suspended | Executing | Unknown),
            Held => matches!(self, Pending | Executing | Held | Unknown),
            Suspended => matches!(self, Executing | Suspended | Unknown),
            Completed => matches!(self, Executing | Completed | Unknown),
            Aborted => !matches!(self, Completed | Error | Archived),
            Error => !matches!(self, Completed | Aborted | Archived),
            Archived => matches!(self, Completed | Aborted | Error | Archived | Unknown),
            Unknown => true,
        }
    }

    /// A job may be mutated by clients only while PENDING.
    pub fn is_updatable(self) -> bool {
        self == ExecutionPhase::Pending
    }

    /// Terminal set: no transition out except into ARCHIVED.
    pub fn is_final(self) -> bool {
        matches!(
            self,
            ExecutionPhase::Completed
                | ExecutionPhase::Aborted
                | ExecutionPhase::Error
                | ExecutionPhase::Archived
        )
    }

    pub fn is_executing(self) -> bool {
        self == ExecutionPhase::Executing
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ExecutionPhase::Pending => "PENDING",
            ExecutionPhase::Queued => "QUEUED",
            ExecutionPhase::Executing => "EXECUTING",
            ExecutionPhase::Held => "HELD",
            ExecutionPhase::Suspended => "SUSPENDED",
            ExecutionPhase::Completed => "COMPLETED",
            ExecutionPhase::Aborted => "ABORTED",
            ExecutionPhase::Error => "ERROR",
            ExecutionPhase::Archived => "ARCHIVED",
            ExecutionPhase::Unknown => "UNKNOWN",
        }
    }
}

impl fmt::Display for ExecutionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExecutionPhase {
    type Err = UwsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ExecutionPhase::ALL
            .into_iter()
            .find(|phase| s.eq_ignore_ascii_case(phase.as_str()))
            .ok_or_else(|| UwsError::BadRequest(format!("unknown execution phase '{}'", s)))
    }
}
