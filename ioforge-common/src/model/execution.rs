use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{ExecutionId, WorkerId, WorkloadConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Prechecks,
    Preparing,
    Running,
    Paused,
    Stopping,
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Pending => "pending",
            ExecutionStatus::Prechecks => "prechecks",
            ExecutionStatus::Preparing => "preparing",
            ExecutionStatus::Running => "running",
            ExecutionStatus::Paused => "paused",
            ExecutionStatus::Stopping => "stopping",
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(value: &str) -> Option<ExecutionStatus> {
        match value {
            "pending" => Some(ExecutionStatus::Pending),
            "prechecks" => Some(ExecutionStatus::Prechecks),
            "preparing" => Some(ExecutionStatus::Preparing),
            "running" => Some(ExecutionStatus::Running),
            "paused" => Some(ExecutionStatus::Paused),
            "stopping" => Some(ExecutionStatus::Stopping),
            "completed" => Some(ExecutionStatus::Completed),
            "failed" => Some(ExecutionStatus::Failed),
            "cancelled" => Some(ExecutionStatus::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Completed | ExecutionStatus::Failed | ExecutionStatus::Cancelled
        )
    }

    /// The status transition DAG. Pausing is the only way back to a previous
    /// status (`running <-> paused`).
    pub fn can_transition_to(&self, next: ExecutionStatus) -> bool {
        use ExecutionStatus::*;
        match self {
            Pending => matches!(next, Prechecks | Preparing | Stopping | Failed | Cancelled),
            Prechecks => matches!(next, Preparing | Stopping | Failed | Cancelled),
            Preparing => matches!(next, Running | Stopping | Failed | Cancelled),
            Running => matches!(next, Paused | Stopping | Completed | Failed | Cancelled),
            Paused => matches!(next, Running | Stopping | Failed | Cancelled),
            Stopping => matches!(next, Cancelled | Failed),
            Completed | Failed | Cancelled => false,
        }
    }
}

impl Display for ExecutionStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Reporting-only overlay on top of the status; phases only ever advance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionPhase {
    Init,
    Precheck,
    Prepare,
    RampUp,
    SteadyState,
    RampDown,
    Cleanup,
    Done,
}

impl ExecutionPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionPhase::Init => "init",
            ExecutionPhase::Precheck => "precheck",
            ExecutionPhase::Prepare => "prepare",
            ExecutionPhase::RampUp => "ramp_up",
            ExecutionPhase::SteadyState => "steady_state",
            ExecutionPhase::RampDown => "ramp_down",
            ExecutionPhase::Cleanup => "cleanup",
            ExecutionPhase::Done => "done",
        }
    }
}

impl Display for ExecutionPhase {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerRunState {
    Pending,
    Preparing,
    Running,
    Stopped,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerExecutionState {
    pub worker_id: WorkerId,
    pub state: WorkerRunState,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub stopped_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub error: Option<String>,
}

impl WorkerExecutionState {
    pub fn pending(worker_id: WorkerId) -> Self {
        WorkerExecutionState {
            worker_id,
            state: WorkerRunState::Pending,
            started_at: None,
            stopped_at: None,
            error: None,
        }
    }
}

/// In-memory execution record. The workload is snapshotted by value at
/// creation; later edits of the catalog entry do not affect in-flight runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Execution {
    pub id: ExecutionId,
    pub name: String,
    pub status: ExecutionStatus,
    pub phase: ExecutionPhase,
    pub workload: WorkloadConfig,
    pub cluster_name: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub workers: BTreeMap<WorkerId, WorkerExecutionState>,
    #[serde(default)]
    pub errors: Vec<String>,
    #[serde(default)]
    pub config_path: Option<String>,
    #[serde(default)]
    pub metrics_path: Option<String>,
}

impl Execution {
    pub fn new(id: ExecutionId, name: String, workload: WorkloadConfig) -> Self {
        Execution {
            id,
            name,
            status: ExecutionStatus::Pending,
            phase: ExecutionPhase::Init,
            cluster_name: workload.cluster_name.clone(),
            workload,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            workers: BTreeMap::new(),
            errors: Vec::new(),
            config_path: None,
            metrics_path: None,
        }
    }

    /// Advance the reporting phase; phases never move backwards.
    pub fn advance_phase(&mut self, phase: ExecutionPhase) {
        if phase > self.phase {
            self.phase = phase;
        }
    }
}

#[cfg(test)]
mod tests {
    use test_r::test;

    use super::*;

    #[test]
    fn terminal_statuses_do_not_transition() {
        for terminal in [
            ExecutionStatus::Completed,
            ExecutionStatus::Failed,
            ExecutionStatus::Cancelled,
        ] {
            assert!(!terminal.can_transition_to(ExecutionStatus::Running));
            assert!(!terminal.can_transition_to(ExecutionStatus::Pending));
        }
    }

    #[test]
    fn pause_is_the_only_cycle() {
        assert!(ExecutionStatus::Running.can_transition_to(ExecutionStatus::Paused));
        assert!(ExecutionStatus::Paused.can_transition_to(ExecutionStatus::Running));
        assert!(!ExecutionStatus::Running.can_transition_to(ExecutionStatus::Preparing));
        assert!(!ExecutionStatus::Preparing.can_transition_to(ExecutionStatus::Prechecks));
    }

    #[test]
    fn phases_never_reverse() {
        let workload = crate::model::workload::test_workload("phases");
        let mut execution = Execution::new(
            ExecutionId::generate(),
            "phases".to_string(),
            workload,
        );
        execution.advance_phase(ExecutionPhase::SteadyState);
        execution.advance_phase(ExecutionPhase::Precheck);
        assert_eq!(execution.phase, ExecutionPhase::SteadyState);
    }
}
