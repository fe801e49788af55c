use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};

use super::{ExecutionId, WorkerId, WorkerStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckSeverity {
    Info,
    Warning,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckResult {
    pub name: String,
    pub passed: bool,
    pub severity: CheckSeverity,
    pub message: String,
    #[serde(default)]
    pub details: serde_json::Value,
    #[serde(default)]
    pub raw_output: Option<String>,
}

impl CheckResult {
    pub fn new(
        name: impl Into<String>,
        passed: bool,
        severity: CheckSeverity,
        message: impl Into<String>,
    ) -> Self {
        CheckResult {
            name: name.into(),
            passed,
            severity,
            message: message.into(),
            details: serde_json::Value::Null,
            raw_output: None,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = details;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrecheckVerdict {
    Passed,
    PassedWithWarnings,
    Failed,
}

impl PrecheckVerdict {
    pub fn as_str(&self) -> &'static str {
        match self {
            PrecheckVerdict::Passed => "passed",
            PrecheckVerdict::PassedWithWarnings => "passed_with_warnings",
            PrecheckVerdict::Failed => "failed",
        }
    }
}

impl Display for PrecheckVerdict {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Result of one operator-supplied precheck command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandCheckResult {
    pub command: String,
    pub description: String,
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub success: bool,
    pub duration_ms: f64,
    pub blocking: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MountPointCheck {
    pub path: String,
    pub accessible: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerHealthReport {
    pub worker_id: WorkerId,
    pub hostname: String,
    pub status: WorkerStatus,
    #[serde(default)]
    pub ssh_reachable: bool,
    #[serde(default)]
    pub ssh_latency_ms: Option<f64>,
    #[serde(default)]
    pub agent_running: bool,
    #[serde(default)]
    pub agent_version: Option<String>,
    #[serde(default)]
    pub agent_pid: Option<u32>,
    #[serde(default)]
    pub uptime_seconds: Option<u64>,
    #[serde(default)]
    pub load_average: Option<(f64, f64, f64)>,
    #[serde(default)]
    pub memory_total_gb: Option<f64>,
    #[serde(default)]
    pub memory_available_gb: Option<f64>,
    #[serde(default)]
    pub disk_free_gb: Option<f64>,
    #[serde(default)]
    pub tools: BTreeMap<String, bool>,
    #[serde(default)]
    pub mount_points: Vec<MountPointCheck>,
    #[serde(default)]
    pub storage_latency_ms: Option<f64>,
    #[serde(default)]
    pub errors: Vec<String>,
    #[serde(default)]
    pub warnings: Vec<String>,
}

impl WorkerHealthReport {
    pub fn unknown(worker_id: WorkerId, hostname: String) -> Self {
        WorkerHealthReport {
            worker_id,
            hostname,
            status: WorkerStatus::Unknown,
            ssh_reachable: false,
            ssh_latency_ms: None,
            agent_running: false,
            agent_version: None,
            agent_pid: None,
            uptime_seconds: None,
            load_average: None,
            memory_total_gb: None,
            memory_available_gb: None,
            disk_free_gb: None,
            tools: BTreeMap::new(),
            mount_points: Vec::new(),
            storage_latency_ms: None,
            errors: Vec::new(),
            warnings: Vec::new(),
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.ssh_reachable && self.agent_running && self.errors.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrecheckReport {
    pub execution_id: ExecutionId,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub duration_seconds: f64,
    pub verdict: PrecheckVerdict,
    pub can_proceed: bool,
    #[serde(default)]
    pub cluster_health: Option<String>,
    #[serde(default)]
    pub cluster_checks: Vec<CheckResult>,
    pub workers_total: usize,
    pub workers_online: usize,
    pub workers_offline: usize,
    #[serde(default)]
    pub worker_reports: Vec<WorkerHealthReport>,
    #[serde(default)]
    pub excluded_workers: Vec<WorkerId>,
    #[serde(default)]
    pub command_results: Vec<CommandCheckResult>,
    #[serde(default)]
    pub warnings: Vec<String>,
    #[serde(default)]
    pub blocking_issues: Vec<String>,
    pub proceed_message: String,
}

#[cfg(test)]
mod tests {
    use test_r::test;

    use super::*;

    #[test]
    fn severity_orders_info_to_critical() {
        assert!(CheckSeverity::Info < CheckSeverity::Warning);
        assert!(CheckSeverity::Warning < CheckSeverity::Critical);
    }

    #[test]
    fn health_requires_ssh_agent_and_no_errors() {
        let mut report = WorkerHealthReport::unknown(WorkerId::new("w1"), "w1.lab".to_string());
        assert!(!report.is_healthy());
        report.ssh_reachable = true;
        report.agent_running = true;
        assert!(report.is_healthy());
        report.errors.push("mount point gone".to_string());
        assert!(!report.is_healthy());
    }
}
