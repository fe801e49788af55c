use std::sync::Arc;

use chrono::Utc;
use ioforge_common::model::{
    CheckSeverity, ClusterConfig, ExecutionId, PrecheckPolicy, PrecheckReport, PrecheckVerdict,
    StorageBackend, Worker, WorkerStatus,
};
use tracing::info;

use crate::remote::RemoteCommand;

pub mod ceph;
pub mod command;
pub mod workers;

pub use ceph::{CephClusterState, CephHealthChecker};
pub use command::CustomCommandRunner;
pub use workers::WorkerHealthChecker;

#[derive(Debug, thiserror::Error)]
pub enum PrecheckError {
    #[error("cluster command failed: {0}")]
    CommandFailed(String),
    #[error("failed to parse cluster output: {0}")]
    Parse(String),
}

/// Runs cluster-health, custom-command and per-worker probes and produces a
/// pass/warn/block verdict with an exclusion list.
pub struct PrecheckRunner {
    remote: Arc<dyn RemoteCommand>,
    cluster: ClusterConfig,
    workers: Vec<Worker>,
    policy: PrecheckPolicy,
}

impl PrecheckRunner {
    pub fn new(
        remote: Arc<dyn RemoteCommand>,
        cluster: ClusterConfig,
        workers: Vec<Worker>,
        policy: PrecheckPolicy,
    ) -> Self {
        PrecheckRunner {
            remote,
            cluster,
            workers,
            policy,
        }
    }

    pub async fn run(&self, execution_id: &ExecutionId) -> PrecheckReport {
        let started_at = Utc::now();
        let mut blocking_issues = Vec::new();
        let mut warnings = Vec::new();
        let mut cluster_checks = Vec::new();
        let mut cluster_health = None;
        let mut command_results = Vec::new();
        let mut worker_reports = Vec::new();
        let mut excluded_workers = Vec::new();

        // Phase 1: cluster health.
        if self.policy.cluster_health && self.cluster.backend.is_ceph() {
            info!("phase 1: checking cluster health");
            if let Some(ceph) = self.cluster.ceph.clone() {
                let checker = CephHealthChecker::new(
                    self.remote.clone(),
                    ceph,
                    self.cluster.admin_node.clone(),
                );
                match checker.get_cluster_state().await {
                    Ok(state) => {
                        cluster_health = Some(state.health_status.clone());
                        cluster_checks = checker.run_all_checks(&state);
                    }
                    Err(e) => {
                        blocking_issues.push(format!("[Cluster] Connection failed: {e}"));
                    }
                }
                for check in &cluster_checks {
                    if !check.passed {
                        blocking_issues.push(format!("[Cluster] {}: {}", check.name, check.message));
                    } else if check.severity == CheckSeverity::Warning {
                        warnings.push(format!("[Cluster] {}: {}", check.name, check.message));
                    }
                }
            }
        }

        // Phase 2: operator-supplied commands; the first failed blocking
        // command aborts the rest of the list.
        if !self.policy.custom_commands.is_empty() {
            info!("phase 2: running custom commands");
            let ceph_conf = self
                .cluster
                .ceph
                .as_ref()
                .map(|c| c.conf_path.clone())
                .unwrap_or_else(|| "/etc/ceph/ceph.conf".to_string());
            let runner = CustomCommandRunner::new(ceph_conf);
            command_results = runner.run_all(&self.policy.custom_commands).await;
            for result in &command_results {
                if !result.success && result.blocking {
                    blocking_issues.push(format!(
                        "[Command] {}: {}",
                        result.command,
                        if result.stderr.trim().is_empty() {
                            &result.stdout
                        } else {
                            &result.stderr
                        }
                    ));
                }
            }
        }

        // Phase 3: worker health, in parallel over all workers.
        let workers_total = self.workers.len();
        let mut workers_online = 0;
        if self.policy.worker_health && !self.workers.is_empty() {
            info!("phase 3: checking worker health");
            let storage_endpoint = self.storage_endpoint();
            let checker = WorkerHealthChecker::new(self.remote.clone())
                .with_storage_endpoint(storage_endpoint);
            worker_reports = checker.check_all(&self.workers).await;

            for report in &worker_reports {
                if report.status == WorkerStatus::Online {
                    workers_online += 1;
                } else {
                    excluded_workers.push(report.worker_id.clone());
                    if report.status == WorkerStatus::Unreachable {
                        warnings.push(format!(
                            "[Worker] {}: unreachable - {}",
                            report.hostname,
                            report.errors.join(", ")
                        ));
                    } else {
                        warnings.push(format!(
                            "[Worker] {}: {}",
                            report.hostname, report.status
                        ));
                    }
                }
            }

            if workers_online < self.policy.min_healthy_workers {
                blocking_issues.push(format!(
                    "[Worker] only {workers_online} healthy worker(s), {} required",
                    self.policy.min_healthy_workers
                ));
            }
        }

        let completed_at = Utc::now();
        let (verdict, can_proceed, proceed_message) = verdict(&blocking_issues, &warnings);
        info!("prechecks completed: {verdict}");

        PrecheckReport {
            execution_id: execution_id.clone(),
            started_at,
            completed_at,
            duration_seconds: (completed_at - started_at).num_milliseconds() as f64 / 1000.0,
            verdict,
            can_proceed,
            cluster_health,
            cluster_checks,
            workers_total,
            workers_online,
            workers_offline: workers_total - workers_online,
            worker_reports,
            excluded_workers,
            command_results,
            warnings,
            blocking_issues,
            proceed_message,
        }
    }

    fn storage_endpoint(&self) -> Option<String> {
        match self.cluster.backend {
            StorageBackend::CephRbd | StorageBackend::Cephfs => self
                .cluster
                .ceph
                .as_ref()
                .and_then(|c| c.monitors.first())
                .map(|mon| mon.split(':').next().unwrap_or(mon).to_string()),
            StorageBackend::Nfs | StorageBackend::Glusterfs => {
                self.cluster.nfs.as_ref().map(|n| n.server.clone())
            }
            StorageBackend::S3 => None,
        }
    }
}

/// `failed` if any blocker exists, else `passed_with_warnings` if any warning
/// exists, else `passed`.
fn verdict(
    blocking_issues: &[String],
    warnings: &[String],
) -> (PrecheckVerdict, bool, String) {
    if !blocking_issues.is_empty() {
        (
            PrecheckVerdict::Failed,
            false,
            format!("Cannot proceed: {} critical issue(s)", blocking_issues.len()),
        )
    } else if !warnings.is_empty() {
        (
            PrecheckVerdict::PassedWithWarnings,
            true,
            format!("Can proceed with {} warning(s)", warnings.len()),
        )
    } else {
        (
            PrecheckVerdict::Passed,
            true,
            "All checks passed. Ready to proceed.".to_string(),
        )
    }
}

#[cfg(test)]
mod tests {
    use test_r::test;

    use super::*;

    #[test]
    fn verdict_mapping_follows_the_ladder() {
        let (v, proceed, _) = verdict(&[], &[]);
        assert_eq!(v, PrecheckVerdict::Passed);
        assert!(proceed);

        let (v, proceed, _) = verdict(&[], &["slow disk".to_string()]);
        assert_eq!(v, PrecheckVerdict::PassedWithWarnings);
        assert!(proceed);

        let (v, proceed, message) =
            verdict(&["cluster down".to_string()], &["slow disk".to_string()]);
        assert_eq!(v, PrecheckVerdict::Failed);
        assert!(!proceed);
        assert!(message.contains("1 critical issue"));
    }
}
