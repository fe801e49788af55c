use std::sync::Arc;
use std::time::Duration;

use ioforge_common::model::{AdminNode, CephConnection, CheckResult, CheckSeverity};
use serde_json::{json, Value};
use tracing::error;

use super::{command, PrecheckError};
use crate::remote::{RemoteCommand, SshTarget};

const CEPH_COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

pub const HEALTH_OK: &str = "HEALTH_OK";
pub const HEALTH_WARN: &str = "HEALTH_WARN";
pub const HEALTH_ERR: &str = "HEALTH_ERR";

#[derive(Debug, Clone, Default)]
pub struct CephClusterState {
    pub health_status: String,
    pub health_checks: Value,

    pub mon_count: usize,
    pub mon_quorum: Vec<String>,
    pub mon_in_quorum: usize,

    pub osd_count: u64,
    pub osd_up: u64,
    pub osd_in: u64,
    pub osd_down: Vec<i64>,

    pub pg_count: u64,
    pub pg_degraded: u64,
    pub pg_recovering: u64,
    pub pg_stuck: u64,

    pub total_bytes: u64,
    pub used_bytes: u64,
    pub available_bytes: u64,
    pub used_percent: f64,

    pub mgr_active: String,
    pub mgr_standbys: Vec<String>,
}

/// Issues `ceph` CLI queries against the cluster's admin node and maps the
/// results onto the precheck severity ladder.
pub struct CephHealthChecker {
    remote: Arc<dyn RemoteCommand>,
    connection: CephConnection,
    admin_node: Option<AdminNode>,
}

impl CephHealthChecker {
    pub fn new(
        remote: Arc<dyn RemoteCommand>,
        connection: CephConnection,
        admin_node: Option<AdminNode>,
    ) -> Self {
        CephHealthChecker {
            remote,
            connection,
            admin_node,
        }
    }

    async fn run_ceph_command(&self, args: &str) -> Result<Value, PrecheckError> {
        let command = format!(
            "ceph --conf {} --keyring {} --name client.{} -f json {args}",
            self.connection.conf_path, self.connection.keyring_path, self.connection.user
        );
        let output = match &self.admin_node {
            Some(admin) => {
                self.remote
                    .run(
                        &SshTarget::from_admin_node(admin),
                        &command,
                        CEPH_COMMAND_TIMEOUT,
                    )
                    .await
            }
            None => command::run_local(&command, CEPH_COMMAND_TIMEOUT).await,
        };
        if !output.success() {
            return Err(PrecheckError::CommandFailed(format!(
                "ceph {args}: {}",
                output.describe_failure()
            )));
        }
        serde_json::from_str(&output.stdout)
            .map_err(|e| PrecheckError::Parse(format!("ceph {args}: {e}")))
    }

    pub async fn get_cluster_state(&self) -> Result<CephClusterState, PrecheckError> {
        let mut state = CephClusterState::default();
        let status = self.run_ceph_command("status").await?;

        let health = &status["health"];
        state.health_status = health["status"].as_str().unwrap_or("UNKNOWN").to_string();
        state.health_checks = health["checks"].clone();

        state.mon_count = status["monmap"]["mons"].as_array().map_or(0, Vec::len);
        state.mon_quorum = status["quorum_names"]
            .as_array()
            .map(|names| {
                names
                    .iter()
                    .filter_map(|n| n.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default();
        state.mon_in_quorum = status["quorum"].as_array().map_or(0, Vec::len);

        let osdmap = &status["osdmap"];
        state.osd_count = osdmap["num_osds"].as_u64().unwrap_or(0);
        state.osd_up = osdmap["num_up_osds"].as_u64().unwrap_or(0);
        state.osd_in = osdmap["num_in_osds"].as_u64().unwrap_or(0);

        if let Ok(tree) = self.run_ceph_command("osd tree").await {
            if let Some(nodes) = tree["nodes"].as_array() {
                for node in nodes {
                    if node["type"] == "osd" && node["status"] != "up" {
                        if let Some(id) = node["id"].as_i64() {
                            state.osd_down.push(id);
                        }
                    }
                }
            }
        }

        let pgmap = &status["pgmap"];
        state.pg_count = pgmap["num_pgs"].as_u64().unwrap_or(0);
        if let Some(by_state) = pgmap["pgs_by_state"].as_array() {
            for entry in by_state {
                let count = entry["count"].as_u64().unwrap_or(0);
                for name in entry["state_name"].as_str().unwrap_or("").split('+') {
                    match name {
                        "degraded" => state.pg_degraded += count,
                        "recovering" | "recovery_wait" => state.pg_recovering += count,
                        "stuck" => state.pg_stuck += count,
                        _ => {}
                    }
                }
            }
        }

        // mgrmap moved between Ceph releases.
        let mgrmap = if status["mgrmap"].is_object() {
            &status["mgrmap"]
        } else {
            &status["mgr_map"]
        };
        state.mgr_active = mgrmap["active_name"]
            .as_str()
            .or_else(|| mgrmap["active"]["name"].as_str())
            .unwrap_or("")
            .to_string();
        if let Some(standbys) = mgrmap["standbys"].as_array() {
            state.mgr_standbys = standbys
                .iter()
                .filter_map(|s| s["name"].as_str().map(str::to_string))
                .collect();
        }

        if let Ok(df) = self.run_ceph_command("df").await {
            let stats = &df["stats"];
            state.total_bytes = stats["total_bytes"].as_u64().unwrap_or(0);
            state.used_bytes = stats["total_used_bytes"].as_u64().unwrap_or(0);
            state.available_bytes = stats["total_avail_bytes"].as_u64().unwrap_or(0);
            if state.total_bytes > 0 {
                state.used_percent =
                    state.used_bytes as f64 / state.total_bytes as f64 * 100.0;
            }
        } else {
            error!("failed to collect ceph df output");
        }

        Ok(state)
    }

    pub fn run_all_checks(&self, state: &CephClusterState) -> Vec<CheckResult> {
        vec![
            check_overall_health(state),
            check_osd_status(state),
            check_mon_quorum(state),
            check_pg_status(state),
            check_capacity(state),
            check_mgr_status(state),
        ]
    }
}

fn check_overall_health(state: &CephClusterState) -> CheckResult {
    match state.health_status.as_str() {
        HEALTH_OK => CheckResult::new(
            "cluster_health",
            true,
            CheckSeverity::Info,
            "Cluster health is OK",
        )
        .with_details(json!({ "status": state.health_status })),
        HEALTH_WARN => CheckResult::new(
            "cluster_health",
            true,
            CheckSeverity::Warning,
            "Cluster health is WARN",
        )
        .with_details(json!({ "status": state.health_status, "checks": state.health_checks })),
        other => CheckResult::new(
            "cluster_health",
            false,
            CheckSeverity::Critical,
            format!("Cluster health is {other}"),
        )
        .with_details(json!({ "status": other, "checks": state.health_checks })),
    }
}

fn check_osd_status(state: &CephClusterState) -> CheckResult {
    let down = state.osd_down.len();
    if down == 0 {
        CheckResult::new(
            "osd_status",
            true,
            CheckSeverity::Info,
            format!("All {} OSDs are up and in", state.osd_count),
        )
        .with_details(json!({ "total": state.osd_count, "up": state.osd_up, "in": state.osd_in }))
    } else if down <= 2 {
        CheckResult::new(
            "osd_status",
            true,
            CheckSeverity::Warning,
            format!("{down} OSD(s) down: {:?}", state.osd_down),
        )
        .with_details(json!({ "total": state.osd_count, "down": state.osd_down }))
    } else {
        CheckResult::new(
            "osd_status",
            false,
            CheckSeverity::Critical,
            format!("Too many OSDs down: {down}"),
        )
        .with_details(json!({ "total": state.osd_count, "down": state.osd_down }))
    }
}

fn check_mon_quorum(state: &CephClusterState) -> CheckResult {
    if state.mon_in_quorum == state.mon_count {
        CheckResult::new(
            "mon_quorum",
            true,
            CheckSeverity::Info,
            format!("All {} monitors in quorum", state.mon_count),
        )
        .with_details(json!({ "quorum": state.mon_quorum }))
    } else if state.mon_in_quorum >= state.mon_count / 2 + 1 {
        CheckResult::new(
            "mon_quorum",
            true,
            CheckSeverity::Warning,
            format!(
                "Monitor quorum maintained ({}/{})",
                state.mon_in_quorum, state.mon_count
            ),
        )
        .with_details(json!({ "quorum": state.mon_quorum }))
    } else {
        CheckResult::new(
            "mon_quorum",
            false,
            CheckSeverity::Critical,
            format!(
                "Monitor quorum lost ({}/{})",
                state.mon_in_quorum, state.mon_count
            ),
        )
        .with_details(json!({ "quorum": state.mon_quorum }))
    }
}

fn check_pg_status(state: &CephClusterState) -> CheckResult {
    if state.pg_degraded == 0 && state.pg_recovering == 0 && state.pg_stuck == 0 {
        CheckResult::new(
            "pg_status",
            true,
            CheckSeverity::Info,
            format!("All {} PGs are active+clean", state.pg_count),
        )
        .with_details(json!({ "total_pgs": state.pg_count }))
    } else if state.pg_stuck > 0 {
        CheckResult::new(
            "pg_status",
            false,
            CheckSeverity::Critical,
            format!("{} PGs are stuck", state.pg_stuck),
        )
        .with_details(json!({
            "total": state.pg_count,
            "degraded": state.pg_degraded,
            "recovering": state.pg_recovering,
            "stuck": state.pg_stuck
        }))
    } else {
        CheckResult::new(
            "pg_status",
            true,
            CheckSeverity::Warning,
            format!("PGs not fully clean: {} degraded", state.pg_degraded),
        )
        .with_details(json!({
            "total": state.pg_count,
            "degraded": state.pg_degraded,
            "recovering": state.pg_recovering
        }))
    }
}

fn check_capacity(state: &CephClusterState) -> CheckResult {
    if state.used_percent < 70.0 {
        CheckResult::new(
            "capacity",
            true,
            CheckSeverity::Info,
            format!("Cluster capacity: {:.1}% used", state.used_percent),
        )
        .with_details(json!({ "used_percent": state.used_percent, "total_bytes": state.total_bytes }))
    } else if state.used_percent < 85.0 {
        CheckResult::new(
            "capacity",
            true,
            CheckSeverity::Warning,
            format!("Cluster capacity high: {:.1}% used", state.used_percent),
        )
        .with_details(json!({ "used_percent": state.used_percent }))
    } else {
        CheckResult::new(
            "capacity",
            false,
            CheckSeverity::Critical,
            format!("Cluster capacity critical: {:.1}% used", state.used_percent),
        )
        .with_details(json!({ "used_percent": state.used_percent }))
    }
}

fn check_mgr_status(state: &CephClusterState) -> CheckResult {
    if !state.mgr_active.is_empty() && !state.mgr_standbys.is_empty() {
        CheckResult::new(
            "mgr_status",
            true,
            CheckSeverity::Info,
            format!("MGR active: {}", state.mgr_active),
        )
        .with_details(json!({ "active": state.mgr_active, "standbys": state.mgr_standbys }))
    } else if !state.mgr_active.is_empty() {
        CheckResult::new(
            "mgr_status",
            true,
            CheckSeverity::Warning,
            "MGR active but no standbys",
        )
        .with_details(json!({ "active": state.mgr_active }))
    } else {
        // I/O keeps flowing without an MGR; never block on it.
        CheckResult::new(
            "mgr_status",
            true,
            CheckSeverity::Warning,
            "No active MGR daemon detected",
        )
    }
}

#[cfg(test)]
mod tests {
    use test_r::test;

    use super::*;

    fn healthy_state() -> CephClusterState {
        CephClusterState {
            health_status: HEALTH_OK.to_string(),
            mon_count: 3,
            mon_in_quorum: 3,
            mon_quorum: vec!["a".into(), "b".into(), "c".into()],
            osd_count: 12,
            osd_up: 12,
            osd_in: 12,
            pg_count: 256,
            used_percent: 42.0,
            total_bytes: 100 << 30,
            mgr_active: "mgr-a".to_string(),
            mgr_standbys: vec!["mgr-b".to_string()],
            ..CephClusterState::default()
        }
    }

    #[test]
    fn healthy_cluster_passes_everything() {
        let checker_results = vec![
            check_overall_health(&healthy_state()),
            check_osd_status(&healthy_state()),
            check_mon_quorum(&healthy_state()),
            check_pg_status(&healthy_state()),
            check_capacity(&healthy_state()),
            check_mgr_status(&healthy_state()),
        ];
        assert!(checker_results.iter().all(|c| c.passed));
        assert!(checker_results
            .iter()
            .all(|c| c.severity == CheckSeverity::Info));
    }

    #[test]
    fn health_err_is_a_blocker() {
        let mut state = healthy_state();
        state.health_status = HEALTH_ERR.to_string();
        let check = check_overall_health(&state);
        assert!(!check.passed);
        assert_eq!(check.severity, CheckSeverity::Critical);
    }

    #[test]
    fn osd_thresholds_follow_the_ladder() {
        let mut state = healthy_state();
        state.osd_down = vec![3];
        assert_eq!(check_osd_status(&state).severity, CheckSeverity::Warning);
        state.osd_down = vec![1, 2, 3];
        let check = check_osd_status(&state);
        assert!(!check.passed);
        assert_eq!(check.severity, CheckSeverity::Critical);
    }

    #[test]
    fn quorum_majority_warns_minority_blocks() {
        let mut state = healthy_state();
        state.mon_in_quorum = 2;
        assert_eq!(check_mon_quorum(&state).severity, CheckSeverity::Warning);
        state.mon_in_quorum = 1;
        assert!(!check_mon_quorum(&state).passed);
    }

    #[test]
    fn capacity_bands_are_70_and_85() {
        let mut state = healthy_state();
        state.used_percent = 69.9;
        assert_eq!(check_capacity(&state).severity, CheckSeverity::Info);
        state.used_percent = 75.0;
        assert_eq!(check_capacity(&state).severity, CheckSeverity::Warning);
        state.used_percent = 90.0;
        assert!(!check_capacity(&state).passed);
    }

    #[test]
    fn stuck_pgs_block_degraded_warns() {
        let mut state = healthy_state();
        state.pg_degraded = 4;
        assert_eq!(check_pg_status(&state).severity, CheckSeverity::Warning);
        state.pg_stuck = 1;
        assert!(!check_pg_status(&state).passed);
    }

    #[test]
    fn missing_mgr_never_blocks() {
        let mut state = healthy_state();
        state.mgr_active = String::new();
        state.mgr_standbys = Vec::new();
        let check = check_mgr_status(&state);
        assert!(check.passed);
        assert_eq!(check.severity, CheckSeverity::Warning);
    }
}
