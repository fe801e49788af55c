use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;
use ioforge_common::model::{MountPointCheck, Worker, WorkerHealthReport, WorkerStatus};

use crate::remote::{RemoteCommand, SshTarget};

const REQUIRED_TOOLS: [&str; 5] = ["fio", "iperf3", "dd", "iostat", "ping"];
const CHECK_TIMEOUT: Duration = Duration::from_secs(15);

/// Per-worker health probes: reachability, agent liveness, host inventory,
/// tool presence, mountpoint accessibility and latency to the storage
/// endpoint.
pub struct WorkerHealthChecker {
    remote: Arc<dyn RemoteCommand>,
    storage_endpoint: Option<String>,
    mount_points: Vec<String>,
}

impl WorkerHealthChecker {
    pub fn new(remote: Arc<dyn RemoteCommand>) -> Self {
        WorkerHealthChecker {
            remote,
            storage_endpoint: None,
            mount_points: Vec::new(),
        }
    }

    pub fn with_storage_endpoint(mut self, endpoint: Option<String>) -> Self {
        self.storage_endpoint = endpoint;
        self
    }

    pub fn with_mount_points(mut self, mount_points: Vec<String>) -> Self {
        self.mount_points = mount_points;
        self
    }

    pub async fn check_all(&self, workers: &[Worker]) -> Vec<WorkerHealthReport> {
        join_all(workers.iter().map(|worker| self.check(worker))).await
    }

    pub async fn check(&self, worker: &Worker) -> WorkerHealthReport {
        let mut report =
            WorkerHealthReport::unknown(worker.id.clone(), worker.hostname.clone());
        let target = SshTarget::from_worker(worker);

        // Reachability, with measured session latency.
        let start = Instant::now();
        let reach = self
            .remote
            .run(&target, "echo connected", CHECK_TIMEOUT)
            .await;
        if !reach.success() {
            report.status = WorkerStatus::Unreachable;
            report
                .errors
                .push(format!("cannot reach worker: {}", reach.describe_failure()));
            return report;
        }
        report.ssh_reachable = true;
        report.ssh_latency_ms = Some(start.elapsed().as_secs_f64() * 1000.0);

        // Agent liveness via its local health endpoint.
        let health_cmd = format!(
            "curl -s --connect-timeout 5 http://localhost:{}/health || echo 'AGENT_DOWN'",
            worker.agent_port
        );
        let health = self.remote.run(&target, &health_cmd, CHECK_TIMEOUT).await;
        if health.success() && !health.stdout.contains("AGENT_DOWN") {
            report.agent_running = true;
            if let Ok(parsed) =
                serde_json::from_str::<serde_json::Value>(health.stdout.trim())
            {
                report.agent_version = parsed["agent_version"]
                    .as_str()
                    .or_else(|| parsed["version"].as_str())
                    .map(str::to_string);
                report.agent_pid = parsed["pid"].as_u64().map(|pid| pid as u32);
            }
        } else {
            report
                .errors
                .push("agent not running or not responding".to_string());
        }

        // Host inventory in one session.
        let sys = self
            .remote
            .run(
                &target,
                "cat /proc/uptime 2>/dev/null && cat /proc/loadavg 2>/dev/null && \
                 free -b 2>/dev/null | grep Mem && df -B1 / 2>/dev/null | tail -1",
                CHECK_TIMEOUT,
            )
            .await;
        if sys.success() {
            parse_system_info(&sys.stdout, &mut report);
        }

        // Tool presence.
        for tool in REQUIRED_TOOLS {
            let found = self
                .remote
                .run(&target, &format!("which {tool}"), CHECK_TIMEOUT)
                .await
                .success();
            report.tools.insert(tool.to_string(), found);
            if !found {
                if tool == "fio" {
                    report
                        .warnings
                        .push("fio not installed (auto-installed during prepare)".to_string());
                } else {
                    report.warnings.push(format!("tool '{tool}' not installed"));
                }
            }
        }

        // Mountpoint accessibility.
        for mount_point in &self.mount_points {
            let accessible = self
                .remote
                .run(
                    &target,
                    &format!("mountpoint -q {mount_point} && ls {mount_point} > /dev/null 2>&1"),
                    CHECK_TIMEOUT,
                )
                .await
                .success();
            report.mount_points.push(MountPointCheck {
                path: mount_point.clone(),
                accessible,
            });
            if !accessible {
                report
                    .errors
                    .push(format!("mount point '{mount_point}' not accessible"));
            }
        }

        // Latency to the storage endpoint.
        if let Some(endpoint) = &self.storage_endpoint {
            let ping = self
                .remote
                .run(
                    &target,
                    &format!("ping -c 3 -q {endpoint} 2>/dev/null | tail -1"),
                    CHECK_TIMEOUT,
                )
                .await;
            if ping.success() {
                report.storage_latency_ms = parse_ping_avg(&ping.stdout);
            }
        }

        report.status = if !report.agent_running || !report.errors.is_empty() {
            WorkerStatus::Error
        } else {
            WorkerStatus::Online
        };
        report
    }
}

fn parse_system_info(stdout: &str, report: &mut WorkerHealthReport) {
    const GIB: f64 = 1024.0 * 1024.0 * 1024.0;
    let lines: Vec<&str> = stdout.lines().collect();
    if let Some(uptime) = lines.first() {
        report.uptime_seconds = uptime
            .split_whitespace()
            .next()
            .and_then(|v| v.parse::<f64>().ok())
            .map(|v| v as u64);
    }
    if let Some(loadavg) = lines.get(1) {
        let parts: Vec<f64> = loadavg
            .split_whitespace()
            .take(3)
            .filter_map(|v| v.parse().ok())
            .collect();
        if parts.len() == 3 {
            report.load_average = Some((parts[0], parts[1], parts[2]));
        }
    }
    if let Some(mem) = lines.get(2) {
        let fields: Vec<&str> = mem.split_whitespace().collect();
        if let Some(total) = fields.get(1).and_then(|v| v.parse::<f64>().ok()) {
            report.memory_total_gb = Some(total / GIB);
        }
        if let Some(available) = fields.get(6).and_then(|v| v.parse::<f64>().ok()) {
            report.memory_available_gb = Some(available / GIB);
        }
    }
    if let Some(disk) = lines.get(3) {
        let fields: Vec<&str> = disk.split_whitespace().collect();
        if let Some(free) = fields.get(3).and_then(|v| v.parse::<f64>().ok()) {
            report.disk_free_gb = Some(free / GIB);
        }
    }
}

/// Average RTT from ping's `rtt min/avg/max/mdev = a/b/c/d ms` summary line.
fn parse_ping_avg(stdout: &str) -> Option<f64> {
    let (_, values) = stdout.rsplit_once("= ")?;
    values.split('/').nth(1)?.parse().ok()
}

#[cfg(test)]
mod tests {
    use test_r::test;

    use super::*;
    use ioforge_common::model::WorkerId;

    #[test]
    fn system_info_parses_the_four_line_batch() {
        let stdout = "\
12345.67 54321.0
0.52 0.48 0.40 1/234 5678
Mem:       33554432000  1000000000  2000000000  3000  4000  21474836480
/dev/sda1  500000000000 100000000000 214748364800  32% /
";
        let mut report = WorkerHealthReport::unknown(WorkerId::new("w1"), "w1".to_string());
        parse_system_info(stdout, &mut report);
        assert_eq!(report.uptime_seconds, Some(12345));
        assert_eq!(report.load_average, Some((0.52, 0.48, 0.40)));
        assert!((report.memory_total_gb.unwrap() - 31.25).abs() < 0.01);
        assert!((report.memory_available_gb.unwrap() - 20.0).abs() < 0.01);
        assert!((report.disk_free_gb.unwrap() - 200.0).abs() < 0.01);
    }

    #[test]
    fn ping_summary_yields_average_latency() {
        let stdout = "rtt min/avg/max/mdev = 0.321/0.456/0.789/0.100 ms";
        assert_eq!(parse_ping_avg(stdout), Some(0.456));
        assert_eq!(parse_ping_avg("garbage"), None);
    }
}
