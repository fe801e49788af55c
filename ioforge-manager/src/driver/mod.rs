use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use ioforge_common::model::{
    ClusterConfig, ExecutionId, MetricSample, MountConfig, Worker, WorkloadConfig, WorkloadTool,
};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::remote::{CommandOutput, RemoteCommand, SshTarget};

pub mod fill;
pub mod fio;
pub mod mount;

pub use fill::FillRound;

const COMMAND_LOG_TRUNCATE: usize = 200;

#[derive(Debug, Clone, thiserror::Error)]
pub enum DriverError {
    #[error("tool install failed: {0}")]
    ToolInstall(String),
    #[error("credential push failed: {0}")]
    CredentialPush(String),
    #[error("mount failed: {0}")]
    Mount(String),
    #[error("benchmark failed: {0}")]
    Benchmark(String),
    #[error("unsupported operation: {0}")]
    Unsupported(String),
}

/// One entry of the execution-scoped remote-command audit log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandLogEntry {
    pub timestamp: DateTime<Utc>,
    pub worker_id: String,
    pub command: String,
    pub description: String,
}

#[derive(Debug, Clone, Copy)]
pub struct DriverTimeouts {
    pub command: Duration,
    pub install: Duration,
    pub run_grace: Duration,
}

impl Default for DriverTimeouts {
    fn default() -> Self {
        DriverTimeouts {
            command: Duration::from_secs(60),
            install: Duration::from_secs(300),
            run_grace: Duration::from_secs(120),
        }
    }
}

/// Translates a workload specification into concrete remote commands and
/// normalizes tool output into metric samples. One driver instance is scoped
/// to one execution so its command log can be persisted alongside it.
pub struct WorkloadDriver {
    remote: Arc<dyn RemoteCommand>,
    timeouts: DriverTimeouts,
    command_log: Mutex<Vec<CommandLogEntry>>,
}

impl WorkloadDriver {
    pub fn new(remote: Arc<dyn RemoteCommand>, timeouts: DriverTimeouts) -> Self {
        WorkloadDriver {
            remote,
            timeouts,
            command_log: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn remote(&self) -> &Arc<dyn RemoteCommand> {
        &self.remote
    }

    pub(crate) fn timeouts(&self) -> &DriverTimeouts {
        &self.timeouts
    }

    pub(crate) fn log_command(&self, worker_id: &str, command: &str, description: &str) {
        let truncated: String = command.chars().take(COMMAND_LOG_TRUNCATE).collect();
        info!("[{worker_id}] {description}: {truncated}");
        self.command_log
            .lock()
            .expect("command log lock poisoned")
            .push(CommandLogEntry {
                timestamp: Utc::now(),
                worker_id: worker_id.to_string(),
                command: truncated,
                description: description.to_string(),
            });
    }

    pub fn command_log(&self) -> Vec<CommandLogEntry> {
        self.command_log
            .lock()
            .expect("command log lock poisoned")
            .clone()
    }

    pub fn take_command_log(&self) -> Vec<CommandLogEntry> {
        std::mem::take(&mut *self.command_log.lock().expect("command log lock poisoned"))
    }

    async fn run_on(
        &self,
        worker: &Worker,
        command: &str,
        timeout: Duration,
    ) -> CommandOutput {
        self.remote
            .run(&SshTarget::from_worker(worker), command, timeout)
            .await
    }

    /// Detect the benchmark binary; when missing, walk the package-manager
    /// chain and re-detect. Success is only reported after re-detection.
    pub async fn ensure_tool(
        &self,
        worker: &Worker,
        tool: WorkloadTool,
    ) -> Result<String, DriverError> {
        let Some(binary) = tool.binary() else {
            return Ok("no binary required".to_string());
        };
        let worker_id = worker.id.0.clone();

        let check = format!("which {binary}");
        self.log_command(&worker_id, &check, &format!("Check if {binary} is installed"));
        let detected = self.run_on(worker, &check, self.timeouts.command).await;
        if detected.success() {
            let version = self
                .run_on(worker, &format!("{binary} --version"), self.timeouts.command)
                .await;
            let version = if version.success() {
                version.stdout.trim().to_string()
            } else {
                "unknown".to_string()
            };
            return Ok(format!("{binary} already installed: {version}"));
        }

        let install = format!(
            "yum install -y {binary} 2>/dev/null || \
             dnf install -y {binary} 2>/dev/null || \
             (apt-get update && apt-get install -y {binary}) 2>/dev/null || \
             zypper install -y {binary} 2>/dev/null || \
             echo 'No package manager found'"
        );
        self.log_command(&worker_id, &install, &format!("Install {binary}"));
        let installed = self.run_on(worker, &install, self.timeouts.install).await;
        if !installed.success() {
            let message = format!("failed to install {binary}: {}", installed.describe_failure());
            self.log_command(&worker_id, &format!("# FAILED: {message}"), "Install result");
            return Err(DriverError::ToolInstall(message));
        }

        let verify = self
            .run_on(worker, &format!("{binary} --version"), self.timeouts.command)
            .await;
        if !verify.success() {
            let message = format!("{binary} installation verification failed");
            self.log_command(&worker_id, &format!("# FAILED: {message}"), "Install result");
            return Err(DriverError::ToolInstall(message));
        }
        let version = verify.stdout.trim().to_string();
        self.log_command(&worker_id, &format!("# SUCCESS: {version}"), "Install result");
        Ok(format!("{binary} installed: {version}"))
    }

    /// Fetch the cluster config and keyring from the cluster's admin node and
    /// write them atomically under the worker's `/etc/ceph`. Fallback keyring
    /// filenames are tried in order.
    pub async fn push_ceph_credentials(
        &self,
        worker: &Worker,
        cluster: &ClusterConfig,
    ) -> Result<(), DriverError> {
        let ceph = cluster.ceph.as_ref().ok_or_else(|| {
            DriverError::CredentialPush("cluster has no ceph connection".to_string())
        })?;
        let admin = cluster.admin_node.as_ref().ok_or_else(|| {
            DriverError::CredentialPush("no admin node configured for cluster".to_string())
        })?;
        let admin_target = SshTarget::from_admin_node(admin);
        let worker_id = worker.id.0.clone();

        let conf = self
            .remote
            .run(
                &admin_target,
                &format!("cat {}", ceph.conf_path),
                self.timeouts.command,
            )
            .await;
        if !conf.success() {
            return Err(DriverError::CredentialPush(format!(
                "failed to fetch {} from admin node: {}",
                ceph.conf_path,
                conf.describe_failure()
            )));
        }

        let mut keyring = self
            .remote
            .run(
                &admin_target,
                &format!("cat {}", ceph.keyring_path),
                self.timeouts.command,
            )
            .await;
        if !keyring.success() {
            let fallback = format!("/etc/ceph/ceph.client.{}.keyring", ceph.user);
            keyring = self
                .remote
                .run(&admin_target, &format!("cat {fallback}"), self.timeouts.command)
                .await;
            if !keyring.success() {
                return Err(DriverError::CredentialPush(format!(
                    "failed to fetch keyring from admin node: {}",
                    keyring.describe_failure()
                )));
            }
        }

        let mkdir = "mkdir -p /etc/ceph && chmod 755 /etc/ceph";
        self.log_command(&worker_id, mkdir, "Create /etc/ceph");
        let created = self.run_on(worker, mkdir, self.timeouts.command).await;
        if !created.success() {
            return Err(DriverError::CredentialPush(format!(
                "failed to create /etc/ceph: {}",
                created.describe_failure()
            )));
        }

        // Write-then-rename keeps partially transferred files invisible.
        let conf_cmd = format!(
            "cat > /etc/ceph/.ceph.conf.tmp << 'CEPHCONF'\n{}\nCEPHCONF\nmv /etc/ceph/.ceph.conf.tmp /etc/ceph/ceph.conf",
            conf.stdout
        );
        self.log_command(&worker_id, "cat > /etc/ceph/ceph.conf", "Write ceph.conf");
        let wrote_conf = self.run_on(worker, &conf_cmd, self.timeouts.command).await;
        if !wrote_conf.success() {
            return Err(DriverError::CredentialPush(format!(
                "failed to write ceph.conf: {}",
                wrote_conf.describe_failure()
            )));
        }

        let keyring_file = format!("/etc/ceph/ceph.client.{}.keyring", ceph.user);
        let keyring_cmd = format!(
            "cat > {keyring_file}.tmp << 'KEYRING'\n{}\nKEYRING\nchmod 600 {keyring_file}.tmp && mv {keyring_file}.tmp {keyring_file}",
            keyring.stdout
        );
        self.log_command(&worker_id, &format!("cat > {keyring_file}"), "Write keyring");
        let wrote_keyring = self.run_on(worker, &keyring_cmd, self.timeouts.command).await;
        if !wrote_keyring.success() {
            return Err(DriverError::CredentialPush(format!(
                "failed to write keyring: {}",
                wrote_keyring.describe_failure()
            )));
        }

        info!("pushed ceph credentials to {}", worker.hostname);
        Ok(())
    }

    /// Install ceph-common, optionally provisioning the cluster's package
    /// repository first.
    pub async fn install_ceph_common(
        &self,
        worker: &Worker,
        repo_url: Option<&str>,
    ) -> Result<(), DriverError> {
        let worker_id = worker.id.0.clone();
        let mut commands = Vec::new();
        if let Some(repo_url) = repo_url {
            let repo = format!(
                "[ceph]\nname=Ceph packages\nbaseurl={repo_url}\nenabled=1\ngpgcheck=0"
            );
            commands.push(format!(
                "cat > /etc/yum.repos.d/ceph.repo << 'EOF'\n{repo}\nEOF"
            ));
        }
        commands.push(
            "yum install -y ceph-common 2>/dev/null || \
             dnf install -y ceph-common 2>/dev/null || \
             (apt-get update && apt-get install -y ceph-common) 2>/dev/null || \
             zypper install -y ceph-common 2>/dev/null"
                .to_string(),
        );
        let command = commands.join(" && ");
        self.log_command(&worker_id, &command, "Install ceph-common");

        let output = self.run_on(worker, &command, self.timeouts.install).await;
        if !output.success() {
            let message = format!("failed to install ceph-common: {}", output.describe_failure());
            self.log_command(&worker_id, &format!("# FAILED: {message}"), "Install result");
            return Err(DriverError::ToolInstall(message));
        }
        self.log_command(&worker_id, "# SUCCESS", "Install result");
        Ok(())
    }

    /// Create the mount point, clear any prior mount, run the backend-specific
    /// mount command and verify the path is a mountpoint.
    pub async fn mount(
        &self,
        worker: &Worker,
        mount: &MountConfig,
        cluster: &ClusterConfig,
    ) -> Result<(), DriverError> {
        let worker_id = worker.id.0.clone();
        let mount_point = &mount.mount_point;

        self.run_on(
            worker,
            &format!("mkdir -p {mount_point}"),
            self.timeouts.command,
        )
        .await;
        self.run_on(
            worker,
            &format!("umount {mount_point} 2>/dev/null || true"),
            self.timeouts.command,
        )
        .await;

        let command = mount::build_mount_command(mount, cluster.ceph.as_ref())?;
        self.log_command(
            &worker_id,
            &command,
            &format!("Mount {:?} filesystem", mount.filesystem),
        );
        let mounted = self.run_on(worker, &command, self.timeouts.command).await;
        if !mounted.success() {
            let message = mounted.describe_failure();
            self.log_command(&worker_id, &format!("# FAILED: {message}"), "Mount result");
            return Err(DriverError::Mount(message));
        }

        let verify = format!("mountpoint -q {mount_point}");
        self.log_command(&worker_id, &verify, "Verify mount point");
        let verified = self.run_on(worker, &verify, self.timeouts.command).await;
        if !verified.success() {
            return Err(DriverError::Mount(format!(
                "{mount_point} is not a mountpoint after mounting"
            )));
        }
        Ok(())
    }

    pub async fn unmount(&self, worker: &Worker, mount_point: &str) {
        let command =
            format!("umount -f {mount_point} 2>/dev/null; rm -rf {mount_point}/fill_* 2>/dev/null");
        self.log_command(&worker.id.0, &command, "Unmount filesystem");
        self.run_on(worker, &command, self.timeouts.command).await;
    }

    /// Run the benchmark on one worker for the workload's duration and return
    /// a normalized sample.
    pub async fn run(
        &self,
        worker: &Worker,
        workload: &WorkloadConfig,
        execution_id: &ExecutionId,
    ) -> Result<MetricSample, DriverError> {
        match workload.tool {
            WorkloadTool::Fio => self.run_fio(worker, workload, execution_id).await,
            other => Err(DriverError::Unsupported(format!(
                "tool {other} has no driver for timed runs"
            ))),
        }
    }

    async fn run_fio(
        &self,
        worker: &Worker,
        workload: &WorkloadConfig,
        execution_id: &ExecutionId,
    ) -> Result<MetricSample, DriverError> {
        let worker_id = worker.id.0.clone();
        let directory = workload.test_directory();
        self.run_on(
            worker,
            &format!("mkdir -p {directory}"),
            self.timeouts.command,
        )
        .await;

        let tag = format!("ioforge_{}_{}", execution_id, worker.id);
        let command = fio::build_fio_command(workload, &directory, &tag);
        self.log_command(&worker_id, &command, "Run fio benchmark");

        let timeout = workload.test.duration + self.timeouts.run_grace;
        let output = self.run_on(worker, &command, timeout).await;
        if !output.success() {
            let message = output.describe_failure();
            self.log_command(&worker_id, &format!("# FAILED: {message}"), "fio result");
            return Err(DriverError::Benchmark(message));
        }

        let parsed = fio::parse_fio_output(&output.stdout)?;
        Ok(fio::sample_from_fio(
            &parsed,
            execution_id,
            &worker.id,
            Utc::now(),
        ))
    }

    /// Remove per-execution test files; optionally force-unmount.
    pub async fn cleanup(
        &self,
        worker: &Worker,
        mount_point: Option<&str>,
        auto_unmount: bool,
    ) {
        let mut command = "rm -rf /tmp/ioforge_fio* 2>/dev/null".to_string();
        if let Some(mount_point) = mount_point {
            command.push_str(&format!("; rm -rf {mount_point}/ioforge_* 2>/dev/null"));
            if auto_unmount {
                command.push_str(&format!("; umount {mount_point} 2>/dev/null || true"));
            }
        }
        self.log_command(&worker.id.0, &command, "Clean up test files");
        self.run_on(worker, &command, self.timeouts.command).await;
    }
}

#[cfg(test)]
mod tests {
    use test_r::test;

    use super::*;
    use crate::testutil;

    struct StaticRemote(CommandOutput);

    #[async_trait::async_trait]
    impl RemoteCommand for StaticRemote {
        async fn run(
            &self,
            _target: &SshTarget,
            _command: &str,
            _timeout: Duration,
        ) -> CommandOutput {
            self.0.clone()
        }

        async fn put_file(
            &self,
            _target: &SshTarget,
            _local_path: &std::path::Path,
            _remote_path: &str,
            _timeout: Duration,
        ) -> CommandOutput {
            self.0.clone()
        }
    }

    #[test]
    async fn command_log_records_and_truncates() {
        let driver = WorkloadDriver::new(
            Arc::new(StaticRemote(CommandOutput::default())),
            DriverTimeouts::default(),
        );
        let long_command = "x".repeat(500);
        driver.log_command("w1", &long_command, "Long command");
        let log = driver.command_log();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].command.len(), COMMAND_LOG_TRUNCATE);
        assert_eq!(log[0].worker_id, "w1");

        let taken = driver.take_command_log();
        assert_eq!(taken.len(), 1);
        assert!(driver.command_log().is_empty());
    }

    #[test]
    async fn ensure_tool_reports_existing_install() {
        let driver = WorkloadDriver::new(
            Arc::new(StaticRemote(CommandOutput {
                exit_code: 0,
                stdout: "fio-3.35\n".to_string(),
                stderr: String::new(),
                error: None,
            })),
            DriverTimeouts::default(),
        );
        let message = driver
            .ensure_tool(&testutil::worker("w1"), WorkloadTool::Fio)
            .await
            .unwrap();
        assert!(message.contains("already installed"));
    }

    #[test]
    async fn ensure_tool_fails_when_install_chain_fails() {
        let driver = WorkloadDriver::new(
            Arc::new(StaticRemote(CommandOutput {
                exit_code: 1,
                stdout: String::new(),
                stderr: "no package manager".to_string(),
                error: None,
            })),
            DriverTimeouts::default(),
        );
        let err = driver
            .ensure_tool(&testutil::worker("w1"), WorkloadTool::Fio)
            .await
            .unwrap_err();
        assert!(matches!(err, DriverError::ToolInstall(_)));
    }

    #[test]
    async fn custom_tool_needs_no_binary() {
        let driver = WorkloadDriver::new(
            Arc::new(StaticRemote(CommandOutput::session_failed("unreachable"))),
            DriverTimeouts::default(),
        );
        assert!(driver
            .ensure_tool(&testutil::worker("w1"), WorkloadTool::Custom)
            .await
            .is_ok());
    }
}
