use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::StreamExt;
use ioforge_common::model::{DeploymentStatus, Worker, WorkerId};
use tracing::{info, warn};

use crate::config::DeployConfig;
use crate::remote::{RemoteCommand, SshTarget};

#[derive(Debug, Clone)]
pub struct DeploymentOutcome {
    pub worker_id: WorkerId,
    pub hostname: String,
    pub status: DeploymentStatus,
    pub message: String,
}

impl DeploymentOutcome {
    fn failed(worker: &Worker, message: impl Into<String>) -> Self {
        DeploymentOutcome {
            worker_id: worker.id.clone(),
            hostname: worker.hostname.clone(),
            status: DeploymentStatus::Failed,
            message: message.into(),
        }
    }
}

/// Per-step progress callback; the caller decides how to persist transitions.
pub type StatusSink<'a> = &'a (dyn Fn(&WorkerId, DeploymentStatus, &str) + Send + Sync);

/// Installs, launches and supervises the agent runtime on workers. Every step
/// is idempotent: re-deploying over a live agent replaces it.
pub struct AgentDeployer {
    remote: Arc<dyn RemoteCommand>,
    config: DeployConfig,
}

impl AgentDeployer {
    pub fn new(remote: Arc<dyn RemoteCommand>, config: DeployConfig) -> Self {
        AgentDeployer { remote, config }
    }

    pub async fn deploy(&self, worker: &Worker, on_status: StatusSink<'_>) -> DeploymentOutcome {
        let target = SshTarget::from_worker(worker);
        let root = &self.config.agent_root;

        // Reach
        on_status(
            &worker.id,
            DeploymentStatus::Connecting,
            &format!("connecting to {}", worker.hostname),
        );
        let reach = self
            .remote
            .run(&target, "echo connected", self.config.step_timeout)
            .await;
        if !reach.success() {
            return DeploymentOutcome::failed(
                worker,
                format!("ssh connection failed: {}", reach.describe_failure()),
            );
        }

        // Stage
        on_status(
            &worker.id,
            DeploymentStatus::Installing,
            "staging agent runtime",
        );
        let mut stage = format!("mkdir -p {root}/bin {root}/logs && touch {root}/.staged");
        if let Some(setup) = &self.config.runtime_setup_command {
            stage.push_str(" && ");
            stage.push_str(setup);
        }
        let staged = self
            .remote
            .run(&target, &stage, self.config.install_timeout)
            .await;
        if !staged.success() {
            return DeploymentOutcome::failed(
                worker,
                format!("failed to stage agent runtime: {}", staged.describe_failure()),
            );
        }

        // Copy
        on_status(&worker.id, DeploymentStatus::Copying, "copying agent files");
        let files = match collect_files(&self.config.agent_package_dir) {
            Ok(files) if !files.is_empty() => files,
            Ok(_) => {
                return DeploymentOutcome::failed(
                    worker,
                    format!(
                        "agent package directory {} is empty",
                        self.config.agent_package_dir.display()
                    ),
                );
            }
            Err(e) => {
                return DeploymentOutcome::failed(
                    worker,
                    format!(
                        "cannot read agent package directory {}: {e}",
                        self.config.agent_package_dir.display()
                    ),
                );
            }
        };
        for relative in &files {
            let local = self.config.agent_package_dir.join(relative);
            let remote_file = format!("{root}/{}", relative.display());
            if let Some(parent) = Path::new(&remote_file).parent() {
                self.remote
                    .run(
                        &target,
                        &format!("mkdir -p {}", parent.display()),
                        self.config.step_timeout,
                    )
                    .await;
            }
            let copied = self
                .remote
                .put_file(&target, &local, &remote_file, self.config.step_timeout)
                .await;
            if !copied.success() {
                return DeploymentOutcome::failed(
                    worker,
                    format!(
                        "failed to copy {}: {}",
                        relative.display(),
                        copied.describe_failure()
                    ),
                );
            }
        }

        // Launch
        on_status(&worker.id, DeploymentStatus::Starting, "starting agent");
        let script = self.startup_script(worker);
        let launch = format!(
            "cat > {root}/start_agent.sh << 'SCRIPT'\n{script}\nSCRIPT\nchmod +x {root}/start_agent.sh && {root}/start_agent.sh",
        );
        let launched = self
            .remote
            .run(&target, &launch, self.config.step_timeout)
            .await;
        if !launched.success() {
            return DeploymentOutcome::failed(
                worker,
                format!("failed to start agent: {}", launched.describe_failure()),
            );
        }

        // Verify
        match self.verify(worker, &target).await {
            Ok(message) => {
                on_status(&worker.id, DeploymentStatus::Success, &message);
                DeploymentOutcome {
                    worker_id: worker.id.clone(),
                    hostname: worker.hostname.clone(),
                    status: DeploymentStatus::Success,
                    message,
                }
            }
            Err(message) => DeploymentOutcome::failed(worker, message),
        }
    }

    /// Poll the agent's local health endpoint; attach the tail of its log to
    /// the failure message when it never comes up.
    async fn verify(&self, worker: &Worker, target: &SshTarget) -> Result<String, String> {
        let poll = &self.config.health_poll;
        let health_cmd = format!(
            "curl -s --connect-timeout {} http://localhost:{}/health",
            self.config.health_poll_timeout.as_secs(),
            worker.agent_port
        );
        for attempt in 1..=poll.max_attempts {
            tokio::time::sleep(poll.delay_for_attempt(attempt)).await;
            let output = self
                .remote
                .run(target, &health_cmd, self.config.health_poll_timeout * 2)
                .await;
            if output.success() && !output.stdout.trim().is_empty() {
                return Ok(format!("agent running on port {}", worker.agent_port));
            }
        }

        let logs = self
            .remote
            .run(
                target,
                &format!("tail -20 {} 2>/dev/null", self.config.agent_log_path),
                self.config.step_timeout,
            )
            .await;
        let tail: String = logs.stdout.chars().take(500).collect();
        Err(format!("agent failed to start; last log lines: {tail}"))
    }

    fn startup_script(&self, worker: &Worker) -> String {
        let root = &self.config.agent_root;
        format!(
            r#"#!/bin/bash
cd {root}
export WORKER_ID="{worker_id}"
export AGENT_PORT="{agent_port}"
export CONTROLLER_URL="{controller_url}"
export BROKER_URL="{broker_url}"

pkill -f "{root}/bin/ioforge-agent" 2>/dev/null || true

nohup {root}/bin/ioforge-agent > {log_path} 2>&1 &
echo $! > {root}/agent.pid
echo "agent started with PID $(cat {root}/agent.pid)""#,
            worker_id = worker.id,
            agent_port = worker.agent_port,
            controller_url = self.config.controller_url,
            broker_url = self.config.broker_url,
            log_path = self.config.agent_log_path,
        )
    }

    /// Deploy to many workers concurrently, bounded by `fanout_limit`. A
    /// failure on one worker never aborts its siblings.
    pub async fn deploy_many(
        &self,
        workers: &[Worker],
        fanout_limit: usize,
        on_status: StatusSink<'_>,
    ) -> Vec<DeploymentOutcome> {
        let results: Vec<DeploymentOutcome> = futures::stream::iter(workers)
            .map(|worker| self.deploy(worker, on_status))
            .buffer_unordered(fanout_limit.max(1))
            .collect()
            .await;
        for outcome in &results {
            match outcome.status {
                DeploymentStatus::Success => {
                    info!(worker = %outcome.worker_id, "agent deployed")
                }
                _ => warn!(worker = %outcome.worker_id, "deployment failed: {}", outcome.message),
            }
        }
        results
    }

    pub async fn stop_agent(&self, worker: &Worker) -> bool {
        let target = SshTarget::from_worker(worker);
        let root = &self.config.agent_root;
        self.remote
            .run(
                &target,
                &format!("pkill -f \"{root}/bin/ioforge-agent\" && rm -f {root}/agent.pid"),
                self.config.step_timeout,
            )
            .await
            .success()
    }

    pub async fn uninstall(&self, worker: &Worker) -> bool {
        let target = SshTarget::from_worker(worker);
        let root = &self.config.agent_root;
        self.remote
            .run(
                &target,
                &format!(
                    "pkill -f \"{root}/bin/ioforge-agent\" 2>/dev/null; rm -rf {root}"
                ),
                self.config.step_timeout,
            )
            .await
            .success()
    }
}

fn collect_files(dir: &Path) -> std::io::Result<Vec<PathBuf>> {
    fn walk(base: &Path, dir: &Path, out: &mut Vec<PathBuf>) -> std::io::Result<()> {
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.is_dir() {
                walk(base, &path, out)?;
            } else {
                out.push(path.strip_prefix(base).unwrap().to_path_buf());
            }
        }
        Ok(())
    }
    let mut files = Vec::new();
    walk(dir, dir, &mut files)?;
    files.sort();
    Ok(files)
}

#[cfg(test)]
mod tests {
    use test_r::test;

    use super::*;

    #[test]
    fn startup_script_embeds_worker_identity_and_urls() {
        struct NoopRemote;
        #[async_trait::async_trait]
        impl RemoteCommand for NoopRemote {
            async fn run(
                &self,
                _target: &SshTarget,
                _command: &str,
                _timeout: std::time::Duration,
            ) -> crate::remote::CommandOutput {
                crate::remote::CommandOutput::default()
            }
            async fn put_file(
                &self,
                _target: &SshTarget,
                _local_path: &Path,
                _remote_path: &str,
                _timeout: std::time::Duration,
            ) -> crate::remote::CommandOutput {
                crate::remote::CommandOutput::default()
            }
        }

        let deployer = AgentDeployer::new(Arc::new(NoopRemote), DeployConfig::default());
        let worker = Worker {
            id: WorkerId::new("w7"),
            hostname: "w7.lab".to_string(),
            ssh: Default::default(),
            agent_port: 9090,
            tags: Default::default(),
        };
        let script = deployer.startup_script(&worker);
        assert!(script.contains("WORKER_ID=\"w7\""));
        assert!(script.contains("AGENT_PORT=\"9090\""));
        assert!(script.contains("CONTROLLER_URL=\"http://localhost:8000\""));
        assert!(script.contains("BROKER_URL=\"redis://localhost:6379\""));
        assert!(script.contains("pkill -f"));
        assert!(script.contains("agent.pid"));
    }

    #[test]
    fn collect_files_walks_recursively_and_relativizes() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("bin")).unwrap();
        std::fs::write(dir.path().join("bin/ioforge-agent"), b"elf").unwrap();
        std::fs::write(dir.path().join("VERSION"), b"0.1").unwrap();

        let files = collect_files(dir.path()).unwrap();
        assert_eq!(
            files,
            vec![PathBuf::from("VERSION"), PathBuf::from("bin/ioforge-agent")]
        );
    }
}
