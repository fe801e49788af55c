use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use ioforge_common::model::{AdminNode, Worker};

pub mod ssh;

pub use ssh::SshRemoteCommand;

/// Outcome of a remote invocation. `exit_code == -1` with a populated `error`
/// means the session itself failed (timeout, auth, DNS, transport); any
/// non-negative exit code means the command ran and the channel is healthy.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub error: Option<String>,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    pub fn session_failed(message: impl Into<String>) -> Self {
        let message = message.into();
        CommandOutput {
            exit_code: -1,
            stdout: String::new(),
            stderr: message.clone(),
            error: Some(message),
        }
    }

    /// Best human-readable account of what went wrong.
    pub fn describe_failure(&self) -> String {
        if let Some(error) = &self.error {
            error.clone()
        } else if !self.stderr.trim().is_empty() {
            self.stderr.trim().to_string()
        } else {
            self.stdout.trim().to_string()
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SshTarget {
    pub host: String,
    pub user: String,
    pub port: u16,
    pub key_path: Option<String>,
    pub password: Option<String>,
}

impl SshTarget {
    pub fn from_worker(worker: &Worker) -> Self {
        SshTarget {
            host: worker.hostname.clone(),
            user: worker.ssh.user.clone(),
            port: worker.ssh.port,
            key_path: worker.ssh.key_path.clone(),
            password: worker.ssh.password.clone(),
        }
    }

    pub fn from_admin_node(node: &AdminNode) -> Self {
        SshTarget {
            host: node.host.clone(),
            user: node.username.clone(),
            port: node.port,
            key_path: node.key_path.clone(),
            password: node.password.clone(),
        }
    }
}

/// Session-per-invocation remote execution. Failures are data, not errors:
/// every call yields a [`CommandOutput`].
#[async_trait]
pub trait RemoteCommand: Send + Sync {
    async fn run(&self, target: &SshTarget, command: &str, timeout: Duration) -> CommandOutput;

    async fn put_file(
        &self,
        target: &SshTarget,
        local_path: &Path,
        remote_path: &str,
        timeout: Duration,
    ) -> CommandOutput;
}
