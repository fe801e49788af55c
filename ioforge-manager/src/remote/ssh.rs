use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use super::{CommandOutput, RemoteCommand, SshTarget};

/// Drives `ssh`/`scp` as per-call subprocesses. Test environments are assumed:
/// unknown host keys are accepted and never recorded.
pub struct SshRemoteCommand {
    connect_timeout: Duration,
}

impl Default for SshRemoteCommand {
    fn default() -> Self {
        SshRemoteCommand {
            connect_timeout: Duration::from_secs(10),
        }
    }
}

impl SshRemoteCommand {
    pub fn new(connect_timeout: Duration) -> Self {
        SshRemoteCommand { connect_timeout }
    }

    fn common_options(&self, port_flag: &str, target: &SshTarget) -> Vec<String> {
        let mut opts = vec![
            "-o".to_string(),
            "StrictHostKeyChecking=no".to_string(),
            "-o".to_string(),
            "UserKnownHostsFile=/dev/null".to_string(),
            "-o".to_string(),
            "LogLevel=ERROR".to_string(),
            "-o".to_string(),
            format!("ConnectTimeout={}", self.connect_timeout.as_secs()),
            port_flag.to_string(),
            target.port.to_string(),
        ];
        if let Some(key_path) = &target.key_path {
            opts.push("-i".to_string());
            opts.push(key_path.clone());
            opts.push("-o".to_string());
            opts.push("BatchMode=yes".to_string());
        }
        opts
    }

    fn uses_password(target: &SshTarget) -> bool {
        target.password.is_some() && target.key_path.is_none()
    }

    /// Prefix with `sshpass` for password targets; the spawn-failure path in
    /// `execute` turns a missing helper into an auth-unsupported error.
    fn wrap_password_auth(target: &SshTarget, argv: Vec<String>) -> Vec<String> {
        match &target.password {
            Some(password) if target.key_path.is_none() => {
                let mut wrapped =
                    vec!["sshpass".to_string(), "-p".to_string(), password.clone()];
                wrapped.extend(argv);
                wrapped
            }
            _ => argv,
        }
    }

    pub(crate) fn ssh_argv(&self, target: &SshTarget, command: &str) -> Vec<String> {
        let mut argv = vec!["ssh".to_string()];
        argv.extend(self.common_options("-p", target));
        argv.push(format!("{}@{}", target.user, target.host));
        argv.push(command.to_string());
        Self::wrap_password_auth(target, argv)
    }

    pub(crate) fn scp_argv(
        &self,
        target: &SshTarget,
        local_path: &Path,
        remote_path: &str,
    ) -> Vec<String> {
        let mut argv = vec!["scp".to_string()];
        argv.extend(self.common_options("-P", target));
        argv.push(local_path.display().to_string());
        argv.push(format!("{}@{}:{}", target.user, target.host, remote_path));
        Self::wrap_password_auth(target, argv)
    }

    async fn execute(
        argv: Vec<String>,
        password_auth: bool,
        timeout: Duration,
    ) -> CommandOutput {
        let mut command = Command::new(&argv[0]);
        command
            .args(&argv[1..])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = match command.spawn() {
            Ok(child) => child,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound && password_auth => {
                return CommandOutput::session_failed(
                    "auth-unsupported: sshpass is required for password authentication \
                     but was not found on the controller host",
                );
            }
            Err(e) => {
                return CommandOutput::session_failed(format!(
                    "failed to spawn {}: {e}",
                    argv[0]
                ));
            }
        };

        // kill_on_drop reaps the local client on the timeout path; the remote
        // process is left for the remote OS.
        match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => CommandOutput {
                exit_code: output.status.code().unwrap_or(-1),
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
                error: None,
            },
            Ok(Err(e)) => CommandOutput::session_failed(format!("ssh session error: {e}")),
            Err(_) => CommandOutput::session_failed(format!(
                "timeout: command did not finish within {}s",
                timeout.as_secs()
            )),
        }
    }
}

#[async_trait]
impl RemoteCommand for SshRemoteCommand {
    async fn run(&self, target: &SshTarget, command: &str, timeout: Duration) -> CommandOutput {
        debug!(host = %target.host, "running remote command");
        let argv = self.ssh_argv(target, command);
        Self::execute(argv, Self::uses_password(target), timeout).await
    }

    async fn put_file(
        &self,
        target: &SshTarget,
        local_path: &Path,
        remote_path: &str,
        timeout: Duration,
    ) -> CommandOutput {
        debug!(host = %target.host, remote_path, "copying file to worker");
        let argv = self.scp_argv(target, local_path, remote_path);
        Self::execute(argv, Self::uses_password(target), timeout).await
    }
}

#[cfg(test)]
mod tests {
    use test_r::test;

    use super::*;

    fn key_target() -> SshTarget {
        SshTarget {
            host: "w1.lab".to_string(),
            user: "root".to_string(),
            port: 22,
            key_path: Some("/root/.ssh/id_ed25519".to_string()),
            password: None,
        }
    }

    #[test]
    fn key_auth_uses_batch_mode() {
        let client = SshRemoteCommand::default();
        let argv = client.ssh_argv(&key_target(), "echo connected");
        assert_eq!(argv[0], "ssh");
        assert!(argv.contains(&"StrictHostKeyChecking=no".to_string()));
        assert!(argv.contains(&"BatchMode=yes".to_string()));
        assert!(argv.contains(&"-i".to_string()));
        assert_eq!(argv.last().unwrap(), "echo connected");
    }

    #[test]
    fn password_auth_is_wrapped_in_sshpass() {
        let client = SshRemoteCommand::default();
        let target = SshTarget {
            key_path: None,
            password: Some("secret".to_string()),
            ..key_target()
        };
        let argv = client.ssh_argv(&target, "uptime");
        assert_eq!(&argv[..3], &["sshpass", "-p", "secret"]);
        assert_eq!(argv[3], "ssh");
        assert!(!argv.contains(&"BatchMode=yes".to_string()));
    }

    #[test]
    fn key_takes_precedence_over_password() {
        let client = SshRemoteCommand::default();
        let target = SshTarget {
            password: Some("secret".to_string()),
            ..key_target()
        };
        let argv = client.ssh_argv(&target, "uptime");
        assert_eq!(argv[0], "ssh");
    }

    #[test]
    fn scp_addresses_the_remote_path() {
        let client = SshRemoteCommand::default();
        let argv = client.scp_argv(&key_target(), Path::new("/tmp/agent.bin"), "/opt/agent/bin");
        assert_eq!(argv[0], "scp");
        assert!(argv.contains(&"-P".to_string()));
        assert_eq!(argv.last().unwrap(), "root@w1.lab:/opt/agent/bin");
    }

    #[test]
    async fn missing_binary_reports_session_failure() {
        let output = SshRemoteCommand::execute(
            vec!["ioforge-definitely-not-a-binary".to_string()],
            false,
            Duration::from_secs(5),
        )
        .await;
        assert_eq!(output.exit_code, -1);
        assert!(output.error.is_some());
    }

    #[test]
    async fn missing_sshpass_is_auth_unsupported() {
        let output = SshRemoteCommand::execute(
            vec!["ioforge-definitely-not-sshpass".to_string()],
            true,
            Duration::from_secs(5),
        )
        .await;
        assert_eq!(output.exit_code, -1);
        assert!(output.error.unwrap().contains("auth-unsupported"));
    }
}
