use std::process::Stdio;
use std::time::{Duration, Instant};

use ioforge_common::model::{CommandCheckResult, CustomCommand};
use tokio::process::Command;
use tracing::warn;

use crate::remote::CommandOutput;

/// Run a command locally on the controller host, argv-split like a shell
/// would.
pub(crate) async fn run_local(command_line: &str, timeout: Duration) -> CommandOutput {
    let Some(argv) = shlex::split(command_line) else {
        return CommandOutput::session_failed(format!("unparsable command: {command_line}"));
    };
    if argv.is_empty() {
        return CommandOutput::session_failed("empty command");
    }

    let mut command = Command::new(&argv[0]);
    command
        .args(&argv[1..])
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let child = match command.spawn() {
        Ok(child) => child,
        Err(e) => {
            return CommandOutput::session_failed(format!("failed to spawn {}: {e}", argv[0]))
        }
    };
    match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(Ok(output)) => CommandOutput {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            error: None,
        },
        Ok(Err(e)) => CommandOutput::session_failed(format!("command error: {e}")),
        Err(_) => CommandOutput::session_failed(format!(
            "timeout: command did not finish within {}s",
            timeout.as_secs()
        )),
    }
}

/// Runs operator-supplied commands on the controller before a test. `ceph`
/// commands get the cluster's conf file injected.
pub struct CustomCommandRunner {
    ceph_conf: String,
}

impl CustomCommandRunner {
    pub fn new(ceph_conf: impl Into<String>) -> Self {
        CustomCommandRunner {
            ceph_conf: ceph_conf.into(),
        }
    }

    fn effective_command(&self, command: &str) -> String {
        match command.strip_prefix("ceph ") {
            Some(rest) => format!("ceph --conf {} {rest}", self.ceph_conf),
            None => command.to_string(),
        }
    }

    pub async fn run(&self, config: &CustomCommand) -> CommandCheckResult {
        let effective = self.effective_command(&config.command);
        let start = Instant::now();
        let output = run_local(&effective, config.timeout).await;
        let duration_ms = start.elapsed().as_secs_f64() * 1000.0;

        CommandCheckResult {
            command: config.command.clone(),
            description: config.description.clone(),
            exit_code: output.exit_code,
            stdout: output.stdout,
            stderr: output
                .error
                .clone()
                .unwrap_or(output.stderr),
            success: output.exit_code == config.expected_exit_code,
            duration_ms,
            blocking: config.blocking,
        }
    }

    /// Commands run in order; the first failed blocking command aborts the
    /// remaining list.
    pub async fn run_all(&self, commands: &[CustomCommand]) -> Vec<CommandCheckResult> {
        let mut results = Vec::with_capacity(commands.len());
        for config in commands {
            let result = self.run(config).await;
            let stop = config.blocking && !result.success;
            results.push(result);
            if stop {
                warn!("blocking command failed: {}", config.command);
                break;
            }
        }
        results
    }

    /// Baseline capture set of common cluster queries.
    pub fn presets() -> Vec<CustomCommand> {
        [
            ("ceph status", "Get cluster status"),
            ("ceph osd tree", "Show OSD tree"),
            ("ceph osd pool ls detail", "List all pools with details"),
            ("ceph df", "Cluster disk usage"),
            ("ceph pg stat", "PG statistics"),
            ("ceph health detail", "Detailed health information"),
            ("ceph mon stat", "Monitor status"),
        ]
        .into_iter()
        .map(|(command, description)| CustomCommand {
            command: command.to_string(),
            description: description.to_string(),
            blocking: false,
            expected_exit_code: 0,
            timeout: Duration::from_secs(60),
        })
        .collect()
    }
}

#[cfg(test)]
mod tests {
    use test_r::test;

    use super::*;

    fn cmd(command: &str, blocking: bool) -> CustomCommand {
        CustomCommand {
            command: command.to_string(),
            description: String::new(),
            blocking,
            expected_exit_code: 0,
            timeout: Duration::from_secs(10),
        }
    }

    #[test]
    async fn successful_command_captures_stdout() {
        let runner = CustomCommandRunner::new("/etc/ceph/ceph.conf");
        let result = runner.run(&cmd("echo hello", false)).await;
        assert!(result.success);
        assert_eq!(result.exit_code, 0);
        assert_eq!(result.stdout.trim(), "hello");
    }

    #[test]
    async fn failed_blocking_command_short_circuits() {
        let runner = CustomCommandRunner::new("/etc/ceph/ceph.conf");
        let results = runner
            .run_all(&[
                cmd("true", false),
                cmd("false", true),
                cmd("echo never-runs", false),
            ])
            .await;
        assert_eq!(results.len(), 2);
        assert!(results[0].success);
        assert!(!results[1].success);
    }

    #[test]
    async fn failed_non_blocking_command_continues() {
        let runner = CustomCommandRunner::new("/etc/ceph/ceph.conf");
        let results = runner
            .run_all(&[cmd("false", false), cmd("echo still-runs", false)])
            .await;
        assert_eq!(results.len(), 2);
        assert!(results[1].success);
    }

    #[test]
    fn ceph_commands_get_the_conf_injected() {
        let runner = CustomCommandRunner::new("/etc/ceph/lab.conf");
        assert_eq!(
            runner.effective_command("ceph osd tree"),
            "ceph --conf /etc/ceph/lab.conf osd tree"
        );
        assert_eq!(runner.effective_command("uptime"), "uptime");
    }

    #[test]
    async fn missing_binary_reports_failure() {
        let runner = CustomCommandRunner::new("/etc/ceph/ceph.conf");
        let result = runner.run(&cmd("ioforge-no-such-binary", true)).await;
        assert!(!result.success);
        assert_eq!(result.exit_code, -1);
        assert!(result.stderr.contains("failed to spawn"));
    }
}
