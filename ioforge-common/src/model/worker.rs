use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{ExecutionId, WorkerId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    Unknown,
    Online,
    Offline,
    Busy,
    Error,
    Unreachable,
}

impl WorkerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerStatus::Unknown => "unknown",
            WorkerStatus::Online => "online",
            WorkerStatus::Offline => "offline",
            WorkerStatus::Busy => "busy",
            WorkerStatus::Error => "error",
            WorkerStatus::Unreachable => "unreachable",
        }
    }

    pub fn parse(value: &str) -> WorkerStatus {
        match value {
            "online" => WorkerStatus::Online,
            "offline" => WorkerStatus::Offline,
            "busy" => WorkerStatus::Busy,
            "error" => WorkerStatus::Error,
            "unreachable" => WorkerStatus::Unreachable,
            _ => WorkerStatus::Unknown,
        }
    }
}

impl Display for WorkerStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentStatus {
    Pending,
    Connecting,
    Copying,
    Installing,
    Starting,
    Success,
    Failed,
}

impl DeploymentStatus {
    pub fn parse(value: &str) -> Option<DeploymentStatus> {
        match value {
            "pending" => Some(DeploymentStatus::Pending),
            "connecting" => Some(DeploymentStatus::Connecting),
            "copying" => Some(DeploymentStatus::Copying),
            "installing" => Some(DeploymentStatus::Installing),
            "starting" => Some(DeploymentStatus::Starting),
            "success" => Some(DeploymentStatus::Success),
            "failed" => Some(DeploymentStatus::Failed),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DeploymentStatus::Pending => "pending",
            DeploymentStatus::Connecting => "connecting",
            DeploymentStatus::Copying => "copying",
            DeploymentStatus::Installing => "installing",
            DeploymentStatus::Starting => "starting",
            DeploymentStatus::Success => "success",
            DeploymentStatus::Failed => "failed",
        }
    }
}

impl Display for DeploymentStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SshConfig {
    #[serde(default = "default_ssh_user")]
    pub user: String,
    #[serde(default)]
    pub key_path: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default = "default_ssh_port")]
    pub port: u16,
}

impl Default for SshConfig {
    fn default() -> Self {
        SshConfig {
            user: default_ssh_user(),
            key_path: None,
            password: None,
            port: default_ssh_port(),
        }
    }
}

fn default_ssh_user() -> String {
    "root".to_string()
}

fn default_ssh_port() -> u16 {
    22
}

fn default_agent_port() -> u16 {
    8080
}

/// A worker as described in the operator-managed inventory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Worker {
    pub id: WorkerId,
    pub hostname: String,
    #[serde(default)]
    pub ssh: SshConfig,
    #[serde(default = "default_agent_port")]
    pub agent_port: u16,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

/// Live status fields the core maintains on top of the inventory entry.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkerState {
    #[serde(default = "default_status")]
    pub status: WorkerStatus,
    #[serde(default)]
    pub agent_version: Option<String>,
    #[serde(default)]
    pub last_heartbeat: Option<DateTime<Utc>>,
    #[serde(default)]
    pub deployment_status: Option<DeploymentStatus>,
    #[serde(default)]
    pub deployment_step: Option<String>,
    #[serde(default)]
    pub current_execution: Option<ExecutionId>,
    #[serde(default)]
    pub error_message: Option<String>,
}

fn default_status() -> WorkerStatus {
    WorkerStatus::Unknown
}

impl Default for WorkerStatus {
    fn default() -> Self {
        WorkerStatus::Unknown
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerInfo {
    #[serde(flatten)]
    pub worker: Worker,
    #[serde(flatten)]
    pub state: WorkerState,
}

impl WorkerInfo {
    pub fn is_available(&self) -> bool {
        self.state.status == WorkerStatus::Online && self.state.current_execution.is_none()
    }
}
