use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::{ModelError, StorageFamily, WorkerId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IoPattern {
    Random,
    Sequential,
    Mixed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkloadTool {
    Fio,
    Iozone,
    Dd,
    FillCluster,
    Custom,
}

impl WorkloadTool {
    /// The benchmark binary the driver must ensure on workers, if any.
    pub fn binary(&self) -> Option<&'static str> {
        match self {
            WorkloadTool::Fio => Some("fio"),
            WorkloadTool::Iozone => Some("iozone"),
            WorkloadTool::Dd => Some("dd"),
            // Fill workloads drive fio in sequential-write mode.
            WorkloadTool::FillCluster => Some("fio"),
            WorkloadTool::Custom => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            WorkloadTool::Fio => "fio",
            WorkloadTool::Iozone => "iozone",
            WorkloadTool::Dd => "dd",
            WorkloadTool::FillCluster => "fill_cluster",
            WorkloadTool::Custom => "custom",
        }
    }
}

impl Display for WorkloadTool {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IoConfig {
    pub pattern: IoPattern,
    pub block_size: String,
    /// Read share of the I/O mix; the write share is always `100 - read`.
    pub read_percent: u8,
    pub io_depth: u32,
    pub num_jobs: u32,
    pub direct_io: bool,
    pub sync_io: bool,
}

impl Default for IoConfig {
    fn default() -> Self {
        IoConfig {
            pattern: IoPattern::Random,
            block_size: "4k".to_string(),
            read_percent: 100,
            io_depth: 32,
            num_jobs: 1,
            direct_io: true,
            sync_io: false,
        }
    }
}

impl IoConfig {
    pub fn write_percent(&self) -> u8 {
        100 - self.read_percent
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TestConfig {
    #[serde(with = "humantime_serde")]
    pub duration: Duration,
    #[serde(with = "humantime_serde")]
    pub ramp_time: Duration,
    #[serde(with = "humantime_serde")]
    pub warmup: Duration,
    /// Benchmark file size per worker, e.g. `1G`.
    pub file_size: String,
}

impl Default for TestConfig {
    fn default() -> Self {
        TestConfig {
            duration: Duration::from_secs(60),
            ramp_time: Duration::ZERO,
            warmup: Duration::ZERO,
            file_size: "1G".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum WorkerSelection {
    All,
    Count { count: usize },
    Specific { ids: Vec<WorkerId> },
}

impl Default for WorkerSelection {
    fn default() -> Self {
        WorkerSelection::All
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScalingConfig {
    pub enabled: bool,
    pub min_workers: usize,
    pub max_workers: usize,
}

impl Default for ScalingConfig {
    fn default() -> Self {
        ScalingConfig {
            enabled: false,
            min_workers: 1,
            max_workers: 100,
        }
    }
}

/// Operator-supplied command run on the controller during prechecks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CustomCommand {
    pub command: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub blocking: bool,
    #[serde(default)]
    pub expected_exit_code: i32,
    #[serde(default = "default_command_timeout", with = "humantime_serde")]
    pub timeout: Duration,
}

fn default_command_timeout() -> Duration {
    Duration::from_secs(60)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PrecheckPolicy {
    pub enabled: bool,
    pub cluster_health: bool,
    pub worker_health: bool,
    pub min_healthy_workers: usize,
    pub custom_commands: Vec<CustomCommand>,
}

impl Default for PrecheckPolicy {
    fn default() -> Self {
        PrecheckPolicy {
            enabled: true,
            cluster_health: true,
            worker_health: true,
            min_healthy_workers: 1,
            custom_commands: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilesystemType {
    Cephfs,
    Nfs,
    Glusterfs,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CephfsMountMethod {
    Kernel,
    Fuse,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MountConfig {
    pub filesystem: FilesystemType,
    #[serde(default = "default_mount_point")]
    pub mount_point: String,
    #[serde(default = "default_cephfs_path")]
    pub cephfs_path: String,
    #[serde(default = "default_cephfs_user")]
    pub cephfs_user: String,
    #[serde(default)]
    pub cephfs_secret_file: Option<String>,
    #[serde(default = "default_mount_method")]
    pub mount_method: CephfsMountMethod,
    #[serde(default)]
    pub nfs_server: Option<String>,
    #[serde(default)]
    pub nfs_export: Option<String>,
    #[serde(default = "default_nfs_version")]
    pub nfs_version: String,
    #[serde(default)]
    pub gluster_volume: Option<String>,
    #[serde(default)]
    pub gluster_servers: Vec<String>,
    #[serde(default)]
    pub mount_options: String,
    #[serde(default = "default_auto_unmount")]
    pub auto_unmount: bool,
}

fn default_mount_point() -> String {
    "/mnt/ioforge_test".to_string()
}

fn default_cephfs_path() -> String {
    "/".to_string()
}

fn default_cephfs_user() -> String {
    "admin".to_string()
}

fn default_mount_method() -> CephfsMountMethod {
    CephfsMountMethod::Kernel
}

fn default_nfs_version() -> String {
    "4.1".to_string()
}

fn default_auto_unmount() -> bool {
    true
}

impl MountConfig {
    /// Whether the configuration carries enough detail to build a mount
    /// command for its filesystem type.
    pub fn is_mountable(&self) -> bool {
        match self.filesystem {
            FilesystemType::Cephfs => true,
            FilesystemType::Nfs => self.nfs_server.is_some() && self.nfs_export.is_some(),
            FilesystemType::Glusterfs => {
                self.gluster_volume.is_some() && !self.gluster_servers.is_empty()
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FillTarget {
    Cephfs,
    Rbd,
    S3,
}

/// Fill workloads write until the backing cluster reaches a capacity target
/// instead of running for a fixed duration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FillConfig {
    pub target: FillTarget,
    #[serde(default = "default_fill_percent")]
    pub target_fill_percent: u8,
    #[serde(default = "default_fill_file_size")]
    pub file_size: String,
    #[serde(default = "default_parallel_writes")]
    pub parallel_writes: u32,
    /// Pool replication factor used to convert raw bytes to effective bytes.
    #[serde(default)]
    pub replication_factor: Option<u32>,
    #[serde(default)]
    pub pool_name: Option<String>,
    #[serde(default = "default_image_prefix")]
    pub image_prefix: String,
    #[serde(default)]
    pub bucket: Option<String>,
    #[serde(default = "default_mount_point")]
    pub mount_point: String,
}

fn default_fill_percent() -> u8 {
    50
}

fn default_fill_file_size() -> String {
    "1G".to_string()
}

fn default_parallel_writes() -> u32 {
    4
}

fn default_image_prefix() -> String {
    "fill".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkloadConfig {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub cluster_name: String,
    pub storage_family: StorageFamily,
    #[serde(default)]
    pub mount: Option<MountConfig>,
    #[serde(default = "default_tool")]
    pub tool: WorkloadTool,
    #[serde(default)]
    pub fill: Option<FillConfig>,
    #[serde(default)]
    pub io: IoConfig,
    #[serde(default)]
    pub test: TestConfig,
    #[serde(default)]
    pub workers: WorkerSelection,
    #[serde(default)]
    pub scaling: Option<ScalingConfig>,
    #[serde(default)]
    pub prechecks: PrecheckPolicy,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

fn default_tool() -> WorkloadTool {
    WorkloadTool::Fio
}

impl WorkloadConfig {
    pub fn validate(&self) -> Result<(), ModelError> {
        if self.name.trim().is_empty() {
            return Err(ModelError::invalid("workload", "name must not be empty"));
        }
        if self.read_percent() > 100 {
            return Err(ModelError::invalid(
                "workload",
                format!("read_percent {} exceeds 100", self.read_percent()),
            ));
        }
        match &self.workers {
            WorkerSelection::Count { count } if *count == 0 => {
                return Err(ModelError::invalid(
                    "workload",
                    "worker count selection requires at least 1 worker",
                ));
            }
            WorkerSelection::Specific { ids } if ids.is_empty() => {
                return Err(ModelError::invalid(
                    "workload",
                    "specific worker selection requires at least one id",
                ));
            }
            _ => {}
        }
        if self.storage_family == StorageFamily::File {
            match &self.mount {
                None => {
                    return Err(ModelError::invalid(
                        "workload",
                        "file workloads require a mount configuration",
                    ));
                }
                Some(mount) if !mount.is_mountable() => {
                    return Err(ModelError::invalid(
                        "workload",
                        "mount configuration does not resolve to a mountable filesystem",
                    ));
                }
                _ => {}
            }
        }
        if self.tool == WorkloadTool::FillCluster && self.fill.is_none() {
            return Err(ModelError::invalid(
                "workload",
                "fill_cluster workloads require a fill configuration",
            ));
        }
        Ok(())
    }

    pub fn read_percent(&self) -> u8 {
        self.io.read_percent
    }

    /// Directory benchmark files are written to on each worker.
    pub fn test_directory(&self) -> String {
        match &self.mount {
            Some(mount) if self.storage_family == StorageFamily::File => {
                mount.mount_point.clone()
            }
            _ => "/tmp/ioforge_fio".to_string(),
        }
    }
}

#[cfg(test)]
pub(crate) fn test_workload(name: &str) -> WorkloadConfig {
    WorkloadConfig {
        name: name.to_string(),
        description: None,
        cluster_name: "lab".to_string(),
        storage_family: StorageFamily::Block,
        mount: None,
        tool: WorkloadTool::Fio,
        fill: None,
        io: IoConfig::default(),
        test: TestConfig::default(),
        workers: WorkerSelection::All,
        scaling: None,
        prechecks: PrecheckPolicy::default(),
        tags: BTreeMap::new(),
    }
}

#[cfg(test)]
mod tests {
    use test_r::test;

    use super::*;

    fn workload(name: &str) -> WorkloadConfig {
        test_workload(name)
    }

    #[test]
    fn read_and_write_percent_always_sum_to_100() {
        let mut wl = workload("rw-mix");
        wl.io.read_percent = 70;
        assert_eq!(wl.io.write_percent(), 30);
        assert!(wl.validate().is_ok());
    }

    #[test]
    fn count_selection_requires_at_least_one() {
        let mut wl = workload("count");
        wl.workers = WorkerSelection::Count { count: 0 };
        assert!(wl.validate().is_err());
        wl.workers = WorkerSelection::Count { count: 2 };
        assert!(wl.validate().is_ok());
    }

    #[test]
    fn file_workloads_need_a_mountable_filesystem() {
        let mut wl = workload("file");
        wl.storage_family = StorageFamily::File;
        assert!(wl.validate().is_err());

        wl.mount = Some(MountConfig {
            filesystem: FilesystemType::Nfs,
            mount_point: default_mount_point(),
            cephfs_path: default_cephfs_path(),
            cephfs_user: default_cephfs_user(),
            cephfs_secret_file: None,
            mount_method: default_mount_method(),
            nfs_server: None,
            nfs_export: None,
            nfs_version: default_nfs_version(),
            gluster_volume: None,
            gluster_servers: Vec::new(),
            mount_options: String::new(),
            auto_unmount: true,
        });
        assert!(wl.validate().is_err());

        if let Some(mount) = &mut wl.mount {
            mount.nfs_server = Some("nfs-1".to_string());
            mount.nfs_export = Some("/export".to_string());
        }
        assert!(wl.validate().is_ok());
        assert_eq!(wl.test_directory(), "/mnt/ioforge_test");
    }

    #[test]
    fn workload_yaml_round_trip_keeps_defaults() {
        let yaml = r#"
name: quick-randread
cluster_name: lab
storage_family: block
io:
  pattern: random
  read_percent: 100
test:
  duration: 1m
workers:
  mode: count
  count: 2
"#;
        let wl: WorkloadConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(wl.tool, WorkloadTool::Fio);
        assert_eq!(wl.io.block_size, "4k");
        assert_eq!(wl.test.duration, Duration::from_secs(60));
        assert_eq!(wl.workers, WorkerSelection::Count { count: 2 });
        assert!(wl.validate().is_ok());
    }
}
