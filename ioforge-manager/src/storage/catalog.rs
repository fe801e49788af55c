use std::path::{Path, PathBuf};

use chrono::Utc;
use ioforge_common::model::{ClusterConfig, ExecutionId, PrecheckReport, Worker, WorkloadConfig};
use ioforge_common::util::sanitize_filename;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{info, warn};

use crate::driver::CommandLogEntry;

#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("{kind} '{name}' not found")]
    NotFound { kind: &'static str, name: String },
    #[error("{kind} '{name}' already exists")]
    AlreadyExists { kind: &'static str, name: String },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid object: {0}")]
    Invalid(String),
}

impl CatalogError {
    fn not_found(kind: &'static str, name: &str) -> Self {
        CatalogError::NotFound {
            kind,
            name: name.to_string(),
        }
    }

    fn already_exists(kind: &'static str, name: &str) -> Self {
        CatalogError::AlreadyExists {
            kind,
            name: name.to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ExecutionPaths {
    pub dir: PathBuf,
    pub config_path: PathBuf,
    pub metrics_dir: PathBuf,
}

/// File-backed catalog of clusters, workloads and the worker inventory, plus
/// the per-execution artifact directories.
pub struct ConfigCatalog {
    base_path: PathBuf,
}

impl ConfigCatalog {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        ConfigCatalog {
            base_path: base_path.into(),
        }
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    pub async fn init(&self) -> Result<(), CatalogError> {
        for dir in [
            "config/clusters",
            "config/workers",
            "config/workloads/templates",
            "config/workloads/custom",
            "executions",
            "logs/executions",
        ] {
            tokio::fs::create_dir_all(self.base_path.join(dir)).await?;
        }
        info!("initialized data directories at {}", self.base_path.display());
        Ok(())
    }

    async fn read_yaml<T: DeserializeOwned>(&self, path: &Path) -> Result<T, CatalogError> {
        let raw = tokio::fs::read_to_string(path).await?;
        Ok(serde_yaml::from_str(&raw)?)
    }

    async fn write_yaml<T: Serialize>(&self, path: &Path, value: &T) -> Result<(), CatalogError> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(path, serde_yaml::to_string(value)?).await?;
        Ok(())
    }

    async fn write_json<T: Serialize>(&self, path: &Path, value: &T) -> Result<(), CatalogError> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(path, serde_json::to_string_pretty(value)?).await?;
        Ok(())
    }

    // Clusters

    fn cluster_path(&self, name: &str) -> PathBuf {
        self.base_path
            .join("config/clusters")
            .join(format!("{}.yaml", sanitize_filename(name)))
    }

    pub async fn get_cluster(&self, name: &str) -> Result<ClusterConfig, CatalogError> {
        let path = self.cluster_path(name);
        if !path.exists() {
            return Err(CatalogError::not_found("cluster", name));
        }
        self.read_yaml(&path).await
    }

    pub async fn create_cluster(&self, cluster: &ClusterConfig) -> Result<PathBuf, CatalogError> {
        cluster
            .validate()
            .map_err(|e| CatalogError::Invalid(e.to_string()))?;
        let path = self.cluster_path(&cluster.name);
        if path.exists() {
            return Err(CatalogError::already_exists("cluster", &cluster.name));
        }
        self.write_yaml(&path, cluster).await?;
        info!("saved cluster config: {}", cluster.name);
        Ok(path)
    }

    pub async fn update_cluster(&self, cluster: &ClusterConfig) -> Result<(), CatalogError> {
        cluster
            .validate()
            .map_err(|e| CatalogError::Invalid(e.to_string()))?;
        let path = self.cluster_path(&cluster.name);
        if !path.exists() {
            return Err(CatalogError::not_found("cluster", &cluster.name));
        }
        self.write_yaml(&path, cluster).await
    }

    pub async fn delete_cluster(&self, name: &str) -> Result<bool, CatalogError> {
        let path = self.cluster_path(name);
        if path.exists() {
            tokio::fs::remove_file(path).await?;
            info!("deleted cluster config: {name}");
            Ok(true)
        } else {
            Ok(false)
        }
    }

    pub async fn list_clusters(&self) -> Result<Vec<ClusterConfig>, CatalogError> {
        let mut clusters = Vec::new();
        let dir = self.base_path.join("config/clusters");
        let mut entries = tokio::fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            if entry.path().extension().is_some_and(|e| e == "yaml") {
                match self.read_yaml::<ClusterConfig>(&entry.path()).await {
                    Ok(cluster) => clusters.push(cluster),
                    Err(e) => warn!("skipping unreadable cluster file {:?}: {e}", entry.path()),
                }
            }
        }
        clusters.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(clusters)
    }

    // Workloads

    fn workload_path(&self, subdir: &str, name: &str) -> PathBuf {
        self.base_path
            .join("config/workloads")
            .join(subdir)
            .join(format!("{}.yaml", sanitize_filename(name)))
    }

    /// Templates take precedence over custom workloads with the same name.
    pub async fn get_workload(&self, name: &str) -> Result<WorkloadConfig, CatalogError> {
        for subdir in ["templates", "custom"] {
            let path = self.workload_path(subdir, name);
            if path.exists() {
                return self.read_yaml(&path).await;
            }
        }
        Err(CatalogError::not_found("workload", name))
    }

    pub async fn create_workload(
        &self,
        workload: &WorkloadConfig,
        is_template: bool,
    ) -> Result<PathBuf, CatalogError> {
        workload
            .validate()
            .map_err(|e| CatalogError::Invalid(e.to_string()))?;
        if self.get_workload(&workload.name).await.is_ok() {
            return Err(CatalogError::already_exists("workload", &workload.name));
        }
        let subdir = if is_template { "templates" } else { "custom" };
        let path = self.workload_path(subdir, &workload.name);
        self.write_yaml(&path, workload).await?;
        info!("saved workload: {}", workload.name);
        Ok(path)
    }

    pub async fn update_workload(&self, workload: &WorkloadConfig) -> Result<(), CatalogError> {
        workload
            .validate()
            .map_err(|e| CatalogError::Invalid(e.to_string()))?;
        for subdir in ["templates", "custom"] {
            let path = self.workload_path(subdir, &workload.name);
            if path.exists() {
                return self.write_yaml(&path, workload).await;
            }
        }
        Err(CatalogError::not_found("workload", &workload.name))
    }

    pub async fn delete_workload(&self, name: &str) -> Result<bool, CatalogError> {
        for subdir in ["custom", "templates"] {
            let path = self.workload_path(subdir, name);
            if path.exists() {
                tokio::fs::remove_file(path).await?;
                info!("deleted workload: {name}");
                return Ok(true);
            }
        }
        Ok(false)
    }

    pub async fn list_workloads(&self) -> Result<Vec<WorkloadConfig>, CatalogError> {
        let mut workloads = Vec::new();
        for subdir in ["templates", "custom"] {
            let dir = self.base_path.join("config/workloads").join(subdir);
            let mut entries = tokio::fs::read_dir(&dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                if entry.path().extension().is_some_and(|e| e == "yaml") {
                    match self.read_yaml::<WorkloadConfig>(&entry.path()).await {
                        Ok(workload) => workloads.push(workload),
                        Err(e) => {
                            warn!("skipping unreadable workload {:?}: {e}", entry.path())
                        }
                    }
                }
            }
        }
        Ok(workloads)
    }

    // Worker inventory

    fn workers_path(&self) -> PathBuf {
        self.base_path.join("config/workers/workers.yaml")
    }

    pub async fn load_workers(&self) -> Result<Vec<Worker>, CatalogError> {
        let path = self.workers_path();
        if !path.exists() {
            return Ok(Vec::new());
        }
        #[derive(serde::Deserialize)]
        struct Inventory {
            #[serde(default)]
            workers: Vec<Worker>,
        }
        let inventory: Inventory = self.read_yaml(&path).await?;
        Ok(inventory.workers)
    }

    pub async fn save_workers(&self, workers: &[Worker]) -> Result<(), CatalogError> {
        #[derive(serde::Serialize)]
        struct Inventory<'a> {
            workers: &'a [Worker],
        }
        self.write_yaml(&self.workers_path(), &Inventory { workers })
            .await?;
        info!("saved {} worker configurations", workers.len());
        Ok(())
    }

    // Executions

    pub fn execution_dir(&self, execution_id: &ExecutionId) -> PathBuf {
        self.base_path.join("executions").join(&execution_id.0)
    }

    /// Create the execution directory tree and snapshot the workload into it.
    /// Later edits of the catalog entry do not affect the snapshot.
    pub async fn create_execution_dir(
        &self,
        execution_id: &ExecutionId,
        workload: &WorkloadConfig,
    ) -> Result<ExecutionPaths, CatalogError> {
        let dir = self.execution_dir(execution_id);
        let metrics_dir = dir.join("metrics");
        tokio::fs::create_dir_all(metrics_dir.join("workers")).await?;

        let config_path = dir.join("config.yaml");
        self.write_yaml(&config_path, workload).await?;

        info!("created execution directory: {}", dir.display());
        Ok(ExecutionPaths {
            dir,
            config_path,
            metrics_dir,
        })
    }

    pub async fn load_execution_snapshot(
        &self,
        execution_id: &ExecutionId,
    ) -> Result<WorkloadConfig, CatalogError> {
        let path = self.execution_dir(execution_id).join("config.yaml");
        if !path.exists() {
            return Err(CatalogError::not_found("execution snapshot", &execution_id.0));
        }
        self.read_yaml(&path).await
    }

    pub async fn save_summary<T: Serialize>(
        &self,
        execution_id: &ExecutionId,
        summary: &T,
    ) -> Result<PathBuf, CatalogError> {
        let path = self.execution_dir(execution_id).join("summary.json");
        self.write_json(&path, summary).await?;
        info!("saved summary for execution: {execution_id}");
        Ok(path)
    }

    pub async fn save_command_log(
        &self,
        execution_id: &ExecutionId,
        commands: &[CommandLogEntry],
    ) -> Result<(), CatalogError> {
        let path = self.execution_dir(execution_id).join("commands.json");
        self.write_json(&path, &commands).await?;
        info!(
            "saved {} commands for execution: {execution_id}",
            commands.len()
        );
        Ok(())
    }

    pub async fn get_command_log(
        &self,
        execution_id: &ExecutionId,
    ) -> Result<Vec<CommandLogEntry>, CatalogError> {
        let path = self.execution_dir(execution_id).join("commands.json");
        if !path.exists() {
            return Ok(Vec::new());
        }
        let raw = tokio::fs::read_to_string(path).await?;
        Ok(serde_json::from_str(&raw)?)
    }

    pub async fn save_precheck_report(
        &self,
        report: &PrecheckReport,
    ) -> Result<PathBuf, CatalogError> {
        let path = self
            .execution_dir(&report.execution_id)
            .join("precheck_report.json");
        self.write_json(&path, report).await?;
        Ok(path)
    }

    pub async fn get_precheck_report(
        &self,
        execution_id: &ExecutionId,
    ) -> Result<Option<PrecheckReport>, CatalogError> {
        let path = self.execution_dir(execution_id).join("precheck_report.json");
        if !path.exists() {
            return Ok(None);
        }
        let raw = tokio::fs::read_to_string(path).await?;
        Ok(Some(serde_json::from_str(&raw)?))
    }

    /// Append a timestamped line to the execution's operator log.
    pub async fn append_execution_log(
        &self,
        execution_id: &ExecutionId,
        message: &str,
    ) -> Result<(), CatalogError> {
        use tokio::io::AsyncWriteExt;

        let path = self
            .base_path
            .join("logs/executions")
            .join(format!("{execution_id}.log"));
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;
        let line = format!("[{}] {message}\n", Utc::now().to_rfc3339());
        file.write_all(line.as_bytes()).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use test_r::test;

    use super::*;
    use ioforge_common::model::{
        CephConnection, StorageBackend, StorageFamily, WorkerSelection,
    };

    async fn catalog() -> (tempfile::TempDir, ConfigCatalog) {
        let dir = tempfile::tempdir().unwrap();
        let catalog = ConfigCatalog::new(dir.path());
        catalog.init().await.unwrap();
        (dir, catalog)
    }

    fn cluster(name: &str) -> ClusterConfig {
        ClusterConfig {
            name: name.to_string(),
            storage_family: StorageFamily::File,
            backend: StorageBackend::Cephfs,
            description: None,
            ceph: Some(CephConnection {
                monitors: vec!["mon-a".to_string()],
                user: "admin".to_string(),
                keyring_path: "/etc/ceph/ceph.client.admin.keyring".to_string(),
                conf_path: "/etc/ceph/ceph.conf".to_string(),
                pool: None,
                repo_url: None,
            }),
            nfs: None,
            s3: None,
            admin_node: None,
            tags: Default::default(),
        }
    }

    fn workload(name: &str) -> WorkloadConfig {
        WorkloadConfig {
            name: name.to_string(),
            description: None,
            cluster_name: "lab".to_string(),
            storage_family: StorageFamily::Block,
            mount: None,
            tool: ioforge_common::model::WorkloadTool::Fio,
            fill: None,
            io: Default::default(),
            test: Default::default(),
            workers: WorkerSelection::All,
            scaling: None,
            prechecks: Default::default(),
            tags: Default::default(),
        }
    }

    #[test]
    async fn cluster_create_rejects_collisions() {
        let (_dir, catalog) = catalog().await;
        catalog.create_cluster(&cluster("lab")).await.unwrap();
        let err = catalog.create_cluster(&cluster("lab")).await.unwrap_err();
        assert!(matches!(err, CatalogError::AlreadyExists { .. }));

        let loaded = catalog.get_cluster("lab").await.unwrap();
        assert_eq!(loaded.name, "lab");
        assert!(catalog.delete_cluster("lab").await.unwrap());
        assert!(!catalog.delete_cluster("lab").await.unwrap());
    }

    #[test]
    async fn workload_snapshot_is_immutable() {
        let (_dir, catalog) = catalog().await;
        let mut wl = workload("nightly");
        catalog.create_workload(&wl, false).await.unwrap();

        let execution_id = ExecutionId::from("exec_20250101_000000_aaaa0001");
        catalog
            .create_execution_dir(&execution_id, &wl)
            .await
            .unwrap();

        // Edit the catalog entry after the snapshot was taken.
        wl.io.read_percent = 0;
        catalog.update_workload(&wl).await.unwrap();

        let snapshot = catalog.load_execution_snapshot(&execution_id).await.unwrap();
        assert_eq!(snapshot.io.read_percent, 100);
        let live = catalog.get_workload("nightly").await.unwrap();
        assert_eq!(live.io.read_percent, 0);
    }

    #[test]
    async fn missing_objects_are_not_found() {
        let (_dir, catalog) = catalog().await;
        assert!(matches!(
            catalog.get_workload("absent").await,
            Err(CatalogError::NotFound { .. })
        ));
        assert!(matches!(
            catalog.get_cluster("absent").await,
            Err(CatalogError::NotFound { .. })
        ));
    }

    #[test]
    async fn worker_inventory_round_trips() {
        let (_dir, catalog) = catalog().await;
        assert!(catalog.load_workers().await.unwrap().is_empty());

        let workers = vec![Worker {
            id: ioforge_common::model::WorkerId::new("w1"),
            hostname: "w1.lab".to_string(),
            ssh: Default::default(),
            agent_port: 8080,
            tags: Default::default(),
        }];
        catalog.save_workers(&workers).await.unwrap();
        let loaded = catalog.load_workers().await.unwrap();
        assert_eq!(loaded, workers);
    }
}
