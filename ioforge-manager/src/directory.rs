use std::sync::Arc;

use chrono::DateTime;
use ioforge_common::model::{
    DeploymentStatus, ExecutionId, Worker, WorkerId, WorkerInfo, WorkerState, WorkerStatus,
};

use crate::repo::{RepoError, WorkerRepo};
use crate::storage::{CatalogError, ConfigCatalog};

#[derive(Debug, thiserror::Error)]
pub enum DirectoryError {
    #[error(transparent)]
    Repo(#[from] RepoError),
    #[error(transparent)]
    Catalog(#[from] CatalogError),
    #[error("worker '{0}' not found")]
    NotFound(WorkerId),
}

/// Inventory of workers: operator-managed entries from the catalog merged
/// with the live status rows the core maintains.
pub struct WorkerDirectory {
    catalog: Arc<ConfigCatalog>,
    repo: Arc<dyn WorkerRepo>,
}

impl WorkerDirectory {
    pub fn new(catalog: Arc<ConfigCatalog>, repo: Arc<dyn WorkerRepo>) -> Self {
        WorkerDirectory { catalog, repo }
    }

    pub async fn list(&self) -> Result<Vec<WorkerInfo>, DirectoryError> {
        let workers = self.catalog.load_workers().await?;
        let rows = self.repo.list().await?;
        let mut infos = Vec::with_capacity(workers.len());
        for worker in workers {
            let state = rows
                .iter()
                .find(|row| row.id == worker.id.0)
                .map(|row| WorkerState {
                    status: row.status(),
                    agent_version: row.agent_version.clone(),
                    last_heartbeat: row
                        .last_heartbeat
                        .as_deref()
                        .and_then(|ts| DateTime::parse_from_rfc3339(ts).ok())
                        .map(|ts| ts.to_utc()),
                    deployment_status: row
                        .deployment_status
                        .as_deref()
                        .and_then(DeploymentStatus::parse),
                    deployment_step: row.deployment_step.clone(),
                    current_execution: None,
                    error_message: row.error_message.clone().filter(|m| !m.is_empty()),
                })
                .unwrap_or_default();
            infos.push(WorkerInfo { worker, state });
        }
        Ok(infos)
    }

    pub async fn get(&self, id: &WorkerId) -> Result<WorkerInfo, DirectoryError> {
        self.list()
            .await?
            .into_iter()
            .find(|info| &info.worker.id == id)
            .ok_or_else(|| DirectoryError::NotFound(id.clone()))
    }

    /// Workers that are online and not attached to any execution.
    pub async fn available(&self) -> Result<Vec<WorkerInfo>, DirectoryError> {
        Ok(self
            .list()
            .await?
            .into_iter()
            .filter(WorkerInfo::is_available)
            .collect())
    }

    pub async fn mark_status(
        &self,
        worker: &Worker,
        status: WorkerStatus,
        error_message: Option<&str>,
    ) -> Result<(), DirectoryError> {
        self.repo
            .upsert_status(&worker.id, &worker.hostname, status, None, error_message)
            .await?;
        Ok(())
    }

    pub async fn record_heartbeat(
        &self,
        id: &WorkerId,
        hostname: &str,
        status: WorkerStatus,
        agent_version: Option<&str>,
    ) -> Result<(), DirectoryError> {
        self.repo
            .upsert_status(id, hostname, status, agent_version, None)
            .await?;
        Ok(())
    }

    pub async fn update_deployment(
        &self,
        id: &WorkerId,
        status: DeploymentStatus,
        step: Option<&str>,
    ) -> Result<(), DirectoryError> {
        self.repo.update_deployment(id, status, step).await?;
        Ok(())
    }

    /// Attach/detach bookkeeping is kept on the engine side; the directory
    /// only exposes the merged view, so busy workers are flagged via status.
    pub async fn mark_busy(
        &self,
        worker: &Worker,
        _execution_id: &ExecutionId,
    ) -> Result<(), DirectoryError> {
        self.mark_status(worker, WorkerStatus::Busy, None).await
    }

    pub async fn mark_idle(&self, worker: &Worker) -> Result<(), DirectoryError> {
        self.mark_status(worker, WorkerStatus::Online, None).await
    }
}
