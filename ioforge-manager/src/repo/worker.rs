use async_trait::async_trait;
use chrono::Utc;
use ioforge_common::model::{DeploymentStatus, WorkerId, WorkerStatus};

use super::RepoError;
use crate::db::SqlitePool;

#[derive(sqlx::FromRow, Debug, Clone)]
pub struct WorkerRecord {
    pub id: String,
    pub hostname: String,
    pub status: String,
    pub agent_version: Option<String>,
    pub last_heartbeat: Option<String>,
    pub deployment_status: Option<String>,
    pub deployment_step: Option<String>,
    pub error_message: Option<String>,
}

impl WorkerRecord {
    pub fn status(&self) -> WorkerStatus {
        WorkerStatus::parse(&self.status)
    }
}

#[async_trait]
pub trait WorkerRepo: Send + Sync {
    /// Insert-or-update the live status row for a worker. Passing `None` for
    /// `agent_version`/`error_message` keeps the stored value.
    async fn upsert_status(
        &self,
        id: &WorkerId,
        hostname: &str,
        status: WorkerStatus,
        agent_version: Option<&str>,
        error_message: Option<&str>,
    ) -> Result<(), RepoError>;

    async fn update_deployment(
        &self,
        id: &WorkerId,
        status: DeploymentStatus,
        step: Option<&str>,
    ) -> Result<(), RepoError>;

    async fn get(&self, id: &WorkerId) -> Result<Option<WorkerRecord>, RepoError>;

    async fn list(&self) -> Result<Vec<WorkerRecord>, RepoError>;
}

pub struct DbWorkerRepo {
    pool: SqlitePool,
}

impl DbWorkerRepo {
    pub fn new(pool: SqlitePool) -> Self {
        DbWorkerRepo { pool }
    }
}

#[async_trait]
impl WorkerRepo for DbWorkerRepo {
    async fn upsert_status(
        &self,
        id: &WorkerId,
        hostname: &str,
        status: WorkerStatus,
        agent_version: Option<&str>,
        error_message: Option<&str>,
    ) -> Result<(), RepoError> {
        // A healthy worker clears any stale error.
        let error_message = if error_message.is_none()
            && matches!(status, WorkerStatus::Online | WorkerStatus::Busy)
        {
            Some("")
        } else {
            error_message
        };
        let now = Utc::now().to_rfc3339();
        sqlx::query(
            r#"
              INSERT INTO workers (id, hostname, status, agent_version, last_heartbeat, registered_at, error_message)
              VALUES ($1, $2, $3, $4, $5, $5, $6)
              ON CONFLICT(id) DO UPDATE SET
                status = excluded.status,
                hostname = excluded.hostname,
                agent_version = COALESCE(excluded.agent_version, agent_version),
                last_heartbeat = excluded.last_heartbeat,
                error_message = COALESCE(excluded.error_message, error_message)
            "#,
        )
        .bind(&id.0)
        .bind(hostname)
        .bind(status.as_str())
        .bind(agent_version)
        .bind(&now)
        .bind(error_message)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_deployment(
        &self,
        id: &WorkerId,
        status: DeploymentStatus,
        step: Option<&str>,
    ) -> Result<(), RepoError> {
        sqlx::query(
            r#"
              UPDATE workers SET
                deployment_status = $2,
                deployment_step = $3,
                last_heartbeat = $4
              WHERE id = $1
            "#,
        )
        .bind(&id.0)
        .bind(status.as_str())
        .bind(step)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get(&self, id: &WorkerId) -> Result<Option<WorkerRecord>, RepoError> {
        sqlx::query_as::<_, WorkerRecord>(
            "SELECT id, hostname, status, agent_version, last_heartbeat, deployment_status, deployment_step, error_message FROM workers WHERE id = $1",
        )
        .bind(&id.0)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| e.into())
    }

    async fn list(&self) -> Result<Vec<WorkerRecord>, RepoError> {
        sqlx::query_as::<_, WorkerRecord>(
            "SELECT id, hostname, status, agent_version, last_heartbeat, deployment_status, deployment_step, error_message FROM workers",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| e.into())
    }
}
