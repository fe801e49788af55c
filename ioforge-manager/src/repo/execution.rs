use async_trait::async_trait;
use chrono::Utc;
use ioforge_common::model::{ExecutionId, ExecutionStatus};

use super::RepoError;
use crate::db::SqlitePool;

#[derive(sqlx::FromRow, Debug, Clone)]
pub struct ExecutionRecord {
    pub id: String,
    pub name: String,
    pub status: String,
    pub workload_type: Option<String>,
    pub backend: Option<String>,
    pub cluster_name: Option<String>,
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
    pub duration_seconds: Option<i64>,
    pub client_count: Option<i64>,
    pub total_iops: Option<i64>,
    pub avg_latency_us: Option<f64>,
    pub total_throughput_mbps: Option<f64>,
    pub config_path: Option<String>,
    pub metrics_path: Option<String>,
    pub error_message: Option<String>,
    pub network_baseline: Option<String>,
    pub created_at: String,
}

impl ExecutionRecord {
    pub fn new(
        id: &ExecutionId,
        name: &str,
        workload_type: &str,
        backend: &str,
        cluster_name: &str,
    ) -> Self {
        ExecutionRecord {
            id: id.0.clone(),
            name: name.to_string(),
            status: ExecutionStatus::Pending.as_str().to_string(),
            workload_type: Some(workload_type.to_string()),
            backend: Some(backend.to_string()),
            cluster_name: Some(cluster_name.to_string()),
            started_at: None,
            completed_at: None,
            duration_seconds: None,
            client_count: None,
            total_iops: None,
            avg_latency_us: None,
            total_throughput_mbps: None,
            config_path: None,
            metrics_path: None,
            error_message: None,
            network_baseline: None,
            created_at: Utc::now().to_rfc3339(),
        }
    }

    pub fn status(&self) -> Option<ExecutionStatus> {
        ExecutionStatus::parse(&self.status)
    }
}

/// Fields that may accompany a status update. `None` leaves the stored value
/// untouched.
#[derive(Debug, Clone, Default)]
pub struct ExecutionUpdate {
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
    pub duration_seconds: Option<i64>,
    pub client_count: Option<i64>,
    pub total_iops: Option<i64>,
    pub avg_latency_us: Option<f64>,
    pub total_throughput_mbps: Option<f64>,
    pub error_message: Option<String>,
}

#[async_trait]
pub trait ExecutionRepo: Send + Sync {
    async fn insert(&self, record: &ExecutionRecord) -> Result<(), RepoError>;

    async fn update_status(
        &self,
        id: &ExecutionId,
        status: ExecutionStatus,
        update: ExecutionUpdate,
    ) -> Result<(), RepoError>;

    async fn get(&self, id: &ExecutionId) -> Result<Option<ExecutionRecord>, RepoError>;

    async fn list(&self, limit: i64) -> Result<Vec<ExecutionRecord>, RepoError>;
}

pub struct DbExecutionRepo {
    pool: SqlitePool,
}

impl DbExecutionRepo {
    pub fn new(pool: SqlitePool) -> Self {
        DbExecutionRepo { pool }
    }
}

#[async_trait]
impl ExecutionRepo for DbExecutionRepo {
    async fn insert(&self, record: &ExecutionRecord) -> Result<(), RepoError> {
        sqlx::query(
            r#"
              INSERT INTO executions
                (id, name, status, workload_type, backend, cluster_name,
                 config_path, metrics_path, network_baseline, created_at)
              VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(&record.id)
        .bind(&record.name)
        .bind(&record.status)
        .bind(&record.workload_type)
        .bind(&record.backend)
        .bind(&record.cluster_name)
        .bind(&record.config_path)
        .bind(&record.metrics_path)
        .bind(&record.network_baseline)
        .bind(&record.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_status(
        &self,
        id: &ExecutionId,
        status: ExecutionStatus,
        update: ExecutionUpdate,
    ) -> Result<(), RepoError> {
        sqlx::query(
            r#"
              UPDATE executions SET
                status = $2,
                started_at = COALESCE($3, started_at),
                completed_at = COALESCE($4, completed_at),
                duration_seconds = COALESCE($5, duration_seconds),
                client_count = COALESCE($6, client_count),
                total_iops = COALESCE($7, total_iops),
                avg_latency_us = COALESCE($8, avg_latency_us),
                total_throughput_mbps = COALESCE($9, total_throughput_mbps),
                error_message = COALESCE($10, error_message)
              WHERE id = $1
            "#,
        )
        .bind(&id.0)
        .bind(status.as_str())
        .bind(&update.started_at)
        .bind(&update.completed_at)
        .bind(update.duration_seconds)
        .bind(update.client_count)
        .bind(update.total_iops)
        .bind(update.avg_latency_us)
        .bind(update.total_throughput_mbps)
        .bind(&update.error_message)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get(&self, id: &ExecutionId) -> Result<Option<ExecutionRecord>, RepoError> {
        sqlx::query_as::<_, ExecutionRecord>("SELECT * FROM executions WHERE id = $1")
            .bind(&id.0)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| e.into())
    }

    async fn list(&self, limit: i64) -> Result<Vec<ExecutionRecord>, RepoError> {
        sqlx::query_as::<_, ExecutionRecord>(
            "SELECT * FROM executions ORDER BY created_at DESC LIMIT $1",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| e.into())
    }
}
