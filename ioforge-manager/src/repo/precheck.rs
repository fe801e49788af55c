use async_trait::async_trait;
use chrono::Utc;
use ioforge_common::model::{ExecutionId, PrecheckReport};

use super::RepoError;
use crate::db::SqlitePool;

#[derive(sqlx::FromRow, Debug, Clone)]
pub struct PrecheckRecord {
    pub id: String,
    pub execution_id: Option<String>,
    pub status: Option<String>,
    pub cluster_health: Option<String>,
    pub clients_online: Option<i64>,
    pub clients_total: Option<i64>,
    pub report_path: Option<String>,
}

impl PrecheckRecord {
    pub fn from_report(report: &PrecheckReport, report_path: &str) -> Self {
        PrecheckRecord {
            id: format!("precheck_{}", report.execution_id),
            execution_id: Some(report.execution_id.0.clone()),
            status: Some(report.verdict.as_str().to_string()),
            cluster_health: report.cluster_health.clone(),
            clients_online: Some(report.workers_online as i64),
            clients_total: Some(report.workers_total as i64),
            report_path: Some(report_path.to_string()),
        }
    }
}

#[async_trait]
pub trait PrecheckRepo: Send + Sync {
    async fn insert(&self, record: &PrecheckRecord) -> Result<(), RepoError>;

    async fn get_by_execution(
        &self,
        execution_id: &ExecutionId,
    ) -> Result<Option<PrecheckRecord>, RepoError>;
}

pub struct DbPrecheckRepo {
    pool: SqlitePool,
}

impl DbPrecheckRepo {
    pub fn new(pool: SqlitePool) -> Self {
        DbPrecheckRepo { pool }
    }
}

#[async_trait]
impl PrecheckRepo for DbPrecheckRepo {
    async fn insert(&self, record: &PrecheckRecord) -> Result<(), RepoError> {
        sqlx::query(
            r#"
              INSERT OR REPLACE INTO prechecks
                (id, execution_id, status, cluster_health, clients_online, clients_total, report_path, created_at)
              VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(&record.id)
        .bind(&record.execution_id)
        .bind(&record.status)
        .bind(&record.cluster_health)
        .bind(record.clients_online)
        .bind(record.clients_total)
        .bind(&record.report_path)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_by_execution(
        &self,
        execution_id: &ExecutionId,
    ) -> Result<Option<PrecheckRecord>, RepoError> {
        sqlx::query_as::<_, PrecheckRecord>(
            "SELECT id, execution_id, status, cluster_health, clients_online, clients_total, report_path FROM prechecks WHERE execution_id = $1",
        )
        .bind(&execution_id.0)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| e.into())
    }
}
