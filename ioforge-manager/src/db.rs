use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Pool, Row, Sqlite};
use tracing::info;

use ioforge_common::config::DbSqliteConfig;

use crate::repo::RepoError;

pub type SqlitePool = Pool<Sqlite>;

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS workers (
    id TEXT PRIMARY KEY,
    hostname TEXT NOT NULL,
    status TEXT DEFAULT 'unknown',
    agent_version TEXT,
    registered_at TEXT DEFAULT CURRENT_TIMESTAMP,
    last_heartbeat TEXT,
    deployment_status TEXT,
    deployment_step TEXT,
    error_message TEXT
);

CREATE INDEX IF NOT EXISTS idx_workers_status ON workers(status);
CREATE INDEX IF NOT EXISTS idx_workers_hostname ON workers(hostname);

CREATE TABLE IF NOT EXISTS executions (
    id TEXT PRIMARY KEY,
    name TEXT,
    status TEXT DEFAULT 'pending',
    workload_type TEXT,
    backend TEXT,
    cluster_name TEXT,
    started_at TEXT,
    completed_at TEXT,
    duration_seconds INTEGER,
    client_count INTEGER,
    total_iops INTEGER,
    avg_latency_us REAL,
    total_throughput_mbps REAL,
    config_path TEXT,
    metrics_path TEXT,
    error_message TEXT,
    network_baseline JSON,
    created_at TEXT DEFAULT CURRENT_TIMESTAMP
);

CREATE INDEX IF NOT EXISTS idx_executions_status ON executions(status);
CREATE INDEX IF NOT EXISTS idx_executions_created ON executions(created_at);

CREATE TABLE IF NOT EXISTS prechecks (
    id TEXT PRIMARY KEY,
    execution_id TEXT,
    status TEXT,
    cluster_health TEXT,
    clients_online INTEGER,
    clients_total INTEGER,
    report_path TEXT,
    created_at TEXT DEFAULT CURRENT_TIMESTAMP,
    FOREIGN KEY (execution_id) REFERENCES executions(id)
);
"#;

pub async fn create_sqlite_pool(config: &DbSqliteConfig) -> Result<SqlitePool, RepoError> {
    info!("DB pool: sqlite://{}", config.database);
    if let Some(parent) = std::path::Path::new(&config.database).parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .map_err(|e| RepoError::Internal(format!("creating db directory: {e}")))?;
        }
    }
    let options = SqliteConnectOptions::new()
        .filename(&config.database)
        .create_if_missing(true);
    let pool = SqlitePoolOptions::new()
        .max_connections(config.max_connections)
        .connect_with(options)
        .await?;
    Ok(pool)
}

pub async fn create_memory_pool() -> Result<SqlitePool, RepoError> {
    let options = SqliteConnectOptions::new().in_memory(true);
    // A single connection keeps every query on the same in-memory database.
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(options)
        .await?;
    Ok(pool)
}

/// Create the schema and add any column an older database is missing. Runs
/// before the store serves requests.
pub async fn migrate(pool: &SqlitePool) -> Result<(), RepoError> {
    sqlx::raw_sql(SCHEMA_SQL).execute(pool).await?;

    add_missing_column(pool, "executions", "error_message", "TEXT").await?;
    add_missing_column(pool, "executions", "network_baseline", "JSON").await?;
    add_missing_column(pool, "executions", "duration_seconds", "INTEGER").await?;
    add_missing_column(pool, "workers", "error_message", "TEXT").await?;
    add_missing_column(pool, "workers", "deployment_status", "TEXT").await?;
    add_missing_column(pool, "workers", "deployment_step", "TEXT").await?;

    Ok(())
}

async fn add_missing_column(
    pool: &SqlitePool,
    table: &str,
    column: &str,
    column_type: &str,
) -> Result<(), RepoError> {
    let rows = sqlx::query(&format!("PRAGMA table_info({table})"))
        .fetch_all(pool)
        .await?;
    let exists = rows
        .iter()
        .any(|row| row.get::<String, _>("name") == column);
    if !exists {
        info!("adding {column} column to {table} table");
        sqlx::query(&format!("ALTER TABLE {table} ADD COLUMN {column} {column_type}"))
            .execute(pool)
            .await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use test_r::test;

    use super::*;

    #[test]
    async fn migrate_is_idempotent() {
        let pool = create_memory_pool().await.unwrap();
        migrate(&pool).await.unwrap();
        migrate(&pool).await.unwrap();
    }

    #[test]
    async fn migrate_adds_missing_columns() {
        let pool = create_memory_pool().await.unwrap();
        sqlx::raw_sql("CREATE TABLE executions (id TEXT PRIMARY KEY, name TEXT, status TEXT, created_at TEXT)")
            .execute(&pool)
            .await
            .unwrap();
        migrate(&pool).await.unwrap();

        sqlx::query("INSERT INTO executions (id, name, status, error_message) VALUES ('e1', 'n', 'pending', 'boom')")
            .execute(&pool)
            .await
            .unwrap();
        let row = sqlx::query("SELECT error_message FROM executions WHERE id = 'e1'")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(row.get::<Option<String>, _>("error_message").as_deref(), Some("boom"));
    }
}
