use std::sync::Arc;
use std::time::Duration;

use tracing::warn;

use crate::bus::{DisabledEventBus, EventBus, RedisEventBus};
use crate::config::ManagerConfig;
use crate::db;
use crate::deploy::AgentDeployer;
use crate::directory::WorkerDirectory;
use crate::engine::ExecutionEngine;
use crate::remote::{RemoteCommand, SshRemoteCommand};
use crate::repo::{
    DbExecutionRepo, DbPrecheckRepo, DbWorkerRepo, ExecutionRepo, PrecheckRepo, WorkerRepo,
};
use crate::storage::{ConfigCatalog, MetricsStore};

/// Service container wiring the orchestration core. Collaborators (HTTP
/// handlers, CLI) receive this by reference; nothing in the core reaches for
/// global state.
#[derive(Clone)]
pub struct Services {
    pub catalog: Arc<ConfigCatalog>,
    pub metrics: Arc<MetricsStore>,
    pub executions: Arc<dyn ExecutionRepo>,
    pub workers: Arc<dyn WorkerRepo>,
    pub prechecks: Arc<dyn PrecheckRepo>,
    pub directory: Arc<WorkerDirectory>,
    pub remote: Arc<dyn RemoteCommand>,
    pub bus: Arc<dyn EventBus>,
    pub deployer: Arc<AgentDeployer>,
    pub engine: Arc<ExecutionEngine>,
}

impl Services {
    pub async fn new(config: &ManagerConfig) -> Result<Services, String> {
        let catalog = Arc::new(ConfigCatalog::new(&config.data_root));
        catalog
            .init()
            .await
            .map_err(|e| format!("failed to initialize data directories: {e}"))?;
        let metrics = Arc::new(MetricsStore::new(&config.data_root));

        let pool = db::create_sqlite_pool(&config.db)
            .await
            .map_err(|e| format!("failed to open database: {e}"))?;
        db::migrate(&pool)
            .await
            .map_err(|e| format!("failed to migrate database: {e}"))?;

        let executions: Arc<dyn ExecutionRepo> = Arc::new(DbExecutionRepo::new(pool.clone()));
        let workers: Arc<dyn WorkerRepo> = Arc::new(DbWorkerRepo::new(pool.clone()));
        let prechecks: Arc<dyn PrecheckRepo> = Arc::new(DbPrecheckRepo::new(pool));

        let remote: Arc<dyn RemoteCommand> =
            Arc::new(SshRemoteCommand::new(Duration::from_secs(10)));
        let directory = Arc::new(WorkerDirectory::new(catalog.clone(), workers.clone()));
        let deployer = Arc::new(AgentDeployer::new(remote.clone(), config.deploy.clone()));

        // The core must keep functioning without a broker: degrade to
        // direct-command mode instead of failing startup.
        let bus: Arc<dyn EventBus> = match RedisEventBus::connect(&config.redis).await {
            Ok(bus) => Arc::new(bus),
            Err(e) => {
                warn!("event bus unavailable ({e}); running in direct-command mode");
                Arc::new(DisabledEventBus)
            }
        };

        let engine = ExecutionEngine::new(
            config.engine.clone(),
            catalog.clone(),
            metrics.clone(),
            executions.clone(),
            prechecks.clone(),
            directory.clone(),
            remote.clone(),
            bus.clone(),
        );

        Ok(Services {
            catalog,
            metrics,
            executions,
            workers,
            prechecks,
            directory,
            remote,
            bus,
            deployer,
            engine,
        })
    }
}
