use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, Weak};
use std::time::Duration;

use chrono::Utc;
use futures::future::{AbortHandle, Abortable, BoxFuture};
use futures::stream::FuturesUnordered;
use futures::{FutureExt, StreamExt};
use ioforge_common::events::{channels, Event, EventKind};
use ioforge_common::model::{
    ClusterConfig, Emitter, ExecutionId, ExecutionPhase, ExecutionStatus, MetricSample,
    StorageFamily, Worker, WorkerExecutionState, WorkerId, WorkerRunState, WorkerSelection,
    WorkloadConfig, WorkloadTool,
};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::bus::EventBus;
use crate::config::EngineConfig;
use crate::directory::{DirectoryError, WorkerDirectory};
use crate::driver::{DriverError, DriverTimeouts, WorkloadDriver};
use crate::prechecks::{CephHealthChecker, PrecheckRunner};
use crate::remote::RemoteCommand;
use crate::repo::{
    ExecutionRecord, ExecutionRepo, ExecutionUpdate, PrecheckRecord, PrecheckRepo, RepoError,
};
use crate::storage::{CatalogError, ConfigCatalog, MetricsStore, MetricsStoreError};

pub mod aggregate;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("workload '{0}' not found")]
    UnknownWorkload(String),
    #[error("cluster '{0}' not found")]
    UnknownCluster(String),
    #[error("execution '{0}' not found")]
    UnknownExecution(ExecutionId),
    #[error("execution '{execution_id}' is not running")]
    NotRunning { execution_id: ExecutionId },
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("illegal status transition {from} -> {to}")]
    InvalidTransition {
        from: ExecutionStatus,
        to: ExecutionStatus,
    },
    #[error(transparent)]
    Repo(#[from] RepoError),
    #[error(transparent)]
    Catalog(#[from] CatalogError),
    #[error(transparent)]
    Metrics(#[from] MetricsStoreError),
    #[error(transparent)]
    Directory(#[from] DirectoryError),
}

#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    pub workload_name: String,
    pub display_name: Option<String>,
    pub run_prechecks: bool,
}

#[derive(Debug, Clone, Default)]
pub struct ScaleRequest {
    pub count: Option<usize>,
    pub ids: Vec<WorkerId>,
}

#[derive(Debug, Clone)]
pub struct ScaleOutcome {
    pub changed: Vec<WorkerId>,
    pub participants: usize,
}

enum ControlSignal {
    Stop,
    Pause,
    Resume,
    ScaleUp(Vec<Worker>),
    ScaleDown(Vec<WorkerId>),
}

#[derive(Clone)]
struct ActiveExecution {
    stop: Arc<AtomicBool>,
    pause: Arc<AtomicBool>,
    control: mpsc::UnboundedSender<ControlSignal>,
    participants: Arc<StdMutex<Vec<Worker>>>,
    status: Arc<StdMutex<ExecutionStatus>>,
}

enum TaskOutcome {
    Finished(Result<MetricSample, DriverError>),
    TimedOut,
    Aborted,
}

enum RunResult {
    Completed,
    Stopped,
    Failed(String),
}

struct RunContext {
    execution_id: ExecutionId,
    workload: WorkloadConfig,
    cluster: ClusterConfig,
    run_prechecks: bool,
    driver: Arc<WorkloadDriver>,
    stop: Arc<AtomicBool>,
    pause: Arc<AtomicBool>,
    participants: Arc<StdMutex<Vec<Worker>>>,
    status: Arc<StdMutex<ExecutionStatus>>,
    control_rx: Option<mpsc::UnboundedReceiver<ControlSignal>>,
    excluded: Vec<WorkerId>,
    worker_states: BTreeMap<WorkerId, WorkerExecutionState>,
    phase: ExecutionPhase,
    started_at: Option<chrono::DateTime<chrono::Utc>>,
}

impl RunContext {
    fn advance_phase(&mut self, phase: ExecutionPhase) {
        if phase > self.phase {
            self.phase = phase;
        }
    }

    fn mark_worker(&mut self, worker_id: &WorkerId, state: WorkerRunState, error: Option<String>) {
        let entry = self
            .worker_states
            .entry(worker_id.clone())
            .or_insert_with(|| WorkerExecutionState::pending(worker_id.clone()));
        entry.state = state;
        match state {
            WorkerRunState::Running => entry.started_at = Some(Utc::now()),
            WorkerRunState::Stopped | WorkerRunState::Failed => {
                entry.stopped_at = Some(Utc::now())
            }
            _ => {}
        }
        if error.is_some() {
            entry.error = error;
        }
    }
}

/// Drives a single execution through prechecks, prepare, run and cleanup, and
/// applies live control (stop/pause/resume/scale). The engine owns the driver
/// and the execution record; progress only ever flows outward.
pub struct ExecutionEngine {
    config: EngineConfig,
    catalog: Arc<ConfigCatalog>,
    metrics: Arc<MetricsStore>,
    executions: Arc<dyn ExecutionRepo>,
    prechecks: Arc<dyn PrecheckRepo>,
    directory: Arc<WorkerDirectory>,
    remote: Arc<dyn RemoteCommand>,
    bus: Arc<dyn EventBus>,
    active: StdMutex<HashMap<ExecutionId, ActiveExecution>>,
    self_ref: Weak<ExecutionEngine>,
}

impl ExecutionEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: EngineConfig,
        catalog: Arc<ConfigCatalog>,
        metrics: Arc<MetricsStore>,
        executions: Arc<dyn ExecutionRepo>,
        prechecks: Arc<dyn PrecheckRepo>,
        directory: Arc<WorkerDirectory>,
        remote: Arc<dyn RemoteCommand>,
        bus: Arc<dyn EventBus>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| ExecutionEngine {
            config,
            catalog,
            metrics,
            executions,
            prechecks,
            directory,
            remote,
            bus,
            active: StdMutex::new(HashMap::new()),
            self_ref: self_ref.clone(),
        })
    }

    /// Accept a request: load and validate the workload and cluster, allocate
    /// the execution record and schedule the run as a background task.
    pub async fn submit(&self, request: ExecutionRequest) -> Result<ExecutionId, EngineError> {
        let workload = self
            .catalog
            .get_workload(&request.workload_name)
            .await
            .map_err(|_| EngineError::UnknownWorkload(request.workload_name.clone()))?;
        workload
            .validate()
            .map_err(|e| EngineError::InvalidRequest(e.to_string()))?;
        let cluster = self
            .catalog
            .get_cluster(&workload.cluster_name)
            .await
            .map_err(|_| EngineError::UnknownCluster(workload.cluster_name.clone()))?;

        let execution_id = ExecutionId::generate();
        let name = request
            .display_name
            .unwrap_or_else(|| workload.name.clone());
        let paths = self
            .catalog
            .create_execution_dir(&execution_id, &workload)
            .await?;

        let mut record = ExecutionRecord::new(
            &execution_id,
            &name,
            workload.tool.as_str(),
            &cluster.backend.to_string(),
            &cluster.name,
        );
        record.config_path = Some(paths.config_path.display().to_string());
        record.metrics_path = Some(paths.metrics_dir.display().to_string());
        self.executions.insert(&record).await?;
        info!("created execution {execution_id} for workload '{}'", workload.name);

        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let active = ActiveExecution {
            stop: Arc::new(AtomicBool::new(false)),
            pause: Arc::new(AtomicBool::new(false)),
            control: control_tx,
            participants: Arc::new(StdMutex::new(Vec::new())),
            status: Arc::new(StdMutex::new(ExecutionStatus::Pending)),
        };
        let ctx = RunContext {
            execution_id: execution_id.clone(),
            workload,
            cluster,
            run_prechecks: request.run_prechecks,
            driver: Arc::new(WorkloadDriver::new(
                self.remote.clone(),
                DriverTimeouts {
                    command: self.config.command_timeout,
                    install: self.config.install_timeout,
                    run_grace: self.config.run_grace,
                },
            )),
            stop: active.stop.clone(),
            pause: active.pause.clone(),
            participants: active.participants.clone(),
            status: active.status.clone(),
            control_rx: Some(control_rx),
            excluded: Vec::new(),
            worker_states: BTreeMap::new(),
            phase: ExecutionPhase::Init,
            started_at: None,
        };
        self.active
            .lock()
            .expect("active map lock poisoned")
            .insert(execution_id.clone(), active);

        let engine = self
            .self_ref
            .upgrade()
            .expect("engine invoked after teardown");
        tokio::spawn(async move {
            engine.run_execution(ctx).await;
        });
        Ok(execution_id)
    }

    async fn run_execution(self: Arc<Self>, mut ctx: RunContext) {
        let execution_id = ctx.execution_id.clone();
        if let Err(e) = self.drive(&mut ctx).await {
            // Controller-internal error: never swallowed, execution fails
            // with a generic reason.
            error!("execution {execution_id} aborted by internal error: {e}");
            let _ = self
                .executions
                .update_status(
                    &execution_id,
                    ExecutionStatus::Failed,
                    ExecutionUpdate {
                        completed_at: Some(Utc::now().to_rfc3339()),
                        error_message: Some(format!("internal error: {e}")),
                        ..ExecutionUpdate::default()
                    },
                )
                .await;
        }
        self.active
            .lock()
            .expect("active map lock poisoned")
            .remove(&execution_id);
    }

    async fn drive(&self, ctx: &mut RunContext) -> Result<(), EngineError> {
        // Prechecks
        if ctx.run_prechecks && ctx.workload.prechecks.enabled {
            if self.stop_checkpoint(ctx).await? {
                return Ok(());
            }
            self.transition(ctx, ExecutionStatus::Prechecks, ExecutionUpdate::default())
                .await?;
            ctx.advance_phase(ExecutionPhase::Precheck);

            let inventory = self.catalog.load_workers().await?;
            let runner = PrecheckRunner::new(
                self.remote.clone(),
                ctx.cluster.clone(),
                inventory,
                ctx.workload.prechecks.clone(),
            );
            let report = runner.run(&ctx.execution_id).await;
            let report_path = self.catalog.save_precheck_report(&report).await?;
            self.prechecks
                .insert(&PrecheckRecord::from_report(
                    &report,
                    &report_path.display().to_string(),
                ))
                .await?;

            if !report.can_proceed {
                let reason = format!(
                    "prechecks failed: {}",
                    report.blocking_issues.join("; ")
                );
                self.fail(ctx, reason).await?;
                return Ok(());
            }
            for warning in &report.warnings {
                self.log(ctx, &format!("precheck warning: {warning}")).await;
            }
            ctx.excluded = report.excluded_workers.clone();
        }
        if self.stop_checkpoint(ctx).await? {
            return Ok(());
        }

        // Prepare
        self.transition(ctx, ExecutionStatus::Preparing, ExecutionUpdate::default())
            .await?;
        ctx.advance_phase(ExecutionPhase::Prepare);
        let survivors = self.prepare_phase(ctx).await?;
        if survivors.is_empty() {
            self.persist_command_log(ctx).await;
            self.fail(ctx, "no workers available for execution".to_string())
                .await?;
            return Ok(());
        }
        {
            let mut participants = ctx.participants.lock().expect("participants lock poisoned");
            *participants = survivors.clone();
        }
        for worker in &survivors {
            ctx.mark_worker(&worker.id, WorkerRunState::Preparing, None);
        }
        self.executions
            .update_status(
                &ctx.execution_id,
                ExecutionStatus::Preparing,
                ExecutionUpdate {
                    client_count: Some(survivors.len() as i64),
                    ..ExecutionUpdate::default()
                },
            )
            .await?;
        if self.stop_checkpoint(ctx).await? {
            return Ok(());
        }

        // Run
        let started_at = Utc::now();
        ctx.started_at = Some(started_at);
        self.transition(
            ctx,
            ExecutionStatus::Running,
            ExecutionUpdate {
                started_at: Some(started_at.to_rfc3339()),
                ..ExecutionUpdate::default()
            },
        )
        .await?;
        if ctx.workload.test.ramp_time > Duration::ZERO {
            ctx.advance_phase(ExecutionPhase::RampUp);
        }
        ctx.advance_phase(ExecutionPhase::SteadyState);

        let result = if ctx.workload.tool == WorkloadTool::FillCluster {
            self.run_fill_phase(ctx).await
        } else {
            self.run_benchmark_phase(ctx).await
        };

        ctx.advance_phase(ExecutionPhase::RampDown);
        self.cleanup_phase(ctx).await;

        let completed_at = Utc::now();
        let duration = ctx
            .started_at
            .map(|start| (completed_at - start).num_seconds())
            .unwrap_or(0);
        let terminal_update = ExecutionUpdate {
            completed_at: Some(completed_at.to_rfc3339()),
            duration_seconds: Some(duration),
            ..ExecutionUpdate::default()
        };

        match result {
            RunResult::Completed => {
                // A pause that was never resumed does not outlive the run.
                if self.current_status(ctx) == ExecutionStatus::Paused {
                    self.transition(ctx, ExecutionStatus::Running, ExecutionUpdate::default())
                        .await?;
                }
                self.transition(ctx, ExecutionStatus::Completed, terminal_update)
                    .await?;
                info!("execution completed: {}", ctx.execution_id);
            }
            RunResult::Stopped => {
                self.transition(ctx, ExecutionStatus::Stopping, ExecutionUpdate::default())
                    .await?;
                self.transition(ctx, ExecutionStatus::Cancelled, terminal_update)
                    .await?;
                info!("execution cancelled: {}", ctx.execution_id);
            }
            RunResult::Failed(reason) => {
                self.log(ctx, &format!("execution failed: {reason}")).await;
                self.transition(
                    ctx,
                    ExecutionStatus::Failed,
                    ExecutionUpdate {
                        error_message: Some(reason),
                        ..terminal_update
                    },
                )
                .await?;
            }
        }
        Ok(())
    }

    /// Compute the active set (inventory minus precheck exclusions, narrowed
    /// by the selection policy) and bring it to ready: tool install, then for
    /// file workloads credentials and mounts. Workers failing a step are
    /// dropped without aborting their siblings.
    async fn prepare_phase(&self, ctx: &mut RunContext) -> Result<Vec<Worker>, EngineError> {
        let inventory = self.catalog.load_workers().await?;
        let mut selected = select_workers(&inventory, &ctx.excluded, &ctx.workload.workers);
        info!(
            "prepare: {} of {} workers selected for {}",
            selected.len(),
            inventory.len(),
            ctx.execution_id
        );

        if let Some(binary) = ctx.workload.tool.binary() {
            let results = self
                .fanout_prepare(ctx, &selected, move |driver, worker, workload, _cluster| {
                    let tool = workload.tool;
                    async move { driver.ensure_tool(&worker, tool).await.map(|_| ()) }.boxed()
                })
                .await;
            selected = self
                .drop_failures(ctx, selected, results, &format!("{binary} install"))
                .await;
        }

        if ctx.workload.storage_family == StorageFamily::File {
            if let Some(mount) = ctx.workload.mount.clone() {
                if ctx.cluster.backend.is_ceph() {
                    let repo_url = ctx
                        .cluster
                        .ceph
                        .as_ref()
                        .and_then(|c| c.repo_url.clone());
                    let ceph_common = self
                        .fanout_prepare(ctx, &selected, move |driver, worker, _workload, _cluster| {
                            let repo_url = repo_url.clone();
                            async move {
                                driver
                                    .install_ceph_common(&worker, repo_url.as_deref())
                                    .await
                            }
                            .boxed()
                        })
                        .await;
                    for (worker_id, result) in &ceph_common {
                        if let Err(e) = result {
                            self.log(ctx, &format!("ceph-common install failed on {worker_id}: {e}"))
                                .await;
                        }
                    }

                    let credentials = self
                        .fanout_prepare(ctx, &selected, |driver, worker, _workload, cluster| {
                            async move { driver.push_ceph_credentials(&worker, &cluster).await }
                                .boxed()
                        })
                        .await;
                    for (worker_id, result) in &credentials {
                        if let Err(e) = result {
                            self.log(ctx, &format!("credential push failed on {worker_id}: {e}"))
                                .await;
                        }
                    }
                }

                let mount_cfg = mount.clone();
                let mounts = self
                    .fanout_prepare(ctx, &selected, move |driver, worker, _workload, cluster| {
                        let mount = mount_cfg.clone();
                        async move { driver.mount(&worker, &mount, &cluster).await }.boxed()
                    })
                    .await;
                selected = self.drop_failures(ctx, selected, mounts, "mount").await;
            }
        }

        Ok(selected)
    }

    /// Bounded fan-out of one prepare step over the current selection.
    async fn fanout_prepare<F>(
        &self,
        ctx: &RunContext,
        workers: &[Worker],
        step: F,
    ) -> Vec<(WorkerId, Result<(), DriverError>)>
    where
        F: Fn(
            Arc<WorkloadDriver>,
            Worker,
            Arc<WorkloadConfig>,
            Arc<ClusterConfig>,
        ) -> BoxFuture<'static, Result<(), DriverError>>,
    {
        let workload = Arc::new(ctx.workload.clone());
        let cluster = Arc::new(ctx.cluster.clone());
        futures::stream::iter(workers.iter().cloned())
            .map(|worker| {
                let worker_id = worker.id.clone();
                let fut = step(
                    ctx.driver.clone(),
                    worker,
                    workload.clone(),
                    cluster.clone(),
                );
                async move { (worker_id, fut.await) }
            })
            .buffer_unordered(self.config.fanout_limit.max(1))
            .collect()
            .await
    }

    async fn drop_failures(
        &self,
        ctx: &mut RunContext,
        selected: Vec<Worker>,
        results: Vec<(WorkerId, Result<(), DriverError>)>,
        step: &str,
    ) -> Vec<Worker> {
        let mut failed: HashSet<WorkerId> = HashSet::new();
        for (worker_id, result) in results {
            if let Err(e) = result {
                warn!("{step} failed on {worker_id}: {e}");
                self.log(ctx, &format!("{step} failed on {worker_id}: {e}"))
                    .await;
                ctx.mark_worker(&worker_id, WorkerRunState::Failed, Some(e.to_string()));
                failed.insert(worker_id);
            }
        }
        selected
            .into_iter()
            .filter(|worker| !failed.contains(&worker.id))
            .collect()
    }

    /// Fan the benchmark out to every participant with a single deadline and
    /// consume control signals while awaiting results. A failure on one
    /// worker never aborts its siblings.
    async fn run_benchmark_phase(&self, ctx: &mut RunContext) -> RunResult {
        let deadline = ctx.workload.test.duration + self.config.run_grace;
        let workload = Arc::new(ctx.workload.clone());
        let mut control_rx = ctx.control_rx.take().expect("control receiver taken twice");

        if !self.bus.is_enabled() {
            warn!(
                "event bus unavailable for {}; driving workers over remote commands only",
                ctx.execution_id
            );
        }
        let listener = self.spawn_metrics_listener(ctx).await;

        let mut tasks: FuturesUnordered<BoxFuture<'static, (WorkerId, TaskOutcome)>> =
            FuturesUnordered::new();
        let mut aborts: HashMap<WorkerId, AbortHandle> = HashMap::new();

        let starters = ctx.participants.lock().expect("participants lock poisoned").clone();
        for worker in starters {
            self.publish_control(
                ctx,
                &worker.id,
                Event::execution_start(
                    ctx.execution_id.clone(),
                    &worker.id,
                    ctx.workload.clone(),
                ),
            )
            .await;
            ctx.mark_worker(&worker.id, WorkerRunState::Running, None);
            spawn_worker_task(
                ctx.driver.clone(),
                worker,
                workload.clone(),
                ctx.execution_id.clone(),
                deadline,
                &mut tasks,
                &mut aborts,
            );
        }

        let overall = tokio::time::sleep(deadline);
        tokio::pin!(overall);

        let mut results: BTreeMap<WorkerId, MetricSample> = BTreeMap::new();
        let mut failures: BTreeMap<WorkerId, String> = BTreeMap::new();
        let mut stopped = false;
        let mut drained = false;
        let mut store_failure: Option<String> = None;

        loop {
            tokio::select! {
                maybe = tasks.next() => match maybe {
                    Some((worker_id, outcome)) => {
                        aborts.remove(&worker_id);
                        match outcome {
                            TaskOutcome::Finished(Ok(sample)) => {
                                if let Err(e) = self.metrics.append(&sample).await {
                                    // A store failure forfeits the run but
                                    // keeps the metrics already persisted.
                                    store_failure =
                                        Some(format!("metric store write failed: {e}"));
                                    break;
                                }
                                ctx.mark_worker(&worker_id, WorkerRunState::Stopped, None);
                                results.insert(worker_id, sample);
                            }
                            TaskOutcome::Finished(Err(e)) => {
                                self.log(ctx, &format!("benchmark failed on {worker_id}: {e}")).await;
                                ctx.mark_worker(&worker_id, WorkerRunState::Failed, Some(e.to_string()));
                                failures.insert(worker_id, e.to_string());
                            }
                            TaskOutcome::TimedOut => {
                                let message = format!(
                                    "benchmark exceeded {}s deadline",
                                    deadline.as_secs()
                                );
                                self.log(ctx, &format!("{worker_id}: {message}")).await;
                                ctx.mark_worker(&worker_id, WorkerRunState::Failed, Some(message.clone()));
                                failures.insert(worker_id, message);
                            }
                            TaskOutcome::Aborted => {
                                ctx.mark_worker(&worker_id, WorkerRunState::Stopped, None);
                            }
                        }
                        if tasks.is_empty() {
                            break;
                        }
                    }
                    None => break,
                },
                Some(signal) = control_rx.recv() => {
                    match signal {
                        ControlSignal::Stop => {
                            stopped = true;
                            let participants = ctx.participants.lock().expect("participants lock poisoned").clone();
                            for worker in &participants {
                                self.publish_control(
                                    ctx,
                                    &worker.id,
                                    Event::execution_stop(ctx.execution_id.clone(), &worker.id),
                                ).await;
                            }
                            for (_, handle) in aborts.drain() {
                                handle.abort();
                            }
                            break;
                        }
                        ControlSignal::Pause => {
                            // Stop wins over pause.
                            if ctx.pause.load(Ordering::Relaxed)
                                && !ctx.stop.load(Ordering::Relaxed)
                                && self.current_status(ctx) == ExecutionStatus::Running
                            {
                                let participants = ctx.participants.lock().expect("participants lock poisoned").clone();
                                for worker in &participants {
                                    self.publish_control(
                                        ctx,
                                        &worker.id,
                                        Event::execution_pause(ctx.execution_id.clone(), &worker.id),
                                    ).await;
                                }
                                let _ = self
                                    .transition(ctx, ExecutionStatus::Paused, ExecutionUpdate::default())
                                    .await;
                            }
                        }
                        ControlSignal::Resume => {
                            if self.current_status(ctx) == ExecutionStatus::Paused {
                                let participants = ctx.participants.lock().expect("participants lock poisoned").clone();
                                for worker in &participants {
                                    self.publish_control(
                                        ctx,
                                        &worker.id,
                                        Event::execution_resume(ctx.execution_id.clone(), &worker.id),
                                    ).await;
                                }
                                let _ = self
                                    .transition(ctx, ExecutionStatus::Running, ExecutionUpdate::default())
                                    .await;
                            }
                        }
                        ControlSignal::ScaleUp(workers) => {
                            for worker in workers {
                                info!("scale-up: adding {} to {}", worker.id, ctx.execution_id);
                                self.publish_control(
                                    ctx,
                                    &worker.id,
                                    Event::execution_start(
                                        ctx.execution_id.clone(),
                                        &worker.id,
                                        ctx.workload.clone(),
                                    ),
                                ).await;
                                ctx.mark_worker(&worker.id, WorkerRunState::Running, None);
                                spawn_worker_task(
                                    ctx.driver.clone(),
                                    worker,
                                    workload.clone(),
                                    ctx.execution_id.clone(),
                                    deadline,
                                    &mut tasks,
                                    &mut aborts,
                                );
                            }
                        }
                        ControlSignal::ScaleDown(worker_ids) => {
                            for worker_id in &worker_ids {
                                info!("scale-down: removing {worker_id} from {}", ctx.execution_id);
                                self.publish_control(
                                    ctx,
                                    worker_id,
                                    Event::execution_stop(ctx.execution_id.clone(), worker_id),
                                ).await;
                                if let Some(handle) = aborts.remove(worker_id) {
                                    handle.abort();
                                }
                                ctx.mark_worker(worker_id, WorkerRunState::Stopped, None);
                            }
                            let remaining = ctx.participants.lock().expect("participants lock poisoned").len();
                            if remaining == 0 {
                                drained = true;
                                break;
                            }
                        }
                    }
                },
                _ = &mut overall => {
                    for (worker_id, handle) in aborts.drain() {
                        handle.abort();
                        let message = "cancelled at fan-out deadline".to_string();
                        ctx.mark_worker(&worker_id, WorkerRunState::Failed, Some(message.clone()));
                        failures.insert(worker_id, message);
                    }
                    break;
                }
            }
        }

        if let Some(handle) = listener {
            handle.abort();
        }
        ctx.control_rx = Some(control_rx);

        if let Some(reason) = store_failure {
            return RunResult::Failed(reason);
        }

        if !results.is_empty() {
            // BTreeMap iteration keeps the aggregate deterministic.
            let samples: Vec<MetricSample> = results.values().cloned().collect();
            let aggregate =
                aggregate::aggregate_samples(&ctx.execution_id, Utc::now(), &samples);
            if let Err(e) = self.metrics.append(&aggregate).await {
                return RunResult::Failed(format!("metric store write failed: {e}"));
            }
            let _ = self
                .executions
                .update_status(
                    &ctx.execution_id,
                    self.current_status(ctx),
                    ExecutionUpdate {
                        total_iops: Some(aggregate.iops.total() as i64),
                        avg_latency_us: Some(aggregate.latency_us.avg),
                        total_throughput_mbps: Some(aggregate.bandwidth.total_mbps()),
                        ..ExecutionUpdate::default()
                    },
                )
                .await;
        }

        if stopped || ctx.stop.load(Ordering::Relaxed) {
            RunResult::Stopped
        } else if drained {
            RunResult::Failed("drained".to_string())
        } else if results.is_empty() && !failures.is_empty() {
            RunResult::Failed(format!(
                "all workers failed: {}",
                failures
                    .iter()
                    .map(|(id, e)| format!("{id}: {e}"))
                    .collect::<Vec<_>>()
                    .join("; ")
            ))
        } else {
            RunResult::Completed
        }
    }

    /// Fill workloads run write rounds until the effective bytes (raw bytes
    /// times the pool replication factor, on top of what the cluster already
    /// holds) reach the capacity target.
    async fn run_fill_phase(&self, ctx: &mut RunContext) -> RunResult {
        let Some(fill) = ctx.workload.fill.clone() else {
            return RunResult::Failed("fill workload without fill configuration".to_string());
        };

        let (capacity, mut effective) = self.cluster_capacity(ctx).await;
        let replication = u64::from(fill.replication_factor.unwrap_or(3));
        let target_bytes = capacity / 100 * u64::from(fill.target_fill_percent);
        if capacity == 0 {
            warn!(
                "cluster capacity unknown for {}; running a single fill round",
                ctx.execution_id
            );
        }

        let mut round: u32 = 0;
        loop {
            if ctx.stop.load(Ordering::Relaxed) {
                return RunResult::Stopped;
            }
            round += 1;
            let participants = ctx
                .participants
                .lock()
                .expect("participants lock poisoned")
                .clone();
            let cluster = Arc::new(ctx.cluster.clone());
            let execution_id = ctx.execution_id.clone();
            let fill_config = Arc::new(fill.clone());

            let results: Vec<(WorkerId, Result<crate::driver::FillRound, DriverError>)> =
                futures::stream::iter(participants)
                    .map(|worker| {
                        let driver = ctx.driver.clone();
                        let cluster = cluster.clone();
                        let fill = fill_config.clone();
                        let execution_id = execution_id.clone();
                        async move {
                            let result = driver
                                .fill_round(&worker, &fill, &cluster, &execution_id, round)
                                .await;
                            (worker.id.clone(), result)
                        }
                    })
                    .buffer_unordered(self.config.fanout_limit.max(1))
                    .collect()
                    .await;

            let mut round_bytes = 0u64;
            let mut successes = 0usize;
            for (worker_id, result) in results {
                match result {
                    Ok(outcome) => {
                        successes += 1;
                        round_bytes += outcome.bytes_written;
                        if let Some(sample) = outcome.sample {
                            let _ = self.metrics.append(&sample).await;
                        }
                    }
                    Err(e) => {
                        self.log(ctx, &format!("fill round {round} failed on {worker_id}: {e}"))
                            .await;
                        ctx.mark_worker(&worker_id, WorkerRunState::Failed, Some(e.to_string()));
                    }
                }
            }
            if successes == 0 {
                return RunResult::Failed(format!("fill round {round} failed on all workers"));
            }

            effective += round_bytes * replication;
            info!(
                "fill round {round}: {} raw this round, {} effective of {} target",
                ioforge_common::util::format_size(round_bytes),
                ioforge_common::util::format_size(effective),
                ioforge_common::util::format_size(target_bytes),
            );

            // RBD and object fills are single-shot per worker.
            if capacity == 0
                || effective >= target_bytes
                || !matches!(fill.target, ioforge_common::model::FillTarget::Cephfs)
            {
                break;
            }
        }
        RunResult::Completed
    }

    async fn cluster_capacity(&self, ctx: &RunContext) -> (u64, u64) {
        if let Some(ceph) = ctx.cluster.ceph.clone() {
            let checker = CephHealthChecker::new(
                self.remote.clone(),
                ceph,
                ctx.cluster.admin_node.clone(),
            );
            match checker.get_cluster_state().await {
                Ok(state) => return (state.total_bytes, state.used_bytes),
                Err(e) => warn!("failed to query cluster capacity: {e}"),
            }
        }
        (0, 0)
    }

    /// Persist the command log, release mounts, clean test files and write
    /// the summary. Runs on every path out of the run phase.
    async fn cleanup_phase(&self, ctx: &mut RunContext) {
        ctx.advance_phase(ExecutionPhase::Cleanup);
        self.persist_command_log(ctx).await;

        let participants = ctx
            .participants
            .lock()
            .expect("participants lock poisoned")
            .clone();
        let mount = ctx
            .workload
            .mount
            .clone()
            .filter(|_| ctx.workload.storage_family == StorageFamily::File);

        if let Some(mount) = &mount {
            if mount.auto_unmount {
                let mount_point = mount.mount_point.clone();
                futures::stream::iter(participants.clone())
                    .map(|worker| {
                        let driver = ctx.driver.clone();
                        let mount_point = mount_point.clone();
                        async move { driver.unmount(&worker, &mount_point).await }
                    })
                    .buffer_unordered(self.config.fanout_limit.max(1))
                    .collect::<Vec<()>>()
                    .await;
            }
        }
        let mount_point = mount.as_ref().map(|m| m.mount_point.clone());
        let auto_unmount = mount.as_ref().map(|m| m.auto_unmount).unwrap_or(false);
        futures::stream::iter(participants.clone())
            .map(|worker| {
                let driver = ctx.driver.clone();
                let mount_point = mount_point.clone();
                async move {
                    driver
                        .cleanup(&worker, mount_point.as_deref(), auto_unmount)
                        .await
                }
            })
            .buffer_unordered(self.config.fanout_limit.max(1))
            .collect::<Vec<()>>()
            .await;

        // The cleanup pass may have issued more commands.
        self.persist_command_log(ctx).await;

        let aggregate_stream = self
            .metrics
            .read(&ctx.execution_id, &Emitter::Aggregate, None, None)
            .await
            .unwrap_or_default();
        let roster: Vec<WorkerId> = participants.iter().map(|w| w.id.clone()).collect();
        let summary =
            aggregate::summarize(&ctx.execution_id, Utc::now(), &aggregate_stream, roster);
        if let Err(e) = self.catalog.save_summary(&ctx.execution_id, &summary).await {
            warn!("failed to save summary for {}: {e}", ctx.execution_id);
        }
        ctx.advance_phase(ExecutionPhase::Done);
    }

    async fn persist_command_log(&self, ctx: &RunContext) {
        let mut log = self.pending_command_log(ctx);
        if log.is_empty() {
            return;
        }
        // Append to whatever an earlier pass already persisted.
        if let Ok(mut existing) = self.catalog.get_command_log(&ctx.execution_id).await {
            existing.append(&mut log);
            log = existing;
        }
        if let Err(e) = self.catalog.save_command_log(&ctx.execution_id, &log).await {
            warn!("failed to save command log for {}: {e}", ctx.execution_id);
        }
    }

    fn pending_command_log(&self, ctx: &RunContext) -> Vec<crate::driver::CommandLogEntry> {
        ctx.driver.take_command_log()
    }

    async fn spawn_metrics_listener(
        &self,
        ctx: &RunContext,
    ) -> Option<tokio::task::JoinHandle<()>> {
        let pattern = channels::metrics(&ctx.execution_id);
        let mut rx = match self.bus.subscribe(&[pattern]).await {
            Ok(rx) => rx,
            Err(e) => {
                warn!("bus subscription failed: {e}; continuing in direct mode");
                return None;
            }
        };
        let metrics = self.metrics.clone();
        let execution_id = ctx.execution_id.clone();
        let window = self.config.aggregation_window;
        Some(tokio::spawn(async move {
            let mut buffer: Vec<MetricSample> = Vec::new();
            let mut ticker = tokio::time::interval(window);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    maybe = rx.recv() => match maybe {
                        Some(event) => {
                            if let EventKind::MetricsReport { sample } = event.kind {
                                let sample = *sample;
                                if sample.execution_id == execution_id
                                    && matches!(sample.emitter, Emitter::Worker(_))
                                {
                                    let _ = metrics.append(&sample).await;
                                    buffer.push(sample);
                                }
                            }
                        }
                        None => break,
                    },
                    _ = ticker.tick() => {
                        if !buffer.is_empty() {
                            buffer.sort_by(|a, b| a.emitter.cmp(&b.emitter));
                            let aggregate = aggregate::aggregate_samples(
                                &execution_id,
                                Utc::now(),
                                &buffer,
                            );
                            let _ = metrics.append(&aggregate).await;
                            buffer.clear();
                        }
                    }
                }
            }
        }))
    }

    async fn publish_control(&self, _ctx: &RunContext, worker_id: &WorkerId, event: Event) {
        if let Err(e) = self.bus.publish(&channels::worker(worker_id), &event).await {
            warn!("failed to publish control event to {worker_id}: {e}");
        }
    }

    fn current_status(&self, ctx: &RunContext) -> ExecutionStatus {
        *ctx.status.lock().expect("status lock poisoned")
    }

    async fn transition(
        &self,
        ctx: &RunContext,
        next: ExecutionStatus,
        update: ExecutionUpdate,
    ) -> Result<(), EngineError> {
        {
            let mut status = ctx.status.lock().expect("status lock poisoned");
            if !status.can_transition_to(next) {
                return Err(EngineError::InvalidTransition {
                    from: *status,
                    to: next,
                });
            }
            *status = next;
        }
        info!("execution {} -> {next}", ctx.execution_id);
        self.executions
            .update_status(&ctx.execution_id, next, update)
            .await?;
        Ok(())
    }

    async fn fail(&self, ctx: &RunContext, reason: String) -> Result<(), EngineError> {
        warn!("execution {} failed: {reason}", ctx.execution_id);
        self.log(ctx, &format!("execution failed: {reason}")).await;
        self.transition(
            ctx,
            ExecutionStatus::Failed,
            ExecutionUpdate {
                completed_at: Some(Utc::now().to_rfc3339()),
                error_message: Some(reason),
                ..ExecutionUpdate::default()
            },
        )
        .await
    }

    /// If a stop was requested, short-circuit to cleanup and finish as
    /// cancelled. Returns whether the execution was terminated here.
    async fn stop_checkpoint(&self, ctx: &mut RunContext) -> Result<bool, EngineError> {
        if !ctx.stop.load(Ordering::Relaxed) {
            return Ok(false);
        }
        self.transition(ctx, ExecutionStatus::Stopping, ExecutionUpdate::default())
            .await?;
        self.cleanup_phase(ctx).await;
        self.transition(
            ctx,
            ExecutionStatus::Cancelled,
            ExecutionUpdate {
                completed_at: Some(Utc::now().to_rfc3339()),
                ..ExecutionUpdate::default()
            },
        )
        .await?;
        info!("execution cancelled before run: {}", ctx.execution_id);
        Ok(true)
    }

    async fn log(&self, ctx: &RunContext, message: &str) {
        if let Err(e) = self
            .catalog
            .append_execution_log(&ctx.execution_id, message)
            .await
        {
            warn!("failed to append execution log: {e}");
        }
    }

    // Control surface

    fn active_entry(&self, execution_id: &ExecutionId) -> Result<ActiveExecution, EngineError> {
        self.active
            .lock()
            .expect("active map lock poisoned")
            .get(execution_id)
            .cloned()
            .ok_or_else(|| EngineError::UnknownExecution(execution_id.clone()))
    }

    pub fn status(&self, execution_id: &ExecutionId) -> Option<ExecutionStatus> {
        self.active
            .lock()
            .expect("active map lock poisoned")
            .get(execution_id)
            .map(|entry| *entry.status.lock().expect("status lock poisoned"))
    }

    pub fn participants(&self, execution_id: &ExecutionId) -> Option<Vec<WorkerId>> {
        self.active
            .lock()
            .expect("active map lock poisoned")
            .get(execution_id)
            .map(|entry| {
                entry
                    .participants
                    .lock()
                    .expect("participants lock poisoned")
                    .iter()
                    .map(|w| w.id.clone())
                    .collect()
            })
    }

    /// Request a stop; the next fan-out checkpoint short-circuits to cleanup
    /// and the execution terminates as cancelled.
    pub fn stop(&self, execution_id: &ExecutionId) -> Result<(), EngineError> {
        let entry = self.active_entry(execution_id)?;
        entry.stop.store(true, Ordering::Relaxed);
        let _ = entry.control.send(ControlSignal::Stop);
        info!("stop signal sent for execution: {execution_id}");
        Ok(())
    }

    pub fn pause(&self, execution_id: &ExecutionId) -> Result<(), EngineError> {
        let entry = self.active_entry(execution_id)?;
        entry.pause.store(true, Ordering::Relaxed);
        let _ = entry.control.send(ControlSignal::Pause);
        info!("pause signal sent for execution: {execution_id}");
        Ok(())
    }

    pub fn resume(&self, execution_id: &ExecutionId) -> Result<(), EngineError> {
        let entry = self.active_entry(execution_id)?;
        entry.pause.store(false, Ordering::Relaxed);
        let _ = entry.control.send(ControlSignal::Resume);
        info!("resume signal sent for execution: {execution_id}");
        Ok(())
    }

    /// Add currently-online, non-participating workers to a running
    /// execution. No-op for executions not in `running`.
    pub async fn scale_up(
        &self,
        execution_id: &ExecutionId,
        request: ScaleRequest,
    ) -> Result<ScaleOutcome, EngineError> {
        let entry = self.active_entry(execution_id)?;
        if *entry.status.lock().expect("status lock poisoned") != ExecutionStatus::Running {
            let participants = entry
                .participants
                .lock()
                .expect("participants lock poisoned")
                .len();
            return Ok(ScaleOutcome {
                changed: Vec::new(),
                participants,
            });
        }
        if request.count.is_none() && request.ids.is_empty() {
            return Err(EngineError::InvalidRequest(
                "scale-up requires a count or explicit worker ids".to_string(),
            ));
        }

        let available = self.directory.available().await?;
        let current: HashSet<WorkerId> = entry
            .participants
            .lock()
            .expect("participants lock poisoned")
            .iter()
            .map(|w| w.id.clone())
            .collect();
        let candidates: Vec<Worker> = available
            .into_iter()
            .filter(|info| !current.contains(&info.worker.id))
            .map(|info| info.worker)
            .collect();

        let chosen: Vec<Worker> = if !request.ids.is_empty() {
            candidates
                .into_iter()
                .filter(|w| request.ids.contains(&w.id))
                .collect()
        } else {
            candidates
                .into_iter()
                .take(request.count.unwrap_or(0))
                .collect()
        };

        let participants = {
            let mut participants = entry
                .participants
                .lock()
                .expect("participants lock poisoned");
            participants.extend(chosen.clone());
            participants.len()
        };
        let changed: Vec<WorkerId> = chosen.iter().map(|w| w.id.clone()).collect();
        if !chosen.is_empty() {
            let _ = entry.control.send(ControlSignal::ScaleUp(chosen));
        }
        Ok(ScaleOutcome {
            changed,
            participants,
        })
    }

    /// Remove workers from a running execution, defaulting to the tail of
    /// the participant set. The run continues as long as one worker remains;
    /// draining it entirely fails the execution at the next checkpoint.
    pub async fn scale_down(
        &self,
        execution_id: &ExecutionId,
        request: ScaleRequest,
    ) -> Result<ScaleOutcome, EngineError> {
        let entry = self.active_entry(execution_id)?;
        if *entry.status.lock().expect("status lock poisoned") != ExecutionStatus::Running {
            let participants = entry
                .participants
                .lock()
                .expect("participants lock poisoned")
                .len();
            return Ok(ScaleOutcome {
                changed: Vec::new(),
                participants,
            });
        }
        if request.count.is_none() && request.ids.is_empty() {
            return Err(EngineError::InvalidRequest(
                "scale-down requires a count or explicit worker ids".to_string(),
            ));
        }

        let (to_remove, remaining) = {
            let mut participants = entry
                .participants
                .lock()
                .expect("participants lock poisoned");
            let to_remove: Vec<WorkerId> = if !request.ids.is_empty() {
                participants
                    .iter()
                    .map(|w| w.id.clone())
                    .filter(|id| request.ids.contains(id))
                    .collect()
            } else {
                let count = request.count.unwrap_or(0).min(participants.len());
                participants
                    .iter()
                    .rev()
                    .take(count)
                    .map(|w| w.id.clone())
                    .collect()
            };
            participants.retain(|w| !to_remove.contains(&w.id));
            (to_remove, participants.len())
        };

        if !to_remove.is_empty() {
            let _ = entry
                .control
                .send(ControlSignal::ScaleDown(to_remove.clone()));
        }
        Ok(ScaleOutcome {
            changed: to_remove,
            participants: remaining,
        })
    }
}

/// Inventory minus precheck exclusions, narrowed by the selection policy.
fn select_workers(
    inventory: &[Worker],
    excluded: &[WorkerId],
    selection: &WorkerSelection,
) -> Vec<Worker> {
    let available: Vec<Worker> = inventory
        .iter()
        .filter(|w| !excluded.contains(&w.id))
        .cloned()
        .collect();
    match selection {
        WorkerSelection::All => available,
        WorkerSelection::Count { count } => available.into_iter().take(*count).collect(),
        WorkerSelection::Specific { ids } => available
            .into_iter()
            .filter(|w| ids.contains(&w.id))
            .collect(),
    }
}

fn spawn_worker_task(
    driver: Arc<WorkloadDriver>,
    worker: Worker,
    workload: Arc<WorkloadConfig>,
    execution_id: ExecutionId,
    deadline: Duration,
    tasks: &mut FuturesUnordered<BoxFuture<'static, (WorkerId, TaskOutcome)>>,
    aborts: &mut HashMap<WorkerId, AbortHandle>,
) {
    let (abort_handle, registration) = AbortHandle::new_pair();
    let worker_id = worker.id.clone();
    let task = async move {
        let id = worker.id.clone();
        let inner = async {
            match tokio::time::timeout(deadline, driver.run(&worker, &workload, &execution_id))
                .await
            {
                Ok(result) => TaskOutcome::Finished(result),
                Err(_) => TaskOutcome::TimedOut,
            }
        };
        match Abortable::new(inner, registration).await {
            Ok(outcome) => (id, outcome),
            Err(_aborted) => (id, TaskOutcome::Aborted),
        }
    }
    .boxed();
    tasks.push(task);
    aborts.insert(worker_id, abort_handle);
}

#[cfg(test)]
mod tests {
    use test_r::test;

    use super::*;
    use crate::testutil;

    #[test]
    fn selection_applies_exclusions_then_policy() {
        let inventory: Vec<Worker> = ["w1", "w2", "w3", "w4"]
            .iter()
            .map(|id| testutil::worker(id))
            .collect();
        let excluded = vec![WorkerId::new("w2")];

        let all = select_workers(&inventory, &excluded, &WorkerSelection::All);
        assert_eq!(
            all.iter().map(|w| w.id.0.as_str()).collect::<Vec<_>>(),
            vec!["w1", "w3", "w4"]
        );

        let head = select_workers(&inventory, &excluded, &WorkerSelection::Count { count: 2 });
        assert_eq!(
            head.iter().map(|w| w.id.0.as_str()).collect::<Vec<_>>(),
            vec!["w1", "w3"]
        );

        let specific = select_workers(
            &inventory,
            &excluded,
            &WorkerSelection::Specific {
                ids: vec![WorkerId::new("w2"), WorkerId::new("w4")],
            },
        );
        assert_eq!(
            specific.iter().map(|w| w.id.0.as_str()).collect::<Vec<_>>(),
            vec!["w4"]
        );
    }
}
