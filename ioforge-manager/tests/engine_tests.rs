use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use ioforge_common::model::{
    CephConnection, AdminNode, ClusterConfig, Emitter, ExecutionId, ExecutionStatus, IoConfig,
    PrecheckPolicy, SshConfig, StorageBackend, StorageFamily, TestConfig, Worker, WorkerId,
    WorkerSelection, WorkerStatus, WorkloadConfig, WorkloadTool,
};
use ioforge_manager::bus::DisabledEventBus;
use ioforge_manager::config::EngineConfig;
use ioforge_manager::db;
use ioforge_manager::directory::WorkerDirectory;
use ioforge_manager::engine::{aggregate, ExecutionEngine, ExecutionRequest, ScaleRequest};
use ioforge_manager::remote::{CommandOutput, RemoteCommand, SshTarget};
use ioforge_manager::repo::{
    DbExecutionRepo, DbPrecheckRepo, DbWorkerRepo, ExecutionRecord, ExecutionRepo, PrecheckRepo,
    WorkerRepo,
};
use ioforge_manager::storage::{ConfigCatalog, MetricsStore};
use test_r::test;

test_r::enable!();

// Scripted remote endpoint: rules are matched in insertion order against the
// target host and a command substring; unmatched commands succeed with empty
// output.

struct Rule {
    host: Option<String>,
    command_contains: String,
    output: CommandOutput,
    delay: Option<Duration>,
}

#[derive(Default)]
struct MockRemote {
    rules: Mutex<Vec<Rule>>,
    log: Mutex<Vec<(String, String)>>,
}

impl MockRemote {
    fn new() -> Arc<Self> {
        Arc::new(MockRemote::default())
    }

    fn on(&self, command_contains: &str, output: CommandOutput) {
        self.rules.lock().unwrap().push(Rule {
            host: None,
            command_contains: command_contains.to_string(),
            output,
            delay: None,
        });
    }

    fn on_host(&self, host: &str, command_contains: &str, output: CommandOutput) {
        self.rules.lock().unwrap().push(Rule {
            host: Some(host.to_string()),
            command_contains: command_contains.to_string(),
            output,
            delay: None,
        });
    }

    fn on_delayed(&self, command_contains: &str, delay: Duration, output: CommandOutput) {
        self.rules.lock().unwrap().push(Rule {
            host: None,
            command_contains: command_contains.to_string(),
            output,
            delay: Some(delay),
        });
    }

    fn commands(&self) -> Vec<(String, String)> {
        self.log.lock().unwrap().clone()
    }

    fn count_matching(&self, needle: &str) -> usize {
        self.commands()
            .iter()
            .filter(|(_, command)| command.contains(needle))
            .count()
    }
}

fn ok(stdout: &str) -> CommandOutput {
    CommandOutput {
        exit_code: 0,
        stdout: stdout.to_string(),
        stderr: String::new(),
        error: None,
    }
}

fn fail(stderr: &str) -> CommandOutput {
    CommandOutput {
        exit_code: 1,
        stdout: String::new(),
        stderr: stderr.to_string(),
        error: None,
    }
}

#[async_trait]
impl RemoteCommand for MockRemote {
    async fn run(&self, target: &SshTarget, command: &str, _timeout: Duration) -> CommandOutput {
        self.log
            .lock()
            .unwrap()
            .push((target.host.clone(), command.to_string()));
        let matched = {
            let rules = self.rules.lock().unwrap();
            rules
                .iter()
                .find(|rule| {
                    rule.host
                        .as_deref()
                        .map_or(true, |host| host == target.host)
                        && command.contains(&rule.command_contains)
                })
                .map(|rule| (rule.output.clone(), rule.delay))
        };
        match matched {
            Some((output, Some(delay))) => {
                tokio::time::sleep(delay).await;
                output
            }
            Some((output, None)) => output,
            None => CommandOutput::default(),
        }
    }

    async fn put_file(
        &self,
        target: &SshTarget,
        local_path: &Path,
        remote_path: &str,
        _timeout: Duration,
    ) -> CommandOutput {
        self.log.lock().unwrap().push((
            target.host.clone(),
            format!("scp {} {remote_path}", local_path.display()),
        ));
        CommandOutput::default()
    }
}

fn ceph_status_json(health: &str) -> String {
    format!(
        r#"{{
          "health": {{"status": "{health}", "checks": {{}}}},
          "monmap": {{"mons": [{{}}, {{}}, {{}}]}},
          "quorum_names": ["a", "b", "c"],
          "quorum": [0, 1, 2],
          "osdmap": {{"num_osds": 3, "num_up_osds": 3, "num_in_osds": 3}},
          "pgmap": {{"num_pgs": 128, "pgs_by_state": [{{"state_name": "active+clean", "count": 128}}]}},
          "mgrmap": {{"active_name": "mgr-a", "standbys": [{{"name": "mgr-b"}}]}}
        }}"#
    )
}

fn fio_json(read_iops: f64) -> String {
    format!(
        r#"{{
          "fio version": "fio-3.35",
          "jobs": [{{
            "jobname": "job0",
            "read": {{
              "io_bytes": 104857600,
              "bw": {bw},
              "iops": {read_iops},
              "lat_ns": {{"min": 50000, "max": 2000000, "mean": 1000000.0}}
            }},
            "write": {{"io_bytes": 0, "bw": 0, "iops": 0, "lat_ns": {{"min": 0, "max": 0, "mean": 0}}}}
          }}]
        }}"#,
        bw = read_iops * 4.0,
    )
}

fn stub_healthy_cluster(remote: &MockRemote) {
    remote.on("-f json status", ok(&ceph_status_json("HEALTH_OK")));
    remote.on("-f json osd tree", ok(r#"{"nodes": []}"#));
    remote.on(
        "-f json df",
        ok(r#"{"stats": {"total_bytes": 1000000000000, "total_used_bytes": 400000000000, "total_avail_bytes": 600000000000}}"#),
    );
}

struct Harness {
    _dir: tempfile::TempDir,
    catalog: Arc<ConfigCatalog>,
    metrics: Arc<MetricsStore>,
    executions: Arc<dyn ExecutionRepo>,
    engine: Arc<ExecutionEngine>,
    remote: Arc<MockRemote>,
    workers: Vec<Worker>,
}

fn test_worker(id: &str) -> Worker {
    Worker {
        id: WorkerId::new(id),
        hostname: format!("{id}.lab"),
        ssh: SshConfig::default(),
        agent_port: 8080,
        tags: BTreeMap::new(),
    }
}

fn test_cluster() -> ClusterConfig {
    ClusterConfig {
        name: "lab".to_string(),
        storage_family: StorageFamily::Block,
        backend: StorageBackend::CephRbd,
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
        admin_node: Some(AdminNode {
            host: "admin.lab".to_string(),
            username: "root".to_string(),
            password: None,
            key_path: None,
            port: 22,
        }),
        tags: BTreeMap::new(),
    }
}

fn test_workload(configure: impl FnOnce(&mut WorkloadConfig)) -> WorkloadConfig {
    let mut workload = WorkloadConfig {
        name: "bench".to_string(),
        description: None,
        cluster_name: "lab".to_string(),
        storage_family: StorageFamily::Block,
        mount: None,
        tool: WorkloadTool::Fio,
        fill: None,
        io: IoConfig::default(),
        test: TestConfig {
            duration: Duration::from_secs(1),
            ..TestConfig::default()
        },
        workers: WorkerSelection::All,
        scaling: None,
        prechecks: PrecheckPolicy::default(),
        tags: BTreeMap::new(),
    };
    configure(&mut workload);
    workload
}

async fn harness(
    remote: Arc<MockRemote>,
    worker_count: usize,
    configure: impl FnOnce(&mut WorkloadConfig),
) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let catalog = Arc::new(ConfigCatalog::new(dir.path()));
    catalog.init().await.unwrap();
    let metrics = Arc::new(MetricsStore::new(dir.path()));

    let pool = db::create_memory_pool().await.unwrap();
    db::migrate(&pool).await.unwrap();
    let executions: Arc<dyn ExecutionRepo> = Arc::new(DbExecutionRepo::new(pool.clone()));
    let worker_repo: Arc<dyn WorkerRepo> = Arc::new(DbWorkerRepo::new(pool.clone()));
    let prechecks: Arc<dyn PrecheckRepo> = Arc::new(DbPrecheckRepo::new(pool));

    let workers: Vec<Worker> = (1..=worker_count)
        .map(|n| test_worker(&format!("w{n}")))
        .collect();
    catalog.save_workers(&workers).await.unwrap();
    for worker in &workers {
        worker_repo
            .upsert_status(&worker.id, &worker.hostname, WorkerStatus::Online, None, None)
            .await
            .unwrap();
    }
    catalog.create_cluster(&test_cluster()).await.unwrap();
    catalog
        .create_workload(&test_workload(configure), false)
        .await
        .unwrap();

    let directory = Arc::new(WorkerDirectory::new(catalog.clone(), worker_repo));
    let config = EngineConfig {
        fanout_limit: 8,
        run_grace: Duration::from_secs(8),
        command_timeout: Duration::from_secs(5),
        install_timeout: Duration::from_secs(5),
        aggregation_window: Duration::from_secs(1),
    };
    let engine = ExecutionEngine::new(
        config,
        catalog.clone(),
        metrics.clone(),
        executions.clone(),
        prechecks,
        directory,
        remote.clone(),
        Arc::new(DisabledEventBus),
    );

    Harness {
        _dir: dir,
        catalog,
        metrics,
        executions,
        engine,
        remote,
        workers,
    }
}

async fn wait_terminal(harness: &Harness, execution_id: &ExecutionId) -> ExecutionRecord {
    for _ in 0..600 {
        if let Some(record) = harness.executions.get(execution_id).await.unwrap() {
            if record.status().is_some_and(|s| s.is_terminal()) {
                return record;
            }
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("execution {execution_id} did not reach a terminal status");
}

async fn wait_engine_status(
    harness: &Harness,
    execution_id: &ExecutionId,
    wanted: ExecutionStatus,
) {
    for _ in 0..600 {
        if harness.engine.status(execution_id) == Some(wanted) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("execution {execution_id} never reached {wanted}");
}

fn request(run_prechecks: bool) -> ExecutionRequest {
    ExecutionRequest {
        workload_name: "bench".to_string(),
        display_name: None,
        run_prechecks,
    }
}

#[test]
async fn happy_path_aggregates_across_workers() {
    let remote = MockRemote::new();
    stub_healthy_cluster(&remote);
    remote.on_host("w1.lab", "fio --name", ok(&fio_json(1000.0)));
    remote.on_host("w2.lab", "fio --name", ok(&fio_json(2000.0)));
    remote.on_host("w3.lab", "fio --name", ok(&fio_json(3000.0)));

    let harness = harness(remote, 3, |_| {}).await;
    let execution_id = harness.engine.submit(request(true)).await.unwrap();
    let record = wait_terminal(&harness, &execution_id).await;

    assert_eq!(record.status(), Some(ExecutionStatus::Completed));
    assert_eq!(record.client_count, Some(3));
    assert!(record.started_at.is_some());
    assert!(record.completed_at.is_some());

    // One sample per worker, and the aggregate equals their sum.
    let mut per_worker_total = 0.0;
    for worker in &harness.workers {
        let samples = harness
            .metrics
            .read(
                &execution_id,
                &Emitter::Worker(worker.id.clone()),
                None,
                None,
            )
            .await
            .unwrap();
        assert!(!samples.is_empty(), "no samples for {}", worker.id);
        per_worker_total += samples.last().unwrap().iops.total();
    }
    let aggregate_stream = harness
        .metrics
        .read(&execution_id, &Emitter::Aggregate, None, None)
        .await
        .unwrap();
    assert!(!aggregate_stream.is_empty());
    let last = aggregate_stream.last().unwrap();
    assert_eq!(last.iops.total(), per_worker_total);
    assert_eq!(last.iops.total(), 6000.0);

    // Replaying the stored per-worker streams through the aggregator yields
    // the stored aggregate counters.
    let mut replayed = Vec::new();
    for worker in &harness.workers {
        let samples = harness
            .metrics
            .read(
                &execution_id,
                &Emitter::Worker(worker.id.clone()),
                None,
                None,
            )
            .await
            .unwrap();
        replayed.push(samples.into_iter().next_back().unwrap());
    }
    replayed.sort_by(|a, b| a.emitter.cmp(&b.emitter));
    let recomputed = aggregate::aggregate_samples(&execution_id, last.timestamp, &replayed);
    assert_eq!(recomputed.iops, last.iops);
    assert_eq!(recomputed.bandwidth, last.bandwidth);
    assert_eq!(recomputed.latency_us, last.latency_us);

    // summary.peak_iops is the max over aggregate samples.
    let summary_raw = tokio::fs::read_to_string(
        harness
            .catalog
            .execution_dir(&execution_id)
            .join("summary.json"),
    )
    .await
    .unwrap();
    let summary: serde_json::Value = serde_json::from_str(&summary_raw).unwrap();
    let peak = aggregate_stream
        .iter()
        .map(|s| s.iops.total())
        .fold(0.0_f64, f64::max);
    assert_eq!(summary["peak_iops"].as_f64().unwrap(), peak);
    assert_eq!(summary["worker_count"].as_u64().unwrap(), 3);
}

#[test]
async fn precheck_blocker_fails_before_any_benchmark() {
    let remote = MockRemote::new();
    remote.on("-f json status", ok(&ceph_status_json("HEALTH_ERR")));
    remote.on("-f json osd tree", ok(r#"{"nodes": []}"#));
    remote.on(
        "-f json df",
        ok(r#"{"stats": {"total_bytes": 1000, "total_used_bytes": 1, "total_avail_bytes": 999}}"#),
    );

    let harness = harness(remote, 3, |_| {}).await;
    let execution_id = harness.engine.submit(request(true)).await.unwrap();
    let record = wait_terminal(&harness, &execution_id).await;

    assert_eq!(record.status(), Some(ExecutionStatus::Failed));
    assert!(record.error_message.unwrap().contains("prechecks failed"));

    let report = harness
        .catalog
        .get_precheck_report(&execution_id)
        .await
        .unwrap()
        .expect("precheck report must be persisted");
    let cluster_blockers: Vec<&String> = report
        .blocking_issues
        .iter()
        .filter(|issue| issue.starts_with("[Cluster] cluster_health"))
        .collect();
    assert_eq!(cluster_blockers.len(), 1);

    // No benchmark command ever reached a worker.
    assert_eq!(harness.remote.count_matching("fio --name"), 0);
}

#[test]
async fn failed_tool_install_excludes_the_worker() {
    let remote = MockRemote::new();
    remote.on_host("w2.lab", "which fio", fail(""));
    remote.on_host("w2.lab", "install -y fio", fail("no package manager"));
    remote.on_host("w1.lab", "fio --name", ok(&fio_json(1000.0)));
    remote.on_host("w3.lab", "fio --name", ok(&fio_json(3000.0)));

    let harness = harness(remote, 3, |_| {}).await;
    let execution_id = harness.engine.submit(request(false)).await.unwrap();
    let record = wait_terminal(&harness, &execution_id).await;

    assert_eq!(record.status(), Some(ExecutionStatus::Completed));
    assert_eq!(record.client_count, Some(2));

    let w2_samples = harness
        .metrics
        .read(&execution_id, &Emitter::Worker(WorkerId::new("w2")), None, None)
        .await
        .unwrap();
    assert!(w2_samples.is_empty());

    // Fan-out isolation: the failure on w2 does not change its siblings'
    // results.
    let w1 = harness
        .metrics
        .read(&execution_id, &Emitter::Worker(WorkerId::new("w1")), None, None)
        .await
        .unwrap();
    assert_eq!(w1.last().unwrap().iops.total(), 1000.0);

    let summary_raw = tokio::fs::read_to_string(
        harness
            .catalog
            .execution_dir(&execution_id)
            .join("summary.json"),
    )
    .await
    .unwrap();
    let summary: serde_json::Value = serde_json::from_str(&summary_raw).unwrap();
    assert_eq!(summary["worker_count"].as_u64().unwrap(), 2);
}

#[test]
async fn stop_during_run_cancels_and_cleans_up() {
    let remote = MockRemote::new();
    remote.on_delayed("fio --name", Duration::from_secs(60), ok(&fio_json(1.0)));

    let harness = harness(remote, 3, |workload| {
        workload.test.duration = Duration::from_secs(5);
    })
    .await;
    let started = Instant::now();
    let execution_id = harness.engine.submit(request(false)).await.unwrap();
    wait_engine_status(&harness, &execution_id, ExecutionStatus::Running).await;

    tokio::time::sleep(Duration::from_millis(300)).await;
    harness.engine.stop(&execution_id).unwrap();
    let record = wait_terminal(&harness, &execution_id).await;

    assert_eq!(record.status(), Some(ExecutionStatus::Cancelled));
    assert!(started.elapsed() < Duration::from_secs(8));

    // Cleanup ran on every participant.
    let command_log = harness
        .catalog
        .get_command_log(&execution_id)
        .await
        .unwrap();
    for worker in &harness.workers {
        assert!(
            command_log
                .iter()
                .any(|entry| entry.worker_id == worker.id.0
                    && entry.description == "Clean up test files"),
            "no cleanup logged for {}",
            worker.id
        );
    }
}

#[test]
async fn scale_up_then_down_tracks_the_participant_set() {
    let remote = MockRemote::new();
    remote.on_delayed("fio --name", Duration::from_secs(3), ok(&fio_json(500.0)));

    let harness = harness(remote, 4, |workload| {
        workload.test.duration = Duration::from_secs(4);
        workload.workers = WorkerSelection::Count { count: 2 };
    })
    .await;
    let execution_id = harness.engine.submit(request(false)).await.unwrap();
    wait_engine_status(&harness, &execution_id, ExecutionStatus::Running).await;
    assert_eq!(harness.engine.participants(&execution_id).unwrap().len(), 2);

    // Scale up by one: the new member comes from online non-participants.
    let before: Vec<WorkerId> = harness.engine.participants(&execution_id).unwrap();
    let outcome = harness
        .engine
        .scale_up(
            &execution_id,
            ScaleRequest {
                count: Some(1),
                ids: Vec::new(),
            },
        )
        .await
        .unwrap();
    assert_eq!(outcome.changed.len(), 1);
    assert_eq!(outcome.participants, 3);
    assert!(!before.contains(&outcome.changed[0]));

    // Scale down that same member by id.
    let removed = outcome.changed[0].clone();
    let outcome = harness
        .engine
        .scale_down(
            &execution_id,
            ScaleRequest {
                count: None,
                ids: vec![removed.clone()],
            },
        )
        .await
        .unwrap();
    assert_eq!(outcome.changed, vec![removed.clone()]);
    assert_eq!(outcome.participants, 2);
    assert_eq!(harness.engine.participants(&execution_id).unwrap().len(), 2);

    let record = wait_terminal(&harness, &execution_id).await;
    assert_eq!(record.status(), Some(ExecutionStatus::Completed));

    let summary_raw = tokio::fs::read_to_string(
        harness
            .catalog
            .execution_dir(&execution_id)
            .join("summary.json"),
    )
    .await
    .unwrap();
    let summary: serde_json::Value = serde_json::from_str(&summary_raw).unwrap();
    let roster: Vec<String> = summary["workers"]
        .as_array()
        .unwrap()
        .iter()
        .map(|w| w.as_str().unwrap().to_string())
        .collect();
    assert!(!roster.contains(&removed.0));
}

#[test]
async fn draining_all_participants_fails_the_execution() {
    let remote = MockRemote::new();
    remote.on_delayed("fio --name", Duration::from_secs(60), ok(&fio_json(1.0)));

    let harness = harness(remote, 2, |workload| {
        workload.test.duration = Duration::from_secs(5);
    })
    .await;
    let execution_id = harness.engine.submit(request(false)).await.unwrap();
    wait_engine_status(&harness, &execution_id, ExecutionStatus::Running).await;

    harness
        .engine
        .scale_down(
            &execution_id,
            ScaleRequest {
                count: Some(2),
                ids: Vec::new(),
            },
        )
        .await
        .unwrap();

    let record = wait_terminal(&harness, &execution_id).await;
    assert_eq!(record.status(), Some(ExecutionStatus::Failed));
    assert_eq!(record.error_message.as_deref(), Some("drained"));
}

#[test]
async fn pause_and_resume_toggle_running() {
    let remote = MockRemote::new();
    remote.on_delayed("fio --name", Duration::from_secs(2), ok(&fio_json(100.0)));

    let harness = harness(remote, 2, |workload| {
        workload.test.duration = Duration::from_secs(3);
    })
    .await;
    let execution_id = harness.engine.submit(request(false)).await.unwrap();
    wait_engine_status(&harness, &execution_id, ExecutionStatus::Running).await;

    harness.engine.pause(&execution_id).unwrap();
    wait_engine_status(&harness, &execution_id, ExecutionStatus::Paused).await;

    harness.engine.resume(&execution_id).unwrap();
    wait_engine_status(&harness, &execution_id, ExecutionStatus::Running).await;

    let record = wait_terminal(&harness, &execution_id).await;
    assert_eq!(record.status(), Some(ExecutionStatus::Completed));
}

#[test]
async fn bus_outage_still_produces_a_complete_run() {
    // The harness wires the disabled bus: the engine must run everything over
    // direct remote commands and never pass through `paused` on its own.
    let remote = MockRemote::new();
    stub_healthy_cluster(&remote);
    remote.on("fio --name", ok(&fio_json(750.0)));

    let harness = harness(remote, 2, |_| {}).await;
    let execution_id = harness.engine.submit(request(true)).await.unwrap();
    let record = wait_terminal(&harness, &execution_id).await;

    assert_eq!(record.status(), Some(ExecutionStatus::Completed));
    let summary_path = harness
        .catalog
        .execution_dir(&execution_id)
        .join("summary.json");
    assert!(summary_path.exists());

    let aggregate_stream = harness
        .metrics
        .read(&execution_id, &Emitter::Aggregate, None, None)
        .await
        .unwrap();
    assert_eq!(aggregate_stream.last().unwrap().iops.total(), 1500.0);
}

#[test]
async fn unknown_workload_is_rejected_at_intake() {
    let remote = MockRemote::new();
    let harness = harness(remote, 1, |_| {}).await;
    let err = harness
        .engine
        .submit(ExecutionRequest {
            workload_name: "missing".to_string(),
            display_name: None,
            run_prechecks: false,
        })
        .await
        .unwrap_err();
    assert!(err.to_string().contains("workload 'missing' not found"));
}

#[test]
async fn snapshot_survives_workload_edits() {
    let remote = MockRemote::new();
    remote.on_delayed("fio --name", Duration::from_secs(2), ok(&fio_json(100.0)));

    let harness = harness(remote, 1, |workload| {
        workload.test.duration = Duration::from_secs(2);
    })
    .await;
    let execution_id = harness.engine.submit(request(false)).await.unwrap();
    wait_engine_status(&harness, &execution_id, ExecutionStatus::Running).await;

    // Edit the catalog entry while the execution is in flight.
    let mut edited = test_workload(|workload| {
        workload.io.read_percent = 0;
    });
    edited.test.duration = Duration::from_secs(2);
    harness.catalog.update_workload(&edited).await.unwrap();

    let snapshot = harness
        .catalog
        .load_execution_snapshot(&execution_id)
        .await
        .unwrap();
    assert_eq!(snapshot.io.read_percent, 100);

    let record = wait_terminal(&harness, &execution_id).await;
    assert_eq!(record.status(), Some(ExecutionStatus::Completed));
}
