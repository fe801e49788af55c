use ioforge_common::model::{
    IoConfig, PrecheckPolicy, StorageFamily, TestConfig, Worker, WorkerId, WorkerSelection,
    WorkloadConfig, WorkloadTool,
};

pub(crate) fn workload(name: &str) -> WorkloadConfig {
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
        tags: Default::default(),
    }
}

pub(crate) fn worker(id: &str) -> Worker {
    Worker {
        id: WorkerId::new(id),
        hostname: format!("{id}.lab"),
        ssh: Default::default(),
        agent_port: 8080,
        tags: Default::default(),
    }
}
