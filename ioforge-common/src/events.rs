use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::{ExecutionId, MetricSample, WorkerId, WorkerStatus, WorkloadConfig};

pub const MANAGER_SOURCE: &str = "manager";

/// Pub/sub channel names shared by the controller and the agents.
pub mod channels {
    use crate::model::{ExecutionId, WorkerId};

    /// Worker -> controller control topic.
    pub const MANAGER: &str = "ctrl:manager";
    /// Controller -> all-workers topic.
    pub const BROADCAST: &str = "ctrl:broadcast";

    /// Per-worker control topic.
    pub fn worker(worker_id: &WorkerId) -> String {
        format!("ctrl:workers:{worker_id}")
    }

    /// Worker -> controller sample stream for one execution.
    pub fn metrics(execution_id: &ExecutionId) -> String {
        format!("metrics:{execution_id}")
    }
}

/// The closed set of event payloads. The dotted `type` string discriminates
/// the variant on the wire; free-form payload fields are not allowed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum EventKind {
    #[serde(rename = "agent.register")]
    AgentRegister {
        hostname: String,
        version: String,
    },
    #[serde(rename = "agent.heartbeat")]
    AgentHeartbeat {
        status: WorkerStatus,
        #[serde(default)]
        busy: bool,
    },
    #[serde(rename = "agent.disconnect")]
    AgentDisconnect,
    #[serde(rename = "execution.prepare")]
    ExecutionPrepare {
        workload: Box<WorkloadConfig>,
    },
    #[serde(rename = "execution.start")]
    ExecutionStart {
        workload: Box<WorkloadConfig>,
    },
    #[serde(rename = "execution.stop")]
    ExecutionStop,
    #[serde(rename = "execution.pause")]
    ExecutionPause,
    #[serde(rename = "execution.resume")]
    ExecutionResume,
    #[serde(rename = "status.update")]
    StatusUpdate {
        status: String,
        #[serde(default)]
        message: String,
    },
    #[serde(rename = "status.error")]
    StatusError {
        error: String,
    },
    #[serde(rename = "metrics.report")]
    MetricsReport {
        sample: Box<MetricSample>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    #[serde(flatten)]
    pub kind: EventKind,
    pub timestamp: DateTime<Utc>,
    pub source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_id: Option<ExecutionId>,
}

impl Event {
    pub fn new(kind: EventKind, source: impl Into<String>) -> Self {
        Event {
            kind,
            timestamp: Utc::now(),
            source: source.into(),
            target: None,
            execution_id: None,
        }
    }

    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    pub fn with_execution(mut self, execution_id: ExecutionId) -> Self {
        self.execution_id = Some(execution_id);
        self
    }

    pub fn execution_start(execution_id: ExecutionId, target: &WorkerId, workload: WorkloadConfig) -> Self {
        Event::new(
            EventKind::ExecutionStart {
                workload: Box::new(workload),
            },
            MANAGER_SOURCE,
        )
        .with_target(target.to_string())
        .with_execution(execution_id)
    }

    pub fn execution_stop(execution_id: ExecutionId, target: &WorkerId) -> Self {
        Event::new(EventKind::ExecutionStop, MANAGER_SOURCE)
            .with_target(target.to_string())
            .with_execution(execution_id)
    }

    pub fn execution_pause(execution_id: ExecutionId, target: &WorkerId) -> Self {
        Event::new(EventKind::ExecutionPause, MANAGER_SOURCE)
            .with_target(target.to_string())
            .with_execution(execution_id)
    }

    pub fn execution_resume(execution_id: ExecutionId, target: &WorkerId) -> Self {
        Event::new(EventKind::ExecutionResume, MANAGER_SOURCE)
            .with_target(target.to_string())
            .with_execution(execution_id)
    }

    pub fn metrics_report(sample: MetricSample) -> Self {
        let execution_id = sample.execution_id.clone();
        let source = sample.emitter.to_string();
        Event::new(
            EventKind::MetricsReport {
                sample: Box::new(sample),
            },
            source,
        )
        .with_target(MANAGER_SOURCE)
        .with_execution(execution_id)
    }
}

#[cfg(test)]
mod tests {
    use test_r::test;

    use super::*;
    use crate::model::Emitter;

    #[test]
    fn channel_names_follow_the_contract() {
        assert_eq!(channels::MANAGER, "ctrl:manager");
        assert_eq!(channels::BROADCAST, "ctrl:broadcast");
        assert_eq!(
            channels::worker(&WorkerId::new("w1")),
            "ctrl:workers:w1"
        );
        assert_eq!(
            channels::metrics(&ExecutionId::from("exec_a")),
            "metrics:exec_a"
        );
    }

    #[test]
    fn events_carry_a_dotted_type_discriminator() {
        let event = Event::execution_stop(ExecutionId::from("exec_a"), &WorkerId::new("w1"));
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "execution.stop");
        assert_eq!(json["source"], "manager");
        assert_eq!(json["target"], "w1");
        assert_eq!(json["execution_id"], "exec_a");
    }

    #[test]
    fn metrics_event_round_trips() {
        let sample = MetricSample::empty(
            ExecutionId::from("exec_a"),
            Emitter::Worker(WorkerId::new("w1")),
            Utc::now(),
        );
        let event = Event::metrics_report(sample);
        let json = serde_json::to_string(&event).unwrap();
        let back: Event = serde_json::from_str(&json).unwrap();
        assert_eq!(back, event);
        match back.kind {
            EventKind::MetricsReport { sample } => {
                assert_eq!(sample.emitter, Emitter::Worker(WorkerId::new("w1")));
            }
            other => panic!("unexpected event kind: {other:?}"),
        }
    }

    #[test]
    fn payloadless_events_parse_without_payload_field() {
        let raw = r#"{"type":"execution.resume","timestamp":"2025-01-01T00:00:00Z","source":"manager"}"#;
        let event: Event = serde_json::from_str(raw).unwrap();
        assert_eq!(event.kind, EventKind::ExecutionResume);
    }
}
