use std::fmt::{Display, Formatter};

use chrono::Utc;
use serde::{Deserialize, Serialize};

pub mod cluster;
pub mod execution;
pub mod metrics;
pub mod precheck;
pub mod worker;
pub mod workload;

pub use cluster::*;
pub use execution::*;
pub use metrics::*;
pub use precheck::*;
pub use worker::*;
pub use workload::*;

#[derive(Debug, thiserror::Error)]
pub enum ModelError {
    #[error("invalid {kind} configuration: {reason}")]
    Invalid { kind: &'static str, reason: String },
    #[error("missing {0} connection details")]
    MissingConnection(&'static str),
}

impl ModelError {
    pub fn invalid(kind: &'static str, reason: impl Into<String>) -> Self {
        ModelError::Invalid {
            kind,
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WorkerId(pub String);

impl WorkerId {
    pub fn new(id: impl Into<String>) -> Self {
        WorkerId(id.into())
    }
}

impl Display for WorkerId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for WorkerId {
    fn from(value: &str) -> Self {
        WorkerId(value.to_string())
    }
}

/// Execution identifiers embed a UTC timestamp so that lexicographic order is
/// creation order.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ExecutionId(pub String);

impl ExecutionId {
    pub fn generate() -> Self {
        let timestamp = Utc::now().format("%Y%m%d_%H%M%S");
        let suffix = &uuid::Uuid::new_v4().simple().to_string()[..8];
        ExecutionId(format!("exec_{timestamp}_{suffix}"))
    }
}

impl Display for ExecutionId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ExecutionId {
    fn from(value: &str) -> Self {
        ExecutionId(value.to_string())
    }
}
