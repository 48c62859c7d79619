use std::fmt::{Display, Formatter};
use std::time::Duration;

use thiserror::Error;

use crate::cluster::ClusterError;

#[derive(Debug, Error)]
pub enum GpuCheckError {
    #[error("Cluster API error: {0}")]
    Collaborator(#[from] ClusterError),
    #[error(
        "Resource {resource} did not appear on all schedulable nodes within {}\nLast observed state:\n{observed}",
        format_timeout(.timeout)
    )]
    ReadinessTimeout {
        resource: String,
        timeout: Duration,
        observed: String,
    },
    #[error("{} workload(s) did not succeed:\n{}", .0.len(), format_workload_errors(.0))]
    WorkloadFailure(Vec<WorkloadError>),
    #[error("Cannot {operation} usage gatherer in state {state}")]
    InvalidGathererState {
        operation: &'static str,
        state: &'static str,
    },
    #[error("Error: {0}")]
    GenericError(String),
}

/// Terminal failure of a single launched workload.
#[derive(Debug)]
pub struct WorkloadError {
    pub name: String,
    pub error: ClusterError,
}

impl Display for WorkloadError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.name, self.error)
    }
}

fn format_timeout(timeout: &Duration) -> String {
    humantime::format_duration(*timeout).to_string()
}

fn format_workload_errors(errors: &[WorkloadError]) -> String {
    errors
        .iter()
        .map(|e| format!("  {e}"))
        .collect::<Vec<_>>()
        .join("\n")
}
