//! Everything the checks need from the cluster, expressed as the [`ClusterApi`] capability set.

pub mod kubectl;
pub mod quantity;

use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("Command `{command}` failed: {message}")]
    CommandFailed { command: String, message: String },
    #[error(transparent)]
    IoError(#[from] std::io::Error),
    #[error("Deserialization error: {0}")]
    DeserializationError(String),
    #[error("Invalid resource quantity `{0}`")]
    InvalidQuantity(String),
    #[error("Pod {name} ended in phase {phase}")]
    PodFailed { name: String, phase: String },
    #[error("Timed out after {} waiting for {what}", format_timeout(.timeout))]
    Timeout { what: String, timeout: Duration },
}

fn format_timeout(timeout: &Duration) -> String {
    humantime::format_duration(*timeout).to_string()
}

impl From<serde_json::error::Error> for ClusterError {
    fn from(e: serde_json::error::Error) -> Self {
        Self::DeserializationError(e.to_string())
    }
}

pub type ClusterResult<T> = Result<T, ClusterError>;
pub type ClusterFuture<T> = Pin<Box<dyn Future<Output = ClusterResult<T>>>>;

/// Integral amount of a resource.
pub type Quantity = i64;

/// Name of a countable resource, e.g. `nvidia.com/gpu`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceName(String);

impl ResourceName {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for ResourceName {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ResourceName {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

pub type ResourceList = BTreeMap<ResourceName, Quantity>;

/// Snapshot of a single node, as reported by the cluster at the time of listing.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct NodeRecord {
    pub name: String,
    pub schedulable: bool,
    pub os_image: String,
    /// Total amount of resources.
    pub capacity: ResourceList,
    /// Amount of resources available for pods.
    pub allocatable: ResourceList,
}

impl NodeRecord {
    pub fn capacity_of(&self, resource: &ResourceName) -> Option<Quantity> {
        self.capacity.get(resource).copied()
    }

    pub fn allocatable_of(&self, resource: &ResourceName) -> Option<Quantity> {
        self.allocatable.get(resource).copied()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct PodRecord {
    pub namespace: String,
    pub name: String,
    /// Node the pod was scheduled to, if any.
    pub node_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DaemonSetRef {
    pub namespace: String,
    pub name: String,
}

impl Display for DaemonSetRef {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Single-container pod that requests `units` of `resource` and is never restarted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkloadSpec {
    pub namespace: String,
    pub name: String,
    pub container: String,
    pub image: String,
    pub resource: ResourceName,
    pub units: Quantity,
}

/// Point-in-time resource consumption of one container.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ContainerUsage {
    pub namespace: String,
    pub pod: String,
    pub container: String,
    pub cpu_cores: f64,
    pub memory_working_set_bytes: u64,
    pub memory_rss_bytes: u64,
}

impl ContainerUsage {
    /// Identifier used in usage summaries (`<namespace>/<pod>/<container>`).
    pub fn key(&self) -> String {
        format!("{}/{}/{}", self.namespace, self.pod, self.container)
    }
}

/// Operations that the checks perform against the cluster.
///
/// Implementations are expected to be read-only except for `create_*`; no call is retried by the
/// callers.
pub trait ClusterApi {
    fn list_nodes(&self) -> ClusterFuture<Vec<NodeRecord>>;

    /// Creates the daemon set described by the manifest at `manifest_url` in `namespace`.
    fn create_daemon_set(&self, namespace: &str, manifest_url: &str) -> ClusterFuture<DaemonSetRef>;

    /// Waits until all pods of the daemon set exist and returns them.
    fn wait_for_controlled_pods(&self, daemon_set: &DaemonSetRef) -> ClusterFuture<Vec<PodRecord>>;

    fn create_pod(&self, spec: &WorkloadSpec) -> ClusterFuture<PodRecord>;

    /// Resolves once the pod has succeeded. A failed pod or an expired `timeout` is an error.
    fn wait_for_pod_success(
        &self,
        namespace: &str,
        name: &str,
        timeout: Duration,
    ) -> ClusterFuture<()>;

    /// Current usage of all containers running on `node`.
    fn node_usage(&self, node: &str) -> ClusterFuture<Vec<ContainerUsage>>;
}
