use std::cell::{Ref, RefCell, RefMut};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::future::Future;
use std::ops::Deref;
use std::rc::Rc;
use std::time::Duration;

use tokio::task::LocalSet;

use crate::cluster::{
    ClusterApi, ClusterError, ClusterFuture, ContainerUsage, DaemonSetRef, NodeRecord, PodRecord,
    Quantity, ResourceName, WorkloadSpec,
};

pub fn init_logging() {
    let _ = env_logger::Builder::default()
        .filter(None, log::LevelFilter::Debug)
        .is_test(true)
        .try_init();
}

/// Runs `fut` inside a [`LocalSet`], so that it can spawn non-`Send` tasks.
pub async fn run_local<F: Future>(fut: F) -> F::Output {
    LocalSet::new().run_until(fut).await
}

/// Shared, mutable state that can be observed by the test while a fake holds another handle.
#[derive(Default, Debug)]
pub struct WrappedRcRefCell<T> {
    inner: Rc<RefCell<T>>,
}

impl<T> WrappedRcRefCell<T> {
    pub fn wrap(t: T) -> Self {
        WrappedRcRefCell {
            inner: Rc::new(RefCell::new(t)),
        }
    }

    #[track_caller]
    pub fn get(&self) -> Ref<'_, T> {
        self.inner.borrow()
    }

    #[track_caller]
    pub fn get_mut(&self) -> RefMut<'_, T> {
        self.inner.borrow_mut()
    }
}

impl<T> Clone for WrappedRcRefCell<T> {
    fn clone(&self) -> Self {
        WrappedRcRefCell {
            inner: self.inner.clone(),
        }
    }
}

pub fn gpu() -> ResourceName {
    ResourceName::new(crate::NVIDIA_GPU_RESOURCE_NAME)
}

pub struct NodeBuilder {
    node: NodeRecord,
}

impl NodeBuilder {
    pub fn new(name: &str) -> Self {
        Self {
            node: NodeRecord {
                name: name.to_string(),
                schedulable: true,
                os_image: "Container-Optimized OS from Google".to_string(),
                ..Default::default()
            },
        }
    }

    pub fn capacity(mut self, value: Quantity) -> Self {
        self.node.capacity.insert(gpu(), value);
        self
    }

    pub fn allocatable(mut self, value: Quantity) -> Self {
        self.node.allocatable.insert(gpu(), value);
        self
    }

    /// GPU capacity and allocatable amount set to `value`.
    pub fn gpus(self, value: Quantity) -> Self {
        self.capacity(value).allocatable(value)
    }

    pub fn resource(mut self, name: &str, capacity: Quantity, allocatable: Quantity) -> Self {
        self.node.capacity.insert(name.into(), capacity);
        self.node.allocatable.insert(name.into(), allocatable);
        self
    }

    pub fn unschedulable(mut self) -> Self {
        self.node.schedulable = false;
        self
    }

    pub fn build(self) -> NodeRecord {
        self.node
    }
}

pub fn pod(namespace: &str, name: &str, node: &str) -> PodRecord {
    PodRecord {
        namespace: namespace.to_string(),
        name: name.to_string(),
        node_name: Some(node.to_string()),
    }
}

pub fn usage(pod: &str, container: &str, cpu_cores: f64, memory: u64) -> ContainerUsage {
    ContainerUsage {
        namespace: "gpucheck".to_string(),
        pod: pod.to_string(),
        container: container.to_string(),
        cpu_cores,
        memory_working_set_bytes: memory,
        memory_rss_bytes: memory / 2,
    }
}

pub const INSTALLER_NAME: &str = "nvidia-driver-installer";

#[derive(Debug)]
pub struct FakeClusterState {
    /// Node inventory returned by `list_nodes`.
    pub nodes: Vec<NodeRecord>,
    /// Inventories that replace `nodes`, one per `list_nodes` call.
    pub node_updates: VecDeque<Vec<NodeRecord>>,
    pub fail_list_nodes: bool,
    pub list_nodes_calls: u32,

    pub created_daemon_sets: Vec<(String, String)>,
    pub fail_create_daemon_set: bool,
    /// Pods of known daemon sets, keyed by `<namespace>/<name>`.
    pub controlled_pods: BTreeMap<String, Vec<PodRecord>>,

    pub created_workloads: Vec<WorkloadSpec>,
    /// Creation indices of workloads that end in the `Failed` phase.
    pub failing_workloads: BTreeSet<usize>,
    pub workload_duration: Duration,

    pub usage: BTreeMap<String, Vec<ContainerUsage>>,
    pub failing_usage_nodes: BTreeSet<String>,
    pub usage_delay: Duration,
    pub usage_calls: u32,
}

impl Default for FakeClusterState {
    fn default() -> Self {
        Self {
            nodes: vec![],
            node_updates: Default::default(),
            fail_list_nodes: false,
            list_nodes_calls: 0,
            created_daemon_sets: vec![],
            fail_create_daemon_set: false,
            controlled_pods: Default::default(),
            created_workloads: vec![],
            failing_workloads: Default::default(),
            workload_duration: Duration::from_secs(10),
            usage: Default::default(),
            failing_usage_nodes: Default::default(),
            usage_delay: Duration::ZERO,
            usage_calls: 0,
        }
    }
}

/// In-memory [`ClusterApi`] that lets tests script the cluster behavior.
#[derive(Clone, Default)]
pub struct FakeCluster(WrappedRcRefCell<FakeClusterState>);

impl Deref for FakeCluster {
    type Target = WrappedRcRefCell<FakeClusterState>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl FakeCluster {
    pub fn with_nodes(nodes: Vec<NodeRecord>) -> Self {
        let cluster = Self::default();
        cluster.get_mut().nodes = nodes;
        cluster
    }

    pub fn set_nodes(&self, nodes: Vec<NodeRecord>) {
        let mut state = self.get_mut();
        state.nodes = nodes;
        state.node_updates.clear();
    }

    /// Registers the driver installer pods, one per given node.
    pub fn set_installer_pods(&self, namespace: &str, nodes: &[&str]) {
        let pods = nodes
            .iter()
            .enumerate()
            .map(|(index, node)| pod(namespace, &format!("{INSTALLER_NAME}-{index}"), node))
            .collect();
        self.get_mut()
            .controlled_pods
            .insert(format!("{namespace}/{INSTALLER_NAME}"), pods);
    }

    pub fn workload_names(&self) -> Vec<String> {
        self.get()
            .created_workloads
            .iter()
            .map(|spec| spec.name.clone())
            .collect()
    }
}

fn fake_failure(message: &str) -> ClusterError {
    ClusterError::CommandFailed {
        command: "fake".to_string(),
        message: message.to_string(),
    }
}

impl ClusterApi for FakeCluster {
    fn list_nodes(&self) -> ClusterFuture<Vec<NodeRecord>> {
        let cluster = self.clone();
        Box::pin(async move {
            let mut state = cluster.get_mut();
            state.list_nodes_calls += 1;
            if state.fail_list_nodes {
                return Err(fake_failure("cannot list nodes"));
            }
            if let Some(nodes) = state.node_updates.pop_front() {
                state.nodes = nodes;
            }
            Ok(state.nodes.clone())
        })
    }

    fn create_daemon_set(
        &self,
        namespace: &str,
        manifest_url: &str,
    ) -> ClusterFuture<DaemonSetRef> {
        let cluster = self.clone();
        let namespace = namespace.to_string();
        let manifest_url = manifest_url.to_string();
        Box::pin(async move {
            let mut state = cluster.get_mut();
            if state.fail_create_daemon_set {
                return Err(fake_failure("cannot create daemon set"));
            }
            state
                .created_daemon_sets
                .push((namespace.clone(), manifest_url));
            Ok(DaemonSetRef {
                namespace,
                name: INSTALLER_NAME.to_string(),
            })
        })
    }

    fn wait_for_controlled_pods(
        &self,
        daemon_set: &DaemonSetRef,
    ) -> ClusterFuture<Vec<PodRecord>> {
        let cluster = self.clone();
        let key = daemon_set.to_string();
        Box::pin(async move {
            let pods = cluster.get().controlled_pods.get(&key).cloned();
            pods.ok_or_else(|| fake_failure(&format!("daemon set {key} not found")))
        })
    }

    fn create_pod(&self, spec: &WorkloadSpec) -> ClusterFuture<PodRecord> {
        let cluster = self.clone();
        let spec = spec.clone();
        Box::pin(async move {
            let record = PodRecord {
                namespace: spec.namespace.clone(),
                name: spec.name.clone(),
                node_name: None,
            };
            cluster.get_mut().created_workloads.push(spec);
            Ok(record)
        })
    }

    fn wait_for_pod_success(
        &self,
        namespace: &str,
        name: &str,
        timeout: Duration,
    ) -> ClusterFuture<()> {
        let cluster = self.clone();
        let namespace = namespace.to_string();
        let name = name.to_string();
        Box::pin(async move {
            let (index, duration) = {
                let state = cluster.get();
                let index = state
                    .created_workloads
                    .iter()
                    .position(|spec| spec.namespace == namespace && spec.name == name)
                    .ok_or_else(|| fake_failure(&format!("pod {namespace}/{name} not found")))?;
                (index, state.workload_duration)
            };
            if duration > timeout {
                tokio::time::sleep(timeout).await;
                return Err(ClusterError::Timeout {
                    what: format!("pod {namespace}/{name}"),
                    timeout,
                });
            }
            tokio::time::sleep(duration).await;
            if cluster.get().failing_workloads.contains(&index) {
                return Err(ClusterError::PodFailed {
                    name,
                    phase: "Failed".to_string(),
                });
            }
            Ok(())
        })
    }

    fn node_usage(&self, node: &str) -> ClusterFuture<Vec<ContainerUsage>> {
        let cluster = self.clone();
        let node = node.to_string();
        Box::pin(async move {
            let delay = {
                let mut state = cluster.get_mut();
                state.usage_calls += 1;
                state.usage_delay
            };
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            let state = cluster.get();
            if state.failing_usage_nodes.contains(&node) {
                return Err(fake_failure(&format!("kubelet on {node} is unreachable")));
            }
            Ok(state.usage.get(&node).cloned().unwrap_or_default())
        })
    }
}
