use std::cell::RefCell;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::{Output, Stdio};
use std::rc::Rc;
use std::time::Duration;

use bstr::ByteSlice;
use serde::Deserialize;
use serde_json::json;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::cluster::quantity::parse_quantity;
use crate::cluster::{
    ClusterApi, ClusterError, ClusterFuture, ClusterResult, ContainerUsage, DaemonSetRef,
    NodeRecord, PodRecord, ResourceList, ResourceName, WorkloadSpec,
};
use crate::common::poll::{PollError, PollOutcome, poll_until};

/// How often are pod and daemon set states re-read while waiting for them.
const DEFAULT_STATUS_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// How long to wait until all pods of a daemon set are scheduled.
const DEFAULT_CONTROLLED_PODS_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// [`ClusterApi`] implemented on top of the `kubectl` binary.
///
/// Every operation spawns `kubectl` with JSON output and parses the result, so the client works
/// with whatever cluster the current kubeconfig context points to.
pub struct KubectlClient {
    kubectl: Rc<PathBuf>,
    status_poll_interval: Duration,
    controlled_pods_timeout: Duration,
}

impl KubectlClient {
    pub fn new(kubectl: PathBuf) -> Self {
        Self {
            kubectl: Rc::new(kubectl),
            status_poll_interval: DEFAULT_STATUS_POLL_INTERVAL,
            controlled_pods_timeout: DEFAULT_CONTROLLED_PODS_TIMEOUT,
        }
    }

    pub fn with_status_polling(
        mut self,
        interval: Duration,
        controlled_pods_timeout: Duration,
    ) -> Self {
        self.status_poll_interval = interval;
        self.controlled_pods_timeout = controlled_pods_timeout;
        self
    }
}

impl ClusterApi for KubectlClient {
    fn list_nodes(&self) -> ClusterFuture<Vec<NodeRecord>> {
        let kubectl = self.kubectl.clone();
        Box::pin(async move {
            let output = run_kubectl(&kubectl, &["get", "nodes", "-o", "json"], None).await?;
            parse_node_list(&output)
        })
    }

    fn create_daemon_set(
        &self,
        namespace: &str,
        manifest_url: &str,
    ) -> ClusterFuture<DaemonSetRef> {
        let kubectl = self.kubectl.clone();
        let namespace = namespace.to_string();
        let manifest_url = manifest_url.to_string();
        Box::pin(async move {
            // Render the manifest locally first, so that its namespace can be replaced
            let rendered = run_kubectl(
                &kubectl,
                &[
                    "create",
                    "--dry-run=client",
                    "-f",
                    &manifest_url,
                    "-o",
                    "json",
                ],
                None,
            )
            .await?;
            let (manifest, daemon_set) = place_daemon_set(&rendered, &namespace)?;
            apply_manifest(&kubectl, &namespace_manifest(&namespace)).await?;
            apply_manifest(&kubectl, &manifest).await?;
            Ok(daemon_set)
        })
    }

    fn wait_for_controlled_pods(
        &self,
        daemon_set: &DaemonSetRef,
    ) -> ClusterFuture<Vec<PodRecord>> {
        let kubectl = self.kubectl.clone();
        let daemon_set = daemon_set.clone();
        let interval = self.status_poll_interval;
        let timeout = self.controlled_pods_timeout;
        Box::pin(async move {
            let found = RefCell::new(vec![]);
            let result = poll_until(
                || {
                    let (kubectl, daemon_set, found) = (&kubectl, &daemon_set, &found);
                    async move {
                        let output = run_kubectl(
                            kubectl,
                            &[
                                "get",
                                "daemonset",
                                "-n",
                                &daemon_set.namespace,
                                &daemon_set.name,
                                "-o",
                                "json",
                            ],
                            None,
                        )
                        .await?;
                        let Some(desired) = parse_desired_scheduled(&output)? else {
                            log::debug!("Daemon set {daemon_set} was not reconciled yet");
                            return Ok(false);
                        };
                        let output = run_kubectl(
                            kubectl,
                            &["get", "pods", "-n", &daemon_set.namespace, "-o", "json"],
                            None,
                        )
                        .await?;
                        // Usage can only be sampled from pods that are bound to a node
                        let pods: Vec<PodRecord> =
                            parse_controlled_pods(&output, "DaemonSet", &daemon_set.name)?
                                .into_iter()
                                .filter(|pod| pod.node_name.is_some())
                                .collect();
                        log::debug!(
                            "Daemon set {daemon_set} has {}/{desired} scheduled pods",
                            pods.len()
                        );
                        let ready = pods.len() as u64 >= desired;
                        *found.borrow_mut() = pods;
                        Ok(ready)
                    }
                },
                interval,
                timeout,
            )
            .await;
            let what = format!("pods of daemon set {daemon_set}");
            finish_wait(result, what, timeout)?;
            Ok(found.into_inner())
        })
    }

    fn create_pod(&self, spec: &WorkloadSpec) -> ClusterFuture<PodRecord> {
        let kubectl = self.kubectl.clone();
        let manifest = workload_manifest(spec);
        let namespace = spec.namespace.clone();
        Box::pin(async move {
            let output = run_kubectl(
                &kubectl,
                &["create", "-n", &namespace, "-f", "-", "-o", "json"],
                Some(manifest.to_string()),
            )
            .await?;
            let pod: Pod = serde_json::from_str(&output)?;
            Ok(pod.into_record())
        })
    }

    fn wait_for_pod_success(
        &self,
        namespace: &str,
        name: &str,
        timeout: Duration,
    ) -> ClusterFuture<()> {
        let kubectl = self.kubectl.clone();
        let namespace = namespace.to_string();
        let name = name.to_string();
        let interval = self.status_poll_interval;
        Box::pin(async move {
            let result = poll_until(
                || {
                    let (kubectl, namespace, name) = (&kubectl, &namespace, &name);
                    async move {
                        let output = run_kubectl(
                            kubectl,
                            &["get", "pod", "-n", namespace, name, "-o", "json"],
                            None,
                        )
                        .await?;
                        let pod: Pod = serde_json::from_str(&output)?;
                        match pod.status.phase.as_str() {
                            "Succeeded" => Ok(true),
                            "Failed" => Err(ClusterError::PodFailed {
                                name: name.clone(),
                                phase: pod.status.phase.clone(),
                            }),
                            _ => Ok(false),
                        }
                    }
                },
                interval,
                timeout,
            )
            .await;
            finish_wait(result, format!("pod {name} to succeed"), timeout)
        })
    }

    fn node_usage(&self, node: &str) -> ClusterFuture<Vec<ContainerUsage>> {
        let kubectl = self.kubectl.clone();
        let path = format!("/api/v1/nodes/{node}/proxy/stats/summary");
        Box::pin(async move {
            let output = run_kubectl(&kubectl, &["get", "--raw", &path], None).await?;
            parse_usage_summary(&output)
        })
    }
}

fn finish_wait(
    result: Result<PollOutcome, PollError<ClusterError>>,
    what: String,
    timeout: Duration,
) -> ClusterResult<()> {
    match result {
        Ok(_) => Ok(()),
        Err(PollError::Predicate(error)) => Err(error),
        Err(PollError::Timeout { .. }) => Err(ClusterError::Timeout { what, timeout }),
    }
}

async fn run_kubectl(
    kubectl: &Path,
    arguments: &[&str],
    stdin: Option<String>,
) -> ClusterResult<String> {
    let command_line = format!("{} {}", kubectl.display(), arguments.join(" "));
    log::debug!("Running command `{command_line}`");

    let mut command = Command::new(kubectl);
    command
        .args(arguments)
        .stdin(if stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = command.spawn()?;
    if let Some(input) = stdin {
        if let Some(mut pipe) = child.stdin.take() {
            pipe.write_all(input.as_bytes()).await?;
        }
    }
    let output = child.wait_with_output().await?;
    let output = check_command_output(output).map_err(|message| ClusterError::CommandFailed {
        command: command_line.clone(),
        message,
    })?;
    output
        .stdout
        .to_str()
        .map(|s| s.to_string())
        .map_err(|e| ClusterError::CommandFailed {
            command: command_line,
            message: format!("Invalid UTF-8 in output: {e:?}"),
        })
}

async fn apply_manifest(kubectl: &Path, manifest: &serde_json::Value) -> ClusterResult<()> {
    run_kubectl(
        kubectl,
        &["apply", "-f", "-", "-o", "json"],
        Some(manifest.to_string()),
    )
    .await?;
    Ok(())
}

fn check_command_output(output: Output) -> Result<Output, String> {
    let status = output.status;
    if !status.success() {
        return Err(format!(
            "Exit code: {}\nStderr: {}",
            status.code().unwrap_or(-1),
            output.stderr.to_str_lossy().trim(),
        ));
    }
    Ok(output)
}

// Subset of the Kubernetes API objects that is read by the client

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct ObjectMeta {
    #[serde(default)]
    name: String,
    #[serde(default)]
    namespace: String,
    #[serde(default)]
    owner_references: Vec<OwnerReference>,
}

#[derive(Deserialize)]
struct OwnerReference {
    kind: String,
    name: String,
}

#[derive(Deserialize)]
struct List<T> {
    #[serde(default = "Vec::new")]
    items: Vec<T>,
}

#[derive(Deserialize)]
struct Node {
    metadata: ObjectMeta,
    #[serde(default)]
    spec: NodeSpec,
    #[serde(default)]
    status: NodeStatus,
}

#[derive(Deserialize, Default)]
struct NodeSpec {
    #[serde(default)]
    unschedulable: bool,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct NodeStatus {
    #[serde(default)]
    capacity: BTreeMap<String, String>,
    #[serde(default)]
    allocatable: BTreeMap<String, String>,
    #[serde(default)]
    node_info: NodeInfo,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct NodeInfo {
    #[serde(default)]
    os_image: String,
}

#[derive(Deserialize)]
struct Pod {
    metadata: ObjectMeta,
    #[serde(default)]
    spec: PodSpec,
    #[serde(default)]
    status: PodStatus,
}

impl Pod {
    fn into_record(self) -> PodRecord {
        PodRecord {
            namespace: self.metadata.namespace,
            name: self.metadata.name,
            node_name: self.spec.node_name,
        }
    }
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct PodSpec {
    node_name: Option<String>,
}

#[derive(Deserialize, Default)]
struct PodStatus {
    #[serde(default)]
    phase: String,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct DaemonSetStatus {
    observed_generation: Option<i64>,
    desired_number_scheduled: Option<u64>,
}

#[derive(Deserialize, Default)]
struct DaemonSetMeta {
    generation: Option<i64>,
}

#[derive(Deserialize)]
struct DaemonSet {
    #[serde(default)]
    metadata: DaemonSetMeta,
    #[serde(default)]
    status: Option<DaemonSetStatus>,
}

#[derive(Deserialize)]
struct StatsSummary {
    #[serde(default)]
    pods: Vec<PodStats>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PodStats {
    pod_ref: PodReference,
    #[serde(default)]
    containers: Vec<ContainerStats>,
}

#[derive(Deserialize)]
struct PodReference {
    name: String,
    namespace: String,
}

#[derive(Deserialize)]
struct ContainerStats {
    name: String,
    cpu: Option<CpuStats>,
    memory: Option<MemoryStats>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CpuStats {
    usage_nano_cores: Option<u64>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct MemoryStats {
    working_set_bytes: Option<u64>,
    rss_bytes: Option<u64>,
}

fn parse_resource_list(items: BTreeMap<String, String>) -> ClusterResult<ResourceList> {
    items
        .into_iter()
        .map(|(name, value)| Ok((ResourceName::new(name), parse_quantity(&value)?)))
        .collect()
}

fn parse_node_list(output: &str) -> ClusterResult<Vec<NodeRecord>> {
    let nodes: List<Node> = serde_json::from_str(output)?;
    nodes
        .items
        .into_iter()
        .map(|node| {
            Ok(NodeRecord {
                name: node.metadata.name,
                schedulable: !node.spec.unschedulable,
                os_image: node.status.node_info.os_image,
                capacity: parse_resource_list(node.status.capacity)?,
                allocatable: parse_resource_list(node.status.allocatable)?,
            })
        })
        .collect()
}

/// Moves the daemon set found in a rendered manifest into `namespace`.
fn place_daemon_set(
    rendered: &str,
    namespace: &str,
) -> ClusterResult<(serde_json::Value, DaemonSetRef)> {
    let mut manifest: serde_json::Value = serde_json::from_str(rendered)?;
    // A manifest with multiple documents is rendered as a `List`
    let object = if manifest["kind"] == "List" {
        manifest["items"]
            .as_array_mut()
            .and_then(|items| items.iter_mut().find(|item| item["kind"] == "DaemonSet"))
    } else if manifest["kind"] == "DaemonSet" {
        Some(&mut manifest)
    } else {
        None
    };
    let object = object.ok_or_else(|| {
        ClusterError::DeserializationError("Manifest does not contain a DaemonSet".to_string())
    })?;
    let name = object["metadata"]["name"]
        .as_str()
        .ok_or_else(|| {
            ClusterError::DeserializationError("DaemonSet in manifest has no name".to_string())
        })?
        .to_string();
    object["metadata"]["namespace"] = json!(namespace);

    Ok((
        manifest,
        DaemonSetRef {
            namespace: namespace.to_string(),
            name,
        },
    ))
}

/// Number of pods the daemon set controller wants to run.
///
/// Returns `None` until the controller has observed the current generation of the daemon set and
/// scheduled at least one pod, so that a freshly created daemon set is not mistaken for an empty
/// one.
fn parse_desired_scheduled(output: &str) -> ClusterResult<Option<u64>> {
    let daemon_set: DaemonSet = serde_json::from_str(output)?;
    let Some(status) = daemon_set.status else {
        return Ok(None);
    };
    let generation = daemon_set.metadata.generation.unwrap_or(0);
    if status.observed_generation.unwrap_or(0) < generation {
        return Ok(None);
    }
    Ok(status.desired_number_scheduled.filter(|&desired| desired > 0))
}

fn parse_controlled_pods(output: &str, kind: &str, owner: &str) -> ClusterResult<Vec<PodRecord>> {
    let pods: List<Pod> = serde_json::from_str(output)?;
    Ok(pods
        .items
        .into_iter()
        .filter(|pod| {
            pod.metadata
                .owner_references
                .iter()
                .any(|r| r.kind == kind && r.name == owner)
        })
        .map(Pod::into_record)
        .collect())
}

fn parse_usage_summary(output: &str) -> ClusterResult<Vec<ContainerUsage>> {
    let summary: StatsSummary = serde_json::from_str(output)?;
    Ok(summary
        .pods
        .into_iter()
        .flat_map(|pod| {
            let PodReference { name, namespace } = pod.pod_ref;
            pod.containers
                .into_iter()
                .map(move |container| ContainerUsage {
                    namespace: namespace.clone(),
                    pod: name.clone(),
                    container: container.name,
                    cpu_cores: container
                        .cpu
                        .and_then(|cpu| cpu.usage_nano_cores)
                        .unwrap_or(0) as f64
                        / 1e9,
                    memory_working_set_bytes: container
                        .memory
                        .as_ref()
                        .and_then(|memory| memory.working_set_bytes)
                        .unwrap_or(0),
                    memory_rss_bytes: container
                        .memory
                        .and_then(|memory| memory.rss_bytes)
                        .unwrap_or(0),
                })
        })
        .collect())
}

fn namespace_manifest(namespace: &str) -> serde_json::Value {
    json!({
        "apiVersion": "v1",
        "kind": "Namespace",
        "metadata": {
            "name": namespace,
        }
    })
}

fn workload_manifest(spec: &WorkloadSpec) -> serde_json::Value {
    json!({
        "apiVersion": "v1",
        "kind": "Pod",
        "metadata": {
            "name": spec.name,
            "namespace": spec.namespace,
        },
        "spec": {
            "restartPolicy": "Never",
            "containers": [{
                "name": spec.container,
                "image": spec.image,
                "resources": {
                    "limits": {
                        spec.resource.as_str(): spec.units.to_string(),
                    }
                }
            }]
        }
    })
}
