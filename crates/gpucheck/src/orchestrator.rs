use std::rc::Rc;
use std::time::Duration;

use derive_builder::Builder;
use futures::future::join_all;
use rand::Rng;
use rand::distr::Alphanumeric;
use serde::{Serialize, Serializer};
use thiserror::Error;
use tokio::time::Instant;

use crate::cluster::{ClusterApi, DaemonSetRef, PodRecord, Quantity, ResourceName, WorkloadSpec};
use crate::common::error::{GpuCheckError, WorkloadError};
use crate::common::poll::{PollError, poll_until};
use crate::gatherer::{GathererOptions, ResourceConstraints, UsageGatherer, UsageSummary};
use crate::probe::CapacityProbe;

pub const WORKLOAD_NAME_PREFIX: &str = "nvidia-gpu-";
pub const WORKLOAD_CONTAINER_NAME: &str = "vector-addition-cuda";
pub const DEFAULT_WORKLOAD_IMAGE: &str = "k8s.gcr.io/cuda-vector-add:v0.1";
pub const DEFAULT_NAMESPACE: &str = "gpucheck";
pub const DEFAULT_DEVICE_PLUGIN_NAMESPACE: &str = "kube-system";
pub const DEFAULT_DEVICE_PLUGIN_NAME: &str = "nvidia-gpu-device-plugin";

const WORKLOAD_SUFFIX_LENGTH: usize = 8;

/// Every workload requests exactly one unit of the checked resource.
const WORKLOAD_RESOURCE_UNITS: Quantity = 1;

#[derive(Builder, Debug, Clone)]
#[builder(pattern = "owned")]
pub struct RunConfig {
    #[builder(default = "crate::DEFAULT_DRIVER_INSTALLER_MANIFEST.to_string()")]
    pub manifest_url: String,
    /// Namespace of the driver installer and of the workloads.
    #[builder(default = "DEFAULT_NAMESPACE.to_string()")]
    pub namespace: String,
    #[builder(default = "ResourceName::new(crate::NVIDIA_GPU_RESOURCE_NAME)")]
    pub resource: ResourceName,
    #[builder(default = "DEFAULT_WORKLOAD_IMAGE.to_string()")]
    pub image: String,
    /// Pre-existing device plugin whose pods are watched together with the installer pods.
    #[builder(default = "Some(default_device_plugin())")]
    pub device_plugin: Option<DaemonSetRef>,
    #[builder(default = "true")]
    pub gather_usage: bool,
    #[builder(default)]
    pub gatherer: GathererOptions,
    #[builder(default = "Duration::from_secs(1)")]
    pub poll_interval: Duration,
    #[builder(default = "Duration::from_secs(10 * 60)")]
    pub driver_install_timeout: Duration,
    #[builder(default = "Duration::from_secs(5 * 60)")]
    pub workload_timeout: Duration,
    #[builder(default = "vec![50, 90, 100]")]
    pub percentiles: Vec<u32>,
    #[builder(default)]
    pub constraints: ResourceConstraints,
}

pub fn default_device_plugin() -> DaemonSetRef {
    DaemonSetRef {
        namespace: DEFAULT_DEVICE_PLUGIN_NAMESPACE.to_string(),
        name: DEFAULT_DEVICE_PLUGIN_NAME.to_string(),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkloadHandle {
    pub name: String,
    pub resource_units: Quantity,
}

fn serialize_duration<S: Serializer>(
    duration: &Duration,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&humantime::format_duration(*duration).to_string())
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub resource: ResourceName,
    pub manifest_url: String,
    pub watched_pods: Vec<PodRecord>,
    pub workloads: Vec<WorkloadHandle>,
    #[serde(serialize_with = "serialize_duration")]
    pub readiness_elapsed: Duration,
    #[serde(serialize_with = "serialize_duration")]
    pub elapsed: Duration,
    pub usage: Option<UsageSummary>,
}

/// A run that did not succeed, together with the usage that was gathered before the failure.
#[derive(Debug, Error)]
#[error("{error}")]
pub struct FailedRun {
    pub error: GpuCheckError,
    pub usage: Option<UsageSummary>,
}

#[derive(Default)]
struct RunProgress {
    watched_pods: Vec<PodRecord>,
    workloads: Vec<WorkloadHandle>,
    readiness_elapsed: Duration,
    gatherer: Option<UsageGatherer>,
}

/// Installs the GPU driver on the cluster, waits until every schedulable node exposes the
/// resource and then runs one workload per allocatable resource unit.
pub struct WorkloadOrchestrator {
    api: Rc<dyn ClusterApi>,
    config: RunConfig,
}

impl WorkloadOrchestrator {
    pub fn new(api: Rc<dyn ClusterApi>, config: RunConfig) -> Self {
        Self { api, config }
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    /// Must be called inside a [`tokio::task::LocalSet`] when usage gathering is enabled.
    pub async fn run(&self) -> Result<RunReport, FailedRun> {
        let start = Instant::now();
        let mut progress = RunProgress::default();
        let result = self.run_steps(&mut progress).await;

        // The gatherer is stopped on every path, so that a failed run still reports usage
        let usage = match progress.gatherer.take() {
            Some(mut gatherer) => match gatherer
                .stop_and_summarize(&self.config.percentiles, &self.config.constraints)
                .await
            {
                Ok(summary) => Some(summary),
                Err(error) => {
                    log::error!("Cannot summarize resource usage: {error}");
                    None
                }
            },
            None => None,
        };

        match result {
            Ok(()) => {
                let elapsed = start.elapsed();
                log::info!(
                    "All {} workload(s) succeeded in {}",
                    progress.workloads.len(),
                    humantime::format_duration(elapsed)
                );
                Ok(RunReport {
                    resource: self.config.resource.clone(),
                    manifest_url: self.config.manifest_url.clone(),
                    watched_pods: progress.watched_pods,
                    workloads: progress.workloads,
                    readiness_elapsed: progress.readiness_elapsed,
                    elapsed,
                    usage,
                })
            }
            Err(error) => Err(FailedRun { error, usage }),
        }
    }

    async fn run_steps(&self, progress: &mut RunProgress) -> crate::Result<()> {
        let config = &self.config;

        self.log_node_images().await?;

        log::info!("Creating driver installer from {}", config.manifest_url);
        let installer = self
            .api
            .create_daemon_set(&config.namespace, &config.manifest_url)
            .await?;
        log::info!("Driver installer {installer} created");

        let mut pods = self.api.wait_for_controlled_pods(&installer).await?;
        if let Some(device_plugin) = &config.device_plugin {
            match self.api.wait_for_controlled_pods(device_plugin).await {
                Ok(plugin_pods) => {
                    log::info!(
                        "Watching {} pod(s) of device plugin {device_plugin}",
                        plugin_pods.len()
                    );
                    pods.extend(plugin_pods);
                }
                Err(error) => log::info!("Device plugin {device_plugin} not found: {error}"),
            }
        }
        progress.watched_pods = pods.clone();

        if config.gather_usage {
            let mut gatherer = UsageGatherer::new(self.api.clone(), pods, config.gatherer.clone());
            gatherer.start()?;
            progress.gatherer = Some(gatherer);
        }

        let probe = CapacityProbe::new(self.api.clone());
        progress.readiness_elapsed = self.wait_for_capacity(&probe).await?;

        let count = probe.sum_allocatable(&config.resource).await?.max(0);
        log::info!("Launching {count} workload(s) requesting {}", config.resource);
        for _ in 0..count {
            let handle = self.launch_workload().await?;
            progress.workloads.push(handle);
        }
        self.wait_for_workloads(&progress.workloads).await
    }

    async fn log_node_images(&self) -> crate::Result<()> {
        for node in self.api.list_nodes().await? {
            log::info!("Node {} runs {}", node.name, node.os_image);
        }
        Ok(())
    }

    async fn wait_for_capacity(&self, probe: &CapacityProbe) -> crate::Result<Duration> {
        let resource = &self.config.resource;
        let timeout = self.config.driver_install_timeout;
        log::info!(
            "Waiting up to {} for {resource} to appear on all schedulable nodes",
            humantime::format_duration(timeout)
        );

        match poll_until(
            move || probe.all_nodes_have_capacity(resource),
            self.config.poll_interval,
            timeout,
        )
        .await
        {
            Ok(outcome) => {
                log::info!(
                    "{resource} is available after {} ({} check(s))",
                    humantime::format_duration(outcome.elapsed),
                    outcome.attempts
                );
                Ok(outcome.elapsed)
            }
            Err(PollError::Timeout { attempts, .. }) => {
                log::debug!("Capacity was not available after {attempts} check(s)");
                Err(GpuCheckError::ReadinessTimeout {
                    resource: resource.to_string(),
                    timeout,
                    observed: probe.describe_last_observed(),
                })
            }
            Err(PollError::Predicate(error)) => Err(error.into()),
        }
    }

    async fn launch_workload(&self) -> crate::Result<WorkloadHandle> {
        let spec = WorkloadSpec {
            namespace: self.config.namespace.clone(),
            name: workload_name(),
            container: WORKLOAD_CONTAINER_NAME.to_string(),
            image: self.config.image.clone(),
            resource: self.config.resource.clone(),
            units: WORKLOAD_RESOURCE_UNITS,
        };
        let pod = self.api.create_pod(&spec).await?;
        log::info!("Workload {} created", pod.name);
        Ok(WorkloadHandle {
            name: pod.name,
            resource_units: spec.units,
        })
    }

    /// Waits for all workloads at once and reports every one that did not succeed.
    async fn wait_for_workloads(&self, workloads: &[WorkloadHandle]) -> crate::Result<()> {
        let namespace = &self.config.namespace;
        let timeout = self.config.workload_timeout;
        let waits = workloads.iter().map(|workload| async move {
            let result = self
                .api
                .wait_for_pod_success(namespace, &workload.name, timeout)
                .await;
            match &result {
                Ok(()) => log::info!("Workload {} succeeded", workload.name),
                Err(error) => log::error!("Workload {} failed: {error}", workload.name),
            }
            result.map_err(|error| WorkloadError {
                name: workload.name.clone(),
                error,
            })
        });

        let errors: Vec<WorkloadError> = join_all(waits)
            .await
            .into_iter()
            .filter_map(|result| result.err())
            .collect();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(GpuCheckError::WorkloadFailure(errors))
        }
    }
}

fn workload_name() -> String {
    let suffix: String = rand::rng()
        .sample_iter(&Alphanumeric)
        .take(WORKLOAD_SUFFIX_LENGTH)
        .map(|c| char::from(c).to_ascii_lowercase())
        .collect();
    format!("{WORKLOAD_NAME_PREFIX}{suffix}")
}
