pub mod summary;

use std::collections::BTreeSet;
use std::rc::Rc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::Serialize;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::cluster::{ClusterApi, ContainerUsage, PodRecord};
use crate::common::error::GpuCheckError;
pub use summary::{ResourceConstraint, ResourceConstraints, UsageSummary, summarize};

#[derive(Debug, Clone)]
pub struct GathererOptions {
    /// Time between the starts of two sampling rounds.
    pub period: Duration,
    /// Maximum time of a single node probe.
    pub probe_duration: Duration,
}

impl Default for GathererOptions {
    fn default() -> Self {
        Self {
            period: Duration::from_secs(2),
            probe_duration: Duration::from_secs(2),
        }
    }
}

/// Usage of the watched containers on one node at one point in time.
#[derive(Debug, Clone, Serialize)]
pub struct UsageSample {
    pub node: String,
    pub timestamp: DateTime<Utc>,
    pub containers: Vec<ContainerUsage>,
}

enum GathererState {
    Idle,
    Sampling {
        stop_sender: oneshot::Sender<()>,
        handle: JoinHandle<Vec<UsageSample>>,
    },
    Stopped,
    Summarized,
}

impl GathererState {
    fn name(&self) -> &'static str {
        match self {
            GathererState::Idle => "idle",
            GathererState::Sampling { .. } => "sampling",
            GathererState::Stopped => "stopped",
            GathererState::Summarized => "summarized",
        }
    }
}

/// Periodically samples resource usage of a fixed set of pods.
///
/// The gatherer goes through `idle -> sampling -> stopped -> summarized`. Sampling happens in a
/// local background task, which has to be spawned inside a [`tokio::task::LocalSet`].
pub struct UsageGatherer {
    api: Rc<dyn ClusterApi>,
    pods: Vec<PodRecord>,
    options: GathererOptions,
    state: GathererState,
}

impl UsageGatherer {
    pub fn new(api: Rc<dyn ClusterApi>, pods: Vec<PodRecord>, options: GathererOptions) -> Self {
        Self {
            api,
            pods,
            options,
            state: GathererState::Idle,
        }
    }

    pub fn pods(&self) -> &[PodRecord] {
        &self.pods
    }

    pub fn start(&mut self) -> crate::Result<()> {
        if !matches!(self.state, GathererState::Idle) {
            return Err(self.invalid_state("start"));
        }

        for pod in self.pods.iter().filter(|pod| pod.node_name.is_none()) {
            log::warn!(
                "Pod {}/{} is not bound to a node, its usage will not be sampled",
                pod.namespace,
                pod.name
            );
        }
        let nodes: BTreeSet<String> = self
            .pods
            .iter()
            .filter_map(|pod| pod.node_name.clone())
            .collect();
        let watched: BTreeSet<(String, String)> = self
            .pods
            .iter()
            .map(|pod| (pod.namespace.clone(), pod.name.clone()))
            .collect();
        log::info!(
            "Starting usage gathering of {} pod(s) on {} node(s)",
            watched.len(),
            nodes.len()
        );

        let (stop_sender, stop_receiver) = oneshot::channel();
        let handle = tokio::task::spawn_local(sampling_loop(
            self.api.clone(),
            nodes.into_iter().collect(),
            watched,
            self.options.clone(),
            stop_receiver,
        ));
        self.state = GathererState::Sampling {
            stop_sender,
            handle,
        };
        Ok(())
    }

    /// Stops the sampling loop, waits until it has finished and summarizes everything that was
    /// gathered.
    pub async fn stop_and_summarize(
        &mut self,
        percentiles: &[u32],
        constraints: &ResourceConstraints,
    ) -> crate::Result<UsageSummary> {
        let (stop_sender, handle) = match std::mem::replace(&mut self.state, GathererState::Stopped)
        {
            GathererState::Sampling {
                stop_sender,
                handle,
            } => (stop_sender, handle),
            state => {
                self.state = state;
                return Err(self.invalid_state("stop"));
            }
        };

        // The loop may have already ended, in that case there is nobody to notify
        let _ = stop_sender.send(());
        let samples = handle.await.map_err(|error| {
            GpuCheckError::GenericError(format!("Sampling loop failed: {error}"))
        })?;
        log::info!("Usage gathering stopped after {} sample(s)", samples.len());

        let summary = summarize(&samples, percentiles, constraints);
        self.state = GathererState::Summarized;
        Ok(summary)
    }

    fn invalid_state(&self, operation: &'static str) -> GpuCheckError {
        GpuCheckError::InvalidGathererState {
            operation,
            state: self.state.name(),
        }
    }
}

async fn sampling_loop(
    api: Rc<dyn ClusterApi>,
    nodes: Vec<String>,
    watched: BTreeSet<(String, String)>,
    options: GathererOptions,
    mut stop_receiver: oneshot::Receiver<()>,
) -> Vec<UsageSample> {
    let mut samples = Vec::new();
    let mut interval = tokio::time::interval(options.period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = &mut stop_receiver => break,
            _ = interval.tick() => {}
        }

        let round = sample_nodes(&api, &nodes, &watched, options.probe_duration);
        tokio::select! {
            biased;
            _ = &mut stop_receiver => break,
            new_samples = round => samples.extend(new_samples),
        }
    }
    samples
}

async fn sample_nodes(
    api: &Rc<dyn ClusterApi>,
    nodes: &[String],
    watched: &BTreeSet<(String, String)>,
    probe_duration: Duration,
) -> Vec<UsageSample> {
    let probes = nodes.iter().map(|node| async move {
        match tokio::time::timeout(probe_duration, api.node_usage(node)).await {
            Ok(Ok(containers)) => Some(UsageSample {
                node: node.clone(),
                timestamp: Utc::now(),
                containers: containers
                    .into_iter()
                    .filter(|usage| {
                        watched.contains(&(usage.namespace.clone(), usage.pod.clone()))
                    })
                    .collect(),
            }),
            Ok(Err(error)) => {
                log::warn!("Dropping usage sample of node {node}: {error}");
                None
            }
            Err(_) => {
                log::warn!(
                    "Dropping usage sample of node {node}: probe did not finish in {}",
                    humantime::format_duration(probe_duration)
                );
                None
            }
        }
    });
    join_all(probes).await.into_iter().flatten().collect()
}
