use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::gatherer::UsageSample;

/// Upper bounds of resource consumption of a single container.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ResourceConstraint {
    pub cpu_cores: f64,
    pub memory_bytes: u64,
}

/// Constraints keyed by container name.
pub type ResourceConstraints = BTreeMap<String, ResourceConstraint>;

/// Usage of one container at a single percentile.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ContainerSummary {
    /// `<namespace>/<pod>/<container>`
    pub container: String,
    pub cpu_cores: f64,
    pub memory_working_set_bytes: u64,
    pub memory_rss_bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConstraintViolation {
    pub container: String,
    pub percentile: u32,
    pub constraint: ResourceConstraint,
    pub cpu_cores: f64,
    pub memory_bytes: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct UsageSummary {
    pub sample_count: usize,
    pub percentiles: BTreeMap<u32, Vec<ContainerSummary>>,
    pub violations: Vec<ConstraintViolation>,
}

impl UsageSummary {
    pub fn at(&self, percentile: u32) -> Option<&[ContainerSummary]> {
        self.percentiles.get(&percentile).map(|c| c.as_slice())
    }
}

#[derive(Default)]
struct Series {
    cpu_cores: Vec<f64>,
    memory_working_set_bytes: Vec<u64>,
    memory_rss_bytes: Vec<u64>,
}

/// Index of the `percentile`-th value in a sorted series of `len` items.
fn percentile_index(len: usize, percentile: u32) -> usize {
    let rank = (len as f64 * percentile as f64 / 100.0).ceil() as usize;
    rank.saturating_sub(1).min(len.saturating_sub(1))
}

fn pick<T: Copy>(sorted: &[T], percentile: u32) -> T {
    sorted[percentile_index(sorted.len(), percentile)]
}

/// Aggregates all samples per container and computes the requested percentiles.
///
/// Every metric is ranked independently. Constraints are matched by the container name and
/// checked at the highest requested percentile.
pub fn summarize(
    samples: &[UsageSample],
    percentiles: &[u32],
    constraints: &ResourceConstraints,
) -> UsageSummary {
    let mut series: BTreeMap<String, Series> = BTreeMap::new();
    for usage in samples.iter().flat_map(|sample| sample.containers.iter()) {
        let entry = series.entry(usage.key()).or_default();
        entry.cpu_cores.push(usage.cpu_cores);
        entry
            .memory_working_set_bytes
            .push(usage.memory_working_set_bytes);
        entry.memory_rss_bytes.push(usage.memory_rss_bytes);
    }
    for entry in series.values_mut() {
        entry.cpu_cores.sort_by(|a, b| a.total_cmp(b));
        entry.memory_working_set_bytes.sort_unstable();
        entry.memory_rss_bytes.sort_unstable();
    }

    let percentiles: BTreeMap<u32, Vec<ContainerSummary>> = percentiles
        .iter()
        .map(|&percentile| {
            let containers = series
                .iter()
                .map(|(key, entry)| ContainerSummary {
                    container: key.clone(),
                    cpu_cores: pick(&entry.cpu_cores, percentile),
                    memory_working_set_bytes: pick(&entry.memory_working_set_bytes, percentile),
                    memory_rss_bytes: pick(&entry.memory_rss_bytes, percentile),
                })
                .collect();
            (percentile, containers)
        })
        .collect();

    let mut violations = vec![];
    if let Some((&percentile, containers)) = percentiles.last_key_value() {
        for summary in containers {
            let name = summary
                .container
                .rsplit_once('/')
                .map(|(_, name)| name)
                .unwrap_or(&summary.container);
            let Some(constraint) = constraints.get(name) else {
                continue;
            };
            if summary.cpu_cores > constraint.cpu_cores
                || summary.memory_working_set_bytes > constraint.memory_bytes
            {
                log::warn!(
                    "Container {} exceeds its constraint at p{percentile}: \
                     {:.3} cores (limit {:.3}), {} bytes (limit {})",
                    summary.container,
                    summary.cpu_cores,
                    constraint.cpu_cores,
                    summary.memory_working_set_bytes,
                    constraint.memory_bytes
                );
                violations.push(ConstraintViolation {
                    container: summary.container.clone(),
                    percentile,
                    constraint: *constraint,
                    cpu_cores: summary.cpu_cores,
                    memory_bytes: summary.memory_working_set_bytes,
                });
            }
        }
    }

    UsageSummary {
        sample_count: samples.len(),
        percentiles,
        violations,
    }
}
