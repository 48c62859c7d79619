use std::cell::RefCell;
use std::fmt::Write;
use std::rc::Rc;

use serde::Serialize;

use crate::cluster::{ClusterApi, ClusterResult, NodeRecord, Quantity, ResourceName};

/// What a single node reported about a resource during the latest listing.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NodeCapacity {
    pub name: String,
    pub schedulable: bool,
    pub capacity: Option<Quantity>,
    pub allocatable: Option<Quantity>,
}

impl NodeCapacity {
    fn from_node(node: &NodeRecord, resource: &ResourceName) -> Self {
        Self {
            name: node.name.clone(),
            schedulable: node.schedulable,
            capacity: node.capacity_of(resource),
            allocatable: node.allocatable_of(resource),
        }
    }

    fn has_capacity(&self) -> bool {
        self.capacity.is_some_and(|value| value > 0)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CapacityReport {
    pub resource: ResourceName,
    pub nodes: Vec<NodeCapacity>,
    /// Every schedulable node reports nonzero capacity.
    pub ready: bool,
    pub total_allocatable: Quantity,
}

/// Evaluates capacity of a resource over the current node inventory.
///
/// Every query lists the nodes again; nothing is cached between calls except the last
/// observation, which is kept only for diagnostics.
pub struct CapacityProbe {
    api: Rc<dyn ClusterApi>,
    last_observed: RefCell<Vec<NodeCapacity>>,
}

impl CapacityProbe {
    pub fn new(api: Rc<dyn ClusterApi>) -> Self {
        Self {
            api,
            last_observed: Default::default(),
        }
    }

    /// Returns `true` if every schedulable node has a nonzero capacity of `resource`.
    ///
    /// Unschedulable nodes are ignored. A cluster without any schedulable node is considered
    /// ready.
    pub async fn all_nodes_have_capacity(&self, resource: &ResourceName) -> ClusterResult<bool> {
        log::debug!("Getting list of nodes from the cluster");
        let nodes = self.api.list_nodes().await?;
        let ready = nodes_have_capacity(&nodes, resource);
        if ready {
            log::info!("{resource} exists on all schedulable nodes");
        }
        *self.last_observed.borrow_mut() = nodes
            .iter()
            .map(|node| NodeCapacity::from_node(node, resource))
            .collect();
        Ok(ready)
    }

    /// Sums the allocatable amount of `resource` over all nodes, schedulable or not.
    pub async fn sum_allocatable(&self, resource: &ResourceName) -> ClusterResult<Quantity> {
        let nodes = self.api.list_nodes().await?;
        Ok(total_allocatable(&nodes, resource))
    }

    /// Evaluates both predicates over a single node listing.
    pub async fn report(&self, resource: &ResourceName) -> ClusterResult<CapacityReport> {
        let nodes = self.api.list_nodes().await?;
        Ok(CapacityReport {
            resource: resource.clone(),
            nodes: nodes
                .iter()
                .map(|node| NodeCapacity::from_node(node, resource))
                .collect(),
            ready: nodes_have_capacity(&nodes, resource),
            total_allocatable: total_allocatable(&nodes, resource),
        })
    }

    pub fn last_observed(&self) -> Vec<NodeCapacity> {
        self.last_observed.borrow().clone()
    }

    /// Human-readable description of the last observation, one node per line.
    pub fn describe_last_observed(&self) -> String {
        let observed = self.last_observed.borrow();
        if observed.is_empty() {
            return "  no nodes were listed".to_string();
        }
        let mut output = String::new();
        for node in observed.iter() {
            let format_value = |value: Option<Quantity>| match value {
                Some(value) => value.to_string(),
                None => "missing".to_string(),
            };
            let _ = writeln!(
                output,
                "  {}: capacity={}, allocatable={}{}",
                node.name,
                format_value(node.capacity),
                format_value(node.allocatable),
                if node.schedulable {
                    ""
                } else {
                    " (unschedulable)"
                }
            );
        }
        output.truncate(output.trim_end().len());
        output
    }
}

pub fn nodes_have_capacity(nodes: &[NodeRecord], resource: &ResourceName) -> bool {
    let mut schedulable = 0;
    let mut ready = true;
    for node in nodes.iter().filter(|node| node.schedulable) {
        schedulable += 1;
        if !NodeCapacity::from_node(node, resource).has_capacity() {
            log::info!("{resource} not available on node {}", node.name);
            ready = false;
        }
    }
    if schedulable == 0 {
        log::warn!("No schedulable nodes found, {resource} capacity is trivially satisfied");
    }
    ready
}

pub fn total_allocatable(nodes: &[NodeRecord], resource: &ResourceName) -> Quantity {
    nodes
        .iter()
        .filter_map(|node| node.allocatable_of(resource))
        .sum()
}
