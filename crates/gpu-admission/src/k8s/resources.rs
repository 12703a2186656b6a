//! Helpers around the vcuda resource names and predicate annotations shared
//! with the on-node gpu-manager. These names are a wire contract; changing
//! them breaks every node agent in the cluster.

use k8s_openapi::api::core::v1::Container;
use k8s_openapi::api::core::v1::Node;
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use tracing::debug;

pub const VCORE_RESOURCE: &str = "tencent.com/vcuda-core";
pub const VMEMORY_RESOURCE: &str = "tencent.com/vcuda-memory";
pub const PREDICATE_GPU_INDEX_PREFIX: &str = "tencent.com/predicate-gpu-idx-";
pub const PREDICATE_NODE_ANNOTATION: &str = "tencent.com/predicate-node";
pub const PREDICATE_TIME_ANNOTATION: &str = "tencent.com/predicate-time";
pub const GPU_ASSIGNED_ANNOTATION: &str = "tencent.com/gpu-assigned";

/// 100 vcores denote one whole GPU device.
pub const HUNDRED_CORE: u64 = 100;

fn quantity_value(quantity: &Quantity) -> u64 {
    quantity.0.trim().parse().unwrap_or(0)
}

/// Resource limit of a single container for the given vcuda resource name.
pub fn container_gpu_resource(container: &Container, resource: &str) -> u64 {
    container
        .resources
        .as_ref()
        .and_then(|r| r.limits.as_ref())
        .and_then(|limits| limits.get(resource))
        .map(quantity_value)
        .unwrap_or(0)
}

/// Summed resource limit across all containers of the pod.
pub fn pod_gpu_resource(pod: &Pod, resource: &str) -> u64 {
    pod.spec
        .as_ref()
        .map(|spec| {
            spec.containers
                .iter()
                .map(|c| container_gpu_resource(c, resource))
                .sum()
        })
        .unwrap_or(0)
}

/// A container requests GPU iff it asks for vcores and either a whole device
/// or some vcuda memory to go with the fraction.
pub fn is_gpu_required_container(container: &Container) -> bool {
    let vcore = container_gpu_resource(container, VCORE_RESOURCE);
    let vmemory = container_gpu_resource(container, VMEMORY_RESOURCE);
    vcore > 0 && (vcore >= HUNDRED_CORE || vmemory > 0)
}

/// Same rule as [`is_gpu_required_container`], over the pod's summed limits.
pub fn is_gpu_required_pod(pod: &Pod) -> bool {
    let vcore = pod_gpu_resource(pod, VCORE_RESOURCE);
    let vmemory = pod_gpu_resource(pod, VMEMORY_RESOURCE);
    vcore > 0 && (vcore >= HUNDRED_CORE || vmemory > 0)
}

/// Capacity of the node for the given resource name, 0 when absent.
pub fn node_capacity(node: &Node, resource: &str) -> u64 {
    node.status
        .as_ref()
        .and_then(|status| status.capacity.as_ref())
        .and_then(|capacity| capacity.get(resource))
        .map(quantity_value)
        .unwrap_or(0)
}

pub fn is_gpu_enabled_node(node: &Node) -> bool {
    node_capacity(node, VCORE_RESOURCE) > 0
}

/// Number of physical GPU devices advertised by the node.
pub fn gpu_device_count(node: &Node) -> usize {
    (node_capacity(node, VCORE_RESOURCE) / HUNDRED_CORE) as usize
}

pub fn node_label<'a>(node: &'a Node, key: &str) -> Option<&'a str> {
    node.metadata
        .labels
        .as_ref()
        .and_then(|labels| labels.get(key))
        .map(String::as_str)
}

/// Device indices previously reserved for the container at `container_index`,
/// parsed from the pod's predicate annotation. `None` when the annotation is
/// absent or malformed; a malformed list invalidates the whole container.
pub fn predicate_indexes(pod: &Pod, container_index: usize) -> Option<Vec<usize>> {
    let key = format!("{PREDICATE_GPU_INDEX_PREFIX}{container_index}");
    let value = pod.metadata.annotations.as_ref()?.get(&key)?;

    let mut indexes = Vec::new();
    for part in value.split(',') {
        match part.trim().parse::<usize>() {
            Ok(index) => indexes.push(index),
            Err(_) => {
                debug!(
                    pod = pod.metadata.name.as_deref().unwrap_or_default(),
                    annotation = key,
                    value,
                    "malformed predicate index annotation"
                );
                return None;
            }
        }
    }
    Some(indexes)
}

/// A predicated pod already carries reservations from an earlier admission
/// cycle and must never be re-predicated.
pub fn is_predicated_pod(pod: &Pod) -> bool {
    pod.metadata
        .annotations
        .as_ref()
        .is_some_and(|annotations| {
            annotations.keys().any(|key| {
                key.contains(GPU_ASSIGNED_ANNOTATION)
                    || key.contains(PREDICATE_TIME_ANNOTATION)
                    || key.contains(PREDICATE_GPU_INDEX_PREFIX)
            })
        })
}

/// Terminal pods no longer hold their reservations.
pub fn is_pod_finished(pod: &Pod) -> bool {
    matches!(
        pod.status.as_ref().and_then(|s| s.phase.as_deref()),
        Some("Succeeded") | Some("Failed")
    )
}

/// Node the pod is bound to, or predicted to land on when still unbound.
pub fn effective_node_name(pod: &Pod) -> Option<&str> {
    let bound = pod
        .spec
        .as_ref()
        .and_then(|spec| spec.node_name.as_deref())
        .filter(|name| !name.is_empty());
    if bound.is_some() {
        return bound;
    }
    pod.metadata
        .annotations
        .as_ref()
        .and_then(|annotations| annotations.get(PREDICATE_NODE_ANNOTATION))
        .map(String::as_str)
}

/// Whether the pod occupies GPU capacity on `node_name`: bound there, or
/// unbound but predicted there, and not yet finished.
pub fn is_pod_on_node(pod: &Pod, node_name: &str) -> bool {
    !is_pod_finished(pod) && effective_node_name(pod) == Some(node_name)
}
