//! Device selection for one pod on one node. Share mode packs fractional
//! requests onto the fullest device that still fits; exclusive mode claims
//! completely free devices.

use core::error::Error;
use std::collections::BTreeMap;
use std::time::SystemTime;
use std::time::UNIX_EPOCH;

use k8s_openapi::api::core::v1::Container;
use k8s_openapi::api::core::v1::Pod;
use tracing::debug;

use crate::k8s::resources::container_gpu_resource;
use crate::k8s::resources::is_gpu_required_container;
use crate::k8s::resources::GPU_ASSIGNED_ANNOTATION;
use crate::k8s::resources::HUNDRED_CORE;
use crate::k8s::resources::PREDICATE_GPU_INDEX_PREFIX;
use crate::k8s::resources::PREDICATE_NODE_ANNOTATION;
use crate::k8s::resources::PREDICATE_TIME_ANNOTATION;
use crate::k8s::resources::VCORE_RESOURCE;
use crate::k8s::resources::VMEMORY_RESOURCE;
use crate::scheduling::node_view::NodeView;

/// The pod cannot be placed on this node.
#[derive(Debug, derive_more::Display)]
pub enum AllocationError {
    #[display("container {container} cannot be placed on node {node}")]
    Unschedulable { node: String, container: String },
}

impl Error for AllocationError {}

pub struct Allocator<'a> {
    view: &'a mut NodeView,
}

impl<'a> Allocator<'a> {
    pub fn new(view: &'a mut NodeView) -> Self {
        Self { view }
    }

    /// Try to place every GPU-requesting container of the pod on this node.
    /// On success returns a copy of the pod carrying the full set of
    /// predicate annotations; on any container failure the whole allocation
    /// fails and the (request-local) view is simply discarded by the caller.
    pub fn allocate(&mut self, pod: &Pod) -> Result<Pod, AllocationError> {
        let mut entries = BTreeMap::new();

        if let Some(spec) = pod.spec.as_ref() {
            for (i, container) in spec.containers.iter().enumerate() {
                if !is_gpu_required_container(container) {
                    continue;
                }
                let device_ids = self.allocate_one(container)?;
                let joined = device_ids
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join(",");
                entries.insert(format!("{PREDICATE_GPU_INDEX_PREFIX}{i}"), joined);
            }
        }

        entries.insert(
            PREDICATE_NODE_ANNOTATION.to_string(),
            self.view.name().to_string(),
        );
        entries.insert(GPU_ASSIGNED_ANNOTATION.to_string(), "false".to_string());
        entries.insert(
            PREDICATE_TIME_ANNOTATION.to_string(),
            unix_nanos().to_string(),
        );

        let mut new_pod = pod.clone();
        new_pod
            .metadata
            .annotations
            .get_or_insert_with(BTreeMap::new)
            .extend(entries);
        Ok(new_pod)
    }

    /// Pick devices for one container and immediately charge the
    /// reservation, so later containers of the same pod observe it.
    fn allocate_one(&mut self, container: &Container) -> Result<Vec<usize>, AllocationError> {
        let cores = container_gpu_resource(container, VCORE_RESOURCE);
        let memory = container_gpu_resource(container, VMEMORY_RESOURCE);

        let mut picked = if cores < HUNDRED_CORE {
            share_mode(self.view, cores, memory)
        } else {
            exclusive_mode(self.view, cores)
        };

        if picked.is_empty() {
            return Err(self.unschedulable(container));
        }
        picked.sort_unstable();

        let (charge_cores, charge_memory) = if cores < HUNDRED_CORE {
            (cores, memory)
        } else {
            (HUNDRED_CORE, self.view.device_total_memory())
        };
        for device_id in &picked {
            self.view
                .reserve(*device_id, charge_cores, charge_memory)
                .map_err(|e| {
                    debug!(
                        node = self.view.name(),
                        device = device_id,
                        "failed to charge reservation: {e}"
                    );
                    self.unschedulable(container)
                })?;
        }

        Ok(picked)
    }

    fn unschedulable(&self, container: &Container) -> AllocationError {
        AllocationError::Unschedulable {
            node: self.view.name().to_string(),
            container: container.name.clone(),
        }
    }
}

/// Device ids ordered by the most-loaded-first comparator
/// `(allocatable_cores, allocatable_memory, id)` ascending.
fn ordered_device_ids(view: &NodeView) -> Vec<usize> {
    let mut ids: Vec<usize> = (0..view.device_count()).collect();
    ids.sort_by_key(|&id| {
        let device = &view.devices()[id];
        (device.allocatable_cores(), device.allocatable_memory(), id)
    });
    ids
}

/// Share mode: exactly one device, the fullest one that still satisfies the
/// request. A fractional request never spans devices.
fn share_mode(view: &NodeView, cores: u64, memory: u64) -> Vec<usize> {
    for id in ordered_device_ids(view) {
        let device = &view.devices()[id];
        if device.can_allocate(cores, memory) {
            debug!(
                device = id,
                cores = device.allocatable_cores(),
                memory = device.allocatable_memory(),
                "picked shared device"
            );
            return vec![id];
        }
    }
    Vec::new()
}

/// Exclusive mode: `cores / 100` completely free devices, or nothing.
/// Memory is not consulted; a whole device always comes with all its memory.
fn exclusive_mode(view: &NodeView, cores: u64) -> Vec<usize> {
    let mut wanted = (cores / HUNDRED_CORE) as usize;
    let mut picked = Vec::new();

    for id in ordered_device_ids(view) {
        if wanted == 0 {
            break;
        }
        if view.devices()[id].allocatable_cores() == HUNDRED_CORE {
            picked.push(id);
            wanted -= 1;
        }
    }

    if wanted > 0 {
        return Vec::new();
    }
    picked
}

fn unix_nanos() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use k8s_openapi::api::core::v1::Node;
    use k8s_openapi::api::core::v1::NodeStatus;
    use k8s_openapi::api::core::v1::PodSpec;
    use k8s_openapi::api::core::v1::ResourceRequirements;
    use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    use super::*;

    fn gpu_node(name: &str, device_count: u64, total_memory: u64) -> Node {
        let mut capacity = BTreeMap::new();
        capacity.insert(
            VCORE_RESOURCE.to_string(),
            Quantity((device_count * HUNDRED_CORE).to_string()),
        );
        capacity.insert(
            VMEMORY_RESOURCE.to_string(),
            Quantity(total_memory.to_string()),
        );
        Node {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            status: Some(NodeStatus {
                capacity: Some(capacity),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn gpu_container(name: &str, cores: u64, memory: u64) -> Container {
        let mut limits = BTreeMap::new();
        limits.insert(VCORE_RESOURCE.to_string(), Quantity(cores.to_string()));
        limits.insert(VMEMORY_RESOURCE.to_string(), Quantity(memory.to_string()));
        Container {
            name: name.to_string(),
            resources: Some(ResourceRequirements {
                limits: Some(limits),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn pod_with(containers: Vec<Container>) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some("pod-under-test".to_string()),
                ..Default::default()
            },
            spec: Some(PodSpec {
                containers,
                ..Default::default()
            }),
            status: None,
        }
    }

    fn annotation<'p>(pod: &'p Pod, key: &str) -> Option<&'p str> {
        pod.metadata
            .annotations
            .as_ref()
            .and_then(|a| a.get(key))
            .map(String::as_str)
    }

    #[test]
    fn share_mode_prefers_the_fullest_fitting_device() {
        let node = gpu_node("node0", 2, 8);
        let mut view = NodeView::from_node(&node, &[]).unwrap();
        view.reserve(1, 30, 1).unwrap();

        // device 1 has fewer free cores and still fits, so it wins
        assert_eq!(share_mode(&view, 20, 1), vec![1]);
    }

    #[test]
    fn share_mode_never_spans_devices() {
        let node = gpu_node("node0", 2, 8);
        let mut view = NodeView::from_node(&node, &[]).unwrap();
        view.reserve(0, 60, 1).unwrap();
        view.reserve(1, 60, 1).unwrap();

        // 80 cores are free in total but no single device has them
        assert!(share_mode(&view, 80, 1).is_empty());
    }

    #[test]
    fn exclusive_mode_needs_completely_free_devices() {
        let node = gpu_node("node0", 2, 8);
        let mut view = NodeView::from_node(&node, &[]).unwrap();
        view.reserve(0, 1, 0).unwrap();

        assert_eq!(exclusive_mode(&view, 100), vec![1]);
        assert!(exclusive_mode(&view, 200).is_empty());
    }

    #[test]
    fn one_hundred_cores_is_exclusive_for_a_single_device() {
        let node = gpu_node("node0", 2, 8);
        let mut view = NodeView::from_node(&node, &[]).unwrap();
        let mut allocator = Allocator::new(&mut view);

        let pod = pod_with(vec![gpu_container("c0", 100, 0)]);
        let result = allocator.allocate(&pod).unwrap();

        assert_eq!(
            annotation(&result, &format!("{PREDICATE_GPU_INDEX_PREFIX}0")),
            Some("0")
        );
        assert_eq!(view.devices()[0].used_core(), 100);
        assert_eq!(view.devices()[0].used_memory(), 4);
    }

    #[test]
    fn multi_gpu_annotation_lists_ids_ascending() {
        let node = gpu_node("node0", 2, 8);
        let mut view = NodeView::from_node(&node, &[]).unwrap();
        let mut allocator = Allocator::new(&mut view);

        let pod = pod_with(vec![gpu_container("c0", 200, 0)]);
        let result = allocator.allocate(&pod).unwrap();

        assert_eq!(
            annotation(&result, &format!("{PREDICATE_GPU_INDEX_PREFIX}0")),
            Some("0,1")
        );
    }

    #[test]
    fn later_containers_observe_earlier_reservations() {
        let node = gpu_node("node0", 2, 8);
        let mut view = NodeView::from_node(&node, &[]).unwrap();
        let mut allocator = Allocator::new(&mut view);

        let pod = pod_with(vec![
            gpu_container("c0", 100, 3),
            gpu_container("c1", 80, 3),
        ]);
        let result = allocator.allocate(&pod).unwrap();

        assert_eq!(
            annotation(&result, &format!("{PREDICATE_GPU_INDEX_PREFIX}0")),
            Some("0")
        );
        assert_eq!(
            annotation(&result, &format!("{PREDICATE_GPU_INDEX_PREFIX}1")),
            Some("1")
        );
    }

    #[test]
    fn any_failing_container_fails_the_whole_pod() {
        let node = gpu_node("node0", 1, 4);
        let mut view = NodeView::from_node(&node, &[]).unwrap();
        let mut allocator = Allocator::new(&mut view);

        let pod = pod_with(vec![
            gpu_container("c0", 100, 0),
            gpu_container("c1", 10, 1),
        ]);
        assert!(allocator.allocate(&pod).is_err());
    }

    #[test]
    fn allocation_sets_the_placement_annotations() {
        let node = gpu_node("node0", 2, 8);
        let mut view = NodeView::from_node(&node, &[]).unwrap();
        let mut allocator = Allocator::new(&mut view);

        let pod = pod_with(vec![gpu_container("c0", 10, 1)]);
        let result = allocator.allocate(&pod).unwrap();

        assert_eq!(annotation(&result, PREDICATE_NODE_ANNOTATION), Some("node0"));
        assert_eq!(annotation(&result, GPU_ASSIGNED_ANNOTATION), Some("false"));
        assert!(annotation(&result, PREDICATE_TIME_ANNOTATION).is_some());
    }

    #[test]
    fn allocation_is_deterministic_for_identical_views() {
        let node = gpu_node("node0", 2, 8);
        let pod = pod_with(vec![gpu_container("c0", 10, 1)]);

        let mut first_view = NodeView::from_node(&node, &[]).unwrap();
        let mut second_view = NodeView::from_node(&node, &[]).unwrap();
        let first = Allocator::new(&mut first_view).allocate(&pod).unwrap();
        let second = Allocator::new(&mut second_view).allocate(&pod).unwrap();

        let key = format!("{PREDICATE_GPU_INDEX_PREFIX}0");
        assert_eq!(annotation(&first, &key), annotation(&second, &key));
    }

    #[test]
    fn gpu_index_annotation_count_matches_gpu_containers() {
        let node = gpu_node("node0", 2, 8);
        let mut view = NodeView::from_node(&node, &[]).unwrap();
        let mut allocator = Allocator::new(&mut view);

        let pod = pod_with(vec![
            gpu_container("c0", 10, 1),
            Container {
                name: "sidecar".to_string(),
                ..Default::default()
            },
        ]);
        let result = allocator.allocate(&pod).unwrap();

        let index_keys = result
            .metadata
            .annotations
            .as_ref()
            .unwrap()
            .keys()
            .filter(|k| k.starts_with(PREDICATE_GPU_INDEX_PREFIX))
            .count();
        assert_eq!(index_keys, 1);
    }
}
