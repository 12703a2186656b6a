//! Request-local reconstruction of a node's GPU usage. There is no persistent
//! ledger: every admission request replays the predicate annotations of the
//! pods already on (or predicted onto) the node.

use k8s_openapi::api::core::v1::Node;
use k8s_openapi::api::core::v1::Pod;
use tracing::info;

use crate::k8s::resources::container_gpu_resource;
use crate::k8s::resources::gpu_device_count;
use crate::k8s::resources::node_capacity;
use crate::k8s::resources::predicate_indexes;
use crate::k8s::resources::HUNDRED_CORE;
use crate::k8s::resources::VCORE_RESOURCE;
use crate::k8s::resources::VMEMORY_RESOURCE;
use crate::scheduling::device::Device;
use crate::scheduling::device::DeviceError;

#[derive(Debug, Clone)]
pub struct NodeView {
    node: Node,
    name: String,
    devices: Vec<Device>,
    device_total_memory: u64,
    total_memory: u64,
    used_core: u64,
    used_memory: u64,
}

impl NodeView {
    /// Build the view from the node object and the pods occupying it,
    /// replaying each container's prior reservation. Returns `None` for
    /// nodes that advertise no whole GPU device.
    pub fn from_node(node: &Node, pods: &[Pod]) -> Option<Self> {
        let device_count = gpu_device_count(node);
        if device_count == 0 {
            return None;
        }

        let name = node.metadata.name.clone().unwrap_or_default();
        let total_memory = node_capacity(node, VMEMORY_RESOURCE);
        // memory is uniformly split across the node's devices
        let device_total_memory = total_memory / device_count as u64;
        let devices = (0..device_count)
            .map(|id| Device::new(id, device_total_memory))
            .collect();

        let mut view = Self {
            node: node.clone(),
            name,
            devices,
            device_total_memory,
            total_memory,
            used_core: 0,
            used_memory: 0,
        };

        for pod in pods {
            view.replay_pod(pod);
        }

        Some(view)
    }

    /// Replay one neighbor pod's reservations into the view. Out-of-range
    /// indices and overflowing reservations are dropped, not fatal: the
    /// cluster's own scheduling layer eventually reconciles such pods.
    fn replay_pod(&mut self, pod: &Pod) {
        let Some(spec) = pod.spec.as_ref() else {
            return;
        };
        for (i, container) in spec.containers.iter().enumerate() {
            let Some(indexes) = predicate_indexes(pod, i) else {
                continue;
            };
            for index in indexes {
                if index >= self.devices.len() {
                    info!(
                        node = self.name,
                        index, "predicate index larger than device count"
                    );
                    continue;
                }
                let mut vcore = container_gpu_resource(container, VCORE_RESOURCE);
                let vmemory;
                if vcore < HUNDRED_CORE {
                    vmemory = container_gpu_resource(container, VMEMORY_RESOURCE);
                } else {
                    vcore = HUNDRED_CORE;
                    vmemory = self.device_total_memory;
                }
                if let Err(e) = self.reserve(index, vcore, vmemory) {
                    info!(
                        node = self.name,
                        device = index,
                        "failed to replay reservation: {e}"
                    );
                }
            }
        }
    }

    /// Charge a reservation against one device and the node aggregates.
    pub fn reserve(&mut self, device_id: usize, cores: u64, memory: u64) -> Result<(), DeviceError> {
        self.devices[device_id].reserve(cores, memory)?;
        self.used_core += cores;
        self.used_memory += memory;
        Ok(())
    }

    pub fn node(&self) -> &Node {
        &self.node
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn device_count(&self) -> usize {
        self.devices.len()
    }

    pub fn devices(&self) -> &[Device] {
        &self.devices
    }

    pub fn device_total_memory(&self) -> u64 {
        self.device_total_memory
    }

    pub fn used_core(&self) -> u64 {
        self.used_core
    }

    pub fn used_memory(&self) -> u64 {
        self.used_memory
    }

    /// Remaining vcores across all devices.
    pub fn available_cores(&self) -> u64 {
        self.devices.len() as u64 * HUNDRED_CORE - self.used_core
    }

    /// Remaining vcuda memory across all devices.
    pub fn available_memory(&self) -> u64 {
        self.total_memory - self.used_memory
    }
}

/// Most-loaded-first total order over node views: ascending
/// `(available_cores, available_memory, name)`. Filling busy nodes before
/// untouched ones minimizes fragmentation across the cluster.
pub fn sort_views(views: &mut [NodeView]) {
    views.sort_by(|a, b| {
        (a.available_cores(), a.available_memory(), a.name())
            .cmp(&(b.available_cores(), b.available_memory(), b.name()))
    });
}
