//! The admission pipeline. Stages run strictly in order for one request:
//! non-GPU fast path, quota-sync gate, quota filter, skip-bind debounce,
//! device filter. The device filter accepts at most one node and patches the
//! pod's predicate annotations before answering, making the annotation layer
//! the authoritative ledger for the next request.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::core::v1::Node;
use k8s_openapi::api::core::v1::Pod;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::api::types::ExtenderArgs;
use crate::api::types::ExtenderFilterResult;
use crate::api::types::FailedNodesMap;
use crate::api::types::HostPriority;
use crate::config::ExtenderConfig;
use crate::k8s::cluster::ClusterClient;
use crate::k8s::resources::effective_node_name;
use crate::k8s::resources::is_gpu_enabled_node;
use crate::k8s::resources::is_gpu_required_pod;
use crate::k8s::resources::is_pod_finished;
use crate::k8s::resources::is_pod_on_node;
use crate::k8s::resources::is_predicated_pod;
use crate::k8s::resources::node_label;
use crate::k8s::resources::pod_gpu_resource;
use crate::k8s::resources::GPU_ASSIGNED_ANNOTATION;
use crate::k8s::resources::HUNDRED_CORE;
use crate::k8s::resources::PREDICATE_GPU_INDEX_PREFIX;
use crate::k8s::resources::PREDICATE_NODE_ANNOTATION;
use crate::k8s::resources::PREDICATE_TIME_ANNOTATION;
use crate::k8s::resources::VCORE_RESOURCE;
use crate::scheduling::allocate::Allocator;
use crate::scheduling::node_view::sort_views;
use crate::scheduling::node_view::NodeView;
use crate::scheduling::quota::QuotaStore;

pub const FILTER_NAME: &str = "GPUPredicate";

const PATCH_RETRY_INTERVAL: Duration = Duration::from_secs(1);
const PATCH_WAIT_TIMEOUT: Duration = Duration::from_secs(10);

pub struct GpuFilter {
    cluster: Arc<dyn ClusterClient>,
    quota: Arc<QuotaStore>,
    config: ExtenderConfig,
}

impl GpuFilter {
    pub fn new(
        cluster: Arc<dyn ClusterClient>,
        quota: Arc<QuotaStore>,
        config: ExtenderConfig,
    ) -> Self {
        Self {
            cluster,
            quota,
            config,
        }
    }

    /// Run the whole pipeline for one admission request.
    pub async fn filter(&self, args: ExtenderArgs) -> ExtenderFilterResult {
        let Some(pod) = args.pod else {
            return ExtenderFilterResult::with_error("request carries no pod");
        };

        // Pods without GPU requests are none of our business.
        if !is_gpu_required_pod(&pod) {
            debug!(
                pod = pod.metadata.name.as_deref().unwrap_or_default(),
                "pod requests no GPU resource, passing all nodes"
            );
            return ExtenderFilterResult {
                nodes: args.nodes,
                node_names: args.node_names,
                failed_nodes: None,
                error: String::new(),
            };
        }

        // Admitting before the first quota load would leak quota.
        if !self.quota.has_ever_synced() {
            return ExtenderFilterResult::with_error(
                "gpu quota has not been synced yet, retry later",
            );
        }

        let candidates = args.nodes.map(|list| list.items).unwrap_or_default();
        let (remaining, mut failed_nodes) = self.quota_filter(&pod, candidates);

        // Give the previous admission's bind a chance to become visible
        // before replaying node state. Heuristic, not a correctness barrier.
        tokio::time::sleep(self.config.skip_bind_delay()).await;

        let (accepted, device_failed, error) = self.device_filter(&pod, remaining).await;
        failed_nodes.extend(device_failed);

        match error {
            Some(error) => ExtenderFilterResult {
                nodes: None,
                node_names: None,
                failed_nodes: Some(failed_nodes),
                error,
            },
            None => ExtenderFilterResult::decision(accepted, failed_nodes),
        }
    }

    /// Namespace quota over GPU models and pools. Without a record for the
    /// pod's namespace every candidate passes; with one, only nodes whose
    /// model stays within its limit and whose pool is permitted survive.
    fn quota_filter(&self, pod: &Pod, candidates: Vec<Node>) -> (Vec<Node>, FailedNodesMap) {
        let namespace = pod.metadata.namespace.as_deref().unwrap_or("default");
        let Some(record) = self.quota.get(namespace) else {
            return (candidates, FailedNodesMap::new());
        };

        let cluster_nodes = self.cluster.list_nodes();
        let model_of_node: HashMap<&str, &str> = cluster_nodes
            .iter()
            .filter_map(|node| {
                let name = node.metadata.name.as_deref()?;
                let model = node_label(node, &self.config.gpu_model_label)?;
                Some((name, model))
            })
            .collect();

        let pods = self.cluster.list_pods();
        let pod_request = pod_gpu_resource(pod, VCORE_RESOURCE);

        let mut accepted_models: HashSet<&str> = HashSet::new();
        for (model, limit) in &record.limits {
            let used: u64 = pods
                .iter()
                .filter(|p| p.metadata.namespace.as_deref() == Some(namespace))
                .filter(|p| !is_pod_finished(p))
                .filter(|p| {
                    effective_node_name(p)
                        .and_then(|node| model_of_node.get(node))
                        .is_some_and(|m| *m == model.as_str())
                })
                .map(|p| pod_gpu_resource(p, VCORE_RESOURCE))
                .sum();

            if used + pod_request <= limit * HUNDRED_CORE {
                accepted_models.insert(model.as_str());
            } else {
                info!(
                    namespace,
                    model,
                    used,
                    limit,
                    "namespace exhausted its quota for this GPU model"
                );
            }
        }

        let mut passed = Vec::new();
        let mut failed = FailedNodesMap::new();
        for node in candidates {
            let name = node.metadata.name.clone().unwrap_or_default();
            let model_accepted = node_label(&node, &self.config.gpu_model_label)
                .is_some_and(|model| accepted_models.contains(model));
            if !model_accepted {
                failed.insert(name, "ExceedsGPUQuota".to_string());
                continue;
            }
            if !record.permits_pool(node_label(&node, &self.config.gpu_pool_label)) {
                failed.insert(name, "GPU pool not permitted".to_string());
                continue;
            }
            passed.push(node);
        }
        (passed, failed)
    }

    /// Choose one and only one node that fulfils the request, so this must
    /// always be the last filter stage. On success the pod's annotations are
    /// already patched when the decision is returned.
    async fn device_filter(
        &self,
        pod: &Pod,
        candidates: Vec<Node>,
    ) -> (Vec<Node>, FailedNodesMap, Option<String>) {
        let pod_name = pod.metadata.name.as_deref().unwrap_or_default();
        let pod_uid = pod.metadata.uid.as_deref().unwrap_or_default();
        let mut failed = FailedNodesMap::new();

        // A predicated pod already holds reservations; re-predicating it
        // would double-book devices under scheduler retries.
        if is_predicated_pod(pod) {
            info!(pod = pod_name, "pod had been predicated");
            for node in &candidates {
                let name = node.metadata.name.clone().unwrap_or_default();
                failed.insert(name, "pod already predicated".to_string());
            }
            return (Vec::new(), failed, None);
        }

        let all_pods = self.cluster.list_pods();
        let mut views = Vec::new();
        for node in &candidates {
            let name = node.metadata.name.clone().unwrap_or_default();
            if !is_gpu_enabled_node(node) {
                failed.insert(name, "no GPU device".to_string());
                continue;
            }
            let on_node: Vec<Pod> = all_pods
                .iter()
                .filter(|p| is_pod_on_node(p, &name))
                .cloned()
                .collect();
            match NodeView::from_node(node, &on_node) {
                Some(view) => views.push(view),
                None => {
                    failed.insert(name, "no GPU device".to_string());
                }
            }
        }
        sort_views(&mut views);

        let mut accepted = Vec::new();
        for view in &mut views {
            let node_name = view.name().to_string();
            if !accepted.is_empty() {
                failed.insert(
                    node_name,
                    format!("pod {pod_uid} has already been matched to another node"),
                );
                continue;
            }

            let new_pod = match Allocator::new(view).allocate(pod) {
                Ok(new_pod) => new_pod,
                Err(e) => {
                    debug!(pod = pod_name, node = node_name, "allocation failed: {e}");
                    failed.insert(
                        node_name,
                        format!("pod {pod_uid} does not match with this node"),
                    );
                    continue;
                }
            };

            let annotations = predicate_annotations(&new_pod);
            if let Err(message) = self.patch_with_retry(&new_pod, annotations).await {
                failed.insert(node_name, "update pod annotation failed".to_string());
                return (Vec::new(), failed, Some(message));
            }
            accepted.push(view.node().clone());
        }

        (accepted, failed, None)
    }

    /// Strategic-merge patch of the predicate annotations, polled every
    /// second for up to ten seconds while the rejection stays retryable.
    async fn patch_with_retry(
        &self,
        pod: &Pod,
        annotations: BTreeMap<String, String>,
    ) -> Result<(), String> {
        let namespace = pod.metadata.namespace.as_deref().unwrap_or("default");
        let name = pod.metadata.name.as_deref().unwrap_or_default();
        let mut attempts = PATCH_WAIT_TIMEOUT.as_secs() / PATCH_RETRY_INTERVAL.as_secs();

        loop {
            match self
                .cluster
                .patch_pod_annotations(namespace, name, annotations.clone())
                .await
            {
                Ok(()) => return Ok(()),
                Err(report) if report.current_context().is_retryable() && attempts > 0 => {
                    attempts -= 1;
                    debug!(pod = name, "pod patch conflicted, retrying: {report:?}");
                    tokio::time::sleep(PATCH_RETRY_INTERVAL).await;
                }
                Err(report) => {
                    let message =
                        format!("failed to add annotations to pod {name}: {report:?}");
                    warn!("{message}");
                    return Err(message);
                }
            }
        }
    }

    /// Prefer CPU-only nodes: a trivial secondary priority keeping non-GPU
    /// workloads off GPU capacity.
    pub fn prioritize(&self, args: &ExtenderArgs) -> Vec<HostPriority> {
        args.nodes
            .as_ref()
            .map(|list| {
                list.items
                    .iter()
                    .map(|node| HostPriority {
                        host: node.metadata.name.clone().unwrap_or_default(),
                        score: if is_gpu_enabled_node(node) { 0 } else { 1 },
                    })
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Subset of a pod's annotations belonging to this system's placement
/// ledger, the only keys the write-back patches.
fn predicate_annotations(pod: &Pod) -> BTreeMap<String, String> {
    pod.metadata
        .annotations
        .as_ref()
        .map(|annotations| {
            annotations
                .iter()
                .filter(|(key, _)| {
                    key.contains(GPU_ASSIGNED_ANNOTATION)
                        || key.contains(PREDICATE_TIME_ANNOTATION)
                        || key.contains(PREDICATE_GPU_INDEX_PREFIX)
                        || key.contains(PREDICATE_NODE_ANNOTATION)
                })
                .map(|(key, value)| (key.clone(), value.clone()))
                .collect()
        })
        .unwrap_or_default()
}
