//! Facade over the cluster API: cached pod/node listers plus the few write
//! and point-read operations the admission pipeline needs. The pipeline only
//! depends on the [`ClusterClient`] capability, which keeps it testable
//! against an in-memory implementation.

use std::collections::BTreeMap;

use async_trait::async_trait;
use error_stack::Report;
use error_stack::ResultExt;
use futures::StreamExt;
use k8s_openapi::api::core::v1::ConfigMap;
use k8s_openapi::api::core::v1::Node;
use k8s_openapi::api::core::v1::Pod;
use kube::api::Patch;
use kube::api::PatchParams;
use kube::runtime::reflector;
use kube::runtime::reflector::Store;
use kube::runtime::watcher;
use kube::runtime::WatchStreamExt;
use kube::Api;
use kube::Client;
use tracing::info;
use tracing::warn;

use crate::k8s::types::ClusterError;

#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// Snapshot of all non-succeeded pods in the cluster, served from cache.
    fn list_pods(&self) -> Vec<Pod>;

    /// Snapshot of all nodes, served from cache.
    fn list_nodes(&self) -> Vec<Node>;

    async fn get_config_map(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ConfigMap>, Report<ClusterError>>;

    /// Single strategic-merge patch attempt adding annotations to a pod.
    /// Conflict-class rejections surface as [`ClusterError::PatchRetryable`].
    async fn patch_pod_annotations(
        &self,
        namespace: &str,
        name: &str,
        annotations: BTreeMap<String, String>,
    ) -> Result<(), Report<ClusterError>>;
}

/// Production implementation backed by kube reflector stores.
pub struct KubeClusterClient {
    client: Client,
    pods: Store<Pod>,
    nodes: Store<Node>,
}

impl KubeClusterClient {
    /// Start the pod and node reflectors and wait for their first listing.
    /// The watcher streams run until process shutdown, reconnecting with
    /// backoff on stream failure.
    pub async fn new(client: Client) -> Result<Self, Report<ClusterError>> {
        let pod_api: Api<Pod> = Api::all(client.clone());
        // Succeeded pods hold no reservations, keep them out of the cache.
        let pod_watch_config = watcher::Config::default().fields("status.phase!=Succeeded");
        let (pods, pod_writer) = reflector::store();
        let pod_stream = reflector(pod_writer, watcher(pod_api, pod_watch_config))
            .default_backoff()
            .touched_objects();
        tokio::spawn(async move {
            let mut stream = pod_stream.boxed();
            while let Some(event) = stream.next().await {
                if let Err(e) = event {
                    warn!("pod reflector error: {e}");
                }
            }
        });

        let node_api: Api<Node> = Api::all(client.clone());
        let (nodes, node_writer) = reflector::store();
        let node_stream = reflector(node_writer, watcher(node_api, watcher::Config::default()))
            .default_backoff()
            .touched_objects();
        tokio::spawn(async move {
            let mut stream = node_stream.boxed();
            while let Some(event) = stream.next().await {
                if let Err(e) = event {
                    warn!("node reflector error: {e}");
                }
            }
        });

        pods.wait_until_ready()
            .await
            .change_context(ClusterError::CacheNotReady {
                message: "pod reflector terminated before initial sync".to_string(),
            })?;
        nodes
            .wait_until_ready()
            .await
            .change_context(ClusterError::CacheNotReady {
                message: "node reflector terminated before initial sync".to_string(),
            })?;
        info!("cluster caches synced");

        Ok(Self {
            client,
            pods,
            nodes,
        })
    }
}

#[async_trait]
impl ClusterClient for KubeClusterClient {
    fn list_pods(&self) -> Vec<Pod> {
        self.pods.state().iter().map(|pod| (**pod).clone()).collect()
    }

    fn list_nodes(&self) -> Vec<Node> {
        self.nodes
            .state()
            .iter()
            .map(|node| (**node).clone())
            .collect()
    }

    async fn get_config_map(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ConfigMap>, Report<ClusterError>> {
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
        api.get_opt(name)
            .await
            .change_context(ClusterError::ConfigMapGetFailed {
                namespace: namespace.to_string(),
                name: name.to_string(),
            })
    }

    async fn patch_pod_annotations(
        &self,
        namespace: &str,
        name: &str,
        annotations: BTreeMap<String, String>,
    ) -> Result<(), Report<ClusterError>> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let payload = serde_json::json!({ "metadata": { "annotations": annotations } });
        api.patch(name, &PatchParams::default(), &Patch::Strategic(&payload))
            .await
            .map_err(classify_patch_error)?;
        Ok(())
    }
}

fn classify_patch_error(err: kube::Error) -> Report<ClusterError> {
    match &err {
        kube::Error::Api(response)
            if response.code == 409 || response.reason == "ServerTimeout" =>
        {
            Report::new(ClusterError::PatchRetryable {
                message: response.message.clone(),
            })
        }
        _ => Report::new(ClusterError::PatchFailed {
            message: err.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use kube::core::ErrorResponse;

    use super::*;

    #[test]
    fn conflict_is_classified_retryable() {
        let err = kube::Error::Api(ErrorResponse {
            status: "Failure".to_string(),
            message: "operation cannot be fulfilled".to_string(),
            reason: "Conflict".to_string(),
            code: 409,
        });
        assert!(classify_patch_error(err).current_context().is_retryable());
    }

    #[test]
    fn server_timeout_is_classified_retryable() {
        let err = kube::Error::Api(ErrorResponse {
            status: "Failure".to_string(),
            message: "server timeout".to_string(),
            reason: "ServerTimeout".to_string(),
            code: 504,
        });
        assert!(classify_patch_error(err).current_context().is_retryable());
    }

    #[test]
    fn forbidden_is_terminal() {
        let err = kube::Error::Api(ErrorResponse {
            status: "Failure".to_string(),
            message: "forbidden".to_string(),
            reason: "Forbidden".to_string(),
            code: 403,
        });
        assert!(!classify_patch_error(err).current_context().is_retryable());
    }
}
