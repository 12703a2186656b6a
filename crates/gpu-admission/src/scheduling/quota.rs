//! Namespace-level GPU quota, refreshed from a configmap. The store is the
//! only cross-request mutable state the pipeline owns; a single mutex guards
//! the records together with the last synced revision.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use error_stack::Report;
use serde::Deserialize;
use serde::Serialize;
use tokio::select;
use tokio::time::interval;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::k8s::cluster::ClusterClient;
use crate::k8s::types::ClusterError;

/// Single data key of the quota configmap holding the JSON document.
pub const QUOTA_DATA_KEY: &str = "gpu_quota";

const REFRESH_PERIOD: Duration = Duration::from_secs(5);

/// Quota of one namespace: per-model limits in whole GPUs, plus the pools
/// the namespace may schedule into. An empty pool list permits any pool.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QuotaRecord {
    #[serde(default)]
    pub limits: HashMap<String, u64>,
    #[serde(default)]
    pub pools: Vec<String>,
}

impl QuotaRecord {
    pub fn permits_pool(&self, pool: Option<&str>) -> bool {
        if self.pools.is_empty() {
            return true;
        }
        pool.is_some_and(|p| self.pools.iter().any(|permitted| permitted == p))
    }
}

#[derive(Debug, Default)]
struct QuotaState {
    records: HashMap<String, QuotaRecord>,
    last_synced_revision: Option<String>,
    synced: bool,
}

#[derive(Debug)]
pub struct QuotaStore {
    state: Mutex<QuotaState>,
    config_map_name: String,
    config_map_namespace: String,
}

impl QuotaStore {
    pub fn new(config_map_name: &str, config_map_namespace: &str) -> Self {
        Self {
            state: Mutex::new(QuotaState::default()),
            config_map_name: config_map_name.to_string(),
            config_map_namespace: config_map_namespace.to_string(),
        }
    }

    /// Quota record of the namespace, if one is configured.
    pub fn get(&self, namespace: &str) -> Option<QuotaRecord> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.records.get(namespace).cloned()
    }

    /// Replace the whole record set. Marks the store synced: until the first
    /// call the pipeline refuses to admit, otherwise quota would leak on
    /// cold start.
    pub fn set_all(&self, records: HashMap<String, QuotaRecord>, revision: Option<String>) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.records = records;
        state.last_synced_revision = revision;
        state.synced = true;
    }

    pub fn has_ever_synced(&self) -> bool {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.synced
    }

    fn last_synced_revision(&self) -> Option<String> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.last_synced_revision.clone()
    }

    /// Refresh loop, running until cancellation.
    pub async fn run(
        self: Arc<Self>,
        cluster: Arc<dyn ClusterClient>,
        token: CancellationToken,
    ) {
        info!(
            configmap = format!("{}/{}", self.config_map_namespace, self.config_map_name),
            "starting quota refresher"
        );
        let mut tick = interval(REFRESH_PERIOD);
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            select! {
                _ = token.cancelled() => {
                    info!("quota refresher shutdown requested");
                    break;
                }
                _ = tick.tick() => {
                    if let Err(e) = self.refresh_once(cluster.as_ref()).await {
                        warn!("quota refresh failed: {e:?}");
                    }
                }
            }
        }
    }

    /// One refresh attempt. A missing configmap clears the store but still
    /// counts as a sync; an unchanged resource version skips the parse; a
    /// parse failure keeps the previous records.
    pub async fn refresh_once(
        &self,
        cluster: &dyn ClusterClient,
    ) -> Result<(), Report<ClusterError>> {
        let config_map = cluster
            .get_config_map(&self.config_map_namespace, &self.config_map_name)
            .await?;

        let Some(config_map) = config_map else {
            debug!(
                name = self.config_map_name,
                "quota configmap not found, treating all namespaces as unlimited"
            );
            self.set_all(HashMap::new(), None);
            return Ok(());
        };

        let revision = config_map.metadata.resource_version.clone();
        if self.has_ever_synced() && revision == self.last_synced_revision() {
            return Ok(());
        }

        let records = match config_map
            .data
            .as_ref()
            .and_then(|data| data.get(QUOTA_DATA_KEY))
        {
            Some(raw) => match serde_json::from_str::<HashMap<String, QuotaRecord>>(raw) {
                Ok(records) => records,
                Err(e) => {
                    warn!(
                        key = QUOTA_DATA_KEY,
                        "ignoring malformed quota document: {e}"
                    );
                    return Ok(());
                }
            },
            None => HashMap::new(),
        };

        info!(namespaces = records.len(), "quota records loaded");
        self.set_all(records, revision);
        Ok(())
    }
}
