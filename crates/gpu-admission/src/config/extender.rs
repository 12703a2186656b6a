use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;

/// Deployment-level knobs of the extender: where the quota configmap lives,
/// which node labels carry GPU model and pool, and the skip-bind delay
/// inserted before the device filter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtenderConfig {
    #[serde(rename = "quotaConfigMapName", default = "default_quota_config_map_name")]
    pub quota_config_map_name: String,

    #[serde(
        rename = "quotaConfigMapNamespace",
        default = "default_quota_config_map_namespace"
    )]
    pub quota_config_map_namespace: String,

    #[serde(rename = "gpuModelLabel", default = "default_gpu_model_label")]
    pub gpu_model_label: String,

    #[serde(rename = "gpuPoolLabel", default = "default_gpu_pool_label")]
    pub gpu_pool_label: String,

    /// The value is empirically calibrated; it papers over bind-visibility
    /// lag between consecutive admission calls and is not a correctness
    /// barrier.
    #[serde(rename = "skipBindDelayMicros", default = "default_skip_bind_delay_micros")]
    pub skip_bind_delay_micros: u64,
}

fn default_quota_config_map_name() -> String {
    "gpu-quota".to_string()
}

fn default_quota_config_map_namespace() -> String {
    "kube-system".to_string()
}

fn default_gpu_model_label() -> String {
    "gpu-model".to_string()
}

fn default_gpu_pool_label() -> String {
    "gpu-pool".to_string()
}

fn default_skip_bind_delay_micros() -> u64 {
    300
}

impl Default for ExtenderConfig {
    fn default() -> Self {
        Self {
            quota_config_map_name: default_quota_config_map_name(),
            quota_config_map_namespace: default_quota_config_map_namespace(),
            gpu_model_label: default_gpu_model_label(),
            gpu_pool_label: default_gpu_pool_label(),
            skip_bind_delay_micros: default_skip_bind_delay_micros(),
        }
    }
}

impl ExtenderConfig {
    /// Load the config from a YAML file.
    pub async fn load(path: &Path) -> anyhow::Result<Self> {
        tracing::info!("Loading extender configuration from {:?}", path);
        let content = tokio::fs::read_to_string(path).await?;
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        let config = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    pub fn skip_bind_delay(&self) -> Duration {
        Duration::from_micros(self.skip_bind_delay_micros)
    }
}
