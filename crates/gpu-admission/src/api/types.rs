//! Scheduler-extender wire structures. Field casing follows the upstream
//! extender v1 contract, hence the explicit renames.

use std::collections::HashMap;

use k8s_openapi::api::core::v1::Node;
use k8s_openapi::api::core::v1::Pod;
use serde::Deserialize;
use serde::Serialize;

pub type NodeList = k8s_openapi::List<Node>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtenderArgs {
    #[serde(rename = "Pod")]
    pub pod: Option<Pod>,

    #[serde(rename = "Nodes", default)]
    pub nodes: Option<NodeList>,

    /// Populated instead of `Nodes` when the primary scheduler runs with
    /// node caching; this extender does not support that mode.
    #[serde(rename = "NodeNames", default)]
    pub node_names: Option<Vec<String>>,
}

pub type FailedNodesMap = HashMap<String, String>;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExtenderFilterResult {
    #[serde(rename = "Nodes")]
    pub nodes: Option<NodeList>,

    #[serde(rename = "NodeNames", default)]
    pub node_names: Option<Vec<String>>,

    #[serde(rename = "FailedNodes")]
    pub failed_nodes: Option<FailedNodesMap>,

    #[serde(rename = "Error", default)]
    pub error: String,
}

impl ExtenderFilterResult {
    /// Request-level failure: no decision, only an error string.
    pub fn with_error(error: impl Into<String>) -> Self {
        Self {
            nodes: None,
            node_names: None,
            failed_nodes: None,
            error: error.into(),
        }
    }

    /// Decision over an explicit node list.
    pub fn decision(accepted: Vec<Node>, failed_nodes: FailedNodesMap) -> Self {
        Self {
            nodes: Some(NodeList {
                items: accepted,
                metadata: Default::default(),
            }),
            node_names: None,
            failed_nodes: Some(failed_nodes),
            error: String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostPriority {
    #[serde(rename = "Host")]
    pub host: String,

    #[serde(rename = "Score")]
    pub score: i64,
}
