pub mod client;
pub mod cluster;
pub mod resources;
pub mod types;

pub use client::init_kube_client;
pub use cluster::ClusterClient;
pub use cluster::KubeClusterClient;
pub use types::ClusterError;
