use std::path::PathBuf;

use error_stack::Report;
use error_stack::ResultExt;
use kube::config::KubeConfigOptions;
use kube::config::Kubeconfig;
use kube::Client;
use kube::Config;

use crate::k8s::types::ClusterError;

/// Build a Kubernetes client from the CLI surface: explicit kubeconfig,
/// master URL override, in-cluster service account, or the ambient default.
pub async fn init_kube_client(
    kubeconfig: Option<PathBuf>,
    master: Option<String>,
    incluster_mode: bool,
) -> Result<Client, Report<ClusterError>> {
    if incluster_mode {
        let config = Config::incluster().change_context(ClusterError::ConnectionFailed {
            message: "Failed to load in-cluster configuration".to_string(),
        })?;
        return Client::try_from(config).change_context(ClusterError::ConnectionFailed {
            message: "Failed to create Kubernetes client from in-cluster config".to_string(),
        });
    }

    let client = match kubeconfig {
        Some(kubeconfig_path) => {
            // Load kubeconfig from the specified file
            let kubeconfig = Kubeconfig::read_from(&kubeconfig_path).change_context(
                ClusterError::ConnectionFailed {
                    message: format!(
                        "Failed to read kubeconfig file: {}",
                        kubeconfig_path.display()
                    ),
                },
            )?;

            let mut config =
                Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                    .await
                    .change_context(ClusterError::ConnectionFailed {
                        message: format!(
                            "Failed to create config from kubeconfig: {}",
                            kubeconfig_path.display()
                        ),
                    })?;

            if let Some(master_url) = master {
                config.cluster_url = parse_master_url(&master_url)?;
            }

            Client::try_from(config).change_context(ClusterError::ConnectionFailed {
                message: "Failed to create Kubernetes client from custom kubeconfig".to_string(),
            })?
        }
        None => match master {
            Some(master_url) => {
                let config = Config::new(parse_master_url(&master_url)?);
                Client::try_from(config).change_context(ClusterError::ConnectionFailed {
                    message: format!("Failed to create Kubernetes client for {master_url}"),
                })?
            }
            None => {
                // Use default configuration (in-cluster or ~/.kube/config)
                Client::try_default()
                    .await
                    .change_context(ClusterError::ConnectionFailed {
                        message: "Failed to create Kubernetes client".to_string(),
                    })?
            }
        },
    };
    Ok(client)
}

fn parse_master_url(master: &str) -> Result<http::Uri, Report<ClusterError>> {
    master
        .parse::<http::Uri>()
        .change_context(ClusterError::ConnectionFailed {
            message: format!("Invalid master URL: {master}"),
        })
}
