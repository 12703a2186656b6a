use clap::Parser;
use std::path::PathBuf;
use utils::version;

#[derive(Parser)]
#[command(about = "GPU admission scheduler extender", version = &**version::VERSION)]
pub struct Cli {
    #[arg(
        long,
        default_value = "127.0.0.1:3456",
        help = "The address it will listen"
    )]
    pub address: String,

    #[arg(
        long = "pprof-address",
        alias = "pprofAddress",
        help = "The address of the secondary debug listener"
    )]
    pub pprof_address: Option<String>,

    #[arg(
        long,
        env = "KUBECONFIG",
        value_hint = clap::ValueHint::FilePath,
        help = "Path to a kubeconfig. Only required if out-of-cluster"
    )]
    pub kubeconfig: Option<PathBuf>,

    #[arg(
        long,
        help = "The address of the Kubernetes API server. Overrides any value in kubeconfig. Only required if out-of-cluster"
    )]
    pub master: Option<String>,

    #[arg(
        long,
        value_hint = clap::ValueHint::FilePath,
        help = "Path to the extender config file, e.g. /etc/gpu-admission/extender.yaml"
    )]
    pub config: Option<PathBuf>,

    #[arg(
        long = "incluster-mode",
        default_value_t = false,
        help = "Use the in-cluster service account instead of a kubeconfig"
    )]
    pub incluster_mode: bool,
}
