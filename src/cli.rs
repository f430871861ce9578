use clap::{Args, Parser, Subcommand};

#[derive(Parser)]
#[command(name = "kubewarden-controller")]
#[command(about = "Kubernetes controller turning policy resources into admission infrastructure")]
#[command(version = env!("CARGO_PKG_VERSION"))]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Display application version
    Version,

    /// Check cluster connectivity and permissions
    Check,

    /// Start the controller: reconcilers, admission webhooks, metrics
    Run(RunArgs),

    /// Manage the policies.kubewarden.io CRDs
    Crd {
        #[command(subcommand)]
        action: CrdAction,
    },
}

#[derive(Args)]
pub struct RunArgs {
    /// Address the metrics endpoint binds to
    #[arg(long, default_value = ":8088")]
    pub metrics_bind_address: String,

    /// Address the health probe endpoint binds to
    #[arg(long, default_value = ":8081")]
    pub health_probe_bind_address: String,

    /// Enable leader election: only one controller instance is active
    #[arg(long)]
    pub leader_elect: bool,

    /// Enable metrics collection (controller and policy servers)
    #[arg(long)]
    pub enable_metrics: bool,

    /// Enable tracing collection on the policy servers
    #[arg(long)]
    pub enable_tracing: bool,

    /// OpenTelemetry collector endpoint passed to the policy servers
    #[arg(long, default_value = "127.0.0.1:4317")]
    pub opentelemetry_endpoint: String,

    /// Namespace where policy-server Deployments, Services, ConfigMaps and
    /// Secrets live
    #[arg(long, env = "NAMESPACE", required = true)]
    pub deployments_namespace: String,

    /// Append a NotIn clause for the deployments namespace to every
    /// cluster-scoped webhook, so reviews there are always accepted
    #[arg(long)]
    pub always_accept_admission_reviews_on_deployments_namespace: bool,

    /// PolicyServer name stamped into policies that do not set one
    #[arg(long, default_value = "default")]
    pub default_policy_server: String,

    /// Address the CRD admission webhook server binds to
    #[arg(long, env = "WEBHOOK_HOST_LISTEN", default_value = ":9443")]
    pub webhook_bind_address: String,

    /// Directory holding tls.crt / tls.key for the webhook server
    #[arg(long, default_value = "/tmp/kubewarden/webhook-certs")]
    pub webhook_cert_dir: String,
}

#[derive(Subcommand)]
pub enum CrdAction {
    /// Print all CRD YAML documents to stdout
    Generate,

    /// Install the CRDs into the connected cluster
    Install,
}

/// `:8088` style bind addresses get the wildcard host prepended.
pub fn parse_bind_address(address: &str) -> anyhow::Result<std::net::SocketAddr> {
    let address = if address.starts_with(':') {
        format!("0.0.0.0{address}")
    } else {
        address.to_string()
    };
    address
        .parse()
        .map_err(|e| anyhow::anyhow!("invalid bind address {address:?}: {e}"))
}
