use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand, ValueEnum};
use k8s_gpu_operator::{
    controller::{self, DEFAULT_COMPONENTS},
    crd::GpuCluster,
    Error,
};
use kube::ResourceExt;
use tracing::{info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the operator
    Run(RunArgs),
    /// Show version information
    Version,
    /// Show the GpuClusters found in the cluster
    Info,
}

#[derive(Clone, Copy, Debug, Default, ValueEnum)]
enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Parser, Debug)]
struct RunArgs {
    /// Namespace the GPU components are deployed into
    #[arg(long, env = "OPERATOR_NAMESPACE")]
    namespace: String,

    /// Directory holding one manifest directory per component
    #[arg(long, env = "MANIFEST_DIR", default_value = "/opt/k8s-gpu-operator")]
    manifest_dir: PathBuf,

    /// Components to deploy, in order
    #[arg(
        long,
        env = "COMPONENTS",
        value_delimiter = ',',
        default_values_t = DEFAULT_COMPONENTS.iter().map(|c| c.to_string()).collect::<Vec<_>>()
    )]
    components: Vec<String>,

    /// Log output format
    #[arg(long, env = "LOG_FORMAT", value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    match args.command {
        Commands::Version => {
            println!("k8s-gpu-operator v{}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        Commands::Info => Ok(run_info().await?),
        Commands::Run(run_args) => Ok(run_operator(run_args).await?),
    }
}

fn init_tracing(format: LogFormat) {
    let env_filter = EnvFilter::builder()
        .with_default_directive(Level::INFO.into())
        .from_env_lossy();

    let registry = tracing_subscriber::registry().with(env_filter);
    match format {
        LogFormat::Text => registry.with(fmt::layer().with_target(true)).init(),
        LogFormat::Json => registry.with(fmt::layer().json()).init(),
    }
}

async fn run_info() -> Result<(), Error> {
    let client = kube::Client::try_default()
        .await
        .map_err(Error::KubeError)?;

    let api: kube::Api<GpuCluster> = kube::Api::all(client);
    let clusters = api
        .list(&Default::default())
        .await
        .map_err(Error::KubeError)?;

    println!("GpuClusters: {}", clusters.items.len());
    for cluster in &clusters.items {
        let state = cluster
            .status
            .as_ref()
            .map(|s| s.state.to_string())
            .unwrap_or_else(|| "unknown".to_string());
        println!("  {} ({})", cluster.name_any(), state);
    }
    Ok(())
}

async fn run_operator(args: RunArgs) -> Result<(), Error> {
    init_tracing(args.log_format);

    info!(
        "Starting k8s-gpu-operator v{} in namespace {}",
        env!("CARGO_PKG_VERSION"),
        args.namespace
    );

    if args.namespace.is_empty() {
        return Err(Error::ConfigError(
            "OPERATOR_NAMESPACE must not be empty".to_string(),
        ));
    }
    controller::validate_component_names(&args.components)?;

    let client = kube::Client::try_default()
        .await
        .map_err(Error::KubeError)?;

    info!("Connected to Kubernetes cluster");

    let state = Arc::new(controller::ControllerState::new(
        client,
        args.namespace,
        args.manifest_dir,
        args.components,
    ));

    controller::run_controller(state).await
}
