//! Stakeward - bring validator identities onto a running network.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use stakeward_control::cluster::{WorkloadGroupSpec, WorkloadHandle};
use stakeward_control::service::shutdown_signal;
use stakeward_control::{NetworkFile, RegistrationService, StakewardConfig};

#[derive(Parser)]
#[command(name = "stakeward")]
#[command(about = "Provision validators onto a running network")]
#[command(version)]
struct Cli {
    /// Configuration file (defaults to stakeward.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Register the network's non-genesis stakers as validators
    Register {
        /// Network name, or path to the network file
        network: String,

        /// Total number of validators to run, genesis stakers included
        #[arg(short, long)]
        validators: Option<usize>,

        /// Overall timeout in seconds (overrides coordinator.run_timeout)
        #[arg(short, long)]
        timeout: Option<u64>,
    },

    /// Wait for a workload group to become ready
    WaitReady {
        /// Full workload group name
        group: String,

        /// Desired replica count
        #[arg(short, long)]
        replicas: u32,

        /// Namespace (overrides cluster.namespace)
        #[arg(short, long)]
        namespace: Option<String>,

        /// Timeout in seconds (overrides readiness.timeout)
        #[arg(short, long)]
        timeout: Option<u64>,
    },

    /// Create or update a workload group from a JSON manifest
    Apply {
        /// Stateful-set manifest
        manifest: PathBuf,

        /// Wait for the group to become ready
        #[arg(short, long)]
        wait: bool,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive(
                "stakeward_control=info"
                    .parse()
                    .unwrap_or_else(|_| tracing::Level::INFO.into()),
            ),
        )
        .init();

    let cli = Cli::parse();

    if let Err(e) = run(cli).await {
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = match &cli.config {
        Some(path) => StakewardConfig::from_file(path),
        None => StakewardConfig::load(),
    }
    .context("failed to load configuration")?;

    match cli.command {
        Commands::Register {
            network,
            validators,
            timeout,
        } => register(config, &network, validators, timeout).await,
        Commands::WaitReady {
            group,
            replicas,
            namespace,
            timeout,
        } => wait_ready(config, group, replicas, namespace, timeout).await,
        Commands::Apply { manifest, wait } => apply(config, &manifest, wait).await,
    }
}

/// Resolve a network argument into its name and file path.
fn network_path(network: &str) -> (String, PathBuf) {
    let path = Path::new(network);
    if path.extension().is_some_and(|ext| ext == "json") {
        let name = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| network.to_owned());
        (name, path.to_path_buf())
    } else {
        (network.to_owned(), PathBuf::from(format!("{network}.json")))
    }
}

fn service(config: StakewardConfig, network: &str) -> anyhow::Result<RegistrationService> {
    let service = RegistrationService::from_config(config, network)?;
    tokio::spawn(shutdown_signal(service.cancel_token()));
    Ok(service)
}

async fn register(
    mut config: StakewardConfig,
    network: &str,
    validators: Option<usize>,
    timeout: Option<u64>,
) -> anyhow::Result<()> {
    let (name, path) = network_path(network);
    let file = NetworkFile::load(&path)
        .with_context(|| format!("failed to load network file {}", path.display()))?;
    let validators = validators.unwrap_or(file.stakers.len());
    let stakers = file.stakers_to_register(validators)?.to_vec();

    if let Some(secs) = timeout {
        config.coordinator.run_timeout = Duration::from_secs(secs);
    }
    // The bootstrap group runs one validator; the validator group runs the rest.
    let others = u32::try_from(validators.saturating_sub(1)).context("too many validators")?;
    config.cluster.expect_validators(others);

    info!(
        network = %name,
        version = %file.version,
        validators,
        to_register = stakers.len(),
        "starting registration"
    );

    let service = service(config, &name)?;
    let summary = service.register(&name, stakers).await?;
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

async fn wait_ready(
    mut config: StakewardConfig,
    group: String,
    replicas: u32,
    namespace: Option<String>,
    timeout: Option<u64>,
) -> anyhow::Result<()> {
    if namespace.is_some() {
        config.cluster.namespace = namespace;
    }
    let namespace = config
        .cluster
        .namespace
        .clone()
        .unwrap_or_else(|| "default".to_owned());
    let timeout = timeout.map_or(config.readiness.timeout, Duration::from_secs);

    let service = service(config, &namespace)?;
    let handle = WorkloadHandle::new(namespace, group);
    let status = service.wait_group(&handle, replicas, timeout).await?;
    println!(
        "{handle} ready: {}/{} replicas",
        status.ready_replicas, replicas
    );
    Ok(())
}

async fn apply(config: StakewardConfig, manifest: &Path, wait: bool) -> anyhow::Result<()> {
    let body = std::fs::read(manifest)
        .with_context(|| format!("failed to read {}", manifest.display()))?;
    let spec = WorkloadGroupSpec::from_manifest(serde_json::from_slice(&body)?)?;
    let namespace = spec
        .namespace
        .clone()
        .or_else(|| config.cluster.namespace.clone())
        .unwrap_or_else(|| "default".to_owned());

    let service = service(config, &namespace)?;
    let (handle, status) = service.apply(&spec, wait).await?;
    match status {
        Some(status) => println!(
            "{handle} ready: {}/{} replicas",
            status.ready_replicas, spec.replicas
        ),
        None => println!("{handle} applied"),
    }
    Ok(())
}
