//! svpn: SecureVPN command line client
//!
//! Composition root for the session controller. Loads configuration,
//! picks the tunnel backend and issuance client, and drives one session.

use anyhow::{Context, Result, anyhow};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use svpn_session::backend;
use svpn_session::provisioner::{HttpKeyProvisioner, SimulatedProvisioner};
use svpn_session::{
    BackendKind, Endpoint, KeyProvisioner, ProfileSource, SessionConfig, SessionController,
    TunnelProfile,
};
use tokio::signal;
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

// Use mimalloc as the global allocator for reduced memory fragmentation
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

/// SecureVPN session client
#[derive(Parser)]
#[command(name = "svpn", author, version, about, long_about = None)]
struct Cli {
    /// Configuration file (.toml or .json); built-in defaults when absent
    #[arg(short, long, env = "SVPN_CONFIG")]
    config: Option<PathBuf>,

    /// Tunnel backend (auto, simulated, desktop), overriding the config
    #[arg(short, long)]
    backend: Option<BackendKind>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List configured endpoints
    Endpoints,

    /// Connect and report status until Ctrl-C
    Connect {
        /// Endpoint country label
        label: String,

        /// Disconnect after this many seconds
        #[arg(short, long)]
        seconds: Option<u64>,
    },

    /// Write a tunnel profile for use outside this client
    Export {
        /// Endpoint country label
        label: String,

        /// Output directory
        #[arg(short, long, default_value = ".")]
        out: PathBuf,
    },

    /// Request a client key pair and print the public key
    Keys,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    FmtSubscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .compact()
        .init();

    let mut config = load_config(cli.config.as_deref())?;
    if let Some(kind) = cli.backend {
        config.backend = kind;
    }

    match cli.command {
        Commands::Endpoints => list_endpoints(&config),
        Commands::Connect { label, seconds } => run_session(&config, &label, seconds).await,
        Commands::Export { label, out } => export_profile(&config, &label, &out).await,
        Commands::Keys => print_keys(&config).await,
    }
}

fn load_config(path: Option<&Path>) -> Result<SessionConfig> {
    match path {
        Some(path) => {
            let config = SessionConfig::from_file(path)
                .with_context(|| format!("Failed to load config from {}", path.display()))?;
            info!("Configuration loaded from {}", path.display());
            Ok(config)
        }
        None => Ok(SessionConfig::default()),
    }
}

fn provisioner(config: &SessionConfig) -> Result<Arc<dyn KeyProvisioner>> {
    match &config.issuance {
        Some(issuance) => {
            let client = HttpKeyProvisioner::new(issuance.http_config())
                .context("Failed to create issuance client")?;
            Ok(Arc::new(client))
        }
        None => {
            info!("No issuance service configured; using simulated keys");
            Ok(Arc::new(SimulatedProvisioner::new()))
        }
    }
}

fn find_endpoint(config: &SessionConfig, label: &str) -> Result<Endpoint> {
    config
        .endpoint(label)
        .cloned()
        .ok_or_else(|| anyhow!("Unknown endpoint {:?} (see `svpn endpoints`)", label))
}

fn list_endpoints(config: &SessionConfig) -> Result<()> {
    for endpoint in config.endpoints.endpoints() {
        println!(
            "{:<16} {:<24} {}",
            endpoint.country_label, endpoint.network_address, endpoint.server_public_key
        );
    }
    Ok(())
}

async fn run_session(config: &SessionConfig, label: &str, seconds: Option<u64>) -> Result<()> {
    let endpoint = find_endpoint(config, label)?;
    let backend = backend::select(config.backend, &config.interface, None)
        .context("Failed to select tunnel backend")?;
    let controller = SessionController::new(config, backend, provisioner(config)?)
        .context("Failed to create session controller")?;

    controller
        .connect(endpoint, None)
        .await
        .with_context(|| format!("Failed to connect to {}", label))?;
    println!("{}", controller.status().format());

    let mut status = controller.subscribe();
    let ctrl_c = signal::ctrl_c();
    let deadline = async {
        match seconds {
            Some(secs) => tokio::time::sleep(Duration::from_secs(secs)).await,
            None => std::future::pending().await,
        }
    };
    tokio::pin!(ctrl_c, deadline);

    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                info!("Ctrl+C received, disconnecting");
                break;
            }
            _ = &mut deadline => break,
            changed = status.changed() => {
                if changed.is_err() {
                    break;
                }
                let snapshot = status.borrow_and_update().clone();
                println!("{}", snapshot.format());
                if !snapshot.state.is_connected() {
                    break;
                }
            }
        }
    }

    controller.disconnect().await.context("Failed to disconnect")?;
    println!("{}", controller.status().format());
    Ok(())
}

async fn build_profile(
    config: &SessionConfig,
    provisioner: &dyn KeyProvisioner,
    endpoint: &Endpoint,
) -> Result<TunnelProfile> {
    let keys = provisioner
        .request_keys()
        .await
        .context("Failed to obtain client keys")?;

    let profile = match config.profile_source {
        ProfileSource::Local => {
            let address = config.pool()?.allocate(&mut rand::thread_rng());
            config
                .profile_builder()
                .build(&keys, endpoint, address, &config.dns)?
        }
        ProfileSource::Remote => provisioner
            .request_profile(&keys, endpoint)
            .await
            .context("Failed to obtain issued profile")?,
    };
    Ok(profile)
}

async fn export_profile(config: &SessionConfig, label: &str, out: &Path) -> Result<()> {
    let endpoint = find_endpoint(config, label)?;
    let provisioner = provisioner(config)?;

    let profile = build_profile(config, provisioner.as_ref(), &endpoint).await?;
    let exported = profile.export(&config.product);
    let path = exported
        .write_to(out)
        .await
        .with_context(|| format!("Failed to write {}", exported.file_name))?;

    println!("Wrote {}", path.display());
    Ok(())
}

async fn print_keys(config: &SessionConfig) -> Result<()> {
    let keys = provisioner(config)?
        .request_keys()
        .await
        .context("Failed to obtain client keys")?;

    println!("{}", keys.public_key());
    Ok(())
}
