//! tunnelmuxd - Agent tunnel server daemon

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use tunnelmux_cell::{admin_router, Collaborators, TunnelService};
use tunnelmux_common::telemetry::{init_telemetry, TelemetryConfig};
use tunnelmux_common::{install_crypto_provider, EnvConfig, LayeredConfig, MapConfig, TunnelConfig};
use tunnelmux_pki::{load_or_create, PkiMaterial};

/// Agent tunnel server: accepts TLS tunnels from monitoring agents and
/// binds them to nodes
#[derive(Parser, Debug)]
#[command(name = "tunnelmuxd", version, about, long_about = None)]
struct Cli {
    /// Directory holding the CA and the listener's certificate
    #[arg(long, env = "TUNNELMUX_STATE_DIR", default_value = "/var/lib/tunnelmux", global = true)]
    state_dir: PathBuf,

    /// Subject alternative name for a newly generated listener certificate
    #[arg(long = "san", global = true, default_value = "localhost")]
    sans: Vec<String>,

    /// Emit human-readable log lines instead of JSON
    #[arg(long, global = true)]
    plain_logs: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Serve agent tunnels (default)
    Run {
        /// YAML configuration file; environment variables take precedence
        #[arg(long, env = "TUNNELMUX_CONFIG")]
        config: Option<PathBuf>,
    },
    /// Create the CA and listener certificate if missing, then exit
    Init,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    init_telemetry(TelemetryConfig {
        service_name: "tunnelmuxd".to_string(),
        json: !cli.plain_logs,
        ..Default::default()
    })?;
    install_crypto_provider();

    match cli.command.unwrap_or(Commands::Run { config: None }) {
        Commands::Init => {
            bootstrap(&cli.state_dir, &cli.sans)?;
            info!(state_dir = %cli.state_dir.display(), "PKI material ready");
            Ok(())
        }
        Commands::Run { config } => {
            let config = load_config(config.as_deref())?;
            let material = bootstrap(&cli.state_dir, &cli.sans)?;
            run(config, material).await
        }
    }
}

fn load_config(path: Option<&Path>) -> anyhow::Result<TunnelConfig> {
    let mut provider = LayeredConfig::new().layer(EnvConfig);
    if let Some(path) = path {
        provider = provider.layer(MapConfig::from_file(path)?);
    }
    Ok(TunnelConfig::load(&provider)?)
}

fn bootstrap(state_dir: &Path, sans: &[String]) -> anyhow::Result<PkiMaterial> {
    let sans: Vec<&str> = sans.iter().map(String::as_str).collect();
    load_or_create(state_dir, &sans)
        .with_context(|| format!("failed to load PKI material from {}", state_dir.display()))
}

async fn run(config: TunnelConfig, material: PkiMaterial) -> anyhow::Result<()> {
    let admin_addr = config.admin_addr;
    let server_tls = material.server_tls();
    let service = Arc::new(TunnelService::new(
        config,
        material.bundle,
        server_tls,
        Collaborators::in_memory(),
    ));

    let tunnel_addr = service.start().await?;
    let cancel = CancellationToken::new();
    let admin = spawn_admin(service.clone(), admin_addr, cancel.clone()).await?;
    info!(tunnels = %tunnel_addr, admin = %admin_addr, "tunnelmuxd running");

    shutdown_signal().await;
    info!("Shutdown signal received");

    cancel.cancel();
    service.stop().await;
    if let Err(e) = admin.await {
        error!(error = %e, "Admin server task failed");
    }
    Ok(())
}

async fn spawn_admin(
    service: Arc<TunnelService>,
    addr: SocketAddr,
    cancel: CancellationToken,
) -> anyhow::Result<tokio::task::JoinHandle<()>> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind admin address {}", addr))?;

    Ok(tokio::spawn(async move {
        let server = axum::serve(listener, admin_router(service))
            .with_graceful_shutdown(async move { cancel.cancelled().await });
        if let Err(e) = server.await {
            error!(error = %e, "Admin server error");
        }
    }))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
