use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::info;

use colloquy::chat::auth::{IdentityVerifier, SharedSecretVerifier};
use colloquy::chat::gateway::ChatGateway;
use colloquy::chat::orchestrator::{AgentOrchestrator, HttpOrchestrator, LogOnlyOrchestrator};
use colloquy::config::GatewayConfig;

#[derive(Parser)]
#[command(name = "colloquy-gateway")]
#[command(version)]
#[command(about = "Colloquy realtime chat gateway")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    Serve(ServeArgs),
    CheckConfig(CheckConfigArgs),
}

#[derive(Parser)]
struct ServeArgs {
    /// TOML config file; flags below override its values.
    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(long)]
    bind_addr: Option<String>,

    #[arg(long)]
    channel_capacity: Option<usize>,

    #[arg(long)]
    connection_ttl_seconds: Option<u64>,

    #[arg(long)]
    session_ttl_seconds: Option<u64>,

    #[arg(long)]
    check_interval_secs: Option<u64>,

    #[arg(long)]
    max_connections: Option<usize>,

    #[arg(long)]
    max_connections_per_user: Option<usize>,

    /// Env var holding the shared secret for clients and connectors.
    #[arg(long)]
    shared_secret_env: Option<String>,

    /// Env var holding the admin endpoint token.
    #[arg(long)]
    admin_token_env: Option<String>,

    /// URL agent executions are dispatched to; omit for log-only dispatch.
    #[arg(long)]
    orchestrator_url: Option<String>,
}

#[derive(Parser)]
struct CheckConfigArgs {
    #[arg(long)]
    config: PathBuf,
}

fn init_tracing() {
    let _ = tracing_log::LogTracer::init();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();
}

#[tokio::main]
async fn main() {
    init_tracing();
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Serve(args) => serve_gateway(args).await,
        Commands::CheckConfig(args) => check_config(args),
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn build_config(args: &ServeArgs) -> anyhow::Result<GatewayConfig> {
    let mut config = match &args.config {
        Some(path) => GatewayConfig::load_from_file(path)?,
        None => GatewayConfig::default(),
    };

    if let Some(bind_addr) = &args.bind_addr {
        config.bind_addr = bind_addr.clone();
    }
    if let Some(capacity) = args.channel_capacity {
        config.registry.channel_capacity = capacity;
    }
    if let Some(ttl) = args.connection_ttl_seconds {
        config.registry.connection_ttl_seconds = ttl;
    }
    if let Some(ttl) = args.session_ttl_seconds {
        config.registry.session_ttl_seconds = ttl;
    }
    if let Some(interval) = args.check_interval_secs {
        config.monitor.check_interval_secs = interval;
    }
    if let Some(max) = args.max_connections {
        config.monitor.thresholds.max_connections = max;
    }
    if let Some(max) = args.max_connections_per_user {
        config.monitor.thresholds.max_connections_per_user = max;
    }
    if let Some(var) = &args.shared_secret_env {
        config.auth.shared_secret_env = var.clone();
    }
    if let Some(var) = &args.admin_token_env {
        config.auth.admin_token_env = var.clone();
    }
    if let Some(url) = &args.orchestrator_url {
        config.orchestrator.execute_url = Some(url.clone());
    }

    config.validate()?;
    Ok(config)
}

async fn serve_gateway(args: ServeArgs) -> anyhow::Result<()> {
    let config = build_config(&args)?;

    let verifier: Arc<dyn IdentityVerifier> =
        Arc::new(SharedSecretVerifier::from_env(&config.auth.shared_secret_env)?);

    let orchestrator: Arc<dyn AgentOrchestrator> = if config.orchestrator.execute_url.is_some() {
        Arc::new(HttpOrchestrator::new(&config.orchestrator)?)
    } else {
        info!("[Gateway] No orchestrator URL configured; dispatch is log-only");
        Arc::new(LogOnlyOrchestrator::new())
    };

    info!("[Gateway] Starting on {}", config.bind_addr);
    ChatGateway::start(config, orchestrator, verifier).await?;
    Ok(())
}

fn check_config(args: CheckConfigArgs) -> anyhow::Result<()> {
    let config = GatewayConfig::load_from_file(&args.config)?;
    println!(
        "Config OK: bind_addr={} channel_capacity={} connection_ttl={}s session_ttl={}s",
        config.bind_addr,
        config.registry.channel_capacity,
        config.registry.connection_ttl_seconds,
        config.registry.session_ttl_seconds,
    );
    Ok(())
}
