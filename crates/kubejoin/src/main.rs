//! # kubejoin - Control-plane node bootstrap
//!
//! Brings a new node into a running cluster with nothing but a bootstrap
//! token: discovers trust material, issues the local certificates, and
//! decides how the local storage cluster member starts.
//!
//! ## Flow
//! ```text
//! token + endpoints → discovery race → verified bundle → certificates dir
//!                                                             ↓
//!                           etcd command ← join plan ← membership RPC
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

mod config;
mod discovery;
mod etcd;
mod pki;
mod routes;
mod state;

use config::AppConfig;
use discovery::{DiscoveryOutcome, HttpClusterInfoSource, perform_tls_bootstrap};
use etcd::{EtcdCommand, EtcdConnector, JoinPlanner, MemberSettings};
use kubejoin_common::constants::cert_names;
use kubejoin_common::{BootstrapToken, JoinError, JoinPlan};
use pki::{CertificateStore, WriteOutcome, init_authorities, issue_member_certificates};
use state::DiscoveryState;

/// kubejoin - join a node to a running control plane
#[derive(Parser, Debug)]
#[command(name = "kubejoin")]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Configuration file path
    #[arg(short, long, global = true, default_value = "config/kubejoin.toml")]
    config: String,

    /// Node name (overrides config)
    #[arg(long, global = true, env = "KUBEJOIN_NODE_NAME")]
    node_name: Option<String>,

    /// Address advertised to the storage cluster (overrides config)
    #[arg(long, global = true, env = "KUBEJOIN_ADVERTISE_ADDRESS")]
    advertise_address: Option<String>,

    /// Certificates directory (overrides config)
    #[arg(long, global = true, env = "KUBEJOIN_CERT_DIR")]
    cert_dir: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "info", env = "LOG_LEVEL")]
    log_level: String,

    /// Enable JSON logging output
    #[arg(long, global = true, default_value = "false")]
    json_logs: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Discover the cluster with a bootstrap token and plan the local storage member
    Join {
        /// Bootstrap token (`id.secret`)
        #[arg(long, env = "KUBEJOIN_TOKEN", hide_env_values = true)]
        token: String,

        /// Control-plane endpoints to discover from (overrides config)
        #[arg(long = "discovery-endpoint")]
        endpoints: Vec<String>,

        /// Write the join report as JSON to this file
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Plan the local storage member with trust material already in place
    Plan {
        /// Existing storage cluster endpoints; none starts a new cluster
        #[arg(long = "discovery-endpoint")]
        endpoints: Vec<String>,

        /// Write the join report as JSON to this file
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Create cluster authorities in the certificates directory of a first node
    Init,
    /// Generate bootstrap tokens
    Token {
        #[arg(short = 'n', long, default_value = "1")]
        count: usize,
    },
    /// Serve signed cluster info to joining nodes
    Serve {
        /// Listen address (overrides config)
        #[arg(short, long, env = "LISTEN_ADDR")]
        listen: Option<String>,

        /// Accepted bootstrap tokens, in addition to configured ones
        #[arg(long = "token", env = "KUBEJOIN_TOKENS", value_delimiter = ',', hide_env_values = true)]
        tokens: Vec<String>,
    },
}

/// What `join` and `plan` report
#[derive(Debug, Serialize)]
struct JoinReport {
    discovery_endpoint: Option<String>,
    cluster_endpoints: Vec<String>,
    created: Vec<PathBuf>,
    plan: JoinPlan,
    initial_cluster_state: &'static str,
    command: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // A missing .env is fine
    let _ = dotenvy::dotenv();

    // Parse CLI arguments
    let args = Args::parse();

    // Initialize logging
    init_logging(&args.log_level, args.json_logs)?;

    info!("Starting kubejoin v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let config = AppConfig::load(&args.config, &args)?;
    info!(node = %config.node.name, "Configuration loaded from {}", args.config);

    let start = Instant::now();
    let result = match args.command {
        Command::Join {
            token,
            endpoints,
            output,
        } => join(&config, &token, endpoints, output).await,
        Command::Plan { endpoints, output } => plan(&config, endpoints, output).await,
        Command::Init => init(&config),
        Command::Token { count } => {
            generate_tokens(count);
            Ok(())
        }
        Command::Serve { listen, tokens } => serve(&config, listen, tokens).await,
    };

    if let Err(ref e) = result {
        let error = format!("{e:#}");
        tracing::error!(error = %error, elapsed = ?start.elapsed(), "kubejoin failed");
    }
    result
}

/// Discover the cluster, persist trust material, and plan the storage member
async fn join(
    config: &AppConfig,
    token: &str,
    endpoints: Vec<String>,
    output: Option<PathBuf>,
) -> Result<()> {
    let endpoints = if endpoints.is_empty() {
        config.discovery.endpoints.clone()
    } else {
        endpoints
    };
    if endpoints.is_empty() {
        anyhow::bail!("No discovery endpoints configured (set discovery.endpoints or --discovery-endpoint)");
    }
    let advertise_address = config.advertise_address()?;

    let store = CertificateStore::new(&config.certificates_dir);
    let source = Arc::new(HttpClusterInfoSource::new());
    let outcome = perform_tls_bootstrap(
        token,
        &endpoints,
        &config.discovery.settings(),
        source,
        &store,
    )
    .await
    .context("TLS bootstrap failed")?;
    info!(
        endpoint = %outcome.endpoint,
        elapsed = ?outcome.elapsed,
        "✅ Trust material in place"
    );

    let etcd_ca = store
        .load_authority(cert_names::ETCD_CA)
        .context("Failed to load storage cluster CA")?;
    issue_member_certificates(&store, &etcd_ca, &config.node.name, advertise_address)
        .context("Failed to issue storage member certificates")?;

    let report = plan_member(config, &store, endpoints, Some(outcome)).await?;
    emit_report(&report, output).await
}

/// Plan the storage member using trust material already on disk
async fn plan(config: &AppConfig, endpoints: Vec<String>, output: Option<PathBuf>) -> Result<()> {
    let endpoints = if endpoints.is_empty() {
        config.discovery.endpoints.clone()
    } else {
        endpoints
    };
    let advertise_address = config.advertise_address()?;
    let store = CertificateStore::new(&config.certificates_dir);

    match store.load_authority(cert_names::ETCD_CA) {
        Ok(etcd_ca) => {
            issue_member_certificates(&store, &etcd_ca, &config.node.name, advertise_address)
                .context("Failed to issue storage member certificates")?;
        }
        Err(JoinError::CertificateNotFound(path)) => {
            tracing::warn!(path = %path.display(), "No storage cluster CA, member certificates not issued");
        }
        Err(e) => return Err(e).context("Failed to load storage cluster CA"),
    }

    let report = plan_member(config, &store, endpoints, None).await?;
    emit_report(&report, output).await
}

async fn plan_member(
    config: &AppConfig,
    store: &CertificateStore,
    endpoints: Vec<String>,
    discovery: Option<DiscoveryOutcome>,
) -> Result<JoinReport> {
    let advertise_address = config.advertise_address()?.to_string();

    let planner = JoinPlanner {
        node_name: config.node.name.clone(),
        advertise_address: advertise_address.clone(),
        discovery_endpoints: endpoints,
        convergence_timeout: Duration::from_secs(config.etcd.convergence_timeout_secs),
        poll_interval: Duration::from_secs(config.etcd.poll_interval_secs),
    };
    let connector = EtcdConnector::new(
        store.clone(),
        Duration::from_secs(config.etcd.dial_timeout_secs),
    );
    let plan = planner.plan(&connector).await;

    let command = EtcdCommand::build(
        &MemberSettings {
            node_name: config.node.name.clone(),
            advertise_address,
            data_dir: config.etcd.data_dir.clone(),
            certificates_dir: config.certificates_dir.clone(),
            extra_args: config.etcd.extra_args.clone(),
        },
        &plan,
    );

    tracing::debug!(command = %command, "Storage member command built");

    let (discovery_endpoint, cluster_endpoints, created) = match discovery {
        Some(outcome) => (
            Some(outcome.endpoint),
            outcome.cluster_endpoints,
            outcome.created,
        ),
        None => (None, vec![], vec![]),
    };

    Ok(JoinReport {
        discovery_endpoint,
        cluster_endpoints,
        created,
        initial_cluster_state: plan.initial_cluster_state(),
        plan,
        command: command.args,
    })
}

async fn emit_report(report: &JoinReport, output: Option<PathBuf>) -> Result<()> {
    info!(
        state = report.initial_cluster_state,
        initial_cluster = %report.plan.initial_cluster,
        "📋 Storage member planned"
    );
    println!("{}", report.command.join(" "));

    if let Some(path) = output {
        let json = serde_json::to_string_pretty(report).context("Failed to encode join report")?;
        tokio::fs::write(&path, json)
            .await
            .with_context(|| format!("Failed to write {}", path.display()))?;
        info!(path = %path.display(), "Join report written");
    }
    Ok(())
}

/// Create the authorities a discovery server hands out
fn init(config: &AppConfig) -> Result<()> {
    let store = CertificateStore::new(&config.certificates_dir);
    let outcomes = init_authorities(&store).with_context(|| {
        format!("Failed to create authorities in {}", store.dir().display())
    })?;

    for (base_name, outcome) in outcomes {
        match outcome {
            WriteOutcome::Created => info!(name = base_name, "🔐 Created"),
            WriteOutcome::AlreadyPresent => info!(name = base_name, "Already present, kept"),
        }
    }
    Ok(())
}

fn generate_tokens(count: usize) {
    let mut rng = rand::rng();
    for _ in 0..count {
        println!("{}", BootstrapToken::generate(&mut rng));
    }
}

/// Serve signed cluster info from the local certificates directory
async fn serve(config: &AppConfig, listen: Option<String>, tokens: Vec<String>) -> Result<()> {
    let tokens = config
        .server
        .tokens
        .iter()
        .chain(tokens.iter())
        .map(|raw| BootstrapToken::parse(raw))
        .collect::<Result<Vec<_>, _>>()
        .context("Invalid bootstrap token")?;
    if tokens.is_empty() {
        tracing::warn!("No bootstrap tokens configured, every request will be refused");
    }

    let store = CertificateStore::new(&config.certificates_dir);
    let state = DiscoveryState::from_store(&store, tokens, config.discovery.endpoints.clone())?;
    info!(tokens = state.token_count(), "Cluster info loaded");

    let app = routes::create_router(state);

    let listen_addr = listen.unwrap_or_else(|| config.server.listen_addr.clone());
    let listener = tokio::net::TcpListener::bind(&listen_addr)
        .await
        .with_context(|| format!("Failed to bind {listen_addr}"))?;
    info!("🚀 Discovery server listening on {}", listen_addr);

    let shutdown_signal = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            return;
        }
        info!("🛑 Shutdown signal received");
    };

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal)
        .await
        .context("Server error")?;

    info!("👋 Discovery server shutdown complete");
    Ok(())
}

/// Initialize structured logging with tracing
fn init_logging(level: &str, json: bool) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .try_init()
            .context("Failed to install log subscriber")?;
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
            .try_init()
            .context("Failed to install log subscriber")?;
    }

    Ok(())
}
