//! Configuration management for kubejoin.

use anyhow::{Context, Result, bail};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use kubejoin_common::constants::{
    DEFAULT_CERTIFICATES_DIR, DEFAULT_DISCOVERY_LISTEN_ADDR, DEFAULT_DISCOVERY_PORT,
    DEFAULT_DISCOVERY_TIMEOUT_SECS, DEFAULT_ETCD_DATA_DIR, DISCOVERY_RETRY_INTERVAL_SECS,
    ETCD_DIAL_TIMEOUT_SECS, MEMBER_CONVERGENCE_TIMEOUT_SECS, MEMBER_POLL_INTERVAL_SECS,
};

use crate::discovery::DiscoverySettings;

/// Application configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// This node's identity
    #[serde(default)]
    pub node: NodeConfig,

    /// Directory holding certificate authorities and issued certificates
    #[serde(default = "default_certificates_dir")]
    pub certificates_dir: PathBuf,

    /// Bootstrap discovery configuration
    #[serde(default)]
    pub discovery: DiscoveryConfig,

    /// Local storage cluster member configuration
    #[serde(default)]
    pub etcd: EtcdConfig,

    /// Discovery server configuration
    #[serde(default)]
    pub server: ServerConfig,
}

/// Node identity
#[derive(Debug, Clone, Deserialize)]
pub struct NodeConfig {
    /// Node name (auto-generated if not set)
    #[serde(default = "generate_node_name")]
    pub name: String,

    /// Address other members reach this node on
    #[serde(default)]
    pub advertise_address: String,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            name: generate_node_name(),
            advertise_address: String::new(),
        }
    }
}

/// Bootstrap discovery configuration
#[derive(Debug, Clone, Deserialize)]
pub struct DiscoveryConfig {
    /// Control-plane addresses to race (`host[:port]`)
    #[serde(default)]
    pub endpoints: Vec<String>,

    /// Port the discovery service listens on
    #[serde(default = "default_discovery_port")]
    pub port: u16,

    /// Overall discovery timeout in seconds
    #[serde(default = "default_discovery_timeout")]
    pub timeout_secs: u64,

    /// Wait between attempts against one endpoint in seconds
    #[serde(default = "default_retry_interval")]
    pub retry_interval_secs: u64,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            endpoints: vec![],
            port: default_discovery_port(),
            timeout_secs: default_discovery_timeout(),
            retry_interval_secs: default_retry_interval(),
        }
    }
}

impl DiscoveryConfig {
    pub fn settings(&self) -> DiscoverySettings {
        DiscoverySettings {
            port: self.port,
            retry_interval: Duration::from_secs(self.retry_interval_secs),
            timeout: Duration::from_secs(self.timeout_secs),
        }
    }
}

/// Local storage cluster member configuration
#[derive(Debug, Clone, Deserialize)]
pub struct EtcdConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// RPC dial timeout in seconds
    #[serde(default = "default_dial_timeout")]
    pub dial_timeout_secs: u64,

    /// Wait for unstarted members in seconds
    #[serde(default = "default_convergence_timeout")]
    pub convergence_timeout_secs: u64,

    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,

    /// Extra `etcd` flags, overriding the defaults
    #[serde(default)]
    pub extra_args: BTreeMap<String, String>,
}

impl Default for EtcdConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            dial_timeout_secs: default_dial_timeout(),
            convergence_timeout_secs: default_convergence_timeout(),
            poll_interval_secs: default_poll_interval(),
            extra_args: BTreeMap::new(),
        }
    }
}

/// Discovery server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// HTTP listen address
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    /// Bootstrap tokens accepted by the server (`id.secret`)
    #[serde(default)]
    pub tokens: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            tokens: vec![],
        }
    }
}

// Default value functions
fn default_certificates_dir() -> PathBuf { PathBuf::from(DEFAULT_CERTIFICATES_DIR) }
fn default_discovery_port() -> u16 { DEFAULT_DISCOVERY_PORT }
fn default_discovery_timeout() -> u64 { DEFAULT_DISCOVERY_TIMEOUT_SECS }
fn default_retry_interval() -> u64 { DISCOVERY_RETRY_INTERVAL_SECS }
fn default_data_dir() -> PathBuf { PathBuf::from(DEFAULT_ETCD_DATA_DIR) }
fn default_dial_timeout() -> u64 { ETCD_DIAL_TIMEOUT_SECS }
fn default_convergence_timeout() -> u64 { MEMBER_CONVERGENCE_TIMEOUT_SECS }
fn default_poll_interval() -> u64 { MEMBER_POLL_INTERVAL_SECS }
fn default_listen_addr() -> String { DEFAULT_DISCOVERY_LISTEN_ADDR.to_string() }

fn generate_node_name() -> String {
    use rand::Rng;
    let mut rng = rand::rng();
    format!("node-{:08x}", rng.random::<u32>())
}

impl AppConfig {
    /// Load configuration from file, with CLI overrides
    pub fn load(config_path: &str, args: &super::Args) -> Result<Self> {
        let mut config = if Path::new(config_path).exists() {
            let settings = config::Config::builder()
                .add_source(config::File::with_name(config_path))
                .build()
                .context("Failed to load config file")?;

            settings
                .try_deserialize()
                .context("Failed to parse config")?
        } else {
            // Use defaults if config file doesn't exist
            tracing::warn!(path = %config_path, "Config file not found, using defaults");
            Self::default()
        };

        // Apply CLI overrides
        if let Some(ref name) = args.node_name {
            config.node.name = name.clone();
        }
        if let Some(ref address) = args.advertise_address {
            config.node.advertise_address = address.clone();
        }
        if let Some(ref dir) = args.cert_dir {
            config.certificates_dir = dir.clone();
        }

        Ok(config)
    }

    /// Advertise address, required by anything that plans a storage member
    pub fn advertise_address(&self) -> Result<&str> {
        if self.node.advertise_address.is_empty() {
            bail!("No advertise address configured (set node.advertise_address or --advertise-address)");
        }
        Ok(&self.node.advertise_address)
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            node: NodeConfig::default(),
            certificates_dir: default_certificates_dir(),
            discovery: DiscoveryConfig::default(),
            etcd: EtcdConfig::default(),
            server: ServerConfig::default(),
        }
    }
}
