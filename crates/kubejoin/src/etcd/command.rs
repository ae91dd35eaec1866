//! Launch command for the local storage cluster member

use std::collections::BTreeMap;
use std::path::PathBuf;

use kubejoin_common::JoinPlan;
use kubejoin_common::constants::{
    ETCD_CLIENT_PORT, ETCD_INITIAL_CLUSTER_TOKEN, ETCD_PEER_PORT, cert_names,
};

use crate::discovery::socket_with_port;
use crate::pki::CertificateStore;

/// Local member settings that do not depend on the join decision
#[derive(Debug, Clone)]
pub struct MemberSettings {
    pub node_name: String,
    pub advertise_address: String,
    pub data_dir: PathBuf,
    pub certificates_dir: PathBuf,
    /// Flags overriding or extending the defaults, without leading dashes
    pub extra_args: BTreeMap<String, String>,
}

/// `etcd` invocation as an argument vector
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EtcdCommand {
    pub args: Vec<String>,
}

impl EtcdCommand {
    pub fn build(settings: &MemberSettings, plan: &JoinPlan) -> Self {
        let mut flags = default_flags(settings, plan);
        flags.extend(
            settings
                .extra_args
                .iter()
                .map(|(k, v)| (k.clone(), v.clone())),
        );

        let mut args = Vec::with_capacity(flags.len() + 1);
        args.push("etcd".to_string());
        args.extend(flags.into_iter().map(|(k, v)| format!("--{k}={v}")));
        Self { args }
    }
}

impl std::fmt::Display for EtcdCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.args.join(" "))
    }
}

fn default_flags(settings: &MemberSettings, plan: &JoinPlan) -> BTreeMap<String, String> {
    let store = CertificateStore::new(&settings.certificates_dir);
    let path = |p: PathBuf| p.display().to_string();

    let client_socket = socket_with_port(&settings.advertise_address, ETCD_CLIENT_PORT);
    let peer_socket = socket_with_port(&settings.advertise_address, ETCD_PEER_PORT);
    let loopback = if client_socket.starts_with('[') {
        "[::1]"
    } else {
        "127.0.0.1"
    };
    let client_urls = format!("https://{client_socket},http://{loopback}:{ETCD_CLIENT_PORT}");
    let peer_url = format!("https://{peer_socket}");

    [
        ("name", settings.node_name.clone()),
        ("data-dir", settings.data_dir.display().to_string()),
        ("cert-file", path(store.cert_path(cert_names::ETCD_SERVER))),
        ("key-file", path(store.key_path(cert_names::ETCD_SERVER))),
        ("trusted-ca-file", path(store.cert_path(cert_names::ETCD_CA))),
        ("client-cert-auth", "true".to_string()),
        ("peer-cert-file", path(store.cert_path(cert_names::ETCD_PEER))),
        ("peer-key-file", path(store.key_path(cert_names::ETCD_PEER))),
        ("peer-trusted-ca-file", path(store.cert_path(cert_names::ETCD_CA))),
        ("peer-client-cert-auth", "true".to_string()),
        ("heartbeat-interval", "500".to_string()),
        ("election-timeout", "5000".to_string()),
        ("snapshot-count", "10000".to_string()),
        ("initial-advertise-peer-urls", peer_url.clone()),
        ("listen-peer-urls", peer_url),
        ("listen-client-urls", client_urls.clone()),
        ("advertise-client-urls", client_urls),
        ("initial-cluster-token", ETCD_INITIAL_CLUSTER_TOKEN.to_string()),
        ("initial-cluster", plan.initial_cluster.clone()),
        ("initial-cluster-state", plan.initial_cluster_state().to_string()),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v))
    .collect()
}
