//! Shared constants for kubejoin components.

/// Port the discovery service listens on, on every control-plane node
pub const DEFAULT_DISCOVERY_PORT: u16 = 9898;

/// HTTP path serving the signed trust bundle
pub const DISCOVERY_PATH: &str = "/cluster-info/v1";

/// Query parameter selecting the bundle by token id
pub const DISCOVERY_TOKEN_ID_PARAM: &str = "token-id";

/// Default listen address for the discovery server
pub const DEFAULT_DISCOVERY_LISTEN_ADDR: &str = "0.0.0.0:9898";

/// Wait between attempts against a single discovery endpoint (seconds)
pub const DISCOVERY_RETRY_INTERVAL_SECS: u64 = 5;

/// Overall discovery timeout (5 minutes)
pub const DEFAULT_DISCOVERY_TIMEOUT_SECS: u64 = 300;

/// Dial timeout for the storage cluster RPC channel (seconds)
pub const ETCD_DIAL_TIMEOUT_SECS: u64 = 3;

/// Window for the membership list to converge (2 minutes)
pub const MEMBER_CONVERGENCE_TIMEOUT_SECS: u64 = 120;

/// Poll interval while waiting for unstarted members to report a name
pub const MEMBER_POLL_INTERVAL_SECS: u64 = 1;

/// Storage cluster client port
pub const ETCD_CLIENT_PORT: u16 = 2379;

/// Storage cluster peer port
pub const ETCD_PEER_PORT: u16 = 2380;

/// Token shared by all members of the storage cluster at bootstrap
pub const ETCD_INITIAL_CLUSTER_TOKEN: &str = "k8s";

/// Default directory holding certificate authorities and issued certificates
pub const DEFAULT_CERTIFICATES_DIR: &str = "/etc/kubernetes/pki";

/// Default storage cluster data directory
pub const DEFAULT_ETCD_DATA_DIR: &str = "/var/lib/etcd";

/// Trust bundle object kind
pub const CLUSTER_INFO_KIND: &str = "ClusterInfo";

/// Trust bundle object version
pub const CLUSTER_INFO_API_VERSION: &str = "v1";

/// Certificate and key base names, relative to the certificates directory.
///
/// A base name `b` is stored as `b.crt` / `b.key`.
pub mod cert_names {
    /// API server certificate authority
    pub const CA: &str = "ca";

    /// Storage cluster certificate authority
    pub const ETCD_CA: &str = "etcd/ca";

    /// Front proxy certificate authority
    pub const FRONT_PROXY_CA: &str = "front-proxy-ca";

    /// Service account signing key (key only)
    pub const SERVICE_ACCOUNT: &str = "sa";

    /// Client certificate used to talk to the storage cluster
    pub const ETCD_CLIENT: &str = "apiserver-etcd-client";

    /// Storage cluster serving certificate
    pub const ETCD_SERVER: &str = "etcd/server";

    /// Storage cluster peer certificate
    pub const ETCD_PEER: &str = "etcd/peer";
}

/// Subjects of certificates issued during bootstrap
pub mod subjects {
    /// Common name of the storage cluster client certificate
    pub const ETCD_CLIENT_COMMON_NAME: &str = "kube-apiserver-etcd-client";

    /// Group of bootstrapped nodes
    pub const NODES_GROUP: &str = "system:nodes";
}
