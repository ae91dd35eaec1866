//! Storage cluster membership client
//!
//! Lists and adds members over a mutually authenticated TLS channel to one
//! live member. The client certificate is the one issued during discovery.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use etcd_client::{Certificate, Client, ConnectOptions, Identity, TlsOptions};
use kubejoin_common::constants::cert_names;
use kubejoin_common::{ClusterMember, JoinError};

use crate::pki::CertificateStore;

/// Membership operations used by the join planner
#[async_trait]
pub trait MembershipClient: Send + Sync {
    /// Current members, in the order the cluster reports them
    async fn list_members(&self) -> Result<Vec<ClusterMember>, JoinError>;

    /// Register a new member by its peer URL
    async fn add_member(&self, peer_url: &str) -> Result<ClusterMember, JoinError>;
}

/// Opens a membership client against one storage cluster client URL
#[async_trait]
pub trait MembershipConnector: Send + Sync {
    async fn connect(&self, client_url: &str) -> Result<Box<dyn MembershipClient>, JoinError>;
}

/// Result of waiting for the membership list to converge
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MembershipSnapshot {
    pub members: Vec<ClusterMember>,
    /// Every member reported a name before the window closed
    pub converged: bool,
}

/// Connector authenticating with the storage cluster client certificate.
///
/// Credentials are read from the certificates directory on each connect, so
/// a node that has not been through discovery fails at connect time.
pub struct EtcdConnector {
    store: CertificateStore,
    dial_timeout: Duration,
}

impl EtcdConnector {
    pub fn new(store: CertificateStore, dial_timeout: Duration) -> Self {
        Self {
            store,
            dial_timeout,
        }
    }

    fn tls_options(&self) -> Result<TlsOptions, JoinError> {
        let ca_pem = self.store.load_cert(cert_names::ETCD_CA)?;
        let cert_pem = self.store.load_cert(cert_names::ETCD_CLIENT)?;
        let key_pem = self.store.load_key(cert_names::ETCD_CLIENT)?;

        Ok(TlsOptions::new()
            .ca_certificate(Certificate::from_pem(ca_pem))
            .identity(Identity::from_pem(cert_pem, key_pem)))
    }
}

#[async_trait]
impl MembershipConnector for EtcdConnector {
    async fn connect(&self, client_url: &str) -> Result<Box<dyn MembershipClient>, JoinError> {
        let options = ConnectOptions::new()
            .with_tls(self.tls_options()?)
            .with_connect_timeout(self.dial_timeout);

        let client = Client::connect([client_url], Some(options))
            .await
            .map_err(|e| JoinError::rpc(format!("failed to connect to {client_url}: {e}")))?;

        tracing::debug!(url = %client_url, "Connected to storage cluster");
        Ok(Box::new(EtcdMembershipClient { client }))
    }
}

/// Membership client backed by `etcd-client`
pub struct EtcdMembershipClient {
    client: Client,
}

#[async_trait]
impl MembershipClient for EtcdMembershipClient {
    async fn list_members(&self) -> Result<Vec<ClusterMember>, JoinError> {
        // The client is a cheap handle over a shared channel
        let mut client = self.client.clone();
        let response = client
            .member_list()
            .await
            .map_err(|e| JoinError::rpc(format!("failed to list members: {e}")))?;

        Ok(response.members().iter().map(to_cluster_member).collect())
    }

    async fn add_member(&self, peer_url: &str) -> Result<ClusterMember, JoinError> {
        let mut client = self.client.clone();
        let response = client
            .member_add(vec![peer_url.to_string()], None)
            .await
            .map_err(|e| JoinError::rpc(format!("failed to add member {peer_url}: {e}")))?;

        response
            .member()
            .map(to_cluster_member)
            .ok_or_else(|| JoinError::rpc("member add response carried no member"))
    }
}

fn to_cluster_member(member: &etcd_client::Member) -> ClusterMember {
    ClusterMember {
        id: member.id(),
        name: member.name().to_string(),
        peer_urls: member.peer_urls().to_vec(),
    }
}

/// Poll the member list until every member has started or `timeout` passes.
///
/// RPC failures inside the window are retried. When the window closes, the
/// last successful listing is returned unconverged; if there was none, the
/// last RPC error is.
pub async fn list_converged_members(
    client: &dyn MembershipClient,
    timeout: Duration,
    poll_interval: Duration,
) -> Result<MembershipSnapshot, JoinError> {
    let deadline = Instant::now() + timeout;
    let mut last_listing = None;
    let mut last_error = None;

    loop {
        match client.list_members().await {
            Ok(members) => {
                if members.iter().all(ClusterMember::is_started) {
                    return Ok(MembershipSnapshot {
                        members,
                        converged: true,
                    });
                }
                let unstarted = members.iter().filter(|m| !m.is_started()).count();
                tracing::debug!(unstarted, "Waiting for storage members to start");
                last_listing = Some(members);
            }
            Err(e) => {
                tracing::warn!(error = %e, "Listing storage members failed, retrying");
                last_error = Some(e);
            }
        }

        let now = Instant::now();
        if now >= deadline {
            break;
        }
        tokio::time::sleep(poll_interval.min(deadline - now)).await;
    }

    match (last_listing, last_error) {
        (Some(members), _) => Ok(MembershipSnapshot {
            members,
            converged: false,
        }),
        (None, Some(e)) => Err(e),
        (None, None) => Err(JoinError::rpc("membership list never completed")),
    }
}

/// Membership identity is the advertised peer URL, never the name
pub fn is_self_present(members: &[ClusterMember], self_peer_url: &str) -> bool {
    members
        .iter()
        .any(|m| m.peer_urls.iter().any(|url| url == self_peer_url))
}
