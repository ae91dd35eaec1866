//! Join planning for the local storage cluster member
//!
//! Decides whether the local process starts a new cluster or joins an
//! existing one, and computes the initial-cluster string it starts with.

use std::time::Duration;

use kubejoin_common::constants::{ETCD_CLIENT_PORT, ETCD_PEER_PORT};
use kubejoin_common::{ClusterMember, JoinMode, JoinPlan};

use super::membership::{
    MembershipClient, MembershipConnector, is_self_present, list_converged_members,
};
use crate::discovery::socket_with_port;

/// Inputs of a join decision
#[derive(Debug, Clone)]
pub struct JoinPlanner {
    pub node_name: String,
    pub advertise_address: String,
    pub discovery_endpoints: Vec<String>,
    pub convergence_timeout: Duration,
    pub poll_interval: Duration,
}

impl JoinPlanner {
    /// Peer URL this node advertises to the storage cluster
    pub fn self_peer_url(&self) -> String {
        format!(
            "https://{}",
            socket_with_port(&self.advertise_address, ETCD_PEER_PORT)
        )
    }

    fn self_entry(&self) -> String {
        format!("{}={}", self.node_name, self.self_peer_url())
    }

    /// Compute the launch decision.
    ///
    /// Without discovery endpoints the node starts a fresh cluster and no
    /// RPC is made. Otherwise the plan is always `Existing`; membership
    /// failures are logged and the plan carries whatever was learned.
    pub async fn plan(&self, connector: &dyn MembershipConnector) -> JoinPlan {
        if self.discovery_endpoints.is_empty() {
            tracing::info!(node = %self.node_name, "No discovery endpoints, starting a new storage cluster");
            return JoinPlan {
                mode: JoinMode::Fresh,
                initial_cluster: self.self_entry(),
            };
        }

        let self_peer_url = self.self_peer_url();
        let members = match self.connect_first(connector).await {
            Some(client) => self.sync_membership(client.as_ref(), &self_peer_url).await,
            None => {
                tracing::error!(
                    endpoints = ?self.discovery_endpoints,
                    "No storage cluster endpoint reachable, joining with self only"
                );
                Vec::new()
            }
        };

        let initial_cluster = self.initial_cluster(&members, &self_peer_url);
        tracing::info!(initial_cluster = %initial_cluster, "Joining existing storage cluster");
        JoinPlan {
            mode: JoinMode::Existing,
            initial_cluster,
        }
    }

    async fn connect_first(
        &self,
        connector: &dyn MembershipConnector,
    ) -> Option<Box<dyn MembershipClient>> {
        for endpoint in &self.discovery_endpoints {
            let url = format!("https://{}", socket_with_port(endpoint, ETCD_CLIENT_PORT));
            match connector.connect(&url).await {
                Ok(client) => return Some(client),
                Err(e) => tracing::warn!(url = %url, error = %e, "Storage cluster endpoint unreachable"),
            }
        }
        None
    }

    /// List members and register self if absent; returns the observed list
    async fn sync_membership(
        &self,
        client: &dyn MembershipClient,
        self_peer_url: &str,
    ) -> Vec<ClusterMember> {
        let snapshot =
            match list_converged_members(client, self.convergence_timeout, self.poll_interval).await
            {
                Ok(snapshot) => snapshot,
                Err(e) => {
                    tracing::error!(error = %e, "Could not list storage members, joining with self only");
                    return Vec::new();
                }
            };
        if !snapshot.converged {
            tracing::warn!(
                timeout = ?self.convergence_timeout,
                "Storage membership did not converge, using last listing"
            );
        }

        if is_self_present(&snapshot.members, self_peer_url) {
            tracing::info!(peer_url = %self_peer_url, "Already a storage cluster member");
        } else {
            match client.add_member(self_peer_url).await {
                Ok(added) => {
                    tracing::info!(peer_url = %self_peer_url, id = added.id, "Added storage cluster member")
                }
                // The initial-cluster string may be stale; the local member retries via its peers
                Err(e) => tracing::error!(
                    peer_url = %self_peer_url,
                    error = %e,
                    "Adding storage cluster member failed, starting anyway"
                ),
            }
        }

        snapshot.members
    }

    /// Self first, then every started member other than self in observed order
    fn initial_cluster(&self, members: &[ClusterMember], self_peer_url: &str) -> String {
        let mut entries = vec![self.self_entry()];
        entries.extend(members.iter().filter(|m| m.is_started()).filter_map(|m| {
            m.primary_peer_url()
                .filter(|url| *url != self_peer_url)
                .map(|url| format!("{}={}", m.name, url))
        }));
        entries.join(",")
    }
}
