//! # Peer Clients
//!
//! Outbound mTLS plumbing for member-to-member calls. A [`PeerClient`]
//! is a `reqwest` client preconfigured with:
//!
//! - this node's **server** keypair as the client certificate, and
//! - a verifier pinned to the shared **cluster** certificate.
//!
//! A [`Cluster`] is the client set built from a trust-store snapshot
//! (one client per remote, self excluded unless requested). Its
//! [`Cluster::query`] is the fan-out primitive every peer iteration
//! uses: bounded concurrency, and a failing peer never cancels its
//! siblings — the first error is reported after all calls finish.

use std::time::Duration;

use futures::future::BoxFuture;
use futures::StreamExt;
use reqwest::Method;
use serde::Serialize;
use syndic_common::{
    AddrPort, ClusterMemberLocal, Envelope, HookNewMemberOptions, DATABASE_VERSION_HEADER,
};

use crate::certs::{client_config, KeyPairInfo};
use crate::error::{ClientError, DaemonError};
use crate::trust::Remotes;

/// Upper bound on in-flight peer RPCs during a fan-out.
const MAX_PEER_CONCURRENCY: usize = 8;

/// Per-request timeout for peer calls.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Connection timeout for peer calls.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// An mTLS HTTP client for one cluster peer.
pub struct PeerClient {
    name: String,
    address: AddrPort,
    base_url: String,
    http: reqwest::Client,
}

impl PeerClient {
    pub fn new(
        name: &str,
        address: AddrPort,
        identity: &KeyPairInfo,
        cluster_cert: &KeyPairInfo,
    ) -> Result<Self, ClientError> {
        let build_err = |message: String| ClientError::Build {
            address: address.to_string(),
            message,
        };

        let tls = client_config(identity, cluster_cert).map_err(|e| build_err(e.to_string()))?;
        let http = reqwest::Client::builder()
            .use_preconfigured_tls(tls)
            .timeout(REQUEST_TIMEOUT)
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| build_err(e.to_string()))?;

        let base_url = format!("https://{address}");
        Ok(Self { name: name.to_string(), address, base_url, http })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn address(&self) -> &AddrPort {
        &self.address
    }

    /// Asks the peer to record us in its trust store
    /// (`POST /1.0/internal/cluster`). Only the peer that already
    /// trusts us — the leader that accepted our join — will let this
    /// through its trust gate.
    pub async fn add_trust_store_entry(
        &self,
        member: &ClusterMemberLocal,
    ) -> Result<(), ClientError> {
        self.send(Method::POST, "/1.0/internal/cluster", Some(member), None)
            .await
            .map(|_| ())
    }

    /// Announces our replication wire version
    /// (`PATCH /1.0/internal/database`). The caller decides whether a
    /// failure matters; for the post-join broadcast it does not.
    pub async fn notify_database_version(&self, version: u64) -> Result<(), ClientError> {
        self.send(
            Method::PATCH,
            "/1.0/internal/database",
            None::<&()>,
            Some((DATABASE_VERSION_HEADER, version.to_string())),
        )
        .await
        .map(|_| ())
    }

    /// Asks the peer to run its `on_new_member` hook
    /// (`POST /1.0/internal/hooks/newmember`). A peer that is itself
    /// still joining answers 503; callers treat that as skippable.
    pub async fn run_new_member_hook(
        &self,
        options: &HookNewMemberOptions,
    ) -> Result<(), ClientError> {
        self.send(Method::POST, "/1.0/internal/hooks/newmember", Some(options), None)
            .await
            .map(|_| ())
    }

    async fn send<B: Serialize>(
        &self,
        method: Method,
        path: &str,
        body: Option<&B>,
        header: Option<(&str, String)>,
    ) -> Result<Envelope, ClientError> {
        let url = format!("{}{}", self.base_url, path);

        let mut request = self.http.request(method, &url);
        if let Some(body) = body {
            request = request.json(body);
        }

        if let Some((key, value)) = header {
            request = request.header(key, value);
        }

        let response = request
            .send()
            .await
            .map_err(|e| ClientError::Request { url: url.clone(), message: e.to_string() })?;

        let status = response.status();
        let envelope: Envelope = match response.json().await {
            Ok(envelope) => envelope,
            Err(e) if status.is_success() => {
                return Err(ClientError::Request { url, message: e.to_string() });
            }
            Err(_) => Envelope::error(status, status.to_string()),
        };

        if !status.is_success() || envelope.is_error() {
            return Err(ClientError::Status {
                url,
                status: status.as_u16(),
                message: envelope.error,
            });
        }

        Ok(envelope)
    }
}

impl std::fmt::Debug for PeerClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerClient")
            .field("name", &self.name)
            .field("address", &self.address)
            .finish()
    }
}

// ════════════════════════════════════════════════════════════════════════════
// CLUSTER CLIENT SET
// ════════════════════════════════════════════════════════════════════════════

/// One client per trusted remote, in trust-store (name) order.
pub struct Cluster {
    clients: Vec<PeerClient>,
}

impl Cluster {
    /// Builds clients for every remote in the snapshot. `exclude`
    /// drops the local node by listen address.
    pub fn from_remotes(
        remotes: &Remotes,
        exclude: Option<&AddrPort>,
        identity: &KeyPairInfo,
        cluster_cert: &KeyPairInfo,
    ) -> Result<Self, ClientError> {
        let mut clients = Vec::new();
        for remote in remotes.iter() {
            if exclude == Some(remote.address()) {
                continue;
            }

            clients.push(PeerClient::new(
                remote.name(),
                remote.address().clone(),
                identity,
                cluster_cert,
            )?);
        }

        Ok(Self { clients })
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PeerClient> {
        self.clients.iter()
    }

    /// Runs `f` against every client. With `concurrent` the calls fan
    /// out with at most [`MAX_PEER_CONCURRENCY`] in flight; otherwise
    /// they run in order. All calls complete before the first error
    /// (in client order) is returned.
    pub async fn query<F>(&self, concurrent: bool, f: F) -> Result<(), DaemonError>
    where
        F: for<'b> Fn(&'b PeerClient) -> BoxFuture<'b, Result<(), DaemonError>> + Send + Sync,
    {
        if concurrent {
            let results: Vec<Result<(), DaemonError>> =
                futures::stream::iter(self.clients.iter().map(|c| f(c)))
                    .buffered(MAX_PEER_CONCURRENCY)
                    .collect()
                    .await;
            results.into_iter().collect()
        } else {
            for client in &self.clients {
                f(client).await?;
            }

            Ok(())
        }
    }
}
