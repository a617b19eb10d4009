//! HTTP client for the PD API.
//!
//! Each call is a single request with a bounded timeout. Retrying is left to
//! the controller's requeue.

use std::time::Duration;

use async_trait::async_trait;
use kube::ResourceExt;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::client::types::{ClusterInfo, HealthInfo, PdClientError, PdLeader};
use crate::crd::{DEFAULT_CLIENT_PORT, PdCluster};
use crate::resources::common::member_name;

const HEALTH_PATH: &str = "pd/api/v1/health";
const CLUSTER_PATH: &str = "pd/api/v1/cluster";
const LEADER_PATH: &str = "pd/api/v1/leader";
const MEMBERS_PATH: &str = "pd/api/v1/members/name";

/// Queries a live PD cluster.
#[async_trait]
pub trait PdClient: Send + Sync {
    /// Per-member health.
    async fn get_health(&self) -> Result<HealthInfo, PdClientError>;
    /// Cluster identity.
    async fn get_cluster(&self) -> Result<ClusterInfo, PdClientError>;
    /// Current leader.
    async fn get_pd_leader(&self) -> Result<PdLeader, PdClientError>;
    /// Remove a member from the cluster. Removing an absent member succeeds.
    async fn delete_member(&self, name: &str) -> Result<(), PdClientError>;
}

/// Builds a `PdClient` for a given cluster.
pub trait PdClientFactory: Send + Sync {
    fn client_for(&self, cluster: &PdCluster) -> Box<dyn PdClient>;
}

/// `PdClient` over the PD HTTP API.
#[derive(Clone)]
pub struct HttpPdClient {
    base_url: String,
    client: reqwest::Client,
}

impl HttpPdClient {
    /// Creates a client targeting the given base URL.
    pub fn new(base_url: impl Into<String>, client: reqwest::Client) -> Self {
        Self {
            base_url: base_url.into(),
            client,
        }
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, PdClientError> {
        let url = format!("{}/{}", self.base_url.trim_end_matches('/'), path);
        debug!(url = %url, "Querying PD");

        let response =
            self.client
                .get(&url)
                .send()
                .await
                .map_err(|e| PdClientError::Request {
                    endpoint: path.to_string(),
                    message: e.to_string(),
                })?;

        let status = response.status();
        if !status.is_success() {
            return Err(PdClientError::Status {
                endpoint: path.to_string(),
                status: status.as_u16(),
            });
        }

        response.json::<T>().await.map_err(|e| PdClientError::Decode {
            endpoint: path.to_string(),
            message: e.to_string(),
        })
    }
}

#[async_trait]
impl PdClient for HttpPdClient {
    async fn get_health(&self) -> Result<HealthInfo, PdClientError> {
        self.get_json(HEALTH_PATH).await
    }

    async fn get_cluster(&self) -> Result<ClusterInfo, PdClientError> {
        self.get_json(CLUSTER_PATH).await
    }

    async fn get_pd_leader(&self) -> Result<PdLeader, PdClientError> {
        self.get_json(LEADER_PATH).await
    }

    async fn delete_member(&self, name: &str) -> Result<(), PdClientError> {
        let path = format!("{MEMBERS_PATH}/{name}");
        let url = format!("{}/{}", self.base_url.trim_end_matches('/'), path);
        debug!(url = %url, "Deleting PD member");

        let response = self
            .client
            .delete(&url)
            .send()
            .await
            .map_err(|e| PdClientError::Request {
                endpoint: path.clone(),
                message: e.to_string(),
            })?;

        let status = response.status();
        if status.is_success() || status == reqwest::StatusCode::NOT_FOUND {
            return Ok(());
        }
        Err(PdClientError::Status {
            endpoint: path,
            status: status.as_u16(),
        })
    }
}

/// Factory producing `HttpPdClient`s addressed through the cluster's client service.
#[derive(Clone)]
pub struct HttpPdClientFactory {
    client: reqwest::Client,
}

impl HttpPdClientFactory {
    /// Build a factory whose clients time out after `timeout`.
    pub fn new(timeout: Duration) -> Result<Self, PdClientError> {
        let client = reqwest::Client::builder()
            .connect_timeout(timeout)
            .timeout(timeout)
            .build()
            .map_err(|e| PdClientError::Request {
                endpoint: "client".to_string(),
                message: e.to_string(),
            })?;
        Ok(Self { client })
    }
}

impl PdClientFactory for HttpPdClientFactory {
    fn client_for(&self, cluster: &PdCluster) -> Box<dyn PdClient> {
        Box::new(HttpPdClient::new(
            pd_service_url(cluster),
            self.client.clone(),
        ))
    }
}

/// Base URL of the PD client service for a cluster.
pub fn pd_service_url(cluster: &PdCluster) -> String {
    let name = member_name(&cluster.name_any());
    let namespace = cluster.namespace().unwrap_or_default();
    let domain = &cluster.spec.cluster_domain;
    if domain.is_empty() {
        format!("http://{name}.{namespace}:{DEFAULT_CLIENT_PORT}")
    } else {
        format!("http://{name}.{namespace}.svc.{domain}:{DEFAULT_CLIENT_PORT}")
    }
}
