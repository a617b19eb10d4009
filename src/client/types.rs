//! Types returned by the PD HTTP API.
//!
//! Field names follow the JSON bodies of `/pd/api/v1/health`,
//! `/pd/api/v1/cluster` and `/pd/api/v1/leader`.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors that can occur when querying PD.
#[derive(Error, Debug)]
pub enum PdClientError {
    #[error("request to {endpoint} failed: {message}")]
    Request { endpoint: String, message: String },

    #[error("{endpoint} returned HTTP {status}")]
    Status { endpoint: String, status: u16 },

    #[error("invalid {endpoint} response: {message}")]
    Decode { endpoint: String, message: String },
}

/// Health of one PD member.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct MemberHealth {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub member_id: u64,
    #[serde(default)]
    pub client_urls: Vec<String>,
    #[serde(default)]
    pub health: bool,
}

impl MemberHealth {
    /// First advertised client URL, empty when none.
    pub fn client_url(&self) -> &str {
        self.client_urls.first().map(String::as_str).unwrap_or("")
    }
}

/// Health of every PD member.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(transparent)]
pub struct HealthInfo {
    pub healths: Vec<MemberHealth>,
}

/// Cluster identity.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct ClusterInfo {
    pub id: u64,
    #[serde(default)]
    pub max_peer_count: u32,
}

/// Current PD leader.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct PdLeader {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub member_id: u64,
    #[serde(default)]
    pub client_urls: Vec<String>,
}
