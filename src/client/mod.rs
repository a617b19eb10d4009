//! PD client module.
//!
//! Queries the live PD cluster for per-member health, cluster identity and
//! the current leader.
//!
//! - `pd_client`: `PdClient` trait, the `reqwest` implementation and its factory
//! - `types`: decoded API bodies and `PdClientError`

pub mod pd_client;
pub mod types;

pub use pd_client::{HttpPdClient, HttpPdClientFactory, PdClient, PdClientFactory, pd_service_url};
pub use types::{ClusterInfo, HealthInfo, MemberHealth, PdClientError, PdLeader};
