//! Operator configuration read from the environment.

use std::time::Duration;

use tracing::warn;

use crate::controller::error::{Error, Result};

const AUTO_FAILOVER_ENV: &str = "PD_OPERATOR_AUTO_FAILOVER";
const FAILOVER_PERIOD_ENV: &str = "PD_OPERATOR_FAILOVER_PERIOD_SECS";
const WATCH_NAMESPACE_ENV: &str = "PD_OPERATOR_WATCH_NAMESPACE";
const PD_TIMEOUT_ENV: &str = "PD_OPERATOR_PD_TIMEOUT_SECS";
const LEASE_NAME_ENV: &str = "PD_OPERATOR_LEASE_NAME";
const POD_NAME_ENV: &str = "POD_NAME";
const POD_NAMESPACE_ENV: &str = "POD_NAMESPACE";

const DEFAULT_LEASE_NAME: &str = "pd-operator-leader";
const DEFAULT_LEASE_NAMESPACE: &str = "default";

/// Operator-wide settings.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OperatorConfig {
    /// Whether failed PD members are replaced automatically.
    pub auto_failover: bool,
    /// How long a member must stay unhealthy before it is failed over.
    pub failover_period: Duration,
    /// Restrict watches to one namespace; `None` watches the whole cluster.
    pub watch_namespace: Option<String>,
    /// Timeout of each PD API request.
    pub pd_timeout: Duration,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            auto_failover: true,
            failover_period: Duration::from_secs(300),
            watch_namespace: None,
            pd_timeout: Duration::from_secs(5),
        }
    }
}

impl OperatorConfig {
    /// Read the configuration from the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read the configuration through `lookup`, falling back to defaults for
    /// unset or empty variables.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let defaults = Self::default();

        let auto_failover = match get(AUTO_FAILOVER_ENV) {
            Some(v) => parse_bool(AUTO_FAILOVER_ENV, &v)?,
            None => defaults.auto_failover,
        };
        let failover_period = match get(FAILOVER_PERIOD_ENV) {
            Some(v) => parse_secs(FAILOVER_PERIOD_ENV, &v)?,
            None => defaults.failover_period,
        };
        let pd_timeout = match get(PD_TIMEOUT_ENV) {
            Some(v) => parse_secs(PD_TIMEOUT_ENV, &v)?,
            None => defaults.pd_timeout,
        };

        Ok(Self {
            auto_failover,
            failover_period,
            watch_namespace: get(WATCH_NAMESPACE_ENV),
            pd_timeout,
        })
    }
}

/// Identity this replica uses in leader election.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LeaseConfig {
    pub holder_id: String,
    pub namespace: String,
    pub lease_name: String,
    pub ttl: Duration,
    pub renew_interval: Duration,
}

impl LeaseConfig {
    /// Read the lease identity from the process environment, naming the
    /// holder after the host when `POD_NAME` is unset.
    pub fn from_env() -> Self {
        Self::from_lookup(
            |key| std::env::var(key).ok(),
            || {
                hostname::get()
                    .map(|h| h.to_string_lossy().to_string())
                    .unwrap_or_else(|_| "unknown".to_string())
            },
        )
    }

    pub fn from_lookup(
        lookup: impl Fn(&str) -> Option<String>,
        fallback_holder: impl FnOnce() -> String,
    ) -> Self {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let holder_id = get(POD_NAME_ENV).unwrap_or_else(|| {
            warn!("{POD_NAME_ENV} not set, using hostname");
            fallback_holder()
        });
        let namespace = get(POD_NAMESPACE_ENV).unwrap_or_else(|| {
            warn!("{POD_NAMESPACE_ENV} not set, using '{DEFAULT_LEASE_NAMESPACE}'");
            DEFAULT_LEASE_NAMESPACE.to_string()
        });
        Self {
            holder_id,
            namespace,
            lease_name: get(LEASE_NAME_ENV).unwrap_or_else(|| DEFAULT_LEASE_NAME.to_string()),
            ttl: Duration::from_secs(15),
            renew_interval: Duration::from_secs(5),
        }
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(Error::Validation(format!(
            "{key} must be a boolean, got {other:?}"
        ))),
    }
}

fn parse_secs(key: &str, value: &str) -> Result<Duration> {
    value
        .trim()
        .parse::<u64>()
        .map(Duration::from_secs)
        .map_err(|e| Error::Validation(format!("{key} must be whole seconds: {e}")))
}
