//! Validation of PdCluster specs.
//!
//! Failures are configuration errors: the cluster is not reconciled until
//! the spec is corrected.

use std::sync::LazyLock;

use kube::ResourceExt;

use crate::controller::error::{Error, Result};
use crate::crd::{MODE_MICRO_SERVICE, PdCluster, UPDATE_STRATEGY_ON_DELETE, UPDATE_STRATEGY_ROLLING};
use crate::resources::statefulset::parse_storage_request;
use crate::resources::version::cluster_version_at_least_4;

/// Maximum name length to allow room for suffixes like -pd-peer plus an ordinal
pub const MAX_NAME_LENGTH: usize = 53;

/// Validate the resource spec
pub fn validate_spec(cluster: &PdCluster) -> Result<()> {
    validate_name_length(cluster)?;
    validate_replicas(cluster)?;
    validate_mode(cluster)?;
    validate_update_strategy(cluster)?;
    validate_resource_quantities(cluster)?;
    cluster_version_at_least_4(&cluster.spec.version, &cluster.spec.mode)?;
    Ok(())
}

fn validate_name_length(cluster: &PdCluster) -> Result<()> {
    let name = cluster.name_any();
    if name.len() > MAX_NAME_LENGTH {
        return Err(Error::Validation(format!(
            "name '{}' exceeds maximum length of {} characters",
            name, MAX_NAME_LENGTH
        )));
    }
    Ok(())
}

fn validate_replicas(cluster: &PdCluster) -> Result<()> {
    if cluster.spec.replicas < 0 {
        return Err(Error::Validation(format!(
            "replicas cannot be negative, got {}",
            cluster.spec.replicas
        )));
    }
    if cluster.spec.max_failover_count.is_some_and(|c| c < 0) {
        return Err(Error::Validation(
            "maxFailoverCount cannot be negative".to_string(),
        ));
    }
    Ok(())
}

fn validate_mode(cluster: &PdCluster) -> Result<()> {
    let mode = cluster.spec.mode.as_str();
    if !mode.is_empty() && mode != MODE_MICRO_SERVICE {
        return Err(Error::Validation(format!(
            "mode must be empty or '{MODE_MICRO_SERVICE}', got '{mode}'"
        )));
    }
    Ok(())
}

fn validate_update_strategy(cluster: &PdCluster) -> Result<()> {
    let strategy = cluster.spec.update_strategy.as_str();
    if strategy != UPDATE_STRATEGY_ROLLING && strategy != UPDATE_STRATEGY_ON_DELETE {
        return Err(Error::Validation(format!(
            "updateStrategy must be '{UPDATE_STRATEGY_ROLLING}' or '{UPDATE_STRATEGY_ON_DELETE}', got '{strategy}'"
        )));
    }
    Ok(())
}

/// Validate resource quantity formats (storage size, CPU, memory)
fn validate_resource_quantities(cluster: &PdCluster) -> Result<()> {
    parse_storage_request(&cluster.spec.storage.size)?;

    let resources = &cluster.spec.resources;
    for (what, cpu) in [
        ("CPU request", &resources.requests.cpu),
        ("CPU limit", &resources.limits.cpu),
    ] {
        if !is_valid_cpu(cpu) {
            return Err(Error::Validation(format!(
                "invalid {what} '{cpu}'. Expected format: <number>m or <decimal> (e.g., 100m, 0.5, 1)"
            )));
        }
    }
    for (what, memory) in [
        ("memory request", &resources.requests.memory),
        ("memory limit", &resources.limits.memory),
    ] {
        if !is_valid_memory(memory) {
            return Err(Error::Validation(format!(
                "invalid {what} '{memory}'. Expected format: <number><unit> where unit is Ki, Mi, Gi, or Ti (e.g., 256Mi)"
            )));
        }
    }
    Ok(())
}

fn is_valid_cpu(cpu: &str) -> bool {
    static CPU_RE: LazyLock<Option<regex::Regex>> =
        LazyLock::new(|| regex::Regex::new(r"^([0-9]+m?|[0-9]*\.[0-9]+)$").ok());
    CPU_RE.as_ref().is_some_and(|re| re.is_match(cpu))
}

fn is_valid_memory(memory: &str) -> bool {
    static MEMORY_RE: LazyLock<Option<regex::Regex>> =
        LazyLock::new(|| regex::Regex::new(r"^([0-9]+)(Ki|Mi|Gi|Ti)?$").ok());
    MEMORY_RE.as_ref().is_some_and(|re| re.is_match(memory))
}
