//! Failover recovery gate.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;
use tracing::debug;

use crate::crd::{PdCluster, desired_ordinals};
use crate::resources::common::pod_name;

/// Whether a pod reports the `Ready` condition as true.
pub fn is_pod_ready(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .is_some_and(|conditions| {
            conditions
                .iter()
                .any(|c| c.type_ == "Ready" && c.status == "True")
        })
}

/// Whether failed members can be recovered.
///
/// Every desired ordinal, failover replacements excluded, needs an existing
/// ready pod and a healthy member whose name, up to the first dot, is the
/// pod name. Replacement pods are ignored since recovery removes them.
pub fn should_recover(cluster: &PdCluster, pods: &BTreeMap<String, Pod>) -> bool {
    let Some(status) = cluster.status.as_ref() else {
        return false;
    };
    if status.failure_members.is_none() {
        return false;
    }

    let cluster_name = cluster.name_any();
    for ordinal in desired_ordinals(cluster, true) {
        let name = pod_name(&cluster_name, ordinal);
        let Some(pod) = pods.get(&name) else {
            debug!(pod = %name, "Pod does not exist, not recovering");
            return false;
        };
        if !is_pod_ready(pod) {
            return false;
        }
        let member = status
            .members
            .iter()
            .find(|(member_name, _)| member_name.split('.').next() == Some(name.as_str()));
        match member {
            Some((_, member)) if member.health => {}
            _ => return false,
        }
    }
    true
}
