//! Common resource generation utilities.
//!
//! Naming, labels, owner references and the last-applied annotation shared by
//! every object the operator manages for a PdCluster.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use kube::ResourceExt;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::crd::PdCluster;

/// Annotation carrying the JSON of the spec the operator last applied.
pub const LAST_APPLIED_ANNOTATION: &str = "pdoperator.io/last-applied-configuration";

/// Label key selecting the cluster instance.
pub const INSTANCE_LABEL: &str = "app.kubernetes.io/instance";
/// Label key selecting the component.
pub const COMPONENT_LABEL: &str = "app.kubernetes.io/component";
/// Label distinguishing the client service from the peer service.
pub const USED_BY_LABEL: &str = "app.kubernetes.io/used-by";

/// Name of the client service, StatefulSet and ConfigMap.
pub fn member_name(cluster_name: &str) -> String {
    format!("{cluster_name}-pd")
}

/// Name of the headless peer service.
pub fn peer_member_name(cluster_name: &str) -> String {
    format!("{cluster_name}-pd-peer")
}

/// Name of the PD pod with the given ordinal.
pub fn pod_name(cluster_name: &str, ordinal: i32) -> String {
    format!("{}-{ordinal}", member_name(cluster_name))
}

/// Ordinal of a StatefulSet pod, parsed from the suffix of its name.
pub fn ordinal_from_pod_name(pod_name: &str) -> Option<i32> {
    pod_name
        .rsplit_once('-')
        .and_then(|(_, ordinal)| ordinal.parse().ok())
}

/// Name a PD member registers under.
///
/// With a cluster domain the fully qualified peer address is used; clusters
/// spanning several Kubernetes clusters without a domain use the
/// namespace-qualified service address; otherwise the bare pod name.
pub fn pd_member_name(
    cluster_name: &str,
    ordinal: i32,
    namespace: &str,
    cluster_domain: &str,
    across_k8s: bool,
) -> String {
    let pod = pod_name(cluster_name, ordinal);
    let peer = peer_member_name(cluster_name);
    if !cluster_domain.is_empty() {
        format!("{pod}.{peer}.{namespace}.svc.{cluster_domain}")
    } else if across_k8s {
        format!("{pod}.{peer}.{namespace}.svc")
    } else {
        pod
    }
}

/// Labels selecting the PD pods of a cluster.
pub fn selector_labels(cluster: &PdCluster) -> BTreeMap<String, String> {
    BTreeMap::from([
        (
            "app.kubernetes.io/name".to_string(),
            "pd-cluster".to_string(),
        ),
        (INSTANCE_LABEL.to_string(), cluster.name_any()),
        (COMPONENT_LABEL.to_string(), "pd".to_string()),
        (
            "app.kubernetes.io/managed-by".to_string(),
            "pd-operator".to_string(),
        ),
    ])
}

/// Labels the live StatefulSet selects its pods by.
///
/// Falls back to `selector_labels` when the set carries no match labels.
pub fn workload_selector(cluster: &PdCluster, set: &StatefulSet) -> BTreeMap<String, String> {
    set.spec
        .as_ref()
        .and_then(|s| s.selector.match_labels.clone())
        .filter(|labels| !labels.is_empty())
        .unwrap_or_else(|| selector_labels(cluster))
}

/// Standard labels applied to all managed resources
pub fn standard_labels(cluster: &PdCluster) -> BTreeMap<String, String> {
    let mut labels = selector_labels(cluster);

    // Merge user-defined labels
    for (key, value) in &cluster.spec.labels {
        labels.insert(key.clone(), value.clone());
    }

    labels
}

/// Label selector string for listing the PD pods of a cluster.
pub fn selector_string(labels: &BTreeMap<String, String>) -> String {
    labels
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(",")
}

/// Create owner reference for a PdCluster
pub fn owner_reference(cluster: &PdCluster) -> OwnerReference {
    OwnerReference {
        api_version: "pdoperator.io/v1alpha1".to_string(),
        kind: "PdCluster".to_string(),
        name: cluster.name_any(),
        uid: cluster.uid().unwrap_or_default(),
        controller: Some(true),
        block_owner_deletion: Some(true),
    }
}

/// Object metadata shared by every generated object.
pub fn object_meta(cluster: &PdCluster, name: String, labels: BTreeMap<String, String>) -> ObjectMeta {
    ObjectMeta {
        name: Some(name),
        namespace: cluster.namespace(),
        labels: Some(labels),
        annotations: if cluster.spec.annotations.is_empty() {
            None
        } else {
            Some(cluster.spec.annotations.clone())
        },
        owner_references: Some(vec![owner_reference(cluster)]),
        ..Default::default()
    }
}

/// Record `spec` as the last-applied configuration on `meta`.
pub fn set_last_applied<S: Serialize>(
    meta: &mut ObjectMeta,
    spec: &S,
) -> Result<(), serde_json::Error> {
    let applied = serde_json::to_string(spec)?;
    meta.annotations
        .get_or_insert_with(BTreeMap::new)
        .insert(LAST_APPLIED_ANNOTATION.to_string(), applied);
    Ok(())
}

/// Read the last-applied configuration recorded on `meta`, if any.
pub fn get_last_applied<S: DeserializeOwned>(
    meta: &ObjectMeta,
) -> Result<Option<S>, serde_json::Error> {
    meta.annotations
        .as_ref()
        .and_then(|a| a.get(LAST_APPLIED_ANNOTATION))
        .map(|raw| serde_json::from_str(raw))
        .transpose()
}
