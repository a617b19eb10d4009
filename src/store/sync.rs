//! Create-or-update helpers over the object stores.
//!
//! Each managed object records the spec the operator last applied in an
//! annotation; an update is only issued when the desired spec differs from
//! that record, so fields defaulted by the API server never cause churn.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{StatefulSet, StatefulSetSpec};
use k8s_openapi::api::core::v1::{ConfigMap, PersistentVolumeClaim, Pod, Service, ServiceSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::ResourceExt;
use tracing::{debug, info};

use crate::controller::error::{Error, Result};
use crate::resources::common::{LAST_APPLIED_ANNOTATION, get_last_applied, set_last_applied};
use crate::store::{ConfigMapStore, PvcLister, ServiceStore, WorkloadStore};

fn namespace_of(meta: &ObjectMeta) -> Result<&str> {
    meta.namespace
        .as_deref()
        .ok_or_else(|| Error::MissingField("metadata.namespace".to_string()))
}

fn is_orphan(meta: &ObjectMeta) -> bool {
    !meta
        .owner_references
        .as_ref()
        .is_some_and(|refs| refs.iter().any(|r| r.controller == Some(true)))
}

fn is_sub_map(
    sub: Option<&BTreeMap<String, String>>,
    of: Option<&BTreeMap<String, String>>,
) -> bool {
    let Some(sub) = sub else {
        return true;
    };
    sub.iter()
        .all(|(k, v)| of.and_then(|m| m.get(k)) == Some(v))
}

/// Create the service if absent, otherwise update it when the desired spec
/// or annotations changed. An allocated cluster IP is kept.
pub async fn sync_service(store: &dyn ServiceStore, desired: &Service) -> Result<()> {
    let namespace = namespace_of(&desired.metadata)?;
    let name = desired.name_any();

    let Some(live) = store.get_service(namespace, &name).await? else {
        let mut svc = desired.clone();
        set_last_applied(&mut svc.metadata, &svc.spec)?;
        info!(service = %name, "Creating service");
        return store.create_service(namespace, &svc).await;
    };

    let recorded: Option<Option<ServiceSpec>> = get_last_applied(&live.metadata)?;
    let spec_equal = recorded.is_some_and(|spec| spec == desired.spec);
    let annotations_equal = is_sub_map(
        desired.metadata.annotations.as_ref(),
        live.metadata.annotations.as_ref(),
    );
    let orphan = is_orphan(&live.metadata);
    if spec_equal && annotations_equal && !orphan {
        return Ok(());
    }

    let mut svc = live.clone();
    svc.spec = desired.spec.clone();
    set_last_applied(&mut svc.metadata, &svc.spec)?;
    if let (Some(spec), Some(live_spec)) = (svc.spec.as_mut(), live.spec.as_ref()) {
        spec.cluster_ip = live_spec.cluster_ip.clone();
        spec.cluster_ips = live_spec.cluster_ips.clone();
    }
    if let Some(annotations) = &desired.metadata.annotations {
        svc.metadata
            .annotations
            .get_or_insert_with(BTreeMap::new)
            .extend(annotations.clone());
    }
    if let Some(labels) = &desired.metadata.labels {
        svc.metadata
            .labels
            .get_or_insert_with(BTreeMap::new)
            .extend(labels.clone());
    }
    if orphan {
        svc.metadata.owner_references = desired.metadata.owner_references.clone();
    }

    info!(service = %name, "Updating service");
    store.update_service(namespace, &svc).await?;
    Ok(())
}

/// Create the ConfigMap if absent, otherwise update its data and labels
/// when they changed. Returns the object now stored.
pub async fn sync_configmap(store: &dyn ConfigMapStore, desired: &ConfigMap) -> Result<ConfigMap> {
    let namespace = namespace_of(&desired.metadata)?;
    let name = desired.name_any();

    let Some(live) = store.get_configmap(namespace, &name).await? else {
        info!(configmap = %name, "Creating configmap");
        store.create_configmap(namespace, desired).await?;
        return Ok(desired.clone());
    };

    let labels_equal = is_sub_map(
        desired.metadata.labels.as_ref(),
        live.metadata.labels.as_ref(),
    );
    if live.data == desired.data && labels_equal && !is_orphan(&live.metadata) {
        return Ok(live);
    }

    let mut cm = live;
    cm.data = desired.data.clone();
    if let Some(labels) = &desired.metadata.labels {
        cm.metadata
            .labels
            .get_or_insert_with(BTreeMap::new)
            .extend(labels.clone());
    }
    cm.metadata.owner_references = desired.metadata.owner_references.clone();

    info!(configmap = %name, "Updating configmap");
    store.update_configmap(namespace, &cm).await
}

/// Whether `desired` matches what was last applied to `live`.
///
/// Compares annotations (ignoring the last-applied record itself) and the
/// replicas, pod template and update strategy of the recorded spec. A live
/// object without a record never matches.
pub fn statefulset_equal(desired: &StatefulSet, live: &StatefulSet) -> bool {
    let live_annotations: BTreeMap<String, String> = live
        .metadata
        .annotations
        .iter()
        .flatten()
        .filter(|(k, _)| k.as_str() != LAST_APPLIED_ANNOTATION)
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    let desired_annotations = desired.metadata.annotations.clone().unwrap_or_default();
    if desired_annotations != live_annotations {
        return false;
    }

    let Ok(Some(recorded)) = get_last_applied::<StatefulSetSpec>(&live.metadata) else {
        return false;
    };
    let Some(spec) = desired.spec.as_ref() else {
        return false;
    };
    recorded.replicas == spec.replicas
        && recorded.template == spec.template
        && recorded.update_strategy == spec.update_strategy
}

/// Apply `desired` onto `live` if it changed.
///
/// The replacement carries the live resourceVersion, so a concurrent writer
/// makes this fail with `Error::Conflict` instead of being overwritten.
pub async fn update_statefulset_with_precheck(
    store: &dyn WorkloadStore,
    desired: &StatefulSet,
    live: &StatefulSet,
) -> Result<()> {
    let orphan = is_orphan(&live.metadata);
    if statefulset_equal(desired, live) && !orphan {
        debug!(statefulset = %live.name_any(), "StatefulSet unchanged");
        return Ok(());
    }

    let namespace = namespace_of(&live.metadata)?;
    let mut set = live.clone();
    if let (Some(spec), Some(desired_spec)) = (set.spec.as_mut(), desired.spec.as_ref()) {
        spec.template = desired_spec.template.clone();
        spec.replicas = desired_spec.replicas;
        spec.update_strategy = desired_spec.update_strategy.clone();
    }
    set.metadata.annotations = desired.metadata.annotations.clone();
    if orphan {
        set.metadata.owner_references = desired.metadata.owner_references.clone();
        set.metadata.labels = desired.metadata.labels.clone();
    }
    set_last_applied(&mut set.metadata, &set.spec)?;

    info!(statefulset = %set.name_any(), "Updating StatefulSet");
    store.update_statefulset(namespace, &set).await?;
    Ok(())
}

/// Claims referenced by the volumes of `pod` that currently exist.
pub async fn resolve_pvcs_from_pod(
    store: &dyn PvcLister,
    pod: &Pod,
) -> Result<Vec<PersistentVolumeClaim>> {
    let namespace = namespace_of(&pod.metadata)?;
    let claim_names = pod
        .spec
        .iter()
        .flat_map(|spec| spec.volumes.iter().flatten())
        .filter_map(|v| v.persistent_volume_claim.as_ref())
        .map(|claim| claim.claim_name.as_str())
        .filter(|name| !name.is_empty());

    let mut pvcs = Vec::new();
    for claim_name in claim_names {
        match store.get_pvc(namespace, claim_name).await? {
            Some(pvc) => pvcs.push(pvc),
            None => debug!(pod = %pod.name_any(), claim = %claim_name, "Claim not found"),
        }
    }
    Ok(pvcs)
}
