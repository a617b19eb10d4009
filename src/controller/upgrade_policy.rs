//! StatefulSet revision and rollout helpers.

use k8s_openapi::api::apps::v1::{
    RollingUpdateStatefulSetStrategy, StatefulSet, StatefulSetSpec, StatefulSetUpdateStrategy,
};
use k8s_openapi::api::core::v1::{Pod, PodTemplateSpec};

use crate::crd::UPDATE_STRATEGY_ON_DELETE;
use crate::resources::common::get_last_applied;

/// Pod label holding the controller revision a pod was created from.
pub const REVISION_LABEL: &str = "controller-revision-hash";

/// The spec recorded in the last-applied annotation of `set`.
pub fn last_applied_spec(set: &StatefulSet) -> Option<StatefulSetSpec> {
    get_last_applied::<StatefulSetSpec>(&set.metadata)
        .ok()
        .flatten()
}

/// The pod template recorded in the last-applied annotation of `set`.
pub fn last_applied_template(set: &StatefulSet) -> Option<PodTemplateSpec> {
    last_applied_spec(set).map(|spec| spec.template)
}

/// Whether the desired pod spec equals the one last applied to `live`.
///
/// Compared as JSON values so fields the API server defaults on the live
/// object do not register as a difference. A live object without a record
/// never matches.
pub fn template_equal(desired: &StatefulSet, live: &StatefulSet) -> bool {
    let Some(recorded) = last_applied_template(live) else {
        return false;
    };
    let Some(desired) = desired.spec.as_ref() else {
        return false;
    };
    match (
        serde_json::to_value(&recorded.spec),
        serde_json::to_value(&desired.template.spec),
    ) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

/// Replace the desired pod template with the last-applied one, or with the
/// live template when nothing was recorded, so no pod-affecting change is
/// rolled out.
pub fn freeze_template(desired: &mut StatefulSet, live: &StatefulSet) {
    let template = last_applied_template(live)
        .or_else(|| live.spec.as_ref().map(|spec| spec.template.clone()));
    if let (Some(spec), Some(template)) = (desired.spec.as_mut(), template) {
        spec.template = template;
    }
}

pub fn update_revision(set: &StatefulSet) -> Option<&str> {
    set.status.as_ref()?.update_revision.as_deref()
}

pub fn current_revision(set: &StatefulSet) -> Option<&str> {
    set.status.as_ref()?.current_revision.as_deref()
}

pub fn pod_revision(pod: &Pod) -> Option<&str> {
    pod.metadata.labels.as_ref()?.get(REVISION_LABEL).map(String::as_str)
}

/// Whether a rollout of `set` is still in progress.
///
/// True when the current and update revisions differ, when a new generation
/// has not been observed yet, or when any of `pods` runs a revision other
/// than the update revision. A pod without a revision label means the
/// controller has not labelled it yet and is treated as not upgrading.
pub fn statefulset_is_upgrading(set: &StatefulSet, pods: &[Pod]) -> bool {
    let Some(status) = set.status.as_ref() else {
        return false;
    };
    if status.current_revision != status.update_revision {
        return true;
    }
    let generation = set.metadata.generation.unwrap_or(0);
    let observed = status.observed_generation.unwrap_or(0);
    let spec_replicas = set.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1);
    if generation > observed && spec_replicas == status.replicas {
        return true;
    }

    let update = status.update_revision.as_deref();
    for pod in pods {
        match pod_revision(pod) {
            None => return false,
            Some(revision) if Some(revision) != update => return true,
            Some(_) => {}
        }
    }
    false
}

/// Whether `set` rolls pods only when they are deleted.
pub fn is_on_delete(set: &StatefulSet) -> bool {
    set.spec
        .as_ref()
        .and_then(|s| s.update_strategy.as_ref())
        .and_then(|s| s.type_.as_deref())
        == Some(UPDATE_STRATEGY_ON_DELETE)
}

/// The rolling-update partition of `set`, if any.
pub fn partition(set: &StatefulSet) -> Option<i32> {
    set.spec
        .as_ref()?
        .update_strategy
        .as_ref()?
        .rolling_update
        .as_ref()?
        .partition
}

/// Set the rolling-update partition. Has no effect with `OnDelete`.
pub fn set_upgrade_partition(set: &mut StatefulSet, partition: i32) {
    if is_on_delete(set) {
        return;
    }
    let Some(spec) = set.spec.as_mut() else {
        return;
    };
    let strategy = spec
        .update_strategy
        .get_or_insert_with(StatefulSetUpdateStrategy::default);
    strategy.type_ = Some("RollingUpdate".to_string());
    strategy
        .rolling_update
        .get_or_insert_with(RollingUpdateStatefulSetStrategy::default)
        .partition = Some(partition);
}
