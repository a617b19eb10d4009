//! Reconciliation loop for PdCluster.
//!
//! Validates the spec, runs one `PdMemberManager` pass and persists the
//! resulting status, whether the pass succeeded or not.

use std::sync::Arc;
use std::time::{Duration, Instant};

use kube::{
    Api, ResourceExt,
    api::{Patch, PatchParams},
    runtime::controller::Action,
};
use tracing::{debug, error, info, warn};

use crate::controller::context::{Context, FIELD_MANAGER};
use crate::controller::error::{Error, Result};
use crate::controller::member_manager::{RequeueReason, SyncOutcome};
use crate::controller::status::{ConditionBuilder, status_merge_patch};
use crate::controller::validation::validate_spec;
use crate::crd::{Condition, MemberPhase, PdCluster, PdClusterStatus};

/// Periodic resync of a settled cluster, which also refreshes member health.
pub const SYNC_INTERVAL: Duration = Duration::from_secs(30);

/// Delay before re-running a pass that asked to be requeued.
pub const REQUEUE_DELAY: Duration = Duration::from_secs(1);

/// Reconcile a PdCluster
pub async fn reconcile(obj: Arc<PdCluster>, ctx: Arc<Context>) -> Result<Action> {
    let start_time = Instant::now();
    let name = obj.name_any();
    let namespace = obj.namespace().unwrap_or_else(|| "default".to_string());
    let generation = obj.metadata.generation;

    debug!(name = %name, namespace = %namespace, "Reconciling PdCluster");
    if let Some(ref health_state) = ctx.health_state {
        health_state.touch_reconcile();
    }

    let api: Api<PdCluster> = Api::namespaced(ctx.client.clone(), &namespace);

    // Owned objects are garbage collected through their owner references
    if obj.metadata.deletion_timestamp.is_some() {
        ctx.manager.forget(&namespace, &name);
        return Ok(Action::await_change());
    }

    if let Err(e) = validate_spec(&obj) {
        error!(name = %name, error = %e, "Validation failed");
        ctx.publish_warning_event(&obj, "ValidationFailed", "Validating", Some(e.to_string()))
            .await;
        let mut status = obj.status.clone().unwrap_or_default();
        let mut conditions = ConditionBuilder::from_existing(&status.conditions);
        conditions.ready(false, "ValidationFailed", &e.to_string(), generation);
        status.conditions = conditions.build();
        patch_status(&api, &name, obj.status.as_ref(), &status).await?;
        return Err(e);
    }

    let mut cluster = (*obj).clone();
    let result = ctx.manager.sync(&mut cluster).await;

    let mut status = cluster.status.clone().unwrap_or_default();
    status.observed_generation = generation;
    status.conditions = compute_conditions(&status, &result, generation);
    if obj.status.as_ref() != Some(&status)
        && let Err(e) = patch_status(&api, &name, obj.status.as_ref(), &status).await
    {
        // A failed pass reports its own error; a successful one reports this
        if result.is_ok() {
            return Err(e);
        }
        warn!(name = %name, error = %e, "Failed to write PdCluster status");
    }

    if let Some(ref health_state) = ctx.health_state {
        let healthy = status.members.values().filter(|m| m.health).count();
        health_state.metrics.record_reconcile(
            &namespace,
            &name,
            start_time.elapsed().as_secs_f64(),
        );
        health_state.metrics.set_pd_members(
            &namespace,
            &name,
            i64::from(cluster.desired_replicas()),
            i64::try_from(healthy).unwrap_or(i64::MAX),
        );
    }

    match result {
        Ok(SyncOutcome::Synced) => {
            debug!(name = %name, phase = %status.phase, "PD synced");
            Ok(Action::requeue(SYNC_INTERVAL))
        }
        Ok(SyncOutcome::Requeue(reason)) => {
            info!(name = %name, reason = %reason, "Requeueing PD sync");
            if let Some(ref health_state) = ctx.health_state {
                health_state
                    .metrics
                    .record_requeue(&namespace, &name, reason.label());
            }
            match reason {
                RequeueReason::WorkloadCreated => {
                    ctx.publish_normal_event(
                        &obj,
                        "StatefulSetCreated",
                        "Creating",
                        Some(format!("Created PD StatefulSet for {name}")),
                    )
                    .await;
                }
                RequeueReason::ForcedUpgrade { .. } => {
                    ctx.publish_warning_event(
                        &obj,
                        "ForcedUpgrade",
                        "Upgrading",
                        Some(reason.to_string()),
                    )
                    .await;
                }
            }
            Ok(Action::requeue(REQUEUE_DELAY))
        }
        Ok(SyncOutcome::Suspended) | Ok(SyncOutcome::Paused) => Ok(Action::requeue(SYNC_INTERVAL)),
        Err(e) => {
            ctx.publish_warning_event(&obj, "SyncFailed", "Reconciling", Some(e.to_string()))
                .await;
            Err(e)
        }
    }
}

/// Error policy for the controller
pub fn error_policy(obj: Arc<PdCluster>, error: &Error, ctx: Arc<Context>) -> Action {
    let name = obj.name_any();
    let namespace = obj.namespace().unwrap_or_else(|| "default".to_string());

    if let Some(ref health_state) = ctx.health_state {
        health_state.metrics.record_error(&namespace, &name);
    }

    if error.is_not_found() {
        debug!(name = %name, "Resource not found (likely deleted)");
        return Action::await_change();
    }

    if error.is_retryable() {
        warn!(name = %name, error = %error, "Retryable error, will retry");
    } else {
        error!(name = %name, error = %error, "Non-retryable error");
    }
    Action::requeue(error.requeue_after())
}

/// Conditions describing the outcome of a pass.
pub fn compute_conditions(
    status: &PdClusterStatus,
    result: &Result<SyncOutcome>,
    generation: Option<i64>,
) -> Vec<Condition> {
    let mut builder = ConditionBuilder::from_existing(&status.conditions);

    match result {
        Err(e) => {
            builder.ready(false, "SyncFailed", &e.to_string(), generation);
        }
        Ok(SyncOutcome::Suspended) => {
            builder.ready(false, "Suspended", "PD reconciliation is suspended", generation);
        }
        Ok(_) if !status.synced => {
            builder.ready(
                false,
                "StatusSyncFailed",
                "PD member status could not be refreshed",
                generation,
            );
        }
        Ok(_) => {
            let total = status.members.len();
            let healthy = status.members.values().filter(|m| m.health).count();
            let ready = total > 0 && healthy == total;
            builder.ready(
                ready,
                if ready { "MembersHealthy" } else { "MembersUnhealthy" },
                &format!("{healthy}/{total} PD members healthy"),
                generation,
            );
        }
    }

    let requeued = matches!(result, Ok(SyncOutcome::Requeue(_)));
    if status.phase != MemberPhase::Normal || requeued {
        builder.progressing(
            true,
            &status.phase.to_string(),
            &format!("PD phase is {}", status.phase),
            generation,
        );
    } else {
        builder.progressing(false, "Stable", "No scale or upgrade in progress", generation);
    }

    builder.build()
}

async fn patch_status(
    api: &Api<PdCluster>,
    name: &str,
    old: Option<&PdClusterStatus>,
    new: &PdClusterStatus,
) -> Result<()> {
    let patch = status_merge_patch(old, new)?;
    api.patch_status(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
        .await?;
    Ok(())
}
