//! PD member manager.
//!
//! Runs one reconciliation pass for the PD component of a cluster:
//! suspend check, services, status refresh, ConfigMap, then the StatefulSet
//! pipeline below, where the first step that stops ends the pass.
//!
//! ```text
//! force upgrade -> scale -> failover -> volume replace freeze -> upgrade -> apply
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;

use k8s_openapi::api::apps::v1::StatefulSet;
use kube::ResourceExt;
use tracing::{debug, info, warn};

use crate::client::PdClientFactory;
use crate::config::OperatorConfig;
use crate::controller::error::Result;
use crate::controller::failover_gate::should_recover;
use crate::controller::status_sync::StatusSynchronizer;
use crate::controller::upgrade_policy::{freeze_template, set_upgrade_partition, template_equal};
use crate::crd::{MemberPhase, MemberType, PdCluster, WorkloadSnapshot};
use crate::resources::common::{member_name, selector_labels, set_last_applied};
use crate::resources::configmap::generate_configmap;
use crate::resources::services::{generate_client_service, generate_peer_service};
use crate::resources::statefulset::generate_statefulset;
use crate::store::{
    ObjectStore, sync_configmap, sync_service, update_statefulset_with_precheck,
};
use crate::strategy::{
    Failover, MemberFailover, PartitionUpgrader, PvcVolumeStatus, Scaler, SpecSuspender,
    StepScaler, Suspender, Upgrader,
};

/// Why a pass asks to be run again soon.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RequeueReason {
    /// The StatefulSet was just created.
    WorkloadCreated,
    /// A forced upgrade was applied. `error` holds the update failure, if any.
    ForcedUpgrade {
        reasons: Vec<ForceUpgradeReason>,
        error: Option<String>,
    },
}

impl RequeueReason {
    /// Short label for metrics and events.
    pub fn label(&self) -> &'static str {
        match self {
            RequeueReason::WorkloadCreated => "workload_created",
            RequeueReason::ForcedUpgrade { .. } => "forced_upgrade",
        }
    }
}

impl std::fmt::Display for RequeueReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RequeueReason::WorkloadCreated => write!(f, "waiting for the PD StatefulSet to appear"),
            RequeueReason::ForcedUpgrade { reasons, error } => {
                let reasons: Vec<String> = reasons.iter().map(ToString::to_string).collect();
                write!(f, "PD needs force upgrade ({})", reasons.join(", "))?;
                if let Some(error) = error {
                    write!(f, ", {error}")?;
                }
                Ok(())
            }
        }
    }
}

/// Result of a pass that did not fail.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SyncOutcome {
    /// Every step ran and the StatefulSet was applied.
    Synced,
    /// Expected flow control; run again shortly.
    Requeue(RequeueReason),
    /// The component is suspended; nothing was touched.
    Suspended,
    /// The cluster is paused; only status was refreshed.
    Paused,
}

/// A condition that makes graceful upgrade impossible.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ForceUpgradeReason {
    /// The force-upgrade annotation is set.
    ExplicitDirective,
    /// Fewer than two live replicas and no peer members to fail over to.
    SingleReplicaNoPeers,
}

impl std::fmt::Display for ForceUpgradeReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ForceUpgradeReason::ExplicitDirective => write!(f, "ExplicitDirective"),
            ForceUpgradeReason::SingleReplicaNoPeers => write!(f, "SingleReplicaNoPeers"),
        }
    }
}

/// Every forced-upgrade trigger that holds for `cluster` and its live set.
pub fn force_upgrade_reasons(cluster: &PdCluster, live: &StatefulSet) -> Vec<ForceUpgradeReason> {
    let mut reasons = Vec::new();
    if cluster.force_upgrade_requested() {
        reasons.push(ForceUpgradeReason::ExplicitDirective);
    }
    let live_replicas = live.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1);
    let no_peers = cluster
        .status
        .as_ref()
        .is_none_or(|s| s.peer_members.is_empty());
    if live_replicas < 2 && no_peers {
        reasons.push(ForceUpgradeReason::SingleReplicaNoPeers);
    }
    reasons
}

/// Steps of the StatefulSet pipeline, in order.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StepKind {
    ForceUpgrade,
    Scale,
    Failover,
    VolumeReplaceFreeze,
    Upgrade,
}

impl std::fmt::Display for StepKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            StepKind::ForceUpgrade => "force-upgrade",
            StepKind::Scale => "scale",
            StepKind::Failover => "failover",
            StepKind::VolumeReplaceFreeze => "volume-replace-freeze",
            StepKind::Upgrade => "upgrade",
        };
        f.write_str(name)
    }
}

const PIPELINE: [StepKind; 5] = [
    StepKind::ForceUpgrade,
    StepKind::Scale,
    StepKind::Failover,
    StepKind::VolumeReplaceFreeze,
    StepKind::Upgrade,
];

enum Step {
    Continue,
    Stop(SyncOutcome),
}

/// The strategy collaborators of a manager.
#[derive(Clone)]
pub struct Strategies {
    pub scaler: Arc<dyn Scaler>,
    pub upgrader: Arc<dyn Upgrader>,
    pub failover: Arc<dyn Failover>,
    pub suspender: Arc<dyn Suspender>,
}

/// Reconciles the PD component of a PdCluster.
pub struct PdMemberManager {
    store: Arc<dyn ObjectStore>,
    status: StatusSynchronizer,
    strategies: Strategies,
    auto_failover: bool,
}

impl PdMemberManager {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        status: StatusSynchronizer,
        strategies: Strategies,
        auto_failover: bool,
    ) -> Self {
        Self {
            store,
            status,
            strategies,
            auto_failover,
        }
    }

    /// A manager wired with the default strategies over `store`.
    pub fn with_defaults<S: ObjectStore + 'static>(
        store: Arc<S>,
        pd: Arc<dyn PdClientFactory>,
        config: &OperatorConfig,
    ) -> Self {
        let status = StatusSynchronizer::new(
            pd.clone(),
            store.clone(),
            store.clone(),
            store.clone(),
            Arc::new(PvcVolumeStatus::new(store.clone())),
        );
        let strategies = Strategies {
            scaler: Arc::new(StepScaler::new(pd.clone())),
            upgrader: Arc::new(PartitionUpgrader::new(store.clone())),
            failover: Arc::new(MemberFailover::new(
                pd,
                store.clone(),
                store.clone(),
                config.failover_period,
            )),
            suspender: Arc::new(SpecSuspender),
        };
        Self::new(store, status, strategies, config.auto_failover)
    }

    /// Forget cached state of a deleted cluster.
    pub fn forget(&self, namespace: &str, name: &str) {
        self.status.forget(namespace, name);
    }

    /// Run one pass over `cluster`, updating its status in place.
    pub async fn sync(&self, cluster: &mut PdCluster) -> Result<SyncOutcome> {
        let name = cluster.name_any();
        let namespace = cluster.namespace().unwrap_or_default();

        if self
            .strategies
            .suspender
            .suspend_component(cluster, MemberType::Pd)
            .await?
        {
            debug!(name = %name, namespace = %namespace, "PD is suspended");
            return Ok(SyncOutcome::Suspended);
        }

        if !cluster.spec.paused {
            sync_service(self.store.as_ref(), &generate_client_service(cluster)).await?;
            sync_service(self.store.as_ref(), &generate_peer_service(cluster)).await?;
        }

        let set_name = member_name(&name);
        let live = self.store.get_statefulset(&namespace, &set_name).await?;

        // A failed refresh leaves Synced=false, which the forced upgrade keys on
        if let Err(e) = self.status.sync(cluster, live.as_ref()).await {
            warn!(name = %name, namespace = %namespace, error = %e, "Failed to sync PD status");
        }

        if cluster.spec.paused {
            info!(name = %name, namespace = %namespace, "Cluster is paused, skipping PD sync");
            return Ok(SyncOutcome::Paused);
        }

        sync_configmap(self.store.as_ref(), &generate_configmap(cluster)?).await?;
        let mut desired = generate_statefulset(cluster)?;

        let Some(live) = live else {
            set_last_applied(&mut desired.metadata, &desired.spec)?;
            info!(name = %name, namespace = %namespace, "Creating PD StatefulSet");
            self.store.create_statefulset(&namespace, &desired).await?;
            cluster.status_mut().workload_snapshot = Some(WorkloadSnapshot::default());
            return Ok(SyncOutcome::Requeue(RequeueReason::WorkloadCreated));
        };

        for kind in PIPELINE {
            if let Step::Stop(outcome) = self.run_step(kind, cluster, &live, &mut desired).await? {
                debug!(name = %name, step = %kind, "PD pipeline stopped");
                return Ok(outcome);
            }
        }

        update_statefulset_with_precheck(self.store.as_ref(), &desired, &live).await?;
        Ok(SyncOutcome::Synced)
    }

    async fn run_step(
        &self,
        kind: StepKind,
        cluster: &mut PdCluster,
        live: &StatefulSet,
        desired: &mut StatefulSet,
    ) -> Result<Step> {
        match kind {
            StepKind::ForceUpgrade => self.force_upgrade(cluster, live, desired).await,
            StepKind::Scale => {
                self.strategies.scaler.scale(cluster, live, desired).await?;
                Ok(Step::Continue)
            }
            StepKind::Failover => {
                self.failover(cluster).await?;
                Ok(Step::Continue)
            }
            StepKind::VolumeReplaceFreeze => {
                if cluster
                    .status
                    .as_ref()
                    .is_some_and(|s| s.vol_replace_in_progress)
                {
                    freeze_template(desired, live);
                }
                Ok(Step::Continue)
            }
            StepKind::Upgrade => {
                let phase = cluster.status_mut().phase;
                if phase == MemberPhase::Scale {
                    // Roll nothing out until the replica counts converge
                    freeze_template(desired, live);
                } else if !template_equal(desired, live) || phase == MemberPhase::Upgrade {
                    self.strategies.upgrader.upgrade(cluster, live, desired).await?;
                }
                Ok(Step::Continue)
            }
        }
    }

    async fn force_upgrade(
        &self,
        cluster: &mut PdCluster,
        live: &StatefulSet,
        desired: &mut StatefulSet,
    ) -> Result<Step> {
        if cluster.status_mut().synced || template_equal(desired, live) {
            return Ok(Step::Continue);
        }
        let reasons = force_upgrade_reasons(cluster, live);
        if reasons.is_empty() {
            return Ok(Step::Continue);
        }

        info!(
            name = %cluster.name_any(),
            reasons = ?reasons,
            "Forcing PD upgrade"
        );
        cluster.status_mut().phase = MemberPhase::Upgrade;
        set_upgrade_partition(desired, 0);
        let error = update_statefulset_with_precheck(self.store.as_ref(), desired, live)
            .await
            .err()
            .map(|e| e.to_string());
        Ok(Step::Stop(SyncOutcome::Requeue(RequeueReason::ForcedUpgrade {
            reasons,
            error,
        })))
    }

    async fn failover(&self, cluster: &mut PdCluster) -> Result<()> {
        if !self.auto_failover {
            return Ok(());
        }

        let has_failures = cluster
            .status
            .as_ref()
            .is_some_and(|s| s.failure_members.is_some());
        let pods = if has_failures {
            let namespace = cluster.namespace().unwrap_or_default();
            self.store
                .list_pods(&namespace, &selector_labels(cluster))
                .await?
                .into_iter()
                .map(|pod| (pod.name_any(), pod))
                .collect()
        } else {
            BTreeMap::new()
        };

        if should_recover(cluster, &pods) {
            self.strategies.failover.recover(cluster);
            return Ok(());
        }

        let auto_failovering = cluster
            .status
            .as_ref()
            .is_some_and(|s| s.auto_failovering());
        if cluster.max_failover_count() > 0
            && ((cluster.all_pods_started() && !cluster.all_members_ready()) || auto_failovering)
        {
            self.strategies.failover.failover(cluster).await?;
        }
        Ok(())
    }
}
