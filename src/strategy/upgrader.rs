//! Partition-driven graceful upgrader.

use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::StatefulSet;
use kube::ResourceExt;
use tracing::{info, warn};

use crate::controller::error::{Error, Result};
use crate::controller::failover_gate::is_pod_ready;
use crate::controller::upgrade_policy::{
    current_revision, is_on_delete, partition, pod_revision, set_upgrade_partition,
    template_equal, update_revision,
};
use crate::crd::{MemberPhase, PdCluster};
use crate::resources::common::{pd_member_name, pod_name};
use crate::store::PodLister;
use crate::strategy::Upgrader;

/// Upgrades one pod at a time, from the highest ordinal down.
///
/// The partition only moves past a pod once that pod runs the update
/// revision, is ready and its member reports healthy.
pub struct PartitionUpgrader {
    pods: Arc<dyn PodLister>,
}

impl PartitionUpgrader {
    pub fn new(pods: Arc<dyn PodLister>) -> Self {
        Self { pods }
    }
}

#[async_trait]
impl Upgrader for PartitionUpgrader {
    async fn upgrade(
        &self,
        cluster: &mut PdCluster,
        live: &StatefulSet,
        desired: &mut StatefulSet,
    ) -> Result<()> {
        let name = cluster.name_any();
        let namespace = cluster.namespace().unwrap_or_default();

        if !cluster.status_mut().synced {
            return Err(Error::strategy(
                "upgrader",
                format!("{namespace}/{name} PD status sync failed, can not upgrade"),
            ));
        }
        cluster.status_mut().phase = MemberPhase::Upgrade;

        // The new template goes out first; pods follow on later passes
        if !template_equal(desired, live) {
            return Ok(());
        }
        let update = update_revision(live);
        if update == current_revision(live) {
            return Ok(());
        }

        let live_partition = partition(live);
        let Some(live_partition) = live_partition.filter(|_| !is_on_delete(live)) else {
            if let (Some(spec), Some(live_spec)) = (desired.spec.as_mut(), live.spec.as_ref()) {
                spec.update_strategy = live_spec.update_strategy.clone();
            }
            warn!(name = %name, "PD StatefulSet is not partitioned, skipping graceful upgrade");
            return Ok(());
        };
        set_upgrade_partition(desired, live_partition);

        let Some(status) = cluster.status.as_ref() else {
            return Ok(());
        };
        let replicas = live.spec.as_ref().and_then(|s| s.replicas).unwrap_or(0);
        for ordinal in (0..replicas).rev() {
            let pod = pod_name(&name, ordinal);
            let Some(live_pod) = self.pods.get_pod(&namespace, &pod).await? else {
                return Err(Error::strategy("upgrader", format!("pod {namespace}/{pod} not found")));
            };
            let Some(revision) = pod_revision(&live_pod) else {
                return Err(Error::strategy(
                    "upgrader",
                    format!("pod {namespace}/{pod} has no revision label"),
                ));
            };

            if Some(revision) == update {
                if !is_pod_ready(&live_pod) {
                    return Err(Error::strategy(
                        "upgrader",
                        format!("upgraded pod {namespace}/{pod} is not ready"),
                    ));
                }
                let member = pd_member_name(
                    &name,
                    ordinal,
                    &namespace,
                    &cluster.spec.cluster_domain,
                    cluster.spec.across_k8s,
                );
                if !status.members.get(&member).is_some_and(|m| m.health) {
                    return Err(Error::strategy(
                        "upgrader",
                        format!("upgraded pod {namespace}/{pod} is not healthy"),
                    ));
                }
                continue;
            }

            info!(name = %name, pod = %pod, partition = ordinal, "Upgrading PD pod");
            set_upgrade_partition(desired, ordinal);
            return Ok(());
        }
        Ok(())
    }
}
