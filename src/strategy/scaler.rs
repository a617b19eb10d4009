//! One-step scaler.

use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::StatefulSet;
use kube::ResourceExt;
use tracing::info;

use crate::client::PdClientFactory;
use crate::controller::error::{Error, Result};
use crate::crd::{MemberPhase, PdCluster};
use crate::resources::common::pd_member_name;
use crate::strategy::Scaler;

fn replicas_of(set: &StatefulSet) -> i32 {
    set.spec.as_ref().and_then(|s| s.replicas).unwrap_or(0)
}

fn set_replicas(set: &mut StatefulSet, replicas: i32) {
    if let Some(spec) = set.spec.as_mut() {
        spec.replicas = Some(replicas);
    }
}

/// Moves the replica count one member per pass.
///
/// Scaling out adds the next ordinal. Scaling in first removes the highest
/// ordinal from PD and is refused until status is synced and no upgrade is
/// running.
pub struct StepScaler {
    pd: Arc<dyn PdClientFactory>,
}

impl StepScaler {
    pub fn new(pd: Arc<dyn PdClientFactory>) -> Self {
        Self { pd }
    }
}

#[async_trait]
impl Scaler for StepScaler {
    async fn scale(
        &self,
        cluster: &mut PdCluster,
        live: &StatefulSet,
        desired: &mut StatefulSet,
    ) -> Result<()> {
        let current = replicas_of(live);
        let target = replicas_of(desired);
        // Hold the live count until this step decides otherwise
        set_replicas(desired, current);

        if target > current {
            info!(
                name = %cluster.name_any(),
                from = current,
                to = current + 1,
                "Scaling out PD"
            );
            set_replicas(desired, current + 1);
            return Ok(());
        }
        if target == current {
            return Ok(());
        }

        let status = cluster.status_mut();
        if !status.synced {
            return Err(Error::strategy(
                "scaler",
                "PD status sync failed, can't scale in now",
            ));
        }
        if status.phase == MemberPhase::Upgrade {
            return Err(Error::strategy(
                "scaler",
                "PD is upgrading, can't scale in until the upgrade completes",
            ));
        }

        let ordinal = current - 1;
        let member = pd_member_name(
            &cluster.name_any(),
            ordinal,
            &cluster.namespace().unwrap_or_default(),
            &cluster.spec.cluster_domain,
            cluster.spec.across_k8s,
        );
        info!(name = %cluster.name_any(), member = %member, "Removing PD member before scaling in");
        self.pd
            .client_for(cluster)
            .delete_member(&member)
            .await?;

        set_replicas(desired, ordinal);
        Ok(())
    }
}
