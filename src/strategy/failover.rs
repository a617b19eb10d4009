//! Failure-member bookkeeping.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use jiff::Timestamp;
use kube::ResourceExt;
use tracing::{info, warn};

use crate::client::PdClientFactory;
use crate::controller::error::{Error, Result};
use crate::crd::{FailureMember, PdCluster, desired_ordinals};
use crate::controller::membership::canonical_member_name;
use crate::resources::common::ordinal_from_pod_name;
use crate::store::{PodLister, PvcLister, resolve_pvcs_from_pod};
use crate::strategy::Failover;

/// Marks members that stay unhealthy past the failover period as failed,
/// then removes them from PD so a replacement ordinal is added.
///
/// One member is handled per pass and at most `maxFailoverCount` are
/// recorded. Nothing happens while PD has lost quorum.
pub struct MemberFailover {
    pd: Arc<dyn PdClientFactory>,
    pods: Arc<dyn PodLister>,
    pvcs: Arc<dyn PvcLister>,
    period: Duration,
}

impl MemberFailover {
    pub fn new(
        pd: Arc<dyn PdClientFactory>,
        pods: Arc<dyn PodLister>,
        pvcs: Arc<dyn PvcLister>,
        period: Duration,
    ) -> Self {
        Self {
            pd,
            pods,
            pvcs,
            period,
        }
    }

    async fn delete_failure_member(&self, cluster: &mut PdCluster) -> Result<()> {
        let pending = cluster
            .status
            .as_ref()
            .and_then(|s| s.failure_members.as_ref())
            .and_then(|f| f.iter().find(|(_, f)| !f.member_deleted))
            .map(|(pod, _)| pod.clone());
        let Some(pod) = pending else {
            return Ok(());
        };
        let member = canonical_member_name(cluster, &pod)?;

        info!(
            namespace = %cluster.namespace().unwrap_or_default(),
            pod = %pod,
            member = %member,
            "Deleting failed PD member"
        );
        self.pd.client_for(cluster).delete_member(&member).await?;
        if let Some(failure) = cluster
            .status_mut()
            .failure_members
            .as_mut()
            .and_then(|f| f.get_mut(&pod))
        {
            failure.member_deleted = true;
        }
        Ok(())
    }

    async fn mark_failure_member(&self, cluster: &mut PdCluster) -> Result<()> {
        let name = cluster.name_any();
        let namespace = cluster.namespace().unwrap_or_default();
        let desired: Vec<i32> = desired_ordinals(cluster, false).collect();
        let max = cluster.max_failover_count();
        let now = Timestamp::now();
        let period = jiff::SignedDuration::try_from(self.period)
            .map_err(|e| Error::Validation(format!("failover period: {e}")))?;

        let Some(status) = cluster.status.as_ref() else {
            return Ok(());
        };
        let known = status.failure_members.as_ref();

        let candidate = status.members.iter().find_map(|(member_name, member)| {
            let pod = member_name.split('.').next().unwrap_or(member_name);
            let ordinal = ordinal_from_pod_name(pod)?;
            if member.health || !desired.contains(&ordinal) {
                return None;
            }
            if known.is_some_and(|k| k.contains_key(pod)) {
                return None;
            }
            let since: Timestamp = member.last_transition_time.parse().ok()?;
            let deadline = since.checked_add(period).ok()?;
            (now >= deadline).then(|| (pod.to_string(), member.id.clone()))
        });
        let Some((pod, member_id)) = candidate else {
            return Ok(());
        };

        if known.map_or(0, BTreeMap::len) >= usize::try_from(max).unwrap_or(0) {
            warn!(
                name = %name,
                max_failover_count = max,
                "PD failure members reached the failover limit"
            );
            return Ok(());
        }

        let mut pvc_uid_set = Default::default();
        if let Some(live_pod) = self.pods.get_pod(&namespace, &pod).await? {
            pvc_uid_set = resolve_pvcs_from_pod(self.pvcs.as_ref(), &live_pod)
                .await?
                .into_iter()
                .filter_map(|pvc| pvc.metadata.uid)
                .collect();
        }

        info!(name = %name, pod = %pod, "Marking PD member as failed");
        cluster
            .status_mut()
            .failure_members
            .get_or_insert_with(BTreeMap::new)
            .insert(
                pod.clone(),
                FailureMember {
                    pod_name: pod,
                    member_id,
                    pvc_uid_set,
                    member_deleted: false,
                    created_at: now.to_string(),
                },
            );
        Ok(())
    }
}

#[async_trait]
impl Failover for MemberFailover {
    fn recover(&self, cluster: &mut PdCluster) {
        info!(name = %cluster.name_any(), "Recovering from PD failover");
        cluster.status_mut().failure_members = None;
    }

    async fn failover(&self, cluster: &mut PdCluster) -> Result<()> {
        let status = cluster.status_mut();
        if !status.synced {
            return Err(Error::strategy(
                "failover",
                "PD status sync failed, can't failover",
            ));
        }
        let healthy = status.members.values().filter(|m| m.health).count();
        if healthy <= status.members.len() / 2 {
            return Err(Error::strategy(
                "failover",
                format!(
                    "PD lost quorum ({healthy} of {} healthy), can't failover",
                    status.members.len()
                ),
            ));
        }

        if status.auto_failovering() {
            return self.delete_failure_member(cluster).await;
        }
        self.mark_failure_member(cluster).await
    }
}
