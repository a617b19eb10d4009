//! Status synchronizer.
//!
//! Merges the live StatefulSet and the PD health endpoint into the persisted
//! `PdClusterStatus`. Member maps are rebuilt from scratch on every pass; the
//! previous maps are only read to carry transition times forward.

use std::collections::BTreeMap;
use std::sync::Arc;

use k8s_openapi::api::apps::v1::StatefulSet;
use kube::ResourceExt;
use regex::Regex;
use tracing::{debug, warn};

use crate::client::{MemberHealth, PdClientError, PdClientFactory};
use crate::controller::error::{Error, Result};
use crate::controller::membership::{MemberPatternCache, collect_unjoined};
use crate::controller::upgrade_policy::statefulset_is_upgrading;
use crate::crd::{MemberPhase, PdCluster, PdMember, WorkloadSnapshot};
use crate::resources::common::{member_name, workload_selector};
use crate::resources::statefulset::pd_container_image;
use crate::store::{EndpointLister, PodLister, PvcLister};
use crate::strategy::VolumeStatusSyncer;

/// Freshly built membership of one pass.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct MemberMaps {
    pub members: BTreeMap<String, PdMember>,
    pub peer_members: BTreeMap<String, PdMember>,
    /// Record of the member named like the current leader, if reported.
    pub leader: Option<PdMember>,
}

fn carry_forward(record: &mut PdMember, previous: Option<&PdMember>) {
    if let Some(previous) = previous
        && previous.health == record.health
    {
        record.last_transition_time = previous.last_transition_time.clone();
    }
}

/// Classify health records into this cluster's members and peer members.
///
/// A record belongs to this cluster when its client URL matches `pattern`.
/// Records without a name are skipped. The transition time of a record is
/// copied from the previous record of the same name in the same map when the
/// health flag did not change, otherwise it is `now`.
pub fn build_member_maps(
    healths: &[MemberHealth],
    pattern: &Regex,
    previous_members: &BTreeMap<String, PdMember>,
    previous_peers: &BTreeMap<String, PdMember>,
    leader_name: &str,
    now: &str,
) -> MemberMaps {
    let mut maps = MemberMaps::default();
    for health in healths {
        if health.name.is_empty() {
            warn!(member_id = health.member_id, "PD member has no name, skipping");
            continue;
        }

        let mut record = PdMember {
            name: health.name.clone(),
            id: health.member_id.to_string(),
            client_url: health.client_url().to_string(),
            health: health.health,
            last_transition_time: now.to_string(),
        };

        if pattern.is_match(&record.client_url) {
            let previous = previous_members.get(&record.name);
            carry_forward(&mut record, previous);
            if record.name == leader_name {
                maps.leader = Some(record.clone());
            }
            maps.members.insert(record.name.clone(), record);
        } else {
            let previous = previous_peers.get(&record.name);
            carry_forward(&mut record, previous);
            if record.name == leader_name {
                maps.leader = Some(record.clone());
            }
            maps.peer_members.insert(record.name.clone(), record);
        }
    }
    maps
}

/// Refreshes the status of a PdCluster from live state.
pub struct StatusSynchronizer {
    pd: Arc<dyn PdClientFactory>,
    pods: Arc<dyn PodLister>,
    endpoints: Arc<dyn EndpointLister>,
    pvcs: Arc<dyn PvcLister>,
    volumes: Arc<dyn VolumeStatusSyncer>,
    patterns: MemberPatternCache,
}

impl StatusSynchronizer {
    pub fn new(
        pd: Arc<dyn PdClientFactory>,
        pods: Arc<dyn PodLister>,
        endpoints: Arc<dyn EndpointLister>,
        pvcs: Arc<dyn PvcLister>,
        volumes: Arc<dyn VolumeStatusSyncer>,
    ) -> Self {
        Self {
            pd,
            pods,
            endpoints,
            pvcs,
            volumes,
            patterns: MemberPatternCache::new(),
        }
    }

    /// Forget cached state of a deleted cluster.
    pub fn forget(&self, namespace: &str, name: &str) {
        self.patterns.forget(namespace, name);
    }

    /// Refresh `cluster.status` from `live`. No-op when `live` is `None`.
    pub async fn sync(&self, cluster: &mut PdCluster, live: Option<&StatefulSet>) -> Result<()> {
        let now = jiff::Timestamp::now().to_string();
        self.sync_at(cluster, live, &now).await
    }

    /// As `sync`, stamping `now` on every new transition.
    pub async fn sync_at(
        &self,
        cluster: &mut PdCluster,
        live: Option<&StatefulSet>,
        now: &str,
    ) -> Result<()> {
        let Some(live) = live else {
            return Ok(());
        };
        let name = cluster.name_any();
        let namespace = cluster.namespace().unwrap_or_default();

        cluster.status_mut().workload_snapshot = Some(
            live.status
                .as_ref()
                .map(WorkloadSnapshot::from)
                .unwrap_or_default(),
        );

        let pods = self
            .pods
            .list_pods(&namespace, &workload_selector(cluster, live))
            .await?;
        let live_replicas = live.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1);
        let phase = if cluster.desired_replicas() != live_replicas {
            MemberPhase::Scale
        } else if statefulset_is_upgrading(live, &pods) {
            MemberPhase::Upgrade
        } else {
            MemberPhase::Normal
        };
        cluster.status_mut().phase = phase;

        let client = self.pd.client_for(cluster);
        let health = match client.get_health().await {
            Ok(health) => health,
            Err(err) => {
                cluster.status_mut().synced = false;
                return Err(self.health_error(&namespace, &name, err).await);
            }
        };
        let info = match client.get_cluster().await {
            Ok(info) => info,
            Err(err) => {
                cluster.status_mut().synced = false;
                return Err(err.into());
            }
        };
        cluster.status_mut().cluster_id = info.id.to_string();
        let leader = match client.get_pd_leader().await {
            Ok(leader) => leader,
            Err(err) => {
                cluster.status_mut().synced = false;
                return Err(err.into());
            }
        };

        let pattern = self.patterns.pattern_for(cluster)?;
        let status = cluster.status_mut();
        let maps = build_member_maps(
            &health.healths,
            &pattern,
            &status.members,
            &status.peer_members,
            &leader.name,
            now,
        );
        if let Some(leader) = maps.leader {
            status.leader = leader;
        }
        status.members = maps.members;
        status.peer_members = maps.peer_members;
        status.synced = true;
        status.image = pd_container_image(live).unwrap_or_default();
        debug!(
            name = %name,
            members = status.members.len(),
            peer_members = status.peer_members.len(),
            phase = %status.phase,
            "Synced PD status"
        );

        let members = status.members.clone();
        let unjoined =
            collect_unjoined(cluster, &pods, &members, self.pvcs.as_ref(), now).await?;
        cluster.status_mut().unjoined_members = unjoined;

        self.volumes.sync_volume_status(cluster).await
    }

    /// The error to surface for a failed health query.
    ///
    /// When the client service has an endpoints object without any ready
    /// subsets, PD cannot answer at all and that is reported instead.
    async fn health_error(&self, namespace: &str, name: &str, err: PdClientError) -> Error {
        let service = member_name(name);
        match self.endpoints.get_endpoints(namespace, &service).await {
            Ok(Some(eps)) if eps.subsets.as_ref().is_none_or(Vec::is_empty) => {
                Error::NoReadyBackends {
                    namespace: namespace.to_string(),
                    service,
                    source: err,
                }
            }
            Ok(_) => err.into(),
            Err(ep_err) => Error::Transient(format!("{err}, {ep_err}")),
        }
    }
}
