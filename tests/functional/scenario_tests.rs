//! Multi-pass scenarios driving `PdMemberManager` against the mocks.

use std::collections::BTreeMap;
use std::sync::Arc;

use k8s_openapi::api::core::v1::Endpoints;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

use pd_operator::OperatorConfig;
use pd_operator::controller::error::Error;
use pd_operator::controller::member_manager::{
    ForceUpgradeReason, PdMemberManager, RequeueReason, SyncOutcome,
};
use pd_operator::controller::status_sync::StatusSynchronizer;
use pd_operator::controller::upgrade_policy::{is_on_delete, partition};
use pd_operator::crd::{
    ANNOTATION_FORCE_UPGRADE, FailureMember, MemberPhase, PdCluster, SuspendAction,
};
use pd_operator::resources::statefulset::pd_container_image;
use pd_operator::strategy::PvcVolumeStatus;

use crate::mock_state::*;

const SET: &str = "basic-pd";

struct Harness {
    store: Arc<MockStore>,
    pd: MockPd,
    manager: PdMemberManager,
}

impl Harness {
    fn new(pd: MockPd) -> Self {
        let store = MockStore::new();
        let manager = PdMemberManager::with_defaults(
            store.clone(),
            Arc::new(pd.clone()),
            &OperatorConfig::default(),
        );
        Self { store, pd, manager }
    }

    /// Create the workload, then make it look fully rolled out on `rev-1`
    /// with one ready pod and bound claim per replica.
    async fn settle(&self, cluster: &mut PdCluster) {
        let outcome = self.manager.sync(cluster).await.unwrap();
        assert_eq!(outcome, SyncOutcome::Requeue(RequeueReason::WorkloadCreated));

        let replicas = cluster.spec.replicas;
        self.store.set_statefulset_status(SET, replicas, "rev-1", "rev-1");
        for ordinal in 0..replicas {
            self.store.add_pod(pd_pod(ordinal, "rev-1", true));
            self.store.add_pvc(pd_pvc(ordinal));
        }
    }

    /// A status synchronizer over the same mocks as the manager.
    fn synchronizer(&self) -> StatusSynchronizer {
        StatusSynchronizer::new(
            Arc::new(self.pd.clone()),
            self.store.clone(),
            self.store.clone(),
            self.store.clone(),
            Arc::new(PvcVolumeStatus::new(self.store.clone())),
        )
    }

    fn image(&self) -> String {
        pd_container_image(&self.store.statefulset(SET).unwrap()).unwrap()
    }
}

#[tokio::test]
async fn test_first_pass_creates_workload() {
    let h = Harness::new(MockPd::with_members(&[]));
    let mut cluster = test_cluster(3);

    let outcome = h.manager.sync(&mut cluster).await.unwrap();
    assert_eq!(outcome, SyncOutcome::Requeue(RequeueReason::WorkloadCreated));

    let services = h.store.services.lock().unwrap();
    assert!(services.contains_key("basic-pd"));
    assert!(services.contains_key("basic-pd-peer"));
    drop(services);
    assert!(h.store.configmaps.lock().unwrap().contains_key("basic-pd"));

    let set = h.store.statefulset(SET).unwrap();
    assert_eq!(set.spec.as_ref().unwrap().replicas, Some(3));
    assert_eq!(h.store.update_count(), 0);

    let status = cluster.status.as_ref().unwrap();
    assert!(status.workload_snapshot.is_some());
    assert!(status.members.is_empty());
}

#[tokio::test]
async fn test_stable_cluster_is_synced_without_updates() {
    let h = Harness::new(MockPd::with_members(&[true, true, true]));
    let mut cluster = test_cluster(3);
    h.settle(&mut cluster).await;

    let outcome = h.manager.sync(&mut cluster).await.unwrap();
    assert_eq!(outcome, SyncOutcome::Synced);
    assert_eq!(h.store.update_count(), 0);

    let status = cluster.status.as_ref().unwrap();
    assert!(status.synced);
    assert_eq!(status.phase, MemberPhase::Normal);
    assert_eq!(status.members.len(), 3);
    assert!(status.peer_members.is_empty());
    assert!(status.unjoined_members.is_empty());
    assert_eq!(status.leader.name, "basic-pd-0");
    assert_eq!(status.cluster_id, "7400683975866343221");
    assert_eq!(status.members["basic-pd-1"].id, "1001");
    assert_eq!(status.volumes["pd"].bound_count, 3);
    assert!(status.image.ends_with(":v7.5.0"));
}

#[tokio::test]
async fn test_repeated_passes_are_idempotent() {
    let h = Harness::new(MockPd::with_members(&[true, true, true]));
    let mut cluster = test_cluster(3);
    h.settle(&mut cluster).await;

    h.manager.sync(&mut cluster).await.unwrap();
    let first = cluster.status.clone();
    h.manager.sync(&mut cluster).await.unwrap();

    assert_eq!(cluster.status, first);
    assert_eq!(h.store.update_count(), 0);
}

#[tokio::test]
async fn test_transition_time_follows_health_flips() {
    let h = Harness::new(MockPd::with_members(&[true, true, true]));
    let mut cluster = test_cluster(3);
    h.settle(&mut cluster).await;

    h.manager.sync(&mut cluster).await.unwrap();
    let members = cluster.status.as_ref().unwrap().members.clone();
    // Make the recorded time distinguishable from any fresh stamp
    for member in cluster.status_mut().members.values_mut() {
        member.last_transition_time = "2020-01-01T00:00:00Z".to_string();
    }

    h.pd.set_healths(&[true, false, true]);
    h.manager.sync(&mut cluster).await.ok();
    let status = cluster.status.as_ref().unwrap();
    assert_eq!(members.len(), status.members.len());
    assert_eq!(
        status.members["basic-pd-0"].last_transition_time,
        "2020-01-01T00:00:00Z"
    );
    assert!(!status.members["basic-pd-1"].health);
    assert_ne!(
        status.members["basic-pd-1"].last_transition_time,
        "2020-01-01T00:00:00Z"
    );
}

#[tokio::test]
async fn test_forced_upgrade_on_explicit_directive() {
    let h = Harness::new(MockPd::with_members(&[true, true, true]));
    let mut cluster = test_cluster(3);
    h.settle(&mut cluster).await;

    h.pd.set_health_down(true);
    cluster.spec.version = "v8.1.0".to_string();
    cluster.metadata.annotations = Some(
        [(ANNOTATION_FORCE_UPGRADE.to_string(), "true".to_string())].into(),
    );

    let outcome = h.manager.sync(&mut cluster).await.unwrap();
    assert_eq!(
        outcome,
        SyncOutcome::Requeue(RequeueReason::ForcedUpgrade {
            reasons: vec![ForceUpgradeReason::ExplicitDirective],
            error: None,
        })
    );

    let status = cluster.status.as_ref().unwrap();
    assert!(!status.synced);
    assert_eq!(status.phase, MemberPhase::Upgrade);

    let updated = h.store.last_update().unwrap();
    assert_eq!(partition(&updated), Some(0));
    assert!(pd_container_image(&updated).unwrap().ends_with(":v8.1.0"));
}

#[tokio::test]
async fn test_forced_upgrade_single_replica_without_peers() {
    let h = Harness::new(MockPd::with_members(&[true]));
    let mut cluster = test_cluster(1);
    h.settle(&mut cluster).await;

    h.pd.set_health_down(true);
    cluster.spec.version = "v8.1.0".to_string();

    let outcome = h.manager.sync(&mut cluster).await.unwrap();
    assert_eq!(
        outcome,
        SyncOutcome::Requeue(RequeueReason::ForcedUpgrade {
            reasons: vec![ForceUpgradeReason::SingleReplicaNoPeers],
            error: None,
        })
    );
    assert_eq!(h.store.update_count(), 1);
}

#[tokio::test]
async fn test_forced_upgrade_reports_update_conflict() {
    let h = Harness::new(MockPd::with_members(&[true]));
    let mut cluster = test_cluster(1);
    h.settle(&mut cluster).await;

    h.pd.set_health_down(true);
    *h.store.conflict_on_update.lock().unwrap() = true;
    cluster.spec.version = "v8.1.0".to_string();

    let outcome = h.manager.sync(&mut cluster).await.unwrap();
    match outcome {
        SyncOutcome::Requeue(RequeueReason::ForcedUpgrade { error, .. }) => {
            assert!(error.unwrap().contains("Conflict"));
        }
        other => panic!("expected a forced upgrade, got {other:?}"),
    }
    assert!(h.image().ends_with(":v7.5.0"));
}

#[tokio::test]
async fn test_no_forced_upgrade_when_template_unchanged() {
    let h = Harness::new(MockPd::with_members(&[true]));
    let mut cluster = test_cluster(1);
    h.settle(&mut cluster).await;

    h.pd.set_health_down(true);
    // Status refresh failed but nothing changed, so nothing is forced
    let result = h.manager.sync(&mut cluster).await;
    assert!(!matches!(
        result,
        Ok(SyncOutcome::Requeue(RequeueReason::ForcedUpgrade { .. }))
    ));
    assert_eq!(h.store.update_count(), 0);
}

#[tokio::test]
async fn test_scale_takes_precedence_over_upgrade() {
    let h = Harness::new(MockPd::with_members(&[true, true, true]));
    let mut cluster = test_cluster(3);
    h.settle(&mut cluster).await;

    cluster.spec.replicas = 5;
    cluster.spec.version = "v8.1.0".to_string();

    let outcome = h.manager.sync(&mut cluster).await.unwrap();
    assert_eq!(outcome, SyncOutcome::Synced);
    assert_eq!(cluster.status.as_ref().unwrap().phase, MemberPhase::Scale);

    let updated = h.store.last_update().unwrap();
    assert_eq!(updated.spec.as_ref().unwrap().replicas, Some(4));
    assert!(pd_container_image(&updated).unwrap().ends_with(":v7.5.0"));
}

#[tokio::test]
async fn test_scale_in_removes_member_first() {
    let h = Harness::new(MockPd::with_members(&[true, true, true]));
    let mut cluster = test_cluster(3);
    h.settle(&mut cluster).await;

    cluster.spec.replicas = 2;
    let outcome = h.manager.sync(&mut cluster).await.unwrap();
    assert_eq!(outcome, SyncOutcome::Synced);
    assert_eq!(h.pd.deleted(), vec!["basic-pd-2".to_string()]);

    let updated = h.store.last_update().unwrap();
    assert_eq!(updated.spec.as_ref().unwrap().replicas, Some(2));
}

#[tokio::test]
async fn test_graceful_upgrade_walks_partition_down() {
    let h = Harness::new(MockPd::with_members(&[true, true, true]));
    let mut cluster = test_cluster(3);
    h.settle(&mut cluster).await;

    // New template goes out with the partition still at the replica count
    cluster.spec.version = "v8.1.0".to_string();
    let outcome = h.manager.sync(&mut cluster).await.unwrap();
    assert_eq!(outcome, SyncOutcome::Synced);
    assert_eq!(cluster.status.as_ref().unwrap().phase, MemberPhase::Upgrade);
    let updated = h.store.last_update().unwrap();
    assert!(pd_container_image(&updated).unwrap().ends_with(":v8.1.0"));
    assert_eq!(partition(&updated), Some(3));

    // The StatefulSet controller computes the new revision
    h.store.set_statefulset_status(SET, 3, "rev-1", "rev-2");
    let outcome = h.manager.sync(&mut cluster).await.unwrap();
    assert_eq!(outcome, SyncOutcome::Synced);
    assert_eq!(partition(&h.store.last_update().unwrap()), Some(2));

    // basic-pd-2 rolled and is healthy, so the next ordinal is released
    h.store.add_pod(pd_pod(2, "rev-2", true));
    let outcome = h.manager.sync(&mut cluster).await.unwrap();
    assert_eq!(outcome, SyncOutcome::Synced);
    assert_eq!(partition(&h.store.last_update().unwrap()), Some(1));
}

#[tokio::test]
async fn test_volume_replace_freezes_template() {
    let h = Harness::new(MockPd::with_members(&[true, true, true]));
    let mut cluster = test_cluster(3);
    h.settle(&mut cluster).await;

    cluster.status_mut().vol_replace_in_progress = true;
    cluster.spec.version = "v8.1.0".to_string();

    let outcome = h.manager.sync(&mut cluster).await.unwrap();
    assert_eq!(outcome, SyncOutcome::Synced);
    let updated = h.store.last_update().unwrap();
    assert!(is_on_delete(&updated));
    assert!(pd_container_image(&updated).unwrap().ends_with(":v7.5.0"));
}

#[tokio::test]
async fn test_unjoined_pod_is_recorded_with_claims() {
    let h = Harness::new(MockPd::with_members(&[true, true]));
    let mut cluster = test_cluster(3);
    h.settle(&mut cluster).await;

    let outcome = h.manager.sync(&mut cluster).await.unwrap();
    assert_eq!(outcome, SyncOutcome::Synced);

    let status = cluster.status.as_ref().unwrap();
    assert_eq!(status.members.len(), 2);
    assert_eq!(status.unjoined_members.len(), 1);
    let unjoined = &status.unjoined_members["basic-pd-2"];
    assert_eq!(unjoined.pod_name, "basic-pd-2");
    assert_eq!(unjoined.pvc_uid_set, uid_set(&["uid-2"]));

    // Once it joins the record is dropped
    h.pd.set_healths(&[true, true, true]);
    h.manager.sync(&mut cluster).await.unwrap();
    assert!(cluster.status.as_ref().unwrap().unjoined_members.is_empty());
}

#[tokio::test]
async fn test_paused_cluster_only_refreshes_status() {
    let h = Harness::new(MockPd::with_members(&[true, true, true]));
    let mut cluster = test_cluster(3);
    h.settle(&mut cluster).await;

    cluster.spec.paused = true;
    cluster.spec.version = "v8.1.0".to_string();

    let outcome = h.manager.sync(&mut cluster).await.unwrap();
    assert_eq!(outcome, SyncOutcome::Paused);
    assert_eq!(h.store.update_count(), 0);
    assert_eq!(cluster.status.as_ref().unwrap().members.len(), 3);
    assert!(h.image().ends_with(":v7.5.0"));
}

#[tokio::test]
async fn test_suspended_cluster_is_untouched() {
    let h = Harness::new(MockPd::with_members(&[true]));
    let mut cluster = test_cluster(3);
    cluster.spec.suspend_action = Some(SuspendAction {
        suspend_stateful_set: true,
    });

    let outcome = h.manager.sync(&mut cluster).await.unwrap();
    assert_eq!(outcome, SyncOutcome::Suspended);
    assert!(h.store.services.lock().unwrap().is_empty());
    assert!(h.store.statefulset(SET).is_none());
    assert!(cluster.status.is_none());
}

#[tokio::test]
async fn test_status_failure_blocks_failover() {
    let h = Harness::new(MockPd::with_members(&[true, true, true]));
    let mut cluster = test_cluster(3);
    h.settle(&mut cluster).await;

    h.pd.set_health_down(true);
    let result = h.manager.sync(&mut cluster).await;
    assert!(matches!(
        result,
        Err(Error::Strategy {
            strategy: "failover",
            ..
        })
    ));
    assert!(!cluster.status.as_ref().unwrap().synced);
}

#[tokio::test]
async fn test_status_reports_missing_ready_backends() {
    let h = Harness::new(MockPd::with_members(&[true]));
    let mut cluster = test_cluster(1);
    h.settle(&mut cluster).await;
    h.pd.set_health_down(true);

    let sync = h.synchronizer();
    let live = h.store.statefulset(SET);

    // Without an endpoints object the PD error is reported as is
    let err = sync.sync(&mut cluster, live.as_ref()).await.unwrap_err();
    assert!(matches!(err, Error::PdApi(_)));

    h.store.add_endpoints(Endpoints {
        metadata: ObjectMeta {
            name: Some("basic-pd".to_string()),
            namespace: Some(NAMESPACE.to_string()),
            ..Default::default()
        },
        subsets: None,
    });
    let err = sync.sync(&mut cluster, live.as_ref()).await.unwrap_err();
    assert!(matches!(err, Error::NoReadyBackends { .. }));
    assert!(err.to_string().contains("db/basic-pd has no endpoints"));
    assert!(!cluster.status.as_ref().unwrap().synced);
}

#[tokio::test]
async fn test_cluster_query_failure_keeps_previous_members() {
    let h = Harness::new(MockPd::with_members(&[true, true, true]));
    let mut cluster = test_cluster(3);
    h.settle(&mut cluster).await;
    h.manager.sync(&mut cluster).await.unwrap();
    let previous = cluster.status.as_ref().unwrap().members.clone();
    assert_eq!(previous.len(), 3);

    h.pd.set_healths(&[true, true, false]);
    h.pd.set_cluster_down(true);
    let live = h.store.statefulset(SET);
    let err = h
        .synchronizer()
        .sync(&mut cluster, live.as_ref())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::PdApi(_)));

    let status = cluster.status.as_ref().unwrap();
    assert!(!status.synced);
    assert_eq!(status.members, previous);
}

#[tokio::test]
async fn test_leader_query_failure_keeps_previous_members() {
    let h = Harness::new(MockPd::with_members(&[true, true, true]));
    let mut cluster = test_cluster(3);
    h.settle(&mut cluster).await;
    h.manager.sync(&mut cluster).await.unwrap();
    let previous = cluster.status.as_ref().unwrap().members.clone();

    h.pd.set_healths(&[true, false, true]);
    h.pd.set_cluster_id(42);
    h.pd.set_leader_down(true);
    let live = h.store.statefulset(SET);
    let err = h
        .synchronizer()
        .sync(&mut cluster, live.as_ref())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::PdApi(_)));

    let status = cluster.status.as_ref().unwrap();
    assert!(!status.synced);
    assert_eq!(status.cluster_id, "42");
    assert_eq!(status.members, previous);
    assert_eq!(status.leader.name, "basic-pd-0");
}

fn pending_failure(pod: &str) -> BTreeMap<String, FailureMember> {
    BTreeMap::from([(
        pod.to_string(),
        FailureMember {
            pod_name: pod.to_string(),
            member_id: "1001".to_string(),
            pvc_uid_set: uid_set(&["uid-1"]),
            member_deleted: false,
            created_at: "2024-01-01T00:00:00Z".to_string(),
        },
    )])
}

#[tokio::test]
async fn test_recovers_when_every_member_is_back() {
    let h = Harness::new(MockPd::with_members(&[true, true, true]));
    let mut cluster = test_cluster(3);
    h.settle(&mut cluster).await;
    cluster.status_mut().failure_members = Some(pending_failure("basic-pd-1"));

    let outcome = h.manager.sync(&mut cluster).await.unwrap();
    assert_eq!(outcome, SyncOutcome::Synced);
    assert!(cluster.status.as_ref().unwrap().failure_members.is_none());
    assert!(h.pd.deleted().is_empty());
}

#[tokio::test]
async fn test_no_recovery_while_a_pod_is_not_ready() {
    let h = Harness::new(MockPd::with_members(&[true, true, true]));
    let mut cluster = test_cluster(3);
    h.settle(&mut cluster).await;
    h.store.add_pod(pd_pod(2, "rev-1", false));
    cluster.status_mut().failure_members = Some(pending_failure("basic-pd-1"));

    h.manager.sync(&mut cluster).await.unwrap();
    let failures = cluster
        .status
        .as_ref()
        .unwrap()
        .failure_members
        .as_ref()
        .expect("failure members kept");
    assert!(failures.contains_key("basic-pd-1"));
}

#[tokio::test]
async fn test_unjoined_pods_follow_live_selector() {
    let h = Harness::new(MockPd::with_members(&[true, true, true]));
    let mut cluster = test_cluster(3);
    h.settle(&mut cluster).await;

    // A set created with older labels selects pods the current labels miss
    let legacy = BTreeMap::from([("app".to_string(), "legacy-pd".to_string())]);
    {
        let mut sets = h.store.statefulsets.lock().unwrap();
        let set = sets.get_mut(SET).unwrap();
        set.spec.as_mut().unwrap().selector.match_labels = Some(legacy.clone());
    }
    h.store.add_pod(pod_with_labels(3, legacy, true));

    let live = h.store.statefulset(SET);
    h.synchronizer()
        .sync(&mut cluster, live.as_ref())
        .await
        .unwrap();

    let status = cluster.status.as_ref().unwrap();
    assert_eq!(status.unjoined_members.len(), 1);
    assert!(status.unjoined_members.contains_key("basic-pd-3"));
}
