//! The default strategies, exercised one call at a time.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::apps::v1::{StatefulSet, StatefulSetUpdateStrategy};

use pd_operator::controller::error::Error;
use pd_operator::controller::upgrade_policy::{partition, set_upgrade_partition};
use pd_operator::crd::{FailureMember, MemberPhase, PdCluster, PdMember};
use pd_operator::resources::common::set_last_applied;
use pd_operator::resources::statefulset::generate_statefulset;
use pd_operator::strategy::{
    Failover, MemberFailover, PartitionUpgrader, Scaler, StepScaler, Upgrader,
};

use crate::mock_state::*;

const LONG_AGO: &str = "2020-01-01T00:00:00Z";

fn with_replicas(mut set: StatefulSet, replicas: i32) -> StatefulSet {
    set.spec.as_mut().unwrap().replicas = Some(replicas);
    set
}

fn replicas(set: &StatefulSet) -> Option<i32> {
    set.spec.as_ref().unwrap().replicas
}

/// A live StatefulSet generated from `cluster`, as if last applied.
fn applied(cluster: &PdCluster) -> StatefulSet {
    let mut set = generate_statefulset(cluster).unwrap();
    let spec = set.spec.clone();
    set_last_applied(&mut set.metadata, &spec).unwrap();
    set
}

fn members(health: &[bool], since: &str) -> BTreeMap<String, PdMember> {
    health
        .iter()
        .enumerate()
        .map(|(i, h)| {
            let name = format!("basic-pd-{i}");
            (
                name.clone(),
                PdMember {
                    name,
                    id: (1000 + i).to_string(),
                    health: *h,
                    last_transition_time: since.to_string(),
                    ..Default::default()
                },
            )
        })
        .collect()
}

fn synced_cluster(replicas: i32, health: &[bool]) -> PdCluster {
    let mut cluster = test_cluster(replicas);
    let status = cluster.status_mut();
    status.synced = true;
    status.members = members(health, LONG_AGO);
    cluster
}

mod scaler {
    use super::*;

    #[tokio::test]
    async fn test_scale_out_one_step() {
        let pd = MockPd::default();
        let scaler = StepScaler::new(Arc::new(pd.clone()));
        let mut cluster = synced_cluster(5, &[true]);
        let live = with_replicas(generate_statefulset(&cluster).unwrap(), 1);
        let mut desired = generate_statefulset(&cluster).unwrap();

        scaler.scale(&mut cluster, &live, &mut desired).await.unwrap();
        assert_eq!(replicas(&desired), Some(2));
        assert!(pd.deleted().is_empty());
    }

    #[tokio::test]
    async fn test_scale_in_deletes_highest_member() {
        let pd = MockPd::default();
        let scaler = StepScaler::new(Arc::new(pd.clone()));
        let mut cluster = synced_cluster(1, &[true, true, true]);
        let live = with_replicas(generate_statefulset(&cluster).unwrap(), 3);
        let mut desired = generate_statefulset(&cluster).unwrap();

        scaler.scale(&mut cluster, &live, &mut desired).await.unwrap();
        assert_eq!(replicas(&desired), Some(2));
        assert_eq!(pd.deleted(), vec!["basic-pd-2".to_string()]);
    }

    #[tokio::test]
    async fn test_scale_in_uses_qualified_member_name() {
        let pd = MockPd::default();
        let scaler = StepScaler::new(Arc::new(pd.clone()));
        let mut cluster = synced_cluster(2, &[true, true, true]);
        cluster.spec.cluster_domain = "cluster.local".to_string();
        let live = with_replicas(generate_statefulset(&cluster).unwrap(), 3);
        let mut desired = generate_statefulset(&cluster).unwrap();

        scaler.scale(&mut cluster, &live, &mut desired).await.unwrap();
        assert_eq!(
            pd.deleted(),
            vec!["basic-pd-2.basic-pd-peer.db.svc.cluster.local".to_string()]
        );
    }

    #[tokio::test]
    async fn test_scale_in_refused_while_unsynced_or_upgrading() {
        let pd = MockPd::default();
        let scaler = StepScaler::new(Arc::new(pd.clone()));

        let mut cluster = synced_cluster(2, &[true, true, true]);
        cluster.status_mut().synced = false;
        let live = with_replicas(generate_statefulset(&cluster).unwrap(), 3);
        let mut desired = generate_statefulset(&cluster).unwrap();
        let err = scaler.scale(&mut cluster, &live, &mut desired).await.unwrap_err();
        assert!(matches!(err, Error::Strategy { strategy: "scaler", .. }));
        assert_eq!(replicas(&desired), Some(3));

        let mut cluster = synced_cluster(2, &[true, true, true]);
        cluster.status_mut().phase = MemberPhase::Upgrade;
        let mut desired = generate_statefulset(&cluster).unwrap();
        assert!(scaler.scale(&mut cluster, &live, &mut desired).await.is_err());
        assert!(pd.deleted().is_empty());
    }
}

mod upgrader {
    use super::*;
    use k8s_openapi::api::apps::v1::StatefulSetStatus;

    fn rolling(cluster: &PdCluster, current: &str, update: &str) -> StatefulSet {
        let mut live = applied(cluster);
        live.status = Some(StatefulSetStatus {
            replicas: 3,
            current_revision: Some(current.to_string()),
            update_revision: Some(update.to_string()),
            ..Default::default()
        });
        live
    }

    #[tokio::test]
    async fn test_unsynced_cluster_cannot_upgrade() {
        let store = MockStore::new();
        let upgrader = PartitionUpgrader::new(store);
        let mut cluster = synced_cluster(3, &[true, true, true]);
        cluster.status_mut().synced = false;
        let live = rolling(&cluster, "rev-1", "rev-2");
        let mut desired = generate_statefulset(&cluster).unwrap();

        let err = upgrader.upgrade(&mut cluster, &live, &mut desired).await.unwrap_err();
        assert!(err.to_string().contains("can not upgrade"));
    }

    #[tokio::test]
    async fn test_releases_highest_stale_ordinal() {
        let store = MockStore::new();
        store.add_pod(pd_pod(0, "rev-1", true));
        store.add_pod(pd_pod(1, "rev-1", true));
        store.add_pod(pd_pod(2, "rev-2", true));
        let upgrader = PartitionUpgrader::new(store);

        let mut cluster = synced_cluster(3, &[true, true, true]);
        let mut live = rolling(&cluster, "rev-1", "rev-2");
        set_upgrade_partition(&mut live, 2);
        let mut desired = generate_statefulset(&cluster).unwrap();

        upgrader.upgrade(&mut cluster, &live, &mut desired).await.unwrap();
        assert_eq!(partition(&desired), Some(1));
        assert_eq!(cluster.status.as_ref().unwrap().phase, MemberPhase::Upgrade);
    }

    #[tokio::test]
    async fn test_waits_for_upgraded_pod_to_be_healthy() {
        let store = MockStore::new();
        store.add_pod(pd_pod(0, "rev-1", true));
        store.add_pod(pd_pod(1, "rev-1", true));
        store.add_pod(pd_pod(2, "rev-2", false));
        let upgrader = PartitionUpgrader::new(store.clone());

        let mut cluster = synced_cluster(3, &[true, true, true]);
        let mut live = rolling(&cluster, "rev-1", "rev-2");
        set_upgrade_partition(&mut live, 2);
        let mut desired = generate_statefulset(&cluster).unwrap();

        let err = upgrader.upgrade(&mut cluster, &live, &mut desired).await.unwrap_err();
        assert!(err.to_string().contains("is not ready"));

        // Ready but the member is down
        store.add_pod(pd_pod(2, "rev-2", true));
        cluster.status_mut().members = members(&[true, true, false], LONG_AGO);
        let err = upgrader.upgrade(&mut cluster, &live, &mut desired).await.unwrap_err();
        assert!(err.to_string().contains("is not healthy"));
    }

    #[tokio::test]
    async fn test_new_template_is_applied_before_pods_roll() {
        let upgrader = PartitionUpgrader::new(MockStore::new());
        let mut cluster = synced_cluster(3, &[true, true, true]);
        let live = rolling(&cluster, "rev-1", "rev-1");
        cluster.spec.version = "v8.1.0".to_string();
        let mut desired = generate_statefulset(&cluster).unwrap();

        upgrader.upgrade(&mut cluster, &live, &mut desired).await.unwrap();
        assert_eq!(partition(&desired), Some(3));
        assert_eq!(cluster.status.as_ref().unwrap().phase, MemberPhase::Upgrade);
    }

    #[tokio::test]
    async fn test_unpartitioned_set_keeps_live_strategy() {
        let upgrader = PartitionUpgrader::new(MockStore::new());
        let mut cluster = synced_cluster(3, &[true, true, true]);
        let mut live = rolling(&cluster, "rev-1", "rev-2");
        live.spec.as_mut().unwrap().update_strategy = Some(StatefulSetUpdateStrategy {
            type_: Some("OnDelete".to_string()),
            rolling_update: None,
        });
        let mut desired = generate_statefulset(&cluster).unwrap();

        upgrader.upgrade(&mut cluster, &live, &mut desired).await.unwrap();
        assert_eq!(
            desired.spec.as_ref().unwrap().update_strategy,
            live.spec.as_ref().unwrap().update_strategy
        );
    }
}

mod failover {
    use super::*;

    fn failover(store: Arc<MockStore>, pd: &MockPd) -> MemberFailover {
        MemberFailover::new(
            Arc::new(pd.clone()),
            store.clone(),
            store,
            Duration::from_secs(300),
        )
    }

    #[tokio::test]
    async fn test_marks_member_unhealthy_past_period() {
        let store = MockStore::new();
        store.add_pod(pd_pod(1, "rev-1", false));
        store.add_pvc(pd_pvc(1));
        let pd = MockPd::default();
        let mut cluster = synced_cluster(3, &[true, false, true]);

        failover(store, &pd).failover(&mut cluster).await.unwrap();

        let failures = cluster.status.as_ref().unwrap().failure_members.clone().unwrap();
        assert_eq!(failures.len(), 1);
        let failure = &failures["basic-pd-1"];
        assert_eq!(failure.member_id, "1001");
        assert_eq!(failure.pvc_uid_set, uid_set(&["uid-1"]));
        assert!(!failure.member_deleted);
        assert!(pd.deleted().is_empty());
    }

    #[tokio::test]
    async fn test_recent_failure_is_not_marked() {
        let pd = MockPd::default();
        let mut cluster = synced_cluster(3, &[true, false, true]);
        let now = jiff::Timestamp::now().to_string();
        cluster.status_mut().members = members(&[true, false, true], &now);

        failover(MockStore::new(), &pd).failover(&mut cluster).await.unwrap();
        assert!(cluster.status.as_ref().unwrap().failure_members.is_none());
    }

    #[tokio::test]
    async fn test_no_failover_without_quorum() {
        let pd = MockPd::default();
        let mut cluster = synced_cluster(3, &[true, false, false]);

        let err = failover(MockStore::new(), &pd)
            .failover(&mut cluster)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("lost quorum"));
        assert!(cluster.status.as_ref().unwrap().failure_members.is_none());
    }

    #[tokio::test]
    async fn test_pending_failure_is_deleted_from_pd() {
        let pd = MockPd::default();
        let mut cluster = synced_cluster(3, &[true, false, true]);
        cluster.status_mut().failure_members = Some(BTreeMap::from([(
            "basic-pd-1".to_string(),
            FailureMember {
                pod_name: "basic-pd-1".to_string(),
                member_id: "1001".to_string(),
                ..Default::default()
            },
        )]));

        failover(MockStore::new(), &pd).failover(&mut cluster).await.unwrap();

        assert_eq!(pd.deleted(), vec!["basic-pd-1".to_string()]);
        let status = cluster.status.as_ref().unwrap();
        assert!(status.failure_members.as_ref().unwrap()["basic-pd-1"].member_deleted);
        // The replacement ordinal is now part of the desired size
        assert_eq!(cluster.desired_replicas(), 4);
    }

    #[tokio::test]
    async fn test_failure_count_is_bounded() {
        let pd = MockPd::default();
        let mut cluster = synced_cluster(3, &[true, false, true]);
        cluster.spec.max_failover_count = Some(1);
        cluster.status_mut().failure_members = Some(BTreeMap::from([(
            "basic-pd-0".to_string(),
            FailureMember {
                pod_name: "basic-pd-0".to_string(),
                member_deleted: true,
                ..Default::default()
            },
        )]));

        failover(MockStore::new(), &pd).failover(&mut cluster).await.unwrap();
        let failures = cluster.status.as_ref().unwrap().failure_members.clone().unwrap();
        assert_eq!(failures.len(), 1);
        assert!(!failures.contains_key("basic-pd-1"));
    }

    #[tokio::test]
    async fn test_recover_clears_failures() {
        let pd = MockPd::default();
        let mut cluster = synced_cluster(3, &[true, true, true]);
        cluster.status_mut().failure_members = Some(BTreeMap::new());

        failover(MockStore::new(), &pd).recover(&mut cluster);
        assert!(cluster.status.as_ref().unwrap().failure_members.is_none());
    }
}
