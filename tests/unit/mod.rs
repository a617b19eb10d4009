// Test code is allowed to panic on failure
#![allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]

//! Unit tests for pd-operator.
//!
//! These tests run without a Kubernetes cluster and test individual
//! components in isolation.

mod crd_tests {
    use pd_operator::crd::{Condition, MemberPhase, PdCluster, PdClusterSpec};

    #[test]
    fn test_phase_display() {
        assert_eq!(MemberPhase::Normal.to_string(), "Normal");
        assert_eq!(MemberPhase::Scale.to_string(), "Scale");
        assert_eq!(MemberPhase::Upgrade.to_string(), "Upgrade");
    }

    #[test]
    fn test_condition_ready() {
        let condition = Condition::ready(true, "MembersHealthy", "3/3 PD members healthy", Some(1));
        assert_eq!(condition.r#type, "Ready");
        assert_eq!(condition.status, "True");
        assert_eq!(condition.reason, "MembersHealthy");
        assert_eq!(condition.observed_generation, Some(1));
    }

    #[test]
    fn test_condition_progressing() {
        let condition = Condition::progressing(true, "Upgrade", "PD phase is Upgrade", Some(2));
        assert_eq!(condition.r#type, "Progressing");
        assert_eq!(condition.status, "True");
    }

    #[test]
    fn test_spec_defaults_from_empty_object() {
        let spec: PdClusterSpec = serde_json::from_str("{}").unwrap();
        assert_eq!(spec.replicas, 3);
        assert_eq!(spec.version, "v7.5.0");
        assert_eq!(spec.update_strategy, "RollingUpdate");
        assert!(spec.config.is_none());
        assert!(spec.cluster_domain.is_empty());
    }

    #[test]
    fn test_desired_replicas_without_status() {
        let cluster = PdCluster::new("basic", PdClusterSpec::default());
        assert_eq!(cluster.desired_replicas(), 3);
        assert!(!cluster.all_members_ready());
    }
}

mod naming_tests {
    use pd_operator::resources::common::{
        member_name, ordinal_from_pod_name, pd_member_name, peer_member_name, pod_name,
    };

    #[test]
    fn test_object_names() {
        assert_eq!(member_name("basic"), "basic-pd");
        assert_eq!(peer_member_name("basic"), "basic-pd-peer");
        assert_eq!(pod_name("basic", 2), "basic-pd-2");
    }

    #[test]
    fn test_ordinal_parsing() {
        assert_eq!(ordinal_from_pod_name("basic-pd-12"), Some(12));
        assert_eq!(ordinal_from_pod_name("my-db-pd-0"), Some(0));
        assert_eq!(ordinal_from_pod_name("basic"), None);
    }

    #[test]
    fn test_member_name_forms() {
        assert_eq!(pd_member_name("basic", 0, "db", "", false), "basic-pd-0");
        assert_eq!(
            pd_member_name("basic", 0, "db", "", true),
            "basic-pd-0.basic-pd-peer.db.svc"
        );
        assert_eq!(
            pd_member_name("basic", 0, "db", "cluster.local", false),
            "basic-pd-0.basic-pd-peer.db.svc.cluster.local"
        );
    }
}

mod error_tests {
    use pd_operator::controller::error::Error;

    #[test]
    fn test_error_is_retryable() {
        let kube_err = Error::Kube(kube::Error::Api(kube::error::ErrorResponse {
            status: "Failure".to_string(),
            message: "timeout".to_string(),
            reason: "Timeout".to_string(),
            code: 504,
        }));
        assert!(kube_err.is_retryable());

        let validation_err = Error::Validation("invalid spec".to_string());
        assert!(!validation_err.is_retryable());

        let strategy_err = Error::strategy("scaler", "PD status sync failed");
        assert!(strategy_err.is_retryable());
        assert_eq!(strategy_err.to_string(), "scaler failed: PD status sync failed");
    }
}

mod status_tests {
    use pd_operator::controller::status::{ConditionBuilder, is_condition_true};
    use pd_operator::crd::Condition;

    #[test]
    fn test_condition_builder() {
        let mut builder = ConditionBuilder::from_existing(&[]);
        builder.ready(true, "MembersHealthy", "3/3 PD members healthy", Some(1));
        builder.progressing(false, "Stable", "Done", Some(1));
        let conditions = builder.build();

        assert_eq!(conditions.len(), 2);
        assert!(is_condition_true(&conditions, "Ready"));
        assert!(!is_condition_true(&conditions, "Progressing"));
    }

    #[test]
    fn test_condition_builder_updates_existing() {
        let mut builder = ConditionBuilder::from_existing(&[]);
        builder.ready(false, "SyncFailed", "PD unreachable", Some(1));
        builder.ready(true, "MembersHealthy", "All ready now", Some(1));
        let conditions = builder.build();

        // Should only have one Ready condition (updated)
        assert_eq!(conditions.len(), 1);
        assert!(is_condition_true(&conditions, "Ready"));
    }

    #[test]
    fn test_is_condition_true_missing() {
        let conditions: Vec<Condition> = vec![];
        assert!(!is_condition_true(&conditions, "Ready"));
    }
}

mod validation_tests {
    use pd_operator::controller::error::Error;
    use pd_operator::controller::validation::validate_spec;
    use pd_operator::crd::{PdCluster, PdClusterSpec};

    fn cluster(spec: PdClusterSpec) -> PdCluster {
        PdCluster::new("basic", spec)
    }

    #[test]
    fn test_default_spec_is_valid() {
        assert!(validate_spec(&cluster(PdClusterSpec::default())).is_ok());
    }

    #[test]
    fn test_rejects_bad_values() {
        let bad = [
            PdClusterSpec {
                replicas: -1,
                ..Default::default()
            },
            PdClusterSpec {
                mode: "cluster".to_string(),
                ..Default::default()
            },
            PdClusterSpec {
                update_strategy: "Recreate".to_string(),
                ..Default::default()
            },
            PdClusterSpec {
                max_failover_count: Some(-2),
                ..Default::default()
            },
        ];
        for spec in bad {
            assert!(matches!(
                validate_spec(&cluster(spec)),
                Err(Error::Validation(_))
            ));
        }
    }

    #[test]
    fn test_rejects_unparseable_version() {
        let spec = PdClusterSpec {
            version: "stable".to_string(),
            ..Default::default()
        };
        assert!(matches!(
            validate_spec(&cluster(spec)),
            Err(Error::Version { .. })
        ));
    }

    #[test]
    fn test_floating_tag_is_accepted() {
        let spec = PdClusterSpec {
            version: "nightly".to_string(),
            ..Default::default()
        };
        assert!(validate_spec(&cluster(spec)).is_ok());
    }
}

mod config_tests {
    use std::time::Duration;

    use pd_operator::OperatorConfig;

    #[test]
    fn test_defaults_when_unset() {
        let config = OperatorConfig::from_lookup(|_| None).unwrap();
        assert_eq!(config, OperatorConfig::default());
        assert!(config.auto_failover);
        assert_eq!(config.failover_period, Duration::from_secs(300));
    }

    #[test]
    fn test_watch_namespace() {
        let config = OperatorConfig::from_lookup(|key| {
            (key == "PD_OPERATOR_WATCH_NAMESPACE").then(|| "db".to_string())
        })
        .unwrap();
        assert_eq!(config.watch_namespace.as_deref(), Some("db"));
    }
}
