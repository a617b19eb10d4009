//! StatefulSet generation for PD clusters.
//!
//! Creates the StatefulSet running PD members:
//! - Stable network identity via the peer service
//! - One data volume claim per member
//! - Config and startup script mounted from the PD ConfigMap
//! - Rolling-update partition the upgrader lowers one ordinal at a time

use std::collections::BTreeMap;
use std::sync::LazyLock;

use k8s_openapi::api::apps::v1::{
    RollingUpdateStatefulSetStrategy, StatefulSet, StatefulSetSpec, StatefulSetUpdateStrategy,
};
use k8s_openapi::api::core::v1::{
    ConfigMapVolumeSource, Container, ContainerPort, DownwardAPIVolumeFile,
    DownwardAPIVolumeSource, EnvVar, EnvVarSource, KeyToPath, ObjectFieldSelector,
    PersistentVolumeClaim, PersistentVolumeClaimSpec, PodSpec, PodTemplateSpec, Probe,
    ResourceRequirements, TCPSocketAction, Volume, VolumeMount, VolumeResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::ResourceExt;
use regex::Regex;

use crate::controller::error::{Error, Result};
use crate::crd::{
    DEFAULT_CLIENT_PORT, DEFAULT_PEER_PORT, PD_CONTAINER_NAME, PdCluster,
    UPDATE_STRATEGY_ON_DELETE, UPDATE_STRATEGY_ROLLING,
};
use crate::resources::configmap::{CONFIG_FILE_KEY, STARTUP_SCRIPT_KEY};
use crate::resources::common::{
    member_name, object_meta, peer_member_name, selector_labels, standard_labels,
};

/// Name of the PD data volume and its claim template.
pub const DATA_VOLUME_NAME: &str = "pd";
/// Mount path of the PD data volume.
pub const DATA_MOUNT_PATH: &str = "/var/lib/pd";

static STORAGE_REGEX: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"^[0-9]+(Ki|Mi|Gi|Ti|Pi|Ei)?$").ok());

/// Parse a storage request like `10Gi`.
pub fn parse_storage_request(size: &str) -> Result<Quantity> {
    let valid = STORAGE_REGEX
        .as_ref()
        .is_some_and(|re| re.is_match(size));
    if !valid {
        return Err(Error::Validation(format!(
            "cannot parse storage request {size:?}, expected a number with an optional binary suffix (Ki, Mi, Gi, Ti, Pi, Ei)"
        )));
    }
    Ok(Quantity(size.to_string()))
}

/// Generate the PD StatefulSet.
///
/// Replicas include replacements for failed members. While a volume replace
/// is in progress pods are only replaced on delete.
pub fn generate_statefulset(cluster: &PdCluster) -> Result<StatefulSet> {
    let name = cluster.name_any();
    let set_name = member_name(&name);
    let labels = standard_labels(cluster);
    let replicas = cluster.desired_replicas();
    let storage = parse_storage_request(&cluster.spec.storage.size)?;

    let vol_replace = cluster
        .status
        .as_ref()
        .is_some_and(|s| s.vol_replace_in_progress);
    let update_strategy =
        if vol_replace || cluster.spec.update_strategy == UPDATE_STRATEGY_ON_DELETE {
            StatefulSetUpdateStrategy {
                type_: Some(UPDATE_STRATEGY_ON_DELETE.to_string()),
                rolling_update: None,
            }
        } else {
            StatefulSetUpdateStrategy {
                type_: Some(UPDATE_STRATEGY_ROLLING.to_string()),
                rolling_update: Some(RollingUpdateStatefulSetStrategy {
                    partition: Some(replicas),
                    ..Default::default()
                }),
            }
        };

    Ok(StatefulSet {
        metadata: object_meta(cluster, set_name.clone(), labels.clone()),
        spec: Some(StatefulSetSpec {
            replicas: Some(replicas),
            service_name: Some(peer_member_name(&name)),
            selector: LabelSelector {
                match_labels: Some(selector_labels(cluster)),
                ..Default::default()
            },
            pod_management_policy: Some("Parallel".to_string()),
            update_strategy: Some(update_strategy),
            template: generate_pod_template(cluster, &set_name, labels),
            volume_claim_templates: Some(vec![generate_pvc_template(cluster, storage)]),
            ..Default::default()
        }),
        ..Default::default()
    })
}

fn generate_pod_template(
    cluster: &PdCluster,
    set_name: &str,
    labels: BTreeMap<String, String>,
) -> PodTemplateSpec {
    let mut annotations = cluster.spec.annotations.clone();
    annotations.insert("prometheus.io/scrape".to_string(), "true".to_string());
    annotations.insert(
        "prometheus.io/port".to_string(),
        DEFAULT_CLIENT_PORT.to_string(),
    );
    annotations.insert("prometheus.io/path".to_string(), "/metrics".to_string());

    PodTemplateSpec {
        metadata: Some(ObjectMeta {
            labels: Some(labels),
            annotations: Some(annotations),
            ..Default::default()
        }),
        spec: Some(PodSpec {
            containers: vec![generate_pd_container(cluster, set_name)],
            volumes: Some(generate_volumes(set_name)),
            service_account_name: cluster.spec.service_account.clone(),
            ..Default::default()
        }),
    }
}

fn generate_pd_container(cluster: &PdCluster, set_name: &str) -> Container {
    let name = cluster.name_any();
    Container {
        name: PD_CONTAINER_NAME.to_string(),
        image: Some(format!(
            "{}:{}",
            cluster.spec.base_image, cluster.spec.version
        )),
        image_pull_policy: Some(cluster.spec.image_pull_policy.clone()),
        command: Some(vec![
            "/bin/sh".to_string(),
            "/usr/local/bin/pd_start_script.sh".to_string(),
        ]),
        ports: Some(vec![
            ContainerPort {
                name: Some("server".to_string()),
                container_port: DEFAULT_PEER_PORT,
                protocol: Some("TCP".to_string()),
                ..Default::default()
            },
            ContainerPort {
                name: Some("client".to_string()),
                container_port: DEFAULT_CLIENT_PORT,
                protocol: Some("TCP".to_string()),
                ..Default::default()
            },
        ]),
        env: Some(vec![
            EnvVar {
                name: "NAMESPACE".to_string(),
                value_from: Some(EnvVarSource {
                    field_ref: Some(ObjectFieldSelector {
                        field_path: "metadata.namespace".to_string(),
                        ..Default::default()
                    }),
                    ..Default::default()
                }),
                ..Default::default()
            },
            env_value("PEER_SERVICE_NAME", peer_member_name(&name)),
            env_value("SERVICE_NAME", member_name(&name)),
            env_value("SET_NAME", set_name.to_string()),
            env_value("TZ", cluster.spec.timezone.clone()),
        ]),
        resources: Some(generate_resource_requirements(cluster)),
        volume_mounts: Some(vec![
            VolumeMount {
                name: "annotations".to_string(),
                mount_path: "/etc/podinfo".to_string(),
                read_only: Some(true),
                ..Default::default()
            },
            VolumeMount {
                name: "config".to_string(),
                mount_path: "/etc/pd".to_string(),
                read_only: Some(true),
                ..Default::default()
            },
            VolumeMount {
                name: "startup-script".to_string(),
                mount_path: "/usr/local/bin".to_string(),
                read_only: Some(true),
                ..Default::default()
            },
            VolumeMount {
                name: DATA_VOLUME_NAME.to_string(),
                mount_path: DATA_MOUNT_PATH.to_string(),
                ..Default::default()
            },
        ]),
        readiness_probe: Some(Probe {
            tcp_socket: Some(TCPSocketAction {
                port: IntOrString::Int(DEFAULT_CLIENT_PORT),
                ..Default::default()
            }),
            initial_delay_seconds: Some(10),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn env_value(name: &str, value: String) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value),
        ..Default::default()
    }
}

fn generate_volumes(config_map: &str) -> Vec<Volume> {
    let from_config_map = |name: &str, key: &str, path: &str| Volume {
        name: name.to_string(),
        config_map: Some(ConfigMapVolumeSource {
            name: config_map.to_string(),
            items: Some(vec![KeyToPath {
                key: key.to_string(),
                path: path.to_string(),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    };

    vec![
        Volume {
            name: "annotations".to_string(),
            downward_api: Some(DownwardAPIVolumeSource {
                items: Some(vec![DownwardAPIVolumeFile {
                    path: "annotations".to_string(),
                    field_ref: Some(ObjectFieldSelector {
                        field_path: "metadata.annotations".to_string(),
                        ..Default::default()
                    }),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        },
        from_config_map("config", CONFIG_FILE_KEY, "pd.toml"),
        from_config_map("startup-script", STARTUP_SCRIPT_KEY, "pd_start_script.sh"),
    ]
}

/// Generate resource requirements from the spec.
fn generate_resource_requirements(cluster: &PdCluster) -> ResourceRequirements {
    let resources = &cluster.spec.resources;
    ResourceRequirements {
        limits: Some(BTreeMap::from([
            ("cpu".to_string(), Quantity(resources.limits.cpu.clone())),
            (
                "memory".to_string(),
                Quantity(resources.limits.memory.clone()),
            ),
        ])),
        requests: Some(BTreeMap::from([
            ("cpu".to_string(), Quantity(resources.requests.cpu.clone())),
            (
                "memory".to_string(),
                Quantity(resources.requests.memory.clone()),
            ),
        ])),
        ..Default::default()
    }
}

fn generate_pvc_template(cluster: &PdCluster, storage: Quantity) -> PersistentVolumeClaim {
    PersistentVolumeClaim {
        metadata: ObjectMeta {
            name: Some(DATA_VOLUME_NAME.to_string()),
            labels: Some(selector_labels(cluster)),
            ..Default::default()
        },
        spec: Some(PersistentVolumeClaimSpec {
            access_modes: Some(vec!["ReadWriteOnce".to_string()]),
            storage_class_name: cluster.spec.storage.storage_class_name.clone(),
            resources: Some(VolumeResourceRequirements {
                requests: Some(BTreeMap::from([("storage".to_string(), storage)])),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// The image of the named PD container in a StatefulSet, if present.
pub fn pd_container_image(set: &StatefulSet) -> Option<String> {
    set.spec
        .as_ref()?
        .template
        .spec
        .as_ref()?
        .containers
        .iter()
        .find(|c| c.name == PD_CONTAINER_NAME)
        .and_then(|c| c.image.clone())
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::get_unwrap
)]
mod tests {
    use super::*;
    use crate::crd::{FailureMember, PdClusterSpec, PdClusterStatus};

    fn test_resource(name: &str) -> PdCluster {
        PdCluster {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("default".to_string()),
                uid: Some("test-uid".to_string()),
                ..Default::default()
            },
            spec: PdClusterSpec::default(),
            status: None,
        }
    }

    #[test]
    fn test_generate_statefulset() {
        let resource = test_resource("basic");
        let sts = generate_statefulset(&resource).unwrap();

        assert_eq!(sts.metadata.name, Some("basic-pd".to_string()));
        assert_eq!(sts.metadata.namespace, Some("default".to_string()));

        let spec = sts.spec.as_ref().unwrap();
        assert_eq!(spec.replicas, Some(3));
        assert_eq!(spec.service_name, Some("basic-pd-peer".to_string()));

        let strategy = spec.update_strategy.as_ref().unwrap();
        assert_eq!(strategy.type_, Some("RollingUpdate".to_string()));
        assert_eq!(
            strategy.rolling_update.as_ref().unwrap().partition,
            Some(3)
        );

        assert_eq!(pd_container_image(&sts), Some("pingcap/pd:v7.5.0".to_string()));
    }

    #[test]
    fn test_replicas_include_deleted_failures() {
        let mut resource = test_resource("basic");
        resource.status = Some(PdClusterStatus {
            failure_members: Some(
                [(
                    "basic-pd-1".to_string(),
                    FailureMember {
                        member_deleted: true,
                        ..Default::default()
                    },
                )]
                .into(),
            ),
            ..Default::default()
        });
        let sts = generate_statefulset(&resource).unwrap();
        assert_eq!(sts.spec.unwrap().replicas, Some(4));
    }

    #[test]
    fn test_on_delete_during_volume_replace() {
        let mut resource = test_resource("basic");
        resource.status = Some(PdClusterStatus {
            vol_replace_in_progress: true,
            ..Default::default()
        });
        let sts = generate_statefulset(&resource).unwrap();
        let strategy = sts.spec.unwrap().update_strategy.unwrap();
        assert_eq!(strategy.type_, Some("OnDelete".to_string()));
        assert!(strategy.rolling_update.is_none());
    }

    #[test]
    fn test_storage_request_parsing() {
        assert!(parse_storage_request("10Gi").is_ok());
        assert!(parse_storage_request("1024").is_ok());
        assert!(parse_storage_request("10GB").is_err());
        assert!(parse_storage_request("").is_err());

        let mut resource = test_resource("basic");
        resource.spec.storage.size = "lots".to_string();
        assert!(matches!(
            generate_statefulset(&resource),
            Err(Error::Validation(_))
        ));
    }

    #[test]
    fn test_pvc_template() {
        let mut resource = test_resource("basic");
        resource.spec.storage.storage_class_name = Some("fast".to_string());
        let sts = generate_statefulset(&resource).unwrap();
        let pvcs = sts.spec.unwrap().volume_claim_templates.unwrap();
        assert_eq!(pvcs.len(), 1);
        let spec = pvcs[0].spec.as_ref().unwrap();
        assert_eq!(spec.storage_class_name, Some("fast".to_string()));
        assert_eq!(
            spec.resources.as_ref().unwrap().requests.as_ref().unwrap()["storage"],
            Quantity("10Gi".to_string())
        );
    }
}
