//! PdCluster Custom Resource Definition.
//!
//! Defines the PdCluster CRD describing the desired shape of the PD placement
//! tier and the observed status the controller persists for it.

use std::collections::{BTreeMap, BTreeSet};

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// PdCluster is a custom resource for deploying the PD placement tier.
///
/// Example:
/// ```yaml
/// apiVersion: pdoperator.io/v1alpha1
/// kind: PdCluster
/// metadata:
///   name: basic
/// spec:
///   replicas: 3
///   version: v7.5.0
///   storage:
///     size: 10Gi
/// ```
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "pdoperator.io",
    version = "v1alpha1",
    kind = "PdCluster",
    plural = "pdclusters",
    shortname = "pdc",
    status = "PdClusterStatus",
    namespaced,
    printcolumn = r#"{"name":"Phase", "type":"string", "jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Replicas", "type":"integer", "jsonPath":".spec.replicas"}"#,
    printcolumn = r#"{"name":"Synced", "type":"boolean", "jsonPath":".status.synced"}"#,
    printcolumn = r#"{"name":"Leader", "type":"string", "jsonPath":".status.leader.name"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct PdClusterSpec {
    /// Number of PD members (default 3).
    #[serde(default = "default_replicas")]
    pub replicas: i32,

    /// Container image repository (default: pingcap/pd).
    #[serde(default = "default_base_image")]
    pub base_image: String,

    /// PD version, used as the image tag.
    #[serde(default = "default_version")]
    pub version: String,

    /// Deployment mode. Empty for the classic PD, "ms" for micro-service mode.
    #[serde(default)]
    pub mode: String,

    /// Image pull policy (default: IfNotPresent).
    #[serde(default = "default_image_pull_policy")]
    pub image_pull_policy: String,

    /// Data volume configuration.
    #[serde(default)]
    pub storage: StorageSpec,

    /// Resource requests and limits for PD pods.
    #[serde(default)]
    pub resources: ResourceRequirementsSpec,

    /// Overrides for the client-facing service.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service: Option<ServiceSpecOverride>,

    /// PD configuration rendered into pd.toml. Unset renders an empty file.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config: Option<serde_json::Value>,

    /// Pause all workload changes. Status keeps being refreshed.
    #[serde(default)]
    pub paused: bool,

    /// Kubernetes cluster domain suffix (e.g. cluster.local). Empty means unqualified names.
    #[serde(default)]
    pub cluster_domain: String,

    /// Whether PD members are addressed across Kubernetes clusters.
    #[serde(default)]
    pub across_k8s: bool,

    /// Upper bound of members the failover strategy may replace (default 3).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_failover_count: Option<i32>,

    /// StatefulSet update strategy: RollingUpdate (default) or OnDelete.
    #[serde(default = "default_update_strategy")]
    pub update_strategy: String,

    /// Component suspension settings.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suspend_action: Option<SuspendAction>,

    /// Time zone for PD processes (default: UTC).
    #[serde(default = "default_timezone")]
    pub timezone: String,

    /// Service account used by PD pods.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service_account: Option<String>,

    /// Toggle for the dashboard internal proxy (PD v4 and later).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enable_dashboard_internal_proxy: Option<bool>,

    /// Additional labels to apply to all managed resources.
    #[serde(default)]
    pub labels: BTreeMap<String, String>,

    /// Additional annotations to apply to all managed resources.
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
}

impl Default for PdClusterSpec {
    fn default() -> Self {
        Self {
            replicas: default_replicas(),
            base_image: default_base_image(),
            version: default_version(),
            mode: String::new(),
            image_pull_policy: default_image_pull_policy(),
            storage: StorageSpec::default(),
            resources: ResourceRequirementsSpec::default(),
            service: None,
            config: None,
            paused: false,
            cluster_domain: String::new(),
            across_k8s: false,
            max_failover_count: Some(default_max_failover_count()),
            update_strategy: default_update_strategy(),
            suspend_action: None,
            timezone: default_timezone(),
            service_account: None,
            enable_dashboard_internal_proxy: None,
            labels: BTreeMap::new(),
            annotations: BTreeMap::new(),
        }
    }
}

fn default_replicas() -> i32 {
    3
}

fn default_base_image() -> String {
    "pingcap/pd".to_string()
}

fn default_version() -> String {
    "v7.5.0".to_string()
}

fn default_image_pull_policy() -> String {
    "IfNotPresent".to_string()
}

fn default_update_strategy() -> String {
    UPDATE_STRATEGY_ROLLING.to_string()
}

fn default_timezone() -> String {
    "UTC".to_string()
}

/// Default value of `maxFailoverCount`.
pub fn default_max_failover_count() -> i32 {
    3
}

/// RollingUpdate StatefulSet strategy name.
pub const UPDATE_STRATEGY_ROLLING: &str = "RollingUpdate";

/// OnDelete StatefulSet strategy name.
pub const UPDATE_STRATEGY_ON_DELETE: &str = "OnDelete";

/// Micro-service deployment mode.
pub const MODE_MICRO_SERVICE: &str = "ms";

/// Data volume configuration.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct StorageSpec {
    /// Size of the data PersistentVolumeClaim (default: 10Gi).
    #[serde(default = "default_storage_size")]
    pub size: String,

    /// Storage class name. If not set, uses the cluster default.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub storage_class_name: Option<String>,
}

impl Default for StorageSpec {
    fn default() -> Self {
        Self {
            size: default_storage_size(),
            storage_class_name: None,
        }
    }
}

fn default_storage_size() -> String {
    "10Gi".to_string()
}

/// Resource requests and limits for PD pods.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ResourceRequirementsSpec {
    /// CPU and memory requests.
    #[serde(default)]
    pub requests: ResourceSpec,

    /// CPU and memory limits.
    #[serde(default)]
    pub limits: ResourceLimitsSpec,
}

/// Resource requests specification.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ResourceSpec {
    /// CPU request (default: 250m).
    #[serde(default = "default_cpu_request")]
    pub cpu: String,

    /// Memory request (default: 512Mi).
    #[serde(default = "default_memory_request")]
    pub memory: String,
}

impl Default for ResourceSpec {
    fn default() -> Self {
        Self {
            cpu: default_cpu_request(),
            memory: default_memory_request(),
        }
    }
}

fn default_cpu_request() -> String {
    "250m".to_string()
}

fn default_memory_request() -> String {
    "512Mi".to_string()
}

/// Resource limits specification.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ResourceLimitsSpec {
    /// CPU limit (default: 2).
    #[serde(default = "default_cpu_limit")]
    pub cpu: String,

    /// Memory limit (default: 4Gi).
    #[serde(default = "default_memory_limit")]
    pub memory: String,
}

impl Default for ResourceLimitsSpec {
    fn default() -> Self {
        Self {
            cpu: default_cpu_limit(),
            memory: default_memory_limit(),
        }
    }
}

fn default_cpu_limit() -> String {
    "2".to_string()
}

fn default_memory_limit() -> String {
    "4Gi".to_string()
}

/// Overrides applied to the generated client service.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ServiceSpecOverride {
    /// Service type (ClusterIP, NodePort, LoadBalancer).
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub type_: Option<String>,

    /// Annotations for the service.
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,

    /// Extra labels for the service.
    #[serde(default)]
    pub labels: BTreeMap<String, String>,

    /// Requested load balancer IP.
    #[serde(rename = "loadBalancerIP", skip_serializing_if = "Option::is_none")]
    pub load_balancer_ip: Option<String>,

    /// Requested cluster IP.
    #[serde(rename = "clusterIP", skip_serializing_if = "Option::is_none")]
    pub cluster_ip: Option<String>,

    /// Name of the client port.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port_name: Option<String>,
}

/// Component suspension settings.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SuspendAction {
    /// Stop reconciling the PD StatefulSet.
    #[serde(default)]
    pub suspend_stateful_set: bool,
}

/// Status of a PdCluster.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PdClusterStatus {
    /// Cluster identity reported by PD.
    #[serde(rename = "clusterID", default, skip_serializing_if = "String::is_empty")]
    pub cluster_id: String,

    /// Current high-level activity of the PD component.
    #[serde(default)]
    pub phase: MemberPhase,

    /// True only after a complete, error-free status refresh in the last pass.
    #[serde(default)]
    pub synced: bool,

    /// Members of this cluster keyed by member name.
    #[serde(default)]
    pub members: BTreeMap<String, PdMember>,

    /// Live members that do not belong to this cluster.
    #[serde(default)]
    pub peer_members: BTreeMap<String, PdMember>,

    /// Current PD leader.
    #[serde(default)]
    pub leader: PdMember,

    /// Pods that exist but have not joined the PD cluster.
    #[serde(default)]
    pub unjoined_members: BTreeMap<String, UnjoinedMember>,

    /// Members marked as failed by the failover strategy.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_members: Option<BTreeMap<String, FailureMember>>,

    /// Image of the running PD container.
    #[serde(default)]
    pub image: String,

    /// Last observed StatefulSet status.
    #[serde(rename = "statefulSet", default, skip_serializing_if = "Option::is_none")]
    pub workload_snapshot: Option<WorkloadSnapshot>,

    /// Set while PD volumes are being replaced.
    #[serde(default)]
    pub vol_replace_in_progress: bool,

    /// Summary of PD data volumes.
    #[serde(default)]
    pub volumes: BTreeMap<String, StorageVolumeStatus>,

    /// The generation most recently observed by the controller.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    /// Conditions describing the current state.
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

/// High-level activity classification of the PD component.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash, Deserialize, Serialize, JsonSchema)]
pub enum MemberPhase {
    /// No scale or upgrade in progress.
    #[default]
    Normal,
    /// Desired and live replica counts differ.
    Scale,
    /// A rolling upgrade is in progress.
    Upgrade,
}

impl std::fmt::Display for MemberPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MemberPhase::Normal => write!(f, "Normal"),
            MemberPhase::Scale => write!(f, "Scale"),
            MemberPhase::Upgrade => write!(f, "Upgrade"),
        }
    }
}

/// A PD member as reported by the health endpoint.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PdMember {
    pub name: String,
    /// Member ID, rendered as a decimal string.
    pub id: String,
    #[serde(rename = "clientURL")]
    pub client_url: String,
    pub health: bool,
    /// Last time `health` flipped.
    pub last_transition_time: String,
}

/// A pod that is running but has not registered as a PD member.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct UnjoinedMember {
    pub pod_name: String,
    /// UIDs of the volume claims bound to the pod.
    #[serde(rename = "pvcUIDSet", default)]
    pub pvc_uid_set: BTreeSet<String>,
    pub created_at: String,
}

/// A member the failover strategy has marked as failed.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct FailureMember {
    pub pod_name: String,
    #[serde(rename = "memberID")]
    pub member_id: String,
    #[serde(rename = "pvcUIDSet", default)]
    pub pvc_uid_set: BTreeSet<String>,
    /// Whether the failed member has been removed from PD.
    #[serde(default)]
    pub member_deleted: bool,
    pub created_at: String,
}

/// Copy of the fields of a StatefulSet status the controller records.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct WorkloadSnapshot {
    #[serde(default)]
    pub replicas: i32,
    #[serde(default)]
    pub ready_replicas: i32,
    #[serde(default)]
    pub current_replicas: i32,
    #[serde(default)]
    pub updated_replicas: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_revision: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub update_revision: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub collision_count: Option<i32>,
}

impl From<&k8s_openapi::api::apps::v1::StatefulSetStatus> for WorkloadSnapshot {
    fn from(status: &k8s_openapi::api::apps::v1::StatefulSetStatus) -> Self {
        Self {
            replicas: status.replicas,
            ready_replicas: status.ready_replicas.unwrap_or(0),
            current_replicas: status.current_replicas.unwrap_or(0),
            updated_replicas: status.updated_replicas.unwrap_or(0),
            current_revision: status.current_revision.clone(),
            update_revision: status.update_revision.clone(),
            observed_generation: status.observed_generation,
            collision_count: status.collision_count,
        }
    }
}

/// Summary of one named PD volume.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct StorageVolumeStatus {
    pub name: String,
    /// Number of claims currently bound.
    pub bound_count: i32,
    /// Number of claims found for the component.
    pub current_count: i32,
    /// Capacity reported by the claims (empty when unknown).
    #[serde(default)]
    pub current_capacity: String,
    #[serde(default)]
    pub current_storage_class: String,
}

/// Condition describes the state of a cluster at a certain point.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Type of condition.
    pub r#type: String,
    /// Status of the condition ("True", "False", "Unknown").
    pub status: String,
    /// Machine-readable reason for the condition's last transition.
    pub reason: String,
    /// Human-readable message indicating details about last transition.
    pub message: String,
    /// Last time the condition transitioned from one status to another.
    pub last_transition_time: String,
    /// The generation of the resource this condition was observed for.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

impl Condition {
    /// Create a new condition.
    pub fn new(
        condition_type: &str,
        status: bool,
        reason: &str,
        message: &str,
        generation: Option<i64>,
    ) -> Self {
        Self {
            r#type: condition_type.to_string(),
            status: if status {
                "True".to_string()
            } else {
                "False".to_string()
            },
            reason: reason.to_string(),
            message: message.to_string(),
            last_transition_time: jiff::Timestamp::now().to_string(),
            observed_generation: generation,
        }
    }

    /// Create a "Ready" condition.
    pub fn ready(ready: bool, reason: &str, message: &str, generation: Option<i64>) -> Self {
        Self::new("Ready", ready, reason, message, generation)
    }

    /// Create a "Progressing" condition.
    pub fn progressing(
        progressing: bool,
        reason: &str,
        message: &str,
        generation: Option<i64>,
    ) -> Self {
        Self::new("Progressing", progressing, reason, message, generation)
    }
}

/// Default PD client port.
pub const DEFAULT_CLIENT_PORT: i32 = 2379;

/// Default PD peer port.
pub const DEFAULT_PEER_PORT: i32 = 2380;

/// Name of the PD container inside the pod template.
pub const PD_CONTAINER_NAME: &str = "pd";

/// Annotation requesting a forced (non-graceful) upgrade.
pub const ANNOTATION_FORCE_UPGRADE: &str = "pdoperator.io/force-upgrade";

impl PdCluster {
    /// Replica count the StatefulSet should have, including replacements for
    /// failed members that have already been removed from PD.
    pub fn desired_replicas(&self) -> i32 {
        let replaced = self
            .status
            .as_ref()
            .map(PdClusterStatus::deleted_failure_replicas)
            .unwrap_or(0);
        self.spec.replicas + replaced
    }

    /// Whether the force-upgrade annotation is set to "true".
    pub fn force_upgrade_requested(&self) -> bool {
        self.metadata
            .annotations
            .as_ref()
            .and_then(|a| a.get(ANNOTATION_FORCE_UPGRADE))
            .is_some_and(|v| v == "true")
    }

    /// Effective failover ceiling, zero when failover is disabled.
    pub fn max_failover_count(&self) -> i32 {
        self.spec.max_failover_count.unwrap_or(0)
    }

    /// Whether the StatefulSet runs as many replicas as desired.
    pub fn all_pods_started(&self) -> bool {
        let actual = self
            .status
            .as_ref()
            .and_then(|s| s.workload_snapshot.as_ref())
            .map(|w| w.replicas)
            .unwrap_or(0);
        self.desired_replicas() == actual
    }

    /// Whether every desired member is registered and healthy.
    pub fn all_members_ready(&self) -> bool {
        let Some(status) = self.status.as_ref() else {
            return false;
        };
        usize::try_from(self.desired_replicas()).ok() == Some(status.members.len())
            && status.members.values().all(|m| m.health)
    }

    /// Mutable status, created empty on first use.
    pub fn status_mut(&mut self) -> &mut PdClusterStatus {
        self.status.get_or_insert_with(Default::default)
    }
}

/// Components an operator can suspend.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MemberType {
    Pd,
}

impl std::fmt::Display for MemberType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MemberType::Pd => write!(f, "pd"),
        }
    }
}

impl PdClusterStatus {
    /// Number of failure members already removed from PD.
    pub fn deleted_failure_replicas(&self) -> i32 {
        self.failure_members
            .as_ref()
            .map(|m| m.values().filter(|f| f.member_deleted).count() as i32)
            .unwrap_or(0)
    }

    /// Whether the failover strategy is still handling a failed member.
    pub fn auto_failovering(&self) -> bool {
        self.failure_members
            .as_ref()
            .is_some_and(|m| m.values().any(|f| !f.member_deleted))
    }
}

/// Ordinals the StatefulSet should run.
///
/// With `exclude_failover` the ordinals created to replace failed members are
/// left out, leaving only the replicas the user asked for.
pub fn desired_ordinals(cluster: &PdCluster, exclude_failover: bool) -> std::ops::Range<i32> {
    let upper = if exclude_failover {
        cluster.spec.replicas
    } else {
        cluster.desired_replicas()
    };
    0..upper.max(0)
}
