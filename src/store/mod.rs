//! Object stores.
//!
//! Read and write access to the Kubernetes objects a PdCluster owns, split by
//! object kind so each step only depends on what it touches. `KubeStore`
//! implements all of them over `kube::Api`; tests substitute in-memory fakes.
//!
//! Not-found reads return `Ok(None)`.

mod kube_store;
mod sync;

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::{ConfigMap, Endpoints, PersistentVolumeClaim, Pod, Service};

use crate::controller::error::Result;

pub use kube_store::KubeStore;
pub use sync::{
    resolve_pvcs_from_pod, statefulset_equal, sync_configmap, sync_service,
    update_statefulset_with_precheck,
};

/// Workload (StatefulSet) access.
#[async_trait]
pub trait WorkloadStore: Send + Sync {
    async fn get_statefulset(&self, namespace: &str, name: &str) -> Result<Option<StatefulSet>>;
    async fn create_statefulset(&self, namespace: &str, set: &StatefulSet) -> Result<()>;
    /// Replace the StatefulSet. The object's resourceVersion is the precheck;
    /// a stale version fails with `Error::Conflict`.
    async fn update_statefulset(&self, namespace: &str, set: &StatefulSet) -> Result<StatefulSet>;
}

/// Service access.
#[async_trait]
pub trait ServiceStore: Send + Sync {
    async fn get_service(&self, namespace: &str, name: &str) -> Result<Option<Service>>;
    async fn create_service(&self, namespace: &str, svc: &Service) -> Result<()>;
    async fn update_service(&self, namespace: &str, svc: &Service) -> Result<Service>;
}

/// ConfigMap access.
#[async_trait]
pub trait ConfigMapStore: Send + Sync {
    async fn get_configmap(&self, namespace: &str, name: &str) -> Result<Option<ConfigMap>>;
    async fn create_configmap(&self, namespace: &str, cm: &ConfigMap) -> Result<()>;
    async fn update_configmap(&self, namespace: &str, cm: &ConfigMap) -> Result<ConfigMap>;
}

/// Read-only pod access.
#[async_trait]
pub trait PodLister: Send + Sync {
    async fn list_pods(
        &self,
        namespace: &str,
        selector: &BTreeMap<String, String>,
    ) -> Result<Vec<Pod>>;
    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<Pod>>;
}

/// Read-only endpoints access.
#[async_trait]
pub trait EndpointLister: Send + Sync {
    async fn get_endpoints(&self, namespace: &str, name: &str) -> Result<Option<Endpoints>>;
}

/// Read-only volume claim access.
#[async_trait]
pub trait PvcLister: Send + Sync {
    async fn get_pvc(&self, namespace: &str, name: &str) -> Result<Option<PersistentVolumeClaim>>;
    async fn list_pvcs(
        &self,
        namespace: &str,
        selector: &BTreeMap<String, String>,
    ) -> Result<Vec<PersistentVolumeClaim>>;
}

/// Every store the member manager uses.
pub trait ObjectStore:
    WorkloadStore + ServiceStore + ConfigMapStore + PodLister + EndpointLister + PvcLister
{
}

impl<T> ObjectStore for T where
    T: WorkloadStore + ServiceStore + ConfigMapStore + PodLister + EndpointLister + PvcLister
{
}
