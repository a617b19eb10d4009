//! Object stores backed by the Kubernetes API.

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::{ConfigMap, Endpoints, PersistentVolumeClaim, Pod, Service};
use kube::api::{ListParams, PostParams};
use kube::{Api, Client, ResourceExt};

use crate::controller::error::{Error, Result};
use crate::resources::common::selector_string;
use crate::store::{
    ConfigMapStore, EndpointLister, PodLister, PvcLister, ServiceStore, WorkloadStore,
};

/// Stores over a live cluster.
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
}

impl KubeStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api<K>(&self, namespace: &str) -> Api<K>
    where
        K: kube::Resource<Scope = k8s_openapi::NamespaceResourceScope>,
        <K as kube::Resource>::DynamicType: Default,
    {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait]
impl WorkloadStore for KubeStore {
    async fn get_statefulset(&self, namespace: &str, name: &str) -> Result<Option<StatefulSet>> {
        Ok(self.api::<StatefulSet>(namespace).get_opt(name).await?)
    }

    async fn create_statefulset(&self, namespace: &str, set: &StatefulSet) -> Result<()> {
        self.api::<StatefulSet>(namespace)
            .create(&PostParams::default(), set)
            .await?;
        Ok(())
    }

    async fn update_statefulset(&self, namespace: &str, set: &StatefulSet) -> Result<StatefulSet> {
        let name = set.name_any();
        self.api::<StatefulSet>(namespace)
            .replace(&name, &PostParams::default(), set)
            .await
            .map_err(|e| Error::from_update("StatefulSet", &name, e))
    }
}

#[async_trait]
impl ServiceStore for KubeStore {
    async fn get_service(&self, namespace: &str, name: &str) -> Result<Option<Service>> {
        Ok(self.api::<Service>(namespace).get_opt(name).await?)
    }

    async fn create_service(&self, namespace: &str, svc: &Service) -> Result<()> {
        self.api::<Service>(namespace)
            .create(&PostParams::default(), svc)
            .await?;
        Ok(())
    }

    async fn update_service(&self, namespace: &str, svc: &Service) -> Result<Service> {
        let name = svc.name_any();
        self.api::<Service>(namespace)
            .replace(&name, &PostParams::default(), svc)
            .await
            .map_err(|e| Error::from_update("Service", &name, e))
    }
}

#[async_trait]
impl ConfigMapStore for KubeStore {
    async fn get_configmap(&self, namespace: &str, name: &str) -> Result<Option<ConfigMap>> {
        Ok(self.api::<ConfigMap>(namespace).get_opt(name).await?)
    }

    async fn create_configmap(&self, namespace: &str, cm: &ConfigMap) -> Result<()> {
        self.api::<ConfigMap>(namespace)
            .create(&PostParams::default(), cm)
            .await?;
        Ok(())
    }

    async fn update_configmap(&self, namespace: &str, cm: &ConfigMap) -> Result<ConfigMap> {
        let name = cm.name_any();
        self.api::<ConfigMap>(namespace)
            .replace(&name, &PostParams::default(), cm)
            .await
            .map_err(|e| Error::from_update("ConfigMap", &name, e))
    }
}

#[async_trait]
impl PodLister for KubeStore {
    async fn list_pods(
        &self,
        namespace: &str,
        selector: &BTreeMap<String, String>,
    ) -> Result<Vec<Pod>> {
        let params = ListParams::default().labels(&selector_string(selector));
        Ok(self.api::<Pod>(namespace).list(&params).await?.items)
    }

    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<Pod>> {
        Ok(self.api::<Pod>(namespace).get_opt(name).await?)
    }
}

#[async_trait]
impl EndpointLister for KubeStore {
    async fn get_endpoints(&self, namespace: &str, name: &str) -> Result<Option<Endpoints>> {
        Ok(self.api::<Endpoints>(namespace).get_opt(name).await?)
    }
}

#[async_trait]
impl PvcLister for KubeStore {
    async fn get_pvc(&self, namespace: &str, name: &str) -> Result<Option<PersistentVolumeClaim>> {
        Ok(self.api::<PersistentVolumeClaim>(namespace).get_opt(name).await?)
    }

    async fn list_pvcs(
        &self,
        namespace: &str,
        selector: &BTreeMap<String, String>,
    ) -> Result<Vec<PersistentVolumeClaim>> {
        let params = ListParams::default().labels(&selector_string(selector));
        Ok(self
            .api::<PersistentVolumeClaim>(namespace)
            .list(&params)
            .await?
            .items)
    }
}
