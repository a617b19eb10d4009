use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::PersistentVolumeClaim;
use kube::ResourceExt;

use crate::controller::error::Result;
use crate::crd::{PdCluster, StorageVolumeStatus};
use crate::resources::common::selector_labels;
use crate::resources::statefulset::DATA_VOLUME_NAME;
use crate::store::PvcLister;
use crate::strategy::VolumeStatusSyncer;

/// Summarises the PD data claims into `status.volumes`.
pub struct PvcVolumeStatus {
    pvcs: Arc<dyn PvcLister>,
}

impl PvcVolumeStatus {
    pub fn new(pvcs: Arc<dyn PvcLister>) -> Self {
        Self { pvcs }
    }
}

/// Summary of the data claims among `claims`, `None` when there are none.
pub fn summarize_claims(claims: &[PersistentVolumeClaim]) -> Option<StorageVolumeStatus> {
    let prefix = format!("{DATA_VOLUME_NAME}-");
    let data: Vec<&PersistentVolumeClaim> = claims
        .iter()
        .filter(|pvc| pvc.name_any().starts_with(&prefix))
        .collect();
    let first = data.first()?;

    let bound_count = data
        .iter()
        .filter(|pvc| {
            pvc.status
                .as_ref()
                .and_then(|s| s.phase.as_deref())
                == Some("Bound")
        })
        .count();
    let current_capacity = first
        .status
        .as_ref()
        .and_then(|s| s.capacity.as_ref())
        .and_then(|c| c.get("storage"))
        .map(|q| q.0.clone())
        .unwrap_or_default();
    let current_storage_class = first
        .spec
        .as_ref()
        .and_then(|s| s.storage_class_name.clone())
        .unwrap_or_default();

    Some(StorageVolumeStatus {
        name: DATA_VOLUME_NAME.to_string(),
        bound_count: i32::try_from(bound_count).unwrap_or(i32::MAX),
        current_count: i32::try_from(data.len()).unwrap_or(i32::MAX),
        current_capacity,
        current_storage_class,
    })
}

#[async_trait]
impl VolumeStatusSyncer for PvcVolumeStatus {
    async fn sync_volume_status(&self, cluster: &mut PdCluster) -> Result<()> {
        let namespace = cluster.namespace().unwrap_or_default();
        let claims = self
            .pvcs
            .list_pvcs(&namespace, &selector_labels(cluster))
            .await?;

        let mut volumes = BTreeMap::new();
        if let Some(summary) = summarize_claims(&claims) {
            volumes.insert(summary.name.clone(), summary);
        }
        cluster.status_mut().volumes = volumes;
        Ok(())
    }
}
