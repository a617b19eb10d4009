//! Strategy collaborators of the member manager.
//!
//! Each capability is a trait with one documented operation, injected into
//! `PdMemberManager` at construction. The crate ships a simple default for
//! each; tests replace them with recording fakes.

mod failover;
mod scaler;
mod suspender;
mod upgrader;
mod volumes;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::StatefulSet;

use crate::controller::error::Result;
use crate::crd::{MemberType, PdCluster};

pub use failover::MemberFailover;
pub use scaler::StepScaler;
pub use suspender::SpecSuspender;
pub use upgrader::PartitionUpgrader;
pub use volumes::PvcVolumeStatus;

/// Moves the replica count of `desired` toward the cluster's target.
#[async_trait]
pub trait Scaler: Send + Sync {
    async fn scale(
        &self,
        cluster: &mut PdCluster,
        live: &StatefulSet,
        desired: &mut StatefulSet,
    ) -> Result<()>;
}

/// Rolls a changed pod template out in a controlled order, by adjusting the
/// update strategy of `desired`.
#[async_trait]
pub trait Upgrader: Send + Sync {
    async fn upgrade(
        &self,
        cluster: &mut PdCluster,
        live: &StatefulSet,
        desired: &mut StatefulSet,
    ) -> Result<()>;
}

/// Replaces failed members and recovers once they are healthy again.
#[async_trait]
pub trait Failover: Send + Sync {
    /// Forget recorded failures.
    fn recover(&self, cluster: &mut PdCluster);
    /// Record or act on failed members.
    async fn failover(&self, cluster: &mut PdCluster) -> Result<()>;
}

/// Decides whether a component is suspended.
#[async_trait]
pub trait Suspender: Send + Sync {
    /// Returns true when reconciliation of `component` must stop.
    async fn suspend_component(&self, cluster: &PdCluster, component: MemberType) -> Result<bool>;
}

/// Refreshes `status.volumes`.
#[async_trait]
pub trait VolumeStatusSyncer: Send + Sync {
    async fn sync_volume_status(&self, cluster: &mut PdCluster) -> Result<()>;
}
