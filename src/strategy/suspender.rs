use async_trait::async_trait;
use kube::ResourceExt;
use tracing::debug;

use crate::controller::error::Result;
use crate::crd::{MemberType, PdCluster};
use crate::strategy::Suspender;

/// Suspends PD when `spec.suspendAction.suspendStatefulSet` is set.
#[derive(Clone, Copy, Debug, Default)]
pub struct SpecSuspender;

#[async_trait]
impl Suspender for SpecSuspender {
    async fn suspend_component(&self, cluster: &PdCluster, component: MemberType) -> Result<bool> {
        let suspended = match component {
            MemberType::Pd => cluster
                .spec
                .suspend_action
                .as_ref()
                .is_some_and(|a| a.suspend_stateful_set),
        };
        if suspended {
            debug!(name = %cluster.name_any(), component = %component, "Component suspended");
        }
        Ok(suspended)
    }
}
