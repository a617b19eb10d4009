//! Service generation for PD clusters.
//!
//! Creates two services:
//! - **Client Service** (`<cluster>-pd`): PD API access for clients
//! - **Peer Service** (`<cluster>-pd-peer`): headless, stable DNS per member

use k8s_openapi::api::core::v1::{Service, ServicePort, ServiceSpec};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::ResourceExt;

use crate::crd::{DEFAULT_CLIENT_PORT, DEFAULT_PEER_PORT, PdCluster};
use crate::resources::common::{
    USED_BY_LABEL, member_name, object_meta, peer_member_name, selector_labels,
};

/// Generate the client-facing Service.
///
/// Fields from `spec.service` override the generated defaults.
pub fn generate_client_service(cluster: &PdCluster) -> Service {
    let name = member_name(&cluster.name_any());
    let mut labels = selector_labels(cluster);
    labels.insert(USED_BY_LABEL.to_string(), "end-user".to_string());

    let mut svc = Service {
        metadata: object_meta(cluster, name, labels),
        spec: Some(ServiceSpec {
            type_: Some("ClusterIP".to_string()),
            selector: Some(selector_labels(cluster)),
            ports: Some(vec![ServicePort {
                name: Some("client".to_string()),
                port: DEFAULT_CLIENT_PORT,
                target_port: Some(IntOrString::Int(DEFAULT_CLIENT_PORT)),
                protocol: Some("TCP".to_string()),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    };

    if let Some(overrides) = &cluster.spec.service {
        if !overrides.annotations.is_empty() {
            svc.metadata.annotations = Some(overrides.annotations.clone());
        }
        if let Some(labels) = svc.metadata.labels.as_mut() {
            labels.extend(overrides.labels.clone());
        }
        if let Some(spec) = svc.spec.as_mut() {
            if let Some(type_) = overrides.type_.as_ref().filter(|t| !t.is_empty()) {
                spec.type_ = Some(type_.clone());
            }
            if let Some(ip) = &overrides.load_balancer_ip {
                spec.load_balancer_ip = Some(ip.clone());
            }
            if let Some(ip) = &overrides.cluster_ip {
                spec.cluster_ip = Some(ip.clone());
            }
            if let Some(port_name) = &overrides.port_name
                && let Some(port) = spec.ports.as_mut().and_then(|p| p.first_mut())
            {
                port.name = Some(port_name.clone());
            }
        }
    }

    svc
}

/// Generate the headless peer Service.
///
/// `publishNotReadyAddresses` lets members resolve each other before they
/// report ready, which PD needs to bootstrap.
pub fn generate_peer_service(cluster: &PdCluster) -> Service {
    let name = peer_member_name(&cluster.name_any());
    let mut labels = selector_labels(cluster);
    labels.insert(USED_BY_LABEL.to_string(), "peer".to_string());

    Service {
        metadata: object_meta(cluster, name, labels),
        spec: Some(ServiceSpec {
            cluster_ip: Some("None".to_string()),
            publish_not_ready_addresses: Some(true),
            selector: Some(selector_labels(cluster)),
            ports: Some(vec![
                ServicePort {
                    name: Some(format!("tcp-peer-{DEFAULT_PEER_PORT}")),
                    port: DEFAULT_PEER_PORT,
                    target_port: Some(IntOrString::Int(DEFAULT_PEER_PORT)),
                    protocol: Some("TCP".to_string()),
                    ..Default::default()
                },
                ServicePort {
                    name: Some(format!("tcp-peer-{DEFAULT_CLIENT_PORT}")),
                    port: DEFAULT_CLIENT_PORT,
                    target_port: Some(IntOrString::Int(DEFAULT_CLIENT_PORT)),
                    protocol: Some("TCP".to_string()),
                    ..Default::default()
                },
            ]),
            ..Default::default()
        }),
        ..Default::default()
    }
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
    use crate::crd::{PdClusterSpec, ServiceSpecOverride};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

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
    fn test_generate_peer_service() {
        let resource = test_resource("basic");
        let svc = generate_peer_service(&resource);

        assert_eq!(svc.metadata.name, Some("basic-pd-peer".to_string()));
        assert_eq!(svc.metadata.namespace, Some("default".to_string()));

        let spec = svc.spec.unwrap();
        assert_eq!(spec.cluster_ip, Some("None".to_string()));
        assert_eq!(spec.publish_not_ready_addresses, Some(true));

        let ports = spec.ports.unwrap();
        assert_eq!(ports.len(), 2);
        assert!(ports.iter().any(|p| p.port == DEFAULT_PEER_PORT));
        assert!(ports.iter().any(|p| p.port == DEFAULT_CLIENT_PORT));
    }

    #[test]
    fn test_generate_client_service() {
        let resource = test_resource("basic");
        let svc = generate_client_service(&resource);

        assert_eq!(svc.metadata.name, Some("basic-pd".to_string()));

        let spec = svc.spec.unwrap();
        assert_eq!(spec.type_, Some("ClusterIP".to_string()));

        let ports = spec.ports.unwrap();
        assert_eq!(ports.len(), 1);
        assert_eq!(ports.first().unwrap().name, Some("client".to_string()));
        assert_eq!(ports.first().unwrap().port, DEFAULT_CLIENT_PORT);
    }

    #[test]
    fn test_client_service_overrides() {
        let mut resource = test_resource("basic");
        resource.spec.service = Some(ServiceSpecOverride {
            type_: Some("NodePort".to_string()),
            port_name: Some("pd-client".to_string()),
            cluster_ip: Some("10.0.0.10".to_string()),
            labels: [("tier".to_string(), "meta".to_string())].into(),
            ..Default::default()
        });
        let svc = generate_client_service(&resource);

        let labels = svc.metadata.labels.unwrap();
        assert_eq!(labels.get("tier"), Some(&"meta".to_string()));
        assert_eq!(labels.get(USED_BY_LABEL), Some(&"end-user".to_string()));

        let spec = svc.spec.unwrap();
        assert_eq!(spec.type_, Some("NodePort".to_string()));
        assert_eq!(spec.cluster_ip, Some("10.0.0.10".to_string()));
        assert_eq!(
            spec.ports.unwrap()[0].name,
            Some("pd-client".to_string())
        );
    }

    #[test]
    fn test_service_labels() {
        let resource = test_resource("basic");
        let svc = generate_peer_service(&resource);

        let labels = svc.metadata.labels.unwrap();
        assert_eq!(labels.get(USED_BY_LABEL), Some(&"peer".to_string()));
    }
}
