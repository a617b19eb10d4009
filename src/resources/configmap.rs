//! ConfigMap generation for PD clusters.
//!
//! The ConfigMap `<cluster>-pd` holds `config-file` (pd.toml rendered from
//! `spec.config`) and `startup-script`, both mounted into every PD pod.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::ConfigMap;
use kube::ResourceExt;

use crate::controller::error::{Error, Result};
use crate::crd::{DEFAULT_CLIENT_PORT, DEFAULT_PEER_PORT, PdCluster};
use crate::resources::common::{member_name, object_meta, peer_member_name, standard_labels};
use crate::resources::version::cluster_version_at_least_4;

/// Key of the PD configuration file.
pub const CONFIG_FILE_KEY: &str = "config-file";
/// Key of the startup script.
pub const STARTUP_SCRIPT_KEY: &str = "startup-script";

/// Generate the PD ConfigMap.
pub fn generate_configmap(cluster: &PdCluster) -> Result<ConfigMap> {
    let name = member_name(&cluster.name_any());
    let config = render_config(cluster)?;
    let script = render_startup_script(cluster);

    Ok(ConfigMap {
        metadata: object_meta(cluster, name, standard_labels(cluster)),
        data: Some(BTreeMap::from([
            (CONFIG_FILE_KEY.to_string(), config),
            (STARTUP_SCRIPT_KEY.to_string(), script),
        ])),
        ..Default::default()
    })
}

/// Render `spec.config` as TOML, applying operator-owned settings.
pub fn render_config(cluster: &PdCluster) -> Result<String> {
    let mut table = match &cluster.spec.config {
        Some(value) => match serde_json::from_value::<toml::Value>(value.clone())? {
            toml::Value::Table(table) => table,
            other => {
                return Err(Error::Validation(format!(
                    "spec.config must be a table, got {}",
                    other.type_str()
                )));
            }
        },
        None => toml::Table::new(),
    };

    // PD below v4 has no dashboard
    if let Some(proxy) = cluster.spec.enable_dashboard_internal_proxy
        && cluster_version_at_least_4(&cluster.spec.version, &cluster.spec.mode)?
    {
        let dashboard = table
            .entry("dashboard")
            .or_insert_with(|| toml::Value::Table(toml::Table::new()));
        if let toml::Value::Table(dashboard) = dashboard {
            dashboard.insert("internal-proxy".to_string(), toml::Value::Boolean(proxy));
        }
    }

    toml::to_string(&table).map_err(|e| Error::Validation(format!("cannot render pd.toml: {e}")))
}

/// Render the PD startup script.
///
/// The first member bootstraps the cluster; the others join through the
/// client service once it resolves.
pub fn render_startup_script(cluster: &PdCluster) -> String {
    let name = cluster.name_any();
    let service = member_name(&name);
    let peer_service = peer_member_name(&name);
    let domain = if cluster.spec.cluster_domain.is_empty() {
        String::new()
    } else {
        format!(".{}", cluster.spec.cluster_domain)
    };
    let mode_args = if cluster.spec.mode.is_empty() {
        String::new()
    } else {
        format!(" --mode={}", cluster.spec.mode)
    };

    format!(
        r#"#!/bin/sh
set -u

POD_NAME=${{POD_NAME:-$HOSTNAME}}
DOMAIN="${{POD_NAME}}.{peer_service}.${{NAMESPACE}}.svc{domain}"
DATA_DIR=/var/lib/pd

ARGS="--data-dir=${{DATA_DIR}} \
--name={member_name_expr} \
--peer-urls=http://0.0.0.0:{peer_port} \
--advertise-peer-urls=http://${{DOMAIN}}:{peer_port} \
--client-urls=http://0.0.0.0:{client_port} \
--advertise-client-urls=http://${{DOMAIN}}:{client_port} \
--config=/etc/pd/pd.toml{mode_args}"

if [ -d "${{DATA_DIR}}/member" ]; then
    echo "resuming with existing data"
elif [ "${{POD_NAME##*-}}" != "0" ]; then
    ARGS="${{ARGS}} --join=http://{service}.${{NAMESPACE}}:{client_port}"
else
    ARGS="${{ARGS}} --initial-cluster={member_name_expr}=http://${{DOMAIN}}:{peer_port}"
fi

echo "starting pd-server ${{ARGS}}"
exec /pd-server ${{ARGS}}
"#,
        member_name_expr = member_name_expr(cluster),
        peer_port = DEFAULT_PEER_PORT,
        client_port = DEFAULT_CLIENT_PORT,
    )
}

/// Shell expression for the name a member registers under.
fn member_name_expr(cluster: &PdCluster) -> &'static str {
    if !cluster.spec.cluster_domain.is_empty() || cluster.spec.across_k8s {
        "${DOMAIN}"
    } else {
        "${POD_NAME}"
    }
}
