//! Membership tracking.
//!
//! Decides which live PD members belong to a cluster, by matching their
//! client URL against a per-cluster pattern, and which pods have not joined
//! PD at all.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, RwLock};

use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;
use regex::Regex;

use crate::controller::error::{Error, Result};
use crate::crd::{PdCluster, PdMember, UnjoinedMember};
use crate::resources::common::{ordinal_from_pod_name, pd_member_name};
use crate::store::{PvcLister, resolve_pvcs_from_pod};

/// Client URL pattern of the members of one cluster.
///
/// Matches `<cluster>-pd-<n>.<cluster>-pd-peer.<ns>.svc[.<domain>]:<port>`
/// anywhere in the URL.
pub fn member_pattern(name: &str, namespace: &str, cluster_domain: &str) -> Result<Regex> {
    let name = regex::escape(name);
    let namespace = regex::escape(namespace);
    let domain = if cluster_domain.is_empty() {
        String::new()
    } else {
        format!(r"\.{}", regex::escape(cluster_domain))
    };
    Ok(Regex::new(&format!(
        r"{name}-pd-\d+\.{name}-pd-peer\.{namespace}\.svc{domain}:\d+"
    ))?)
}

type PatternKey = (String, String);

/// Compiled member patterns keyed by cluster identity.
///
/// An entry is rebuilt when the cluster domain of its cluster changes.
#[derive(Default)]
pub struct MemberPatternCache {
    patterns: RwLock<HashMap<PatternKey, (String, Arc<Regex>)>>,
}

impl MemberPatternCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// The pattern for `cluster`, compiling it on first use.
    pub fn pattern_for(&self, cluster: &PdCluster) -> Result<Arc<Regex>> {
        let key = (cluster.namespace().unwrap_or_default(), cluster.name_any());
        let domain = &cluster.spec.cluster_domain;

        {
            let patterns = self.patterns.read().unwrap_or_else(|e| e.into_inner());
            if let Some((cached_domain, re)) = patterns.get(&key)
                && cached_domain == domain
            {
                return Ok(Arc::clone(re));
            }
        }

        let re = Arc::new(member_pattern(&key.1, &key.0, domain)?);
        self.patterns
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key, (domain.clone(), Arc::clone(&re)));
        Ok(re)
    }

    /// Drop the pattern of a deleted cluster.
    pub fn forget(&self, namespace: &str, name: &str) {
        self.patterns
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&(namespace.to_string(), name.to_string()));
    }

    pub fn len(&self) -> usize {
        self.patterns.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Name the pod with this name registers under in PD.
pub fn canonical_member_name(cluster: &PdCluster, pod_name: &str) -> Result<String> {
    let ordinal = ordinal_from_pod_name(pod_name)
        .ok_or_else(|| Error::Validation(format!("unexpected pod name {pod_name:?}")))?;
    Ok(pd_member_name(
        &cluster.name_any(),
        ordinal,
        &cluster.namespace().unwrap_or_default(),
        &cluster.spec.cluster_domain,
        cluster.spec.across_k8s,
    ))
}

/// Pods whose canonical member name is not a key of `members`, compared
/// case-insensitively.
pub fn unjoined_pods<'a>(
    cluster: &PdCluster,
    pods: &'a [Pod],
    members: &BTreeMap<String, PdMember>,
) -> Result<Vec<&'a Pod>> {
    let mut unjoined = Vec::new();
    for pod in pods {
        let canonical = canonical_member_name(cluster, &pod.name_any())?;
        let joined = members.keys().any(|name| name.eq_ignore_ascii_case(&canonical));
        if !joined {
            unjoined.push(pod);
        }
    }
    Ok(unjoined)
}

/// Build the unjoined member map for `pods`, stamping `now` as first seen.
///
/// The result replaces the previous map as a whole.
pub async fn collect_unjoined(
    cluster: &PdCluster,
    pods: &[Pod],
    members: &BTreeMap<String, PdMember>,
    pvcs: &dyn PvcLister,
    now: &str,
) -> Result<BTreeMap<String, UnjoinedMember>> {
    let mut unjoined = BTreeMap::new();
    for pod in unjoined_pods(cluster, pods, members)? {
        let pvc_uid_set: BTreeSet<String> = resolve_pvcs_from_pod(pvcs, pod)
            .await?
            .into_iter()
            .filter_map(|pvc| pvc.metadata.uid)
            .collect();
        let pod_name = pod.name_any();
        unjoined.insert(
            pod_name.clone(),
            UnjoinedMember {
                pod_name,
                pvc_uid_set,
                created_at: now.to_string(),
            },
        );
    }
    Ok(unjoined)
}
