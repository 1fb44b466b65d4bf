//! Target cluster resolution and spec validation.
//!
//! The resolved cluster set is the union of the legacy string selectors, the
//! structured label selectors and the explicit cluster list, de-duplicated
//! and sorted. Sorted order is a contract: batch composition downstream
//! depends on it being stable across reconciles.

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use tracing::{debug, warn};

use crate::crd::ClusterGroupUpgrade;
use crate::stores::ClusterRegistry;
use crate::{Error, Result};

/// Parse a legacy selector entry (`key=value` or bare `key`) into a
/// structured selector. Malformed entries yield `None` and are skipped.
pub fn parse_legacy_selector(expr: &str) -> Option<LabelSelector> {
    let parts: Vec<&str> = expr.split('=').collect();
    let (key, value) = match parts.as_slice() {
        [key] => (*key, ""),
        [key, value] => (*key, *value),
        _ => return None,
    };
    if key.is_empty() {
        return None;
    }
    Some(LabelSelector {
        match_labels: Some(BTreeMap::from([(key.to_string(), value.to_string())])),
        match_expressions: None,
    })
}

/// Resolve the target cluster set for a CGU: selector matches plus explicit
/// names, de-duplicated, sorted lexicographically.
pub async fn resolve_target_clusters(
    registry: &dyn ClusterRegistry,
    cgu: &ClusterGroupUpgrade,
) -> Result<Vec<String>> {
    let mut names: Vec<String> = Vec::new();
    let mut seen = std::collections::BTreeSet::new();
    let mut add = |name: String, names: &mut Vec<String>| {
        if seen.insert(name.clone()) {
            names.push(name);
        }
    };

    for expr in &cgu.spec.cluster_selector {
        let Some(selector) = parse_legacy_selector(expr) else {
            warn!(selector = %expr, "ignoring malformed cluster selector");
            continue;
        };
        for name in registry.list_matching(&selector).await? {
            add(name, &mut names);
        }
    }

    for selector in &cgu.spec.cluster_label_selectors {
        for name in registry.list_matching(selector).await? {
            add(name, &mut names);
        }
    }

    for name in &cgu.spec.clusters {
        add(name.clone(), &mut names);
    }

    // Selector list results are not ordered consistently by the API server;
    // sorting keeps batch composition stable across reconciles.
    names.sort();
    debug!(?names, "resolved target clusters");
    Ok(names)
}

/// Validate the CGU spec against the live cluster registry and recompute the
/// effective concurrency.
///
/// Returns `Ok(true)` when the computed concurrency changed; the caller
/// persists the status and requeues immediately in that case.
pub async fn validate(
    registry: &dyn ClusterRegistry,
    cgu: &mut ClusterGroupUpgrade,
    clusters: &[String],
) -> Result<bool> {
    for cluster in clusters {
        if !registry.cluster_exists(cluster).await? {
            return Err(Error::validation(format!(
                "cluster {cluster} is not a managed cluster"
            )));
        }
    }

    for canary in &cgu.spec.remediation_strategy.canaries {
        if !clusters.contains(canary) {
            return Err(Error::validation(format!(
                "canary cluster {canary} is not in the list of clusters"
            )));
        }
    }

    let computed = effective_max_concurrency(
        cgu.spec.remediation_strategy.max_concurrency,
        clusters.len(),
    );

    let status = cgu.status.get_or_insert_with(Default::default);
    if status.computed_max_concurrency != computed {
        status.computed_max_concurrency = computed;
        return Ok(true);
    }
    Ok(false)
}

/// Clamp the declared concurrency to the target set size; non-positive
/// means unbounded.
pub fn effective_max_concurrency(spec_max: i32, cluster_count: usize) -> usize {
    let unbounded = cluster_count;
    let effective = if spec_max > 0 {
        (spec_max as usize).min(cluster_count)
    } else {
        unbounded
    };
    effective.max(1)
}
