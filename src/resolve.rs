//! Managed policy resolution.
//!
//! Locates the parent policies named in the CGU spec via their derived child
//! policies on the managed clusters, drops the ones the engine must not
//! touch (enforce children, already-compliant policies), and extracts the
//! embedded subscription descriptors used later for install-plan approval.

use std::collections::{BTreeMap, BTreeSet};

use kube::api::DynamicObject;
use kube::ResourceExt;
use serde_json::Value;
use tracing::{debug, info};

use crate::crd::{ClusterGroupUpgrade, ManagedPolicyRef, PolicyContent};
use crate::names::{observation_name, SafeNameRegistry};
use crate::object::{array_at, cluster_compliance, map_at, remediation_action, Compliance};
use crate::stores::{ObservationStore, PolicyStore};
use crate::{Result, MAX_OBJECT_NAME_LEN};

/// The only embedded object kind recorded as policy content
pub const SUBSCRIPTION_KIND: &str = "Subscription";

/// Result of resolving the spec's managed policies against the live stores
pub struct PolicyResolution {
    /// True when every named policy was located
    pub all_exist: bool,
    /// Policies named in the spec with no parent policy found
    pub missing: Vec<String>,
    /// Retained parent policies, in spec order
    pub present: Vec<DynamicObject>,
}

/// Split a child policy name of the form `<parentNamespace>.<parentName>`.
pub fn parent_policy_parts(child_name: &str) -> Option<(&str, &str)> {
    let (namespace, name) = child_name.split_once('.')?;
    if namespace.is_empty() || name.is_empty() {
        return None;
    }
    Some((namespace, name))
}

/// Resolve the managed policies for an upgrade.
///
/// Child policies on the target clusters index the parents: their naming
/// convention encodes the parent namespace and name. Policies whose child
/// declares `enforce` are not managed here and are dropped. When
/// `filter_non_compliant` is set, policies all target clusters already
/// satisfy are excluded from the upgrade list and recorded separately.
pub async fn resolve_managed_policies(
    policies: &dyn PolicyStore,
    cgu: &mut ClusterGroupUpgrade,
    clusters: &[String],
    filter_non_compliant: bool,
) -> Result<PolicyResolution> {
    let mut parent_namespaces: BTreeMap<String, String> = BTreeMap::new();
    let mut enforce_parents: BTreeSet<String> = BTreeSet::new();

    for cluster in clusters {
        for child in policies.list_policies(cluster).await? {
            let child_name = child.name_any();
            let Some((namespace, name)) = parent_policy_parts(&child_name) else {
                continue;
            };
            if remediation_action(&child).as_deref() == Some("enforce") {
                enforce_parents.insert(name.to_string());
                continue;
            }
            parent_namespaces.insert(name.to_string(), namespace.to_string());
        }
    }
    debug!(?parent_namespaces, "indexed parent policies from children");

    let mut missing = Vec::new();
    let mut present = Vec::new();
    let mut for_upgrade: Vec<ManagedPolicyRef> = Vec::new();
    let mut compliant_before: Vec<String> = Vec::new();

    let status = cgu.status.get_or_insert_with(Default::default);
    status.managed_policies_ns.clear();
    status.managed_policies_content.clear();

    let managed_policies = cgu.spec.managed_policies.clone();
    for policy_name in &managed_policies {
        if enforce_parents.contains(policy_name) {
            info!(policy = %policy_name, "ignoring policy with remediationAction enforce");
            continue;
        }

        let Some(namespace) = parent_namespaces.get(policy_name) else {
            missing.push(policy_name.clone());
            continue;
        };

        // The parent may have vanished between the child listing and now.
        let Some(parent) = policies.get_policy(policy_name, namespace).await? else {
            missing.push(policy_name.clone());
            continue;
        };

        if filter_non_compliant {
            let non_compliant = clusters_non_compliant_with_policy(&parent, clusters);
            if non_compliant.is_empty() {
                compliant_before.push(parent.name_any());
                continue;
            }
            for_upgrade.push(ManagedPolicyRef {
                name: policy_name.clone(),
                namespace: namespace.clone(),
            });
        }

        let status = cgu.status.as_mut().expect("status initialized above");
        status
            .managed_policies_ns
            .insert(policy_name.clone(), namespace.clone());
        present.push(parent);
    }

    let status = cgu.status.as_mut().expect("status initialized above");
    if !for_upgrade.is_empty() {
        status.managed_policies_for_upgrade = for_upgrade;
    }
    if !compliant_before.is_empty() {
        status.managed_policies_compliant_before_upgrade = compliant_before;
    }

    Ok(PolicyResolution {
        all_exist: missing.is_empty(),
        missing,
        present,
    })
}

/// Target clusters not reported Compliant by this policy.
///
/// NotMatched counts as non-compliant here: a cluster the policy has never
/// selected still needs the upgrade applied to it.
pub fn clusters_non_compliant_with_policy(
    policy: &DynamicObject,
    clusters: &[String],
) -> Vec<String> {
    clusters
        .iter()
        .filter(|cluster| cluster_compliance(policy, cluster) != Compliance::Compliant)
        .cloned()
        .collect()
}

/// Clusters violating at least one of the given policies.
pub fn clusters_non_compliant_with_any(
    policies: &[DynamicObject],
    clusters: &[String],
) -> BTreeSet<String> {
    let mut non_compliant = BTreeSet::new();
    for cluster in clusters {
        for policy in policies {
            if cluster_compliance(policy, cluster) == Compliance::NonCompliant {
                non_compliant.insert(cluster.clone());
                break;
            }
        }
    }
    non_compliant
}

/// Extract the embedded subscription descriptors from a policy's nested
/// template structure.
///
/// The intermediate levels are required: a policy without them cannot be
/// materialized and fails the resolve. Individual object templates that are
/// malformed or not subscriptions are logged and skipped.
pub fn extract_policy_content(policy: &DynamicObject) -> Result<Vec<PolicyContent>> {
    let policy_name = policy.name_any();
    let subject = format!("policy {policy_name}");
    let mut content = Vec::new();

    let templates = array_at(&policy.data, &["spec", "policy-templates"])
        .required(&subject, "spec.policy-templates")?;

    for template in templates {
        let object_definition = map_at(template, &["objectDefinition"])
            .required(&subject, "spec.policy-templates.objectDefinition")?;
        let spec = object_definition
            .get("spec")
            .and_then(Value::as_object)
            .ok_or_else(|| {
                crate::Error::policy_format(format!(
                    "{subject} is missing spec.policy-templates.objectDefinition.spec"
                ))
            })?;
        let object_templates = spec
            .get("object-templates")
            .and_then(Value::as_array)
            .ok_or_else(|| {
                crate::Error::policy_format(format!(
                    "{subject} is missing spec.policy-templates.objectDefinition.spec.object-templates"
                ))
            })?;

        for object_template in object_templates {
            let inner = match map_at(object_template, &["objectDefinition"]) {
                crate::object::Field::Found(inner) => inner,
                _ => {
                    return Err(crate::Error::policy_format(format!(
                        "{subject} is missing spec.policy-templates.objectDefinition.spec.object-templates.objectDefinition"
                    )))
                }
            };

            let kind = match inner.get("kind").and_then(Value::as_str) {
                Some(kind) => kind,
                None => {
                    info!(policy = %policy_name, "object template has no kind, skipping");
                    continue;
                }
            };
            if kind != SUBSCRIPTION_KIND {
                debug!(policy = %policy_name, kind, "object template is not a subscription, skipping");
                continue;
            }

            let metadata = match inner.get("metadata").and_then(Value::as_object) {
                Some(metadata) => metadata,
                None => {
                    info!(policy = %policy_name, "subscription template has no metadata, skipping");
                    continue;
                }
            };
            let Some(name) = metadata.get("name").and_then(Value::as_str) else {
                info!(policy = %policy_name, "subscription template has no name, skipping");
                continue;
            };
            let Some(namespace) = metadata.get("namespace").and_then(Value::as_str) else {
                info!(policy = %policy_name, "subscription template has no namespace, skipping");
                continue;
            };

            content.push(PolicyContent {
                kind: kind.to_string(),
                name: name.to_string(),
                namespace: Some(namespace.to_string()),
            });
        }
    }

    Ok(content)
}

/// Record each retained policy's subscription content on the status and
/// ensure a remote observation object exists for every subscription in each
/// non-compliant cluster's namespace.
pub async fn process_policy_content(
    observations: &dyn ObservationStore,
    cgu: &mut ClusterGroupUpgrade,
    present: &[DynamicObject],
    clusters: &[String],
) -> Result<()> {
    let cgu_name = cgu.name_any();
    let owner = format!("{}-{}", cgu.namespace().unwrap_or_default(), cgu_name);

    for policy in present {
        let content = extract_policy_content(policy)?;
        if content.is_empty() {
            continue;
        }

        let serialized = serde_json::to_string(&content)
            .map_err(|e| crate::Error::serialization(e.to_string()))?;
        let non_compliant = clusters_non_compliant_with_policy(policy, clusters);

        let status = cgu.status.get_or_insert_with(Default::default);
        status
            .managed_policies_content
            .insert(policy.name_any(), serialized);

        for entry in &content {
            let desired = observation_name(&cgu_name, &entry.kind, &entry.name);
            let safe = {
                let status = cgu.status.as_mut().expect("status initialized above");
                SafeNameRegistry::new(&mut status.safe_resource_names).safe_name(
                    &desired,
                    MAX_OBJECT_NAME_LEN,
                    0,
                )
            };
            let Some(namespace) = entry.namespace.as_deref() else {
                continue;
            };
            for cluster in &non_compliant {
                observations
                    .ensure_observation(cluster, &safe, &desired, &entry.name, namespace, &owner)
                    .await?;
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::api::ObjectMeta;
    use serde_json::json;

    fn policy(name: &str, namespace: &str, data: Value) -> DynamicObject {
        DynamicObject {
            types: None,
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(namespace.to_string()),
                ..Default::default()
            },
            data,
        }
    }

    fn subscription_policy(name: &str) -> DynamicObject {
        policy(
            name,
            "policies",
            json!({
                "spec": {
                    "remediationAction": "inform",
                    "policy-templates": [{
                        "objectDefinition": {
                            "kind": "ConfigurationPolicy",
                            "metadata": {"name": "cfg-sub"},
                            "spec": {
                                "object-templates": [{
                                    "complianceType": "musthave",
                                    "objectDefinition": {
                                        "kind": "Subscription",
                                        "metadata": {"name": "operator-sub", "namespace": "operators"},
                                        "spec": {"channel": "stable"},
                                    },
                                }],
                            },
                        },
                    }],
                },
            }),
        )
    }

    #[test]
    fn child_names_split_on_first_dot() {
        assert_eq!(parent_policy_parts("policies.p1"), Some(("policies", "p1")));
        assert_eq!(
            parent_policy_parts("policies.p1.extra"),
            Some(("policies", "p1.extra"))
        );
        assert_eq!(parent_policy_parts("nodot"), None);
        assert_eq!(parent_policy_parts(".p1"), None);
    }

    #[test]
    fn subscription_content_is_extracted() {
        let content = extract_policy_content(&subscription_policy("p1")).unwrap();
        assert_eq!(content.len(), 1);
        assert_eq!(content[0].kind, "Subscription");
        assert_eq!(content[0].name, "operator-sub");
        assert_eq!(content[0].namespace.as_deref(), Some("operators"));
    }

    #[test]
    fn non_subscription_templates_are_skipped_not_fatal() {
        let p = policy(
            "p1",
            "policies",
            json!({
                "spec": {
                    "policy-templates": [{
                        "objectDefinition": {
                            "spec": {
                                "object-templates": [
                                    {"objectDefinition": {"kind": "ConfigMap", "metadata": {"name": "cm"}}},
                                    {"objectDefinition": {"kind": "Subscription", "metadata": {"name": "s"}}},
                                ],
                            },
                        },
                    }],
                },
            }),
        );
        // The ConfigMap is skipped; the Subscription lacks a namespace and
        // is skipped too. Neither is fatal.
        let content = extract_policy_content(&p).unwrap();
        assert!(content.is_empty());
    }

    #[test]
    fn missing_required_level_fails_extraction() {
        let p = policy("p1", "policies", json!({"spec": {}}));
        let err = extract_policy_content(&p).unwrap_err();
        assert!(err.to_string().contains("spec.policy-templates"));
    }

    #[test]
    fn not_matched_clusters_count_as_non_compliant_for_planning() {
        let p = policy(
            "p1",
            "policies",
            json!({
                "status": {
                    "status": [
                        {"clustername": "spoke1", "compliant": "Compliant"},
                    ],
                }
            }),
        );
        let non_compliant = clusters_non_compliant_with_policy(
            &p,
            &["spoke1".to_string(), "spoke2".to_string()],
        );
        assert_eq!(non_compliant, vec!["spoke2"]);
    }

    #[test]
    fn non_compliant_with_any_requires_an_explicit_violation() {
        let compliant = policy(
            "p1",
            "policies",
            json!({"status": {"status": [
                {"clustername": "spoke1", "compliant": "Compliant"},
                {"clustername": "spoke2", "compliant": "NonCompliant"},
            ]}}),
        );
        let clusters = vec!["spoke1".to_string(), "spoke2".to_string(), "spoke3".to_string()];
        let set = clusters_non_compliant_with_any(&[compliant], &clusters);
        // spoke3 is NotMatched, which does not by itself put it in the plan.
        assert_eq!(set.into_iter().collect::<Vec<_>>(), vec!["spoke2"]);
    }

    mod resolution {
        use super::*;
        use crate::stores::MockPolicyStore;

        fn child(name: &str, cluster: &str, action: &str) -> DynamicObject {
            policy(name, cluster, json!({"spec": {"remediationAction": action}}))
        }

        fn cgu_with_policies(names: &[&str]) -> ClusterGroupUpgrade {
            ClusterGroupUpgrade {
                metadata: ObjectMeta {
                    name: Some("cgu-1".to_string()),
                    namespace: Some("default".to_string()),
                    ..Default::default()
                },
                spec: crate::crd::ClusterGroupUpgradeSpec {
                    managed_policies: names.iter().map(|s| s.to_string()).collect(),
                    ..Default::default()
                },
                status: None,
            }
        }

        #[tokio::test]
        async fn resolves_parents_via_children_and_reports_missing() {
            let mut store = MockPolicyStore::new();
            store.expect_list_policies().returning(|cluster| {
                Ok(vec![child("policies.p1", cluster, "inform")])
            });
            store.expect_get_policy().returning(|name, namespace| {
                Ok(Some(policy(
                    name,
                    namespace,
                    json!({"status": {"status": [
                        {"clustername": "spoke1", "compliant": "NonCompliant"},
                    ]}}),
                )))
            });

            let mut cgu = cgu_with_policies(&["p1", "p-ghost"]);
            let resolution = resolve_managed_policies(
                &store,
                &mut cgu,
                &["spoke1".to_string()],
                true,
            )
            .await
            .unwrap();

            assert!(!resolution.all_exist);
            assert_eq!(resolution.missing, vec!["p-ghost"]);
            assert_eq!(resolution.present.len(), 1);

            let status = cgu.status.unwrap();
            assert_eq!(status.managed_policies_for_upgrade.len(), 1);
            assert_eq!(status.managed_policies_for_upgrade[0].namespace, "policies");
            assert_eq!(status.managed_policies_ns["p1"], "policies");
        }

        #[tokio::test]
        async fn enforce_children_exclude_their_parent() {
            let mut store = MockPolicyStore::new();
            store.expect_list_policies().returning(|cluster| {
                Ok(vec![child("policies.p1", cluster, "enforce")])
            });
            store.expect_get_policy().never();

            let mut cgu = cgu_with_policies(&["p1"]);
            let resolution =
                resolve_managed_policies(&store, &mut cgu, &["spoke1".to_string()], true)
                    .await
                    .unwrap();

            // Dropped entirely: neither missing nor present.
            assert!(resolution.all_exist);
            assert!(resolution.present.is_empty());
        }

        #[tokio::test]
        async fn fully_compliant_policies_are_set_aside() {
            let mut store = MockPolicyStore::new();
            store.expect_list_policies().returning(|cluster| {
                Ok(vec![child("policies.p1", cluster, "inform")])
            });
            store.expect_get_policy().returning(|name, namespace| {
                Ok(Some(policy(
                    name,
                    namespace,
                    json!({"status": {"status": [
                        {"clustername": "spoke1", "compliant": "Compliant"},
                    ]}}),
                )))
            });

            let mut cgu = cgu_with_policies(&["p1"]);
            let resolution =
                resolve_managed_policies(&store, &mut cgu, &["spoke1".to_string()], true)
                    .await
                    .unwrap();

            assert!(resolution.all_exist);
            assert!(resolution.present.is_empty());
            let status = cgu.status.unwrap();
            assert!(status.managed_policies_for_upgrade.is_empty());
            assert_eq!(
                status.managed_policies_compliant_before_upgrade,
                vec!["p1"]
            );
        }
    }
}
