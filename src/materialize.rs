//! Materialization of the CGU's owned children.
//!
//! For each retained managed policy the engine owns three resources in the
//! CGU's namespace: an enforcing copy of the policy, a placement rule that
//! starts empty and is widened by the batch driver, and a placement binding
//! linking the two. All three carry the owner label, a desired-name
//! annotation and an owner reference for cascading deletion.
//!
//! Create-or-update is GET by safe name, CREATE on a miss, otherwise UPDATE
//! carrying the observed resource version. Listing children afterwards runs
//! the duplicate check: when two live children claim the same desired name,
//! the one recorded in the safe-name map wins and the stale one is deleted.

use std::collections::BTreeMap;

use kube::api::{DynamicObject, ObjectMeta};
use kube::{Resource, ResourceExt};
use serde_json::{json, Value};
use tracing::{debug, info};

use crate::crd::ClusterGroupUpgrade;
use crate::names::{child_resource_name, SafeNameRegistry};
use crate::stores::{PlacementStore, PolicyStore};
use crate::{
    Error, Result, APP_LABEL_VALUE, DESIRED_NAME_ANNOTATION, FOR_POLICY_LABEL,
    MAX_OBJECT_NAME_LEN, MAX_POLICY_NAME_LEN, OWNER_LABEL, PARENT_POLICY_LABEL,
};

/// Ensure every owned child for the retained policies exists, then refresh
/// the observed child names (running duplicate cleanup).
pub async fn materialize_for_upgrade(
    policies: &dyn PolicyStore,
    placements: &dyn PlacementStore,
    cgu: &mut ClusterGroupUpgrade,
    present: &[DynamicObject],
) -> Result<()> {
    for parent in present {
        let copy_name = copy_managed_inform_policy(policies, cgu, parent).await?;
        let rule_name = ensure_placement_rule(placements, cgu, &copy_name, parent).await?;
        ensure_placement_binding(placements, cgu, &copy_name, &rule_name, parent).await?;
    }
    update_child_resource_names(policies, placements, cgu).await
}

fn base_metadata(cgu: &ClusterGroupUpgrade, safe_name: &str, desired_name: &str) -> ObjectMeta {
    ObjectMeta {
        name: Some(safe_name.to_string()),
        namespace: cgu.namespace(),
        labels: Some(BTreeMap::from([
            ("app".to_string(), APP_LABEL_VALUE.to_string()),
            (OWNER_LABEL.to_string(), cgu.name_any()),
        ])),
        annotations: Some(BTreeMap::from([(
            DESIRED_NAME_ANNOTATION.to_string(),
            desired_name.to_string(),
        )])),
        owner_references: cgu.controller_owner_ref(&()).map(|r| vec![r]),
        ..Default::default()
    }
}

/// Create or update the enforcing copy of a managed policy.
///
/// The copy keeps the parent's spec with `remediationAction` switched to
/// enforce and every nested configuration policy name rewritten to a safe
/// name derived from the CGU. Returns the copy's safe name.
pub async fn copy_managed_inform_policy(
    policies: &dyn PolicyStore,
    cgu: &mut ClusterGroupUpgrade,
    parent: &DynamicObject,
) -> Result<String> {
    let cgu_name = cgu.name_any();
    let namespace = cgu.namespace().unwrap_or_default();
    let parent_name = parent.name_any();

    let desired_name = child_resource_name(&cgu_name, &parent_name);

    let mut spec = parent
        .data
        .get("spec")
        .cloned()
        .ok_or_else(|| Error::policy_format(format!("policy {parent_name} has no spec")))?;

    let status = cgu.status.get_or_insert_with(Default::default);
    let mut registry = SafeNameRegistry::new(&mut status.safe_resource_names);
    rewrite_config_policy_names(&cgu_name, &mut registry, &mut spec, &parent_name)?;
    spec["remediationAction"] = json!("enforce");

    // The copy's name must also fit the `<namespace>.<name>` child form
    // replicated to managed clusters.
    let safe_name = registry.safe_name(&desired_name, MAX_POLICY_NAME_LEN, namespace.len() + 1);

    let mut metadata = base_metadata(cgu, &safe_name, &desired_name);
    // Carry the parent's labels and annotations under ours.
    if let Some(labels) = metadata.labels.as_mut() {
        for (k, v) in parent.labels() {
            labels.entry(k.clone()).or_insert_with(|| v.clone());
        }
        labels.insert(PARENT_POLICY_LABEL.to_string(), parent_name.clone());
    }
    if let Some(annotations) = metadata.annotations.as_mut() {
        for (k, v) in parent.annotations() {
            annotations.entry(k.clone()).or_insert_with(|| v.clone());
        }
    }

    let mut copy = DynamicObject {
        types: parent.types.clone().or(Some(kube::core::TypeMeta {
            api_version: "policy.open-cluster-management.io/v1".to_string(),
            kind: "Policy".to_string(),
        })),
        metadata,
        data: json!({ "spec": spec }),
    };

    match policies.get_policy(&safe_name, &namespace).await? {
        None => {
            info!(policy = %safe_name, namespace = %namespace, "creating enforcing policy copy");
            policies.create_policy(&namespace, &copy).await?;
        }
        Some(existing) => {
            copy.metadata.resource_version = existing.resource_version();
            policies.update_policy(&namespace, &copy).await?;
        }
    }

    Ok(safe_name)
}

/// Rewrite each nested configuration policy name inside the copied spec to a
/// safe name derived from the CGU.
fn rewrite_config_policy_names(
    cgu_name: &str,
    registry: &mut SafeNameRegistry<'_>,
    spec: &mut Value,
    parent_name: &str,
) -> Result<()> {
    let templates = spec
        .get_mut("policy-templates")
        .and_then(Value::as_array_mut)
        .ok_or_else(|| {
            Error::policy_format(format!(
                "policy {parent_name} is missing spec.policy-templates"
            ))
        })?;

    for template in templates {
        let metadata = template
            .get_mut("objectDefinition")
            .and_then(|d| d.get_mut("metadata"))
            .and_then(Value::as_object_mut)
            .ok_or_else(|| {
                Error::policy_format(format!(
                    "policy {parent_name} is missing spec.policy-templates.objectDefinition.metadata"
                ))
            })?;
        let name = metadata
            .get("name")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                Error::policy_format(format!(
                    "policy {parent_name} is missing its configuration policy name"
                ))
            })?;

        let desired = child_resource_name(cgu_name, name);
        let safe = registry.safe_name(&desired, MAX_POLICY_NAME_LEN, 0);
        metadata.insert("name".to_string(), json!(safe));
    }

    Ok(())
}

/// Create or update the placement rule for one policy copy.
///
/// The rule starts with no clusters and `clusterReplicas: 0`; the batch
/// driver widens its cluster list as batches progress. Returns the rule's
/// safe name.
pub async fn ensure_placement_rule(
    placements: &dyn PlacementStore,
    cgu: &mut ClusterGroupUpgrade,
    policy_copy_name: &str,
    parent: &DynamicObject,
) -> Result<String> {
    let namespace = cgu.namespace().unwrap_or_default();
    let desired_name = placement_desired_name(&cgu.name_any(), &parent.name_any());

    let status = cgu.status.get_or_insert_with(Default::default);
    let safe_name = SafeNameRegistry::new(&mut status.safe_resource_names).safe_name(
        &desired_name,
        MAX_OBJECT_NAME_LEN,
        0,
    );

    let mut metadata = base_metadata(cgu, &safe_name, &desired_name);
    if let Some(labels) = metadata.labels.as_mut() {
        labels.insert(FOR_POLICY_LABEL.to_string(), policy_copy_name.to_string());
    }

    let mut rule = DynamicObject {
        types: Some(kube::core::TypeMeta {
            api_version: "apps.open-cluster-management.io/v1".to_string(),
            kind: "PlacementRule".to_string(),
        }),
        metadata,
        data: json!({
            "spec": {
                "clusterConditions": [
                    {"type": "ManagedClusterConditionAvailable", "status": "True"},
                ],
                "clusterReplicas": 0,
            },
        }),
    };

    match placements.get_rule(&safe_name, &namespace).await? {
        None => {
            info!(rule = %safe_name, namespace = %namespace, "creating placement rule");
            placements.create_rule(&namespace, &rule).await?;
        }
        Some(existing) => {
            rule.metadata.resource_version = existing.resource_version();
            placements.update_rule(&namespace, &rule).await?;
        }
    }

    Ok(safe_name)
}

/// Create or update the placement binding linking a rule to a policy copy.
pub async fn ensure_placement_binding(
    placements: &dyn PlacementStore,
    cgu: &mut ClusterGroupUpgrade,
    policy_copy_name: &str,
    rule_name: &str,
    parent: &DynamicObject,
) -> Result<()> {
    let namespace = cgu.namespace().unwrap_or_default();
    // Bindings share the rule's desired name; the kinds differ so the safe
    // name can be identical without colliding.
    let desired_name = placement_desired_name(&cgu.name_any(), &parent.name_any());

    let status = cgu.status.get_or_insert_with(Default::default);
    let safe_name = SafeNameRegistry::new(&mut status.safe_resource_names).safe_name(
        &desired_name,
        MAX_OBJECT_NAME_LEN,
        0,
    );

    let mut binding = DynamicObject {
        types: Some(kube::core::TypeMeta {
            api_version: "policy.open-cluster-management.io/v1".to_string(),
            kind: "PlacementBinding".to_string(),
        }),
        metadata: base_metadata(cgu, &safe_name, &desired_name),
        data: json!({
            "placementRef": {
                "name": rule_name,
                "kind": "PlacementRule",
                "apiGroup": "apps.open-cluster-management.io",
            },
            "subjects": [{
                "name": policy_copy_name,
                "kind": "Policy",
                "apiGroup": "policy.open-cluster-management.io",
            }],
        }),
    };

    match placements.get_binding(&safe_name, &namespace).await? {
        None => {
            info!(binding = %safe_name, namespace = %namespace, "creating placement binding");
            placements.create_binding(&namespace, &binding).await?;
        }
        Some(existing) => {
            binding.metadata.resource_version = existing.resource_version();
            placements.update_binding(&namespace, &binding).await?;
        }
    }

    Ok(())
}

/// Desired name of the placement pair for one managed policy.
pub fn placement_desired_name(cgu_name: &str, policy_name: &str) -> String {
    child_resource_name(cgu_name, &format!("{policy_name}-placement"))
}

/// What to do with a listed child during the duplicate check
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DuplicateDecision {
    /// Record the child as a live owned resource
    Keep,
    /// The child is a stale duplicate; delete it and keep the recorded one
    DeleteStale,
}

/// Duplicate check for one listed child.
///
/// A child whose desired-name annotation already maps to a *different* live
/// name is a leftover from a reconcile that crashed between resource
/// creation and status update; the mapping wins and the stale child is
/// deleted. Children without the annotation are recorded as-is.
pub fn record_child(
    safe_names: &mut BTreeMap<String, String>,
    child_names: &mut Vec<String>,
    child: &DynamicObject,
) -> DuplicateDecision {
    let child_name = child.name_any();
    if let Some(desired) = child
        .metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(DESIRED_NAME_ANNOTATION))
    {
        match safe_names.get(desired) {
            Some(recorded) if recorded != &child_name => {
                debug!(child = %child_name, desired = %desired, "stale duplicate child");
                return DuplicateDecision::DeleteStale;
            }
            Some(_) => {}
            None => {
                safe_names.insert(desired.clone(), child_name.clone());
            }
        }
    }
    child_names.push(child_name);
    DuplicateDecision::Keep
}

/// Refresh the observed child resource names on the status, deleting stale
/// duplicates found along the way.
pub async fn update_child_resource_names(
    policies: &dyn PolicyStore,
    placements: &dyn PlacementStore,
    cgu: &mut ClusterGroupUpgrade,
) -> Result<()> {
    let cgu_name = cgu.name_any();
    let namespace = cgu.namespace().unwrap_or_default();
    let status = cgu.status.get_or_insert_with(Default::default);

    let mut rule_names = Vec::new();
    for rule in placements.list_owned_rules(&namespace, &cgu_name, None).await? {
        if record_child(&mut status.safe_resource_names, &mut rule_names, &rule)
            == DuplicateDecision::DeleteStale
        {
            placements.delete_rule(&rule.name_any(), &namespace).await?;
        }
    }
    status.placement_rules = rule_names;

    let mut binding_names = Vec::new();
    for binding in placements.list_owned_bindings(&namespace, &cgu_name).await? {
        if record_child(&mut status.safe_resource_names, &mut binding_names, &binding)
            == DuplicateDecision::DeleteStale
        {
            placements
                .delete_binding(&binding.name_any(), &namespace)
                .await?;
        }
    }
    status.placement_bindings = binding_names;

    let mut policy_names = Vec::new();
    for policy in policies.list_owned_policies(&namespace, &cgu_name).await? {
        if record_child(&mut status.safe_resource_names, &mut policy_names, &policy)
            == DuplicateDecision::DeleteStale
        {
            policies.delete_policy(&policy.name_any(), &namespace).await?;
        }
    }
    status.copied_policies = policy_names;

    Ok(())
}

/// Widen a placement rule's cluster list with the given clusters.
///
/// Existing entries are kept; the union is idempotent. `clusterReplicas` is
/// cleared so the rule stops pinning an empty selection.
pub async fn add_clusters_to_rule(
    placements: &dyn PlacementStore,
    namespace: &str,
    rule_name: &str,
    clusters: &[String],
) -> Result<()> {
    let mut rule = placements
        .get_rule(rule_name, namespace)
        .await?
        .ok_or_else(|| {
            Error::child_resource(format!("placement rule {rule_name} not found"))
        })?;

    let mut entries: Vec<Value> = rule
        .data
        .get("spec")
        .and_then(|s| s.get("clusters"))
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();

    for cluster in clusters {
        let present = entries
            .iter()
            .any(|e| e.get("name").and_then(Value::as_str) == Some(cluster));
        if !present {
            entries.push(json!({"name": cluster}));
        }
    }

    rule.data["spec"]["clusters"] = Value::Array(entries);
    rule.data["spec"]["clusterReplicas"] = Value::Null;
    placements.update_rule(namespace, &rule).await
}

/// Reset every owned placement rule to an empty pinned selection.
///
/// Runs between batches so the next batch starts from a clean slate.
pub async fn clear_placement_rules(
    placements: &dyn PlacementStore,
    cgu: &ClusterGroupUpgrade,
) -> Result<()> {
    let namespace = cgu.namespace().unwrap_or_default();
    for mut rule in placements
        .list_owned_rules(&namespace, &cgu.name_any(), None)
        .await?
    {
        rule.data["spec"]["clusters"] = Value::Null;
        rule.data["spec"]["clusterReplicas"] = json!(0);
        placements.update_rule(&namespace, &rule).await?;
    }
    Ok(())
}

/// Delete every owned child of the CGU.
///
/// Runs on timeout: the upgrade stops driving and its enforcing copies must
/// not keep remediating. Deleting eagerly can race an in-flight remote
/// policy application; a two-phase teardown (clear placements, then delete)
/// would close that window at the cost of an extra pass.
pub async fn delete_owned_resources(
    policies: &dyn PolicyStore,
    placements: &dyn PlacementStore,
    cgu: &ClusterGroupUpgrade,
) -> Result<()> {
    let cgu_name = cgu.name_any();
    let namespace = cgu.namespace().unwrap_or_default();

    for rule in placements.list_owned_rules(&namespace, &cgu_name, None).await? {
        placements.delete_rule(&rule.name_any(), &namespace).await?;
    }
    for binding in placements.list_owned_bindings(&namespace, &cgu_name).await? {
        placements
            .delete_binding(&binding.name_any(), &namespace)
            .await?;
    }
    for policy in policies.list_owned_policies(&namespace, &cgu_name).await? {
        policies.delete_policy(&policy.name_any(), &namespace).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stores::{MockPlacementStore, MockPolicyStore};
    use serde_json::json;

    fn cgu() -> ClusterGroupUpgrade {
        ClusterGroupUpgrade {
            metadata: ObjectMeta {
                name: Some("cgu-1".to_string()),
                namespace: Some("default".to_string()),
                uid: Some("uid-1".to_string()),
                ..Default::default()
            },
            spec: Default::default(),
            status: None,
        }
    }

    fn child_with_annotation(name: &str, desired: Option<&str>) -> DynamicObject {
        DynamicObject {
            types: None,
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("default".to_string()),
                annotations: desired.map(|d| {
                    BTreeMap::from([(DESIRED_NAME_ANNOTATION.to_string(), d.to_string())])
                }),
                ..Default::default()
            },
            data: json!({}),
        }
    }

    fn parent_policy() -> DynamicObject {
        DynamicObject {
            types: None,
            metadata: ObjectMeta {
                name: Some("p1".to_string()),
                namespace: Some("policies".to_string()),
                ..Default::default()
            },
            data: json!({
                "spec": {
                    "remediationAction": "inform",
                    "policy-templates": [{
                        "objectDefinition": {
                            "kind": "ConfigurationPolicy",
                            "metadata": {"name": "cfg-1"},
                            "spec": {"object-templates": []},
                        },
                    }],
                },
            }),
        }
    }

    #[test]
    fn duplicate_with_different_live_name_is_deleted() {
        let mut safe_names = BTreeMap::from([
            ("cgu-1-p1-placement".to_string(), "newer-name".to_string()),
        ]);
        let mut names = Vec::new();

        let stale = child_with_annotation("older-name", Some("cgu-1-p1-placement"));
        assert_eq!(
            record_child(&mut safe_names, &mut names, &stale),
            DuplicateDecision::DeleteStale
        );
        assert!(names.is_empty());

        let current = child_with_annotation("newer-name", Some("cgu-1-p1-placement"));
        assert_eq!(
            record_child(&mut safe_names, &mut names, &current),
            DuplicateDecision::Keep
        );
        assert_eq!(names, vec!["newer-name"]);
    }

    #[test]
    fn unseen_desired_name_is_adopted_into_the_map() {
        let mut safe_names = BTreeMap::new();
        let mut names = Vec::new();

        let child = child_with_annotation("safe-x", Some("desired-x"));
        assert_eq!(
            record_child(&mut safe_names, &mut names, &child),
            DuplicateDecision::Keep
        );
        assert_eq!(safe_names["desired-x"], "safe-x");
    }

    #[test]
    fn child_without_annotation_is_kept_unmapped() {
        let mut safe_names = BTreeMap::new();
        let mut names = Vec::new();

        let child = child_with_annotation("legacy", None);
        assert_eq!(
            record_child(&mut safe_names, &mut names, &child),
            DuplicateDecision::Keep
        );
        assert!(safe_names.is_empty());
        assert_eq!(names, vec!["legacy"]);
    }

    #[tokio::test]
    async fn policy_copy_enforces_and_rewrites_nested_names() {
        let mut policies = MockPolicyStore::new();
        policies.expect_get_policy().returning(|_, _| Ok(None));
        policies
            .expect_create_policy()
            .withf(|namespace, copy| {
                let spec = &copy.data["spec"];
                namespace == "default"
                    && spec["remediationAction"] == json!("enforce")
                    && spec["policy-templates"][0]["objectDefinition"]["metadata"]["name"]
                        == json!("cgu-1-cfg-1")
                    && copy.metadata.labels.as_ref().unwrap()[OWNER_LABEL] == "cgu-1"
                    && copy.metadata.labels.as_ref().unwrap()[PARENT_POLICY_LABEL] == "p1"
                    && copy.metadata.owner_references.is_some()
            })
            .returning(|_, _| Ok(()));

        let mut cgu = cgu();
        let name = copy_managed_inform_policy(&policies, &mut cgu, &parent_policy())
            .await
            .unwrap();
        assert_eq!(name, "cgu-1-p1");

        let safe_names = &cgu.status.unwrap().safe_resource_names;
        assert_eq!(safe_names["cgu-1-p1"], "cgu-1-p1");
        assert_eq!(safe_names["cgu-1-cfg-1"], "cgu-1-cfg-1");
    }

    #[tokio::test]
    async fn existing_copy_is_updated_with_resource_version() {
        let mut policies = MockPolicyStore::new();
        policies.expect_get_policy().returning(|name, _| {
            let mut existing = child_with_annotation(name, None);
            existing.metadata.resource_version = Some("41".to_string());
            Ok(Some(existing))
        });
        policies
            .expect_update_policy()
            .withf(|_, copy| copy.metadata.resource_version.as_deref() == Some("41"))
            .returning(|_, _| Ok(()));

        let mut cgu = cgu();
        copy_managed_inform_policy(&policies, &mut cgu, &parent_policy())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn rule_and_binding_share_the_placement_name() {
        let mut placements = MockPlacementStore::new();
        placements.expect_get_rule().returning(|_, _| Ok(None));
        placements
            .expect_create_rule()
            .withf(|_, rule| {
                rule.data["spec"]["clusterReplicas"] == json!(0)
                    && rule.data["spec"]["clusterConditions"][0]["type"]
                        == json!("ManagedClusterConditionAvailable")
                    && rule.metadata.labels.as_ref().unwrap()[FOR_POLICY_LABEL] == "cgu-1-p1"
            })
            .returning(|_, _| Ok(()));
        placements.expect_get_binding().returning(|_, _| Ok(None));
        placements
            .expect_create_binding()
            .withf(|_, binding| {
                binding.data["placementRef"]["name"] == json!("cgu-1-p1-placement")
                    && binding.data["subjects"][0]["name"] == json!("cgu-1-p1")
            })
            .returning(|_, _| Ok(()));

        let mut cgu = cgu();
        let parent = parent_policy();
        let rule_name = ensure_placement_rule(&placements, &mut cgu, "cgu-1-p1", &parent)
            .await
            .unwrap();
        assert_eq!(rule_name, "cgu-1-p1-placement");
        ensure_placement_binding(&placements, &mut cgu, "cgu-1-p1", &rule_name, &parent)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn adding_clusters_unions_without_duplicates() {
        let mut placements = MockPlacementStore::new();
        placements.expect_get_rule().returning(|name, _| {
            let mut rule = child_with_annotation(name, None);
            rule.data = json!({
                "spec": {
                    "clusters": [{"name": "spoke1"}],
                    "clusterReplicas": 0,
                },
            });
            Ok(Some(rule))
        });
        placements
            .expect_update_rule()
            .withf(|_, rule| {
                let clusters = rule.data["spec"]["clusters"].as_array().unwrap();
                clusters.len() == 2
                    && clusters[0]["name"] == json!("spoke1")
                    && clusters[1]["name"] == json!("spoke2")
                    && rule.data["spec"]["clusterReplicas"] == Value::Null
            })
            .returning(|_, _| Ok(()));

        add_clusters_to_rule(
            &placements,
            "default",
            "cgu-1-p1-placement",
            &["spoke1".to_string(), "spoke2".to_string()],
        )
        .await
        .unwrap();
    }
}
