//! Trait-backed access to the external stores the engine observes and
//! mutates.
//!
//! Each trait matches one collaborator role: the CGU's own API, the policy
//! store, the placement store, the managed-cluster registry, and the remote
//! observation store used for install-plan approval. Production impls wrap
//! `kube` clients; tests mock the traits. Read misses map to `Ok(None)` so
//! recovery paths stay explicit at the call sites.

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::api::{Api, DynamicObject, ListParams, ObjectMeta, Patch, PatchParams, PostParams};
use kube::core::Selector;
use kube::discovery::ApiResource;
use kube::Client;
#[cfg(test)]
use mockall::automock;
use serde_json::json;
use tracing::{debug, info};

use crate::crd::ClusterGroupUpgrade;
use crate::{Error, Result, APP_LABEL_VALUE, OWNER_LABEL};

/// Outcome of an install-plan approval attempt for one subscription
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InstallPlanOutcome {
    /// A pending install plan was approved
    Approved,
    /// The subscription has no approvable install plan right now
    CannotApproveNow,
    /// The remote observation has not reported usable state yet
    PendingRemoteStatus,
}

/// Access to ClusterGroupUpgrade objects themselves
#[cfg_attr(test, automock)]
#[async_trait]
pub trait CguStore: Send + Sync {
    /// Fetch a CGU; `Ok(None)` when it does not exist
    async fn get(&self, name: &str, namespace: &str) -> Result<Option<ClusterGroupUpgrade>>;

    /// Replace a CGU's spec/metadata (finalizer writes)
    async fn update(&self, cgu: &ClusterGroupUpgrade) -> Result<()>;

    /// Replace a CGU's status subresource
    async fn update_status(&self, cgu: &ClusterGroupUpgrade) -> Result<()>;
}

/// Access to policy objects
#[cfg_attr(test, automock)]
#[async_trait]
pub trait PolicyStore: Send + Sync {
    /// Fetch a policy by name; `Ok(None)` on a read miss
    async fn get_policy(&self, name: &str, namespace: &str) -> Result<Option<DynamicObject>>;

    /// All policies in a namespace (used for child policies per cluster)
    async fn list_policies(&self, namespace: &str) -> Result<Vec<DynamicObject>>;

    /// Policy copies labeled as owned by the given CGU
    async fn list_owned_policies(
        &self,
        namespace: &str,
        cgu_name: &str,
    ) -> Result<Vec<DynamicObject>>;

    /// Create a policy object
    async fn create_policy(&self, namespace: &str, policy: &DynamicObject) -> Result<()>;

    /// Update a policy object (resource version must be set)
    async fn update_policy(&self, namespace: &str, policy: &DynamicObject) -> Result<()>;

    /// Delete a policy; not-found is success
    async fn delete_policy(&self, name: &str, namespace: &str) -> Result<()>;
}

/// Access to placement rules and bindings
#[cfg_attr(test, automock)]
#[async_trait]
pub trait PlacementStore: Send + Sync {
    /// Fetch a placement rule; `Ok(None)` on a read miss
    async fn get_rule(&self, name: &str, namespace: &str) -> Result<Option<DynamicObject>>;

    /// Create a placement rule
    async fn create_rule(&self, namespace: &str, rule: &DynamicObject) -> Result<()>;

    /// Update a placement rule (resource version must be set)
    async fn update_rule(&self, namespace: &str, rule: &DynamicObject) -> Result<()>;

    /// Placement rules owned by the CGU, optionally narrowed to one policy
    async fn list_owned_rules<'a>(
        &self,
        namespace: &str,
        cgu_name: &str,
        for_policy: Option<&'a str>,
    ) -> Result<Vec<DynamicObject>>;

    /// Delete a placement rule; not-found is success
    async fn delete_rule(&self, name: &str, namespace: &str) -> Result<()>;

    /// Fetch a placement binding; `Ok(None)` on a read miss
    async fn get_binding(&self, name: &str, namespace: &str) -> Result<Option<DynamicObject>>;

    /// Create a placement binding
    async fn create_binding(&self, namespace: &str, binding: &DynamicObject) -> Result<()>;

    /// Update a placement binding (resource version must be set)
    async fn update_binding(&self, namespace: &str, binding: &DynamicObject) -> Result<()>;

    /// Placement bindings owned by the CGU
    async fn list_owned_bindings(
        &self,
        namespace: &str,
        cgu_name: &str,
    ) -> Result<Vec<DynamicObject>>;

    /// Delete a placement binding; not-found is success
    async fn delete_binding(&self, name: &str, namespace: &str) -> Result<()>;
}

/// Read access to the managed-cluster registry
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterRegistry: Send + Sync {
    /// Names of managed clusters matching the selector
    async fn list_matching(&self, selector: &LabelSelector) -> Result<Vec<String>>;

    /// True if a managed cluster object with this name exists
    async fn cluster_exists(&self, name: &str) -> Result<bool>;
}

/// Access to per-cluster remote observation objects and install-plan approval
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ObservationStore: Send + Sync {
    /// Ensure an observation object for the subscription exists in the
    /// cluster namespace; idempotent
    async fn ensure_observation(
        &self,
        cluster_ns: &str,
        safe_name: &str,
        desired_name: &str,
        subscription_name: &str,
        subscription_ns: &str,
        owner: &str,
    ) -> Result<()>;

    /// Read the observation for a subscription and approve its pending
    /// install plan when one is approvable.
    ///
    /// `Ok(None)` means the observation object itself is absent.
    async fn approve_pending_install_plan(
        &self,
        cluster_ns: &str,
        safe_name: &str,
    ) -> Result<Option<InstallPlanOutcome>>;

    /// Delete every observation object owned by `owner` in the cluster
    /// namespace; not-found is success
    async fn delete_observations(&self, cluster_ns: &str, owner: &str) -> Result<()>;
}

// =============================================================================
// Kubernetes-backed implementations
// =============================================================================

pub(crate) fn policy_resource() -> ApiResource {
    ApiResource {
        group: "policy.open-cluster-management.io".to_string(),
        version: "v1".to_string(),
        api_version: "policy.open-cluster-management.io/v1".to_string(),
        kind: "Policy".to_string(),
        plural: "policies".to_string(),
    }
}

fn placement_rule_resource() -> ApiResource {
    ApiResource {
        group: "apps.open-cluster-management.io".to_string(),
        version: "v1".to_string(),
        api_version: "apps.open-cluster-management.io/v1".to_string(),
        kind: "PlacementRule".to_string(),
        plural: "placementrules".to_string(),
    }
}

fn placement_binding_resource() -> ApiResource {
    ApiResource {
        group: "policy.open-cluster-management.io".to_string(),
        version: "v1".to_string(),
        api_version: "policy.open-cluster-management.io/v1".to_string(),
        kind: "PlacementBinding".to_string(),
        plural: "placementbindings".to_string(),
    }
}

fn managed_cluster_resource() -> ApiResource {
    ApiResource {
        group: "cluster.open-cluster-management.io".to_string(),
        version: "v1".to_string(),
        api_version: "cluster.open-cluster-management.io/v1".to_string(),
        kind: "ManagedCluster".to_string(),
        plural: "managedclusters".to_string(),
    }
}

fn cluster_view_resource() -> ApiResource {
    ApiResource {
        group: "view.open-cluster-management.io".to_string(),
        version: "v1beta1".to_string(),
        api_version: "view.open-cluster-management.io/v1beta1".to_string(),
        kind: "ManagedClusterView".to_string(),
        plural: "managedclusterviews".to_string(),
    }
}

fn cluster_action_resource() -> ApiResource {
    ApiResource {
        group: "action.open-cluster-management.io".to_string(),
        version: "v1beta1".to_string(),
        api_version: "action.open-cluster-management.io/v1beta1".to_string(),
        kind: "ManagedClusterAction".to_string(),
        plural: "managedclusteractions".to_string(),
    }
}

fn owner_selector(cgu_name: &str) -> String {
    format!("{OWNER_LABEL}={cgu_name}")
}

async fn get_dynamic(
    api: &Api<DynamicObject>,
    name: &str,
) -> Result<Option<DynamicObject>> {
    match api.get(name).await {
        Ok(obj) => Ok(Some(obj)),
        Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(None),
        Err(e) => Err(e.into()),
    }
}

async fn delete_dynamic(api: &Api<DynamicObject>, name: &str) -> Result<()> {
    match api.delete(name, &Default::default()).await {
        Ok(_) => Ok(()),
        Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Kubernetes-backed CGU store
pub struct KubeCguStore {
    client: Client,
}

impl KubeCguStore {
    /// Wrap a kube client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(&self, namespace: &str) -> Api<ClusterGroupUpgrade> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn name_and_namespace(cgu: &ClusterGroupUpgrade) -> Result<(String, String)> {
        let name = cgu
            .metadata
            .name
            .clone()
            .ok_or_else(|| Error::validation("ClusterGroupUpgrade has no name"))?;
        let namespace = cgu
            .metadata
            .namespace
            .clone()
            .ok_or_else(|| Error::validation("ClusterGroupUpgrade has no namespace"))?;
        Ok((name, namespace))
    }
}

#[async_trait]
impl CguStore for KubeCguStore {
    async fn get(&self, name: &str, namespace: &str) -> Result<Option<ClusterGroupUpgrade>> {
        match self.api(namespace).get(name).await {
            Ok(cgu) => Ok(Some(cgu)),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn update(&self, cgu: &ClusterGroupUpgrade) -> Result<()> {
        let (name, namespace) = Self::name_and_namespace(cgu)?;
        self.api(&namespace)
            .replace(&name, &PostParams::default(), cgu)
            .await?;
        Ok(())
    }

    async fn update_status(&self, cgu: &ClusterGroupUpgrade) -> Result<()> {
        let (name, namespace) = Self::name_and_namespace(cgu)?;
        let data =
            serde_json::to_vec(cgu).map_err(|e| Error::serialization(e.to_string()))?;
        self.api(&namespace)
            .replace_status(&name, &PostParams::default(), data)
            .await?;
        Ok(())
    }
}

/// Kubernetes-backed policy store
pub struct KubePolicyStore {
    client: Client,
}

impl KubePolicyStore {
    /// Wrap a kube client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(&self, namespace: &str) -> Api<DynamicObject> {
        Api::namespaced_with(self.client.clone(), namespace, &policy_resource())
    }
}

#[async_trait]
impl PolicyStore for KubePolicyStore {
    async fn get_policy(&self, name: &str, namespace: &str) -> Result<Option<DynamicObject>> {
        get_dynamic(&self.api(namespace), name).await
    }

    async fn list_policies(&self, namespace: &str) -> Result<Vec<DynamicObject>> {
        let list = self.api(namespace).list(&ListParams::default()).await?;
        Ok(list.items)
    }

    async fn list_owned_policies(
        &self,
        namespace: &str,
        cgu_name: &str,
    ) -> Result<Vec<DynamicObject>> {
        let params = ListParams::default().labels(&owner_selector(cgu_name));
        let list = self.api(namespace).list(&params).await?;
        Ok(list.items)
    }

    async fn create_policy(&self, namespace: &str, policy: &DynamicObject) -> Result<()> {
        self.api(namespace)
            .create(&PostParams::default(), policy)
            .await?;
        Ok(())
    }

    async fn update_policy(&self, namespace: &str, policy: &DynamicObject) -> Result<()> {
        let name = policy.metadata.name.as_deref().unwrap_or_default();
        self.api(namespace)
            .replace(name, &PostParams::default(), policy)
            .await?;
        Ok(())
    }

    async fn delete_policy(&self, name: &str, namespace: &str) -> Result<()> {
        delete_dynamic(&self.api(namespace), name).await
    }
}

/// Kubernetes-backed placement store
pub struct KubePlacementStore {
    client: Client,
}

impl KubePlacementStore {
    /// Wrap a kube client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn rules(&self, namespace: &str) -> Api<DynamicObject> {
        Api::namespaced_with(self.client.clone(), namespace, &placement_rule_resource())
    }

    fn bindings(&self, namespace: &str) -> Api<DynamicObject> {
        Api::namespaced_with(
            self.client.clone(),
            namespace,
            &placement_binding_resource(),
        )
    }
}

#[async_trait]
impl PlacementStore for KubePlacementStore {
    async fn get_rule(&self, name: &str, namespace: &str) -> Result<Option<DynamicObject>> {
        get_dynamic(&self.rules(namespace), name).await
    }

    async fn create_rule(&self, namespace: &str, rule: &DynamicObject) -> Result<()> {
        self.rules(namespace)
            .create(&PostParams::default(), rule)
            .await?;
        Ok(())
    }

    async fn update_rule(&self, namespace: &str, rule: &DynamicObject) -> Result<()> {
        let name = rule.metadata.name.as_deref().unwrap_or_default();
        self.rules(namespace)
            .replace(name, &PostParams::default(), rule)
            .await?;
        Ok(())
    }

    async fn list_owned_rules<'a>(
        &self,
        namespace: &str,
        cgu_name: &str,
        for_policy: Option<&'a str>,
    ) -> Result<Vec<DynamicObject>> {
        let mut selector = owner_selector(cgu_name);
        if let Some(policy) = for_policy {
            selector.push_str(&format!(",{}={}", crate::FOR_POLICY_LABEL, policy));
        }
        let params = ListParams::default().labels(&selector);
        let list = self.rules(namespace).list(&params).await?;
        Ok(list.items)
    }

    async fn delete_rule(&self, name: &str, namespace: &str) -> Result<()> {
        delete_dynamic(&self.rules(namespace), name).await
    }

    async fn get_binding(&self, name: &str, namespace: &str) -> Result<Option<DynamicObject>> {
        get_dynamic(&self.bindings(namespace), name).await
    }

    async fn create_binding(&self, namespace: &str, binding: &DynamicObject) -> Result<()> {
        self.bindings(namespace)
            .create(&PostParams::default(), binding)
            .await?;
        Ok(())
    }

    async fn update_binding(&self, namespace: &str, binding: &DynamicObject) -> Result<()> {
        let name = binding.metadata.name.as_deref().unwrap_or_default();
        self.bindings(namespace)
            .replace(name, &PostParams::default(), binding)
            .await?;
        Ok(())
    }

    async fn list_owned_bindings(
        &self,
        namespace: &str,
        cgu_name: &str,
    ) -> Result<Vec<DynamicObject>> {
        let params = ListParams::default().labels(&owner_selector(cgu_name));
        let list = self.bindings(namespace).list(&params).await?;
        Ok(list.items)
    }

    async fn delete_binding(&self, name: &str, namespace: &str) -> Result<()> {
        delete_dynamic(&self.bindings(namespace), name).await
    }
}

/// Kubernetes-backed managed-cluster registry
pub struct KubeClusterRegistry {
    client: Client,
}

impl KubeClusterRegistry {
    /// Wrap a kube client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(&self) -> Api<DynamicObject> {
        Api::all_with(self.client.clone(), &managed_cluster_resource())
    }
}

#[async_trait]
impl ClusterRegistry for KubeClusterRegistry {
    async fn list_matching(&self, selector: &LabelSelector) -> Result<Vec<String>> {
        let selector: Selector = selector
            .clone()
            .try_into()
            .map_err(|e| Error::validation(format!("invalid label selector: {e}")))?;
        let params = ListParams::default().labels_from(&selector);
        let list = self.api().list(&params).await?;
        Ok(list
            .items
            .into_iter()
            .filter_map(|c| c.metadata.name)
            .collect())
    }

    async fn cluster_exists(&self, name: &str) -> Result<bool> {
        Ok(get_dynamic(&self.api(), name).await?.is_some())
    }
}

/// Kubernetes-backed observation store using ManagedClusterView/Action
/// objects in each cluster's namespace
pub struct KubeObservationStore {
    client: Client,
}

impl KubeObservationStore {
    /// Wrap a kube client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn views(&self, namespace: &str) -> Api<DynamicObject> {
        Api::namespaced_with(self.client.clone(), namespace, &cluster_view_resource())
    }

    fn actions(&self, namespace: &str) -> Api<DynamicObject> {
        Api::namespaced_with(self.client.clone(), namespace, &cluster_action_resource())
    }
}

#[async_trait]
impl ObservationStore for KubeObservationStore {
    async fn ensure_observation(
        &self,
        cluster_ns: &str,
        safe_name: &str,
        desired_name: &str,
        subscription_name: &str,
        subscription_ns: &str,
        owner: &str,
    ) -> Result<()> {
        let api = self.views(cluster_ns);
        if get_dynamic(&api, safe_name).await?.is_some() {
            debug!(name = %safe_name, namespace = %cluster_ns, "observation already exists");
            return Ok(());
        }

        let mut view = DynamicObject {
            types: Some(kube::core::TypeMeta {
                api_version: cluster_view_resource().api_version,
                kind: cluster_view_resource().kind,
            }),
            metadata: ObjectMeta {
                name: Some(safe_name.to_string()),
                namespace: Some(cluster_ns.to_string()),
                labels: Some(BTreeMap::from([
                    ("app".to_string(), APP_LABEL_VALUE.to_string()),
                    (OWNER_LABEL.to_string(), owner.to_string()),
                ])),
                annotations: Some(BTreeMap::from([(
                    crate::DESIRED_NAME_ANNOTATION.to_string(),
                    desired_name.to_string(),
                )])),
                ..Default::default()
            },
            data: json!({}),
        };
        view.data = json!({
            "spec": {
                "scope": {
                    "resource": "subscriptions.operators.coreos.com",
                    "name": subscription_name,
                    "namespace": subscription_ns,
                },
            },
        });

        info!(name = %safe_name, namespace = %cluster_ns, "creating observation object");
        api.create(&PostParams::default(), &view).await?;
        Ok(())
    }

    async fn approve_pending_install_plan(
        &self,
        cluster_ns: &str,
        safe_name: &str,
    ) -> Result<Option<InstallPlanOutcome>> {
        use crate::object::{str_at, Field};

        let api = self.views(cluster_ns);
        let view = match get_dynamic(&api, safe_name).await? {
            Some(view) => view,
            None => return Ok(None),
        };

        // The view must have processed at least one read of the remote
        // subscription before its result is usable.
        let processing_ok = crate::object::array_at(&view.data, &["status", "conditions"])
            .ok()
            .map(|conditions| {
                conditions.iter().any(|c| {
                    str_at(c, &["type"]) == Field::Found("Processing")
                        && str_at(c, &["status"]) == Field::Found("True")
                })
            })
            .unwrap_or(false);
        if !processing_ok {
            return Ok(Some(InstallPlanOutcome::PendingRemoteStatus));
        }

        let result = &view.data["status"]["result"];
        if str_at(result, &["status", "state"]) != Field::Found("UpgradePending") {
            return Ok(Some(InstallPlanOutcome::CannotApproveNow));
        }
        let plan_name = match str_at(result, &["status", "installplan", "name"]).ok() {
            Some(name) => name.to_string(),
            None => return Ok(Some(InstallPlanOutcome::CannotApproveNow)),
        };
        let plan_ns = match str_at(result, &["metadata", "namespace"]).ok() {
            Some(ns) => ns.to_string(),
            None => return Ok(Some(InstallPlanOutcome::CannotApproveNow)),
        };

        // Approval itself runs on the remote cluster; from here it is one
        // action object patching spec.approved.
        let action_name = format!("{safe_name}-approve");
        let mut action = DynamicObject {
            types: Some(kube::core::TypeMeta {
                api_version: cluster_action_resource().api_version,
                kind: cluster_action_resource().kind,
            }),
            metadata: ObjectMeta {
                name: Some(action_name.clone()),
                namespace: Some(cluster_ns.to_string()),
                labels: view.metadata.labels.clone(),
                ..Default::default()
            },
            data: json!({}),
        };
        action.data = json!({
            "spec": {
                "actionType": "Update",
                "kube": {
                    "resource": "installplan",
                    "name": plan_name,
                    "namespace": plan_ns,
                    "template": {
                        "apiVersion": "operators.coreos.com/v1alpha1",
                        "kind": "InstallPlan",
                        "metadata": {"name": plan_name, "namespace": plan_ns},
                        "spec": {"approved": true},
                    },
                },
            },
        });

        let actions = self.actions(cluster_ns);
        match actions.create(&PostParams::default(), &action).await {
            Ok(_) => {}
            Err(kube::Error::Api(ae)) if ae.code == 409 => {
                // A previous reconcile already created the action; refresh
                // the template so the remote side retries.
                let patch = Patch::Merge(json!({"spec": action.data["spec"]}));
                actions
                    .patch(&action_name, &PatchParams::default(), &patch)
                    .await?;
            }
            Err(e) => return Err(e.into()),
        }

        info!(
            plan = %plan_name,
            namespace = %cluster_ns,
            "requested install plan approval"
        );
        Ok(Some(InstallPlanOutcome::Approved))
    }

    async fn delete_observations(&self, cluster_ns: &str, owner: &str) -> Result<()> {
        let params = ListParams::default().labels(&owner_selector(owner));
        let views = self.views(cluster_ns).list(&params).await?;
        for view in views.items {
            if let Some(name) = view.metadata.name.as_deref() {
                delete_dynamic(&self.views(cluster_ns), name).await?;
            }
        }
        let actions = self.actions(cluster_ns).list(&params).await?;
        for action in actions.items {
            if let Some(name) = action.metadata.name.as_deref() {
                delete_dynamic(&self.actions(cluster_ns), name).await?;
            }
        }
        Ok(())
    }
}
