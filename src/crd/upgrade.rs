//! ClusterGroupUpgrade Custom Resource Definition
//!
//! A ClusterGroupUpgrade declares one upgrade campaign: which clusters to
//! remediate, which managed policies define the desired state, and the
//! strategy (canaries, concurrency, timeouts) used to roll them out.

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{
    set_condition, BatchTimeoutAction, BlockingCr, Condition, ConditionStatus, ManagedPolicyRef,
    PrecachingStatus, RemediationStrategy, UpgradeActions, UpgradeBackupStatus, UpgradePhase,
    UpgradeProgress, READY_CONDITION,
};
use crate::clock::Clock;

/// Specification for a ClusterGroupUpgrade
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "surge.dev",
    version = "v1alpha1",
    kind = "ClusterGroupUpgrade",
    plural = "clustergroupupgrades",
    shortname = "cgu",
    status = "ClusterGroupUpgradeStatus",
    namespaced,
    printcolumn = r#"{"name":"Ready","type":"string","jsonPath":".status.conditions[?(@.type=='Ready')].reason"}"#,
    printcolumn = r#"{"name":"Batch","type":"integer","jsonPath":".status.status.currentBatch"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ClusterGroupUpgradeSpec {
    /// Explicit cluster targets, unioned with the selector results
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub clusters: Vec<String>,

    /// Legacy label selectors, each `key=value` or bare `key`
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cluster_selector: Vec<String>,

    /// Structured label selectors; preferred over clusterSelector
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cluster_label_selectors: Vec<LabelSelector>,

    /// Managed policies to enforce, in roll-out order
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub managed_policies: Vec<String>,

    /// Batch composition and timing
    #[serde(default)]
    pub remediation_strategy: RemediationStrategy,

    /// What a non-canary batch timeout does to the run
    #[serde(default)]
    pub batch_timeout_action: BatchTimeoutAction,

    /// Gating flag; the upgrade does not start while false
    #[serde(default = "default_enable")]
    pub enable: bool,

    /// CGUs that must reach UpgradeCompleted before this one may start
    #[serde(default, skip_serializing_if = "Vec::is_empty", rename = "blockingCRs")]
    pub blocking_crs: Vec<BlockingCr>,

    /// Pre-/post-action hooks, delegated to the hook collaborator
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actions: Option<UpgradeActions>,

    /// Request a cluster backup before enabling the upgrade
    #[serde(default)]
    pub backup: bool,

    /// Request artifact pre-caching before enabling the upgrade
    #[serde(default)]
    pub pre_caching: bool,
}

fn default_enable() -> bool {
    true
}

impl Default for ClusterGroupUpgradeSpec {
    fn default() -> Self {
        Self {
            clusters: Vec::new(),
            cluster_selector: Vec::new(),
            cluster_label_selectors: Vec::new(),
            managed_policies: Vec::new(),
            remediation_strategy: RemediationStrategy::default(),
            batch_timeout_action: BatchTimeoutAction::default(),
            enable: default_enable(),
            blocking_crs: Vec::new(),
            actions: None,
            backup: false,
            pre_caching: false,
        }
    }
}

/// Status for a ClusterGroupUpgrade
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterGroupUpgradeStatus {
    /// Conditions; "Ready" carries the phase in its reason
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    /// Ordered batches of cluster names still requiring remediation
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub remediation_plan: Vec<Vec<String>>,

    /// Policies actually used for the upgrade, in spec order
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub managed_policies_for_upgrade: Vec<ManagedPolicyRef>,

    /// Resolved namespace per managed policy name
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub managed_policies_ns: BTreeMap<String, String>,

    /// Policies excluded because every target cluster was already compliant
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub managed_policies_compliant_before_upgrade: Vec<String>,

    /// Per-policy serialized list of embedded subscription descriptors
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub managed_policies_content: BTreeMap<String, String>,

    /// Desired resource name -> actual (possibly truncated) safe name
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub safe_resource_names: BTreeMap<String, String>,

    /// Observed placement rule child names
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub placement_rules: Vec<String>,

    /// Observed placement binding child names
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub placement_bindings: Vec<String>,

    /// Observed enforcing policy copy names
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub copied_policies: Vec<String>,

    /// Effective batch concurrency after clamping to the target set size
    #[serde(default)]
    pub computed_max_concurrency: usize,

    /// Run-level timestamps and the per-batch cursor
    #[serde(default)]
    pub status: UpgradeProgress,

    /// Backup collaborator sub-status
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup: Option<UpgradeBackupStatus>,

    /// Pre-caching collaborator sub-status
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub precaching: Option<PrecachingStatus>,
}

impl ClusterGroupUpgradeStatus {
    /// The Ready condition, if one has been set
    pub fn ready_condition(&self) -> Option<&Condition> {
        self.conditions.iter().find(|c| c.type_ == READY_CONDITION)
    }

    /// The phase encoded in the Ready condition's reason
    pub fn phase(&self) -> Option<UpgradePhase> {
        self.ready_condition()
            .and_then(|c| UpgradePhase::from_reason(&c.reason))
    }

    /// Set the Ready condition to the given phase and message.
    ///
    /// The condition status is True only for the completed phase.
    pub fn set_ready(&mut self, phase: UpgradePhase, message: impl Into<String>, clock: &dyn Clock) {
        let status = if phase == UpgradePhase::Completed {
            ConditionStatus::True
        } else {
            ConditionStatus::False
        };
        set_condition(
            &mut self.conditions,
            Condition {
                type_: READY_CONDITION.to_string(),
                status,
                reason: phase.as_reason().to_string(),
                message: Some(message.into()),
                last_transition_time: None,
            },
            clock.now(),
        );
    }

    /// True while a named condition holds
    pub fn is_condition_true(&self, type_: &str) -> bool {
        self.conditions
            .iter()
            .any(|c| c.type_ == type_ && c.status == ConditionStatus::True)
    }
}

impl ClusterGroupUpgrade {
    /// Status, defaulting when none has been written yet
    pub fn status_or_default(&self) -> ClusterGroupUpgradeStatus {
        self.status.clone().unwrap_or_default()
    }

    /// The policy ref at `index` in the resolved upgrade list
    pub fn managed_policy_at(&self, index: usize) -> Option<&ManagedPolicyRef> {
        self.status
            .as_ref()
            .and_then(|s| s.managed_policies_for_upgrade.get(index))
    }
}
