//! Supporting types for the ClusterGroupUpgrade CRD

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// The distinguished condition carrying the upgrade phase in its reason
pub const READY_CONDITION: &str = "Ready";

/// Phase of an upgrade, encoded as the reason of the Ready condition
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UpgradePhase {
    /// The CGU exists but is not enabled or has not begun validation
    NotStarted,
    /// Prerequisites are unmet (missing policies, blocking CGUs, invalid spec)
    CannotStart,
    /// Pre-caching was requested and has not finished
    PrecachingRequired,
    /// Batches are being driven toward compliance
    NotCompleted,
    /// Every cluster in every batch reached compliance
    Completed,
    /// The overall or canary budget was exceeded
    TimedOut,
}

impl UpgradePhase {
    /// The reason string persisted on the Ready condition
    pub fn as_reason(&self) -> &'static str {
        match self {
            Self::NotStarted => "UpgradeNotStarted",
            Self::CannotStart => "CannotStart",
            Self::PrecachingRequired => "PrecachingRequired",
            Self::NotCompleted => "UpgradeNotCompleted",
            Self::Completed => "UpgradeCompleted",
            Self::TimedOut => "UpgradeTimedOut",
        }
    }

    /// Parse a persisted reason string back into a phase
    pub fn from_reason(reason: &str) -> Option<Self> {
        match reason {
            "UpgradeNotStarted" => Some(Self::NotStarted),
            "CannotStart" => Some(Self::CannotStart),
            "PrecachingRequired" => Some(Self::PrecachingRequired),
            "UpgradeNotCompleted" => Some(Self::NotCompleted),
            "UpgradeCompleted" => Some(Self::Completed),
            "UpgradeTimedOut" => Some(Self::TimedOut),
            _ => None,
        }
    }

    /// True once no further plan or progress mutation is allowed
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::TimedOut)
    }
}

impl std::fmt::Display for UpgradePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_reason())
    }
}

/// Status values for a condition
#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ConditionStatus {
    /// The condition holds
    True,
    /// The condition does not hold
    False,
    /// The condition state cannot be determined
    Unknown,
}

/// A single condition on the CGU status
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Condition type (e.g. "Ready")
    #[serde(rename = "type")]
    pub type_: String,

    /// Whether the condition holds
    pub status: ConditionStatus,

    /// Machine-readable reason; for Ready this is the phase
    pub reason: String,

    /// Human-readable message
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// When the condition status last flipped
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<DateTime<Utc>>,
}

/// Set or update a condition in place.
///
/// The transition time is bumped only when the status value actually flips,
/// so repeated reconciles with unchanged state leave it alone.
pub fn set_condition(conditions: &mut Vec<Condition>, mut condition: Condition, now: DateTime<Utc>) {
    if let Some(existing) = conditions.iter_mut().find(|c| c.type_ == condition.type_) {
        if existing.status == condition.status {
            condition.last_transition_time = existing.last_transition_time;
        } else {
            condition.last_transition_time = Some(now);
        }
        *existing = condition;
    } else {
        condition.last_transition_time = Some(now);
        conditions.push(condition);
    }
}

/// How clusters are grouped and bounded during remediation
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RemediationStrategy {
    /// Upper bound on clusters remediated in parallel; <= 0 means unlimited
    #[serde(default)]
    pub max_concurrency: i32,

    /// Clusters remediated alone, before any normal batch, in this order
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub canaries: Vec<String>,

    /// Overall budget in minutes for the whole upgrade
    #[serde(default = "default_timeout")]
    pub timeout: u32,
}

impl Default for RemediationStrategy {
    fn default() -> Self {
        Self {
            max_concurrency: 0,
            canaries: Vec::new(),
            timeout: default_timeout(),
        }
    }
}

fn default_timeout() -> u32 {
    240
}

/// What happens to the run when a non-canary batch exceeds its budget
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum BatchTimeoutAction {
    /// Move on to the next batch; the last-batch check settles the outcome
    #[default]
    Continue,
    /// Fail the whole upgrade
    Abort,
}

/// Reference to a CGU that must complete before this one may start
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct BlockingCr {
    /// Name of the blocking CGU
    pub name: String,
    /// Namespace of the blocking CGU
    pub namespace: String,
}

/// Cluster-label mutations a hook applies
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HookLabels {
    /// Labels to add to each target cluster
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub add_cluster_labels: BTreeMap<String, String>,

    /// Label keys to remove from each target cluster
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub delete_cluster_labels: Vec<String>,
}

/// Pre-/post-action hooks, opaque to the reconcile engine
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UpgradeActions {
    /// Applied after validation, right before the upgrade is enabled
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub before_enable: Option<HookLabels>,

    /// Applied once, on first entry to the completed phase
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub after_completion: Option<HookLabels>,
}

/// A managed policy retained for the upgrade, with its resolved namespace
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ManagedPolicyRef {
    /// Policy name
    pub name: String,
    /// Namespace the parent policy lives in
    pub namespace: String,
}

/// One embedded object descriptor extracted from a policy's templates
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PolicyContent {
    /// Object kind (only Subscription entries are recorded)
    pub kind: String,
    /// Object name
    pub name: String,
    /// Object namespace
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

/// Remediation state of one cluster within the active batch
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ClusterState {
    /// The cluster has not been picked up yet this batch
    #[default]
    NotStarted,
    /// The cluster is working through the policy list
    InProgress,
    /// The cluster is compliant with every managed policy
    Completed,
}

/// Per-cluster cursor within the active batch
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterRemediationProgress {
    /// Current remediation state
    #[serde(default)]
    pub state: ClusterState,

    /// Index into managedPoliciesForUpgrade; present iff InProgress
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy_index: Option<usize>,
}

/// Timestamps and cursors describing the run itself
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UpgradeProgress {
    /// When the upgrade left UpgradeNotStarted; set exactly once
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,

    /// When the upgrade reached a terminal phase with post-actions done
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,

    /// 1-based index of the batch being driven; 0 before and after the run
    #[serde(default)]
    pub current_batch: usize,

    /// When the active batch started; cleared between batches
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_batch_started_at: Option<DateTime<Utc>>,

    /// Cluster name -> cursor for the active batch
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub current_batch_remediation_progress: BTreeMap<String, ClusterRemediationProgress>,
}

/// Sub-status owned by the backup collaborator
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UpgradeBackupStatus {
    /// Cluster name -> backup state string
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub status: BTreeMap<String, String>,

    /// When the backup pass started
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
}

/// Sub-status owned by the pre-caching collaborator
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PrecachingStatus {
    /// Cluster name -> pre-cache state string
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub status: BTreeMap<String, String>,

    /// Clusters selected for pre-caching
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub clusters: Vec<String>,
}
