//! Custom Resource Definitions for Surge
//!
//! The ClusterGroupUpgrade CRD and its supporting types.

mod types;
mod upgrade;

pub use types::{
    BatchTimeoutAction, BlockingCr, ClusterRemediationProgress, ClusterState, Condition,
    ConditionStatus, HookLabels, ManagedPolicyRef, PolicyContent, PrecachingStatus,
    RemediationStrategy, UpgradeActions, UpgradeBackupStatus, UpgradePhase, UpgradeProgress,
    READY_CONDITION,
};
pub use upgrade::{ClusterGroupUpgrade, ClusterGroupUpgradeSpec, ClusterGroupUpgradeStatus};
