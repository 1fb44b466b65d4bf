//! Delegated collaborators: backup, pre-caching and action hooks.
//!
//! The reconcile engine never performs these itself. It invokes the
//! collaborator before enabling an upgrade, then inspects the sub-status the
//! collaborator left on the CGU to decide whether to wait. The default
//! implementations are inert, for deployments running without those
//! subsystems.

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;

use crate::crd::ClusterGroupUpgrade;
use crate::Result;

/// Backup sub-states the dispatcher treats as still running
pub mod backup_states {
    /// Work is queued but has not begun
    pub const PREPARING_TO_START: &str = "PreparingToStart";
    /// The backup job is being created
    pub const STARTING: &str = "Starting";
    /// The backup job is running
    pub const ACTIVE: &str = "Active";
    /// The backup finished successfully
    pub const SUCCEEDED: &str = "Succeeded";
}

/// Condition type the backup collaborator sets once every cluster succeeded
pub const BACKUP_DONE_CONDITION: &str = "BackupDone";

/// Pre-cache sub-states the dispatcher treats as still running
pub mod precache_states {
    /// Work is queued but has not begun
    pub const PREPARING_TO_START: &str = "PreparingToStart";
    /// The pre-cache job is being created
    pub const STARTING: &str = "Starting";
    /// The pre-cache job is running
    pub const ACTIVE: &str = "Active";
    /// The pre-cache finished successfully
    pub const DONE: &str = "Done";
}

/// Cluster backup subsystem, invoked before the upgrade is enabled
#[cfg_attr(test, automock)]
#[async_trait]
pub trait BackupCollaborator: Send + Sync {
    /// Advance backup work for this CGU and refresh `status.backup`
    async fn reconcile(&self, cgu: &mut ClusterGroupUpgrade) -> Result<()>;
}

/// Artifact pre-caching subsystem, invoked before the upgrade is enabled
#[cfg_attr(test, automock)]
#[async_trait]
pub trait PrecacheCollaborator: Send + Sync {
    /// Advance pre-cache work for this CGU and refresh `status.precaching`
    async fn reconcile(&self, cgu: &mut ClusterGroupUpgrade) -> Result<()>;
}

/// User-declared pre-/post-action hooks
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ActionHooks: Send + Sync {
    /// Runs after validation, immediately before the upgrade starts
    async fn before_enable(&self, cgu: &ClusterGroupUpgrade, clusters: &[String]) -> Result<()>;

    /// Runs once, on first entry to the completed phase; `completedAt` is
    /// only stamped after this succeeds
    async fn after_completion(&self, cgu: &ClusterGroupUpgrade, clusters: &[String])
        -> Result<()>;
}

/// Inert backup collaborator for deployments without a backup subsystem
pub struct NoopBackup;

#[async_trait]
impl BackupCollaborator for NoopBackup {
    async fn reconcile(&self, _cgu: &mut ClusterGroupUpgrade) -> Result<()> {
        Ok(())
    }
}

/// Inert pre-cache collaborator for deployments without pre-caching
pub struct NoopPrecache;

#[async_trait]
impl PrecacheCollaborator for NoopPrecache {
    async fn reconcile(&self, _cgu: &mut ClusterGroupUpgrade) -> Result<()> {
        Ok(())
    }
}

/// Inert hook runner for CGUs without declared actions
pub struct NoopHooks;

#[async_trait]
impl ActionHooks for NoopHooks {
    async fn before_enable(&self, _cgu: &ClusterGroupUpgrade, _clusters: &[String]) -> Result<()> {
        Ok(())
    }

    async fn after_completion(
        &self,
        _cgu: &ClusterGroupUpgrade,
        _clusters: &[String],
    ) -> Result<()> {
        Ok(())
    }
}

/// True while any backup sub-state still counts as running
pub fn backup_in_progress(cgu: &ClusterGroupUpgrade) -> bool {
    cgu.status
        .as_ref()
        .and_then(|s| s.backup.as_ref())
        .map(|b| {
            b.status.values().any(|v| {
                v == backup_states::PREPARING_TO_START
                    || v == backup_states::STARTING
                    || v == backup_states::ACTIVE
            })
        })
        .unwrap_or(false)
}

/// True while any pre-cache sub-state still counts as running
pub fn precache_in_progress(cgu: &ClusterGroupUpgrade) -> bool {
    cgu.status
        .as_ref()
        .and_then(|s| s.precaching.as_ref())
        .map(|p| {
            p.status.values().any(|v| {
                v == precache_states::PREPARING_TO_START || v == precache_states::STARTING
            })
        })
        .unwrap_or(false)
}
