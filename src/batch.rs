//! Batch driving: cursor advancement, remediation and timeout accounting.
//!
//! Each cluster in the active batch holds a cursor (`policyIndex`) into the
//! resolved policy list. Advancement walks the cursor forward over policies
//! the cluster already satisfies or is not matched with, stopping on the
//! first violation. The batch is done when every cluster has walked off the
//! end of the list.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use kube::ResourceExt;
use tracing::{debug, info};

use crate::clock::Clock;
use crate::crd::{ClusterGroupUpgrade, ClusterRemediationProgress, ClusterState, PolicyContent};
use crate::materialize::{add_clusters_to_rule, placement_desired_name};
use crate::names::{observation_name, SafeNameRegistry};
use crate::object::{cluster_compliance, Compliance};
use crate::resolve::SUBSCRIPTION_KIND;
use crate::stores::{InstallPlanOutcome, ObservationStore, PlacementStore, PolicyStore};
use crate::{Error, Result};

/// The share of the remaining overall budget granted to the current batch.
///
/// Budget spent by earlier batches shrinks what is left; the remainder is
/// split evenly across the batches still to run (the current one included),
/// so later batches never get more than earlier ones did.
pub fn calculate_batch_timeout(
    timeout_minutes: u32,
    num_batches: usize,
    current_batch: usize,
    current_batch_started_at: DateTime<Utc>,
    started_at: DateTime<Utc>,
) -> Duration {
    let remaining_batches = num_batches.saturating_sub(current_batch) + 1;
    let spent_before_batch = current_batch_started_at - started_at;
    let remaining = Duration::minutes(i64::from(timeout_minutes)) - spent_before_batch;
    if remaining <= Duration::zero() {
        return Duration::zero();
    }
    remaining / remaining_batches as i32
}

/// Seed the per-cluster progress map for the batch about to start and stamp
/// its start time.
pub fn initialize_batch_progress(cgu: &mut ClusterGroupUpgrade, clock: &dyn Clock) {
    let status = cgu.status.get_or_insert_with(Default::default);
    let batch_index = status.status.current_batch.saturating_sub(1);
    let Some(batch) = status.remediation_plan.get(batch_index) else {
        return;
    };

    let mut progress = BTreeMap::new();
    for cluster in batch {
        progress.insert(cluster.clone(), ClusterRemediationProgress::default());
    }
    status.status.current_batch_remediation_progress = progress;
    status.status.current_batch_started_at = Some(clock.now());
    debug!(batch = status.status.current_batch, "initialized batch progress");
}

/// Index of the next policy the cluster violates, starting from `start`.
///
/// Compliant and not-matched policies are walked over; the index of the
/// first NonCompliant policy is returned, or the list length when the
/// cluster satisfies everything from `start` on.
pub async fn next_non_compliant_policy(
    policies: &dyn PolicyStore,
    cgu: &ClusterGroupUpgrade,
    cluster: &str,
    start: usize,
) -> Result<usize> {
    let refs = cgu
        .status
        .as_ref()
        .map(|s| s.managed_policies_for_upgrade.as_slice())
        .unwrap_or_default();

    let mut index = start;
    while index < refs.len() {
        let policy_ref = &refs[index];
        let policy = policies
            .get_policy(&policy_ref.name, &policy_ref.namespace)
            .await?
            .ok_or_else(|| {
                Error::child_resource(format!(
                    "managed policy {}/{} disappeared during the upgrade",
                    policy_ref.namespace, policy_ref.name
                ))
            })?;

        match cluster_compliance(&policy, cluster) {
            Compliance::Compliant | Compliance::NotMatched => index += 1,
            Compliance::NonCompliant => break,
        }
    }
    Ok(index)
}

/// Advance every cluster cursor in the active batch.
///
/// Returns true when the batch is done (every cluster Completed). Cursors
/// only move forward; a cluster that regresses on an earlier policy is
/// caught by the last-batch global check, not here.
pub async fn advance_batch_cursors(
    policies: &dyn PolicyStore,
    cgu: &mut ClusterGroupUpgrade,
) -> Result<bool> {
    let (batch_clusters, policy_count) = {
        let status = cgu.status.get_or_insert_with(Default::default);
        let batch_index = status.status.current_batch.saturating_sub(1);
        (
            status
                .remediation_plan
                .get(batch_index)
                .cloned()
                .unwrap_or_default(),
            status.managed_policies_for_upgrade.len(),
        )
    };

    let mut is_batch_complete = true;

    for cluster in &batch_clusters {
        let current_index = {
            let status = cgu.status.as_mut().expect("status initialized above");
            let progress = status
                .status
                .current_batch_remediation_progress
                .entry(cluster.clone())
                .or_default();
            match progress.state {
                ClusterState::Completed => continue,
                ClusterState::NotStarted => {
                    progress.state = ClusterState::InProgress;
                    progress.policy_index = Some(0);
                    0
                }
                ClusterState::InProgress => progress.policy_index.unwrap_or(0),
            }
        };

        let next_index = next_non_compliant_policy(policies, cgu, cluster, current_index).await?;

        let status = cgu.status.as_mut().expect("status initialized above");
        let progress = status
            .status
            .current_batch_remediation_progress
            .entry(cluster.clone())
            .or_default();
        if next_index >= policy_count {
            progress.state = ClusterState::Completed;
            progress.policy_index = None;
        } else {
            is_batch_complete = false;
            progress.policy_index = Some(next_index);
        }
    }

    debug!(is_batch_complete, "advanced batch cursors");
    Ok(is_batch_complete)
}

/// Drive the in-progress clusters of the active batch.
///
/// Widens each targeted policy's placement rule to cover the clusters
/// currently working on it, then attempts install-plan approval for
/// subscription-type policies. Returns true when a remote outcome asks for
/// a short requeue.
pub async fn remediate_current_batch(
    placements: &dyn PlacementStore,
    observations: &dyn ObservationStore,
    cgu: &mut ClusterGroupUpgrade,
) -> Result<bool> {
    update_placement_rules(placements, cgu).await?;
    approve_install_plans(observations, cgu).await
}

/// Group in-progress clusters by their cursor and widen the corresponding
/// placement rules.
async fn update_placement_rules(
    placements: &dyn PlacementStore,
    cgu: &mut ClusterGroupUpgrade,
) -> Result<()> {
    let cgu_name = cgu.name_any();
    let namespace = cgu.namespace().unwrap_or_default();
    let status = cgu.status.get_or_insert_with(Default::default);

    let mut clusters_by_policy: BTreeMap<usize, Vec<String>> = BTreeMap::new();
    for (cluster, progress) in &status.status.current_batch_remediation_progress {
        if progress.state != ClusterState::InProgress {
            continue;
        }
        if let Some(index) = progress.policy_index {
            clusters_by_policy.entry(index).or_default().push(cluster.clone());
        }
    }

    for (index, clusters) in clusters_by_policy {
        let policy_name = status
            .managed_policies_for_upgrade
            .get(index)
            .map(|r| r.name.clone())
            .ok_or_else(|| {
                Error::child_resource(format!("policy index {index} is out of range"))
            })?;
        let desired = placement_desired_name(&cgu_name, &policy_name);
        let safe = SafeNameRegistry::new(&mut status.safe_resource_names)
            .lookup(&desired)
            .map(str::to_string)
            .ok_or_else(|| {
                Error::child_resource(format!(
                    "placement object name {desired} not found in CGU {cgu_name}"
                ))
            })?;
        add_clusters_to_rule(placements, &namespace, &safe, &clusters).await?;
    }

    Ok(())
}

/// Attempt install-plan approval for every in-progress cluster whose current
/// policy embeds subscriptions.
async fn approve_install_plans(
    observations: &dyn ObservationStore,
    cgu: &mut ClusterGroupUpgrade,
) -> Result<bool> {
    let cgu_name = cgu.name_any();
    let status = cgu.status.get_or_insert_with(Default::default);

    let mut reconcile_sooner = false;
    let progress: Vec<(String, usize)> = status
        .status
        .current_batch_remediation_progress
        .iter()
        .filter(|(_, p)| p.state == ClusterState::InProgress)
        .filter_map(|(c, p)| p.policy_index.map(|i| (c.clone(), i)))
        .collect();

    for (cluster, index) in progress {
        let Some(policy_name) = status
            .managed_policies_for_upgrade
            .get(index)
            .map(|r| r.name.clone())
        else {
            continue;
        };

        // A policy without recorded content has nothing to approve.
        let Some(serialized) = status.managed_policies_content.get(&policy_name) else {
            debug!(policy = %policy_name, "no content recorded for policy");
            return Ok(false);
        };
        let content: Vec<PolicyContent> = serde_json::from_str(serialized)
            .map_err(|e| Error::serialization(e.to_string()))?;

        for entry in content.iter().filter(|c| c.kind == SUBSCRIPTION_KIND) {
            let desired = observation_name(&cgu_name, &entry.kind, &entry.name);
            let Some(safe) = SafeNameRegistry::new(&mut status.safe_resource_names)
                .lookup(&desired)
                .map(str::to_string)
            else {
                info!(name = %desired, "observation name missing from the safe-name map");
                continue;
            };

            match observations
                .approve_pending_install_plan(&cluster, &safe)
                .await?
            {
                None => {
                    info!(cluster = %cluster, view = %safe, "observation object not found");
                }
                Some(InstallPlanOutcome::Approved) => {
                    info!(cluster = %cluster, subscription = %entry.name, "install plan approved");
                }
                Some(InstallPlanOutcome::CannotApproveNow) => {
                    info!(cluster = %cluster, subscription = %entry.name, "install plan not approvable yet");
                    reconcile_sooner = true;
                }
                Some(InstallPlanOutcome::PendingRemoteStatus) => {
                    info!(cluster = %cluster, subscription = %entry.name, "remote status still pending");
                    reconcile_sooner = true;
                }
            }
        }
    }

    Ok(reconcile_sooner)
}

/// Global completion check, run while driving the final batch.
///
/// The final batch must be complete *and* every cluster of every earlier
/// batch must still satisfy the whole policy list from index 0. A cluster
/// that regressed mid-run keeps the upgrade in the not-completed phase.
pub async fn is_upgrade_complete(
    policies: &dyn PolicyStore,
    cgu: &mut ClusterGroupUpgrade,
) -> Result<bool> {
    if !advance_batch_cursors(policies, cgu).await? {
        return Ok(false);
    }

    let (plan, policy_count) = {
        let status = cgu.status.get_or_insert_with(Default::default);
        (
            status.remediation_plan.clone(),
            status.managed_policies_for_upgrade.len(),
        )
    };

    // Progress from earlier batches is not retained, so re-run cursor
    // advancement from index 0 for each of their clusters.
    for batch in plan.iter().take(plan.len().saturating_sub(1)) {
        for cluster in batch {
            let next = next_non_compliant_policy(policies, cgu, cluster, 0).await?;
            if next < policy_count {
                info!(cluster = %cluster, "cluster regressed after its batch completed");
                return Ok(false);
            }
        }
    }

    Ok(true)
}
