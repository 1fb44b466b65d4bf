//! ClusterGroupUpgrade reconciliation.
//!
//! One wake-up runs one bounded pass: load the CGU, settle the finalizer,
//! validate, let the backup and pre-caching collaborators run, then dispatch
//! on the phase carried by the Ready condition. The pass never parks waiting
//! for external state; it returns a requeue hint and forward progress comes
//! from re-entry.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use kube::api::{Api, DynamicObject, ListParams};
use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use kube::runtime::{watcher, Controller};
use kube::{Client, Resource, ResourceExt};
use tracing::{debug, error, info, instrument, warn};

use crate::batch::{
    advance_batch_cursors, calculate_batch_timeout, initialize_batch_progress,
    is_upgrade_complete, remediate_current_batch,
};
use crate::blocking::blocking_crs_not_completed;
use crate::clock::{Clock, SystemClock};
use crate::collaborators::{
    backup_in_progress, precache_in_progress, ActionHooks, BackupCollaborator, NoopBackup,
    NoopHooks, NoopPrecache, PrecacheCollaborator, BACKUP_DONE_CONDITION,
};
use crate::crd::{ClusterGroupUpgrade, UpgradePhase};
use crate::events::{actions, reasons, EventPublisher, KubeEventPublisher};
use crate::materialize::{
    clear_placement_rules, delete_owned_resources, materialize_for_upgrade,
};
use crate::plan::build_remediation_plan;
use crate::resolve::{
    clusters_non_compliant_with_any, process_policy_content, resolve_managed_policies,
};
use crate::status;
use crate::stores::{
    CguStore, ClusterRegistry, KubeCguStore, KubeClusterRegistry, KubeObservationStore,
    KubePlacementStore, KubePolicyStore, ObservationStore, PlacementStore, PolicyStore,
};
use crate::validate::{resolve_target_clusters, validate};
use crate::{Result, CLEANUP_FINALIZER};

/// Controller name reported on events and field ownership
pub const CONTROLLER_NAME: &str = "cluster-group-upgrade-controller";

/// Best-effort settle delay before re-reading the CGU, giving the API
/// server a chance to serve the freshest version after recent writes. Not a
/// correctness mechanism; stale reads are handled by conflict retries.
const PRE_READ_SETTLE: Duration = Duration::from_millis(100);

/// When to wake the reconciler again
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RequeueHint {
    /// Wait for a watch event
    None,
    /// Re-enter right away
    Immediate,
    /// Re-enter in about 30 seconds
    Short,
    /// Re-enter in about a minute
    Medium,
    /// Re-enter in about five minutes
    Long,
    /// Re-enter after the given delay
    After(Duration),
}

impl RequeueHint {
    /// Convert the hint to a controller action
    pub fn into_action(self) -> Action {
        match self {
            RequeueHint::None => Action::await_change(),
            RequeueHint::Immediate => Action::requeue(Duration::ZERO),
            RequeueHint::Short => Action::requeue(Duration::from_secs(30)),
            RequeueHint::Medium => Action::requeue(Duration::from_secs(60)),
            RequeueHint::Long => Action::requeue(Duration::from_secs(5 * 60)),
            RequeueHint::After(delay) => Action::requeue(delay),
        }
    }
}

/// Shared state for the reconciler: store handles, collaborators, clock.
pub struct Context {
    /// CGU reads and writes
    pub cgus: Arc<dyn CguStore>,
    /// Policy store
    pub policies: Arc<dyn PolicyStore>,
    /// Placement rule/binding store
    pub placements: Arc<dyn PlacementStore>,
    /// Managed-cluster registry
    pub clusters: Arc<dyn ClusterRegistry>,
    /// Remote observation store
    pub observations: Arc<dyn ObservationStore>,
    /// Backup collaborator
    pub backup: Arc<dyn BackupCollaborator>,
    /// Pre-caching collaborator
    pub precache: Arc<dyn PrecacheCollaborator>,
    /// Pre-/post-action hooks
    pub hooks: Arc<dyn ActionHooks>,
    /// Event publisher
    pub events: Arc<dyn EventPublisher>,
    /// Time source
    pub clock: Arc<dyn Clock>,
}

impl Context {
    /// Create a builder with kube-backed defaults
    pub fn builder(client: Client) -> ContextBuilder {
        ContextBuilder::new(client)
    }
}

/// Builder for [`Context`]; every store can be overridden, missing ones are
/// kube-backed.
pub struct ContextBuilder {
    client: Client,
    backup: Option<Arc<dyn BackupCollaborator>>,
    precache: Option<Arc<dyn PrecacheCollaborator>>,
    hooks: Option<Arc<dyn ActionHooks>>,
    events: Option<Arc<dyn EventPublisher>>,
    clock: Option<Arc<dyn Clock>>,
}

impl ContextBuilder {
    fn new(client: Client) -> Self {
        Self {
            client,
            backup: None,
            precache: None,
            hooks: None,
            events: None,
            clock: None,
        }
    }

    /// Plug in a backup collaborator
    pub fn backup(mut self, backup: Arc<dyn BackupCollaborator>) -> Self {
        self.backup = Some(backup);
        self
    }

    /// Plug in a pre-caching collaborator
    pub fn precache(mut self, precache: Arc<dyn PrecacheCollaborator>) -> Self {
        self.precache = Some(precache);
        self
    }

    /// Plug in an action-hook runner
    pub fn hooks(mut self, hooks: Arc<dyn ActionHooks>) -> Self {
        self.hooks = Some(hooks);
        self
    }

    /// Override the event publisher
    pub fn events(mut self, events: Arc<dyn EventPublisher>) -> Self {
        self.events = Some(events);
        self
    }

    /// Override the clock (tests)
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Build the context
    pub fn build(self) -> Context {
        Context {
            cgus: Arc::new(KubeCguStore::new(self.client.clone())),
            policies: Arc::new(KubePolicyStore::new(self.client.clone())),
            placements: Arc::new(KubePlacementStore::new(self.client.clone())),
            clusters: Arc::new(KubeClusterRegistry::new(self.client.clone())),
            observations: Arc::new(KubeObservationStore::new(self.client.clone())),
            backup: self.backup.unwrap_or_else(|| Arc::new(NoopBackup)),
            precache: self.precache.unwrap_or_else(|| Arc::new(NoopPrecache)),
            hooks: self.hooks.unwrap_or_else(|| Arc::new(NoopHooks)),
            events: self
                .events
                .unwrap_or_else(|| Arc::new(KubeEventPublisher::new(self.client, CONTROLLER_NAME))),
            clock: self.clock.unwrap_or_else(|| Arc::new(SystemClock)),
        }
    }
}

#[cfg(test)]
#[allow(clippy::too_many_arguments)]
impl Context {
    /// Assemble a context from mocks for unit tests
    pub fn for_testing(
        cgus: Arc<dyn CguStore>,
        policies: Arc<dyn PolicyStore>,
        placements: Arc<dyn PlacementStore>,
        clusters: Arc<dyn ClusterRegistry>,
        observations: Arc<dyn ObservationStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            cgus,
            policies,
            placements,
            clusters,
            observations,
            backup: Arc::new(NoopBackup),
            precache: Arc::new(NoopPrecache),
            hooks: Arc::new(NoopHooks),
            events: Arc::new(crate::events::NoopEventPublisher),
            clock,
        }
    }
}

/// Reconcile entry point invoked by the controller runtime.
#[instrument(skip(cgu, ctx), fields(cgu = %cgu.name_any()))]
pub async fn reconcile(cgu: Arc<ClusterGroupUpgrade>, ctx: Arc<Context>) -> Result<Action> {
    info!("start reconciling");
    tokio::time::sleep(PRE_READ_SETTLE).await;

    let name = cgu.name_any();
    let namespace = cgu.namespace().unwrap_or_default();

    // Re-read so the pass works on the freshest CGU the store can serve.
    let Some(mut current) = ctx.cgus.get(&name, &namespace).await? else {
        debug!("CGU deleted before reconcile");
        return Ok(Action::await_change());
    };

    let hint = reconcile_cgu(&ctx, &mut current).await?;
    info!(?hint, "finish reconciling");
    Ok(hint.into_action())
}

/// What the finalizer step decided for this pass
enum FinalizerOutcome {
    /// Continue with the normal flow
    Proceed,
    /// The finalizer was added; re-enter immediately
    Requeue,
    /// Deletion is being handled; stop
    Stop,
}

/// One complete pass over a loaded CGU. Returns the next-reconcile hint.
pub async fn reconcile_cgu(ctx: &Context, cgu: &mut ClusterGroupUpgrade) -> Result<RequeueHint> {
    match handle_finalizer(ctx, cgu).await? {
        FinalizerOutcome::Stop => return Ok(RequeueHint::None),
        FinalizerOutcome::Requeue => return Ok(RequeueHint::Immediate),
        FinalizerOutcome::Proceed => {}
    }

    let clusters = resolve_target_clusters(ctx.clusters.as_ref(), cgu).await?;
    if validate(ctx.clusters.as_ref(), cgu, &clusters).await? {
        status::update_status(ctx.cgus.as_ref(), cgu).await?;
        return Ok(RequeueHint::Immediate);
    }

    let mut hint = RequeueHint::None;

    if cgu.spec.backup {
        ctx.backup.reconcile(cgu).await?;
    }
    if backup_in_progress(cgu) {
        status::update_status(ctx.cgus.as_ref(), cgu).await?;
        return Ok(RequeueHint::Short);
    }

    let backup_settled = cgu
        .status
        .as_ref()
        .map(|s| s.backup.is_none() || s.is_condition_true(BACKUP_DONE_CONDITION))
        .unwrap_or(true);

    if backup_settled {
        if cgu.spec.pre_caching {
            ctx.precache.reconcile(cgu).await?;
        }
        if precache_in_progress(cgu) {
            status::update_status(ctx.cgus.as_ref(), cgu).await?;
            return Ok(RequeueHint::Short);
        }

        match cgu.status_or_default().phase() {
            None => {
                let status = cgu.status.get_or_insert_with(Default::default);
                status.set_ready(
                    UpgradePhase::NotStarted,
                    "The ClusterGroupUpgrade CR is not enabled",
                    ctx.clock.as_ref(),
                );
                hint = RequeueHint::Immediate;
            }
            Some(UpgradePhase::PrecachingRequired) => {
                hint = RequeueHint::Long;
            }
            Some(UpgradePhase::NotStarted) | Some(UpgradePhase::CannotStart) => {
                hint = handle_not_started(ctx, cgu, &clusters).await?;
            }
            Some(UpgradePhase::NotCompleted) => {
                hint = handle_not_completed(ctx, cgu).await?;
            }
            Some(UpgradePhase::TimedOut) => {
                hint = handle_timed_out(ctx, cgu, &clusters).await?;
            }
            Some(UpgradePhase::Completed) => {
                hint = handle_completed(ctx, cgu, &clusters).await?;
            }
        }
    }

    status::update_status(ctx.cgus.as_ref(), cgu).await?;
    Ok(hint)
}

/// Add the cleanup finalizer on fresh CGUs; on deletion, remove the
/// cross-cluster observation objects and release the finalizer.
async fn handle_finalizer(
    ctx: &Context,
    cgu: &mut ClusterGroupUpgrade,
) -> Result<FinalizerOutcome> {
    let has_finalizer = cgu
        .metadata
        .finalizers
        .as_ref()
        .map(|f| f.iter().any(|name| name == CLEANUP_FINALIZER))
        .unwrap_or(false);

    if cgu.metadata.deletion_timestamp.is_some() {
        if has_finalizer {
            let clusters = resolve_target_clusters(ctx.clusters.as_ref(), cgu).await?;
            let owner = format!(
                "{}-{}",
                cgu.namespace().unwrap_or_default(),
                cgu.name_any()
            );
            for cluster in &clusters {
                ctx.observations.delete_observations(cluster, &owner).await?;
            }

            if let Some(finalizers) = cgu.metadata.finalizers.as_mut() {
                finalizers.retain(|name| name != CLEANUP_FINALIZER);
            }
            status::update_spec(ctx.cgus.as_ref(), cgu).await?;
            info!("cleanup finalizer released");
        }
        return Ok(FinalizerOutcome::Stop);
    }

    if !has_finalizer {
        cgu.metadata
            .finalizers
            .get_or_insert_with(Vec::new)
            .push(CLEANUP_FINALIZER.to_string());
        status::update_spec(ctx.cgus.as_ref(), cgu).await?;
        return Ok(FinalizerOutcome::Requeue);
    }

    Ok(FinalizerOutcome::Proceed)
}

/// Pre-start handling: resolve policies, build the plan, materialize the
/// children, then decide whether the upgrade may begin.
async fn handle_not_started(
    ctx: &Context,
    cgu: &mut ClusterGroupUpgrade,
    clusters: &[String],
) -> Result<RequeueHint> {
    let resolution =
        resolve_managed_policies(ctx.policies.as_ref(), cgu, clusters, true).await?;

    if !resolution.all_exist {
        let message = format!(
            "The ClusterGroupUpgrade CR has managed policies that are missing: {:?}",
            resolution.missing
        );
        let status = cgu.status.get_or_insert_with(Default::default);
        status.set_ready(UpgradePhase::CannotStart, message, ctx.clock.as_ref());
        return Ok(RequeueHint::Medium);
    }

    // Plan and materialize before looking at the enable flag, so a disabled
    // CGU still shows what it would do.
    let non_compliant = clusters_non_compliant_with_any(&resolution.present, clusters);
    {
        let status = cgu.status.get_or_insert_with(Default::default);
        let concurrency = status.computed_max_concurrency;
        status.remediation_plan = build_remediation_plan(
            clusters,
            &non_compliant,
            &cgu.spec.remediation_strategy.canaries,
            concurrency,
        );
        info!(plan = ?status.remediation_plan, "remediation plan");
    }

    materialize_for_upgrade(
        ctx.policies.as_ref(),
        ctx.placements.as_ref(),
        cgu,
        &resolution.present,
    )
    .await?;
    process_policy_content(ctx.observations.as_ref(), cgu, &resolution.present, clusters)
        .await?;

    if !cgu.spec.enable {
        let status = cgu.status.get_or_insert_with(Default::default);
        status.set_ready(
            UpgradePhase::NotStarted,
            "The ClusterGroupUpgrade CR is not enabled",
            ctx.clock.as_ref(),
        );
        return Ok(RequeueHint::Long);
    }

    let report = blocking_crs_not_completed(ctx.cgus.as_ref(), cgu).await?;
    if !report.missing.is_empty() {
        let message = format!(
            "The ClusterGroupUpgrade CR has blocking CRs that are missing: {:?}",
            report.missing
        );
        let status = cgu.status.get_or_insert_with(Default::default);
        status.set_ready(UpgradePhase::CannotStart, message, ctx.clock.as_ref());
        return Ok(RequeueHint::Medium);
    }
    if !report.not_completed.is_empty() {
        let message = format!(
            "The ClusterGroupUpgrade CR is blocked by other CRs that have not yet completed: {:?}",
            report.not_completed
        );
        let status = cgu.status.get_or_insert_with(Default::default);
        status.set_ready(UpgradePhase::CannotStart, message, ctx.clock.as_ref());
        return Ok(RequeueHint::Medium);
    }

    ctx.hooks.before_enable(cgu, clusters).await?;

    let status = cgu.status.get_or_insert_with(Default::default);
    if status.remediation_plan.is_empty() {
        status.set_ready(
            UpgradePhase::Completed,
            "The ClusterGroupUpgrade CR has all clusters already compliant with the specified managed policies",
            ctx.clock.as_ref(),
        );
    } else {
        status.set_ready(
            UpgradePhase::NotCompleted,
            "The ClusterGroupUpgrade CR has upgrade policies that are still non compliant",
            ctx.clock.as_ref(),
        );
        status.status.started_at = Some(ctx.clock.now());
    }
    Ok(RequeueHint::Immediate)
}

/// Drive the active batch: cursor advancement, remediation, timeout
/// accounting, and the global completion check on the final batch.
async fn handle_not_completed(
    ctx: &Context,
    cgu: &mut ClusterGroupUpgrade,
) -> Result<RequeueHint> {
    let now = ctx.clock.now();
    let timed_out_message = "The ClusterGroupUpgrade CR policies are taking too long to complete";

    let (plan_len, batch_started_at) = {
        let status = cgu.status.get_or_insert_with(Default::default);
        // The batch index is 1-based from initialization onward; a fresh
        // entry into this phase still carries 0.
        if status.status.current_batch == 0 {
            status.status.current_batch = 1;
        }
        (
            status.remediation_plan.len(),
            status.status.current_batch_started_at,
        )
    };

    let mut hint = match batch_started_at {
        None => RequeueHint::Immediate,
        Some(started) => {
            let deadline = started + chrono::Duration::minutes(5) - now;
            match deadline.to_std() {
                Ok(delay) => RequeueHint::After(delay),
                Err(_) => RequeueHint::After(Duration::from_secs(5 * 60)),
            }
        }
    };

    if batch_started_at.is_none() {
        initialize_batch_progress(cgu, ctx.clock.as_ref());
    }

    {
        let status = cgu.status.get_or_insert_with(Default::default);
        let started_at = status.status.started_at.unwrap_or(now);
        let overall_budget =
            chrono::Duration::minutes(i64::from(cgu.spec.remediation_strategy.timeout));
        if now - started_at > overall_budget {
            status.set_ready(UpgradePhase::TimedOut, timed_out_message, ctx.clock.as_ref());
            return Ok(RequeueHint::Immediate);
        }
    }

    let current_batch = cgu.status_or_default().status.current_batch;
    if current_batch < plan_len {
        let is_batch_complete = advance_batch_cursors(ctx.policies.as_ref(), cgu).await?;

        if is_batch_complete {
            info!(batch = current_batch, "upgrade completed for batch");
            if let Err(e) = clear_placement_rules(ctx.placements.as_ref(), cgu).await {
                warn!(error = %e, "failed to reset placement rules between batches");
            }
            let status = cgu.status.get_or_insert_with(Default::default);
            status.status.current_batch_started_at = None;
            status.status.current_batch += 1;
            return Ok(RequeueHint::Immediate);
        }

        let sooner = remediate_current_batch(
            ctx.placements.as_ref(),
            ctx.observations.as_ref(),
            cgu,
        )
        .await?;
        if sooner {
            hint = RequeueHint::Short;
        }

        let status = cgu.status.get_or_insert_with(Default::default);
        if let (Some(batch_started), Some(started)) = (
            status.status.current_batch_started_at,
            status.status.started_at,
        ) {
            let budget = calculate_batch_timeout(
                cgu.spec.remediation_strategy.timeout,
                plan_len,
                status.status.current_batch,
                batch_started,
                started,
            );
            debug!(budget_minutes = budget.num_minutes(), "batch budget");

            if now - batch_started > budget {
                // Move on right away whatever the timeout action is.
                hint = RequeueHint::Immediate;

                let canaries = &cgu.spec.remediation_strategy.canaries;
                if !canaries.is_empty() && status.status.current_batch <= canaries.len() {
                    info!("canary batch timed out");
                    status.set_ready(
                        UpgradePhase::TimedOut,
                        timed_out_message,
                        ctx.clock.as_ref(),
                    );
                } else {
                    info!("batch timed out");
                    match cgu.spec.batch_timeout_action {
                        crate::crd::BatchTimeoutAction::Abort => {
                            status.set_ready(
                                UpgradePhase::TimedOut,
                                timed_out_message,
                                ctx.clock.as_ref(),
                            );
                        }
                        crate::crd::BatchTimeoutAction::Continue => {
                            status.status.current_batch_started_at = None;
                            if status.status.current_batch < plan_len {
                                status.status.current_batch += 1;
                            }
                        }
                    }
                }
            }
        }
        Ok(hint)
    } else {
        // Final batch: only a global re-check may declare completion.
        if is_upgrade_complete(ctx.policies.as_ref(), cgu).await? {
            let status = cgu.status.get_or_insert_with(Default::default);
            status.set_ready(
                UpgradePhase::Completed,
                "The ClusterGroupUpgrade CR has all clusters compliant with all the managed policies",
                ctx.clock.as_ref(),
            );
            Ok(RequeueHint::Immediate)
        } else {
            let sooner = remediate_current_batch(
                ctx.placements.as_ref(),
                ctx.observations.as_ref(),
                cgu,
            )
            .await?;
            if sooner {
                hint = RequeueHint::Short;
            }
            Ok(hint)
        }
    }
}

/// A timed-out upgrade stops driving: record the warning event and delete
/// the owned children, the remote observation objects included.
async fn handle_timed_out(
    ctx: &Context,
    cgu: &mut ClusterGroupUpgrade,
    clusters: &[String],
) -> Result<RequeueHint> {
    warn!("upgrade timed out");
    ctx.events
        .publish(
            &cgu.object_ref(&()),
            EventType::Warning,
            reasons::UPGRADE_TIMED_OUT,
            actions::RECONCILE,
            Some("The ClusterGroupUpgrade CR policies are taking too long to complete".to_string()),
        )
        .await;

    delete_owned_resources(ctx.policies.as_ref(), ctx.placements.as_ref(), cgu).await?;
    let owner = format!("{}-{}", cgu.namespace().unwrap_or_default(), cgu.name_any());
    for cluster in clusters {
        ctx.observations.delete_observations(cluster, &owner).await?;
    }
    Ok(RequeueHint::None)
}

/// First entry to the completed phase runs post-actions and stamps
/// `completedAt`; later passes are no-ops.
async fn handle_completed(
    ctx: &Context,
    cgu: &mut ClusterGroupUpgrade,
    clusters: &[String],
) -> Result<RequeueHint> {
    let completed_at = cgu.status_or_default().status.completed_at;
    if completed_at.is_none() {
        info!("upgrade is completed");
        {
            let status = cgu.status.get_or_insert_with(Default::default);
            status.status.current_batch = 0;
            status.status.current_batch_started_at = None;
        }
        ctx.hooks.after_completion(cgu, clusters).await?;
        // Completion time is only stamped after post-actions succeed.
        let status = cgu.status.get_or_insert_with(Default::default);
        status.status.completed_at = Some(ctx.clock.now());
    }
    Ok(RequeueHint::None)
}

/// Requeue policy for reconcile errors: the work queue retries with its own
/// backoff, status is deliberately left untouched.
pub fn error_policy(
    cgu: Arc<ClusterGroupUpgrade>,
    error: &crate::Error,
    _ctx: Arc<Context>,
) -> Action {
    warn!(cgu = %cgu.name_any(), error = %error, "reconcile failed");
    Action::requeue(Duration::from_secs(60))
}

/// Start the controller: watch CGUs for spec changes and owned policy
/// copies for status movement.
pub async fn run(client: Client) {
    let cgus = Api::<ClusterGroupUpgrade>::all(client.clone());
    if let Err(e) = cgus.list(&ListParams::default().limit(1)).await {
        error!("CRD is not queryable; {e:?}. Is the CRD installed?");
        info!("Installation: surge --crd | kubectl apply -f -");
        std::process::exit(1);
    }

    let ctx = Arc::new(Context::builder(client.clone()).build());

    let policy_resource = crate::stores::policy_resource();
    let owned_policies: Api<DynamicObject> = Api::all_with(client.clone(), &policy_resource);

    Controller::new(cgus, watcher::Config::default().any_semantic())
        .owns_with(
            owned_policies,
            policy_resource,
            watcher::Config::default().labels(&format!("app={}", crate::APP_LABEL_VALUE)),
        )
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(|result| async move {
            match result {
                Ok(action) => debug!(?action, "reconciliation completed"),
                Err(e) => error!(error = ?e, "reconciliation error"),
            }
        })
        .await;
}
