//! Reconciliation logic for VolumeReplicationGroup resources
//!
//! One invocation loads the group straight from the store, validates it,
//! classifies its claims, runs exactly one state machine branch, and finishes
//! with the condition roll-up and status write.

use std::sync::Arc;
use std::time::{Duration, Instant};

use kube::ResourceExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::backend::{BackendKind, BackendReport, BackendScope, cancellable};
use crate::controller::classification::{ClaimSets, ReplicationClassCache, classify};
use crate::controller::conditions::{
    cluster_data_ready, set_cluster_data_error, set_cluster_data_ready, set_data_error,
};
use crate::controller::context::Context;
use crate::controller::deletion;
use crate::controller::error::{BackoffConfig, Error, Result};
use crate::controller::events::{Severity, reasons as event_reasons};
use crate::controller::state_machine::RolePhase;
use crate::controller::status::{
    StatusWrite, aggregate_conditions, initialize_status, merge_protected_pvcs, needs_requeue,
    prune_protected_pvcs, sync_status,
};
use crate::controller::store::ObjectKey;
use crate::controller::validation::validate;
use crate::crd::{ReplicationState, VolumeReplicationGroup, VolumeReplicationGroupStatus};

/// Finalizer guarding the group until its backends have been cleaned up
pub const FINALIZER: &str = "dr.example.com/vrg-protection";

pub const PVC_LIST_FAILED_MESSAGE: &str = "Failed to get list of pvcs";
pub const FINALIZER_FAILED_MESSAGE: &str = "Failed to add finalizer to VolumeReplicationGroup";
pub const RESTORED_MESSAGE: &str = "Restored PV cluster data";

/// What the work queue should do with a key after a reconcile
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    /// Converged, or waiting for the spec to change
    Done,
    /// Retry with rate-limited backoff
    Requeue,
    /// Retry after a fixed delay
    RequeueAfter(Duration),
}

/// State carried through the phases of one invocation
struct Invocation<'a> {
    ctx: &'a Context,
    token: &'a CancellationToken,
    /// Status as loaded, compared against before writing
    saved: VolumeReplicationGroupStatus,
}

impl Invocation<'_> {
    /// Write status and count the outcome
    async fn write_status(&self, group: &mut VolumeReplicationGroup) -> StatusWrite {
        let write = sync_status(self.ctx.store.as_ref(), group, &self.saved).await;
        if let Some(state) = &self.ctx.health_state {
            state.metrics.record_status_write(write.label());
        }
        write
    }

    /// Write status after an early failure and ask for a retry
    async fn fail_and_requeue(&self, group: &mut VolumeReplicationGroup) -> Result<Outcome> {
        self.write_status(group).await;
        Ok(Outcome::Requeue)
    }

    fn scope<'s>(
        &'s self,
        group: &'s VolumeReplicationGroup,
        sets: &'s ClaimSets,
        kind: BackendKind,
    ) -> BackendScope<'s> {
        BackendScope {
            group,
            claims: match kind {
                BackendKind::Block => &sets.block,
                BackendKind::Snapshot => &sets.snapshot,
            },
            replication_classes: &sets.block_classes,
            token: self.token,
        }
    }
}

/// Main reconciliation function
#[instrument(skip(ctx, token), fields(namespace = %key.namespace, name = %key.name))]
pub async fn reconcile(
    key: ObjectKey,
    ctx: Arc<Context>,
    token: CancellationToken,
) -> Result<Outcome> {
    let start = Instant::now();

    let Some(group) = cancellable(&token, ctx.store.get_group(&key)).await? else {
        debug!("VolumeReplicationGroup not found, nothing to do");
        return Ok(Outcome::Done);
    };

    info!("Reconciling VolumeReplicationGroup");
    let result = process(group, &ctx, &token).await;

    if let Some(state) = &ctx.health_state {
        match &result {
            Ok(_) => state.metrics.record_reconcile(
                &key.namespace,
                &key.name,
                start.elapsed().as_secs_f64(),
            ),
            Err(_) => state.metrics.record_error(&key.namespace, &key.name),
        }
        state.touch_last_reconcile();
    }

    result
}

/// Error policy with exponential backoff per key
pub fn error_policy(key: &ObjectKey, error: &Error, attempt: u32) -> Duration {
    let delay = BackoffConfig::default().delay_for_error(error, attempt);

    if error.is_retryable() {
        warn!(
            "Retryable error for {}: {:?}, requeuing in {:?}",
            key, error, delay
        );
    } else {
        error!(
            "Non-retryable error for {}: {:?}, requeuing in {:?} for manual intervention",
            key, error, delay
        );
    }

    delay
}

async fn process(
    mut group: VolumeReplicationGroup,
    ctx: &Context,
    token: &CancellationToken,
) -> Result<Outcome> {
    let inv = Invocation {
        ctx,
        token,
        saved: group.status.clone().unwrap_or_default(),
    };
    let generation = group.metadata.generation;

    initialize_status(&mut group);

    let spec = match validate(&group) {
        Ok(spec) => spec,
        Err((gate, err)) => {
            error!(error = %err, "Failed to validate VolumeReplicationGroup");
            ctx.events
                .report_once(
                    &group,
                    Severity::Warning,
                    event_reasons::VALIDATION_FAILED,
                    &err.to_string(),
                )
                .await;
            set_data_error(conditions_mut(&mut group), generation, gate.condition_message());

            // No timer: only a spec change can fix this
            return Ok(match inv.write_status(&mut group).await {
                StatusWrite::Failed(_) => Outcome::Requeue,
                _ => Outcome::Done,
            });
        }
    };

    let mut classes = ReplicationClassCache::new();
    let sets = match cancellable(token, classify(ctx.store.as_ref(), &group, &mut classes)).await {
        Ok(sets) => sets,
        Err(Error::Cancelled) => return Err(Error::Cancelled),
        Err(e) => {
            warn!(error = %e, "Failed to classify PersistentVolumeClaims");
            ctx.events
                .report_once(
                    &group,
                    Severity::Warning,
                    event_reasons::PVC_LIST_FAILED,
                    &e.to_string(),
                )
                .await;
            set_data_error(conditions_mut(&mut group), generation, PVC_LIST_FAILED_MESSAGE);
            return inv.fail_and_requeue(&mut group).await;
        }
    };

    let phase = RolePhase::of(&group, spec.desired);
    if let Some(state) = &ctx.health_state {
        state.metrics.record_phase(&phase.to_string());
    }

    match phase {
        RolePhase::Deleting => deletion::finalize(group, &sets, ctx, token).await,
        RolePhase::Primary | RolePhase::Secondary => {
            process_role(&inv, group, &sets, spec.desired, phase).await
        }
    }
}

/// Primary and Secondary entry
async fn process_role(
    inv: &Invocation<'_>,
    mut group: VolumeReplicationGroup,
    sets: &ClaimSets,
    desired: ReplicationState,
    phase: RolePhase,
) -> Result<Outcome> {
    info!(phase = %phase, "Entering processing VolumeReplicationGroup");
    let generation = group.metadata.generation;

    if !has_finalizer(&group) {
        match add_finalizer(inv, &group).await {
            Ok(updated) => group.metadata = updated.metadata,
            Err(Error::Cancelled) => return Err(Error::Cancelled),
            Err(e) => {
                warn!(error = %e, finalizer = FINALIZER, "Failed to add finalizer");
                set_data_error(conditions_mut(&mut group), generation, FINALIZER_FAILED_MESSAGE);
                return inv.fail_and_requeue(&mut group).await;
            }
        }
    }

    if phase.restores_cluster_data() {
        if cluster_data_ready(conditions_mut(&mut group), generation) {
            debug!("ClusterDataReady already True for this generation, skipping restore");
        } else {
            match restore_cluster_data(inv, &group).await {
                Ok(()) => {
                    set_cluster_data_ready(conditions_mut(&mut group), generation, RESTORED_MESSAGE)
                }
                Err(Error::Cancelled) => return Err(Error::Cancelled),
                Err(e) => {
                    warn!(error = %e, "Restoring PVs failed");
                    set_cluster_data_error(
                        conditions_mut(&mut group),
                        generation,
                        &format!("Failed to restore PVs ({})", e),
                    );
                    return inv.fail_and_requeue(&mut group).await;
                }
            }
        }
    }

    let report = run_backends(inv, &group, sets, desired).await?;

    if !report.requeue {
        let (reason, message) = match desired {
            ReplicationState::Primary => (event_reasons::PRIMARY_SUCCESS, "Primary Success"),
            ReplicationState::Secondary => (event_reasons::SECONDARY_SUCCESS, "Secondary Success"),
        };
        inv.ctx
            .events
            .report_once(&group, Severity::Normal, reason, message)
            .await;
    }

    let outcome = finish(inv, group, sets, report).await;
    info!(phase = %phase, outcome = ?outcome, "Exiting processing VolumeReplicationGroup");
    Ok(outcome)
}

/// Snapshot backend first. A primary skips it when it has no claims; a
/// secondary stops there if it is still converging.
async fn run_backends(
    inv: &Invocation<'_>,
    group: &VolumeReplicationGroup,
    sets: &ClaimSets,
    desired: ReplicationState,
) -> Result<BackendReport> {
    let snapshot_scope = inv.scope(group, sets, BackendKind::Snapshot);
    let block_scope = inv.scope(group, sets, BackendKind::Block);
    let mut report = BackendReport::done();

    match desired {
        ReplicationState::Primary => {
            if !sets.snapshot.is_empty() {
                report.merge(
                    backend_step(
                        BackendKind::Snapshot,
                        inv.ctx.snapshot.reconcile_as_primary(&snapshot_scope).await,
                    )?,
                );
            }
            report.merge(backend_step(
                BackendKind::Block,
                inv.ctx.block.reconcile_as_primary(&block_scope).await,
            )?);
        }
        ReplicationState::Secondary => {
            report.merge(backend_step(
                BackendKind::Snapshot,
                inv.ctx.snapshot.reconcile_as_secondary(&snapshot_scope).await,
            )?);
            if report.requeue {
                debug!("Snapshot backend requested requeue, skipping block backend");
            } else {
                report.merge(backend_step(
                    BackendKind::Block,
                    inv.ctx.block.reconcile_as_secondary(&block_scope).await,
                )?);
            }
        }
    }

    Ok(report)
}

/// Fold a backend error into a requeue request; cancellation propagates
pub(crate) fn backend_step(kind: BackendKind, result: Result<BackendReport>) -> Result<BackendReport> {
    match result {
        Ok(report) => Ok(report),
        Err(Error::Cancelled) => Err(Error::Cancelled),
        Err(e) => {
            warn!(backend = %kind, error = %e, "Backend reconcile failed");
            Ok(BackendReport::requeue())
        }
    }
}

/// Roll up conditions, write status, and pick the requeue policy
async fn finish(
    inv: &Invocation<'_>,
    mut group: VolumeReplicationGroup,
    sets: &ClaimSets,
    report: BackendReport,
) -> Outcome {
    {
        let status = group.status.get_or_insert_with(Default::default);
        merge_protected_pvcs(&mut status.protected_pvcs, report.protected_pvcs);
        prune_protected_pvcs(&mut status.protected_pvcs, sets);
    }

    let verdicts = {
        let protected = group
            .status
            .as_ref()
            .map(|s| s.protected_pvcs.as_slice())
            .unwrap_or_default();
        aggregate_conditions(
            inv.ctx.block.as_ref(),
            &inv.scope(&group, sets, BackendKind::Block),
            inv.ctx.snapshot.as_ref(),
            &inv.scope(&group, sets, BackendKind::Snapshot),
            protected,
        )
    };
    for verdict in verdicts {
        conditions_mut(&mut group).upsert_by_type(verdict);
    }

    let write = inv.write_status(&mut group).await;

    if report.requeue || write.failed() || needs_requeue(&group) {
        info!("Requeuing VolumeReplicationGroup");
        Outcome::RequeueAfter(inv.ctx.requeue_delay)
    } else {
        info!("VolumeReplicationGroup converged");
        Outcome::Done
    }
}

/// Restore PV cluster data for the snapshot backend, then the block backend.
///
/// Both must succeed before ClusterDataReady is certified.
async fn restore_cluster_data(inv: &Invocation<'_>, group: &VolumeReplicationGroup) -> Result<()> {
    for kind in [BackendKind::Snapshot, BackendKind::Block] {
        cancellable(inv.token, inv.ctx.metadata.restore_from_backup(group, kind))
            .await
            .map_err(|e| match e {
                Error::Cancelled => Error::Cancelled,
                other => Error::MetadataStoreError(format!(
                    "failed to restore PVs for {} replication ({})",
                    kind, other
                )),
            })?;
    }
    Ok(())
}

fn conditions_mut(group: &mut VolumeReplicationGroup) -> &mut crate::crd::Conditions {
    &mut group.status.get_or_insert_with(Default::default).conditions
}

/// Check if the finalizer is present
pub fn has_finalizer(group: &VolumeReplicationGroup) -> bool {
    group.finalizers().iter().any(|f| f == FINALIZER)
}

/// Add the finalizer, returning the updated object
async fn add_finalizer(
    inv: &Invocation<'_>,
    group: &VolumeReplicationGroup,
) -> Result<VolumeReplicationGroup> {
    let mut desired = group.clone();
    desired.finalizers_mut().push(FINALIZER.to_string());

    let updated = cancellable(inv.token, inv.ctx.store.update_group(&desired)).await?;
    info!("Added finalizer to {}", group.name_any());
    Ok(updated)
}
