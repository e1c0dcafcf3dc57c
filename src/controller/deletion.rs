//! Deletion protocol
//!
//! Runs once `deletionTimestamp` is set. Each backend releases its per-claim
//! resources; only when both report completion is the backup removed and the
//! group's finalizer dropped. Status is not written on this path.

use kube::ResourceExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backend::{BackendKind, BackendReport, BackendScope, cancellable};
use crate::controller::classification::ClaimSets;
use crate::controller::context::Context;
use crate::controller::error::{Error, Result};
use crate::controller::events::{Severity, reasons as event_reasons};
use crate::controller::reconciler::{FINALIZER, Outcome, backend_step, has_finalizer};
use crate::crd::{ReplicationState, VolumeReplicationGroup};

/// Drive a terminating group to the point where it may be removed
pub async fn finalize(
    group: VolumeReplicationGroup,
    sets: &ClaimSets,
    ctx: &Context,
    token: &CancellationToken,
) -> Result<Outcome> {
    if !has_finalizer(&group) {
        debug!("Finalizer already removed, nothing to do");
        return Ok(Outcome::Done);
    }

    info!(
        block = sets.block.len(),
        snapshot = sets.snapshot.len(),
        "Releasing replication resources for deletion"
    );

    let report = release_backends(&group, sets, ctx, token).await?;
    if report.requeue {
        info!("Backends still releasing resources, requeuing");
        return Ok(Outcome::Requeue);
    }

    if group.spec.desired_state() == Some(ReplicationState::Primary) {
        match cancellable(token, ctx.metadata.delete_backup(&group)).await {
            Ok(()) => debug!("Deleted cluster metadata backup"),
            Err(Error::Cancelled) => return Err(Error::Cancelled),
            Err(e) => {
                warn!(error = %e, "Failed to delete cluster metadata backup");
                return Ok(Outcome::Requeue);
            }
        }
    }

    match remove_finalizer(&group, ctx, token).await {
        Ok(()) => {}
        Err(Error::Cancelled) => return Err(Error::Cancelled),
        Err(e) => {
            warn!(error = %e, finalizer = FINALIZER, "Failed to remove finalizer");
            return Ok(Outcome::Requeue);
        }
    }

    ctx.events
        .report_once(
            &group,
            Severity::Normal,
            event_reasons::DELETE_SUCCESS,
            "Deletion Success",
        )
        .await;

    Ok(Outcome::Done)
}

/// Ask the snapshot backend, then the block backend, to let go of their claims
async fn release_backends(
    group: &VolumeReplicationGroup,
    sets: &ClaimSets,
    ctx: &Context,
    token: &CancellationToken,
) -> Result<BackendReport> {
    let mut report = BackendReport::done();

    for (kind, backend, claims) in [
        (BackendKind::Snapshot, &ctx.snapshot, &sets.snapshot),
        (BackendKind::Block, &ctx.block, &sets.block),
    ] {
        let scope = BackendScope {
            group,
            claims,
            replication_classes: &sets.block_classes,
            token,
        };
        report.merge(backend_step(kind, backend.reconcile_for_deletion(&scope).await)?);
    }

    Ok(report)
}

async fn remove_finalizer(
    group: &VolumeReplicationGroup,
    ctx: &Context,
    token: &CancellationToken,
) -> Result<()> {
    let mut desired = group.clone();
    desired.finalizers_mut().retain(|f| f != FINALIZER);

    cancellable(token, ctx.store.update_group(&desired)).await?;
    info!("Removed finalizer from {}", group.name_any());
    Ok(())
}
