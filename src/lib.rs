pub mod backend;
pub mod config;
pub mod controller;
pub mod crd;
pub mod health;
pub mod metadata;

pub use config::{ConfigError, OperatorConfig};
pub use controller::{
    BackoffConfig, Context, Error, FINALIZER, ObjectKey, Outcome, Result, error_policy, reconcile,
};
pub use crd::{VolumeReplication, VolumeReplicationClass, VolumeReplicationGroup};
pub use health::{HealthState, Metrics};

use std::sync::Arc;

use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::controller::predicate::{
    ClaimEventTracker, GroupGenerations, groups_for_claim, should_enqueue,
};
use crate::controller::queue::{WorkQueue, run_workers};

/// Run the VolumeReplicationGroup controller until `token` is cancelled.
///
/// Groups are enqueued on any change; a new generation or a deletion also
/// cancels the reconcile running for the group. Claim changes enqueue the groups whose
/// selector matches the claim, filtered by the claim predicate. Changes to a
/// VolumeReplication enqueue its owning group.
pub async fn run_controller(ctx: Arc<Context>, config: &OperatorConfig, token: CancellationToken) {
    let scope_msg = config.watch_namespace.as_deref().unwrap_or("cluster-wide");
    info!(
        "Starting controller for VolumeReplicationGroup resources (scope: {})",
        scope_msg
    );

    let queue = WorkQueue::default();

    let watches = [
        tokio::spawn(watch_groups(ctx.clone(), queue.clone(), token.clone())),
        tokio::spawn(watch_claims(ctx.clone(), queue.clone(), token.clone())),
        tokio::spawn(watch_volume_replications(
            ctx.clone(),
            queue.clone(),
            token.clone(),
        )),
    ];

    if let Some(ref state) = ctx.health_state {
        state.set_ready(true).await;
    }

    let handler = {
        let ctx = ctx.clone();
        let queue = queue.clone();
        move |key: ObjectKey, token: CancellationToken| {
            let ctx = ctx.clone();
            if let Some(state) = &ctx.health_state {
                state.metrics.set_queue_depth(queue.len() as i64);
            }
            async move { reconcile(key, ctx, token).await }
        }
    };
    run_workers(queue, config.max_concurrent_reconciles, token, handler).await;

    for watch in watches {
        if let Err(e) = watch.await {
            warn!("Watch task failed: {}", e);
        }
    }

    if let Some(ref state) = ctx.health_state {
        state.set_ready(false).await;
    }
    info!("Controller stopped");
}

async fn watch_groups(ctx: Arc<Context>, queue: WorkQueue, token: CancellationToken) {
    let mut generations = GroupGenerations::new();
    let mut events = Box::pin(ctx.store.watch_groups().take_until(token.cancelled_owned()));

    while let Some(event) = events.next().await {
        let Some(change) = generations.observe(&event) else {
            continue;
        };
        if change.supersedes && queue.supersede(&change.key) {
            debug!(group = %change.key, "Superseded in-flight reconcile");
        }
        queue.add(change.key);
    }
    debug!("VolumeReplicationGroup watch stopped");
}

async fn watch_claims(ctx: Arc<Context>, queue: WorkQueue, token: CancellationToken) {
    let mut tracker = ClaimEventTracker::new();
    let mut events = Box::pin(ctx.store.watch_claims().take_until(token.cancelled_owned()));

    while let Some(event) = events.next().await {
        let Some(event) = tracker.observe(event) else {
            continue;
        };
        if !should_enqueue(&event) {
            continue;
        }

        let claim = event.claim();
        let Some(namespace) = claim.metadata.namespace.as_deref() else {
            continue;
        };
        let groups = match ctx.store.list_groups(namespace).await {
            Ok(groups) => groups,
            Err(e) => {
                warn!(namespace, error = %e, "Failed to list VolumeReplicationGroups for PVC event");
                continue;
            }
        };
        for key in groups_for_claim(claim, &groups) {
            debug!(group = %key, "PVC change enqueued group");
            queue.add(key);
        }
    }
    debug!("PVC watch stopped");
}

async fn watch_volume_replications(ctx: Arc<Context>, queue: WorkQueue, token: CancellationToken) {
    let mut events = Box::pin(
        ctx.store
            .watch_volume_replications()
            .take_until(token.cancelled_owned()),
    );

    while let Some(event) = events.next().await {
        let Some(replication) = event.object() else {
            continue;
        };
        let Some(namespace) = replication.metadata.namespace.as_deref() else {
            continue;
        };
        for owner in replication.metadata.owner_references.iter().flatten() {
            if owner.kind == "VolumeReplicationGroup" {
                queue.add(ObjectKey::new(namespace, owner.name.as_str()));
            }
        }
    }
    debug!("VolumeReplication watch stopped");
}
