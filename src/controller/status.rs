//! Condition aggregation and the status write
//!
//! The reconciler owns `status` outright. Backends hand back per-claim records
//! which are merged here, the summary conditions are rolled up from them, and
//! the result is written at most once per reconcile.

use chrono::Utc;
use kube::ResourceExt;
use tracing::{debug, info, warn};

use crate::backend::{BackendScope, ReplicationBackend};
use crate::controller::conditions::{
    condition_types, reasons, required_conditions_ready, set_initial_conditions,
};
use crate::controller::classification::ClaimSets;
use crate::controller::error::Error;
use crate::controller::store::Store;
use crate::crd::{
    Condition, GroupState, ProtectedPvc, ReplicationState, VolumeReplicationGroup,
    VolumeReplicationGroupStatus,
};

pub const INITIALIZING_MESSAGE: &str = "Initializing VolumeReplicationGroup";

/// What the status write step did
#[derive(Debug)]
pub enum StatusWrite {
    /// Status matched the snapshot, nothing sent
    Unchanged,
    /// Status written; carries the object returned by the server
    Written(Box<VolumeReplicationGroup>),
    Failed(Error),
}

impl StatusWrite {
    pub fn failed(&self) -> bool {
        matches!(self, StatusWrite::Failed(_))
    }

    pub fn label(&self) -> &'static str {
        match self {
            StatusWrite::Unchanged => "skipped",
            StatusWrite::Written(_) => "written",
            StatusWrite::Failed(_) => "failed",
        }
    }
}

/// Give a group seen for the first time Unknown summary conditions
pub fn initialize_status(group: &mut VolumeReplicationGroup) {
    let generation = group.metadata.generation;
    let status = group.status.get_or_insert_with(Default::default);
    if status.conditions.is_empty() {
        set_initial_conditions(&mut status.conditions, generation, INITIALIZING_MESSAGE);
    }
}

/// Upsert per-claim records by name, keeping the list ordered by name.
///
/// Condition transition times survive when a claim's condition status is
/// unchanged.
pub fn merge_protected_pvcs(existing: &mut Vec<ProtectedPvc>, records: Vec<ProtectedPvc>) {
    for record in records {
        match existing.iter_mut().find(|p| p.name == record.name) {
            Some(current) => {
                current.protected_by_snapshot = record.protected_by_snapshot;
                current.storage_class_name = record.storage_class_name;
                current.replication_class_name = record.replication_class_name;
                for condition in record.conditions.iter().cloned() {
                    current.conditions.upsert_by_type(condition);
                }
            }
            None => existing.push(record),
        }
    }
    existing.sort_by(|a, b| a.name.cmp(&b.name));
}

/// Drop records of claims the group no longer selects, so a claim recreated
/// under the same name starts without a stale record
pub fn prune_protected_pvcs(existing: &mut Vec<ProtectedPvc>, sets: &ClaimSets) {
    existing.retain(|record| {
        let selected = sets
            .block
            .iter()
            .chain(&sets.snapshot)
            .any(|claim| claim.name_any() == record.name);
        if !selected {
            debug!(pvc = %record.name, "Dropping protection record of unselected PVC");
        }
        selected
    });
}

/// Summary verdict for each aggregated condition type.
///
/// The snapshot backend's roll-up is computed first; when the block backend
/// has claims its roll-up replaces it.
pub fn aggregate_conditions(
    block: &dyn ReplicationBackend,
    block_scope: &BackendScope<'_>,
    snapshot: &dyn ReplicationBackend,
    snapshot_scope: &BackendScope<'_>,
    protected: &[ProtectedPvc],
) -> Vec<Condition> {
    condition_types::AGGREGATED
        .into_iter()
        .map(|type_| {
            let mut verdict = snapshot.aggregate_condition(type_, snapshot_scope, protected);
            if !block_scope.claims.is_empty() {
                verdict = block.aggregate_condition(type_, block_scope, protected);
            }
            verdict
        })
        .collect()
}

/// Mirror the desired role into `status.state` once DataReady is True
pub fn derive_state(status: &mut VolumeReplicationGroupStatus, desired: Option<ReplicationState>) {
    let Some(ready) = status.conditions.find_by_type(condition_types::DATA_READY) else {
        debug!("DataReady condition missing, leaving state unchanged");
        return;
    };

    let target = desired.map_or(GroupState::Unknown, |d| d.status_state());

    if ready.is_true() {
        status.state = target;
    } else if ready.reason == reasons::ERROR || desired.is_none() {
        status.state = GroupState::Unknown;
    }
}

/// Write status if it differs from the snapshot taken at reconcile start
pub async fn sync_status(
    store: &dyn Store,
    group: &mut VolumeReplicationGroup,
    saved: &VolumeReplicationGroupStatus,
) -> StatusWrite {
    let desired = group.spec.desired_state();
    let generation = group.metadata.generation;
    let status = group.status.get_or_insert_with(Default::default);

    derive_state(status, desired);
    status.observed_generation = generation;

    if *status == *saved {
        debug!("Status unchanged, skipping write");
        return StatusWrite::Unchanged;
    }

    status.last_update_time = Some(Utc::now().to_rfc3339());

    match store.update_group_status(group).await {
        Ok(updated) => {
            info!(state = %updated.status.as_ref().map(|s| s.state).unwrap_or_default(), "Updated status");
            StatusWrite::Written(Box::new(updated))
        }
        Err(e) => {
            warn!(error = %e, "Failed to update status");
            StatusWrite::Failed(e)
        }
    }
}

/// True unless every aggregated condition is True for the current generation
pub fn needs_requeue(group: &VolumeReplicationGroup) -> bool {
    let generation = group.metadata.generation;
    group
        .status
        .as_ref()
        .is_none_or(|s| !required_conditions_ready(&s.conditions, generation))
}
