//! Replication backends
//!
//! A VolumeReplicationGroup delegates each of its claims to one of two
//! backends: block replication through CSI `VolumeReplication` resources, or
//! snapshot based replication. Backends drive their own per-claim resources and
//! report what they observed; the reconciler owns the group status and folds
//! the reports into it.

pub mod block;
pub mod rollup;
pub mod unavailable;

use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::PersistentVolumeClaim;
use tokio_util::sync::CancellationToken;

use crate::controller::error::{Error, Result};
use crate::crd::{Condition, ProtectedPvc, ReplicationState, VolumeReplicationGroup};

pub use block::VolumeReplicationBackend;
pub use unavailable::UnavailableBackend;

/// Which of the two backends a claim is routed to
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BackendKind {
    /// Block level replication via VolumeReplication resources
    Block,
    /// Snapshot based replication
    Snapshot,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::Block => write!(f, "block"),
            BackendKind::Snapshot => write!(f, "snapshot"),
        }
    }
}

/// Inputs handed to a backend for one reconcile invocation
#[derive(Clone, Copy)]
pub struct BackendScope<'a> {
    pub group: &'a VolumeReplicationGroup,
    /// Claims routed to this backend, ordered by name
    pub claims: &'a [PersistentVolumeClaim],
    /// Claim name to the VolumeReplicationClass matching its provisioner
    pub replication_classes: &'a BTreeMap<String, String>,
    /// Cancelled on shutdown or when the invocation is superseded
    pub token: &'a CancellationToken,
}

impl BackendScope<'_> {
    pub fn desired_state(&self) -> Option<ReplicationState> {
        self.group.spec.desired_state()
    }

    pub fn generation(&self) -> Option<i64> {
        self.group.metadata.generation
    }

    /// Fail fast once the invocation has been cancelled
    pub fn check_cancelled(&self) -> Result<()> {
        if self.token.is_cancelled() {
            return Err(Error::Cancelled);
        }
        Ok(())
    }
}

/// Run `fut`, abandoning it with `Error::Cancelled` once `token` fires
pub async fn cancellable<T, E>(
    token: &CancellationToken,
    fut: impl Future<Output = std::result::Result<T, E>>,
) -> Result<T>
where
    E: Into<Error>,
{
    tokio::select! {
        biased;
        _ = token.cancelled() => Err(Error::Cancelled),
        res = fut => res.map_err(Into::into),
    }
}

/// Outcome of one backend operation
#[derive(Clone, Debug, Default, PartialEq)]
pub struct BackendReport {
    /// The backend has not converged and wants another pass
    pub requeue: bool,
    /// Per-claim records observed during the pass
    pub protected_pvcs: Vec<ProtectedPvc>,
}

impl BackendReport {
    pub fn done() -> Self {
        Self::default()
    }

    pub fn requeue() -> Self {
        Self {
            requeue: true,
            protected_pvcs: Vec::new(),
        }
    }

    pub fn merge(&mut self, other: BackendReport) {
        self.requeue |= other.requeue;
        self.protected_pvcs.extend(other.protected_pvcs);
    }
}

/// Per-backend replication driver.
///
/// Every operation must be safe to repeat. A returned error is treated like a
/// report asking for a requeue.
#[async_trait]
pub trait ReplicationBackend: Send + Sync {
    fn kind(&self) -> BackendKind;

    async fn reconcile_as_primary(&self, scope: &BackendScope<'_>) -> Result<BackendReport>;

    async fn reconcile_as_secondary(&self, scope: &BackendScope<'_>) -> Result<BackendReport>;

    /// Release the per-claim resources so the group can be deleted; asks for a
    /// requeue until that is safe
    async fn reconcile_for_deletion(&self, scope: &BackendScope<'_>) -> Result<BackendReport>;

    /// Roll the per-claim records of `scope.claims` up into one condition
    fn aggregate_condition(
        &self,
        condition_type: &str,
        scope: &BackendScope<'_>,
        protected: &[ProtectedPvc],
    ) -> Condition {
        rollup::worst_of(self.kind(), condition_type, scope, protected)
    }
}
