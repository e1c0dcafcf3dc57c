//! Snapshot backend placeholder for clusters without a snapshot data mover
//!
//! Claims routed here cannot be protected, so every one is reported with
//! False conditions. The group's summary conditions surface the reason
//! instead of waiting on a backend that will never converge.

use async_trait::async_trait;
use kube::ResourceExt;

use crate::backend::{BackendKind, BackendReport, BackendScope, ReplicationBackend};
use crate::controller::conditions::{condition_types, reasons};
use crate::controller::error::Result;
use crate::crd::{Condition, ConditionStatus, ProtectedPvc};

const MESSAGE: &str = "No snapshot replication backend is available on this cluster";

#[derive(Clone, Debug, Default)]
pub struct UnavailableBackend;

impl UnavailableBackend {
    fn report(&self, scope: &BackendScope<'_>) -> BackendReport {
        let protected_pvcs = scope
            .claims
            .iter()
            .map(|claim| ProtectedPvc {
                name: claim.name_any(),
                protected_by_snapshot: true,
                storage_class_name: claim.spec.as_ref().and_then(|s| s.storage_class_name.clone()),
                replication_class_name: None,
                conditions: condition_types::AGGREGATED
                    .into_iter()
                    .map(|type_| {
                        Condition::new(
                            type_,
                            ConditionStatus::False,
                            reasons::UNAVAILABLE,
                            MESSAGE,
                            scope.generation(),
                        )
                    })
                    .collect(),
            })
            .collect();

        BackendReport {
            requeue: false,
            protected_pvcs,
        }
    }
}

#[async_trait]
impl ReplicationBackend for UnavailableBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Snapshot
    }

    async fn reconcile_as_primary(&self, scope: &BackendScope<'_>) -> Result<BackendReport> {
        Ok(self.report(scope))
    }

    async fn reconcile_as_secondary(&self, scope: &BackendScope<'_>) -> Result<BackendReport> {
        Ok(self.report(scope))
    }

    /// Nothing was created for these claims, so nothing holds up deletion
    async fn reconcile_for_deletion(&self, _scope: &BackendScope<'_>) -> Result<BackendReport> {
        Ok(BackendReport::done())
    }
}
