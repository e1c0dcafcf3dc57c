//! Block replication backend
//!
//! Each claim gets one `VolumeReplication` of the same name, owned by the
//! group, whose `replicationState` follows the group's desired role. The CSI
//! replication controller acts on it and reports progress through its
//! `Completed` and `Degraded` conditions.

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, TypedLocalObjectReference};
use kube::api::{DeleteParams, Patch, PatchParams};
use kube::{Api, Client, Resource, ResourceExt};
use tracing::{debug, info, warn};

use crate::backend::{BackendKind, BackendReport, BackendScope, ReplicationBackend, cancellable};
use crate::controller::conditions::{condition_types, reasons, satisfied_reason};
use crate::controller::error::Result;
use crate::crd::{
    Condition, ConditionStatus, Conditions, ProtectedPvc, ReplicationState, VolumeReplication,
    VolumeReplicationGroup, VolumeReplicationSpec, volume_replication_conditions,
};

/// Finalizer keeping a claim alive while its VolumeReplication exists
pub const PVC_FINALIZER: &str = "dr.example.com/pvc-vr-protection";

/// Label carrying the owning group's name on every VolumeReplication
pub const OWNER_LABEL: &str = "dr.example.com/owner";

/// Field manager for server-side apply
const FIELD_MANAGER: &str = "vrg-operator";

/// Backend driving CSI `VolumeReplication` resources
#[derive(Clone)]
pub struct VolumeReplicationBackend {
    client: Client,
}

impl VolumeReplicationBackend {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    async fn reconcile_role(
        &self,
        scope: &BackendScope<'_>,
        state: ReplicationState,
    ) -> Result<BackendReport> {
        let ns = scope.group.namespace().unwrap_or_default();
        let claims: Api<PersistentVolumeClaim> = Api::namespaced(self.client.clone(), &ns);
        let replications: Api<VolumeReplication> = Api::namespaced(self.client.clone(), &ns);

        let mut report = BackendReport::done();

        for claim in scope.claims {
            scope.check_cancelled()?;
            let name = claim.name_any();

            if !is_bound(claim) {
                debug!(pvc = %name, "PVC is not bound yet");
                report.requeue = true;
                report.protected_pvcs.push(pending_record(
                    claim,
                    None,
                    "PVC is not yet bound",
                    scope.generation(),
                ));
                continue;
            }

            let Some(class) = scope.replication_classes.get(&name) else {
                warn!(pvc = %name, "No VolumeReplicationClass matches the PVC's provisioner");
                report.requeue = true;
                report.protected_pvcs.push(error_record(
                    claim,
                    None,
                    "No VolumeReplicationClass matches the PVC's provisioner",
                    scope.generation(),
                ));
                continue;
            };

            if !has_finalizer(claim, PVC_FINALIZER) {
                let mut finalizers = claim.finalizers().to_vec();
                finalizers.push(PVC_FINALIZER.to_string());
                let patch = serde_json::json!({ "metadata": { "finalizers": finalizers } });
                cancellable(
                    scope.token,
                    claims.patch(&name, &PatchParams::default(), &Patch::Merge(&patch)),
                )
                .await?;
                debug!(pvc = %name, "Added PVC protection finalizer");
            }

            let desired = build_volume_replication(scope.group, &name, class, state);
            let applied = cancellable(
                scope.token,
                replications.patch(
                    &name,
                    &PatchParams::apply(FIELD_MANAGER).force(),
                    &Patch::Apply(&desired),
                ),
            )
            .await?;

            let record = protection_record(claim, class, &applied, state, scope.generation());
            if record
                .conditions
                .iter()
                .any(|c| c.status != ConditionStatus::True)
            {
                report.requeue = true;
            }
            report.protected_pvcs.push(record);
        }

        Ok(report)
    }
}

#[async_trait]
impl ReplicationBackend for VolumeReplicationBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Block
    }

    async fn reconcile_as_primary(&self, scope: &BackendScope<'_>) -> Result<BackendReport> {
        self.reconcile_role(scope, ReplicationState::Primary).await
    }

    async fn reconcile_as_secondary(&self, scope: &BackendScope<'_>) -> Result<BackendReport> {
        self.reconcile_role(scope, ReplicationState::Secondary).await
    }

    async fn reconcile_for_deletion(&self, scope: &BackendScope<'_>) -> Result<BackendReport> {
        let ns = scope.group.namespace().unwrap_or_default();
        let claims: Api<PersistentVolumeClaim> = Api::namespaced(self.client.clone(), &ns);
        let replications: Api<VolumeReplication> = Api::namespaced(self.client.clone(), &ns);

        let mut report = BackendReport::done();

        for claim in scope.claims {
            scope.check_cancelled()?;
            let name = claim.name_any();

            match cancellable(scope.token, replications.delete(&name, &DeleteParams::default())).await {
                // Still terminating; keep the claim protected until it is gone
                Ok(pending) if pending.is_left() => {
                    debug!(pvc = %name, "VolumeReplication is still being deleted");
                    report.requeue = true;
                    continue;
                }
                Ok(_) => info!(pvc = %name, "Deleted VolumeReplication"),
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }

            if has_finalizer(claim, PVC_FINALIZER) {
                let finalizers: Vec<&String> = claim
                    .finalizers()
                    .iter()
                    .filter(|f| f.as_str() != PVC_FINALIZER)
                    .collect();
                let patch = serde_json::json!({ "metadata": { "finalizers": finalizers } });
                match cancellable(
                    scope.token,
                    claims.patch(&name, &PatchParams::default(), &Patch::Merge(&patch)),
                )
                .await
                {
                    Ok(_) => debug!(pvc = %name, "Removed PVC protection finalizer"),
                    Err(e) if e.is_not_found() => {}
                    Err(e) => return Err(e),
                }
            }
        }

        Ok(report)
    }
}

pub fn is_bound(claim: &PersistentVolumeClaim) -> bool {
    claim.status.as_ref().and_then(|s| s.phase.as_deref()) == Some("Bound")
}

fn has_finalizer(claim: &PersistentVolumeClaim, finalizer: &str) -> bool {
    claim.finalizers().iter().any(|f| f == finalizer)
}

/// Desired VolumeReplication for a claim
pub fn build_volume_replication(
    group: &VolumeReplicationGroup,
    claim_name: &str,
    class: &str,
    state: ReplicationState,
) -> VolumeReplication {
    let mut replication = VolumeReplication::new(
        claim_name,
        VolumeReplicationSpec {
            volume_replication_class: class.to_string(),
            replication_state: state.as_str().to_string(),
            data_source: TypedLocalObjectReference {
                api_group: None,
                kind: "PersistentVolumeClaim".to_string(),
                name: claim_name.to_string(),
            },
            auto_resync: false,
        },
    );
    replication.metadata.namespace = group.namespace();
    replication.metadata.owner_references = group.controller_owner_ref(&()).map(|o| vec![o]);
    replication.metadata.labels = Some(BTreeMap::from([(
        OWNER_LABEL.to_string(),
        group.name_any(),
    )]));
    replication
}

/// Translate a VolumeReplication's status into the claim's protection record
pub fn protection_record(
    claim: &PersistentVolumeClaim,
    class: &str,
    replication: &VolumeReplication,
    state: ReplicationState,
    generation: Option<i64>,
) -> ProtectedPvc {
    let Some(status) = replication
        .status
        .as_ref()
        .filter(|s| {
            s.observed_generation.is_some()
                && s.observed_generation == replication.metadata.generation
        })
    else {
        return pending_record(
            claim,
            Some(class),
            "VolumeReplication resource for the PVC is not yet reconciled",
            generation,
        );
    };

    let find = |type_: &str| status.conditions.iter().find(|c| c.type_ == type_);
    let completed = find(volume_replication_conditions::COMPLETED);
    let degraded = find(volume_replication_conditions::DEGRADED)
        .is_some_and(|c| c.status == "True");

    let mut conditions = Conditions::new();
    match completed.map(|c| (c.status.as_str(), c.message.as_str())) {
        Some(("True", _)) => {
            conditions.upsert_by_type(Condition::new(
                condition_types::DATA_READY,
                ConditionStatus::True,
                satisfied_reason(condition_types::DATA_READY, Some(state)),
                format!("PVC in the VolumeReplicationGroup is ready for use as {}", state),
                generation,
            ));
            if degraded {
                let message = find(volume_replication_conditions::DEGRADED)
                    .map(|c| c.message.clone())
                    .unwrap_or_default();
                conditions.upsert_by_type(Condition::new(
                    condition_types::DATA_PROTECTED,
                    ConditionStatus::False,
                    reasons::ERROR,
                    format!("Replication is degraded: {}", message),
                    generation,
                ));
            } else {
                conditions.upsert_by_type(Condition::new(
                    condition_types::DATA_PROTECTED,
                    ConditionStatus::True,
                    reasons::DATA_PROTECTED,
                    "PVC data is protected by volume replication",
                    generation,
                ));
            }
            conditions.upsert_by_type(Condition::new(
                condition_types::CLUSTER_DATA_PROTECTED,
                ConditionStatus::True,
                reasons::UPLOADED,
                "PV cluster data is protected",
                generation,
            ));
        }
        Some(("False", message)) => {
            return error_record(
                claim,
                Some(class),
                &format!("VolumeReplication failed to complete: {}", message),
                generation,
            );
        }
        _ => {
            return pending_record(
                claim,
                Some(class),
                &format!("VolumeReplication is not yet {}", state),
                generation,
            );
        }
    }

    ProtectedPvc {
        name: claim.name_any(),
        protected_by_snapshot: false,
        storage_class_name: claim.spec.as_ref().and_then(|s| s.storage_class_name.clone()),
        replication_class_name: Some(class.to_string()),
        conditions,
    }
}

fn record_with(
    claim: &PersistentVolumeClaim,
    class: Option<&str>,
    status: ConditionStatus,
    reason: &str,
    message: &str,
    generation: Option<i64>,
) -> ProtectedPvc {
    let conditions = [
        condition_types::DATA_READY,
        condition_types::DATA_PROTECTED,
        condition_types::CLUSTER_DATA_PROTECTED,
    ]
    .into_iter()
    .map(|type_| Condition::new(type_, status, reason, message, generation))
    .collect();

    ProtectedPvc {
        name: claim.name_any(),
        protected_by_snapshot: false,
        storage_class_name: claim.spec.as_ref().and_then(|s| s.storage_class_name.clone()),
        replication_class_name: class.map(str::to_string),
        conditions,
    }
}

fn pending_record(
    claim: &PersistentVolumeClaim,
    class: Option<&str>,
    message: &str,
    generation: Option<i64>,
) -> ProtectedPvc {
    record_with(claim, class, ConditionStatus::Unknown, reasons::PROGRESSING, message, generation)
}

fn error_record(
    claim: &PersistentVolumeClaim,
    class: Option<&str>,
    message: &str,
    generation: Option<i64>,
) -> ProtectedPvc {
    record_with(claim, class, ConditionStatus::False, reasons::ERROR, message, generation)
}
