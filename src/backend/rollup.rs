//! Worst-of roll-up of per-claim conditions

use k8s_openapi::api::core::v1::PersistentVolumeClaim;
use kube::ResourceExt;

use crate::backend::{BackendKind, BackendScope};
use crate::controller::conditions::{reasons, satisfied_reason};
use crate::crd::{Condition, ConditionStatus, ProtectedPvc};

/// Summarise one condition type over the claims in `scope`.
///
/// Any claim reporting False decides the result, then any claim that is
/// Unknown or has no record yet. A backend without claims is satisfied with
/// reason `Unused`.
pub fn worst_of(
    kind: BackendKind,
    condition_type: &str,
    scope: &BackendScope<'_>,
    protected: &[ProtectedPvc],
) -> Condition {
    let generation = scope.generation();

    if scope.claims.is_empty() {
        return Condition::new(
            condition_type,
            ConditionStatus::True,
            reasons::UNUSED,
            format!("No PVCs are protected using {} replication", kind),
            generation,
        );
    }

    let per_claim: Vec<(String, Option<&Condition>)> = scope
        .claims
        .iter()
        .map(|claim| (claim.name_any(), claim_condition(claim, condition_type, protected)))
        .collect();

    if let Some((name, failed)) = per_claim
        .iter()
        .find_map(|(name, c)| c.filter(|c| c.status == ConditionStatus::False).map(|c| (name, c)))
    {
        return Condition::new(
            condition_type,
            ConditionStatus::False,
            &failed.reason,
            format!("PVC {}: {}", name, failed.message),
            generation,
        );
    }

    if let Some((name, pending)) = per_claim
        .iter()
        .find(|(_, c)| c.is_none_or(|c| c.status != ConditionStatus::True))
    {
        let message = match pending {
            Some(c) => format!("PVC {}: {}", name, c.message),
            None => format!("PVC {}: {} not reported yet", name, condition_type),
        };
        return Condition::new(
            condition_type,
            ConditionStatus::Unknown,
            reasons::PROGRESSING,
            message,
            generation,
        );
    }

    Condition::new(
        condition_type,
        ConditionStatus::True,
        satisfied_reason(condition_type, scope.desired_state()),
        format!(
            "{} condition is True for all {} PVCs using {} replication",
            condition_type,
            per_claim.len(),
            kind
        ),
        generation,
    )
}

fn claim_condition<'a>(
    claim: &PersistentVolumeClaim,
    condition_type: &str,
    protected: &'a [ProtectedPvc],
) -> Option<&'a Condition> {
    let name = claim.metadata.name.as_deref()?;
    protected
        .iter()
        .find(|p| p.name == name)
        .and_then(|p| p.conditions.find_by_type(condition_type))
}
