//! Summary condition vocabulary for VolumeReplicationGroup status
//!
//! Every summary condition lives in the group's `Conditions` set; the helpers
//! here build the well-known entries and upsert them by type.

use crate::crd::{Condition, ConditionStatus, Conditions, ReplicationState};

/// Summary condition types
pub mod condition_types {
    /// PVCs are ready for use in the desired role
    pub const DATA_READY: &str = "DataReady";
    /// PVC data is replicated to the peer
    pub const DATA_PROTECTED: &str = "DataProtected";
    /// PV cluster metadata has been restored on this cluster
    pub const CLUSTER_DATA_READY: &str = "ClusterDataReady";
    /// PV cluster metadata is stored outside the cluster
    pub const CLUSTER_DATA_PROTECTED: &str = "ClusterDataProtected";

    /// Conditions aggregated from the replication backends
    pub const AGGREGATED: [&str; 3] = [DATA_READY, DATA_PROTECTED, CLUSTER_DATA_PROTECTED];
}

/// Condition reasons
pub mod reasons {
    pub const INITIALIZING: &str = "Initializing";
    pub const ERROR: &str = "Error";
    pub const PROGRESSING: &str = "Progressing";
    pub const READY: &str = "Ready";
    pub const REPLICATING: &str = "Replicating";
    pub const DATA_PROTECTED: &str = "DataProtected";
    pub const UPLOADED: &str = "Uploaded";
    pub const RESTORED: &str = "Restored";
    pub const UNUSED: &str = "Unused";
    pub const UNAVAILABLE: &str = "Unavailable";
}

/// Reason recorded when an aggregated condition is satisfied
pub fn satisfied_reason(condition_type: &str, desired: Option<ReplicationState>) -> &'static str {
    match condition_type {
        condition_types::DATA_READY => match desired {
            Some(ReplicationState::Secondary) => reasons::REPLICATING,
            _ => reasons::READY,
        },
        condition_types::DATA_PROTECTED => reasons::DATA_PROTECTED,
        condition_types::CLUSTER_DATA_PROTECTED => reasons::UPLOADED,
        condition_types::CLUSTER_DATA_READY => reasons::RESTORED,
        _ => reasons::READY,
    }
}

/// Mark every summary condition Unknown while nothing is known yet
pub fn set_initial_conditions(conditions: &mut Conditions, generation: Option<i64>, message: &str) {
    for type_ in [
        condition_types::DATA_READY,
        condition_types::DATA_PROTECTED,
        condition_types::CLUSTER_DATA_READY,
        condition_types::CLUSTER_DATA_PROTECTED,
    ] {
        conditions.upsert_by_type(Condition::new(
            type_,
            ConditionStatus::Unknown,
            reasons::INITIALIZING,
            message,
            generation,
        ));
    }
}

/// Record a failure that keeps the group's data from being ready
pub fn set_data_error(conditions: &mut Conditions, generation: Option<i64>, message: &str) {
    conditions.upsert_by_type(Condition::new(
        condition_types::DATA_READY,
        ConditionStatus::False,
        reasons::ERROR,
        message,
        generation,
    ));
}

/// Record a failure restoring PV cluster metadata
pub fn set_cluster_data_error(conditions: &mut Conditions, generation: Option<i64>, message: &str) {
    conditions.upsert_by_type(Condition::new(
        condition_types::CLUSTER_DATA_READY,
        ConditionStatus::False,
        reasons::ERROR,
        message,
        generation,
    ));
}

/// Certify that PV cluster metadata has been restored
pub fn set_cluster_data_ready(conditions: &mut Conditions, generation: Option<i64>, message: &str) {
    conditions.upsert_by_type(Condition::new(
        condition_types::CLUSTER_DATA_READY,
        ConditionStatus::True,
        reasons::RESTORED,
        message,
        generation,
    ));
}

/// ClusterDataReady is sticky: once True at a generation it is not recomputed
pub fn cluster_data_ready(conditions: &Conditions, generation: Option<i64>) -> bool {
    conditions.is_true_at(condition_types::CLUSTER_DATA_READY, generation)
}

/// True when every aggregated condition is True for `generation`
pub fn required_conditions_ready(conditions: &Conditions, generation: Option<i64>) -> bool {
    condition_types::AGGREGATED
        .iter()
        .all(|type_| conditions.is_true_at(type_, generation))
}
