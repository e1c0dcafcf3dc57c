//! Role dispatch for VolumeReplicationGroups
//!
//! A reconcile runs exactly one branch. Deletion is checked first and
//! overrides whatever role the spec asks for.

use std::fmt;

use crate::crd::{ReplicationState, VolumeReplicationGroup};

/// Branch of the reconcile state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RolePhase {
    /// deletionTimestamp is set
    Deleting,
    Primary,
    Secondary,
}

impl RolePhase {
    /// Select the branch for a validated group
    pub fn of(group: &VolumeReplicationGroup, desired: ReplicationState) -> Self {
        if group.metadata.deletion_timestamp.is_some() {
            return RolePhase::Deleting;
        }
        match desired {
            ReplicationState::Primary => RolePhase::Primary,
            ReplicationState::Secondary => RolePhase::Secondary,
        }
    }

    /// Role the branch drives the group toward, `None` while deleting
    pub fn role(&self) -> Option<ReplicationState> {
        match self {
            RolePhase::Deleting => None,
            RolePhase::Primary => Some(ReplicationState::Primary),
            RolePhase::Secondary => Some(ReplicationState::Secondary),
        }
    }

    /// Only a primary restores PV cluster data from backup
    pub fn restores_cluster_data(&self) -> bool {
        matches!(self, RolePhase::Primary)
    }
}

impl fmt::Display for RolePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RolePhase::Deleting => write!(f, "Deleting"),
            RolePhase::Primary => write!(f, "Primary"),
            RolePhase::Secondary => write!(f, "Secondary"),
        }
    }
}
