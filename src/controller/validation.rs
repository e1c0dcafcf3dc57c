//! Validation gates for VolumeReplicationGroup specs
//!
//! Both gates are terminal: a failure is recorded on the resource and the
//! group is not retried until its spec changes.

use crate::controller::error::{Error, Result};
use crate::crd::{BackendMode, ReplicationState, VolumeReplicationGroup};

/// Condition message for an unrecognised `replicationState`
pub const INVALID_STATE_MESSAGE: &str = "VolumeReplicationGroup state is invalid";

/// Condition message when no replication mode is enabled
pub const INVALID_MODE_MESSAGE: &str = "VolumeReplicationGroup mode is invalid";

/// Which gate rejected the group
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ValidationGate {
    State,
    Mode,
}

impl ValidationGate {
    /// Message recorded on the DataReady condition
    pub fn condition_message(&self) -> &'static str {
        match self {
            ValidationGate::State => INVALID_STATE_MESSAGE,
            ValidationGate::Mode => INVALID_MODE_MESSAGE,
        }
    }
}

/// Validated view of a group's spec
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ValidatedSpec {
    pub desired: ReplicationState,
    pub mode: BackendMode,
}

/// Run both gates in order: state first, then mode
pub fn validate(group: &VolumeReplicationGroup) -> Result<ValidatedSpec, (ValidationGate, Error)> {
    let desired = validate_state(group).map_err(|e| (ValidationGate::State, e))?;
    let mode = validate_mode(group).map_err(|e| (ValidationGate::Mode, e))?;
    Ok(ValidatedSpec { desired, mode })
}

/// The desired role must be exactly "primary" or "secondary"
pub fn validate_state(group: &VolumeReplicationGroup) -> Result<ReplicationState> {
    group.spec.desired_state().ok_or_else(|| {
        Error::ValidationError(format!(
            "invalid replicationState {:?}, expected \"primary\" or \"secondary\"",
            group.spec.replication_state
        ))
    })
}

/// At least one of sync or async mode must be enabled
pub fn validate_mode(group: &VolumeReplicationGroup) -> Result<BackendMode> {
    let mode = group.spec.backend_mode();
    if !mode.any_enabled() {
        return Err(Error::ValidationError(
            "neither of sync or async mode is enabled".to_string(),
        ));
    }
    Ok(mode)
}
