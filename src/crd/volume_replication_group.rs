use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;

use super::Conditions;

/// VolumeReplicationGroup declares the desired replication role for the
/// persistent volume claims selected in its namespace.
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq)]
#[kube(
    group = "dr.example.com",
    version = "v1alpha1",
    kind = "VolumeReplicationGroup",
    plural = "volumereplicationgroups",
    shortname = "vrg",
    namespaced,
    status = "VolumeReplicationGroupStatus",
    derive = "PartialEq",
    printcolumn = r#"{"name":"DesiredState", "type":"string", "jsonPath":".spec.replicationState"}"#,
    printcolumn = r#"{"name":"CurrentState", "type":"string", "jsonPath":".status.state"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct VolumeReplicationGroupSpec {
    /// Label selector identifying the PVCs this group protects
    #[serde(default)]
    pub pvc_selector: LabelSelector,

    /// Desired replication role: "primary" or "secondary".
    ///
    /// Kept as a plain string so that an invalid value surfaces as a
    /// validation failure on the resource instead of a decode error.
    pub replication_state: String,

    /// Asynchronous (regional) replication settings
    #[serde(rename = "async", default, skip_serializing_if = "Option::is_none")]
    pub async_spec: Option<AsyncSpec>,

    /// Synchronous (metro) replication settings
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sync: Option<SyncSpec>,

    /// Snapshot based replication backend settings
    #[serde(default)]
    pub snapshot_backend: SnapshotBackendSpec,

    /// Object store profiles holding the cluster metadata of protected volumes
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub s3_profiles: Vec<String>,
}

impl VolumeReplicationGroupSpec {
    /// Parse the desired role, `None` when the value is not a known role
    pub fn desired_state(&self) -> Option<ReplicationState> {
        ReplicationState::parse(&self.replication_state)
    }

    /// Flags describing which replication modes are switched on
    pub fn backend_mode(&self) -> BackendMode {
        BackendMode {
            sync_enabled: self
                .sync
                .as_ref()
                .is_some_and(|s| s.mode == ModeSetting::Enabled),
            async_enabled: self
                .async_spec
                .as_ref()
                .is_some_and(|a| a.mode == ModeSetting::Enabled),
        }
    }

    /// Selector for the VolumeReplicationClasses usable by this group
    pub fn replication_class_selector(&self) -> LabelSelector {
        self.async_spec
            .as_ref()
            .map(|a| a.replication_class_selector.clone())
            .unwrap_or_default()
    }
}

/// Asynchronous replication settings
#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AsyncSpec {
    #[serde(default)]
    pub mode: ModeSetting,

    /// Selects VolumeReplicationClasses eligible for block replication
    #[serde(default)]
    pub replication_class_selector: LabelSelector,

    /// Replication interval (e.g., "5m")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduling_interval: Option<String>,
}

/// Synchronous replication settings
#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SyncSpec {
    #[serde(default)]
    pub mode: ModeSetting,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotBackendSpec {
    /// Route every PVC to block replication
    #[serde(default)]
    pub disabled: bool,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, JsonSchema, PartialEq, Eq)]
pub enum ModeSetting {
    Enabled,
    #[default]
    Disabled,
}

/// Derived view of the sync/async mode flags
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BackendMode {
    pub sync_enabled: bool,
    pub async_enabled: bool,
}

impl BackendMode {
    pub fn any_enabled(&self) -> bool {
        self.sync_enabled || self.async_enabled
    }
}

/// Replication role requested by the spec
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ReplicationState {
    Primary,
    Secondary,
}

impl ReplicationState {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "primary" => Some(ReplicationState::Primary),
            "secondary" => Some(ReplicationState::Secondary),
            _ => None,
        }
    }

    /// Status state reported once a transition to this role completes
    pub fn status_state(&self) -> GroupState {
        match self {
            ReplicationState::Primary => GroupState::Primary,
            ReplicationState::Secondary => GroupState::Secondary,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ReplicationState::Primary => "primary",
            ReplicationState::Secondary => "secondary",
        }
    }
}

impl fmt::Display for ReplicationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status of a VolumeReplicationGroup, written only by the reconciler
#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VolumeReplicationGroupStatus {
    /// Role the group has completed a transition to
    #[serde(default)]
    pub state: GroupState,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    /// Per-PVC protection records, ordered by PVC name
    #[serde(default, rename = "protectedPVCs")]
    pub protected_pvcs: Vec<ProtectedPvc>,

    #[serde(default)]
    pub conditions: Conditions,

    /// RFC 3339 timestamp of the last status write
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_update_time: Option<String>,
}

/// Observed replication state of the group
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, JsonSchema, PartialEq, Eq)]
pub enum GroupState {
    Primary,
    Secondary,
    #[default]
    Unknown,
}

impl fmt::Display for GroupState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GroupState::Primary => write!(f, "Primary"),
            GroupState::Secondary => write!(f, "Secondary"),
            GroupState::Unknown => write!(f, "Unknown"),
        }
    }
}

/// Record of which backend owns a PVC, with the backend's per-PVC conditions
#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProtectedPvc {
    pub name: String,

    /// True when the snapshot backend protects this PVC
    #[serde(default)]
    pub protected_by_snapshot: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_class_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replication_class_name: Option<String>,

    #[serde(default)]
    pub conditions: Conditions,
}
