//! CSI volume replication resources consumed by the block replication backend.
//!
//! These CRDs are installed by the storage vendor; the operator only reads
//! VolumeReplicationClasses and manages VolumeReplications it owns.

use k8s_openapi::api::core::v1::TypedLocalObjectReference;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Condition as MetaCondition;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Cluster scoped class describing a replication capable CSI provisioner
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq)]
#[kube(
    group = "replication.storage.openshift.io",
    version = "v1alpha1",
    kind = "VolumeReplicationClass",
    plural = "volumereplicationclasses"
)]
#[serde(rename_all = "camelCase")]
pub struct VolumeReplicationClassSpec {
    /// CSI driver name, matched against StorageClass provisioners
    pub provisioner: String,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub parameters: BTreeMap<String, String>,
}

/// Per-PVC replication resource
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq)]
#[kube(
    group = "replication.storage.openshift.io",
    version = "v1alpha1",
    kind = "VolumeReplication",
    plural = "volumereplications",
    namespaced,
    status = "VolumeReplicationStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct VolumeReplicationSpec {
    pub volume_replication_class: String,

    /// "primary", "secondary" or "resync"
    pub replication_state: String,

    pub data_source: TypedLocalObjectReference,

    #[serde(default)]
    pub auto_resync: bool,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VolumeReplicationStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    #[serde(default)]
    pub conditions: Vec<MetaCondition>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

/// Condition types reported on VolumeReplication status
pub mod volume_replication_conditions {
    pub const COMPLETED: &str = "Completed";
    pub const DEGRADED: &str = "Degraded";
    pub const RESYNCING: &str = "Resyncing";
}
