//! Authoritative store abstraction
//!
//! The reconciler talks to the API server only through [`Store`], so the
//! state machine can run against the real cluster ([`KubeStore`]) or an
//! in-memory double in tests.

use std::fmt;

use async_trait::async_trait;
use futures::stream::BoxStream;
use k8s_openapi::api::core::v1::PersistentVolumeClaim;
use k8s_openapi::api::storage::v1::StorageClass;
use kube::core::Selector;
use kube::{Resource, ResourceExt};

use crate::controller::error::Result;
use crate::crd::{VolumeReplication, VolumeReplicationClass, VolumeReplicationGroup};

pub use crate::controller::kube_store::KubeStore;

/// Namespace-qualified identity of a VolumeReplicationGroup
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Key of a namespaced resource, `None` for cluster scoped objects
    pub fn from_resource<K: Resource>(obj: &K) -> Option<Self> {
        Some(Self::new(obj.namespace()?, obj.name_any()))
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Change notification from a watch stream
#[derive(Clone, Debug)]
pub enum WatchEvent<K> {
    /// Object created, updated, or listed during a (re)sync
    Applied(K),
    Deleted(K),
    /// A relist started; the objects that still exist follow as `Applied`
    Restarted,
    /// The relist finished. Objects not applied since `Restarted` are gone.
    Relisted,
}

impl<K> WatchEvent<K> {
    /// The object carried by the event, if any
    pub fn object(&self) -> Option<&K> {
        match self {
            WatchEvent::Applied(obj) | WatchEvent::Deleted(obj) => Some(obj),
            WatchEvent::Restarted | WatchEvent::Relisted => None,
        }
    }
}

pub type WatchStream<K> = BoxStream<'static, WatchEvent<K>>;

/// Read/write access to the resources the reconciler depends on.
///
/// Reads go straight to the authoritative store; implementations must not
/// serve them from a cache.
#[async_trait]
pub trait Store: Send + Sync {
    /// Fetch a VolumeReplicationGroup, `None` when it does not exist
    async fn get_group(&self, key: &ObjectKey) -> Result<Option<VolumeReplicationGroup>>;

    /// List the VolumeReplicationGroups of a namespace
    async fn list_groups(&self, namespace: &str) -> Result<Vec<VolumeReplicationGroup>>;

    /// List the PVCs of a namespace matching `selector`
    async fn list_claims(
        &self,
        namespace: &str,
        selector: &Selector,
    ) -> Result<Vec<PersistentVolumeClaim>>;

    /// List the VolumeReplicationClasses matching `selector`
    async fn list_replication_classes(
        &self,
        selector: &Selector,
    ) -> Result<Vec<VolumeReplicationClass>>;

    /// Fetch a StorageClass; a missing class is `Error::NotFound`
    async fn get_storage_class(&self, name: &str) -> Result<StorageClass>;

    /// Replace metadata and spec, failing on a stale resourceVersion
    async fn update_group(&self, group: &VolumeReplicationGroup)
    -> Result<VolumeReplicationGroup>;

    /// Write the status subresource, failing on a stale resourceVersion
    async fn update_group_status(
        &self,
        group: &VolumeReplicationGroup,
    ) -> Result<VolumeReplicationGroup>;

    fn watch_groups(&self) -> WatchStream<VolumeReplicationGroup>;

    fn watch_claims(&self) -> WatchStream<PersistentVolumeClaim>;

    fn watch_volume_replications(&self) -> WatchStream<VolumeReplication>;
}
