//! Cluster metadata store
//!
//! PV cluster metadata for protected claims is kept in object storage so a
//! peer cluster can recreate the PVs before taking over as primary.

use async_trait::async_trait;
use kube::ResourceExt;
use tracing::debug;

use crate::backend::BackendKind;
use crate::controller::error::{Error, Result};
use crate::crd::VolumeReplicationGroup;

#[async_trait]
pub trait MetadataStore: Send + Sync {
    /// Recreate the PV cluster objects backed up for one backend's claims
    async fn restore_from_backup(
        &self,
        group: &VolumeReplicationGroup,
        backend: BackendKind,
    ) -> Result<()>;

    /// Remove everything uploaded for the group
    async fn delete_backup(&self, group: &VolumeReplicationGroup) -> Result<()>;
}

/// Metadata store used when no object store client is configured.
///
/// A group naming no `s3Profiles` has nothing to restore or delete; a group
/// naming profiles cannot be served and fails.
#[derive(Clone, Debug, Default)]
pub struct UnconfiguredMetadataStore;

impl UnconfiguredMetadataStore {
    fn check(&self, group: &VolumeReplicationGroup) -> Result<()> {
        if group.spec.s3_profiles.is_empty() {
            return Ok(());
        }
        Err(Error::MetadataStoreError(format!(
            "no object store client configured for profiles [{}] of {}",
            group.spec.s3_profiles.join(", "),
            group.name_any()
        )))
    }
}

#[async_trait]
impl MetadataStore for UnconfiguredMetadataStore {
    async fn restore_from_backup(
        &self,
        group: &VolumeReplicationGroup,
        backend: BackendKind,
    ) -> Result<()> {
        self.check(group)?;
        debug!(backend = %backend, "No s3Profiles configured, nothing to restore");
        Ok(())
    }

    async fn delete_backup(&self, group: &VolumeReplicationGroup) -> Result<()> {
        self.check(group)
    }
}
