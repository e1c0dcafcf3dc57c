//! Volume classification
//!
//! Splits the claims selected by a group between the block and snapshot
//! replication backends. Outside deletion a claim goes to the block backend
//! when its StorageClass provisioner matches a selected
//! VolumeReplicationClass. During deletion the group's own `protectedPVCs`
//! record decides, since selector labels may already have been stripped.

use std::collections::{BTreeMap, BTreeSet};

use k8s_openapi::api::core::v1::PersistentVolumeClaim;
use kube::ResourceExt;
use kube::core::Selector;
use tracing::{debug, info};

use crate::controller::error::{Error, Result};
use crate::controller::store::Store;
use crate::crd::{ProtectedPvc, VolumeReplicationClass, VolumeReplicationGroup};

/// Claims partitioned between the two backends, each list ordered by name
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ClaimSets {
    pub block: Vec<PersistentVolumeClaim>,
    pub snapshot: Vec<PersistentVolumeClaim>,
    /// Claim name to the VolumeReplicationClass chosen for it
    pub block_classes: BTreeMap<String, String>,
}

impl ClaimSets {
    pub fn is_empty(&self) -> bool {
        self.block.is_empty() && self.snapshot.is_empty()
    }
}

/// VolumeReplicationClasses listed at most once per reconcile invocation
#[derive(Debug, Default)]
pub struct ReplicationClassCache {
    classes: Option<Vec<VolumeReplicationClass>>,
}

impl ReplicationClassCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// List the classes on first use, ordered by name
    pub async fn get(
        &mut self,
        store: &dyn Store,
        group: &VolumeReplicationGroup,
    ) -> Result<&[VolumeReplicationClass]> {
        if self.classes.is_none() {
            let selector = to_selector(group.spec.replication_class_selector())?;
            let mut classes = store.list_replication_classes(&selector).await?;
            classes.sort_by_key(|c| c.name_any());
            debug!(count = classes.len(), "Listed VolumeReplicationClasses");
            self.classes = Some(classes);
        }
        Ok(self.classes.as_deref().unwrap_or_default())
    }
}

pub fn to_selector(
    selector: k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector,
) -> Result<Selector> {
    Selector::try_from(selector).map_err(|e| Error::InvalidSelector(e.to_string()))
}

/// List the group's claims and route each one to a backend
pub async fn classify(
    store: &dyn Store,
    group: &VolumeReplicationGroup,
    classes: &mut ReplicationClassCache,
) -> Result<ClaimSets> {
    let ns = group.namespace().unwrap_or_default();
    let selector = to_selector(group.spec.pvc_selector.clone())?;
    let mut claims = store.list_claims(&ns, &selector).await?;
    claims.sort_by_key(|c| c.name_any());

    let snapshot_disabled = group.spec.snapshot_backend.disabled;

    let sets = if group.metadata.deletion_timestamp.is_some() {
        if snapshot_disabled {
            ClaimSets {
                block: claims,
                ..Default::default()
            }
        } else {
            let protected = group
                .status
                .as_ref()
                .map(|s| s.protected_pvcs.as_slice())
                .unwrap_or_default();
            partition_by_status(claims, protected)
        }
    } else {
        let classes = classes.get(store, group).await?;
        let provisioners = if classes.is_empty() {
            BTreeMap::new()
        } else {
            resolve_provisioners(store, &claims).await?
        };
        partition_by_provisioner(claims, &provisioners, classes, snapshot_disabled)?
    };

    info!(
        block = sets.block.len(),
        snapshot = sets.snapshot.len(),
        "Classified PVCs"
    );
    Ok(sets)
}

/// Look up the provisioner of every StorageClass used by `claims`.
///
/// One unresolvable class fails the whole lookup.
async fn resolve_provisioners(
    store: &dyn Store,
    claims: &[PersistentVolumeClaim],
) -> Result<BTreeMap<String, String>> {
    let mut names = BTreeSet::new();
    for claim in claims {
        names.insert(storage_class_name(claim)?.to_string());
    }

    let mut provisioners = BTreeMap::new();
    for name in names {
        let class = store.get_storage_class(&name).await.map_err(|e| {
            Error::StorageClassLookup(format!("failed to get StorageClass {}: {}", name, e))
        })?;
        provisioners.insert(name, class.provisioner);
    }
    Ok(provisioners)
}

fn storage_class_name(claim: &PersistentVolumeClaim) -> Result<&str> {
    claim
        .spec
        .as_ref()
        .and_then(|s| s.storage_class_name.as_deref())
        .filter(|name| !name.is_empty())
        .ok_or_else(|| {
            Error::StorageClassLookup(format!(
                "PVC {} does not name a StorageClass",
                claim.name_any()
            ))
        })
}

/// Route claims by the provisioner of their StorageClass.
///
/// Without any replication class every claim is a snapshot candidate, unless
/// the snapshot backend is disabled, in which case everything is block.
pub fn partition_by_provisioner(
    claims: Vec<PersistentVolumeClaim>,
    provisioners: &BTreeMap<String, String>,
    classes: &[VolumeReplicationClass],
    snapshot_disabled: bool,
) -> Result<ClaimSets> {
    let mut sets = ClaimSets::default();

    if classes.is_empty() {
        if snapshot_disabled {
            sets.block = claims;
        } else {
            sets.snapshot = claims;
        }
        return Ok(sets);
    }

    for claim in claims {
        let storage_class = storage_class_name(&claim)?;
        let provisioner = provisioners.get(storage_class).ok_or_else(|| {
            Error::StorageClassLookup(format!(
                "provisioner of StorageClass {} is unknown",
                storage_class
            ))
        })?;

        let matched = classes
            .iter()
            .find(|class| &class.spec.provisioner == provisioner);

        match matched {
            Some(class) => {
                sets.block_classes.insert(claim.name_any(), class.name_any());
                sets.block.push(claim);
            }
            None if snapshot_disabled => sets.block.push(claim),
            None => sets.snapshot.push(claim),
        }
    }

    Ok(sets)
}

/// Replay the group's protection record.
///
/// Claims without a record are left out of both lists.
pub fn partition_by_status(
    claims: Vec<PersistentVolumeClaim>,
    protected: &[ProtectedPvc],
) -> ClaimSets {
    let mut sets = ClaimSets::default();

    for claim in claims {
        let name = claim.name_any();
        let Some(record) = protected.iter().find(|p| p.name == name) else {
            debug!(pvc = %name, "PVC has no protection record, skipping");
            continue;
        };

        if record.protected_by_snapshot {
            sets.snapshot.push(claim);
        } else {
            if let Some(class) = &record.replication_class_name {
                sets.block_classes.insert(name, class.clone());
            }
            sets.block.push(claim);
        }
    }

    sets
}
