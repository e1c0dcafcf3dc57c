//! Claim change filtering
//!
//! PVC watch events are turned into create/update/delete notifications and
//! filtered so that only changes that can affect replication enqueue the
//! groups selecting the claim. Group events are tracked by generation so a
//! spec change can cancel a reconcile working on the old spec.

use std::collections::{HashMap, HashSet};

use k8s_openapi::api::core::v1::PersistentVolumeClaim;
use kube::ResourceExt;
use kube::core::SelectorExt;
use tracing::{debug, warn};

use crate::backend::block::{PVC_FINALIZER, is_bound};
use crate::controller::classification::to_selector;
use crate::controller::store::{ObjectKey, WatchEvent};
use crate::crd::VolumeReplicationGroup;

/// Finalizer the storage layer keeps on claims that are in use
pub const PVC_PROTECTION_FINALIZER: &str = "kubernetes.io/pvc-protection";

/// A claim change as seen by the watch
#[derive(Clone, Debug)]
pub enum ClaimEvent {
    Created(PersistentVolumeClaim),
    Updated {
        old: PersistentVolumeClaim,
        new: PersistentVolumeClaim,
    },
    Deleted(PersistentVolumeClaim),
}

impl ClaimEvent {
    /// The claim as it is now, or as it was when deleted
    pub fn claim(&self) -> &PersistentVolumeClaim {
        match self {
            ClaimEvent::Created(claim) | ClaimEvent::Deleted(claim) => claim,
            ClaimEvent::Updated { new, .. } => new,
        }
    }
}

/// Decide whether a claim change is worth a reconcile of its groups
pub fn should_enqueue(event: &ClaimEvent) -> bool {
    match event {
        ClaimEvent::Created(claim) => {
            debug!(claim = %claim.name_any(), "PVC created");
            true
        }
        // Deletion is handled by the deletion protocol via the VRG finalizer
        ClaimEvent::Deleted(_) => false,
        ClaimEvent::Updated { old, new } => update_is_relevant(old, new),
    }
}

fn update_is_relevant(old: &PersistentVolumeClaim, new: &PersistentVolumeClaim) -> bool {
    let name = new.name_any();

    if old.spec != new.spec {
        debug!(claim = %name, "PVC spec changed");
        return true;
    }

    if !is_bound(old) && is_bound(new) {
        debug!(claim = %name, "PVC became Bound");
        return true;
    }

    let had_protection = has_finalizer(old, PVC_PROTECTION_FINALIZER);
    if had_protection && !has_finalizer(new, PVC_PROTECTION_FINALIZER) {
        debug!(claim = %name, "PVC protection finalizer removed");
        return true;
    }

    !skip_claim(new)
}

/// A claim that is unbound, or terminating without our finalizer, needs no work
pub fn skip_claim(claim: &PersistentVolumeClaim) -> bool {
    if !is_bound(claim) {
        return true;
    }
    claim.metadata.deletion_timestamp.is_some() && !has_finalizer(claim, PVC_FINALIZER)
}

fn has_finalizer(claim: &PersistentVolumeClaim, finalizer: &str) -> bool {
    claim.finalizers().iter().any(|f| f == finalizer)
}

/// Keys of the groups in the claim's namespace whose selector matches it.
///
/// A group with an unparseable selector is skipped.
pub fn groups_for_claim(
    claim: &PersistentVolumeClaim,
    groups: &[VolumeReplicationGroup],
) -> Vec<ObjectKey> {
    let namespace = claim.namespace();
    let labels = claim.labels();

    groups
        .iter()
        .filter(|group| group.namespace() == namespace)
        .filter(|group| match to_selector(group.spec.pvc_selector.clone()) {
            Ok(selector) => selector.matches(labels),
            Err(e) => {
                warn!(group = %group.name_any(), error = %e, "Skipping group with invalid PVC selector");
                false
            }
        })
        .filter_map(ObjectKey::from_resource)
        .collect()
}

/// Keys applied since the watch last restarted its list
#[derive(Debug, Default)]
struct Relist {
    applied: Option<HashSet<ObjectKey>>,
}

impl Relist {
    fn restart(&mut self) {
        self.applied = Some(HashSet::new());
    }

    fn applied(&mut self, key: &ObjectKey) {
        if let Some(applied) = self.applied.as_mut() {
            applied.insert(key.clone());
        }
    }

    /// Drop entries for objects that vanished while the watch was down
    fn finish<V>(&mut self, seen: &mut HashMap<ObjectKey, V>) {
        let Some(applied) = self.applied.take() else {
            return;
        };
        let before = seen.len();
        seen.retain(|key, _| applied.contains(key));
        if seen.len() < before {
            debug!(evicted = before - seen.len(), "Dropped objects missing from relist");
        }
    }
}

/// Remembers the last seen version of each claim so applied events can be
/// told apart as creates or updates
#[derive(Debug, Default)]
pub struct ClaimEventTracker {
    seen: HashMap<ObjectKey, PersistentVolumeClaim>,
    relist: Relist,
}

impl ClaimEventTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observe(&mut self, event: WatchEvent<PersistentVolumeClaim>) -> Option<ClaimEvent> {
        match event {
            WatchEvent::Applied(claim) => {
                let key = ObjectKey::from_resource(&claim)?;
                self.relist.applied(&key);
                Some(match self.seen.insert(key, claim.clone()) {
                    Some(old) => ClaimEvent::Updated { old, new: claim },
                    None => ClaimEvent::Created(claim),
                })
            }
            WatchEvent::Deleted(claim) => {
                if let Some(key) = ObjectKey::from_resource(&claim) {
                    self.seen.remove(&key);
                }
                Some(ClaimEvent::Deleted(claim))
            }
            WatchEvent::Restarted => {
                self.relist.restart();
                None
            }
            WatchEvent::Relisted => {
                self.relist.finish(&mut self.seen);
                None
            }
        }
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

/// A group change to enqueue
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GroupChange {
    pub key: ObjectKey,
    /// A reconcile already running for the key works on stale input
    pub supersedes: bool,
}

/// Remembers the generation of each group. A newer generation or a deletion
/// supersedes the reconcile in flight for that group.
#[derive(Debug, Default)]
pub struct GroupGenerations {
    seen: HashMap<ObjectKey, i64>,
    relist: Relist,
}

impl GroupGenerations {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observe(&mut self, event: &WatchEvent<VolumeReplicationGroup>) -> Option<GroupChange> {
        match event {
            WatchEvent::Applied(group) => {
                let key = ObjectKey::from_resource(group)?;
                self.relist.applied(&key);
                let generation = group.metadata.generation.unwrap_or_default();
                let previous = self.seen.insert(key.clone(), generation);
                Some(GroupChange {
                    key,
                    supersedes: previous.is_some_and(|previous| generation > previous),
                })
            }
            WatchEvent::Deleted(group) => {
                let key = ObjectKey::from_resource(group)?;
                self.seen.remove(&key);
                Some(GroupChange {
                    key,
                    supersedes: true,
                })
            }
            WatchEvent::Restarted => {
                self.relist.restart();
                None
            }
            WatchEvent::Relisted => {
                self.relist.finish(&mut self.seen);
                None
            }
        }
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}
