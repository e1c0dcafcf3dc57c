//! Test fixtures and in-memory collaborators for the reconciler
//!
//! # Quick Start
//!
//! ```rust,ignore
//! let harness = Harness::new();
//! harness.store.insert_group(VrgBuilder::new("vrg", "apps").primary().build());
//! harness.store.insert_claim(bound_claim("data", "apps", "rbd"));
//! let outcome = reconcile(key("vrg"), harness.ctx(), CancellationToken::new()).await;
//! ```

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use k8s_openapi::api::core::v1::{
    PersistentVolumeClaim, PersistentVolumeClaimSpec, PersistentVolumeClaimStatus,
};
use k8s_openapi::api::storage::v1::StorageClass;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, Time};
use kube::ResourceExt;
use kube::core::{ObjectMeta, Selector, SelectorExt};
use serde_json::json;

use vrg_operator::backend::{BackendKind, BackendReport, BackendScope, ReplicationBackend};
use vrg_operator::controller::conditions::{condition_types, reasons, satisfied_reason};
use vrg_operator::controller::events::{EventReporter, Severity};
use vrg_operator::controller::store::{ObjectKey, Store, WatchStream};
use vrg_operator::controller::{Context, Error, Result};
use vrg_operator::crd::{
    AsyncSpec, Condition, ConditionStatus, ModeSetting, ProtectedPvc, SnapshotBackendSpec,
    SyncSpec, VolumeReplication, VolumeReplicationClass, VolumeReplicationClassSpec,
    VolumeReplicationGroup, VolumeReplicationGroupSpec,
};
use vrg_operator::metadata::MetadataStore;

pub const APP_LABEL: &str = "app";
pub const APP: &str = "demo";
pub const NAMESPACE: &str = "apps";

/// Key of a group in the default test namespace
pub fn key(name: &str) -> ObjectKey {
    ObjectKey::new(NAMESPACE, name)
}

/// Fixed timestamp for deletion markers
pub fn timestamp() -> Time {
    serde_json::from_value(json!("2024-01-01T00:00:00Z")).unwrap()
}

// =============================================================================
// Builders
// =============================================================================

/// Builder for VolumeReplicationGroups selecting `app=demo`
pub struct VrgBuilder {
    group: VolumeReplicationGroup,
}

impl VrgBuilder {
    pub fn new(name: &str, namespace: &str) -> Self {
        let mut group = VolumeReplicationGroup::new(
            name,
            VolumeReplicationGroupSpec {
                pvc_selector: LabelSelector {
                    match_labels: Some(BTreeMap::from([(APP_LABEL.to_string(), APP.to_string())])),
                    ..Default::default()
                },
                replication_state: "primary".to_string(),
                async_spec: Some(AsyncSpec {
                    mode: ModeSetting::Enabled,
                    ..Default::default()
                }),
                sync: None,
                snapshot_backend: SnapshotBackendSpec::default(),
                s3_profiles: vec![],
            },
        );
        group.metadata.namespace = Some(namespace.to_string());
        group.metadata.uid = Some(format!("uid-{}", name));
        group.metadata.generation = Some(1);
        group.metadata.resource_version = Some("1".to_string());
        Self { group }
    }

    pub fn primary(self) -> Self {
        self.with_state("primary")
    }

    pub fn secondary(self) -> Self {
        self.with_state("secondary")
    }

    pub fn with_state(mut self, state: &str) -> Self {
        self.group.spec.replication_state = state.to_string();
        self
    }

    /// Switch off both sync and async modes
    pub fn without_modes(mut self) -> Self {
        self.group.spec.async_spec = Some(AsyncSpec::default());
        self.group.spec.sync = Some(SyncSpec::default());
        self
    }

    pub fn with_sync_only(mut self) -> Self {
        self.group.spec.async_spec = None;
        self.group.spec.sync = Some(SyncSpec {
            mode: ModeSetting::Enabled,
        });
        self
    }

    pub fn with_snapshot_disabled(mut self) -> Self {
        self.group.spec.snapshot_backend.disabled = true;
        self
    }

    pub fn with_s3_profiles(mut self, profiles: &[&str]) -> Self {
        self.group.spec.s3_profiles = profiles.iter().map(|p| p.to_string()).collect();
        self
    }

    pub fn with_pvc_selector(mut self, selector: LabelSelector) -> Self {
        self.group.spec.pvc_selector = selector;
        self
    }

    pub fn with_generation(mut self, generation: i64) -> Self {
        self.group.metadata.generation = Some(generation);
        self
    }

    pub fn with_finalizer(mut self, finalizer: &str) -> Self {
        self.group
            .metadata
            .finalizers
            .get_or_insert_with(Vec::new)
            .push(finalizer.to_string());
        self
    }

    pub fn deleting(mut self) -> Self {
        self.group.metadata.deletion_timestamp = Some(timestamp());
        self
    }

    pub fn with_protected(mut self, records: Vec<ProtectedPvc>) -> Self {
        self.group
            .status
            .get_or_insert_with(Default::default)
            .protected_pvcs = records;
        self
    }

    pub fn build(self) -> VolumeReplicationGroup {
        self.group
    }
}

/// PVC labelled `app=demo` using `storage_class`
pub fn claim(name: &str, namespace: &str, storage_class: Option<&str>, bound: bool) -> PersistentVolumeClaim {
    PersistentVolumeClaim {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(BTreeMap::from([(APP_LABEL.to_string(), APP.to_string())])),
            ..Default::default()
        },
        spec: Some(PersistentVolumeClaimSpec {
            storage_class_name: storage_class.map(str::to_string),
            ..Default::default()
        }),
        status: Some(PersistentVolumeClaimStatus {
            phase: Some(if bound { "Bound" } else { "Pending" }.to_string()),
            ..Default::default()
        }),
    }
}

pub fn bound_claim(name: &str, namespace: &str, storage_class: &str) -> PersistentVolumeClaim {
    claim(name, namespace, Some(storage_class), true)
}

pub fn storage_class(name: &str, provisioner: &str) -> StorageClass {
    StorageClass {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            ..Default::default()
        },
        provisioner: provisioner.to_string(),
        ..Default::default()
    }
}

pub fn replication_class(name: &str, provisioner: &str) -> VolumeReplicationClass {
    VolumeReplicationClass::new(
        name,
        VolumeReplicationClassSpec {
            provisioner: provisioner.to_string(),
            parameters: Default::default(),
        },
    )
}

/// Protection record as left behind by an earlier reconcile
pub fn protected(name: &str, by_snapshot: bool, class: Option<&str>) -> ProtectedPvc {
    ProtectedPvc {
        name: name.to_string(),
        protected_by_snapshot: by_snapshot,
        replication_class_name: class.map(str::to_string),
        ..Default::default()
    }
}

pub fn names(claims: &[PersistentVolumeClaim]) -> Vec<String> {
    claims.iter().map(|c| c.name_any()).collect()
}

// =============================================================================
// In-memory store
// =============================================================================

#[derive(Default)]
pub struct StoreState {
    pub groups: BTreeMap<ObjectKey, VolumeReplicationGroup>,
    pub claims: Vec<PersistentVolumeClaim>,
    pub replication_classes: Vec<VolumeReplicationClass>,
    pub storage_classes: BTreeMap<String, StorageClass>,
    pub status_writes: usize,
    pub group_updates: usize,
    pub replication_class_lists: usize,
    pub fail_list_claims: bool,
    pub fail_update_group: bool,
    pub fail_update_status: bool,
}

/// Store double honouring resourceVersion checks on writes
#[derive(Default)]
pub struct FakeStore {
    pub state: Mutex<StoreState>,
}

impl FakeStore {
    pub fn insert_group(&self, group: VolumeReplicationGroup) {
        let key = ObjectKey::from_resource(&group).unwrap();
        self.state.lock().unwrap().groups.insert(key, group);
    }

    pub fn insert_claim(&self, claim: PersistentVolumeClaim) {
        self.state.lock().unwrap().claims.push(claim);
    }

    pub fn insert_storage_class(&self, class: StorageClass) {
        let name = class.name_any();
        self.state.lock().unwrap().storage_classes.insert(name, class);
    }

    pub fn insert_replication_class(&self, class: VolumeReplicationClass) {
        self.state.lock().unwrap().replication_classes.push(class);
    }

    pub fn group(&self, name: &str) -> Option<VolumeReplicationGroup> {
        self.state.lock().unwrap().groups.get(&key(name)).cloned()
    }

    pub fn status_writes(&self) -> usize {
        self.state.lock().unwrap().status_writes
    }

    pub fn group_updates(&self) -> usize {
        self.state.lock().unwrap().group_updates
    }

    pub fn with<R>(&self, f: impl FnOnce(&mut StoreState) -> R) -> R {
        f(&mut self.state.lock().unwrap())
    }

    /// Admit a write carrying the stored resourceVersion and bump it
    fn admit(
        state: &mut StoreState,
        group: &VolumeReplicationGroup,
    ) -> Result<(ObjectKey, String)> {
        let key = ObjectKey::from_resource(group)
            .ok_or_else(|| Error::NotFound(group.name_any()))?;
        let stored = state
            .groups
            .get(&key)
            .ok_or_else(|| Error::NotFound(key.to_string()))?;
        if stored.metadata.resource_version != group.metadata.resource_version {
            return Err(Error::Conflict(key.to_string()));
        }
        let next = stored
            .metadata
            .resource_version
            .as_deref()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(0)
            + 1;
        Ok((key, next.to_string()))
    }
}

#[async_trait]
impl Store for FakeStore {
    async fn get_group(&self, key: &ObjectKey) -> Result<Option<VolumeReplicationGroup>> {
        Ok(self.state.lock().unwrap().groups.get(key).cloned())
    }

    async fn list_groups(&self, namespace: &str) -> Result<Vec<VolumeReplicationGroup>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .groups
            .values()
            .filter(|g| g.namespace().as_deref() == Some(namespace))
            .cloned()
            .collect())
    }

    async fn list_claims(
        &self,
        namespace: &str,
        selector: &Selector,
    ) -> Result<Vec<PersistentVolumeClaim>> {
        let state = self.state.lock().unwrap();
        if state.fail_list_claims {
            return Err(Error::TransientError("list claims failed".to_string()));
        }
        Ok(state
            .claims
            .iter()
            .filter(|c| c.namespace().as_deref() == Some(namespace))
            .filter(|c| selector.matches(c.labels()))
            .cloned()
            .collect())
    }

    async fn list_replication_classes(
        &self,
        selector: &Selector,
    ) -> Result<Vec<VolumeReplicationClass>> {
        let mut state = self.state.lock().unwrap();
        state.replication_class_lists += 1;
        Ok(state
            .replication_classes
            .iter()
            .filter(|c| selector.matches(c.labels()))
            .cloned()
            .collect())
    }

    async fn get_storage_class(&self, name: &str) -> Result<StorageClass> {
        self.state
            .lock()
            .unwrap()
            .storage_classes
            .get(name)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("StorageClass {}", name)))
    }

    async fn update_group(
        &self,
        group: &VolumeReplicationGroup,
    ) -> Result<VolumeReplicationGroup> {
        let mut state = self.state.lock().unwrap();
        if state.fail_update_group {
            return Err(Error::TransientError("update failed".to_string()));
        }
        let (key, version) = Self::admit(&mut state, group)?;
        let stored = state
            .groups
            .get_mut(&key)
            .ok_or_else(|| Error::NotFound(key.to_string()))?;
        stored.metadata = group.metadata.clone();
        stored.metadata.resource_version = Some(version);
        stored.spec = group.spec.clone();
        state.group_updates += 1;
        Ok(state.groups[&key].clone())
    }

    async fn update_group_status(
        &self,
        group: &VolumeReplicationGroup,
    ) -> Result<VolumeReplicationGroup> {
        let mut state = self.state.lock().unwrap();
        if state.fail_update_status {
            return Err(Error::TransientError("status update failed".to_string()));
        }
        let (key, version) = Self::admit(&mut state, group)?;
        let stored = state
            .groups
            .get_mut(&key)
            .ok_or_else(|| Error::NotFound(key.to_string()))?;
        stored.status = group.status.clone();
        stored.metadata.resource_version = Some(version);
        state.status_writes += 1;
        Ok(state.groups[&key].clone())
    }

    fn watch_groups(&self) -> WatchStream<VolumeReplicationGroup> {
        futures::stream::empty().boxed()
    }

    fn watch_claims(&self) -> WatchStream<PersistentVolumeClaim> {
        futures::stream::empty().boxed()
    }

    fn watch_volume_replications(&self) -> WatchStream<VolumeReplication> {
        futures::stream::empty().boxed()
    }
}

// =============================================================================
// Scripted backend
// =============================================================================

pub struct BackendScript {
    /// Status reported for every aggregated condition of every claim
    pub verdict: ConditionStatus,
    pub requeue: bool,
    pub fail: bool,
    /// Deletion keeps asking for a requeue
    pub deletion_pending: bool,
    /// `operation:claim,claim` per call
    pub calls: Vec<String>,
}

impl Default for BackendScript {
    fn default() -> Self {
        Self {
            verdict: ConditionStatus::True,
            requeue: false,
            fail: false,
            deletion_pending: false,
            calls: Vec::new(),
        }
    }
}

pub struct FakeBackend {
    kind: BackendKind,
    pub script: Mutex<BackendScript>,
}

impl FakeBackend {
    pub fn new(kind: BackendKind) -> Self {
        Self {
            kind,
            script: Mutex::new(BackendScript::default()),
        }
    }

    pub fn calls(&self) -> Vec<String> {
        self.script.lock().unwrap().calls.clone()
    }

    pub fn with<R>(&self, f: impl FnOnce(&mut BackendScript) -> R) -> R {
        f(&mut self.script.lock().unwrap())
    }

    fn run(&self, operation: &str, scope: &BackendScope<'_>) -> Result<BackendReport> {
        let mut script = self.script.lock().unwrap();
        script
            .calls
            .push(format!("{}:{}", operation, names(scope.claims).join(",")));
        if script.fail {
            return Err(Error::BackendError(format!("{} backend failed", self.kind)));
        }

        let verdict = script.verdict;
        let protected_pvcs = scope
            .claims
            .iter()
            .map(|claim| {
                let name = claim.name_any();
                ProtectedPvc {
                    replication_class_name: scope.replication_classes.get(&name).cloned(),
                    protected_by_snapshot: self.kind == BackendKind::Snapshot,
                    name,
                    storage_class_name: claim
                        .spec
                        .as_ref()
                        .and_then(|s| s.storage_class_name.clone()),
                    conditions: condition_types::AGGREGATED
                        .into_iter()
                        .map(|type_| {
                            let reason = match verdict {
                                ConditionStatus::True => satisfied_reason(type_, scope.desired_state()),
                                ConditionStatus::False => reasons::ERROR,
                                ConditionStatus::Unknown => reasons::PROGRESSING,
                            };
                            Condition::new(type_, verdict, reason, "scripted", scope.generation())
                        })
                        .collect(),
                }
            })
            .collect();

        Ok(BackendReport {
            requeue: script.requeue,
            protected_pvcs,
        })
    }
}

#[async_trait]
impl ReplicationBackend for FakeBackend {
    fn kind(&self) -> BackendKind {
        self.kind
    }

    async fn reconcile_as_primary(&self, scope: &BackendScope<'_>) -> Result<BackendReport> {
        self.run("primary", scope)
    }

    async fn reconcile_as_secondary(&self, scope: &BackendScope<'_>) -> Result<BackendReport> {
        self.run("secondary", scope)
    }

    async fn reconcile_for_deletion(&self, scope: &BackendScope<'_>) -> Result<BackendReport> {
        let mut script = self.script.lock().unwrap();
        script
            .calls
            .push(format!("delete:{}", names(scope.claims).join(",")));
        if script.fail {
            return Err(Error::BackendError(format!("{} backend failed", self.kind)));
        }
        Ok(BackendReport {
            requeue: script.deletion_pending,
            protected_pvcs: Vec::new(),
        })
    }
}

// =============================================================================
// Metadata store and events
// =============================================================================

#[derive(Default)]
pub struct MetadataLog {
    pub restores: Vec<BackendKind>,
    pub deletes: usize,
    pub fail_restore: bool,
    pub fail_delete: bool,
}

#[derive(Default)]
pub struct FakeMetadataStore {
    pub log: Mutex<MetadataLog>,
}

impl FakeMetadataStore {
    pub fn with<R>(&self, f: impl FnOnce(&mut MetadataLog) -> R) -> R {
        f(&mut self.log.lock().unwrap())
    }
}

#[async_trait]
impl MetadataStore for FakeMetadataStore {
    async fn restore_from_backup(
        &self,
        _group: &VolumeReplicationGroup,
        backend: BackendKind,
    ) -> Result<()> {
        let mut log = self.log.lock().unwrap();
        log.restores.push(backend);
        if log.fail_restore {
            return Err(Error::MetadataStoreError("object store unreachable".to_string()));
        }
        Ok(())
    }

    async fn delete_backup(&self, _group: &VolumeReplicationGroup) -> Result<()> {
        let mut log = self.log.lock().unwrap();
        log.deletes += 1;
        if log.fail_delete {
            return Err(Error::MetadataStoreError("object store unreachable".to_string()));
        }
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct RecordedEvent {
    pub severity: Severity,
    pub reason: String,
    pub message: String,
}

#[derive(Default)]
pub struct RecordingEvents {
    pub events: Mutex<Vec<RecordedEvent>>,
}

impl RecordingEvents {
    pub fn reasons(&self) -> Vec<String> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .map(|e| e.reason.clone())
            .collect()
    }

    pub fn all(&self) -> Vec<RecordedEvent> {
        self.events.lock().unwrap().clone()
    }
}

#[async_trait]
impl EventReporter for RecordingEvents {
    async fn report_once(
        &self,
        _group: &VolumeReplicationGroup,
        severity: Severity,
        reason: &str,
        message: &str,
    ) {
        self.events.lock().unwrap().push(RecordedEvent {
            severity,
            reason: reason.to_string(),
            message: message.to_string(),
        });
    }
}

// =============================================================================
// Harness
// =============================================================================

pub const REQUEUE_DELAY: Duration = Duration::from_secs(1);

/// All collaborators of one reconciler, kept around for inspection
pub struct Harness {
    pub store: Arc<FakeStore>,
    pub block: Arc<FakeBackend>,
    pub snapshot: Arc<FakeBackend>,
    pub metadata: Arc<FakeMetadataStore>,
    pub events: Arc<RecordingEvents>,
}

impl Default for Harness {
    fn default() -> Self {
        Self::new()
    }
}

impl Harness {
    pub fn new() -> Self {
        Self {
            store: Arc::new(FakeStore::default()),
            block: Arc::new(FakeBackend::new(BackendKind::Block)),
            snapshot: Arc::new(FakeBackend::new(BackendKind::Snapshot)),
            metadata: Arc::new(FakeMetadataStore::default()),
            events: Arc::new(RecordingEvents::default()),
        }
    }

    pub fn ctx(&self) -> Arc<Context> {
        Arc::new(Context {
            store: self.store.clone(),
            block: self.block.clone(),
            snapshot: self.snapshot.clone(),
            metadata: self.metadata.clone(),
            events: self.events.clone(),
            requeue_delay: REQUEUE_DELAY,
            health_state: None,
        })
    }

    /// One block-capable provisioner (`rbd`) and one without a class (`nfs`)
    pub fn with_classes(self) -> Self {
        self.store.insert_storage_class(storage_class("rbd", "rbd.csi.ceph.com"));
        self.store.insert_storage_class(storage_class("nfs", "nfs.csi.k8s.io"));
        self.store
            .insert_replication_class(replication_class("rbd-replication", "rbd.csi.ceph.com"));
        self
    }
}
