use std::sync::Arc;
use std::time::Duration;

use kube::Client;

use crate::backend::{ReplicationBackend, UnavailableBackend, VolumeReplicationBackend};
use crate::config::OperatorConfig;
use crate::controller::events::{EventReporter, KubeEventReporter};
use crate::controller::store::{KubeStore, Store};
use crate::health::HealthState;
use crate::metadata::{MetadataStore, UnconfiguredMetadataStore};

/// Controller name reported on Events
pub const CONTROLLER_NAME: &str = "vrg-operator";

/// Shared context for the controller
#[derive(Clone)]
pub struct Context {
    /// Authoritative store for groups, claims and classes
    pub store: Arc<dyn Store>,
    /// Block replication backend
    pub block: Arc<dyn ReplicationBackend>,
    /// Snapshot replication backend
    pub snapshot: Arc<dyn ReplicationBackend>,
    pub metadata: Arc<dyn MetadataStore>,
    pub events: Arc<dyn EventReporter>,
    /// Fixed delay for groups that are still converging
    pub requeue_delay: Duration,
    /// Health state for recording metrics (optional)
    pub health_state: Option<Arc<HealthState>>,
}

impl Context {
    /// Production wiring against the API server
    pub fn new(client: Client, config: &OperatorConfig, health_state: Option<Arc<HealthState>>) -> Self {
        Self {
            store: Arc::new(KubeStore::new(client.clone(), config.watch_namespace.clone())),
            block: Arc::new(VolumeReplicationBackend::new(client.clone())),
            snapshot: Arc::new(UnavailableBackend),
            metadata: Arc::new(UnconfiguredMetadataStore),
            events: Arc::new(KubeEventReporter::new(
                client,
                CONTROLLER_NAME,
                config.pod_name.clone(),
                config.event_dedup_window,
            )),
            requeue_delay: config.requeue_delay,
            health_state,
        }
    }
}
