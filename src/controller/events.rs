//! Kubernetes Event recording for VolumeReplicationGroups
//!
//! Events are fire-and-forget: a failed publish is logged and never fails the
//! reconcile. Identical reports for the same group within the dedup window
//! are dropped, independent of how many reconciles produce them.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::{Client, Resource, ResourceExt};
use tracing::{debug, warn};

use crate::crd::VolumeReplicationGroup;

/// Well-known event reasons
pub mod reasons {
    pub const PRIMARY_SUCCESS: &str = "PrimarySuccess";
    pub const SECONDARY_SUCCESS: &str = "SecondarySuccess";
    pub const DELETE_SUCCESS: &str = "DeleteSuccess";
    pub const VALIDATION_FAILED: &str = "ValidationFailed";
    pub const PVC_LIST_FAILED: &str = "PVCListFailed";
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Severity {
    Normal,
    Warning,
}

impl From<Severity> for EventType {
    fn from(severity: Severity) -> Self {
        match severity {
            Severity::Normal => EventType::Normal,
            Severity::Warning => EventType::Warning,
        }
    }
}

#[async_trait]
pub trait EventReporter: Send + Sync {
    /// Publish an event unless an identical one was published recently
    async fn report_once(
        &self,
        group: &VolumeReplicationGroup,
        severity: Severity,
        reason: &str,
        message: &str,
    );
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct DedupKey {
    object: String,
    severity: Severity,
    reason: String,
    message: String,
}

/// Remembers recently emitted events
#[derive(Debug)]
pub struct DedupWindow {
    window: Duration,
    seen: Mutex<HashMap<DedupKey, Instant>>,
}

impl DedupWindow {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            seen: Mutex::new(HashMap::new()),
        }
    }

    /// Returns true when the event should be emitted, recording it if so
    pub fn admit(
        &self,
        object: &str,
        severity: Severity,
        reason: &str,
        message: &str,
        now: Instant,
    ) -> bool {
        let key = DedupKey {
            object: object.to_string(),
            severity,
            reason: reason.to_string(),
            message: message.to_string(),
        };

        let mut seen = match self.seen.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        seen.retain(|_, at| now.saturating_duration_since(*at) < self.window);

        if seen.contains_key(&key) {
            return false;
        }
        seen.insert(key, now);
        true
    }
}

/// Production reporter wrapping `kube::runtime::events::Recorder`
pub struct KubeEventReporter {
    recorder: Recorder,
    dedup: DedupWindow,
}

impl KubeEventReporter {
    /// The controller name appears as the reporting component on Events
    pub fn new(client: Client, controller_name: &str, instance: Option<String>, window: Duration) -> Self {
        let reporter = Reporter {
            controller: controller_name.to_string(),
            instance,
        };
        Self {
            recorder: Recorder::new(client, reporter),
            dedup: DedupWindow::new(window),
        }
    }
}

#[async_trait]
impl EventReporter for KubeEventReporter {
    async fn report_once(
        &self,
        group: &VolumeReplicationGroup,
        severity: Severity,
        reason: &str,
        message: &str,
    ) {
        let object = group
            .uid()
            .unwrap_or_else(|| format!("{}/{}", group.namespace().unwrap_or_default(), group.name_any()));
        if !self.dedup.admit(&object, severity, reason, message, Instant::now()) {
            debug!(reason, "Suppressing duplicate event");
            return;
        }

        let event = Event {
            type_: severity.into(),
            reason: reason.to_string(),
            note: Some(message.to_string()),
            action: "Reconcile".to_string(),
            secondary: None,
        };
        if let Err(e) = self.recorder.publish(&event, &group.object_ref(&())).await {
            warn!(reason, error = %e, "Failed to publish Kubernetes event");
        }
    }
}
