pub mod classification;
pub mod conditions;
pub mod context;
pub mod deletion;
pub mod error;
pub mod events;
pub mod kube_store;
pub mod predicate;
pub mod queue;
pub mod reconciler;
pub mod state_machine;
pub mod status;
pub mod store;
pub mod validation;

pub use context::{CONTROLLER_NAME, Context};
pub use error::{BackoffConfig, Error, Result};
pub use events::{EventReporter, KubeEventReporter, Severity};
pub use queue::{WorkQueue, run_workers};
pub use reconciler::{FINALIZER, Outcome, error_policy, reconcile};
pub use state_machine::RolePhase;
pub use store::{KubeStore, ObjectKey, Store, WatchEvent};
