mod conditions;
pub mod device;
pub mod emitter;
pub mod enrollment;
pub mod error;
pub mod owner;
pub mod queue;
pub mod repository;
pub mod rollout;
pub mod runner;
pub mod sync;
pub mod versioner;

pub use device::DeviceReconciler;
pub use emitter::EventEmitter;
pub use enrollment::EnrollmentService;
pub use error::ControllerError;
pub use owner::OwnerResolver;
pub use queue::WorkQueue;
pub use repository::RepositoryChecker;
pub use rollout::RolloutController;
pub use runner::{ControllerPool, PoolOptions, ReconcileOutcome, Reconciler};
pub use sync::ResourceSyncController;
pub use versioner::FleetVersioner;
