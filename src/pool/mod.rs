//! Worker pool - bounded set of execution instances and their leases

pub mod registry;
mod resource_pool;

pub use registry::{InstanceId, InstanceRegistry, InstanceState, LeaseOutcome, WorkerInstance};
pub use resource_pool::{PoolLease, PoolStatus, ResourcePool};
