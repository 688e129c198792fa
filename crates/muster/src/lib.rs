#[macro_use]
pub mod common;

pub mod api;
pub mod config;
pub mod entitlement;
pub mod handler;
pub mod manager;
pub mod placement;
pub mod preemption;
pub mod recovery;
pub mod respool;
pub mod task;

#[cfg(test)]
pub(crate) mod tests;

pub use common::ids::{GangId, InstanceId, JobId, RunId, TaskId};
pub use common::{Map, Set};

/// Identifier of a resource pool, assigned by the external configuration
/// store. The root pool has the fixed id [`respool::ROOT_POOL_ID`] and is
/// never stored.
pub type PoolId = String;

// Priority: bigger number -> higher priority
pub type Priority = i32;

pub type Error = crate::common::error::RmError;
pub type Result<T> = std::result::Result<T, Error>;

pub use handler::ServiceHandler;
pub use manager::ResourceManager;
