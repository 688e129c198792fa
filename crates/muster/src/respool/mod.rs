pub mod gang;
pub mod pool;
pub mod queue;
pub mod tree;

pub use gang::{Gang, GangKind};
pub use pool::{Allocation, PoolSnapshot, ResPool};
pub use tree::{ResTree, ROOT_POOL_ID};
