pub mod comm;
pub mod sharding;

pub use comm::{Communicator, NoOpCommunicator, NoOpGroup, ProcessGroup};
#[cfg(feature = "sharding")]
pub use sharding::{FullyShardedModule, LocalShardingEngine};
pub use sharding::{AutoWrapPolicy, ShardingEngine, WrapContext, WrapError, WrapResult, WrapScope};
