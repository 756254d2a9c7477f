pub mod container;
pub mod linear;
pub mod module;

pub use container::Sequential;
pub use linear::Linear;
pub use module::{Module, StateDict, StepKind, contains_sharded, dispatch_step, unwrap_module};
