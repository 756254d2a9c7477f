//! # fullshard
//!
//! **Fully sharded data-parallel training strategies on candle.**
//!
//! fullshard adapts a training module to fully sharded data parallelism:
//! parameters, gradients and optimizer state are partitioned across ranks
//! instead of replicated. The strategy decides when a sharding scope is
//! open, which modules get wrapped, where the model lives, and how steps
//! and checkpoints flow through the wrappers.
//!
//! ## Layout
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │  strategy   (FullyShardedStrategy, DdpStrategy,         │
//! │              StrategyRegistry, TrainingModuleWrapper)    │
//! ├──────────────────────────┬──────────────────────────────┤
//! │  distributed::sharding   │  trainer                     │
//! │  (ShardingEngine, scope) │  (precision, optimizers,     │
//! │  distributed::comm       │   checkpoints)               │
//! ├──────────────────────────┴──────────────────────────────┤
//! │  nn (Module trait, Linear, Sequential)   on candle-core  │
//! └─────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Design
//!
//! - **Composition over inheritance**: `FullyShardedStrategy` holds a
//!   `DdpStrategy` and reuses its device placement, barriers and stepping
//! - **Engine seam**: the actual partitioning lives behind `ShardingEngine`;
//!   the `sharding` feature ships a built-in engine
//! - **Scoped wrapping**: every wrap happens inside a `WrapScope` that closes
//!   the engine scope on drop, error paths included
//! - **Named presets**: `fsdp`, `fsdp_auto_wrap` and `fsdp_manual` are
//!   discoverable through `StrategyRegistry`

pub mod distributed;
pub mod error;
pub mod nn;
pub mod strategy;
pub mod trainer;

pub use error::{Error, Result};
pub use strategy::{
    DdpStrategy, FullyShardedConfig, FullyShardedStrategy, StepDispatch, Strategy,
    StrategyRegistry, WrapMode,
};

// Re-export candle types that users will commonly need
pub use candle_core::{DType, Device, Tensor};
