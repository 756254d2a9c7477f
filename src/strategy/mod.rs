//! Training strategies: how a model is placed, wrapped and stepped across
//! processes.

pub mod ddp;
pub mod environment;
pub mod fully_sharded;
pub mod fully_sharded_config;
pub mod registry;
pub mod wrapper;

use std::sync::Arc;

use crate::distributed::comm::Communicator;
use crate::error::Result;
use crate::nn::module::{Module, unwrap_module};
use crate::trainer::checkpoint::Checkpoint;
use crate::trainer::context::TrainerContext;
use candle_core::{Device, Tensor};

pub use ddp::DdpStrategy;
pub use environment::ClusterEnvironment;
pub use fully_sharded::{FullyShardedStrategy, StepDispatch};
pub use fully_sharded_config::{ComputeDType, FullyShardedConfig, WrapMode};
pub use registry::{RegistryEntry, StrategyBuilder, StrategyRegistry};
pub use wrapper::{TrainingModuleWrapper, WRAPPED_MODULE_PREFIX};

/// Lifecycle hooks the orchestrator drives a strategy through.
///
/// Order: `connect` → `setup_distributed` → `pre_dispatch` → steps →
/// `on_save` when checkpointing.
pub trait Strategy: Send {
    fn name(&self) -> &'static str;

    /// Hand the user's module to the strategy.
    fn connect(&mut self, model: Box<dyn Module>);

    fn setup_distributed(&mut self, comm: Arc<dyn Communicator>) -> Result<()>;

    fn root_device(&self) -> &Device;

    /// Final model preparation before the first batch.
    fn pre_dispatch(&mut self, trainer: &mut dyn TrainerContext) -> Result<()>;

    fn barrier(&self, name: &str) -> Result<()>;

    /// The model as the strategy holds it, wrappers included.
    fn model(&self) -> Option<&dyn Module>;

    /// The user's module with every wrapper peeled off.
    fn lightning_module(&self) -> Option<&dyn Module> {
        self.model().map(unwrap_module)
    }

    fn training_step(&mut self, batch: &Tensor, batch_idx: usize) -> Result<Tensor>;

    fn validation_step(&mut self, batch: &Tensor, batch_idx: usize) -> Result<Tensor>;

    fn test_step(&mut self, batch: &Tensor, batch_idx: usize) -> Result<Tensor>;

    fn predict_step(&mut self, batch: &Tensor, batch_idx: usize) -> Result<Tensor>;

    fn post_training_step(&mut self);

    /// Adjust the checkpoint before it is written.
    fn on_save(&self, checkpoint: Checkpoint) -> Result<Checkpoint> {
        Ok(checkpoint)
    }

    /// Whether the orchestrator must build optimizers after `pre_dispatch`
    /// rather than before.
    fn setup_optimizers_in_pre_dispatch(&self) -> bool {
        false
    }
}
