pub mod checkpoint;
pub mod config;
pub mod context;

pub use checkpoint::{CHECKPOINT_VERSION, Checkpoint, TrainingState, load_checkpoint, save_checkpoint};
pub use config::{Precision, TrainingConfig};
pub use context::{ParamGroup, Trainer, TrainerContext};
