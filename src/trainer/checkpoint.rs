//! Checkpoint mapping and on-disk save/load.
//!
//! A checkpoint directory consists of:
//! - `model.safetensors`: model state dict (collated by the strategy)
//! - `optimizer.safetensors`: optimizer state, if any
//! - `training_state.json`: step, epoch, lr, version, metadata

use crate::error::{Error, Result};
use crate::nn::module::StateDict;
use candle_core::Device;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

/// Current checkpoint format version.
pub const CHECKPOINT_VERSION: u32 = 2;

fn default_version() -> u32 {
    1
}

/// Training metadata saved alongside model/optimizer state.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrainingState {
    /// Checkpoint format version. Defaults to 1 for old checkpoints without this field.
    #[serde(default = "default_version")]
    pub version: u32,
    pub step: u64,
    #[serde(default)]
    pub epoch: u64,
    #[serde(default)]
    pub learning_rate: f64,
    /// Arbitrary key-value metadata (loss history, config hash, etc.)
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

/// The checkpoint mapping a strategy's `on_save` hook receives and returns.
#[derive(Debug, Clone, Default)]
pub struct Checkpoint {
    pub state_dict: StateDict,
    pub optimizer_state: Option<StateDict>,
    pub training_state: TrainingState,
}

impl Checkpoint {
    /// Checkpoint with an empty state dict, to be filled by the strategy.
    pub fn new(training_state: TrainingState) -> Self {
        Self {
            state_dict: StateDict::new(),
            optimizer_state: None,
            training_state,
        }
    }
}

/// Save a checkpoint to a directory.
pub fn save_checkpoint<P: AsRef<Path>>(dir: P, checkpoint: &Checkpoint) -> Result<()> {
    let dir = dir.as_ref();
    std::fs::create_dir_all(dir).map_err(|e| Error::TrainingError {
        reason: format!("failed to create checkpoint dir: {e}"),
    })?;

    candle_core::safetensors::save(&checkpoint.state_dict, dir.join("model.safetensors"))?;

    if let Some(opt_state) = &checkpoint.optimizer_state {
        if !opt_state.is_empty() {
            candle_core::safetensors::save(opt_state, dir.join("optimizer.safetensors"))?;
        }
    }

    // Always write the current version
    let mut state = checkpoint.training_state.clone();
    state.version = CHECKPOINT_VERSION;
    let json = serde_json::to_string_pretty(&state).map_err(|e| Error::TrainingError {
        reason: format!("failed to serialize training state: {e}"),
    })?;
    std::fs::write(dir.join("training_state.json"), json).map_err(|e| Error::TrainingError {
        reason: format!("failed to write training state: {e}"),
    })?;

    tracing::info!(
        dir = %dir.display(),
        step = state.step,
        tensors = checkpoint.state_dict.len(),
        "checkpoint saved"
    );
    Ok(())
}

/// Load a checkpoint from a directory onto `device`.
///
/// `optimizer_state` is `None` if `optimizer.safetensors` doesn't exist.
pub fn load_checkpoint<P: AsRef<Path>>(dir: P, device: &Device) -> Result<Checkpoint> {
    let dir = dir.as_ref();

    let state_dict = candle_core::safetensors::load(dir.join("model.safetensors"), device)?;

    let opt_path = dir.join("optimizer.safetensors");
    let optimizer_state = if opt_path.exists() {
        Some(candle_core::safetensors::load(&opt_path, device)?)
    } else {
        None
    };

    let json = std::fs::read_to_string(dir.join("training_state.json")).map_err(|e| {
        Error::TrainingError {
            reason: format!("failed to read training state: {e}"),
        }
    })?;
    let training_state: TrainingState =
        serde_json::from_str(&json).map_err(|e| Error::TrainingError {
            reason: format!("failed to parse training state: {e}"),
        })?;

    Ok(Checkpoint {
        state_dict,
        optimizer_state,
        training_state,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{cpu_device, make_model_state, make_training_state};
    use candle_core::Tensor;
    use tempfile::TempDir;

    #[test]
    fn test_save_and_load_checkpoint() {
        let dir = TempDir::new().unwrap();
        let device = cpu_device();

        let mut opt_state = StateDict::new();
        opt_state.insert(
            "layer.weight.m".to_string(),
            Tensor::new(&[0.01f32, 0.02], &device).unwrap(),
        );
        let checkpoint = Checkpoint {
            state_dict: make_model_state(&device),
            optimizer_state: Some(opt_state),
            training_state: TrainingState {
                version: CHECKPOINT_VERSION,
                step: 1000,
                epoch: 2,
                learning_rate: 3e-4,
                metadata: HashMap::new(),
            },
        };

        save_checkpoint(dir.path(), &checkpoint).unwrap();
        assert!(dir.path().join("model.safetensors").exists());
        assert!(dir.path().join("optimizer.safetensors").exists());
        assert!(dir.path().join("training_state.json").exists());

        let loaded = load_checkpoint(dir.path(), &device).unwrap();
        assert_eq!(loaded.state_dict.len(), 2);
        let w = &loaded.state_dict["layer.weight"];
        assert_eq!(w.dims(), &[2, 2]);
        let data = w.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert!((data[0] - 1.0).abs() < 1e-6);

        let opt = loaded.optimizer_state.unwrap();
        assert_eq!(opt.len(), 1);

        assert_eq!(loaded.training_state.step, 1000);
        assert_eq!(loaded.training_state.epoch, 2);
        assert!((loaded.training_state.learning_rate - 3e-4).abs() < 1e-10);
    }

    #[test]
    fn test_checkpoint_without_optimizer() {
        let dir = TempDir::new().unwrap();
        let device = cpu_device();

        let mut checkpoint = Checkpoint::new(make_training_state(42));
        checkpoint
            .state_dict
            .insert("w".to_string(), Tensor::new(&[1.0f32], &device).unwrap());

        save_checkpoint(dir.path(), &checkpoint).unwrap();
        assert!(!dir.path().join("optimizer.safetensors").exists());

        let loaded = load_checkpoint(dir.path(), &device).unwrap();
        assert!(loaded.optimizer_state.is_none());
        assert_eq!(loaded.training_state.step, 42);
        assert_eq!(loaded.training_state.version, CHECKPOINT_VERSION);
    }

    #[test]
    fn test_version_backward_compat() {
        let dir = TempDir::new().unwrap();
        let device = cpu_device();

        let mut state = StateDict::new();
        state.insert("w".to_string(), Tensor::new(&[1.0f32], &device).unwrap());
        candle_core::safetensors::save(&state, dir.path().join("model.safetensors")).unwrap();

        // v1 training state has no version field
        let json = r#"{"step": 100, "epoch": 5, "learning_rate": 0.001, "metadata": {}}"#;
        std::fs::write(dir.path().join("training_state.json"), json).unwrap();

        let loaded = load_checkpoint(dir.path(), &device).unwrap();
        assert_eq!(loaded.training_state.version, 1);
        assert_eq!(loaded.training_state.step, 100);
        assert_eq!(loaded.training_state.epoch, 5);
    }
}
