//! The orchestrator side of the strategy contract.
//!
//! A strategy reads the active precision from the trainer and asks it to
//! build optimizers once the model has reached its final, possibly
//! sharded, form.

use crate::error::{Error, Result};
use crate::nn::module::Module;
use crate::trainer::config::{Precision, TrainingConfig};

/// What a strategy needs from the training orchestrator.
pub trait TrainerContext {
    /// Active precision mode.
    fn precision(&self) -> Precision;

    /// Build optimizers over the parameters `model` exposes now.
    fn setup_optimizers(&mut self, model: &dyn Module) -> Result<()>;
}

/// Parameters sharing one set of optimizer hyperparameters.
#[derive(Debug, Clone, PartialEq)]
pub struct ParamGroup {
    /// (name, shape) of every parameter in the group.
    pub params: Vec<(String, Vec<usize>)>,
    pub lr: f64,
    pub weight_decay: f64,
}

/// Minimal orchestrator: holds precision and training config, and builds
/// AdamW-style param groups (matrices decay, vectors do not).
#[derive(Debug, Clone, Default)]
pub struct Trainer {
    precision: Precision,
    config: TrainingConfig,
    param_groups: Option<Vec<ParamGroup>>,
}

impl Trainer {
    pub fn new(precision: Precision, config: TrainingConfig) -> Self {
        Self {
            precision,
            config,
            param_groups: None,
        }
    }

    pub fn config(&self) -> &TrainingConfig {
        &self.config
    }

    /// Param groups built by the last `setup_optimizers` call.
    pub fn param_groups(&self) -> Option<&[ParamGroup]> {
        self.param_groups.as_deref()
    }

    /// Total number of parameters tracked by the optimizer.
    pub fn num_optimized_params(&self) -> usize {
        self.param_groups
            .iter()
            .flatten()
            .map(|g| g.params.len())
            .sum()
    }
}

impl TrainerContext for Trainer {
    fn precision(&self) -> Precision {
        self.precision
    }

    fn setup_optimizers(&mut self, model: &dyn Module) -> Result<()> {
        let mut decay = Vec::new();
        let mut no_decay = Vec::new();

        let mut params = model.named_parameters();
        params.sort_by(|a, b| a.0.cmp(&b.0));
        for (name, tensor) in params {
            let shape = tensor.dims().to_vec();
            if shape.len() >= 2 {
                decay.push((name, shape));
            } else {
                no_decay.push((name, shape));
            }
        }

        if decay.is_empty() && no_decay.is_empty() {
            return Err(Error::TrainingError {
                reason: "model has no parameters to optimize".to_string(),
            });
        }

        let groups = vec![
            ParamGroup {
                params: decay,
                lr: self.config.learning_rate,
                weight_decay: self.config.weight_decay,
            },
            ParamGroup {
                params: no_decay,
                lr: self.config.learning_rate,
                weight_decay: 0.0,
            },
        ];
        tracing::info!(
            decay = groups[0].params.len(),
            no_decay = groups[1].params.len(),
            lr = self.config.learning_rate,
            "optimizer param groups built"
        );
        self.param_groups = Some(groups);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{cpu_device, linear};

    #[test]
    fn test_setup_optimizers_splits_decay() {
        let device = cpu_device();
        let layer = linear(&device, 3, 2);
        let mut trainer = Trainer::new(Precision::Full, TrainingConfig::default().with_lr(0.1));

        assert!(trainer.param_groups().is_none());
        trainer.setup_optimizers(&layer).unwrap();

        let groups = trainer.param_groups().unwrap();
        assert_eq!(groups[0].params, vec![("weight".to_string(), vec![2, 3])]);
        assert_eq!(groups[1].params, vec![("bias".to_string(), vec![2])]);
        assert_eq!(groups[1].weight_decay, 0.0);
        assert_eq!(groups[0].lr, 0.1);
        assert_eq!(trainer.num_optimized_params(), 2);
    }

    #[test]
    fn test_setup_optimizers_empty_model() {
        let mut trainer = Trainer::default();
        let empty = crate::nn::Sequential::new();
        assert!(trainer.setup_optimizers(&empty).is_err());
    }
}
