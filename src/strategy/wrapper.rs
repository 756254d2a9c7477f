//! Wrapper that lets a strategy call the user's module "as a whole".

use crate::error::Result;
use crate::nn::Sequential;
use crate::nn::module::{Module, StateDict, StepKind, dispatch_step};
use candle_core::{Device, Tensor};

/// Key prefix the wrapper adds to every parameter and state-dict entry.
pub const WRAPPED_MODULE_PREFIX: &str = "module.";

/// Holds the user's module under the name `module` and routes `forward`
/// to the step hook for the requested step.
pub struct TrainingModuleWrapper {
    module: Box<dyn Module>,
}

impl TrainingModuleWrapper {
    pub fn new(module: Box<dyn Module>) -> Self {
        Self { module }
    }

    pub fn into_inner(self) -> Box<dyn Module> {
        self.module
    }
}

impl Module for TrainingModuleWrapper {
    fn named_parameters(&self) -> Vec<(String, &Tensor)> {
        self.module
            .named_parameters()
            .into_iter()
            .map(|(name, t)| (format!("{WRAPPED_MODULE_PREFIX}{name}"), t))
            .collect()
    }

    fn to_device(&mut self, device: &Device) -> Result<()> {
        self.module.to_device(device)
    }

    fn children(&self) -> Vec<&dyn Module> {
        vec![self.module.as_ref()]
    }

    fn children_mut(&mut self) -> Vec<&mut Box<dyn Module>> {
        vec![&mut self.module]
    }

    fn wrapped(&self) -> Option<&dyn Module> {
        Some(self.module.as_ref())
    }

    fn take_inner(&mut self) -> Option<Box<dyn Module>> {
        Some(std::mem::replace(&mut self.module, Box::new(Sequential::new())))
    }

    fn state_dict(&self) -> Result<StateDict> {
        Ok(self
            .module
            .state_dict()?
            .into_iter()
            .map(|(name, t)| (format!("{WRAPPED_MODULE_PREFIX}{name}"), t))
            .collect())
    }

    fn forward(&mut self, kind: StepKind, batch: &Tensor, batch_idx: usize) -> Result<Tensor> {
        dispatch_step(self.module.as_mut(), kind, batch, batch_idx)
    }

    fn training_step(&mut self, batch: &Tensor, batch_idx: usize) -> Result<Tensor> {
        self.module.training_step(batch, batch_idx)
    }

    fn validation_step(&mut self, batch: &Tensor, batch_idx: usize) -> Result<Tensor> {
        self.module.validation_step(batch, batch_idx)
    }

    fn test_step(&mut self, batch: &Tensor, batch_idx: usize) -> Result<Tensor> {
        self.module.test_step(batch, batch_idx)
    }

    fn predict_step(&mut self, batch: &Tensor, batch_idx: usize) -> Result<Tensor> {
        self.module.predict_step(batch, batch_idx)
    }
}
