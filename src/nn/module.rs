//! Module trait: parameter access, state dicts, device placement and step hooks.

use std::collections::HashMap;
use std::sync::Arc;

use crate::distributed::comm::ProcessGroup;
use crate::distributed::sharding::WrapScope;
use crate::error::{Error, Result};
use candle_core::{Device, Tensor};

/// Name → tensor map used for checkpointing. Names use dot notation for
/// nested modules: `"layers.0.weight"`.
pub type StateDict = HashMap<String, Tensor>;

/// Which of the four step hooks a batch is dispatched to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StepKind {
    Train,
    Validation,
    Test,
    Predict,
}

impl StepKind {
    /// Name of the hook this step resolves to.
    pub fn hook_name(self) -> &'static str {
        match self {
            StepKind::Train => "training_step",
            StepKind::Validation => "validation_step",
            StepKind::Test => "test_step",
            StepKind::Predict => "predict_step",
        }
    }
}

/// Core trait for modules handled by a training strategy.
///
/// Covers both plain layers (which only expose parameters) and the user's
/// top-level training module (which also implements the step hooks).
/// Containers expose their submodules through `children` / `children_mut`
/// so that sharding engines can wrap them in place.
pub trait Module: Send {
    /// Named parameters, recursively. Names are relative to this module.
    fn named_parameters(&self) -> Vec<(String, &Tensor)>;

    /// Move every parameter to `device`.
    fn to_device(&mut self, device: &Device) -> Result<()>;

    /// Total number of scalar parameters.
    fn num_parameters(&self) -> usize {
        self.named_parameters()
            .iter()
            .map(|(_, t)| t.elem_count())
            .sum()
    }

    /// Direct submodules.
    fn children(&self) -> Vec<&dyn Module> {
        Vec::new()
    }

    /// Mutable slots of the direct submodules. Engines replace the boxed
    /// child to wrap it.
    fn children_mut(&mut self) -> Vec<&mut Box<dyn Module>> {
        Vec::new()
    }

    /// Whether this module is a sharded wrapper.
    fn is_sharded(&self) -> bool {
        false
    }

    /// The module inside this one, if this is a wrapper.
    fn wrapped(&self) -> Option<&dyn Module> {
        None
    }

    /// Move the wrapped module out, leaving an empty module behind.
    /// `None` for modules that do not wrap another.
    fn take_inner(&mut self) -> Option<Box<dyn Module>> {
        None
    }

    /// Export module state as a name → tensor map.
    fn state_dict(&self) -> Result<StateDict> {
        Ok(self
            .named_parameters()
            .into_iter()
            .map(|(name, t)| (name, t.clone()))
            .collect())
    }

    /// Switch batch-norm layers to synchronized statistics over `group`.
    ///
    /// Default recurses into children; layers with batch statistics override it.
    fn convert_sync_batchnorm(&mut self, group: &Arc<dyn ProcessGroup>) -> Result<()> {
        for child in self.children_mut() {
            child.convert_sync_batchnorm(group)?;
        }
        Ok(())
    }

    /// Hook called inside the sharded context so the user can wrap
    /// submodules manually.
    fn configure_sharded_model(&mut self, _scope: &WrapScope<'_>) -> Result<()> {
        Ok(())
    }

    /// Entry point used by strategies that call the model "as a whole".
    /// Wrappers override this to route into the module they hold.
    fn forward(&mut self, kind: StepKind, batch: &Tensor, batch_idx: usize) -> Result<Tensor> {
        dispatch_step(self, kind, batch, batch_idx)
    }

    fn training_step(&mut self, _batch: &Tensor, _batch_idx: usize) -> Result<Tensor> {
        Err(Error::StepNotImplemented {
            step: "training_step",
        })
    }

    fn validation_step(&mut self, _batch: &Tensor, _batch_idx: usize) -> Result<Tensor> {
        Err(Error::StepNotImplemented {
            step: "validation_step",
        })
    }

    fn test_step(&mut self, _batch: &Tensor, _batch_idx: usize) -> Result<Tensor> {
        Err(Error::StepNotImplemented { step: "test_step" })
    }

    fn predict_step(&mut self, _batch: &Tensor, _batch_idx: usize) -> Result<Tensor> {
        Err(Error::StepNotImplemented {
            step: "predict_step",
        })
    }
}

/// Call the step hook selected by `kind` on `module`.
pub fn dispatch_step<M: Module + ?Sized>(
    module: &mut M,
    kind: StepKind,
    batch: &Tensor,
    batch_idx: usize,
) -> Result<Tensor> {
    match kind {
        StepKind::Train => module.training_step(batch, batch_idx),
        StepKind::Validation => module.validation_step(batch, batch_idx),
        StepKind::Test => module.test_step(batch, batch_idx),
        StepKind::Predict => module.predict_step(batch, batch_idx),
    }
}

/// Whether `module` or any module below it is a sharded wrapper.
pub fn contains_sharded(module: &dyn Module) -> bool {
    module.is_sharded() || module.children().into_iter().any(contains_sharded)
}

/// Peel wrapper layers off until the user's module is reached.
pub fn unwrap_module(module: &dyn Module) -> &dyn Module {
    let mut current = module;
    while let Some(inner) = current.wrapped() {
        current = inner;
    }
    current
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nn::{Linear, Sequential};
    use crate::test_utils::{cpu_device, linear};

    struct Stepper;

    impl Module for Stepper {
        fn named_parameters(&self) -> Vec<(String, &Tensor)> {
            Vec::new()
        }

        fn to_device(&mut self, _device: &Device) -> Result<()> {
            Ok(())
        }

        fn training_step(&mut self, batch: &Tensor, _batch_idx: usize) -> Result<Tensor> {
            Ok(batch.clone())
        }
    }

    #[test]
    fn test_num_parameters() {
        let device = cpu_device();
        let layer: Linear = linear(&device, 2, 3);
        assert_eq!(layer.num_parameters(), 6 + 3);
    }

    #[test]
    fn test_default_forward_dispatches_by_kind() {
        let device = cpu_device();
        let batch = Tensor::new(&[1.0f32, 2.0], &device).unwrap();
        let mut m = Stepper;

        let out = m.forward(StepKind::Train, &batch, 0).unwrap();
        assert_eq!(out.to_vec1::<f32>().unwrap(), vec![1.0, 2.0]);

        let err = m.forward(StepKind::Validation, &batch, 0).unwrap_err();
        assert!(matches!(
            err,
            Error::StepNotImplemented {
                step: "validation_step"
            }
        ));
    }

    #[test]
    fn test_contains_sharded_plain_tree() {
        let device = cpu_device();
        let mut seq = Sequential::new();
        seq.push(linear(&device, 2, 2));
        seq.push(linear(&device, 2, 2));
        assert!(!contains_sharded(&seq));
        assert_eq!(unwrap_module(&seq).num_parameters(), seq.num_parameters());
    }

    #[test]
    fn test_hook_names() {
        assert_eq!(StepKind::Train.hook_name(), "training_step");
        assert_eq!(StepKind::Predict.hook_name(), "predict_step");
    }
}
