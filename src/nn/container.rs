//! Sequential container of boxed submodules.

use crate::error::Result;
use crate::nn::module::Module;
use candle_core::{Device, Tensor};

/// Ordered list of submodules. Parameter names are prefixed by the
/// submodule index: `"0.weight"`, `"1.bias"`.
#[derive(Default)]
pub struct Sequential {
    layers: Vec<Box<dyn Module>>,
}

impl Sequential {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a submodule.
    pub fn push<M: Module + 'static>(&mut self, layer: M) {
        self.layers.push(Box::new(layer));
    }

    /// Append an already boxed submodule.
    pub fn push_boxed(&mut self, layer: Box<dyn Module>) {
        self.layers.push(layer);
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    pub fn get(&self, idx: usize) -> Option<&dyn Module> {
        self.layers.get(idx).map(|l| l.as_ref())
    }
}

impl Module for Sequential {
    fn named_parameters(&self) -> Vec<(String, &Tensor)> {
        self.layers
            .iter()
            .enumerate()
            .flat_map(|(i, layer)| {
                layer
                    .named_parameters()
                    .into_iter()
                    .map(move |(name, t)| (format!("{i}.{name}"), t))
            })
            .collect()
    }

    fn to_device(&mut self, device: &Device) -> Result<()> {
        for layer in &mut self.layers {
            layer.to_device(device)?;
        }
        Ok(())
    }

    fn children(&self) -> Vec<&dyn Module> {
        self.layers.iter().map(|l| l.as_ref()).collect()
    }

    fn children_mut(&mut self) -> Vec<&mut Box<dyn Module>> {
        self.layers.iter_mut().collect()
    }
}
