//! Dense linear layer

use crate::error::Result;
use crate::nn::module::Module;
use candle_core::{Device, Tensor};

/// Dense linear layer: output = input @ weight^T + bias
pub struct Linear {
    weight: Tensor,
    bias: Option<Tensor>,
}

impl Linear {
    /// Create from loaded tensors. `weight` is `[out_features, in_features]`.
    pub fn new(weight: Tensor, bias: Option<Tensor>) -> Self {
        Self { weight, bias }
    }

    /// input: `[batch, in_features]`, output: `[batch, out_features]`
    pub fn apply(&self, input: &Tensor) -> Result<Tensor> {
        let output = input.matmul(&self.weight.t()?)?;
        match &self.bias {
            Some(bias) => Ok(output.broadcast_add(bias)?),
            None => Ok(output),
        }
    }

    pub fn weight(&self) -> &Tensor {
        &self.weight
    }

    pub fn bias(&self) -> Option<&Tensor> {
        self.bias.as_ref()
    }
}

impl Module for Linear {
    fn named_parameters(&self) -> Vec<(String, &Tensor)> {
        let mut params = vec![("weight".to_string(), &self.weight)];
        if let Some(b) = &self.bias {
            params.push(("bias".to_string(), b));
        }
        params
    }

    fn to_device(&mut self, device: &Device) -> Result<()> {
        self.weight = self.weight.to_device(device)?;
        if let Some(b) = self.bias.take() {
            self.bias = Some(b.to_device(device)?);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::cpu_device;

    #[test]
    fn test_linear_apply() {
        let device = cpu_device();
        let weight = Tensor::new(&[[1.0f32, 0.0], [0.0, 2.0]], &device).unwrap();
        let bias = Tensor::new(&[0.5f32, -0.5], &device).unwrap();
        let layer = Linear::new(weight, Some(bias));

        let input = Tensor::new(&[[1.0f32, 1.0]], &device).unwrap();
        let out = layer.apply(&input).unwrap();
        assert_eq!(out.to_vec2::<f32>().unwrap(), vec![vec![1.5, 1.5]]);
    }

    #[test]
    fn test_linear_named_parameters() {
        let device = cpu_device();
        let weight = Tensor::zeros((3, 2), candle_core::DType::F32, &device).unwrap();
        let layer = Linear::new(weight, None);
        let names: Vec<String> = layer.named_parameters().into_iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["weight".to_string()]);
        assert_eq!(layer.num_parameters(), 6);
    }
}
