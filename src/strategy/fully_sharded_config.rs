//! Configuration for the fully sharded strategy

use crate::error::{Error, Result};
use candle_core::DType;
use serde::{Deserialize, Serialize};

/// Dtype of full parameters during computation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComputeDType {
    F32,
    F16,
    BF16,
}

impl From<ComputeDType> for DType {
    fn from(dtype: ComputeDType) -> Self {
        match dtype {
            ComputeDType::F32 => DType::F32,
            ComputeDType::F16 => DType::F16,
            ComputeDType::BF16 => DType::BF16,
        }
    }
}

/// How the strategy wraps the user's module.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WrapMode {
    /// No strategy-side wrapping; the user wraps submodules inside
    /// `configure_sharded_model`.
    Manual,
    /// Wrap the whole module as one sharded unit.
    WholeModule,
    /// Wrap recursively, splitting on `min_num_params`.
    AutoRecursive,
}

/// Fully sharded strategy configuration.
///
/// Deserializes with every field optional so that registry presets can be
/// written as keyword overrides: `{"module_auto_wrap": true}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FullyShardedConfig {
    /// Offload FP32 params to CPU. Only usable with mixed precision.
    pub cpu_offload: bool,
    /// Move gradient shards to CPU after reduction. Defaults to `cpu_offload`.
    pub move_grads_to_cpu: Option<bool>,
    /// Flatten parameters into one contiguous buffer per sharded unit.
    pub flatten_parameters: bool,
    /// Reshard after the forward pass. Only relevant with nested wrappers.
    pub reshard_after_forward: bool,
    /// Reduce-scatter gradients in FP32. Only relevant with mixed precision.
    pub fp32_reduce_scatter: Option<bool>,
    pub compute_dtype: Option<ComputeDType>,
    /// Gradient bucket size in MB; values <= 0 disable bucketing.
    pub bucket_cap_mb: i64,
    pub module_wrap: bool,
    pub module_auto_wrap: bool,
    /// Parameter threshold for auto-wrap.
    pub min_num_params: usize,
}

impl Default for FullyShardedConfig {
    fn default() -> Self {
        Self {
            cpu_offload: false,
            move_grads_to_cpu: None,
            flatten_parameters: true,
            reshard_after_forward: true,
            fp32_reduce_scatter: None,
            compute_dtype: None,
            bucket_cap_mb: 25,
            module_wrap: false,
            module_auto_wrap: false,
            min_num_params: 100_000_000,
        }
    }
}

impl FullyShardedConfig {
    pub fn with_cpu_offload(mut self, cpu_offload: bool) -> Self {
        self.cpu_offload = cpu_offload;
        self
    }

    pub fn with_move_grads_to_cpu(mut self, move_grads_to_cpu: Option<bool>) -> Self {
        self.move_grads_to_cpu = move_grads_to_cpu;
        self
    }

    pub fn with_flatten_parameters(mut self, flatten: bool) -> Self {
        self.flatten_parameters = flatten;
        self
    }

    pub fn with_reshard_after_forward(mut self, reshard: bool) -> Self {
        self.reshard_after_forward = reshard;
        self
    }

    pub fn with_fp32_reduce_scatter(mut self, fp32: Option<bool>) -> Self {
        self.fp32_reduce_scatter = fp32;
        self
    }

    pub fn with_compute_dtype(mut self, dtype: Option<ComputeDType>) -> Self {
        self.compute_dtype = dtype;
        self
    }

    pub fn with_bucket_cap_mb(mut self, mb: i64) -> Self {
        self.bucket_cap_mb = mb;
        self
    }

    pub fn with_module_wrap(mut self, wrap: bool) -> Self {
        self.module_wrap = wrap;
        self
    }

    pub fn with_module_auto_wrap(mut self, auto_wrap: bool) -> Self {
        self.module_auto_wrap = auto_wrap;
        self
    }

    pub fn with_min_num_params(mut self, min_num_params: usize) -> Self {
        self.min_num_params = min_num_params;
        self
    }

    /// Resolve the two wrap flags into a single mode.
    pub fn wrap_mode(&self) -> Result<WrapMode> {
        match (self.module_wrap, self.module_auto_wrap) {
            (true, true) => Err(Error::Misconfiguration {
                reason: "`module_wrap` and `module_auto_wrap` are mutually exclusive; \
                         enable at most one, or wrap submodules manually in \
                         `configure_sharded_model`"
                    .to_string(),
            }),
            (true, false) => Ok(WrapMode::WholeModule),
            (false, true) => Ok(WrapMode::AutoRecursive),
            (false, false) => Ok(WrapMode::Manual),
        }
    }

    pub fn validate(&self) -> Result<()> {
        self.wrap_mode().map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = FullyShardedConfig::default();
        assert!(!config.cpu_offload);
        assert!(config.flatten_parameters);
        assert!(config.reshard_after_forward);
        assert_eq!(config.bucket_cap_mb, 25);
        assert_eq!(config.min_num_params, 100_000_000);
        assert_eq!(config.wrap_mode().unwrap(), WrapMode::Manual);
    }

    #[test]
    fn test_wrap_modes() {
        let base = FullyShardedConfig::default();
        assert_eq!(
            base.clone().with_module_wrap(true).wrap_mode().unwrap(),
            WrapMode::WholeModule
        );
        assert_eq!(
            base.clone().with_module_auto_wrap(true).wrap_mode().unwrap(),
            WrapMode::AutoRecursive
        );
        let both = base.with_module_wrap(true).with_module_auto_wrap(true);
        assert!(matches!(both.validate(), Err(Error::Misconfiguration { .. })));
    }

    #[test]
    fn test_deserialize_overrides() {
        let config: FullyShardedConfig =
            serde_json::from_str(r#"{"module_auto_wrap": true, "compute_dtype": "bf16"}"#).unwrap();
        assert!(config.module_auto_wrap);
        assert_eq!(config.compute_dtype, Some(ComputeDType::BF16));
        assert_eq!(DType::from(ComputeDType::BF16), DType::BF16);
        assert_eq!(config.bucket_cap_mb, 25);
    }

    #[test]
    fn test_deserialize_rejects_unknown() {
        let res: std::result::Result<FullyShardedConfig, _> =
            serde_json::from_str(r#"{"module_wrapp": true}"#);
        assert!(res.is_err());
    }
}
