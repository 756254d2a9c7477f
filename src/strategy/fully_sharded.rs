//! Fully sharded data-parallel strategy.
//!
//! Shards parameters, gradients and optimizer state across ranks instead of
//! replicating them. The sharding itself is done by a `ShardingEngine`; this
//! strategy decides when a sharding scope is open, what gets wrapped inside
//! it, and how the result is placed, stepped and checkpointed.
//!
//! Lifecycle:
//!
//! 1. `call_configure_sharded_model()` (optional): the user wraps
//!    submodules by hand inside the sharded context
//! 2. `pre_dispatch()`: wrap per `WrapMode`, move to device, build
//!    optimizers, barrier
//! 3. step hooks: routed through the wrapper or straight to the model
//! 4. `on_save()`: gathered, re-keyed state dict

use std::sync::{Arc, OnceLock};

use crate::distributed::comm::{Communicator, ProcessGroup};
use crate::distributed::sharding::{
    AutoWrapPolicy, ShardingEngine, WrapContext, WrapError, WrapScope,
};
use crate::error::{Error, Result};
use crate::nn::module::{Module, StateDict, StepKind, contains_sharded, dispatch_step};
use crate::strategy::ddp::DdpStrategy;
use crate::strategy::fully_sharded_config::{FullyShardedConfig, WrapMode};
use crate::strategy::registry::StrategyRegistry;
use crate::strategy::wrapper::{TrainingModuleWrapper, WRAPPED_MODULE_PREFIX};
use crate::strategy::Strategy;
use crate::trainer::checkpoint::Checkpoint;
use crate::trainer::config::Precision;
use crate::trainer::context::TrainerContext;
use candle_core::{Device, Tensor};
use serde_json::{Map, Value, json};

/// How step hooks reach the model once it is configured.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepDispatch {
    /// The whole module is wrapped: go through the base strategy, which
    /// calls the wrapper's `forward`.
    Wrapped,
    /// Call the step hook on the model directly.
    Direct,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Unconfigured,
    Sharded(StepDispatch),
}

/// Fully sharded training strategy.
///
/// # Usage
///
/// ```ignore
/// let config = FullyShardedConfig::default()
///     .with_module_auto_wrap(true)
///     .with_min_num_params(1_000_000);
/// let mut fsdp = FullyShardedStrategy::new(config, DdpStrategy::new(devices))?;
///
/// fsdp.connect(Box::new(model));
/// fsdp.setup_distributed(comm)?;
/// fsdp.pre_dispatch(&mut trainer)?;
///
/// let loss = fsdp.training_step(&batch, 0)?;
/// let checkpoint = fsdp.on_save(Checkpoint::new(state))?;
/// ```
pub struct FullyShardedStrategy {
    base: DdpStrategy,
    config: FullyShardedConfig,
    engine: Arc<dyn ShardingEngine>,
    process_group: OnceLock<Arc<dyn ProcessGroup>>,
    phase: Phase,
}

impl FullyShardedStrategy {
    /// Create a strategy backed by the built-in sharding engine.
    #[cfg(feature = "sharding")]
    pub fn new(config: FullyShardedConfig, base: DdpStrategy) -> Result<Self> {
        let engine = Arc::new(crate::distributed::sharding::LocalShardingEngine::new());
        Self::with_engine(config, base, engine)
    }

    /// Create a strategy backed by the built-in sharding engine.
    ///
    /// Always fails: this build has no built-in engine.
    #[cfg(not(feature = "sharding"))]
    pub fn new(_config: FullyShardedConfig, _base: DdpStrategy) -> Result<Self> {
        Err(Error::Misconfiguration {
            reason: "fully sharded training is not available: build with the `sharding` \
                     feature or supply an engine through `FullyShardedStrategy::with_engine`"
                .to_string(),
        })
    }

    /// Create a strategy backed by `engine`.
    pub fn with_engine(
        config: FullyShardedConfig,
        base: DdpStrategy,
        engine: Arc<dyn ShardingEngine>,
    ) -> Result<Self> {
        if !engine.is_available() {
            return Err(Error::Misconfiguration {
                reason: format!(
                    "fully sharded training is not available: sharding engine '{}' is not installed",
                    engine.name()
                ),
            });
        }
        config.validate()?;

        Ok(Self {
            base,
            config,
            engine,
            process_group: OnceLock::new(),
            phase: Phase::Unconfigured,
        })
    }

    pub fn config(&self) -> &FullyShardedConfig {
        &self.config
    }

    pub fn base(&self) -> &DdpStrategy {
        &self.base
    }

    pub fn engine(&self) -> &Arc<dyn ShardingEngine> {
        &self.engine
    }

    /// `None` until `pre_dispatch` has configured the model.
    pub fn step_dispatch(&self) -> Option<StepDispatch> {
        match self.phase {
            Phase::Unconfigured => None,
            Phase::Sharded(dispatch) => Some(dispatch),
        }
    }

    /// Whether the strategy wrapped the whole module.
    pub fn module_wrapped(&self) -> bool {
        self.phase == Phase::Sharded(StepDispatch::Wrapped)
    }

    /// Process group for the sharding engine's collectives.
    ///
    /// Created from the communicator on first access, then the same
    /// group is returned for the lifetime of the strategy.
    pub fn communication_group(&self) -> Result<Arc<dyn ProcessGroup>> {
        if let Some(group) = self.process_group.get() {
            return Ok(Arc::clone(group));
        }
        let group = self.base.communicator()?.new_group()?;
        tracing::debug!(
            rank = group.rank(),
            world_size = group.world_size(),
            "created sharding process group"
        );
        Ok(Arc::clone(self.process_group.get_or_init(|| group)))
    }

    pub fn setup_distributed(&mut self, comm: Arc<dyn Communicator>) -> Result<()> {
        self.base.setup_distributed(comm)?;
        let device = self.base.root_device();
        if device.is_cuda() {
            self.base.communicator()?.bind_device(device)?;
            tracing::info!(device = ?device.location(), "pinned root device");
        }
        Ok(())
    }

    /// The configuration bundle a sharding scope is opened with.
    pub fn wrap_context(&self, trainer: &dyn TrainerContext) -> Result<WrapContext> {
        Ok(WrapContext {
            process_group: self.communication_group()?,
            auto_wrap_policy: AutoWrapPolicy::new(self.config.min_num_params),
            cpu_offload: self.config.cpu_offload,
            move_grads_to_cpu: self.config.move_grads_to_cpu,
            flatten_parameters: self.config.flatten_parameters,
            mixed_precision: trainer.precision() == Precision::Mixed,
            reshard_after_forward: self.config.reshard_after_forward,
            fp32_reduce_scatter: self.config.fp32_reduce_scatter,
            compute_dtype: self.config.compute_dtype.map(Into::into),
            bucket_cap_mb: self.config.bucket_cap_mb,
        })
    }

    /// Run `f` inside an open sharding scope. The scope is closed before
    /// this returns, whether `f` succeeds, fails or panics.
    pub fn model_sharded_context<T, F>(&self, trainer: &dyn TrainerContext, f: F) -> Result<T>
    where
        F: FnOnce(&WrapScope<'_>) -> Result<T>,
    {
        let ctx = self.wrap_context(trainer)?;
        let scope = WrapScope::enter(self.engine.as_ref(), ctx)?;
        let result = f(&scope);
        drop(scope);
        result
    }

    /// Let the user's module wrap its own submodules inside the sharded
    /// context.
    pub fn call_configure_sharded_model(&mut self, trainer: &dyn TrainerContext) -> Result<()> {
        let mut model = self.base.take_model()?;
        let result =
            self.model_sharded_context(trainer, |scope| model.configure_sharded_model(scope));
        self.base.connect(model);
        result
    }

    /// Wrap the model according to the wrap mode, place it, and build
    /// optimizers over the final parameters.
    ///
    /// If the scope cannot be opened or a wrap fails, the unwrapped model
    /// stays connected and the call can be retried.
    pub fn configure_ddp(&mut self, trainer: &mut dyn TrainerContext) -> Result<()> {
        let mode = self.config.wrap_mode()?;
        let ctx = self.wrap_context(&*trainer)?;
        let scope = WrapScope::enter(self.engine.as_ref(), ctx)?;
        let model = self.base.take_model()?;
        let outcome = wrap_for_mode(&scope, mode, model);
        drop(scope);

        let (model, dispatch) = match outcome {
            Ok(configured) => configured,
            Err(WrapError { module, error }) => {
                tracing::warn!(
                    mode = ?mode,
                    error = %error,
                    "wrapping failed; model left unwrapped"
                );
                self.base.connect(module);
                return Err(error);
            }
        };

        tracing::info!(
            mode = ?mode,
            dispatch = ?dispatch,
            num_params = model.num_parameters(),
            "model configured for fully sharded training"
        );
        self.base.connect(model);
        self.phase = Phase::Sharded(dispatch);

        if self.config.cpu_offload {
            tracing::debug!("cpu offload enabled; device placement left to the sharding engine");
        } else {
            self.base.model_to_device()?;
        }

        let model = self.base.model().ok_or_else(|| Error::TrainingError {
            reason: "model missing after wrapping".to_string(),
        })?;
        trainer.setup_optimizers(model)
    }

    /// Collect the full state dict from all ranks. When the whole module
    /// was wrapped, the wrapper's key prefix is removed so keys match the
    /// user's module.
    pub fn collate_state_dict(&self) -> Result<StateDict> {
        let model = self.base.model().ok_or_else(|| Error::TrainingError {
            reason: "no model connected to the strategy".to_string(),
        })?;
        let state = model.state_dict()?;
        if !self.module_wrapped() {
            return Ok(state);
        }
        Ok(state
            .into_iter()
            .map(|(key, tensor)| {
                let key = key
                    .strip_prefix(WRAPPED_MODULE_PREFIX)
                    .map(str::to_string)
                    .unwrap_or(key);
                (key, tensor)
            })
            .collect())
    }

    fn step(&mut self, kind: StepKind, batch: &Tensor, batch_idx: usize) -> Result<Tensor> {
        match self.phase {
            Phase::Unconfigured => Err(Error::TrainingError {
                reason: format!("`{}` called before pre_dispatch", kind.hook_name()),
            }),
            Phase::Sharded(StepDispatch::Wrapped) => self.base.step(kind, batch, batch_idx),
            Phase::Sharded(StepDispatch::Direct) => {
                dispatch_step(self.base.model_mut()?.as_mut(), kind, batch, batch_idx)
            }
        }
    }

    /// Register the fully sharded presets: `fsdp` (whole-module wrap),
    /// `fsdp_auto_wrap` (recursive wrap) and `fsdp_manual` (user wraps).
    pub fn register_strategies(registry: &mut StrategyRegistry) -> Result<()> {
        registry.register(
            "fsdp",
            "FullyShardedStrategy",
            build_from_params,
            "Fully sharded training with the whole module wrapped",
            overrides(json!({ "module_wrap": true })),
        )?;
        registry.register(
            "fsdp_auto_wrap",
            "FullyShardedStrategy",
            build_from_params,
            "Fully sharded training with recursive wrapping of the module",
            overrides(json!({ "module_auto_wrap": true })),
        )?;
        registry.register(
            "fsdp_manual",
            "FullyShardedStrategy",
            build_from_params,
            "Fully sharded training with manual wrapping of the model",
            Map::new(),
        )?;
        Ok(())
    }
}

fn overrides(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

/// Wrap `model` inside `scope` as `mode` asks. On failure the module
/// handed back is the user's model, without the training wrapper.
fn wrap_for_mode(
    scope: &WrapScope<'_>,
    mode: WrapMode,
    model: Box<dyn Module>,
) -> std::result::Result<(Box<dyn Module>, StepDispatch), WrapError> {
    match mode {
        WrapMode::AutoRecursive if contains_sharded(model.as_ref()) => {
            tracing::warn!("model already contains sharded submodules; skipping auto-wrap");
            Ok((model, StepDispatch::Direct))
        }
        WrapMode::AutoRecursive => {
            let wrapped = scope
                .auto_wrap(Box::new(TrainingModuleWrapper::new(model)))
                .map_err(unwrap_training_wrapper)?;
            let wrapped = if wrapped.is_sharded() {
                wrapped
            } else {
                scope.wrap(wrapped).map_err(unwrap_training_wrapper)?
            };
            Ok((wrapped, StepDispatch::Wrapped))
        }
        WrapMode::WholeModule => {
            let wrapped = scope
                .wrap(Box::new(TrainingModuleWrapper::new(model)))
                .map_err(unwrap_training_wrapper)?;
            Ok((wrapped, StepDispatch::Wrapped))
        }
        WrapMode::Manual => Ok((model, StepDispatch::Direct)),
    }
}

fn unwrap_training_wrapper(mut err: WrapError) -> WrapError {
    if let Some(inner) = err.module.take_inner() {
        err.module = inner;
    }
    err
}

fn build_from_params(params: &Map<String, Value>, base: DdpStrategy) -> Result<Box<dyn Strategy>> {
    let config: FullyShardedConfig = serde_json::from_value(Value::Object(params.clone()))
        .map_err(|e| Error::Misconfiguration {
            reason: format!("invalid fully sharded options: {e}"),
        })?;
    Ok(Box::new(FullyShardedStrategy::new(config, base)?))
}

impl Strategy for FullyShardedStrategy {
    fn name(&self) -> &'static str {
        "fully_sharded"
    }

    fn connect(&mut self, model: Box<dyn Module>) {
        self.base.connect(model);
    }

    fn setup_distributed(&mut self, comm: Arc<dyn Communicator>) -> Result<()> {
        FullyShardedStrategy::setup_distributed(self, comm)
    }

    fn root_device(&self) -> &Device {
        self.base.root_device()
    }

    fn pre_dispatch(&mut self, trainer: &mut dyn TrainerContext) -> Result<()> {
        if self.phase != Phase::Unconfigured {
            return Err(Error::TrainingError {
                reason: "pre_dispatch already ran; the model is already sharded".to_string(),
            });
        }
        if self.base.sync_batchnorm() {
            self.base.configure_sync_batchnorm()?;
        }
        self.configure_ddp(trainer)?;
        self.base.barrier("pre_dispatch")
    }

    fn barrier(&self, name: &str) -> Result<()> {
        self.base.barrier(name)
    }

    fn model(&self) -> Option<&dyn Module> {
        self.base.model()
    }

    fn training_step(&mut self, batch: &Tensor, batch_idx: usize) -> Result<Tensor> {
        self.step(StepKind::Train, batch, batch_idx)
    }

    fn validation_step(&mut self, batch: &Tensor, batch_idx: usize) -> Result<Tensor> {
        self.step(StepKind::Validation, batch, batch_idx)
    }

    fn test_step(&mut self, batch: &Tensor, batch_idx: usize) -> Result<Tensor> {
        self.step(StepKind::Test, batch, batch_idx)
    }

    fn predict_step(&mut self, batch: &Tensor, batch_idx: usize) -> Result<Tensor> {
        self.step(StepKind::Predict, batch, batch_idx)
    }

    // Gradients are already reduce-scattered into their shards.
    fn post_training_step(&mut self) {}

    fn on_save(&self, mut checkpoint: Checkpoint) -> Result<Checkpoint> {
        checkpoint.state_dict = self.collate_state_dict()?;
        Ok(checkpoint)
    }

    fn setup_optimizers_in_pre_dispatch(&self) -> bool {
        true
    }
}
