//! Sharding engine seam.
//!
//! A `ShardingEngine` owns the actual parameter partitioning. Strategies
//! talk to it only through a `WrapScope`: the scope is opened with the full
//! configuration bundle (`WrapContext`), every wrap call inside it uses that
//! bundle, and dropping the scope closes it on the engine again.

#[cfg(feature = "sharding")]
pub mod local;

use std::fmt;
use std::sync::Arc;

use crate::distributed::comm::ProcessGroup;
use crate::error::{Error, Result};
use crate::nn::module::Module;
use candle_core::{DType, Device, Tensor};

#[cfg(feature = "sharding")]
pub use local::{FullyShardedModule, LocalShardingEngine};

/// Wraps a module once its parameters that are not already inside a
/// sharded submodule reach `min_num_params`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AutoWrapPolicy {
    pub min_num_params: usize,
}

impl AutoWrapPolicy {
    pub fn new(min_num_params: usize) -> Self {
        Self { min_num_params }
    }

    pub fn should_wrap(&self, module: &dyn Module) -> bool {
        !module.is_sharded() && unwrapped_num_parameters(module) >= self.min_num_params
    }
}

/// Parameters of `module` that no sharded wrapper below it accounts for.
pub fn unwrapped_num_parameters(module: &dyn Module) -> usize {
    if module.is_sharded() {
        return 0;
    }
    let sharded: usize = module
        .children()
        .into_iter()
        .map(sharded_num_parameters)
        .sum();
    module.num_parameters().saturating_sub(sharded)
}

fn sharded_num_parameters(module: &dyn Module) -> usize {
    if module.is_sharded() {
        module.num_parameters()
    } else {
        module
            .children()
            .into_iter()
            .map(sharded_num_parameters)
            .sum()
    }
}

/// Configuration bundle handed to the engine for every wrap inside a scope.
///
/// Apart from the process group and the auto-wrap policy these are opaque
/// passthrough knobs; their meaning is the engine's business.
#[derive(Debug, Clone)]
pub struct WrapContext {
    pub process_group: Arc<dyn ProcessGroup>,
    pub auto_wrap_policy: AutoWrapPolicy,
    pub cpu_offload: bool,
    pub move_grads_to_cpu: Option<bool>,
    pub flatten_parameters: bool,
    pub mixed_precision: bool,
    pub reshard_after_forward: bool,
    pub fp32_reduce_scatter: Option<bool>,
    pub compute_dtype: Option<DType>,
    /// Gradient bucket size in MB; values <= 0 disable bucketing.
    pub bucket_cap_mb: i64,
}

/// A failed wrap. The engine hands the module back so the caller keeps
/// ownership of the model; submodules wrapped before the failure stay
/// wrapped.
pub struct WrapError {
    pub module: Box<dyn Module>,
    pub error: Error,
}

impl WrapError {
    pub fn new(module: Box<dyn Module>, error: Error) -> Self {
        Self { module, error }
    }
}

impl fmt::Debug for WrapError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WrapError")
            .field("error", &self.error)
            .finish_non_exhaustive()
    }
}

impl From<WrapError> for Error {
    fn from(err: WrapError) -> Self {
        err.error
    }
}

/// Result of a wrap call: the wrapped module, or the original back.
pub type WrapResult = std::result::Result<Box<dyn Module>, WrapError>;

/// The engine that performs parameter sharding.
pub trait ShardingEngine: Send + Sync {
    fn name(&self) -> &str;

    /// Whether the engine can be used in this build / environment.
    fn is_available(&self) -> bool {
        true
    }

    /// Open a wrapping scope configured by `ctx`.
    fn enter(&self, ctx: &WrapContext) -> Result<()>;

    /// Close the scope opened by the last successful `enter`.
    fn exit(&self);

    /// Wrap `module` as a single sharded unit.
    fn wrap(&self, ctx: &WrapContext, module: Box<dyn Module>) -> WrapResult;

    /// Wrap `module` recursively, applying `ctx.auto_wrap_policy` to every
    /// submodule and finally to `module` itself.
    fn auto_wrap(&self, ctx: &WrapContext, module: Box<dyn Module>) -> WrapResult;
}

/// An open sharding scope. The engine scope is closed when this is dropped,
/// including on early returns and unwinding.
pub struct WrapScope<'a> {
    engine: &'a dyn ShardingEngine,
    ctx: WrapContext,
}

impl<'a> WrapScope<'a> {
    pub fn enter(engine: &'a dyn ShardingEngine, ctx: WrapContext) -> Result<Self> {
        engine.enter(&ctx)?;
        tracing::debug!(
            engine = engine.name(),
            min_num_params = ctx.auto_wrap_policy.min_num_params,
            mixed_precision = ctx.mixed_precision,
            cpu_offload = ctx.cpu_offload,
            "entered sharding scope"
        );
        Ok(Self { engine, ctx })
    }

    pub fn context(&self) -> &WrapContext {
        &self.ctx
    }

    pub fn wrap(&self, module: Box<dyn Module>) -> WrapResult {
        self.engine.wrap(&self.ctx, module)
    }

    pub fn auto_wrap(&self, module: Box<dyn Module>) -> WrapResult {
        self.engine.auto_wrap(&self.ctx, module)
    }

    /// Wrap a submodule in place. Intended for `configure_sharded_model`.
    /// On error the slot keeps the module the engine handed back.
    pub fn wrap_in_place(&self, slot: &mut Box<dyn Module>) -> Result<()> {
        replace_boxed(slot, |m| self.wrap(m))
    }
}

impl Drop for WrapScope<'_> {
    fn drop(&mut self) {
        self.engine.exit();
        tracing::debug!(engine = self.engine.name(), "exited sharding scope");
    }
}

/// Replace the module in `slot` with `f(module)`, or with the module `f`
/// hands back when it fails.
pub(crate) fn replace_boxed<F>(slot: &mut Box<dyn Module>, f: F) -> Result<()>
where
    F: FnOnce(Box<dyn Module>) -> WrapResult,
{
    let taken = std::mem::replace(slot, Box::new(Detached));
    match f(taken) {
        Ok(wrapped) => {
            *slot = wrapped;
            Ok(())
        }
        Err(WrapError { module, error }) => {
            *slot = module;
            Err(error)
        }
    }
}

/// Occupies a slot while its module is moved out.
struct Detached;

impl Module for Detached {
    fn named_parameters(&self) -> Vec<(String, &Tensor)> {
        Vec::new()
    }

    fn to_device(&mut self, _device: &Device) -> Result<()> {
        Ok(())
    }
}
