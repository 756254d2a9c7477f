//! Built-in sharding engine.
//!
//! Parameters of a wrapped module are assigned round-robin by sorted name
//! to the ranks of the scope's process group. Each rank is the owner of
//! its share; a full state dict is reconstructed by broadcasting every
//! parameter from its owner. With `world_size=1` every parameter is owned
//! locally and gathering is a plain copy.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::distributed::comm::ProcessGroup;
use crate::distributed::sharding::{
    ShardingEngine, WrapContext, WrapError, WrapResult, replace_boxed,
};
use crate::error::{Error, Result};
use crate::nn::module::{Module, StateDict, StepKind};
use candle_core::{Device, Tensor};

/// A module wrapped as one sharded unit.
///
/// Parameter names are those of the inner module; the wrapper adds no prefix.
pub struct FullyShardedModule {
    module: Box<dyn Module>,
    ctx: WrapContext,
    param_owners: Vec<(String, usize)>,
}

impl FullyShardedModule {
    pub fn new(module: Box<dyn Module>, ctx: &WrapContext) -> Self {
        let world_size = ctx.process_group.world_size().max(1);

        let mut names: Vec<String> = module
            .named_parameters()
            .into_iter()
            .map(|(name, _)| name)
            .collect();
        names.sort();

        let param_owners = names
            .into_iter()
            .enumerate()
            .map(|(i, name)| (name, i % world_size))
            .collect();

        Self {
            module,
            ctx: ctx.clone(),
            param_owners,
        }
    }

    /// Configuration this unit was wrapped with.
    pub fn context(&self) -> &WrapContext {
        &self.ctx
    }

    pub fn process_group(&self) -> &Arc<dyn ProcessGroup> {
        &self.ctx.process_group
    }

    /// All parameter names with their owning rank, in deterministic order.
    pub fn param_owners(&self) -> &[(String, usize)] {
        &self.param_owners
    }

    /// Names of the parameters this rank owns.
    pub fn owned_param_names(&self) -> Vec<&str> {
        let rank = self.ctx.process_group.rank();
        self.param_owners
            .iter()
            .filter(|(_, owner)| *owner == rank)
            .map(|(name, _)| name.as_str())
            .collect()
    }
}

impl Module for FullyShardedModule {
    fn named_parameters(&self) -> Vec<(String, &Tensor)> {
        self.module.named_parameters()
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

    fn is_sharded(&self) -> bool {
        true
    }

    fn wrapped(&self) -> Option<&dyn Module> {
        Some(self.module.as_ref())
    }

    /// Gather the full state dict from the owners of each parameter.
    fn state_dict(&self) -> Result<StateDict> {
        let mut local = self.module.state_dict()?;
        let group = &self.ctx.process_group;
        if group.world_size() <= 1 {
            return Ok(local);
        }

        for (name, owner) in &self.param_owners {
            let tensor = local.get(name).ok_or_else(|| Error::ModelError {
                reason: format!("parameter '{name}' missing from local state"),
            })?;
            let full = group.broadcast(tensor, *owner)?;
            local.insert(name.clone(), full);
        }
        group.barrier()?;

        Ok(local)
    }

    fn forward(&mut self, kind: StepKind, batch: &Tensor, batch_idx: usize) -> Result<Tensor> {
        self.module.forward(kind, batch, batch_idx)
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

/// Sharding engine shipped with the crate.
#[derive(Debug, Default)]
pub struct LocalShardingEngine {
    active: AtomicBool,
}

impl LocalShardingEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a scope is currently open.
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    fn auto_wrap_inner(&self, ctx: &WrapContext, mut module: Box<dyn Module>) -> WrapResult {
        if module.is_sharded() {
            return Ok(module);
        }

        let mut failure = None;
        for slot in module.children_mut() {
            if let Err(error) = replace_boxed(slot, |child| self.auto_wrap_inner(ctx, child)) {
                failure = Some(error);
                break;
            }
        }
        if let Some(error) = failure {
            return Err(WrapError::new(module, error));
        }

        if ctx.auto_wrap_policy.should_wrap(module.as_ref()) {
            self.wrap(ctx, module)
        } else {
            Ok(module)
        }
    }
}

impl ShardingEngine for LocalShardingEngine {
    fn name(&self) -> &str {
        "local"
    }

    fn enter(&self, _ctx: &WrapContext) -> Result<()> {
        if self.active.swap(true, Ordering::AcqRel) {
            return Err(Error::Misconfiguration {
                reason: "a sharding scope is already open; scopes cannot be nested".to_string(),
            });
        }
        Ok(())
    }

    fn exit(&self) {
        self.active.store(false, Ordering::Release);
    }

    fn wrap(&self, ctx: &WrapContext, module: Box<dyn Module>) -> WrapResult {
        if !self.is_active() {
            let error = Error::Misconfiguration {
                reason: "wrap called outside of a sharding scope".to_string(),
            };
            return Err(WrapError::new(module, error));
        }
        let wrapped = FullyShardedModule::new(module, ctx);
        tracing::debug!(
            num_params = wrapped.num_parameters(),
            owned = wrapped.owned_param_names().len(),
            world_size = ctx.process_group.world_size(),
            "wrapped module"
        );
        Ok(Box::new(wrapped))
    }

    fn auto_wrap(&self, ctx: &WrapContext, module: Box<dyn Module>) -> WrapResult {
        self.auto_wrap_inner(ctx, module)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distributed::sharding::{AutoWrapPolicy, WrapScope};
    use crate::nn::{Sequential, contains_sharded};
    use crate::test_utils::{SpyGroup, cpu_device, linear, wrap_context};

    fn context_on(group: &Arc<SpyGroup>) -> WrapContext {
        let mut ctx = wrap_context(1);
        let shared: Arc<dyn ProcessGroup> = group.clone();
        ctx.process_group = shared;
        ctx
    }

    /// Reports only the weight of its layer in `state_dict`.
    struct WeightOnly {
        layer: Box<dyn Module>,
    }

    impl Module for WeightOnly {
        fn named_parameters(&self) -> Vec<(String, &Tensor)> {
            self.layer.named_parameters()
        }

        fn to_device(&mut self, device: &Device) -> Result<()> {
            self.layer.to_device(device)
        }

        fn state_dict(&self) -> Result<StateDict> {
            let mut state = self.layer.state_dict()?;
            state.remove("bias");
            Ok(state)
        }
    }

    fn two_layer(device: &Device) -> Box<dyn Module> {
        let mut seq = Sequential::new();
        seq.push(linear(device, 4, 4)); // 20
        seq.push(linear(device, 2, 2)); // 6
        Box::new(seq)
    }

    #[test]
    fn test_wrap_requires_open_scope() {
        let device = cpu_device();
        let engine = LocalShardingEngine::new();
        let err = engine.wrap(&wrap_context(1), two_layer(&device)).err().expect("expected wrap to fail");
        assert!(matches!(err.error, Error::Misconfiguration { .. }));
        // The module comes back untouched.
        assert!(!err.module.is_sharded());
        assert_eq!(err.module.num_parameters(), 26);
    }

    #[test]
    fn test_nested_scope_rejected() {
        let engine = LocalShardingEngine::new();
        let _outer = WrapScope::enter(&engine, wrap_context(1)).unwrap();
        assert!(WrapScope::enter(&engine, wrap_context(1)).is_err());
        assert!(engine.is_active());
    }

    #[test]
    fn test_scope_reopens_after_drop() {
        let engine = LocalShardingEngine::new();
        drop(WrapScope::enter(&engine, wrap_context(1)).unwrap());
        assert!(!engine.is_active());
        let _again = WrapScope::enter(&engine, wrap_context(1)).unwrap();
    }

    #[test]
    fn test_wrap_keeps_names_and_owners() {
        let device = cpu_device();
        let engine = LocalShardingEngine::new();
        let scope = WrapScope::enter(&engine, wrap_context(1)).unwrap();

        let wrapped = scope.wrap(two_layer(&device)).unwrap();
        assert!(wrapped.is_sharded());

        let mut names: Vec<String> =
            wrapped.named_parameters().into_iter().map(|(n, _)| n).collect();
        names.sort();
        assert_eq!(names, vec!["0.bias", "0.weight", "1.bias", "1.weight"]);

        let state = wrapped.state_dict().unwrap();
        assert_eq!(state.len(), 4);
        assert_eq!(state["0.weight"].dims(), &[4, 4]);
    }

    #[test]
    fn test_auto_wrap_selects_large_children() {
        let device = cpu_device();
        let engine = LocalShardingEngine::new();
        let mut ctx = wrap_context(1);
        ctx.auto_wrap_policy = AutoWrapPolicy::new(10);
        let scope = WrapScope::enter(&engine, ctx).unwrap();

        let model = scope.auto_wrap(two_layer(&device)).unwrap();

        // Root holds only the 6 params of the small layer once the large
        // one is wrapped, so it stays unwrapped.
        assert!(!model.is_sharded());
        let children = model.children();
        assert!(children[0].is_sharded());
        assert!(!children[1].is_sharded());
        assert!(contains_sharded(model.as_ref()));
    }

    #[test]
    fn test_auto_wrap_leaf_root() {
        let device = cpu_device();
        let engine = LocalShardingEngine::new();
        let mut ctx = wrap_context(1);
        ctx.auto_wrap_policy = AutoWrapPolicy::new(5);
        let scope = WrapScope::enter(&engine, ctx).unwrap();

        let model = scope.auto_wrap(Box::new(linear(&device, 4, 4))).unwrap();
        assert!(model.is_sharded());
        assert_eq!(model.num_parameters(), 20);

        // Both children qualify, leaving nothing unwrapped at the root.
        let model = scope.auto_wrap(two_layer(&device)).unwrap();
        assert!(!model.is_sharded());
        assert!(model.children().iter().all(|c| c.is_sharded()));
    }

    #[test]
    fn test_owned_param_names_single_rank() {
        let device = cpu_device();
        let wrapped = FullyShardedModule::new(two_layer(&device), &wrap_context(1));
        assert_eq!(wrapped.owned_param_names().len(), 4);
        assert!(wrapped.param_owners().iter().all(|(_, owner)| *owner == 0));
    }

    #[test]
    fn test_owners_round_robin_over_ranks() {
        let device = cpu_device();
        let group = Arc::new(SpyGroup::new(1, 2));
        let wrapped = FullyShardedModule::new(two_layer(&device), &context_on(&group));

        let owners: Vec<(&str, usize)> = wrapped
            .param_owners()
            .iter()
            .map(|(name, owner)| (name.as_str(), *owner))
            .collect();
        assert_eq!(
            owners,
            vec![("0.bias", 0), ("0.weight", 1), ("1.bias", 0), ("1.weight", 1)]
        );
        assert_eq!(wrapped.owned_param_names(), vec!["0.weight", "1.weight"]);
    }

    #[test]
    fn test_state_dict_gathers_from_owners() {
        let device = cpu_device();
        let group = Arc::new(SpyGroup::new(1, 2));
        let wrapped = FullyShardedModule::new(two_layer(&device), &context_on(&group));

        let state = wrapped.state_dict().unwrap();
        assert_eq!(state.len(), 4);
        assert_eq!(state["1.weight"].dims(), &[2, 2]);

        // One broadcast per parameter, rooted at its owner, then one barrier.
        let expected: Vec<usize> = wrapped.param_owners().iter().map(|(_, owner)| *owner).collect();
        assert_eq!(group.broadcast_roots(), expected);
        assert_eq!(group.broadcast_roots(), vec![0, 1, 0, 1]);
        assert_eq!(group.barriers(), 1);
    }

    #[test]
    fn test_state_dict_single_rank_skips_collectives() {
        let device = cpu_device();
        let group = Arc::new(SpyGroup::new(0, 1));
        let wrapped = FullyShardedModule::new(two_layer(&device), &context_on(&group));

        assert_eq!(wrapped.state_dict().unwrap().len(), 4);
        assert!(group.broadcast_roots().is_empty());
        assert_eq!(group.barriers(), 0);
    }

    #[test]
    fn test_state_dict_missing_parameter_fails() {
        let device = cpu_device();
        let group = Arc::new(SpyGroup::new(0, 2));
        let module = WeightOnly {
            layer: Box::new(linear(&device, 2, 2)),
        };
        let wrapped = FullyShardedModule::new(Box::new(module), &context_on(&group));

        let err = wrapped.state_dict().unwrap_err();
        match err {
            Error::ModelError { reason } => assert!(reason.contains("'bias'")),
            other => panic!("expected ModelError, got {other:?}"),
        }
        assert_eq!(group.barriers(), 0);
    }

    #[test]
    fn test_auto_wrap_failure_returns_module() {
        let device = cpu_device();
        let engine = LocalShardingEngine::new();
        let mut ctx = wrap_context(1);
        ctx.auto_wrap_policy = AutoWrapPolicy::new(5);

        // No scope open: the first qualifying child fails and the whole
        // tree comes back with its children in place.
        let err = engine.auto_wrap(&ctx, two_layer(&device)).err().expect("expected auto_wrap to fail");
        assert!(matches!(err.error, Error::Misconfiguration { .. }));
        assert_eq!(err.module.num_parameters(), 26);
        assert!(!contains_sharded(err.module.as_ref()));
        assert_eq!(err.module.children().len(), 2);
    }
}
