//! Data-parallel base strategy.
//!
//! Owns device/topology management and the model handle. Other strategies
//! build on it by composition and reuse its barrier, device placement,
//! sync batch-norm conversion and step dispatch.

use std::sync::Arc;

use crate::distributed::comm::Communicator;
use crate::error::{Error, Result};
use crate::nn::module::{Module, StepKind};
use crate::strategy::Strategy;
use crate::strategy::environment::ClusterEnvironment;
use crate::trainer::context::TrainerContext;
use candle_core::{Device, Tensor};

/// Replicated data-parallel strategy: one process per device, every
/// process holds the full model.
///
/// # Usage
///
/// ```ignore
/// let mut ddp = DdpStrategy::new(vec![Device::new_cuda(0)?, Device::new_cuda(1)?])
///     .with_sync_batchnorm(true);
/// ddp.connect(Box::new(model));
/// ddp.setup_distributed(comm)?;
/// ddp.pre_dispatch(&mut trainer)?;
/// let loss = ddp.training_step(&batch, 0)?;
/// ```
pub struct DdpStrategy {
    parallel_devices: Vec<Device>,
    num_nodes: usize,
    cluster_environment: ClusterEnvironment,
    sync_batchnorm: bool,
    comm: Option<Arc<dyn Communicator>>,
    local_rank: usize,
    root_device: Device,
    model: Option<Box<dyn Module>>,
    require_backward_grad_sync: bool,
}

impl DdpStrategy {
    /// Create a strategy over the devices of this node. An empty list means CPU.
    pub fn new(parallel_devices: Vec<Device>) -> Self {
        let root_device = parallel_devices.first().cloned().unwrap_or(Device::Cpu);
        Self {
            parallel_devices,
            num_nodes: 1,
            cluster_environment: ClusterEnvironment::default(),
            sync_batchnorm: false,
            comm: None,
            local_rank: 0,
            root_device,
            model: None,
            require_backward_grad_sync: true,
        }
    }

    pub fn with_num_nodes(mut self, num_nodes: usize) -> Self {
        self.num_nodes = num_nodes.max(1);
        self
    }

    pub fn with_cluster_environment(mut self, env: ClusterEnvironment) -> Self {
        self.cluster_environment = env;
        self
    }

    pub fn with_sync_batchnorm(mut self, sync_batchnorm: bool) -> Self {
        self.sync_batchnorm = sync_batchnorm;
        self
    }

    /// Processes per node (one per device).
    pub fn num_processes(&self) -> usize {
        self.parallel_devices.len().max(1)
    }

    pub fn num_nodes(&self) -> usize {
        self.num_nodes
    }

    pub fn cluster_environment(&self) -> &ClusterEnvironment {
        &self.cluster_environment
    }

    pub fn sync_batchnorm(&self) -> bool {
        self.sync_batchnorm
    }

    pub fn local_rank(&self) -> usize {
        self.local_rank
    }

    pub fn global_rank(&self) -> usize {
        self.comm.as_ref().map_or(0, |c| c.rank())
    }

    pub fn world_size(&self) -> usize {
        self.comm
            .as_ref()
            .map_or(self.num_nodes * self.num_processes(), |c| c.world_size())
    }

    /// The communicator installed by `setup_distributed`.
    pub fn communicator(&self) -> Result<&Arc<dyn Communicator>> {
        self.comm.as_ref().ok_or_else(|| Error::DistributedError {
            reason: "distributed runtime not initialized; call setup_distributed first"
                .to_string(),
        })
    }

    /// Validate the topology against `comm` and pick this process's device.
    pub fn setup_distributed(&mut self, comm: Arc<dyn Communicator>) -> Result<()> {
        let expected = self.num_nodes * self.num_processes();
        if comm.world_size() != expected {
            return Err(Error::DistributedError {
                reason: format!(
                    "world size {} does not match {} node(s) x {} process(es)",
                    comm.world_size(),
                    self.num_nodes,
                    self.num_processes()
                ),
            });
        }

        self.local_rank = comm.rank() % self.num_processes();
        if let Some(device) = self.parallel_devices.get(self.local_rank) {
            self.root_device = device.clone();
        }
        tracing::info!(
            global_rank = comm.rank(),
            local_rank = self.local_rank,
            world_size = comm.world_size(),
            node_rank = self.cluster_environment.node_rank,
            master = %format!("{}:{}", self.cluster_environment.master_addr, self.cluster_environment.master_port),
            "distributed setup complete"
        );
        self.comm = Some(comm);
        Ok(())
    }

    pub fn root_device(&self) -> &Device {
        &self.root_device
    }

    pub fn connect(&mut self, model: Box<dyn Module>) {
        self.model = Some(model);
    }

    pub fn model(&self) -> Option<&dyn Module> {
        self.model.as_deref()
    }

    pub fn model_mut(&mut self) -> Result<&mut Box<dyn Module>> {
        self.model.as_mut().ok_or_else(no_model)
    }

    /// Move the model out, e.g. to wrap it.
    pub fn take_model(&mut self) -> Result<Box<dyn Module>> {
        self.model.take().ok_or_else(no_model)
    }

    /// Convert the model's batch-norm layers to synchronized statistics
    /// over a group spanning the world.
    pub fn configure_sync_batchnorm(&mut self) -> Result<()> {
        let group = self.communicator()?.new_group()?;
        self.model_mut()?.convert_sync_batchnorm(&group)?;
        tracing::debug!("converted batch norm layers to sync batch norm");
        Ok(())
    }

    /// Collective barrier. A no-op before `setup_distributed`.
    pub fn barrier(&self, name: &str) -> Result<()> {
        match &self.comm {
            Some(comm) => {
                tracing::debug!(barrier = name, rank = comm.rank(), "waiting at barrier");
                comm.barrier()
            }
            None => Ok(()),
        }
    }

    pub fn model_to_device(&mut self) -> Result<()> {
        let device = self.root_device.clone();
        self.model_mut()?.to_device(&device)?;
        tracing::info!(device = ?device.location(), "model moved to device");
        Ok(())
    }

    /// Run a step through the model as a whole, so wrappers route it.
    pub fn step(&mut self, kind: StepKind, batch: &Tensor, batch_idx: usize) -> Result<Tensor> {
        self.model_mut()?.forward(kind, batch, batch_idx)
    }

    /// Whether the next backward pass should synchronize gradients.
    pub fn require_backward_grad_sync(&self) -> bool {
        self.require_backward_grad_sync
    }

    /// Skip gradient synchronization on the next backward pass, e.g. while
    /// accumulating gradients. `post_training_step` turns it back on.
    pub fn block_backward_sync(&mut self) {
        self.require_backward_grad_sync = false;
    }
}

fn no_model() -> Error {
    Error::TrainingError {
        reason: "no model connected to the strategy".to_string(),
    }
}

impl Strategy for DdpStrategy {
    fn name(&self) -> &'static str {
        "ddp"
    }

    fn connect(&mut self, model: Box<dyn Module>) {
        DdpStrategy::connect(self, model);
    }

    fn setup_distributed(&mut self, comm: Arc<dyn Communicator>) -> Result<()> {
        DdpStrategy::setup_distributed(self, comm)
    }

    fn root_device(&self) -> &Device {
        DdpStrategy::root_device(self)
    }

    fn pre_dispatch(&mut self, _trainer: &mut dyn TrainerContext) -> Result<()> {
        if self.sync_batchnorm {
            self.configure_sync_batchnorm()?;
        }
        self.model_to_device()?;
        self.barrier("pre_dispatch")
    }

    fn barrier(&self, name: &str) -> Result<()> {
        DdpStrategy::barrier(self, name)
    }

    fn model(&self) -> Option<&dyn Module> {
        DdpStrategy::model(self)
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

    fn post_training_step(&mut self) {
        self.require_backward_grad_sync = true;
    }
}
