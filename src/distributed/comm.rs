//! Communicator and process-group seams over the distributed runtime.
//!
//! The runtime (NCCL, MPI, gloo, ...) lives outside this crate. Strategies
//! only need a handful of blocking collectives, so the seam is small:
//! a `Communicator` for the default world, and `ProcessGroup`s created from
//! it for the sharding engine's collectives.

use std::fmt;
use std::sync::Arc;

use crate::error::Result;
use candle_core::{Device, Tensor};

/// A group of ranks that take part in collectives together.
pub trait ProcessGroup: Send + Sync + fmt::Debug {
    /// This process's rank within the group.
    fn rank(&self) -> usize;

    /// Number of ranks in the group.
    fn world_size(&self) -> usize;

    /// Broadcast `tensor` from `root` to every rank. Returns the root's
    /// tensor on every rank.
    fn broadcast(&self, tensor: &Tensor, root: usize) -> Result<Tensor>;

    /// Block until every rank in the group has reached this call.
    fn barrier(&self) -> Result<()>;
}

/// The default distributed context of the process.
pub trait Communicator: Send + Sync {
    fn rank(&self) -> usize;

    fn world_size(&self) -> usize;

    /// Collective barrier over the default world.
    fn barrier(&self) -> Result<()>;

    /// Create a new process group spanning the default world.
    fn new_group(&self) -> Result<Arc<dyn ProcessGroup>>;

    /// Make `device` the current device for collectives issued by this
    /// process. Runtimes without per-device state can ignore it.
    fn bind_device(&self, _device: &Device) -> Result<()> {
        Ok(())
    }
}

/// Single-process communicator: every collective is a no-op.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpCommunicator;

impl Communicator for NoOpCommunicator {
    fn rank(&self) -> usize {
        0
    }

    fn world_size(&self) -> usize {
        1
    }

    fn barrier(&self) -> Result<()> {
        Ok(())
    }

    fn new_group(&self) -> Result<Arc<dyn ProcessGroup>> {
        Ok(Arc::new(NoOpGroup))
    }
}

/// Process group of a single rank.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpGroup;

impl ProcessGroup for NoOpGroup {
    fn rank(&self) -> usize {
        0
    }

    fn world_size(&self) -> usize {
        1
    }

    fn broadcast(&self, tensor: &Tensor, _root: usize) -> Result<Tensor> {
        Ok(tensor.clone())
    }

    fn barrier(&self) -> Result<()> {
        Ok(())
    }
}
