//! fullshard error types

/// fullshard result type
pub type Result<T> = std::result::Result<T, Error>;

/// fullshard errors
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Error from candle tensor operations
    #[error("tensor error: {0}")]
    Tensor(#[from] candle_core::Error),

    /// Invalid strategy configuration, raised at construction time
    #[error("misconfiguration: {reason}")]
    Misconfiguration {
        /// Description of what went wrong
        reason: String,
    },

    /// Model structure or state error
    #[error("model error: {reason}")]
    ModelError {
        /// Description of what went wrong
        reason: String,
    },

    /// A step hook was dispatched to a module that does not implement it
    #[error("`{step}` is not implemented by this module")]
    StepNotImplemented {
        /// Hook name, e.g. `validation_step`
        step: &'static str,
    },

    /// Training lifecycle error
    #[error("training error: {reason}")]
    TrainingError {
        /// Description of what went wrong
        reason: String,
    },

    /// Distributed communication error
    #[error("distributed error: {reason}")]
    DistributedError {
        /// Description of what went wrong
        reason: String,
    },
}
