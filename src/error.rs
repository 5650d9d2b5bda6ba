use thiserror::Error;

/// Result type for pipeline operations
pub type Result<T> = std::result::Result<T, PipelineError>;

/// Errors that can occur while driving the pipeline
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PipelineError {
    /// An item failed the payload contract; the buffer was left unchanged
    #[error("Invalid item: {0}")]
    InvalidItem(String),

    /// A capacity, rate or identifier was rejected; prior state is retained
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// A single loop iteration failed unexpectedly
    #[error("Agent loop fault: {0}")]
    AgentLoopFault(String),

    /// Thread spawn error
    #[error("Thread error: {0}")]
    ThreadError(String),
}

impl PipelineError {
    /// Shorthand for building an `InvalidConfiguration` error
    pub(crate) fn config(msg: impl Into<String>) -> Self {
        PipelineError::InvalidConfiguration(msg.into())
    }
}
