//! Error types for the PUMA compiler

use thiserror::Error;

/// Result type for compilation operations
pub type CompileResult<T> = Result<T, CompileError>;

/// Compilation errors
///
/// Every error is a fatal invariant violation; there is no recovery
/// policy. The variant identifies the stage that detected the problem.
#[derive(Debug, Error)]
pub enum CompileError {
    #[error("Model error: {message}")]
    ModelError { message: String },

    #[error("Partitioning error: {message}")]
    PartitioningError { message: String },

    #[error("Placement error: {message}")]
    PlacementError { message: String },

    #[error("Coalescing error: {message}")]
    CoalescingError { message: String },

    #[error("Linearization error: {message}")]
    LinearizationError { message: String },

    #[error("Register allocation error: {message}")]
    RegisterAllocationError { message: String },

    #[error("I/O binding error: {message}")]
    IoBindingError { message: String },

    #[error("Code generation error: {message}")]
    CodeGenError { message: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl CompileError {
    pub fn model(msg: impl Into<String>) -> Self {
        CompileError::ModelError { message: msg.into() }
    }

    pub fn partitioning(msg: impl Into<String>) -> Self {
        CompileError::PartitioningError { message: msg.into() }
    }

    pub fn placement(msg: impl Into<String>) -> Self {
        CompileError::PlacementError { message: msg.into() }
    }

    pub fn coalescing(msg: impl Into<String>) -> Self {
        CompileError::CoalescingError { message: msg.into() }
    }

    pub fn linearization(msg: impl Into<String>) -> Self {
        CompileError::LinearizationError { message: msg.into() }
    }

    pub fn regalloc(msg: impl Into<String>) -> Self {
        CompileError::RegisterAllocationError { message: msg.into() }
    }

    pub fn io_binding(msg: impl Into<String>) -> Self {
        CompileError::IoBindingError { message: msg.into() }
    }

    pub fn codegen(msg: impl Into<String>) -> Self {
        CompileError::CodeGenError { message: msg.into() }
    }
}
