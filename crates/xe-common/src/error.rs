//! Error taxonomy shared by every xe-runtime crate.

/// Errors surfaced by the dispatch pipeline.
///
/// Argument-binding and group-size errors are returned synchronously and leave
/// queue state untouched. `OutOfResources` and `Fatal` are reported after the
/// enqueue path has logged them with context.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum XeError {
    /// A caller-supplied value (index, pointer, size, handle) is invalid.
    #[error("invalid argument: {message}")]
    InvalidArgument { message: String },

    /// A work-group geometry exceeds the kernel or device limits.
    #[error("invalid group size dimension: {message}")]
    InvalidGroupSizeDimension { message: String },

    /// The operation is not valid in the current state.
    #[error("invalid operation: {message}")]
    InvalidOperation { message: String },

    /// GPU memory could not be allocated.
    #[error("out of resources: {what} ({requested_bytes} bytes requested)")]
    OutOfResources { what: String, requested_bytes: usize },

    /// A predecessor event terminated with an error status.
    #[error("execution status error for event in wait list (status {status})")]
    ExecStatusError { status: i32 },

    /// Internal invariant violation.
    #[error("fatal internal error: {message}")]
    Fatal { message: String },
}

impl XeError {
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }

    pub fn invalid_group_size(message: impl Into<String>) -> Self {
        Self::InvalidGroupSizeDimension {
            message: message.into(),
        }
    }

    pub fn invalid_operation(message: impl Into<String>) -> Self {
        Self::InvalidOperation {
            message: message.into(),
        }
    }

    pub fn out_of_resources(what: impl Into<String>, requested_bytes: usize) -> Self {
        Self::OutOfResources {
            what: what.into(),
            requested_bytes,
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self::Fatal {
            message: message.into(),
        }
    }

    /// Whether the error leaves the driver in a state the caller cannot
    /// recover from by retrying with different inputs.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal { .. })
    }

    /// Numeric status code in the OpenCL convention (negative on failure).
    #[must_use]
    pub const fn status_code(&self) -> i32 {
        match self {
            Self::OutOfResources { .. } => -5,
            Self::ExecStatusError { .. } => -14,
            Self::InvalidArgument { .. } => -30,
            Self::InvalidGroupSizeDimension { .. } => -54,
            Self::InvalidOperation { .. } => -59,
            Self::Fatal { .. } => -9999,
        }
    }
}

/// Convenience result type for xe-runtime operations.
pub type Result<T> = std::result::Result<T, XeError>;
