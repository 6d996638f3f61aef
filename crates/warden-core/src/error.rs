//! # Error Types
//!
//! General error handling for the debugger core.
//!
//! We use `thiserror` to generate the `Error` trait implementations. Every
//! fallible operation that talks to the inferior returns [`WardenResult`];
//! the synchronous call protocol (`Process::run_thread_plan`) is the one
//! exception and reports a closed [`ExecutionResults`](crate::process::ExecutionResults)
//! value instead.

use thiserror::Error;

use crate::types::{Address, StateType};

/// Main error type for debugger-core operations
///
/// ## Error Categories
///
/// 1. **Setup errors**: InvalidArgument, InvalidState, NotAttached, ProcessNotFound
/// 2. **I/O errors**: MemoryRead, MemoryWrite, Io
/// 3. **Verification failures**: BreakpointVerification
/// 4. **Timeouts**: Timeout, HaltFailed
/// 5. **Resource errors**: ResourceExhausted (hardware breakpoint/watchpoint limits)
/// 6. **Lookup errors**: BreakpointSiteNotFound, BreakpointIdNotFound, ModuleNotFound
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WardenError
{
    /// The process with the given PID doesn't exist or has exited
    #[error("Process not found: PID {0}")]
    ProcessNotFound(u32),

    /// Invalid argument passed to a debugger function
    ///
    /// Examples:
    /// - Reading a scalar wider than eight bytes
    /// - An empty thread plan handed to `run_thread_plan`
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// The operation is not allowed in the process's current state
    ///
    /// The `operation` names what was attempted, `state` is the state the
    /// process was in when the request arrived.
    #[error("{operation} is not allowed while the process is {state}")]
    InvalidState
    {
        /// Name of the rejected operation
        operation: &'static str,
        /// State of the process when the operation was attempted
        state: StateType,
    },

    /// Operation requires a live process
    #[error("Not attached to a process")]
    NotAttached,

    /// No breakpoint site exists with the given identifier
    #[error("invalid breakpoint site ID: {0}")]
    BreakpointSiteNotFound(u64),

    /// No logical breakpoint exists for the given identifier.
    #[error("No breakpoint with id {0}")]
    BreakpointIdNotFound(u64),

    /// A breakpoint trap could not be planted or removed
    ///
    /// The message is the exact step of the read/write/verify protocol that
    /// failed.
    #[error("{message} (breakpoint site at {address})")]
    BreakpointVerification
    {
        /// Load address of the site
        address: Address,
        /// Step that failed
        message: &'static str,
    },

    /// A required resource has been exhausted
    ///
    /// Raised when the hardware breakpoint or watchpoint slots of a backend
    /// are all in use.
    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    /// Failed to resume the target process
    #[error("Failed to resume process: {0}")]
    ResumeFailed(String),

    /// Failed to halt the target process
    #[error("{0}")]
    HaltFailed(String),

    /// Reading inferior memory failed
    #[error("Failed to read {size} bytes at {address}: {reason}")]
    MemoryRead
    {
        /// First address of the failed read
        address: Address,
        /// Requested size
        size: usize,
        /// Backend supplied detail
        reason: String,
    },

    /// Writing inferior memory failed
    #[error("Failed to write {size} bytes at {address}: {reason}")]
    MemoryWrite
    {
        /// First address of the failed write
        address: Address,
        /// Requested size
        size: usize,
        /// Backend supplied detail
        reason: String,
    },

    /// Inferior memory allocation or deallocation failed
    #[error("{0}")]
    Allocation(String),

    /// The backend does not implement the operation
    #[error("{0}")]
    Unsupported(String),

    /// A bounded wait elapsed
    #[error("Timed out: {0}")]
    Timeout(String),

    /// A module or its object file could not be loaded
    #[error("Module error: {0}")]
    ModuleNotFound(String),

    /// Materialization, interpretation, or evaluation of an expression failed
    #[error("Expression error: {0}")]
    Expression(String),

    /// I/O error (for file operations, etc.)
    ///
    /// Stored as text so errors stay cloneable across the event pipeline.
    #[error("IO error: {0}")]
    Io(String),
}

impl From<std::io::Error> for WardenError
{
    fn from(err: std::io::Error) -> Self
    {
        WardenError::Io(err.to_string())
    }
}

impl WardenError
{
    /// Build an [`WardenError::InvalidState`] for `operation` in `state`.
    #[must_use]
    pub const fn invalid_state(operation: &'static str, state: StateType) -> Self
    {
        WardenError::InvalidState { operation, state }
    }

    /// Build a [`WardenError::BreakpointVerification`] for the site at `address`.
    #[must_use]
    pub const fn breakpoint(address: Address, message: &'static str) -> Self
    {
        WardenError::BreakpointVerification { address, message }
    }
}

/// Convenience type alias for `Result<T, WardenError>`
///
/// ```rust
/// use warden_core::error::WardenResult;
/// fn foo() -> WardenResult<()>
/// {
///     Ok(())
/// }
/// ```
pub type WardenResult<T> = std::result::Result<T, WardenError>;
