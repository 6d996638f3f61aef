//! # warden-core
//!
//! Execution control for a native debugger: the process state machine and
//! its event pipeline, breakpoint sites with memory shadowing, synchronous
//! thread-plan execution, memory caches, modules, value objects, and the
//! plumbing that evaluates expressions inside a stopped inferior.
//!
//! ## Layout
//!
//! - [`target`]: one program being debugged; owns images, breakpoints, and
//!   at most one process
//! - [`process`]: the inferior, its private/public state, and the
//!   private-state task
//! - [`events`]: broadcasters and listeners
//! - [`breakpoints`]: logical breakpoints, sites, watchpoints
//! - [`thread`]: threads, stop info, thread plans
//! - [`memory`]: read cache and scratch-memory pool
//! - [`module`]: object files, symbols, the shared module registry
//! - [`value`]: value objects over inferior memory and registers
//! - [`expression`]: ABI, materializer, IR interpreter, expression runner
//! - [`platform`]: process backends
//!
//! ## Logging
//!
//! Everything logs through `tracing`. The library never installs a
//! subscriber; binaries do (see `warden-utils`).
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use warden_core::prelude::*;
//!
//! # fn main() -> WardenResult<()> {
//! let target = Target::new(Arc::new(SharedModuleRegistry::new()));
//! let process = target.create_process(Box::new(SimulatedInferior::new()), None);
//! process.launch(LaunchInfo::default())?;
//! assert_eq!(process.public_state(), StateType::Stopped);
//! # Ok(())
//! # }
//! ```

pub mod breakpoints;
pub mod error;
pub mod events;
pub mod expression;
pub mod memory;
pub mod module;
pub mod platform;
pub mod prelude;
pub mod process;
pub mod settings;
pub mod target;
pub mod thread;
pub mod types;
pub mod value;

pub use error::{WardenError, WardenResult};
pub use process::Process;
pub use target::Target;
