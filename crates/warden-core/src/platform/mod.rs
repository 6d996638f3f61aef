//! # Platform Backends
//!
//! Implementations of [`ProcessBackend`](crate::process::ProcessBackend).
//!
//! - [`simulated`]: a deterministic in-process inferior used by the tests
//!   and the command-line driver

pub mod simulated;

pub use simulated::{ScriptedStop, ScriptedStopKind, SimulatedFunction, SimulatedInferior, SimulatedMemory};
