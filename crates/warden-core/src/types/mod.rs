//! # Core Types
//!
//! Platform-agnostic value types shared by every part of the debugger core:
//! addresses, process/thread identifiers, run states, registers, and frame ids.

pub mod address;
pub mod process;
pub mod registers;
pub mod stack;
pub mod state;

pub use address::Address;
pub use process::{Architecture, ByteOrder, ProcessId, ThreadId};
pub use registers::{RegisterId, Registers};
pub use stack::{StackFrame, StackId};
pub use state::StateType;
