//! Common module for library exports

pub use crate::breakpoints::{Breakpoint, BreakpointId, BreakpointSite, BreakpointSiteId, WatchpointAccess};
pub use crate::error::{WardenError, WardenResult};
pub use crate::events::{Event, EventMask, Listener};
pub use crate::expression::{EvaluateOptions, ExpressionRunner, Materializer, UserExpression};
pub use crate::memory::Permissions;
pub use crate::module::{Module, ModuleSpec, SharedModuleRegistry};
pub use crate::platform::{ScriptedStop, ScriptedStopKind, SimulatedFunction, SimulatedInferior};
pub use crate::process::{ExecutionContext, ExecutionResults, LaunchInfo, Process, RunPlanOptions};
pub use crate::settings::ProcessSettings;
pub use crate::target::Target;
pub use crate::thread::{StopReason, Thread};
pub use crate::types::{Address, Architecture, ProcessId, StateType, ThreadId};
pub use crate::value::{ValueObject, ValueType};
