//! # Process Backend
//!
//! The interface a platform implementation provides to [`Process`].
//!
//! `Process` owns the state machine, the event pipeline, breakpoint sites,
//! and the memory caches. Everything that actually touches the inferior
//! (starting it, resuming it, reading its memory) goes through this trait.
//!
//! ## State reporting
//!
//! Backends report what the inferior did by calling back into the process:
//!
//! - [`Process::set_private_state`] when the inferior starts running or stops
//! - [`Thread::set_stop_reason`](crate::thread::Thread::set_stop_reason) on
//!   each thread that stopped for a reason, *before* announcing the stop
//! - [`Process::set_exit_status`] when the inferior exits
//!
//! `do_resume` must report [`StateType::Running`](crate::types::StateType::Running)
//! before it returns so that callers waiting for the running event are not
//! racing the backend.
//!
//! ## Default implementations
//!
//! Breakpoint sites default to the software trap protocol of
//! [`Process::enable_software_breakpoint`]. Watchpoints, signals, and stdin
//! default to "unsupported".

use std::path::PathBuf;

use super::Process;
use crate::breakpoints::{BreakpointSite, Watchpoint};
use crate::error::{WardenError, WardenResult};
use crate::memory::Permissions;
use crate::thread::ThreadList;
use crate::types::{Address, Architecture, ProcessId};

/// What to launch
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LaunchInfo
{
    /// Executable to run; defaults to the target's executable module
    pub executable: Option<PathBuf>,
    /// Arguments, without the program name
    pub arguments: Vec<String>,
    /// Extra `KEY=VALUE` environment entries
    pub environment: Vec<String>,
}

impl LaunchInfo
{
    /// Launch `executable` without arguments.
    #[must_use]
    pub fn new(executable: impl Into<PathBuf>) -> Self
    {
        Self {
            executable: Some(executable.into()),
            ..Self::default()
        }
    }

    /// Append an argument.
    #[must_use]
    pub fn with_argument(mut self, argument: impl Into<String>) -> Self
    {
        self.arguments.push(argument.into());
        self
    }
}

/// Platform implementation driven by a [`Process`]
///
/// Methods take `&self`; backends keep their own interior state. The
/// process is passed in on every call so backends never own it.
pub trait ProcessBackend: Send + Sync
{
    /// Short name used in logs.
    fn plugin_name(&self) -> &'static str;

    /// Architecture of the inferior.
    fn architecture(&self) -> Architecture;

    /// Start the inferior. The backend reports the initial stop through
    /// [`Process::set_private_state`].
    fn do_launch(&self, process: &Process, info: &LaunchInfo) -> WardenResult<ProcessId>;

    /// Called after the initial launch stop was caught.
    fn did_launch(&self, _process: &Process) {}

    /// Attach to a running inferior. The backend reports the attach stop.
    fn do_attach(&self, process: &Process, pid: ProcessId) -> WardenResult<()>;

    /// Called once the attach completed.
    fn did_attach(&self, _process: &Process) {}

    /// Last chance to refuse a resume.
    fn will_resume(&self, _process: &Process) -> WardenResult<()>
    {
        Ok(())
    }

    /// Resume the inferior according to each thread's resume state.
    fn do_resume(&self, process: &Process) -> WardenResult<()>;

    /// Called after a successful resume.
    fn did_resume(&self, _process: &Process) {}

    /// Interrupt the inferior. Returns whether this call caused a stop
    /// (`false` when the inferior was already stopped).
    fn do_halt(&self, process: &Process) -> WardenResult<bool>;

    /// Let the inferior go.
    fn do_detach(&self, process: &Process) -> WardenResult<()>;

    /// Kill the inferior.
    fn do_destroy(&self, process: &Process) -> WardenResult<()>;

    /// Send a signal to the inferior.
    fn do_signal(&self, _process: &Process, signo: i32) -> WardenResult<()>
    {
        Err(WardenError::Unsupported(format!("sending signal {signo} is not supported")))
    }

    /// Read raw inferior memory. Returns the number of bytes read.
    fn do_read_memory(&self, address: Address, buffer: &mut [u8]) -> WardenResult<usize>;

    /// Write raw inferior memory. Returns the number of bytes written.
    fn do_write_memory(&self, address: Address, data: &[u8]) -> WardenResult<usize>;

    /// Allocate `size` bytes of inferior memory.
    fn do_allocate_memory(&self, size: usize, permissions: Permissions) -> WardenResult<Address>;

    /// Free memory returned by [`do_allocate_memory`](Self::do_allocate_memory).
    fn do_deallocate_memory(&self, address: Address) -> WardenResult<()>;

    /// Arm a breakpoint site.
    fn enable_breakpoint_site(&self, process: &Process, site: &BreakpointSite) -> WardenResult<()>
    {
        process.enable_software_breakpoint(site)
    }

    /// Disarm a breakpoint site.
    fn disable_breakpoint_site(&self, process: &Process, site: &BreakpointSite) -> WardenResult<()>
    {
        process.disable_software_breakpoint(site)
    }

    /// Arm a watchpoint.
    fn enable_watchpoint(&self, _process: &Process, _watchpoint: &Watchpoint) -> WardenResult<()>
    {
        Err(WardenError::Unsupported("watchpoints are not supported".to_string()))
    }

    /// Disarm a watchpoint.
    fn disable_watchpoint(&self, _process: &Process, _watchpoint: &Watchpoint) -> WardenResult<()>
    {
        Err(WardenError::Unsupported("watchpoints are not supported".to_string()))
    }

    /// Bring `threads` in line with the inferior after a stop.
    fn update_thread_list(&self, _process: &Process, _threads: &ThreadList) -> WardenResult<()>
    {
        Ok(())
    }

    /// Refresh backend caches after a stop, before the stop is voted on.
    fn refresh_state_after_stop(&self, _process: &Process) {}

    /// Forward bytes to the inferior's standard input.
    fn put_stdin(&self, _data: &[u8]) -> WardenResult<usize>
    {
        Err(WardenError::Unsupported("standard input is not supported".to_string()))
    }

    /// Whether code can be run in the inferior.
    fn can_jit(&self) -> bool
    {
        true
    }
}
