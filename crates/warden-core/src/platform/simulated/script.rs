//! What the simulated inferior does when it runs.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::types::{Address, ThreadId};

type Body = Arc<dyn Fn(&[u64]) -> u64 + Send + Sync>;

/// A function the simulated inferior can be made to call
///
/// Calling it takes `duration` of wall time. A function that needs all
/// threads never returns while another thread is suspended, like a callee
/// blocked on a lock held elsewhere.
#[derive(Clone)]
pub struct SimulatedFunction
{
    arity: usize,
    body: Body,
    duration: Duration,
    needs_all_threads: bool,
}

impl SimulatedFunction
{
    /// A function of `arity` integer arguments computing `body`.
    #[must_use]
    pub fn new(arity: usize, body: impl Fn(&[u64]) -> u64 + Send + Sync + 'static) -> Self
    {
        Self {
            arity,
            body: Arc::new(body),
            duration: Duration::ZERO,
            needs_all_threads: false,
        }
    }

    /// A function without arguments that returns `value`.
    #[must_use]
    pub fn returning(value: u64) -> Self
    {
        Self::new(0, move |_| value)
    }

    #[must_use]
    pub const fn with_duration(mut self, duration: Duration) -> Self
    {
        self.duration = duration;
        self
    }

    #[must_use]
    pub const fn needing_all_threads(mut self) -> Self
    {
        self.needs_all_threads = true;
        self
    }

    #[must_use]
    pub const fn arity(&self) -> usize
    {
        self.arity
    }

    #[must_use]
    pub const fn duration(&self) -> Duration
    {
        self.duration
    }

    #[must_use]
    pub const fn needs_all_threads(&self) -> bool
    {
        self.needs_all_threads
    }

    pub(crate) fn call(&self, args: &[u64]) -> u64
    {
        (self.body)(args)
    }
}

impl fmt::Debug for SimulatedFunction
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        f.debug_struct("SimulatedFunction")
            .field("arity", &self.arity)
            .field("duration", &self.duration)
            .field("needs_all_threads", &self.needs_all_threads)
            .finish_non_exhaustive()
    }
}

/// Event a scripted stop delivers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptedStopKind
{
    /// The thread executes the trap at this address
    Breakpoint(Address),
    /// The thread touches watched memory at this address
    Watchpoint(Address),
    /// The thread receives a signal
    Signal(i32),
    /// The thread faults; the process is reported crashed
    Exception(String),
    /// The process exits with this status
    Exit(i32),
}

/// One stop delivered `delay` after the resume that consumes it
///
/// A stop marked [`racing_halt`](Self::racing_halt()) is not delivered by a
/// resume at all: the inferior runs until halted, and the stop lands in
/// place of the halt's own `SIGSTOP`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptedStop
{
    pub thread: ThreadId,
    pub delay: Duration,
    pub kind: ScriptedStopKind,
    pub racing_halt: bool,
}

impl ScriptedStop
{
    /// Stop on the first thread right after the resume.
    #[must_use]
    pub const fn new(kind: ScriptedStopKind) -> Self
    {
        Self {
            thread: ThreadId(1),
            delay: Duration::ZERO,
            kind,
            racing_halt: false,
        }
    }

    #[must_use]
    pub const fn on_thread(mut self, thread: ThreadId) -> Self
    {
        self.thread = thread;
        self
    }

    #[must_use]
    pub const fn after(mut self, delay: Duration) -> Self
    {
        self.delay = delay;
        self
    }

    /// Deliver this stop when the inferior is next halted.
    #[must_use]
    pub const fn racing_halt(mut self) -> Self
    {
        self.racing_halt = true;
        self
    }
}
