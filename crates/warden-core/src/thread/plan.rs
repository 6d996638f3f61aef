//! Thread plans: why a thread is resumed and when it should stop again.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use super::{StopInfo, StopReason, Thread};
use crate::types::Address;

/// Three-way vote used when deciding whether to surface a state change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Vote
{
    /// Surface it
    Yes,
    /// Hide it
    No,
    /// Leave it to the others
    NoOpinion,
}

/// Coarse classification of a plan, readable by backends
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadPlanKind
{
    /// Bottom-of-stack plan that explains every stop
    Base,
    /// Calls `function` and completes when control comes back to `return_address`
    CallFunction
    {
        /// Entry point of the called function
        function: Address,
        /// Address the call returns to
        return_address: Address,
    },
}

/// Flags every plan carries
#[derive(Debug)]
pub struct PlanFlags
{
    private: AtomicBool,
    stop_others: AtomicBool,
    done: AtomicBool,
}

impl PlanFlags
{
    /// Flags for a new plan.
    #[must_use]
    pub const fn new(private: bool, stop_others: bool) -> Self
    {
        Self {
            private: AtomicBool::new(private),
            stop_others: AtomicBool::new(stop_others),
            done: AtomicBool::new(false),
        }
    }

    /// Private plans complete silently (no `PlanComplete` stop reason).
    #[must_use]
    pub fn is_private(&self) -> bool
    {
        self.private.load(Ordering::SeqCst)
    }

    /// Set the private flag.
    pub fn set_private(&self, private: bool)
    {
        self.private.store(private, Ordering::SeqCst);
    }

    /// Whether other threads stay suspended while this plan runs.
    #[must_use]
    pub fn stop_others(&self) -> bool
    {
        self.stop_others.load(Ordering::SeqCst)
    }

    /// Set the stop-others flag.
    pub fn set_stop_others(&self, stop_others: bool)
    {
        self.stop_others.store(stop_others, Ordering::SeqCst);
    }

    /// Whether the plan reached its goal.
    #[must_use]
    pub fn is_done(&self) -> bool
    {
        self.done.load(Ordering::SeqCst)
    }

    /// Mark the plan as having reached its goal.
    pub fn mark_done(&self)
    {
        self.done.store(true, Ordering::SeqCst);
    }
}

/// A unit of "why we resume this thread and when it should stop"
///
/// Plans live on a per-thread stack. When the thread stops, the stack is
/// walked from the top; the first plan that explains the stop decides
/// whether the thread should stop, and is popped once it is done.
pub trait ThreadPlan: Send + Sync
{
    /// Classification visible to backends.
    fn kind(&self) -> ThreadPlanKind;

    /// Human-readable description, also used as the `PlanComplete` text.
    fn description(&self) -> String;

    /// Shared flags.
    fn flags(&self) -> &PlanFlags;

    /// Called when pushed onto `thread`'s stack.
    fn did_push(&self, _thread: &Thread) {}

    /// Called right before the process resumes.
    fn will_resume(&self, _thread: &Thread) {}

    /// Whether this plan accounts for the stop described by `stop_info`.
    fn explains_stop(&self, thread: &Thread, stop_info: &StopInfo) -> bool;

    /// Whether the thread should stop, given this plan explains the stop.
    fn should_stop(&self, thread: &Thread, stop_info: &StopInfo) -> bool;

    /// Called when popped (completed or discarded).
    fn will_pop(&self, _thread: &Thread) {}

    /// Vote on surfacing a stop that nobody wants to stop for.
    fn should_report_stop(&self, _thread: &Thread) -> Vote
    {
        Vote::NoOpinion
    }

    /// Vote on surfacing a resume.
    fn should_report_run(&self, _thread: &Thread) -> Vote
    {
        Vote::NoOpinion
    }

    /// Private plans complete silently.
    fn is_private(&self) -> bool
    {
        self.flags().is_private()
    }

    /// Set the private flag.
    fn set_private(&self, private: bool)
    {
        self.flags().set_private(private);
    }

    /// Whether other threads stay suspended while this plan runs.
    fn stop_others(&self) -> bool
    {
        self.flags().stop_others()
    }

    /// Set the stop-others flag.
    fn set_stop_others(&self, stop_others: bool)
    {
        self.flags().set_stop_others(stop_others);
    }

    /// Whether the plan reached its goal.
    fn is_done(&self) -> bool
    {
        self.flags().is_done()
    }

    /// Whether this plan can be run at all (setup may fail).
    fn is_valid(&self) -> bool
    {
        true
    }
}

impl fmt::Debug for dyn ThreadPlan
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        write!(f, "ThreadPlan({})", self.description())
    }
}

/// Whether two plan handles are the same plan.
#[must_use]
pub fn same_plan(a: &Arc<dyn ThreadPlan>, b: &Arc<dyn ThreadPlan>) -> bool
{
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

/// Bottom-of-stack plan
///
/// Explains every stop and defers to the stop info for the decision.
#[derive(Debug)]
pub struct BasePlan
{
    flags: PlanFlags,
}

impl BasePlan
{
    /// Create the base plan.
    #[must_use]
    pub const fn new() -> Self
    {
        Self {
            flags: PlanFlags::new(true, false),
        }
    }
}

impl Default for BasePlan
{
    fn default() -> Self
    {
        Self::new()
    }
}

impl ThreadPlan for BasePlan
{
    fn kind(&self) -> ThreadPlanKind
    {
        ThreadPlanKind::Base
    }

    fn description(&self) -> String
    {
        "base plan".to_string()
    }

    fn flags(&self) -> &PlanFlags
    {
        &self.flags
    }

    fn explains_stop(&self, _thread: &Thread, _stop_info: &StopInfo) -> bool
    {
        true
    }

    fn should_stop(&self, thread: &Thread, stop_info: &StopInfo) -> bool
    {
        stop_info.should_stop(thread)
    }

    fn should_report_stop(&self, thread: &Thread) -> Vote
    {
        let Some(stop_info) = thread.stop_info() else {
            return Vote::NoOpinion;
        };
        match stop_info.reason() {
            StopReason::Signal(_) if stop_info.should_notify(thread) => Vote::Yes,
            StopReason::Signal(_) => Vote::No,
            StopReason::Breakpoint(_) if !stop_info.should_notify(thread) => Vote::No,
            _ => Vote::NoOpinion,
        }
    }
}
