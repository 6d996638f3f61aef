//! Why a thread stopped, and what to do about it.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};

use tracing::debug;

use super::Thread;
use crate::breakpoints::{BreakpointSiteId, StoppointCallbackContext, WatchpointId};

/// Reason a thread stopped
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason
{
    /// The thread did not stop for a reason of its own
    None,
    /// Single-step or return trap
    Trace,
    /// Trapped on a breakpoint site
    Breakpoint(BreakpointSiteId),
    /// Triggered a watchpoint
    Watchpoint(WatchpointId),
    /// Received a signal
    Signal(i32),
    /// Raised a machine exception
    Exception(String),
    /// A non-private thread plan completed; carries its description
    PlanComplete(String),
    /// The process exec'd a new image
    Exec,
}

/// Stop reason bound to the stop it was observed at
///
/// The "should stop" decision has side effects (hit counts, ignore counts,
/// synchronous callbacks) so it is computed once and remembered.
pub struct StopInfo
{
    reason: StopReason,
    stop_id: u32,
    resume_id: u32,
    should_stop: Mutex<Option<bool>>,
    performed_action: AtomicBool,
}

impl StopInfo
{
    /// Bind `reason` to the stop with `stop_id`, observed before resume `resume_id`.
    #[must_use]
    pub fn new(reason: StopReason, stop_id: u32, resume_id: u32) -> Self
    {
        Self {
            reason,
            stop_id,
            resume_id,
            should_stop: Mutex::new(None),
            performed_action: AtomicBool::new(false),
        }
    }

    /// The reason.
    #[must_use]
    pub const fn reason(&self) -> &StopReason
    {
        &self.reason
    }

    /// Stop id this info belongs to.
    #[must_use]
    pub const fn stop_id(&self) -> u32
    {
        self.stop_id
    }

    /// Whether the process resumed or stopped again since this info was created.
    #[must_use]
    pub fn has_target_run_since_me(&self, thread: &Thread) -> bool
    {
        thread.process().is_none_or(|process| {
            let ids = process.mod_id();
            ids.stop_id != self.stop_id || ids.resume_id != self.resume_id
        })
    }

    /// Whether the thread should stop for this reason. Computed once.
    pub fn should_stop(&self, thread: &Thread) -> bool
    {
        let mut cached = self.should_stop.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(decision) = *cached {
            return decision;
        }
        let decision = self.compute_should_stop(thread);
        *cached = Some(decision);
        decision
    }

    /// Override the stop decision (an asynchronous callback asked to continue).
    pub fn override_should_stop(&self, should_stop: bool)
    {
        *self.should_stop.lock().unwrap_or_else(PoisonError::into_inner) = Some(should_stop);
    }

    fn compute_should_stop(&self, thread: &Thread) -> bool
    {
        let Some(process) = thread.process() else {
            return true;
        };
        match &self.reason {
            StopReason::None => false,
            StopReason::Breakpoint(site_id) => {
                let Some(site) = process.breakpoint_site_list().find_by_id(*site_id) else {
                    debug!(site = %site_id, "breakpoint site vanished, stopping");
                    return true;
                };
                let context = StoppointCallbackContext {
                    process: process.clone(),
                    thread: thread.shared(),
                    is_synchronous: true,
                };
                site.should_stop(&context)
            }
            StopReason::Signal(signo) => process.unix_signals().should_stop(*signo),
            StopReason::Trace
            | StopReason::Watchpoint(_)
            | StopReason::Exception(_)
            | StopReason::PlanComplete(_)
            | StopReason::Exec => true,
        }
    }

    /// Whether clients should hear about this stop when nobody stops for it.
    #[must_use]
    pub fn should_notify(&self, thread: &Thread) -> bool
    {
        let Some(process) = thread.process() else {
            return true;
        };
        match &self.reason {
            StopReason::Signal(signo) => process.unix_signals().should_notify(*signo),
            StopReason::Breakpoint(site_id) => process
                .breakpoint_site_list()
                .find_by_id(*site_id)
                .is_none_or(|site| !site.is_internal()),
            _ => true,
        }
    }

    /// Run the deferred side effects of this stop: asynchronous breakpoint
    /// callbacks and watchpoint hit counting. Runs at most once.
    pub fn perform_action(&self, thread: &Thread)
    {
        if self.performed_action.swap(true, Ordering::SeqCst) {
            return;
        }
        let Some(process) = thread.process() else {
            return;
        };
        match &self.reason {
            StopReason::Breakpoint(site_id) => {
                if !self.should_stop(thread) {
                    return;
                }
                let Some(site) = process.breakpoint_site_list().find_by_id(*site_id) else {
                    return;
                };
                let context = StoppointCallbackContext {
                    process: process.clone(),
                    thread: thread.shared(),
                    is_synchronous: false,
                };
                let mut keep_stopped = false;
                for owner in site.owners() {
                    keep_stopped |= owner.invoke_async_callback(&context);
                    if self.has_target_run_since_me(thread) {
                        // A callback resumed the process; the remaining owners see a stale stop.
                        break;
                    }
                }
                if !keep_stopped {
                    self.override_should_stop(false);
                }
            }
            StopReason::Watchpoint(id) => {
                if let Some(watchpoint) = process.target().and_then(|target| target.watchpoints().find(*id)) {
                    watchpoint.record_hit();
                }
            }
            _ => {}
        }
    }

    /// One-line description for clients.
    #[must_use]
    pub fn description(&self) -> String
    {
        match &self.reason {
            StopReason::None => "no stop reason".to_string(),
            StopReason::Trace => "trace".to_string(),
            StopReason::Breakpoint(site) => format!("breakpoint site {site}"),
            StopReason::Watchpoint(id) => format!("watchpoint {}", id.raw()),
            StopReason::Signal(signo) => format!("signal {signo}"),
            StopReason::Exception(text) => format!("exception: {text}"),
            StopReason::PlanComplete(plan) => format!("plan complete: {plan}"),
            StopReason::Exec => "exec".to_string(),
        }
    }
}

impl fmt::Debug for StopInfo
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        f.debug_struct("StopInfo")
            .field("reason", &self.reason)
            .field("stop_id", &self.stop_id)
            .finish_non_exhaustive()
    }
}
