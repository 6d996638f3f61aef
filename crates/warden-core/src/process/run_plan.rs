//! # Running a Thread Plan Synchronously
//!
//! [`Process::run_thread_plan`] resumes the inferior until a plan (usually a
//! function call) completes, and blocks the caller meanwhile. Public events
//! are hijacked for the duration, so nothing else reacts to the resumes and
//! stops this causes.
//!
//! ## Timeouts
//!
//! The plan first runs with only its own thread resumed. If that phase
//! times out, the process is halted; unless `try_all_threads` is off, the
//! plan is retried with every thread running (the callee may be waiting on
//! a lock another thread holds) under the longer all-threads timeout.
//!
//! Every path ends in one of the [`ExecutionResults`].

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info, trace, warn};

use super::{Process, ProcessEventData};
use crate::events::{Event, EventMask, Listener};
use crate::thread::{StopReason, Thread, ThreadPlan};
use crate::types::{StackFrame, StackId, StateType};

/// Outcome of [`Process::run_thread_plan`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExecutionResults
{
    /// The plan ran to completion
    Completed,
    /// The plan was discarded before it completed
    Discarded,
    /// Something else stopped the process first
    Interrupted,
    /// The plan could not be started
    SetupError,
    /// Every timeout elapsed
    TimedOut,
}

impl ExecutionResults
{
    /// Name of the outcome.
    #[must_use]
    pub const fn as_str(self) -> &'static str
    {
        match self {
            ExecutionResults::Completed => "Completed",
            ExecutionResults::Discarded => "Discarded",
            ExecutionResults::Interrupted => "Interrupted",
            ExecutionResults::SetupError => "SetupError",
            ExecutionResults::TimedOut => "TimedOut",
        }
    }
}

impl fmt::Display for ExecutionResults
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        f.write_str(self.as_str())
    }
}

/// Knobs of [`Process::run_thread_plan`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunPlanOptions
{
    /// Keep other threads suspended in the first phase
    pub stop_others: bool,
    /// Retry with every thread running after the first timeout
    pub try_all_threads: bool,
    /// Pop the plan (and anything above it) when it does not complete
    pub discard_on_error: bool,
    /// First-phase timeout; `None` waits forever
    pub single_thread_timeout: Option<Duration>,
}

impl Default for RunPlanOptions
{
    fn default() -> Self
    {
        Self {
            stop_others: true,
            try_all_threads: true,
            discard_on_error: true,
            single_thread_timeout: Some(Duration::from_millis(500)),
        }
    }
}

/// Result of a [`Process::run_thread_plan`] call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunPlanOutcome
{
    /// How the run ended
    pub result: ExecutionResults,
    /// Diagnostics collected on the way
    pub errors: Vec<String>,
}

impl RunPlanOutcome
{
    fn setup_error(message: impl Into<String>) -> Self
    {
        Self {
            result: ExecutionResults::SetupError,
            errors: vec![message.into()],
        }
    }
}

/// Where an expression runs: a process, a thread, and a frame
#[derive(Debug, Clone, Default)]
pub struct ExecutionContext
{
    /// Process, if any
    pub process: Option<Arc<Process>>,
    /// Thread, if any
    pub thread: Option<Arc<Thread>>,
    /// Frame of `thread`, if any
    pub frame: Option<StackFrame>,
}

impl ExecutionContext
{
    /// Context for the selected thread and frame of `process`.
    #[must_use]
    pub fn from_process(process: &Arc<Process>) -> Self
    {
        let thread = process.thread_list().selected_thread();
        let frame = thread.as_ref().and_then(|thread| thread.selected_frame());
        Self {
            process: Some(Arc::clone(process)),
            thread,
            frame,
        }
    }
}

/// Where the wait loop ended
enum Phase
{
    Done(ExecutionResults),
    /// The plan's thread stopped; decide from its plan state
    Stopped,
}

struct SavedSelection
{
    thread_index_id: u32,
    frame_id: Option<StackId>,
    selected_thread: Option<u32>,
    selected_frame: Option<StackId>,
}

impl Process
{
    /// Run `plan` on the context's thread until it completes, times out, or
    /// is interrupted. The selected thread and frame are restored afterwards.
    pub fn run_thread_plan(
        &self,
        exe_ctx: &mut ExecutionContext,
        plan: &Arc<dyn ThreadPlan>,
        options: &RunPlanOptions,
    ) -> RunPlanOutcome
    {
        let Some(thread) = exe_ctx.thread.clone() else {
            return RunPlanOutcome::setup_error("RunThreadPlan called with empty thread.");
        };
        if self.private_state() != StateType::Stopped {
            return RunPlanOutcome::setup_error("RunThreadPlan called while the private state was not stopped.");
        }
        if self.is_private_state_thread() {
            return RunPlanOutcome::setup_error("RunThreadPlan called on the private state thread.");
        }

        let orig_private = plan.is_private();
        plan.set_private(false);
        plan.set_stop_others(options.stop_others);

        let selected = self.threads.selected_thread();
        let saved = SavedSelection {
            thread_index_id: thread.index_id(),
            frame_id: exe_ctx.frame.map(|frame| frame.id),
            selected_thread: selected.as_ref().map(|thread| thread.index_id()),
            selected_frame: selected
                .as_ref()
                .and_then(|thread| thread.selected_frame())
                .map(|frame| frame.id),
        };

        thread.queue_thread_plan(Arc::clone(plan), false);
        if !plan.is_valid() {
            thread.discard_thread_plans_up_to_plan(plan);
            plan.set_private(orig_private);
            return RunPlanOutcome::setup_error("The thread plan could not be set up.");
        }

        info!(
            pid = %self.pid_string(),
            thread = saved.thread_index_id,
            plan = %plan.description(),
            "running thread plan"
        );

        let listener = Listener::new("warden.process.run-thread-plan");
        self.broadcaster.hijack(&listener, EventMask::STATE_CHANGED);
        self.set_running_user_expression(true);

        let mut errors = Vec::new();
        let phase = self.drive_thread_plan(&listener, saved.thread_index_id, plan, options, &mut errors);

        let thread_now = self
            .threads
            .find_thread_by_index_id(saved.thread_index_id)
            .unwrap_or_else(|| Arc::clone(&thread));
        let result = match phase {
            Phase::Stopped => {
                if thread_now.is_thread_plan_done(plan) {
                    plan.set_private(orig_private);
                    ExecutionResults::Completed
                } else if thread_now.was_thread_plan_discarded(plan) {
                    ExecutionResults::Discarded
                } else {
                    errors.push("Execution stopped before the thread plan completed.".to_string());
                    ExecutionResults::Interrupted
                }
            }
            Phase::Done(result) => result,
        };

        if matches!(
            result,
            ExecutionResults::Interrupted | ExecutionResults::SetupError | ExecutionResults::TimedOut
        ) && options.discard_on_error
        {
            debug!(thread = saved.thread_index_id, %result, "discarding thread plan after failure");
            thread_now.discard_thread_plans_up_to_plan(plan);
            plan.set_private(orig_private);
        }

        self.set_running_user_expression(false);
        self.broadcaster.restore();
        while listener.try_next_event().is_some() {}

        self.restore_selection(exe_ctx, &thread_now, &saved);
        info!(pid = %self.pid_string(), %result, "thread plan finished");
        RunPlanOutcome { result, errors }
    }

    fn drive_thread_plan(
        &self,
        listener: &Listener,
        thread_index_id: u32,
        plan: &Arc<dyn ThreadPlan>,
        options: &RunPlanOptions,
        errors: &mut Vec<String>,
    ) -> Phase
    {
        let mut first_timeout = true;
        let mut do_resume = true;
        loop {
            if do_resume {
                if let Err(error) = self.resume() {
                    errors.push(format!("Error resuming inferior: \"{error}\"."));
                    return Phase::Done(ExecutionResults::SetupError);
                }
                match listener.wait_for_event(Some(self.settings.running_event_timeout)) {
                    None => {
                        errors.push("Didn't get any event after initial resume, exiting.".to_string());
                        return Phase::Done(ExecutionResults::SetupError);
                    }
                    Some(event) => {
                        let state = ProcessEventData::state_from_event(&event);
                        if !state.is_running() {
                            errors.push(format!(
                                "Didn't get running event after initial resume, got {state} instead."
                            ));
                            return Phase::Done(ExecutionResults::SetupError);
                        }
                    }
                }
            } else {
                do_resume = true;
            }

            let timeout = if first_timeout {
                options.single_thread_timeout
            } else {
                Some(self.settings.all_threads_timeout)
            };
            trace!(?timeout, first_timeout, "waiting for thread plan stop");

            if let Some(event) = listener.wait_for_event(timeout) {
                let state = ProcessEventData::state_from_event(&event);
                match state {
                    StateType::Stopped => {
                        if ProcessEventData::restarted_from_event(&event) {
                            do_resume = false;
                            continue;
                        }
                        return self.classify_stop(thread_index_id, errors);
                    }
                    StateType::Running | StateType::Stepping => {
                        do_resume = false;
                        continue;
                    }
                    StateType::Crashed => {
                        errors.push("Execution crashed.".to_string());
                        return Phase::Done(ExecutionResults::Interrupted);
                    }
                    _ => {
                        errors.push("Execution stopped with unexpected state.".to_string());
                        return Phase::Done(ExecutionResults::Interrupted);
                    }
                }
            }

            debug!(first_timeout, "thread plan timed out, halting");
            if let Err(error) = self.halt() {
                warn!(%error, "halt after thread plan timeout failed");
                errors.push(format!("Halt failed: {error}"));
            }
            let Some(event) = self.wait_for_stop(listener) else {
                errors.push("Halt failed to produce a stop event.".to_string());
                return Phase::Done(ExecutionResults::Interrupted);
            };
            if !ProcessEventData::state_from_event(&event).is_stopped() {
                errors.push("Execution stopped with unexpected state.".to_string());
                return Phase::Done(ExecutionResults::Interrupted);
            }
            let done = self
                .threads
                .find_thread_by_index_id(thread_index_id)
                .is_some_and(|thread| thread.is_thread_plan_done(plan));
            if done {
                return Phase::Stopped;
            }
            if !options.try_all_threads {
                errors.push("Execution timed out and was interrupted.".to_string());
                return Phase::Done(ExecutionResults::Interrupted);
            }
            if first_timeout {
                debug!("retrying thread plan with all threads running");
                first_timeout = false;
                plan.set_stop_others(false);
                continue;
            }
            errors.push("Execution timed out with all threads running.".to_string());
            return Phase::Done(ExecutionResults::TimedOut);
        }
    }

    /// The plan's thread stopped: completed plan or an interruption?
    fn classify_stop(&self, thread_index_id: u32, errors: &mut Vec<String>) -> Phase
    {
        let Some(thread) = self.threads.find_thread_by_index_id(thread_index_id) else {
            errors.push("The thread the plan was running on went away.".to_string());
            return Phase::Done(ExecutionResults::Interrupted);
        };
        match thread.stop_info().map(|info| info.reason().clone()) {
            Some(StopReason::PlanComplete(_)) => Phase::Stopped,
            Some(reason) => {
                debug!(?reason, "thread plan interrupted");
                errors.push(format!("Execution was interrupted, reason: {reason:?}."));
                Phase::Done(ExecutionResults::Interrupted)
            }
            None => {
                errors.push("Execution was interrupted.".to_string());
                Phase::Done(ExecutionResults::Interrupted)
            }
        }
    }

    /// Wait briefly for the stop a halt produced, skipping running events.
    fn wait_for_stop(&self, listener: &Listener) -> Option<Event>
    {
        let deadline = Instant::now() + self.settings.running_event_timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let event = listener.wait_for_event(Some(remaining))?;
            if !ProcessEventData::state_from_event(&event).is_running() {
                return Some(event);
            }
        }
    }

    fn restore_selection(&self, exe_ctx: &mut ExecutionContext, thread: &Arc<Thread>, saved: &SavedSelection)
    {
        if exe_ctx.thread.is_some() {
            exe_ctx.thread = Some(Arc::clone(thread));
        }
        if let Some(frame_id) = saved.frame_id {
            exe_ctx.frame = thread.frames().into_iter().find(|frame| frame.id == frame_id);
        }
        if let Some(index_id) = saved.selected_thread {
            self.threads.set_selected_thread_by_index_id(index_id);
            if let (Some(selected), Some(frame_id)) =
                (self.threads.find_thread_by_index_id(index_id), saved.selected_frame)
            {
                selected.set_selected_frame_by_id(frame_id);
            }
        }
    }
}
