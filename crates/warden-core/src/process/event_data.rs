//! Payload of process state-change events.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};

use tracing::{debug, warn};

use super::Process;
use crate::events::Event;
use crate::types::StateType;

/// State change of a process, shared by every copy of the event
///
/// The private-state task flags an event for public delivery with
/// [`set_update_state_on_removal`](Self::set_update_state_on_removal). The
/// first listener to take such an event off its queue runs
/// [`do_on_removal`](Self::do_on_removal): the public state is updated, stop
/// actions run, and stop hooks fire.
pub struct ProcessEventData
{
    process: Weak<Process>,
    state: StateType,
    restarted: AtomicBool,
    interrupted: AtomicBool,
    update_state: AtomicU32,
}

impl ProcessEventData
{
    /// Payload announcing that `process` entered `state`.
    #[must_use]
    pub fn new(process: Weak<Process>, state: StateType) -> Self
    {
        Self {
            process,
            state,
            restarted: AtomicBool::new(false),
            interrupted: AtomicBool::new(false),
            update_state: AtomicU32::new(0),
        }
    }

    /// Process the event belongs to, if still alive.
    #[must_use]
    pub fn process(&self) -> Option<Arc<Process>>
    {
        self.process.upgrade()
    }

    /// The new state.
    #[must_use]
    pub const fn state(&self) -> StateType
    {
        self.state
    }

    /// Whether the process was resumed again before anybody saw this stop.
    #[must_use]
    pub fn restarted(&self) -> bool
    {
        self.restarted.load(Ordering::SeqCst)
    }

    /// Mark the stop as restarted.
    pub fn set_restarted(&self, restarted: bool)
    {
        self.restarted.store(restarted, Ordering::SeqCst);
    }

    /// Whether the stop was caused by an explicit halt.
    #[must_use]
    pub fn interrupted(&self) -> bool
    {
        self.interrupted.load(Ordering::SeqCst)
    }

    /// Mark the stop as caused by a halt.
    pub fn set_interrupted(&self, interrupted: bool)
    {
        self.interrupted.store(interrupted, Ordering::SeqCst);
    }

    /// Arm the removal hook for public delivery.
    pub fn set_update_state_on_removal(&self)
    {
        self.update_state.fetch_add(1, Ordering::SeqCst);
    }

    /// State carried by `event`, [`StateType::Invalid`] for other events.
    #[must_use]
    pub fn state_from_event(event: &Event) -> StateType
    {
        event.process_data().map_or(StateType::Invalid, |data| data.state())
    }

    /// Restarted flag of `event`.
    #[must_use]
    pub fn restarted_from_event(event: &Event) -> bool
    {
        event.process_data().is_some_and(|data| data.restarted())
    }

    /// Interrupted flag of `event`.
    #[must_use]
    pub fn interrupted_from_event(event: &Event) -> bool
    {
        event.process_data().is_some_and(|data| data.interrupted())
    }

    /// Removal hook: sync the public state and run stop actions.
    ///
    /// Only runs for events the private-state task released to the public
    /// broadcaster. Thread actions stop early when one of them resumed the
    /// process or when the thread list changed underneath the loop.
    pub(crate) fn do_on_removal(&self)
    {
        if self.update_state.load(Ordering::SeqCst) != 1 {
            return;
        }
        let Some(process) = self.process.upgrade() else {
            return;
        };
        process.set_public_state(self.state);

        if self.state != StateType::Stopped || self.restarted() {
            return;
        }

        let index_ids: Vec<u32> = process
            .thread_list()
            .threads()
            .iter()
            .map(|thread| thread.index_id())
            .collect();
        let mut still_should_stop = true;

        for (position, expected) in index_ids.iter().enumerate() {
            let threads = process.thread_list().threads();
            if threads.len() != index_ids.len() {
                debug!(
                    before = index_ids.len(),
                    after = threads.len(),
                    "number of threads changed while processing event"
                );
                break;
            }
            let thread = &threads[position];
            if thread.index_id() != *expected {
                debug!(
                    position,
                    expected,
                    found = thread.index_id(),
                    "thread list reordered while processing event"
                );
                break;
            }
            let Some(stop_info) = thread.stop_info() else {
                continue;
            };
            stop_info.perform_action(thread);
            if stop_info.has_target_run_since_me(thread) {
                self.set_restarted(true);
                break;
            }
            if !stop_info.should_stop(thread) {
                still_should_stop = false;
            }
        }

        if process.private_state().is_running() {
            return;
        }
        if !still_should_stop {
            self.set_restarted(true);
            if let Err(error) = process.resume() {
                warn!(%error, "failed to resume after stop actions");
            }
        } else if !process.is_running_user_expression() {
            process.run_stop_hooks();
            if process.private_state().is_running() {
                self.set_restarted(true);
            }
        }
    }
}

impl fmt::Debug for ProcessEventData
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        f.debug_struct("ProcessEventData")
            .field("state", &self.state)
            .field("restarted", &self.restarted())
            .field("interrupted", &self.interrupted())
            .finish_non_exhaustive()
    }
}
