//! Ordered collection of a process's threads.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{debug, trace};

use super::plan::{ThreadPlanKind, Vote};
use super::{ResumeState, Thread};
use crate::types::ThreadId;

#[derive(Debug, Default)]
struct ThreadListState
{
    threads: Vec<Arc<Thread>>,
    selected: Option<u32>,
    stop_id: u32,
}

/// Threads of one process, in backend order
///
/// Voting methods work on a snapshot so plans and callbacks are free to
/// touch the list while they run.
#[derive(Debug, Default)]
pub struct ThreadList
{
    state: Mutex<ThreadListState>,
}

impl ThreadList
{
    /// Empty list.
    #[must_use]
    pub fn new() -> Self
    {
        Self::default()
    }

    /// Snapshot of the threads.
    #[must_use]
    pub fn threads(&self) -> Vec<Arc<Thread>>
    {
        self.lock().threads.clone()
    }

    /// Number of threads.
    #[must_use]
    pub fn len(&self) -> usize
    {
        self.lock().threads.len()
    }

    /// Whether there are no threads.
    #[must_use]
    pub fn is_empty(&self) -> bool
    {
        self.lock().threads.is_empty()
    }

    /// Append a thread. The first thread added becomes the selected one.
    pub fn add(&self, thread: Arc<Thread>)
    {
        let mut state = self.lock();
        if state.selected.is_none() {
            state.selected = Some(thread.index_id());
        }
        state.threads.push(thread);
    }

    /// Remove the thread with `index_id`.
    pub fn remove(&self, index_id: u32) -> Option<Arc<Thread>>
    {
        let mut state = self.lock();
        let position = state.threads.iter().position(|thread| thread.index_id() == index_id)?;
        let removed = state.threads.remove(position);
        if state.selected == Some(index_id) {
            state.selected = state.threads.first().map(|thread| thread.index_id());
        }
        Some(removed)
    }

    /// Replace the whole list with a fresh backend refresh.
    ///
    /// The selection survives when the selected index id is still present.
    pub fn update(&self, threads: Vec<Arc<Thread>>, stop_id: u32)
    {
        let mut state = self.lock();
        let keep = state
            .selected
            .filter(|selected| threads.iter().any(|thread| thread.index_id() == *selected));
        state.selected = keep.or_else(|| threads.first().map(|thread| thread.index_id()));
        state.threads = threads;
        state.stop_id = stop_id;
        debug!(count = state.threads.len(), stop_id, "thread list updated");
    }

    /// Stop id the list was last refreshed at.
    #[must_use]
    pub fn stop_id(&self) -> u32
    {
        self.lock().stop_id
    }

    /// Record the stop id of the latest refresh.
    pub fn set_stop_id(&self, stop_id: u32)
    {
        self.lock().stop_id = stop_id;
    }

    /// Thread by stable index id.
    #[must_use]
    pub fn find_thread_by_index_id(&self, index_id: u32) -> Option<Arc<Thread>>
    {
        self.lock()
            .threads
            .iter()
            .find(|thread| thread.index_id() == index_id)
            .cloned()
    }

    /// Thread by backend id.
    #[must_use]
    pub fn find_thread_by_id(&self, tid: ThreadId) -> Option<Arc<Thread>>
    {
        self.lock().threads.iter().find(|thread| thread.tid() == tid).cloned()
    }

    /// The selected thread, falling back to the first one.
    #[must_use]
    pub fn selected_thread(&self) -> Option<Arc<Thread>>
    {
        let state = self.lock();
        state
            .selected
            .and_then(|selected| state.threads.iter().find(|thread| thread.index_id() == selected))
            .or_else(|| state.threads.first())
            .cloned()
    }

    /// Select the thread with `index_id`. Returns whether it exists.
    pub fn set_selected_thread_by_index_id(&self, index_id: u32) -> bool
    {
        let mut state = self.lock();
        if state.threads.iter().any(|thread| thread.index_id() == index_id) {
            state.selected = Some(index_id);
            true
        } else {
            false
        }
    }

    /// Ask every thread whether the process should stay stopped.
    ///
    /// Every thread is consulted so that each plan stack sees the stop. When
    /// no thread stopped for a reason of its own (an unexplained stop), the
    /// process stays stopped.
    pub fn should_stop(&self) -> bool
    {
        let threads = self.threads();
        let mut should_stop = false;
        let mut any_reason = false;
        for thread in &threads {
            any_reason |= thread.stopped_for_a_reason();
            should_stop |= thread.should_stop();
        }
        let decision = should_stop || !any_reason;
        trace!(threads = threads.len(), should_stop = decision, "thread list stop vote");
        decision
    }

    /// Tally stop-report votes: any `Yes` wins, then any `No`.
    #[must_use]
    pub fn should_report_stop(&self) -> Vote
    {
        let mut result = Vote::NoOpinion;
        for thread in self.threads() {
            if !thread.stopped_for_a_reason() {
                continue;
            }
            match thread.should_report_stop() {
                Vote::Yes => return Vote::Yes,
                Vote::No => result = Vote::No,
                Vote::NoOpinion => {}
            }
        }
        result
    }

    /// Tally run-report votes: any `Yes` wins, then any `No`.
    #[must_use]
    pub fn should_report_run(&self) -> Vote
    {
        let mut result = Vote::NoOpinion;
        for thread in self.threads() {
            match thread.should_report_run() {
                Vote::Yes => return Vote::Yes,
                Vote::No => result = Vote::No,
                Vote::NoOpinion => {}
            }
        }
        result
    }

    /// Assign resume states ahead of a resume.
    ///
    /// A thread whose current plan wants the others stopped runs alone;
    /// otherwise every thread runs.
    pub fn will_resume(&self)
    {
        let threads = self.threads();
        let exclusive = threads.iter().find(|thread| {
            let plan = thread.current_plan();
            plan.kind() != ThreadPlanKind::Base && plan.stop_others()
        });
        match exclusive {
            Some(runner) => {
                let runner_id = runner.index_id();
                debug!(thread = runner_id, "resuming one thread, others suspended");
                for thread in &threads {
                    let state = if thread.index_id() == runner_id {
                        ResumeState::Running
                    } else {
                        ResumeState::Suspended
                    };
                    thread.will_resume(state);
                }
            }
            None => {
                for thread in &threads {
                    thread.will_resume(ResumeState::Running);
                }
            }
        }
    }

    /// Tell every thread the process resumed.
    pub fn did_resume(&self)
    {
        for thread in self.threads() {
            thread.did_resume();
        }
    }

    fn lock(&self) -> MutexGuard<'_, ThreadListState>
    {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
