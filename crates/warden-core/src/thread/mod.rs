//! # Threads
//!
//! Inferior threads, the stop information they carry, and the thread plans
//! that decide when a resumed thread should stop again.
//!
//! ## Stop resolution
//!
//! Backends only record a raw [`StopReason`] on a thread before announcing a
//! stop. The first call to [`Thread::stop_info`] after the stop binds that
//! reason to the current stop id; [`ThreadList::should_stop`] then walks
//! each thread's plan stack from the top, and the first plan that explains
//! the stop decides.
//!
//! ## Plan stacks
//!
//! Every thread starts with a [`BasePlan`]. Plans pushed on top of it (such
//! as [`CallFunctionPlan`]) are popped onto the *completed* list once done, or
//! onto the *discarded* list when dropped early. Both lists are cleared on
//! the next resume.

pub mod call_function;
pub mod list;
pub mod plan;
pub mod stop_info;

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use tracing::{debug, trace};

pub use call_function::CallFunctionPlan;
pub use list::ThreadList;
pub use plan::{same_plan, BasePlan, PlanFlags, ThreadPlan, ThreadPlanKind, Vote};
pub use stop_info::{StopInfo, StopReason};

use crate::error::{WardenError, WardenResult};
use crate::process::Process;
use crate::types::{Address, RegisterId, Registers, StackFrame, StackId, ThreadId};

/// How a thread takes part in the next resume
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ResumeState
{
    /// Runs freely
    #[default]
    Running,
    /// Executes a single instruction
    Stepping,
    /// Stays put while the others run
    Suspended,
}

#[derive(Default)]
struct PlanStack
{
    active: Vec<Arc<dyn ThreadPlan>>,
    completed: Vec<Arc<dyn ThreadPlan>>,
    discarded: Vec<Arc<dyn ThreadPlan>>,
}

/// One thread of the inferior
///
/// The index id is assigned by the process and never reused, so it survives
/// thread-list rebuilds; the backend thread id may not.
pub struct Thread
{
    weak_self: Weak<Thread>,
    process: Weak<Process>,
    index_id: u32,
    tid: ThreadId,
    registers: Mutex<Registers>,
    pending_reason: Mutex<Option<StopReason>>,
    stop_info: Mutex<Option<Arc<StopInfo>>>,
    resume_state: Mutex<ResumeState>,
    plans: Mutex<PlanStack>,
    frames: Mutex<Option<Vec<StackFrame>>>,
    selected_frame: Mutex<usize>,
}

impl Thread
{
    /// Create a thread with a base plan on its stack.
    #[must_use]
    pub fn new(process: Weak<Process>, index_id: u32, tid: ThreadId, registers: Registers) -> Arc<Self>
    {
        Arc::new_cyclic(|weak_self| {
            let base: Arc<dyn ThreadPlan> = Arc::new(BasePlan::new());
            Self {
                weak_self: weak_self.clone(),
                process,
                index_id,
                tid,
                registers: Mutex::new(registers),
                pending_reason: Mutex::new(None),
                stop_info: Mutex::new(None),
                resume_state: Mutex::new(ResumeState::Running),
                plans: Mutex::new(PlanStack {
                    active: vec![base],
                    ..PlanStack::default()
                }),
                frames: Mutex::new(None),
                selected_frame: Mutex::new(0),
            }
        })
    }

    /// Stable index id.
    #[must_use]
    pub const fn index_id(&self) -> u32
    {
        self.index_id
    }

    /// Backend thread id.
    #[must_use]
    pub const fn tid(&self) -> ThreadId
    {
        self.tid
    }

    /// Owning process, if it is still alive.
    #[must_use]
    pub fn process(&self) -> Option<Arc<Process>>
    {
        self.process.upgrade()
    }

    /// Shared handle to this thread.
    #[must_use]
    pub fn shared(&self) -> Option<Arc<Thread>>
    {
        self.weak_self.upgrade()
    }

    // ---- registers ----------------------------------------------------------

    /// Snapshot of the register context.
    #[must_use]
    pub fn registers(&self) -> Registers
    {
        lock(&self.registers).clone()
    }

    /// Replace the register context.
    pub fn set_registers(&self, registers: Registers)
    {
        *lock(&self.registers) = registers;
    }

    /// Read one register.
    pub fn read_register(&self, id: RegisterId) -> WardenResult<u64>
    {
        lock(&self.registers)
            .get(id)
            .ok_or_else(|| WardenError::InvalidArgument(format!("no register {id:?} on thread {}", self.index_id)))
    }

    /// Write one register.
    pub fn write_register(&self, id: RegisterId, value: u64) -> WardenResult<()>
    {
        lock(&self.registers)
            .set(id, value)
            .ok_or_else(|| WardenError::InvalidArgument(format!("no register {id:?} on thread {}", self.index_id)))
    }

    /// Current program counter.
    #[must_use]
    pub fn pc(&self) -> Address
    {
        lock(&self.registers).pc
    }

    // ---- stop info ------------------------------------------------------------

    /// Record the raw reason the backend saw for the upcoming stop.
    pub fn set_stop_reason(&self, reason: StopReason)
    {
        *lock(&self.pending_reason) = Some(reason);
    }

    /// Forget the raw stop reason (the thread is about to run).
    pub fn clear_stop_reason(&self)
    {
        *lock(&self.pending_reason) = None;
    }

    /// Stop info for the current stop, resolved on first access.
    ///
    /// Returns `None` when the thread did not stop for a reason of its own.
    #[must_use]
    pub fn stop_info(&self) -> Option<Arc<StopInfo>>
    {
        let process = self.process()?;
        let ids = process.mod_id();
        let mut cached = lock(&self.stop_info);
        if let Some(info) = cached.as_ref() {
            if info.stop_id() == ids.stop_id {
                return Some(Arc::clone(info));
            }
        }
        let reason = lock(&self.pending_reason).clone()?;
        let info = Arc::new(StopInfo::new(reason, ids.stop_id, ids.resume_id));
        *cached = Some(Arc::clone(&info));
        Some(info)
    }

    /// Replace the stop info of the current stop.
    pub fn set_stop_info(&self, reason: StopReason)
    {
        let Some(process) = self.process() else {
            return;
        };
        let ids = process.mod_id();
        *lock(&self.pending_reason) = Some(reason.clone());
        *lock(&self.stop_info) = Some(Arc::new(StopInfo::new(reason, ids.stop_id, ids.resume_id)));
    }

    /// Reason of the current stop, [`StopReason::None`] when there is none.
    #[must_use]
    pub fn stop_reason(&self) -> StopReason
    {
        self.stop_info()
            .map_or(StopReason::None, |info| info.reason().clone())
    }

    /// Whether the thread stopped for a reason of its own.
    #[must_use]
    pub fn stopped_for_a_reason(&self) -> bool
    {
        self.stop_info()
            .is_some_and(|info| *info.reason() != StopReason::None)
    }

    // ---- resume state ----------------------------------------------------------

    /// How the thread takes part in the next resume.
    #[must_use]
    pub fn resume_state(&self) -> ResumeState
    {
        *lock(&self.resume_state)
    }

    /// Prepare for a resume with `state`.
    pub fn will_resume(&self, state: ResumeState)
    {
        *lock(&self.resume_state) = state;
        self.clear_stop_reason();
        *lock(&self.frames) = None;
        let current = {
            let mut plans = lock(&self.plans);
            plans.completed.clear();
            plans.discarded.clear();
            plans.active.last().cloned()
        };
        if let Some(plan) = current {
            plan.will_resume(self);
        }
    }

    /// The process resumed.
    pub fn did_resume(&self)
    {
        trace!(thread = self.index_id, state = ?self.resume_state(), "thread resumed");
    }

    // ---- plan stack ------------------------------------------------------------

    /// Push `plan`, optionally discarding every non-base plan first.
    pub fn queue_thread_plan(&self, plan: Arc<dyn ThreadPlan>, abort_other_plans: bool)
    {
        if abort_other_plans {
            self.discard_thread_plans(false);
        }
        debug!(thread = self.index_id, plan = %plan.description(), "pushing thread plan");
        lock(&self.plans).active.push(Arc::clone(&plan));
        plan.did_push(self);
    }

    /// Top of the active plan stack.
    #[must_use]
    pub fn current_plan(&self) -> Arc<dyn ThreadPlan>
    {
        let plans = lock(&self.plans);
        match plans.active.last() {
            Some(plan) => Arc::clone(plan),
            None => Arc::new(BasePlan::new()),
        }
    }

    /// Most recently completed plan of this stop.
    #[must_use]
    pub fn completed_plan(&self) -> Option<Arc<dyn ThreadPlan>>
    {
        lock(&self.plans).completed.last().cloned()
    }

    /// Whether `plan` completed during the current stop.
    #[must_use]
    pub fn is_thread_plan_done(&self, plan: &Arc<dyn ThreadPlan>) -> bool
    {
        lock(&self.plans).completed.iter().any(|done| same_plan(done, plan))
    }

    /// Whether `plan` was discarded during the current stop.
    #[must_use]
    pub fn was_thread_plan_discarded(&self, plan: &Arc<dyn ThreadPlan>) -> bool
    {
        lock(&self.plans).discarded.iter().any(|gone| same_plan(gone, plan))
    }

    /// Whether `plan` is still on the active stack.
    #[must_use]
    pub fn is_plan_active(&self, plan: &Arc<dyn ThreadPlan>) -> bool
    {
        lock(&self.plans).active.iter().any(|active| same_plan(active, plan))
    }

    /// Discard plans from the top down to and including `plan`.
    ///
    /// Does nothing when `plan` is not on the stack.
    pub fn discard_thread_plans_up_to_plan(&self, plan: &Arc<dyn ThreadPlan>)
    {
        let popped = {
            let mut plans = lock(&self.plans);
            let Some(position) = plans.active.iter().position(|active| same_plan(active, plan)) else {
                return;
            };
            let position = position.max(1);
            let popped: Vec<_> = plans.active.drain(position..).rev().collect();
            plans.discarded.extend(popped.iter().cloned());
            popped
        };
        for plan in popped {
            debug!(thread = self.index_id, plan = %plan.description(), "discarding thread plan");
            plan.will_pop(self);
        }
    }

    /// Discard every plan above the base plan. With `force`, the base plan is
    /// replaced by a fresh one as well.
    pub fn discard_thread_plans(&self, force: bool)
    {
        let popped = {
            let mut plans = lock(&self.plans);
            let keep = usize::from(!force).min(plans.active.len());
            let popped: Vec<_> = plans.active.drain(keep..).rev().collect();
            plans.discarded.extend(popped.iter().cloned());
            if plans.active.is_empty() {
                plans.active.push(Arc::new(BasePlan::new()));
            }
            popped
        };
        for plan in popped {
            plan.will_pop(self);
        }
    }

    /// Number of plans on the active stack, the base plan included.
    #[must_use]
    pub fn plan_depth(&self) -> usize
    {
        lock(&self.plans).active.len()
    }

    fn complete_plan(&self, plan: &Arc<dyn ThreadPlan>)
    {
        let (above, found) = {
            let mut plans = lock(&self.plans);
            let Some(position) = plans.active.iter().position(|active| same_plan(active, plan)) else {
                return;
            };
            let above: Vec<_> = plans.active.drain(position + 1..).rev().collect();
            plans.discarded.extend(above.iter().cloned());
            let found = if position == 0 {
                None
            } else {
                plans.active.pop()
            };
            if let Some(found) = &found {
                plans.completed.push(Arc::clone(found));
            }
            (above, found)
        };
        for plan in above {
            plan.will_pop(self);
        }
        if let Some(plan) = found {
            debug!(thread = self.index_id, plan = %plan.description(), "thread plan completed");
            plan.will_pop(self);
            if !plan.is_private() {
                self.set_stop_info(StopReason::PlanComplete(plan.description()));
            }
        }
    }

    // ---- stop votes ------------------------------------------------------------

    /// Walk the plan stack and decide whether this thread wants to stop.
    pub fn should_stop(&self) -> bool
    {
        if self.resume_state() == ResumeState::Suspended {
            return false;
        }
        let Some(stop_info) = self.stop_info() else {
            return false;
        };
        let active = lock(&self.plans).active.clone();
        for plan in active.iter().rev() {
            if !plan.explains_stop(self, &stop_info) {
                continue;
            }
            let should_stop = plan.should_stop(self, &stop_info);
            if plan.is_done() {
                self.complete_plan(plan);
            }
            trace!(thread = self.index_id, plan = %plan.description(), should_stop, "plan explained stop");
            return should_stop;
        }
        false
    }

    /// Vote on surfacing a stop this thread does not want.
    #[must_use]
    pub fn should_report_stop(&self) -> Vote
    {
        if self.resume_state() == ResumeState::Suspended {
            return Vote::NoOpinion;
        }
        match self.completed_plan() {
            Some(plan) => plan.should_report_stop(self),
            None => self.current_plan().should_report_stop(self),
        }
    }

    /// Vote on surfacing a resume.
    #[must_use]
    pub fn should_report_run(&self) -> Vote
    {
        if self.resume_state() == ResumeState::Suspended {
            return Vote::NoOpinion;
        }
        self.current_plan().should_report_run(self)
    }

    // ---- frames ----------------------------------------------------------------

    /// Install a backend-unwound frame list.
    pub fn set_frames(&self, frames: Vec<StackFrame>)
    {
        *lock(&self.frames) = Some(frames);
    }

    /// Frames of the current stop, innermost first.
    ///
    /// Without an unwound list the thread has a single frame built from its
    /// pc and stack pointer.
    #[must_use]
    pub fn frames(&self) -> Vec<StackFrame>
    {
        if let Some(frames) = lock(&self.frames).as_ref() {
            return frames.clone();
        }
        let registers = lock(&self.registers);
        vec![StackFrame {
            index: 0,
            id: StackId::new(registers.pc, registers.sp),
        }]
    }

    /// Frame the client is looking at.
    #[must_use]
    pub fn selected_frame(&self) -> Option<StackFrame>
    {
        let index = *lock(&self.selected_frame);
        let frames = self.frames();
        frames.get(index).or_else(|| frames.first()).copied()
    }

    /// Select the frame at `index`.
    pub fn set_selected_frame_index(&self, index: usize) -> bool
    {
        if index >= self.frames().len() {
            return false;
        }
        *lock(&self.selected_frame) = index;
        true
    }

    /// Select the frame whose id is `id`. Returns whether it was found.
    pub fn set_selected_frame_by_id(&self, id: StackId) -> bool
    {
        match self.frames().iter().position(|frame| frame.id == id) {
            Some(index) => {
                *lock(&self.selected_frame) = index;
                true
            }
            None => false,
        }
    }
}

impl fmt::Debug for Thread
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        f.debug_struct("Thread")
            .field("index_id", &self.index_id)
            .field("tid", &self.tid)
            .field("resume_state", &self.resume_state())
            .finish_non_exhaustive()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T>
{
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
