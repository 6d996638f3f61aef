//! # Process
//!
//! One inferior being debugged, and the state machine that drives it.
//!
//! ## Private and public state
//!
//! Two copies of the run state are kept. The *private* state is the ground
//! truth: backends update it synchronously through
//! [`Process::set_private_state`], and every genuine change is broadcast on
//! the private broadcaster. The *public* state is what clients observe; it
//! only moves when the private-state task decides a private event should be
//! forwarded (see [`Process::handle_private_event`]).
//!
//! This lets the core resume and stop the inferior transparently (stepping
//! over a breakpoint with an ignore count, running an expression) without
//! clients ever seeing the intermediate states.
//!
//! ## Modification ids
//!
//! [`ProcessModId`] carries the stop id (bumped on every transition into a
//! stopped kind), the memory id (bumped on every successful write), and the
//! resume id. Caches compare these to decide whether they are stale.
//!
//! ## Threads of control
//!
//! - client threads issue commands and block on listener waits
//! - one private-state task per process consumes private events
//!   ([`private_state`])
//! - backends may report state changes from their own threads

mod backend;
mod breakpoints;
mod event_data;
mod memory;
mod next_event;
mod private_state;
mod run_plan;
mod signals;
mod stdio;

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Instant;

use tracing::{debug, info, trace, warn};

pub use backend::{LaunchInfo, ProcessBackend};
pub use event_data::ProcessEventData;
pub use next_event::{AttachCompletionHandler, EventActionResult, NextEventAction};
pub use private_state::ControlMessage;
pub use run_plan::{ExecutionContext, ExecutionResults, RunPlanOptions, RunPlanOutcome};
pub use signals::{UnixSignal, UnixSignals};

use self::private_state::PrivateStateTask;
use self::stdio::StdioBuffers;
use crate::breakpoints::{BreakpointSiteList, Watchpoint};
use crate::error::{WardenError, WardenResult};
use crate::events::{Broadcaster, Event, EventData, EventMask, Listener};
use crate::expression::{Abi, SysVAbi};
use crate::memory::{AllocatedMemoryCache, MemoryCache};
use crate::module::DynamicLoader;
use crate::settings::ProcessSettings;
use crate::target::Target;
use crate::thread::{Thread, ThreadList, Vote};
use crate::types::{Address, Architecture, ByteOrder, ProcessId, Registers, StateType, ThreadId};

/// Modification counters of a process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ProcessModId
{
    /// Bumped on every transition into a stopped kind
    pub stop_id: u32,
    /// Bumped on every successful memory write
    pub memory_id: u32,
    /// Bumped on every resume
    pub resume_id: u32,
    /// Nesting depth of `run_thread_plan` calls in flight
    pub running_user_expression: u32,
}

/// Callback invoked when notifications are registered.
pub type InitializeCallback = Arc<dyn Fn(&Process) + Send + Sync>;

/// Callback invoked when a stop is surfaced to clients.
pub type StateChangedCallback = Arc<dyn Fn(&Process, StateType) + Send + Sync>;

/// Set of state-change callbacks registered with
/// [`Process::register_notification_callbacks`]
#[derive(Clone, Default)]
pub struct Notifications
{
    /// Called once, right away, on registration
    pub initialize: Option<InitializeCallback>,
    /// Called synchronously whenever a stop is broadcast
    pub process_state_changed: Option<StateChangedCallback>,
}

impl fmt::Debug for Notifications
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        f.debug_struct("Notifications")
            .field("initialize", &self.initialize.is_some())
            .field("process_state_changed", &self.process_state_changed.is_some())
            .finish()
    }
}

/// Handle returned when registering [`Notifications`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NotificationId(u32);

#[derive(Debug, Default)]
struct PrivateData
{
    state: StateType,
    mod_id: ProcessModId,
}

#[derive(Debug, Default)]
struct ExitStatus
{
    status: Option<i32>,
    description: String,
}

/// One inferior being debugged
///
/// Created by [`Target::create_process`] and always handled through an
/// `Arc`. Dropping the last handle finalizes the process: a live inferior is
/// destroyed and the private-state task is stopped.
pub struct Process
{
    weak_self: Weak<Process>,
    target: Weak<Target>,
    backend: Box<dyn ProcessBackend>,
    settings: ProcessSettings,
    architecture: Architecture,
    pid: Mutex<Option<ProcessId>>,
    public_state: Mutex<StateType>,
    private: Mutex<PrivateData>,
    exit: Mutex<ExitStatus>,
    site_list: BreakpointSiteList,
    threads: ThreadList,
    next_thread_index: AtomicU32,
    memory_cache: MemoryCache,
    allocated_memory: AllocatedMemoryCache,
    broadcaster: Broadcaster,
    private_broadcaster: Broadcaster,
    private_task: Mutex<Option<PrivateStateTask>>,
    next_event_action: Mutex<Option<Box<dyn NextEventAction>>>,
    notifications: Mutex<Vec<(NotificationId, Notifications)>>,
    next_notification_id: AtomicU32,
    stdio: StdioBuffers,
    image_tokens: Mutex<Vec<Address>>,
    halt_requested: AtomicBool,
    input_reader_active: AtomicBool,
    unix_signals: UnixSignals,
    dynamic_loader: Mutex<Option<Arc<dyn DynamicLoader>>>,
}

impl Process
{
    /// Create a process driven by `backend`.
    ///
    /// Prefer [`Target::create_process`], which also registers the process
    /// with its target.
    #[must_use]
    pub fn new(target: Weak<Target>, backend: Box<dyn ProcessBackend>, settings: ProcessSettings) -> Arc<Self>
    {
        let architecture = backend.architecture();
        debug!(plugin = backend.plugin_name(), %architecture, "creating process");
        Arc::new_cyclic(|weak_self| Self {
            weak_self: weak_self.clone(),
            target,
            memory_cache: MemoryCache::new(settings.memory_cache_line_size),
            allocated_memory: AllocatedMemoryCache::new(settings.allocation_block_size),
            backend,
            settings,
            architecture,
            pid: Mutex::new(None),
            public_state: Mutex::new(StateType::Unloaded),
            private: Mutex::new(PrivateData::default()),
            exit: Mutex::new(ExitStatus::default()),
            site_list: BreakpointSiteList::new(),
            threads: ThreadList::new(),
            next_thread_index: AtomicU32::new(1),
            broadcaster: Broadcaster::new("warden.process"),
            private_broadcaster: Broadcaster::new("warden.process.private"),
            private_task: Mutex::new(None),
            next_event_action: Mutex::new(None),
            notifications: Mutex::new(Vec::new()),
            next_notification_id: AtomicU32::new(1),
            stdio: StdioBuffers::default(),
            image_tokens: Mutex::new(Vec::new()),
            halt_requested: AtomicBool::new(false),
            input_reader_active: AtomicBool::new(false),
            unix_signals: UnixSignals::new(),
            dynamic_loader: Mutex::new(None),
        })
    }

    // ---- identity --------------------------------------------------------------

    /// Process id, once launched or attached.
    #[must_use]
    pub fn pid(&self) -> Option<ProcessId>
    {
        *lock(&self.pid)
    }

    /// Record the process id reported by the backend.
    pub fn set_pid(&self, pid: ProcessId)
    {
        *lock(&self.pid) = Some(pid);
    }

    fn clear_pid(&self)
    {
        *lock(&self.pid) = None;
    }

    pub(crate) fn pid_string(&self) -> String
    {
        self.pid().map_or_else(|| "none".to_string(), |pid| pid.to_string())
    }

    pub(crate) fn weak_self(&self) -> Weak<Process>
    {
        self.weak_self.clone()
    }

    /// The owning target, if it is still alive.
    #[must_use]
    pub fn target(&self) -> Option<Arc<Target>>
    {
        self.target.upgrade()
    }

    /// Settings this process was created with.
    #[must_use]
    pub const fn settings(&self) -> &ProcessSettings
    {
        &self.settings
    }

    /// Architecture reported by the backend.
    #[must_use]
    pub const fn architecture(&self) -> Architecture
    {
        self.architecture
    }

    /// Byte order of the inferior.
    #[must_use]
    pub const fn byte_order(&self) -> ByteOrder
    {
        self.architecture.byte_order()
    }

    /// Pointer size of the inferior.
    #[must_use]
    pub const fn address_byte_size(&self) -> usize
    {
        self.architecture.address_byte_size()
    }

    /// Calling convention used for function calls into the inferior.
    #[must_use]
    pub fn abi(&self) -> Option<Arc<dyn Abi>>
    {
        match self.architecture {
            Architecture::X86_64 => Some(Arc::new(SysVAbi)),
            _ => None,
        }
    }

    /// Public broadcaster clients subscribe to.
    #[must_use]
    pub const fn broadcaster(&self) -> &Broadcaster
    {
        &self.broadcaster
    }

    pub(crate) const fn private_broadcaster(&self) -> &Broadcaster
    {
        &self.private_broadcaster
    }

    /// Breakpoint sites planted in this process.
    #[must_use]
    pub const fn breakpoint_site_list(&self) -> &BreakpointSiteList
    {
        &self.site_list
    }

    /// Threads of this process.
    #[must_use]
    pub const fn thread_list(&self) -> &ThreadList
    {
        &self.threads
    }

    /// Signal handling table.
    #[must_use]
    pub const fn unix_signals(&self) -> &UnixSignals
    {
        &self.unix_signals
    }

    /// Build a thread with the next free index id. The backend adds it to
    /// the thread list.
    #[must_use]
    pub fn create_thread(&self, tid: ThreadId, registers: Registers) -> Arc<Thread>
    {
        let index_id = self.next_thread_index.fetch_add(1, Ordering::SeqCst);
        Thread::new(self.weak_self(), index_id, tid, registers)
    }

    // ---- state -----------------------------------------------------------------

    /// State as seen by clients.
    #[must_use]
    pub fn public_state(&self) -> StateType
    {
        *lock(&self.public_state)
    }

    /// Ground-truth state.
    #[must_use]
    pub fn private_state(&self) -> StateType
    {
        lock(&self.private).state
    }

    /// Whether the inferior is live.
    #[must_use]
    pub fn is_alive(&self) -> bool
    {
        self.private_state().is_alive()
    }

    pub(crate) fn set_public_state(&self, state: StateType)
    {
        let mut public = lock(&self.public_state);
        if *public != state {
            trace!(pid = %self.pid_string(), from = %*public, to = %state, "public state");
            *public = state;
        }
    }

    /// Record a new ground-truth state and announce it privately.
    ///
    /// Setting the current state again is a no-op. Entering a stopped kind
    /// bumps the stop id and drops the memory cache.
    pub fn set_private_state(&self, state: StateType)
    {
        let mut private = lock(&self.private);
        if private.state == state {
            trace!(pid = %self.pid_string(), %state, "private state unchanged, not broadcasting");
            return;
        }
        let old = private.state;
        private.state = state;
        if state.is_stopped() {
            private.mod_id.stop_id = private.mod_id.stop_id.wrapping_add(1);
            self.memory_cache.clear();
        }
        debug!(
            pid = %self.pid_string(),
            from = %old,
            to = %state,
            stop_id = private.mod_id.stop_id,
            "private state changed"
        );
        let data = Arc::new(ProcessEventData::new(self.weak_self(), state));
        // Broadcast under the lock so private events are queued in state order.
        self.private_broadcaster
            .broadcast(Event::new(EventMask::STATE_CHANGED, EventData::Process(data)));
    }

    /// Current modification ids.
    #[must_use]
    pub fn mod_id(&self) -> ProcessModId
    {
        lock(&self.private).mod_id
    }

    /// Current stop id.
    #[must_use]
    pub fn stop_id(&self) -> u32
    {
        self.mod_id().stop_id
    }

    fn bump_memory_id(&self)
    {
        let mut private = lock(&self.private);
        private.mod_id.memory_id = private.mod_id.memory_id.wrapping_add(1);
    }

    fn bump_resume_id(&self)
    {
        let mut private = lock(&self.private);
        private.mod_id.resume_id = private.mod_id.resume_id.wrapping_add(1);
    }

    /// Whether a `run_thread_plan` call is in flight.
    #[must_use]
    pub fn is_running_user_expression(&self) -> bool
    {
        self.mod_id().running_user_expression > 0
    }

    fn set_running_user_expression(&self, running: bool)
    {
        let mut private = lock(&self.private);
        let depth = &mut private.mod_id.running_user_expression;
        *depth = if running {
            depth.saturating_add(1)
        } else {
            depth.saturating_sub(1)
        };
    }

    // ---- event pipeline ----------------------------------------------------------

    /// Install the handler that sees the next private event first.
    ///
    /// A handler already installed is told it is being interrupted.
    pub fn set_next_event_action(&self, action: Option<Box<dyn NextEventAction>>)
    {
        let previous = std::mem::replace(&mut *lock(&self.next_event_action), action);
        if let Some(mut previous) = previous {
            previous.handle_being_interrupted();
        }
    }

    /// Run one private event through the pipeline.
    ///
    /// The pending [`NextEventAction`] looks at the event first. If the event
    /// is to be surfaced, the public state is updated and the event is armed
    /// for its removal hook and broadcast publicly.
    pub fn handle_private_event(&self, event: &Event)
    {
        let new_state = ProcessEventData::state_from_event(event);

        let action = lock(&self.next_event_action).take();
        if let Some(mut action) = action {
            match action.perform_action(self, event) {
                EventActionResult::Success => {}
                EventActionResult::Retry => {
                    let mut slot = lock(&self.next_event_action);
                    if slot.is_none() {
                        *slot = Some(action);
                    }
                }
                EventActionResult::Exit => {
                    if new_state != StateType::Exited {
                        let description = action.exit_string();
                        self.set_exit_status(0, &description);
                        return;
                    }
                }
            }
        }

        if self.should_broadcast_event(event) {
            debug!(pid = %self.pid_string(), state = %new_state, "broadcasting state change");
            if let Some(data) = event.process_data() {
                data.set_update_state_on_removal();
            }
            self.set_public_state(new_state);
            if new_state.is_running() {
                self.push_input_reader();
            } else {
                self.pop_input_reader();
            }
            self.broadcaster.broadcast(event.clone());
        } else {
            debug!(pid = %self.pid_string(), state = %new_state, "hiding state change");
        }
    }

    /// Decide whether a private event reaches clients.
    ///
    /// Stops that no thread wants to stop for are resumed past right here,
    /// unless a halt is pending: then the stop is surfaced as interrupted.
    pub fn should_broadcast_event(&self, event: &Event) -> bool
    {
        let Some(data) = event.process_data() else {
            return false;
        };
        let state = data.state();
        match state {
            StateType::Connected
            | StateType::Attaching
            | StateType::Launching
            | StateType::Detached
            | StateType::Exited
            | StateType::Unloaded => true,
            StateType::Invalid => false,
            StateType::Running | StateType::Stepping => {
                if self.public_state().is_running() {
                    return false;
                }
                self.threads.should_report_run() != Vote::No
            }
            StateType::Stopped | StateType::Crashed | StateType::Suspended => {
                if data.interrupted() {
                    return true;
                }
                self.refresh_state_after_stop();
                if self.threads.should_stop() {
                    self.notify_state_changed(state);
                    return true;
                }
                if self.halt_requested.load(Ordering::SeqCst) {
                    debug!(pid = %self.pid_string(), "halt pending, surfacing stop instead of resuming");
                    data.set_interrupted(true);
                    return true;
                }
                let report = self.threads.should_report_stop() == Vote::Yes;
                if report {
                    data.set_restarted(true);
                }
                debug!(pid = %self.pid_string(), report, "no thread wants to stop, resuming");
                match self.resume() {
                    Ok(()) => report,
                    Err(error) => {
                        warn!(pid = %self.pid_string(), %error, "automatic resume failed, surfacing stop");
                        true
                    }
                }
            }
        }
    }

    fn refresh_state_after_stop(&self)
    {
        if let Err(error) = self.backend.update_thread_list(self, &self.threads) {
            warn!(pid = %self.pid_string(), %error, "failed to update thread list");
        }
        self.backend.refresh_state_after_stop(self);
        self.threads.set_stop_id(self.stop_id());
    }

    // ---- private-state task ------------------------------------------------------

    /// Start the private-state task if it is not running yet.
    pub fn start_private_state_task(&self) -> WardenResult<()>
    {
        let mut task = lock(&self.private_task);
        if task.as_ref().is_some_and(PrivateStateTask::is_alive) {
            return Ok(());
        }
        *task = Some(PrivateStateTask::spawn(self)?);
        Ok(())
    }

    /// Make the private-state task service only control messages.
    pub fn pause_private_state_task(&self) -> WardenResult<()>
    {
        self.control_private_state_task(ControlMessage::Pause)
    }

    /// Let a paused private-state task consume events again.
    pub fn resume_private_state_task(&self) -> WardenResult<()>
    {
        self.control_private_state_task(ControlMessage::Resume)
    }

    /// Stop the private-state task. Events already queued are handled first.
    pub fn stop_private_state_task(&self)
    {
        let task = lock(&self.private_task).take();
        if let Some(mut task) = task {
            if let Err(error) = task.control(ControlMessage::Stop, self.settings.control_ack_timeout) {
                warn!(pid = %self.pid_string(), %error, "private-state task did not stop in time");
            }
        }
        self.private_broadcaster.clear_channel();
    }

    fn control_private_state_task(&self, message: ControlMessage) -> WardenResult<()>
    {
        let mut task = lock(&self.private_task);
        match task.as_mut() {
            Some(task) if task.is_alive() => task.control(message, self.settings.control_ack_timeout),
            _ => Ok(()),
        }
    }

    fn is_private_state_thread(&self) -> bool
    {
        lock(&self.private_task)
            .as_ref()
            .is_some_and(PrivateStateTask::is_current_thread)
    }

    fn start_or_resume_private_state_task(&self) -> WardenResult<()>
    {
        let alive = lock(&self.private_task)
            .as_ref()
            .is_some_and(PrivateStateTask::is_alive);
        if alive {
            self.resume_private_state_task()
        } else {
            self.start_private_state_task()
        }
    }

    // ---- lifecycle ---------------------------------------------------------------

    /// Launch the inferior and wait for its initial stop.
    ///
    /// ## Errors
    ///
    /// Backend launch failures are returned as is (the process is marked
    /// exited with status `-1` when a pid had been assigned). Missing the
    /// initial stop destroys the process and returns a timeout.
    pub fn launch(&self, mut info: LaunchInfo) -> WardenResult<ProcessId>
    {
        if info.executable.is_none() {
            info.executable = self.target().and_then(|target| target.executable_path());
        }
        self.pause_private_state_task()?;

        let listener = Listener::new("warden.process.launch-listener");
        self.private_broadcaster.hijack(&listener, EventMask::STATE_CHANGED);
        self.set_public_state(StateType::Launching);

        let pid = match self.backend.do_launch(self, &info) {
            Ok(pid) => pid,
            Err(error) => {
                self.private_broadcaster.restore();
                if self.pid().is_some() {
                    self.clear_pid();
                    self.set_exit_status(-1, &error.to_string());
                }
                warn!(%error, "launch failed");
                return Err(error);
            }
        };
        self.set_pid(pid);
        info!(%pid, executable = ?info.executable, "launched process");

        let deadline = Instant::now() + self.settings.launch_stop_timeout;
        let event = loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let Some(event) = listener.wait_for_event(Some(remaining)) else {
                break None;
            };
            let state = ProcessEventData::state_from_event(&event);
            if state.is_stopped() || state.is_terminal() {
                break Some(event);
            }
            trace!(%state, "skipping event while waiting for launch stop");
        };
        self.private_broadcaster.restore();

        let state = event
            .as_ref()
            .map_or(StateType::Invalid, ProcessEventData::state_from_event);
        match (event, state) {
            (Some(event), StateType::Stopped | StateType::Crashed | StateType::Suspended) => {
                self.backend.did_launch(self);
                if let Some(loader) = self.dynamic_loader() {
                    loader.did_launch(self);
                }
                self.handle_private_event(&event);
                self.start_or_resume_private_state_task()?;
                Ok(pid)
            }
            (Some(event), StateType::Exited | StateType::Detached) => {
                self.handle_private_event(&event);
                self.start_or_resume_private_state_task()?;
                Ok(pid)
            }
            _ => {
                self.set_exit_status(0, "failed to catch stop after launch");
                if let Err(error) = self.destroy() {
                    warn!(%error, "destroy after failed launch failed");
                }
                Err(WardenError::Timeout("failed to catch stop after launch".to_string()))
            }
        }
    }

    /// Attach to `pid`. The attach completes asynchronously on the first stop.
    pub fn attach(&self, pid: ProcessId) -> WardenResult<()>
    {
        self.set_pid(pid);
        self.set_public_state(StateType::Attaching);
        self.set_next_event_action(Some(Box::new(AttachCompletionHandler::new(0))));
        self.start_private_state_task()?;
        if let Err(error) = self.backend.do_attach(self, pid) {
            self.set_next_event_action(None);
            self.set_exit_status(-1, &error.to_string());
            return Err(error);
        }
        info!(%pid, "attaching");
        Ok(())
    }

    /// Finish an attach: backend and dynamic-loader hooks, then pick the
    /// executable module.
    pub(crate) fn complete_attach(&self)
    {
        self.backend.did_attach(self);
        if let Some(loader) = self.dynamic_loader() {
            loader.did_attach(self);
        }
        if let Some(target) = self.target() {
            target.select_executable_from_images();
        }
        info!(pid = %self.pid_string(), "attach complete");
    }

    fn dynamic_loader(&self) -> Option<Arc<dyn DynamicLoader>>
    {
        let mut slot = lock(&self.dynamic_loader);
        if slot.is_none() {
            *slot = self.target().and_then(|target| target.find_dynamic_loader(self));
        }
        slot.clone()
    }

    /// Resume the inferior.
    ///
    /// ## Errors
    ///
    /// Refused unless the private state is a stopped kind; backend refusals
    /// are propagated.
    pub fn resume(&self) -> WardenResult<()>
    {
        let state = self.private_state();
        if !state.is_stopped() {
            return Err(WardenError::invalid_state("resume", state));
        }
        self.backend.will_resume(self)?;
        self.threads.will_resume();
        self.bump_resume_id();
        self.backend
            .do_resume(self)
            .map_err(|error| WardenError::ResumeFailed(error.to_string()))?;
        self.backend.did_resume(self);
        self.threads.did_resume();
        trace!(pid = %self.pid_string(), resume_id = self.mod_id().resume_id, "resumed");
        Ok(())
    }

    /// Interrupt the inferior and wait for the stop it causes.
    ///
    /// A stop that arrives for another reason while the halt is in flight
    /// is accepted as the halt's stop. Halting an attach in progress cancels
    /// it and destroys the process.
    ///
    /// ## Errors
    ///
    /// `"Halt timed out."` when no event arrives in time, `"Did not get
    /// stopped event after halt."` when the next event is not a stop.
    pub fn halt(&self) -> WardenResult<()>
    {
        let listener = Listener::new("warden.process.halt-listener");
        self.private_broadcaster.hijack(&listener, EventMask::STATE_CHANGED);
        self.halt_requested.store(true, Ordering::SeqCst);

        let attaching = self.public_state() == StateType::Attaching;
        let mut caught = Vec::new();
        let result = match self.backend.do_halt(self) {
            Err(error) => Err(error),
            Ok(_) if attaching => Ok(()),
            Ok(false) => Ok(()),
            Ok(true) => match listener.wait_for_event(Some(self.settings.halt_timeout)) {
                None => Err(WardenError::HaltFailed("Halt timed out.".to_string())),
                Some(event) => {
                    let outcome = if ProcessEventData::state_from_event(&event).is_stopped() {
                        if let Some(data) = event.process_data() {
                            data.set_interrupted(true);
                        }
                        Ok(())
                    } else {
                        Err(WardenError::HaltFailed("Did not get stopped event after halt.".to_string()))
                    };
                    caught.push(event);
                    outcome
                }
            },
        };
        while let Some(event) = listener.try_next_event() {
            caught.push(event);
        }
        self.private_broadcaster.restore();
        self.halt_requested.store(false, Ordering::SeqCst);
        for event in caught {
            self.private_broadcaster.broadcast(event);
        }

        if attaching && result.is_ok() {
            debug!(pid = %self.pid_string(), "halt cancels attach");
            self.set_exit_status(libc::SIGKILL, "Cancelled async attach.");
            return self.destroy();
        }
        if let Err(error) = &result {
            warn!(pid = %self.pid_string(), %error, "halt failed");
        }
        result
    }

    /// Detach, leaving the inferior running.
    pub fn detach(&self) -> WardenResult<()>
    {
        self.disable_all_breakpoint_sites();
        self.backend.do_detach(self)?;
        if !self.private_state().is_terminal() {
            self.set_private_state(StateType::Detached);
        }
        self.tear_down();
        info!(pid = %self.pid_string(), "detached");
        Ok(())
    }

    /// Kill the inferior.
    pub fn destroy(&self) -> WardenResult<()>
    {
        self.disable_all_breakpoint_sites();
        self.backend.do_destroy(self)?;
        if !self.private_state().is_terminal() {
            self.set_private_state(StateType::Exited);
        }
        self.tear_down();
        info!(pid = %self.pid_string(), "destroyed");
        Ok(())
    }

    fn tear_down(&self)
    {
        self.stop_private_state_task();
        let state = self.private_state();
        if self.public_state() != state {
            self.set_public_state(state);
        }
        self.release_allocated_memory();
        self.pop_input_reader();
    }

    /// Destroy a live inferior and release everything held in it.
    pub fn finalize(&self)
    {
        if self.private_state().is_alive() {
            if let Err(error) = self.destroy() {
                warn!(pid = %self.pid_string(), %error, "destroy during finalize failed");
            }
        }
        self.stop_private_state_task();
        self.set_next_event_action(None);
    }

    /// Send `signo` to the inferior.
    pub fn signal(&self, signo: i32) -> WardenResult<()>
    {
        if !self.is_alive() {
            return Err(WardenError::NotAttached);
        }
        self.backend.do_signal(self, signo)
    }

    /// Record the exit status and move to [`StateType::Exited`].
    ///
    /// Returns `false`, changing nothing, when the process already exited.
    pub fn set_exit_status(&self, status: i32, description: &str) -> bool
    {
        if self.private_state() == StateType::Exited {
            debug!(pid = %self.pid_string(), status, "ignoring exit status, already exited");
            return false;
        }
        {
            let mut exit = lock(&self.exit);
            exit.status = Some(status);
            exit.description = description.to_string();
        }
        info!(pid = %self.pid_string(), status, description, "process exited");
        self.set_private_state(StateType::Exited);
        true
    }

    /// Exit status, once exited.
    #[must_use]
    pub fn exit_status(&self) -> Option<i32>
    {
        lock(&self.exit).status
    }

    /// Exit description, empty when none was given.
    #[must_use]
    pub fn exit_description(&self) -> String
    {
        lock(&self.exit).description.clone()
    }

    /// Run the target's stop hooks.
    pub fn run_stop_hooks(&self)
    {
        if let Some(target) = self.target() {
            target.run_stop_hooks(self);
        }
    }

    // ---- notifications -----------------------------------------------------------

    /// Register state-change callbacks. `initialize` runs immediately.
    pub fn register_notification_callbacks(&self, callbacks: Notifications) -> NotificationId
    {
        if let Some(initialize) = &callbacks.initialize {
            initialize(self);
        }
        let id = NotificationId(self.next_notification_id.fetch_add(1, Ordering::SeqCst));
        lock(&self.notifications).push((id, callbacks));
        id
    }

    /// Remove callbacks. Returns whether `id` was registered.
    pub fn unregister_notification_callbacks(&self, id: NotificationId) -> bool
    {
        let mut notifications = lock(&self.notifications);
        let before = notifications.len();
        notifications.retain(|(existing, _)| *existing != id);
        before != notifications.len()
    }

    fn notify_state_changed(&self, state: StateType)
    {
        let callbacks: Vec<StateChangedCallback> = lock(&self.notifications)
            .iter()
            .filter_map(|(_, callbacks)| callbacks.process_state_changed.clone())
            .collect();
        for callback in callbacks {
            callback(self, state);
        }
    }

    // ---- image tokens ------------------------------------------------------------

    /// Remember the load token of an image. Returns its index.
    pub fn add_image_token(&self, token: Address) -> usize
    {
        let mut tokens = lock(&self.image_tokens);
        tokens.push(token);
        tokens.len() - 1
    }

    /// Token at `index`, [`Address::INVALID`] if unknown or reset.
    #[must_use]
    pub fn image_token(&self, index: usize) -> Address
    {
        lock(&self.image_tokens)
            .get(index)
            .copied()
            .unwrap_or(Address::INVALID)
    }

    /// Forget the token at `index`.
    pub fn reset_image_token(&self, index: usize)
    {
        if let Some(token) = lock(&self.image_tokens).get_mut(index) {
            *token = Address::INVALID;
        }
    }

    // ---- watchpoints -------------------------------------------------------------

    /// Arm `watchpoint` through the backend.
    pub fn enable_watchpoint(&self, watchpoint: &Watchpoint) -> WardenResult<()>
    {
        if watchpoint.is_enabled() {
            return Ok(());
        }
        self.backend.enable_watchpoint(self, watchpoint)?;
        watchpoint.set_enabled(true);
        debug!(watchpoint = %watchpoint.id(), address = %watchpoint.address(), "watchpoint enabled");
        Ok(())
    }

    /// Disarm `watchpoint` through the backend.
    pub fn disable_watchpoint(&self, watchpoint: &Watchpoint) -> WardenResult<()>
    {
        if !watchpoint.is_enabled() {
            return Ok(());
        }
        self.backend.disable_watchpoint(self, watchpoint)?;
        watchpoint.set_enabled(false);
        Ok(())
    }
}

impl Drop for Process
{
    fn drop(&mut self)
    {
        self.finalize();
    }
}

impl fmt::Debug for Process
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        f.debug_struct("Process")
            .field("pid", &self.pid())
            .field("plugin", &self.backend.plugin_name())
            .field("public_state", &self.public_state())
            .field("private_state", &self.private_state())
            .field("mod_id", &self.mod_id())
            .finish_non_exhaustive()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T>
{
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
