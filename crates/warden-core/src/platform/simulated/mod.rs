//! # Simulated Inferior
//!
//! A deterministic, in-process stand-in for a real debuggee. It implements
//! [`ProcessBackend`] on top of a sparse memory map and a script of what
//! happens on each resume, so the whole process core (state machine, event
//! pipeline, breakpoint shadowing, function calls) can be driven without an
//! operating system debug API.
//!
//! ## Resumes
//!
//! Every resume reports [`StateType::Running`] synchronously and then picks,
//! in order:
//!
//! 1. a pending function call: a running thread whose current plan is a
//!    call-function plan returns to its return address after the function's
//!    duration, with the result in the return register
//! 2. the next [`ScriptedStop`], delivered after its delay
//! 3. nothing: the inferior runs until halted
//!
//! A queued stop marked as racing the halt is skipped by resumes and
//! delivered by the next halt instead of `SIGSTOP`.
//!
//! Deliveries happen on short-lived timer threads and carry the resume
//! generation they were scheduled for. Halting, detaching, or destroying
//! bumps the generation, so a late delivery is dropped.
//!
//! ## Sharing
//!
//! `SimulatedInferior` is a cheap handle: clones share one inferior. Keep a
//! clone to script stops or inspect raw memory after handing the backend to
//! [`Target::create_process`](crate::target::Target::create_process).

mod memory;
mod script;

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

use tracing::{debug, trace, warn};

pub use memory::SimulatedMemory;
pub use script::{ScriptedStop, ScriptedStopKind, SimulatedFunction};

use crate::breakpoints::{BreakpointSite, Watchpoint, WatchpointId};
use crate::error::{WardenError, WardenResult};
use crate::expression::{Abi, SysVAbi};
use crate::memory::Permissions;
use crate::process::{LaunchInfo, Process, ProcessBackend};
use crate::thread::{ResumeState, StopReason, Thread, ThreadList, ThreadPlanKind};
use crate::types::registers::x86_64;
use crate::types::{Address, Architecture, ProcessId, RegisterId, Registers, StateType, ThreadId};

/// Pid reported unless [`SimulatedInferior::with_pid`] says otherwise
pub const DEFAULT_PID: u32 = 4242;
/// Entry point and initial pc of every thread
pub const DEFAULT_ENTRY: Address = Address::new(0x40_0000);
/// Lowest address of the mapped stack
pub const STACK_BASE: Address = Address::new(0x7fff_0000);
/// Size of the mapped stack
pub const STACK_SIZE: usize = 0x1_0000;

const HARDWARE_BREAKPOINT_SLOTS: usize = 4;
const WATCHPOINT_SLOTS: usize = 4;
const ALLOCATION_BASE: u64 = 0x7000_0000;
const PAGE_SIZE: u64 = 0x1000;

#[derive(Debug)]
struct Inferior
{
    memory: SimulatedMemory,
    threads: Vec<ThreadId>,
    entry: Address,
    functions: HashMap<Address, SimulatedFunction>,
    stops: VecDeque<ScriptedStop>,
    hardware_slots: [Option<Address>; HARDWARE_BREAKPOINT_SLOTS],
    watch_slots: [Option<(WatchpointId, Address, usize)>; WATCHPOINT_SLOTS],
    next_allocation: u64,
    allocations: HashMap<Address, usize>,
    running: bool,
    generation: u64,
    resume_count: u32,
    stdin: Vec<u8>,
}

/// What a resume leads to
#[derive(Debug)]
enum Delivery
{
    Return
    {
        thread: ThreadId,
        value: u64,
        return_address: Address,
    },
    Stop(ScriptedStop),
}

/// Scripted debuggee implementing [`ProcessBackend`]
#[derive(Debug, Clone)]
pub struct SimulatedInferior
{
    architecture: Architecture,
    pid: ProcessId,
    inner: Arc<Mutex<Inferior>>,
}

impl SimulatedInferior
{
    /// An x86-64 inferior with one thread (tid 1) and a mapped stack.
    #[must_use]
    pub fn new() -> Self
    {
        let mut memory = SimulatedMemory::new();
        memory.map(STACK_BASE, vec![0; STACK_SIZE], Permissions::READ_WRITE);
        Self {
            architecture: Architecture::X86_64,
            pid: ProcessId(DEFAULT_PID),
            inner: Arc::new(Mutex::new(Inferior {
                memory,
                threads: vec![ThreadId(1)],
                entry: DEFAULT_ENTRY,
                functions: HashMap::new(),
                stops: VecDeque::new(),
                hardware_slots: [None; HARDWARE_BREAKPOINT_SLOTS],
                watch_slots: [None; WATCHPOINT_SLOTS],
                next_allocation: ALLOCATION_BASE,
                allocations: HashMap::new(),
                running: false,
                generation: 0,
                resume_count: 0,
                stdin: Vec::new(),
            })),
        }
    }

    #[must_use]
    pub fn with_pid(mut self, pid: u32) -> Self
    {
        self.pid = ProcessId(pid);
        self
    }

    /// Add a thread that exists from launch on.
    #[must_use]
    pub fn with_thread(self, tid: ThreadId) -> Self
    {
        self.spawn_thread(tid);
        self
    }

    /// Initial pc of every thread.
    #[must_use]
    pub fn with_entry_point(self, entry: Address) -> Self
    {
        self.lock().entry = entry;
        self
    }

    /// Map executable code at `address`.
    #[must_use]
    pub fn with_code(self, address: Address, bytes: Vec<u8>) -> Self
    {
        self.map_memory(address, bytes, Permissions::READ | Permissions::EXECUTE);
        self
    }

    /// Map data at `address`.
    #[must_use]
    pub fn with_memory(self, address: Address, bytes: Vec<u8>, permissions: Permissions) -> Self
    {
        self.map_memory(address, bytes, permissions);
        self
    }

    /// Make `function` callable at `address`.
    #[must_use]
    pub fn with_function(self, address: Address, function: SimulatedFunction) -> Self
    {
        self.lock().functions.insert(address, function);
        self
    }

    /// Queue a stop for a later resume.
    #[must_use]
    pub fn with_stop(self, stop: ScriptedStop) -> Self
    {
        self.push_stop(stop);
        self
    }

    // ---- scripting handle ----------------------------------------------------------

    /// Queue a stop; each resume consumes at most one.
    pub fn push_stop(&self, stop: ScriptedStop)
    {
        self.lock().stops.push_back(stop);
    }

    /// Number of stops not yet delivered.
    #[must_use]
    pub fn pending_stops(&self) -> usize
    {
        self.lock().stops.len()
    }

    /// Create a thread. A live process picks it up on its next stop.
    pub fn spawn_thread(&self, tid: ThreadId)
    {
        let mut inner = self.lock();
        if !inner.threads.contains(&tid) {
            inner.threads.push(tid);
        }
    }

    pub fn map_memory(&self, address: Address, bytes: Vec<u8>, permissions: Permissions)
    {
        self.lock().memory.map(address, bytes, permissions);
    }

    /// Change the permissions of the region containing `address`.
    pub fn protect_memory(&self, address: Address, permissions: Permissions) -> bool
    {
        self.lock().memory.protect(address, permissions)
    }

    /// Bytes as the inferior holds them, trap opcodes included.
    pub fn raw_memory(&self, address: Address, size: usize) -> WardenResult<Vec<u8>>
    {
        let mut bytes = vec![0u8; size];
        let read = self.lock().memory.read(address, &mut bytes)?;
        bytes.truncate(read);
        Ok(bytes)
    }

    /// Hardware breakpoint slots currently armed.
    #[must_use]
    pub fn hardware_slots_in_use(&self) -> usize
    {
        self.lock().hardware_slots.iter().flatten().count()
    }

    /// Number of resumes seen so far.
    #[must_use]
    pub fn resume_count(&self) -> u32
    {
        self.lock().resume_count
    }

    /// Whether the inferior is executing.
    #[must_use]
    pub fn is_running(&self) -> bool
    {
        self.lock().running
    }

    /// Bytes written to the inferior's standard input.
    #[must_use]
    pub fn stdin(&self) -> Vec<u8>
    {
        self.lock().stdin.clone()
    }

    fn lock(&self) -> MutexGuard<'_, Inferior>
    {
        lock(&self.inner)
    }

    // ---- running -------------------------------------------------------------------

    fn populate_threads(&self, threads: &ThreadList, process: &Process)
    {
        let (tids, entry) = {
            let inner = self.lock();
            (inner.threads.clone(), inner.entry)
        };
        for tid in tids {
            if threads.find_thread_by_id(tid).is_some() {
                continue;
            }
            let mut registers = Registers::new(self.architecture);
            let stack_top = STACK_BASE + STACK_SIZE as u64;
            registers.pc = entry;
            registers.sp = stack_top;
            registers.fp = stack_top;
            threads.add(process.create_thread(tid, registers));
            trace!(tid = tid.raw(), "simulated thread created");
        }
    }

    /// Work out what the resume leads to, before any lock on the inferior
    /// is taken.
    fn plan_delivery(&self, process: &Process) -> WardenResult<Option<(Duration, Delivery)>>
    {
        let threads = process.thread_list().threads();
        let others_suspended = threads
            .iter()
            .any(|thread| thread.resume_state() == ResumeState::Suspended);
        for thread in &threads {
            if thread.resume_state() == ResumeState::Suspended {
                continue;
            }
            if let ThreadPlanKind::CallFunction { function, return_address } = thread.current_plan().kind() {
                return self.plan_call(thread, function, return_address, others_suspended);
            }
        }
        let mut inner = self.lock();
        if inner.stops.front().is_some_and(|stop| stop.racing_halt) {
            return Ok(None);
        }
        Ok(inner.stops.pop_front().map(|stop| (stop.delay, Delivery::Stop(stop))))
    }

    fn plan_call(
        &self,
        thread: &Thread,
        function: Address,
        return_address: Address,
        others_suspended: bool,
    ) -> WardenResult<Option<(Duration, Delivery)>>
    {
        let Some(callee) = self.lock().functions.get(&function).cloned() else {
            let stop = ScriptedStop::new(ScriptedStopKind::Exception(format!("no code at {function}"))).on_thread(thread.tid());
            return Ok(Some((Duration::ZERO, Delivery::Stop(stop))));
        };
        if callee.needs_all_threads() && others_suspended {
            debug!(%function, "callee waits on a suspended thread, it will not return");
            return Ok(None);
        }
        let args = SysVAbi.get_argument_values(thread, callee.arity())?;
        let value = callee.call(&args);
        trace!(%function, ?args, value, "simulated call scheduled");
        Ok(Some((
            callee.duration(),
            Delivery::Return {
                thread: thread.tid(),
                value,
                return_address,
            },
        )))
    }

    fn schedule(&self, process: &Process, generation: u64, delay: Duration, delivery: Delivery)
    {
        let inner = Arc::clone(&self.inner);
        let weak = process.weak_self();
        let spawned = thread::Builder::new()
            .name(format!("warden.simulated.delivery(gen={generation})"))
            .spawn(move || {
                if !delay.is_zero() {
                    thread::sleep(delay);
                }
                let Some(process) = weak.upgrade() else {
                    return;
                };
                deliver(&inner, &process, generation, delivery);
            });
        if let Err(error) = spawned {
            warn!(%error, "could not spawn simulated delivery thread");
        }
    }

    /// Stop running and invalidate pending deliveries. Returns whether the
    /// inferior was running.
    fn cancel(&self) -> bool
    {
        let mut inner = self.lock();
        inner.generation = inner.generation.wrapping_add(1);
        std::mem::replace(&mut inner.running, false)
    }
}

impl Default for SimulatedInferior
{
    fn default() -> Self
    {
        Self::new()
    }
}

fn deliver(inner: &Mutex<Inferior>, process: &Process, generation: u64, delivery: Delivery)
{
    let watch_slots = {
        let mut inner = lock(inner);
        if !inner.running || inner.generation != generation {
            trace!(generation, "dropping stale delivery");
            return;
        }
        inner.running = false;
        inner.watch_slots
    };

    let threads = process.thread_list();
    let thread_for = |tid: ThreadId| {
        threads
            .find_thread_by_id(tid)
            .or_else(|| threads.threads().into_iter().next())
    };

    match delivery {
        Delivery::Return {
            thread,
            value,
            return_address,
        } => {
            if let Some(thread) = thread_for(thread) {
                let mut registers = thread.registers();
                if registers.set(RegisterId::General(x86_64::RAX), value).is_none() {
                    warn!(thread = thread.index_id(), "no return register on simulated thread");
                }
                registers.pc = return_address;
                registers.sp = registers.sp + 8;
                thread.set_registers(registers);
                thread.set_stop_reason(StopReason::Trace);
            }
            process.set_private_state(StateType::Stopped);
        }
        Delivery::Stop(stop) => deliver_stop(process, &watch_slots, stop),
    }
}

fn deliver_stop(process: &Process, watch_slots: &[Option<(WatchpointId, Address, usize)>], stop: ScriptedStop)
{
    debug!(tid = stop.thread.raw(), kind = ?stop.kind, "delivering scripted stop");
    let threads = process.thread_list();
    let thread = threads
        .find_thread_by_id(stop.thread)
        .or_else(|| threads.threads().into_iter().next());
    let state = match stop.kind {
        ScriptedStopKind::Exit(status) => {
            process.set_exit_status(status, &format!("exited with status {status}"));
            return;
        }
        ScriptedStopKind::Breakpoint(address) => {
            let reason = process
                .breakpoint_site_list()
                .find_id_by_address(address)
                .map_or(StopReason::Signal(libc::SIGTRAP), StopReason::Breakpoint);
            if let Some(thread) = &thread {
                let mut registers = thread.registers();
                registers.pc = address;
                thread.set_registers(registers);
                thread.set_stop_reason(reason);
            }
            StateType::Stopped
        }
        ScriptedStopKind::Watchpoint(address) => {
            let reason = watch_slots
                .iter()
                .flatten()
                .find(|(_, start, size)| address >= *start && address < *start + *size as u64)
                .map_or(StopReason::Signal(libc::SIGTRAP), |(id, _, _)| StopReason::Watchpoint(*id));
            if let Some(thread) = &thread {
                thread.set_stop_reason(reason);
            }
            StateType::Stopped
        }
        ScriptedStopKind::Signal(signo) => {
            if let Some(thread) = &thread {
                thread.set_stop_reason(StopReason::Signal(signo));
            }
            StateType::Stopped
        }
        ScriptedStopKind::Exception(description) => {
            if let Some(thread) = &thread {
                thread.set_stop_reason(StopReason::Exception(description));
            }
            StateType::Crashed
        }
    };
    process.set_private_state(state);
}

impl ProcessBackend for SimulatedInferior
{
    fn plugin_name(&self) -> &'static str
    {
        "simulated"
    }

    fn architecture(&self) -> Architecture
    {
        self.architecture
    }

    fn do_launch(&self, process: &Process, info: &LaunchInfo) -> WardenResult<ProcessId>
    {
        debug!(pid = %self.pid, executable = ?info.executable, arguments = ?info.arguments, "simulated launch");
        process.set_pid(self.pid);
        self.populate_threads(process.thread_list(), process);
        process.set_private_state(StateType::Stopped);
        Ok(self.pid)
    }

    fn do_attach(&self, process: &Process, pid: ProcessId) -> WardenResult<()>
    {
        if pid != self.pid {
            return Err(WardenError::ProcessNotFound(pid.0));
        }
        self.populate_threads(process.thread_list(), process);
        process.set_private_state(StateType::Stopped);
        Ok(())
    }

    fn do_resume(&self, process: &Process) -> WardenResult<()>
    {
        let delivery = self.plan_delivery(process)?;
        let generation = {
            let mut inner = self.lock();
            inner.running = true;
            inner.generation = inner.generation.wrapping_add(1);
            inner.resume_count += 1;
            inner.generation
        };
        process.set_private_state(StateType::Running);
        match delivery {
            Some((delay, delivery)) => self.schedule(process, generation, delay, delivery),
            None => trace!(generation, "simulated inferior runs until halted"),
        }
        Ok(())
    }

    fn do_halt(&self, process: &Process) -> WardenResult<bool>
    {
        if !self.cancel() {
            return Ok(false);
        }
        let (racing, watch_slots) = {
            let mut inner = self.lock();
            let racing = if inner.stops.front().is_some_and(|stop| stop.racing_halt) {
                inner.stops.pop_front()
            } else {
                None
            };
            (racing, inner.watch_slots)
        };
        if let Some(stop) = racing {
            debug!("scripted stop lands before the halt");
            deliver_stop(process, &watch_slots, stop);
            return Ok(true);
        }
        if let Some(thread) = process.thread_list().selected_thread() {
            thread.set_stop_reason(StopReason::Signal(libc::SIGSTOP));
        }
        process.set_private_state(StateType::Stopped);
        Ok(true)
    }

    fn do_detach(&self, _process: &Process) -> WardenResult<()>
    {
        self.cancel();
        Ok(())
    }

    fn do_destroy(&self, _process: &Process) -> WardenResult<()>
    {
        self.cancel();
        Ok(())
    }

    fn do_signal(&self, process: &Process, signo: i32) -> WardenResult<()>
    {
        let tid = process
            .thread_list()
            .selected_thread()
            .map_or(ThreadId(1), |thread| thread.tid());
        let stop = ScriptedStop::new(ScriptedStopKind::Signal(signo)).on_thread(tid);
        let running = {
            let mut inner = self.lock();
            if inner.running {
                Some(inner.generation)
            } else {
                inner.stops.push_front(stop.clone());
                None
            }
        };
        if let Some(generation) = running {
            self.schedule(process, generation, Duration::ZERO, Delivery::Stop(stop));
        }
        Ok(())
    }

    fn do_read_memory(&self, address: Address, buffer: &mut [u8]) -> WardenResult<usize>
    {
        self.lock().memory.read(address, buffer)
    }

    fn do_write_memory(&self, address: Address, data: &[u8]) -> WardenResult<usize>
    {
        self.lock().memory.write(address, data)
    }

    fn do_allocate_memory(&self, size: usize, permissions: Permissions) -> WardenResult<Address>
    {
        let size = (size as u64).max(1).div_ceil(PAGE_SIZE) * PAGE_SIZE;
        let mut inner = self.lock();
        let address = Address::new(inner.next_allocation);
        inner.next_allocation += size;
        inner.memory.map(address, vec![0; size as usize], permissions);
        inner.allocations.insert(address, size as usize);
        debug!(%address, size, %permissions, "simulated allocation");
        Ok(address)
    }

    fn do_deallocate_memory(&self, address: Address) -> WardenResult<()>
    {
        let mut inner = self.lock();
        if inner.allocations.remove(&address).is_none() {
            return Err(WardenError::Allocation(format!("no simulated allocation at {address}")));
        }
        inner.memory.unmap(address);
        Ok(())
    }

    fn enable_breakpoint_site(&self, process: &Process, site: &BreakpointSite) -> WardenResult<()>
    {
        if !site.is_hardware() {
            return process.enable_software_breakpoint(site);
        }
        if site.is_enabled() {
            return Ok(());
        }
        let mut inner = self.lock();
        let Some(slot) = inner.hardware_slots.iter().position(Option::is_none) else {
            return Err(WardenError::ResourceExhausted(format!(
                "all {HARDWARE_BREAKPOINT_SLOTS} hardware breakpoint slots are in use"
            )));
        };
        inner.hardware_slots[slot] = Some(site.load_address());
        site.set_hardware_index(Some(slot as u32));
        site.set_enabled(true);
        debug!(site = %site.id(), address = %site.load_address(), slot, "hardware breakpoint enabled");
        Ok(())
    }

    fn disable_breakpoint_site(&self, process: &Process, site: &BreakpointSite) -> WardenResult<()>
    {
        if !site.is_hardware() {
            return process.disable_software_breakpoint(site);
        }
        if let Some(slot) = site.hardware_index() {
            if let Some(entry) = self.lock().hardware_slots.get_mut(slot as usize) {
                *entry = None;
            }
        }
        site.set_hardware_index(None);
        site.set_enabled(false);
        Ok(())
    }

    fn enable_watchpoint(&self, _process: &Process, watchpoint: &Watchpoint) -> WardenResult<()>
    {
        let mut inner = self.lock();
        let Some(slot) = inner.watch_slots.iter().position(Option::is_none) else {
            return Err(WardenError::ResourceExhausted(format!(
                "all {WATCHPOINT_SLOTS} watchpoint slots are in use"
            )));
        };
        inner.watch_slots[slot] = Some((watchpoint.id(), watchpoint.address(), watchpoint.size()));
        Ok(())
    }

    fn disable_watchpoint(&self, _process: &Process, watchpoint: &Watchpoint) -> WardenResult<()>
    {
        let mut inner = self.lock();
        for slot in &mut inner.watch_slots {
            if slot.is_some_and(|(id, _, _)| id == watchpoint.id()) {
                *slot = None;
            }
        }
        Ok(())
    }

    fn update_thread_list(&self, process: &Process, threads: &ThreadList) -> WardenResult<()>
    {
        self.populate_threads(threads, process);
        Ok(())
    }

    fn put_stdin(&self, data: &[u8]) -> WardenResult<usize>
    {
        self.lock().stdin.extend_from_slice(data);
        Ok(data.len())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T>
{
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
