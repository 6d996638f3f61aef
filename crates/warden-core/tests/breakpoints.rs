//! Tests for breakpoint sites, opcode shadowing, and breakpoint stops

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use warden_core::breakpoints::{StoppointCallbackContext, WatchpointAccess};
use warden_core::events::{Event, Listener};
use warden_core::memory::Permissions;
use warden_core::module::{Module, ModuleSpec, SharedModuleRegistry, SymbolKind, SyntheticObjectFile};
use warden_core::platform::{ScriptedStop, ScriptedStopKind, SimulatedInferior};
use warden_core::process::{LaunchInfo, Process, ProcessEventData};
use warden_core::types::{Address, Architecture, StateType};
use warden_core::{Target, WardenError};

const CODE: Address = Address::new(0x1000);
const INT3: u8 = 0xCC;
const NOP: u8 = 0x90;
const WAIT: Duration = Duration::from_secs(5);

fn launch(inferior: &SimulatedInferior, listener: Option<&Listener>) -> (Arc<Target>, Arc<Process>)
{
    let target = Target::new(Arc::new(SharedModuleRegistry::new()));
    let process = target.create_process(Box::new(inferior.clone()), listener);
    process.launch(LaunchInfo::new("a.out")).unwrap();
    (target, process)
}

fn read(process: &Process, address: Address, size: usize) -> Vec<u8>
{
    let mut buffer = vec![0u8; size];
    let count = process.read_memory(address, &mut buffer).unwrap();
    buffer.truncate(count);
    buffer
}

fn next_state_event(listener: &Listener) -> Event
{
    loop {
        let event = listener.wait_for_event(Some(WAIT)).expect("no event in time");
        if event.process_data().is_some() {
            return event;
        }
    }
}

#[test]
fn test_reads_hide_the_trap_and_writes_land_in_the_saved_opcode()
{
    let inferior = SimulatedInferior::new().with_code(CODE, vec![NOP; 16]);
    let (target, process) = launch(&inferior, None);

    let breakpoint = target.create_breakpoint_by_address(CODE, false).unwrap();
    assert_eq!(inferior.raw_memory(CODE, 2).unwrap(), vec![INT3, NOP]);
    assert_eq!(read(&process, CODE, 2), vec![NOP, NOP]);

    assert_eq!(process.write_memory(CODE, &[0x42, 0x43]).unwrap(), 2);
    assert_eq!(inferior.raw_memory(CODE, 2).unwrap(), vec![INT3, 0x43]);
    assert_eq!(read(&process, CODE, 2), vec![0x42, 0x43]);

    target.remove_breakpoint(breakpoint.id()).unwrap();
    assert_eq!(inferior.raw_memory(CODE, 2).unwrap(), vec![0x42, 0x43]);
    assert!(process.breakpoint_site_list().is_empty());
}

#[test]
fn test_sites_are_shared_by_owners()
{
    let inferior = SimulatedInferior::new().with_code(CODE, vec![NOP; 16]);
    let (target, process) = launch(&inferior, None);

    let first = target.create_breakpoint_by_address(CODE, false).unwrap();
    let second = target.create_breakpoint_by_address(CODE, false).unwrap();
    let sites = process.breakpoint_site_list().sites();
    assert_eq!(sites.len(), 1);
    assert_eq!(sites[0].owner_count(), 2);

    target.remove_breakpoint(first.id()).unwrap();
    assert_eq!(sites[0].owner_count(), 1);
    assert_eq!(inferior.raw_memory(CODE, 1).unwrap(), vec![INT3]);

    target.remove_breakpoint(second.id()).unwrap();
    assert_eq!(inferior.raw_memory(CODE, 1).unwrap(), vec![NOP]);
    assert!(process.breakpoint_site_list().find_by_address(CODE).is_none());
}

#[test]
fn test_disable_and_enable_round_trip()
{
    let inferior = SimulatedInferior::new().with_code(CODE, vec![NOP; 16]);
    let (target, process) = launch(&inferior, None);
    target.create_breakpoint_by_address(CODE, false).unwrap();
    let site = process.breakpoint_site_list().find_by_address(CODE).unwrap();

    process.disable_breakpoint_site_by_id(site.id()).unwrap();
    assert!(!site.is_enabled());
    assert_eq!(inferior.raw_memory(CODE, 1).unwrap(), vec![NOP]);

    process.enable_breakpoint_site_by_id(site.id()).unwrap();
    assert!(site.is_enabled());
    assert_eq!(inferior.raw_memory(CODE, 1).unwrap(), vec![INT3]);

    // Enabling twice is harmless and keeps the original byte.
    process.enable_breakpoint_site_by_id(site.id()).unwrap();
    assert_eq!(site.saved_opcode().as_slice(), &[NOP]);
}

#[test]
fn test_unmapped_address_is_not_kept()
{
    let inferior = SimulatedInferior::new();
    let (target, process) = launch(&inferior, None);
    assert!(target.create_breakpoint_by_address(Address::new(0xdead_0000), false).is_err());
    assert!(target.breakpoints().breakpoints().is_empty());
    assert!(process.breakpoint_site_list().is_empty());
}

#[test]
fn test_hardware_slots_run_out()
{
    let inferior = SimulatedInferior::new();
    let (target, process) = launch(&inferior, None);

    for index in 0..4u64 {
        target
            .create_breakpoint_by_address(Address::new(0x2000 + index * 0x10), true)
            .unwrap();
    }
    assert_eq!(inferior.hardware_slots_in_use(), 4);

    let error = target
        .create_breakpoint_by_address(Address::new(0x3000), true)
        .unwrap_err();
    assert!(matches!(error, WardenError::ResourceExhausted(_)));
    assert_eq!(target.breakpoints().breakpoints().len(), 4);
    assert_eq!(process.breakpoint_site_list().len(), 4);
}

#[test]
fn test_watchpoints_need_a_process_and_free_slots()
{
    let target = Target::new(Arc::new(SharedModuleRegistry::new()));
    assert!(matches!(
        target.create_watchpoint(CODE, 4, WatchpointAccess::Write),
        Err(WardenError::NotAttached)
    ));

    let inferior = SimulatedInferior::new();
    let process = target.create_process(Box::new(inferior.clone()), None);
    process.launch(LaunchInfo::new("a.out")).unwrap();
    let watchpoints: Vec<_> = (0..4u64)
        .map(|index| {
            target
                .create_watchpoint(Address::new(0x6000 + index * 8), 8, WatchpointAccess::ReadWrite)
                .unwrap()
        })
        .collect();
    assert!(watchpoints.iter().all(|watchpoint| watchpoint.is_enabled()));
    assert!(target.create_watchpoint(Address::new(0x7000), 8, WatchpointAccess::Read).is_err());

    target.remove_watchpoint(watchpoints[0].id()).unwrap();
    assert!(target.create_watchpoint(Address::new(0x7000), 8, WatchpointAccess::Read).is_ok());
}

#[test]
fn test_breakpoint_by_name_resolves_through_images()
{
    let inferior = SimulatedInferior::new().with_code(CODE, vec![NOP; 0x40]);
    let (target, process) = launch(&inferior, None);
    let file = SyntheticObjectFile::new(Architecture::X86_64)
        .executable(CODE)
        .with_symbol("main", CODE + 0x10, 0x20, SymbolKind::Code);
    target
        .images()
        .append(Arc::new(Module::with_object_file(ModuleSpec::new("/bin/demo"), Arc::new(file))));

    let breakpoint = target.create_breakpoint_by_name("main", false).unwrap();
    assert_eq!(breakpoint.locations().len(), 1);
    assert_eq!(breakpoint.locations()[0].address(), CODE + 0x10);
    assert!(process.breakpoint_site_list().find_by_address(CODE + 0x10).is_some());

    assert!(matches!(
        target.create_breakpoint_by_name("missing", false),
        Err(WardenError::InvalidArgument(_))
    ));
}

#[test]
fn test_breakpoint_stop_is_public_and_runs_stop_hooks()
{
    let inferior = SimulatedInferior::new()
        .with_code(CODE, vec![NOP; 16])
        .with_stop(ScriptedStop::new(ScriptedStopKind::Breakpoint(CODE)));
    let listener = Listener::new("test.breakpoints");
    let (target, process) = launch(&inferior, Some(&listener));
    next_state_event(&listener);

    let hooks = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&hooks);
    target.add_stop_hook(Arc::new(move |_: &Process| {
        counter.fetch_add(1, Ordering::SeqCst);
    }));
    let breakpoint = target.create_breakpoint_by_address(CODE, false).unwrap();

    process.resume().unwrap();
    let running = next_state_event(&listener);
    assert_eq!(ProcessEventData::state_from_event(&running), StateType::Running);
    let stopped = next_state_event(&listener);
    assert_eq!(ProcessEventData::state_from_event(&stopped), StateType::Stopped);
    assert!(!ProcessEventData::restarted_from_event(&stopped));

    assert_eq!(breakpoint.hit_count(), 1);
    assert_eq!(hooks.load(Ordering::SeqCst), 1);
    let thread = process.thread_list().selected_thread().unwrap();
    assert_eq!(thread.pc(), CODE);
}

#[test]
fn test_ignored_hits_are_resumed_privately()
{
    let mut inferior = SimulatedInferior::new().with_code(CODE, vec![NOP; 16]);
    for _ in 0..3 {
        inferior = inferior.with_stop(ScriptedStop::new(ScriptedStopKind::Breakpoint(CODE)));
    }
    let listener = Listener::new("test.ignore");
    let (target, process) = launch(&inferior, Some(&listener));
    next_state_event(&listener);

    let breakpoint = target.create_breakpoint_by_address(CODE, false).unwrap();
    breakpoint.update_options(|options| options.ignore_count = 2);

    process.resume().unwrap();
    let running = next_state_event(&listener);
    assert_eq!(ProcessEventData::state_from_event(&running), StateType::Running);
    let stopped = next_state_event(&listener);
    assert_eq!(ProcessEventData::state_from_event(&stopped), StateType::Stopped);

    assert_eq!(breakpoint.hit_count(), 3);
    assert_eq!(inferior.resume_count(), 3);
    assert_eq!(inferior.pending_stops(), 0);
}

#[test]
fn test_condition_false_keeps_running()
{
    let inferior = SimulatedInferior::new()
        .with_code(CODE, vec![NOP; 16])
        .with_stop(ScriptedStop::new(ScriptedStopKind::Breakpoint(CODE)))
        .with_stop(ScriptedStop::new(ScriptedStopKind::Exit(0)));
    let listener = Listener::new("test.condition");
    let (target, process) = launch(&inferior, Some(&listener));
    next_state_event(&listener);

    let breakpoint = target.create_breakpoint_by_address(CODE, false).unwrap();
    breakpoint.update_options(|options| options.condition = Some(Arc::new(|_: &StoppointCallbackContext| false)));

    process.resume().unwrap();
    let mut states = Vec::new();
    loop {
        let state = ProcessEventData::state_from_event(&next_state_event(&listener));
        states.push(state);
        if state == StateType::Exited {
            break;
        }
    }
    assert_eq!(states, vec![StateType::Running, StateType::Exited]);
    assert_eq!(breakpoint.hit_count(), 1);
    assert_eq!(process.exit_status(), Some(0));
}

#[test]
fn test_concurrent_breakpoints_share_one_site()
{
    let inferior = SimulatedInferior::new().with_code(CODE, vec![NOP; 16]);
    let (target, process) = launch(&inferior, None);

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let target = Arc::clone(&target);
            std::thread::spawn(move || target.create_breakpoint_by_address(CODE, false).unwrap())
        })
        .collect();
    let breakpoints: Vec<_> = handles.into_iter().map(|handle| handle.join().unwrap()).collect();

    let sites = process.breakpoint_site_list().sites();
    assert_eq!(sites.len(), 1);
    assert_eq!(sites[0].owner_count(), 4);
    assert_eq!(sites[0].saved_opcode().as_slice(), &[NOP]);
    assert_eq!(inferior.raw_memory(CODE, 1).unwrap(), vec![INT3]);

    for breakpoint in breakpoints {
        target.remove_breakpoint(breakpoint.id()).unwrap();
    }
    assert_eq!(inferior.raw_memory(CODE, 1).unwrap(), vec![NOP]);
    assert!(process.breakpoint_site_list().is_empty());
}

#[test]
fn test_writes_spanning_two_sites()
{
    let inferior = SimulatedInferior::new().with_code(CODE, vec![NOP; 16]);
    let (target, process) = launch(&inferior, None);
    target.create_breakpoint_by_address(CODE + 2, false).unwrap();
    target.create_breakpoint_by_address(CODE + 5, false).unwrap();

    let data: Vec<u8> = (1..=8).collect();
    assert_eq!(process.write_memory(CODE, &data).unwrap(), 8);
    assert_eq!(
        inferior.raw_memory(CODE, 8).unwrap(),
        vec![0x01, 0x02, INT3, 0x04, 0x05, INT3, 0x07, 0x08]
    );
    assert_eq!(read(&process, CODE, 8), data);

    let site = process.breakpoint_site_list().find_by_address(CODE + 5).unwrap();
    assert_eq!(site.saved_opcode().as_slice(), &[0x06]);
}

#[test]
fn test_write_past_the_mapping_keeps_the_shadowed_bytes()
{
    let inferior = SimulatedInferior::new().with_code(CODE, vec![NOP; 16]);
    let (target, process) = launch(&inferior, None);
    target.create_breakpoint_by_address(CODE + 15, false).unwrap();

    // The last byte lands in the site; nothing is mapped after it.
    assert_eq!(process.write_memory(CODE + 14, &[0x11, 0x22, 0x33, 0x44]).unwrap(), 2);
    assert_eq!(inferior.raw_memory(CODE + 14, 2).unwrap(), vec![0x11, INT3]);
    assert_eq!(read(&process, CODE + 14, 2), vec![0x11, 0x22]);
}

#[test]
fn test_read_only_code_cannot_take_a_trap()
{
    let rodata = Address::new(0x8000);
    let inferior = SimulatedInferior::new().with_memory(rodata, vec![NOP; 16], Permissions::READ);
    let (target, process) = launch(&inferior, None);

    let error = target.create_breakpoint_by_address(rodata, false).unwrap_err();
    assert_eq!(
        error,
        WardenError::BreakpointVerification {
            address: rodata,
            message: "Unable to write breakpoint trap to memory.",
        }
    );
    assert_eq!(inferior.raw_memory(rodata, 1).unwrap(), vec![NOP]);
    assert!(process.breakpoint_site_list().is_empty());
    assert!(target.breakpoints().breakpoints().is_empty());
}

#[test]
fn test_removing_a_trap_that_is_already_gone()
{
    let inferior = SimulatedInferior::new().with_code(CODE, vec![NOP; 16]);
    let (target, process) = launch(&inferior, None);
    let breakpoint = target.create_breakpoint_by_address(CODE, false).unwrap();

    // Something else restored the original code behind our back.
    inferior.map_memory(CODE, vec![NOP; 16], Permissions::READ | Permissions::EXECUTE);
    target.remove_breakpoint(breakpoint.id()).unwrap();
    assert_eq!(inferior.raw_memory(CODE, 1).unwrap(), vec![NOP]);
    assert!(process.breakpoint_site_list().is_empty());
}

#[test]
fn test_failed_restore_still_removes_the_site()
{
    let inferior = SimulatedInferior::new().with_code(CODE, vec![NOP; 16]);
    let (target, process) = launch(&inferior, None);
    let breakpoint = target.create_breakpoint_by_address(CODE, false).unwrap();

    assert!(inferior.protect_memory(CODE, Permissions::READ));
    let error = target.remove_breakpoint(breakpoint.id()).unwrap_err();
    assert_eq!(
        error,
        WardenError::BreakpointVerification {
            address: CODE,
            message: "Memory write failed when restoring original opcode.",
        }
    );
    assert!(process.breakpoint_site_list().is_empty());
    assert!(breakpoint.locations()[0].site_id().is_none());
}

#[test]
fn test_ignored_hit_during_halt_is_surfaced_as_interrupted()
{
    let inferior = SimulatedInferior::new()
        .with_code(CODE, vec![NOP; 16])
        .with_stop(ScriptedStop::new(ScriptedStopKind::Breakpoint(CODE)).racing_halt());
    let listener = Listener::new("test.halt");
    let (target, process) = launch(&inferior, Some(&listener));
    next_state_event(&listener);

    let breakpoint = target.create_breakpoint_by_address(CODE, false).unwrap();
    breakpoint.update_options(|options| options.ignore_count = 1);

    process.resume().unwrap();
    let running = next_state_event(&listener);
    assert_eq!(ProcessEventData::state_from_event(&running), StateType::Running);
    assert!(inferior.is_running());

    process.halt().unwrap();
    let stopped = next_state_event(&listener);
    assert_eq!(ProcessEventData::state_from_event(&stopped), StateType::Stopped);
    assert!(ProcessEventData::interrupted_from_event(&stopped));
    assert!(!ProcessEventData::restarted_from_event(&stopped));

    assert_eq!(inferior.resume_count(), 1);
    assert_eq!(inferior.pending_stops(), 0);
    assert_eq!(process.public_state(), StateType::Stopped);
    assert_eq!(process.thread_list().selected_thread().unwrap().pc(), CODE);
    let later = listener.wait_for_event(Some(Duration::from_millis(100)));
    assert!(later.filter(|event| event.process_data().is_some()).is_none());
}
