//! Tests for the process state machine and the public event pipeline

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use warden_core::events::{Event, EventMask, Listener};
use warden_core::memory::Permissions;
use warden_core::module::SharedModuleRegistry;
use warden_core::platform::{ScriptedStop, ScriptedStopKind, SimulatedInferior};
use warden_core::process::{LaunchInfo, Notifications, Process, ProcessEventData};
use warden_core::types::{Address, ProcessId, StateType};
use warden_core::{Target, WardenError};

const WAIT: Duration = Duration::from_secs(5);
const QUIET: Duration = Duration::from_millis(200);

fn launch(inferior: &SimulatedInferior) -> (Arc<Target>, Arc<Process>, Listener)
{
    let target = Target::new(Arc::new(SharedModuleRegistry::new()));
    let listener = Listener::new("test.listener");
    let process = target.create_process(Box::new(inferior.clone()), Some(&listener));
    process.launch(LaunchInfo::new("a.out")).unwrap();
    // The initial stop is public.
    let first = next_state_event(&listener).unwrap();
    assert_eq!(ProcessEventData::state_from_event(&first), StateType::Stopped);
    (target, process, listener)
}

fn next_state_event(listener: &Listener) -> Option<Event>
{
    loop {
        let event = listener.wait_for_event(Some(WAIT))?;
        if event.process_data().is_some() {
            return Some(event);
        }
    }
}

#[test]
fn test_launch_reaches_stopped()
{
    let (_target, process, _listener) = launch(&SimulatedInferior::new());
    assert_eq!(process.public_state(), StateType::Stopped);
    assert_eq!(process.private_state(), StateType::Stopped);
    assert!(process.is_alive());
    assert_eq!(process.thread_list().threads().len(), 1);
}

#[test]
fn test_stop_id_only_moves_on_stops()
{
    let (_target, process, _listener) = launch(&SimulatedInferior::new());
    let before = process.stop_id();

    // Setting the current state again is a no-op.
    process.set_private_state(StateType::Stopped);
    assert_eq!(process.stop_id(), before);

    process.set_private_state(StateType::Running);
    assert_eq!(process.stop_id(), before);

    process.set_private_state(StateType::Stopped);
    assert_eq!(process.stop_id(), before + 1);

    process.set_private_state(StateType::Crashed);
    assert_eq!(process.stop_id(), before + 2);
}

#[test]
fn test_running_then_stepping_is_one_public_event()
{
    let (_target, process, listener) = launch(&SimulatedInferior::new());

    process.set_private_state(StateType::Running);
    process.set_private_state(StateType::Stepping);

    let event = next_state_event(&listener).unwrap();
    assert_eq!(ProcessEventData::state_from_event(&event), StateType::Running);
    assert!(listener.wait_for_event(Some(QUIET)).is_none());
    assert!(process.public_state().is_running());
}

#[test]
fn test_signal_stop_is_public()
{
    let inferior = SimulatedInferior::new().with_stop(ScriptedStop::new(ScriptedStopKind::Signal(libc::SIGINT)));
    let (_target, process, listener) = launch(&inferior);

    process.resume().unwrap();
    let running = next_state_event(&listener).unwrap();
    assert_eq!(ProcessEventData::state_from_event(&running), StateType::Running);
    let stopped = next_state_event(&listener).unwrap();
    assert_eq!(ProcessEventData::state_from_event(&stopped), StateType::Stopped);
    assert!(!ProcessEventData::restarted_from_event(&stopped));
    assert_eq!(process.public_state(), StateType::Stopped);
}

#[test]
fn test_halt_interrupts_a_running_inferior()
{
    let inferior = SimulatedInferior::new();
    let (_target, process, listener) = launch(&inferior);

    process.resume().unwrap();
    let running = next_state_event(&listener).unwrap();
    assert_eq!(ProcessEventData::state_from_event(&running), StateType::Running);
    assert!(inferior.is_running());

    process.halt().unwrap();
    let stopped = next_state_event(&listener).unwrap();
    assert_eq!(ProcessEventData::state_from_event(&stopped), StateType::Stopped);
    assert!(ProcessEventData::interrupted_from_event(&stopped));
    assert!(!inferior.is_running());
}

#[test]
fn test_halt_of_a_stopped_process_is_quiet()
{
    let (_target, process, listener) = launch(&SimulatedInferior::new());
    process.halt().unwrap();
    assert!(listener.wait_for_event(Some(QUIET)).is_none());
    assert_eq!(process.public_state(), StateType::Stopped);
}

#[test]
fn test_resume_requires_a_stop()
{
    let (_target, process, listener) = launch(&SimulatedInferior::new());
    process.resume().unwrap();
    next_state_event(&listener).unwrap();
    assert!(matches!(process.resume(), Err(WardenError::InvalidState { .. })));
    process.halt().unwrap();
}

#[test]
fn test_exit_is_reported_with_status()
{
    let inferior = SimulatedInferior::new().with_stop(ScriptedStop::new(ScriptedStopKind::Exit(3)));
    let (_target, process, listener) = launch(&inferior);

    process.resume().unwrap();
    let mut states = Vec::new();
    while let Some(event) = next_state_event(&listener) {
        let state = ProcessEventData::state_from_event(&event);
        states.push(state);
        if state == StateType::Exited {
            break;
        }
    }
    assert_eq!(states, vec![StateType::Running, StateType::Exited]);
    assert_eq!(process.exit_status(), Some(3));
    assert!(!process.is_alive());
    assert!(process.resume().is_err());
}

#[test]
fn test_destroy_moves_to_exited()
{
    let (_target, process, _listener) = launch(&SimulatedInferior::new());
    process.destroy().unwrap();
    assert_eq!(process.private_state(), StateType::Exited);
    assert_eq!(process.public_state(), StateType::Exited);
    assert!(matches!(process.signal(libc::SIGINT), Err(WardenError::NotAttached)));
}

#[test]
fn test_attach_completes_on_the_first_stop()
{
    let inferior = SimulatedInferior::new().with_pid(77);
    let target = Target::new(Arc::new(SharedModuleRegistry::new()));
    let listener = Listener::new("test.attach");
    let process = target.create_process(Box::new(inferior.clone()), Some(&listener));

    process.attach(ProcessId(77)).unwrap();
    let stopped = next_state_event(&listener).unwrap();
    assert_eq!(ProcessEventData::state_from_event(&stopped), StateType::Stopped);
    assert_eq!(process.pid(), Some(ProcessId(77)));
    assert_eq!(process.thread_list().threads().len(), 1);
}

#[test]
fn test_attach_to_an_unknown_pid_fails()
{
    let target = Target::new(Arc::new(SharedModuleRegistry::new()));
    let process = target.create_process(Box::new(SimulatedInferior::new().with_pid(77)), None);

    assert!(matches!(process.attach(ProcessId(78)), Err(WardenError::ProcessNotFound(78))));
    assert_eq!(process.exit_status(), Some(-1));
    assert!(!process.is_alive());
}

#[test]
fn test_exit_status_is_recorded_once()
{
    let (_target, process, _listener) = launch(&SimulatedInferior::new());
    assert!(process.set_exit_status(9, "killed"));
    assert!(!process.set_exit_status(0, "again"));
    assert_eq!(process.exit_status(), Some(9));
    assert_eq!(process.exit_description(), "killed");
}

#[test]
fn test_notifications_see_broadcast_stops()
{
    let inferior = SimulatedInferior::new().with_stop(ScriptedStop::new(ScriptedStopKind::Signal(libc::SIGINT)));
    let (_target, process, listener) = launch(&inferior);

    let initialized = Arc::new(AtomicUsize::new(0));
    let seen = Arc::new(Mutex::new(Vec::new()));
    let (initialized_clone, seen_clone) = (Arc::clone(&initialized), Arc::clone(&seen));
    let id = process.register_notification_callbacks(Notifications {
        initialize: Some(Arc::new(move |_: &Process| {
            initialized_clone.fetch_add(1, Ordering::SeqCst);
        })),
        process_state_changed: Some(Arc::new(move |_: &Process, state: StateType| {
            seen_clone.lock().unwrap().push(state);
        })),
    });
    assert_eq!(initialized.load(Ordering::SeqCst), 1);

    process.resume().unwrap();
    next_state_event(&listener).unwrap();
    next_state_event(&listener).unwrap();
    assert_eq!(*seen.lock().unwrap(), vec![StateType::Stopped]);

    assert!(process.unregister_notification_callbacks(id));
    assert!(!process.unregister_notification_callbacks(id));
}

#[test]
fn test_stdio_is_buffered_and_stdin_needs_a_running_process()
{
    let inferior = SimulatedInferior::new();
    let (_target, process, listener) = launch(&inferior);

    process.append_stdout(b"hello ");
    process.append_stdout(b"world");
    let event = listener.wait_for_event(Some(WAIT)).unwrap();
    assert_eq!(event.kind(), EventMask::STDOUT);
    // One announcement while the first is still queued.
    assert!(listener.wait_for_event(Some(QUIET)).is_none());
    assert_eq!(process.get_stdout(5), b"hello".to_vec());
    assert_eq!(process.get_stdout(64), b" world".to_vec());
    assert!(process.get_stderr(64).is_empty());

    assert!(process.put_stdin(b"input").is_err());
    process.resume().unwrap();
    next_state_event(&listener).unwrap();
    assert_eq!(process.put_stdin(b"input").unwrap(), 5);
    assert_eq!(inferior.stdin(), b"input".to_vec());
    process.halt().unwrap();
}

#[test]
fn test_image_tokens()
{
    let (_target, process, _listener) = launch(&SimulatedInferior::new());
    let index = process.add_image_token(Address::new(0x7000));
    assert_eq!(process.image_token(index), Address::new(0x7000));
    process.reset_image_token(index);
    assert_eq!(process.image_token(index), Address::INVALID);
    assert_eq!(process.image_token(index + 1), Address::INVALID);
}

#[test]
fn test_scratch_memory_and_memory_helpers()
{
    let inferior = SimulatedInferior::new();
    let (_target, process, _listener) = launch(&inferior);

    let scratch = process.allocate_memory(64, Permissions::READ_WRITE).unwrap();
    process.write_memory(scratch, b"warden\0tail").unwrap();
    assert_eq!(process.read_c_string_from_memory(scratch, 64).unwrap(), "warden");
    assert_eq!(process.read_c_string_from_memory(scratch, 3).unwrap(), "war");

    process.write_scalar_to_memory(scratch + 16, 0xfffe, 2).unwrap();
    assert_eq!(process.read_scalar_integer_from_memory(scratch + 16, 2, true).unwrap(), (-2i64) as u64);
    assert_eq!(process.read_unsigned_integer_from_memory(scratch + 16, 2, 0), 0xfffe);
    assert!(process.read_scalar_integer_from_memory(scratch, 9, false).is_err());

    process.write_pointer_to_memory(scratch + 24, Address::new(0x1234)).unwrap();
    assert_eq!(process.read_pointer_from_memory(scratch + 24).unwrap(), Address::new(0x1234));

    process.deallocate_memory(scratch).unwrap();
    assert!(process.deallocate_memory(scratch).is_err());
}
