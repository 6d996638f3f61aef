//! The private-state task
//!
//! Each process runs one background task that consumes private state-change
//! events and decides which of them reach the public broadcaster. The task
//! lives on its own named OS thread driving a current-thread `tokio`
//! runtime, and selects between two channels:
//!
//! - a control channel carrying [`ControlMessage`]s, always serviced first
//! - a state channel fed by the private broadcaster
//!
//! While paused, only the control channel is serviced; state events queue
//! up until the task is resumed.

use std::sync::mpsc as std_mpsc;
use std::sync::Weak;
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;

use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::{debug, trace, warn};

use super::{Process, ProcessEventData};
use crate::error::{WardenError, WardenResult};
use crate::events::{Event, EventMask};
use crate::types::StateType;

/// Requests understood by the private-state task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlMessage
{
    /// Exit the loop
    Stop,
    /// Service only the control channel
    Pause,
    /// Go back to consuming state events
    Resume,
}

type ControlRequest = (ControlMessage, std_mpsc::Sender<()>);

/// Handle to a running private-state task
#[derive(Debug)]
pub(crate) struct PrivateStateTask
{
    control: UnboundedSender<ControlRequest>,
    handle: Option<JoinHandle<()>>,
    thread_id: ThreadId,
}

impl PrivateStateTask
{
    /// Spawn the task for `process` and route its private events into it.
    pub(crate) fn spawn(process: &Process) -> WardenResult<Self>
    {
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = mpsc::unbounded_channel();
        process
            .private_broadcaster()
            .set_channel(state_tx, EventMask::STATE_CHANGED | EventMask::INTERRUPT);

        let weak = process.weak_self();
        let name = format!("warden.process.private-state(pid={})", process.pid_string());
        let handle = thread::Builder::new().name(name.clone()).spawn(move || {
            let runtime = match tokio::runtime::Builder::new_current_thread().enable_time().build() {
                Ok(runtime) => runtime,
                Err(error) => {
                    warn!(%error, "could not build private-state runtime");
                    return;
                }
            };
            runtime.block_on(run(weak, control_rx, state_rx));
        })?;
        debug!(thread = %name, "private-state task started");
        let thread_id = handle.thread().id();
        Ok(Self {
            control: control_tx,
            handle: Some(handle),
            thread_id,
        })
    }

    /// Whether the calling thread is the task's own thread.
    pub(crate) fn is_current_thread(&self) -> bool
    {
        thread::current().id() == self.thread_id
    }

    /// Whether the task is still running.
    pub(crate) fn is_alive(&self) -> bool
    {
        self.handle.as_ref().is_some_and(|handle| !handle.is_finished())
    }

    /// Send `message` and wait up to `timeout` for the acknowledgement.
    ///
    /// Called from the task's own thread the message is queued without
    /// waiting; the loop picks it up after the current event.
    pub(crate) fn control(&mut self, message: ControlMessage, timeout: Duration) -> WardenResult<()>
    {
        let (ack_tx, ack_rx) = std_mpsc::channel();
        if self.control.send((message, ack_tx)).is_err() {
            trace!(?message, "private-state task already gone");
            self.join();
            return Ok(());
        }
        if self.is_current_thread() {
            return Ok(());
        }
        let acknowledged = ack_rx.recv_timeout(timeout).is_ok();
        if message == ControlMessage::Stop {
            self.join();
        }
        if acknowledged {
            Ok(())
        } else {
            Err(WardenError::Timeout(format!(
                "private-state task did not acknowledge {message:?}"
            )))
        }
    }

    fn join(&mut self)
    {
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("private-state task panicked");
            }
        }
    }
}

async fn run(
    process: Weak<Process>,
    mut control: UnboundedReceiver<ControlRequest>,
    mut events: UnboundedReceiver<Event>,
)
{
    let mut paused = false;
    loop {
        if paused {
            let Some((message, ack)) = control.recv().await else {
                break;
            };
            if finish(message, &mut paused, &ack, &process, &mut events) {
                break;
            }
            continue;
        }

        tokio::select! {
            biased;
            request = control.recv() => {
                let Some((message, ack)) = request else {
                    break;
                };
                if finish(message, &mut paused, &ack, &process, &mut events) {
                    break;
                }
            }
            event = events.recv() => {
                let Some(event) = event else {
                    break;
                };
                if handle(&process, &event) {
                    break;
                }
            }
        }
    }
    trace!("private-state loop finished");
}

/// Handle one private event. Returns `true` when the loop should exit.
fn handle(process: &Weak<Process>, event: &Event) -> bool
{
    let Some(process) = process.upgrade() else {
        return true;
    };
    let state = ProcessEventData::state_from_event(event);
    if state != StateType::Invalid {
        process.handle_private_event(event);
    }
    if matches!(state, StateType::Invalid | StateType::Exited | StateType::Detached) {
        debug!(pid = %process.pid_string(), %state, "private-state task exiting");
        return true;
    }
    false
}

/// Apply a control message and acknowledge it. Returns `true` when the loop
/// should exit.
///
/// On stop, events already queued are handled first so a final exit or
/// detach still reaches the public side.
fn finish(
    message: ControlMessage,
    paused: &mut bool,
    ack: &std_mpsc::Sender<()>,
    process: &Weak<Process>,
    events: &mut UnboundedReceiver<Event>,
) -> bool
{
    trace!(?message, "private-state control");
    let exit = match message {
        ControlMessage::Stop => {
            while let Ok(event) = events.try_recv() {
                if handle(process, &event) {
                    break;
                }
            }
            true
        }
        ControlMessage::Pause => {
            *paused = true;
            false
        }
        ControlMessage::Resume => {
            *paused = false;
            false
        }
    };
    // The requester may have given up waiting.
    let _ = ack.send(());
    exit
}
