//! One-shot handlers that get the first look at the next private event.

use tracing::{debug, warn};

use super::{Process, ProcessEventData};
use crate::events::Event;
use crate::types::StateType;

/// What a [`NextEventAction`] wants done after seeing an event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventActionResult
{
    /// Keep the action installed and keep waiting
    Retry,
    /// The action is satisfied; remove it
    Success,
    /// Give up: the process is marked exited with the action's exit string
    Exit,
}

/// Handler consulted before the broadcast vote on each private event
pub trait NextEventAction: Send
{
    /// Inspect `event` and decide what happens next.
    fn perform_action(&mut self, process: &Process, event: &Event) -> EventActionResult;

    /// Another action is replacing this one.
    fn handle_being_interrupted(&mut self) -> EventActionResult;

    /// Exit description used for [`EventActionResult::Exit`].
    fn exit_string(&self) -> String;
}

/// Finishes an asynchronous attach on the first real stop
///
/// Running and connected events are waited out. The first `exec_count` stops
/// are resumed past (the inferior is expected to exec); the stop after that
/// completes the attach.
#[derive(Debug)]
pub struct AttachCompletionHandler
{
    exec_count: u32,
    exit_string: String,
}

impl AttachCompletionHandler
{
    /// Handler that resumes past `exec_count` stops.
    #[must_use]
    pub const fn new(exec_count: u32) -> Self
    {
        Self {
            exec_count,
            exit_string: String::new(),
        }
    }
}

impl NextEventAction for AttachCompletionHandler
{
    fn perform_action(&mut self, process: &Process, event: &Event) -> EventActionResult
    {
        match ProcessEventData::state_from_event(event) {
            StateType::Running | StateType::Connected => EventActionResult::Retry,
            StateType::Stopped | StateType::Crashed => {
                if self.exec_count > 0 {
                    self.exec_count -= 1;
                    debug!(remaining = self.exec_count, "resuming past exec stop during attach");
                    if let Err(error) = process.resume() {
                        warn!(%error, "resume during attach failed");
                    }
                    EventActionResult::Retry
                } else {
                    process.complete_attach();
                    EventActionResult::Success
                }
            }
            _ => {
                self.exit_string = "No valid Process".to_string();
                EventActionResult::Exit
            }
        }
    }

    fn handle_being_interrupted(&mut self) -> EventActionResult
    {
        EventActionResult::Success
    }

    fn exit_string(&self) -> String
    {
        self.exit_string.clone()
    }
}
