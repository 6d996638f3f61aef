//! # Events
//!
//! Broadcaster/listener plumbing used to deliver process state changes.
//!
//! A [`Broadcaster`] fans each [`Event`] out to the [`Listener`]s subscribed
//! to its kind. A listener can *hijack* a broadcaster: while the hijack is in
//! place, matching events go only to the hijacker. `halt` and
//! `run_thread_plan` rely on this to consume exactly the events they caused.
//!
//! Events are cheap to clone; the payload is shared. Removing a process
//! event from a listener's queue runs its removal hook (see
//! [`ProcessEventData::do_on_removal`](crate::process::ProcessEventData::do_on_removal)),
//! which is where stop actions and stop hooks fire.

pub mod broadcaster;
pub mod listener;

use std::fmt;
use std::ops::BitOr;
use std::sync::Arc;

pub use broadcaster::{Broadcaster, BroadcasterId};
pub use listener::Listener;

use crate::process::ProcessEventData;

/// Bit set of event kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EventMask(u32);

impl EventMask
{
    /// Process state changed
    pub const STATE_CHANGED: Self = EventMask(1 << 0);
    /// Client asked for an interrupt
    pub const INTERRUPT: Self = EventMask(1 << 1);
    /// Inferior wrote to stdout
    pub const STDOUT: Self = EventMask(1 << 2);
    /// Inferior wrote to stderr
    pub const STDERR: Self = EventMask(1 << 3);
    /// Every public process event
    pub const ALL: Self = EventMask(0b1111);

    /// Raw bits.
    #[must_use]
    pub const fn bits(self) -> u32
    {
        self.0
    }

    /// Whether any bit of `other` is set in `self`.
    #[must_use]
    pub const fn intersects(self, other: EventMask) -> bool
    {
        self.0 & other.0 != 0
    }

    /// Name used in logs.
    #[must_use]
    pub const fn name(self) -> &'static str
    {
        match self.0 {
            0b0001 => "state-changed",
            0b0010 => "interrupt",
            0b0100 => "stdout-available",
            0b1000 => "stderr-available",
            _ => "mixed",
        }
    }
}

impl BitOr for EventMask
{
    type Output = EventMask;

    fn bitor(self, rhs: Self) -> Self::Output
    {
        EventMask(self.0 | rhs.0)
    }
}

/// Payload carried by an [`Event`]
#[derive(Clone)]
pub enum EventData
{
    /// State change of a process
    Process(Arc<ProcessEventData>),
    /// No payload (stdio availability, interrupts)
    Empty,
}

/// One broadcast occurrence
#[derive(Clone)]
pub struct Event
{
    kind: EventMask,
    broadcaster: BroadcasterId,
    data: EventData,
}

impl Event
{
    /// Create an event of `kind` carrying `data`.
    ///
    /// The broadcaster id is filled in when the event is broadcast.
    #[must_use]
    pub fn new(kind: EventMask, data: EventData) -> Self
    {
        Self {
            kind,
            broadcaster: BroadcasterId::UNSET,
            data,
        }
    }

    /// Kind bit of this event.
    #[must_use]
    pub const fn kind(&self) -> EventMask
    {
        self.kind
    }

    /// Broadcaster that delivered this event.
    #[must_use]
    pub const fn broadcaster(&self) -> BroadcasterId
    {
        self.broadcaster
    }

    /// The process payload, if this is a process state event.
    #[must_use]
    pub fn process_data(&self) -> Option<&Arc<ProcessEventData>>
    {
        match &self.data {
            EventData::Process(data) => Some(data),
            EventData::Empty => None,
        }
    }

    pub(crate) fn stamp(&mut self, broadcaster: BroadcasterId)
    {
        self.broadcaster = broadcaster;
    }

    /// Hook run once the event has been taken off a listener queue.
    pub(crate) fn do_on_removal(&self)
    {
        if let EventData::Process(data) = &self.data {
            data.do_on_removal();
        }
    }
}

impl fmt::Debug for Event
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        let mut debug = f.debug_struct("Event");
        debug.field("kind", &self.kind.name()).field("broadcaster", &self.broadcaster);
        if let EventData::Process(data) = &self.data {
            debug
                .field("state", &data.state())
                .field("restarted", &data.restarted())
                .field("interrupted", &data.interrupted());
        }
        debug.finish()
    }
}
