//! Event fan-out with hijack support.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::mpsc::UnboundedSender;
use tracing::trace;

use super::{Event, EventMask, Listener};

static NEXT_BROADCASTER_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of a broadcaster, stamped onto every event it delivers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BroadcasterId(u64);

impl BroadcasterId
{
    /// Placeholder carried by events that have not been broadcast yet.
    pub const UNSET: Self = BroadcasterId(0);

    /// Raw numeric id.
    #[must_use]
    pub const fn raw(self) -> u64
    {
        self.0
    }
}

#[derive(Default)]
struct BroadcasterState
{
    listeners: Vec<(Listener, EventMask)>,
    hijackers: Vec<(Listener, EventMask)>,
    channel: Option<(UnboundedSender<Event>, EventMask)>,
}

/// Delivers events to subscribed listeners
///
/// Besides queue-based [`Listener`]s a broadcaster can feed one channel
/// sender; the process uses this to hand private state changes to its
/// background task. Hijackers take precedence over both.
pub struct Broadcaster
{
    id: BroadcasterId,
    name: String,
    state: Mutex<BroadcasterState>,
}

impl Broadcaster
{
    /// Create a broadcaster with no subscribers.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self
    {
        Self {
            id: BroadcasterId(NEXT_BROADCASTER_ID.fetch_add(1, Ordering::Relaxed)),
            name: name.into(),
            state: Mutex::new(BroadcasterState::default()),
        }
    }

    /// Identity stamped onto delivered events.
    #[must_use]
    pub const fn id(&self) -> BroadcasterId
    {
        self.id
    }

    /// Name given at construction.
    #[must_use]
    pub fn name(&self) -> &str
    {
        &self.name
    }

    /// Subscribe `listener` to the kinds in `mask`.
    ///
    /// Subscribing an already subscribed listener widens its mask.
    pub fn add_listener(&self, listener: &Listener, mask: EventMask)
    {
        let mut state = self.lock();
        if let Some(entry) = state.listeners.iter_mut().find(|(existing, _)| existing.same_as(listener)) {
            entry.1 = entry.1 | mask;
        } else {
            state.listeners.push((listener.clone(), mask));
        }
    }

    /// Unsubscribe `listener`. Returns whether it was subscribed.
    pub fn remove_listener(&self, listener: &Listener) -> bool
    {
        let mut state = self.lock();
        let before = state.listeners.len();
        state.listeners.retain(|(existing, _)| !existing.same_as(listener));
        before != state.listeners.len()
    }

    /// Route events matching `mask` to a channel.
    pub fn set_channel(&self, sender: UnboundedSender<Event>, mask: EventMask)
    {
        self.lock().channel = Some((sender, mask));
    }

    /// Stop routing events to the channel.
    pub fn clear_channel(&self)
    {
        self.lock().channel = None;
    }

    /// Redirect events matching `mask` to `listener` until [`restore`](Self::restore).
    ///
    /// Hijacks nest; the most recent one wins.
    pub fn hijack(&self, listener: &Listener, mask: EventMask)
    {
        trace!(broadcaster = %self.name, listener = listener.name(), "hijacking broadcaster");
        self.lock().hijackers.push((listener.clone(), mask));
    }

    /// Undo the most recent hijack.
    pub fn restore(&self)
    {
        if let Some((listener, _)) = self.lock().hijackers.pop() {
            trace!(broadcaster = %self.name, listener = listener.name(), "restoring broadcaster");
        }
    }

    /// Whether a hijack is in place.
    #[must_use]
    pub fn is_hijacked(&self) -> bool
    {
        !self.lock().hijackers.is_empty()
    }

    /// Deliver `event` to the current hijacker, or to every subscriber.
    pub fn broadcast(&self, mut event: Event)
    {
        event.stamp(self.id);
        let state = self.lock();
        if let Some((hijacker, mask)) = state.hijackers.last() {
            if mask.intersects(event.kind()) {
                hijacker.push(event);
                return;
            }
        }
        for (listener, mask) in &state.listeners {
            if mask.intersects(event.kind()) {
                listener.push(event.clone());
            }
        }
        if let Some((sender, mask)) = &state.channel {
            if mask.intersects(event.kind()) && sender.send(event).is_err() {
                trace!(broadcaster = %self.name, "event channel closed, dropping event");
            }
        }
    }

    /// Broadcast unless every receiving listener already holds an event of this kind.
    ///
    /// Returns whether the event was delivered anywhere.
    pub fn broadcast_if_unique(&self, mut event: Event) -> bool
    {
        event.stamp(self.id);
        let kind = event.kind();
        let mut delivered = false;
        let state = self.lock();
        if let Some((hijacker, mask)) = state.hijackers.last() {
            if mask.intersects(kind) {
                if !hijacker.has_pending(self.id, kind) {
                    hijacker.push(event);
                    delivered = true;
                }
                return delivered;
            }
        }
        for (listener, mask) in &state.listeners {
            if mask.intersects(kind) && !listener.has_pending(self.id, kind) {
                listener.push(event.clone());
                delivered = true;
            }
        }
        delivered
    }

    fn lock(&self) -> MutexGuard<'_, BroadcasterState>
    {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for Broadcaster
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result
    {
        f.debug_struct("Broadcaster")
            .field("id", &self.id)
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}
