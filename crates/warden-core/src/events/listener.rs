//! Event queue owned by one consumer.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

use super::{BroadcasterId, Event, EventMask};

static NEXT_LISTENER_ID: AtomicU64 = AtomicU64::new(1);

struct ListenerInner
{
    id: u64,
    name: String,
    queue: Mutex<VecDeque<Event>>,
    ready: Condvar,
}

/// A queue of events fed by one or more broadcasters
///
/// Cloning a listener yields another handle to the same queue. Waiting
/// blocks the calling thread until a matching event arrives or the timeout
/// elapses; a removed process event runs its removal hook on the waiting
/// thread before being returned.
#[derive(Clone)]
pub struct Listener
{
    inner: Arc<ListenerInner>,
}

impl Listener
{
    /// Create an empty listener.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self
    {
        Self {
            inner: Arc::new(ListenerInner {
                id: NEXT_LISTENER_ID.fetch_add(1, Ordering::Relaxed),
                name: name.into(),
                queue: Mutex::new(VecDeque::new()),
                ready: Condvar::new(),
            }),
        }
    }

    /// Name given at construction.
    #[must_use]
    pub fn name(&self) -> &str
    {
        &self.inner.name
    }

    /// Whether two handles refer to the same queue.
    #[must_use]
    pub fn same_as(&self, other: &Listener) -> bool
    {
        self.inner.id == other.inner.id
    }

    /// Number of queued events.
    #[must_use]
    pub fn pending(&self) -> usize
    {
        self.lock().len()
    }

    /// Whether an event of `kind` from `broadcaster` is already queued.
    #[must_use]
    pub fn has_pending(&self, broadcaster: BroadcasterId, kind: EventMask) -> bool
    {
        self.lock()
            .iter()
            .any(|event| event.broadcaster() == broadcaster && event.kind() == kind)
    }

    /// Drop every queued event without running removal hooks.
    pub fn clear(&self)
    {
        self.lock().clear();
    }

    pub(crate) fn push(&self, event: Event)
    {
        self.lock().push_back(event);
        self.inner.ready.notify_all();
    }

    /// Wait for the next event from any broadcaster.
    ///
    /// `None` as timeout waits forever. Returns `None` when the timeout
    /// elapsed without an event.
    pub fn wait_for_event(&self, timeout: Option<Duration>) -> Option<Event>
    {
        self.wait_matching(timeout, |_| true)
    }

    /// Wait for the next event delivered by `broadcaster`.
    pub fn wait_for_event_for_broadcaster(&self, broadcaster: BroadcasterId, timeout: Option<Duration>) -> Option<Event>
    {
        self.wait_matching(timeout, |event| event.broadcaster() == broadcaster)
    }

    /// Take the next event without blocking.
    pub fn try_next_event(&self) -> Option<Event>
    {
        self.wait_matching(Some(Duration::ZERO), |_| true)
    }

    fn wait_matching<F>(&self, timeout: Option<Duration>, matches: F) -> Option<Event>
    where
        F: Fn(&Event) -> bool,
    {
        let deadline = timeout.map(|timeout| Instant::now() + timeout);
        let mut queue = self.lock();
        let event = loop {
            if let Some(position) = queue.iter().position(&matches) {
                break queue.remove(position)?;
            }
            match deadline {
                None => {
                    queue = self.inner.ready.wait(queue).unwrap_or_else(PoisonError::into_inner);
                }
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return None;
                    }
                    queue = self
                        .inner
                        .ready
                        .wait_timeout(queue, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0;
                }
            }
        };
        drop(queue);
        event.do_on_removal();
        Some(event)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<Event>>
    {
        self.inner.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for Listener
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result
    {
        f.debug_struct("Listener")
            .field("name", &self.inner.name)
            .field("pending", &self.pending())
            .finish()
    }
}
