//! Data watchpoints.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::types::Address;

/// Identifier of a watchpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WatchpointId(u64);

impl WatchpointId
{
    /// Create a new identifier from a raw value.
    #[must_use]
    pub const fn from_raw(value: u64) -> Self
    {
        Self(value)
    }

    /// Raw numeric value.
    #[must_use]
    pub const fn raw(self) -> u64
    {
        self.0
    }
}

impl fmt::Display for WatchpointId
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        write!(f, "{}", self.0)
    }
}

/// Access type for data watchpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WatchpointAccess
{
    /// Trigger on read access to the watched memory region.
    Read,
    /// Trigger on write access to the watched memory region.
    Write,
    /// Trigger on either read or write access to the watched memory region.
    ReadWrite,
}

/// A watched memory range
///
/// Arming is done by the backend through `Process::enable_watchpoint`;
/// backends without debug-register support refuse.
#[derive(Debug)]
pub struct Watchpoint
{
    id: WatchpointId,
    address: Address,
    size: usize,
    access: WatchpointAccess,
    enabled: AtomicBool,
    hit_count: AtomicU32,
}

impl Watchpoint
{
    /// Create a disabled watchpoint.
    #[must_use]
    pub fn new(id: WatchpointId, address: Address, size: usize, access: WatchpointAccess) -> Self
    {
        Self {
            id,
            address,
            size,
            access,
            enabled: AtomicBool::new(false),
            hit_count: AtomicU32::new(0),
        }
    }

    /// Identifier.
    #[must_use]
    pub const fn id(&self) -> WatchpointId
    {
        self.id
    }

    /// First watched address.
    #[must_use]
    pub const fn address(&self) -> Address
    {
        self.address
    }

    /// Number of watched bytes.
    #[must_use]
    pub const fn size(&self) -> usize
    {
        self.size
    }

    /// Access that triggers the watchpoint.
    #[must_use]
    pub const fn access(&self) -> WatchpointAccess
    {
        self.access
    }

    /// Whether the backend armed it.
    #[must_use]
    pub fn is_enabled(&self) -> bool
    {
        self.enabled.load(Ordering::SeqCst)
    }

    pub(crate) fn set_enabled(&self, enabled: bool)
    {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    /// Number of triggers.
    #[must_use]
    pub fn hit_count(&self) -> u32
    {
        self.hit_count.load(Ordering::SeqCst)
    }

    pub(crate) fn record_hit(&self)
    {
        self.hit_count.fetch_add(1, Ordering::SeqCst);
    }
}

/// Watchpoints owned by a target
#[derive(Debug, Default)]
pub struct WatchpointList
{
    next_id: AtomicU64,
    watchpoints: Mutex<BTreeMap<WatchpointId, Arc<Watchpoint>>>,
}

impl WatchpointList
{
    /// Empty list.
    #[must_use]
    pub fn new() -> Self
    {
        Self::default()
    }

    /// Create and register a watchpoint.
    pub fn create(&self, address: Address, size: usize, access: WatchpointAccess) -> Arc<Watchpoint>
    {
        let id = WatchpointId::from_raw(self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
        let watchpoint = Arc::new(Watchpoint::new(id, address, size, access));
        self.lock().insert(id, Arc::clone(&watchpoint));
        watchpoint
    }

    /// Watchpoint by id.
    #[must_use]
    pub fn find(&self, id: WatchpointId) -> Option<Arc<Watchpoint>>
    {
        self.lock().get(&id).cloned()
    }

    /// Unregister a watchpoint.
    pub fn remove(&self, id: WatchpointId) -> Option<Arc<Watchpoint>>
    {
        self.lock().remove(&id)
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<WatchpointId, Arc<Watchpoint>>>
    {
        self.watchpoints.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
