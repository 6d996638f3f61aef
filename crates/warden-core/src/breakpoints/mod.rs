//! # Breakpoints
//!
//! Two layers live here:
//!
//! - **Logical breakpoints** ([`Breakpoint`], [`BreakpointLocation`]): what a
//!   client asked for. A breakpoint resolves to one location per address it
//!   matches; locations carry ignore counts, conditions, and callbacks.
//! - **Breakpoint sites** ([`BreakpointSite`], [`BreakpointSiteList`]): the
//!   runtime object that actually patches inferior memory. Locations that
//!   resolve to the same load address share one site; the site goes away
//!   when its last owner is removed.
//!
//! The read/verify/write protocol that plants and removes trap opcodes lives
//! on [`Process`](crate::process::Process) because it needs the backend.

pub mod site;
pub mod site_list;
pub mod watchpoint;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

pub use site::{BreakpointSite, BreakpointSiteId, SiteIntersection, SiteKind};
pub use site_list::BreakpointSiteList;
pub use watchpoint::{Watchpoint, WatchpointAccess, WatchpointId, WatchpointList};

use crate::process::Process;
use crate::thread::Thread;
use crate::types::Address;

/// Unique identifier for a logical breakpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BreakpointId(u64);

impl BreakpointId
{
    /// Create a new identifier from a raw value.
    #[must_use]
    pub const fn from_raw(value: u64) -> Self
    {
        Self(value)
    }

    /// Get the raw numeric representation (useful for logging / errors).
    #[must_use]
    pub const fn raw(self) -> u64
    {
        self.0
    }
}

impl fmt::Display for BreakpointId
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a location within its breakpoint (1-based).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LocationId(u32);

impl LocationId
{
    /// Create a new identifier from a raw value.
    #[must_use]
    pub const fn from_raw(value: u32) -> Self
    {
        Self(value)
    }

    /// Raw numeric value.
    #[must_use]
    pub const fn raw(self) -> u32
    {
        self.0
    }
}

/// What a breakpoint callback or condition gets to look at
pub struct StoppointCallbackContext
{
    /// Process that stopped
    pub process: Arc<Process>,
    /// Thread that hit the stoppoint
    pub thread: Option<Arc<Thread>>,
    /// Whether the callback runs inside the stop vote (before clients see the stop)
    pub is_synchronous: bool,
}

/// Breakpoint hit notification.
///
/// Called with the context, the breakpoint id, and the location id. The
/// return value decides whether the stop is surfaced: `false` lets the
/// process continue silently.
pub type BreakpointCallback = Arc<dyn Fn(&StoppointCallbackContext, BreakpointId, LocationId) -> bool + Send + Sync>;

/// Breakpoint condition; the location only stops when it returns `true`.
pub type BreakpointCondition = Arc<dyn Fn(&StoppointCallbackContext) -> bool + Send + Sync>;

/// Per-location stop options
#[derive(Clone)]
pub struct BreakpointOptions
{
    /// Whether the location participates at all
    pub enabled: bool,
    /// Number of hits to skip before stopping
    pub ignore_count: u32,
    /// Only stop on the thread with this index id
    pub thread_index_id: Option<u32>,
    /// Optional condition
    pub condition: Option<BreakpointCondition>,
    /// Optional hit callback
    pub callback: Option<BreakpointCallback>,
    /// Run the callback inside the stop vote instead of when the stop is delivered
    pub callback_is_synchronous: bool,
}

impl Default for BreakpointOptions
{
    fn default() -> Self
    {
        Self {
            enabled: true,
            ignore_count: 0,
            thread_index_id: None,
            condition: None,
            callback: None,
            callback_is_synchronous: false,
        }
    }
}

impl fmt::Debug for BreakpointOptions
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        f.debug_struct("BreakpointOptions")
            .field("enabled", &self.enabled)
            .field("ignore_count", &self.ignore_count)
            .field("thread_index_id", &self.thread_index_id)
            .field("has_condition", &self.condition.is_some())
            .field("has_callback", &self.callback.is_some())
            .field("callback_is_synchronous", &self.callback_is_synchronous)
            .finish()
    }
}

/// One resolved address of a logical breakpoint
///
/// Locations are the owners of breakpoint sites.
#[derive(Debug)]
pub struct BreakpointLocation
{
    breakpoint_id: BreakpointId,
    id: LocationId,
    address: Address,
    internal: bool,
    options: Mutex<BreakpointOptions>,
    hit_count: AtomicU32,
    site: Mutex<Option<BreakpointSiteId>>,
}

impl BreakpointLocation
{
    /// Create a location of `breakpoint_id` at `address`.
    #[must_use]
    pub fn new(breakpoint_id: BreakpointId, id: LocationId, address: Address, internal: bool) -> Self
    {
        Self {
            breakpoint_id,
            id,
            address,
            internal,
            options: Mutex::new(BreakpointOptions::default()),
            hit_count: AtomicU32::new(0),
            site: Mutex::new(None),
        }
    }

    /// Owning breakpoint.
    #[must_use]
    pub const fn breakpoint_id(&self) -> BreakpointId
    {
        self.breakpoint_id
    }

    /// Id within the owning breakpoint.
    #[must_use]
    pub const fn id(&self) -> LocationId
    {
        self.id
    }

    /// Load address of the location.
    #[must_use]
    pub const fn address(&self) -> Address
    {
        self.address
    }

    /// Internal locations (stepping helpers, loader hooks) are never shown to clients.
    #[must_use]
    pub const fn is_internal(&self) -> bool
    {
        self.internal
    }

    /// How often the location was hit while enabled.
    #[must_use]
    pub fn hit_count(&self) -> u32
    {
        self.hit_count.load(Ordering::SeqCst)
    }

    /// Snapshot of the options.
    #[must_use]
    pub fn options(&self) -> BreakpointOptions
    {
        self.lock_options().clone()
    }

    /// Change the options in place.
    pub fn update_options<F>(&self, update: F)
    where
        F: FnOnce(&mut BreakpointOptions),
    {
        update(&mut self.lock_options());
    }

    /// Site currently backing this location.
    #[must_use]
    pub fn site_id(&self) -> Option<BreakpointSiteId>
    {
        *self.site.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn set_site_id(&self, site: Option<BreakpointSiteId>)
    {
        *self.site.lock().unwrap_or_else(PoisonError::into_inner) = site;
    }

    /// Vote on whether a hit of this location should stop the process.
    ///
    /// Counts the hit, burns one ignore count, evaluates the condition, and
    /// runs a synchronous callback.
    pub fn should_stop(&self, context: &StoppointCallbackContext) -> bool
    {
        let (condition, callback) = {
            let mut options = self.lock_options();
            if !options.enabled {
                return false;
            }
            if let (Some(wanted), Some(thread)) = (options.thread_index_id, &context.thread) {
                if wanted != thread.index_id() {
                    return false;
                }
            }
            self.hit_count.fetch_add(1, Ordering::SeqCst);
            if options.ignore_count > 0 {
                options.ignore_count -= 1;
                return false;
            }
            let callback = if options.callback_is_synchronous {
                options.callback.clone()
            } else {
                None
            };
            (options.condition.clone(), callback)
        };

        if let Some(condition) = condition {
            if !condition(context) {
                return false;
            }
        }
        match callback {
            Some(callback) => {
                let sync_context = StoppointCallbackContext {
                    process: Arc::clone(&context.process),
                    thread: context.thread.clone(),
                    is_synchronous: true,
                };
                callback(&sync_context, self.breakpoint_id, self.id)
            }
            None => true,
        }
    }

    /// Run the asynchronous callback, if any. Returns whether the stop should stand.
    pub fn invoke_async_callback(&self, context: &StoppointCallbackContext) -> bool
    {
        let callback = {
            let options = self.lock_options();
            if options.callback_is_synchronous {
                None
            } else {
                options.callback.clone()
            }
        };
        callback.is_none_or(|callback| callback(context, self.breakpoint_id, self.id))
    }

    fn lock_options(&self) -> MutexGuard<'_, BreakpointOptions>
    {
        self.options.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A client-level breakpoint and its resolved locations
#[derive(Debug)]
pub struct Breakpoint
{
    id: BreakpointId,
    internal: bool,
    hardware: bool,
    locations: Mutex<Vec<Arc<BreakpointLocation>>>,
}

impl Breakpoint
{
    /// Create a breakpoint without locations.
    #[must_use]
    pub fn new(id: BreakpointId, internal: bool, hardware: bool) -> Self
    {
        Self {
            id,
            internal,
            hardware,
            locations: Mutex::new(Vec::new()),
        }
    }

    /// Identifier.
    #[must_use]
    pub const fn id(&self) -> BreakpointId
    {
        self.id
    }

    /// Whether this breakpoint is an internal one.
    #[must_use]
    pub const fn is_internal(&self) -> bool
    {
        self.internal
    }

    /// Whether sites should use hardware slots.
    #[must_use]
    pub const fn is_hardware(&self) -> bool
    {
        self.hardware
    }

    /// Add a location at `address`, returning the existing one when already present.
    pub fn add_location(&self, address: Address) -> Arc<BreakpointLocation>
    {
        let mut locations = self.locations.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = locations.iter().find(|location| location.address() == address) {
            return Arc::clone(existing);
        }
        let id = LocationId::from_raw(locations.len() as u32 + 1);
        let location = Arc::new(BreakpointLocation::new(self.id, id, address, self.internal));
        locations.push(Arc::clone(&location));
        location
    }

    /// All locations in creation order.
    #[must_use]
    pub fn locations(&self) -> Vec<Arc<BreakpointLocation>>
    {
        self.locations.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Location by id.
    #[must_use]
    pub fn location(&self, id: LocationId) -> Option<Arc<BreakpointLocation>>
    {
        self.locations().into_iter().find(|location| location.id() == id)
    }

    /// Apply `update` to the options of every location.
    pub fn update_options<F>(&self, update: F)
    where
        F: Fn(&mut BreakpointOptions),
    {
        for location in self.locations() {
            location.update_options(&update);
        }
    }

    /// Total hits across locations.
    #[must_use]
    pub fn hit_count(&self) -> u32
    {
        self.locations().iter().map(|location| location.hit_count()).sum()
    }
}

/// Breakpoints owned by a target
#[derive(Debug, Default)]
pub struct BreakpointList
{
    next_id: AtomicU64,
    breakpoints: Mutex<BTreeMap<BreakpointId, Arc<Breakpoint>>>,
}

impl BreakpointList
{
    /// Empty list.
    #[must_use]
    pub fn new() -> Self
    {
        Self::default()
    }

    /// Create and register a breakpoint with a fresh id.
    pub fn create(&self, internal: bool, hardware: bool) -> Arc<Breakpoint>
    {
        let id = BreakpointId::from_raw(self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
        let breakpoint = Arc::new(Breakpoint::new(id, internal, hardware));
        self.lock().insert(id, Arc::clone(&breakpoint));
        breakpoint
    }

    /// Breakpoint by id.
    #[must_use]
    pub fn find(&self, id: BreakpointId) -> Option<Arc<Breakpoint>>
    {
        self.lock().get(&id).cloned()
    }

    /// Unregister a breakpoint.
    pub fn remove(&self, id: BreakpointId) -> Option<Arc<Breakpoint>>
    {
        self.lock().remove(&id)
    }

    /// All breakpoints in id order.
    #[must_use]
    pub fn breakpoints(&self) -> Vec<Arc<Breakpoint>>
    {
        self.lock().values().cloned().collect()
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<BreakpointId, Arc<Breakpoint>>>
    {
        self.breakpoints.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
