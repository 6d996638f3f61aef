//! A single trapped load address.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use smallvec::SmallVec;

use super::{BreakpointId, BreakpointLocation, LocationId, StoppointCallbackContext};
use crate::types::Address;

/// Longest trap opcode of any supported architecture
pub const MAX_TRAP_OPCODE_SIZE: usize = 8;

/// Opcode storage; every supported trap fits inline.
pub type OpcodeBytes = SmallVec<[u8; MAX_TRAP_OPCODE_SIZE]>;

/// Identifier of a breakpoint site.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BreakpointSiteId(u64);

impl BreakpointSiteId
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

impl fmt::Display for BreakpointSiteId
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        write!(f, "{}", self.0)
    }
}

/// How the site is armed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SiteKind
{
    /// Trap opcode patched into memory
    Software,
    /// CPU debug register; memory untouched
    Hardware,
}

/// Overlap of a memory range with a site's trap bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SiteIntersection
{
    /// First overlapped address
    pub address: Address,
    /// Number of overlapped bytes
    pub size: usize,
    /// Offset of `address` within the trap opcode
    pub opcode_offset: usize,
}

#[derive(Debug)]
struct SiteState
{
    enabled: bool,
    kind: SiteKind,
    saved_opcode: OpcodeBytes,
    owners: SmallVec<[Arc<BreakpointLocation>; 2]>,
    hit_count: u32,
    hardware_index: Option<u32>,
}

/// Runtime object that traps one load address for one or more locations
///
/// The trap opcode is fixed at creation; the saved opcode holds the bytes the
/// trap displaced and is what clients see when they read the site's range.
#[derive(Debug)]
pub struct BreakpointSite
{
    id: BreakpointSiteId,
    address: Address,
    trap_opcode: OpcodeBytes,
    state: Mutex<SiteState>,
}

impl BreakpointSite
{
    /// Create a disabled site owned by `owner`.
    #[must_use]
    pub fn new(
        id: BreakpointSiteId,
        address: Address,
        trap_opcode: &[u8],
        owner: Arc<BreakpointLocation>,
        use_hardware: bool,
    ) -> Self
    {
        let mut owners = SmallVec::new();
        owners.push(owner);
        Self {
            id,
            address,
            trap_opcode: OpcodeBytes::from_slice(trap_opcode),
            state: Mutex::new(SiteState {
                enabled: false,
                kind: if use_hardware {
                    SiteKind::Hardware
                } else {
                    SiteKind::Software
                },
                saved_opcode: OpcodeBytes::new(),
                owners,
                hit_count: 0,
                hardware_index: None,
            }),
        }
    }

    /// Site id.
    #[must_use]
    pub const fn id(&self) -> BreakpointSiteId
    {
        self.id
    }

    /// Trapped load address.
    #[must_use]
    pub const fn load_address(&self) -> Address
    {
        self.address
    }

    /// Size of the trap in bytes.
    #[must_use]
    pub fn byte_size(&self) -> usize
    {
        self.trap_opcode.len()
    }

    /// Trap opcode bytes.
    #[must_use]
    pub fn trap_opcode(&self) -> &[u8]
    {
        &self.trap_opcode
    }

    /// Bytes displaced by the trap.
    #[must_use]
    pub fn saved_opcode(&self) -> OpcodeBytes
    {
        self.lock().saved_opcode.clone()
    }

    /// Replace the saved bytes.
    pub fn set_saved_opcode(&self, bytes: &[u8])
    {
        self.lock().saved_opcode = OpcodeBytes::from_slice(bytes);
    }

    /// Overwrite part of the saved bytes, starting at `offset` within the trap.
    ///
    /// Used when a client writes into the range of an armed trap.
    pub fn patch_saved_opcode(&self, offset: usize, bytes: &[u8])
    {
        let mut state = self.lock();
        let end = offset + bytes.len();
        if state.saved_opcode.len() < end {
            state.saved_opcode.resize(end, 0);
        }
        state.saved_opcode[offset..end].copy_from_slice(bytes);
    }

    /// Whether the trap is currently armed.
    #[must_use]
    pub fn is_enabled(&self) -> bool
    {
        self.lock().enabled
    }

    /// Record whether the trap is armed.
    pub fn set_enabled(&self, enabled: bool)
    {
        self.lock().enabled = enabled;
    }

    /// How the site is armed.
    #[must_use]
    pub fn kind(&self) -> SiteKind
    {
        self.lock().kind
    }

    /// Switch between software and hardware arming.
    pub fn set_kind(&self, kind: SiteKind)
    {
        self.lock().kind = kind;
    }

    /// Whether this is a hardware site.
    #[must_use]
    pub fn is_hardware(&self) -> bool
    {
        self.kind() == SiteKind::Hardware
    }

    /// Debug-register slot used by a hardware site.
    #[must_use]
    pub fn hardware_index(&self) -> Option<u32>
    {
        self.lock().hardware_index
    }

    /// Record the debug-register slot.
    pub fn set_hardware_index(&self, index: Option<u32>)
    {
        self.lock().hardware_index = index;
    }

    /// Number of times the site trapped.
    #[must_use]
    pub fn hit_count(&self) -> u32
    {
        self.lock().hit_count
    }

    /// Owning locations.
    #[must_use]
    pub fn owners(&self) -> Vec<Arc<BreakpointLocation>>
    {
        self.lock().owners.to_vec()
    }

    /// Number of owning locations.
    #[must_use]
    pub fn owner_count(&self) -> usize
    {
        self.lock().owners.len()
    }

    /// Add an owner. Returns the new owner count.
    pub fn add_owner(&self, owner: Arc<BreakpointLocation>) -> usize
    {
        let mut state = self.lock();
        if !state
            .owners
            .iter()
            .any(|existing| Arc::ptr_eq(existing, &owner))
        {
            state.owners.push(owner);
        }
        state.owners.len()
    }

    /// Remove the owner identified by breakpoint and location id. Returns the remaining count.
    pub fn remove_owner(&self, breakpoint_id: BreakpointId, location_id: LocationId) -> usize
    {
        let mut state = self.lock();
        state
            .owners
            .retain(|owner| !(owner.breakpoint_id() == breakpoint_id && owner.id() == location_id));
        state.owners.len()
    }

    /// Whether every owner is internal.
    #[must_use]
    pub fn is_internal(&self) -> bool
    {
        self.lock().owners.iter().all(|owner| owner.is_internal())
    }

    /// Count a hit and collect the owners' votes. Every owner is consulted.
    pub fn should_stop(&self, context: &StoppointCallbackContext) -> bool
    {
        let owners = {
            let mut state = self.lock();
            state.hit_count = state.hit_count.saturating_add(1);
            state.owners.to_vec()
        };
        owners
            .iter()
            .fold(false, |stop, owner| owner.should_stop(context) || stop)
    }

    /// Overlap of `[address, address + size)` with the trap bytes, if any.
    #[must_use]
    pub fn intersects_range(&self, address: Address, size: usize) -> Option<SiteIntersection>
    {
        let site_start = self.address.value();
        let site_end = site_start + self.byte_size() as u64;
        let start = address.value();
        let end = start.saturating_add(size as u64);
        if size == 0 || self.byte_size() == 0 || end <= site_start || start >= site_end {
            return None;
        }
        let overlap_start = start.max(site_start);
        let overlap_end = end.min(site_end);
        Some(SiteIntersection {
            address: Address::new(overlap_start),
            size: (overlap_end - overlap_start) as usize,
            opcode_offset: (overlap_start - site_start) as usize,
        })
    }

    fn lock(&self) -> MutexGuard<'_, SiteState>
    {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
