//! Load-address newtype.

use std::fmt;
use std::ops::{Add, Sub};

/// Strongly typed load address in the inferior
///
/// Wrapping the raw `u64` keeps addresses from being mixed up with sizes,
/// offsets, and counters that flow through the same APIs (memory reads take
/// an `Address` and a `usize`, never two integers).
///
/// ## Example
///
/// ```rust
/// use warden_core::types::Address;
///
/// let addr = Address::from(0x1000);
/// assert_eq!((addr + 0x10).value(), 0x1010);
/// assert_eq!(addr.align_up(0x400), Address::new(0x1000));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Address(u64);

impl Address
{
    /// The null address (0x0)
    pub const ZERO: Self = Address(0);

    /// Sentinel used where an address could not be resolved
    pub const INVALID: Self = Address(u64::MAX);

    /// Create a new address from a `u64` value (usable in const contexts)
    #[must_use]
    pub const fn new(value: u64) -> Self
    {
        Address(value)
    }

    /// Raw `u64` value of this address
    #[must_use]
    pub const fn value(self) -> u64
    {
        self.0
    }

    /// Whether this is anything other than [`Address::INVALID`]
    #[must_use]
    pub const fn is_valid(self) -> bool
    {
        self.0 != u64::MAX
    }

    /// Add an offset, returning `None` on overflow
    #[must_use]
    pub fn checked_add(self, offset: u64) -> Option<Self>
    {
        self.0.checked_add(offset).map(Address)
    }

    /// Subtract an offset, returning `None` on underflow
    #[must_use]
    pub fn checked_sub(self, offset: u64) -> Option<Self>
    {
        self.0.checked_sub(offset).map(Address)
    }

    /// Add an offset, saturating at `u64::MAX`
    #[must_use]
    pub fn saturating_add(self, offset: u64) -> Self
    {
        Address(self.0.saturating_add(offset))
    }

    /// Distance in bytes from `base` up to this address
    ///
    /// Returns `None` when `base` lies above `self`.
    #[must_use]
    pub fn offset_from(self, base: Address) -> Option<u64>
    {
        self.0.checked_sub(base.0)
    }

    /// Round down to a multiple of `alignment` (which must be a power of two)
    #[must_use]
    pub const fn align_down(self, alignment: u64) -> Self
    {
        if alignment <= 1 {
            return self;
        }
        Address(self.0 & !(alignment - 1))
    }

    /// Round up to a multiple of `alignment` (which must be a power of two)
    #[must_use]
    pub const fn align_up(self, alignment: u64) -> Self
    {
        if alignment <= 1 {
            return self;
        }
        Address(self.0.wrapping_add(alignment - 1) & !(alignment - 1))
    }
}

impl From<u64> for Address
{
    fn from(value: u64) -> Self
    {
        Address(value)
    }
}

impl From<Address> for u64
{
    fn from(address: Address) -> Self
    {
        address.0
    }
}

impl fmt::Display for Address
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        write!(f, "0x{:016x}", self.0)
    }
}

impl fmt::LowerHex for Address
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        fmt::LowerHex::fmt(&self.0, f)
    }
}

impl Add<u64> for Address
{
    type Output = Address;

    fn add(self, rhs: u64) -> Self::Output
    {
        Address(self.0.wrapping_add(rhs))
    }
}

impl Sub<u64> for Address
{
    type Output = Address;

    fn sub(self, rhs: u64) -> Self::Output
    {
        Address(self.0.wrapping_sub(rhs))
    }
}
