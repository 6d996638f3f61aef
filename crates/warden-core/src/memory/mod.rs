//! # Inferior Memory Helpers
//!
//! Two caches sit between the process and its backend:
//!
//! - [`MemoryCache`]: line-based read cache, thrown away on every stop and
//!   flushed range-wise before every write.
//! - [`AllocatedMemoryCache`]: pool of scratch blocks allocated in the
//!   inferior, keyed by permissions, carved into small chunks for expression
//!   evaluation.

pub mod allocated;
pub mod cache;

use std::fmt;
use std::ops::BitOr;

pub use allocated::AllocatedMemoryCache;
pub use cache::MemoryCache;

/// Memory protection bits of an inferior allocation or region
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Permissions(u8);

impl Permissions
{
    /// No access
    pub const NONE: Self = Permissions(0);
    /// Readable
    pub const READ: Self = Permissions(1);
    /// Writable
    pub const WRITE: Self = Permissions(2);
    /// Executable
    pub const EXECUTE: Self = Permissions(4);
    /// Readable and writable
    pub const READ_WRITE: Self = Permissions(3);

    /// Whether every bit of `other` is present.
    #[must_use]
    pub const fn contains(self, other: Permissions) -> bool
    {
        self.0 & other.0 == other.0
    }

    /// Raw bits.
    #[must_use]
    pub const fn bits(self) -> u8
    {
        self.0
    }
}

impl BitOr for Permissions
{
    type Output = Permissions;

    fn bitor(self, rhs: Self) -> Self::Output
    {
        Permissions(self.0 | rhs.0)
    }
}

impl fmt::Display for Permissions
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        let flag = |bit: Permissions, ch: char| if self.contains(bit) { ch } else { '-' };
        write!(
            f,
            "{}{}{}",
            flag(Permissions::READ, 'r'),
            flag(Permissions::WRITE, 'w'),
            flag(Permissions::EXECUTE, 'x')
        )
    }
}
