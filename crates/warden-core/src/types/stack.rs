//! Stack frame identity.

use super::Address;

/// Stable identity of a stack frame
///
/// Frame objects are rebuilt every time a thread stops; the pair of the
/// frame's start pc and its canonical frame address (CFA) survives those
/// rebuilds and is what callers use to re-find "the same" frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StackId
{
    /// Program counter of the frame
    pub pc: Address,
    /// Canonical frame address
    pub cfa: Address,
}

impl StackId
{
    /// Build a stack id from its parts.
    #[must_use]
    pub const fn new(pc: Address, cfa: Address) -> Self
    {
        Self { pc, cfa }
    }
}

/// One frame of a thread's call stack
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StackFrame
{
    /// Depth in the stack (0 is the innermost frame)
    pub index: usize,
    /// Stable identity of the frame
    pub id: StackId,
}
