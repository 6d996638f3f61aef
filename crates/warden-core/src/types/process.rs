//! Process, thread, and architecture identifiers.

use std::fmt;

/// Process identifier (PID)
///
/// Assigned externally by the operating system or a remote stub. A process
/// that has not been launched or attached yet has no id.
///
/// ## Example
///
/// ```rust
/// use warden_core::types::ProcessId;
///
/// let pid = ProcessId::from(4242);
/// assert_eq!(u32::from(pid), 4242);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProcessId(pub u32);

impl From<u32> for ProcessId
{
    fn from(pid: u32) -> Self
    {
        ProcessId(pid)
    }
}

impl From<ProcessId> for u32
{
    fn from(pid: ProcessId) -> Self
    {
        pid.0
    }
}

impl fmt::Display for ProcessId
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        write!(f, "{}", self.0)
    }
}

/// Backend thread identifier
///
/// This is the id the operating system or stub uses (a Linux TID, a Mach
/// thread port). It is *not* stable across thread-list rebuilds; the
/// debugger-assigned index id on [`Thread`](crate::thread::Thread) is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ThreadId(pub u64);

impl ThreadId
{
    /// Get the raw numeric representation.
    #[must_use]
    pub const fn raw(self) -> u64
    {
        self.0
    }
}

impl From<u64> for ThreadId
{
    fn from(tid: u64) -> Self
    {
        ThreadId(tid)
    }
}

impl fmt::Display for ThreadId
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        write!(f, "0x{:x}", self.0)
    }
}

/// Byte order of the inferior
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ByteOrder
{
    /// Least significant byte first
    Little,
    /// Most significant byte first
    Big,
}

impl ByteOrder
{
    /// Encode the low `size` bytes of `value` in this byte order.
    #[must_use]
    pub fn encode(self, value: u64, size: usize) -> Vec<u8>
    {
        let size = size.min(8);
        match self {
            ByteOrder::Little => value.to_le_bytes()[..size].to_vec(),
            ByteOrder::Big => value.to_be_bytes()[8 - size..].to_vec(),
        }
    }

    /// Decode up to eight bytes as an unsigned integer.
    #[must_use]
    pub fn decode(self, bytes: &[u8]) -> u64
    {
        let bytes = &bytes[..bytes.len().min(8)];
        match self {
            ByteOrder::Little => bytes.iter().rev().fold(0u64, |acc, byte| (acc << 8) | u64::from(*byte)),
            ByteOrder::Big => bytes.iter().fold(0u64, |acc, byte| (acc << 8) | u64::from(*byte)),
        }
    }
}

/// CPU architecture of the inferior
///
/// The architecture decides pointer width, byte order, and the software trap
/// opcode planted by breakpoint sites.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Architecture
{
    /// 64-bit ARM (AArch64). Trap opcode: `BRK #0`.
    Arm64,
    /// 64-bit x86 (Intel/AMD). Trap opcode: `INT3`.
    X86_64,
    /// Any other architecture (or unknown)
    Unknown(&'static str),
}

/// `INT3` on x86-64
const X86_64_TRAP_OPCODE: &[u8] = &[0xcc];

/// `BRK #0` on AArch64, little endian
const ARM64_TRAP_OPCODE: &[u8] = &[0x00, 0x00, 0x20, 0xd4];

impl Architecture
{
    /// Architecture of the running debugger binary.
    #[must_use]
    pub const fn current() -> Self
    {
        #[cfg(target_arch = "aarch64")]
        {
            Architecture::Arm64
        }
        #[cfg(target_arch = "x86_64")]
        {
            Architecture::X86_64
        }
        #[cfg(not(any(target_arch = "aarch64", target_arch = "x86_64")))]
        {
            Architecture::Unknown(std::env::consts::ARCH)
        }
    }

    /// Size of a pointer in the inferior, in bytes.
    #[must_use]
    pub const fn address_byte_size(self) -> usize
    {
        8
    }

    /// Byte order used for scalars in the inferior.
    #[must_use]
    pub const fn byte_order(self) -> ByteOrder
    {
        ByteOrder::Little
    }

    /// Trap instruction a software breakpoint plants in memory.
    ///
    /// Unknown architectures have no trap opcode and cannot host software
    /// breakpoint sites.
    #[must_use]
    pub const fn software_trap_opcode(self) -> &'static [u8]
    {
        match self {
            Architecture::X86_64 => X86_64_TRAP_OPCODE,
            Architecture::Arm64 => ARM64_TRAP_OPCODE,
            Architecture::Unknown(_) => &[],
        }
    }

    /// Map an `object` crate architecture onto ours.
    #[must_use]
    pub fn from_object(arch: object::Architecture) -> Self
    {
        match arch {
            object::Architecture::X86_64 => Architecture::X86_64,
            object::Architecture::Aarch64 => Architecture::Arm64,
            _ => Architecture::Unknown("unknown"),
        }
    }
}

impl fmt::Display for Architecture
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        match self {
            Architecture::Arm64 => write!(f, "arm64"),
            Architecture::X86_64 => write!(f, "x86_64"),
            Architecture::Unknown(name) => write!(f, "{name}"),
        }
    }
}
