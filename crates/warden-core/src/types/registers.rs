//! Register context for a single thread.

use super::{Address, Architecture};

/// Register selector used by ABIs and register-backed values
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RegisterId
{
    /// Program counter
    Pc,
    /// Stack pointer
    Sp,
    /// Frame pointer
    Fp,
    /// Status / flags register
    Status,
    /// General-purpose register by index into [`Registers::general`]
    General(usize),
}

/// x86-64 general-purpose register numbering used by [`Registers::general`].
pub mod x86_64
{
    /// RAX
    pub const RAX: usize = 0;
    /// RBX
    pub const RBX: usize = 1;
    /// RCX
    pub const RCX: usize = 2;
    /// RDX
    pub const RDX: usize = 3;
    /// RSI
    pub const RSI: usize = 4;
    /// RDI
    pub const RDI: usize = 5;
    /// R8
    pub const R8: usize = 6;
    /// R9
    pub const R9: usize = 7;
    /// Number of general registers modelled (RAX..R15 without RSP/RBP)
    pub const GENERAL_COUNT: usize = 14;
}

/// Snapshot of a thread's registers
///
/// Backends fill this in when a thread stops; thread plans save and restore
/// whole snapshots around function calls.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registers
{
    /// Program counter: address of the next instruction to execute
    pub pc: Address,
    /// Stack pointer
    pub sp: Address,
    /// Frame pointer
    pub fp: Address,
    /// General-purpose registers (architecture numbering, see [`x86_64`])
    pub general: Vec<u64>,
    /// Status/flags register
    pub status: u64,
    architecture: Architecture,
}

impl Registers
{
    /// Zeroed register file for `architecture`.
    #[must_use]
    pub fn new(architecture: Architecture) -> Self
    {
        let count = match architecture {
            Architecture::X86_64 => x86_64::GENERAL_COUNT,
            Architecture::Arm64 => 31,
            Architecture::Unknown(_) => 0,
        };
        Self {
            pc: Address::ZERO,
            sp: Address::ZERO,
            fp: Address::ZERO,
            general: vec![0; count],
            status: 0,
            architecture,
        }
    }

    /// Architecture these registers belong to.
    #[must_use]
    pub const fn architecture(&self) -> Architecture
    {
        self.architecture
    }

    /// Read a register, `None` if the index is out of range.
    #[must_use]
    pub fn get(&self, id: RegisterId) -> Option<u64>
    {
        match id {
            RegisterId::Pc => Some(self.pc.value()),
            RegisterId::Sp => Some(self.sp.value()),
            RegisterId::Fp => Some(self.fp.value()),
            RegisterId::Status => Some(self.status),
            RegisterId::General(index) => self.general.get(index).copied(),
        }
    }

    /// Write a register, `None` if the index is out of range.
    pub fn set(&mut self, id: RegisterId, value: u64) -> Option<()>
    {
        match id {
            RegisterId::Pc => self.pc = Address::new(value),
            RegisterId::Sp => self.sp = Address::new(value),
            RegisterId::Fp => self.fp = Address::new(value),
            RegisterId::Status => self.status = value,
            RegisterId::General(index) => *self.general.get_mut(index)? = value,
        }
        Some(())
    }
}
