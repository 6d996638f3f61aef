//! # Calling Conventions
//!
//! An [`Abi`] knows how to set up a call into the inferior and where
//! arguments and return values live. Only integer and pointer arguments
//! passed in registers or on the stack are modelled.

use tracing::trace;

use crate::error::{WardenError, WardenResult};
use crate::thread::Thread;
use crate::types::registers::x86_64;
use crate::types::{Address, RegisterId};

/// Calling convention of a platform
pub trait Abi: Send + Sync
{
    fn name(&self) -> &'static str;

    /// Bytes below the stack pointer a leaf function may use.
    fn red_zone_size(&self) -> u64;

    /// Required stack alignment at a call site.
    fn stack_alignment(&self) -> u64;

    /// Lay out a call of `function(args...)` on `thread` with the stack at
    /// `sp`, returning to `return_address`.
    fn prepare_trivial_call(
        &self,
        thread: &Thread,
        sp: Address,
        function: Address,
        return_address: Address,
        args: &[u64],
    ) -> WardenResult<()>;

    /// The first `count` integer arguments of the current function.
    fn get_argument_values(&self, thread: &Thread, count: usize) -> WardenResult<Vec<u64>>;

    /// Integer return value after a call returned.
    fn get_return_value(&self, thread: &Thread) -> WardenResult<u64>;

    /// Force the integer return value.
    fn set_return_value(&self, thread: &Thread, value: u64) -> WardenResult<()>;
}

const SYSV_ARGUMENT_REGISTERS: [usize; 6] = [
    x86_64::RDI,
    x86_64::RSI,
    x86_64::RDX,
    x86_64::RCX,
    x86_64::R8,
    x86_64::R9,
];

/// System V AMD64 calling convention
#[derive(Debug, Default, Clone, Copy)]
pub struct SysVAbi;

impl Abi for SysVAbi
{
    fn name(&self) -> &'static str
    {
        "sysv-x86_64"
    }

    fn red_zone_size(&self) -> u64
    {
        128
    }

    fn stack_alignment(&self) -> u64
    {
        16
    }

    fn prepare_trivial_call(
        &self,
        thread: &Thread,
        sp: Address,
        function: Address,
        return_address: Address,
        args: &[u64],
    ) -> WardenResult<()>
    {
        if args.len() > SYSV_ARGUMENT_REGISTERS.len() {
            return Err(WardenError::Unsupported(format!(
                "{} takes at most {} register arguments, got {}",
                self.name(),
                SYSV_ARGUMENT_REGISTERS.len(),
                args.len()
            )));
        }
        let process = thread.process().ok_or(WardenError::NotAttached)?;

        // The callee sees the return address on top of a 16-byte aligned stack.
        let sp = sp.align_down(self.stack_alignment());
        let sp = sp
            .checked_sub(8)
            .ok_or_else(|| WardenError::InvalidArgument("stack pointer underflow".to_string()))?;
        process.write_pointer_to_memory(sp, return_address)?;

        let mut registers = thread.registers();
        for (register, value) in SYSV_ARGUMENT_REGISTERS.iter().zip(args) {
            registers
                .set(RegisterId::General(*register), *value)
                .ok_or_else(|| WardenError::InvalidArgument(format!("{} registers on a non-x86-64 thread", self.name())))?;
        }
        registers.sp = sp;
        registers.pc = function;
        thread.set_registers(registers);
        trace!(thread = thread.index_id(), %function, %sp, %return_address, "trivial call prepared");
        Ok(())
    }

    fn get_argument_values(&self, thread: &Thread, count: usize) -> WardenResult<Vec<u64>>
    {
        let registers = thread.registers();
        let mut values = Vec::with_capacity(count);
        for index in 0..count {
            if let Some(register) = SYSV_ARGUMENT_REGISTERS.get(index) {
                values.push(thread.read_register(RegisterId::General(*register))?);
                continue;
            }
            // Stack arguments start above the return address.
            let process = thread.process().ok_or(WardenError::NotAttached)?;
            let slot = (index - SYSV_ARGUMENT_REGISTERS.len()) as u64;
            let address = registers.sp + 8 + slot * 8;
            values.push(process.read_pointer_from_memory(address)?.value());
        }
        Ok(values)
    }

    fn get_return_value(&self, thread: &Thread) -> WardenResult<u64>
    {
        thread.read_register(RegisterId::General(x86_64::RAX))
    }

    fn set_return_value(&self, thread: &Thread, value: u64) -> WardenResult<()>
    {
        thread.write_register(RegisterId::General(x86_64::RAX), value)
    }
}
