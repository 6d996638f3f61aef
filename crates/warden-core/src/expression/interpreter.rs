//! # IR Interpreter
//!
//! Evaluates simple expressions against process memory without resuming
//! the inferior.
//!
//! The IR is a straight-line SSA form: each instruction defines at most one
//! local, operands are constants, locals, or the argument (the address of
//! the materialized struct). Anything that would need the inferior to run,
//! such as a call, makes the function uninterpretable; the caller then
//! falls back to running the code for real.
//!
//! Values are 64-bit; loads and stores truncate or zero-extend to the
//! access size. Stack slots from `Alloca` are carved out of one scratch
//! block allocated in the inferior for the duration of the run.

use std::fmt;

use tracing::{debug, trace, warn};

use crate::error::{WardenError, WardenResult};
use crate::memory::Permissions;
use crate::process::Process;
use crate::types::Address;

/// Index of an SSA local
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Local(pub usize);

/// Instruction operand
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operand
{
    Const(u64),
    Local(Local),
    /// Address of the materialized argument struct
    Argument,
}

/// Integer binary operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp
{
    Add,
    Sub,
    Mul,
    UDiv,
    SDiv,
    URem,
    SRem,
    And,
    Or,
    Xor,
    Shl,
    LShr,
    AShr,
}

/// Integer comparison predicates
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Predicate
{
    Eq,
    Ne,
    Ult,
    Ule,
    Ugt,
    Uge,
    Slt,
    Sle,
    Sgt,
    Sge,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Instruction
{
    /// Reserve `size` bytes of scratch stack, aligned to `align`
    Alloca
    {
        dest: Local,
        size: u64,
        align: u64,
    },
    Load
    {
        dest: Local,
        address: Operand,
        size: usize,
    },
    Store
    {
        value: Operand,
        address: Operand,
        size: usize,
    },
    Binary
    {
        dest: Local,
        op: BinaryOp,
        lhs: Operand,
        rhs: Operand,
    },
    Compare
    {
        dest: Local,
        predicate: Predicate,
        lhs: Operand,
        rhs: Operand,
    },
    Select
    {
        dest: Local,
        condition: Operand,
        if_true: Operand,
        if_false: Operand,
    },
    /// `base + index * scale`
    PointerOffset
    {
        dest: Local,
        base: Operand,
        index: Operand,
        scale: u64,
    },
    /// Not interpretable
    Call
    {
        dest: Option<Local>,
        function: Operand,
        args: Vec<Operand>,
    },
    Return
    {
        value: Option<Operand>,
    },
}

impl Instruction
{
    const fn dest(&self) -> Option<Local>
    {
        match self {
            Instruction::Alloca { dest, .. }
            | Instruction::Load { dest, .. }
            | Instruction::Binary { dest, .. }
            | Instruction::Compare { dest, .. }
            | Instruction::Select { dest, .. }
            | Instruction::PointerOffset { dest, .. } => Some(*dest),
            Instruction::Call { dest, .. } => *dest,
            Instruction::Store { .. } | Instruction::Return { .. } => None,
        }
    }

    const fn opcode(&self) -> &'static str
    {
        match self {
            Instruction::Alloca { .. } => "alloca",
            Instruction::Load { .. } => "load",
            Instruction::Store { .. } => "store",
            Instruction::Binary { .. } => "binop",
            Instruction::Compare { .. } => "icmp",
            Instruction::Select { .. } => "select",
            Instruction::PointerOffset { .. } => "getelementptr",
            Instruction::Call { .. } => "call",
            Instruction::Return { .. } => "ret",
        }
    }
}

/// A function in the interpreter's IR
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IrFunction
{
    pub name: String,
    pub instructions: Vec<Instruction>,
}

impl IrFunction
{
    #[must_use]
    pub fn new(name: impl Into<String>, instructions: Vec<Instruction>) -> Self
    {
        Self {
            name: name.into(),
            instructions,
        }
    }

    fn local_count(&self) -> usize
    {
        self.instructions
            .iter()
            .filter_map(Instruction::dest)
            .map(|local| local.0 + 1)
            .max()
            .unwrap_or(0)
    }
}

/// Why a function cannot be interpreted
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Uninterpretable
{
    pub index: usize,
    pub reason: String,
}

impl fmt::Display for Uninterpretable
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        write!(f, "instruction {}: {}", self.index, self.reason)
    }
}

/// Straight-line IR evaluator
#[derive(Debug, Default, Clone, Copy)]
pub struct IrInterpreter;

impl IrInterpreter
{
    /// Check that every instruction is supported and every local is
    /// defined before use.
    pub fn can_interpret(function: &IrFunction) -> Result<(), Uninterpretable>
    {
        let mut defined = vec![false; function.local_count()];
        let mut returned = false;
        for (index, instruction) in function.instructions.iter().enumerate() {
            if returned {
                return Err(Uninterpretable {
                    index,
                    reason: "instruction after return".to_string(),
                });
            }
            if let Instruction::Call { .. } = instruction {
                return Err(Uninterpretable {
                    index,
                    reason: "calls need the inferior to run".to_string(),
                });
            }
            for operand in operands(instruction) {
                if let Operand::Local(local) = operand {
                    if !defined.get(local.0).copied().unwrap_or(false) {
                        return Err(Uninterpretable {
                            index,
                            reason: format!("%{} used before definition", local.0),
                        });
                    }
                }
            }
            if let Some(dest) = instruction.dest() {
                defined[dest.0] = true;
            }
            returned = matches!(instruction, Instruction::Return { .. });
        }
        if returned {
            Ok(())
        } else {
            Err(Uninterpretable {
                index: function.instructions.len(),
                reason: "missing return".to_string(),
            })
        }
    }

    /// Run `function` with `argument` as the struct address.
    ///
    /// ## Errors
    ///
    /// Uninterpretable functions, memory faults, division by zero.
    pub fn interpret(function: &IrFunction, argument: Address, process: &Process) -> WardenResult<Option<u64>>
    {
        Self::can_interpret(function)
            .map_err(|reason| WardenError::Expression(format!("can't interpret {}: {reason}", function.name)))?;

        let stack_size: u64 = function
            .instructions
            .iter()
            .map(|instruction| match instruction {
                Instruction::Alloca { size, align, .. } => size + align.saturating_sub(1),
                _ => 0,
            })
            .sum();
        let stack = if stack_size > 0 {
            Some(process.allocate_memory(stack_size as usize, Permissions::READ_WRITE)?)
        } else {
            None
        };

        let mut frame = Frame {
            locals: vec![0; function.local_count()],
            argument,
            stack_top: stack.unwrap_or(Address::ZERO),
        };
        let result = frame.run(function, process);

        if let Some(stack) = stack {
            if let Err(error) = process.deallocate_memory(stack) {
                warn!(%stack, %error, "failed to free interpreter stack");
            }
        }
        if let Ok(value) = &result {
            debug!(function = %function.name, ?value, "interpreted");
        }
        result
    }
}

struct Frame
{
    locals: Vec<u64>,
    argument: Address,
    stack_top: Address,
}

impl Frame
{
    fn value(&self, operand: Operand) -> u64
    {
        match operand {
            Operand::Const(value) => value,
            Operand::Local(local) => self.locals[local.0],
            Operand::Argument => self.argument.value(),
        }
    }

    fn run(&mut self, function: &IrFunction, process: &Process) -> WardenResult<Option<u64>>
    {
        for instruction in &function.instructions {
            trace!(opcode = instruction.opcode(), "interpreting");
            let defined = match instruction {
                Instruction::Alloca { dest, size, align } => {
                    let address = self.stack_top.align_up((*align).max(1));
                    self.stack_top = address + *size;
                    Some((*dest, address.value()))
                }
                Instruction::Load { dest, address, size } => {
                    let address = Address::new(self.value(*address));
                    Some((*dest, process.read_scalar_integer_from_memory(address, *size, false)?))
                }
                Instruction::Store { value, address, size } => {
                    let address = Address::new(self.value(*address));
                    let written = process.write_scalar_to_memory(address, self.value(*value), *size)?;
                    if written != *size {
                        return Err(WardenError::MemoryWrite {
                            address,
                            size: *size,
                            reason: format!("wrote {written} of {size} bytes"),
                        });
                    }
                    None
                }
                Instruction::Binary { dest, op, lhs, rhs } => {
                    Some((*dest, binary(*op, self.value(*lhs), self.value(*rhs))?))
                }
                Instruction::Compare {
                    dest,
                    predicate,
                    lhs,
                    rhs,
                } => Some((*dest, u64::from(compare(*predicate, self.value(*lhs), self.value(*rhs))))),
                Instruction::Select {
                    dest,
                    condition,
                    if_true,
                    if_false,
                } => {
                    let chosen = if self.value(*condition) != 0 { if_true } else { if_false };
                    Some((*dest, self.value(*chosen)))
                }
                Instruction::PointerOffset {
                    dest,
                    base,
                    index,
                    scale,
                } => {
                    let offset = self.value(*index).wrapping_mul(*scale);
                    Some((*dest, self.value(*base).wrapping_add(offset)))
                }
                Instruction::Call { .. } => {
                    return Err(WardenError::Expression("calls cannot be interpreted".to_string()));
                }
                Instruction::Return { value } => return Ok(value.map(|value| self.value(value))),
            };
            if let Some((dest, value)) = defined {
                self.locals[dest.0] = value;
            }
        }
        Ok(None)
    }
}

fn operands(instruction: &Instruction) -> Vec<Operand>
{
    match instruction {
        Instruction::Alloca { .. } => Vec::new(),
        Instruction::Load { address, .. } => vec![*address],
        Instruction::Store { value, address, .. } => vec![*value, *address],
        Instruction::Binary { lhs, rhs, .. } | Instruction::Compare { lhs, rhs, .. } => vec![*lhs, *rhs],
        Instruction::Select {
            condition,
            if_true,
            if_false,
            ..
        } => vec![*condition, *if_true, *if_false],
        Instruction::PointerOffset { base, index, .. } => vec![*base, *index],
        Instruction::Call { function, args, .. } => std::iter::once(*function).chain(args.iter().copied()).collect(),
        Instruction::Return { value } => value.iter().copied().collect(),
    }
}

fn binary(op: BinaryOp, lhs: u64, rhs: u64) -> WardenResult<u64>
{
    let division_by_zero = || WardenError::Expression("division by zero".to_string());
    let shift = (rhs & 63) as u32;
    Ok(match op {
        BinaryOp::Add => lhs.wrapping_add(rhs),
        BinaryOp::Sub => lhs.wrapping_sub(rhs),
        BinaryOp::Mul => lhs.wrapping_mul(rhs),
        BinaryOp::UDiv => lhs.checked_div(rhs).ok_or_else(division_by_zero)?,
        BinaryOp::URem => lhs.checked_rem(rhs).ok_or_else(division_by_zero)?,
        BinaryOp::SDiv => {
            if rhs == 0 {
                return Err(division_by_zero());
            }
            (lhs as i64).wrapping_div(rhs as i64) as u64
        }
        BinaryOp::SRem => {
            if rhs == 0 {
                return Err(division_by_zero());
            }
            (lhs as i64).wrapping_rem(rhs as i64) as u64
        }
        BinaryOp::And => lhs & rhs,
        BinaryOp::Or => lhs | rhs,
        BinaryOp::Xor => lhs ^ rhs,
        BinaryOp::Shl => lhs.wrapping_shl(shift),
        BinaryOp::LShr => lhs.wrapping_shr(shift),
        BinaryOp::AShr => ((lhs as i64).wrapping_shr(shift)) as u64,
    })
}

fn compare(predicate: Predicate, lhs: u64, rhs: u64) -> bool
{
    let (signed_lhs, signed_rhs) = (lhs as i64, rhs as i64);
    match predicate {
        Predicate::Eq => lhs == rhs,
        Predicate::Ne => lhs != rhs,
        Predicate::Ult => lhs < rhs,
        Predicate::Ule => lhs <= rhs,
        Predicate::Ugt => lhs > rhs,
        Predicate::Uge => lhs >= rhs,
        Predicate::Slt => signed_lhs < signed_rhs,
        Predicate::Sle => signed_lhs <= signed_rhs,
        Predicate::Sgt => signed_lhs > signed_rhs,
        Predicate::Sge => signed_lhs >= signed_rhs,
    }
}

#[cfg(test)]
mod tests
{
    use super::*;

    #[test]
    fn calls_are_rejected()
    {
        let function = IrFunction::new(
            "f",
            vec![
                Instruction::Call {
                    dest: Some(Local(0)),
                    function: Operand::Const(0x1000),
                    args: Vec::new(),
                },
                Instruction::Return {
                    value: Some(Operand::Local(Local(0))),
                },
            ],
        );
        let error = IrInterpreter::can_interpret(&function).unwrap_err();
        assert_eq!(error.index, 0);
    }

    #[test]
    fn use_before_definition_is_rejected()
    {
        let function = IrFunction::new(
            "f",
            vec![Instruction::Return {
                value: Some(Operand::Local(Local(3))),
            }],
        );
        assert!(IrInterpreter::can_interpret(&function).is_err());
    }

    #[test]
    fn missing_return_is_rejected()
    {
        let function = IrFunction::new("f", Vec::new());
        assert_eq!(IrInterpreter::can_interpret(&function).unwrap_err().reason, "missing return");
    }

    #[test]
    fn arithmetic_follows_twos_complement()
    {
        assert_eq!(binary(BinaryOp::Sub, 1, 2).unwrap(), u64::MAX);
        assert_eq!(binary(BinaryOp::SDiv, (-7i64) as u64, 2).unwrap(), (-3i64) as u64);
        assert_eq!(binary(BinaryOp::AShr, (-8i64) as u64, 1).unwrap(), (-4i64) as u64);
        assert!(binary(BinaryOp::URem, 1, 0).is_err());
        assert!(compare(Predicate::Slt, u64::MAX, 0));
        assert!(!compare(Predicate::Ult, u64::MAX, 0));
    }
}
