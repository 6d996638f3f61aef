//! # Expressions
//!
//! Evaluating expressions against a stopped process.
//!
//! - [`abi`]: calling conventions used to call into the inferior
//! - [`materializer`]: staging variables into inferior memory and back
//! - [`interpreter`]: evaluating simple IR without running the inferior
//! - [`runner`]: the whole materialize, evaluate, dematerialize sequence
//! - [`persistent`]: `$` variables kept by the target between expressions

pub mod abi;
pub mod interpreter;
pub mod materializer;
pub mod persistent;
pub mod runner;

pub use abi::{Abi, SysVAbi};
pub use interpreter::{BinaryOp, Instruction, IrFunction, IrInterpreter, Local, Operand, Predicate, Uninterpretable};
pub use materializer::{Dematerializer, Entity, EntityKind, Materializer};
pub use persistent::{PersistentVariable, PersistentVariables};
pub use runner::{CallArgument, EvaluateOptions, ExpressionBody, ExpressionOutcome, ExpressionRunner, UserExpression};
