//! # Expression Runner
//!
//! Drives one user expression: materialize its variables, evaluate the
//! body, read the variables and the result back.
//!
//! Bodies in the interpreter IR are evaluated without resuming the
//! inferior. Function calls are run for real with a
//! [`CallFunctionPlan`] through [`Process::run_thread_plan`].

use std::sync::Arc;

use tracing::{debug, info, warn};

use super::interpreter::{IrFunction, IrInterpreter};
use super::materializer::{Dematerializer, Materializer};
use crate::process::{ExecutionContext, ExecutionResults, Process, RunPlanOptions};
use crate::thread::{CallFunctionPlan, ThreadPlan};
use crate::types::Address;
use crate::value::ValueObject;

/// Argument of a called function
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallArgument
{
    Const(u64),
    /// Address of the materialized argument struct
    StructAddress,
}

/// What an expression does once its variables are staged
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExpressionBody
{
    /// Straight-line IR evaluated by the interpreter
    Interpreted(IrFunction),
    /// A call of `function` in the inferior; the integer return value is
    /// stored in the result slot
    Call
    {
        function: Address,
        args: Vec<CallArgument>,
    },
}

/// A prepared expression
#[derive(Debug, Clone)]
pub struct UserExpression
{
    /// Source text, for logs
    pub text: String,
    pub materializer: Materializer,
    pub body: ExpressionBody,
}

impl UserExpression
{
    #[must_use]
    pub fn new(text: impl Into<String>, materializer: Materializer, body: ExpressionBody) -> Self
    {
        Self {
            text: text.into(),
            materializer,
            body,
        }
    }
}

/// Knobs of [`ExpressionRunner::execute`]
#[derive(Debug, Clone, Default)]
pub struct EvaluateOptions
{
    pub run_options: RunPlanOptions,
    /// Where calls return to; defaults to the executable's entry point
    pub return_address: Option<Address>,
}

/// Result of evaluating an expression
#[derive(Debug, Clone)]
pub struct ExpressionOutcome
{
    pub result: ExecutionResults,
    /// The result variable, when the expression has one and completed
    pub value: Option<ValueObject>,
    pub errors: Vec<String>,
}

impl ExpressionOutcome
{
    fn failed(result: ExecutionResults, message: impl Into<String>) -> Self
    {
        Self {
            result,
            value: None,
            errors: vec![message.into()],
        }
    }
}

/// Evaluates [`UserExpression`]s
#[derive(Debug, Default, Clone, Copy)]
pub struct ExpressionRunner;

impl ExpressionRunner
{
    /// Evaluate `expression` in `context`.
    ///
    /// Never fails outright: problems are reported through the outcome's
    /// [`ExecutionResults`] and error list.
    pub fn execute(context: &mut ExecutionContext, expression: &UserExpression, options: &EvaluateOptions) -> ExpressionOutcome
    {
        let Some(process) = context.process.clone() else {
            return ExpressionOutcome::failed(ExecutionResults::SetupError, "no process to evaluate the expression in");
        };
        if context.thread.is_none() {
            context.thread = process.thread_list().selected_thread();
        }
        let thread = context.thread.clone();
        debug!(expression = %expression.text, "evaluating expression");

        let dematerializer = match expression.materializer.materialize(&process, thread.as_ref()) {
            Ok(dematerializer) => dematerializer,
            Err(error) => return ExpressionOutcome::failed(ExecutionResults::SetupError, error.to_string()),
        };

        let (result, mut errors) = match &expression.body {
            ExpressionBody::Interpreted(function) => Self::interpret(&process, function, &dematerializer, &expression.materializer),
            ExpressionBody::Call { function, args } => {
                Self::call(context, &process, *function, args, &dematerializer, &expression.materializer, options)
            }
        };

        if result != ExecutionResults::Completed {
            warn!(expression = %expression.text, %result, "expression did not complete");
            dematerializer.wipe();
            return ExpressionOutcome {
                result,
                value: None,
                errors,
            };
        }

        let value = match dematerializer.dematerialize() {
            Ok(value) => value,
            Err(error) => {
                errors.push(format!("couldn't dematerialize: {error}"));
                None
            }
        };
        info!(expression = %expression.text, value = ?value.as_ref().and_then(ValueObject::formatted_value), "expression completed");
        ExpressionOutcome { result, value, errors }
    }

    fn interpret(
        process: &Process,
        function: &IrFunction,
        dematerializer: &Dematerializer,
        materializer: &Materializer,
    ) -> (ExecutionResults, Vec<String>)
    {
        if let Err(reason) = IrInterpreter::can_interpret(function) {
            return (
                ExecutionResults::SetupError,
                vec![format!("can't interpret {}: {reason}", function.name)],
            );
        }
        match IrInterpreter::interpret(function, dematerializer.struct_address(), process) {
            Ok(returned) => match Self::store_result(process, dematerializer, materializer, returned) {
                Ok(()) => (ExecutionResults::Completed, Vec::new()),
                Err(message) => (ExecutionResults::Discarded, vec![message]),
            },
            Err(error) => (ExecutionResults::Discarded, vec![error.to_string()]),
        }
    }

    fn call(
        context: &mut ExecutionContext,
        process: &Arc<Process>,
        function: Address,
        args: &[CallArgument],
        dematerializer: &Dematerializer,
        materializer: &Materializer,
        options: &EvaluateOptions,
    ) -> (ExecutionResults, Vec<String>)
    {
        if !process.can_jit() {
            return (
                ExecutionResults::SetupError,
                vec!["the process cannot run expression code".to_string()],
            );
        }
        let Some(abi) = process.abi() else {
            return (
                ExecutionResults::SetupError,
                vec![format!("no ABI for {}", process.architecture())],
            );
        };
        let return_address = options.return_address.or_else(|| {
            process
                .target()
                .and_then(|target| target.executable_module())
                .and_then(|module| module.object_file().ok())
                .and_then(|file| file.entry_point())
        });
        let Some(return_address) = return_address else {
            return (
                ExecutionResults::SetupError,
                vec!["no return address for the call".to_string()],
            );
        };

        let args = args
            .iter()
            .map(|arg| match arg {
                CallArgument::Const(value) => *value,
                CallArgument::StructAddress => dematerializer.struct_address().value(),
            })
            .collect();
        let plan = Arc::new(CallFunctionPlan::new(abi, function, return_address, args));
        let thread_plan: Arc<dyn ThreadPlan> = Arc::clone(&plan) as Arc<dyn ThreadPlan>;
        let outcome = process.run_thread_plan(context, &thread_plan, &options.run_options);
        if outcome.result != ExecutionResults::Completed {
            return (outcome.result, outcome.errors);
        }
        let mut errors = outcome.errors;
        if let Err(message) = Self::store_result(process, dematerializer, materializer, plan.return_value()) {
            errors.push(message);
            return (ExecutionResults::Discarded, errors);
        }
        (ExecutionResults::Completed, errors)
    }

    fn store_result(
        process: &Process,
        dematerializer: &Dematerializer,
        materializer: &Materializer,
        returned: Option<u64>,
    ) -> Result<(), String>
    {
        let (Some(value), Some(entity), Some(address)) =
            (returned, materializer.result_entity(), dematerializer.result_address())
        else {
            return Ok(());
        };
        if !entity.ty.is_scalar() {
            return Ok(());
        }
        process
            .write_scalar_to_memory(address, value, entity.ty.byte_size())
            .map(|_| ())
            .map_err(|error| format!("couldn't store the result: {error}"))
    }
}
