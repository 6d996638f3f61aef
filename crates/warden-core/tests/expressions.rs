//! Tests for values, the materializer, and interpreted expressions

use std::sync::Arc;

use warden_core::expression::{
    BinaryOp, EvaluateOptions, ExpressionBody, ExpressionRunner, Instruction, IrFunction, Local, Materializer, Operand,
    UserExpression,
};
use warden_core::memory::Permissions;
use warden_core::module::SharedModuleRegistry;
use warden_core::platform::SimulatedInferior;
use warden_core::process::{ExecutionContext, ExecutionResults, LaunchInfo, Process};
use warden_core::types::Address;
use warden_core::value::{ValueObject, ValueType};
use warden_core::Target;

const DATA: Address = Address::new(0x6000);

/// A process with `{ x: 41i32, y: -2i32, next: DATA }` at `DATA`.
fn launch() -> (Arc<Target>, Arc<Process>, SimulatedInferior)
{
    let mut bytes = Vec::new();
    bytes.extend_from_slice(&41i32.to_le_bytes());
    bytes.extend_from_slice(&(-2i32).to_le_bytes());
    bytes.extend_from_slice(&DATA.value().to_le_bytes());
    bytes.resize(0x100, 0);
    let inferior = SimulatedInferior::new().with_memory(DATA, bytes, Permissions::READ_WRITE);
    let target = Target::new(Arc::new(SharedModuleRegistry::new()));
    let process = target.create_process(Box::new(inferior.clone()), None);
    process.launch(LaunchInfo::new("a.out")).unwrap();
    (target, process, inferior)
}

fn point_type() -> ValueType
{
    ValueType::record(
        "Point",
        vec![
            ("x", ValueType::int32()),
            ("y", ValueType::int32()),
            ("next", ValueType::pointer_to(ValueType::int32())),
        ],
    )
}

fn evaluate(process: &Arc<Process>, expression: &UserExpression) -> warden_core::expression::ExpressionOutcome
{
    let mut context = ExecutionContext::from_process(process);
    ExpressionRunner::execute(&mut context, expression, &EvaluateOptions::default())
}

// ---- values ------------------------------------------------------------------

#[test]
fn test_struct_fields_and_pointers()
{
    let (_target, process, _inferior) = launch();
    let point = ValueObject::memory_variable(&process, "p", point_type(), DATA);

    assert_eq!(point.num_children(), 3);
    assert_eq!(point.byte_size(), 16);
    assert_eq!(point.formatted_value(), None);

    let y = point.child_by_name("y").unwrap();
    assert_eq!(y.value_as_signed(0), -2);
    assert_eq!(y.address(), Some(DATA + 4));
    assert_eq!(y.formatted_value().as_deref(), Some("-2"));

    let next = point.child_by_name("next").unwrap();
    assert_eq!(next.value_as_unsigned(0), DATA.value());
    let pointee = next.dereference().unwrap();
    assert_eq!(pointee.value_as_signed(0), 41);
    assert_eq!(pointee.name(), "*next");

    assert!(point.child_by_name("z").is_none());
    assert!(y.dereference().is_err());
}

#[test]
fn test_writes_through_values_refresh_siblings()
{
    let (_target, process, inferior) = launch();
    let point = ValueObject::memory_variable(&process, "p", point_type(), DATA);
    let x = point.child_by_name("x").unwrap();
    let pointee = point.child_by_name("next").unwrap().dereference().unwrap();
    assert_eq!(pointee.value_as_signed(0), 41);

    x.set_value_from_unsigned(7).unwrap();
    assert_eq!(inferior.raw_memory(DATA, 4).unwrap(), 7i32.to_le_bytes().to_vec());
    assert_eq!(pointee.value_as_signed(0), 7);
}

#[test]
fn test_address_of_and_constants()
{
    let (_target, process, _inferior) = launch();
    let x = ValueObject::memory_variable(&process, "x", ValueType::int32(), DATA);
    let address = x.address_of().unwrap();
    assert_eq!(address.value_as_unsigned(0), DATA.value());
    assert_eq!(address.formatted_value().as_deref(), Some("0x0000000000006000"));

    let constant = ValueObject::constant(None, "$c", ValueType::uint64(), 5u64.to_le_bytes().to_vec());
    assert_eq!(constant.value_as_unsigned(0), 5);
    assert!(constant.address_of().is_err());
}

#[test]
fn test_unreadable_value_reports_an_error()
{
    let (_target, process, _inferior) = launch();
    let bad = ValueObject::memory_variable(&process, "bad", ValueType::int32(), Address::new(0xdead_0000));
    assert!(bad.data().is_err());
    assert!(bad.error().is_some());
    assert_eq!(bad.value_as_unsigned(99), 99);
    assert_eq!(bad.formatted_value(), None);
}

// ---- interpreted expressions -------------------------------------------------

#[test]
fn test_interpreted_expression_reads_a_variable()
{
    let (target, process, _inferior) = launch();
    let mut materializer = Materializer::new();
    materializer.add_variable("x", ValueType::int32(), DATA);
    materializer.add_result(ValueType::int32()).unwrap();

    // x + 1
    let function = IrFunction::new(
        "$__expr",
        vec![
            Instruction::Load {
                dest: Local(0),
                address: Operand::Argument,
                size: 8,
            },
            Instruction::Load {
                dest: Local(1),
                address: Operand::Local(Local(0)),
                size: 4,
            },
            Instruction::Binary {
                dest: Local(2),
                op: BinaryOp::Add,
                lhs: Operand::Local(Local(1)),
                rhs: Operand::Const(1),
            },
            Instruction::Return {
                value: Some(Operand::Local(Local(2))),
            },
        ],
    );
    let expression = UserExpression::new("x + 1", materializer, ExpressionBody::Interpreted(function));
    let stop_id = process.stop_id();
    let outcome = evaluate(&process, &expression);

    assert_eq!(outcome.result, ExecutionResults::Completed, "{:?}", outcome.errors);
    let value = outcome.value.unwrap();
    assert_eq!(value.formatted_value().as_deref(), Some("42"));
    assert_eq!(target.persistent_variables().names(), vec!["$0".to_string()]);
    // Interpretation never resumes the inferior.
    assert_eq!(process.stop_id(), stop_id);
}

#[test]
fn test_interpreted_store_updates_memory()
{
    let (_target, process, inferior) = launch();
    let mut materializer = Materializer::new();
    materializer.add_variable("y", ValueType::int32(), DATA + 4);

    // y = 100
    let function = IrFunction::new(
        "$__expr",
        vec![
            Instruction::Load {
                dest: Local(0),
                address: Operand::Argument,
                size: 8,
            },
            Instruction::Store {
                value: Operand::Const(100),
                address: Operand::Local(Local(0)),
                size: 4,
            },
            Instruction::Return { value: None },
        ],
    );
    let expression = UserExpression::new("y = 100", materializer, ExpressionBody::Interpreted(function));
    let outcome = evaluate(&process, &expression);

    assert_eq!(outcome.result, ExecutionResults::Completed, "{:?}", outcome.errors);
    assert!(outcome.value.is_none());
    assert_eq!(inferior.raw_memory(DATA + 4, 4).unwrap(), 100i32.to_le_bytes().to_vec());
}

#[test]
fn test_persistent_variables_survive_between_expressions()
{
    let (target, process, _inferior) = launch();
    let bump = || {
        let mut materializer = Materializer::new();
        materializer.add_persistent_variable("$counter", ValueType::int32());
        // $counter += 5
        let function = IrFunction::new(
            "$__expr",
            vec![
                Instruction::Load {
                    dest: Local(0),
                    address: Operand::Argument,
                    size: 4,
                },
                Instruction::Binary {
                    dest: Local(1),
                    op: BinaryOp::Add,
                    lhs: Operand::Local(Local(0)),
                    rhs: Operand::Const(5),
                },
                Instruction::Store {
                    value: Operand::Local(Local(1)),
                    address: Operand::Argument,
                    size: 4,
                },
                Instruction::Return { value: None },
            ],
        );
        UserExpression::new("$counter += 5", materializer, ExpressionBody::Interpreted(function))
    };

    assert_eq!(evaluate(&process, &bump()).result, ExecutionResults::Completed);
    assert_eq!(evaluate(&process, &bump()).result, ExecutionResults::Completed);
    let counter = target.persistent_variables().get("$counter").unwrap();
    assert_eq!(counter.bytes, 10i32.to_le_bytes().to_vec());
}

#[test]
fn test_runtime_fault_discards_the_expression()
{
    let (_target, process, _inferior) = launch();
    let mut materializer = Materializer::new();
    materializer.add_result(ValueType::uint64()).unwrap();
    let function = IrFunction::new(
        "$__expr",
        vec![
            Instruction::Binary {
                dest: Local(0),
                op: BinaryOp::UDiv,
                lhs: Operand::Const(1),
                rhs: Operand::Const(0),
            },
            Instruction::Return {
                value: Some(Operand::Local(Local(0))),
            },
        ],
    );
    let outcome = evaluate(&process, &UserExpression::new("1 / 0", materializer, ExpressionBody::Interpreted(function)));
    assert_eq!(outcome.result, ExecutionResults::Discarded);
    assert!(outcome.value.is_none());
    assert_eq!(outcome.errors.len(), 1);
}

#[test]
fn test_calls_are_not_interpreted()
{
    let (_target, process, _inferior) = launch();
    let function = IrFunction::new(
        "$__expr",
        vec![
            Instruction::Call {
                dest: None,
                function: Operand::Const(0x5000),
                args: Vec::new(),
            },
            Instruction::Return { value: None },
        ],
    );
    let outcome = evaluate(&process, &UserExpression::new("f()", Materializer::new(), ExpressionBody::Interpreted(function)));
    assert_eq!(outcome.result, ExecutionResults::SetupError);
}

#[test]
fn test_materialize_fails_for_unknown_symbols()
{
    let (_target, process, _inferior) = launch();
    let mut materializer = Materializer::new();
    materializer.add_symbol("does_not_exist");
    let outcome = evaluate(&process, &UserExpression::new("&does_not_exist", materializer, ExpressionBody::Interpreted(
        IrFunction::new("$__expr", vec![Instruction::Return { value: None }]),
    )));
    assert_eq!(outcome.result, ExecutionResults::SetupError);
    assert!(outcome.errors[0].contains("does_not_exist"));
}
