//! Tests for running function calls in the inferior

use std::sync::Arc;
use std::time::Duration;

use warden_core::expression::{CallArgument, EvaluateOptions, ExpressionBody, ExpressionRunner, Materializer, UserExpression};
use warden_core::module::SharedModuleRegistry;
use warden_core::platform::simulated::DEFAULT_ENTRY;
use warden_core::platform::{SimulatedFunction, SimulatedInferior};
use warden_core::process::{ExecutionContext, ExecutionResults, LaunchInfo, Process, RunPlanOptions};
use warden_core::thread::{CallFunctionPlan, ThreadPlan, ThreadPlanKind};
use warden_core::types::{Address, StateType, ThreadId};
use warden_core::value::ValueType;
use warden_core::Target;

const ADD: Address = Address::new(0x5000);

fn add() -> SimulatedFunction
{
    SimulatedFunction::new(2, |args| args[0] + args[1])
}

fn launch(inferior: &SimulatedInferior) -> (Arc<Target>, Arc<Process>)
{
    let target = Target::new(Arc::new(SharedModuleRegistry::new()));
    let process = target.create_process(Box::new(inferior.clone()), None);
    process.launch(LaunchInfo::new("a.out")).unwrap();
    (target, process)
}

fn call_plan(process: &Process, lhs: u64, rhs: u64) -> Arc<CallFunctionPlan>
{
    Arc::new(CallFunctionPlan::new(process.abi().unwrap(), ADD, DEFAULT_ENTRY, vec![lhs, rhs]))
}

fn options(timeout: Duration) -> RunPlanOptions
{
    RunPlanOptions {
        single_thread_timeout: Some(timeout),
        ..RunPlanOptions::default()
    }
}

#[test]
fn test_call_completes_and_restores_registers()
{
    let inferior = SimulatedInferior::new().with_function(ADD, add());
    let (_target, process) = launch(&inferior);
    let thread = process.thread_list().selected_thread().unwrap();
    let registers_before = thread.registers();
    let stop_id_before = process.stop_id();

    let plan = call_plan(&process, 40, 2);
    let thread_plan: Arc<dyn ThreadPlan> = Arc::clone(&plan) as Arc<dyn ThreadPlan>;
    let mut context = ExecutionContext::from_process(&process);
    let outcome = process.run_thread_plan(&mut context, &thread_plan, &options(Duration::from_millis(500)));

    assert_eq!(outcome.result, ExecutionResults::Completed, "{:?}", outcome.errors);
    assert_eq!(plan.return_value(), Some(42));
    assert_eq!(thread.registers(), registers_before);
    assert_eq!(thread.current_plan().kind(), ThreadPlanKind::Base);
    assert_eq!(process.private_state(), StateType::Stopped);
    assert!(process.stop_id() > stop_id_before);
    assert!(!process.is_running_user_expression());
}

#[test]
fn test_call_keeps_the_selected_thread_and_frame()
{
    let inferior = SimulatedInferior::new().with_thread(ThreadId(2)).with_function(ADD, add());
    let (_target, process) = launch(&inferior);
    let threads = process.thread_list().threads();
    let (caller, other) = (Arc::clone(&threads[0]), Arc::clone(&threads[1]));
    assert!(process.thread_list().set_selected_thread_by_index_id(other.index_id()));
    let selected_frame = other.selected_frame().map(|frame| frame.id);
    assert!(selected_frame.is_some());

    let plan: Arc<dyn ThreadPlan> = call_plan(&process, 2, 3);
    let mut context = ExecutionContext {
        thread: Some(Arc::clone(&caller)),
        frame: caller.selected_frame(),
        ..ExecutionContext::from_process(&process)
    };
    let caller_frame = context.frame.map(|frame| frame.id);
    let outcome = process.run_thread_plan(&mut context, &plan, &options(Duration::from_millis(500)));
    assert_eq!(outcome.result, ExecutionResults::Completed, "{:?}", outcome.errors);

    let selected = process.thread_list().selected_thread().unwrap();
    assert_eq!(selected.index_id(), other.index_id());
    assert_eq!(selected.selected_frame().map(|frame| frame.id), selected_frame);
    assert_eq!(context.thread.as_ref().map(|thread| thread.index_id()), Some(caller.index_id()));
    assert_eq!(context.frame.map(|frame| frame.id), caller_frame);
}

#[test]
fn test_call_escalates_to_all_threads()
{
    let inferior = SimulatedInferior::new()
        .with_thread(ThreadId(2))
        .with_function(ADD, add().needing_all_threads());
    let (_target, process) = launch(&inferior);
    assert_eq!(process.thread_list().threads().len(), 2);

    let plan = call_plan(&process, 1, 2);
    let thread_plan: Arc<dyn ThreadPlan> = Arc::clone(&plan) as Arc<dyn ThreadPlan>;
    let mut context = ExecutionContext::from_process(&process);
    let outcome = process.run_thread_plan(&mut context, &thread_plan, &options(Duration::from_millis(100)));

    assert_eq!(outcome.result, ExecutionResults::Completed, "{:?}", outcome.errors);
    assert_eq!(plan.return_value(), Some(3));
    // One resume per phase.
    assert_eq!(inferior.resume_count(), 2);
}

#[test]
fn test_call_without_escalation_is_interrupted()
{
    let inferior = SimulatedInferior::new()
        .with_thread(ThreadId(2))
        .with_function(ADD, add().needing_all_threads());
    let (_target, process) = launch(&inferior);

    let plan = call_plan(&process, 1, 2);
    let thread_plan: Arc<dyn ThreadPlan> = Arc::clone(&plan) as Arc<dyn ThreadPlan>;
    let mut context = ExecutionContext::from_process(&process);
    let run_options = RunPlanOptions {
        try_all_threads: false,
        ..options(Duration::from_millis(100))
    };
    let outcome = process.run_thread_plan(&mut context, &thread_plan, &run_options);

    assert_eq!(outcome.result, ExecutionResults::Interrupted);
    assert!(!outcome.errors.is_empty());
    assert_eq!(plan.return_value(), None);
    // Discarded on error: the thread is back on its base plan.
    let thread = process.thread_list().selected_thread().unwrap();
    assert_eq!(thread.current_plan().kind(), ThreadPlanKind::Base);
    assert_eq!(process.private_state(), StateType::Stopped);
}

#[test]
fn test_run_thread_plan_needs_a_stopped_process()
{
    let inferior = SimulatedInferior::new().with_function(ADD, add());
    let (_target, process) = launch(&inferior);
    let mut context = ExecutionContext::from_process(&process);
    process.resume().unwrap();

    let plan: Arc<dyn ThreadPlan> = call_plan(&process, 1, 1);
    let outcome = process.run_thread_plan(&mut context, &plan, &RunPlanOptions::default());
    assert_eq!(outcome.result, ExecutionResults::SetupError);
    process.halt().unwrap();

    let mut empty = ExecutionContext {
        thread: None,
        ..ExecutionContext::from_process(&process)
    };
    let outcome = process.run_thread_plan(&mut empty, &plan, &RunPlanOptions::default());
    assert_eq!(outcome.result, ExecutionResults::SetupError);
}

#[test]
fn test_expression_call_stores_the_result()
{
    let inferior = SimulatedInferior::new().with_function(ADD, add().with_duration(Duration::from_millis(20)));
    let (target, process) = launch(&inferior);

    let mut materializer = Materializer::new();
    materializer.add_result(ValueType::uint64()).unwrap();
    let expression = UserExpression::new(
        "add(20, 22)",
        materializer,
        ExpressionBody::Call {
            function: ADD,
            args: vec![CallArgument::Const(20), CallArgument::Const(22)],
        },
    );
    let evaluate = EvaluateOptions {
        run_options: options(Duration::from_millis(500)),
        return_address: Some(DEFAULT_ENTRY),
    };
    let mut context = ExecutionContext::from_process(&process);
    let outcome = ExpressionRunner::execute(&mut context, &expression, &evaluate);

    assert_eq!(outcome.result, ExecutionResults::Completed, "{:?}", outcome.errors);
    let value = outcome.value.unwrap();
    assert_eq!(value.value_as_unsigned(0), 42);
    assert_eq!(value.name(), "$0");
    assert!(target.persistent_variables().get("$0").is_some());
}

#[test]
fn test_expression_call_to_missing_code_is_interrupted()
{
    let inferior = SimulatedInferior::new();
    let (_target, process) = launch(&inferior);

    let expression = UserExpression::new(
        "nowhere()",
        Materializer::new(),
        ExpressionBody::Call {
            function: Address::new(0xbad0),
            args: Vec::new(),
        },
    );
    let evaluate = EvaluateOptions {
        run_options: options(Duration::from_millis(500)),
        return_address: Some(DEFAULT_ENTRY),
    };
    let mut context = ExecutionContext::from_process(&process);
    let outcome = ExpressionRunner::execute(&mut context, &expression, &evaluate);

    assert_eq!(outcome.result, ExecutionResults::Interrupted);
    assert!(outcome.value.is_none());
}
