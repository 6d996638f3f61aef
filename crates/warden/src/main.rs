use std::error::Error;
use std::path::PathBuf;
use std::process;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use warden_core::breakpoints::WatchpointAccess;
use warden_core::events::Listener;
use warden_core::expression::{CallArgument, EvaluateOptions, ExpressionBody, ExpressionRunner, Materializer, UserExpression};
use warden_core::module::{ModuleSpec, SharedModuleRegistry};
use warden_core::platform::{ScriptedStop, ScriptedStopKind, SimulatedFunction, SimulatedInferior};
use warden_core::platform::simulated::DEFAULT_ENTRY;
use warden_core::process::{ExecutionContext, LaunchInfo, Process, ProcessEventData, RunPlanOptions};
use warden_core::types::{Address, StateType, ThreadId};
use warden_core::value::ValueType;
use warden_core::Target;
use warden_utils::{info, init_logging_with, LogConfig, LogLevel, LoggingError, LoggingGuard};

type CliResult<T> = Result<T, Box<dyn Error>>;

/// Drive the Warden debugger core against a simulated inferior.
#[derive(Parser, Debug)]
#[command(name = "warden")]
#[command(version)]
#[command(about = "Drive the Warden debugger core against a simulated inferior", long_about = None)]
struct Cli
{
    /// Log level (error, warn, info, debug, trace); overrides RUST_LOG
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands
{
    /// Plant a breakpoint and show that reads hide the trap opcode
    Shadow
    {
        /// Address of the breakpoint (hex format: 0x1000 or decimal)
        #[arg(long, default_value = "0x1000", value_parser = parse_address)]
        address: u64,
    },
    /// Call a function in the inferior and print its result
    Call
    {
        /// First argument
        #[arg(default_value_t = 2)]
        lhs: u64,
        /// Second argument
        #[arg(default_value_t = 40)]
        rhs: u64,
        /// How long the callee runs
        #[arg(long, default_value_t = 0)]
        duration_ms: u64,
        /// First-phase timeout, with only the calling thread running
        #[arg(long, default_value_t = 500)]
        timeout_ms: u64,
        /// Make the callee wait on the other thread, as if blocked on a lock
        #[arg(long, default_value_t = false)]
        needs_all_threads: bool,
        /// Give up after the first phase instead of running every thread
        #[arg(long, default_value_t = false)]
        no_try_all_threads: bool,
    },
    /// Hit a breakpoint with an ignore count and print the public events
    Events
    {
        /// Hits to skip before stopping
        #[arg(long, default_value_t = 2)]
        ignore_count: u32,
    },
    /// Load an object file through the shared module registry
    Modules
    {
        /// Path of the object file
        path: PathBuf,
        /// Only list symbols whose name contains this
        #[arg(long)]
        name: Option<String>,
        /// Maximum number of symbols to list
        #[arg(short, long, default_value_t = 20)]
        limit: usize,
    },
}

fn main()
{
    let cli = Cli::parse();

    let _guard = match init(cli.log_level.as_deref()) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Failed to initialize logging: {e}");
            process::exit(1);
        }
    };

    if let Err(e) = run_command(cli.command) {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}

fn init(level: Option<&str>) -> Result<LoggingGuard, LoggingError>
{
    let mut config = LogConfig::from_env()?;
    if let Some(level) = level {
        config = config.with_level(LogLevel::from_str(level).map_err(LoggingError::InvalidLevel)?);
    }
    init_logging_with(&config)
}

fn run_command(command: Commands) -> CliResult<()>
{
    match command {
        Commands::Shadow { address } => shadow(Address::new(address)),
        Commands::Call {
            lhs,
            rhs,
            duration_ms,
            timeout_ms,
            needs_all_threads,
            no_try_all_threads,
        } => {
            let mut function = SimulatedFunction::new(2, |args| args.iter().fold(0u64, |sum, arg| sum.wrapping_add(*arg)))
                .with_duration(Duration::from_millis(duration_ms));
            if needs_all_threads {
                function = function.needing_all_threads();
            }
            let options = RunPlanOptions {
                try_all_threads: !no_try_all_threads,
                single_thread_timeout: Some(Duration::from_millis(timeout_ms)),
                ..RunPlanOptions::default()
            };
            call(function, lhs, rhs, options)
        }
        Commands::Events { ignore_count } => events(ignore_count),
        Commands::Modules { path, name, limit } => modules(path, name.as_deref(), limit),
    }
}

fn new_target() -> Arc<Target>
{
    Target::new(Arc::new(SharedModuleRegistry::new()))
}

fn launch(target: &Target, inferior: &SimulatedInferior, listener: Option<&Listener>) -> CliResult<Arc<Process>>
{
    let process = target.create_process(Box::new(inferior.clone()), listener);
    let pid = process.launch(LaunchInfo::new("a.out"))?;
    println!("Launched simulated inferior (PID: {pid})");
    Ok(process)
}

fn hex(bytes: &[u8]) -> String
{
    bytes.iter().map(|byte| format!("{byte:02x}")).collect::<Vec<_>>().join(" ")
}

// ---- shadow ------------------------------------------------------------------

fn shadow(address: Address) -> CliResult<()>
{
    let inferior = SimulatedInferior::new().with_code(address, vec![0x90; 16]);
    let target = new_target();
    let process = launch(&target, &inferior, None)?;

    let breakpoint = target.create_breakpoint_by_address(address, false)?;
    info!(breakpoint = %breakpoint.id(), %address, "breakpoint planted");

    let mut buffer = [0u8; 4];
    process.read_memory(address, &mut buffer)?;
    println!("Breakpoint {} at {address}", breakpoint.id());
    println!("  debugger view: {}", hex(&buffer));
    println!("  inferior view: {}", hex(&inferior.raw_memory(address, buffer.len())?));

    process.write_memory(address, &[0x42])?;
    process.read_memory(address, &mut buffer)?;
    println!("After writing 42 over the breakpoint:");
    println!("  debugger view: {}", hex(&buffer));
    println!("  inferior view: {}", hex(&inferior.raw_memory(address, buffer.len())?));

    target.remove_breakpoint(breakpoint.id())?;
    println!("After removing the breakpoint:");
    println!("  inferior view: {}", hex(&inferior.raw_memory(address, buffer.len())?));

    let watchpoint = target.create_watchpoint(address, 4, WatchpointAccess::Write)?;
    println!("Watchpoint {} on {address}, enabled: {}", watchpoint.id(), watchpoint.is_enabled());
    target.remove_watchpoint(watchpoint.id())?;

    process.destroy()?;
    Ok(())
}

// ---- call --------------------------------------------------------------------

const FUNCTION_ADDRESS: Address = Address::new(0x5000);

fn call(function: SimulatedFunction, lhs: u64, rhs: u64, options: RunPlanOptions) -> CliResult<()>
{
    let inferior = SimulatedInferior::new()
        .with_thread(ThreadId(2))
        .with_function(FUNCTION_ADDRESS, function);
    let target = new_target();
    let process = launch(&target, &inferior, None)?;

    let mut materializer = Materializer::new();
    materializer.add_result(ValueType::uint64())?;
    let expression = UserExpression::new(
        format!("add({lhs}, {rhs})"),
        materializer,
        ExpressionBody::Call {
            function: FUNCTION_ADDRESS,
            args: vec![CallArgument::Const(lhs), CallArgument::Const(rhs)],
        },
    );
    let evaluate = EvaluateOptions {
        run_options: options,
        return_address: Some(DEFAULT_ENTRY),
    };

    let mut context = ExecutionContext::from_process(&process);
    let outcome = ExpressionRunner::execute(&mut context, &expression, &evaluate);

    println!("{} => {}", expression.text, outcome.result);
    if let Some(value) = &outcome.value {
        println!("  {} = {}", value.name(), value.formatted_value().unwrap_or_default());
    }
    for error in &outcome.errors {
        println!("  error: {error}");
    }
    println!("  process state: {}", process.public_state());

    process.destroy()?;
    Ok(())
}

// ---- events ------------------------------------------------------------------

const EVENT_TIMEOUT: Duration = Duration::from_secs(5);

fn events(ignore_count: u32) -> CliResult<()>
{
    let address = DEFAULT_ENTRY + 0x10;
    let mut inferior = SimulatedInferior::new().with_code(DEFAULT_ENTRY, vec![0x90; 0x100]);
    for _ in 0..=ignore_count {
        inferior = inferior.with_stop(ScriptedStop::new(ScriptedStopKind::Breakpoint(address)).after(Duration::from_millis(10)));
    }
    inferior = inferior.with_stop(ScriptedStop::new(ScriptedStopKind::Exit(0)));

    let target = new_target();
    let listener = Listener::new("warden.cli.events");
    let process = launch(&target, &inferior, Some(&listener))?;

    let breakpoint = target.create_breakpoint_by_address(address, false)?;
    breakpoint.update_options(|options| options.ignore_count = ignore_count);
    println!("Breakpoint {} at {address}, ignoring {ignore_count} hit(s)", breakpoint.id());

    process.resume()?;
    loop {
        let Some(event) = listener.wait_for_event(Some(EVENT_TIMEOUT)) else {
            return Err(format!("no event within {EVENT_TIMEOUT:?}").into());
        };
        if event.process_data().is_none() {
            continue;
        }
        let state = ProcessEventData::state_from_event(&event);
        let restarted = ProcessEventData::restarted_from_event(&event);
        println!(
            "  {:<8} restarted={restarted} interrupted={}",
            state.to_string(),
            ProcessEventData::interrupted_from_event(&event)
        );
        match state {
            StateType::Exited => break,
            StateType::Stopped if !restarted => {
                println!("    breakpoint hit count: {}", breakpoint.hit_count());
                process.resume()?;
            }
            _ => {}
        }
    }

    println!("Process exited: {}", process.exit_description());
    println!("Resumes seen by the inferior: {}", inferior.resume_count());
    Ok(())
}

// ---- modules -----------------------------------------------------------------

fn modules(path: PathBuf, name: Option<&str>, limit: usize) -> CliResult<()>
{
    let registry = SharedModuleRegistry::new();
    let shared = registry.get_shared_module(&ModuleSpec::new(path))?;
    let module = shared.module;

    println!("{}", module.path().display());
    println!("  architecture: {}", module.architecture());
    match module.uuid() {
        Some(uuid) => println!("  uuid:         {uuid}"),
        None => println!("  uuid:         -"),
    }
    println!("  executable:   {}", module.is_executable());

    let table = module.symbol_table()?;
    let matching: Vec<_> = table
        .symbols()
        .iter()
        .filter(|symbol| name.is_none_or(|name| symbol.name.display_name().contains(name)))
        .collect();
    println!("  symbols:      {} ({} matching)", table.len(), matching.len());
    for symbol in matching.into_iter().take(limit) {
        println!("    {}  {:>8}  {}", symbol.address, symbol.size, symbol.name);
    }
    Ok(())
}

/// Parse `0x`-prefixed hex or decimal.
fn parse_address(raw: &str) -> Result<u64, String>
{
    let parsed = match raw.strip_prefix("0x").or_else(|| raw.strip_prefix("0X")) {
        Some(digits) => u64::from_str_radix(digits, 16),
        None => raw.parse(),
    };
    parsed.map_err(|e| format!("invalid address '{raw}': {e}"))
}

#[cfg(test)]
mod tests
{
    use super::*;

    #[test]
    fn test_parse_address()
    {
        assert_eq!(parse_address("0x1000"), Ok(0x1000));
        assert_eq!(parse_address("4096"), Ok(4096));
        assert!(parse_address("0xzz").is_err());
    }

    #[test]
    fn test_cli_parses_call_flags()
    {
        let cli = Cli::parse_from(["warden", "--log-level", "debug", "call", "1", "2", "--needs-all-threads"]);
        assert_eq!(cli.log_level.as_deref(), Some("debug"));
        match cli.command {
            Commands::Call {
                lhs,
                rhs,
                needs_all_threads,
                no_try_all_threads,
                ..
            } => {
                assert_eq!((lhs, rhs), (1, 2));
                assert!(needs_all_threads);
                assert!(!no_try_all_threads);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }
}
