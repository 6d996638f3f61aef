//! Thread plan that calls a function in the inferior.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{debug, warn};

use super::plan::{PlanFlags, ThreadPlan, ThreadPlanKind};
use super::{StopInfo, Thread};
use crate::error::WardenError;
use crate::expression::Abi;
use crate::types::{Address, Registers};

#[derive(Debug, Default)]
struct CallState
{
    saved_registers: Option<Registers>,
    setup_error: Option<String>,
    return_value: Option<u64>,
}

/// Calls `function` with integer arguments and stops when it returns
///
/// On push the plan saves the register context and lets the ABI lay out a
/// trivial call frame that returns to `return_address`. The plan explains
/// the stop at that address, captures the return value, and puts the saved
/// registers back when popped.
pub struct CallFunctionPlan
{
    flags: PlanFlags,
    abi: Arc<dyn Abi>,
    function: Address,
    return_address: Address,
    args: Vec<u64>,
    state: Mutex<CallState>,
}

impl CallFunctionPlan
{
    /// Plan a call of `function(args...)` returning to `return_address`.
    ///
    /// The plan starts private and with `stop_others` set.
    #[must_use]
    pub fn new(abi: Arc<dyn Abi>, function: Address, return_address: Address, args: Vec<u64>) -> Self
    {
        Self {
            flags: PlanFlags::new(true, true),
            abi,
            function,
            return_address,
            args,
            state: Mutex::new(CallState::default()),
        }
    }

    /// Called function.
    #[must_use]
    pub const fn function(&self) -> Address
    {
        self.function
    }

    /// Address the call returns to.
    #[must_use]
    pub const fn return_address(&self) -> Address
    {
        self.return_address
    }

    /// Value the function returned, once the plan completed.
    #[must_use]
    pub fn return_value(&self) -> Option<u64>
    {
        self.lock().return_value
    }

    /// Why the call frame could not be set up, if it could not.
    #[must_use]
    pub fn setup_error(&self) -> Option<String>
    {
        self.lock().setup_error.clone()
    }

    fn lock(&self) -> MutexGuard<'_, CallState>
    {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl ThreadPlan for CallFunctionPlan
{
    fn kind(&self) -> ThreadPlanKind
    {
        ThreadPlanKind::CallFunction {
            function: self.function,
            return_address: self.return_address,
        }
    }

    fn description(&self) -> String
    {
        format!("call function at {}", self.function)
    }

    fn flags(&self) -> &PlanFlags
    {
        &self.flags
    }

    fn did_push(&self, thread: &Thread)
    {
        let registers = thread.registers();
        let sp = registers
            .sp
            .checked_sub(self.abi.red_zone_size())
            .map(|sp| sp.align_down(self.abi.stack_alignment()));
        self.lock().saved_registers = Some(registers);

        let result = match sp {
            Some(sp) => self
                .abi
                .prepare_trivial_call(thread, sp, self.function, self.return_address, &self.args),
            None => Err(WardenError::InvalidArgument(
                "stack pointer too low for a call frame".to_string(),
            )),
        };
        if let Err(error) = result {
            warn!(thread = thread.index_id(), function = %self.function, %error, "call setup failed");
            self.lock().setup_error = Some(error.to_string());
        } else {
            debug!(thread = thread.index_id(), function = %self.function, abi = self.abi.name(), "call frame prepared");
        }
    }

    fn explains_stop(&self, thread: &Thread, _stop_info: &StopInfo) -> bool
    {
        thread.pc() == self.return_address
    }

    fn should_stop(&self, thread: &Thread, _stop_info: &StopInfo) -> bool
    {
        match self.abi.get_return_value(thread) {
            Ok(value) => self.lock().return_value = Some(value),
            Err(error) => warn!(thread = thread.index_id(), %error, "could not read return value"),
        }
        self.flags.mark_done();
        true
    }

    fn will_pop(&self, thread: &Thread)
    {
        if let Some(saved) = self.lock().saved_registers.take() {
            thread.set_registers(saved);
        }
    }

    fn is_valid(&self) -> bool
    {
        self.lock().setup_error.is_none()
    }
}
