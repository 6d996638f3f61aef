//! Process run states.

use std::fmt;

/// Run state of a process
///
/// This set is the contract with remote backends: every backend maps its
/// own notion of "what the inferior is doing" onto exactly these values.
/// The same enum is used for the private (ground truth) and the public
/// (client-visible) copy of the state kept by
/// [`Process`](crate::process::Process).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum StateType
{
    /// No valid state
    Invalid,
    /// Created, nothing launched or attached yet
    #[default]
    Unloaded,
    /// Connected to a remote stub with no process yet
    Connected,
    /// Attach in progress
    Attaching,
    /// Launch in progress
    Launching,
    /// Stopped and ready to be inspected
    Stopped,
    /// Running freely
    Running,
    /// Single stepping
    Stepping,
    /// Stopped because of a crash
    Crashed,
    /// Detached; the inferior keeps running without us
    Detached,
    /// Exited; the exit status is available
    Exited,
    /// Stopped because the process was suspended
    Suspended,
}

impl StateType
{
    /// Whether the inferior executes instructions in this state.
    #[must_use]
    pub const fn is_running(self) -> bool
    {
        matches!(self, StateType::Running | StateType::Stepping)
    }

    /// Whether this is one of the stopped kinds (`Stopped`, `Crashed`, `Suspended`).
    ///
    /// Entering a stopped kind bumps the stop id.
    #[must_use]
    pub const fn is_stopped(self) -> bool
    {
        matches!(self, StateType::Stopped | StateType::Crashed | StateType::Suspended)
    }

    /// Whether the process has gone away for good.
    #[must_use]
    pub const fn is_terminal(self) -> bool
    {
        matches!(self, StateType::Invalid | StateType::Exited | StateType::Detached)
    }

    /// Whether a backend is attached to a live inferior.
    #[must_use]
    pub const fn is_alive(self) -> bool
    {
        matches!(
            self,
            StateType::Attaching
                | StateType::Launching
                | StateType::Stopped
                | StateType::Running
                | StateType::Stepping
                | StateType::Crashed
                | StateType::Suspended
        )
    }

    /// Lower-case name used in logs and messages.
    #[must_use]
    pub const fn as_str(self) -> &'static str
    {
        match self {
            StateType::Invalid => "invalid",
            StateType::Unloaded => "unloaded",
            StateType::Connected => "connected",
            StateType::Attaching => "attaching",
            StateType::Launching => "launching",
            StateType::Stopped => "stopped",
            StateType::Running => "running",
            StateType::Stepping => "stepping",
            StateType::Crashed => "crashed",
            StateType::Detached => "detached",
            StateType::Exited => "exited",
            StateType::Suspended => "suspended",
        }
    }
}

impl fmt::Display for StateType
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        f.write_str(self.as_str())
    }
}
