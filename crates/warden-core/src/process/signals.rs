//! Per-process Unix signal table.
//!
//! Decides, per signal, whether a signal stop is passed to the inferior
//! (suppress), surfaced to clients (stop), and announced at all (notify).

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Handling policy of one signal
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnixSignal
{
    /// Signal number
    pub signo: i32,
    /// Canonical name, e.g. `SIGSEGV`
    pub name: &'static str,
    /// Do not deliver the signal to the inferior on resume
    pub suppress: bool,
    /// Stop the process when the signal arrives
    pub stop: bool,
    /// Tell clients about the signal even when not stopping
    pub notify: bool,
}

/// Signal table seeded with the host's signal numbers
#[derive(Debug)]
pub struct UnixSignals
{
    signals: Mutex<BTreeMap<i32, UnixSignal>>,
}

impl Default for UnixSignals
{
    fn default() -> Self
    {
        // (signo, name, suppress, stop, notify)
        let defaults: &[(i32, &'static str, bool, bool, bool)] = &[
            (libc::SIGHUP, "SIGHUP", false, true, true),
            (libc::SIGINT, "SIGINT", true, true, true),
            (libc::SIGQUIT, "SIGQUIT", false, true, true),
            (libc::SIGILL, "SIGILL", false, true, true),
            (libc::SIGTRAP, "SIGTRAP", true, true, true),
            (libc::SIGABRT, "SIGABRT", false, true, true),
            (libc::SIGBUS, "SIGBUS", false, true, true),
            (libc::SIGFPE, "SIGFPE", false, true, true),
            (libc::SIGKILL, "SIGKILL", false, true, true),
            (libc::SIGUSR1, "SIGUSR1", false, true, true),
            (libc::SIGSEGV, "SIGSEGV", false, true, true),
            (libc::SIGUSR2, "SIGUSR2", false, true, true),
            (libc::SIGPIPE, "SIGPIPE", false, true, true),
            (libc::SIGALRM, "SIGALRM", false, false, false),
            (libc::SIGTERM, "SIGTERM", false, true, true),
            (libc::SIGCHLD, "SIGCHLD", false, false, false),
            (libc::SIGCONT, "SIGCONT", false, true, true),
            (libc::SIGSTOP, "SIGSTOP", true, true, true),
            (libc::SIGTSTP, "SIGTSTP", false, true, true),
            (libc::SIGTTIN, "SIGTTIN", false, true, true),
            (libc::SIGTTOU, "SIGTTOU", false, true, true),
            (libc::SIGURG, "SIGURG", false, false, false),
            (libc::SIGXCPU, "SIGXCPU", false, true, true),
            (libc::SIGXFSZ, "SIGXFSZ", false, true, true),
            (libc::SIGVTALRM, "SIGVTALRM", false, false, false),
            (libc::SIGPROF, "SIGPROF", false, false, false),
            (libc::SIGWINCH, "SIGWINCH", false, false, false),
            (libc::SIGIO, "SIGIO", false, false, false),
            (libc::SIGSYS, "SIGSYS", false, true, true),
        ];
        let signals = defaults
            .iter()
            .map(|&(signo, name, suppress, stop, notify)| {
                (
                    signo,
                    UnixSignal {
                        signo,
                        name,
                        suppress,
                        stop,
                        notify,
                    },
                )
            })
            .collect();
        Self {
            signals: Mutex::new(signals),
        }
    }
}

impl UnixSignals
{
    /// Table with the default policies.
    #[must_use]
    pub fn new() -> Self
    {
        Self::default()
    }

    /// Policy of `signo`.
    #[must_use]
    pub fn signal(&self, signo: i32) -> Option<UnixSignal>
    {
        self.lock().get(&signo).cloned()
    }

    /// Signal number for `name` (`SIGINT` or `INT`).
    #[must_use]
    pub fn signo_from_name(&self, name: &str) -> Option<i32>
    {
        let wanted = name.to_ascii_uppercase();
        self.lock()
            .values()
            .find(|signal| signal.name == wanted || signal.name.strip_prefix("SIG") == Some(wanted.as_str()))
            .map(|signal| signal.signo)
    }

    /// Name of `signo`, if known.
    #[must_use]
    pub fn name(&self, signo: i32) -> Option<&'static str>
    {
        self.lock().get(&signo).map(|signal| signal.name)
    }

    /// Whether a stop for `signo` should stop the process. Unknown signals stop.
    #[must_use]
    pub fn should_stop(&self, signo: i32) -> bool
    {
        self.lock().get(&signo).is_none_or(|signal| signal.stop)
    }

    /// Whether clients hear about `signo`. Unknown signals are announced.
    #[must_use]
    pub fn should_notify(&self, signo: i32) -> bool
    {
        self.lock().get(&signo).is_none_or(|signal| signal.notify)
    }

    /// Whether `signo` is withheld from the inferior on resume.
    #[must_use]
    pub fn should_suppress(&self, signo: i32) -> bool
    {
        self.lock().get(&signo).is_some_and(|signal| signal.suppress)
    }

    /// Change the stop policy. Returns `false` for unknown signals.
    pub fn set_should_stop(&self, signo: i32, stop: bool) -> bool
    {
        self.update(signo, |signal| signal.stop = stop)
    }

    /// Change the notify policy. Returns `false` for unknown signals.
    pub fn set_should_notify(&self, signo: i32, notify: bool) -> bool
    {
        self.update(signo, |signal| signal.notify = notify)
    }

    /// Change the suppress policy. Returns `false` for unknown signals.
    pub fn set_should_suppress(&self, signo: i32, suppress: bool) -> bool
    {
        self.update(signo, |signal| signal.suppress = suppress)
    }

    /// Every known signal, by number.
    #[must_use]
    pub fn signals(&self) -> Vec<UnixSignal>
    {
        self.lock().values().cloned().collect()
    }

    fn update<F>(&self, signo: i32, update: F) -> bool
    where
        F: FnOnce(&mut UnixSignal),
    {
        match self.lock().get_mut(&signo) {
            Some(signal) => {
                update(signal);
                true
            }
            None => false,
        }
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<i32, UnixSignal>>
    {
        self.signals.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests
{
    use super::*;

    #[test]
    fn quiet_signals_neither_stop_nor_notify()
    {
        let signals = UnixSignals::new();
        assert!(!signals.should_stop(libc::SIGCHLD));
        assert!(!signals.should_notify(libc::SIGCHLD));
        assert!(signals.should_stop(libc::SIGSEGV));
        assert!(signals.should_notify(libc::SIGSEGV));
    }

    #[test]
    fn unknown_signals_stop_and_notify()
    {
        let signals = UnixSignals::new();
        assert!(signals.should_stop(1_000));
        assert!(signals.should_notify(1_000));
        assert!(!signals.set_should_stop(1_000, false));
    }

    #[test]
    fn names_resolve_with_or_without_prefix()
    {
        let signals = UnixSignals::new();
        assert_eq!(signals.signo_from_name("SIGINT"), Some(libc::SIGINT));
        assert_eq!(signals.signo_from_name("int"), Some(libc::SIGINT));
        assert_eq!(signals.name(libc::SIGSTOP), Some("SIGSTOP"));
    }

    #[test]
    fn policies_can_be_changed()
    {
        let signals = UnixSignals::new();
        assert!(signals.set_should_stop(libc::SIGUSR1, false));
        assert!(!signals.should_stop(libc::SIGUSR1));
        assert!(signals.should_notify(libc::SIGUSR1));
    }
}
