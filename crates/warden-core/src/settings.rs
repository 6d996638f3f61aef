//! # Process Settings
//!
//! Tunables for a [`Process`](crate::process::Process): memory cache geometry,
//! the bounded waits used by `halt` and `run_thread_plan`, and the scratch
//! allocation block size.
//!
//! ## Environment Variables
//!
//! [`ProcessSettings::from_env`] starts from the defaults and applies:
//!
//! - `WARDEN_MEMORY_CACHE_LINE_SIZE`: cache line size in bytes (power of two)
//! - `WARDEN_DISABLE_MEMORY_CACHE`: `1`/`true` bypasses the read cache
//! - `WARDEN_HALT_TIMEOUT_MS`: how long `halt` waits for the stop event
//! - `WARDEN_ALL_THREADS_TIMEOUT_MS`: second-phase timeout of `run_thread_plan`
//!
//! Values that fail to parse are logged and ignored.

use std::env;
use std::str::FromStr;
use std::time::Duration;

use tracing::warn;

/// Settings consulted by the process core
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessSettings
{
    /// Size of one memory cache line in bytes
    pub memory_cache_line_size: usize,
    /// Read straight from the inferior, never from the cache
    pub disable_memory_cache: bool,
    /// How long `halt` waits for the stop event it caused
    pub halt_timeout: Duration,
    /// How long `run_thread_plan` waits for the running event after a resume
    pub running_event_timeout: Duration,
    /// Timeout of the all-threads phase of `run_thread_plan`
    pub all_threads_timeout: Duration,
    /// How long a control message waits for the private-state task to acknowledge it
    pub control_ack_timeout: Duration,
    /// How long `launch` waits for the initial stop
    pub launch_stop_timeout: Duration,
    /// Granularity of blocks requested from the backend for scratch memory
    pub allocation_block_size: usize,
}

impl Default for ProcessSettings
{
    fn default() -> Self
    {
        Self {
            memory_cache_line_size: 512,
            disable_memory_cache: false,
            halt_timeout: Duration::from_secs(1),
            running_event_timeout: Duration::from_millis(500),
            all_threads_timeout: Duration::from_secs(10),
            control_ack_timeout: Duration::from_secs(2),
            launch_stop_timeout: Duration::from_secs(10),
            allocation_block_size: 4096,
        }
    }
}

impl ProcessSettings
{
    /// Defaults overridden by `WARDEN_*` environment variables.
    #[must_use]
    pub fn from_env() -> Self
    {
        let mut settings = Self::default();
        if let Some(size) = env_value::<usize>("WARDEN_MEMORY_CACHE_LINE_SIZE") {
            if size.is_power_of_two() {
                settings.memory_cache_line_size = size;
            } else {
                warn!(size, "WARDEN_MEMORY_CACHE_LINE_SIZE must be a power of two, ignoring");
            }
        }
        if let Ok(raw) = env::var("WARDEN_DISABLE_MEMORY_CACHE") {
            settings.disable_memory_cache = matches!(raw.to_lowercase().as_str(), "1" | "true" | "yes" | "on");
        }
        if let Some(ms) = env_value::<u64>("WARDEN_HALT_TIMEOUT_MS") {
            settings.halt_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = env_value::<u64>("WARDEN_ALL_THREADS_TIMEOUT_MS") {
            settings.all_threads_timeout = Duration::from_millis(ms);
        }
        settings
    }

    /// Set the memory cache line size (rounded up to a power of two).
    #[must_use]
    pub fn with_memory_cache_line_size(mut self, size: usize) -> Self
    {
        self.memory_cache_line_size = size.max(1).next_power_of_two();
        self
    }

    /// Enable or disable the memory read cache.
    #[must_use]
    pub const fn with_memory_cache_disabled(mut self, disabled: bool) -> Self
    {
        self.disable_memory_cache = disabled;
        self
    }

    /// Set the halt wait.
    #[must_use]
    pub const fn with_halt_timeout(mut self, timeout: Duration) -> Self
    {
        self.halt_timeout = timeout;
        self
    }

    /// Set the all-threads phase timeout of `run_thread_plan`.
    #[must_use]
    pub const fn with_all_threads_timeout(mut self, timeout: Duration) -> Self
    {
        self.all_threads_timeout = timeout;
        self
    }
}

fn env_value<T>(key: &str) -> Option<T>
where
    T: FromStr,
{
    let raw = env::var(key).ok()?;
    match raw.trim().parse::<T>() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(key, value = %raw, "ignoring unparsable setting");
            None
        }
    }
}
