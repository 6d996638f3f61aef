//! Buffered inferior output and forwarded input.

use std::sync::atomic::Ordering;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tracing::trace;

use super::Process;
use crate::error::{WardenError, WardenResult};
use crate::events::{Event, EventData, EventMask};

#[derive(Debug, Default)]
pub(crate) struct StdioBuffers
{
    stdout: Mutex<Vec<u8>>,
    stderr: Mutex<Vec<u8>>,
}

impl StdioBuffers
{
    fn stdout(&self) -> MutexGuard<'_, Vec<u8>>
    {
        self.stdout.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn stderr(&self) -> MutexGuard<'_, Vec<u8>>
    {
        self.stderr.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn drain(buffer: &mut Vec<u8>, max: usize) -> Vec<u8>
{
    let count = max.min(buffer.len());
    buffer.drain(..count).collect()
}

impl Process
{
    /// Buffer inferior stdout and announce it once per listener.
    pub fn append_stdout(&self, bytes: &[u8])
    {
        if bytes.is_empty() {
            return;
        }
        self.stdio.stdout().extend_from_slice(bytes);
        trace!(count = bytes.len(), "stdout buffered");
        self.broadcaster().broadcast_if_unique(Event::new(EventMask::STDOUT, EventData::Empty));
    }

    /// Buffer inferior stderr and announce it once per listener.
    pub fn append_stderr(&self, bytes: &[u8])
    {
        if bytes.is_empty() {
            return;
        }
        self.stdio.stderr().extend_from_slice(bytes);
        trace!(count = bytes.len(), "stderr buffered");
        self.broadcaster().broadcast_if_unique(Event::new(EventMask::STDERR, EventData::Empty));
    }

    /// Take up to `max` buffered stdout bytes.
    pub fn get_stdout(&self, max: usize) -> Vec<u8>
    {
        drain(&mut self.stdio.stdout(), max)
    }

    /// Take up to `max` buffered stderr bytes.
    pub fn get_stderr(&self, max: usize) -> Vec<u8>
    {
        drain(&mut self.stdio.stderr(), max)
    }

    /// Forward `data` to the inferior's stdin. Only possible while it runs.
    pub fn put_stdin(&self, data: &[u8]) -> WardenResult<usize>
    {
        if !self.input_reader_active.load(Ordering::SeqCst) {
            return Err(WardenError::invalid_state("put_stdin", self.public_state()));
        }
        self.backend.put_stdin(data)
    }

    pub(crate) fn push_input_reader(&self)
    {
        if !self.input_reader_active.swap(true, Ordering::SeqCst) {
            trace!(pid = %self.pid_string(), "input reader pushed");
        }
    }

    pub(crate) fn pop_input_reader(&self)
    {
        if self.input_reader_active.swap(false, Ordering::SeqCst) {
            trace!(pid = %self.pid_string(), "input reader popped");
        }
    }
}
