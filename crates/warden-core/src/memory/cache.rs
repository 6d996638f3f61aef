//! Line-based read cache for inferior memory.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::trace;

use crate::error::WardenResult;
use crate::types::Address;

#[derive(Clone)]
struct CacheLine
{
    bytes: Arc<[u8]>,
    stop_id: u32,
}

/// Read cache keyed by line-aligned address
///
/// Only complete lines are cached. A line that cannot be read in full (it
/// straddles the end of a mapping, for example) is bypassed and the caller's
/// range is read directly instead. Lines remember the stop id they were read
/// at and are ignored once the process has stopped again.
pub struct MemoryCache
{
    line_size: usize,
    lines: Mutex<BTreeMap<u64, CacheLine>>,
}

impl MemoryCache
{
    /// Create a cache with `line_size` byte lines (rounded up to a power of two).
    #[must_use]
    pub fn new(line_size: usize) -> Self
    {
        Self {
            line_size: line_size.max(1).next_power_of_two(),
            lines: Mutex::new(BTreeMap::new()),
        }
    }

    /// Line size in bytes.
    #[must_use]
    pub const fn line_size(&self) -> usize
    {
        self.line_size
    }

    /// Number of cached lines.
    #[must_use]
    pub fn len(&self) -> usize
    {
        self.lock().len()
    }

    /// Whether nothing is cached.
    #[must_use]
    pub fn is_empty(&self) -> bool
    {
        self.lock().is_empty()
    }

    /// Drop every cached line.
    pub fn clear(&self)
    {
        self.lock().clear();
    }

    /// Drop the lines overlapping `[address, address + size)`.
    pub fn flush(&self, address: Address, size: usize)
    {
        if size == 0 {
            return;
        }
        let line_size = self.line_size as u64;
        let first = address.align_down(line_size).value();
        let last = address.saturating_add(size as u64 - 1).align_down(line_size).value();
        let mut lines = self.lock();
        let doomed: Vec<u64> = lines.range(first..=last).map(|(base, _)| *base).collect();
        for base in doomed {
            lines.remove(&base);
        }
    }

    /// Fill `buffer` from `address`, reading missing lines through `read`.
    ///
    /// `read` performs an uncached read and returns the number of bytes it
    /// produced. Returns the number of bytes placed in `buffer`; a short
    /// count means the range ran into unreadable memory.
    ///
    /// ## Errors
    ///
    /// Returns the error of `read` when not a single byte could be read.
    pub fn read<F>(&self, address: Address, buffer: &mut [u8], stop_id: u32, mut read: F) -> WardenResult<usize>
    where
        F: FnMut(Address, &mut [u8]) -> WardenResult<usize>,
    {
        let line_size = self.line_size as u64;
        let mut done = 0usize;
        while done < buffer.len() {
            let current = address + done as u64;
            let base = current.align_down(line_size);
            let offset = (current.value() - base.value()) as usize;

            let line = match self.cached_line(base, stop_id) {
                Some(line) => Some(line),
                None => self.fill_line(base, stop_id, &mut read),
            };

            match line {
                Some(line) => {
                    let count = (line.len() - offset).min(buffer.len() - done);
                    buffer[done..done + count].copy_from_slice(&line[offset..offset + count]);
                    done += count;
                }
                None => {
                    // Line not readable as a whole; fall back to a direct read of what is left.
                    return match read(current, &mut buffer[done..]) {
                        Ok(count) => Ok(done + count),
                        Err(err) if done == 0 => Err(err),
                        Err(_) => Ok(done),
                    };
                }
            }
        }
        Ok(done)
    }

    fn cached_line(&self, base: Address, stop_id: u32) -> Option<Arc<[u8]>>
    {
        let mut lines = self.lock();
        match lines.get(&base.value()) {
            Some(line) if line.stop_id == stop_id => Some(Arc::clone(&line.bytes)),
            Some(_) => {
                lines.remove(&base.value());
                None
            }
            None => None,
        }
    }

    fn fill_line<F>(&self, base: Address, stop_id: u32, read: &mut F) -> Option<Arc<[u8]>>
    where
        F: FnMut(Address, &mut [u8]) -> WardenResult<usize>,
    {
        let mut bytes = vec![0u8; self.line_size];
        match read(base, &mut bytes) {
            Ok(count) if count == self.line_size => {
                let bytes: Arc<[u8]> = bytes.into();
                self.lock().insert(
                    base.value(),
                    CacheLine {
                        bytes: Arc::clone(&bytes),
                        stop_id,
                    },
                );
                trace!(line = %base, "cached memory line");
                Some(bytes)
            }
            _ => None,
        }
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<u64, CacheLine>>
    {
        self.lines.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for MemoryCache
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result
    {
        f.debug_struct("MemoryCache")
            .field("line_size", &self.line_size)
            .field("lines", &self.len())
            .finish()
    }
}
