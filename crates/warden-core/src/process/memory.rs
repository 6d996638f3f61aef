//! Inferior memory access with breakpoint shadowing.
//!
//! Clients never see trap opcodes: reads substitute the bytes each enabled
//! software site displaced, and writes that land on a trap update the site's
//! saved bytes instead of the inferior.

use tracing::{debug, trace};

use super::Process;
use crate::error::{WardenError, WardenResult};
use crate::memory::Permissions;
use crate::types::{Address, StateType};

impl Process
{
    /// Read memory through the cache, with trap opcodes replaced by the
    /// original bytes. Returns the number of bytes read.
    pub fn read_memory(&self, address: Address, buffer: &mut [u8]) -> WardenResult<usize>
    {
        if self.settings.disable_memory_cache {
            return self.read_memory_from_inferior(address, buffer);
        }
        let stop_id = self.mod_id().stop_id;
        self.memory_cache
            .read(address, buffer, stop_id, |line, bytes| self.read_memory_from_inferior(line, bytes))
    }

    /// Read memory straight from the inferior, looping over short backend
    /// reads, then remove trap opcodes.
    pub fn read_memory_from_inferior(&self, address: Address, buffer: &mut [u8]) -> WardenResult<usize>
    {
        let mut total = 0;
        let mut last_error = None;
        while total < buffer.len() {
            let Some(current) = address.checked_add(total as u64) else {
                break;
            };
            match self.backend.do_read_memory(current, &mut buffer[total..]) {
                Ok(0) => break,
                Ok(count) => total += count,
                Err(error) => {
                    last_error = Some(error);
                    break;
                }
            }
        }
        if total == 0 && !buffer.is_empty() {
            return Err(last_error.unwrap_or_else(|| WardenError::MemoryRead {
                address,
                size: buffer.len(),
                reason: "no bytes read".to_string(),
            }));
        }
        self.remove_breakpoint_opcodes_from_buffer(address, &mut buffer[..total]);
        Ok(total)
    }

    /// Replace trap bytes of enabled software sites in `buffer` (which holds
    /// memory starting at `address`) with the saved original bytes.
    pub fn remove_breakpoint_opcodes_from_buffer(&self, address: Address, buffer: &mut [u8])
    {
        let Some(end) = address.checked_add(buffer.len() as u64) else {
            return;
        };
        for site in self.site_list.find_in_range(address, end) {
            if !site.is_enabled() || site.is_hardware() {
                continue;
            }
            let Some(intersection) = site.intersects_range(address, buffer.len()) else {
                continue;
            };
            let saved = site.saved_opcode();
            let source = intersection.opcode_offset..intersection.opcode_offset + intersection.size;
            let Some(original) = saved.get(source) else {
                continue;
            };
            let offset = (intersection.address.value() - address.value()) as usize;
            buffer[offset..offset + intersection.size].copy_from_slice(original);
        }
    }

    /// Write memory, splitting around enabled software traps.
    ///
    /// Bytes that fall on a trap are stored in the site's saved opcode so
    /// they are restored when the site is disabled. Returns the number of
    /// bytes accepted.
    pub fn write_memory(&self, address: Address, data: &[u8]) -> WardenResult<usize>
    {
        if data.is_empty() {
            return Ok(0);
        }
        let end = address
            .checked_add(data.len() as u64)
            .ok_or_else(|| WardenError::InvalidArgument(format!("write at {address} wraps the address space")))?;
        self.memory_cache.flush(address, data.len());

        let sites: Vec<_> = self
            .site_list
            .find_in_range(address, end)
            .into_iter()
            .filter(|site| site.is_enabled() && !site.is_hardware())
            .collect();
        if sites.is_empty() {
            return self.write_memory_private(address, data);
        }

        let mut cursor = 0usize;
        for site in sites {
            let Some(intersection) = site.intersects_range(address, data.len()) else {
                continue;
            };
            let offset = (intersection.address.value() - address.value()) as usize;
            if offset > cursor {
                let written = self.write_memory_private(address + cursor as u64, &data[cursor..offset])?;
                if written != offset - cursor {
                    return Ok(cursor + written);
                }
            }
            trace!(
                site = %site.id(),
                address = %intersection.address,
                size = intersection.size,
                "write shadowed into saved opcode"
            );
            site.patch_saved_opcode(intersection.opcode_offset, &data[offset..offset + intersection.size]);
            cursor = offset + intersection.size;
        }
        if cursor < data.len() {
            return match self.write_memory_private(address + cursor as u64, &data[cursor..]) {
                Ok(written) => Ok(cursor + written),
                Err(error) if cursor == 0 => Err(error),
                // The shadowed bytes already landed.
                Err(error) => {
                    debug!(address = %(address + cursor as u64), %error, "write stopped after a breakpoint site");
                    Ok(cursor)
                }
            };
        }
        Ok(data.len())
    }

    fn write_memory_private(&self, address: Address, data: &[u8]) -> WardenResult<usize>
    {
        let mut total = 0;
        while total < data.len() {
            match self.backend.do_write_memory(address + total as u64, &data[total..]) {
                Ok(0) => break,
                Ok(written) => total += written,
                Err(error) if total == 0 => return Err(error),
                Err(_) => break,
            }
        }
        if total > 0 {
            self.bump_memory_id();
        }
        if total == 0 {
            return Err(WardenError::MemoryWrite {
                address,
                size: data.len(),
                reason: "no bytes written".to_string(),
            });
        }
        Ok(total)
    }

    /// Read a NUL-terminated string of at most `max_len` bytes.
    ///
    /// Reads in chunks that never cross a cache line so an unmapped page
    /// after the string does not fail the whole read.
    pub fn read_c_string_from_memory(&self, address: Address, max_len: usize) -> WardenResult<String>
    {
        let line = self.settings.memory_cache_line_size.max(1) as u64;
        let mut bytes = Vec::new();
        let mut current = address;
        while bytes.len() < max_len {
            let to_line_end = (line - current.value() % line) as usize;
            let chunk = to_line_end.min(max_len - bytes.len());
            let mut buffer = vec![0u8; chunk];
            let read = match self.read_memory(current, &mut buffer) {
                Ok(read) => read,
                Err(error) if bytes.is_empty() => return Err(error),
                Err(_) => break,
            };
            if let Some(nul) = buffer[..read].iter().position(|byte| *byte == 0) {
                bytes.extend_from_slice(&buffer[..nul]);
                break;
            }
            bytes.extend_from_slice(&buffer[..read]);
            if read < chunk {
                break;
            }
            current = current + read as u64;
        }
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    /// Read an integer of `byte_size` bytes in target byte order.
    ///
    /// Signed values are sign-extended to 64 bits.
    pub fn read_scalar_integer_from_memory(&self, address: Address, byte_size: usize, is_signed: bool) -> WardenResult<u64>
    {
        if byte_size == 0 || byte_size > 8 {
            return Err(WardenError::InvalidArgument(format!(
                "byte size {byte_size} is not supported for scalar reads"
            )));
        }
        let mut buffer = [0u8; 8];
        let read = self.read_memory(address, &mut buffer[..byte_size])?;
        if read != byte_size {
            return Err(WardenError::MemoryRead {
                address,
                size: byte_size,
                reason: format!("read {read} of {byte_size} bytes"),
            });
        }
        let value = self.byte_order().decode(&buffer[..byte_size]);
        if is_signed && byte_size < 8 {
            let shift = 64 - byte_size * 8;
            return Ok((((value << shift) as i64) >> shift) as u64);
        }
        Ok(value)
    }

    /// Read an unsigned integer, returning `fail_value` on error.
    #[must_use]
    pub fn read_unsigned_integer_from_memory(&self, address: Address, byte_size: usize, fail_value: u64) -> u64
    {
        self.read_scalar_integer_from_memory(address, byte_size, false)
            .unwrap_or(fail_value)
    }

    /// Read a pointer-sized value.
    pub fn read_pointer_from_memory(&self, address: Address) -> WardenResult<Address>
    {
        let size = self.address_byte_size();
        self.read_scalar_integer_from_memory(address, size, false)
            .map(Address::new)
    }

    /// Write a pointer-sized value.
    pub fn write_pointer_to_memory(&self, address: Address, pointer: Address) -> WardenResult<()>
    {
        let size = self.address_byte_size();
        let written = self.write_scalar_to_memory(address, pointer.value(), size)?;
        if written == size {
            Ok(())
        } else {
            Err(WardenError::MemoryWrite {
                address,
                size,
                reason: format!("wrote {written} of {size} bytes"),
            })
        }
    }

    /// Write the low `byte_size` bytes of `value` in target byte order.
    pub fn write_scalar_to_memory(&self, address: Address, value: u64, byte_size: usize) -> WardenResult<usize>
    {
        if byte_size == 0 || byte_size > 8 {
            return Err(WardenError::InvalidArgument(format!(
                "byte size {byte_size} is not supported for scalar writes"
            )));
        }
        let bytes = self.byte_order().encode(value, byte_size);
        self.write_memory(address, &bytes)
    }

    /// Whether expressions may run code in the inferior.
    #[must_use]
    pub fn can_jit(&self) -> bool
    {
        self.backend.can_jit()
    }

    /// Allocate scratch memory. Only served while the process is stopped.
    pub fn allocate_memory(&self, size: usize, permissions: Permissions) -> WardenResult<Address>
    {
        let state = self.private_state();
        if state != StateType::Stopped {
            return Err(WardenError::invalid_state("allocate_memory", state));
        }
        let address = self
            .allocated_memory
            .allocate(size, permissions, |block, perms| self.backend.do_allocate_memory(block, perms))?;
        debug!(%address, size, %permissions, "allocated inferior memory");
        Ok(address)
    }

    /// Return scratch memory obtained from [`allocate_memory`](Self::allocate_memory).
    pub fn deallocate_memory(&self, address: Address) -> WardenResult<()>
    {
        if self.allocated_memory.deallocate(address) {
            Ok(())
        } else {
            Err(WardenError::Allocation(format!(
                "deallocation of memory at 0x{:x} failed.",
                address.value()
            )))
        }
    }

    /// Hand every scratch block back to the backend.
    pub(crate) fn release_allocated_memory(&self)
    {
        for block in self.allocated_memory.clear() {
            if let Err(error) = self.backend.do_deallocate_memory(block) {
                debug!(%block, %error, "failed to release scratch block");
            }
        }
    }
}
