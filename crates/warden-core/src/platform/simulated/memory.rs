//! Sparse address space of the simulated inferior.

use std::collections::BTreeMap;

use crate::error::{WardenError, WardenResult};
use crate::memory::Permissions;
use crate::types::Address;

#[derive(Debug, Clone)]
struct Region
{
    bytes: Vec<u8>,
    permissions: Permissions,
}

impl Region
{
    fn end(&self, start: u64) -> u64
    {
        start.saturating_add(self.bytes.len() as u64)
    }
}

/// Mapped regions keyed by start address
///
/// Regions never overlap; mapping over an existing region replaces it.
/// Reads need [`Permissions::READ`]. Writes need write or execute
/// permission, the way a debugger may patch code pages but not read-only
/// data.
#[derive(Debug, Clone, Default)]
pub struct SimulatedMemory
{
    regions: BTreeMap<u64, Region>,
}

impl SimulatedMemory
{
    #[must_use]
    pub fn new() -> Self
    {
        Self::default()
    }

    /// Map `bytes` at `address`, dropping any region it overlaps.
    pub fn map(&mut self, address: Address, bytes: Vec<u8>, permissions: Permissions)
    {
        let start = address.value();
        let end = start.saturating_add(bytes.len() as u64);
        let overlapping: Vec<u64> = self
            .regions
            .iter()
            .filter(|(other, region)| **other < end && region.end(**other) > start)
            .map(|(other, _)| *other)
            .collect();
        for other in overlapping {
            self.regions.remove(&other);
        }
        self.regions.insert(start, Region { bytes, permissions });
    }

    /// Unmap the region starting at `address`. Returns whether one existed.
    pub fn unmap(&mut self, address: Address) -> bool
    {
        self.regions.remove(&address.value()).is_some()
    }

    /// Change the permissions of the region containing `address`.
    pub fn protect(&mut self, address: Address, permissions: Permissions) -> bool
    {
        match self.region_mut(address.value()) {
            Some((_, region)) => {
                region.permissions = permissions;
                true
            }
            None => false,
        }
    }

    /// Permissions at `address`, `None` when unmapped.
    #[must_use]
    pub fn permissions_at(&self, address: Address) -> Option<Permissions>
    {
        self.region(address.value()).map(|(_, region)| region.permissions)
    }

    /// Copy from the region containing `address`. Stops at the region end.
    pub fn read(&self, address: Address, buffer: &mut [u8]) -> WardenResult<usize>
    {
        let fail = |reason: &str| WardenError::MemoryRead {
            address,
            size: buffer.len(),
            reason: reason.to_string(),
        };
        let (start, region) = self.region(address.value()).ok_or_else(|| fail("address not mapped"))?;
        if !region.permissions.contains(Permissions::READ) {
            return Err(fail("region is not readable"));
        }
        let offset = (address.value() - start) as usize;
        let count = buffer.len().min(region.bytes.len() - offset);
        buffer[..count].copy_from_slice(&region.bytes[offset..offset + count]);
        Ok(count)
    }

    /// Copy into the region containing `address`. Stops at the region end.
    pub fn write(&mut self, address: Address, data: &[u8]) -> WardenResult<usize>
    {
        let size = data.len();
        let fail = |reason: &str| WardenError::MemoryWrite {
            address,
            size,
            reason: reason.to_string(),
        };
        let (start, region) = self.region_mut(address.value()).ok_or_else(|| fail("address not mapped"))?;
        if !region.permissions.contains(Permissions::WRITE) && !region.permissions.contains(Permissions::EXECUTE) {
            return Err(fail("region is read-only"));
        }
        let offset = (address.value() - start) as usize;
        let count = size.min(region.bytes.len() - offset);
        region.bytes[offset..offset + count].copy_from_slice(&data[..count]);
        Ok(count)
    }

    fn region(&self, address: u64) -> Option<(u64, &Region)>
    {
        let (start, region) = self.regions.range(..=address).next_back()?;
        (address < region.end(*start)).then_some((*start, region))
    }

    fn region_mut(&mut self, address: u64) -> Option<(u64, &mut Region)>
    {
        let (start, region) = self.regions.range_mut(..=address).next_back()?;
        let start = *start;
        (address < region.end(start)).then_some((start, region))
    }
}

#[cfg(test)]
mod tests
{
    use super::*;

    #[test]
    fn reads_stop_at_region_end()
    {
        let mut memory = SimulatedMemory::new();
        memory.map(Address::new(0x1000), vec![1, 2, 3, 4], Permissions::READ_WRITE);
        let mut buffer = [0u8; 8];
        assert_eq!(memory.read(Address::new(0x1002), &mut buffer), Ok(2));
        assert_eq!(&buffer[..2], &[3, 4]);
        assert!(memory.read(Address::new(0x1004), &mut buffer).is_err());
    }

    #[test]
    fn code_is_patchable_but_rodata_is_not()
    {
        let mut memory = SimulatedMemory::new();
        memory.map(Address::new(0x1000), vec![0x90; 16], Permissions::READ | Permissions::EXECUTE);
        memory.map(Address::new(0x2000), vec![0; 16], Permissions::READ);
        assert_eq!(memory.write(Address::new(0x1000), &[0xCC]), Ok(1));
        assert!(memory.write(Address::new(0x2000), &[0xCC]).is_err());
    }

    #[test]
    fn mapping_over_a_region_replaces_it()
    {
        let mut memory = SimulatedMemory::new();
        memory.map(Address::new(0x1000), vec![1; 0x100], Permissions::READ);
        memory.map(Address::new(0x1080), vec![2; 0x10], Permissions::READ);
        assert_eq!(memory.permissions_at(Address::new(0x1000)), None);
        let mut byte = [0u8; 1];
        assert_eq!(memory.read(Address::new(0x1080), &mut byte), Ok(1));
        assert_eq!(byte, [2]);
    }
}
