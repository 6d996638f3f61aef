//! # Materializer
//!
//! Stages the variables an expression uses into one argument struct in
//! inferior memory, and copies them back out afterwards.
//!
//! ## Layout
//!
//! Each entity gets a slot at an offset aligned for it:
//!
//! | entity     | slot holds                          | copied back |
//! |------------|-------------------------------------|-------------|
//! | variable   | pointer to the variable in memory   | no          |
//! | register   | register value                      | yes         |
//! | persistent | the `$name` variable's bytes        | yes         |
//! | symbol     | load address of the symbol          | no          |
//! | result     | space for the result                | as a value  |
//!
//! The scratch block is allocated with room for the struct alignment, so
//! the struct itself is aligned however the allocation falls.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::error::{WardenError, WardenResult};
use crate::memory::Permissions;
use crate::process::Process;
use crate::target::Target;
use crate::thread::Thread;
use crate::types::{Address, RegisterId};
use crate::value::{ValueObject, ValueType};

/// What a materializer slot is for
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntityKind
{
    /// Variable in memory, passed by reference
    Variable
    {
        address: Address,
    },
    /// Variable in a register, passed by value
    Register
    {
        id: RegisterId,
    },
    /// Persistent `$` variable of the target
    Persistent,
    /// Symbol resolved through the target's images
    Symbol,
    /// The expression result
    Result,
}

/// One slot of the argument struct
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entity
{
    pub name: String,
    pub ty: ValueType,
    pub kind: EntityKind,
    /// Byte offset within the struct
    pub offset: u64,
}

/// Layout of an expression's argument struct
#[derive(Debug, Clone)]
pub struct Materializer
{
    entities: Vec<Entity>,
    size: u64,
    alignment: u64,
}

const POINTER_SIZE: u64 = 8;

impl Materializer
{
    #[must_use]
    pub const fn new() -> Self
    {
        Self {
            entities: Vec::new(),
            size: 0,
            alignment: 1,
        }
    }

    fn add(&mut self, name: &str, ty: ValueType, kind: EntityKind, slot_size: u64, slot_alignment: u64) -> u64
    {
        let alignment = slot_alignment.max(1);
        let offset = self.size.next_multiple_of(alignment);
        self.size = offset + slot_size;
        self.alignment = self.alignment.max(alignment);
        self.entities.push(Entity {
            name: name.to_string(),
            ty,
            kind,
            offset,
        });
        offset
    }

    /// Add a variable stored at `address`. Returns its slot offset.
    pub fn add_variable(&mut self, name: &str, ty: ValueType, address: Address) -> u64
    {
        self.add(name, ty, EntityKind::Variable { address }, POINTER_SIZE, POINTER_SIZE)
    }

    /// Add a variable held in register `id`.
    pub fn add_register(&mut self, name: &str, ty: ValueType, id: RegisterId) -> u64
    {
        let (size, alignment) = (ty.byte_size() as u64, ty.alignment() as u64);
        self.add(name, ty, EntityKind::Register { id }, size, alignment)
    }

    /// Add the persistent variable `name` (conventionally `$name`).
    pub fn add_persistent_variable(&mut self, name: &str, ty: ValueType) -> u64
    {
        let (size, alignment) = (ty.byte_size() as u64, ty.alignment() as u64);
        self.add(name, ty, EntityKind::Persistent, size, alignment)
    }

    /// Add a pointer to the symbol `name`.
    pub fn add_symbol(&mut self, name: &str) -> u64
    {
        self.add(name, ValueType::uint64(), EntityKind::Symbol, POINTER_SIZE, POINTER_SIZE)
    }

    /// Add the result slot.
    ///
    /// ## Errors
    ///
    /// Only one result slot is allowed.
    pub fn add_result(&mut self, ty: ValueType) -> WardenResult<u64>
    {
        if self.result_entity().is_some() {
            return Err(WardenError::Expression("expression already has a result variable".to_string()));
        }
        let (size, alignment) = (ty.byte_size() as u64, ty.alignment() as u64);
        Ok(self.add("$result", ty, EntityKind::Result, size, alignment))
    }

    #[must_use]
    pub fn entities(&self) -> &[Entity]
    {
        &self.entities
    }

    /// The result slot, if any.
    #[must_use]
    pub fn result_entity(&self) -> Option<&Entity>
    {
        self.entities
            .iter()
            .find(|entity| entity.kind == EntityKind::Result)
    }

    #[must_use]
    pub const fn struct_size(&self) -> u64
    {
        self.size
    }

    #[must_use]
    pub const fn struct_alignment(&self) -> u64
    {
        self.alignment
    }

    /// Allocate the argument struct in `process` and fill every slot.
    ///
    /// ## Errors
    ///
    /// Allocation and staging failures. Scratch memory is released before
    /// an error is returned.
    pub fn materialize(&self, process: &Arc<Process>, thread: Option<&Arc<Thread>>) -> WardenResult<Dematerializer>
    {
        let allocation_size = (self.alignment + self.size.max(1)) as usize;
        let allocation = process.allocate_memory(allocation_size, Permissions::READ_WRITE)?;
        let struct_address = allocation.align_up(self.alignment);
        debug!(%struct_address, size = self.size, entities = self.entities.len(), "materializing");

        let target = process.target();
        for entity in &self.entities {
            if let Err(error) = Self::stage(process, thread, target.as_deref(), struct_address, entity) {
                if let Err(free_error) = process.deallocate_memory(allocation) {
                    warn!(%allocation, %free_error, "failed to free materializer scratch");
                }
                return Err(WardenError::Expression(format!("couldn't materialize {}: {error}", entity.name)));
            }
        }

        Ok(Dematerializer {
            process: Arc::clone(process),
            thread: thread.cloned(),
            allocation,
            struct_address,
            entities: self.entities.clone(),
        })
    }

    fn stage(
        process: &Process,
        thread: Option<&Arc<Thread>>,
        target: Option<&Target>,
        struct_address: Address,
        entity: &Entity,
    ) -> WardenResult<()>
    {
        let slot = struct_address + entity.offset;
        let size = entity.ty.byte_size();
        match &entity.kind {
            EntityKind::Variable { address } => process.write_pointer_to_memory(slot, *address),
            EntityKind::Register { id } => {
                let thread = thread.ok_or_else(|| WardenError::Expression("register variable needs a thread".to_string()))?;
                let value = thread.read_register(*id)?;
                write_all(process, slot, &process.byte_order().encode(value, size.min(8)))
            }
            EntityKind::Persistent => {
                let target = target.ok_or_else(|| WardenError::Expression("no target for persistent variables".to_string()))?;
                let variables = target.persistent_variables();
                let bytes = match variables.get(&entity.name) {
                    Some(variable) => variable.bytes,
                    None => {
                        variables.create(&entity.name, entity.ty.clone(), vec![0; size]);
                        vec![0; size]
                    }
                };
                write_all(process, slot, &bytes)
            }
            EntityKind::Symbol => {
                let target = target.ok_or_else(|| WardenError::Expression("no target to resolve symbols".to_string()))?;
                let address = target
                    .resolve_symbol_load_address(&entity.name)
                    .ok_or_else(|| WardenError::Expression(format!("couldn't resolve symbol {}", entity.name)))?;
                process.write_pointer_to_memory(slot, address)
            }
            EntityKind::Result => write_all(process, slot, &vec![0; size]),
        }
    }

    /// Value of `this` or `self`, for expressions evaluated in a method.
    ///
    /// ## Errors
    ///
    /// No such variable, or it cannot be read.
    pub fn get_object_pointer(&self, process: &Process, thread: Option<&Thread>) -> WardenResult<Address>
    {
        let entity = self
            .entities
            .iter()
            .find(|entity| entity.name == "this" || entity.name == "self")
            .ok_or_else(|| WardenError::Expression("no object pointer ('this' or 'self') in scope".to_string()))?;
        match &entity.kind {
            EntityKind::Variable { address } => process.read_pointer_from_memory(*address),
            EntityKind::Register { id } => {
                let thread = thread.ok_or_else(|| WardenError::Expression("register variable needs a thread".to_string()))?;
                thread.read_register(*id).map(Address::new)
            }
            _ => Err(WardenError::Expression(format!("{} is not an object pointer", entity.name))),
        }
    }
}

impl Default for Materializer
{
    fn default() -> Self
    {
        Self::new()
    }
}

/// A materialized argument struct, waiting to be read back
#[derive(Debug)]
pub struct Dematerializer
{
    process: Arc<Process>,
    thread: Option<Arc<Thread>>,
    allocation: Address,
    struct_address: Address,
    entities: Vec<Entity>,
}

impl Dematerializer
{
    /// Address of the argument struct in the inferior.
    #[must_use]
    pub const fn struct_address(&self) -> Address
    {
        self.struct_address
    }

    /// Address of the result slot.
    #[must_use]
    pub fn result_address(&self) -> Option<Address>
    {
        self.entities
            .iter()
            .find(|entity| entity.kind == EntityKind::Result)
            .map(|entity| self.struct_address + entity.offset)
    }

    /// Copy registers and persistent variables back, capture the result as
    /// a constant value, and free the scratch memory.
    pub fn dematerialize(self) -> WardenResult<Option<ValueObject>>
    {
        let outcome = self.read_back();
        self.free();
        outcome
    }

    /// Free the scratch memory without reading anything back.
    pub fn wipe(self)
    {
        self.free();
    }

    fn read_back(&self) -> WardenResult<Option<ValueObject>>
    {
        let target = self.process.target();
        let mut result = None;
        for entity in &self.entities {
            let slot = self.struct_address + entity.offset;
            let size = entity.ty.byte_size();
            match &entity.kind {
                EntityKind::Register { id } => {
                    let bytes = read_all(&self.process, slot, size)?;
                    if let Some(thread) = &self.thread {
                        thread.write_register(*id, self.process.byte_order().decode(&bytes))?;
                    }
                }
                EntityKind::Persistent => {
                    let bytes = read_all(&self.process, slot, size)?;
                    if let Some(target) = &target {
                        target.persistent_variables().update_bytes(&entity.name, bytes);
                    }
                }
                EntityKind::Result => {
                    let bytes = read_all(&self.process, slot, size)?;
                    let name = target.as_ref().map_or_else(
                        || "$result".to_string(),
                        |target| target.persistent_variables().next_result_name(),
                    );
                    if let Some(target) = &target {
                        target
                            .persistent_variables()
                            .create(&name, entity.ty.clone(), bytes.clone());
                    }
                    result = Some(ValueObject::constant(Some(&self.process), &name, entity.ty.clone(), bytes));
                }
                EntityKind::Variable { .. } | EntityKind::Symbol => {}
            }
        }
        Ok(result)
    }

    fn free(&self)
    {
        if let Err(error) = self.process.deallocate_memory(self.allocation) {
            warn!(allocation = %self.allocation, %error, "failed to free materializer scratch");
        }
    }
}

fn write_all(process: &Process, address: Address, bytes: &[u8]) -> WardenResult<()>
{
    if bytes.is_empty() {
        return Ok(());
    }
    let written = process.write_memory(address, bytes)?;
    if written == bytes.len() {
        Ok(())
    } else {
        Err(WardenError::MemoryWrite {
            address,
            size: bytes.len(),
            reason: format!("wrote {written} of {} bytes", bytes.len()),
        })
    }
}

fn read_all(process: &Process, address: Address, size: usize) -> WardenResult<Vec<u8>>
{
    let mut buffer = vec![0u8; size];
    if size == 0 {
        return Ok(buffer);
    }
    let read = process.read_memory(address, &mut buffer)?;
    if read == size {
        Ok(buffer)
    } else {
        Err(WardenError::MemoryRead {
            address,
            size,
            reason: format!("read {read} of {size} bytes"),
        })
    }
}

#[cfg(test)]
mod tests
{
    use super::*;

    #[test]
    fn slots_are_aligned_and_struct_alignment_is_the_maximum()
    {
        let mut materializer = Materializer::new();
        let flag = materializer.add_persistent_variable("$flag", ValueType::uint8());
        let pointer = materializer.add_variable("x", ValueType::int32(), Address::new(0x1000));
        let result = materializer.add_result(ValueType::int32()).unwrap();
        assert_eq!(flag, 0);
        assert_eq!(pointer, 8);
        assert_eq!(result, 16);
        assert_eq!(materializer.struct_size(), 20);
        assert_eq!(materializer.struct_alignment(), 8);
        assert!(materializer.add_result(ValueType::int32()).is_err());
    }
}
