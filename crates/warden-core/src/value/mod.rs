//! # Values
//!
//! Live views of inferior data.
//!
//! ## Clusters
//!
//! A root value and every value derived from it (fields, elements,
//! dereferences, address-of) live in one [`ValueCluster`] arena and refer
//! to each other by index. A [`ValueObject`] is a handle: the arena plus
//! an index. The cluster is reference counted as a whole and is freed when
//! the last handle into it is dropped; individual nodes are never freed.
//!
//! ## Freshness
//!
//! Each node caches its bytes together with the stop id and memory id they
//! were read at. Reading a value after the process stopped again, or after
//! any memory write, fetches it anew. Constants never refresh.

pub mod types;

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use tracing::{debug, trace};

pub use types::{Field, ValueType};

use crate::error::{WardenError, WardenResult};
use crate::process::Process;
use crate::thread::Thread;
use crate::types::{Address, ByteOrder, RegisterId};

#[derive(Debug, Clone)]
enum ValueSource
{
    Memory(Address),
    Register
    {
        thread: Weak<Thread>,
        id: RegisterId,
    },
    Constant(Vec<u8>),
    /// Field or element at `offset` within the parent
    Child
    {
        offset: u64,
    },
    /// Pointee of the parent pointer
    Dereference,
    /// Address of the parent
    AddressOf,
}

#[derive(Debug, Default, Clone)]
struct Cached
{
    data: Option<Vec<u8>>,
    address: Option<Address>,
    stop_id: u32,
    memory_id: u32,
    error: Option<String>,
}

#[derive(Debug)]
struct ValueNode
{
    name: String,
    ty: ValueType,
    parent: Option<usize>,
    source: ValueSource,
    children: Vec<Option<usize>>,
    synthetic: [Option<usize>; 2],
    cached: Cached,
}

const DEREFERENCE_SLOT: usize = 0;
const ADDRESS_OF_SLOT: usize = 1;

/// Arena holding every value derived from one root
pub struct ValueCluster
{
    process: Weak<Process>,
    byte_order: ByteOrder,
    address_byte_size: usize,
    nodes: Mutex<Vec<ValueNode>>,
}

impl ValueCluster
{
    fn with_root(process: Weak<Process>, byte_order: ByteOrder, address_byte_size: usize, root: ValueNode) -> Arc<Self>
    {
        Arc::new(Self {
            process,
            byte_order,
            address_byte_size,
            nodes: Mutex::new(vec![root]),
        })
    }

    /// Number of values materialized in this cluster so far.
    #[must_use]
    pub fn len(&self) -> usize
    {
        self.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool
    {
        self.lock().is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<ValueNode>>
    {
        self.nodes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn push(nodes: &mut Vec<ValueNode>, node: ValueNode) -> usize
    {
        nodes.push(node);
        nodes.len() - 1
    }

    /// Bring `index` (and its ancestors) up to date.
    fn update(&self, nodes: &mut Vec<ValueNode>, index: usize)
    {
        let process = self.process.upgrade();
        let mod_id = process.as_ref().map(|process| process.mod_id()).unwrap_or_default();
        {
            let node = &nodes[index];
            let constant = matches!(node.source, ValueSource::Constant(_));
            let fresh = node.cached.stop_id == mod_id.stop_id && node.cached.memory_id == mod_id.memory_id;
            if node.cached.data.is_some() && (constant || fresh) {
                return;
            }
        }
        if let Some(parent) = nodes[index].parent {
            self.update(nodes, parent);
        }

        let size = nodes[index].ty.byte_size();
        let result = self.fetch(nodes, index, process.as_deref(), size);
        let node = &mut nodes[index];
        node.cached.stop_id = mod_id.stop_id;
        node.cached.memory_id = mod_id.memory_id;
        match result {
            Ok((data, address)) => {
                trace!(name = %node.name, size, "value updated");
                node.cached.data = Some(data);
                node.cached.address = address;
                node.cached.error = None;
            }
            Err(error) => {
                debug!(name = %node.name, %error, "value update failed");
                node.cached.data = None;
                node.cached.address = None;
                node.cached.error = Some(error.to_string());
            }
        }
    }

    fn fetch(
        &self,
        nodes: &[ValueNode],
        index: usize,
        process: Option<&Process>,
        size: usize,
    ) -> WardenResult<(Vec<u8>, Option<Address>)>
    {
        let node = &nodes[index];
        let parent = node.parent.map(|parent| &nodes[parent].cached);
        let read_at = |address: Address| -> WardenResult<(Vec<u8>, Option<Address>)> {
            let process = process.ok_or(WardenError::NotAttached)?;
            let mut buffer = vec![0u8; size];
            let read = process.read_memory(address, &mut buffer)?;
            if read != size {
                return Err(WardenError::MemoryRead {
                    address,
                    size,
                    reason: format!("read {read} of {size} bytes"),
                });
            }
            Ok((buffer, Some(address)))
        };

        match &node.source {
            ValueSource::Memory(address) => read_at(*address),
            ValueSource::Constant(bytes) => Ok((bytes.clone(), None)),
            ValueSource::Register { thread, id } => {
                let thread = thread
                    .upgrade()
                    .ok_or_else(|| WardenError::InvalidArgument("thread is gone".to_string()))?;
                let value = thread.read_register(*id)?;
                Ok((self.byte_order.encode(value, size), None))
            }
            ValueSource::Child { offset } => {
                let parent = parent.ok_or_else(|| WardenError::InvalidArgument("child without parent".to_string()))?;
                if let Some(error) = &parent.error {
                    return Err(WardenError::InvalidArgument(error.clone()));
                }
                if let Some(base) = parent.address {
                    return read_at(base + *offset);
                }
                let data = parent.data.as_deref().unwrap_or_default();
                let start = *offset as usize;
                data.get(start..start + size)
                    .map(|bytes| (bytes.to_vec(), None))
                    .ok_or_else(|| WardenError::InvalidArgument(format!("child at offset {offset} is out of bounds")))
            }
            ValueSource::Dereference => {
                let parent = parent.ok_or_else(|| WardenError::InvalidArgument("dereference without parent".to_string()))?;
                let data = parent
                    .data
                    .as_deref()
                    .ok_or_else(|| WardenError::InvalidArgument(parent.error.clone().unwrap_or_default()))?;
                let pointer = Address::new(self.byte_order.decode(data));
                if pointer == Address::ZERO {
                    return Err(WardenError::InvalidArgument("dereference of a null pointer".to_string()));
                }
                read_at(pointer)
            }
            ValueSource::AddressOf => {
                let parent = parent.ok_or_else(|| WardenError::InvalidArgument("address-of without parent".to_string()))?;
                let address = parent
                    .address
                    .ok_or_else(|| WardenError::InvalidArgument("value has no address".to_string()))?;
                Ok((self.byte_order.encode(address.value(), self.address_byte_size), None))
            }
        }
    }
}

impl fmt::Debug for ValueCluster
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        f.debug_struct("ValueCluster")
            .field("nodes", &self.len())
            .finish_non_exhaustive()
    }
}

/// Handle to one value in a [`ValueCluster`]
#[derive(Clone)]
pub struct ValueObject
{
    cluster: Arc<ValueCluster>,
    index: usize,
}

impl ValueObject
{
    fn root(process: Weak<Process>, byte_order: ByteOrder, address_byte_size: usize, name: &str, ty: ValueType, source: ValueSource) -> Self
    {
        let node = ValueNode {
            name: name.to_string(),
            children: vec![None; ty.num_children()],
            ty,
            parent: None,
            source,
            synthetic: [None, None],
            cached: Cached::default(),
        };
        Self {
            cluster: ValueCluster::with_root(process, byte_order, address_byte_size, node),
            index: 0,
        }
    }

    /// A variable living in inferior memory at `address`.
    #[must_use]
    pub fn memory_variable(process: &Arc<Process>, name: &str, ty: ValueType, address: Address) -> Self
    {
        Self::root(
            Arc::downgrade(process),
            process.byte_order(),
            process.address_byte_size(),
            name,
            ty,
            ValueSource::Memory(address),
        )
    }

    /// A variable held in register `id` of `thread`.
    #[must_use]
    pub fn register_variable(process: &Arc<Process>, thread: &Arc<Thread>, name: &str, ty: ValueType, id: RegisterId) -> Self
    {
        Self::root(
            Arc::downgrade(process),
            process.byte_order(),
            process.address_byte_size(),
            name,
            ty,
            ValueSource::Register {
                thread: Arc::downgrade(thread),
                id,
            },
        )
    }

    /// A value whose bytes are captured and never refreshed.
    #[must_use]
    pub fn constant(process: Option<&Arc<Process>>, name: &str, ty: ValueType, bytes: Vec<u8>) -> Self
    {
        let (weak, byte_order, address_size) = process.map_or((Weak::new(), ByteOrder::Little, 8), |process| {
            (Arc::downgrade(process), process.byte_order(), process.address_byte_size())
        });
        Self::root(weak, byte_order, address_size, name, ty, ValueSource::Constant(bytes))
    }

    fn lock(&self) -> MutexGuard<'_, Vec<ValueNode>>
    {
        self.cluster.lock()
    }

    fn with_updated<R>(&self, read: impl FnOnce(&ValueNode) -> R) -> R
    {
        let mut nodes = self.lock();
        self.cluster.update(&mut nodes, self.index);
        read(&nodes[self.index])
    }

    /// The arena this value belongs to.
    #[must_use]
    pub const fn cluster(&self) -> &Arc<ValueCluster>
    {
        &self.cluster
    }

    #[must_use]
    pub fn name(&self) -> String
    {
        self.lock()[self.index].name.clone()
    }

    #[must_use]
    pub fn value_type(&self) -> ValueType
    {
        self.lock()[self.index].ty.clone()
    }

    #[must_use]
    pub fn byte_size(&self) -> usize
    {
        self.lock()[self.index].ty.byte_size()
    }

    /// Parent value, for derived values.
    #[must_use]
    pub fn parent(&self) -> Option<ValueObject>
    {
        let parent = self.lock()[self.index].parent?;
        Some(self.handle(parent))
    }

    fn handle(&self, index: usize) -> ValueObject
    {
        ValueObject {
            cluster: Arc::clone(&self.cluster),
            index,
        }
    }

    /// Load address, when the value lives in memory.
    #[must_use]
    pub fn address(&self) -> Option<Address>
    {
        self.with_updated(|node| node.cached.address)
    }

    /// Current bytes of the value.
    pub fn data(&self) -> WardenResult<Vec<u8>>
    {
        self.with_updated(|node| match (&node.cached.data, &node.cached.error) {
            (Some(data), _) => Ok(data.clone()),
            (None, Some(error)) => Err(WardenError::InvalidArgument(error.clone())),
            (None, None) => Err(WardenError::InvalidArgument(format!("{} has no value", node.name))),
        })
    }

    /// Why the value could not be read, if it could not.
    #[must_use]
    pub fn error(&self) -> Option<String>
    {
        self.with_updated(|node| node.cached.error.clone())
    }

    /// Whether the value can currently be read.
    #[must_use]
    pub fn is_valid(&self) -> bool
    {
        self.error().is_none()
    }

    /// The value as an unsigned scalar, `fail_value` when unreadable or not
    /// a scalar.
    #[must_use]
    pub fn value_as_unsigned(&self, fail_value: u64) -> u64
    {
        if !self.value_type().is_scalar() {
            return fail_value;
        }
        self.data()
            .map_or(fail_value, |data| self.cluster.byte_order.decode(&data))
    }

    /// The value as a signed scalar, sign-extended from its size.
    #[must_use]
    pub fn value_as_signed(&self, fail_value: i64) -> i64
    {
        let ty = self.value_type();
        if !ty.is_scalar() {
            return fail_value;
        }
        let Ok(data) = self.data() else {
            return fail_value;
        };
        let value = self.cluster.byte_order.decode(&data);
        let size = ty.byte_size().min(8);
        if size == 0 || size == 8 {
            return value as i64;
        }
        let shift = 64 - size * 8;
        ((value << shift) as i64) >> shift
    }

    /// Store `value` into the value's location.
    ///
    /// Memory-backed values are written with [`Process::write_memory`], so
    /// writes over breakpoint traps land in the saved opcodes.
    pub fn set_value_from_unsigned(&self, value: u64) -> WardenResult<()>
    {
        let ty = self.value_type();
        if !ty.is_scalar() {
            return Err(WardenError::InvalidArgument(format!("cannot assign a scalar to {ty}")));
        }
        let size = ty.byte_size();
        let bytes = self.cluster.byte_order.encode(value, size);

        let mut nodes = self.lock();
        self.cluster.update(&mut nodes, self.index);
        let node = &mut nodes[self.index];
        if let Some(address) = node.cached.address {
            drop(nodes);
            let process = self.cluster.process.upgrade().ok_or(WardenError::NotAttached)?;
            let written = process.write_memory(address, &bytes)?;
            if written != size {
                return Err(WardenError::MemoryWrite {
                    address,
                    size,
                    reason: format!("wrote {written} of {size} bytes"),
                });
            }
            return Ok(());
        }
        match &mut node.source {
            ValueSource::Register { thread, id } => {
                let thread = thread
                    .upgrade()
                    .ok_or_else(|| WardenError::InvalidArgument("thread is gone".to_string()))?;
                thread.write_register(*id, value)?;
                node.cached.data = Some(bytes);
                Ok(())
            }
            ValueSource::Constant(data) => {
                data.clone_from(&bytes);
                node.cached.data = Some(bytes);
                Ok(())
            }
            _ => Err(WardenError::Unsupported(format!("{} is not writable", node.name))),
        }
    }

    /// Number of children: fields, elements, or one pointee.
    #[must_use]
    pub fn num_children(&self) -> usize
    {
        self.lock()[self.index].ty.num_children()
    }

    /// Child at `index`, created on first request.
    #[must_use]
    pub fn child_at_index(&self, index: usize) -> Option<ValueObject>
    {
        let ty = self.value_type();
        if matches!(ty, ValueType::Pointer { .. }) {
            return (index == 0).then(|| self.dereference().ok()).flatten();
        }
        let mut nodes = self.lock();
        if let Some(Some(existing)) = nodes[self.index].children.get(index) {
            return Some(self.handle(*existing));
        }
        let (name, child_ty, offset) = match &ty {
            ValueType::Struct { fields, .. } => {
                let field = fields.get(index)?;
                (field.name.clone(), field.ty.clone(), field.offset)
            }
            ValueType::Array { element, count } => {
                if index >= *count {
                    return None;
                }
                let offset = (element.byte_size() * index) as u64;
                (format!("[{index}]"), (**element).clone(), offset)
            }
            _ => return None,
        };
        let child = ValueNode {
            name,
            children: vec![None; child_ty.num_children()],
            ty: child_ty,
            parent: Some(self.index),
            source: ValueSource::Child { offset },
            synthetic: [None, None],
            cached: Cached::default(),
        };
        let child_index = ValueCluster::push(&mut nodes, child);
        nodes[self.index].children[index] = Some(child_index);
        Some(self.handle(child_index))
    }

    /// Struct field named `name`.
    #[must_use]
    pub fn child_by_name(&self, name: &str) -> Option<ValueObject>
    {
        let ValueType::Struct { fields, .. } = self.value_type() else {
            return None;
        };
        let index = fields.iter().position(|field| field.name == name)?;
        self.child_at_index(index)
    }

    /// The pointee of a pointer value.
    pub fn dereference(&self) -> WardenResult<ValueObject>
    {
        let ValueType::Pointer { pointee, .. } = self.value_type() else {
            return Err(WardenError::InvalidArgument(format!("{} is not a pointer", self.name())));
        };
        let name = format!("*{}", self.name());
        Ok(self.synthetic_child(DEREFERENCE_SLOT, name, (*pointee).clone(), ValueSource::Dereference))
    }

    /// A pointer to this value. Fails for values not in memory.
    pub fn address_of(&self) -> WardenResult<ValueObject>
    {
        if self.address().is_none() {
            return Err(WardenError::InvalidArgument(format!("{} has no address", self.name())));
        }
        let name = format!("&{}", self.name());
        let ty = ValueType::pointer_to(self.value_type());
        Ok(self.synthetic_child(ADDRESS_OF_SLOT, name, ty, ValueSource::AddressOf))
    }

    fn synthetic_child(&self, slot: usize, name: String, ty: ValueType, source: ValueSource) -> ValueObject
    {
        let mut nodes = self.lock();
        if let Some(existing) = nodes[self.index].synthetic[slot] {
            return self.handle(existing);
        }
        let node = ValueNode {
            name,
            children: vec![None; ty.num_children()],
            ty,
            parent: Some(self.index),
            source,
            synthetic: [None, None],
            cached: Cached::default(),
        };
        let index = ValueCluster::push(&mut nodes, node);
        nodes[self.index].synthetic[slot] = Some(index);
        self.handle(index)
    }

    /// Value rendered for display: decimal integers, hex pointers. `None`
    /// for aggregates and unreadable values.
    #[must_use]
    pub fn formatted_value(&self) -> Option<String>
    {
        let ty = self.value_type();
        if self.error().is_some() {
            return None;
        }
        match ty {
            ValueType::Integer { signed: true, .. } => Some(self.value_as_signed(0).to_string()),
            ValueType::Integer { signed: false, .. } => Some(self.value_as_unsigned(0).to_string()),
            ValueType::Pointer { .. } => Some(format!("0x{:016x}", self.value_as_unsigned(0))),
            ValueType::Array { .. } | ValueType::Struct { .. } => None,
        }
    }
}

impl fmt::Debug for ValueObject
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        let nodes = self.lock();
        let node = &nodes[self.index];
        f.debug_struct("ValueObject")
            .field("name", &node.name)
            .field("type", &node.ty.to_string())
            .field("index", &self.index)
            .finish_non_exhaustive()
    }
}
