//! Layout-level type descriptions for values.
//!
//! Only what is needed to find bytes and children: sizes, alignments,
//! signedness, field offsets, element counts, and pointees.

use std::fmt;
use std::sync::Arc;

/// A field of a [`ValueType::Struct`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Field
{
    pub name: String,
    pub ty: ValueType,
    /// Byte offset from the start of the struct
    pub offset: u64,
}

/// Shape of a value in inferior memory
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValueType
{
    /// Integer of 1, 2, 4 or 8 bytes
    Integer
    {
        name: &'static str,
        size: usize,
        signed: bool,
    },
    /// Pointer of the target's address size
    Pointer
    {
        pointee: Arc<ValueType>,
        size: usize,
    },
    /// Fixed-length array
    Array
    {
        element: Arc<ValueType>,
        count: usize,
    },
    /// Record with explicit layout
    Struct
    {
        name: String,
        fields: Vec<Field>,
        size: usize,
        alignment: usize,
    },
}

impl ValueType
{
    #[must_use]
    pub const fn int32() -> Self
    {
        ValueType::Integer {
            name: "int",
            size: 4,
            signed: true,
        }
    }

    #[must_use]
    pub const fn uint64() -> Self
    {
        ValueType::Integer {
            name: "unsigned long",
            size: 8,
            signed: false,
        }
    }

    #[must_use]
    pub const fn uint8() -> Self
    {
        ValueType::Integer {
            name: "unsigned char",
            size: 1,
            signed: false,
        }
    }

    /// Pointer to `pointee`, eight bytes wide.
    #[must_use]
    pub fn pointer_to(pointee: ValueType) -> Self
    {
        ValueType::Pointer {
            pointee: Arc::new(pointee),
            size: 8,
        }
    }

    #[must_use]
    pub fn array_of(element: ValueType, count: usize) -> Self
    {
        ValueType::Array {
            element: Arc::new(element),
            count,
        }
    }

    /// Struct laid out in declaration order with natural alignment.
    #[must_use]
    pub fn record(name: impl Into<String>, members: Vec<(&str, ValueType)>) -> Self
    {
        let mut offset = 0u64;
        let mut alignment = 1usize;
        let mut fields = Vec::with_capacity(members.len());
        for (field_name, ty) in members {
            let field_alignment = ty.alignment();
            alignment = alignment.max(field_alignment);
            offset = offset.next_multiple_of(field_alignment as u64);
            let size = ty.byte_size() as u64;
            fields.push(Field {
                name: field_name.to_string(),
                ty,
                offset,
            });
            offset += size;
        }
        let size = (offset as usize).next_multiple_of(alignment);
        ValueType::Struct {
            name: name.into(),
            fields,
            size,
            alignment,
        }
    }

    #[must_use]
    pub fn byte_size(&self) -> usize
    {
        match self {
            ValueType::Integer { size, .. } | ValueType::Pointer { size, .. } | ValueType::Struct { size, .. } => *size,
            ValueType::Array { element, count } => element.byte_size() * count,
        }
    }

    #[must_use]
    pub fn alignment(&self) -> usize
    {
        match self {
            ValueType::Integer { size, .. } | ValueType::Pointer { size, .. } => (*size).max(1),
            ValueType::Array { element, .. } => element.alignment(),
            ValueType::Struct { alignment, .. } => (*alignment).max(1),
        }
    }

    /// Whether the value fits a 64-bit scalar.
    #[must_use]
    pub const fn is_scalar(&self) -> bool
    {
        matches!(self, ValueType::Integer { .. } | ValueType::Pointer { .. })
    }

    #[must_use]
    pub const fn is_signed(&self) -> bool
    {
        matches!(self, ValueType::Integer { signed: true, .. })
    }

    #[must_use]
    pub fn num_children(&self) -> usize
    {
        match self {
            ValueType::Integer { .. } => 0,
            ValueType::Pointer { .. } => 1,
            ValueType::Array { count, .. } => *count,
            ValueType::Struct { fields, .. } => fields.len(),
        }
    }
}

impl fmt::Display for ValueType
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        match self {
            ValueType::Integer { name, .. } => f.write_str(name),
            ValueType::Pointer { pointee, .. } => write!(f, "{pointee} *"),
            ValueType::Array { element, count } => write!(f, "{element}[{count}]"),
            ValueType::Struct { name, .. } => f.write_str(name),
        }
    }
}

#[cfg(test)]
mod tests
{
    use super::*;

    #[test]
    fn record_layout_uses_natural_alignment()
    {
        let ty = ValueType::record("pair", vec![("tag", ValueType::uint8()), ("value", ValueType::uint64())]);
        let ValueType::Struct { fields, size, alignment, .. } = &ty else {
            panic!("not a struct");
        };
        assert_eq!(fields[1].offset, 8);
        assert_eq!(*size, 16);
        assert_eq!(*alignment, 8);
        assert_eq!(ty.num_children(), 2);
    }
}
