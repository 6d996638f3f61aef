//! # Symbols
//!
//! Symbol names and the per-module symbol table.
//!
//! Names are demangled once, when the table is built, with `rustc-demangle`.
//! Lookups by name match the linkage name, the demangled name, and the
//! demangled name without its trailing hash (`core::fmt::write`, not
//! `core::fmt::write::h0123456789abcdef`).

use std::collections::HashMap;
use std::fmt;

use rustc_demangle::try_demangle;

use crate::types::Address;

/// Source language guessed from the mangling scheme
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SymbolLanguage
{
    /// Legacy (`_ZN...E`) or v0 (`_R...`) Rust mangling
    Rust,
    /// Itanium C++ mangling
    Cpp,
    /// Not mangled, or not recognised
    #[default]
    Unknown,
}

/// A linkage name with its demangled form
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SymbolName
{
    raw: String,
    demangled: Option<String>,
    short: Option<String>,
    language: SymbolLanguage,
}

impl SymbolName
{
    /// Demangle `raw` and guess its language.
    #[must_use]
    pub fn new(raw: impl Into<String>) -> Self
    {
        let raw = raw.into();
        let (demangled, short) = match try_demangle(&raw) {
            Ok(demangled) => (Some(demangled.to_string()), Some(format!("{demangled:#}"))),
            Err(_) => (None, None),
        };
        let language = if raw.starts_with("_R") || (raw.starts_with("_ZN") && demangled.is_some()) {
            SymbolLanguage::Rust
        } else if raw.starts_with("_Z") {
            SymbolLanguage::Cpp
        } else {
            SymbolLanguage::Unknown
        };
        Self {
            raw,
            demangled,
            short,
            language,
        }
    }

    /// Name as emitted in the object file.
    #[must_use]
    pub fn raw(&self) -> &str
    {
        &self.raw
    }

    /// Demangled name, hash included.
    #[must_use]
    pub fn demangled(&self) -> Option<&str>
    {
        self.demangled.as_deref()
    }

    /// Preferred presentation: demangled without hash, else raw.
    #[must_use]
    pub fn display_name(&self) -> &str
    {
        self.short.as_deref().unwrap_or(&self.raw)
    }

    #[must_use]
    pub const fn language(&self) -> SymbolLanguage
    {
        self.language
    }

    /// Whether `name` refers to this symbol in any of its forms.
    #[must_use]
    pub fn matches(&self, name: &str) -> bool
    {
        self.raw == name || self.demangled.as_deref() == Some(name) || self.short.as_deref() == Some(name)
    }
}

impl fmt::Display for SymbolName
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        f.write_str(self.display_name())
    }
}

/// What a symbol names
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SymbolKind
{
    Code,
    Data,
    Other,
}

/// One entry of a module's symbol table. Addresses are file addresses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Symbol
{
    pub name: SymbolName,
    pub address: Address,
    pub size: u64,
    pub kind: SymbolKind,
}

impl Symbol
{
    #[must_use]
    pub fn new(name: impl Into<String>, address: Address, size: u64, kind: SymbolKind) -> Self
    {
        Self {
            name: SymbolName::new(name),
            address,
            size,
            kind,
        }
    }

    /// Whether `address` falls inside this symbol. Zero-sized symbols only
    /// contain their own address.
    #[must_use]
    pub fn contains(&self, address: Address) -> bool
    {
        match address.offset_from(self.address) {
            Some(0) => true,
            Some(offset) => offset < self.size,
            None => false,
        }
    }
}

/// Symbols of one module, sorted by address and indexed by name
#[derive(Debug, Clone, Default)]
pub struct SymbolTable
{
    symbols: Vec<Symbol>,
    by_name: HashMap<String, Vec<usize>>,
}

impl SymbolTable
{
    /// Build a table, indexing every form of every name.
    #[must_use]
    pub fn new(mut symbols: Vec<Symbol>) -> Self
    {
        symbols.sort_by_key(|symbol| symbol.address);
        let mut by_name: HashMap<String, Vec<usize>> = HashMap::new();
        for (index, symbol) in symbols.iter().enumerate() {
            let name = &symbol.name;
            let mut keys = vec![name.raw()];
            keys.extend(name.demangled());
            keys.push(name.display_name());
            keys.dedup();
            for key in keys {
                let entry = by_name.entry(key.to_string()).or_default();
                if entry.last() != Some(&index) {
                    entry.push(index);
                }
            }
        }
        Self { symbols, by_name }
    }

    #[must_use]
    pub fn len(&self) -> usize
    {
        self.symbols.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool
    {
        self.symbols.is_empty()
    }

    /// All symbols, in address order.
    #[must_use]
    pub fn symbols(&self) -> &[Symbol]
    {
        &self.symbols
    }

    /// Symbols named `name` in any form.
    #[must_use]
    pub fn find_by_name(&self, name: &str) -> Vec<&Symbol>
    {
        self.by_name
            .get(name)
            .map(|indices| indices.iter().map(|index| &self.symbols[*index]).collect())
            .unwrap_or_default()
    }

    /// Innermost symbol containing `address`.
    #[must_use]
    pub fn find_containing(&self, address: Address) -> Option<&Symbol>
    {
        let end = self.symbols.partition_point(|symbol| symbol.address <= address);
        self.symbols[..end]
            .iter()
            .rev()
            .find(|symbol| symbol.contains(address))
    }
}

#[cfg(test)]
mod tests
{
    use super::*;

    #[test]
    fn rust_names_are_demangled_without_hash()
    {
        let name = SymbolName::new("_ZN4core3fmt5write17h0123456789abcdefE");
        assert_eq!(name.language(), SymbolLanguage::Rust);
        assert_eq!(name.display_name(), "core::fmt::write");
        assert!(name.matches("core::fmt::write"));
        assert!(name.matches("_ZN4core3fmt5write17h0123456789abcdefE"));
    }

    #[test]
    fn plain_names_match_themselves()
    {
        let name = SymbolName::new("main");
        assert_eq!(name.language(), SymbolLanguage::Unknown);
        assert_eq!(name.display_name(), "main");
        assert!(name.demangled().is_none());
    }

    #[test]
    fn lookup_by_address_picks_containing_symbol()
    {
        let table = SymbolTable::new(vec![
            Symbol::new("second", Address::new(0x2000), 0x10, SymbolKind::Code),
            Symbol::new("first", Address::new(0x1000), 0x100, SymbolKind::Code),
        ]);
        assert_eq!(table.symbols()[0].name.raw(), "first");
        let hit = table.find_containing(Address::new(0x1080));
        assert_eq!(hit.map(|symbol| symbol.name.raw()), Some("first"));
        assert!(table.find_containing(Address::new(0x1100)).is_none());
        assert_eq!(table.find_by_name("second").len(), 1);
    }
}
