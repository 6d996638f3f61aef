//! # Object Files
//!
//! Parsed container formats behind a [`Module`](super::Module).
//!
//! Formats are plugins: [`ObjectFilePlugins`] holds `name -> factory`
//! entries and probes them in registration order; the first factory that
//! accepts the bytes wins. The built-in `object` plugin reads ELF, Mach-O,
//! and PE through the `object` crate.

use std::fmt;
use std::path::Path;
use std::sync::{Arc, PoisonError, RwLock};

use object::{Object, ObjectKind, ObjectSection, ObjectSymbol};
use tracing::{debug, trace};

use super::symbols::{Symbol, SymbolKind};
use super::ModuleUuid;
use crate::error::{WardenError, WardenResult};
use crate::types::{Address, Architecture};

/// A named range of file addresses
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Section
{
    pub name: String,
    pub address: Address,
    pub size: u64,
}

impl Section
{
    #[must_use]
    pub fn contains(&self, address: Address) -> bool
    {
        address
            .offset_from(self.address)
            .is_some_and(|offset| offset < self.size)
    }
}

/// A parsed object file
pub trait ObjectFile: Send + Sync + fmt::Debug
{
    /// Name of the plugin that produced this file.
    fn plugin_name(&self) -> &'static str;

    fn architecture(&self) -> Architecture;

    /// Mach-O `LC_UUID` or ELF build id.
    fn uuid(&self) -> Option<ModuleUuid>;

    /// Whether this is a main executable rather than a library.
    fn is_executable(&self) -> bool;

    fn entry_point(&self) -> Option<Address>;

    /// Allocated sections, in file order.
    fn sections(&self) -> &[Section];

    /// Defined symbols.
    fn symbols(&self) -> Vec<Symbol>;
}

/// Factory probing `data` read from `path`; `None` declines.
pub type ObjectFileFactory = fn(&Path, &Arc<[u8]>) -> Option<Arc<dyn ObjectFile>>;

/// Registry of object-file plugins
pub struct ObjectFilePlugins
{
    factories: RwLock<Vec<(&'static str, ObjectFileFactory)>>,
}

impl ObjectFilePlugins
{
    /// A registry with no plugins.
    #[must_use]
    pub fn empty() -> Self
    {
        Self {
            factories: RwLock::new(Vec::new()),
        }
    }

    /// A registry holding the built-in `object` plugin.
    #[must_use]
    pub fn new() -> Self
    {
        let plugins = Self::empty();
        plugins.register("object", ObjectCrateFile::create);
        plugins
    }

    /// Add a plugin, probed after the ones already registered.
    pub fn register(&self, name: &'static str, factory: ObjectFileFactory)
    {
        debug!(plugin = name, "registered object file plugin");
        self.factories
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push((name, factory));
    }

    /// Registered plugin names, in probing order.
    #[must_use]
    pub fn names(&self) -> Vec<&'static str>
    {
        self.factories
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(name, _)| *name)
            .collect()
    }

    /// Parse `data` with the first plugin that accepts it.
    pub fn find_plugin(&self, path: &Path, data: &Arc<[u8]>) -> WardenResult<Arc<dyn ObjectFile>>
    {
        let factories = self.factories.read().unwrap_or_else(PoisonError::into_inner).clone();
        for (name, factory) in factories {
            if let Some(file) = factory(path, data) {
                trace!(plugin = name, path = %path.display(), "object file plugin accepted");
                return Ok(file);
            }
        }
        Err(WardenError::ModuleNotFound(format!(
            "no object file plugin accepts {}",
            path.display()
        )))
    }
}

impl Default for ObjectFilePlugins
{
    fn default() -> Self
    {
        Self::new()
    }
}

impl fmt::Debug for ObjectFilePlugins
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        f.debug_struct("ObjectFilePlugins")
            .field("plugins", &self.names())
            .finish()
    }
}

/// ELF, Mach-O, and PE files read with the `object` crate
///
/// Everything is extracted at parse time so the file bytes are not kept.
#[derive(Debug, Clone)]
pub struct ObjectCrateFile
{
    architecture: Architecture,
    uuid: Option<ModuleUuid>,
    executable: bool,
    entry: Option<Address>,
    sections: Vec<Section>,
    symbols: Vec<Symbol>,
}

impl ObjectCrateFile
{
    /// Parse `data`.
    pub fn parse(path: &Path, data: &[u8]) -> WardenResult<Self>
    {
        let file = object::File::parse(data)
            .map_err(|err| WardenError::ModuleNotFound(format!("failed to parse {}: {err}", path.display())))?;

        let uuid = match file.mach_uuid() {
            Ok(Some(uuid)) => Some(ModuleUuid::new(uuid.to_vec())),
            _ => file
                .build_id()
                .ok()
                .flatten()
                .map(|id| ModuleUuid::new(id.to_vec())),
        };
        let entry = Some(file.entry())
            .filter(|entry| *entry != 0)
            .map(Address::new);
        let executable = match file.kind() {
            ObjectKind::Executable => true,
            ObjectKind::Dynamic => entry.is_some(),
            _ => false,
        };

        let sections = file
            .sections()
            .filter(|section| section.address() != 0 || section.size() != 0)
            .map(|section| Section {
                name: section.name().unwrap_or_default().to_string(),
                address: Address::new(section.address()),
                size: section.size(),
            })
            .collect();

        let symbols = file
            .symbols()
            .chain(file.dynamic_symbols())
            .filter(|symbol| symbol.is_definition())
            .filter_map(|symbol| {
                let name = symbol.name().ok().filter(|name| !name.is_empty())?;
                let kind = match symbol.kind() {
                    object::SymbolKind::Text => SymbolKind::Code,
                    object::SymbolKind::Data => SymbolKind::Data,
                    _ => SymbolKind::Other,
                };
                Some(Symbol::new(name, Address::new(symbol.address()), symbol.size(), kind))
            })
            .collect();

        Ok(Self {
            architecture: Architecture::from_object(file.architecture()),
            uuid,
            executable,
            entry,
            sections,
            symbols,
        })
    }

    fn create(path: &Path, data: &Arc<[u8]>) -> Option<Arc<dyn ObjectFile>>
    {
        match Self::parse(path, data) {
            Ok(file) => Some(Arc::new(file)),
            Err(error) => {
                debug!(path = %path.display(), %error, "object plugin declined");
                None
            }
        }
    }
}

impl ObjectFile for ObjectCrateFile
{
    fn plugin_name(&self) -> &'static str
    {
        "object"
    }

    fn architecture(&self) -> Architecture
    {
        self.architecture
    }

    fn uuid(&self) -> Option<ModuleUuid>
    {
        self.uuid.clone()
    }

    fn is_executable(&self) -> bool
    {
        self.executable
    }

    fn entry_point(&self) -> Option<Address>
    {
        self.entry
    }

    fn sections(&self) -> &[Section]
    {
        &self.sections
    }

    fn symbols(&self) -> Vec<Symbol>
    {
        self.symbols.clone()
    }
}

/// An object file described in memory
///
/// Used for images of simulated inferiors, which have no file on disk.
#[derive(Debug, Clone)]
pub struct SyntheticObjectFile
{
    architecture: Architecture,
    uuid: Option<ModuleUuid>,
    executable: bool,
    entry: Option<Address>,
    sections: Vec<Section>,
    symbols: Vec<Symbol>,
}

impl SyntheticObjectFile
{
    #[must_use]
    pub const fn new(architecture: Architecture) -> Self
    {
        Self {
            architecture,
            uuid: None,
            executable: false,
            entry: None,
            sections: Vec::new(),
            symbols: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_uuid(mut self, uuid: ModuleUuid) -> Self
    {
        self.uuid = Some(uuid);
        self
    }

    /// Mark as a main executable entered at `entry`.
    #[must_use]
    pub const fn executable(mut self, entry: Address) -> Self
    {
        self.executable = true;
        self.entry = Some(entry);
        self
    }

    #[must_use]
    pub fn with_section(mut self, name: &str, address: Address, size: u64) -> Self
    {
        self.sections.push(Section {
            name: name.to_string(),
            address,
            size,
        });
        self
    }

    #[must_use]
    pub fn with_symbol(mut self, name: &str, address: Address, size: u64, kind: SymbolKind) -> Self
    {
        self.symbols.push(Symbol::new(name, address, size, kind));
        self
    }
}

impl ObjectFile for SyntheticObjectFile
{
    fn plugin_name(&self) -> &'static str
    {
        "synthetic"
    }

    fn architecture(&self) -> Architecture
    {
        self.architecture
    }

    fn uuid(&self) -> Option<ModuleUuid>
    {
        self.uuid.clone()
    }

    fn is_executable(&self) -> bool
    {
        self.executable
    }

    fn entry_point(&self) -> Option<Address>
    {
        self.entry
    }

    fn sections(&self) -> &[Section]
    {
        &self.sections
    }

    fn symbols(&self) -> Vec<Symbol>
    {
        self.symbols.clone()
    }
}

#[cfg(test)]
mod tests
{
    use super::*;

    #[test]
    fn garbage_is_declined_by_every_plugin()
    {
        let plugins = ObjectFilePlugins::new();
        let data: Arc<[u8]> = Arc::from(vec![0u8; 64]);
        let error = plugins
            .find_plugin(Path::new("/tmp/not-an-object"), &data)
            .unwrap_err();
        assert!(error.to_string().contains("no object file plugin accepts"));
    }

    #[test]
    fn first_accepting_plugin_wins()
    {
        fn accept(_: &Path, _: &Arc<[u8]>) -> Option<Arc<dyn ObjectFile>>
        {
            Some(Arc::new(SyntheticObjectFile::new(Architecture::X86_64)))
        }
        let plugins = ObjectFilePlugins::new();
        plugins.register("always", accept);
        assert_eq!(plugins.names(), vec!["object", "always"]);
        let data: Arc<[u8]> = Arc::from(vec![1u8; 8]);
        let file = plugins.find_plugin(Path::new("blob"), &data).unwrap();
        assert_eq!(file.plugin_name(), "synthetic");
    }
}
