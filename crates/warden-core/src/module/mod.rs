//! # Modules
//!
//! Executable images known to a target.
//!
//! A [`Module`] is one file on disk (or one synthetic image). It exclusively
//! owns its parsed [`ObjectFile`] and [`SymbolTable`], both created on first
//! access and never replaced. Modules are shared between targets through an
//! injected [`SharedModuleRegistry`], which reloads a module when the file
//! on disk changed.
//!
//! ## Lookup
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use warden_core::module::{ModuleSpec, SharedModuleRegistry};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>>
//! {
//!     let registry = Arc::new(SharedModuleRegistry::new());
//!     let shared = registry.get_shared_module(&ModuleSpec::new("/bin/ls"))?;
//!     for symbol in shared.module.find_symbols_by_name("main") {
//!         println!("{} at {}", symbol.name, symbol.address);
//!     }
//!     Ok(())
//! }
//! ```

pub mod dynamic_loader;
pub mod list;
pub mod object_file;
pub mod registry;
pub mod symbols;

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use once_cell::sync::OnceCell;
use tracing::{debug, warn};

pub use dynamic_loader::{DynamicLoader, DynamicLoaderFactory, DynamicLoaderRegistry, StaticDynamicLoader};
pub use list::ModuleList;
pub use object_file::{ObjectCrateFile, ObjectFile, ObjectFileFactory, ObjectFilePlugins, Section, SyntheticObjectFile};
pub use registry::{SharedModule, SharedModuleRegistry};
pub use symbols::{Symbol, SymbolKind, SymbolLanguage, SymbolName, SymbolTable};

use crate::error::WardenResult;
use crate::types::{Address, Architecture};

/// Build id or `LC_UUID` of an image
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ModuleUuid(Vec<u8>);

impl ModuleUuid
{
    #[must_use]
    pub const fn new(bytes: Vec<u8>) -> Self
    {
        Self(bytes)
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8]
    {
        &self.0
    }
}

impl fmt::Display for ModuleUuid
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        for byte in &self.0 {
            write!(f, "{byte:02X}")?;
        }
        Ok(())
    }
}

/// What to look a module up by
///
/// The path must match; architecture and UUID only constrain the match
/// when given.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ModuleSpec
{
    pub path: PathBuf,
    pub architecture: Option<Architecture>,
    pub uuid: Option<ModuleUuid>,
}

impl ModuleSpec
{
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self
    {
        Self {
            path: path.into(),
            architecture: None,
            uuid: None,
        }
    }

    #[must_use]
    pub const fn with_architecture(mut self, architecture: Architecture) -> Self
    {
        self.architecture = Some(architecture);
        self
    }

    #[must_use]
    pub fn with_uuid(mut self, uuid: ModuleUuid) -> Self
    {
        self.uuid = Some(uuid);
        self
    }
}

/// One executable image
pub struct Module
{
    spec: ModuleSpec,
    modification_time: Option<SystemTime>,
    plugins: Arc<ObjectFilePlugins>,
    object_file: OnceCell<Arc<dyn ObjectFile>>,
    symbol_table: OnceCell<SymbolTable>,
}

impl Module
{
    /// A module for the file at `spec.path`. Nothing is read until the
    /// object file is first needed, except the modification time.
    #[must_use]
    pub fn new(spec: ModuleSpec, plugins: Arc<ObjectFilePlugins>) -> Self
    {
        let modification_time = file_modification_time(&spec.path);
        Self {
            spec,
            modification_time,
            plugins,
            object_file: OnceCell::new(),
            symbol_table: OnceCell::new(),
        }
    }

    /// A module around an already parsed object file.
    #[must_use]
    pub fn with_object_file(spec: ModuleSpec, object_file: Arc<dyn ObjectFile>) -> Self
    {
        let modification_time = file_modification_time(&spec.path);
        Self {
            spec,
            modification_time,
            plugins: Arc::new(ObjectFilePlugins::empty()),
            object_file: OnceCell::with_value(object_file),
            symbol_table: OnceCell::new(),
        }
    }

    #[must_use]
    pub fn path(&self) -> &Path
    {
        &self.spec.path
    }

    /// Last path component.
    #[must_use]
    pub fn file_name(&self) -> Option<&str>
    {
        self.spec.path.file_name().and_then(|name| name.to_str())
    }

    /// Modification time of the file when the module was created.
    #[must_use]
    pub const fn modification_time(&self) -> Option<SystemTime>
    {
        self.modification_time
    }

    /// Architecture requested in the spec, else the one of the object file.
    #[must_use]
    pub fn architecture(&self) -> Architecture
    {
        self.spec
            .architecture
            .or_else(|| self.object_file().ok().map(|file| file.architecture()))
            .unwrap_or(Architecture::Unknown("unknown"))
    }

    #[must_use]
    pub fn uuid(&self) -> Option<ModuleUuid>
    {
        self.spec
            .uuid
            .clone()
            .or_else(|| self.object_file().ok().and_then(|file| file.uuid()))
    }

    /// The parsed object file, parsing it on first access.
    pub fn object_file(&self) -> WardenResult<Arc<dyn ObjectFile>>
    {
        self.object_file
            .get_or_try_init(|| -> WardenResult<Arc<dyn ObjectFile>> {
                let data: Arc<[u8]> = Arc::from(fs::read(&self.spec.path)?);
                let file = self.plugins.find_plugin(&self.spec.path, &data)?;
                debug!(path = %self.spec.path.display(), plugin = file.plugin_name(), "parsed object file");
                Ok(file)
            })
            .cloned()
    }

    /// The symbol table, built on first access.
    pub fn symbol_table(&self) -> WardenResult<&SymbolTable>
    {
        self.symbol_table
            .get_or_try_init(|| -> WardenResult<SymbolTable> { Ok(SymbolTable::new(self.object_file()?.symbols())) })
    }

    #[must_use]
    pub fn is_executable(&self) -> bool
    {
        self.object_file().is_ok_and(|file| file.is_executable())
    }

    /// Symbols named `name`. A module that cannot be parsed has none.
    #[must_use]
    pub fn find_symbols_by_name(&self, name: &str) -> Vec<Symbol>
    {
        match self.symbol_table() {
            Ok(table) => table.find_by_name(name).into_iter().cloned().collect(),
            Err(error) => {
                warn!(path = %self.spec.path.display(), %error, "symbol lookup skipped unreadable module");
                Vec::new()
            }
        }
    }

    /// Symbol containing the file address `address`.
    #[must_use]
    pub fn resolve_file_address(&self, address: Address) -> Option<Symbol>
    {
        self.symbol_table()
            .ok()?
            .find_containing(address)
            .cloned()
    }

    /// Whether a section or a symbol of this module covers `address`.
    #[must_use]
    pub fn contains_file_address(&self, address: Address) -> bool
    {
        let Ok(file) = self.object_file() else {
            return false;
        };
        file.sections().iter().any(|section| section.contains(address)) || self.resolve_file_address(address).is_some()
    }

    /// Whether this module satisfies `spec`.
    #[must_use]
    pub fn matches(&self, spec: &ModuleSpec) -> bool
    {
        if self.spec.path != spec.path {
            return false;
        }
        if let Some(architecture) = spec.architecture {
            if self.architecture() != architecture {
                return false;
            }
        }
        match &spec.uuid {
            Some(uuid) => self.uuid().as_ref() == Some(uuid),
            None => true,
        }
    }
}

impl fmt::Debug for Module
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        f.debug_struct("Module")
            .field("path", &self.spec.path)
            .field("parsed", &self.object_file.get().is_some())
            .finish_non_exhaustive()
    }
}

pub(crate) fn file_modification_time(path: &Path) -> Option<SystemTime>
{
    fs::metadata(path).and_then(|metadata| metadata.modified()).ok()
}
