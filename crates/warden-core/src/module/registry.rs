//! # Shared Module Registry
//!
//! Modules shared by every target that loads the same file.
//!
//! A module is reused when the file it was created from has not changed
//! since: same path, the requested architecture and UUID when given, and
//! the same modification time. A stale module is evicted and a fresh one
//! created. Targets that still hold the evicted module keep it alive; the
//! registry just stops handing it out.

use std::sync::{Arc, Mutex, PoisonError};

use tracing::{debug, info};

use super::list::ModuleList;
use super::object_file::ObjectFilePlugins;
use super::{file_modification_time, Module, ModuleSpec};
use crate::error::{WardenError, WardenResult};

/// Result of [`SharedModuleRegistry::get_shared_module`]
#[derive(Debug, Clone)]
pub struct SharedModule
{
    pub module: Arc<Module>,
    /// Whether the module was created by this call
    pub created: bool,
    /// Stale module this call replaced
    pub evicted: Option<Arc<Module>>,
}

/// Process-wide module cache, injected into each target
#[derive(Debug)]
pub struct SharedModuleRegistry
{
    plugins: Arc<ObjectFilePlugins>,
    modules: ModuleList,
    load_lock: Mutex<()>,
}

impl SharedModuleRegistry
{
    /// A registry using the built-in object-file plugins.
    #[must_use]
    pub fn new() -> Self
    {
        Self::with_plugins(Arc::new(ObjectFilePlugins::new()))
    }

    #[must_use]
    pub fn with_plugins(plugins: Arc<ObjectFilePlugins>) -> Self
    {
        Self {
            plugins,
            modules: ModuleList::new(),
            load_lock: Mutex::new(()),
        }
    }

    /// Object-file plugins used for modules this registry creates.
    #[must_use]
    pub const fn plugins(&self) -> &Arc<ObjectFilePlugins>
    {
        &self.plugins
    }

    /// Find or create the module for `spec`.
    ///
    /// ## Errors
    ///
    /// `ModuleNotFound` when no cached module matches and the file does not
    /// exist, or when a UUID was requested and the file has another one.
    pub fn get_shared_module(&self, spec: &ModuleSpec) -> WardenResult<SharedModule>
    {
        let _guard = self.load_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let current_time = file_modification_time(&spec.path);

        let mut evicted = None;
        if let Some(existing) = self.modules.find_by_spec(spec).into_iter().next() {
            if existing.modification_time() == current_time {
                debug!(path = %spec.path.display(), "reusing shared module");
                return Ok(SharedModule {
                    module: existing,
                    created: false,
                    evicted: None,
                });
            }
            info!(path = %spec.path.display(), "module changed on disk, evicting");
            self.modules.remove(&existing);
            evicted = Some(existing);
        }

        if current_time.is_none() && !spec.path.exists() {
            return Err(WardenError::ModuleNotFound(format!(
                "unable to find {}",
                spec.path.display()
            )));
        }

        let module = Arc::new(Module::new(spec.clone(), Arc::clone(&self.plugins)));
        if let Some(uuid) = &spec.uuid {
            if let Ok(file) = module.object_file() {
                if file.uuid().as_ref() != Some(uuid) {
                    return Err(WardenError::ModuleNotFound(format!(
                        "{} does not have UUID {uuid}",
                        spec.path.display()
                    )));
                }
            }
        }
        self.modules.append(Arc::clone(&module));
        debug!(path = %spec.path.display(), "created shared module");
        Ok(SharedModule {
            module,
            created: true,
            evicted,
        })
    }

    /// Register a module created elsewhere. Returns whether it was new.
    pub fn add_module(&self, module: Arc<Module>) -> bool
    {
        self.modules.append_if_needed(module)
    }

    /// Drop modules nothing but the registry refers to. Returns how many
    /// were dropped.
    pub fn remove_orphans(&self) -> usize
    {
        let _guard = self.load_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let removed = self
            .modules
            .remove_if(|module| Arc::strong_count(module) == 1);
        if !removed.is_empty() {
            debug!(count = removed.len(), "removed orphaned modules");
        }
        removed.len()
    }

    /// Cached modules matching `spec`.
    #[must_use]
    pub fn find_by_spec(&self, spec: &ModuleSpec) -> Vec<Arc<Module>>
    {
        self.modules.find_by_spec(spec)
    }

    /// Snapshot of the cached modules.
    #[must_use]
    pub fn modules(&self) -> Vec<Arc<Module>>
    {
        self.modules.modules()
    }

    #[must_use]
    pub fn len(&self) -> usize
    {
        self.modules.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool
    {
        self.modules.is_empty()
    }
}

impl Default for SharedModuleRegistry
{
    fn default() -> Self
    {
        Self::new()
    }
}
