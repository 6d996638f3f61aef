//! # Dynamic Loaders
//!
//! Plugins that tell the target where each image was loaded.
//!
//! The process consults its loader after the initial launch stop and when
//! an attach completes. Loaders are probed like object-file plugins: the
//! first registered factory that accepts the process wins.

use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

use tracing::{debug, warn};

use crate::process::Process;

/// Image-tracking plugin attached to one process
pub trait DynamicLoader: Send + Sync
{
    fn plugin_name(&self) -> &'static str;

    /// The inferior was launched and stopped at its first instruction.
    fn did_launch(&self, process: &Process);

    /// An attach to a running inferior completed.
    fn did_attach(&self, process: &Process);
}

/// Factory probing a process; `None` declines.
pub type DynamicLoaderFactory = fn(&Process) -> Option<Arc<dyn DynamicLoader>>;

/// Registry of dynamic-loader plugins
pub struct DynamicLoaderRegistry
{
    factories: RwLock<Vec<(&'static str, DynamicLoaderFactory)>>,
}

impl DynamicLoaderRegistry
{
    #[must_use]
    pub fn empty() -> Self
    {
        Self {
            factories: RwLock::new(Vec::new()),
        }
    }

    /// A registry holding the static loader.
    #[must_use]
    pub fn new() -> Self
    {
        let registry = Self::empty();
        registry.register("static", StaticDynamicLoader::create);
        registry
    }

    /// Add a plugin. Plugins registered later are probed first, so the
    /// built-in static loader stays the fallback.
    pub fn register(&self, name: &'static str, factory: DynamicLoaderFactory)
    {
        self.factories
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(0, (name, factory));
    }

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

    /// First loader that accepts `process`.
    #[must_use]
    pub fn find_plugin(&self, process: &Process) -> Option<Arc<dyn DynamicLoader>>
    {
        let factories = self.factories.read().unwrap_or_else(PoisonError::into_inner).clone();
        let loader = factories.into_iter().find_map(|(_, factory)| factory(process));
        match &loader {
            Some(loader) => debug!(plugin = loader.plugin_name(), "selected dynamic loader"),
            None => warn!("no dynamic loader accepted the process"),
        }
        loader
    }
}

impl Default for DynamicLoaderRegistry
{
    fn default() -> Self
    {
        Self::new()
    }
}

impl fmt::Debug for DynamicLoaderRegistry
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        f.debug_struct("DynamicLoaderRegistry")
            .field("plugins", &self.names())
            .finish()
    }
}

/// Loader for images that are never relocated
///
/// Every image of the target is loaded at its file address (slide zero).
#[derive(Debug, Default, Clone, Copy)]
pub struct StaticDynamicLoader;

impl StaticDynamicLoader
{
    fn create(_process: &Process) -> Option<Arc<dyn DynamicLoader>>
    {
        Some(Arc::new(Self))
    }

    fn load_all_images(process: &Process)
    {
        let Some(target) = process.target() else {
            return;
        };
        for module in target.images().modules() {
            target.set_module_slide(&module, 0);
            debug!(path = %module.path().display(), "image loaded at file address");
        }
        target.modules_did_load(process);
    }
}

impl DynamicLoader for StaticDynamicLoader
{
    fn plugin_name(&self) -> &'static str
    {
        "static"
    }

    fn did_launch(&self, process: &Process)
    {
        Self::load_all_images(process);
    }

    fn did_attach(&self, process: &Process)
    {
        Self::load_all_images(process);
    }
}
