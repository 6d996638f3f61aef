//! Ordered, de-duplicated list of modules.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use super::symbols::Symbol;
use super::{Module, ModuleSpec};
use crate::types::Address;

/// Modules of a target, in load order
///
/// Identity is by handle: the same `Arc<Module>` is never listed twice.
#[derive(Debug, Default)]
pub struct ModuleList
{
    modules: Mutex<Vec<Arc<Module>>>,
}

impl ModuleList
{
    #[must_use]
    pub fn new() -> Self
    {
        Self::default()
    }

    /// Append `module`, even if it is already listed.
    pub fn append(&self, module: Arc<Module>)
    {
        self.lock().push(module);
    }

    /// Append `module` unless it is already listed. Returns whether it was
    /// added.
    pub fn append_if_needed(&self, module: Arc<Module>) -> bool
    {
        let mut modules = self.lock();
        if modules.iter().any(|existing| Arc::ptr_eq(existing, &module)) {
            return false;
        }
        modules.push(module);
        true
    }

    /// Move `module` to the front, adding it if needed.
    pub fn prepend(&self, module: Arc<Module>)
    {
        let mut modules = self.lock();
        modules.retain(|existing| !Arc::ptr_eq(existing, &module));
        modules.insert(0, module);
    }

    /// Remove `module`. Returns whether it was listed.
    pub fn remove(&self, module: &Arc<Module>) -> bool
    {
        let mut modules = self.lock();
        let before = modules.len();
        modules.retain(|existing| !Arc::ptr_eq(existing, module));
        before != modules.len()
    }

    #[must_use]
    pub fn contains(&self, module: &Arc<Module>) -> bool
    {
        self.lock().iter().any(|existing| Arc::ptr_eq(existing, module))
    }

    /// Remove every module `predicate` selects, returning them.
    pub(crate) fn remove_if<F>(&self, mut predicate: F) -> Vec<Arc<Module>>
    where
        F: FnMut(&Arc<Module>) -> bool,
    {
        let mut modules = self.lock();
        let mut removed = Vec::new();
        modules.retain(|module| {
            if predicate(module) {
                removed.push(Arc::clone(module));
                false
            } else {
                true
            }
        });
        removed
    }

    pub fn clear(&self)
    {
        self.lock().clear();
    }

    /// Snapshot of the listed modules.
    #[must_use]
    pub fn modules(&self) -> Vec<Arc<Module>>
    {
        self.lock().clone()
    }

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

    /// Modules matching `spec`.
    #[must_use]
    pub fn find_by_spec(&self, spec: &ModuleSpec) -> Vec<Arc<Module>>
    {
        self.modules()
            .into_iter()
            .filter(|module| module.matches(spec))
            .collect()
    }

    /// Symbols named `name` across all modules, in module order.
    #[must_use]
    pub fn find_symbols_by_name(&self, name: &str) -> Vec<(Arc<Module>, Symbol)>
    {
        self.modules()
            .into_iter()
            .flat_map(|module| {
                module
                    .find_symbols_by_name(name)
                    .into_iter()
                    .map(move |symbol| (Arc::clone(&module), symbol))
                    .collect::<Vec<_>>()
            })
            .collect()
    }

    /// First module covering the file address `address`.
    #[must_use]
    pub fn find_module_containing(&self, address: Address) -> Option<Arc<Module>>
    {
        self.modules()
            .into_iter()
            .find(|module| module.contains_file_address(address))
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Arc<Module>>>
    {
        self.modules.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
