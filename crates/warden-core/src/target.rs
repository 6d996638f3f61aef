//! # Target
//!
//! Everything the debugger knows about one program, whether or not it is
//! running: its images, where they are loaded, the logical breakpoints and
//! watchpoints, stop hooks, persistent expression variables, and at most
//! one [`Process`].
//!
//! ## Ownership
//!
//! The target owns its process; the process only holds a weak reference
//! back. Dropping the target finalizes the process.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use warden_core::module::SharedModuleRegistry;
//! use warden_core::platform::SimulatedInferior;
//! use warden_core::target::Target;
//!
//! let target = Target::new(Arc::new(SharedModuleRegistry::new()));
//! let process = target.create_process(Box::new(SimulatedInferior::new()), None);
//! assert!(Arc::ptr_eq(&process, &target.process().unwrap()));
//! ```

use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use tracing::{debug, info, warn};

use crate::breakpoints::{Breakpoint, BreakpointId, BreakpointList, Watchpoint, WatchpointAccess, WatchpointId, WatchpointList};
use crate::error::{WardenError, WardenResult};
use crate::events::{EventMask, Listener};
use crate::expression::PersistentVariables;
use crate::module::{DynamicLoader, DynamicLoaderRegistry, Module, ModuleList, ModuleSpec, SharedModuleRegistry, Symbol};
use crate::process::{Process, ProcessBackend};
use crate::settings::ProcessSettings;
use crate::types::Address;

/// Callback run whenever a stop is surfaced to clients
pub type StopHook = Arc<dyn Fn(&Process) + Send + Sync>;

/// Handle returned by [`Target::add_stop_hook`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StopHookId(u32);

/// A load address mapped back to its image
#[derive(Debug, Clone)]
pub struct ResolvedAddress
{
    pub module: Arc<Module>,
    /// Address within the module's file
    pub file_address: Address,
    /// Symbol containing the address, if any
    pub symbol: Option<Symbol>,
}

/// One program being debugged
pub struct Target
{
    weak_self: Weak<Target>,
    settings: ProcessSettings,
    shared_modules: Arc<SharedModuleRegistry>,
    images: ModuleList,
    executable: Mutex<Option<Arc<Module>>>,
    section_load_list: Mutex<Vec<(Arc<Module>, i64)>>,
    breakpoints: BreakpointList,
    watchpoints: WatchpointList,
    stop_hooks: Mutex<Vec<(StopHookId, StopHook)>>,
    next_stop_hook_id: AtomicU32,
    persistent_variables: PersistentVariables,
    dynamic_loaders: DynamicLoaderRegistry,
    process: Mutex<Option<Arc<Process>>>,
}

impl Target
{
    /// A target sharing modules through `shared_modules`, with settings
    /// from the environment.
    #[must_use]
    pub fn new(shared_modules: Arc<SharedModuleRegistry>) -> Arc<Self>
    {
        Self::with_settings(shared_modules, ProcessSettings::from_env())
    }

    #[must_use]
    pub fn with_settings(shared_modules: Arc<SharedModuleRegistry>, settings: ProcessSettings) -> Arc<Self>
    {
        Arc::new_cyclic(|weak_self| Self {
            weak_self: weak_self.clone(),
            settings,
            shared_modules,
            images: ModuleList::new(),
            executable: Mutex::new(None),
            section_load_list: Mutex::new(Vec::new()),
            breakpoints: BreakpointList::new(),
            watchpoints: WatchpointList::new(),
            stop_hooks: Mutex::new(Vec::new()),
            next_stop_hook_id: AtomicU32::new(1),
            persistent_variables: PersistentVariables::new(),
            dynamic_loaders: DynamicLoaderRegistry::new(),
            process: Mutex::new(None),
        })
    }

    #[must_use]
    pub const fn settings(&self) -> &ProcessSettings
    {
        &self.settings
    }

    // ---- process -----------------------------------------------------------------

    /// Create the process of this target, replacing (and finalizing) any
    /// previous one. `listener`, when given, receives every public event.
    pub fn create_process(&self, backend: Box<dyn ProcessBackend>, listener: Option<&Listener>) -> Arc<Process>
    {
        let previous = lock(&self.process).take();
        if let Some(previous) = previous {
            debug!(pid = ?previous.pid(), "replacing existing process");
            previous.finalize();
        }
        let process = Process::new(self.weak_self.clone(), backend, self.settings.clone());
        if let Some(listener) = listener {
            process.broadcaster().add_listener(listener, EventMask::ALL);
        }
        *lock(&self.process) = Some(Arc::clone(&process));
        process
    }

    /// The current process, if any.
    #[must_use]
    pub fn process(&self) -> Option<Arc<Process>>
    {
        lock(&self.process).clone()
    }

    /// Finalize and forget the current process.
    pub fn delete_process(&self)
    {
        let process = lock(&self.process).take();
        if let Some(process) = process {
            process.finalize();
        }
    }

    // ---- images ------------------------------------------------------------------

    #[must_use]
    pub const fn shared_modules(&self) -> &Arc<SharedModuleRegistry>
    {
        &self.shared_modules
    }

    /// Images of this target, executable first.
    #[must_use]
    pub const fn images(&self) -> &ModuleList
    {
        &self.images
    }

    /// Find or load the module for `spec` through the shared registry and
    /// add it to the images. A stale copy of it is dropped from the images.
    pub fn add_module(&self, spec: &ModuleSpec) -> WardenResult<Arc<Module>>
    {
        let shared = self.shared_modules.get_shared_module(spec)?;
        if let Some(evicted) = &shared.evicted {
            if self.images.remove(evicted) {
                lock(&self.section_load_list).retain(|(module, _)| !Arc::ptr_eq(module, evicted));
                debug!(path = %evicted.path().display(), "dropped stale image");
            }
        }
        self.images.append_if_needed(Arc::clone(&shared.module));
        Ok(shared.module)
    }

    /// Make `module` the main executable and the first image.
    pub fn set_executable_module(&self, module: Arc<Module>)
    {
        self.shared_modules.add_module(Arc::clone(&module));
        self.images.prepend(Arc::clone(&module));
        info!(path = %module.path().display(), "executable module set");
        *lock(&self.executable) = Some(module);
    }

    #[must_use]
    pub fn executable_module(&self) -> Option<Arc<Module>>
    {
        lock(&self.executable).clone()
    }

    #[must_use]
    pub fn executable_path(&self) -> Option<PathBuf>
    {
        self.executable_module()
            .map(|module| module.path().to_path_buf())
    }

    /// Pick the first executable image as the main executable, unless one
    /// is set already.
    pub fn select_executable_from_images(&self)
    {
        if self.executable_module().is_some() {
            return;
        }
        match self.images.modules().into_iter().find(|module| module.is_executable()) {
            Some(module) => self.set_executable_module(module),
            None => warn!("no executable image among the target's images"),
        }
    }

    // ---- section load list -------------------------------------------------------

    /// Record that `module` is loaded `slide` bytes from its file addresses.
    pub fn set_module_slide(&self, module: &Arc<Module>, slide: i64)
    {
        let mut loaded = lock(&self.section_load_list);
        match loaded.iter_mut().find(|(existing, _)| Arc::ptr_eq(existing, module)) {
            Some(entry) => entry.1 = slide,
            None => loaded.push((Arc::clone(module), slide)),
        }
    }

    /// Slide of `module`, `None` while it is not loaded.
    #[must_use]
    pub fn module_slide(&self, module: &Arc<Module>) -> Option<i64>
    {
        lock(&self.section_load_list)
            .iter()
            .find(|(existing, _)| Arc::ptr_eq(existing, module))
            .map(|(_, slide)| *slide)
    }

    /// Forget every load address.
    pub fn clear_section_load_list(&self)
    {
        lock(&self.section_load_list).clear();
    }

    /// Load address of `file_address` in `module`. Unloaded modules are
    /// taken to be at their file addresses.
    #[must_use]
    pub fn file_to_load_address(&self, module: &Arc<Module>, file_address: Address) -> Address
    {
        let slide = self.module_slide(module).unwrap_or(0);
        Address::new(file_address.value().wrapping_add_signed(slide))
    }

    /// Map a load address back to an image, its file address, and symbol.
    #[must_use]
    pub fn resolve_load_address(&self, load_address: Address) -> Option<ResolvedAddress>
    {
        let loaded = lock(&self.section_load_list).clone();
        loaded.into_iter().find_map(|(module, slide)| {
            let file_address = Address::new(load_address.value().wrapping_add_signed(slide.wrapping_neg()));
            module.contains_file_address(file_address).then(|| ResolvedAddress {
                symbol: module.resolve_file_address(file_address),
                module,
                file_address,
            })
        })
    }

    /// Load address of the first symbol named `name`.
    #[must_use]
    pub fn resolve_symbol_load_address(&self, name: &str) -> Option<Address>
    {
        self.images
            .find_symbols_by_name(name)
            .into_iter()
            .next()
            .map(|(module, symbol)| self.file_to_load_address(&module, symbol.address))
    }

    // ---- breakpoints -------------------------------------------------------------

    #[must_use]
    pub const fn breakpoints(&self) -> &BreakpointList
    {
        &self.breakpoints
    }

    /// Break at a load address.
    ///
    /// ## Errors
    ///
    /// Planting the site in a live process failed; the breakpoint is not
    /// kept in that case.
    pub fn create_breakpoint_by_address(&self, address: Address, hardware: bool) -> WardenResult<Arc<Breakpoint>>
    {
        let breakpoint = self.breakpoints.create(false, hardware);
        breakpoint.add_location(address);
        self.resolve_breakpoint(&breakpoint)?;
        info!(breakpoint = %breakpoint.id(), %address, "breakpoint created");
        Ok(breakpoint)
    }

    /// Break at every symbol named `name` in the images.
    ///
    /// ## Errors
    ///
    /// `InvalidArgument` when no image defines `name`, or the site errors
    /// of [`create_breakpoint_by_address`](Self::create_breakpoint_by_address).
    pub fn create_breakpoint_by_name(&self, name: &str, hardware: bool) -> WardenResult<Arc<Breakpoint>>
    {
        let symbols = self.images.find_symbols_by_name(name);
        if symbols.is_empty() {
            return Err(WardenError::InvalidArgument(format!("no symbol named {name} in the target's images")));
        }
        let breakpoint = self.breakpoints.create(false, hardware);
        for (module, symbol) in symbols {
            let address = self.file_to_load_address(&module, symbol.address);
            breakpoint.add_location(address);
        }
        self.resolve_breakpoint(&breakpoint)?;
        info!(breakpoint = %breakpoint.id(), name, locations = breakpoint.locations().len(), "breakpoint created");
        Ok(breakpoint)
    }

    fn resolve_breakpoint(&self, breakpoint: &Arc<Breakpoint>) -> WardenResult<()>
    {
        let Some(process) = self.process().filter(|process| process.is_alive()) else {
            return Ok(());
        };
        for location in breakpoint.locations() {
            if location.site_id().is_some() {
                continue;
            }
            if let Err(error) = process.create_breakpoint_site(&location, breakpoint.is_hardware()) {
                if let Err(remove_error) = self.remove_breakpoint(breakpoint.id()) {
                    warn!(breakpoint = %breakpoint.id(), %remove_error, "cleanup after failed site creation failed");
                }
                return Err(error);
            }
        }
        Ok(())
    }

    /// Plant sites for every breakpoint location that has none yet.
    ///
    /// Called once images are loaded. Failures are logged per location.
    pub fn modules_did_load(&self, process: &Process)
    {
        for breakpoint in self.breakpoints.breakpoints() {
            for location in breakpoint.locations() {
                if location.site_id().is_some() {
                    continue;
                }
                if let Err(error) = process.create_breakpoint_site(&location, breakpoint.is_hardware()) {
                    warn!(breakpoint = %breakpoint.id(), address = %location.address(), %error, "could not plant breakpoint site");
                }
            }
        }
    }

    /// Remove a breakpoint and drop its locations from their sites.
    pub fn remove_breakpoint(&self, id: BreakpointId) -> WardenResult<()>
    {
        let breakpoint = self
            .breakpoints
            .remove(id)
            .ok_or(WardenError::BreakpointIdNotFound(id.raw()))?;
        if let Some(process) = self.process() {
            for location in breakpoint.locations() {
                if let Some(site_id) = location.site_id() {
                    process.remove_owner_from_breakpoint_site(&location, site_id)?;
                }
            }
        }
        debug!(breakpoint = %id, "breakpoint removed");
        Ok(())
    }

    // ---- watchpoints -------------------------------------------------------------

    #[must_use]
    pub const fn watchpoints(&self) -> &WatchpointList
    {
        &self.watchpoints
    }

    /// Watch `size` bytes at `address` in the live process.
    pub fn create_watchpoint(&self, address: Address, size: usize, access: WatchpointAccess) -> WardenResult<Arc<Watchpoint>>
    {
        let process = self.process().ok_or(WardenError::NotAttached)?;
        let watchpoint = self.watchpoints.create(address, size, access);
        if let Err(error) = process.enable_watchpoint(&watchpoint) {
            self.watchpoints.remove(watchpoint.id());
            return Err(error);
        }
        Ok(watchpoint)
    }

    /// Disarm and forget a watchpoint.
    pub fn remove_watchpoint(&self, id: WatchpointId) -> WardenResult<()>
    {
        let watchpoint = self
            .watchpoints
            .remove(id)
            .ok_or_else(|| WardenError::InvalidArgument(format!("no watchpoint with id {}", id.raw())))?;
        match self.process() {
            Some(process) => process.disable_watchpoint(&watchpoint),
            None => Ok(()),
        }
    }

    // ---- stop hooks --------------------------------------------------------------

    pub fn add_stop_hook(&self, hook: StopHook) -> StopHookId
    {
        let id = StopHookId(self.next_stop_hook_id.fetch_add(1, Ordering::SeqCst));
        lock(&self.stop_hooks).push((id, hook));
        id
    }

    /// Returns whether `id` was registered.
    pub fn remove_stop_hook(&self, id: StopHookId) -> bool
    {
        let mut hooks = lock(&self.stop_hooks);
        let before = hooks.len();
        hooks.retain(|(existing, _)| *existing != id);
        before != hooks.len()
    }

    /// Run every stop hook against `process`, in registration order.
    pub fn run_stop_hooks(&self, process: &Process)
    {
        let hooks: Vec<StopHook> = lock(&self.stop_hooks)
            .iter()
            .map(|(_, hook)| Arc::clone(hook))
            .collect();
        if !hooks.is_empty() {
            debug!(count = hooks.len(), "running stop hooks");
        }
        for hook in hooks {
            hook(process);
        }
    }

    // ---- plugins and expressions -------------------------------------------------

    #[must_use]
    pub const fn persistent_variables(&self) -> &PersistentVariables
    {
        &self.persistent_variables
    }

    #[must_use]
    pub const fn dynamic_loaders(&self) -> &DynamicLoaderRegistry
    {
        &self.dynamic_loaders
    }

    /// Dynamic loader for `process`.
    #[must_use]
    pub fn find_dynamic_loader(&self, process: &Process) -> Option<Arc<dyn DynamicLoader>>
    {
        self.dynamic_loaders.find_plugin(process)
    }
}

impl Drop for Target
{
    fn drop(&mut self)
    {
        let process = lock(&self.process).take();
        if let Some(process) = process {
            process.finalize();
        }
    }
}

impl fmt::Debug for Target
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        f.debug_struct("Target")
            .field("executable", &self.executable_path())
            .field("images", &self.images.len())
            .field("process", &self.process().map(|process| process.pid()))
            .finish_non_exhaustive()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T>
{
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
