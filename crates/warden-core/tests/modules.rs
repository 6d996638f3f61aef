//! Tests for the shared module registry and object-file plugins

use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use warden_core::module::{
    ModuleSpec, ObjectFile, ObjectFilePlugins, SharedModuleRegistry, SymbolKind, SyntheticObjectFile,
};
use warden_core::types::{Address, Architecture};
use warden_core::WardenError;

const MAGIC: &[u8] = b"WARDEN-TEST-IMAGE";

/// A file under the temp directory, removed on drop.
struct TempImage
{
    path: PathBuf,
}

impl TempImage
{
    fn new(name: &str, contents: &[u8]) -> Self
    {
        let path = std::env::temp_dir().join(format!("warden-{}-{name}", std::process::id()));
        fs::write(&path, contents).unwrap();
        Self { path }
    }

    fn path(&self) -> &Path
    {
        &self.path
    }

    fn touch(&self, offset: Duration)
    {
        let file = File::options().write(true).open(&self.path).unwrap();
        file.set_modified(SystemTime::now() + offset).unwrap();
    }
}

impl Drop for TempImage
{
    fn drop(&mut self)
    {
        let _ = fs::remove_file(&self.path);
    }
}

fn test_image_plugin(_path: &Path, data: &Arc<[u8]>) -> Option<Arc<dyn ObjectFile>>
{
    if !data.starts_with(MAGIC) {
        return None;
    }
    let file = SyntheticObjectFile::new(Architecture::X86_64)
        .executable(Address::new(0x40_0000))
        .with_section(".text", Address::new(0x40_0000), 0x100)
        .with_symbol("main", Address::new(0x40_0010), 0x20, SymbolKind::Code);
    Some(Arc::new(file))
}

fn registry_with_test_plugin() -> SharedModuleRegistry
{
    let plugins = ObjectFilePlugins::empty();
    plugins.register("test-image", test_image_plugin);
    SharedModuleRegistry::with_plugins(Arc::new(plugins))
}

#[test]
fn test_unchanged_files_share_one_module()
{
    let image = TempImage::new("shared", MAGIC);
    let registry = registry_with_test_plugin();
    let spec = ModuleSpec::new(image.path());

    let first = registry.get_shared_module(&spec).unwrap();
    assert!(first.created);
    assert!(first.evicted.is_none());

    let second = registry.get_shared_module(&spec).unwrap();
    assert!(!second.created);
    assert!(Arc::ptr_eq(&first.module, &second.module));
    assert_eq!(registry.len(), 1);
}

#[test]
fn test_changed_files_evict_the_stale_module()
{
    let image = TempImage::new("evict", MAGIC);
    let registry = registry_with_test_plugin();
    let spec = ModuleSpec::new(image.path());

    let first = registry.get_shared_module(&spec).unwrap();
    image.touch(Duration::from_secs(60));

    let second = registry.get_shared_module(&spec).unwrap();
    assert!(second.created);
    assert!(Arc::ptr_eq(second.evicted.as_ref().unwrap(), &first.module));
    assert!(!Arc::ptr_eq(&first.module, &second.module));
    assert_eq!(registry.len(), 1);
    // Holders of the old module keep a usable copy.
    assert_eq!(first.module.find_symbols_by_name("main").len(), 1);
}

#[test]
fn test_missing_files_are_not_found()
{
    let registry = SharedModuleRegistry::new();
    let spec = ModuleSpec::new(std::env::temp_dir().join("warden-no-such-image"));
    assert!(matches!(registry.get_shared_module(&spec), Err(WardenError::ModuleNotFound(_))));
    assert!(registry.is_empty());
}

#[test]
fn test_orphans_are_removed()
{
    let kept = TempImage::new("kept", MAGIC);
    let orphan = TempImage::new("orphan", MAGIC);
    let registry = registry_with_test_plugin();

    let held = registry.get_shared_module(&ModuleSpec::new(kept.path())).unwrap();
    drop(registry.get_shared_module(&ModuleSpec::new(orphan.path())).unwrap());
    assert_eq!(registry.len(), 2);

    assert_eq!(registry.remove_orphans(), 1);
    assert_eq!(registry.len(), 1);
    assert!(Arc::ptr_eq(&registry.modules()[0], &held.module));
}

#[test]
fn test_modules_parse_lazily_through_plugins()
{
    let image = TempImage::new("lazy", MAGIC);
    let registry = registry_with_test_plugin();
    let module = registry.get_shared_module(&ModuleSpec::new(image.path())).unwrap().module;

    assert!(format!("{module:?}").contains("parsed: false"));
    assert!(module.is_executable());
    assert_eq!(module.architecture(), Architecture::X86_64);
    let main = module.resolve_file_address(Address::new(0x40_0018)).unwrap();
    assert_eq!(main.name.display_name(), "main");
    assert!(module.contains_file_address(Address::new(0x40_00f0)));
    assert!(!module.contains_file_address(Address::new(0x50_0000)));
}

#[test]
fn test_unrecognized_files_have_no_symbols()
{
    let image = TempImage::new("garbage", b"not an object file");
    let registry = registry_with_test_plugin();
    let module = registry.get_shared_module(&ModuleSpec::new(image.path())).unwrap().module;

    assert!(module.object_file().is_err());
    assert!(module.find_symbols_by_name("main").is_empty());
    assert!(!module.is_executable());
}

#[test]
fn test_the_object_plugin_reads_real_executables()
{
    let path = std::env::current_exe().unwrap();
    let registry = SharedModuleRegistry::new();
    let module = registry.get_shared_module(&ModuleSpec::new(&path)).unwrap().module;

    let file = module.object_file().unwrap();
    assert_eq!(file.plugin_name(), "object");
    assert!(!file.sections().is_empty());
}
