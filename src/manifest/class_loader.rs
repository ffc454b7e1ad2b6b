use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use super::{class_not_found, Instance, Manifest};
use crate::abi::{Capability, ManifestBuilderFn, HEARTH_ABI_VERSION};
use crate::error::{Error, Result};
use crate::loader::{module_key, ModuleHandle, ModuleTable};

struct LoadedLibrary<C: Capability> {
    path: PathBuf,
    refs: usize,
    manifest: Manifest<C>,
}

/// Instantiates classes of capability `C` from loaded modules.
///
/// Each loader keeps its own manifest per module, so two capabilities served
/// by the same file never see each other's classes even though they share
/// one entry in the [`ModuleTable`].
pub struct ClassLoader<C: Capability> {
    modules: Arc<ModuleTable>,
    libraries: Mutex<Vec<LoadedLibrary<C>>>,
}

impl<C: Capability> ClassLoader<C> {
    pub fn new(modules: Arc<ModuleTable>) -> Self {
        Self {
            modules,
            libraries: Mutex::new(Vec::new()),
        }
    }

    /// Load `path` and populate its manifest for `C` on first load.
    ///
    /// # Errors
    /// Returns [`Error::Load`] if the module cannot be opened.
    pub fn load_library(&self, path: impl AsRef<Path>) -> Result<()> {
        let key = module_key(path.as_ref());
        let mut libraries = self.libraries.lock();

        let handle = self.modules.load(&key)?;
        if let Some(library) = libraries.iter_mut().find(|library| library.path == key) {
            library.refs += 1;
            return Ok(());
        }

        let manifest = build_manifest::<C>(&handle);
        debug!(
            "Module {} provides {} {} classes",
            key.display(),
            manifest.class_names().len(),
            C::NAME
        );
        libraries.push(LoadedLibrary {
            path: key,
            refs: 1,
            manifest,
        });
        Ok(())
    }

    /// Release one load of `path`. When this loader's last load goes away,
    /// every instance it created from that module is destroyed before the
    /// module reference is returned.
    ///
    /// # Errors
    /// [`Error::NotLoaded`] if this loader never loaded `path`.
    pub fn unload_library(&self, path: impl AsRef<Path>) -> Result<()> {
        let key = module_key(path.as_ref());
        let mut libraries = self.libraries.lock();

        let index = libraries
            .iter()
            .position(|library| library.path == key)
            .ok_or_else(|| Error::NotLoaded(key.clone()))?;

        libraries[index].refs -= 1;
        if libraries[index].refs == 0 {
            drop(libraries.remove(index));
        }
        self.modules.unload(&key)?;
        Ok(())
    }

    #[must_use]
    pub fn is_library_loaded(&self, path: impl AsRef<Path>) -> bool {
        let key = module_key(path.as_ref());
        self.libraries
            .lock()
            .iter()
            .any(|library| library.path == key)
    }

    /// Create an instance of `class` from the first module that registers it.
    ///
    /// # Errors
    /// [`Error::ClassNotFound`] if no loaded module registers `class`.
    pub fn create_instance(&self, class: &str) -> Result<Instance> {
        let mut libraries = self.libraries.lock();
        let library = libraries
            .iter_mut()
            .find(|library| library.manifest.contains(class))
            .ok_or_else(|| class_not_found::<C>(class))?;
        library.manifest.create(class)
    }

    /// # Errors
    /// [`Error::InvalidAccess`] if `instance` was not issued for `class` by
    /// this loader.
    pub fn destroy_instance(&self, class: &str, instance: Instance) -> Result<()> {
        let mut libraries = self.libraries.lock();
        let library = libraries
            .iter_mut()
            .find(|library| library.manifest.arena == instance.arena)
            .ok_or_else(|| Error::invalid_access(class, "instance was not issued by this loader"))?;
        library.manifest.destroy(class, instance)
    }

    /// Run `f` against a live instance.
    ///
    /// # Errors
    /// [`Error::InvalidAccess`] if the instance is unknown or destroyed.
    pub fn with_instance<R>(&self, instance: Instance, f: impl FnOnce(&mut C::Object) -> R) -> Result<R> {
        let mut libraries = self.libraries.lock();
        let library = libraries
            .iter_mut()
            .find(|library| library.manifest.owns(instance))
            .ok_or_else(|| Error::invalid_access(C::NAME, "instance was not issued by this loader"))?;
        library.manifest.get_mut(instance).map(f)
    }

    /// Run `f` against the singleton registered as `class`.
    ///
    /// # Errors
    /// [`Error::ClassNotFound`] or [`Error::InvalidAccess`].
    pub fn with_singleton<R>(&self, class: &str, f: impl FnOnce(&C::Object) -> R) -> Result<R> {
        let libraries = self.libraries.lock();
        let library = libraries
            .iter()
            .find(|library| library.manifest.contains(class))
            .ok_or_else(|| class_not_found::<C>(class))?;
        library.manifest.instance(class).map(f)
    }

    /// Class names across all loaded modules, in load order.
    #[must_use]
    pub fn available_classes(&self) -> Vec<String> {
        self.libraries
            .lock()
            .iter()
            .flat_map(|library| library.manifest.class_names())
            .collect()
    }

    #[must_use]
    pub fn is_class_available(&self, class: &str) -> bool {
        self.libraries
            .lock()
            .iter()
            .any(|library| library.manifest.contains(class))
    }

    #[must_use]
    pub fn is_create_allowed(&self, class: &str) -> bool {
        self.libraries
            .lock()
            .iter()
            .any(|library| library.manifest.is_create_allowed(class))
    }
}

impl<C: Capability> Drop for ClassLoader<C> {
    fn drop(&mut self) {
        let libraries = std::mem::take(self.libraries.get_mut());
        for library in libraries.into_iter().rev() {
            let LoadedLibrary {
                path,
                refs,
                manifest,
            } = library;
            // Instances run module code on drop, so they go before the module.
            drop(manifest);
            for _ in 0..refs {
                if let Err(e) = self.modules.unload(&path) {
                    warn!("Failed to release {}: {}", path.display(), e);
                }
            }
        }
    }
}

fn build_manifest<C: Capability>(handle: &ModuleHandle) -> Manifest<C> {
    let mut manifest = Manifest::<C>::new();

    // SAFETY: the builder signature is fixed by the module ABI.
    let Ok(builder) = (unsafe { handle.get_fn::<ManifestBuilderFn>(C::BUILDER_SYMBOL) }) else {
        debug!(
            "{} does not export {}",
            handle.path().display(),
            C::BUILDER_SYMBOL
        );
        return manifest;
    };

    // SAFETY: the builder checks the ABI version and capability token before
    // it touches the manifest; the pointer is valid for the duration of the call.
    let accepted = unsafe { builder(HEARTH_ABI_VERSION, C::ID, manifest.as_builder_arg()) };
    if !accepted {
        warn!(
            "{} rejected the {} manifest (ABI {:#x})",
            handle.path().display(),
            C::NAME,
            HEARTH_ABI_VERSION
        );
    }
    manifest
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abi::CapabilityId;
    use crate::loader::{StaticOpener, StaticSymbols, Visibility};
    use crate::manifest::manifest_from_raw;
    use std::ffi::c_void;

    trait Shape: Send {
        fn sides(&self) -> u32;
    }

    trait Codec: Send {
        fn id(&self) -> &'static str;
    }

    struct Square;

    impl Shape for Square {
        fn sides(&self) -> u32 {
            4
        }
    }

    struct Triangle;

    impl Shape for Triangle {
        fn sides(&self) -> u32 {
            3
        }
    }

    struct Deflate;

    impl Codec for Deflate {
        fn id(&self) -> &'static str {
            "deflate"
        }
    }

    static RAW: Deflate = Deflate;

    struct ShapeCapability;

    impl Capability for ShapeCapability {
        const ID: CapabilityId = CapabilityId::new(0x7368_6170_6500_0001, 1);
        const NAME: &'static str = "shape";
        const BUILDER_SYMBOL: &'static str = "hearth_manifest_shape";
        type Object = dyn Shape;
    }

    struct CodecCapability;

    impl Capability for CodecCapability {
        const ID: CapabilityId = CapabilityId::new(0x636f_6465_6300_0001, 1);
        const NAME: &'static str = "codec";
        const BUILDER_SYMBOL: &'static str = "hearth_manifest_codec";
        type Object = dyn Codec;
    }

    fn square() -> Option<Box<dyn Shape>> {
        Some(Box::new(Square))
    }

    fn triangle() -> Option<Box<dyn Shape>> {
        Some(Box::new(Triangle))
    }

    fn deflate() -> Option<Box<dyn Codec>> {
        Some(Box::new(Deflate))
    }

    fn raw_codec() -> &'static dyn Codec {
        &RAW
    }

    unsafe extern "C" fn build_shapes(abi: u64, id: CapabilityId, raw: *mut c_void) -> bool {
        let Some(manifest) = manifest_from_raw::<ShapeCapability>(abi, id, raw) else {
            return false;
        };
        manifest.register_factory("Square", square).is_ok()
    }

    unsafe extern "C" fn build_more_shapes(abi: u64, id: CapabilityId, raw: *mut c_void) -> bool {
        let Some(manifest) = manifest_from_raw::<ShapeCapability>(abi, id, raw) else {
            return false;
        };
        manifest.register_factory("Triangle", triangle).is_ok()
    }

    unsafe extern "C" fn build_codecs(abi: u64, id: CapabilityId, raw: *mut c_void) -> bool {
        let Some(manifest) = manifest_from_raw::<CodecCapability>(abi, id, raw) else {
            return false;
        };
        manifest.register_factory("Deflate", deflate).is_ok()
            && manifest.register_singleton("Raw", raw_codec).is_ok()
    }

    // A module compiled against another hearth release carries another ABI
    // version, so it compares the host's against a different constant.
    unsafe extern "C" fn build_stale_shapes(abi: u64, id: CapabilityId, raw: *mut c_void) -> bool {
        let Some(manifest) = manifest_from_raw::<ShapeCapability>(abi.wrapping_add(1), id, raw)
        else {
            return false;
        };
        manifest.register_factory("Square", square).is_ok()
    }

    const MIXED: &str = "/virtual/libmixed.so";
    const SHAPES: &str = "/virtual/libshapes.so";
    const MISLABELED: &str = "/virtual/libmislabeled.so";
    const STALE: &str = "/virtual/libstale.so";

    fn modules() -> (StaticOpener, Arc<ModuleTable>) {
        let opener = StaticOpener::new();
        opener.insert(
            MIXED,
            StaticSymbols::new()
                .symbol(ShapeCapability::BUILDER_SYMBOL, build_shapes as *const c_void)
                .symbol(CodecCapability::BUILDER_SYMBOL, build_codecs as *const c_void),
        );
        opener.insert(
            SHAPES,
            StaticSymbols::new()
                .symbol(ShapeCapability::BUILDER_SYMBOL, build_more_shapes as *const c_void),
        );
        // Exports a codec builder under the shape symbol.
        opener.insert(
            MISLABELED,
            StaticSymbols::new()
                .symbol(ShapeCapability::BUILDER_SYMBOL, build_codecs as *const c_void),
        );
        opener.insert(
            STALE,
            StaticSymbols::new()
                .symbol(ShapeCapability::BUILDER_SYMBOL, build_stale_shapes as *const c_void),
        );
        let table = Arc::new(ModuleTable::new(Arc::new(opener.clone()), Visibility::Global));
        (opener, table)
    }

    #[test]
    fn test_capabilities_from_one_module_are_isolated() {
        let (opener, table) = modules();
        let shapes = ClassLoader::<ShapeCapability>::new(Arc::clone(&table));
        let codecs = ClassLoader::<CodecCapability>::new(Arc::clone(&table));

        shapes.load_library(MIXED).unwrap();
        codecs.load_library(MIXED).unwrap();

        assert_eq!(opener.open_count(MIXED), 1);
        assert_eq!(table.ref_count(MIXED), 2);
        assert_eq!(shapes.available_classes(), vec!["Square".to_string()]);
        assert_eq!(
            codecs.available_classes(),
            vec!["Deflate".to_string(), "Raw".to_string()]
        );
        assert!(!shapes.is_class_available("Deflate"));
        assert!(matches!(
            codecs.create_instance("Square"),
            Err(Error::ClassNotFound { capability: "codec", .. })
        ));
    }

    #[test]
    fn test_create_use_and_destroy() {
        let (_, table) = modules();
        let shapes = ClassLoader::<ShapeCapability>::new(table);
        shapes.load_library(MIXED).unwrap();
        shapes.load_library(SHAPES).unwrap();

        let square = shapes.create_instance("Square").unwrap();
        let triangle = shapes.create_instance("Triangle").unwrap();
        assert_eq!(shapes.with_instance(square, |s| s.sides()).unwrap(), 4);
        assert_eq!(shapes.with_instance(triangle, |s| s.sides()).unwrap(), 3);

        assert!(matches!(
            shapes.destroy_instance("Square", triangle),
            Err(Error::InvalidAccess { .. })
        ));
        shapes.destroy_instance("Square", square).unwrap();
        assert!(shapes.with_instance(square, |s| s.sides()).is_err());
        assert_eq!(shapes.with_instance(triangle, |s| s.sides()).unwrap(), 3);
    }

    #[test]
    fn test_handles_from_another_loader_are_rejected() {
        let (_, table) = modules();
        let first = ClassLoader::<ShapeCapability>::new(Arc::clone(&table));
        let second = ClassLoader::<ShapeCapability>::new(Arc::clone(&table));
        first.load_library(MIXED).unwrap();
        second.load_library(MIXED).unwrap();

        let theirs = second.create_instance("Square").unwrap();
        assert!(matches!(
            first.destroy_instance("Square", theirs),
            Err(Error::InvalidAccess { .. })
        ));
        assert_eq!(second.with_instance(theirs, |s| s.sides()).unwrap(), 4);
    }

    #[test]
    fn test_singletons() {
        let (_, table) = modules();
        let codecs = ClassLoader::<CodecCapability>::new(table);
        codecs.load_library(MIXED).unwrap();

        assert_eq!(codecs.with_singleton("Raw", |c| c.id()).unwrap(), "deflate");
        assert!(!codecs.is_create_allowed("Raw"));
        assert!(codecs.is_create_allowed("Deflate"));
        assert!(matches!(
            codecs.with_singleton("Deflate", |c| c.id()),
            Err(Error::InvalidAccess { .. })
        ));
    }

    #[test]
    fn test_unload_forgets_classes() {
        let (opener, table) = modules();
        let shapes = ClassLoader::<ShapeCapability>::new(Arc::clone(&table));

        shapes.load_library(MIXED).unwrap();
        shapes.load_library(MIXED).unwrap();
        let live = shapes.create_instance("Square").unwrap();

        shapes.unload_library(MIXED).unwrap();
        assert!(shapes.is_class_available("Square"));

        shapes.unload_library(MIXED).unwrap();
        assert!(!shapes.is_library_loaded(MIXED));
        assert!(matches!(
            shapes.create_instance("Square"),
            Err(Error::ClassNotFound { .. })
        ));
        assert!(shapes.with_instance(live, |s| s.sides()).is_err());
        assert_eq!(table.ref_count(MIXED), 0);
        assert_eq!(opener.close_count(MIXED), 1);
        assert!(matches!(
            shapes.unload_library(MIXED),
            Err(Error::NotLoaded(_))
        ));
    }

    #[test]
    fn test_wrong_capability_token_yields_empty_manifest() {
        let (_, table) = modules();
        let shapes = ClassLoader::<ShapeCapability>::new(table);
        shapes.load_library(MISLABELED).unwrap();

        assert!(shapes.is_library_loaded(MISLABELED));
        assert!(shapes.available_classes().is_empty());
    }

    #[test]
    fn test_builder_from_another_release_is_rejected() {
        let (_, table) = modules();
        let shapes = ClassLoader::<ShapeCapability>::new(table);
        shapes.load_library(STALE).unwrap();

        assert!(shapes.is_library_loaded(STALE));
        assert!(!shapes.is_class_available("Square"));
        assert!(matches!(
            shapes.create_instance("Square"),
            Err(Error::ClassNotFound { .. })
        ));
    }

    #[test]
    fn test_drop_releases_module_references() {
        let (opener, table) = modules();
        {
            let shapes = ClassLoader::<ShapeCapability>::new(Arc::clone(&table));
            shapes.load_library(SHAPES).unwrap();
            shapes.load_library(SHAPES).unwrap();
            shapes.create_instance("Triangle").unwrap();
        }
        assert_eq!(table.ref_count(SHAPES), 0);
        assert_eq!(opener.close_count(SHAPES), 1);
    }
}
