use std::ffi::c_void;
use std::path::Path;

use libloading::Library;

use super::{ModuleOpener, RawModule, SymbolAddress, Visibility};
use crate::error::{Error, Result};

/// Opens modules through the OS dynamic loader.
#[derive(Debug, Default, Clone, Copy)]
pub struct NativeOpener;

struct NativeModule {
    library: Library,
}

impl ModuleOpener for NativeOpener {
    fn open(&self, path: &Path, visibility: Visibility) -> Result<Box<dyn RawModule>> {
        let library = open_library(path, visibility).map_err(|e| Error::load(path, e.to_string()))?;
        Ok(Box::new(NativeModule { library }))
    }
}

impl RawModule for NativeModule {
    fn symbol(&self, name: &str) -> Option<SymbolAddress> {
        // SAFETY: only the symbol's address is read here; callers pick the type.
        let symbol = unsafe { self.library.get::<*const c_void>(name.as_bytes()) }.ok()?;
        SymbolAddress::from_ptr(*symbol)
    }

    fn close(self: Box<Self>) -> std::result::Result<(), String> {
        self.library.close().map_err(|e| e.to_string())
    }
}

#[cfg(unix)]
fn open_library(path: &Path, visibility: Visibility) -> std::result::Result<Library, libloading::Error> {
    use libloading::os::unix::{Library as UnixLibrary, RTLD_GLOBAL, RTLD_LOCAL, RTLD_NOW};

    let flags = match visibility {
        Visibility::Global => RTLD_NOW | RTLD_GLOBAL,
        Visibility::Local => RTLD_NOW | RTLD_LOCAL,
    };

    // SAFETY: loading a module runs its initializers; modules are trusted with
    // full host privileges.
    unsafe { UnixLibrary::open(Some(path), flags) }.map(Into::into)
}

#[cfg(not(unix))]
fn open_library(path: &Path, _visibility: Visibility) -> std::result::Result<Library, libloading::Error> {
    // SAFETY: see the unix variant.
    unsafe { Library::new(path) }
}
