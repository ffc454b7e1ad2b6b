//! Dynamic module loading.
//!
//! A [`ModuleHandle`] owns one opened module and resolves symbols by name.
//! The [`ModuleTable`] reference-counts handles by path so repeated loads of
//! the same file share one OS handle and fire the module init/deinit hooks
//! exactly once.
//!
//! The OS loader sits behind [`ModuleOpener`]: [`NativeOpener`] uses
//! `libloading`, [`StaticOpener`] serves symbol tables linked into the host.

mod native;
mod static_module;
mod table;

pub use native::NativeOpener;
pub use static_module::{StaticOpener, StaticSymbols};
pub use table::{ModuleLease, ModuleTable};

use std::ffi::c_void;
use std::fmt;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Whether a module's symbols are visible to modules loaded after it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    /// Needed for cross-module type identity and nested loading.
    #[default]
    Global,
    Local,
}

/// Address of a resolved symbol. Never null.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SymbolAddress(*const c_void);

// SAFETY: the address itself is plain data; dereferencing it is up to the caller.
unsafe impl Send for SymbolAddress {}
unsafe impl Sync for SymbolAddress {}

impl SymbolAddress {
    #[must_use]
    pub fn from_ptr(ptr: *const c_void) -> Option<Self> {
        if ptr.is_null() {
            None
        } else {
            Some(Self(ptr))
        }
    }

    #[must_use]
    pub fn as_ptr(self) -> *const c_void {
        self.0
    }

    /// Reinterpret the address as a function pointer type.
    ///
    /// # Safety
    /// `F` must be a function pointer type matching the symbol's real signature.
    #[must_use]
    pub unsafe fn cast<F: Copy>(self) -> F {
        const {
            assert!(
                std::mem::size_of::<F>() == std::mem::size_of::<*const c_void>(),
                "symbol can only be cast to a pointer-sized type"
            );
        }
        std::mem::transmute_copy(&self.0)
    }
}

/// One module as opened by a [`ModuleOpener`].
pub trait RawModule: Send + Sync {
    /// Resolve `name`, or `None` if the module does not export it.
    fn symbol(&self, name: &str) -> Option<SymbolAddress>;

    /// Release the module. Called at most once.
    ///
    /// # Errors
    /// Returns the OS loader's diagnostic when the close is rejected.
    fn close(self: Box<Self>) -> std::result::Result<(), String>;
}

/// Seam over the OS dynamic loader.
pub trait ModuleOpener: Send + Sync {
    /// Open the module at `path`.
    ///
    /// # Errors
    /// [`Error::Load`] carrying the loader's diagnostic text.
    fn open(&self, path: &Path, visibility: Visibility) -> Result<Box<dyn RawModule>>;
}

/// An opened dynamic module.
pub struct ModuleHandle {
    path: PathBuf,
    visibility: Visibility,
    module: Mutex<Option<Box<dyn RawModule>>>,
}

impl ModuleHandle {
    /// Open `path` through `opener`.
    ///
    /// # Errors
    /// Returns [`Error::Load`] if the loader rejects the file.
    pub fn open(
        opener: &dyn ModuleOpener,
        path: impl AsRef<Path>,
        visibility: Visibility,
    ) -> Result<Self> {
        let path = path.as_ref();
        let module = opener.open(path, visibility)?;
        debug!("Opened module {} ({:?})", path.display(), visibility);

        Ok(Self {
            path: path.to_path_buf(),
            visibility,
            module: Mutex::new(Some(module)),
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub fn visibility(&self) -> Visibility {
        self.visibility
    }

    #[must_use]
    pub fn is_loaded(&self) -> bool {
        self.module.lock().is_some()
    }

    /// Opaque value identifying this handle, used to tag diagnostics.
    #[must_use]
    pub fn raw_value(&self) -> usize {
        self as *const Self as usize
    }

    /// Close the module. Closing an already closed handle is a no-op.
    ///
    /// # Errors
    /// Returns [`Error::Load`] with the loader's diagnostic if the close fails.
    pub fn close(&self) -> Result<()> {
        let Some(module) = self.module.lock().take() else {
            return Ok(());
        };

        module
            .close()
            .map_err(|reason| Error::load(&self.path, format!("close failed: {reason}")))?;
        debug!("Closed module {}", self.path.display());
        Ok(())
    }

    #[must_use]
    pub fn has_symbol(&self, name: &str) -> bool {
        self.get_symbol(name).is_ok()
    }

    /// Resolve `name` to its address.
    ///
    /// # Errors
    /// [`Error::NotLoaded`] after [`close`](Self::close), otherwise
    /// [`Error::SymbolNotFound`].
    pub fn get_symbol(&self, name: &str) -> Result<SymbolAddress> {
        let guard = self.module.lock();
        let module = guard
            .as_ref()
            .ok_or_else(|| Error::NotLoaded(self.path.clone()))?;
        module
            .symbol(name)
            .ok_or_else(|| Error::symbol_not_found(&self.path, name))
    }

    /// Resolve `name` as a function pointer of type `F`.
    ///
    /// # Safety
    /// `F` must match the exported symbol's signature, and the pointer must
    /// not be called after the module is closed.
    ///
    /// # Errors
    /// Same as [`get_symbol`](Self::get_symbol).
    pub unsafe fn get_fn<F: Copy>(&self, name: &str) -> Result<F> {
        self.get_symbol(name).map(|address| address.cast::<F>())
    }
}

impl fmt::Debug for ModuleHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleHandle")
            .field("path", &self.path)
            .field("visibility", &self.visibility)
            .field("loaded", &self.is_loaded())
            .finish()
    }
}

impl Drop for ModuleHandle {
    fn drop(&mut self) {
        if let Some(module) = self.module.get_mut().take() {
            if let Err(reason) = module.close() {
                warn!("Failed to close module {}: {}", self.path.display(), reason);
            }
        }
    }
}

/// Key under which a module path is tracked: canonical when the file exists.
pub(crate) fn module_key(path: &Path) -> PathBuf {
    std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}

/// File extension of dynamic modules on this platform.
#[must_use]
pub fn platform_suffix() -> &'static str {
    if cfg!(target_os = "windows") {
        "dll"
    } else if cfg!(target_os = "macos") {
        "dylib"
    } else {
        "so"
    }
}
