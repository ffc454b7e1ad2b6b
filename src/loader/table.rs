use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::{module_key, ModuleHandle, ModuleOpener, NativeOpener, Visibility};
use crate::abi::{ModuleHookFn, MODULE_DEINIT_SYMBOL, MODULE_INIT_SYMBOL};
use crate::error::{Error, Result};

struct TableEntry {
    handle: Arc<ModuleHandle>,
    refs: usize,
}

/// Reference-counted set of loaded modules, keyed by path.
///
/// Hooks run while the table lock is held, so a module init hook must not
/// load or unload modules through the same table.
pub struct ModuleTable {
    opener: Arc<dyn ModuleOpener>,
    visibility: Visibility,
    entries: Mutex<HashMap<PathBuf, TableEntry>>,
}

impl ModuleTable {
    pub fn new(opener: Arc<dyn ModuleOpener>, visibility: Visibility) -> Self {
        Self {
            opener,
            visibility,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Table backed by the OS dynamic loader.
    #[must_use]
    pub fn native(visibility: Visibility) -> Self {
        Self::new(Arc::new(NativeOpener), visibility)
    }

    /// Load `path`, or take another reference to it if it is already loaded.
    ///
    /// # Errors
    /// Returns [`Error::Load`] if the module cannot be opened.
    pub fn load(&self, path: impl AsRef<Path>) -> Result<Arc<ModuleHandle>> {
        let key = module_key(path.as_ref());
        let mut entries = self.entries.lock();

        if let Some(entry) = entries.get_mut(&key) {
            entry.refs += 1;
            debug!("Module {} now has {} references", key.display(), entry.refs);
            return Ok(Arc::clone(&entry.handle));
        }

        let handle = Arc::new(ModuleHandle::open(
            self.opener.as_ref(),
            &key,
            self.visibility,
        )?);
        run_module_hook(&handle, MODULE_INIT_SYMBOL);
        info!("Loaded module {}", key.display());

        entries.insert(
            key,
            TableEntry {
                handle: Arc::clone(&handle),
                refs: 1,
            },
        );
        Ok(handle)
    }

    /// Load `path` and return a reference counted in the table that is
    /// released when dropped.
    ///
    /// # Errors
    /// Returns [`Error::Load`] if the module cannot be opened.
    pub fn lease(self: &Arc<Self>, path: impl AsRef<Path>) -> Result<ModuleLease> {
        let handle = self.load(path)?;
        Ok(ModuleLease {
            modules: Arc::clone(self),
            handle,
        })
    }

    /// Drop one reference to `path`. Returns `true` when this was the last
    /// reference and the module was released.
    ///
    /// # Errors
    /// [`Error::NotLoaded`] if `path` has no references, or the loader's
    /// diagnostic if closing fails.
    pub fn unload(&self, path: impl AsRef<Path>) -> Result<bool> {
        let key = module_key(path.as_ref());
        let mut entries = self.entries.lock();

        let entry = entries
            .get_mut(&key)
            .ok_or_else(|| Error::NotLoaded(key.clone()))?;
        entry.refs -= 1;
        if entry.refs > 0 {
            debug!("Module {} now has {} references", key.display(), entry.refs);
            return Ok(false);
        }

        let Some(entry) = entries.remove(&key) else {
            return Ok(false);
        };
        run_module_hook(&entry.handle, MODULE_DEINIT_SYMBOL);

        match Arc::try_unwrap(entry.handle) {
            Ok(handle) => handle.close()?,
            // Still shared; the OS close happens when the last clone drops.
            Err(_shared) => debug!("Deferring close of {} until it is idle", key.display()),
        }
        info!("Unloaded module {}", key.display());
        Ok(true)
    }

    fn retain(&self, handle: &Arc<ModuleHandle>) {
        let mut entries = self.entries.lock();
        let entry = entries
            .entry(handle.path().to_path_buf())
            .or_insert_with(|| TableEntry {
                handle: Arc::clone(handle),
                refs: 0,
            });
        entry.refs += 1;
    }

    #[must_use]
    pub fn ref_count(&self, path: impl AsRef<Path>) -> usize {
        self.entries
            .lock()
            .get(&module_key(path.as_ref()))
            .map_or(0, |entry| entry.refs)
    }

    #[must_use]
    pub fn is_loaded(&self, path: impl AsRef<Path>) -> bool {
        self.ref_count(path) > 0
    }

    #[must_use]
    pub fn get(&self, path: impl AsRef<Path>) -> Option<Arc<ModuleHandle>> {
        self.entries
            .lock()
            .get(&module_key(path.as_ref()))
            .map(|entry| Arc::clone(&entry.handle))
    }

    #[must_use]
    pub fn loaded_paths(&self) -> Vec<PathBuf> {
        let mut paths: Vec<PathBuf> = self.entries.lock().keys().cloned().collect();
        paths.sort();
        paths
    }

    #[must_use]
    pub fn visibility(&self) -> Visibility {
        self.visibility
    }
}

/// One counted reference to a module in a [`ModuleTable`].
///
/// Cloning takes another reference and dropping gives it back, so the
/// deinit hook only runs once every lease is gone.
pub struct ModuleLease {
    modules: Arc<ModuleTable>,
    handle: Arc<ModuleHandle>,
}

impl ModuleLease {
    #[must_use]
    pub fn handle(&self) -> &Arc<ModuleHandle> {
        &self.handle
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        self.handle.path()
    }
}

impl Clone for ModuleLease {
    fn clone(&self) -> Self {
        self.modules.retain(&self.handle);
        Self {
            modules: Arc::clone(&self.modules),
            handle: Arc::clone(&self.handle),
        }
    }
}

impl Drop for ModuleLease {
    fn drop(&mut self) {
        if let Err(e) = self.modules.unload(self.handle.path()) {
            warn!("Failed to release {}: {}", self.handle.path().display(), e);
        }
    }
}

fn run_module_hook(handle: &ModuleHandle, symbol: &str) {
    // SAFETY: the hook signature is fixed by the module ABI.
    let Ok(hook) = (unsafe { handle.get_fn::<ModuleHookFn>(symbol) }) else {
        return;
    };

    // SAFETY: the module stays loaded for the duration of the call, and the
    // module guards the hook body against panics.
    unsafe { hook() };
    debug!("Ran {} of {}", symbol, handle.path().display());
}
