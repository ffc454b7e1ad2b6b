use std::collections::HashMap;
use std::ffi::c_void;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;

use super::{ModuleOpener, RawModule, SymbolAddress, Visibility};
use crate::error::{Error, Result};

/// Symbol table of a module linked into the host binary.
#[derive(Debug, Clone, Default)]
pub struct StaticSymbols {
    symbols: HashMap<String, SymbolAddress>,
}

impl StaticSymbols {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Export `ptr` under `name`. Null pointers are not exported.
    #[must_use]
    pub fn symbol(mut self, name: &str, ptr: *const c_void) -> Self {
        if let Some(address) = SymbolAddress::from_ptr(ptr) {
            self.symbols.insert(name.to_string(), address);
        }
        self
    }
}

#[derive(Default)]
struct StaticState {
    modules: HashMap<PathBuf, Arc<StaticSymbols>>,
    opens: HashMap<PathBuf, usize>,
    closes: HashMap<PathBuf, usize>,
}

/// Serves [`StaticSymbols`] registered under virtual paths, so statically
/// linked modules go through the same loading path as files on disk.
#[derive(Clone, Default)]
pub struct StaticOpener {
    state: Arc<Mutex<StaticState>>,
}

impl StaticOpener {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, path: impl AsRef<Path>, symbols: StaticSymbols) {
        self.state
            .lock()
            .modules
            .insert(path.as_ref().to_path_buf(), Arc::new(symbols));
    }

    /// Number of successful opens of `path`.
    #[must_use]
    pub fn open_count(&self, path: impl AsRef<Path>) -> usize {
        self.state
            .lock()
            .opens
            .get(path.as_ref())
            .copied()
            .unwrap_or(0)
    }

    /// Number of closes of `path`.
    #[must_use]
    pub fn close_count(&self, path: impl AsRef<Path>) -> usize {
        self.state
            .lock()
            .closes
            .get(path.as_ref())
            .copied()
            .unwrap_or(0)
    }
}

impl ModuleOpener for StaticOpener {
    fn open(&self, path: &Path, _visibility: Visibility) -> Result<Box<dyn RawModule>> {
        let mut state = self.state.lock();
        let symbols = state
            .modules
            .get(path)
            .cloned()
            .ok_or_else(|| Error::load(path, "no static module registered at this path"))?;
        *state.opens.entry(path.to_path_buf()).or_default() += 1;

        Ok(Box::new(StaticModule {
            path: path.to_path_buf(),
            symbols,
            state: Arc::clone(&self.state),
        }))
    }
}

struct StaticModule {
    path: PathBuf,
    symbols: Arc<StaticSymbols>,
    state: Arc<Mutex<StaticState>>,
}

impl RawModule for StaticModule {
    fn symbol(&self, name: &str) -> Option<SymbolAddress> {
        self.symbols.symbols.get(name).copied()
    }

    fn close(self: Box<Self>) -> std::result::Result<(), String> {
        *self.state.lock().closes.entry(self.path.clone()).or_default() += 1;
        Ok(())
    }
}
