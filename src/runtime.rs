//! The host's runtime context: module table, plugin registry, worker pool
//! and event bus, owned together and passed explicitly.

use std::cell::RefCell;
use std::sync::Arc;

use parking_lot::ReentrantMutex;
use tracing::{info, warn};

use crate::abi::ENTRY_POINT_NOT_FOUND;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::events::{EventBus, RuntimeEvent};
use crate::loader::{ModuleOpener, ModuleTable, NativeOpener};
use crate::plugins::{InitReport, PluginFunctions, PluginInfo, PluginRegistry};
use crate::pool::{TaskHandle, WorkerPool};

pub struct Runtime {
    config: Config,
    modules: Arc<ModuleTable>,
    registry: ReentrantMutex<RefCell<PluginRegistry>>,
    pool: WorkerPool,
    events: EventBus,
}

impl Runtime {
    /// Runtime backed by the OS dynamic loader.
    ///
    /// # Errors
    /// [`Error::Io`] if the worker pool cannot start.
    pub fn new(config: Config) -> Result<Self> {
        Self::with_opener(config, Arc::new(NativeOpener))
    }

    /// Runtime loading modules through `opener`.
    ///
    /// # Errors
    /// [`Error::Io`] if the worker pool cannot start.
    pub fn with_opener(config: Config, opener: Arc<dyn ModuleOpener>) -> Result<Self> {
        let modules = Arc::new(ModuleTable::new(opener, config.plugins.visibility));
        let events = EventBus::new();
        let registry = PluginRegistry::new(
            Arc::clone(&modules),
            config.host_version(),
            events.clone(),
        );
        let pool = WorkerPool::new(config.runtime.workers)?;

        Ok(Self {
            config,
            modules,
            registry: ReentrantMutex::new(RefCell::new(registry)),
            pool,
            events,
        })
    }

    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    #[must_use]
    pub fn modules(&self) -> &Arc<ModuleTable> {
        &self.modules
    }

    #[must_use]
    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Run `f` with exclusive access to the registry.
    ///
    /// # Errors
    /// [`Error::Reentrant`] when called from inside another `with_registry`
    /// on the same thread, such as from a plugin hook.
    pub fn with_registry<R>(&self, f: impl FnOnce(&mut PluginRegistry) -> R) -> Result<R> {
        let guard = self.registry.lock();
        let mut registry = guard.try_borrow_mut().map_err(|_| Error::Reentrant)?;
        Ok(f(&mut registry))
    }

    /// Register a plugin built into the host. Returns its id.
    ///
    /// # Errors
    /// [`Error::Reentrant`].
    pub fn register_builtin(&self, functions: PluginFunctions) -> Result<u64> {
        self.with_registry(|registry| registry.add_manual(functions))
    }

    /// Scan every configured search path and initialize what was found.
    ///
    /// # Errors
    /// [`Error::Reentrant`].
    pub fn load_plugins(&self) -> Result<InitReport> {
        let search_paths = self.config.search_paths();
        self.with_registry(|registry| {
            for path in search_paths {
                registry.add_search_path(path);
            }
            let scanned = registry.rescan();
            info!(
                "Found {} plugins ({} already known, {} failed)",
                scanned.discovered, scanned.skipped, scanned.failed
            );
            registry.initialize_new()
        })
    }

    /// Unload discovered plugins, then scan and initialize again.
    ///
    /// # Errors
    /// [`Error::Reentrant`].
    pub fn reload_plugins(&self) -> Result<InitReport> {
        self.unload_plugins()?;
        self.load_plugins()
    }

    /// # Errors
    /// [`Error::Reentrant`].
    pub fn unload_plugins(&self) -> Result<usize> {
        self.with_registry(PluginRegistry::unload_all)
    }

    /// # Errors
    /// [`Error::Reentrant`].
    pub fn plugin_infos(&self) -> Result<Vec<PluginInfo>> {
        self.with_registry(|registry| registry.list().map(|plugin| plugin.info()).collect())
    }

    /// Resolve `argv[0]` and run the plugin's main entry on the pool.
    ///
    /// # Errors
    /// [`Error::PluginNotFound`], [`Error::PluginNotReady`] or
    /// [`Error::DuplicatePlugin`] from resolution.
    pub fn run(&self, argv: Vec<String>) -> Result<TaskHandle<i32>> {
        let task = self.prepare(argv)?;
        Ok(self.pool.submit(task))
    }

    /// Run a forwarded command without waiting for it. The exit code is
    /// logged when the plugin finishes.
    pub fn run_detached(&self, argv: Vec<String>) {
        self.events
            .publish(&RuntimeEvent::CommandReceived { argv: argv.clone() });
        let command = argv.first().cloned().unwrap_or_default();

        match self.prepare(argv) {
            Ok(task) => {
                self.pool.submit(move || {
                    let code = task();
                    info!("{} exited with {}", command, code);
                });
            }
            Err(e) => warn!("Cannot run forwarded command: {}", e),
        }
    }

    fn prepare(&self, argv: Vec<String>) -> Result<impl FnOnce() -> i32 + Send + 'static> {
        let command = argv
            .first()
            .cloned()
            .ok_or_else(|| Error::PluginNotFound(String::new()))?;
        let entry = self.with_registry(|registry| {
            registry.resolve(&command).map(|plugin| plugin.entry_point())
        })??;

        info!("Running {}", command);
        Ok(move || entry.map_or(ENTRY_POINT_NOT_FOUND, |entry| entry.run(&argv)))
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        if let Err(e) = self.unload_plugins() {
            warn!("Failed to unload plugins: {}", e);
        }
    }
}
