use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, error, info, warn};

use super::plugin::{Plugin, PluginFunctions, PluginKind, PluginState};
use crate::error::{Error, Result};
use crate::events::{EventBus, RuntimeEvent};
use crate::loader::{platform_suffix, ModuleTable};

/// File extension of structured plugins.
pub const PLUGIN_EXTENSION: &str = "plugin";

/// Outcome of scanning one or more directories.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanReport {
    pub discovered: usize,
    /// Files whose name is already registered.
    pub skipped: usize,
    pub failed: usize,
}

impl ScanReport {
    fn absorb(&mut self, other: Self) {
        self.discovered += other.discovered;
        self.skipped += other.skipped;
        self.failed += other.failed;
    }
}

/// Outcome of [`PluginRegistry::initialize_new`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InitReport {
    pub attempted: usize,
    pub initialized: usize,
    pub failed: usize,
    /// Display names claimed by more than one initialized plugin.
    pub duplicates: Vec<String>,
}

impl InitReport {
    /// Every attempted plugin failed.
    #[must_use]
    pub fn all_failed(&self) -> bool {
        self.attempted > 0 && self.initialized == 0
    }
}

/// Ordered set of discovered and built-in plugins.
pub struct PluginRegistry {
    modules: Arc<ModuleTable>,
    host_version: String,
    events: EventBus,
    plugins: Vec<Plugin>,
    search_paths: Vec<PathBuf>,
    next_id: u64,
}

impl PluginRegistry {
    pub fn new(modules: Arc<ModuleTable>, host_version: impl Into<String>, events: EventBus) -> Self {
        Self {
            modules,
            host_version: host_version.into(),
            events,
            plugins: Vec::new(),
            search_paths: Vec::new(),
            next_id: 1,
        }
    }

    #[must_use]
    pub fn host_version(&self) -> &str {
        &self.host_version
    }

    #[must_use]
    pub fn search_paths(&self) -> &[PathBuf] {
        &self.search_paths
    }

    /// Remember `path` for [`rescan`](Self::rescan). Returns `false` if it
    /// was already known.
    pub fn add_search_path(&mut self, path: impl Into<PathBuf>) -> bool {
        let path = path.into();
        if self.search_paths.contains(&path) {
            return false;
        }
        self.search_paths.push(path);
        true
    }

    /// Scan every known search path. Missing directories are logged and
    /// skipped.
    pub fn rescan(&mut self) -> ScanReport {
        let mut report = ScanReport::default();
        for path in self.search_paths.clone() {
            match self.scan(&path) {
                Ok(scanned) => report.absorb(scanned),
                Err(e) => debug!("Skipping search path: {}", e),
            }
        }
        report
    }

    /// Discover plugins in `dir`.
    ///
    /// `*.plugin` files become regular plugins and files with the platform
    /// module suffix become library-only plugins. A file whose name is
    /// already registered is skipped, so scanning is idempotent. Files that
    /// fail to open are logged and counted.
    ///
    /// # Errors
    /// [`Error::IoAt`] if `dir` cannot be read.
    pub fn scan(&mut self, dir: impl AsRef<Path>) -> Result<ScanReport> {
        let dir = dir.as_ref();
        let mut files: Vec<PathBuf> = fs::read_dir(dir)
            .map_err(|e| Error::io_at(dir, e))?
            .filter_map(|entry| entry.ok().map(|entry| entry.path()))
            .filter(|path| path.is_file())
            .collect();
        files.sort();

        let mut report = ScanReport::default();
        for path in files {
            let Some(kind) = classify(&path) else {
                continue;
            };
            if self.has_file_name(&path) {
                report.skipped += 1;
                continue;
            }

            match self.modules.lease(&path) {
                Ok(module) => {
                    let id = self.allocate_id();
                    debug!("Discovered {:?} plugin {}", kind, path.display());
                    self.events
                        .publish(&RuntimeEvent::PluginDiscovered { path: path.clone() });
                    self.plugins.push(Plugin::discovered(id, kind, path, module));
                    report.discovered += 1;
                }
                Err(e) => {
                    warn!("Failed to load plugin: {}", e);
                    report.failed += 1;
                }
            }
        }

        info!(
            "Scanned {}: {} discovered, {} skipped, {} failed",
            dir.display(),
            report.discovered,
            report.skipped,
            report.failed
        );
        Ok(report)
    }

    /// Register a plugin built into the host. Returns its id.
    pub fn add_manual(&mut self, functions: PluginFunctions) -> u64 {
        let id = self.allocate_id();
        self.plugins.push(Plugin::manual(id, functions));
        id
    }

    /// Initialize every plugin still in the discovered state.
    pub fn initialize_new(&mut self) -> InitReport {
        let mut report = InitReport::default();
        let events = &self.events;

        for plugin in self
            .plugins
            .iter_mut()
            .filter(|plugin| *plugin.state() == PluginState::Discovered)
        {
            report.attempted += 1;
            let name = plugin.name();
            match plugin.init(&self.host_version) {
                Ok(()) => {
                    report.initialized += 1;
                    info!("Initialized plugin {}", name);
                    events.publish(&RuntimeEvent::PluginInitialized { name });
                }
                Err(e) => {
                    report.failed += 1;
                    warn!("Plugin {} failed to initialize: {}", name, e);
                    events.publish(&RuntimeEvent::PluginInitFailed {
                        name,
                        reason: e.to_string(),
                    });
                }
            }
        }

        report.duplicates = self.duplicates();
        if report.all_failed() {
            error!("All {} plugins failed to initialize", report.attempted);
        }
        if !report.duplicates.is_empty() {
            warn!(
                "Duplicate plugin names: {}",
                report.duplicates.join(", ")
            );
        }
        report
    }

    /// Unload everything except built-in plugins, which return to the
    /// discovered state. Entries are released back to front. Returns the
    /// number of plugins removed.
    pub fn unload_all(&mut self) -> usize {
        let mut kept = Vec::new();
        let mut removed = 0;

        while let Some(mut plugin) = self.plugins.pop() {
            if plugin.kind() == PluginKind::Manual {
                plugin.reset();
                kept.push(plugin);
                continue;
            }

            plugin.release();
            removed += 1;
        }

        kept.reverse();
        self.plugins = kept;
        self.events
            .publish(&RuntimeEvent::PluginsUnloaded { count: removed });
        info!("Unloaded {} plugins", removed);
        removed
    }

    /// First plugin whose display name is `name`.
    #[must_use]
    pub fn find(&self, name: &str) -> Option<&Plugin> {
        self.plugins.iter().find(|plugin| plugin.name() == name)
    }

    #[must_use]
    pub fn get(&self, id: u64) -> Option<&Plugin> {
        self.plugins.iter().find(|plugin| plugin.id() == id)
    }

    pub fn list(&self) -> impl Iterator<Item = &Plugin> {
        self.plugins.iter()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }

    /// The initialized plugin that handles `command`.
    ///
    /// # Errors
    /// [`Error::PluginNotFound`] if nothing provides `command`,
    /// [`Error::PluginNotReady`] if no provider is initialized and
    /// [`Error::DuplicatePlugin`] if the choice is ambiguous.
    pub fn resolve(&self, command: &str) -> Result<&Plugin> {
        let providers: Vec<&Plugin> = self
            .plugins
            .iter()
            .filter(|plugin| plugin.kind() != PluginKind::LibraryOnly && plugin.provides(command))
            .collect();
        if providers.is_empty() {
            return Err(Error::PluginNotFound(command.to_string()));
        }

        let ready: Vec<&Plugin> = providers
            .into_iter()
            .filter(|plugin| plugin.is_initialized())
            .collect();
        match ready.as_slice() {
            [] => Err(Error::PluginNotReady(command.to_string())),
            [plugin] => Ok(*plugin),
            _ => Err(Error::DuplicatePlugin {
                name: command.to_string(),
                count: ready.len(),
            }),
        }
    }

    /// Names of initialized plugins that appear more than once.
    #[must_use]
    pub fn duplicates(&self) -> Vec<String> {
        let mut counts: BTreeMap<String, usize> = BTreeMap::new();
        for plugin in self.plugins.iter().filter(|plugin| plugin.is_initialized()) {
            *counts.entry(plugin.name()).or_default() += 1;
        }
        counts
            .into_iter()
            .filter(|(_, count)| *count > 1)
            .map(|(name, _)| name)
            .collect()
    }

    fn has_file_name(&self, path: &Path) -> bool {
        let name = path.file_name();
        self.plugins
            .iter()
            .any(|plugin| plugin.path().and_then(Path::file_name) == name)
    }

    fn allocate_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }
}

impl Drop for PluginRegistry {
    fn drop(&mut self) {
        self.unload_all();
    }
}

fn classify(path: &Path) -> Option<PluginKind> {
    let extension = path.extension()?.to_str()?;
    if extension == PLUGIN_EXTENSION {
        Some(PluginKind::Regular)
    } else if extension == platform_suffix() {
        Some(PluginKind::LibraryOnly)
    } else {
        None
    }
}
