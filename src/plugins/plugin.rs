use std::ffi::{CStr, CString};
use std::fmt;
use std::os::raw::{c_char, c_int};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, error, warn};

use crate::abi::{
    InitFn, MainFn, TextFn, ENTRY_POINT_FAULT, ENTRY_POINT_NOT_FOUND, HOOK_FAULT, PLUGIN_AUTHOR_SYMBOL,
    PLUGIN_COMPATIBILITY_SYMBOL, PLUGIN_DESCRIPTION_SYMBOL, PLUGIN_FEATURES_SYMBOL,
    PLUGIN_INIT_SYMBOL, PLUGIN_MAIN_SYMBOL, PLUGIN_NAME_SYMBOL, PLUGIN_SUBCOMMANDS_SYMBOL,
    PLUGIN_VERSION_SYMBOL,
};
use crate::error::{Error, Result};
use crate::loader::{ModuleHandle, ModuleLease};

/// Where a plugin came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PluginSource {
    Discovered(PathBuf),
    /// Built into the host binary.
    Manual,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum PluginKind {
    /// Raw side-effect module without structured metadata.
    LibraryOnly,
    Regular,
    Manual,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PluginState {
    Discovered,
    Initialized,
    InitFailed(String),
    Unloaded,
}

impl PluginState {
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::Discovered => "discovered",
            Self::Initialized => "initialized",
            Self::InitFailed(_) => "failed",
            Self::Unloaded => "unloaded",
        }
    }
}

/// The plugin's entry points, resolved from a module or supplied by the host.
#[derive(Clone, Copy, Default)]
pub struct PluginFunctions {
    pub init: Option<InitFn>,
    pub name: Option<TextFn>,
    pub author: Option<TextFn>,
    pub description: Option<TextFn>,
    pub compatibility: Option<TextFn>,
    pub version: Option<TextFn>,
    pub subcommands: Option<TextFn>,
    pub features: Option<TextFn>,
    pub main_entry: Option<MainFn>,
}

impl PluginFunctions {
    /// Resolve whatever subset of the plugin symbols `module` exports.
    #[must_use]
    pub fn resolve(module: &ModuleHandle) -> Self {
        // SAFETY: every symbol's type is fixed by the module ABI.
        unsafe {
            Self {
                init: module.get_fn(PLUGIN_INIT_SYMBOL).ok(),
                name: module.get_fn(PLUGIN_NAME_SYMBOL).ok(),
                author: module.get_fn(PLUGIN_AUTHOR_SYMBOL).ok(),
                description: module.get_fn(PLUGIN_DESCRIPTION_SYMBOL).ok(),
                compatibility: module.get_fn(PLUGIN_COMPATIBILITY_SYMBOL).ok(),
                version: module.get_fn(PLUGIN_VERSION_SYMBOL).ok(),
                subcommands: module.get_fn(PLUGIN_SUBCOMMANDS_SYMBOL).ok(),
                features: module.get_fn(PLUGIN_FEATURES_SYMBOL).ok(),
                main_entry: module.get_fn(PLUGIN_MAIN_SYMBOL).ok(),
            }
        }
    }

    /// Whether any structured metadata beyond a name is present.
    #[must_use]
    pub fn has_metadata(&self) -> bool {
        self.author.is_some()
            || self.description.is_some()
            || self.compatibility.is_some()
            || self.version.is_some()
            || self.subcommands.is_some()
            || self.features.is_some()
            || self.main_entry.is_some()
    }
}

/// Serialisable snapshot used for listings.
#[derive(Debug, Clone, Serialize)]
pub struct PluginInfo {
    pub name: String,
    pub version: String,
    pub author: String,
    pub description: String,
    pub compatibility: Option<String>,
    pub subcommands: Vec<String>,
    pub features: Vec<String>,
    pub kind: PluginKind,
    pub path: Option<PathBuf>,
    pub state: &'static str,
    pub error: Option<String>,
}

/// One registry entry.
pub struct Plugin {
    id: u64,
    source: PluginSource,
    kind: PluginKind,
    module: Option<ModuleLease>,
    functions: PluginFunctions,
    state: PluginState,
}

impl Plugin {
    pub(crate) fn discovered(id: u64, kind: PluginKind, path: PathBuf, module: ModuleLease) -> Self {
        let functions = PluginFunctions::resolve(module.handle());
        if kind == PluginKind::Regular && !functions.has_metadata() {
            debug!("{} exports no plugin metadata", path.display());
        }

        Self {
            id,
            source: PluginSource::Discovered(path),
            kind,
            module: Some(module),
            functions,
            state: PluginState::Discovered,
        }
    }

    pub(crate) fn manual(id: u64, functions: PluginFunctions) -> Self {
        Self {
            id,
            source: PluginSource::Manual,
            kind: PluginKind::Manual,
            module: None,
            functions,
            state: PluginState::Discovered,
        }
    }

    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[must_use]
    pub fn source(&self) -> &PluginSource {
        &self.source
    }

    #[must_use]
    pub fn kind(&self) -> PluginKind {
        self.kind
    }

    #[must_use]
    pub fn state(&self) -> &PluginState {
        &self.state
    }

    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.state == PluginState::Initialized
    }

    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        match &self.source {
            PluginSource::Discovered(path) => Some(path),
            PluginSource::Manual => None,
        }
    }

    #[must_use]
    pub fn module(&self) -> Option<&Arc<ModuleHandle>> {
        self.module.as_ref().map(ModuleLease::handle)
    }

    /// Raw value tagging placeholders: the module handle, or the id for
    /// built-in plugins.
    #[must_use]
    pub fn raw_handle(&self) -> usize {
        self.module
            .as_ref()
            .map_or(self.id as usize, |module| module.handle().raw_value())
    }

    /// Initialize the plugin against `host_version`.
    ///
    /// A guarded init hook reports a panic as [`HOOK_FAULT`], which becomes
    /// [`Error::InitFailed`] like any other non-zero status. Library-only
    /// plugins are initialized whatever their hook returns.
    ///
    /// # Errors
    /// [`Error::VersionIncompatible`], [`Error::MissingInitHook`] or
    /// [`Error::InitFailed`].
    pub fn init(&mut self, host_version: &str) -> Result<()> {
        let result = self.try_init(host_version);
        self.state = match &result {
            Ok(()) => PluginState::Initialized,
            Err(e) => PluginState::InitFailed(e.to_string()),
        };
        result
    }

    fn try_init(&self, host_version: &str) -> Result<()> {
        let name = self.name();

        if self.kind == PluginKind::LibraryOnly {
            if let Some(init) = self.functions.init {
                // SAFETY: the init hook signature is fixed by the module ABI.
                let status = unsafe { init() };
                if status != 0 {
                    debug!("Library {} init hook returned {}", name, status);
                }
            }
            return Ok(());
        }

        if let Some(required) = self.compatibility() {
            if !is_compatible(&required, host_version) {
                warn!(
                    "Plugin {} requires host {}, running {}; skipping",
                    name, required, host_version
                );
                return Err(Error::VersionIncompatible {
                    name,
                    required,
                    host: host_version.to_string(),
                });
            }
        }

        let init = self
            .functions
            .init
            .ok_or_else(|| Error::MissingInitHook(name.clone()))?;
        call_init(&name, init)
    }

    pub(crate) fn reset(&mut self) {
        self.state = PluginState::Discovered;
    }

    /// Mark the plugin unloaded and give its module reference back to the
    /// table. Entry points still running keep their own reference.
    pub(crate) fn release(&mut self) {
        self.state = PluginState::Unloaded;
        self.module = None;
    }

    #[must_use]
    pub fn name(&self) -> String {
        self.text(self.functions.name, "name")
    }

    #[must_use]
    pub fn author(&self) -> String {
        self.text(self.functions.author, "author")
    }

    #[must_use]
    pub fn description(&self) -> String {
        self.text(self.functions.description, "description")
    }

    #[must_use]
    pub fn version(&self) -> String {
        self.text(self.functions.version, "version")
    }

    /// Host version prefix the plugin declares, if any.
    #[must_use]
    pub fn compatibility(&self) -> Option<String> {
        read_text(self.functions.compatibility)
    }

    #[must_use]
    pub fn subcommands(&self) -> Vec<String> {
        self.list(self.functions.subcommands, "subcommands")
    }

    #[must_use]
    pub fn features(&self) -> Vec<String> {
        self.list(self.functions.features, "features")
    }

    /// Whether this plugin answers to `command`, by name or subcommand.
    #[must_use]
    pub fn provides(&self, command: &str) -> bool {
        self.name() == command || self.subcommands().iter().any(|s| s == command)
    }

    #[must_use]
    pub fn has_main_entry(&self) -> bool {
        self.functions.main_entry.is_some()
    }

    /// Run the main entry with `argv`, returning the plugin's exit code or
    /// [`ENTRY_POINT_NOT_FOUND`].
    #[must_use]
    pub fn run_main_entry(&self, argv: &[String]) -> i32 {
        self.entry_point()
            .map_or(ENTRY_POINT_NOT_FOUND, |entry| entry.run(argv))
    }

    /// A sendable handle to the main entry. It holds its own reference in the
    /// module table, so the module is neither deinitialized nor closed while
    /// the entry point exists.
    #[must_use]
    pub fn entry_point(&self) -> Option<EntryPoint> {
        self.functions.main_entry.map(|main| EntryPoint {
            plugin: self.name(),
            main,
            _module: self.module.clone(),
        })
    }

    #[must_use]
    pub fn info(&self) -> PluginInfo {
        PluginInfo {
            name: self.name(),
            version: self.version(),
            author: self.author(),
            description: self.description(),
            compatibility: self.compatibility(),
            subcommands: self.subcommands(),
            features: self.features(),
            kind: self.kind,
            path: self.path().map(Path::to_path_buf),
            state: self.state.label(),
            error: match &self.state {
                PluginState::InitFailed(reason) => Some(reason.clone()),
                _ => None,
            },
        }
    }

    fn placeholder(&self, field: &str) -> String {
        format!("<{}@{:#x}>", field, self.raw_handle())
    }

    fn text(&self, f: Option<TextFn>, field: &str) -> String {
        read_text(f).unwrap_or_else(|| self.placeholder(field))
    }

    fn list(&self, f: Option<TextFn>, field: &str) -> Vec<String> {
        let Some(json) = read_text(f) else {
            return Vec::new();
        };
        serde_json::from_str(&json).unwrap_or_else(|e| {
            warn!(
                "Plugin {} returned malformed {} ({}): {}",
                self.name(),
                field,
                e,
                json
            );
            Vec::new()
        })
    }
}

impl fmt::Debug for Plugin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Plugin")
            .field("id", &self.id)
            .field("name", &self.name())
            .field("kind", &self.kind)
            .field("source", &self.source)
            .field("state", &self.state)
            .finish()
    }
}

/// Main entry of one plugin, runnable from any thread.
#[derive(Clone)]
pub struct EntryPoint {
    plugin: String,
    main: MainFn,
    _module: Option<ModuleLease>,
}

impl EntryPoint {
    #[must_use]
    pub fn plugin_name(&self) -> &str {
        &self.plugin
    }

    /// Forward `argv` to the plugin and return its exit code.
    #[must_use]
    pub fn run(&self, argv: &[String]) -> i32 {
        let args: Vec<CString> = argv
            .iter()
            .filter_map(|arg| match CString::new(arg.as_str()) {
                Ok(arg) => Some(arg),
                Err(_) => {
                    warn!("Dropping argument with an interior NUL for {}", self.plugin);
                    None
                }
            })
            .collect();
        let mut pointers: Vec<*const c_char> = args.iter().map(|arg| arg.as_ptr()).collect();
        pointers.push(std::ptr::null());
        let argc = c_int::try_from(args.len()).unwrap_or(c_int::MAX);

        // SAFETY: argv stays alive for the call and is NULL-terminated; the
        // module is kept loaded by `_module`.
        let code = unsafe { (self.main)(argc, pointers.as_ptr()) };
        if code == ENTRY_POINT_FAULT {
            error!("Plugin {} faulted", self.plugin);
        }
        code
    }
}

/// Compatibility is a prefix match of the declared requirement against the
/// host version. An empty requirement matches every host.
#[must_use]
pub fn is_compatible(required: &str, host_version: &str) -> bool {
    host_version.starts_with(required)
}

fn call_init(name: &str, init: InitFn) -> Result<()> {
    // SAFETY: the init hook signature is fixed by the module ABI.
    let reason = match unsafe { init() } {
        0 => return Ok(()),
        HOOK_FAULT => "init hook faulted".to_string(),
        code => format!("init hook returned {code}"),
    };
    Err(Error::InitFailed {
        name: name.to_string(),
        reason,
    })
}

fn read_text(f: Option<TextFn>) -> Option<String> {
    let f = f?;
    // SAFETY: metadata getters return NUL-terminated strings owned by the
    // module, valid while it is loaded.
    let ptr = unsafe { f() };
    if ptr.is_null() {
        return None;
    }
    Some(unsafe { CStr::from_ptr(ptr) }.to_string_lossy().into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abi::guard_status;

    unsafe extern "C" fn hello_name() -> *const c_char {
        c"Hello".as_ptr()
    }

    unsafe extern "C" fn old_name() -> *const c_char {
        c"Old".as_ptr()
    }

    unsafe extern "C" fn old_compat() -> *const c_char {
        c"0.1".as_ptr()
    }

    unsafe extern "C" fn null_text() -> *const c_char {
        std::ptr::null()
    }

    unsafe extern "C" fn bad_json() -> *const c_char {
        c"not json".as_ptr()
    }

    unsafe extern "C" fn subcommands() -> *const c_char {
        c"[\"greet\", \"wave\"]".as_ptr()
    }

    static OLD_INIT_CALLS: std::sync::atomic::AtomicUsize = std::sync::atomic::AtomicUsize::new(0);

    extern "C" fn ok_init() -> c_int {
        0
    }

    extern "C" fn old_init() -> c_int {
        OLD_INIT_CALLS.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        0
    }

    extern "C" fn failing_init() -> c_int {
        3
    }

    extern "C" fn panicking_init() -> c_int {
        guard_status(PLUGIN_INIT_SYMBOL, || panic!("init blew up"))
    }

    extern "C" fn count_args(argc: c_int, argv: *const *const c_char) -> c_int {
        let last = unsafe { CStr::from_ptr(*argv.add(argc as usize - 1)) };
        assert_eq!(last.to_str().unwrap(), "--fast");
        assert!(unsafe { *argv.add(argc as usize) }.is_null());
        argc
    }

    extern "C" fn panicking_main(_argc: c_int, _argv: *const *const c_char) -> c_int {
        guard_status(PLUGIN_MAIN_SYMBOL, || panic!("main blew up"))
    }

    fn plugin(functions: PluginFunctions) -> Plugin {
        Plugin::manual(7, functions)
    }

    #[test]
    fn test_compatible_plugin_initializes() {
        let mut hello = plugin(PluginFunctions {
            init: Some(ok_init),
            name: Some(hello_name),
            ..PluginFunctions::default()
        });

        hello.init("1.2.3").unwrap();
        assert!(hello.is_initialized());
        assert_eq!(hello.name(), "Hello");
    }

    #[test]
    fn test_incompatible_plugin_skips_hook() {
        let mut old = plugin(PluginFunctions {
            init: Some(old_init),
            name: Some(old_name),
            compatibility: Some(old_compat),
            ..PluginFunctions::default()
        });

        let err = old.init("1.2.3").unwrap_err();
        assert!(matches!(err, Error::VersionIncompatible { ref required, .. } if required == "0.1"));
        assert_eq!(OLD_INIT_CALLS.load(std::sync::atomic::Ordering::SeqCst), 0);
        assert_eq!(old.state().label(), "failed");
        assert_eq!(old.info().name, "Old");
    }

    #[test]
    fn test_missing_init_hook_fails() {
        let mut plugin = plugin(PluginFunctions {
            name: Some(hello_name),
            ..PluginFunctions::default()
        });
        assert!(matches!(plugin.init("1.2.3"), Err(Error::MissingInitHook(_))));
    }

    #[test]
    fn test_hook_faults_become_failures() {
        let mut failing = plugin(PluginFunctions {
            init: Some(failing_init),
            ..PluginFunctions::default()
        });
        let mut panicking = plugin(PluginFunctions {
            init: Some(panicking_init),
            ..PluginFunctions::default()
        });

        assert!(matches!(failing.init("1.0"), Err(Error::InitFailed { .. })));
        match panicking.init("1.0") {
            Err(Error::InitFailed { reason, .. }) => assert_eq!(reason, "init hook faulted"),
            other => panic!("expected init failure, got {other:?}"),
        }
        assert!(!panicking.is_initialized());
    }

    #[test]
    fn test_placeholders_for_missing_metadata() {
        let plugin = plugin(PluginFunctions {
            author: Some(null_text),
            features: Some(bad_json),
            ..PluginFunctions::default()
        });

        assert_eq!(plugin.name(), "<name@0x7>");
        assert_eq!(plugin.author(), "<author@0x7>");
        assert_eq!(plugin.version(), "<version@0x7>");
        assert!(plugin.compatibility().is_none());
        assert!(plugin.features().is_empty());
        assert!(plugin.subcommands().is_empty());
    }

    #[test]
    fn test_provides_by_name_or_subcommand() {
        let plugin = plugin(PluginFunctions {
            name: Some(hello_name),
            subcommands: Some(subcommands),
            ..PluginFunctions::default()
        });

        assert!(plugin.provides("Hello"));
        assert!(plugin.provides("wave"));
        assert!(!plugin.provides("bench"));
    }

    #[test]
    fn test_run_main_entry() {
        let missing = plugin(PluginFunctions::default());
        assert_eq!(missing.run_main_entry(&["x".to_string()]), ENTRY_POINT_NOT_FOUND);

        let counting = plugin(PluginFunctions {
            main_entry: Some(count_args),
            ..PluginFunctions::default()
        });
        let argv = vec!["bench".to_string(), "--fast".to_string()];
        assert_eq!(counting.run_main_entry(&argv), 2);

        let panicking = plugin(PluginFunctions {
            main_entry: Some(panicking_main),
            ..PluginFunctions::default()
        });
        assert_eq!(panicking.run_main_entry(&argv), ENTRY_POINT_FAULT);
    }

    #[test]
    fn test_prefix_compatibility() {
        assert!(is_compatible("", "1.2.3"));
        assert!(is_compatible("1.2", "1.2.3"));
        assert!(is_compatible("1.2.3", "1.2.3"));
        assert!(!is_compatible("0.1", "1.2.3"));
        assert!(!is_compatible("1.2.3.4", "1.2.3"));
    }
}
