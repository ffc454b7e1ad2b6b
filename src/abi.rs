//! ABI shared between the host and dynamically loaded modules.
//!
//! Every symbol below is optional. A module that lacks one simply loses the
//! corresponding feature.
//!
//! ```c
//! void        hearth_module_init(void);      // once, on first load
//! void        hearth_module_deinit(void);    // once, on last unload
//! int         hearth_plugin_init(void);      // 0 on success
//! const char* hearth_plugin_name(void);
//! const char* hearth_plugin_author(void);
//! const char* hearth_plugin_description(void);
//! const char* hearth_plugin_compatibility(void);   // host version prefix
//! const char* hearth_plugin_version(void);
//! const char* hearth_plugin_subcommands(void);     // JSON array of strings
//! const char* hearth_plugin_features(void);        // JSON array of strings
//! int         hearth_plugin_main(int argc, const char** argv);
//! bool        <Capability::BUILDER_SYMBOL>(uint64_t abi, CapabilityId id, void* manifest);
//! ```
//!
//! The host and every module carry their own copy of the Rust runtime, and a
//! panic can never unwind from one into the other. Each exported hook body
//! therefore runs inside [`guard_status`], [`guard_void`] or
//! [`guard_with_default`] on the module side, and the host reads a fault as
//! [`HOOK_FAULT`].

use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::ffi::c_void;
use std::mem::size_of;
use std::os::raw::{c_char, c_int};
use std::panic::{self, AssertUnwindSafe};

use tracing::error;

pub const MODULE_INIT_SYMBOL: &str = "hearth_module_init";
pub const MODULE_DEINIT_SYMBOL: &str = "hearth_module_deinit";

pub const PLUGIN_INIT_SYMBOL: &str = "hearth_plugin_init";
pub const PLUGIN_NAME_SYMBOL: &str = "hearth_plugin_name";
pub const PLUGIN_AUTHOR_SYMBOL: &str = "hearth_plugin_author";
pub const PLUGIN_DESCRIPTION_SYMBOL: &str = "hearth_plugin_description";
pub const PLUGIN_COMPATIBILITY_SYMBOL: &str = "hearth_plugin_compatibility";
pub const PLUGIN_VERSION_SYMBOL: &str = "hearth_plugin_version";
pub const PLUGIN_SUBCOMMANDS_SYMBOL: &str = "hearth_plugin_subcommands";
pub const PLUGIN_FEATURES_SYMBOL: &str = "hearth_plugin_features";
pub const PLUGIN_MAIN_SYMBOL: &str = "hearth_plugin_main";

/// Exit code returned when a plugin has no main entry point.
pub const ENTRY_POINT_NOT_FOUND: i32 = 127;

/// Status a guarded hook returns when its body panicked.
pub const HOOK_FAULT: c_int = -1;

/// Exit code returned when a plugin's main entry point panicked.
pub const ENTRY_POINT_FAULT: i32 = HOOK_FAULT;

/// Bumped whenever the manifest layout or a hook signature changes.
const ABI_REVISION: u64 = 2;

/// Identity of the manifest layout this build of `hearth` hands to builders.
///
/// Folds in the ABI revision, the crate version and the sizes of the maps
/// the manifest is made of, so a module built against another release is
/// rejected before it writes into the host's manifest.
pub const HEARTH_ABI_VERSION: u64 = abi_fingerprint(
    ABI_REVISION,
    env!("CARGO_PKG_VERSION"),
    [
        size_of::<HashMap<u64, String>>(),
        size_of::<BTreeMap<String, ()>>(),
        size_of::<Box<dyn Fn() + Send + Sync>>(),
    ],
);

/// `hearth_module_init` / `hearth_module_deinit`.
pub type ModuleHookFn = unsafe extern "C" fn();

/// `hearth_plugin_init`.
pub type InitFn = unsafe extern "C" fn() -> c_int;

/// Metadata getters. Returned strings are NUL-terminated and owned by the module.
pub type TextFn = unsafe extern "C" fn() -> *const c_char;

/// `hearth_plugin_main`.
pub type MainFn = unsafe extern "C" fn(argc: c_int, argv: *const *const c_char) -> c_int;

/// Per-capability manifest builder. Must return `false` without touching
/// `manifest` when `abi` is not [`HEARTH_ABI_VERSION`] or `id` is not the
/// capability it was compiled for.
pub type ManifestBuilderFn =
    unsafe extern "C" fn(abi: u64, id: CapabilityId, manifest: *mut c_void) -> bool;

/// Opaque, versioned identity of a base capability.
///
/// Together with [`HEARTH_ABI_VERSION`] this tells a builder which manifest
/// it has been handed.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CapabilityId {
    pub tag: u64,
    pub version: u32,
}

impl CapabilityId {
    #[must_use]
    pub const fn new(tag: u64, version: u32) -> Self {
        Self { tag, version }
    }
}

/// A base capability that modules can provide concrete classes for.
///
/// ```rust,ignore
/// pub trait Benchmark: Send { fn run(&mut self) -> f64; }
///
/// pub struct BenchmarkCapability;
///
/// impl Capability for BenchmarkCapability {
///     const ID: CapabilityId = CapabilityId::new(0x6265_6e63_6800_0001, 1);
///     const NAME: &'static str = "benchmark";
///     const BUILDER_SYMBOL: &'static str = "hearth_manifest_benchmark";
///     type Object = dyn Benchmark;
/// }
/// ```
pub trait Capability: 'static {
    const ID: CapabilityId;
    const NAME: &'static str;
    const BUILDER_SYMBOL: &'static str;
    type Object: ?Sized + Send + 'static;
}

/// Run a hook body returning a status code. A panic becomes [`HOOK_FAULT`].
///
/// ```rust,ignore
/// #[no_mangle]
/// pub extern "C" fn hearth_plugin_init() -> c_int {
///     guard_status("hearth_plugin_init", || if start_worker() { 0 } else { 1 })
/// }
/// ```
pub fn guard_status(hook: &'static str, body: impl FnOnce() -> c_int) -> c_int {
    guard_with_default(hook, HOOK_FAULT, body)
}

/// Run a hook body with no result, swallowing a panic.
pub fn guard_void(hook: &'static str, body: impl FnOnce()) {
    guard_with_default(hook, (), body);
}

/// Run a hook body, returning `default` if it panics.
pub fn guard_with_default<T>(hook: &'static str, default: T, body: impl FnOnce() -> T) -> T {
    match panic::catch_unwind(AssertUnwindSafe(body)) {
        Ok(value) => value,
        Err(payload) => {
            error!("Panic in {}: {}", hook, panic_message(payload.as_ref()));
            default
        }
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

const fn abi_fingerprint<const N: usize>(revision: u64, version: &str, sizes: [usize; N]) -> u64 {
    const PRIME: u64 = 0x0100_0000_01b3;

    let mut hash = 0xcbf2_9ce4_8422_2325 ^ revision;
    let bytes = version.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        hash = (hash ^ bytes[i] as u64).wrapping_mul(PRIME);
        i += 1;
    }
    let mut i = 0;
    while i < N {
        hash = (hash ^ sizes[i] as u64).wrapping_mul(PRIME);
        i += 1;
    }
    hash
}
