//! Plugin discovery and lifecycle.
//!
//! A [`Plugin`] wraps one module, or a host-supplied table of functions, and
//! exposes its metadata and main entry. The [`PluginRegistry`] discovers
//! plugins in search paths, initializes them against the host version and
//! resolves commands to the plugin that handles them.

mod plugin;
mod registry;

pub use plugin::{
    is_compatible, EntryPoint, Plugin, PluginFunctions, PluginInfo, PluginKind, PluginSource,
    PluginState,
};
pub use registry::{InitReport, PluginRegistry, ScanReport, PLUGIN_EXTENSION};
