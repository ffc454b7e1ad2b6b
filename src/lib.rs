//! Hearth - a single-instance plugin host
//!
//! This library discovers dynamically loaded modules, checks them against the
//! host version, builds per-capability class manifests from them and routes
//! command lines to the plugin that handles them. Only one process per user
//! session owns the plugins; later invocations forward their command line to
//! it over a named pipe.
//!
//! # Modules
//!
//! - [`loader`]: Opening modules, symbol lookup and the ref-counted module table
//! - [`abi`]: Well-known symbol names, hook signatures and capability tokens
//! - [`manifest`]: Named factories per (module, capability) and `ClassLoader`
//! - [`plugins`]: Plugin metadata, lifecycle and the plugin registry
//! - [`runtime`]: The context object owning registry, modules and workers
//! - [`pool`]: Fixed-size worker pool with one-shot task results
//! - [`events`]: Runtime lifecycle notifications
//! - [`instance`]: Single-instance election and command forwarding (unix)
//! - [`builtins`]: Plugins compiled into the host
//! - [`config`]: Configuration management and serialization

pub mod abi;
pub mod builtins;
pub mod config;
pub mod error;
pub mod events;
#[cfg(unix)]
pub mod instance;
pub mod loader;
pub mod manifest;
pub mod plugins;
pub mod pool;
pub mod runtime;

pub use error::{Error, Result};
pub use runtime::Runtime;
