//! Error taxonomy for the plugin runtime.
//!
//! Single-item operations (opening one module, creating one instance) return
//! these directly. Batch operations log them per item and keep going.

use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// The OS loader rejected or could not find the module.
    #[error("failed to load module `{path}`: {reason}")]
    Load { path: PathBuf, reason: String },

    #[error("symbol `{symbol}` not found in `{path}`")]
    SymbolNotFound { path: PathBuf, symbol: String },

    #[error("module `{0}` is not loaded")]
    NotLoaded(PathBuf),

    #[error("class `{name}` is not registered for capability `{capability}`")]
    ClassNotFound {
        capability: &'static str,
        name: String,
    },

    #[error("invalid access to class `{name}`: {reason}")]
    InvalidAccess { name: String, reason: &'static str },

    #[error("factory for class `{0}` produced no instance")]
    NullInstance(String),

    #[error("class `{name}` cannot be registered: {reason}")]
    InvalidRegistration { name: String, reason: &'static str },

    #[error("plugin `{name}` requires host version `{required}`, host is `{host}`")]
    VersionIncompatible {
        name: String,
        required: String,
        host: String,
    },

    #[error("plugin `{0}` does not export an init hook")]
    MissingInitHook(String),

    #[error("plugin `{name}` failed to initialize: {reason}")]
    InitFailed { name: String, reason: String },

    #[error("plugin name `{name}` is provided by {count} plugins")]
    DuplicatePlugin { name: String, count: usize },

    #[error("no plugin provides `{0}`")]
    PluginNotFound(String),

    #[error("plugin `{0}` is not initialized")]
    PluginNotReady(String),

    /// A message could not reach the main instance.
    #[error("message route unavailable: {0}")]
    BrokenRoute(String),

    #[error("invalid message frame: {0}")]
    InvalidFrame(&'static str),

    /// The worker that owned a task went away before producing a result.
    #[error("task was dropped before it produced a result")]
    BrokenPromise,

    #[error("plugin registry is already in use on this thread")]
    Reentrant,

    #[error("io failed on `{path}`: {source}")]
    IoAt {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn load(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::Load {
            path: path.into(),
            reason: reason.into(),
        }
    }

    pub fn symbol_not_found(path: impl Into<PathBuf>, symbol: impl Into<String>) -> Self {
        Self::SymbolNotFound {
            path: path.into(),
            symbol: symbol.into(),
        }
    }

    pub fn invalid_access(name: impl Into<String>, reason: &'static str) -> Self {
        Self::InvalidAccess {
            name: name.into(),
            reason,
        }
    }

    pub fn io_at(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::IoAt {
            path: path.into(),
            source,
        }
    }

    /// Soft errors degrade functionality; callers log them and continue.
    #[must_use]
    pub fn is_soft(&self) -> bool {
        matches!(
            self,
            Self::SymbolNotFound { .. }
                | Self::VersionIncompatible { .. }
                | Self::DuplicatePlugin { .. }
                | Self::BrokenRoute(_)
        )
    }
}
