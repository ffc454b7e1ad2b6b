//! Plugins compiled into the host binary.

use std::ffi::CStr;
use std::os::raw::{c_char, c_int};

use crate::abi::{guard_status, PLUGIN_MAIN_SYMBOL};
use crate::error::Result;
use crate::plugins::PluginFunctions;
use crate::runtime::Runtime;

unsafe extern "C" fn version_name() -> *const c_char {
    c"version".as_ptr()
}

unsafe extern "C" fn version_description() -> *const c_char {
    c"Print the host version".as_ptr()
}

unsafe extern "C" fn version_author() -> *const c_char {
    c"hearth".as_ptr()
}

unsafe extern "C" fn version_version() -> *const c_char {
    HOST_VERSION.as_ptr()
}

extern "C" fn version_init() -> c_int {
    0
}

extern "C" fn version_main(_argc: c_int, _argv: *const *const c_char) -> c_int {
    guard_status(PLUGIN_MAIN_SYMBOL, || {
        println!("hearth {}", HOST_VERSION.to_string_lossy());
        0
    })
}

const HOST_VERSION: &CStr = match CStr::from_bytes_with_nul(
    concat!(env!("CARGO_PKG_VERSION"), "\0").as_bytes(),
) {
    Ok(version) => version,
    Err(_) => c"unknown",
};

/// The `version` command.
#[must_use]
pub fn version_plugin() -> PluginFunctions {
    PluginFunctions {
        init: Some(version_init),
        name: Some(version_name),
        author: Some(version_author),
        description: Some(version_description),
        version: Some(version_version),
        main_entry: Some(version_main),
        ..PluginFunctions::default()
    }
}

/// Register every built-in plugin with `runtime`.
///
/// # Errors
/// [`crate::Error::Reentrant`].
pub fn register_all(runtime: &Runtime) -> Result<()> {
    runtime.register_builtin(version_plugin())?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugins::{Plugin, PluginKind};

    #[test]
    fn test_version_plugin_metadata() {
        let runtime = {
            let mut config = crate::config::Config::default();
            config.plugins.include_default_paths = false;
            Runtime::with_opener(config, std::sync::Arc::new(crate::loader::StaticOpener::new()))
                .unwrap()
        };
        register_all(&runtime).unwrap();
        runtime.load_plugins().unwrap();

        let kinds = runtime
            .with_registry(|registry| {
                let plugin = registry.find("version").map(Plugin::info).unwrap();
                assert_eq!(plugin.version, env!("CARGO_PKG_VERSION"));
                registry.list().map(Plugin::kind).collect::<Vec<_>>()
            })
            .unwrap();
        assert_eq!(kinds, vec![PluginKind::Manual]);

        let code = runtime.run(vec!["version".to_string()]).unwrap().wait().unwrap();
        assert_eq!(code, 0);
    }
}
