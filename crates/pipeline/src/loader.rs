//! Dynamic plugin loading.
//!
//! A plugin shared library exports one registration symbol,
//! `tsplugin_register`, which receives a registrar and installs the
//! library's factories. Loaded libraries are adopted by the registry so
//! factory code outlives every instance created from it.

use crate::error::{PipelineError, PipelineResult};
use crate::registry::{InputFactory, OutputFactory, PluginRegistry, ProcessorFactory};
use libloading::Library;
use std::env;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Environment variable listing extra plugin directories, using the
/// platform path separator.
pub const PLUGIN_PATH_VAR: &str = "TSPLUGINS_PATH";

/// Symbol every plugin library must export.
pub const REGISTER_SYMBOL: &[u8] = b"tsplugin_register";

/// Registration interface handed to a plugin library.
pub trait PluginRegistrar {
    fn register_input(&mut self, name: &str, factory: Box<dyn InputFactory>);
    fn register_processor(&mut self, name: &str, factory: Box<dyn ProcessorFactory>);
    fn register_output(&mut self, name: &str, factory: Box<dyn OutputFactory>);
}

impl PluginRegistrar for PluginRegistry {
    fn register_input(&mut self, name: &str, factory: Box<dyn InputFactory>) {
        self.register_input_boxed(name, factory);
    }

    fn register_processor(&mut self, name: &str, factory: Box<dyn ProcessorFactory>) {
        self.register_processor_boxed(name, factory);
    }

    fn register_output(&mut self, name: &str, factory: Box<dyn OutputFactory>) {
        self.register_output_boxed(name, factory);
    }
}

/// Signature of the registration symbol.
pub type RegisterFn = unsafe extern "C" fn(&mut dyn PluginRegistrar);

/// Loads the library providing plugin `name` and registers its
/// factories. Resolution order: explicit path when the name contains a
/// separator; otherwise each directory of `TSPLUGINS_PATH`, then the
/// directory holding the running executable, trying
/// `tsplugin_<name><DLL_SUFFIX>`, `<name><DLL_SUFFIX>` and `<name>`;
/// finally the dynamic loader's own default search.
pub fn load_plugin(name: &str, registry: &mut PluginRegistry) -> PipelineResult<()> {
    let mut last_err = String::new();
    for candidate in candidates(name) {
        match try_load(&candidate, registry) {
            Ok(()) => {
                debug!("loaded plugin '{name}' from {}", candidate.display());
                return Ok(());
            }
            Err(e) => last_err = e,
        }
    }
    Err(PipelineError::PluginLoad {
        name: name.to_string(),
        message: last_err,
    })
}

fn candidates(name: &str) -> Vec<PathBuf> {
    if name.contains(std::path::MAIN_SEPARATOR) || name.contains('/') {
        return vec![PathBuf::from(name)];
    }

    let decorated = format!("tsplugin_{name}{}", env::consts::DLL_SUFFIX);
    let suffixed = format!("{name}{}", env::consts::DLL_SUFFIX);

    let mut dirs: Vec<PathBuf> = env::var_os(PLUGIN_PATH_VAR)
        .map(|v| env::split_paths(&v).collect())
        .unwrap_or_default();
    if let Some(exe_dir) = env::current_exe()
        .ok()
        .and_then(|p| p.parent().map(Path::to_path_buf))
    {
        dirs.push(exe_dir);
    }

    let mut out = Vec::new();
    for dir in &dirs {
        out.push(dir.join(&decorated));
        out.push(dir.join(&suffixed));
        out.push(dir.join(name));
    }
    // Fall back to the host loader's default search path.
    out.push(PathBuf::from(&decorated));
    out.push(PathBuf::from(&suffixed));
    out
}

fn try_load(path: &Path, registry: &mut PluginRegistry) -> Result<(), String> {
    // Loading and symbol resolution run foreign initialization code;
    // the registration symbol's signature is part of the plugin ABI.
    unsafe {
        let lib = Library::new(path).map_err(|e| e.to_string())?;
        let register = lib
            .get::<RegisterFn>(REGISTER_SYMBOL)
            .map_err(|e| e.to_string())?;
        register(registry);
        drop(register);
        registry.adopt_library(lib);
    }
    Ok(())
}
