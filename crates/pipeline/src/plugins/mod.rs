//! Built-in plugins.
//!
//! The chain defaults (`file` on both ends) and a couple of
//! general-purpose processors ship with the core; everything else comes
//! from shared libraries.

mod file;
mod filter;
mod nulls;

pub use file::{FileInput, FileOutput};
pub use filter::PidFilter;
pub use nulls::DropNulls;

use crate::registry::PluginRegistry;

/// Registers every built-in plugin.
pub fn register_builtins(registry: &mut PluginRegistry) {
    registry.register_input("file", file::file_input);
    registry.register_output("file", file::file_output);
    registry.register_processor("filter", filter::pid_filter);
    registry.register_processor("drop-nulls", nulls::drop_nulls);
}
