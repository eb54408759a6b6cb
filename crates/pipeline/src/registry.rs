//! Plugin factory registry.
//!
//! Factories live in three namespaces (a name like `file` can back both
//! an input and an output). Built-ins are registered at construction;
//! the dynamic loader extends the registry from shared libraries.

use crate::error::{PipelineError, PipelineResult};
use crate::plugin::{InputPlugin, OutputPlugin, PluginContext, ProcessorPlugin};
use std::collections::HashMap;

/// Creates input plugin instances from raw command-line arguments.
pub trait InputFactory: Send + Sync {
    fn create(&self, args: &[String], ctx: PluginContext) -> PipelineResult<Box<dyn InputPlugin>>;
}

pub trait ProcessorFactory: Send + Sync {
    fn create(
        &self,
        args: &[String],
        ctx: PluginContext,
    ) -> PipelineResult<Box<dyn ProcessorPlugin>>;
}

pub trait OutputFactory: Send + Sync {
    fn create(&self, args: &[String], ctx: PluginContext) -> PipelineResult<Box<dyn OutputPlugin>>;
}

impl<F> InputFactory for F
where
    F: Fn(&[String], PluginContext) -> PipelineResult<Box<dyn InputPlugin>> + Send + Sync,
{
    fn create(&self, args: &[String], ctx: PluginContext) -> PipelineResult<Box<dyn InputPlugin>> {
        self(args, ctx)
    }
}

impl<F> ProcessorFactory for F
where
    F: Fn(&[String], PluginContext) -> PipelineResult<Box<dyn ProcessorPlugin>> + Send + Sync,
{
    fn create(
        &self,
        args: &[String],
        ctx: PluginContext,
    ) -> PipelineResult<Box<dyn ProcessorPlugin>> {
        self(args, ctx)
    }
}

impl<F> OutputFactory for F
where
    F: Fn(&[String], PluginContext) -> PipelineResult<Box<dyn OutputPlugin>> + Send + Sync,
{
    fn create(&self, args: &[String], ctx: PluginContext) -> PipelineResult<Box<dyn OutputPlugin>> {
        self(args, ctx)
    }
}

/// Name-keyed plugin factories plus the shared libraries backing the
/// dynamically loaded ones.
#[derive(Default)]
pub struct PluginRegistry {
    inputs: HashMap<String, Box<dyn InputFactory>>,
    processors: HashMap<String, Box<dyn ProcessorFactory>>,
    outputs: HashMap<String, Box<dyn OutputFactory>>,
    // Keep loaded libraries alive for as long as their factories are.
    // Field order matters: maps drop before the libraries do.
    libraries: Vec<libloading::Library>,
}

impl PluginRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry pre-populated with the built-in plugins.
    pub fn with_builtins() -> Self {
        let mut reg = Self::new();
        crate::plugins::register_builtins(&mut reg);
        reg
    }

    pub fn register_input(&mut self, name: &str, factory: impl InputFactory + 'static) {
        self.register_input_boxed(name, Box::new(factory));
    }

    pub fn register_processor(&mut self, name: &str, factory: impl ProcessorFactory + 'static) {
        self.register_processor_boxed(name, Box::new(factory));
    }

    pub fn register_output(&mut self, name: &str, factory: impl OutputFactory + 'static) {
        self.register_output_boxed(name, Box::new(factory));
    }

    pub fn register_input_boxed(&mut self, name: &str, factory: Box<dyn InputFactory>) {
        self.inputs.insert(name.to_string(), factory);
    }

    pub fn register_processor_boxed(&mut self, name: &str, factory: Box<dyn ProcessorFactory>) {
        self.processors.insert(name.to_string(), factory);
    }

    pub fn register_output_boxed(&mut self, name: &str, factory: Box<dyn OutputFactory>) {
        self.outputs.insert(name.to_string(), factory);
    }

    pub fn has_input(&self, name: &str) -> bool {
        self.inputs.contains_key(name)
    }

    pub fn has_processor(&self, name: &str) -> bool {
        self.processors.contains_key(name)
    }

    pub fn has_output(&self, name: &str) -> bool {
        self.outputs.contains_key(name)
    }

    /// Registered names per namespace, sorted, for diagnostics.
    pub fn names(&self) -> (Vec<&str>, Vec<&str>, Vec<&str>) {
        let mut i: Vec<&str> = self.inputs.keys().map(String::as_str).collect();
        let mut p: Vec<&str> = self.processors.keys().map(String::as_str).collect();
        let mut o: Vec<&str> = self.outputs.keys().map(String::as_str).collect();
        i.sort_unstable();
        p.sort_unstable();
        o.sort_unstable();
        (i, p, o)
    }

    pub(crate) fn adopt_library(&mut self, lib: libloading::Library) {
        self.libraries.push(lib);
    }

    pub fn create_input(
        &self,
        name: &str,
        args: &[String],
        ctx: PluginContext,
    ) -> PipelineResult<Box<dyn InputPlugin>> {
        self.inputs
            .get(name)
            .ok_or_else(|| PipelineError::UnknownPlugin {
                kind: "input",
                name: name.to_string(),
            })?
            .create(args, ctx)
    }

    pub fn create_processor(
        &self,
        name: &str,
        args: &[String],
        ctx: PluginContext,
    ) -> PipelineResult<Box<dyn ProcessorPlugin>> {
        self.processors
            .get(name)
            .ok_or_else(|| PipelineError::UnknownPlugin {
                kind: "processor",
                name: name.to_string(),
            })?
            .create(args, ctx)
    }

    pub fn create_output(
        &self,
        name: &str,
        args: &[String],
        ctx: PluginContext,
    ) -> PipelineResult<Box<dyn OutputPlugin>> {
        self.outputs
            .get(name)
            .ok_or_else(|| PipelineError::UnknownPlugin {
                kind: "output",
                name: name.to_string(),
            })?
            .create(args, ctx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtins_are_present() {
        let reg = PluginRegistry::with_builtins();
        assert!(reg.has_input("file"));
        assert!(reg.has_output("file"));
        assert!(reg.has_processor("filter"));
        assert!(reg.has_processor("drop-nulls"));
        assert!(!reg.has_processor("no-such-plugin"));
    }

    #[test]
    fn unknown_plugin_is_an_error() {
        let reg = PluginRegistry::new();
        let (i, p, o) = reg.names();
        assert!(i.is_empty() && p.is_empty() && o.is_empty());
        assert!(!reg.has_input("file"));
    }
}
