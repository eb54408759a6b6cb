//! Error types for the processing core

use thiserror::Error;

/// Errors surfaced by the core itself.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("buffer allocation failed: {0}")]
    Allocation(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("unknown {kind} plugin: {name}")]
    UnknownPlugin { kind: &'static str, name: String },

    #[error("cannot load plugin '{name}': {message}")]
    PluginLoad { name: String, message: String },

    #[error("stage {stage} ({name}) failed to start: {message}")]
    PluginStart {
        stage: usize,
        name: String,
        message: String,
    },

    #[error("control channel error: {0}")]
    Control(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for core operations.
pub type PipelineResult<T> = Result<T, PipelineError>;

/// Errors returned by plugin entry points.
#[derive(Error, Debug)]
pub enum PluginError {
    #[error("invalid options: {0}")]
    Options(String),

    #[error("{0}")]
    Message(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Result type for plugin entry points.
pub type PluginResult<T> = Result<T, PluginError>;
