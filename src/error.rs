use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Errors detected while loading or validating the configuration.
/// Every one of them aborts the run before anything is touched on the target.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("source directory does not exist: {0}")]
    MissingSource(PathBuf),

    #[error("target directory does not exist: {0}")]
    MissingTarget(PathBuf),

    #[error("failed to read config {path}: {source}")]
    Load {
        path: PathBuf,
        #[source]
        source: config::ConfigError,
    },

    #[error("failed to write config {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("rule for suffix '{suffix}': {message}")]
    InvalidRule { suffix: String, message: String },

    #[error("more than one rule for suffix '{0}'")]
    DuplicateRule(String),

    #[error("conversion from '{from}' to '{to}' is not supported")]
    UnsupportedConversion { from: String, to: String },

    #[error("invalid conversion for '{suffix}': {source}")]
    Conversion {
        suffix: String,
        #[source]
        source: ConversionError,
    },

    #[error("invalid exclusion pattern '{pattern}': {source}")]
    Pattern {
        pattern: String,
        #[source]
        source: glob::PatternError,
    },
}

/// Errors produced by a single conversion. They are recorded against the
/// item and never stop the run.
#[derive(Debug, Error)]
pub enum ConversionError {
    #[error("invalid parameter '{value}' for {format}: {message}")]
    InvalidParams {
        format: &'static str,
        value: String,
        message: String,
    },

    #[error("failed to start encoder '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("encoder exited with {status}, see {}", log.display())]
    Encoder { status: String, log: PathBuf },

    #[error("{path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Run-level failures. Anything reaching this type ends the run.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },

    #[error("worker pool is stopped")]
    Stopped,
}

impl SyncError {
    pub fn io(context: impl Into<String>, source: io::Error) -> Self {
        SyncError::Io {
            context: context.into(),
            source,
        }
    }
}

pub type Result<T, E = SyncError> = std::result::Result<T, E>;
