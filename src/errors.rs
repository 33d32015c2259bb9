// src/errors.rs

//! Crate-wide error types.

use thiserror::Error;

/// Failures while turning a record stream into events.
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("malformed record on line {line}: {source}")]
    Malformed {
        line: usize,
        #[source]
        source: serde_json::Error,
    },

    #[error("unknown record type '{kind}' on line {line}")]
    UnknownType { line: usize, kind: String },

    #[error("case level {level} is deeper than the current case stack ({depth}) on line {line}")]
    CaseTooDeep {
        line: usize,
        level: i64,
        depth: usize,
    },

    #[error("dependency index {index} is outside the loaded file pool ({pool}) on line {line}")]
    UnknownDependency {
        line: usize,
        index: usize,
        pool: usize,
    },

    #[error("dependency note has {files} files but {digests} digests on line {line}")]
    DigestMismatch {
        line: usize,
        files: usize,
        digests: usize,
    },
}

#[derive(Error, Debug)]
pub enum QaError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("TOML parsing error: {0}")]
    TomlError(#[from] toml::de::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Coordination server is not running")]
    ServerNotRunning,

    #[error("Server closed: {0}")]
    ServerClosed(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Failed to spawn worker '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Watch error: {0}")]
    Watch(String),

    #[error("Notify error: {0}")]
    Notify(#[from] notify::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub use anyhow::Error;
pub type Result<T> = std::result::Result<T, QaError>;
