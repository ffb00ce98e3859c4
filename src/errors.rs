//! Centralised error type for the importer.
//!
//! Mirrors the taxonomy in the design notes: most error paths are
//! drop-and-log or warn-and-continue at the call site and never reach here;
//! this type exists for the handful of errors that do propagate (config
//! loading, socket bind, fatal startup failures).

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ImporterError {
    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("failed to bind required socket {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("document store error: {0}")]
    Storage(#[from] mongodb::error::Error),

    #[error("unknown control command: {0}")]
    UnknownCommand(String),
}
