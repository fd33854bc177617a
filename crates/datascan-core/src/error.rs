//! Error taxonomy for metadata recovery
//!
//! Absence of an object or dentry is never represented here: readers return
//! `Ok(None)` / `Ok(false)` for that. Everything in this module is a real
//! failure that aborts the current injection.

use thiserror::Error;

/// Failures raised by an object pool backend
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Object not found: {0}")]
    NoSuchObject(String),

    #[error("Pool not found: {0}")]
    NoSuchPool(i64),

    #[error("Backend failure: {0}")]
    Backend(String),
}

/// Failures while decoding an on-disk metadata record
#[derive(Error, Debug, PartialEq, Eq)]
pub enum DecodeError {
    #[error("Truncated record: needed {needed} bytes, {available} available")]
    Truncated { needed: usize, available: usize },

    #[error("Incompatible encoding: record requires v{compat}, decoder understands v{supported}")]
    IncompatibleVersion { compat: u8, supported: u8 },

    #[error("Invalid UTF-8 in encoded string")]
    InvalidUtf8,

    #[error("Malformed record: {0}")]
    Malformed(String),
}

impl From<std::io::Error> for DecodeError {
    fn from(error: std::io::Error) -> Self {
        // Cursor reads only fail by running out of bytes
        DecodeError::Malformed(error.to_string())
    }
}

/// Top-level error returned by drivers and the scan orchestrator
#[derive(Error, Debug)]
pub enum ScanError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Driver used before init: {0}")]
    NotInitialized(&'static str),

    #[error("Metadata roots are missing; run `datascan init` on a single worker before scanning")]
    RootsMissing,

    #[error("Configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, ScanError>;
