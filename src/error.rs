//! Error types for the endpoint restore core.

use std::io;
use thiserror::Error;

/// Result type alias for restore operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for endpoint restoration.
#[derive(Error, Debug)]
pub enum Error {
    /// The endpoint was deleted or is being torn down. Restore of this
    /// endpoint is abandoned; the caller treats this as a normal abort.
    #[error("endpoint is not alive")]
    NotAlive,

    /// No persisted state was found in an endpoint directory.
    #[error("endpoint state not found")]
    StateNotFound,

    /// The persisted snapshot could not be decoded.
    #[error("parse error: {0}")]
    Parse(#[from] ParseError),

    /// Identity allocation or global-identity sync failed.
    #[error("identity error: {0}")]
    Identity(String),

    /// The datapath build reported failure.
    #[error("regeneration failed: {0}")]
    Regeneration(String),

    /// Network interface lookup failed.
    #[error("get host interface {name}: {reason}")]
    Link { name: String, reason: String },

    /// Configuration errors.
    #[error("config error: {0}")]
    Config(String),

    /// I/O error.
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    /// Whether this error means the endpoint went away during restore.
    pub fn is_not_alive(&self) -> bool {
        matches!(self, Error::NotAlive)
    }
}

/// Snapshot decoding errors.
#[derive(Error, Debug)]
pub enum ParseError {
    /// JSON snapshot could not be deserialized.
    #[error("error deserializing endpoint snapshot: {0}")]
    Json(#[from] serde_json::Error),

    /// The legacy header line did not have the `<prefix>:<base64>` shape.
    #[error("invalid format {line:?}: should contain a single ':'")]
    InvalidLegacyLine { line: String },

    /// The legacy header payload was not valid base64.
    #[error("invalid base64 payload: {0}")]
    Base64(#[from] base64::DecodeError),
}
