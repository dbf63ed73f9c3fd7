//! Error types.

use thiserror::Error;

/// Errors raised while saving or restoring models.
///
/// Shape mismatches between batches, blocks and parameters are programmer
/// errors and panic instead.
#[derive(Error, Debug)]
pub enum Error {
    /// A plugged-in block has no serialized form.
    #[error("block type {0} cannot be serialized")]
    NotSerializable(&'static str),
    /// The persisted bytes could not be decoded.
    #[error("malformed model data: {0}")]
    Malformed(#[from] serde_json::Error),
    /// The persisted bytes decoded into an unusable model.
    #[error("invalid model: {0}")]
    Invalid(String),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
