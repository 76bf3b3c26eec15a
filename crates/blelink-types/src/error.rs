//! Error types for blelink-types.

use thiserror::Error;

/// Errors raised when constructing session types from untrusted input.
///
/// This error type is platform-agnostic and does not include
/// BLE-specific errors (those belong in blelink-core).
#[derive(Debug, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum TypesError {
    /// A peripheral identifier was empty or whitespace.
    #[error("Peripheral identifier must not be empty")]
    EmptyIdentifier,
}

/// Result type alias using blelink-types' error type.
pub type TypesResult<T> = std::result::Result<T, TypesError>;
