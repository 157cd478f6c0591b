//! Error types for the Tollgate service.

use thiserror::Error;

/// Main error type for Tollgate service operations.
///
/// Admission-check failures have their own taxonomy in
/// [`CheckError`](crate::ratelimit::CheckError); this type covers startup and
/// transport concerns.
#[derive(Error, Debug)]
pub enum TollgateError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Project or rule store errors
    #[error("Store error: {0}")]
    Store(#[from] crate::store::StoreError),

    /// gRPC server errors
    #[error("gRPC error: {0}")]
    Grpc(#[from] tonic::transport::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<config::ConfigError> for TollgateError {
    fn from(err: config::ConfigError) -> Self {
        TollgateError::Config(err.to_string())
    }
}

/// Result type alias for Tollgate operations.
pub type Result<T> = std::result::Result<T, TollgateError>;
