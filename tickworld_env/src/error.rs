//! Error types for the tickworld environment vocabulary.

use thiserror::Error;

/// Errors raised while interpreting environment values.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EnvError {
    /// Text could not be read as a comma separated NetId
    #[error("Invalid net id: {0:?}")]
    InvalidNetId(String),

    /// Text could not be read as a `[net]:port` address
    #[error("Invalid address: {0:?}")]
    InvalidAddress(String),
}

impl EnvError {
    /// Creates a NetId parse error.
    pub fn invalid_net_id(text: impl Into<String>) -> Self {
        Self::InvalidNetId(text.into())
    }

    /// Creates an address parse error.
    pub fn invalid_address(text: impl Into<String>) -> Self {
        Self::InvalidAddress(text.into())
    }
}
