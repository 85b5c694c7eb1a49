//! Network parameters for the colored-coin wallet core.
//!
//! This crate provides the one configuration surface the wallet core takes:
//! which chain it is operating against (coin type, address version bytes).
//! There is no parsed config file — callers build a `Network` with one of the
//! const constructors and pass it to `Create`/`Open`.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod network;

pub use network::{Network, NetworkType};

/// Error types for parameter operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Invalid network specified.
    #[error("invalid network: {0}")]
    InvalidNetwork(String),
}

/// Result type for parameter operations.
pub type Result<T> = std::result::Result<T, Error>;
