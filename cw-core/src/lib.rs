//! HD colored-coin wallet core
//!
//! This crate implements the persisted cryptographic and accounting state
//! machine behind an HD address manager and its colored-coin overlay: key
//! hierarchy and lock lifecycle, chained/imported/script address derivation
//! and caching, the colored-outpoint ledger, multisig voting-pool series,
//! and the issue/send wallet workflows built on top of them.
//!
//! This crate is generic over its persistence engine (the [`store::WalletStore`]
//! trait) and its chain-observation/color-scheme collaborators
//! ([`workflow::BlockExplorer`], [`color::ColorDefinition`], [`color::Kernel`]);
//! it depends on no concrete storage or network implementation.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod color;
pub mod crypto;
pub mod error;
pub mod keys;
pub mod manager;
pub mod rows;
pub mod store;
pub mod votingpool;
pub mod workflow;

pub use color::{ColorDefinition, Kernel, OutPoint};
pub use crypto::{CryptoKey, MasterKey, MasterKeyParams, ScryptCost};
pub use error::{Error, Result};
pub use keys::ExtendedKey;
pub use manager::{AddressManager, ManagedAddressInfo, ManagedAddressVariant};
pub use rows::{AccountRow, AddressRow, ColorOutPointRecord, SeriesRow};
pub use store::{ReadTxn, WalletStore, WriteTxn};
pub use votingpool::VotingPool;
pub use workflow::BlockExplorer;
