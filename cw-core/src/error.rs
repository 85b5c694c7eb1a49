//! The closed error taxonomy for the address manager and color ledger.
//!
//! Every fallible operation in this crate returns an [`Error`] drawn from this
//! fixed set of kinds. Nothing here unwinds: a failure is always a value.

use std::fmt;

/// A boxed, type-erased cause, used for kinds whose underlying failure is not
/// itself part of the taxonomy (store-engine errors, I/O).
pub type Cause = Box<dyn std::error::Error + Send + Sync + 'static>;

/// The closed set of failure kinds.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A value could not be encoded or decoded to/from its on-disk layout.
    #[error("serialization: {0}")]
    Serialization(String),

    /// The underlying store failed on a read.
    #[error("read db: {0}")]
    ReadDb(String),

    /// The underlying store failed on a write.
    #[error("write db: {0}")]
    WriteDb(String),

    /// A required bucket/namespace could not be created.
    #[error("create bucket: {0}")]
    CreateBucket(String),

    /// An HD extended-key operation failed (parse, derive, neuter).
    #[error("hd key: {0}")]
    HdKey(String),

    /// A key-chain derivation failed in a context where skip-on-invalid does
    /// not apply (e.g. series deposit-script derivation).
    #[error("key chain: {0}")]
    KeyChain(String),

    /// A cryptographic primitive failed (AEAD encrypt/decrypt, KDF).
    #[error("crypto: {0}")]
    Crypto(String),

    /// Passphrase derivation did not reproduce the stored key. Carries no
    /// cause, so it cannot be distinguished from a generic AEAD failure.
    #[error("wrong passphrase")]
    WrongPassphrase,

    /// A key or address belongs to a different network than the manager's.
    #[error("wrong network")]
    WrongNet,

    /// The manager is locked and the operation requires private material.
    #[error("manager is locked")]
    Locked,

    /// The manager is watching-only and the operation requires private
    /// material.
    #[error("manager is watching-only")]
    WatchingOnly,

    /// An account number does not name a known account.
    #[error("invalid account: {0}")]
    InvalidAccount(u32),

    /// A key was of the wrong type (private where public expected, etc).
    #[error("invalid key type: {0}")]
    InvalidKeyType(String),

    /// An account number exceeds the configured maximum.
    #[error("account number too high: {0}")]
    AccountNumTooHigh(u32),

    /// Generating more addresses would exceed the per-account cap.
    #[error("too many addresses requested")]
    TooManyAddresses,

    /// No address row exists for the given script.
    #[error("address not found")]
    AddressNotFound,

    /// No account row exists (distinct from `InvalidAccount`: used where the
    /// caller never supplied a well-formed account number at all).
    #[error("account not found")]
    AccountNotFound,

    /// An entity already exists where uniqueness is required.
    #[error("duplicate: {0}")]
    Duplicate(String),

    /// A colored-outpoint reverse-index lookup found an existing record when
    /// the caller expected to allocate a fresh one.
    #[error("outpoint already exists")]
    OutPointExists,

    /// The block-explorer collaborator returned an error.
    #[error("block explorer: {0}")]
    BlockExplorer(String),

    /// A color-ledger operation failed for a reason not covered by a more
    /// specific kind.
    #[error("color: {0}")]
    Color(String),

    /// Spend selection could not satisfy the requested amount.
    #[error("spend: {0}")]
    Spend(String),

    /// A script could not be built, parsed, or looked up.
    #[error("script: {0}")]
    Script(String),

    /// A hash computation received input of the wrong size.
    #[error("sha256 hash: {0}")]
    ShaHash(String),

    /// A series row could not be read or written.
    #[error("series storage: {0}")]
    SeriesStorage(String),

    /// A series row carries an unsupported version.
    #[error("series version: {0}")]
    SeriesVersion(u32),

    /// The referenced series does not exist.
    #[error("series does not exist")]
    SeriesNotExists,

    /// A series with this id already exists.
    #[error("series already exists")]
    SeriesAlreadyExists,

    /// The series already has a stored private key and cannot be replaced.
    #[error("series already empowered")]
    SeriesAlreadyEmpowered,

    /// `EmpowerSeries` was given a public key where a private key was
    /// required.
    #[error("key is public, expected private")]
    KeyIsPublic,

    /// `CreateSeries`/`ReplaceSeries` was given a private key where a public
    /// key was required.
    #[error("key is private, expected public")]
    KeyIsPrivate,

    /// Neutering an extended private key to its public half failed.
    #[error("key neuter: {0}")]
    KeyNeuter(String),

    /// A derived key did not match the expected key.
    #[error("key mismatch: {0}")]
    KeyMismatch(String),

    /// The neutered form of an empowering private key matched none of the
    /// series' stored public keys.
    #[error("private key does not match any series public key")]
    KeysPrivatePublicMismatch,

    /// The same public key was supplied more than once to a series.
    #[error("duplicate key in series")]
    KeyDuplicate,

    /// Fewer public keys were supplied than the minimum series size.
    #[error("too few public keys")]
    TooFewPublicKeys,

    /// The requested signature threshold exceeds the number of public keys.
    #[error("too many required signatures")]
    TooManyReqSignatures,

    /// The voting pool already exists.
    #[error("voting pool already exists")]
    VotingPoolAlreadyExists,

    /// The voting pool does not exist.
    #[error("voting pool does not exist")]
    VotingPoolNotExists,

    /// A multisig deposit script could not be constructed.
    #[error("script creation: {0}")]
    ScriptCreation(String),

    /// An invalid branch number was given to a series operation.
    #[error("invalid branch: {0}")]
    InvalidBranch(u32),

    /// A numeric argument (value, fee, index) is out of range.
    #[error("invalid value: {0}")]
    InvalidValue(String),

    /// The configured coin type is too high to encode as a hardened child.
    #[error("coin type too high: {0}")]
    CoinTypeTooHigh(u32),

    /// `Create` was asked to create a store that already exists on disk.
    #[error("already exists")]
    AlreadyExists,

    /// `Open` was asked to open a store that does not exist on disk.
    #[error("no such store")]
    NoExist,

    /// An error from the underlying key-value store engine.
    #[error("database: {0}")]
    Database(String),

    /// Requested functionality that is deliberately unimplemented.
    #[error("not implemented: {0}")]
    Unimplemented(&'static str),
}

impl Error {
    /// True for the single local-recovery case: an invalid-child derivation
    /// inside sequential address generation, which is absorbed by skipping
    /// to the next index rather than surfaced.
    pub fn is_invalid_child(&self) -> bool {
        matches!(self, Error::HdKey(msg) if msg.contains("invalid child"))
    }

    /// Wrap a store-engine error as a `Database` kind, the contract every KV
    /// failure is tagged with.
    pub fn database(cause: impl fmt::Display) -> Self {
        Error::Database(cause.to_string())
    }
}

/// Result type used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[test]
    fn test_wrong_passphrase_has_no_cause() {
        let err = Error::WrongPassphrase;
        assert!(err.source().is_none());
    }

    #[test]
    fn test_invalid_child_detection() {
        let err = Error::HdKey("invalid child at index 3".to_string());
        assert!(err.is_invalid_child());
        let other = Error::HdKey("malformed extended key".to_string());
        assert!(!other.is_invalid_child());
    }

    #[test]
    fn test_database_helper_wraps_display() {
        let err = Error::database("disk full");
        match err {
            Error::Database(msg) => assert_eq!(msg, "disk full"),
            _ => panic!("expected Database variant"),
        }
    }
}
