//! The persistence-layer contract: a thin typed view over a bucketed,
//! transactional key-value store. `cw-core` only depends on these traits; a
//! concrete engine (e.g. `cw-store`'s `sled` backend) implements them.

use std::path::Path;

use crate::error::Result;
use crate::rows::{AccountRow, ColorOutPointRecord, SeriesRow};

/// Read-only operations available inside a `view` transaction, and the
/// read-only subset available inside an `update` transaction.
pub trait ReadTxn {
    /// `(encrypted pub params, encrypted priv params)`; either may be
    /// absent (the latter absent means watching-only).
    fn fetch_master_key_params(&self) -> Result<(Option<Vec<u8>>, Option<Vec<u8>>)>;

    /// `(encrypted pub key, encrypted priv key, encrypted script key)`; pub
    /// is always present once the store is initialized.
    fn fetch_crypto_keys(&self) -> Result<(Vec<u8>, Option<Vec<u8>>, Option<Vec<u8>>)>;

    /// `(encrypted pub coin-type key, encrypted priv coin-type key)`: the
    /// `m/44'/coin_type'` extended key new accounts are derived from. Pub is
    /// always present once the store is initialized; priv absent means
    /// watching-only.
    fn fetch_cointype_keys(&self) -> Result<(Vec<u8>, Option<Vec<u8>>)>;

    /// The watching-only flag.
    fn fetch_watching_only(&self) -> Result<bool>;

    /// The row for `account`. Fails `InvalidAccount` if absent.
    fn fetch_account_info(&self, account: u32) -> Result<AccountRow>;

    /// The number of accounts currently provisioned.
    fn fetch_num_accounts(&self) -> Result<u32>;

    /// The address row keyed by the SHA-256 of its script identifier. Fails
    /// `AddressNotFound` if absent.
    fn fetch_address(&self, script_hash: &[u8; 32]) -> Result<crate::rows::AddressRow>;

    /// Whether an address row exists for this script identifier.
    fn exists_address(&self, script_hash: &[u8; 32]) -> Result<bool>;

    /// Whether a voting pool namespace has been created.
    fn exists_voting_pool(&self, pool_id: &[u8]) -> Result<bool>;

    /// Whether a series exists under a pool.
    fn exists_series(&self, pool_id: &[u8], series_id: u32) -> Result<bool>;

    /// All series rows under a pool, as `(series_id, row)` pairs.
    fn load_all_series(&self, pool_id: &[u8]) -> Result<Vec<(u32, SeriesRow)>>;

    /// The color id registered for a color-definition hash string, if any.
    fn fetch_color_definition(&self, hash_string: &str) -> Result<Option<u32>>;

    /// The current color-id serial counter (1 if never advanced).
    fn fetch_color_counter(&self) -> Result<u32>;

    /// The current outpoint-id serial counter (1 if never advanced).
    fn fetch_outpoint_counter(&self) -> Result<u32>;

    /// The colored outpoint record with this id.
    fn fetch_color_outpoint(&self, id: u32) -> Result<ColorOutPointRecord>;

    /// Every colored outpoint record, in ascending id order. Any gap in
    /// `1..counter` is a consistency error.
    fn all_color_outpoints(&self) -> Result<Vec<ColorOutPointRecord>>;

    /// The outpoint id for `(tx_hash, output_index)`, or `0` (the sentinel
    /// "none") if absent.
    fn fetch_outpoint_id(&self, tx_hash: &[u8; 32], output_index: u32) -> Result<u32>;

    /// `(account, index)` for a pay-to-address script. Fails `Script` if
    /// absent.
    fn lookup_script(&self, script: &[u8]) -> Result<(u32, u32)>;
}

/// Mutating operations, available only inside an `update` transaction.
/// Every method here participates in the single enclosing KV transaction:
/// either all writes in one `update` closure commit, or none do.
pub trait WriteTxn: ReadTxn {
    /// Write master-key parameters. Either may be `None` (private absent
    /// means watching-only).
    fn put_master_key_params(&mut self, pub_params: Option<&[u8]>, priv_params: Option<&[u8]>) -> Result<()>;

    /// Write encrypted crypto keys. `pub_key` is required.
    fn put_crypto_keys(
        &mut self,
        pub_key: &[u8],
        priv_key: Option<&[u8]>,
        script_key: Option<&[u8]>,
    ) -> Result<()>;

    /// Write the watching-only flag.
    fn put_watching_only(&mut self, watching_only: bool) -> Result<()>;

    /// Write the encrypted coin-type extended keys new accounts derive from.
    fn put_cointype_keys(&mut self, pub_key: &[u8], priv_key: Option<&[u8]>) -> Result<()>;

    /// Write an account row.
    fn put_account_info(&mut self, account: u32, row: &AccountRow) -> Result<()>;

    /// Write the number of provisioned accounts.
    fn put_num_accounts(&mut self, n: u32) -> Result<()>;

    /// Write a chained-address row under `sha256(script)`.
    fn put_chained_address(
        &mut self,
        script: &[u8],
        account: u32,
        add_time: u64,
        sync: crate::rows::SyncStatus,
        branch: u32,
        index: u32,
    ) -> Result<()>;

    /// Write an imported-address row under `sha256(script)`.
    fn put_imported_address(
        &mut self,
        script: &[u8],
        account: u32,
        add_time: u64,
        sync: crate::rows::SyncStatus,
        encrypted_pubkey: &[u8],
        encrypted_privkey: &[u8],
    ) -> Result<()>;

    /// Write a script-address row under `sha256(script)`.
    fn put_script_address(
        &mut self,
        script: &[u8],
        account: u32,
        add_time: u64,
        sync: crate::rows::SyncStatus,
        encrypted_script_hash: &[u8],
        encrypted_script: &[u8],
    ) -> Result<()>;

    /// Sweep all private material: master-private params, private/script
    /// crypto keys, the coin-type private extended key, per-account
    /// encrypted private extended keys, and rewrite imported/script rows to
    /// drop their secret half.
    fn delete_private_keys(&mut self) -> Result<()>;

    /// Create a voting-pool namespace.
    fn put_voting_pool(&mut self, pool_id: &[u8]) -> Result<()>;

    /// Write a series row.
    fn put_series(&mut self, pool_id: &[u8], series_id: u32, row: &SeriesRow) -> Result<()>;

    /// Allocate and return the next color id, advancing the counter.
    fn new_color_id(&mut self) -> Result<u32>;

    /// Allocate and return the next outpoint id, advancing the counter.
    fn new_outpoint_id(&mut self) -> Result<u32>;

    /// Register a color definition's hash string under its id, and record
    /// the color's account number (initial index 0).
    fn put_color_definition(&mut self, hash_string: &str, color_id: u32, account: u32) -> Result<()>;

    /// Write a colored outpoint record and its `(tx_hash, index) ->
    /// outpoint_id` reverse index in one step.
    fn store_color_outpoint(&mut self, record: &ColorOutPointRecord) -> Result<()>;

    /// Record `script -> (account, index)` in the reverse index.
    fn store_script_index(&mut self, account: u32, index: u32, script: &[u8]) -> Result<()>;
}

/// The persistence-layer contract: open/create a store and run closures
/// against read-only or read-write transactions.
pub trait WalletStore: Sized {
    /// The concrete read-only transaction type.
    type Read<'a>: ReadTxn
    where
        Self: 'a;
    /// The concrete read-write transaction type.
    type Write<'a>: WriteTxn
    where
        Self: 'a;

    /// Create a new store at `path`. Fails `AlreadyExists` if one is
    /// already there.
    fn create(path: &Path) -> Result<Self>;

    /// Open an existing store at `path`. Fails `NoExist` if absent.
    fn open(path: &Path) -> Result<Self>;

    /// Run `f` against a read-only transaction.
    fn view<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Self::Read<'_>) -> Result<T>;

    /// Run `f` against a read-write transaction. All writes `f` performs
    /// commit atomically if `f` returns `Ok`, or are rolled back if it
    /// returns `Err` or panics.
    fn update<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Self::Write<'_>) -> Result<T>;

    /// Close the store, releasing its file handle.
    fn close(self) -> Result<()>;

    /// Copy the underlying store file to `new_path` while holding a read
    /// transaction against `self`, then open the copy. Used by
    /// `ExportWatchingOnly` so the copy observes a single consistent
    /// snapshot instead of a concurrently-mutating file.
    fn export_copy(&self, new_path: &Path) -> Result<Self>;
}
