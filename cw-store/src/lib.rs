//! A `sled`-backed [`WalletStore`](cw_core::store::WalletStore) implementation.
//!
//! `sled` is an embedded, transactional, ACID byte-oriented store — the same
//! role a bolt/bbolt-style engine plays for the original design. Every
//! logical bucket of the persistence contract becomes a fixed key prefix
//! inside one `sled::Tree` (see [`layout`]); `sled::Tree::transaction` backs
//! [`WalletStore::update`].

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod layout;

use std::cell::RefCell;
use std::path::Path;

use cw_core::error::{Error, Result};
use cw_core::rows::{AccountRow, AddressRow, AddressVariant, ColorOutPointRecord, SeriesRow, SyncStatus};
use cw_core::store::{ReadTxn, WalletStore, WriteTxn};
use sled::transaction::{ConflictableTransactionError, TransactionError, TransactionalTree};
use sled::Tree;

/// A byte-oriented key/value getter, implemented by both the plain `Tree`
/// (used outside a transaction) and `TransactionalTree` (used inside one).
trait Getter {
    fn get_bytes(&self, key: &[u8]) -> Result<Option<Vec<u8>>>;
}

impl Getter for Tree {
    fn get_bytes(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.get(key).map_err(Error::database)?.map(|v| v.to_vec()))
    }
}

impl Getter for TransactionalTree {
    fn get_bytes(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.get(key).map_err(Error::database)?.map(|v| v.to_vec()))
    }
}

/// A mutating counterpart to [`Getter`], implemented only by
/// `TransactionalTree`: every write participates in the enclosing
/// transaction.
trait Setter: Getter {
    fn set_bytes(&self, key: &[u8], value: &[u8]) -> Result<()>;
    fn remove_bytes(&self, key: &[u8]) -> Result<()>;
}

impl Setter for TransactionalTree {
    fn set_bytes(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.insert(key, value).map_err(Error::database)?;
        Ok(())
    }

    fn remove_bytes(&self, key: &[u8]) -> Result<()> {
        self.remove(key).map_err(Error::database)?;
        Ok(())
    }
}

fn read_counter(g: &impl Getter, key: &[u8]) -> Result<u32> {
    match g.get_bytes(key)? {
        Some(bytes) if bytes.len() == 4 => Ok(u32::from_le_bytes(bytes.try_into().unwrap())),
        Some(_) => Err(Error::Database("malformed serial-id counter".to_string())),
        None => Ok(1),
    }
}

fn write_counter(s: &impl Setter, key: &[u8], value: u32) -> Result<()> {
    s.set_bytes(key, &value.to_le_bytes())
}

fn do_fetch_master_key_params(g: &impl Getter) -> Result<(Option<Vec<u8>>, Option<Vec<u8>>)> {
    Ok((
        g.get_bytes(layout::MASTER_PUB_PARAMS)?,
        g.get_bytes(layout::MASTER_PRIV_PARAMS)?,
    ))
}

fn do_fetch_crypto_keys(g: &impl Getter) -> Result<(Vec<u8>, Option<Vec<u8>>, Option<Vec<u8>>)> {
    let pub_key = g
        .get_bytes(layout::CRYPTO_PUB)?
        .ok_or_else(|| Error::Database("missing public crypto key".to_string()))?;
    let priv_key = g.get_bytes(layout::CRYPTO_PRIV)?;
    let script_key = g.get_bytes(layout::CRYPTO_SCRIPT)?;
    Ok((pub_key, priv_key, script_key))
}

fn do_fetch_cointype_keys(g: &impl Getter) -> Result<(Vec<u8>, Option<Vec<u8>>)> {
    let pub_key = g
        .get_bytes(layout::COINTYPE_PUB)?
        .ok_or_else(|| Error::Database("missing public coin-type key".to_string()))?;
    let priv_key = g.get_bytes(layout::COINTYPE_PRIV)?;
    Ok((pub_key, priv_key))
}

fn do_fetch_watching_only(g: &impl Getter) -> Result<bool> {
    Ok(g.get_bytes(layout::WATCHING_ONLY)?.map(|b| b.first() == Some(&1)).unwrap_or(false))
}

fn do_fetch_account_info(g: &impl Getter, account: u32) -> Result<AccountRow> {
    let bytes = g
        .get_bytes(&layout::account(account))?
        .ok_or(Error::InvalidAccount(account))?;
    AccountRow::deserialize(&bytes)
}

fn do_fetch_num_accounts(g: &impl Getter) -> Result<u32> {
    match g.get_bytes(layout::NUM_ACCOUNTS)? {
        Some(bytes) if bytes.len() == 4 => Ok(u32::from_le_bytes(bytes.try_into().unwrap())),
        Some(_) => Err(Error::Database("malformed account count".to_string())),
        None => Ok(0),
    }
}

fn do_fetch_address(g: &impl Getter, script_hash: &[u8; 32]) -> Result<AddressRow> {
    let bytes = g
        .get_bytes(&layout::address(script_hash))?
        .ok_or(Error::AddressNotFound)?;
    AddressRow::deserialize(&bytes)
}

fn do_exists_address(g: &impl Getter, script_hash: &[u8; 32]) -> Result<bool> {
    Ok(g.get_bytes(&layout::address(script_hash))?.is_some())
}

fn do_exists_voting_pool(g: &impl Getter, pool_id: &[u8]) -> Result<bool> {
    Ok(g.get_bytes(&layout::voting_pool(pool_id))?.is_some())
}

fn do_exists_series(g: &impl Getter, pool_id: &[u8], series_id: u32) -> Result<bool> {
    Ok(g.get_bytes(&layout::series(pool_id, series_id))?.is_some())
}

fn do_load_all_series(tree: &Tree, pool_id: &[u8]) -> Result<Vec<(u32, SeriesRow)>> {
    let prefix = layout::series_prefix(pool_id);
    let mut out = Vec::new();
    for item in tree.scan_prefix(&prefix) {
        let (key, value) = item.map_err(Error::database)?;
        if key.len() < 4 {
            return Err(Error::Database("malformed series key".to_string()));
        }
        let series_id_bytes = &key[key.len() - 4..];
        let series_id = u32::from_be_bytes(series_id_bytes.try_into().unwrap());
        out.push((series_id, SeriesRow::deserialize(&value)?));
    }
    Ok(out)
}

fn do_fetch_color_definition(g: &impl Getter, hash_string: &str) -> Result<Option<u32>> {
    match g.get_bytes(&layout::color_definition(hash_string))? {
        Some(bytes) if bytes.len() >= 4 => Ok(Some(u32::from_le_bytes(bytes[0..4].try_into().unwrap()))),
        Some(_) => Err(Error::Database("malformed color definition record".to_string())),
        None => Ok(None),
    }
}

fn do_fetch_color_outpoint(g: &impl Getter, id: u32) -> Result<ColorOutPointRecord> {
    let bytes = g
        .get_bytes(&layout::color_outpoint(id))?
        .ok_or_else(|| Error::Database(format!("color outpoint {id} not found")))?;
    ColorOutPointRecord::deserialize(&bytes)
}

fn do_all_color_outpoints(tree: &Tree) -> Result<Vec<ColorOutPointRecord>> {
    let mut out = Vec::new();
    for item in tree.scan_prefix(layout::color_outpoint_prefix()) {
        let (_, value) = item.map_err(Error::database)?;
        out.push(ColorOutPointRecord::deserialize(&value)?);
    }
    Ok(out)
}

fn do_fetch_outpoint_id(g: &impl Getter, tx_hash: &[u8; 32], output_index: u32) -> Result<u32> {
    match g.get_bytes(&layout::outpoint_index(tx_hash, output_index))? {
        Some(bytes) if bytes.len() == 4 => Ok(u32::from_le_bytes(bytes.try_into().unwrap())),
        Some(_) => Err(Error::Database("malformed outpoint index entry".to_string())),
        None => Ok(0),
    }
}

fn do_lookup_script(g: &impl Getter, script: &[u8]) -> Result<(u32, u32)> {
    let bytes = g
        .get_bytes(&layout::script_index(script))?
        .ok_or_else(|| Error::Script("script not found in reverse index".to_string()))?;
    if bytes.len() != 8 {
        return Err(Error::Database("malformed script index entry".to_string()));
    }
    let account = u32::from_le_bytes(bytes[0..4].try_into().unwrap());
    let index = u32::from_le_bytes(bytes[4..8].try_into().unwrap());
    Ok((account, index))
}

/// A read-only view over the store, backed directly by the plain `Tree`.
pub struct SledRead<'a> {
    tree: &'a Tree,
}

impl ReadTxn for SledRead<'_> {
    fn fetch_master_key_params(&self) -> Result<(Option<Vec<u8>>, Option<Vec<u8>>)> {
        do_fetch_master_key_params(self.tree)
    }

    fn fetch_crypto_keys(&self) -> Result<(Vec<u8>, Option<Vec<u8>>, Option<Vec<u8>>)> {
        do_fetch_crypto_keys(self.tree)
    }

    fn fetch_cointype_keys(&self) -> Result<(Vec<u8>, Option<Vec<u8>>)> {
        do_fetch_cointype_keys(self.tree)
    }

    fn fetch_watching_only(&self) -> Result<bool> {
        do_fetch_watching_only(self.tree)
    }

    fn fetch_account_info(&self, account: u32) -> Result<AccountRow> {
        do_fetch_account_info(self.tree, account)
    }

    fn fetch_num_accounts(&self) -> Result<u32> {
        do_fetch_num_accounts(self.tree)
    }

    fn fetch_address(&self, script_hash: &[u8; 32]) -> Result<AddressRow> {
        do_fetch_address(self.tree, script_hash)
    }

    fn exists_address(&self, script_hash: &[u8; 32]) -> Result<bool> {
        do_exists_address(self.tree, script_hash)
    }

    fn exists_voting_pool(&self, pool_id: &[u8]) -> Result<bool> {
        do_exists_voting_pool(self.tree, pool_id)
    }

    fn exists_series(&self, pool_id: &[u8], series_id: u32) -> Result<bool> {
        do_exists_series(self.tree, pool_id, series_id)
    }

    fn load_all_series(&self, pool_id: &[u8]) -> Result<Vec<(u32, SeriesRow)>> {
        do_load_all_series(self.tree, pool_id)
    }

    fn fetch_color_definition(&self, hash_string: &str) -> Result<Option<u32>> {
        do_fetch_color_definition(self.tree, hash_string)
    }

    fn fetch_color_counter(&self) -> Result<u32> {
        read_counter(self.tree, layout::COLOR_COUNTER)
    }

    fn fetch_outpoint_counter(&self) -> Result<u32> {
        read_counter(self.tree, layout::OUTPOINT_COUNTER)
    }

    fn fetch_color_outpoint(&self, id: u32) -> Result<ColorOutPointRecord> {
        do_fetch_color_outpoint(self.tree, id)
    }

    fn all_color_outpoints(&self) -> Result<Vec<ColorOutPointRecord>> {
        do_all_color_outpoints(self.tree)
    }

    fn fetch_outpoint_id(&self, tx_hash: &[u8; 32], output_index: u32) -> Result<u32> {
        do_fetch_outpoint_id(self.tree, tx_hash, output_index)
    }

    fn lookup_script(&self, script: &[u8]) -> Result<(u32, u32)> {
        do_lookup_script(self.tree, script)
    }
}

/// A read-write view over the store, backed by a `TransactionalTree` for
/// single-key operations; enumeration helpers (`load_all_series`,
/// `all_color_outpoints`) read through a plain snapshot of the tree instead,
/// since `sled` transactions do not support prefix scans. Those two methods
/// observe the tree as of the start of the enclosing `update` call rather
/// than participating in its isolation — acceptable here because nothing in
/// this crate mutates and then immediately re-scans within the same
/// transaction.
pub struct SledWrite<'a> {
    tx: &'a TransactionalTree,
    snapshot: &'a Tree,
}

impl ReadTxn for SledWrite<'_> {
    fn fetch_master_key_params(&self) -> Result<(Option<Vec<u8>>, Option<Vec<u8>>)> {
        do_fetch_master_key_params(self.tx)
    }

    fn fetch_crypto_keys(&self) -> Result<(Vec<u8>, Option<Vec<u8>>, Option<Vec<u8>>)> {
        do_fetch_crypto_keys(self.tx)
    }

    fn fetch_cointype_keys(&self) -> Result<(Vec<u8>, Option<Vec<u8>>)> {
        do_fetch_cointype_keys(self.tx)
    }

    fn fetch_watching_only(&self) -> Result<bool> {
        do_fetch_watching_only(self.tx)
    }

    fn fetch_account_info(&self, account: u32) -> Result<AccountRow> {
        do_fetch_account_info(self.tx, account)
    }

    fn fetch_num_accounts(&self) -> Result<u32> {
        do_fetch_num_accounts(self.tx)
    }

    fn fetch_address(&self, script_hash: &[u8; 32]) -> Result<AddressRow> {
        do_fetch_address(self.tx, script_hash)
    }

    fn exists_address(&self, script_hash: &[u8; 32]) -> Result<bool> {
        do_exists_address(self.tx, script_hash)
    }

    fn exists_voting_pool(&self, pool_id: &[u8]) -> Result<bool> {
        do_exists_voting_pool(self.tx, pool_id)
    }

    fn exists_series(&self, pool_id: &[u8], series_id: u32) -> Result<bool> {
        do_exists_series(self.tx, pool_id, series_id)
    }

    fn load_all_series(&self, pool_id: &[u8]) -> Result<Vec<(u32, SeriesRow)>> {
        do_load_all_series(self.snapshot, pool_id)
    }

    fn fetch_color_definition(&self, hash_string: &str) -> Result<Option<u32>> {
        do_fetch_color_definition(self.tx, hash_string)
    }

    fn fetch_color_counter(&self) -> Result<u32> {
        read_counter(self.tx, layout::COLOR_COUNTER)
    }

    fn fetch_outpoint_counter(&self) -> Result<u32> {
        read_counter(self.tx, layout::OUTPOINT_COUNTER)
    }

    fn fetch_color_outpoint(&self, id: u32) -> Result<ColorOutPointRecord> {
        do_fetch_color_outpoint(self.tx, id)
    }

    fn all_color_outpoints(&self) -> Result<Vec<ColorOutPointRecord>> {
        do_all_color_outpoints(self.snapshot)
    }

    fn fetch_outpoint_id(&self, tx_hash: &[u8; 32], output_index: u32) -> Result<u32> {
        do_fetch_outpoint_id(self.tx, tx_hash, output_index)
    }

    fn lookup_script(&self, script: &[u8]) -> Result<(u32, u32)> {
        do_lookup_script(self.tx, script)
    }
}

impl WriteTxn for SledWrite<'_> {
    fn put_master_key_params(&mut self, pub_params: Option<&[u8]>, priv_params: Option<&[u8]>) -> Result<()> {
        match pub_params {
            Some(p) => self.tx.set_bytes(layout::MASTER_PUB_PARAMS, p)?,
            None => self.tx.remove_bytes(layout::MASTER_PUB_PARAMS)?,
        }
        match priv_params {
            Some(p) => self.tx.set_bytes(layout::MASTER_PRIV_PARAMS, p)?,
            None => self.tx.remove_bytes(layout::MASTER_PRIV_PARAMS)?,
        }
        Ok(())
    }

    fn put_crypto_keys(&mut self, pub_key: &[u8], priv_key: Option<&[u8]>, script_key: Option<&[u8]>) -> Result<()> {
        self.tx.set_bytes(layout::CRYPTO_PUB, pub_key)?;
        match priv_key {
            Some(k) => self.tx.set_bytes(layout::CRYPTO_PRIV, k)?,
            None => self.tx.remove_bytes(layout::CRYPTO_PRIV)?,
        }
        match script_key {
            Some(k) => self.tx.set_bytes(layout::CRYPTO_SCRIPT, k)?,
            None => self.tx.remove_bytes(layout::CRYPTO_SCRIPT)?,
        }
        Ok(())
    }

    fn put_cointype_keys(&mut self, pub_key: &[u8], priv_key: Option<&[u8]>) -> Result<()> {
        self.tx.set_bytes(layout::COINTYPE_PUB, pub_key)?;
        match priv_key {
            Some(k) => self.tx.set_bytes(layout::COINTYPE_PRIV, k)?,
            None => self.tx.remove_bytes(layout::COINTYPE_PRIV)?,
        }
        Ok(())
    }

    fn put_watching_only(&mut self, watching_only: bool) -> Result<()> {
        self.tx.set_bytes(layout::WATCHING_ONLY, &[watching_only as u8])
    }

    fn put_account_info(&mut self, account: u32, row: &AccountRow) -> Result<()> {
        self.tx.set_bytes(&layout::account(account), &row.serialize())
    }

    fn put_num_accounts(&mut self, n: u32) -> Result<()> {
        self.tx.set_bytes(layout::NUM_ACCOUNTS, &n.to_le_bytes())
    }

    fn put_chained_address(
        &mut self,
        script: &[u8],
        account: u32,
        add_time: u64,
        sync: SyncStatus,
        branch: u32,
        index: u32,
    ) -> Result<()> {
        let row = AddressRow {
            account,
            add_time,
            sync_status: sync,
            variant: AddressVariant::Chained { branch, index },
        };
        let key = layout::address(&layout::sha256(script));
        self.tx.set_bytes(&key, &row.serialize())
    }

    fn put_imported_address(
        &mut self,
        script: &[u8],
        account: u32,
        add_time: u64,
        sync: SyncStatus,
        encrypted_pubkey: &[u8],
        encrypted_privkey: &[u8],
    ) -> Result<()> {
        let row = AddressRow {
            account,
            add_time,
            sync_status: sync,
            variant: AddressVariant::Imported {
                encrypted_pubkey: encrypted_pubkey.to_vec(),
                encrypted_privkey: encrypted_privkey.to_vec(),
            },
        };
        let key = layout::address(&layout::sha256(script));
        self.tx.set_bytes(&key, &row.serialize())
    }

    fn put_script_address(
        &mut self,
        script: &[u8],
        account: u32,
        add_time: u64,
        sync: SyncStatus,
        encrypted_script_hash: &[u8],
        encrypted_script: &[u8],
    ) -> Result<()> {
        let row = AddressRow {
            account,
            add_time,
            sync_status: sync,
            variant: AddressVariant::Script {
                encrypted_script_hash: encrypted_script_hash.to_vec(),
                encrypted_script: encrypted_script.to_vec(),
            },
        };
        let key = layout::address(&layout::sha256(script));
        self.tx.set_bytes(&key, &row.serialize())
    }

    fn delete_private_keys(&mut self) -> Result<()> {
        self.tx.remove_bytes(layout::MASTER_PRIV_PARAMS)?;
        self.tx.remove_bytes(layout::CRYPTO_PRIV)?;
        self.tx.remove_bytes(layout::CRYPTO_SCRIPT)?;
        self.tx.remove_bytes(layout::COINTYPE_PRIV)?;

        let num_accounts = self.fetch_num_accounts()?;
        for account in 0..num_accounts {
            let key = layout::account(account);
            if let Some(bytes) = self.tx.get_bytes(&key)? {
                let mut row = AccountRow::deserialize(&bytes)?;
                row.encrypted_priv_key = None;
                self.tx.set_bytes(&key, &row.serialize())?;
            }
        }

        let addr_prefix = b"addr/";
        let addr_keys: Vec<sled::IVec> = self
            .snapshot
            .scan_prefix(addr_prefix)
            .keys()
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Error::database)?;
        for key in addr_keys {
            let bytes = match self.tx.get_bytes(&key)? {
                Some(b) => b,
                None => continue,
            };
            let mut row = AddressRow::deserialize(&bytes)?;
            let changed = match &mut row.variant {
                AddressVariant::Imported { encrypted_privkey, .. } => {
                    encrypted_privkey.clear();
                    true
                }
                AddressVariant::Script { encrypted_script, .. } => {
                    encrypted_script.clear();
                    true
                }
                AddressVariant::Chained { .. } => false,
            };
            if changed {
                self.tx.set_bytes(&key, &row.serialize())?;
            }
        }
        Ok(())
    }

    fn put_voting_pool(&mut self, pool_id: &[u8]) -> Result<()> {
        self.tx.set_bytes(&layout::voting_pool(pool_id), &[1])
    }

    fn put_series(&mut self, pool_id: &[u8], series_id: u32, row: &SeriesRow) -> Result<()> {
        self.tx.set_bytes(&layout::series(pool_id, series_id), &row.serialize())
    }

    fn new_color_id(&mut self) -> Result<u32> {
        let current = read_counter(self.tx, layout::COLOR_COUNTER)?;
        write_counter(self.tx, layout::COLOR_COUNTER, current + 1)?;
        Ok(current)
    }

    fn new_outpoint_id(&mut self) -> Result<u32> {
        let current = read_counter(self.tx, layout::OUTPOINT_COUNTER)?;
        write_counter(self.tx, layout::OUTPOINT_COUNTER, current + 1)?;
        Ok(current)
    }

    fn put_color_definition(&mut self, hash_string: &str, color_id: u32, account: u32) -> Result<()> {
        let mut value = Vec::with_capacity(8);
        value.extend_from_slice(&color_id.to_le_bytes());
        value.extend_from_slice(&account.to_le_bytes());
        self.tx.set_bytes(&layout::color_definition(hash_string), &value)
    }

    fn store_color_outpoint(&mut self, record: &ColorOutPointRecord) -> Result<()> {
        self.tx.set_bytes(&layout::color_outpoint(record.id), &record.serialize())?;
        self.tx.set_bytes(
            &layout::outpoint_index(&record.tx_hash, record.output_index),
            &record.id.to_le_bytes(),
        )
    }

    fn store_script_index(&mut self, account: u32, index: u32, script: &[u8]) -> Result<()> {
        let mut value = Vec::with_capacity(8);
        value.extend_from_slice(&account.to_le_bytes());
        value.extend_from_slice(&index.to_le_bytes());
        self.tx.set_bytes(&layout::script_index(script), &value)
    }
}

/// The `sled`-backed store.
pub struct SledStore {
    db: sled::Db,
    tree: Tree,
}

impl WalletStore for SledStore {
    type Read<'a> = SledRead<'a>;
    type Write<'a> = SledWrite<'a>;

    fn create(path: &Path) -> Result<Self> {
        if path.exists() {
            return Err(Error::AlreadyExists);
        }
        let db = sled::open(path).map_err(Error::database)?;
        let tree = db.open_tree("main").map_err(Error::database)?;
        tracing::info!(path = %path.display(), "store created");
        Ok(Self { db, tree })
    }

    fn open(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(Error::NoExist);
        }
        let db = sled::open(path).map_err(Error::database)?;
        let tree = db.open_tree("main").map_err(Error::database)?;
        tracing::debug!(path = %path.display(), "store opened");
        Ok(Self { db, tree })
    }

    fn view<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Self::Read<'_>) -> Result<T>,
    {
        let read = SledRead { tree: &self.tree };
        f(&read)
    }

    fn update<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Self::Write<'_>) -> Result<T>,
    {
        let cell = RefCell::new(Some(f));
        let snapshot = &self.tree;
        let result: std::result::Result<T, TransactionError<Error>> =
            self.tree.transaction(move |tx| {
                let mut write = SledWrite { tx, snapshot };
                let f = cell
                    .borrow_mut()
                    .take()
                    .expect("cw-store update closures never retry: sled only retries on write conflicts, which this single-writer store never produces");
                f(&mut write).map_err(ConflictableTransactionError::Abort)
            });
        result.map_err(|e| match e {
            TransactionError::Abort(err) => err,
            TransactionError::Storage(err) => Error::database(err),
        })
    }

    fn close(self) -> Result<()> {
        self.db.flush().map_err(Error::database)?;
        tracing::debug!("store closed");
        Ok(())
    }

    fn export_copy(&self, new_path: &Path) -> Result<Self> {
        if new_path.exists() {
            return Err(Error::AlreadyExists);
        }
        // `Tree::iter` walks a consistent point-in-time view of sled's
        // log-structured storage, which stands in for "holding a read
        // transaction" here since sled transactions can't be combined with
        // cross-tree copies.
        let copy = Self::create(new_path)?;
        let mut n = 0usize;
        for item in self.tree.iter() {
            let (key, value) = item.map_err(Error::database)?;
            copy.tree.insert(key, value).map_err(Error::database)?;
            n += 1;
        }
        copy.db.flush().map_err(Error::database)?;
        tracing::info!(entries = n, path = %new_path.display(), "store exported");
        Ok(copy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sample_account_row() -> AccountRow {
        AccountRow {
            encrypted_pub_key: vec![1, 2, 3],
            encrypted_priv_key: Some(vec![4, 5, 6]),
            next_external_index: 0,
            next_internal_index: 0,
            name: "default".to_string(),
        }
    }

    #[test]
    fn test_create_fails_if_path_exists() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.sled");
        SledStore::create(&path).unwrap();
        assert!(matches!(SledStore::create(&path), Err(Error::AlreadyExists)));
    }

    #[test]
    fn test_open_fails_if_absent() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("missing.sled");
        assert!(matches!(SledStore::open(&path), Err(Error::NoExist)));
    }

    #[test]
    fn test_account_round_trip_through_update_and_view() {
        let dir = tempdir().unwrap();
        let store = SledStore::create(&dir.path().join("wallet.sled")).unwrap();
        let row = sample_account_row();
        store
            .update(|txn| {
                txn.put_account_info(0, &row)?;
                txn.put_num_accounts(1)
            })
            .unwrap();

        let fetched = store.view(|txn| txn.fetch_account_info(0)).unwrap();
        assert_eq!(fetched, row);
        assert_eq!(store.view(|txn| txn.fetch_num_accounts()).unwrap(), 1);
    }

    #[test]
    fn test_missing_account_is_invalid_account_error() {
        let dir = tempdir().unwrap();
        let store = SledStore::create(&dir.path().join("wallet.sled")).unwrap();
        let err = store.view(|txn| txn.fetch_account_info(7)).unwrap_err();
        assert!(matches!(err, Error::InvalidAccount(7)));
    }

    #[test]
    fn test_update_rolls_back_on_error() {
        let dir = tempdir().unwrap();
        let store = SledStore::create(&dir.path().join("wallet.sled")).unwrap();
        let row = sample_account_row();
        let result: Result<()> = store.update(|txn| {
            txn.put_account_info(0, &row)?;
            Err(Error::Locked)
        });
        assert!(result.is_err());
        assert!(matches!(
            store.view(|txn| txn.fetch_account_info(0)),
            Err(Error::InvalidAccount(0))
        ));
    }

    #[test]
    fn test_color_id_allocation_is_monotone_and_persisted() {
        let dir = tempdir().unwrap();
        let store = SledStore::create(&dir.path().join("wallet.sled")).unwrap();
        let first = store.update(|txn| txn.new_color_id()).unwrap();
        let second = store.update(|txn| txn.new_color_id()).unwrap();
        assert_eq!(first, 1);
        assert_eq!(second, 2);
    }

    #[test]
    fn test_outpoint_index_round_trip() {
        let dir = tempdir().unwrap();
        let store = SledStore::create(&dir.path().join("wallet.sled")).unwrap();
        let record = ColorOutPointRecord {
            id: 1,
            tx_hash: [7u8; 32],
            output_index: 2,
            base_value: 1000,
            color_id: 0,
            color_value: 1000,
            spent: false,
            spending_tx_hash: [0u8; 32],
            spending_index: 0,
            script: vec![0x76, 0xa9],
        };
        store.update(|txn| txn.store_color_outpoint(&record)).unwrap();
        let id = store
            .view(|txn| txn.fetch_outpoint_id(&record.tx_hash, record.output_index))
            .unwrap();
        assert_eq!(id, 1);
        let fetched = store.view(|txn| txn.fetch_color_outpoint(1)).unwrap();
        assert_eq!(fetched, record);
    }

    #[test]
    fn test_all_color_outpoints_orders_by_id() {
        let dir = tempdir().unwrap();
        let store = SledStore::create(&dir.path().join("wallet.sled")).unwrap();
        for id in [3u32, 1, 2] {
            let record = ColorOutPointRecord {
                id,
                tx_hash: [id as u8; 32],
                output_index: 0,
                base_value: 100,
                color_id: 0,
                color_value: 100,
                spent: false,
                spending_tx_hash: [0u8; 32],
                spending_index: 0,
                script: vec![],
            };
            store.update(|txn| txn.store_color_outpoint(&record)).unwrap();
        }
        let all = store.view(|txn| txn.all_color_outpoints()).unwrap();
        let ids: Vec<u32> = all.iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![1, 2, 3]);
    }

    #[test]
    fn test_delete_private_keys_clears_account_and_imported_material() {
        let dir = tempdir().unwrap();
        let store = SledStore::create(&dir.path().join("wallet.sled")).unwrap();
        let row = sample_account_row();
        store
            .update(|txn| {
                txn.put_account_info(0, &row)?;
                txn.put_num_accounts(1)?;
                txn.put_imported_address(
                    b"script-a",
                    1 << 31,
                    0,
                    SyncStatus::Full,
                    b"pub",
                    b"priv",
                )
            })
            .unwrap();

        store.update(|txn| txn.delete_private_keys()).unwrap();

        let after = store.view(|txn| txn.fetch_account_info(0)).unwrap();
        assert!(after.encrypted_priv_key.is_none());

        let hash = layout::sha256(b"script-a");
        let addr = store.view(|txn| txn.fetch_address(&hash)).unwrap();
        match addr.variant {
            AddressVariant::Imported { encrypted_privkey, .. } => assert!(encrypted_privkey.is_empty()),
            _ => panic!("expected imported variant"),
        }
    }

    #[test]
    fn test_export_copy_fails_if_destination_exists() {
        let dir = tempdir().unwrap();
        let src = dir.path().join("src.sled");
        let dst = dir.path().join("dst.sled");
        let store = SledStore::create(&src).unwrap();
        SledStore::create(&dst).unwrap();
        assert!(matches!(store.export_copy(&dst), Err(Error::AlreadyExists)));
    }

    #[test]
    fn test_export_copy_carries_existing_data() {
        let dir = tempdir().unwrap();
        let src = dir.path().join("src.sled");
        let dst = dir.path().join("dst.sled");
        let store = SledStore::create(&src).unwrap();
        let row = sample_account_row();
        store
            .update(|txn| {
                txn.put_account_info(0, &row)?;
                txn.put_num_accounts(1)
            })
            .unwrap();

        let copy = store.export_copy(&dst).unwrap();
        let fetched = copy.view(|txn| txn.fetch_account_info(0)).unwrap();
        assert_eq!(fetched, row);
    }
}
