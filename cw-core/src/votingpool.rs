//! Voting pool / series: named groups of HD public keys that derive
//! deterministic multi-signature deposit scripts.
//!
//! A voting pool is an opaque id namespace; each pool owns series identified
//! by a `u32`. A series is empowered once any private key has been stored
//! for it, after which its public-key set and threshold are immutable.

use std::collections::HashMap;

use bitcoin::bip32::ChildNumber;
use bitcoin::script::{Builder, PushBytesBuf};
use bitcoin::{opcodes, PublicKey, ScriptBuf};
use parking_lot::RwLock;

use crate::error::{Error, Result};
use crate::keys::ExtendedKey;
use crate::manager::AddressManager;
use crate::rows::{SeriesRow, SERIES_ROW_VERSION};
use crate::store::WalletStore;

/// The fewest public keys a series may be created with; left
/// implementation-configured, three matches the smallest sensible
/// multi-signature group (2-of-3).
pub const MIN_SERIES_PUBKEYS: usize = 3;
/// The most public keys a standard `OP_CHECKMULTISIG` script can reference.
pub const MAX_SERIES_PUBKEYS: usize = 15;

struct CachedSeries {
    pub_keys: Vec<ExtendedKey>,
    req_sigs: u32,
    active: bool,
    empowered: bool,
}

/// Reorder `keys` per the branch rule: branch 0 reverses the list; branch
/// `b >= 1` moves the `b`-th (1-based) key to the front, preserving the
/// relative order of the rest. A pure function, tested independently of any
/// derivation or storage.
pub fn reorder_for_branch<T: Clone>(keys: &[T], branch: u32) -> Result<Vec<T>> {
    if branch == 0 {
        let mut reversed = keys.to_vec();
        reversed.reverse();
        return Ok(reversed);
    }
    let pos = (branch - 1) as usize;
    if pos >= keys.len() {
        return Err(Error::InvalidBranch(branch));
    }
    let mut out = Vec::with_capacity(keys.len());
    out.push(keys[pos].clone());
    for (i, key) in keys.iter().enumerate() {
        if i != pos {
            out.push(key.clone());
        }
    }
    Ok(out)
}

fn build_multisig_script(req_sigs: u32, pub_keys: &[PublicKey]) -> Result<ScriptBuf> {
    if pub_keys.is_empty() || pub_keys.len() > MAX_SERIES_PUBKEYS {
        return Err(Error::ScriptCreation(format!(
            "multisig requires 1..={MAX_SERIES_PUBKEYS} keys, got {}",
            pub_keys.len()
        )));
    }
    if req_sigs == 0 || req_sigs as usize > pub_keys.len() {
        return Err(Error::ScriptCreation(format!(
            "required signatures {req_sigs} out of range for {} keys",
            pub_keys.len()
        )));
    }
    let mut builder = Builder::new().push_int(req_sigs as i64);
    for pk in pub_keys {
        let push = PushBytesBuf::try_from(pk.to_bytes())
            .map_err(|e| Error::ScriptCreation(format!("public key push: {e}")))?;
        builder = builder.push_slice(push);
    }
    builder = builder
        .push_int(pub_keys.len() as i64)
        .push_opcode(opcodes::all::OP_CHECKMULTISIG);
    Ok(builder.into_script())
}

/// Validate the shared precondition of `CreateSeries`/`ReplaceSeries`: every
/// key parses as a public (non-private) extended key, the count is within
/// bounds, `req_sigs` is in `[1, len]`, and no key repeats.
fn validate_series_keys(pub_keys_b58: &[String], req_sigs: u32) -> Result<Vec<ExtendedKey>> {
    if pub_keys_b58.len() < MIN_SERIES_PUBKEYS {
        return Err(Error::TooFewPublicKeys);
    }
    if req_sigs == 0 || req_sigs as usize > pub_keys_b58.len() {
        return Err(Error::TooManyReqSignatures);
    }
    let mut seen = std::collections::HashSet::new();
    for s in pub_keys_b58 {
        if !seen.insert(s.as_str()) {
            return Err(Error::KeyDuplicate);
        }
    }
    let mut keys = Vec::with_capacity(pub_keys_b58.len());
    for s in pub_keys_b58 {
        keys.push(ExtendedKey::from_base58_public_only(s)?);
    }
    Ok(keys)
}

/// Canonical (lexicographic, by base58 string) order, so that `CreateSeries`
/// with any permutation of the same keys produces the same stored row and
/// the same deposit scripts.
fn canonical_order(pub_keys_b58: &[String]) -> Vec<usize> {
    let mut idx: Vec<usize> = (0..pub_keys_b58.len()).collect();
    idx.sort_by(|&a, &b| pub_keys_b58[a].cmp(&pub_keys_b58[b]));
    idx
}

/// A handle onto one voting pool's series namespace, borrowing the address
/// manager it imports deposit scripts into and whose crypto keys it shares.
pub struct VotingPool<'m, S: WalletStore> {
    manager: &'m AddressManager<S>,
    pool_id: Vec<u8>,
    series: RwLock<HashMap<u32, CachedSeries>>,
}

impl<'m, S: WalletStore> VotingPool<'m, S> {
    /// Create a new voting pool namespace. Fails `VotingPoolAlreadyExists` if
    /// `pool_id` is already registered.
    pub fn create(manager: &'m AddressManager<S>, pool_id: &[u8]) -> Result<Self> {
        if manager.store().view(|txn| txn.exists_voting_pool(pool_id))? {
            return Err(Error::VotingPoolAlreadyExists);
        }
        manager.store().update(|txn| txn.put_voting_pool(pool_id))?;
        Ok(Self {
            manager,
            pool_id: pool_id.to_vec(),
            series: RwLock::new(HashMap::new()),
        })
    }

    /// Open an existing voting pool namespace and load all its series into
    /// the in-memory cache.
    pub fn load(manager: &'m AddressManager<S>, pool_id: &[u8]) -> Result<Self> {
        if !manager.store().view(|txn| txn.exists_voting_pool(pool_id))? {
            return Err(Error::VotingPoolNotExists);
        }
        let pool = Self {
            manager,
            pool_id: pool_id.to_vec(),
            series: RwLock::new(HashMap::new()),
        };
        pool.load_all_series()?;
        Ok(pool)
    }

    /// Reload every series row under this pool into the in-memory cache,
    /// decrypting each public key once per series.
    pub fn load_all_series(&self) -> Result<()> {
        let rows = self
            .manager
            .store()
            .view(|txn| txn.load_all_series(&self.pool_id))?;
        let mut cache = self.series.write();
        cache.clear();
        for (series_id, row) in rows {
            let mut pub_keys = Vec::with_capacity(row.encrypted_pub_keys.len());
            for enc in &row.encrypted_pub_keys {
                let b58 = self.manager.decrypt_public(enc)?;
                let key = ExtendedKey::from_base58(
                    std::str::from_utf8(&b58).map_err(|e| Error::HdKey(e.to_string()))?,
                )?;
                pub_keys.push(key);
            }
            cache.insert(
                series_id,
                CachedSeries {
                    pub_keys,
                    req_sigs: row.req_sigs,
                    active: row.active,
                    empowered: row.is_empowered(),
                },
            );
        }
        Ok(())
    }

    /// Create a new series under this pool. Refuses a series id already
    /// present.
    pub fn create_series(
        &self,
        series_id: u32,
        pub_keys_b58: &[String],
        req_sigs: u32,
    ) -> Result<()> {
        if self
            .manager
            .store()
            .view(|txn| txn.exists_series(&self.pool_id, series_id))?
        {
            return Err(Error::SeriesAlreadyExists);
        }
        let keys = validate_series_keys(pub_keys_b58, req_sigs)?;
        let order = canonical_order(pub_keys_b58);
        let sorted_keys: Vec<ExtendedKey> = order.iter().map(|&i| keys[i].clone()).collect();

        let mut encrypted_pub_keys = Vec::with_capacity(sorted_keys.len());
        for key in &sorted_keys {
            encrypted_pub_keys.push(self.manager.encrypt_public(key.to_base58().as_bytes())?);
        }
        let row = SeriesRow {
            version: SERIES_ROW_VERSION,
            active: true,
            req_sigs,
            encrypted_pub_keys,
            encrypted_priv_keys: vec![None; sorted_keys.len()],
        };
        self.manager
            .store()
            .update(|txn| txn.put_series(&self.pool_id, series_id, &row))?;

        self.series.write().insert(
            series_id,
            CachedSeries {
                pub_keys: sorted_keys,
                req_sigs,
                active: true,
                empowered: false,
            },
        );
        tracing::info!(series_id, "series created");
        Ok(())
    }

    /// Replace an existing series' key set/threshold. Refuses once the
    /// series is empowered.
    pub fn replace_series(
        &self,
        series_id: u32,
        pub_keys_b58: &[String],
        req_sigs: u32,
    ) -> Result<()> {
        {
            let cache = self.series.read();
            let existing = cache.get(&series_id).ok_or(Error::SeriesNotExists)?;
            if existing.empowered {
                return Err(Error::SeriesAlreadyEmpowered);
            }
        }
        let keys = validate_series_keys(pub_keys_b58, req_sigs)?;
        let order = canonical_order(pub_keys_b58);
        let sorted_keys: Vec<ExtendedKey> = order.iter().map(|&i| keys[i].clone()).collect();

        let mut encrypted_pub_keys = Vec::with_capacity(sorted_keys.len());
        for key in &sorted_keys {
            encrypted_pub_keys.push(self.manager.encrypt_public(key.to_base58().as_bytes())?);
        }
        let row = SeriesRow {
            version: SERIES_ROW_VERSION,
            active: true,
            req_sigs,
            encrypted_pub_keys,
            encrypted_priv_keys: vec![None; sorted_keys.len()],
        };
        self.manager
            .store()
            .update(|txn| txn.put_series(&self.pool_id, series_id, &row))?;

        self.series.write().insert(
            series_id,
            CachedSeries {
                pub_keys: sorted_keys,
                req_sigs,
                active: true,
                empowered: false,
            },
        );
        Ok(())
    }

    /// Empower a series with a private extended key: the key must neuter to
    /// one of the series' stored public keys.
    pub fn empower_series(&self, series_id: u32, priv_key_b58: &str) -> Result<()> {
        let priv_key = ExtendedKey::from_base58_private_only(priv_key_b58)?;
        let neutered = priv_key.neuter(self.manager.secp());
        let neutered_b58 = neutered.to_base58();

        let slot = {
            let cache = self.series.read();
            let existing = cache.get(&series_id).ok_or(Error::SeriesNotExists)?;
            existing
                .pub_keys
                .iter()
                .position(|k| k.to_base58() == neutered_b58)
                .ok_or(Error::KeysPrivatePublicMismatch)?
        };

        let encrypted_priv = self.manager.encrypt_private(priv_key.to_base58().as_bytes())?;
        self.manager.store().update(|txn| {
            let mut row = txn
                .load_all_series(&self.pool_id)?
                .into_iter()
                .find(|(id, _)| *id == series_id)
                .map(|(_, row)| row)
                .ok_or(Error::SeriesNotExists)?;
            row.encrypted_priv_keys[slot] = Some(encrypted_priv.clone());
            txn.put_series(&self.pool_id, series_id, &row)
        })?;

        let mut cache = self.series.write();
        if let Some(existing) = cache.get_mut(&series_id) {
            existing.empowered = true;
        }
        tracing::info!(series_id, "series empowered");
        Ok(())
    }

    /// Derive the deposit script for `(series_id, branch, index)`: each
    /// cached public key is derived at `index` (no skip-on-invalid at this
    /// layer), reordered per the branch rule, and assembled into an
    /// `req_sigs`-of-N multisig script. The script is encrypted under the
    /// script crypto key and imported into the address manager.
    pub fn deposit_script_address(&self, series_id: u32, branch: u32, index: u32) -> Result<Vec<u8>> {
        let (pub_keys, req_sigs, active) = {
            let cache = self.series.read();
            let existing = cache.get(&series_id).ok_or(Error::SeriesNotExists)?;
            (existing.pub_keys.clone(), existing.req_sigs, existing.active)
        };
        if !active {
            return Err(Error::SeriesNotExists);
        }
        let child_number =
            ChildNumber::from_normal_idx(index).map_err(|_| Error::KeyChain(format!("invalid index {index}")))?;
        let mut derived = Vec::with_capacity(pub_keys.len());
        for key in &pub_keys {
            let child = key
                .derive_child(self.manager.secp(), child_number)
                .map_err(|e| Error::KeyChain(format!("deposit derive: {e}")))?;
            derived.push(child.public_key(self.manager.secp()));
        }
        let reordered = reorder_for_branch(&derived, branch)?;
        let script = build_multisig_script(req_sigs, &reordered)?;
        self.manager.import_script(&script.to_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reorder_branch_zero_reverses() {
        let keys = vec!["a", "b", "c"];
        let reordered = reorder_for_branch(&keys, 0).unwrap();
        assert_eq!(reordered, vec!["c", "b", "a"]);
    }

    #[test]
    fn test_reorder_branch_k_moves_kth_to_front() {
        let keys = vec!["a", "b", "c", "d"];
        // branch 2 -> 1-based key #2 ("b") moves to front, rest keep order.
        let reordered = reorder_for_branch(&keys, 2).unwrap();
        assert_eq!(reordered, vec!["b", "a", "c", "d"]);
    }

    #[test]
    fn test_reorder_branch_out_of_range_errors() {
        let keys = vec!["a", "b"];
        assert!(reorder_for_branch(&keys, 5).is_err());
    }

    #[test]
    fn test_canonical_order_is_permutation_invariant() {
        let a = vec!["xpub3".to_string(), "xpub1".to_string(), "xpub2".to_string()];
        let b = vec!["xpub1".to_string(), "xpub2".to_string(), "xpub3".to_string()];
        let order_a: Vec<&str> = canonical_order(&a).iter().map(|&i| a[i].as_str()).collect();
        let order_b: Vec<&str> = canonical_order(&b).iter().map(|&i| b[i].as_str()).collect();
        assert_eq!(order_a, order_b);
    }

    #[test]
    fn test_validate_series_keys_rejects_too_few() {
        let keys = vec!["only-one".to_string()];
        assert!(matches!(
            validate_series_keys(&keys, 1),
            Err(Error::TooFewPublicKeys)
        ));
    }

    #[test]
    fn test_validate_series_keys_rejects_bad_req_sigs() {
        let keys = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        assert!(matches!(
            validate_series_keys(&keys, 0),
            Err(Error::TooManyReqSignatures)
        ));
        assert!(matches!(
            validate_series_keys(&keys, 4),
            Err(Error::TooManyReqSignatures)
        ));
    }

    #[test]
    fn test_validate_series_keys_rejects_duplicates() {
        let keys = vec!["a".to_string(), "b".to_string(), "a".to_string()];
        assert!(matches!(
            validate_series_keys(&keys, 2),
            Err(Error::KeyDuplicate)
        ));
    }
}
