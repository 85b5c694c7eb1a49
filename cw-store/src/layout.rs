//! Key-prefix layout for the single underlying `sled` tree.
//!
//! `sled` has no first-class notion of separate buckets within one file the
//! way bolt/bbolt does, so each logical bucket from the persistence
//! contract becomes a distinct byte-string prefix inside one tree. Keys
//! never collide across prefixes because every prefix below is a fixed,
//! unambiguous tag no variable-length component can reproduce.

use sha2::{Digest, Sha256};

pub const MASTER_PUB_PARAMS: &[u8] = b"m/pub";
pub const MASTER_PRIV_PARAMS: &[u8] = b"m/priv";
pub const CRYPTO_PUB: &[u8] = b"m/ckpub";
pub const CRYPTO_PRIV: &[u8] = b"m/ckpriv";
pub const CRYPTO_SCRIPT: &[u8] = b"m/ckscript";
pub const COINTYPE_PUB: &[u8] = b"m/cointypepub";
pub const COINTYPE_PRIV: &[u8] = b"m/cointypepriv";
pub const WATCHING_ONLY: &[u8] = b"m/watchonly";
pub const NUM_ACCOUNTS: &[u8] = b"m/numaccounts";
pub const COLOR_COUNTER: &[u8] = b"ctr/color";
pub const OUTPOINT_COUNTER: &[u8] = b"ctr/outpoint";

pub fn account(account: u32) -> Vec<u8> {
    [b"acct/".as_slice(), &account.to_be_bytes()].concat()
}

pub fn address(script_hash: &[u8; 32]) -> Vec<u8> {
    [b"addr/".as_slice(), script_hash].concat()
}

pub fn voting_pool(pool_id: &[u8]) -> Vec<u8> {
    [b"vp/".as_slice(), pool_id].concat()
}

pub fn series(pool_id: &[u8], series_id: u32) -> Vec<u8> {
    [
        b"series/".as_slice(),
        &(pool_id.len() as u32).to_be_bytes(),
        pool_id,
        &series_id.to_be_bytes(),
    ]
    .concat()
}

pub fn series_prefix(pool_id: &[u8]) -> Vec<u8> {
    [
        b"series/".as_slice(),
        &(pool_id.len() as u32).to_be_bytes(),
        pool_id,
    ]
    .concat()
}

pub fn color_definition(hash_string: &str) -> Vec<u8> {
    [b"colordef/".as_slice(), hash_string.as_bytes()].concat()
}

pub fn color_outpoint(id: u32) -> Vec<u8> {
    [b"coutpoint/".as_slice(), &id.to_be_bytes()].concat()
}

pub fn color_outpoint_prefix() -> &'static [u8] {
    b"coutpoint/"
}

pub fn outpoint_index(tx_hash: &[u8; 32], output_index: u32) -> Vec<u8> {
    [
        b"outpointidx/".as_slice(),
        tx_hash,
        &output_index.to_be_bytes(),
    ]
    .concat()
}

pub fn script_index(script: &[u8]) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(script);
    let hash: [u8; 32] = hasher.finalize().into();
    [b"scriptidx/".as_slice(), &hash].concat()
}

pub fn sha256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_account_key_is_big_endian_for_ordered_scans() {
        let a = account(1);
        let b = account(2);
        assert!(a < b);
    }

    #[test]
    fn test_series_key_distinguishes_pool_boundary() {
        // The length prefix prevents pool_id=b"ab" from ever producing the
        // same key bytes as pool_id=b"a" for any series id.
        let k1 = series(b"ab", 1);
        let k2 = series(b"a", 1);
        assert_ne!(k1, k2);
        assert!(k1.starts_with(&series_prefix(b"ab")));
        assert!(!k1.starts_with(&series_prefix(b"a")));
    }
}
