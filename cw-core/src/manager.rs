//! The Address Manager: key hierarchy lifecycle, address derivation, and the
//! in-memory caches that back them.

use std::collections::HashMap;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use bitcoin::bip32::ChildNumber;
use bitcoin::secp256k1::{All, Secp256k1};
use bitcoin::{Address as BtcAddress, PrivateKey, PublicKey, ScriptBuf};
use cw_params::Network;
use parking_lot::RwLock;
use sha2::{Digest, Sha256};
use zeroize::Zeroize;

use crate::crypto::{CryptoKey, MasterKey, MasterKeyParams, ScryptCost};
use crate::error::{Error, Result};
use crate::keys::ExtendedKey;
use crate::rows::{AccountRow, AddressRow, AddressVariant, SyncStatus};
use crate::store::WalletStore;

/// The default account, created by `Create` and used for uncolored funds.
pub const DEFAULT_ACCOUNT: u32 = 0;
/// The account all `ImportPrivateKey` rows live under.
pub const IMPORTED_ADDR_ACCOUNT: u32 = MAX_ACCOUNT_NUM + 1;
/// The largest account number the manager will provision or accept.
pub const MAX_ACCOUNT_NUM: u32 = (1 << 31) - 1;
/// The largest number of addresses a single account chain may hold.
pub const MAX_ADDRESSES_PER_ACCOUNT: u32 = 1 << 20;

const EXTERNAL_BRANCH: u32 = 0;
const INTERNAL_BRANCH: u32 = 1;

fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn script_hash(script: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(script);
    hasher.finalize().into()
}

struct AccountCache {
    account_pub: ExtendedKey,
    account_priv: Option<ExtendedKey>,
    next_external_index: u32,
    next_internal_index: u32,
}

/// A managed address's variant-specific live material.
enum ManagedKind {
    Chained {
        branch: u32,
        index: u32,
        pubkey: PublicKey,
        privkey: Option<PrivateKey>,
    },
    Imported {
        pubkey: PublicKey,
        privkey: Option<PrivateKey>,
    },
    Script {
        script_hash: Vec<u8>,
        script: Option<Vec<u8>>,
    },
}

/// A cached, in-memory address. The map key is the raw script bytes.
struct ManagedAddress {
    account: u32,
    kind: ManagedKind,
}

/// The variant-specific public view of a [`ManagedAddress`], returned by
/// [`AddressManager::address`].
#[derive(Debug, Clone)]
pub enum ManagedAddressVariant {
    /// An HD-derived address at `(branch, index)` under the account key.
    Chained {
        /// 0 = external, 1 = internal; other values for color/series branches.
        branch: u32,
        /// Index within the branch.
        index: u32,
    },
    /// A WIF-imported address.
    Imported,
    /// An imported raw script (e.g. a multisig deposit script) address.
    Script {
        /// The script's hash, as stored in the reverse index.
        script_hash: Vec<u8>,
    },
}

/// A managed address's account, variant, and live key material, as returned
/// by [`AddressManager::address`].
#[derive(Debug, Clone)]
pub struct ManagedAddressInfo {
    /// The account this address belongs to.
    pub account: u32,
    /// Which kind of address this is and its variant-specific fields.
    pub variant: ManagedAddressVariant,
    /// The address's public key, for `Chained`/`Imported` variants.
    pub pubkey: Option<PublicKey>,
    /// The address's private key, if the manager currently holds one
    /// (unlocked, and not watching-only).
    pub privkey: Option<PrivateKey>,
}

impl ManagedAddress {
    fn info(&self) -> ManagedAddressInfo {
        match &self.kind {
            ManagedKind::Chained {
                branch,
                index,
                pubkey,
                privkey,
            } => ManagedAddressInfo {
                account: self.account,
                variant: ManagedAddressVariant::Chained {
                    branch: *branch,
                    index: *index,
                },
                pubkey: Some(pubkey.clone()),
                privkey: privkey.clone(),
            },
            ManagedKind::Imported { pubkey, privkey } => ManagedAddressInfo {
                account: self.account,
                variant: ManagedAddressVariant::Imported,
                pubkey: Some(pubkey.clone()),
                privkey: privkey.clone(),
            },
            ManagedKind::Script { script_hash, .. } => ManagedAddressInfo {
                account: self.account,
                variant: ManagedAddressVariant::Script {
                    script_hash: script_hash.clone(),
                },
                pubkey: None,
                privkey: None,
            },
        }
    }
}

/// An entry in the deferred-derivation queue: a chained address generated
/// while locked, whose private half must be derived once the manager is
/// unlocked again.
struct DeferredDerive {
    script: Vec<u8>,
    branch: u32,
    index: u32,
}

struct ManagerState {
    watching_only: bool,
    locked: bool,
    closed: bool,
    master_public: Option<MasterKey>,
    master_private: Option<MasterKey>,
    crypto_pub: Option<CryptoKey>,
    crypto_priv: Option<CryptoKey>,
    crypto_script: Option<CryptoKey>,
    cointype_pub: Option<ExtendedKey>,
    cointype_priv: Option<ExtendedKey>,
    accounts: HashMap<u32, AccountCache>,
    addresses: HashMap<Vec<u8>, ManagedAddress>,
    derive_on_unlock: Vec<DeferredDerive>,
    num_accounts: u32,
}

/// Owns the key hierarchy, address cache, and lock state, generic over the
/// concrete persistence engine.
pub struct AddressManager<S: WalletStore> {
    store: S,
    network: Network,
    secp: Secp256k1<All>,
    state: RwLock<ManagerState>,
}

impl<S: WalletStore> AddressManager<S> {
    /// Create a new store at `path` from a seed and the two passphrases.
    /// Fails `AlreadyExists` if a store is already there; `Unusable seed`
    /// (wrapped as `HdKey`) if the seed cannot derive both branch keys.
    pub fn create(
        path: &Path,
        seed: &[u8],
        pub_passphrase: &[u8],
        priv_passphrase: &[u8],
        network: Network,
    ) -> Result<Self> {
        let secp = Secp256k1::new();
        let store = S::create(path)?;

        let master = ExtendedKey::master_from_seed(seed, network.bitcoin_network)?;
        let coin_prefix = network.bip44_purpose_coin();
        let cointype_key = master
            .derive_path_no_skip(&secp, &coin_prefix)
            .map_err(|e| Error::HdKey(format!("unusable seed: {e}")))?;
        let account_child = crate::keys::account_child(DEFAULT_ACCOUNT)?;
        let account_key = cointype_key
            .derive_child(&secp, account_child)
            .map_err(|e| Error::HdKey(format!("unusable seed: {e}")))?;

        // Seed-quality check: both branch children must derive.
        account_key
            .derive_child(&secp, ChildNumber::from_normal_idx(EXTERNAL_BRANCH).unwrap())
            .map_err(|e| Error::HdKey(format!("unusable seed: {e}")))?;
        account_key
            .derive_child(&secp, ChildNumber::from_normal_idx(INTERNAL_BRANCH).unwrap())
            .map_err(|e| Error::HdKey(format!("unusable seed: {e}")))?;

        let master_pub_key = MasterKey::new(pub_passphrase, ScryptCost::INTERACTIVE)?;
        let master_priv_key = MasterKey::new(priv_passphrase, ScryptCost::INTERACTIVE)?;

        let crypto_pub = CryptoKey::new();
        let crypto_priv = CryptoKey::new();
        let crypto_script = CryptoKey::new();

        let encrypted_crypto_pub = master_pub_key.encrypt(crypto_pub.as_bytes())?;
        let encrypted_crypto_priv = master_priv_key.encrypt(crypto_priv.as_bytes())?;
        let encrypted_crypto_script = master_priv_key.encrypt(crypto_script.as_bytes())?;

        let account_pub = account_key.neuter(&secp);
        let encrypted_account_pub = crypto_pub.encrypt(account_pub.to_base58().as_bytes())?;
        let encrypted_account_priv = crypto_priv.encrypt(account_key.to_base58().as_bytes())?;

        let cointype_pub = cointype_key.neuter(&secp);
        let encrypted_cointype_pub = crypto_pub.encrypt(cointype_pub.to_base58().as_bytes())?;
        let encrypted_cointype_priv = crypto_priv.encrypt(cointype_key.to_base58().as_bytes())?;

        store.update(|txn| {
            txn.put_master_key_params(Some(&master_pub_key.marshal()), Some(&master_priv_key.marshal()))?;
            txn.put_crypto_keys(
                &encrypted_crypto_pub,
                Some(&encrypted_crypto_priv),
                Some(&encrypted_crypto_script),
            )?;
            txn.put_cointype_keys(&encrypted_cointype_pub, Some(&encrypted_cointype_priv))?;
            txn.put_watching_only(false)?;
            let row = AccountRow {
                encrypted_pub_key: encrypted_account_pub.clone(),
                encrypted_priv_key: Some(encrypted_account_priv.clone()),
                next_external_index: 0,
                next_internal_index: 0,
                name: "default".to_string(),
            };
            txn.put_account_info(DEFAULT_ACCOUNT, &row)?;
            txn.put_num_accounts(1)?;
            Ok(())
        })?;

        let mut accounts = HashMap::new();
        accounts.insert(
            DEFAULT_ACCOUNT,
            AccountCache {
                account_pub,
                account_priv: None,
                next_external_index: 0,
                next_internal_index: 0,
            },
        );

        let mut master_pub_key = master_pub_key;
        let mut master_priv_key = master_priv_key;
        let mut crypto_priv_for_lock = crypto_priv;
        let mut crypto_script_for_lock = crypto_script;
        // Returned manager starts locked: zero the private-path material we
        // just generated in memory and keep only the public crypto key live.
        master_priv_key.zero();
        crypto_priv_for_lock.zero();
        crypto_script_for_lock.zero();
        let _ = &mut master_pub_key; // public master key stays live

        Ok(Self {
            store,
            network,
            secp,
            state: RwLock::new(ManagerState {
                watching_only: false,
                locked: true,
                closed: false,
                master_public: Some(master_pub_key),
                master_private: None,
                crypto_pub: Some(crypto_pub),
                crypto_priv: None,
                crypto_script: None,
                cointype_pub: Some(cointype_pub),
                cointype_priv: None,
                accounts,
                addresses: HashMap::new(),
                derive_on_unlock: Vec::new(),
                num_accounts: 1,
            }),
        })
    }

    /// Open an existing store. Fails `NoExist` if absent, `WrongPassphrase`
    /// if `pub_passphrase` does not match.
    pub fn open(path: &Path, pub_passphrase: &[u8], network: Network) -> Result<Self> {
        let secp = Secp256k1::new();
        let store = S::open(path)?;

        let (watching_only, num_accounts, master_pub_params, crypto_pub_encrypted, cointype_pub_encrypted) =
            store.view(|txn| {
                let watching_only = txn.fetch_watching_only()?;
                let num_accounts = txn.fetch_num_accounts()?;
                let (pub_params, _priv_params) = txn.fetch_master_key_params()?;
                let pub_params = pub_params
                    .ok_or_else(|| Error::Database("missing master public key params".to_string()))?;
                let (pub_key, _priv_key, _script_key) = txn.fetch_crypto_keys()?;
                let (cointype_pub, _cointype_priv) = txn.fetch_cointype_keys()?;
                Ok((watching_only, num_accounts, pub_params, pub_key, cointype_pub))
            })?;

        let master_public_params = MasterKeyParams::unmarshal(&master_pub_params)?;
        let master_public = master_public_params.derive_key(pub_passphrase)?;
        let crypto_pub_bytes = master_public.decrypt(&crypto_pub_encrypted)?;
        let crypto_pub = CryptoKey::from_bytes(
            crypto_pub_bytes
                .try_into()
                .map_err(|_| Error::Crypto("public crypto key has wrong length".to_string()))?,
        );

        let cointype_pub_b58 = crypto_pub.decrypt(&cointype_pub_encrypted)?;
        let cointype_pub = ExtendedKey::from_base58(
            std::str::from_utf8(&cointype_pub_b58)
                .map_err(|e| Error::HdKey(format!("coin-type public key: {e}")))?,
        )?;

        let mut accounts = HashMap::new();
        for account in 0..num_accounts {
            let row = store.view(|txn| txn.fetch_account_info(account))?;
            let pub_b58 = crypto_pub.decrypt(&row.encrypted_pub_key)?;
            let account_pub = ExtendedKey::from_base58(
                std::str::from_utf8(&pub_b58)
                    .map_err(|e| Error::HdKey(format!("account public key: {e}")))?,
            )?;
            accounts.insert(
                account,
                AccountCache {
                    account_pub,
                    account_priv: None,
                    next_external_index: row.next_external_index,
                    next_internal_index: row.next_internal_index,
                },
            );
        }

        Ok(Self {
            store,
            network,
            secp,
            state: RwLock::new(ManagerState {
                watching_only,
                locked: true,
                closed: false,
                master_public: Some(master_public),
                master_private: None,
                crypto_pub: Some(crypto_pub),
                crypto_priv: None,
                crypto_script: None,
                cointype_pub: Some(cointype_pub),
                cointype_priv: None,
                accounts,
                addresses: HashMap::new(),
                derive_on_unlock: Vec::new(),
                num_accounts,
            }),
        })
    }

    /// Whether the manager currently holds no private material.
    pub fn is_locked(&self) -> bool {
        self.state.read().locked
    }

    /// Whether this store was exported/opened as watching-only.
    pub fn is_watching_only(&self) -> bool {
        self.state.read().watching_only
    }

    /// Unlock with the private passphrase, deriving the private crypto key
    /// and draining the deferred-derivation queue. On any failure the
    /// manager is re-locked before the error is returned.
    pub fn unlock(&self, passphrase: &[u8]) -> Result<()> {
        let mut state = self.state.write();
        if state.watching_only {
            return Err(Error::WatchingOnly);
        }
        match self.unlock_inner(&mut state, passphrase) {
            Ok(()) => {
                tracing::info!("address manager unlocked");
                Ok(())
            }
            Err(e) => {
                Self::lock_inner(&mut state);
                Err(e)
            }
        }
    }

    fn unlock_inner(&self, state: &mut ManagerState, passphrase: &[u8]) -> Result<()> {
        let (priv_params, crypto_priv_enc, crypto_script_enc, cointype_priv_enc) = self.store.view(|txn| {
            let (_pub_params, priv_params) = txn.fetch_master_key_params()?;
            let priv_params =
                priv_params.ok_or(Error::WatchingOnly)?;
            let (_pub_key, priv_key, script_key) = txn.fetch_crypto_keys()?;
            let (_cointype_pub, cointype_priv) = txn.fetch_cointype_keys()?;
            Ok((priv_params, priv_key, script_key, cointype_priv))
        })?;

        let master_private_params = MasterKeyParams::unmarshal(&priv_params)?;
        let master_private = master_private_params.derive_key(passphrase)?;

        let crypto_priv_enc =
            crypto_priv_enc.ok_or_else(|| Error::Database("missing private crypto key".to_string()))?;
        let crypto_priv_bytes = master_private.decrypt(&crypto_priv_enc)?;
        let crypto_priv = CryptoKey::from_bytes(
            crypto_priv_bytes
                .try_into()
                .map_err(|_| Error::Crypto("private crypto key has wrong length".to_string()))?,
        );

        let crypto_script = match crypto_script_enc {
            Some(enc) => {
                let bytes = master_private.decrypt(&enc)?;
                Some(CryptoKey::from_bytes(bytes.try_into().map_err(|_| {
                    Error::Crypto("script crypto key has wrong length".to_string())
                })?))
            }
            None => None,
        };

        for (account, cache) in state.accounts.iter_mut() {
            let row = self.store.view(|txn| txn.fetch_account_info(*account))?;
            if let Some(encrypted_priv) = row.encrypted_priv_key {
                let priv_b58 = crypto_priv.decrypt(&encrypted_priv)?;
                let account_priv = ExtendedKey::from_base58(
                    std::str::from_utf8(&priv_b58)
                        .map_err(|e| Error::HdKey(format!("account private key: {e}")))?,
                )?;
                cache.account_priv = Some(account_priv);
            }
        }

        let cointype_priv = match cointype_priv_enc {
            Some(enc) => {
                let priv_b58 = crypto_priv.decrypt(&enc)?;
                Some(ExtendedKey::from_base58(
                    std::str::from_utf8(&priv_b58)
                        .map_err(|e| Error::HdKey(format!("coin-type private key: {e}")))?,
                )?)
            }
            None => None,
        };

        state.master_private = Some(master_private);
        state.crypto_priv = Some(crypto_priv);
        state.crypto_script = crypto_script;
        state.cointype_priv = cointype_priv;
        state.locked = false;

        self.drain_deferred_derive(state)?;
        Ok(())
    }

    fn drain_deferred_derive(&self, state: &mut ManagerState) -> Result<()> {
        let queue = std::mem::take(&mut state.derive_on_unlock);
        for entry in queue {
            let Some(addr) = state.addresses.get(&entry.script) else {
                continue;
            };
            let account = addr.account;
            let cache = state
                .accounts
                .get(&account)
                .ok_or(Error::InvalidAccount(account))?;
            let account_priv = cache
                .account_priv
                .as_ref()
                .ok_or(Error::Locked)?
                .clone();
            let branch_key = account_priv.derive_child(
                &self.secp,
                ChildNumber::from_normal_idx(entry.branch)
                    .map_err(|_| Error::InvalidBranch(entry.branch))?,
            )?;
            let child = branch_key.derive_child(
                &self.secp,
                ChildNumber::from_normal_idx(entry.index)
                    .map_err(|_| Error::HdKey("invalid index".to_string()))?,
            )?;
            let mut priv_key = child.to_private_key(&self.secp)?;
            let crypto_priv = state.crypto_priv.as_ref().ok_or(Error::Locked)?;
            let encrypted = crypto_priv.encrypt(&priv_key.to_bytes())?;
            priv_key.inner.non_secure_erase();
            if let Some(addr) = state.addresses.get_mut(&entry.script) {
                if let ManagedKind::Chained { privkey, .. } = &mut addr.kind {
                    *privkey = Some(
                        PrivateKey::from_slice(
                            &crypto_priv.decrypt(&encrypted)?,
                            self.network.bitcoin_network,
                        )
                        .map_err(|e| Error::HdKey(e.to_string()))?,
                    );
                }
            }
        }
        Ok(())
    }

    /// Zero all private material. Public crypto key and master-public key
    /// stay live.
    pub fn lock(&self) {
        let mut state = self.state.write();
        Self::lock_inner(&mut state);
        tracing::info!("address manager locked");
    }

    fn lock_inner(state: &mut ManagerState) {
        if let Some(mut mk) = state.master_private.take() {
            mk.zero();
        }
        if let Some(mut ck) = state.crypto_priv.take() {
            ck.zero();
        }
        if let Some(mut ck) = state.crypto_script.take() {
            ck.zero();
        }
        state.cointype_priv = None;
        for cache in state.accounts.values_mut() {
            cache.account_priv = None;
        }
        for addr in state.addresses.values_mut() {
            match &mut addr.kind {
                ManagedKind::Chained { privkey, .. } | ManagedKind::Imported { privkey, .. } => {
                    if let Some(mut pk) = privkey.take() {
                        pk.inner.non_secure_erase();
                    }
                }
                ManagedKind::Script { script, .. } => {
                    if let Some(mut s) = script.take() {
                        s.zeroize();
                    }
                }
            }
        }
        state.locked = true;
    }

    /// Re-key: create a new master key with new scrypt parameters for
    /// either the public or private path, re-encrypt the matching crypto
    /// key, persist, and only then swap the in-memory key.
    pub fn change_passphrase(&self, new_passphrase: &[u8], private: bool) -> Result<()> {
        let mut state = self.state.write();
        let new_master = MasterKey::new(new_passphrase, ScryptCost::INTERACTIVE)?;
        let new_params = new_master.marshal();

        if private {
            let crypto_priv = state.crypto_priv.as_ref().ok_or(Error::Locked)?;
            let ciphertext = new_master.encrypt(crypto_priv.as_bytes())?;
            self.store
                .update(|txn| txn.put_master_key_params(None, Some(&new_params)))?;
            self.store.update(|txn| {
                let (pub_key, _priv, script_key) = txn.fetch_crypto_keys()?;
                txn.put_crypto_keys(&pub_key, Some(&ciphertext), script_key.as_deref())
            })?;
            state.master_private = Some(new_master);
        } else {
            let crypto_pub = state.crypto_pub.as_ref().ok_or(Error::Locked)?;
            let ciphertext = new_master.encrypt(crypto_pub.as_bytes())?;
            self.store
                .update(|txn| txn.put_master_key_params(Some(&new_params), None))?;
            self.store.update(|txn| {
                let (_pub, priv_key, script_key) = txn.fetch_crypto_keys()?;
                txn.put_crypto_keys(&ciphertext, priv_key.as_deref(), script_key.as_deref())
            })?;
            state.master_public = Some(new_master);
        }
        Ok(())
    }

    fn load_account(&self, state: &mut ManagerState, account: u32) -> Result<()> {
        if state.accounts.contains_key(&account) {
            return Ok(());
        }
        let row = self.store.view(|txn| txn.fetch_account_info(account))?;
        let crypto_pub = state.crypto_pub.as_ref().ok_or(Error::Locked)?;
        let pub_b58 = crypto_pub.decrypt(&row.encrypted_pub_key)?;
        let account_pub = ExtendedKey::from_base58(
            std::str::from_utf8(&pub_b58).map_err(|e| Error::HdKey(e.to_string()))?,
        )?;
        let account_priv = match (&row.encrypted_priv_key, &state.crypto_priv) {
            (Some(enc), Some(crypto_priv)) => {
                let priv_b58 = crypto_priv.decrypt(enc)?;
                Some(ExtendedKey::from_base58(
                    std::str::from_utf8(&priv_b58).map_err(|e| Error::HdKey(e.to_string()))?,
                )?)
            }
            _ => None,
        };
        state.accounts.insert(
            account,
            AccountCache {
                account_pub,
                account_priv,
                next_external_index: row.next_external_index,
                next_internal_index: row.next_internal_index,
            },
        );
        Ok(())
    }

    /// Provision the next sequential account (BIP44 `m/44'/coin_type'/n'`,
    /// where `n` is the current account count) from the coin-type key.
    /// Fails `Locked`/`WatchingOnly` if the manager cannot currently derive
    /// private material. Returns the new account number.
    pub fn new_account(&self, name: &str) -> Result<u32> {
        let mut state = self.state.write();
        if state.watching_only {
            return Err(Error::WatchingOnly);
        }
        let account = state.num_accounts;
        self.provision_account(&mut state, account, name)?;
        Ok(account)
    }

    /// Ensure every account up to and including `account` has been
    /// provisioned, creating any that are missing (in ascending order) from
    /// the coin-type key. Already-provisioned accounts are left untouched.
    /// `name` labels `account` itself; any accounts provisioned only to fill
    /// a gap below it get a generic `account-N` label. Used by wallet
    /// workflows to materialize the reserved issuing/colored accounts on
    /// first use.
    pub fn ensure_account(&self, account: u32, name: &str) -> Result<()> {
        if account > MAX_ACCOUNT_NUM {
            return Err(Error::AccountNumTooHigh(account));
        }
        let mut state = self.state.write();
        if state.watching_only {
            return Err(Error::WatchingOnly);
        }
        while state.num_accounts <= account {
            let next = state.num_accounts;
            if next == account {
                self.provision_account(&mut state, next, name)?;
            } else {
                self.provision_account(&mut state, next, &format!("account-{next}"))?;
            }
        }
        Ok(())
    }

    fn provision_account(&self, state: &mut ManagerState, account: u32, name: &str) -> Result<()> {
        if account > MAX_ACCOUNT_NUM {
            return Err(Error::AccountNumTooHigh(account));
        }
        let cointype_priv = state.cointype_priv.as_ref().ok_or(Error::Locked)?.clone();
        let crypto_pub = state.crypto_pub.as_ref().ok_or(Error::Locked)?;
        let crypto_priv = state.crypto_priv.as_ref().ok_or(Error::Locked)?;

        let account_child = crate::keys::account_child(account)?;
        let account_key = cointype_priv.derive_child(&self.secp, account_child)?;
        let account_pub = account_key.neuter(&self.secp);

        let encrypted_pub = crypto_pub.encrypt(account_pub.to_base58().as_bytes())?;
        let encrypted_priv = crypto_priv.encrypt(account_key.to_base58().as_bytes())?;

        let row = AccountRow {
            encrypted_pub_key: encrypted_pub,
            encrypted_priv_key: Some(encrypted_priv),
            next_external_index: 0,
            next_internal_index: 0,
            name: name.to_string(),
        };
        self.store.update(|txn| {
            txn.put_account_info(account, &row)?;
            txn.put_num_accounts(account + 1)
        })?;

        state.accounts.insert(
            account,
            AccountCache {
                account_pub,
                account_priv: Some(account_key),
                next_external_index: 0,
                next_internal_index: 0,
            },
        );
        state.num_accounts = account + 1;
        tracing::info!(account, "account provisioned");
        Ok(())
    }

    /// Generate `n` new external (branch 0) chained addresses for `account`.
    pub fn next_external_addresses(&self, account: u32, n: u32) -> Result<Vec<Vec<u8>>> {
        self.next_chained_addresses(account, n, EXTERNAL_BRANCH)
    }

    /// Generate `n` new internal (branch 1, change-like) chained addresses.
    pub fn next_internal_addresses(&self, account: u32, n: u32) -> Result<Vec<Vec<u8>>> {
        self.next_chained_addresses(account, n, INTERNAL_BRANCH)
    }

    /// Generate `n` new chained addresses for `account` on an arbitrary
    /// BIP32 branch, for callers (e.g. a color scheme's own change branch)
    /// that can't be expressed as plain external/internal.
    pub fn next_addresses_on_branch(&self, account: u32, n: u32, branch: u32) -> Result<Vec<Vec<u8>>> {
        self.next_chained_addresses(account, n, branch)
    }

    fn next_chained_addresses(&self, account: u32, n: u32, branch: u32) -> Result<Vec<Vec<u8>>> {
        if account > MAX_ACCOUNT_NUM {
            return Err(Error::AccountNumTooHigh(account));
        }
        let mut state = self.state.write();
        self.load_account(&mut state, account)?;

        let mut idx = {
            let cache = state.accounts.get(&account).ok_or(Error::InvalidAccount(account))?;
            if branch == EXTERNAL_BRANCH {
                cache.next_external_index
            } else {
                cache.next_internal_index
            }
        };
        if idx as u64 + n as u64 > MAX_ADDRESSES_PER_ACCOUNT as u64 {
            return Err(Error::TooManyAddresses);
        }

        let branch_child = ChildNumber::from_normal_idx(branch).expect("branch 0/1 always valid");
        let account_pub = {
            let cache = state.accounts.get(&account).unwrap();
            cache.account_pub.clone()
        };
        let branch_pub = account_pub.derive_child(&self.secp, branch_child)?;

        let mut new_scripts = Vec::with_capacity(n as usize);
        let mut new_rows: Vec<(Vec<u8>, u32)> = Vec::with_capacity(n as usize);
        let locked = state.locked;

        for _ in 0..n {
            let (child_pub, used_idx) = loop {
                let child_number = ChildNumber::from_normal_idx(idx)
                    .map_err(|_| Error::HdKey(format!("invalid index {idx}")))?;
                match branch_pub.derive_child(&self.secp, child_number) {
                    Ok(child) => break (child, idx),
                    Err(e) if e.is_invalid_child() => {
                        idx += 1;
                        continue;
                    }
                    Err(e) => return Err(e),
                }
            };
            idx = used_idx + 1;

            let pubkey = child_pub.public_key(&self.secp);
            let address = BtcAddress::p2pkh(pubkey, self.network.bitcoin_network);
            let script: ScriptBuf = address.script_pubkey();
            let script_bytes = script.to_bytes();

            new_scripts.push(script_bytes.clone());
            new_rows.push((script_bytes, used_idx));
        }

        let add_time = now_unix();
        self.store.update(|txn| {
            for (script_bytes, used_idx) in &new_rows {
                txn.put_chained_address(
                    script_bytes,
                    account,
                    add_time,
                    SyncStatus::Full,
                    branch,
                    *used_idx,
                )?;
            }
            let row = txn.fetch_account_info(account)?;
            let mut row = row;
            if branch == EXTERNAL_BRANCH {
                row.next_external_index = idx;
            } else {
                row.next_internal_index = idx;
            }
            txn.put_account_info(account, &row)
        })?;

        for (script_bytes, used_idx) in &new_rows {
            let pubkey = {
                let child_number = ChildNumber::from_normal_idx(*used_idx).unwrap();
                branch_pub
                    .derive_child(&self.secp, child_number)
                    .expect("already derived above")
                    .public_key(&self.secp)
            };
            let entry = ManagedAddress {
                account,
                kind: ManagedKind::Chained {
                    branch,
                    index: *used_idx,
                    pubkey,
                    privkey: None,
                },
            };
            state.addresses.insert(script_bytes.clone(), entry);
            if locked {
                state.derive_on_unlock.push(DeferredDerive {
                    script: script_bytes.clone(),
                    branch,
                    index: *used_idx,
                });
            }
        }
        {
            let cache = state.accounts.get_mut(&account).unwrap();
            if branch == EXTERNAL_BRANCH {
                cache.next_external_index = idx;
            } else {
                cache.next_internal_index = idx;
            }
        }
        if !locked {
            self.drain_deferred_derive(&mut state)?;
        }

        Ok(new_scripts)
    }

    /// Look up a managed address by its script bytes, loading and caching it
    /// from the store if not already cached, and returning its account,
    /// variant, and live key material.
    pub fn address(&self, script: &[u8]) -> Result<ManagedAddressInfo> {
        let mut state = self.state.write();
        if let Some(cached) = state.addresses.get(script) {
            return Ok(cached.info());
        }
        let hash = script_hash(script);
        let row = self.store.view(|txn| txn.fetch_address(&hash))?;
        let account = row.account;
        self.load_account(&mut state, account)?;
        let entry = match row.variant {
            AddressVariant::Chained { branch, index } => {
                let cache = state.accounts.get(&account).ok_or(Error::InvalidAccount(account))?;
                let branch_pub = cache
                    .account_pub
                    .derive_child(&self.secp, ChildNumber::from_normal_idx(branch).unwrap())?;
                let child = branch_pub.derive_child(&self.secp, ChildNumber::from_normal_idx(index).unwrap())?;
                let pubkey = child.public_key(&self.secp);
                ManagedAddress {
                    account,
                    kind: ManagedKind::Chained {
                        branch,
                        index,
                        pubkey,
                        privkey: None,
                    },
                }
            }
            AddressVariant::Imported {
                encrypted_pubkey, ..
            } => {
                let crypto_pub = state.crypto_pub.as_ref().ok_or(Error::Locked)?;
                let pub_bytes = crypto_pub.decrypt(&encrypted_pubkey)?;
                let pubkey = PublicKey::from_slice(&pub_bytes)
                    .map_err(|e| Error::InvalidKeyType(e.to_string()))?;
                ManagedAddress {
                    account,
                    kind: ManagedKind::Imported {
                        pubkey,
                        privkey: None,
                    },
                }
            }
            AddressVariant::Script {
                encrypted_script_hash,
                ..
            } => {
                let crypto_pub = state.crypto_pub.as_ref().ok_or(Error::Locked)?;
                let hash_bytes = crypto_pub.decrypt(&encrypted_script_hash)?;
                ManagedAddress {
                    account,
                    kind: ManagedKind::Script {
                        script_hash: hash_bytes,
                        script: None,
                    },
                }
            }
        };
        let info = entry.info();
        state.addresses.insert(script.to_vec(), entry);
        Ok(info)
    }

    /// Update an address's sync status. Not implemented: no sync design is
    /// specified yet.
    pub fn set_sync_status(&self, _script: &[u8], _status: SyncStatus) -> Result<()> {
        Err(Error::Unimplemented("set_sync_status"))
    }

    /// Record the chain height/hash an address (or the whole manager) has
    /// synced to. Not implemented: no sync design is specified yet.
    pub fn set_synced_to(&self, _height: u32, _block_hash: &[u8; 32]) -> Result<()> {
        Err(Error::Unimplemented("set_synced_to"))
    }

    /// Import a WIF private key under the reserved imported-addresses
    /// account.
    pub fn import_private_key(&self, wif: &str) -> Result<Vec<u8>> {
        let mut state = self.state.write();
        if state.watching_only {
            return Err(Error::WatchingOnly);
        }
        if state.locked {
            return Err(Error::Locked);
        }
        let priv_key = PrivateKey::from_wif(wif).map_err(|e| Error::InvalidKeyType(e.to_string()))?;
        if priv_key.network != bitcoin::NetworkKind::from(self.network.bitcoin_network) {
            return Err(Error::WrongNet);
        }
        let pubkey = priv_key.public_key(&self.secp);
        let address = BtcAddress::p2pkh(pubkey, self.network.bitcoin_network);
        let script = address.script_pubkey().to_bytes();

        if state.addresses.contains_key(&script) {
            return Err(Error::Duplicate("address already imported".to_string()));
        }

        let crypto_pub = state.crypto_pub.as_ref().ok_or(Error::Locked)?;
        let crypto_priv = state.crypto_priv.as_ref().ok_or(Error::Locked)?;
        let encrypted_pubkey = crypto_pub.encrypt(&pubkey.to_bytes())?;
        let encrypted_privkey = crypto_priv.encrypt(&priv_key.to_bytes())?;

        let add_time = now_unix();
        self.store.update(|txn| {
            txn.put_imported_address(
                &script,
                IMPORTED_ADDR_ACCOUNT,
                add_time,
                SyncStatus::Full,
                &encrypted_pubkey,
                &encrypted_privkey,
            )
        })?;

        state.addresses.insert(
            script.clone(),
            ManagedAddress {
                account: IMPORTED_ADDR_ACCOUNT,
                kind: ManagedKind::Imported {
                    pubkey,
                    privkey: Some(priv_key),
                },
            },
        );
        Ok(script)
    }

    /// Import a raw script (e.g. a multisig deposit script) as a managed
    /// script address.
    pub fn import_script(&self, script: &[u8]) -> Result<Vec<u8>> {
        let mut state = self.state.write();
        if state.watching_only {
            return Err(Error::WatchingOnly);
        }
        if state.locked {
            return Err(Error::Locked);
        }
        let script_buf = ScriptBuf::from_bytes(script.to_vec());
        let pkscript = ScriptBuf::new_p2sh(&script_buf.script_hash());
        let pkscript_bytes = pkscript.to_bytes();
        if state.addresses.contains_key(&pkscript_bytes) {
            return Err(Error::Duplicate("script already imported".to_string()));
        }

        let hash_bytes = script_buf.script_hash().to_byte_array().to_vec();
        let crypto_pub = state.crypto_pub.as_ref().ok_or(Error::Locked)?;
        let crypto_script = state.crypto_script.as_ref().ok_or(Error::Locked)?;
        let encrypted_hash = crypto_pub.encrypt(&hash_bytes)?;
        let encrypted_script = crypto_script.encrypt(script)?;

        let add_time = now_unix();
        self.store.update(|txn| {
            txn.put_script_address(
                &pkscript_bytes,
                DEFAULT_ACCOUNT,
                add_time,
                SyncStatus::Full,
                &encrypted_hash,
                &encrypted_script,
            )
        })?;

        state.addresses.insert(
            pkscript_bytes.clone(),
            ManagedAddress {
                account: DEFAULT_ACCOUNT,
                kind: ManagedKind::Script {
                    script_hash: hash_bytes,
                    script: Some(script.to_vec()),
                },
            },
        );
        Ok(pkscript_bytes)
    }

    /// Export a watching-only copy of this store to `new_path`: the copy is
    /// taken under a read transaction against `self`, then private material
    /// is swept from the copy in a single write transaction.
    pub fn export_watching_only(&self, new_path: &Path, pub_passphrase: &[u8]) -> Result<Self>
    where
        Self: Sized,
    {
        if new_path.exists() {
            return Err(Error::AlreadyExists);
        }
        let copy = self.store.export_copy(new_path)?;
        copy.update(|txn| {
            txn.delete_private_keys()?;
            txn.put_watching_only(true)
        })?;
        drop(copy);
        Self::open(new_path, pub_passphrase, self.network)
    }

    /// The network this manager derives addresses for.
    pub fn network(&self) -> Network {
        self.network
    }

    /// The underlying persistence engine, for sibling modules (voting pool,
    /// color ledger, workflows) that need to run their own transactions
    /// against the same store.
    pub fn store(&self) -> &S {
        &self.store
    }

    /// The secp256k1 context shared by every key operation.
    pub fn secp(&self) -> &Secp256k1<All> {
        &self.secp
    }

    /// Encrypt bytes under the live public crypto key. Available whenever
    /// the manager is open (locked or not).
    pub fn encrypt_public(&self, data: &[u8]) -> Result<Vec<u8>> {
        let state = self.state.read();
        let crypto_pub = state.crypto_pub.as_ref().ok_or(Error::Locked)?;
        crypto_pub.encrypt(data)
    }

    /// Decrypt bytes previously produced by [`Self::encrypt_public`].
    pub fn decrypt_public(&self, data: &[u8]) -> Result<Vec<u8>> {
        let state = self.state.read();
        let crypto_pub = state.crypto_pub.as_ref().ok_or(Error::Locked)?;
        crypto_pub.decrypt(data)
    }

    /// Encrypt bytes under the private crypto key. Fails `Locked` unless the
    /// manager is currently unlocked.
    pub fn encrypt_private(&self, data: &[u8]) -> Result<Vec<u8>> {
        let state = self.state.read();
        let crypto_priv = state.crypto_priv.as_ref().ok_or(Error::Locked)?;
        crypto_priv.encrypt(data)
    }

    /// Decrypt bytes previously produced by [`Self::encrypt_private`].
    pub fn decrypt_private(&self, data: &[u8]) -> Result<Vec<u8>> {
        let state = self.state.read();
        let crypto_priv = state.crypto_priv.as_ref().ok_or(Error::Locked)?;
        crypto_priv.decrypt(data)
    }

    /// Encrypt bytes under the script crypto key. Fails `Locked` unless the
    /// manager is currently unlocked.
    pub fn encrypt_script_bytes(&self, data: &[u8]) -> Result<Vec<u8>> {
        let state = self.state.read();
        let crypto_script = state.crypto_script.as_ref().ok_or(Error::Locked)?;
        crypto_script.encrypt(data)
    }

    /// Decrypt bytes previously produced by [`Self::encrypt_script_bytes`].
    pub fn decrypt_script_bytes(&self, data: &[u8]) -> Result<Vec<u8>> {
        let state = self.state.read();
        let crypto_script = state.crypto_script.as_ref().ok_or(Error::Locked)?;
        crypto_script.decrypt(data)
    }

    /// Derive the private child key at `(account, branch, index)` from the
    /// account's cached private extended key, loading the account from the
    /// store first if it is not yet cached. Used by the voting pool
    /// (`EmpowerSeries`' neuter check aside) and wallet workflows' `Sign`.
    pub fn derive_private_child(
        &self,
        account: u32,
        branch: u32,
        index: u32,
    ) -> Result<PrivateKey> {
        let mut state = self.state.write();
        self.load_account(&mut state, account)?;
        let cache = state
            .accounts
            .get(&account)
            .ok_or(Error::InvalidAccount(account))?;
        let account_priv = cache.account_priv.as_ref().ok_or(Error::Locked)?;
        let branch_key = account_priv.derive_child(
            &self.secp,
            ChildNumber::from_normal_idx(branch).map_err(|_| Error::InvalidBranch(branch))?,
        )?;
        let child = branch_key.derive_child(
            &self.secp,
            ChildNumber::from_normal_idx(index).map_err(|_| Error::HdKey("invalid index".to_string()))?,
        )?;
        child.to_private_key(&self.secp)
    }

    /// The account's current public extended key, loading it from the store
    /// first if it is not yet cached.
    pub fn account_public_key(&self, account: u32) -> Result<ExtendedKey> {
        let mut state = self.state.write();
        self.load_account(&mut state, account)?;
        Ok(state.accounts.get(&account).unwrap().account_pub.clone())
    }

    /// Close the manager: lock (unless watching-only), zero the public
    /// crypto/master keys, and close the store.
    pub fn close(self) -> Result<()> {
        {
            let mut state = self.state.write();
            if !state.watching_only && !state.locked {
                Self::lock_inner(&mut state);
            }
            if let Some(mut ck) = state.crypto_pub.take() {
                ck.zero();
            }
            if let Some(mut mk) = state.master_public.take() {
                mk.zero();
            }
            state.closed = true;
        }
        self.store.close()
    }
}
