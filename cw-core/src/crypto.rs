//! The crypto envelope: scrypt-derived master keys wrapping ChaCha20-Poly1305
//! crypto keys, which in turn encrypt everything else.
//!
//! Master keys never encrypt payloads directly; they only protect the three
//! crypto keys (public, private, script). All ciphertext produced here is a
//! 12-byte random nonce followed by the AEAD ciphertext-with-tag.

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key as AeadKey, Nonce};
use rand::RngCore;
use scrypt::Params as ScryptParams;
use sha2::{Digest, Sha256};
use zeroize::{Zeroize, Zeroizing};

use crate::error::{Error, Result};

const SALT_LEN: usize = 32;
const DIGEST_LEN: usize = 32;
const KEY_LEN: usize = 32;
const NONCE_LEN: usize = 12;

/// The scrypt cost parameters, persisted alongside the salt as part of a
/// master key's marshaled form.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScryptCost {
    /// log2(N).
    pub log_n: u8,
    /// Block size parameter.
    pub r: u32,
    /// Parallelization parameter.
    pub p: u32,
}

impl ScryptCost {
    /// Interactive-login cost parameters, suitable for tests and CLIs that
    /// do not want multi-second unlocks.
    pub const INTERACTIVE: ScryptCost = ScryptCost {
        log_n: 14,
        r: 8,
        p: 1,
    };

    fn to_scrypt_params(self) -> Result<ScryptParams> {
        ScryptParams::new(self.log_n, self.r, self.p, KEY_LEN)
            .map_err(|e| Error::Crypto(format!("invalid scrypt params: {e}")))
    }
}

/// A master key's persisted parameters: enough to re-derive the key from a
/// passphrase, plus a digest that lets `derive_key` detect a wrong
/// passphrase without needing to attempt a downstream AEAD decrypt.
#[derive(Debug, Clone)]
pub struct MasterKeyParams {
    salt: [u8; SALT_LEN],
    cost: ScryptCost,
    digest: [u8; DIGEST_LEN],
}

impl MasterKeyParams {
    /// Serialize to bytes: `salt(32) || log_n(1) || r(4 LE) || p(4 LE) ||
    /// digest(32)`.
    pub fn marshal(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(SALT_LEN + 1 + 4 + 4 + DIGEST_LEN);
        out.extend_from_slice(&self.salt);
        out.push(self.cost.log_n);
        out.extend_from_slice(&self.cost.r.to_le_bytes());
        out.extend_from_slice(&self.cost.p.to_le_bytes());
        out.extend_from_slice(&self.digest);
        out
    }

    /// Parse the bytes produced by [`Self::marshal`].
    pub fn unmarshal(buf: &[u8]) -> Result<Self> {
        let want = SALT_LEN + 1 + 4 + 4 + DIGEST_LEN;
        if buf.len() != want {
            return Err(Error::Serialization(format!(
                "master key params: expected {want} bytes, got {}",
                buf.len()
            )));
        }
        let mut salt = [0u8; SALT_LEN];
        salt.copy_from_slice(&buf[0..SALT_LEN]);
        let log_n = buf[SALT_LEN];
        let r = u32::from_le_bytes(buf[SALT_LEN + 1..SALT_LEN + 5].try_into().unwrap());
        let p = u32::from_le_bytes(buf[SALT_LEN + 5..SALT_LEN + 9].try_into().unwrap());
        let mut digest = [0u8; DIGEST_LEN];
        digest.copy_from_slice(&buf[SALT_LEN + 9..]);
        Ok(Self {
            salt,
            cost: ScryptCost { log_n, r, p },
            digest,
        })
    }

    /// Re-derive the master key from a passphrase, failing with
    /// `WrongPassphrase` if the digest does not match.
    pub fn derive_key(&self, passphrase: &[u8]) -> Result<MasterKey> {
        let key = scrypt_derive(passphrase, &self.salt, self.cost)?;
        if digest_of(&key, &self.salt) != self.digest {
            return Err(Error::WrongPassphrase);
        }
        Ok(MasterKey {
            key: Zeroizing::new(key),
            params: self.clone(),
        })
    }
}

/// A live, passphrase-derived master key. Exists in memory only while needed
/// (private-path: while unlocked; public-path: for the duration of a derive
/// call plus however long the caller keeps it live).
pub struct MasterKey {
    key: Zeroizing<[u8; KEY_LEN]>,
    params: MasterKeyParams,
}

impl MasterKey {
    /// Derive a brand new master key from a passphrase and scrypt cost,
    /// generating a fresh random salt.
    pub fn new(passphrase: &[u8], cost: ScryptCost) -> Result<Self> {
        let mut salt = [0u8; SALT_LEN];
        rand::thread_rng().fill_bytes(&mut salt);
        let key = scrypt_derive(passphrase, &salt, cost)?;
        let digest = digest_of(&key, &salt);
        Ok(Self {
            key: Zeroizing::new(key),
            params: MasterKeyParams { salt, cost, digest },
        })
    }

    /// The persisted parameters (salt, cost, digest) for this key.
    pub fn marshal(&self) -> Vec<u8> {
        self.params.marshal()
    }

    /// Encrypt a crypto key's raw bytes under this master key.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        aead_encrypt(&self.key, plaintext)
    }

    /// Decrypt bytes previously produced by [`Self::encrypt`].
    pub fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        aead_decrypt(&self.key, ciphertext)
    }

    /// Zero the key material in place. After this call the key is unusable;
    /// callers drop it immediately after.
    pub fn zero(&mut self) {
        self.key.zeroize();
    }
}

fn scrypt_derive(passphrase: &[u8], salt: &[u8], cost: ScryptCost) -> Result<[u8; KEY_LEN]> {
    let params = cost.to_scrypt_params()?;
    let mut out = [0u8; KEY_LEN];
    scrypt::scrypt(passphrase, salt, &params, &mut out)
        .map_err(|e| Error::Crypto(format!("scrypt: {e}")))?;
    Ok(out)
}

fn digest_of(key: &[u8; KEY_LEN], salt: &[u8]) -> [u8; DIGEST_LEN] {
    let mut hasher = Sha256::new();
    hasher.update(key);
    hasher.update(salt);
    hasher.finalize().into()
}

/// One of the three fixed-size symmetric keys (public, private, script) used
/// to encrypt payloads. Never encrypts or is encrypted by a passphrase
/// directly — only by a [`MasterKey`].
pub struct CryptoKey {
    key: Zeroizing<[u8; KEY_LEN]>,
}

impl CryptoKey {
    /// Generate a fresh random crypto key.
    pub fn new() -> Self {
        let mut bytes = [0u8; KEY_LEN];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self {
            key: Zeroizing::new(bytes),
        }
    }

    /// Reconstruct a crypto key from its raw bytes (after decrypting it with
    /// a master key).
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self {
            key: Zeroizing::new(bytes),
        }
    }

    /// The raw key bytes, to be encrypted under a master key for storage.
    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.key
    }

    /// Encrypt arbitrary payload bytes.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        aead_encrypt(&self.key, plaintext)
    }

    /// Decrypt bytes previously produced by [`Self::encrypt`].
    pub fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        aead_decrypt(&self.key, ciphertext)
    }

    /// Zero the key material in place.
    pub fn zero(&mut self) {
        self.key.zeroize();
    }
}

impl Default for CryptoKey {
    fn default() -> Self {
        Self::new()
    }
}

fn aead_encrypt(key: &[u8; KEY_LEN], plaintext: &[u8]) -> Result<Vec<u8>> {
    let cipher = ChaCha20Poly1305::new(AeadKey::from_slice(key));
    let mut nonce_bytes = [0u8; NONCE_LEN];
    rand::thread_rng().fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);
    let ciphertext = cipher
        .encrypt(nonce, plaintext)
        .map_err(|e| Error::Crypto(format!("aead encrypt: {e}")))?;
    let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

fn aead_decrypt(key: &[u8; KEY_LEN], data: &[u8]) -> Result<Vec<u8>> {
    if data.len() < NONCE_LEN {
        return Err(Error::Crypto("ciphertext too short".to_string()));
    }
    let (nonce_bytes, ciphertext) = data.split_at(NONCE_LEN);
    let cipher = ChaCha20Poly1305::new(AeadKey::from_slice(key));
    let nonce = Nonce::from_slice(nonce_bytes);
    cipher
        .decrypt(nonce, ciphertext)
        .map_err(|_| Error::Crypto("aead decrypt failed".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_master_key_round_trip_and_wrong_passphrase() {
        let mk = MasterKey::new(b"hunter2", ScryptCost::INTERACTIVE).unwrap();
        let marshaled = mk.marshal();
        let params = MasterKeyParams::unmarshal(&marshaled).unwrap();

        let derived = params.derive_key(b"hunter2").unwrap();
        let ct = derived.encrypt(b"payload").unwrap();
        assert_eq!(mk.decrypt(&ct).unwrap(), b"payload");

        let err = params.derive_key(b"wrong").unwrap_err();
        assert!(matches!(err, Error::WrongPassphrase));
    }

    #[test]
    fn test_crypto_key_encrypt_decrypt() {
        let key = CryptoKey::new();
        let ct = key.encrypt(b"secret data").unwrap();
        assert_ne!(ct, b"secret data");
        assert_eq!(key.decrypt(&ct).unwrap(), b"secret data");
    }

    #[test]
    fn test_crypto_key_zero_breaks_decryption() {
        let mut key = CryptoKey::new();
        let ct = key.encrypt(b"secret data").unwrap();
        key.zero();
        assert!(key.decrypt(&ct).is_err());
    }

    #[test]
    fn test_tampered_ciphertext_rejected() {
        let key = CryptoKey::new();
        let mut ct = key.encrypt(b"secret data").unwrap();
        let last = ct.len() - 1;
        ct[last] ^= 0x01;
        assert!(key.decrypt(&ct).is_err());
    }
}
