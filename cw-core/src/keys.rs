//! HD extended keys: a thin wrapper over `bitcoin::bip32` that folds BIP32's
//! "invalid child" case into the taxonomy's `HdKey` kind so callers can
//! detect and skip it, and that treats private/public halves uniformly where
//! a caller doesn't care which one it's holding.

use std::str::FromStr;

use bitcoin::bip32::{ChildNumber, Xpriv, Xpub};
use bitcoin::secp256k1::{All, Secp256k1};
use bitcoin::{Network as BtcNetwork, PrivateKey, PublicKey};

use crate::error::{Error, Result};

/// A hierarchical key carrying either private+public or public-only
/// material.
#[derive(Debug, Clone)]
pub enum ExtendedKey {
    /// Private extended key (has a public half implicitly).
    Private(Xpriv),
    /// Public-only extended key.
    Public(Xpub),
}

impl ExtendedKey {
    /// Derive the master extended private key from a seed.
    pub fn master_from_seed(seed: &[u8], network: BtcNetwork) -> Result<Self> {
        let xpriv = Xpriv::new_master(network, seed)
            .map_err(|e| Error::HdKey(format!("master key from seed: {e}")))?;
        Ok(ExtendedKey::Private(xpriv))
    }

    /// True if this key carries private material.
    pub fn is_private(&self) -> bool {
        matches!(self, ExtendedKey::Private(_))
    }

    /// Derive a single child. Returns `Error::HdKey("invalid child...")` on
    /// the (astronomically rare) invalid-child case so callers implementing
    /// the skip-and-retry discipline can detect it uniformly.
    pub fn derive_child(&self, secp: &Secp256k1<All>, child: ChildNumber) -> Result<Self> {
        match self {
            ExtendedKey::Private(xpriv) => xpriv
                .derive_priv(secp, &[child])
                .map(ExtendedKey::Private)
                .map_err(invalid_child_err),
            ExtendedKey::Public(xpub) => {
                if child.is_hardened() {
                    return Err(Error::HdKey(
                        "cannot derive a hardened child from a public key".to_string(),
                    ));
                }
                xpub.derive_pub(secp, &[child])
                    .map(ExtendedKey::Public)
                    .map_err(invalid_child_err)
            }
        }
    }

    /// Derive along a full path, failing on the first invalid child (no
    /// skip: used by contexts like series deposit-script derivation, which
    /// must fail loudly rather than silently drift to a different index).
    pub fn derive_path_no_skip(
        &self,
        secp: &Secp256k1<All>,
        path: &[ChildNumber],
    ) -> Result<Self> {
        let mut cur = self.clone();
        for child in path {
            cur = cur
                .derive_child(secp, *child)
                .map_err(|_| Error::KeyChain(format!("invalid child at {child}")))?;
        }
        Ok(cur)
    }

    /// Derive along a full path with the skip-on-invalid-child discipline:
    /// each invalid index is simply skipped and the next index is tried at
    /// the *last* path component.
    pub fn derive_child_skip_invalid(
        &self,
        secp: &Secp256k1<All>,
        prefix: &[ChildNumber],
        mut index: u32,
        hardened: bool,
    ) -> Result<(Self, u32)> {
        let base = if prefix.is_empty() {
            self.clone()
        } else {
            self.derive_path_no_skip(secp, prefix)
                .map_err(|e| Error::HdKey(e.to_string()))?
        };
        loop {
            let child = if hardened {
                ChildNumber::from_hardened_idx(index)
            } else {
                ChildNumber::from_normal_idx(index)
            }
            .map_err(|e| Error::HdKey(format!("invalid index {index}: {e}")))?;
            match base.derive_child(secp, child) {
                Ok(derived) => return Ok((derived, index)),
                Err(e) if e.is_invalid_child() => {
                    index = index
                        .checked_add(1)
                        .ok_or_else(|| Error::HdKey("index exhausted".to_string()))?;
                    continue;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Neuter a private key down to its public half. A public key neuters to
    /// itself.
    pub fn neuter(&self, secp: &Secp256k1<All>) -> Self {
        match self {
            ExtendedKey::Private(xpriv) => ExtendedKey::Public(Xpub::from_priv(secp, xpriv)),
            ExtendedKey::Public(xpub) => ExtendedKey::Public(*xpub),
        }
    }

    /// The compressed secp256k1 public key for this node.
    pub fn public_key(&self, secp: &Secp256k1<All>) -> PublicKey {
        match self {
            ExtendedKey::Private(xpriv) => PublicKey::new(xpriv.to_priv(secp).public_key(secp)),
            ExtendedKey::Public(xpub) => PublicKey::new(xpub.to_pub(secp)),
        }
    }

    /// The WIF-encodable private key, if this node carries private material.
    pub fn to_private_key(&self, secp: &Secp256k1<All>) -> Result<PrivateKey> {
        match self {
            ExtendedKey::Private(xpriv) => Ok(xpriv.to_priv(secp)),
            ExtendedKey::Public(_) => Err(Error::KeyIsPublic),
        }
    }

    /// The standard base58check string form (`xprv...`/`xpub...`).
    pub fn to_base58(&self) -> String {
        match self {
            ExtendedKey::Private(xpriv) => xpriv.to_string(),
            ExtendedKey::Public(xpub) => xpub.to_string(),
        }
    }

    /// Parse a base58check extended key string, accepting either a private
    /// or public form.
    pub fn from_base58(s: &str) -> Result<Self> {
        if let Ok(xpriv) = Xpriv::from_str(s) {
            return Ok(ExtendedKey::Private(xpriv));
        }
        let xpub =
            Xpub::from_str(s).map_err(|e| Error::HdKey(format!("parse extended key: {e}")))?;
        Ok(ExtendedKey::Public(xpub))
    }

    /// Parse, refusing a private key (used where an operation requires a
    /// public extended key, e.g. `CreateSeries`).
    pub fn from_base58_public_only(s: &str) -> Result<Self> {
        match Self::from_base58(s)? {
            ExtendedKey::Private(_) => Err(Error::KeyIsPrivate),
            pk @ ExtendedKey::Public(_) => Ok(pk),
        }
    }

    /// Parse, refusing a public key (used by `EmpowerSeries`).
    pub fn from_base58_private_only(s: &str) -> Result<Self> {
        match Self::from_base58(s)? {
            sk @ ExtendedKey::Private(_) => Ok(sk),
            ExtendedKey::Public(_) => Err(Error::KeyIsPublic),
        }
    }
}

fn invalid_child_err(e: bitcoin::bip32::Error) -> Error {
    use bitcoin::bip32::Error as Bip32Error;
    match e {
        Bip32Error::InvalidTweak(_) => Error::HdKey(format!("invalid child: {e}")),
        other => Error::HdKey(other.to_string()),
    }
}

/// The BIP44 `account'` child number for a given account index.
pub fn account_child(account: u32) -> Result<ChildNumber> {
    ChildNumber::from_hardened_idx(account).map_err(|_| Error::AccountNumTooHigh(account))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secp() -> Secp256k1<All> {
        Secp256k1::new()
    }

    #[test]
    fn test_master_from_seed_is_private() {
        let seed = [0u8; 32];
        let key = ExtendedKey::master_from_seed(&seed, BtcNetwork::Bitcoin).unwrap();
        assert!(key.is_private());
    }

    #[test]
    fn test_neuter_then_derive_matches_private_derive_public() {
        let secp = secp();
        let seed = [7u8; 32];
        let master = ExtendedKey::master_from_seed(&seed, BtcNetwork::Bitcoin).unwrap();
        let child = ChildNumber::from_normal_idx(3).unwrap();

        let priv_child = master.derive_child(&secp, child).unwrap();
        let pub_child_via_neuter = priv_child.neuter(&secp);

        let pub_master = master.neuter(&secp);
        let pub_child_direct = pub_master.derive_child(&secp, child).unwrap();

        assert_eq!(
            pub_child_via_neuter.public_key(&secp),
            pub_child_direct.public_key(&secp)
        );
    }

    #[test]
    fn test_base58_round_trip() {
        let seed = [9u8; 32];
        let master = ExtendedKey::master_from_seed(&seed, BtcNetwork::Bitcoin).unwrap();
        let encoded = master.to_base58();
        let parsed = ExtendedKey::from_base58(&encoded).unwrap();
        assert!(parsed.is_private());
        assert_eq!(parsed.to_base58(), encoded);
    }

    #[test]
    fn test_public_only_parser_refuses_private() {
        let seed = [1u8; 32];
        let master = ExtendedKey::master_from_seed(&seed, BtcNetwork::Bitcoin).unwrap();
        let encoded = master.to_base58();
        assert!(ExtendedKey::from_base58_public_only(&encoded).is_err());
    }
}
