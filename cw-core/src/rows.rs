//! On-disk row types and their exact byte layouts.
//!
//! Every layout here is hand-packed rather than derived, the way a wire
//! format with an external contract has to be: the bytes are the contract,
//! not an implementation detail a derive macro is free to change.

use crate::error::{Error, Result};

/// Address-row type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AddressTag {
    /// A chained (BIP44 branch/index) address.
    Chained = 0,
    /// An imported private key.
    Imported = 1,
    /// An imported/derived script (e.g. a multisig deposit script).
    Script = 2,
}

impl AddressTag {
    fn from_u8(b: u8) -> Result<Self> {
        match b {
            0 => Ok(AddressTag::Chained),
            1 => Ok(AddressTag::Imported),
            2 => Ok(AddressTag::Script),
            other => Err(Error::Database(format!("unknown address tag {other}"))),
        }
    }
}

/// Sync status of an address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SyncStatus {
    /// Not yet observed on chain.
    Unsynced = 0,
    /// Fully synced.
    Full = 1,
}

impl SyncStatus {
    fn from_u8(b: u8) -> Result<Self> {
        match b {
            0 => Ok(SyncStatus::Unsynced),
            1 => Ok(SyncStatus::Full),
            other => Err(Error::Database(format!("unknown sync status {other}"))),
        }
    }
}

/// The variant-specific payload of an address row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddressVariant {
    /// `branch` (0 external, 1 internal) + `index`.
    Chained { branch: u32, index: u32 },
    /// Encrypted public key bytes + encrypted private key bytes.
    Imported {
        encrypted_pubkey: Vec<u8>,
        encrypted_privkey: Vec<u8>,
    },
    /// Encrypted script hash + encrypted script bytes.
    Script {
        encrypted_script_hash: Vec<u8>,
        encrypted_script: Vec<u8>,
    },
}

impl AddressVariant {
    fn tag(&self) -> AddressTag {
        match self {
            AddressVariant::Chained { .. } => AddressTag::Chained,
            AddressVariant::Imported { .. } => AddressTag::Imported,
            AddressVariant::Script { .. } => AddressTag::Script,
        }
    }

    fn encode_raw(&self) -> Vec<u8> {
        match self {
            AddressVariant::Chained { branch, index } => {
                let mut out = Vec::with_capacity(8);
                out.extend_from_slice(&branch.to_le_bytes());
                out.extend_from_slice(&index.to_le_bytes());
                out
            }
            AddressVariant::Imported {
                encrypted_pubkey,
                encrypted_privkey,
            } => {
                let mut out = Vec::with_capacity(8 + encrypted_pubkey.len() + encrypted_privkey.len());
                out.extend_from_slice(&(encrypted_pubkey.len() as u32).to_le_bytes());
                out.extend_from_slice(encrypted_pubkey);
                out.extend_from_slice(&(encrypted_privkey.len() as u32).to_le_bytes());
                out.extend_from_slice(encrypted_privkey);
                out
            }
            AddressVariant::Script {
                encrypted_script_hash,
                encrypted_script,
            } => {
                let mut out =
                    Vec::with_capacity(8 + encrypted_script_hash.len() + encrypted_script.len());
                out.extend_from_slice(&(encrypted_script_hash.len() as u32).to_le_bytes());
                out.extend_from_slice(encrypted_script_hash);
                out.extend_from_slice(&(encrypted_script.len() as u32).to_le_bytes());
                out.extend_from_slice(encrypted_script);
                out
            }
        }
    }

    fn decode_raw(tag: AddressTag, raw: &[u8]) -> Result<Self> {
        match tag {
            AddressTag::Chained => {
                if raw.len() != 8 {
                    return Err(Error::Database(
                        "malformed serialized address: chained raw-data must be 8 bytes"
                            .to_string(),
                    ));
                }
                let branch = u32::from_le_bytes(raw[0..4].try_into().unwrap());
                let index = u32::from_le_bytes(raw[4..8].try_into().unwrap());
                Ok(AddressVariant::Chained { branch, index })
            }
            AddressTag::Imported => {
                let (encrypted_pubkey, rest) = read_len_prefixed(raw)?;
                let (encrypted_privkey, rest) = read_len_prefixed(rest)?;
                if !rest.is_empty() {
                    return Err(Error::Database(
                        "malformed serialized address: trailing bytes".to_string(),
                    ));
                }
                Ok(AddressVariant::Imported {
                    encrypted_pubkey: encrypted_pubkey.to_vec(),
                    encrypted_privkey: encrypted_privkey.to_vec(),
                })
            }
            AddressTag::Script => {
                let (encrypted_script_hash, rest) = read_len_prefixed(raw)?;
                let (encrypted_script, rest) = read_len_prefixed(rest)?;
                if !rest.is_empty() {
                    return Err(Error::Database(
                        "malformed serialized address: trailing bytes".to_string(),
                    ));
                }
                Ok(AddressVariant::Script {
                    encrypted_script_hash: encrypted_script_hash.to_vec(),
                    encrypted_script: encrypted_script.to_vec(),
                })
            }
        }
    }
}

fn read_len_prefixed(buf: &[u8]) -> Result<(&[u8], &[u8])> {
    if buf.len() < 4 {
        return Err(Error::Database(
            "malformed serialized address: missing length prefix".to_string(),
        ));
    }
    let len = u32::from_le_bytes(buf[0..4].try_into().unwrap()) as usize;
    let rest = &buf[4..];
    if rest.len() < len {
        return Err(Error::Database(
            "malformed serialized address: truncated field".to_string(),
        ));
    }
    Ok((&rest[..len], &rest[len..]))
}

/// A full address row as persisted: common header fields plus a
/// variant-specific payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressRow {
    /// The account this address belongs to.
    pub account: u32,
    /// Unix timestamp (seconds) the address was added.
    pub add_time: u64,
    /// Sync status.
    pub sync_status: SyncStatus,
    /// The variant payload.
    pub variant: AddressVariant,
}

const ADDRESS_ROW_MIN_LEN: usize = 1 + 4 + 8 + 1 + 4;

impl AddressRow {
    /// Serialize per the persisted layout: `tag(1) || account(4 LE) ||
    /// add_time(8 LE) || sync_status(1) || raw_len(4 LE) || raw`.
    pub fn serialize(&self) -> Vec<u8> {
        let raw = self.variant.encode_raw();
        let mut out = Vec::with_capacity(ADDRESS_ROW_MIN_LEN + raw.len());
        out.push(self.variant.tag() as u8);
        out.extend_from_slice(&self.account.to_le_bytes());
        out.extend_from_slice(&self.add_time.to_le_bytes());
        out.push(self.sync_status as u8);
        out.extend_from_slice(&(raw.len() as u32).to_le_bytes());
        out.extend_from_slice(&raw);
        out
    }

    /// Parse the bytes produced by [`Self::serialize`].
    pub fn deserialize(buf: &[u8]) -> Result<Self> {
        if buf.len() < ADDRESS_ROW_MIN_LEN {
            return Err(Error::Database(
                "malformed serialized address: too short".to_string(),
            ));
        }
        let tag = AddressTag::from_u8(buf[0])?;
        let account = u32::from_le_bytes(buf[1..5].try_into().unwrap());
        let add_time = u64::from_le_bytes(buf[5..13].try_into().unwrap());
        let sync_status = SyncStatus::from_u8(buf[13])?;
        let raw_len = u32::from_le_bytes(buf[14..18].try_into().unwrap()) as usize;
        let raw = &buf[18..];
        if raw.len() != raw_len {
            return Err(Error::Database(
                "malformed serialized address: raw-data length mismatch".to_string(),
            ));
        }
        let variant = AddressVariant::decode_raw(tag, raw)?;
        Ok(AddressRow {
            account,
            add_time,
            sync_status,
            variant,
        })
    }
}

/// An account row: the account's encrypted key pair and chain-index state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountRow {
    /// Encrypted account public extended key.
    pub encrypted_pub_key: Vec<u8>,
    /// Encrypted account private extended key, if the account is not
    /// watching-only.
    pub encrypted_priv_key: Option<Vec<u8>>,
    /// Next unused external-branch index.
    pub next_external_index: u32,
    /// Next unused internal-branch index.
    pub next_internal_index: u32,
    /// Human-readable account name.
    pub name: String,
}

impl AccountRow {
    /// Serialize: `pub_len(4) || pub || has_priv(1) || priv_len(4) || priv ||
    /// next_ext(4) || next_int(4) || name_len(4) || name`.
    pub fn serialize(&self) -> Vec<u8> {
        let name_bytes = self.name.as_bytes();
        let mut out = Vec::with_capacity(
            4 + self.encrypted_pub_key.len()
                + 1
                + 4
                + self.encrypted_priv_key.as_ref().map_or(0, |v| v.len())
                + 4
                + 4
                + 4
                + name_bytes.len(),
        );
        out.extend_from_slice(&(self.encrypted_pub_key.len() as u32).to_le_bytes());
        out.extend_from_slice(&self.encrypted_pub_key);
        match &self.encrypted_priv_key {
            Some(priv_key) => {
                out.push(1);
                out.extend_from_slice(&(priv_key.len() as u32).to_le_bytes());
                out.extend_from_slice(priv_key);
            }
            None => {
                out.push(0);
                out.extend_from_slice(&0u32.to_le_bytes());
            }
        }
        out.extend_from_slice(&self.next_external_index.to_le_bytes());
        out.extend_from_slice(&self.next_internal_index.to_le_bytes());
        out.extend_from_slice(&(name_bytes.len() as u32).to_le_bytes());
        out.extend_from_slice(name_bytes);
        out
    }

    /// Parse the bytes produced by [`Self::serialize`].
    pub fn deserialize(buf: &[u8]) -> Result<Self> {
        let (pub_key, rest) = read_len_prefixed(buf)?;
        if rest.is_empty() {
            return Err(Error::Database("malformed account row".to_string()));
        }
        let has_priv = rest[0] != 0;
        let rest = &rest[1..];
        let (priv_key, rest) = read_len_prefixed(rest)?;
        let encrypted_priv_key = if has_priv {
            Some(priv_key.to_vec())
        } else {
            None
        };
        if rest.len() < 12 {
            return Err(Error::Database("malformed account row".to_string()));
        }
        let next_external_index = u32::from_le_bytes(rest[0..4].try_into().unwrap());
        let next_internal_index = u32::from_le_bytes(rest[4..8].try_into().unwrap());
        let name_len = u32::from_le_bytes(rest[8..12].try_into().unwrap()) as usize;
        let name_bytes = &rest[12..];
        if name_bytes.len() != name_len {
            return Err(Error::Database(
                "malformed account row: name length mismatch".to_string(),
            ));
        }
        let name = String::from_utf8(name_bytes.to_vec())
            .map_err(|e| Error::Database(format!("malformed account row: {e}")))?;
        Ok(AccountRow {
            encrypted_pub_key: pub_key.to_vec(),
            encrypted_priv_key,
            next_external_index,
            next_internal_index,
            name,
        })
    }
}

/// A series row: voting-pool multisig group state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeriesRow {
    /// Row format version.
    pub version: u32,
    /// Whether the series is active.
    pub active: bool,
    /// Required-signature threshold.
    pub req_sigs: u32,
    /// Encrypted public extended keys, in canonical order.
    pub encrypted_pub_keys: Vec<Vec<u8>>,
    /// Parallel array of encrypted private extended keys; `None` entries are
    /// un-empowered slots.
    pub encrypted_priv_keys: Vec<Option<Vec<u8>>>,
}

/// The only series row format this crate writes or reads.
pub const SERIES_ROW_VERSION: u32 = 1;

impl SeriesRow {
    /// Serialize: `version(4) || active(1) || req_sigs(4) || n(4) || n *
    /// (len(4) || bytes) || n * (has(1) || len(4) || bytes)`.
    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&self.version.to_le_bytes());
        out.push(self.active as u8);
        out.extend_from_slice(&self.req_sigs.to_le_bytes());
        out.extend_from_slice(&(self.encrypted_pub_keys.len() as u32).to_le_bytes());
        for pub_key in &self.encrypted_pub_keys {
            out.extend_from_slice(&(pub_key.len() as u32).to_le_bytes());
            out.extend_from_slice(pub_key);
        }
        for priv_key in &self.encrypted_priv_keys {
            match priv_key {
                Some(bytes) => {
                    out.push(1);
                    out.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
                    out.extend_from_slice(bytes);
                }
                None => {
                    out.push(0);
                    out.extend_from_slice(&0u32.to_le_bytes());
                }
            }
        }
        out
    }

    /// Parse the bytes produced by [`Self::serialize`].
    pub fn deserialize(buf: &[u8]) -> Result<Self> {
        if buf.len() < 13 {
            return Err(Error::SeriesStorage("series row too short".to_string()));
        }
        let version = u32::from_le_bytes(buf[0..4].try_into().unwrap());
        if version != SERIES_ROW_VERSION {
            return Err(Error::SeriesVersion(version));
        }
        let active = buf[4] != 0;
        let req_sigs = u32::from_le_bytes(buf[5..9].try_into().unwrap());
        let n = u32::from_le_bytes(buf[9..13].try_into().unwrap()) as usize;
        let mut rest = &buf[13..];
        let mut encrypted_pub_keys = Vec::with_capacity(n);
        for _ in 0..n {
            let (bytes, next) = read_len_prefixed(rest)?;
            encrypted_pub_keys.push(bytes.to_vec());
            rest = next;
        }
        let mut encrypted_priv_keys = Vec::with_capacity(n);
        for _ in 0..n {
            if rest.is_empty() {
                return Err(Error::SeriesStorage("series row truncated".to_string()));
            }
            let has = rest[0] != 0;
            rest = &rest[1..];
            let (bytes, next) = read_len_prefixed(rest)?;
            rest = next;
            encrypted_priv_keys.push(if has { Some(bytes.to_vec()) } else { None });
        }
        Ok(SeriesRow {
            version,
            active,
            req_sigs,
            encrypted_pub_keys,
            encrypted_priv_keys,
        })
    }

    /// True once any private-key slot is occupied.
    pub fn is_empowered(&self) -> bool {
        self.encrypted_priv_keys.iter().any(Option::is_some)
    }
}

/// A colored outpoint record: the ledger's unit of bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColorOutPointRecord {
    /// Serial id (1-based).
    pub id: u32,
    /// 32-byte transaction hash.
    pub tx_hash: [u8; 32],
    /// Output index within that transaction.
    pub output_index: u32,
    /// Base value in satoshis.
    pub base_value: i64,
    /// Color id (0 = uncolored).
    pub color_id: u32,
    /// Color-denominated value.
    pub color_value: i64,
    /// Whether this outpoint has been spent.
    pub spent: bool,
    /// Spending transaction hash, meaningful only if `spent`.
    pub spending_tx_hash: [u8; 32],
    /// Spending input index, meaningful only if `spent`.
    pub spending_index: u32,
    /// The pay-to-address script this outpoint is locked to.
    pub script: Vec<u8>,
}

const COLOR_OUTPOINT_FIXED_LEN: usize = 4 + 32 + 4 + 8 + 4 + 8 + 1 + 32 + 4 + 4;

impl ColorOutPointRecord {
    /// Serialize the fixed-width header followed by the variable-length
    /// script.
    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(COLOR_OUTPOINT_FIXED_LEN + self.script.len());
        out.extend_from_slice(&self.id.to_le_bytes());
        out.extend_from_slice(&self.tx_hash);
        out.extend_from_slice(&self.output_index.to_le_bytes());
        out.extend_from_slice(&self.base_value.to_le_bytes());
        out.extend_from_slice(&self.color_id.to_le_bytes());
        out.extend_from_slice(&self.color_value.to_le_bytes());
        out.push(self.spent as u8);
        out.extend_from_slice(&self.spending_tx_hash);
        out.extend_from_slice(&self.spending_index.to_le_bytes());
        out.extend_from_slice(&(self.script.len() as u32).to_le_bytes());
        out.extend_from_slice(&self.script);
        out
    }

    /// Parse the bytes produced by [`Self::serialize`]. An empty or
    /// malformed buffer fails with a `Serialization` error.
    pub fn deserialize(buf: &[u8]) -> Result<Self> {
        if buf.len() < COLOR_OUTPOINT_FIXED_LEN {
            return Err(Error::Serialization(
                "color outpoint record: buffer too short".to_string(),
            ));
        }
        let id = u32::from_le_bytes(buf[0..4].try_into().unwrap());
        let mut tx_hash = [0u8; 32];
        tx_hash.copy_from_slice(&buf[4..36]);
        let output_index = u32::from_le_bytes(buf[36..40].try_into().unwrap());
        let base_value = i64::from_le_bytes(buf[40..48].try_into().unwrap());
        let color_id = u32::from_le_bytes(buf[48..52].try_into().unwrap());
        let color_value = i64::from_le_bytes(buf[52..60].try_into().unwrap());
        let spent = buf[60] != 0;
        let mut spending_tx_hash = [0u8; 32];
        spending_tx_hash.copy_from_slice(&buf[61..93]);
        let spending_index = u32::from_le_bytes(buf[93..97].try_into().unwrap());
        let script_len = u32::from_le_bytes(buf[97..101].try_into().unwrap()) as usize;
        let script = &buf[101..];
        if script.len() != script_len {
            return Err(Error::Serialization(
                "color outpoint record: script length mismatch".to_string(),
            ));
        }
        Ok(ColorOutPointRecord {
            id,
            tx_hash,
            output_index,
            base_value,
            color_id,
            color_value,
            spent,
            spending_tx_hash,
            spending_index,
            script: script.to_vec(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chained_address_row_round_trip() {
        let row = AddressRow {
            account: 7,
            add_time: 1_700_000_000,
            sync_status: SyncStatus::Full,
            variant: AddressVariant::Chained {
                branch: 0,
                index: 42,
            },
        };
        let bytes = row.serialize();
        assert_eq!(AddressRow::deserialize(&bytes).unwrap(), row);
    }

    #[test]
    fn test_imported_address_row_round_trip() {
        let row = AddressRow {
            account: 0xFFFF_FFFF,
            add_time: 0,
            sync_status: SyncStatus::Unsynced,
            variant: AddressVariant::Imported {
                encrypted_pubkey: vec![1, 2, 3],
                encrypted_privkey: vec![4, 5, 6, 7],
            },
        };
        let bytes = row.serialize();
        assert_eq!(AddressRow::deserialize(&bytes).unwrap(), row);
    }

    #[test]
    fn test_script_address_row_round_trip() {
        let row = AddressRow {
            account: 1,
            add_time: 123,
            sync_status: SyncStatus::Full,
            variant: AddressVariant::Script {
                encrypted_script_hash: vec![9; 32],
                encrypted_script: vec![0xAB; 70],
            },
        };
        let bytes = row.serialize();
        assert_eq!(AddressRow::deserialize(&bytes).unwrap(), row);
    }

    #[test]
    fn test_malformed_address_row_too_short() {
        let buf = vec![0u8; 10];
        let err = AddressRow::deserialize(&buf).unwrap_err();
        match err {
            Error::Database(msg) => assert!(msg.contains("malformed")),
            _ => panic!("expected Database error"),
        }
    }

    #[test]
    fn test_account_row_round_trip_watching_only() {
        let row = AccountRow {
            encrypted_pub_key: vec![1; 16],
            encrypted_priv_key: None,
            next_external_index: 3,
            next_internal_index: 1,
            name: "default".to_string(),
        };
        let bytes = row.serialize();
        assert_eq!(AccountRow::deserialize(&bytes).unwrap(), row);
    }

    #[test]
    fn test_account_row_round_trip_full() {
        let row = AccountRow {
            encrypted_pub_key: vec![1; 16],
            encrypted_priv_key: Some(vec![2; 32]),
            next_external_index: 3,
            next_internal_index: 1,
            name: "issuing".to_string(),
        };
        let bytes = row.serialize();
        assert_eq!(AccountRow::deserialize(&bytes).unwrap(), row);
    }

    #[test]
    fn test_series_row_round_trip_with_nil_private_slot() {
        let row = SeriesRow {
            version: SERIES_ROW_VERSION,
            active: true,
            req_sigs: 2,
            encrypted_pub_keys: vec![vec![1; 8], vec![2; 8], vec![3; 8]],
            encrypted_priv_keys: vec![None, Some(vec![9; 8]), None],
        };
        let bytes = row.serialize();
        let parsed = SeriesRow::deserialize(&bytes).unwrap();
        assert_eq!(parsed, row);
        assert!(parsed.is_empowered());
    }

    #[test]
    fn test_color_outpoint_record_round_trip() {
        let record = ColorOutPointRecord {
            id: 1,
            tx_hash: [0xAA; 32],
            output_index: 0,
            base_value: 100_000_000,
            color_id: 0,
            color_value: 100_000_000,
            spent: false,
            spending_tx_hash: [0u8; 32],
            spending_index: 0,
            script: vec![0x76, 0xa9, 0x14],
        };
        let bytes = record.serialize();
        assert_eq!(ColorOutPointRecord::deserialize(&bytes).unwrap(), record);
    }

    #[test]
    fn test_color_outpoint_record_empty_buffer_fails() {
        assert!(ColorOutPointRecord::deserialize(&[]).is_err());
    }
}
