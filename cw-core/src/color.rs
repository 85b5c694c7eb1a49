//! Color ledger: the persistent catalog of color definitions, colored
//! outpoints, and the reverse indices that let the wallet workflows select
//! spendable records and resolve pay-to-address scripts back to an
//! `(account, index)` pair.

use bitcoin::ScriptBuf;

use crate::error::Result;
use crate::rows::ColorOutPointRecord;
use crate::store::WalletStore;

/// The color id reserved for base-unit (non-color) value. Never allocated by
/// [`fetch_color_id`].
pub const UNCOLORED_COLOR_ID: u32 = 0;
/// Account 0 holds uncolored funds.
pub const UNCOLORED_ACCOUNT: u32 = 0;
/// Account 1 is reserved for issuing addresses.
pub const ISSUING_ACCOUNT: u32 = 1;

/// An outpoint identified the way the color ledger persists it: a 32-byte
/// transaction hash plus an output index. Kept distinct from `bitcoin::OutPoint`
/// so the ledger's big-endian on-disk byte order is never silently
/// reinterpreted through `bitcoin`'s internal (reversed) `Txid` encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OutPoint {
    /// 32-byte transaction hash, big-endian.
    pub tx_hash: [u8; 32],
    /// Output index within that transaction.
    pub output_index: u32,
}

/// A color identity overlaid on base transaction outputs: an external
/// collaborator contract. A concrete value must be hashable to a stable
/// string (the color-definition bucket key) and know which account and BIP32
/// branch its change addresses live under.
pub trait ColorDefinition {
    /// The stable string form used as this definition's bucket key, e.g.
    /// `"EPOBC:<genesis txhash>:<genesis index>:<genesis height>"`.
    fn hash_string(&self) -> String;

    /// The account number this color's addresses are issued under.
    fn account_number(&self) -> u32;

    /// The BIP32 branch (analogous to external/internal) this color's change
    /// addresses derive under.
    fn bip32_branch(&self) -> u32;

    /// The color-denominated value of `outpoint`, as observed on chain via
    /// `explorer`.
    fn color_value(
        &self,
        explorer: &dyn crate::workflow::BlockExplorer,
        outpoint: &OutPoint,
    ) -> Result<i64>;

    /// Build the transaction transferring this color's value to the given
    /// colored outputs, spending `colored_inputs` (and, if needed,
    /// `uncolored_inputs` to cover the fee), with optional colored and
    /// uncolored change.
    #[allow(clippy::too_many_arguments)]
    fn transferring_tx(
        &self,
        colored_inputs: &[ColorOutPointRecord],
        uncolored_inputs: &[ColorOutPointRecord],
        colored_outputs: &[(ScriptBuf, i64)],
        colored_change: Option<(ScriptBuf, i64)>,
        uncolored_change: Option<(ScriptBuf, i64)>,
        fee: i64,
    ) -> Result<bitcoin::Transaction>;
}

/// A pluggable policy object encapsulating how a color scheme issues value
/// on chain. Sibling to [`ColorDefinition`]: the definition describes an
/// *already-issued* color, the kernel describes how to *issue* one.
pub trait Kernel {
    /// The base-unit (satoshi) cost of issuing `value` units of color,
    /// before fees.
    fn issuing_satoshi_needed(&self, value: i64) -> i64;

    /// Build the genesis issuance transaction: spends `inputs`, pays `value`
    /// color units to `issuing_script`, and returns any leftover base value
    /// to `change_script`.
    fn issuing_tx(
        &self,
        inputs: &[ColorOutPointRecord],
        issuing_script: &ScriptBuf,
        change_script: Option<&ScriptBuf>,
        value: i64,
        fee: i64,
    ) -> Result<bitcoin::Transaction>;

    /// Build the `ColorDefinition` for the color this kernel just issued,
    /// once the genesis outpoint's transaction hash and confirming block
    /// height are known (i.e. after the genesis transaction has been
    /// published). `IssueColor` calls this immediately after publish so it
    /// can register the new color's `ColorId` against the genesis outpoint.
    fn genesis_definition(
        &self,
        genesis_tx_hash: [u8; 32],
        genesis_height: u32,
    ) -> Result<Box<dyn ColorDefinition>>;
}

/// Transactionally return the `ColorId` registered for `definition`,
/// allocating a fresh one and registering the color's account number if this
/// is the first time it has been observed.
pub fn fetch_color_id<S: WalletStore>(store: &S, definition: &impl ColorDefinition) -> Result<u32> {
    let hash_string = definition.hash_string();
    store.update(|txn| {
        if let Some(id) = txn.fetch_color_definition(&hash_string)? {
            return Ok(id);
        }
        let id = txn.new_color_id()?;
        txn.put_color_definition(&hash_string, id, definition.account_number())?;
        Ok(id)
    })
}

/// Allocate a fresh outpoint id.
pub fn new_outpoint_id<S: WalletStore>(store: &S) -> Result<u32> {
    store.update(|txn| txn.new_outpoint_id())
}

/// Persist a colored outpoint record and its reverse index atomically.
pub fn store_color_outpoint<S: WalletStore>(store: &S, record: &ColorOutPointRecord) -> Result<()> {
    store.update(|txn| txn.store_color_outpoint(record))
}

/// Every colored outpoint record, in ascending id order.
pub fn all_color_outpoints<S: WalletStore>(store: &S) -> Result<Vec<ColorOutPointRecord>> {
    store.view(|txn| txn.all_color_outpoints())
}

/// The outpoint id for `outpoint`, or `0` (the sentinel "none") if absent.
pub fn fetch_outpoint_id<S: WalletStore>(store: &S, outpoint: &OutPoint) -> Result<u32> {
    store.view(|txn| txn.fetch_outpoint_id(&outpoint.tx_hash, outpoint.output_index))
}

/// Record `script -> (account, index)` in the reverse index.
pub fn store_script_index<S: WalletStore>(
    store: &S,
    account: u32,
    index: u32,
    script: &ScriptBuf,
) -> Result<()> {
    store.update(|txn| txn.store_script_index(account, index, &script.to_bytes()))
}

/// Look up `(account, index)` for a pay-to-address script.
pub fn lookup_script<S: WalletStore>(store: &S, script: &[u8]) -> Result<(u32, u32)> {
    store.view(|txn| txn.lookup_script(script))
}

/// A minimal concrete [`ColorDefinition`]/[`Kernel`] pair for the EPOBC-style
/// ("enhanced padded order-based coloring") scheme, exercising the ledger
/// end-to-end in tests the way a real kernel would, without this crate
/// depending on any particular coloring scheme's wire format.
pub mod epobc {
    use super::*;

    /// An EPOBC color definition: identified by its genesis outpoint and the
    /// block height it was observed at.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct EpobcColorDefinition {
        /// Genesis transaction hash.
        pub genesis_tx_hash: [u8; 32],
        /// Genesis output index.
        pub genesis_index: u32,
        /// Block height the genesis output was mined at.
        pub genesis_height: u32,
        /// Account number this color's addresses live under.
        pub account: u32,
        /// BIP32 branch this color's change addresses derive under.
        pub branch: u32,
    }

    impl ColorDefinition for EpobcColorDefinition {
        fn hash_string(&self) -> String {
            format!(
                "EPOBC:{}:{}:{}",
                hex_encode(&self.genesis_tx_hash),
                self.genesis_index,
                self.genesis_height
            )
        }

        fn account_number(&self) -> u32 {
            self.account
        }

        fn bip32_branch(&self) -> u32 {
            self.branch
        }

        fn color_value(
            &self,
            _explorer: &dyn crate::workflow::BlockExplorer,
            _outpoint: &OutPoint,
        ) -> Result<i64> {
            // EPOBC's padding/order rules are a kernel-specific wire format
            // out of this crate's scope: a concrete kernel would inspect
            // the spending tx's nSequence padding. The genesis outpoint
            // itself always carries the full issued value, which is the only
            // case this crate's own tests exercise.
            Err(crate::error::Error::Color(
                "color_value requires a concrete kernel wire format".to_string(),
            ))
        }

        fn transferring_tx(
            &self,
            colored_inputs: &[ColorOutPointRecord],
            uncolored_inputs: &[ColorOutPointRecord],
            colored_outputs: &[(ScriptBuf, i64)],
            colored_change: Option<(ScriptBuf, i64)>,
            uncolored_change: Option<(ScriptBuf, i64)>,
            _fee: i64,
        ) -> Result<bitcoin::Transaction> {
            build_spending_tx(
                colored_inputs,
                uncolored_inputs,
                colored_outputs,
                colored_change,
                uncolored_change,
            )
        }
    }

    /// The EPOBC genesis-issuance kernel: pads the issuing output with the
    /// minimum allowed value and returns any remainder as uncolored change.
    #[derive(Debug, Clone, Copy)]
    pub struct EpobcKernel {
        /// Minimum satoshi value EPOBC requires on the issuing output.
        pub min_issuing_satoshi: i64,
        /// The account number this kernel's colors are issued under (>= 2,
        /// one per color — spec §6's account numbering convention).
        pub color_account: u32,
    }

    impl Kernel for EpobcKernel {
        fn issuing_satoshi_needed(&self, _value: i64) -> i64 {
            self.min_issuing_satoshi
        }

        fn issuing_tx(
            &self,
            inputs: &[ColorOutPointRecord],
            issuing_script: &ScriptBuf,
            change_script: Option<&ScriptBuf>,
            _value: i64,
            fee: i64,
        ) -> Result<bitcoin::Transaction> {
            let total_in: i64 = inputs.iter().map(|r| r.base_value).sum();
            let mut outputs = vec![(issuing_script.clone(), self.min_issuing_satoshi)];
            let spent = self.min_issuing_satoshi + fee;
            if total_in > spent {
                let change_script = change_script.ok_or_else(|| {
                    crate::error::Error::InvalidValue(
                        "change output required but no change script given".to_string(),
                    )
                })?;
                outputs.push((change_script.clone(), total_in - spent));
            }
            assemble_tx(inputs, &outputs)
        }

        fn genesis_definition(
            &self,
            genesis_tx_hash: [u8; 32],
            genesis_height: u32,
        ) -> Result<Box<dyn ColorDefinition>> {
            Ok(Box::new(EpobcColorDefinition {
                genesis_tx_hash,
                genesis_index: 0,
                genesis_height,
                account: self.color_account,
                branch: 0,
            }))
        }
    }

    fn hex_encode(bytes: &[u8]) -> String {
        bytes.iter().map(|b| format!("{b:02x}")).collect()
    }

    fn assemble_tx(
        inputs: &[ColorOutPointRecord],
        outputs: &[(ScriptBuf, i64)],
    ) -> Result<bitcoin::Transaction> {
        use bitcoin::hashes::Hash;
        use bitcoin::{Amount, OutPoint as BtcOutPoint, Sequence, Transaction, TxIn, TxOut, Txid, Witness};

        let tx_inputs = inputs
            .iter()
            .map(|r| {
                let mut le = r.tx_hash;
                le.reverse();
                let txid = Txid::from_slice(&le)
                    .map_err(|e| crate::error::Error::Script(format!("txid: {e}")))?;
                Ok(TxIn {
                    previous_output: BtcOutPoint::new(txid, r.output_index),
                    script_sig: ScriptBuf::new(),
                    sequence: Sequence::ENABLE_RBF_NO_LOCKTIME,
                    witness: Witness::new(),
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let tx_outputs = outputs
            .iter()
            .map(|(script, value)| TxOut {
                value: Amount::from_sat((*value).max(0) as u64),
                script_pubkey: script.clone(),
            })
            .collect();

        Ok(Transaction {
            version: bitcoin::transaction::Version::ONE,
            lock_time: bitcoin::absolute::LockTime::ZERO,
            input: tx_inputs,
            output: tx_outputs,
        })
    }

    fn build_spending_tx(
        colored_inputs: &[ColorOutPointRecord],
        uncolored_inputs: &[ColorOutPointRecord],
        colored_outputs: &[(ScriptBuf, i64)],
        colored_change: Option<(ScriptBuf, i64)>,
        uncolored_change: Option<(ScriptBuf, i64)>,
    ) -> Result<bitcoin::Transaction> {
        let mut inputs = Vec::with_capacity(colored_inputs.len() + uncolored_inputs.len());
        inputs.extend_from_slice(colored_inputs);
        inputs.extend_from_slice(uncolored_inputs);

        let mut outputs: Vec<(ScriptBuf, i64)> = colored_outputs.to_vec();
        if let Some(cc) = colored_change {
            outputs.push(cc);
        }
        if let Some(uc) = uncolored_change {
            outputs.push(uc);
        }
        assemble_tx(&inputs, &outputs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rows::ColorOutPointRecord;

    fn sample_record(id: u32, color_id: u32) -> ColorOutPointRecord {
        ColorOutPointRecord {
            id,
            tx_hash: [id as u8; 32],
            output_index: 0,
            base_value: 100_000_000,
            color_id,
            color_value: 1000,
            spent: false,
            spending_tx_hash: [0u8; 32],
            spending_index: 0,
            script: vec![0x76, 0xa9, 0x14],
        }
    }

    #[test]
    fn test_uncolored_color_id_is_zero() {
        assert_eq!(UNCOLORED_COLOR_ID, 0);
    }

    #[test]
    fn test_epobc_hash_string_format() {
        use epobc::EpobcColorDefinition;
        let def = EpobcColorDefinition {
            genesis_tx_hash: [0xAB; 32],
            genesis_index: 0,
            genesis_height: 500_000,
            account: 2,
            branch: 0,
        };
        let s = def.hash_string();
        assert!(s.starts_with("EPOBC:"));
        assert!(s.ends_with(":0:500000"));
    }

    #[test]
    fn test_epobc_issuing_tx_emits_change_only_on_strict_surplus() {
        use epobc::EpobcKernel;
        let kernel = EpobcKernel {
            min_issuing_satoshi: 600,
            color_account: 2,
        };
        let issuing_script = ScriptBuf::from_bytes(vec![0x51]);
        let change_script = ScriptBuf::from_bytes(vec![0x52]);

        let exact = sample_record(1, UNCOLORED_COLOR_ID);
        let mut exact = exact;
        exact.base_value = 600 + 10_000;
        let tx = kernel
            .issuing_tx(&[exact], &issuing_script, Some(&change_script), 1000, 10_000)
            .unwrap();
        assert_eq!(tx.output.len(), 1);

        let surplus = {
            let mut r = sample_record(2, UNCOLORED_COLOR_ID);
            r.base_value = 600 + 10_000 + 1;
            r
        };
        let tx = kernel
            .issuing_tx(&[surplus], &issuing_script, Some(&change_script), 1000, 10_000)
            .unwrap();
        assert_eq!(tx.output.len(), 2);
        assert_eq!(tx.output[1].value.to_sat(), 1);
    }
}
