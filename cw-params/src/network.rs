//! Network definitions: coin type and address version bytes.

use serde::{Deserialize, Serialize};

/// Network type enumeration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NetworkType {
    /// Mainnet.
    Mainnet,
    /// Testnet.
    Testnet,
    /// Regtest (local development).
    Regtest,
}

/// Network configuration: everything the key hierarchy and address encoder
/// need to know about which chain they are deriving for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Network {
    /// Network type.
    pub network_type: NetworkType,
    /// Human-readable name.
    pub name: &'static str,
    /// BIP-44 coin type used in the `m/44'/coin_type'/account'` path.
    pub coin_type: u32,
    /// Underlying `bitcoin` crate network, used for WIF/address/xpub encoding.
    pub bitcoin_network: bitcoin::Network,
}

impl Network {
    /// Mainnet parameters.
    pub const fn mainnet() -> Self {
        Self {
            network_type: NetworkType::Mainnet,
            name: "mainnet",
            coin_type: 0,
            bitcoin_network: bitcoin::Network::Bitcoin,
        }
    }

    /// Testnet parameters.
    pub const fn testnet() -> Self {
        Self {
            network_type: NetworkType::Testnet,
            name: "testnet",
            coin_type: 1,
            bitcoin_network: bitcoin::Network::Testnet,
        }
    }

    /// Regtest parameters.
    pub const fn regtest() -> Self {
        Self {
            network_type: NetworkType::Regtest,
            name: "regtest",
            coin_type: 1,
            bitcoin_network: bitcoin::Network::Regtest,
        }
    }

    /// Get network by type.
    pub const fn from_type(network_type: NetworkType) -> Self {
        match network_type {
            NetworkType::Mainnet => Self::mainnet(),
            NetworkType::Testnet => Self::testnet(),
            NetworkType::Regtest => Self::regtest(),
        }
    }

    /// The BIP-44 account derivation path prefix, `m/44'/coin_type'`.
    pub fn bip44_purpose_coin(&self) -> [bitcoin::bip32::ChildNumber; 2] {
        use bitcoin::bip32::ChildNumber;
        [
            ChildNumber::from_hardened_idx(44).expect("44 is a valid hardened index"),
            ChildNumber::from_hardened_idx(self.coin_type)
                .expect("coin_type out of hardened range"),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mainnet_params() {
        let net = Network::mainnet();
        assert_eq!(net.network_type, NetworkType::Mainnet);
        assert_eq!(net.bitcoin_network, bitcoin::Network::Bitcoin);
    }

    #[test]
    fn test_network_from_type() {
        let net = Network::from_type(NetworkType::Testnet);
        assert_eq!(net.network_type, NetworkType::Testnet);
        assert_eq!(net.coin_type, 1);
    }

    #[test]
    fn test_bip44_prefix_is_hardened() {
        let net = Network::mainnet();
        let prefix = net.bip44_purpose_coin();
        assert_eq!(prefix.len(), 2);
    }
}


