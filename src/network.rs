// Copyright 2019-2025 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use crate::error::Error;
use alloy_primitives::{Address, address};
use serde::{Deserialize, Serialize};

/// Duration of one Filecoin epoch.
pub const EPOCH_DURATION_SECONDS: u64 = 30;

/// Multicall3 is deployed at the same address on both networks.
pub const MULTICALL3_ADDRESS: Address = address!("0xca11bde05977b3631167028862be2a173976ca11");

/// Networks the client may talk to. Anything else is rejected at
/// construction time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    Mainnet,
    Calibration,
}

impl Network {
    pub fn from_chain_id(chain_id: u64) -> Result<Self, Error> {
        match chain_id {
            314 => Ok(Network::Mainnet),
            314_159 => Ok(Network::Calibration),
            other => Err(Error::UnsupportedNetwork(other)),
        }
    }

    pub fn chain_id(&self) -> u64 {
        match self {
            Network::Mainnet => 314,
            Network::Calibration => 314_159,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Network::Mainnet => "mainnet",
            Network::Calibration => "calibration",
        }
    }

    /// Default contract address book for the network. Individual entries
    /// can be overridden through the facade configuration.
    pub fn addresses(&self) -> AddressBook {
        match self {
            Network::Mainnet => AddressBook {
                payments: address!("0x23ff142f2bcbdec0f8a4570abfcafeb1bb2aae73"),
                warm_storage: address!("0x4a610dd56b1b40299e486e915f4c56328af6972f"),
                service_registry: address!("0x9c65e8521e5f3e4c5d90c9d6a35b73aec8c3c1b9"),
                pdp_verifier: address!("0x1b0e0976b0fcd1ac8ad4f90484a43bfc7c9ff0e3"),
                usdfc: address!("0x80b98d3aa09ffff255c3ba4a241111ff1262f045"),
            },
            Network::Calibration => AddressBook {
                payments: address!("0x0e690d3e60b0576d01352ab03b258115eb84a047"),
                warm_storage: address!("0x80617b65fe4f3ffe4e7c1a0d123eaac243a85bde"),
                service_registry: address!("0x868da32cd9fa9a6b0d3a3ee1c2f06b1d0a0cbb28"),
                pdp_verifier: address!("0x445238d83a1f3fb57d0a6cb36b0bdba26f5a9bb7"),
                usdfc: address!("0xb3042734b608a1b16e9e86b374a3f3e389b4cdf0"),
            },
        }
    }

    /// Host of the FilBeam CDN edge for this network. Piece downloads go to
    /// `https://<client-address>.<host>/<piece-cid>`.
    pub fn cdn_host(&self) -> &'static str {
        match self {
            Network::Mainnet => "filbeam.io",
            Network::Calibration => "calibration.filbeam.io",
        }
    }

    /// Base URL of the FilBeam stats service for this network.
    pub fn stats_base(&self) -> &'static str {
        match self {
            Network::Mainnet => "https://stats.filbeam.io",
            Network::Calibration => "https://calibration.stats.filbeam.io",
        }
    }
}

/// Per-network deployment addresses of the contracts the client consumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressBook {
    pub payments: Address,
    pub warm_storage: Address,
    pub service_registry: Address,
    pub pdp_verifier: Address,
    pub usdfc: Address,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chain_id_round_trip() {
        for network in [Network::Mainnet, Network::Calibration] {
            assert_eq!(Network::from_chain_id(network.chain_id()).unwrap(), network);
        }
    }

    #[test]
    fn unknown_chain_id_is_rejected() {
        assert!(matches!(
            Network::from_chain_id(1),
            Err(Error::UnsupportedNetwork(1))
        ));
    }
}
