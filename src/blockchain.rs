use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::CrawlerError;

/// Supported EVM chains.
///
/// Every chain shares one table layout; only the table prefix and a few
/// optional block fields differ.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum Blockchain {
    Ethereum,
    Sepolia,
    Polygon,
    Amoy,
    Xdai,
    ArbitrumOne,
    ArbitrumNova,
    ArbitrumSepolia,
    Avalanche,
    ZksyncEra,
    Blast,
}

impl Blockchain {
    pub fn as_str(&self) -> &'static str {
        match self {
            Blockchain::Ethereum => "ethereum",
            Blockchain::Sepolia => "sepolia",
            Blockchain::Polygon => "polygon",
            Blockchain::Amoy => "amoy",
            Blockchain::Xdai => "xdai",
            Blockchain::ArbitrumOne => "arbitrum_one",
            Blockchain::ArbitrumNova => "arbitrum_nova",
            Blockchain::ArbitrumSepolia => "arbitrum_sepolia",
            Blockchain::Avalanche => "avalanche",
            Blockchain::ZksyncEra => "zksync_era",
            Blockchain::Blast => "blast",
        }
    }

    /// Subscription type used by the job feed for smart contract jobs on this chain.
    pub fn subscription_type(&self) -> String {
        format!("{}_smartcontract", self.as_str())
    }

    pub fn blocks_table(&self) -> String {
        format!("{}_blocks", self.as_str())
    }

    pub fn labels_table(&self) -> String {
        format!("{}_labels", self.as_str())
    }

    /// Chains whose blocks carry the parent-chain block number (`l1BlockNumber`).
    pub fn has_l1_block_number(&self) -> bool {
        matches!(
            self,
            Blockchain::ArbitrumOne | Blockchain::ArbitrumNova | Blockchain::ArbitrumSepolia
        )
    }

    /// Proof-of-authority chains with non-standard `extraData` lengths.
    pub fn is_poa(&self) -> bool {
        matches!(self, Blockchain::Polygon | Blockchain::Amoy | Blockchain::Xdai)
    }

    pub fn all() -> &'static [Blockchain] {
        &[
            Blockchain::Ethereum,
            Blockchain::Sepolia,
            Blockchain::Polygon,
            Blockchain::Amoy,
            Blockchain::Xdai,
            Blockchain::ArbitrumOne,
            Blockchain::ArbitrumNova,
            Blockchain::ArbitrumSepolia,
            Blockchain::Avalanche,
            Blockchain::ZksyncEra,
            Blockchain::Blast,
        ]
    }
}

impl fmt::Display for Blockchain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Blockchain {
    type Err = CrawlerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_lowercase().replace('-', "_");
        Blockchain::all()
            .iter()
            .copied()
            .find(|chain| chain.as_str() == normalized)
            .ok_or_else(|| CrawlerError::Configuration(format!("Unknown blockchain: {}", s)))
    }
}
