//! Protocol constants and on-disk data layout.
use alloy_primitives::{Address, address};
use std::path::{Path, PathBuf};

/// Timestamp of the mainnet genesis block. It is not recorded on chain
/// (block 0 reports 0), so it is pinned here.
pub const GENESIS_TS: i64 = 1_438_269_973;
/// Default period width: 30 minutes.
pub const DEFAULT_DELTA: i64 = 1800;

pub const UNISWAP_V1_FACTORY: Address = address!("c0a47dFe034B400B47bDaD5FecDa2621de6c4d95");
pub const UNISWAP_V1_DEPLOY_BLOCK: u64 = 6_627_917;
pub const UNISWAP_V2_FACTORY: Address = address!("5C69bEe701ef814a2B6a3EDD4B1652CB9cc5aA6f");
pub const UNISWAP_V2_DEPLOY_BLOCK: u64 = 10_000_835;
pub const WETH: Address = address!("C02aaA39b223FE8D0A0e5C4F27eAD9083C756Cc2");

/// AMM protocol generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Generation {
    /// One exchange contract per token, holding the token and native ether.
    V1,
    /// One pair contract per token pair, holding two ERC-20 balances.
    V2,
}

impl std::fmt::Display for Generation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Generation::V1 => f.write_str("v1"),
            Generation::V2 => f.write_str("v2"),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct GenerationConfig {
    pub generation: Generation,
    pub factory: Address,
    /// Factory deploy block; no exchange of this generation can predate it.
    pub deploy_block: u64,
}

/// Chain-specific parameters shared by the index builder and the price code.
#[derive(Debug, Clone)]
pub struct ProtocolConfig {
    pub genesis_block: u64,
    pub genesis_ts: i64,
    /// Asset every price is quoted against (WETH on mainnet).
    pub reserve_asset: Address,
    pub v1: GenerationConfig,
    pub v2: GenerationConfig,
}

impl ProtocolConfig {
    pub fn mainnet() -> Self {
        Self {
            genesis_block: 0,
            genesis_ts: GENESIS_TS,
            reserve_asset: WETH,
            v1: GenerationConfig {
                generation: Generation::V1,
                factory: UNISWAP_V1_FACTORY,
                deploy_block: UNISWAP_V1_DEPLOY_BLOCK,
            },
            v2: GenerationConfig {
                generation: Generation::V2,
                factory: UNISWAP_V2_FACTORY,
                deploy_block: UNISWAP_V2_DEPLOY_BLOCK,
            },
        }
    }

    pub fn generations(&self) -> [&GenerationConfig; 2] {
        [&self.v1, &self.v2]
    }
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self::mainnet()
    }
}

/// Where persisted files live inside the data directory.
#[derive(Debug, Clone)]
pub struct DataLayout {
    pub dir: PathBuf,
}

impl DataLayout {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn index_path(&self) -> PathBuf {
        self.dir.join("blocktimes.json")
    }

    pub fn tokens_export_path(&self) -> PathBuf {
        self.dir.join("tokens.json")
    }

    /// Price history file, named by the lowercase hex address.
    pub fn history_path(&self, token: &Address) -> PathBuf {
        self.dir.join(format!("0x{}.json", hex::encode(token.as_slice())))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn history_files_are_named_by_lowercase_address() {
        let layout = DataLayout::new("data");
        let p = layout.history_path(&WETH);
        assert_eq!(p, PathBuf::from("data/0xc02aaa39b223fe8d0a0e5c4f27ead9083c756cc2.json"));
    }
}
