//! Reserve reader for one AMM exchange instance.
//!
//! A V1 exchange holds a token and native ether; a V2 pair holds the token
//! and WETH. Either way [`Exchange::reserves`] reports `(token, quote)`
//! balances in whole units, so both generations can be summed directly.
use crate::config::{Generation, GenerationConfig};
use crate::deploy::find_deploy_block;
use crate::rpc::{ChainRpc, ReserveAsset};
use alloy_primitives::{Address, U256};
use anyhow::{Context, Result};
use tracing::{debug, info};

const NATIVE_DECIMALS: u8 = 18;

/// Two-sided pool balances at one block.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Reserves {
    /// Balance of the priced token.
    pub base: f64,
    /// Balance of the quote (reserve) asset.
    pub quote: f64,
}

impl Reserves {
    pub const EMPTY: Reserves = Reserves { base: 0.0, quote: 0.0 };

    pub fn new(base: f64, quote: f64) -> Self {
        Self { base, quote }
    }
}

#[derive(Debug, Clone)]
pub struct Exchange {
    pub generation: Generation,
    pub token: Address,
    /// `None` when the factory has no exchange for this token.
    pub pool: Option<Address>,
    pub deploy_block: Option<u64>,
    base_asset: ReserveAsset,
    quote_asset: ReserveAsset,
    base_decimals: u8,
    quote_decimals: u8,
}

impl Exchange {
    /// Resolve the exchange of `token` against `quote` in the given
    /// generation and locate its deploy block.
    pub fn connect<R: ChainRpc>(rpc: &R, cfg: &GenerationConfig, token: Address, quote: Address) -> Result<Self> {
        let pool = rpc
            .resolve_pair_address(cfg.generation, cfg.factory, token, quote)
            .with_context(|| format!("resolve {} exchange for {token}", cfg.generation))?;
        let (quote_asset, quote_decimals) = match cfg.generation {
            Generation::V1 => (ReserveAsset::Native, NATIVE_DECIMALS),
            Generation::V2 => (ReserveAsset::Erc20(quote), rpc.token_decimals(quote)?),
        };
        let base_decimals = rpc.token_decimals(token).with_context(|| format!("decimals of {token}"))?;

        let (pool, deploy_block) = if pool == Address::ZERO {
            info!(generation = %cfg.generation, %token, "no exchange registered");
            (None, None)
        } else {
            let block = find_deploy_block(rpc, pool, cfg.deploy_block, None)?;
            debug!(generation = %cfg.generation, %token, %pool, block, "exchange connected");
            (Some(pool), Some(block))
        };

        Ok(Self {
            generation: cfg.generation,
            token,
            pool,
            deploy_block,
            base_asset: ReserveAsset::Erc20(token),
            quote_asset,
            base_decimals,
            quote_decimals,
        })
    }

    /// `(token, quote)` reserves at `block`, or zeros without touching the
    /// node when the exchange did not exist yet.
    pub fn reserves<R: ChainRpc>(&self, rpc: &R, block: u64) -> Result<Reserves> {
        let (pool, deployed) = match (self.pool, self.deploy_block) {
            (Some(pool), Some(deployed)) => (pool, deployed),
            _ => return Ok(Reserves::EMPTY),
        };
        if block < deployed {
            return Ok(Reserves::EMPTY);
        }
        let base = rpc.reserve_balance(pool, self.base_asset, block)?;
        let quote = rpc.reserve_balance(pool, self.quote_asset, block)?;
        Ok(Reserves::new(scale(base, self.base_decimals), scale(quote, self.quote_decimals)))
    }
}

/// `raw / 10^decimals` as a float.
pub fn scale(raw: U256, decimals: u8) -> f64 {
    let mut value = 0f64;
    for limb in raw.as_limbs().iter().rev() {
        value = value * 18_446_744_073_709_551_616.0 + *limb as f64;
    }
    value / 10f64.powi(i32::from(decimals))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProtocolConfig;
    use crate::test_utils::{MockChain, addr, units};

    fn chain_with_pools() -> (MockChain, ProtocolConfig) {
        let cfg = ProtocolConfig { reserve_asset: addr(0xee), ..ProtocolConfig::mainnet() };
        let (token, weth, v1_pool, v2_pool) = (addr(1), addr(0xee), addr(0x11), addr(0x21));
        let mut chain = MockChain::linear(20_000_000, 0, 13);
        chain
            .decimals(token, 6)
            .decimals(weth, 18)
            .pair(Generation::V1, token, weth, v1_pool)
            .pair(Generation::V2, token, weth, v2_pool)
            .deploy(v1_pool, 7_000_000)
            .deploy(v2_pool, 10_500_000)
            .balance(v1_pool, ReserveAsset::Erc20(token), 7_000_000, units(2_000, 6))
            .balance(v1_pool, ReserveAsset::Native, 7_000_000, units(4, 18))
            .balance(v2_pool, ReserveAsset::Erc20(token), 10_500_000, units(500, 6))
            .balance(v2_pool, ReserveAsset::Erc20(weth), 10_500_000, units(1, 18));
        (chain, cfg)
    }

    #[test]
    fn v1_reads_native_quote_and_scales_decimals() {
        let (chain, cfg) = chain_with_pools();
        let ex = Exchange::connect(&chain, &cfg.v1, addr(1), addr(0xee)).unwrap();
        assert_eq!(ex.deploy_block, Some(7_000_000));
        assert_eq!(ex.reserves(&chain, 8_000_000).unwrap(), Reserves::new(2_000.0, 4.0));
    }

    #[test]
    fn v2_reads_erc20_quote() {
        let (chain, cfg) = chain_with_pools();
        let ex = Exchange::connect(&chain, &cfg.v2, addr(1), addr(0xee)).unwrap();
        assert_eq!(ex.reserves(&chain, 11_000_000).unwrap(), Reserves::new(500.0, 1.0));
    }

    #[test]
    fn before_deploy_is_empty_without_a_node_call() {
        let (chain, cfg) = chain_with_pools();
        let ex = Exchange::connect(&chain, &cfg.v2, addr(1), addr(0xee)).unwrap();
        let before = chain.balance_calls.get();
        assert_eq!(ex.reserves(&chain, 10_499_999).unwrap(), Reserves::EMPTY);
        assert_eq!(chain.balance_calls.get(), before);
    }

    #[test]
    fn missing_pair_is_always_empty() {
        let (chain, cfg) = chain_with_pools();
        let ex = Exchange::connect(&chain, &cfg.v2, addr(9), addr(0xee));
        // token 9 has no decimals registered; connecting must surface that
        assert!(ex.is_err());

        let mut chain = chain;
        chain.decimals(addr(9), 18);
        let ex = Exchange::connect(&chain, &cfg.v2, addr(9), addr(0xee)).unwrap();
        assert_eq!(ex.pool, None);
        assert_eq!(ex.reserves(&chain, 15_000_000).unwrap(), Reserves::EMPTY);
    }

    #[test]
    fn scale_handles_wide_values() {
        assert_eq!(scale(U256::from(1_500_000u64), 6), 1.5);
        let big = U256::from(u64::MAX) * U256::from(4u64);
        assert!((scale(big, 0) - 4.0 * u64::MAX as f64).abs() < 1e6);
    }
}
