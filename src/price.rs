//! Spot prices combined across both AMM generations.
//!
//! Each generation contributes a `(pool_a, pool_b)` pair of volumes and the
//! price is `sum(pool_b) / sum(pool_a)`. That is a reserve-weighted average:
//! a generation with more liquidity moves the price more, and a generation
//! without liquidity contributes nothing.
use crate::config::ProtocolConfig;
use crate::exchange::{Exchange, Reserves};
use crate::rpc::ChainRpc;
use alloy_primitives::Address;
use anyhow::Result;
use std::collections::HashMap;

/// Exchanges of one token in both generations.
#[derive(Debug, Clone)]
pub struct TokenExchanges {
    pub v1: Exchange,
    pub v2: Exchange,
}

impl TokenExchanges {
    /// Deploy blocks of the generations that have an exchange.
    pub fn deploy_blocks(&self) -> Vec<u64> {
        [&self.v1, &self.v2].iter().filter_map(|e| e.deploy_block).collect()
    }
}

/// Reweight two single-asset pools into a cross pair.
///
/// `(pool_a, eth_a)` and `(pool_b, eth_b)` are the reserves of A and B
/// against the reserve asset. The pool with more reserve-asset liquidity is
/// scaled down to the other's volume, so that a thin pool cannot dominate
/// the blended rate once contributions of both generations are summed. Any
/// empty side yields `(0, 0)`.
pub fn reweight_pools(pool_a: f64, eth_a: f64, pool_b: f64, eth_b: f64) -> (f64, f64) {
    if pool_a == 0.0 || eth_a == 0.0 || pool_b == 0.0 || eth_b == 0.0 {
        return (0.0, 0.0);
    }
    let a_price = eth_a / pool_a;
    let b_price = eth_b / pool_b;
    if eth_a > eth_b {
        (eth_b / a_price, pool_b)
    } else {
        (pool_a, eth_a / b_price)
    }
}

/// `sum(b) / sum(a)`, or `None` when there is no A-side volume at all.
pub fn combine(contributions: &[(f64, f64)]) -> Option<f64> {
    let (total_a, total_b) = contributions.iter().fold((0.0, 0.0), |(a, b), (ca, cb)| (a + ca, b + cb));
    if total_a == 0.0 { None } else { Some(total_b / total_a) }
}

/// Prices tokens at historical blocks. Owns the exchanges it has connected,
/// keyed by token address; nothing is shared with other instances.
pub struct PriceAggregator<R> {
    rpc: R,
    protocol: ProtocolConfig,
    exchanges: HashMap<Address, TokenExchanges>,
}

impl<R: ChainRpc> PriceAggregator<R> {
    pub fn new(rpc: R, protocol: ProtocolConfig) -> Self {
        Self { rpc, protocol, exchanges: HashMap::new() }
    }

    pub fn rpc(&self) -> &R {
        &self.rpc
    }

    pub fn protocol(&self) -> &ProtocolConfig {
        &self.protocol
    }

    pub fn reserve_asset(&self) -> Address {
        self.protocol.reserve_asset
    }

    /// Exchanges of `token`, connected on first use.
    pub fn exchanges(&mut self, token: Address) -> Result<&TokenExchanges> {
        if !self.exchanges.contains_key(&token) {
            let quote = self.protocol.reserve_asset;
            let v1 = Exchange::connect(&self.rpc, &self.protocol.v1, token, quote)?;
            let v2 = Exchange::connect(&self.rpc, &self.protocol.v2, token, quote)?;
            self.exchanges.insert(token, TokenExchanges { v1, v2 });
        }
        Ok(&self.exchanges[&token])
    }

    pub fn deploy_blocks(&mut self, token: Address) -> Result<Vec<u64>> {
        Ok(self.exchanges(token)?.deploy_blocks())
    }

    fn reserves(&mut self, token: Address, block: u64) -> Result<[Reserves; 2]> {
        self.exchanges(token)?;
        let ex = &self.exchanges[&token];
        Ok([ex.v1.reserves(&self.rpc, block)?, ex.v2.reserves(&self.rpc, block)?])
    }

    /// Price of `token` in reserve-asset units at `block`.
    pub fn price_in_reserve(&mut self, token: Address, block: u64) -> Result<Option<f64>> {
        let reserve = self.protocol.reserve_asset;
        self.price(token, reserve, block)
    }

    /// Price of one `token_a` in units of `token_b` at `block`; `None` when
    /// no generation has liquidity on both sides.
    pub fn price(&mut self, token_a: Address, token_b: Address, block: u64) -> Result<Option<f64>> {
        let reserve = self.protocol.reserve_asset;
        if token_a == token_b {
            return Ok(Some(1.0));
        }
        if token_a == reserve {
            let inverse = self.price(token_b, reserve, block)?;
            return Ok(inverse.filter(|p| *p != 0.0).map(|p| 1.0 / p));
        }

        let a = self.reserves(token_a, block)?;
        let contributions: Vec<(f64, f64)> = if token_b == reserve {
            a.iter().map(|r| (r.base, r.quote)).collect()
        } else {
            let b = self.reserves(token_b, block)?;
            a.iter()
                .zip(b.iter())
                .map(|(ra, rb)| reweight_pools(ra.base, ra.quote, rb.base, rb.quote))
                .collect()
        };
        Ok(combine(&contributions))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Generation;
    use crate::rpc::ReserveAsset;
    use crate::test_utils::{MockChain, addr, units};

    const WETH: u8 = 0xee;

    fn protocol() -> ProtocolConfig {
        let mut p = ProtocolConfig::mainnet();
        p.reserve_asset = addr(WETH);
        p.v1.deploy_block = 100;
        p.v2.deploy_block = 900;
        p
    }

    /// Token `t` gets a V1 exchange at 0x1t and a V2 pair at 0x2t.
    fn list(chain: &mut MockChain, t: u8, v1: Option<(u64, u64, u64)>, v2: Option<(u64, u64, u64)>) {
        let (token, weth) = (addr(t), addr(WETH));
        chain.decimals(token, 18);
        if let Some((at, tok, eth)) = v1 {
            let pool = addr(0x10 + t);
            chain
                .pair(Generation::V1, token, weth, pool)
                .deploy(pool, at)
                .balance(pool, ReserveAsset::Erc20(token), at, units(tok, 18))
                .balance(pool, ReserveAsset::Native, at, units(eth, 18));
        }
        if let Some((at, tok, eth)) = v2 {
            let pool = addr(0x20 + t);
            chain
                .pair(Generation::V2, token, weth, pool)
                .deploy(pool, at)
                .balance(pool, ReserveAsset::Erc20(token), at, units(tok, 18))
                .balance(pool, ReserveAsset::Erc20(weth), at, units(eth, 18));
        }
    }

    fn chain() -> MockChain {
        let mut chain = MockChain::linear(5_000, 0, 13);
        chain.decimals(addr(WETH), 18);
        chain
    }

    #[test]
    fn reweight_is_scale_invariant() {
        let (a, b) = reweight_pools(100.0, 5.0, 40.0, 8.0);
        let (a2, b2) = reweight_pools(200.0, 10.0, 40.0, 8.0);
        let (a3, b3) = reweight_pools(100.0, 5.0, 80.0, 16.0);
        assert!((b / a - b2 / a2).abs() < 1e-12);
        assert!((b / a - b3 / a3).abs() < 1e-12);
        // cross rate equals ratio of the two reserve-asset prices
        assert!((b / a - (5.0 / 100.0) / (8.0 / 40.0)).abs() < 1e-12);
    }

    #[test]
    fn reweight_scales_down_the_deeper_pool() {
        // A's pool holds more ether, so it is rescaled to B's ether volume
        let (a, b) = reweight_pools(1_000.0, 50.0, 10.0, 5.0);
        assert_eq!(b, 10.0);
        assert!((a - 100.0).abs() < 1e-9);
    }

    #[test]
    fn reweight_with_empty_side_contributes_nothing() {
        assert_eq!(reweight_pools(0.0, 5.0, 40.0, 8.0), (0.0, 0.0));
        assert_eq!(reweight_pools(100.0, 5.0, 40.0, 0.0), (0.0, 0.0));
    }

    #[test]
    fn combine_is_reserve_weighted() {
        assert_eq!(combine(&[(100.0, 1.0), (300.0, 5.0)]), Some(6.0 / 400.0));
        assert_eq!(combine(&[(0.0, 0.0), (0.0, 0.0)]), None);
    }

    #[test]
    fn one_generation_empty_gives_the_other_ratio() {
        let mut c = chain();
        list(&mut c, 1, None, Some((1_000, 400, 2)));
        let mut agg = PriceAggregator::new(&c, protocol());
        assert_eq!(agg.price_in_reserve(addr(1), 2_000).unwrap(), Some(2.0 / 400.0));
        // before the pair existed both generations are empty
        assert_eq!(agg.price_in_reserve(addr(1), 999).unwrap(), None);
    }

    #[test]
    fn both_generations_are_blended_by_liquidity() {
        let mut c = chain();
        list(&mut c, 1, Some((200, 100, 1)), Some((1_000, 300, 5)));
        let mut agg = PriceAggregator::new(&c, protocol());
        assert_eq!(agg.price_in_reserve(addr(1), 500).unwrap(), Some(0.01));
        assert_eq!(agg.price_in_reserve(addr(1), 2_000).unwrap(), Some(6.0 / 400.0));
        assert_eq!(agg.deploy_blocks(addr(1)).unwrap(), vec![200, 1_000]);
    }

    #[test]
    fn cross_price_through_reserve_asset() {
        let mut c = chain();
        // A = 0.05 eth, B = 0.2 eth, so one A is 0.25 B
        list(&mut c, 1, None, Some((1_000, 100, 5)));
        list(&mut c, 2, None, Some((1_000, 40, 8)));
        let mut agg = PriceAggregator::new(&c, protocol());
        let p = agg.price(addr(1), addr(2), 2_000).unwrap().unwrap();
        assert!((p - 0.25).abs() < 1e-12);

        let inv = agg.price(addr(WETH), addr(1), 2_000).unwrap().unwrap();
        assert!((inv - 20.0).abs() < 1e-9);
        assert_eq!(agg.price(addr(2), addr(2), 2_000).unwrap(), Some(1.0));
    }

    #[test]
    fn exchanges_are_connected_once() {
        let mut c = chain();
        list(&mut c, 1, None, Some((1_000, 100, 5)));
        let mut agg = PriceAggregator::new(&c, protocol());
        agg.price_in_reserve(addr(1), 2_000).unwrap();
        let calls = c.head_calls.get();
        agg.price_in_reserve(addr(1), 3_000).unwrap();
        assert_eq!(c.head_calls.get(), calls);
    }
}
