use alloy_primitives::{Address, U256, address};
use anyhow::{Result, bail};
use blockprice::blocktimes::{BlockTimeIndex, Seed};
use blockprice::config::{DataLayout, Generation, ProtocolConfig};
use blockprice::history::{CalcOutcome, PriceHistoryCache};
use blockprice::price::PriceAggregator;
use blockprice::registry::{TokenId, TokenRegistry};
use blockprice::rpc::{BlockHeader, ChainRpc, ReserveAsset};
use std::cell::Cell;
use std::collections::HashMap;

const WETH: Address = address!("eeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeee");

/// Block n mined at 1000 + 10n. Each listed token has a V2 pair deployed at
/// `deployed` and funded from `funded` on.
struct Chain {
    head: Cell<u64>,
    listings: HashMap<Address, Listing>,
}

struct Listing {
    pool: Address,
    deployed: u64,
    funded: u64,
    token_units: u64,
    weth_units: u64,
}

impl Chain {
    fn new(head: u64) -> Self {
        Self { head: Cell::new(head), listings: HashMap::new() }
    }

    fn list(&mut self, token: Address, pool: Address, deployed: u64, funded: u64, token_units: u64, weth_units: u64) {
        self.listings.insert(token, Listing { pool, deployed, funded, token_units, weth_units });
    }

    fn check(&self, block: u64) -> Result<()> {
        if block > self.head.get() {
            bail!("block {block} beyond head");
        }
        Ok(())
    }
}

fn wei(units: u64) -> U256 {
    U256::from(units) * U256::from(10u64).pow(U256::from(18u64))
}

impl ChainRpc for Chain {
    fn latest_block(&self) -> Result<BlockHeader> {
        let number = self.head.get();
        Ok(BlockHeader { number, timestamp: 1000 + 10 * number as i64 })
    }

    fn block_timestamp(&self, number: u64) -> Result<i64> {
        self.check(number)?;
        Ok(1000 + 10 * number as i64)
    }

    fn code_at(&self, address: Address, block: u64) -> Result<Vec<u8>> {
        self.check(block)?;
        let deployed = self.listings.values().any(|l| l.pool == address && block >= l.deployed);
        Ok(if deployed { vec![0x60] } else { Vec::new() })
    }

    fn reserve_balance(&self, pool: Address, asset: ReserveAsset, block: u64) -> Result<U256> {
        self.check(block)?;
        let Some((token, l)) = self.listings.iter().find(|(_, l)| l.pool == pool) else {
            return Ok(U256::ZERO);
        };
        if block < l.funded {
            return Ok(U256::ZERO);
        }
        Ok(match asset {
            ReserveAsset::Erc20(a) if a == *token => wei(l.token_units),
            ReserveAsset::Erc20(a) if a == WETH => wei(l.weth_units),
            _ => U256::ZERO,
        })
    }

    fn resolve_pair_address(&self, generation: Generation, _: Address, token_a: Address, token_b: Address) -> Result<Address> {
        if generation != Generation::V2 || token_b != WETH {
            return Ok(Address::ZERO);
        }
        Ok(self.listings.get(&token_a).map_or(Address::ZERO, |l| l.pool))
    }

    fn token_decimals(&self, _: Address) -> Result<u8> {
        Ok(18)
    }
}

fn protocol() -> ProtocolConfig {
    let mut p = ProtocolConfig::mainnet();
    p.reserve_asset = WETH;
    p.v1.deploy_block = 50;
    p.v2.deploy_block = 50;
    p
}

fn registry() -> TokenRegistry {
    let mut r = TokenRegistry::default();
    r.insert("AAA", Address::repeat_byte(0x0a), "Token A");
    r.insert("BBB", Address::repeat_byte(0x0b), "Token B");
    r
}

#[test]
fn index_build_update_and_persist() {
    let dir = tempfile::tempdir().unwrap();
    let layout = DataLayout::new(dir.path());
    let chain = Chain::new(300);

    let index = BlockTimeIndex::generate(&chain, Seed { block_num: 0, timestamp: 1000 }, None, 100).unwrap();
    assert_eq!(index.len(), 30);
    index.save(&layout.index_path()).unwrap();

    let raw: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(layout.index_path()).unwrap()).unwrap();
    assert!(raw.get("block_diffs").is_some());
    assert!(raw.get("block_nums").is_none());

    chain.head.set(450);
    let mut loaded = BlockTimeIndex::load(&layout.index_path()).unwrap();
    assert_eq!(loaded, index);
    assert_eq!(loaded.update(&chain).unwrap(), 15);
    assert_eq!(&loaded.entries()[..30], index.entries());
    assert!(loaded.block_nums().zip(loaded.block_nums().skip(1)).all(|(a, b)| a < b));

    // target 1300 sits exactly on block 30
    assert_eq!(loaded.lookup(1300), Some((30, 1300)));
}

#[test]
fn price_histories_resume_and_export() {
    let dir = tempfile::tempdir().unwrap();
    let layout = DataLayout::new(dir.path());
    let reg = registry();
    reg.export(&layout.tokens_export_path()).unwrap();
    let a = reg.resolve(&TokenId::from("AAA")).unwrap();
    let b = reg.resolve(&TokenId::from(format!("{}", Address::repeat_byte(0x0b)).as_str())).unwrap();
    assert_eq!(b.symbol, "BBB");

    let mut chain = Chain::new(300);
    chain.list(a.address, Address::repeat_byte(0xa1), 120, 150, 1_000, 4);
    chain.list(b.address, Address::repeat_byte(0xb1), 240, 250, 10, 5);
    let mut index = BlockTimeIndex::generate(&chain, Seed { block_num: 0, timestamp: 1000 }, None, 100).unwrap();

    // first pass: A is liquid from block 150 (period 14); B from 250 (period 24)
    {
        let mut prices = PriceAggregator::new(&chain, protocol());
        let mut cache = PriceHistoryCache::new(layout.clone());
        assert_eq!(
            cache.calculate(&mut prices, &index, &a, false).unwrap(),
            CalcOutcome::Started { start_index: 14, appended: 16 }
        );
        assert_eq!(
            cache.calculate(&mut prices, &index, &b, false).unwrap(),
            CalcOutcome::Started { start_index: 24, appended: 6 }
        );
        assert!(cache.get(&a.address).unwrap().prices.iter().all(|p| (*p - 0.004).abs() < 1e-12));
        cache.save_token(&a.address).unwrap();
        cache.save_token(&b.address).unwrap();
    }

    // second pass from disk after the chain advanced
    chain.head.set(450);
    index.update(&chain).unwrap();
    let mut prices = PriceAggregator::new(&chain, protocol());
    let mut cache = PriceHistoryCache::new(layout.clone());
    assert!(cache.load_token(&index, &a).unwrap());
    assert!(cache.load_token(&index, &b).unwrap());
    assert_eq!(cache.calculate(&mut prices, &index, &a, false).unwrap(), CalcOutcome::Extended { appended: 15 });
    assert_eq!(cache.calculate(&mut prices, &index, &b, false).unwrap(), CalcOutcome::Extended { appended: 15 });

    let aligned = cache.align(&index, &[a.clone(), b.clone()]).unwrap();
    assert_eq!(aligned.start_index, 14);
    assert_eq!(aligned.len(), 45 - 14);
    assert!(aligned.series[1].prices[..10].iter().all(Option::is_none));
    assert_eq!(aligned.series[1].prices[10], Some(0.5));

    let doc = aligned.to_json(&index).unwrap();
    assert_eq!(doc["time"][0], "1970-01-01T00:41:40Z");
    assert_eq!(doc["AAA"].as_array().unwrap().len(), 31);
    assert!(doc["BBB"][0].is_null());

    // registry round-trips through the data directory copy
    assert_eq!(TokenRegistry::load(&layout.tokens_export_path()).unwrap(), reg);
}
