//! Deterministic in-memory chain for tests.
use crate::config::Generation;
use crate::rpc::{BlockHeader, ChainRpc, ReserveAsset};
use alloy_primitives::{Address, U256};
use anyhow::{Result, anyhow, bail};
use std::cell::Cell;
use std::collections::HashMap;

type TimestampFn = Box<dyn Fn(u64) -> i64>;

/// A chain whose block timestamps come from a closure and whose head can be
/// moved by the test. Contracts, pairs and balances are registered up front.
pub struct MockChain {
    timestamps: TimestampFn,
    head: Cell<u64>,
    /// Blocks the head advances by after every `latest_block` call.
    head_drift: Cell<u64>,
    deployments: HashMap<Address, u64>,
    pairs: HashMap<(Generation, Address, Address), Address>,
    decimals: HashMap<Address, u8>,
    /// Step schedule per balance: `(from_block, amount)` sorted by block.
    balances: HashMap<(Address, ReserveAsset), Vec<(u64, U256)>>,
    pub timestamp_calls: Cell<u32>,
    pub balance_calls: Cell<u32>,
    pub head_calls: Cell<u32>,
    timestamp_limit: Cell<Option<u32>>,
    balance_limit: Cell<Option<u32>>,
}

impl MockChain {
    pub fn new(head: u64, timestamps: impl Fn(u64) -> i64 + 'static) -> Self {
        Self {
            timestamps: Box::new(timestamps),
            head: Cell::new(head),
            head_drift: Cell::new(0),
            deployments: HashMap::new(),
            pairs: HashMap::new(),
            decimals: HashMap::new(),
            balances: HashMap::new(),
            timestamp_calls: Cell::new(0),
            balance_calls: Cell::new(0),
            head_calls: Cell::new(0),
            timestamp_limit: Cell::new(None),
            balance_limit: Cell::new(None),
        }
    }

    /// Block `n` is mined at `genesis_ts + block_time * n`.
    pub fn linear(head: u64, genesis_ts: i64, block_time: i64) -> Self {
        Self::new(head, move |n| genesis_ts + block_time * n as i64)
    }

    pub fn head(&self) -> u64 {
        self.head.get()
    }

    pub fn set_head(&self, head: u64) {
        self.head.set(head);
    }

    pub fn set_head_drift(&self, blocks: u64) {
        self.head_drift.set(blocks);
    }

    /// Fail every timestamp read once `limit` reads have succeeded.
    pub fn fail_timestamps_after(&self, limit: Option<u32>) {
        self.timestamp_limit.set(limit.map(|n| self.timestamp_calls.get() + n));
    }

    /// Fail every balance read once `limit` reads have succeeded.
    pub fn fail_balances_after(&self, limit: Option<u32>) {
        self.balance_limit.set(limit.map(|n| self.balance_calls.get() + n));
    }

    pub fn deploy(&mut self, address: Address, block: u64) -> &mut Self {
        self.deployments.insert(address, block);
        self
    }

    pub fn pair(&mut self, generation: Generation, token_a: Address, token_b: Address, pool: Address) -> &mut Self {
        self.pairs.insert((generation, token_a, token_b), pool);
        self
    }

    pub fn decimals(&mut self, token: Address, decimals: u8) -> &mut Self {
        self.decimals.insert(token, decimals);
        self
    }

    /// From `from_block` onwards `pool` holds `amount` of `asset`.
    pub fn balance(&mut self, pool: Address, asset: ReserveAsset, from_block: u64, amount: U256) -> &mut Self {
        let schedule = self.balances.entry((pool, asset)).or_default();
        schedule.push((from_block, amount));
        schedule.sort_by_key(|(b, _)| *b);
        self
    }

    fn check_block(&self, block: u64) -> Result<()> {
        if block > self.head.get() {
            bail!("block {block} is beyond head {}", self.head.get());
        }
        Ok(())
    }
}

impl ChainRpc for MockChain {
    fn latest_block(&self) -> Result<BlockHeader> {
        self.head_calls.set(self.head_calls.get() + 1);
        let number = self.head.get();
        self.head.set(number + self.head_drift.get());
        Ok(BlockHeader { number, timestamp: (self.timestamps)(number) })
    }

    fn block_timestamp(&self, number: u64) -> Result<i64> {
        self.check_block(number)?;
        if self.timestamp_limit.get().is_some_and(|limit| self.timestamp_calls.get() >= limit) {
            bail!("node unavailable");
        }
        self.timestamp_calls.set(self.timestamp_calls.get() + 1);
        Ok((self.timestamps)(number))
    }

    fn code_at(&self, address: Address, block: u64) -> Result<Vec<u8>> {
        self.check_block(block)?;
        match self.deployments.get(&address) {
            Some(&deployed) if block >= deployed => Ok(vec![0x60, 0x80]),
            _ => Ok(Vec::new()),
        }
    }

    fn reserve_balance(&self, pool: Address, asset: ReserveAsset, block: u64) -> Result<U256> {
        self.check_block(block)?;
        if self.balance_limit.get().is_some_and(|limit| self.balance_calls.get() >= limit) {
            bail!("node unavailable");
        }
        self.balance_calls.set(self.balance_calls.get() + 1);
        let amount = self
            .balances
            .get(&(pool, asset))
            .and_then(|s| s.iter().rev().find(|(from, _)| *from <= block))
            .map(|(_, amount)| *amount)
            .unwrap_or(U256::ZERO);
        Ok(amount)
    }

    fn resolve_pair_address(
        &self,
        generation: Generation,
        _factory: Address,
        token_a: Address,
        token_b: Address,
    ) -> Result<Address> {
        Ok(self.pairs.get(&(generation, token_a, token_b)).copied().unwrap_or(Address::ZERO))
    }

    fn token_decimals(&self, token: Address) -> Result<u8> {
        self.decimals.get(&token).copied().ok_or_else(|| anyhow!("no decimals registered for {token}"))
    }
}

/// `whole * 10^decimals` as a raw balance.
pub fn units(whole: u64, decimals: u8) -> U256 {
    U256::from(whole) * U256::from(10u64).pow(U256::from(decimals))
}

/// Deterministic distinct address for tests.
pub fn addr(n: u8) -> Address {
    Address::repeat_byte(n)
}
