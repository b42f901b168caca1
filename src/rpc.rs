//! Node queries the index and price code depend on.
//!
//! Implementations must fail fast: a read either answers or errors, it never
//! hangs. Nothing here retries; a caller that wants a retry policy wraps the
//! implementation.
use crate::config::Generation;
use alloy_primitives::{Address, U256};
use anyhow::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockHeader {
    pub number: u64,
    pub timestamp: i64,
}

/// Which balance of a pool to read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReserveAsset {
    /// Native ether held by the contract.
    Native,
    /// ERC-20 `balanceOf(pool)`.
    Erc20(Address),
}

pub trait ChainRpc {
    fn latest_block(&self) -> Result<BlockHeader>;

    fn block_timestamp(&self, number: u64) -> Result<i64>;

    /// Contract code at `address` as of `block`; empty iff nothing is deployed.
    fn code_at(&self, address: Address, block: u64) -> Result<Vec<u8>>;

    /// Raw (undecimalised) balance of `asset` held by `pool` at `block`.
    fn reserve_balance(&self, pool: Address, asset: ReserveAsset, block: u64) -> Result<U256>;

    /// Exchange or pair address registered in `factory` for the token pair.
    /// V1 factories key exchanges by `token_a` alone. Returns the zero
    /// address when the factory has none.
    fn resolve_pair_address(
        &self,
        generation: Generation,
        factory: Address,
        token_a: Address,
        token_b: Address,
    ) -> Result<Address>;

    fn token_decimals(&self, token: Address) -> Result<u8>;
}

impl<T: ChainRpc + ?Sized> ChainRpc for &T {
    fn latest_block(&self) -> Result<BlockHeader> {
        (**self).latest_block()
    }

    fn block_timestamp(&self, number: u64) -> Result<i64> {
        (**self).block_timestamp(number)
    }

    fn code_at(&self, address: Address, block: u64) -> Result<Vec<u8>> {
        (**self).code_at(address, block)
    }

    fn reserve_balance(&self, pool: Address, asset: ReserveAsset, block: u64) -> Result<U256> {
        (**self).reserve_balance(pool, asset, block)
    }

    fn resolve_pair_address(
        &self,
        generation: Generation,
        factory: Address,
        token_a: Address,
        token_b: Address,
    ) -> Result<Address> {
        (**self).resolve_pair_address(generation, factory, token_a, token_b)
    }

    fn token_decimals(&self, token: Address) -> Result<u8> {
        (**self).token_decimals(token)
    }
}
