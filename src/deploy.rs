//! Locating the block at which a contract was deployed.
use crate::rpc::ChainRpc;
use crate::search::find_first_true;
use alloy_primitives::Address;
use anyhow::Result;
use tracing::debug;

/// First block at which `address` has code.
///
/// `lower_bound` must be a block at which the contract did not exist yet
/// (for an exchange, its factory's deploy block is a safe choice).
/// `upper_bound` defaults to the current head. Contracts that were
/// self-destructed and redeployed give an unspecified block in between.
pub fn find_deploy_block<R: ChainRpc>(
    rpc: &R,
    address: Address,
    lower_bound: u64,
    upper_bound: Option<u64>,
) -> Result<u64> {
    let upper = match upper_bound {
        Some(b) => b,
        None => rpc.latest_block()?.number,
    };
    let block = find_first_true(lower_bound, upper, |b| Ok(!rpc.code_at(address, b)?.is_empty()))?;
    debug!(%address, block, "deploy block located");
    Ok(block)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{MockChain, addr};

    #[test]
    fn finds_first_block_with_code() {
        let mut chain = MockChain::linear(10_000, 0, 13);
        chain.deploy(addr(1), 6_543);
        assert_eq!(find_deploy_block(&chain, addr(1), 1_000, None).unwrap(), 6_543);
        assert_eq!(find_deploy_block(&chain, addr(1), 6_542, Some(6_600)).unwrap(), 6_543);
    }

    #[test]
    fn contract_deployed_at_head() {
        let mut chain = MockChain::linear(500, 0, 13);
        chain.deploy(addr(2), 500);
        assert_eq!(find_deploy_block(&chain, addr(2), 0, None).unwrap(), 500);
    }
}
