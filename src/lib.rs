//! Block time index and AMM price history library.
//!
//! This crate provides the core types and logic used by the `blockprice`
//! builder binary and the `export` tool:
//!
//! - `search`: interpolation and binary search over monotonic functions
//! - `blocktimes`: regular time axis over the irregular block sequence,
//!   generated by interpolation search and extended as the head advances
//! - `deploy`: first block at which a contract's code exists
//! - `exchange`: reserve reader for one Uniswap V1 exchange or V2 pair
//! - `price`: reserve-weighted spot price across both AMM generations
//! - `history`: per-token price series cache and multi-series alignment
//!
//! The node itself is reached through the [`rpc::ChainRpc`] trait; the
//! binaries in this repository use the blocking JSON-RPC client in `node`.
pub mod blocktimes;
pub mod config;
pub mod deploy;
pub mod error;
pub mod exchange;
pub mod history;
pub mod node;
pub mod price;
pub mod registry;
pub mod rpc;
pub mod search;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
