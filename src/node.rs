//! [`ChainRpc`] over an Ethereum node's JSON-RPC HTTP endpoint.
use crate::config::Generation;
use crate::error::HistoryError;
use crate::rpc::{BlockHeader, ChainRpc, ReserveAsset};
use alloy_primitives::{Address, U256};
use anyhow::{Context, Result, anyhow, bail};
use reqwest::blocking::Client;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::thread;
use std::time::Duration;

const BALANCE_OF_SELECTOR: [u8; 4] = [0x70, 0xa0, 0x82, 0x31];
const DECIMALS_SELECTOR: [u8; 4] = [0x31, 0x3c, 0xe5, 0x67];
const GET_EXCHANGE_SELECTOR: [u8; 4] = [0x06, 0xf2, 0xbf, 0x62];
const GET_PAIR_SELECTOR: [u8; 4] = [0xe6, 0xa4, 0x39, 0x05];

pub struct HttpNode {
    url: String,
    client: Client,
    throttle: Duration,
}

#[derive(Serialize)]
struct RpcRequest<'a> {
    jsonrpc: &'static str,
    id: u64,
    method: &'a str,
    params: serde_json::Value,
}

#[derive(Deserialize)]
struct RpcResponse<T> {
    result: Option<T>,
    error: Option<RpcError>,
}

#[derive(Deserialize)]
struct RpcError {
    code: i64,
    message: String,
}

#[derive(Deserialize)]
struct EthBlock {
    timestamp: String,
}

impl HttpNode {
    /// `throttle` is slept after every successful call.
    pub fn new(url: impl Into<String>, timeout: Duration, throttle: Duration) -> Result<Self> {
        let client = Client::builder().timeout(timeout).build().context("build http client")?;
        Ok(Self { url: url.into(), client, throttle })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    fn call<T: DeserializeOwned>(&self, method: &str, params: serde_json::Value) -> Result<T> {
        let req = RpcRequest { jsonrpc: "2.0", id: 1, method, params };
        let resp = self
            .client
            .post(&self.url)
            .json(&req)
            .send()
            .with_context(|| format!("{method} to {}", self.url))?
            .error_for_status()?;
        let resp: RpcResponse<T> = resp.json().with_context(|| format!("decode {method} response"))?;
        if let Some(err) = resp.error {
            return Err(HistoryError::Rpc { code: err.code, message: err.message }.into());
        }
        let result = resp.result.ok_or_else(|| anyhow!("missing result for {method}"))?;
        if !self.throttle.is_zero() {
            thread::sleep(self.throttle);
        }
        Ok(result)
    }

    fn eth_call(&self, to: Address, data: &[u8], block: Option<u64>) -> Result<Vec<u8>> {
        let call = json!({ "to": to.to_string(), "data": format!("0x{}", hex::encode(data)) });
        let raw: String = self.call("eth_call", json!([call, block_tag(block)]))?;
        decode_hex_bytes(&raw)
    }

    fn block(&self, tag: serde_json::Value) -> Result<EthBlock> {
        let block: Option<EthBlock> = self.call("eth_getBlockByNumber", json!([&tag, false]))?;
        block.ok_or_else(|| anyhow!("node returned no block for {tag}"))
    }
}

impl ChainRpc for HttpNode {
    fn latest_block(&self) -> Result<BlockHeader> {
        let raw: String = self.call("eth_blockNumber", json!([]))?;
        let number = parse_hex_u64(&raw)?;
        Ok(BlockHeader { number, timestamp: self.block_timestamp(number)? })
    }

    fn block_timestamp(&self, number: u64) -> Result<i64> {
        let block = self.block(block_tag(Some(number)))?;
        Ok(parse_hex_u64(&block.timestamp)? as i64)
    }

    fn code_at(&self, address: Address, block: u64) -> Result<Vec<u8>> {
        let raw: String = self.call("eth_getCode", json!([address.to_string(), block_tag(Some(block))]))?;
        decode_hex_bytes(&raw)
    }

    fn reserve_balance(&self, pool: Address, asset: ReserveAsset, block: u64) -> Result<U256> {
        match asset {
            ReserveAsset::Native => {
                let raw: String = self.call("eth_getBalance", json!([pool.to_string(), block_tag(Some(block))]))?;
                parse_hex_u256(&raw)
            }
            ReserveAsset::Erc20(token) => {
                let out = self.eth_call(token, &encode_call(BALANCE_OF_SELECTOR, &[pool]), Some(block))?;
                decode_u256_word(&out)
            }
        }
    }

    fn resolve_pair_address(
        &self,
        generation: Generation,
        factory: Address,
        token_a: Address,
        token_b: Address,
    ) -> Result<Address> {
        let data = match generation {
            Generation::V1 => encode_call(GET_EXCHANGE_SELECTOR, &[token_a]),
            Generation::V2 => encode_call(GET_PAIR_SELECTOR, &[token_a, token_b]),
        };
        let out = self.eth_call(factory, &data, None)?;
        decode_address_word(&out)
    }

    fn token_decimals(&self, token: Address) -> Result<u8> {
        let out = self.eth_call(token, &encode_call(DECIMALS_SELECTOR, &[]), None)?;
        let value = decode_u256_word(&out).with_context(|| format!("decimals() of {token}"))?;
        if value > U256::from(u8::MAX) {
            bail!("decimals() of {token} out of range: {value}");
        }
        Ok(value.as_limbs()[0] as u8)
    }
}

fn block_tag(block: Option<u64>) -> serde_json::Value {
    match block {
        Some(height) => json!(format!("0x{:x}", height)),
        None => json!("latest"),
    }
}

/// Selector followed by each address left-padded to a 32-byte word.
fn encode_call(selector: [u8; 4], args: &[Address]) -> Vec<u8> {
    let mut data = Vec::with_capacity(4 + 32 * args.len());
    data.extend_from_slice(&selector);
    for arg in args {
        data.extend_from_slice(&[0u8; 12]);
        data.extend_from_slice(arg.as_slice());
    }
    data
}

fn parse_hex_u64(raw: &str) -> Result<u64> {
    let trimmed = raw.trim_start_matches("0x");
    u64::from_str_radix(trimmed, 16).map_err(|e| anyhow!("invalid hex u64 '{raw}': {e}"))
}

fn parse_hex_u256(raw: &str) -> Result<U256> {
    let trimmed = raw.trim_start_matches("0x");
    if trimmed.is_empty() {
        return Ok(U256::ZERO);
    }
    U256::from_str_radix(trimmed, 16).map_err(|e| anyhow!("invalid hex quantity '{raw}': {e}"))
}

fn decode_hex_bytes(raw: &str) -> Result<Vec<u8>> {
    let trimmed = raw.trim_start_matches("0x");
    hex::decode(trimmed).map_err(|e| anyhow!("invalid hex data: {e}"))
}

fn decode_u256_word(bytes: &[u8]) -> Result<U256> {
    if bytes.len() < 32 {
        bail!("eth_call result too short for uint256: {} bytes", bytes.len());
    }
    Ok(U256::from_be_slice(&bytes[..32]))
}

fn decode_address_word(bytes: &[u8]) -> Result<Address> {
    if bytes.len() < 32 {
        bail!("eth_call result too short for address: {} bytes", bytes.len());
    }
    Ok(Address::from_slice(&bytes[12..32]))
}
