//! Token registry and identifier resolution.
use crate::error::HistoryError;
use alloy_primitives::Address;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;
use std::str::FromStr;

/// Registry entry as stored in the tokens file, keyed by symbol.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenEntry {
    pub address: Address,
    pub name: String,
}

/// Fully resolved token identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenInfo {
    pub symbol: String,
    pub address: Address,
    pub name: String,
}

/// A token named either by registry symbol or by contract address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenId {
    BySymbol(String),
    ByAddress(Address),
}

impl FromStr for TokenId {
    type Err = std::convert::Infallible;

    /// Anything that parses as a 20-byte hex address is an address;
    /// everything else is taken as a symbol.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        Ok(match s.parse::<Address>() {
            Ok(address) if s.starts_with("0x") || s.starts_with("0X") => TokenId::ByAddress(address),
            _ => TokenId::BySymbol(s.to_string()),
        })
    }
}

impl fmt::Display for TokenId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TokenId::BySymbol(s) => f.write_str(s),
            TokenId::ByAddress(a) => write!(f, "{a}"),
        }
    }
}

impl From<Address> for TokenId {
    fn from(address: Address) -> Self {
        TokenId::ByAddress(address)
    }
}

impl From<&str> for TokenId {
    fn from(s: &str) -> Self {
        match s.parse() {
            Ok(id) => id,
            Err(never) => match never {},
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TokenRegistry {
    tokens: BTreeMap<String, TokenEntry>,
}

impl TokenRegistry {
    pub fn new(tokens: BTreeMap<String, TokenEntry>) -> Self {
        Self { tokens }
    }

    /// Load a `{ "SYMBOL": {"address": "0x..", "name": ".."} }` file.
    pub fn load(path: &Path) -> Result<Self> {
        let f = File::open(path).with_context(|| format!("open {:?}", path))?;
        let tokens = serde_json::from_reader(BufReader::new(f)).with_context(|| format!("decode {:?}", path))?;
        Ok(Self { tokens })
    }

    /// Write the registry in compact form.
    pub fn export(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).with_context(|| format!("create {:?}", parent))?;
            }
        }
        let mut w = BufWriter::new(File::create(path).with_context(|| format!("create {:?}", path))?);
        serde_json::to_writer(&mut w, &self.tokens)?;
        w.flush()?;
        Ok(())
    }

    pub fn insert(&mut self, symbol: impl Into<String>, address: Address, name: impl Into<String>) {
        self.tokens.insert(symbol.into(), TokenEntry { address, name: name.into() });
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    pub fn symbols(&self) -> impl Iterator<Item = &str> {
        self.tokens.keys().map(String::as_str)
    }

    /// Every registered token in symbol order.
    pub fn all(&self) -> Vec<TokenInfo> {
        self.tokens
            .iter()
            .map(|(symbol, e)| TokenInfo { symbol: symbol.clone(), address: e.address, name: e.name.clone() })
            .collect()
    }

    pub fn resolve(&self, id: &TokenId) -> Result<TokenInfo, HistoryError> {
        let found = match id {
            TokenId::BySymbol(symbol) => self.tokens.get_key_value(symbol.as_str()),
            TokenId::ByAddress(address) => self.tokens.iter().find(|(_, e)| e.address == *address),
        };
        found
            .map(|(symbol, e)| TokenInfo { symbol: symbol.clone(), address: e.address, name: e.name.clone() })
            .ok_or_else(|| HistoryError::UnknownIdentifier(id.to_string()))
    }
}
