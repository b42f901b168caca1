//! Per-token price series over the block time index.
//!
//! A series starts at the first period in which the token had liquidity and
//! from then on has one value per period, including `0.0` for periods where
//! the pools were empty. Series are only ever appended to, so extending a
//! cached series after the index has grown costs one price computation per
//! new period.
use crate::blocktimes::BlockTimeIndex;
use crate::config::DataLayout;
use crate::error::HistoryError;
use crate::price::PriceAggregator;
use crate::registry::TokenInfo;
use crate::rpc::ChainRpc;
use alloy_primitives::Address;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, ErrorKind, Write};
use std::path::Path;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

const PROGRESS_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceHistoryRecord {
    pub symbol: String,
    pub address: Address,
    pub start_index: usize,
    /// Price in reserve-asset units per period; `0.0` means no liquidity.
    pub prices: Vec<f64>,
}

impl PriceHistoryRecord {
    /// Index of the first period not yet computed.
    pub fn end_index(&self) -> usize {
        self.start_index + self.prices.len()
    }

    pub fn load(path: &Path) -> Result<Option<Self>> {
        let f = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e).with_context(|| format!("open {:?}", path)),
        };
        let record = serde_json::from_reader(BufReader::new(f)).map_err(|e| HistoryError::Malformed {
            kind: "price history",
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        Ok(Some(record))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).with_context(|| format!("create {:?}", parent))?;
            }
        }
        let tmp = path.with_extension("json.tmp");
        let mut w = BufWriter::new(File::create(&tmp).with_context(|| format!("create {:?}", tmp))?);
        serde_json::to_writer(&mut w, self)?;
        w.flush()?;
        drop(w);
        fs::rename(&tmp, path).with_context(|| format!("rename {:?} -> {:?}", tmp, path))?;
        Ok(())
    }
}

/// What a [`PriceHistoryCache::calculate`] call did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CalcOutcome {
    /// A new series was started at `start_index`.
    Started { start_index: usize, appended: usize },
    /// An existing series was extended.
    Extended { appended: usize },
    /// No pool had liquidity yet; nothing was recorded.
    NotListed,
}

/// One token's values on an [`AlignedSeries`] timeline. `None` marks periods
/// before the token's series started.
#[derive(Debug, Clone, PartialEq)]
pub struct TokenSeries {
    pub symbol: String,
    pub address: Address,
    pub prices: Vec<Option<f64>>,
}

/// Several series on one shared timeline.
#[derive(Debug, Clone, PartialEq)]
pub struct AlignedSeries {
    pub start_index: usize,
    pub timestamps: Vec<i64>,
    pub series: Vec<TokenSeries>,
}

impl AlignedSeries {
    pub fn len(&self) -> usize {
        self.timestamps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timestamps.is_empty()
    }

    /// `{"time": [RFC 3339...], "<SYMBOL>": [number|null...]}`.
    pub fn to_json(&self, index: &BlockTimeIndex) -> Result<serde_json::Value> {
        let mut out = serde_json::Map::new();
        let times = (self.start_index..self.start_index + self.len())
            .map(|i| index.datetime_string(i))
            .collect::<Result<Vec<_>>>()?;
        out.insert("time".into(), serde_json::to_value(times)?);
        for s in &self.series {
            out.insert(s.symbol.clone(), serde_json::to_value(&s.prices)?);
        }
        Ok(serde_json::Value::Object(out))
    }
}

/// Cached price series, keyed by token address.
#[derive(Debug, Clone)]
pub struct PriceHistoryCache {
    layout: DataLayout,
    records: HashMap<Address, PriceHistoryRecord>,
}

impl PriceHistoryCache {
    pub fn new(layout: DataLayout) -> Self {
        Self { layout, records: HashMap::new() }
    }

    pub fn get(&self, token: &Address) -> Option<&PriceHistoryRecord> {
        self.records.get(token)
    }

    pub fn insert(&mut self, record: PriceHistoryRecord) {
        self.records.insert(record.address, record);
    }

    pub fn records(&self) -> impl Iterator<Item = &PriceHistoryRecord> {
        self.records.values()
    }

    /// Read the token's persisted series if there is one. Returns whether a
    /// series was found.
    ///
    /// A series recorded for another address, or one reaching past the end
    /// of `index`, was built against something else and is rejected.
    pub fn load_token(&mut self, index: &BlockTimeIndex, token: &TokenInfo) -> Result<bool> {
        let path = self.layout.history_path(&token.address);
        let Some(mut record) = PriceHistoryRecord::load(&path)? else {
            debug!(symbol = %token.symbol, "no price history found");
            return Ok(false);
        };
        let malformed = |reason: String| HistoryError::Malformed {
            kind: "price history",
            path: path.display().to_string(),
            reason,
        };
        if record.address != token.address {
            return Err(malformed(format!("recorded for {} instead of {}", record.address, token.address)).into());
        }
        if record.end_index() > index.len() {
            return Err(malformed(format!(
                "series ends at period {} but the index has {}",
                record.end_index(),
                index.len()
            ))
            .into());
        }
        record.symbol = token.symbol.clone();
        self.records.insert(token.address, record);
        Ok(true)
    }

    pub fn save_token(&self, token: &Address) -> Result<()> {
        let record = self.records.get(token).ok_or_else(|| HistoryError::MissingHistory(token.to_string()))?;
        record.save(&self.layout.history_path(token))
    }

    /// Compute a new series for `token`, or extend its cached one up to the
    /// end of `index`.
    pub fn calculate<R: ChainRpc>(
        &mut self,
        prices: &mut PriceAggregator<R>,
        index: &BlockTimeIndex,
        token: &TokenInfo,
        clear_existing: bool,
    ) -> Result<CalcOutcome> {
        if clear_existing && self.records.remove(&token.address).is_some() {
            info!(symbol = %token.symbol, "discarding cached price history");
        }

        let (mut record, started) = match self.records.remove(&token.address) {
            Some(record) => (record, None),
            None => match first_liquid_period(prices, index, token)? {
                Some((start_index, first_price)) => {
                    let record = PriceHistoryRecord {
                        symbol: token.symbol.clone(),
                        address: token.address,
                        start_index,
                        prices: vec![first_price],
                    };
                    (record, Some(start_index))
                }
                None => {
                    info!(symbol = %token.symbol, "no liquid period yet");
                    return Ok(CalcOutcome::NotListed);
                }
            },
        };

        // keep whatever was computed even if a node call fails midway
        let from = record.end_index();
        let extended = extend_series(prices, index, token, &mut record);
        self.records.insert(token.address, record);
        let appended = extended?;

        Ok(match started {
            Some(start_index) => CalcOutcome::Started { start_index, appended: appended + 1 },
            None => {
                debug!(symbol = %token.symbol, from, appended, "price history extended");
                CalcOutcome::Extended { appended }
            }
        })
    }

    /// Load, extend and persist one token's series.
    ///
    /// Whatever was computed is saved even when a node call fails midway, so
    /// the next run resumes from there; the error is returned afterwards.
    pub fn update_token<R: ChainRpc>(
        &mut self,
        prices: &mut PriceAggregator<R>,
        index: &BlockTimeIndex,
        token: &TokenInfo,
        clear_existing: bool,
    ) -> Result<CalcOutcome> {
        if !clear_existing {
            self.load_token(index, token)?;
        }
        let outcome = self.calculate(prices, index, token, clear_existing);
        if self.records.contains_key(&token.address) {
            if let Err(e) = self.save_token(&token.address) {
                return match outcome {
                    Ok(_) => Err(e),
                    Err(calc) => {
                        warn!(symbol = %token.symbol, error = %e, "partial price history not saved");
                        Err(calc)
                    }
                };
            }
        }
        outcome
    }

    /// Align the cached series of `tokens` (every cached token when empty)
    /// onto one timeline.
    ///
    /// The timeline starts at the earliest `start_index` among them; later
    /// series are left-padded with `None`. It ends where the shortest series
    /// ends so that every row is complete.
    pub fn align(&self, index: &BlockTimeIndex, tokens: &[TokenInfo]) -> Result<AlignedSeries> {
        if index.is_empty() {
            return Err(HistoryError::EmptyIndex.into());
        }
        let mut records: Vec<&PriceHistoryRecord> = if tokens.is_empty() {
            let mut all: Vec<_> = self.records.values().collect();
            all.sort_by(|a, b| a.symbol.cmp(&b.symbol));
            all
        } else {
            tokens
                .iter()
                .map(|t| self.records.get(&t.address).ok_or_else(|| HistoryError::MissingHistory(t.symbol.clone())))
                .collect::<Result<_, _>>()?
        };
        records.retain(|r| !r.prices.is_empty());

        let Some(start) = records.iter().map(|r| r.start_index).min() else {
            return Ok(AlignedSeries { start_index: 0, timestamps: Vec::new(), series: Vec::new() });
        };
        let full_end = records.iter().map(|r| r.end_index()).max().unwrap_or(start).min(index.len());
        let end = records.iter().map(|r| r.end_index()).min().unwrap_or(start).min(index.len());
        if end < full_end {
            warn!(end, full_end, "timeline truncated to the shortest series; some histories need updating");
        }

        let series = records
            .iter()
            .map(|r| {
                let pad = r.start_index - start;
                let prices = std::iter::repeat_n(None, pad)
                    .chain(r.prices.iter().copied().map(Some))
                    .take(end.saturating_sub(start))
                    .collect();
                TokenSeries { symbol: r.symbol.clone(), address: r.address, prices }
            })
            .collect();

        Ok(AlignedSeries {
            start_index: start,
            timestamps: (start..end).map(|i| index.timestamp(i)).collect(),
            series,
        })
    }
}

/// Locate where a new series begins: the first period at or after the
/// latest deploy block among the token's exchanges that has a nonzero
/// price. Returns that period and its price.
fn first_liquid_period<R: ChainRpc>(
    prices: &mut PriceAggregator<R>,
    index: &BlockTimeIndex,
    token: &TokenInfo,
) -> Result<Option<(usize, f64)>> {
    let Some(deployed) = prices.deploy_blocks(token.address)?.into_iter().max() else {
        return Ok(None);
    };
    let Some(first) = index.first_index_at_or_after(deployed) else {
        return Ok(None);
    };
    for (i, block) in index.block_nums().enumerate().skip(first) {
        match prices.price_in_reserve(token.address, block)? {
            Some(p) if p != 0.0 => {
                info!(symbol = %token.symbol, start_index = i, skipped = i - first, "price history starts");
                return Ok(Some((i, p)));
            }
            _ => {}
        }
    }
    Ok(None)
}

/// Append a price for every period after the record's last one.
fn extend_series<R: ChainRpc>(
    prices: &mut PriceAggregator<R>,
    index: &BlockTimeIndex,
    token: &TokenInfo,
    record: &mut PriceHistoryRecord,
) -> Result<usize> {
    let from = record.end_index();
    let total = index.len().saturating_sub(from);
    let started = Instant::now();
    let mut last_report = Instant::now();

    for (n, block) in index.block_nums().skip(from).enumerate() {
        let price = prices.price_in_reserve(token.address, block)?.unwrap_or(0.0);
        record.prices.push(price);
        if last_report.elapsed() >= PROGRESS_INTERVAL {
            debug!(symbol = %token.symbol, done = n + 1, total, "calculating prices");
            last_report = Instant::now();
        }
    }
    if total > 0 {
        info!(symbol = %token.symbol, periods = total, elapsed = ?started.elapsed(), "prices calculated");
    }
    Ok(total)
}
