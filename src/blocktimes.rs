//! Regular time axis over the block sequence.
//!
//! Period `i` starts at the ideal boundary `start_ts + i * delta`. Its entry
//! holds the first block mined at or after that boundary together with the
//! signed offset between the block's timestamp and the boundary, so the
//! actual timestamp is `start_ts + i * delta + ts_offset`.
//!
//! On disk, block numbers are delta-encoded (`block_diffs`) since they are
//! strictly increasing and the differences are much smaller than the
//! absolute values. Offsets are stored as-is.
use crate::error::HistoryError;
use crate::rpc::ChainRpc;
use crate::search::{Probe, Resolution, interpolation_search};
use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;
use std::time::Instant;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockTimeEntry {
    pub block_num: u64,
    pub ts_offset: i64,
}

/// A block whose timestamp is known, used to warm-start the next search.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Seed {
    pub block_num: u64,
    pub timestamp: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockTimeIndex {
    start_ts: i64,
    delta: i64,
    entries: Vec<BlockTimeEntry>,
}

/// Serialized form. `block_nums` is the legacy absolute encoding and is only
/// read, never written.
#[derive(Debug, Serialize, Deserialize)]
struct IndexFile {
    start_ts: i64,
    delta: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    block_diffs: Option<Vec<u64>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    block_nums: Option<Vec<u64>>,
    ts_offsets: Vec<i64>,
}

/// First period boundary strictly after genesis.
pub fn aligned_start(genesis_ts: i64, delta: i64) -> i64 {
    delta * (genesis_ts.div_euclid(delta) + 1)
}

pub fn encode_diffs(block_nums: &[u64]) -> Vec<u64> {
    let mut prev = 0u64;
    block_nums
        .iter()
        .map(|&b| {
            let d = b - prev;
            prev = b;
            d
        })
        .collect()
}

/// Running sums of `diffs`; `None` if a sum leaves the `u64` range.
pub fn integrate_diffs(diffs: &[u64]) -> Option<Vec<u64>> {
    let mut total = 0u64;
    diffs
        .iter()
        .map(|&d| {
            total = total.checked_add(d)?;
            Some(total)
        })
        .collect()
}

impl BlockTimeIndex {
    /// Index with no periods resolved yet.
    pub fn empty(start_ts: i64, delta: i64) -> Self {
        Self { start_ts, delta, entries: Vec::new() }
    }

    pub fn from_parts(start_ts: i64, delta: i64, entries: Vec<BlockTimeEntry>) -> Result<Self> {
        if delta <= 0 {
            bail!("period width must be positive, got {delta}");
        }
        if let Some(w) = entries.windows(2).find(|w| w[1].block_num <= w[0].block_num) {
            bail!("block numbers not strictly increasing: {} then {}", w[0].block_num, w[1].block_num);
        }
        Ok(Self { start_ts, delta, entries })
    }

    /// Full generation from `genesis`. `start_ts` defaults to the first
    /// period boundary after the genesis timestamp.
    pub fn generate<R: ChainRpc>(rpc: &R, genesis: Seed, start_ts: Option<i64>, delta: i64) -> Result<Self> {
        let start_ts = start_ts.unwrap_or_else(|| aligned_start(genesis.timestamp, delta));
        let mut index = Self::from_parts(start_ts, delta, Vec::new())?;
        index.resolve_periods(rpc, genesis, 0, |_| Ok(()))?;
        Ok(index)
    }

    /// Append every period that has become resolvable since the last run.
    ///
    /// Only the already-resolved prefix is used as input, so the call is
    /// idempotent and can be repeated after an interrupted run. Returns the
    /// number of periods added.
    pub fn update<R: ChainRpc>(&mut self, rpc: &R) -> Result<usize> {
        let seed = self.resume_seed().ok_or(HistoryError::EmptyIndex)?;
        let added = self.resolve_periods(rpc, seed, 0, |_| Ok(()))?;
        if let Some(latest) = self.latest_datetime() {
            info!(added, total = self.entries.len(), latest = %latest, "block time index updated");
        }
        Ok(added)
    }

    /// Like [`update`](Self::update), but an empty index starts from
    /// `genesis`, and `checkpoint` is called with the index after every
    /// `checkpoint_every` new periods (never when it is 0).
    ///
    /// Periods resolved before an error stay in the index, so the caller can
    /// still persist them.
    pub fn extend<R, C>(&mut self, rpc: &R, genesis: Seed, checkpoint_every: usize, checkpoint: C) -> Result<usize>
    where
        R: ChainRpc,
        C: FnMut(&Self) -> Result<()>,
    {
        let seed = self.resume_seed().unwrap_or(genesis);
        self.resolve_periods(rpc, seed, checkpoint_every, checkpoint)
    }

    fn resume_seed(&self) -> Option<Seed> {
        let last = self.entries.len().checked_sub(1)?;
        Some(Seed { block_num: self.entries[last].block_num, timestamp: self.timestamp(last) })
    }

    pub fn start_ts(&self) -> i64 {
        self.start_ts
    }

    pub fn delta(&self) -> i64 {
        self.delta
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[BlockTimeEntry] {
        &self.entries
    }

    pub fn block_nums(&self) -> impl Iterator<Item = u64> + '_ {
        self.entries.iter().map(|e| e.block_num)
    }

    pub fn block_num(&self, i: usize) -> Option<u64> {
        self.entries.get(i).map(|e| e.block_num)
    }

    /// Ideal boundary of period `i`.
    pub fn boundary(&self, i: usize) -> i64 {
        self.start_ts + self.delta * i as i64
    }

    /// Actual timestamp of the block resolved for period `i`.
    pub fn timestamp(&self, i: usize) -> i64 {
        self.boundary(i) + self.entries.get(i).map_or(0, |e| e.ts_offset)
    }

    pub fn datetime(&self, i: usize) -> Result<OffsetDateTime> {
        let ts = self.timestamp(i);
        OffsetDateTime::from_unix_timestamp(ts).with_context(|| format!("timestamp {ts} out of range"))
    }

    pub fn datetime_string(&self, i: usize) -> Result<String> {
        Ok(self.datetime(i)?.format(&Rfc3339)?)
    }

    fn latest_datetime(&self) -> Option<String> {
        let last = self.entries.len().checked_sub(1)?;
        self.datetime_string(last).ok()
    }

    /// Block and actual timestamp of the period nearest to `ts`.
    pub fn lookup(&self, ts: i64) -> Option<(u64, i64)> {
        let i = ((ts - self.start_ts) as f64 / self.delta as f64).round();
        if i < 0.0 {
            return None;
        }
        let i = i as usize;
        let entry = self.entries.get(i)?;
        Some((entry.block_num, self.timestamp(i)))
    }

    /// First period whose block is at or after `block`.
    pub fn first_index_at_or_after(&self, block: u64) -> Option<usize> {
        let i = self.entries.partition_point(|e| e.block_num < block);
        (i < self.entries.len()).then_some(i)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let f = File::open(path).with_context(|| format!("open {:?}", path))?;
        let file: IndexFile =
            serde_json::from_reader(BufReader::new(f)).with_context(|| format!("decode {:?}", path))?;
        let malformed = |reason: String| HistoryError::Malformed {
            kind: "block time index",
            path: path.display().to_string(),
            reason,
        };

        let block_nums = match (file.block_diffs, file.block_nums) {
            (Some(diffs), _) => {
                integrate_diffs(&diffs).ok_or_else(|| malformed("block_diffs overflow a block number".into()))?
            }
            (None, Some(nums)) => nums,
            (None, None) => return Err(malformed("neither block_diffs nor block_nums present".into()).into()),
        };
        if block_nums.len() != file.ts_offsets.len() {
            return Err(malformed(format!(
                "{} block numbers but {} offsets",
                block_nums.len(),
                file.ts_offsets.len()
            ))
            .into());
        }
        let entries = block_nums
            .into_iter()
            .zip(file.ts_offsets)
            .map(|(block_num, ts_offset)| BlockTimeEntry { block_num, ts_offset })
            .collect();
        Self::from_parts(file.start_ts, file.delta, entries).map_err(|e| malformed(e.to_string()).into())
    }

    /// Write to a sibling temporary file, then rename over `path`.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).with_context(|| format!("create {:?}", parent))?;
            }
        }
        let block_nums: Vec<u64> = self.block_nums().collect();
        let file = IndexFile {
            start_ts: self.start_ts,
            delta: self.delta,
            block_diffs: Some(encode_diffs(&block_nums)),
            block_nums: None,
            ts_offsets: self.entries.iter().map(|e| e.ts_offset).collect(),
        };
        let tmp = path.with_extension("json.tmp");
        let mut w = BufWriter::new(File::create(&tmp).with_context(|| format!("create {:?}", tmp))?);
        serde_json::to_writer(&mut w, &file)?;
        w.flush()?;
        drop(w);
        fs::rename(&tmp, path).with_context(|| format!("rename {:?} -> {:?}", tmp, path))?;
        debug!(periods = self.entries.len(), path = %path.display(), "block time index saved");
        Ok(())
    }
}

impl BlockTimeIndex {
    /// Resolve the periods after the last entry, up to the head.
    ///
    /// Each search is warm-started: the previous period's block is the lower
    /// bracket and the current head is the upper one. This keeps brackets
    /// tiny as long as the block production rate is locally stable and
    /// blocks are much closer together than `delta`. If a single block spans
    /// a whole period, the next period gets the next block (block numbers
    /// stay strictly increasing) and its offset grows accordingly.
    ///
    /// The number of periods is fixed by the head seen at the start of the
    /// run, but the head is re-read for every period so that a long backfill
    /// is never bounded by a stale head.
    fn resolve_periods<R, C>(&mut self, rpc: &R, seed: Seed, checkpoint_every: usize, mut checkpoint: C) -> Result<usize>
    where
        R: ChainRpc,
        C: FnMut(&Self) -> Result<()>,
    {
        let first = self.entries.len();
        let first_target = self.boundary(first);
        let head = rpc.latest_block()?;
        if head.timestamp < first_target {
            info!("no new block times to calculate");
            return Ok(0);
        }
        let count = ((head.timestamp - first_target) / self.delta + 1) as usize;
        self.entries.reserve(count);

        let mut prev_block = self.entries.last().map(|e| e.block_num);
        let mut lower = Probe::new(seed.block_num, seed.timestamp);
        let mut evals = 0u64;
        let started = Instant::now();

        for i in 0..count {
            let head = if i == 0 { head } else { rpc.latest_block()? };
            if head.number <= lower.x {
                warn!(
                    resolved = i,
                    remaining = count - i,
                    head = head.number,
                    "head has not advanced past the last resolved block; stopping early"
                );
                break;
            }
            let target = first_target + self.delta * i as i64;
            let out = interpolation_search(
                target,
                lower,
                Probe::new(head.number, head.timestamp),
                Resolution::Upper,
                |n| rpc.block_timestamp(n),
            )?;
            evals += u64::from(out.evaluations);

            let entry = match prev_block {
                // the previous period's block already reaches this boundary
                Some(prev) if out.x <= prev => {
                    let block_num = prev + 1;
                    evals += 1;
                    BlockTimeEntry { block_num, ts_offset: rpc.block_timestamp(block_num)? - target }
                }
                _ => BlockTimeEntry { block_num: out.x, ts_offset: out.residual },
            };
            self.entries.push(entry);
            prev_block = Some(entry.block_num);
            lower = Probe::new(entry.block_num, target + entry.ts_offset);

            if (i + 1) % 1000 == 0 {
                debug!(done = i + 1, total = count, elapsed = ?started.elapsed(), "resolving periods");
            }
            if checkpoint_every != 0 && (i + 1) % checkpoint_every == 0 {
                checkpoint(self)?;
            }
        }

        let added = self.entries.len() - first;
        if added > 0 {
            info!(
                periods = added,
                total = self.entries.len(),
                evaluations = evals,
                per_period = %format!("{:.2}", evals as f64 / added as f64),
                elapsed = ?started.elapsed(),
                "block times calculated"
            );
        }
        Ok(added)
    }
}
