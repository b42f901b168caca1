use anyhow::{Context, Result};
use blockprice::blocktimes::{BlockTimeIndex, Seed, aligned_start};
use blockprice::config::{DEFAULT_DELTA, DataLayout, ProtocolConfig};
use blockprice::history::{CalcOutcome, PriceHistoryCache};
use blockprice::node::HttpNode;
use blockprice::price::PriceAggregator;
use blockprice::registry::{TokenId, TokenInfo, TokenRegistry};
use clap::Parser;
use dotenvy::dotenv;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(version, about = "Build the block time index and per-token price histories")]
struct Args {
    /// Ethereum node JSON-RPC endpoint
    #[arg(long, env = "NODE_URL", default_value = "http://localhost:8545")]
    node_url: String,

    /// Directory holding the index and price history files
    #[arg(long, env = "DATA_DIR", default_value = "data")]
    data_dir: PathBuf,

    /// Token registry (JSON: SYMBOL -> {address, name})
    #[arg(long, env = "TOKENS_FILE", default_value = "tokens.json")]
    tokens: PathBuf,

    /// Period width in seconds for a newly generated index
    #[arg(long, default_value_t = DEFAULT_DELTA)]
    delta: i64,

    /// First period boundary for a newly generated index; defaults to the
    /// first boundary after genesis
    #[arg(long)]
    start_ts: Option<i64>,

    /// Per-request timeout
    #[arg(long, env = "RPC_TIMEOUT_SECS", default_value_t = 15)]
    rpc_timeout_secs: u64,

    /// Pause after every node call
    #[arg(long, env = "RPC_THROTTLE_MS", default_value_t = 0)]
    throttle_ms: u64,

    /// Token symbol or address to price (repeatable); all registered tokens if omitted
    #[arg(long = "token", short = 't')]
    tokens_wanted: Vec<String>,

    /// Save the block time index after this many newly resolved periods
    #[arg(long, default_value_t = 5000)]
    checkpoint_every: usize,

    /// Discard cached price histories and recompute them
    #[arg(long, default_value_t = false)]
    clear: bool,
}

fn main() -> Result<()> {
    let _ = dotenv();
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry().with(filter).with(tracing_subscriber::fmt::layer()).init();

    let args = Args::parse();
    let layout = DataLayout::new(&args.data_dir);
    fs::create_dir_all(layout.dir()).with_context(|| format!("create {:?}", layout.dir()))?;

    let registry = TokenRegistry::load(&args.tokens)?;
    registry.export(&layout.tokens_export_path())?;
    let tokens: Vec<TokenInfo> = if args.tokens_wanted.is_empty() {
        registry.all()
    } else {
        args.tokens_wanted.iter().map(|t| registry.resolve(&TokenId::from(t.as_str()))).collect::<Result<_, _>>()?
    };

    let node = HttpNode::new(
        &args.node_url,
        Duration::from_secs(args.rpc_timeout_secs),
        Duration::from_millis(args.throttle_ms),
    )?;
    let protocol = ProtocolConfig::mainnet();

    let index_path = layout.index_path();
    let loaded = if index_path.exists() { Some(BlockTimeIndex::load(&index_path)?) } else { None };
    let mut index = match loaded {
        Some(index) if !index.is_empty() => {
            info!(periods = index.len(), "block time index loaded");
            index
        }
        // an empty saved index keeps its axis parameters
        Some(index) => BlockTimeIndex::from_parts(index.start_ts(), index.delta(), Vec::new())?,
        None => {
            let start_ts = args.start_ts.unwrap_or_else(|| aligned_start(protocol.genesis_ts, args.delta));
            info!(node = %args.node_url, delta = args.delta, start_ts, "generating block time index");
            BlockTimeIndex::from_parts(start_ts, args.delta, Vec::new())?
        }
    };
    let genesis = Seed { block_num: protocol.genesis_block, timestamp: protocol.genesis_ts };
    let resolved = index.extend(&node, genesis, args.checkpoint_every, |idx| {
        debug!(periods = idx.len(), "checkpointing block time index");
        idx.save(&index_path)
    });
    index.save(&index_path)?;
    resolved?;
    if index.is_empty() {
        warn!("block time index has no periods yet");
    }

    let mut prices = PriceAggregator::new(&node, protocol);
    let mut cache = PriceHistoryCache::new(layout);
    for token in &tokens {
        match cache.update_token(&mut prices, &index, token, args.clear)? {
            CalcOutcome::NotListed => {}
            CalcOutcome::Started { start_index, appended } => {
                info!(symbol = %token.symbol, start_index, appended, "price history created");
            }
            CalcOutcome::Extended { appended } => {
                info!(symbol = %token.symbol, appended, "price history extended");
            }
        }
    }
    Ok(())
}
