use anyhow::{Context, Result, bail};
use blockprice::blocktimes::BlockTimeIndex;
use blockprice::config::DataLayout;
use blockprice::history::PriceHistoryCache;
use blockprice::registry::{TokenId, TokenInfo, TokenRegistry};
use clap::Parser;
use dotenvy::dotenv;
use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::PathBuf;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(about = "Export aligned price histories as JSON (no node access)")]
struct Args {
    /// Directory holding the index and price history files
    #[arg(long, env = "DATA_DIR", default_value = "data")]
    data_dir: PathBuf,

    /// Token registry; defaults to the copy in the data directory
    #[arg(long, env = "TOKENS_FILE")]
    tokens: Option<PathBuf>,

    /// Token symbol or address to export (repeatable); every token with a cached history if omitted
    #[arg(long = "token", short = 't')]
    tokens_wanted: Vec<String>,

    /// Output file; stdout if omitted
    #[arg(long, short = 'o')]
    out: Option<PathBuf>,
}

fn main() -> Result<()> {
    let _ = dotenv();
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
        .init();

    let args = Args::parse();
    let layout = DataLayout::new(&args.data_dir);
    let index_path = layout.index_path();
    if !index_path.exists() {
        bail!("no block time index at {:?}; run blockprice first", index_path);
    }
    let index = BlockTimeIndex::load(&index_path)?;

    let registry_path = args.tokens.clone().unwrap_or_else(|| layout.tokens_export_path());
    let registry = TokenRegistry::load(&registry_path)?;

    let mut cache = PriceHistoryCache::new(layout);
    let wanted: Vec<TokenInfo> = if args.tokens_wanted.is_empty() {
        Vec::new()
    } else {
        args.tokens_wanted.iter().map(|t| registry.resolve(&TokenId::from(t.as_str()))).collect::<Result<_, _>>()?
    };
    let candidates = if wanted.is_empty() { registry.all() } else { wanted.clone() };
    for token in &candidates {
        if !cache.load_token(&index, token)? && !wanted.is_empty() {
            warn!(symbol = %token.symbol, "no cached price history");
        }
    }

    let aligned = cache.align(&index, &wanted)?;
    info!(tokens = aligned.series.len(), periods = aligned.len(), start_index = aligned.start_index, "histories aligned");
    let doc = aligned.to_json(&index)?;

    match &args.out {
        Some(path) => {
            if let Some(parent) = path.parent() {
                if !parent.as_os_str().is_empty() {
                    fs::create_dir_all(parent).with_context(|| format!("create {:?}", parent))?;
                }
            }
            let mut w = BufWriter::new(File::create(path).with_context(|| format!("create {:?}", path))?);
            serde_json::to_writer(&mut w, &doc)?;
            w.flush()?;
            info!(out = ?path, "export written");
        }
        None => {
            let stdout = io::stdout();
            let mut w = BufWriter::new(stdout.lock());
            serde_json::to_writer(&mut w, &doc)?;
            writeln!(w)?;
        }
    }
    Ok(())
}
