//! Command-line DHT crawler.
//!
//! Binds a client-only iroh endpoint, crawls outward from the given seed
//! peers and writes every crawl result as pretty JSON.
//!
//! # Usage
//!
//! ```bash
//! cargo run -- crawl --output results/ --seed '<endpoint addr json>'
//! ```
//!
//! One progress line is printed on stdout per crawled peer. Diagnostics go to
//! stderr and are filtered with `RUST_LOG` (default `info`).

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use futures::StreamExt;
use iroh::{Endpoint, RelayMode};
use rand::seq::SliceRandom;
use tracing::info;
use tracing_subscriber::EnvFilter;

use iroh_dht_crawler::{
    node_from_json, CrawlResult, CrawlTelemetry, Crawler, DrainConfig, IrohTransport, KeyId,
    RingOrder,
};

/// File name used when `--output` points at a directory.
const DEFAULT_OUTPUT_FILE: &str = "crawl-result.json";

#[derive(Parser, Debug)]
#[command(name = "iroh-dht-crawler", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start crawling DHT nodes
    Crawl(CrawlArgs),
}

/// CLI arguments for the crawl subcommand.
#[derive(Args, Debug)]
struct CrawlArgs {
    /// Peers crawled concurrently
    #[arg(short = 'w', long = "worker", default_value_t = 1000)]
    worker: usize,
    /// Output file, or directory to place crawl-result.json in
    #[arg(short, long)]
    output: PathBuf,
    /// JSON-encoded EndpointAddr of a bootstrap peer (repeatable)
    #[arg(long = "seed", required = true)]
    seeds: Vec<String>,
    /// Concurrent find_node queries per peer
    #[arg(long, default_value_t = 3)]
    parallelism: usize,
    /// Query budget for a single distance ring
    #[arg(long, default_value_t = 32)]
    max_tries_per_bucket: usize,
    /// Empty queries in a row before a ring is abandoned
    #[arg(long, default_value_t = 2)]
    no_new_window: usize,
    /// Minimum fraction of new nodes per query to keep draining a ring
    #[arg(long, default_value_t = 0.10)]
    epsilon: f64,
    /// Number of distance rings to probe
    #[arg(long, default_value_t = 256)]
    max_buckets: usize,
    /// Probe near rings first instead of far rings
    #[arg(long)]
    near_to_far: bool,
    /// Session setup timeout in milliseconds
    #[arg(long, default_value_t = 5000)]
    connect_timeout_ms: u64,
    /// find_node timeout in milliseconds
    #[arg(long, default_value_t = 5000)]
    query_timeout_ms: u64,
}

impl CrawlArgs {
    fn drain_config(&self) -> DrainConfig {
        DrainConfig {
            max_buckets: self.max_buckets,
            parallelism: self.parallelism,
            max_tries_per_bucket: self.max_tries_per_bucket,
            no_new_window: self.no_new_window,
            epsilon: self.epsilon,
            ring_order: if self.near_to_far {
                RingOrder::NearToFar
            } else {
                RingOrder::FarToNear
            },
            ..DrainConfig::default()
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    match Cli::parse().command {
        Command::Crawl(args) => crawl(args).await,
    }
}

async fn crawl(args: CrawlArgs) -> Result<()> {
    let output = resolve_output_path(&args.output)?;

    let mut seeds = args
        .seeds
        .iter()
        .map(String::as_str)
        .map(node_from_json)
        .collect::<Result<Vec<_>>>()?;
    seeds.shuffle(&mut rand::thread_rng());

    let endpoint = Endpoint::builder()
        .relay_mode(RelayMode::Default)
        .bind()
        .await?;
    info!(endpoint = %endpoint.id(), seeds = seeds.len(), "crawler endpoint bound");

    let transport = IrohTransport::new(endpoint)?.with_timeouts(
        Duration::from_millis(args.connect_timeout_ms),
        Duration::from_millis(args.query_timeout_ms),
    );
    let crawler = Crawler::new(Arc::new(transport), args.drain_config());
    let telemetry = Arc::new(CrawlTelemetry::default());

    let mut known: HashSet<KeyId> = HashSet::new();
    let mut results: Vec<CrawlResult> = Vec::new();
    let mut stream = crawler.crawl_with_telemetry(seeds, args.worker, Arc::clone(&telemetry));

    while let Some(result) = stream.next().await {
        known.insert(result.info.id);
        known.extend(result.drain_result.iter().map(|n| n.id));

        let line = progress_line(
            &result,
            known.len(),
            results.len() + 1,
            telemetry.in_flight(),
        );
        println!("{line}");

        results.push(compact(result));
    }

    println!("saving...");
    results.sort_by_key(|r| r.info.id);
    let json = serde_json::to_vec_pretty(&results).context("encoding crawl results")?;
    tokio::fs::write(&output, json)
        .await
        .with_context(|| format!("writing {}", output.display()))?;

    println!(
        "done, total crawled nodes: {}, saved to file: {}",
        results.len(),
        output.display()
    );
    Ok(())
}

/// Map `--output` to a file path, creating missing parent directories.
fn resolve_output_path(path: &Path) -> Result<PathBuf> {
    if path.is_dir() {
        return Ok(path.join(DEFAULT_OUTPUT_FILE));
    }
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating output directory {}", parent.display()))?;
    }
    Ok(path.to_path_buf())
}

/// Strip addresses from the drain list before the result is persisted.
fn compact(result: CrawlResult) -> CrawlResult {
    let drain_result = result
        .drain_result
        .iter()
        .map(|n| n.without_addrs())
        .collect();
    CrawlResult {
        drain_result,
        ..result
    }
}

fn progress_line(result: &CrawlResult, known: usize, total: usize, in_flight: usize) -> String {
    let crawled = if result.success_connection {
        result.drain_result.len().to_string()
    } else {
        "?".to_string()
    };
    format!(
        "known_nodes:{} total_results:{} in_flight:{} crawled:{} source_pub:{} source_address:{}",
        known,
        total,
        in_flight,
        crawled,
        hex::encode(result.info.public_key),
        result.info.addrs.first().map(String::as_str).unwrap_or("null"),
    )
}
