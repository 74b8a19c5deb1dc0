//! # Iroh DHT Crawler
//!
//! This crate explores a Kademlia-style distributed hash table by contacting
//! known peers, draining the contents of their routing tables, and visiting
//! every newly discovered peer until the reachable population is exhausted.
//!
//! The crate is split into a handful of modules:
//!
//! - [`core`]: key identifiers, the XOR metric, [`Node`] records and the
//!   [`DhtTransport`] seam the crawler talks through.
//! - [`drain`]: the adaptive bucket drainer that extracts one peer's routing
//!   table ring by ring with diminishing-returns cutoffs.
//! - [`crawl`]: the [`Crawler`], a bounded-parallel breadth-first scheduler
//!   that yields a stream of [`CrawlResult`]s.
//! - [`net`]: an [`iroh`] based [`DhtTransport`] implementation.
//! - [`protocol`]: the iroh-sdht irpc messages a crawlable peer answers.
//! - [`error`]: connection and query errors.
//!
//! ## Getting started
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use anyhow::Result;
//! use futures::StreamExt;
//! use iroh::Endpoint;
//! use iroh_dht_crawler::{node_from_json, Crawler, DrainConfig, IrohTransport};
//!
//! # async fn launch(endpoint: Endpoint, seed: &str) -> Result<()> {
//! let transport = Arc::new(IrohTransport::new(endpoint)?);
//! let crawler = Crawler::new(transport, DrainConfig::default());
//!
//! let mut results = crawler.crawl(vec![node_from_json(seed)?], 64);
//! while let Some(result) = results.next().await {
//!     println!("{result}");
//! }
//! # Ok(())
//! # }
//! ```
//!
//! The binary in `src/main.rs` wires these pieces into a command-line crawler
//! that persists every result as JSON.

pub mod core;
pub mod crawl;
pub mod drain;
pub mod error;
pub mod net;
pub mod protocol;

pub use core::{
    derive_key_id, random_key_at_distance, DhtTransport, Distance, KeyId, Node, KEY_BITS,
};
pub use crawl::{CrawlResult, CrawlSnapshot, CrawlTelemetry, Crawler};
pub use drain::{
    drain_buckets, merge_nodes, BucketStat, DrainConfig, DrainOutcome, DrainStats, RingOrder,
};
pub use error::{ConnectionError, QueryError};
pub use net::{node_from_endpoint_addr, node_from_json, IrohTransport, DHT_ALPN};
