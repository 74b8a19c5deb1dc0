//! Crawl scheduler: bounded-parallel breadth-first traversal of the DHT.
//!
//! A crawl session owns the visited set and the frontier. Every scheduled
//! peer becomes one task that opens a session and drains the peer's buckets;
//! tasks only return a [`CrawlResult`], and the coordinating stream applies
//! all bookkeeping after each completion, so nothing here needs a lock.

use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use futures::stream::{self, BoxStream, FuturesUnordered, StreamExt};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::core::{DhtTransport, KeyId, Node};
use crate::drain::{drain_buckets, DrainConfig, DrainStats};

/// Outcome of crawling a single peer.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CrawlResult {
    /// The crawled peer's own record.
    pub info: Node,
    /// Whether a session could be established.
    pub success_connection: bool,
    /// Wall-clock time at which the crawl of this peer started.
    pub time: DateTime<Utc>,
    /// Time spent connecting and draining.
    pub duration: Duration,
    /// Nodes from the peer's routing table, sorted by distance to the peer.
    pub drain_result: Vec<Node>,
    /// Query statistics, all zero when the peer was unreachable.
    pub stats: DrainStats,
}

impl fmt::Display for CrawlResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} -> {}, {:?}, {} nodes",
            self.info.id,
            self.success_connection,
            self.duration,
            self.drain_result.len()
        )
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Telemetry
// ─────────────────────────────────────────────────────────────────────────────

/// Progress counters of a crawl session, readable from any thread.
///
/// Only the session's coordinator writes them.
#[derive(Debug, Default)]
pub struct CrawlTelemetry {
    in_flight: AtomicUsize,
    scheduled: AtomicUsize,
    completed: AtomicUsize,
}

/// Point-in-time copy of [`CrawlTelemetry`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CrawlSnapshot {
    /// Peers currently being crawled.
    pub in_flight: usize,
    /// Peers scheduled so far.
    pub scheduled: usize,
    /// Results emitted so far.
    pub completed: usize,
}

impl CrawlTelemetry {
    /// Peers currently being crawled.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Relaxed)
    }

    /// Read all counters at once.
    pub fn snapshot(&self) -> CrawlSnapshot {
        CrawlSnapshot {
            in_flight: self.in_flight.load(Ordering::Relaxed),
            scheduled: self.scheduled.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Crawler
// ─────────────────────────────────────────────────────────────────────────────

/// Entry point for crawling a DHT over some [`DhtTransport`].
///
/// # Key Methods
///
/// * [`crawl`](Self::crawl) - Breadth-first crawl from a set of seed peers
/// * [`crawl_with_telemetry`](Self::crawl_with_telemetry) - Same, reporting progress counters
/// * [`crawl_peer`](Self::crawl_peer) - Connect to and drain a single peer
pub struct Crawler<T: DhtTransport> {
    transport: Arc<T>,
    config: DrainConfig,
}

impl<T: DhtTransport> Clone for Crawler<T> {
    fn clone(&self) -> Self {
        Self {
            transport: Arc::clone(&self.transport),
            config: self.config.clone(),
        }
    }
}

impl<T: DhtTransport> Crawler<T> {
    /// Create a crawler that drains every peer with `config`.
    pub fn new(transport: Arc<T>, config: DrainConfig) -> Self {
        Self {
            transport,
            config: config.normalized(),
        }
    }

    /// The normalized drain configuration applied to every peer.
    pub fn config(&self) -> &DrainConfig {
        &self.config
    }

    /// Connect to `node` and, if that succeeds, drain its buckets.
    pub async fn crawl_peer(&self, node: Node) -> CrawlResult {
        crawl_peer(Arc::clone(&self.transport), self.config.clone(), node).await
    }

    /// Crawl outward from `seeds` with at most `max_parallel` peers in flight.
    ///
    /// Results are yielded in completion order. The stream is lazy, ends once
    /// the frontier is exhausted, and dropping it cancels all in-flight work.
    /// Every call starts a fresh session with an empty visited set.
    pub fn crawl(&self, seeds: Vec<Node>, max_parallel: usize) -> BoxStream<'static, CrawlResult> {
        self.crawl_with_telemetry(seeds, max_parallel, Arc::new(CrawlTelemetry::default()))
    }

    /// Like [`crawl`](Self::crawl), publishing progress into `telemetry`.
    pub fn crawl_with_telemetry(
        &self,
        seeds: Vec<Node>,
        max_parallel: usize,
        telemetry: Arc<CrawlTelemetry>,
    ) -> BoxStream<'static, CrawlResult> {
        let mut session = CrawlSession {
            transport: Arc::clone(&self.transport),
            config: self.config.clone(),
            max_parallel: max_parallel.max(1),
            visited: HashSet::new(),
            queued: HashSet::new(),
            frontier: VecDeque::new(),
            in_flight: FuturesUnordered::new(),
            telemetry,
        };
        session.enqueue(seeds);

        stream::unfold(session, |mut session| async move {
            let result = session.next_result().await?;
            Some((result, session))
        })
        .boxed()
    }
}

/// Mutable state of one crawl, owned by the stream that drives it.
struct CrawlSession<T: DhtTransport> {
    transport: Arc<T>,
    config: DrainConfig,
    max_parallel: usize,
    /// Keys ever scheduled in this session.
    visited: HashSet<KeyId>,
    /// Keys currently waiting in the frontier.
    queued: HashSet<KeyId>,
    /// Candidates in discovery order, at most one record per key.
    frontier: VecDeque<Node>,
    in_flight: FuturesUnordered<BoxFuture<'static, CrawlResult>>,
    telemetry: Arc<CrawlTelemetry>,
}

impl<T: DhtTransport> CrawlSession<T> {
    /// Queue nodes that are neither visited nor already waiting.
    ///
    /// The first record seen for a key is the one that gets crawled.
    fn enqueue(&mut self, nodes: impl IntoIterator<Item = Node>) {
        for node in nodes {
            if !self.visited.contains(&node.id) && self.queued.insert(node.id) {
                self.frontier.push_back(node);
            }
        }
    }

    /// Fill free slots from the front of the frontier.
    fn admit(&mut self) {
        while self.in_flight.len() < self.max_parallel {
            let Some(node) = self.frontier.pop_front() else {
                break;
            };
            self.queued.remove(&node.id);
            if !self.visited.insert(node.id) {
                continue;
            }
            trace!(peer = %node.id, queued = self.frontier.len(), "scheduling peer");
            let task = crawl_peer(Arc::clone(&self.transport), self.config.clone(), node);
            self.in_flight.push(task.boxed());
            self.telemetry.scheduled.fetch_add(1, Ordering::Relaxed);
        }
        self.telemetry
            .in_flight
            .store(self.in_flight.len(), Ordering::Relaxed);
    }

    /// Wait for the next finished peer, feed its discoveries back and refill.
    async fn next_result(&mut self) -> Option<CrawlResult> {
        self.admit();
        let result = self.in_flight.next().await?;
        self.telemetry.completed.fetch_add(1, Ordering::Relaxed);

        self.enqueue(result.drain_result.iter().cloned());
        self.admit();
        Some(result)
    }
}

async fn crawl_peer<T: DhtTransport>(
    transport: Arc<T>,
    config: DrainConfig,
    info: Node,
) -> CrawlResult {
    let time = Utc::now();
    let start = Instant::now();

    let session = match transport.open_session(&info).await {
        Ok(session) => session,
        Err(err) => {
            debug!(peer = %info.id, error = %err, "could not open session");
            return CrawlResult {
                info,
                success_connection: false,
                time,
                duration: start.elapsed(),
                drain_result: Vec::new(),
                stats: DrainStats::default(),
            };
        }
    };

    let outcome = drain_buckets(transport.as_ref(), &session, &info.id, &config).await;
    drop(session);

    CrawlResult {
        info,
        success_connection: true,
        time,
        duration: start.elapsed(),
        drain_result: outcome.nodes,
        stats: outcome.stats,
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;

    use super::*;
    use crate::error::{ConnectionError, QueryError};

    struct Offline;

    #[async_trait]
    impl DhtTransport for Offline {
        type Session = ();

        async fn open_session(&self, _node: &Node) -> Result<(), ConnectionError> {
            Err(ConnectionError::Unreachable("offline".into()))
        }

        async fn find_node(
            &self,
            _session: &(),
            _target: KeyId,
            _count: usize,
        ) -> Result<Vec<Node>, QueryError> {
            Ok(Vec::new())
        }
    }

    fn session() -> CrawlSession<Offline> {
        CrawlSession {
            transport: Arc::new(Offline),
            config: DrainConfig::default(),
            max_parallel: 1,
            visited: HashSet::new(),
            queued: HashSet::new(),
            frontier: VecDeque::new(),
            in_flight: FuturesUnordered::new(),
            telemetry: Arc::new(CrawlTelemetry::default()),
        }
    }

    fn node(byte: u8, version: u32) -> Node {
        Node::from_public_key([byte; 32], Vec::new(), version)
    }

    #[test]
    fn rediscovered_keys_are_queued_once() {
        let mut session = session();

        session.enqueue([node(1, 0), node(2, 0)]);
        session.enqueue([node(2, 7), node(1, 3), node(3, 0)]);

        let queued: Vec<(KeyId, u32)> = session.frontier.iter().map(|n| (n.id, n.version)).collect();
        assert_eq!(
            queued,
            vec![(node(1, 0).id, 0), (node(2, 0).id, 0), (node(3, 0).id, 0)]
        );
    }

    #[test]
    fn scheduled_keys_are_not_queued_again() {
        let mut session = session();
        session.enqueue([node(1, 0), node(2, 0)]);

        session.admit();
        assert_eq!(session.in_flight.len(), 1);
        assert!(session.visited.contains(&node(1, 0).id));

        session.enqueue([node(1, 0)]);
        assert_eq!(session.frontier.len(), 1);
        assert_eq!(session.telemetry.snapshot().scheduled, 1);
    }
}
