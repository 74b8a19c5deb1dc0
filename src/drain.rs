//! Adaptive bucket draining: extracts one peer's routing table.
//!
//! The drainer walks the peer's distance rings in a fixed order. For every
//! ring it keeps a small pool of `find_node` queries in flight, each aimed at
//! a random key inside the ring, and gives up on the ring once queries stop
//! surfacing unseen nodes. Two consecutive rings that contribute nothing end
//! the whole drain.

use std::collections::{HashMap, VecDeque};

use futures::stream::{FuturesUnordered, StreamExt};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::core::{random_key_at_distance, DhtTransport, KeyId, Node, KEY_BITS};

// ============================================================================
// Configuration
// ============================================================================

/// Nodes requested per `find_node` call (TON's `k`).
pub const DEFAULT_FIND_NODE_COUNT: usize = 10;

/// Consecutive empty rings after which the whole drain stops.
const EMPTY_RINGS_BEFORE_GLOBAL_STOP: usize = 2;

/// Order in which distance rings are visited.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum RingOrder {
    /// Highest ring first. Distant rings hold most of a typical peer's table.
    #[default]
    FarToNear,
    /// Ring 1 first.
    NearToFar,
}

/// Tuning knobs for [`drain_buckets`].
#[derive(Clone, Debug, PartialEq)]
pub struct DrainConfig {
    /// Number of distance rings to probe.
    pub max_buckets: usize,
    /// Maximum concurrent `find_node` calls against one peer.
    pub parallelism: usize,
    /// Hard cap on queries issued to a single ring.
    pub max_tries_per_bucket: usize,
    /// Consecutive queries without new nodes before a ring is abandoned.
    pub no_new_window: usize,
    /// Minimum fraction of `find_node_count` that must be new to keep going.
    pub epsilon: f64,
    /// Ring visiting order.
    pub ring_order: RingOrder,
    /// `count` sent with each `find_node` call.
    pub find_node_count: usize,
}

impl Default for DrainConfig {
    fn default() -> Self {
        Self {
            max_buckets: KEY_BITS,
            parallelism: 3,
            max_tries_per_bucket: 32,
            no_new_window: 2,
            epsilon: 0.10,
            ring_order: RingOrder::FarToNear,
            find_node_count: DEFAULT_FIND_NODE_COUNT,
        }
    }
}

impl DrainConfig {
    /// Clamp values that would make the drain meaningless or unbounded.
    pub fn normalized(mut self) -> Self {
        self.max_buckets = self.max_buckets.min(KEY_BITS);
        self.parallelism = self.parallelism.max(1);
        self.max_tries_per_bucket = self.max_tries_per_bucket.max(1);
        self.find_node_count = self.find_node_count.max(1);
        self
    }

    /// Rings to probe, in visiting order. Ring 0 is never probed.
    pub fn rings(&self) -> Vec<usize> {
        let rings = 1..self.max_buckets.min(KEY_BITS);
        match self.ring_order {
            RingOrder::FarToNear => rings.rev().collect(),
            RingOrder::NearToFar => rings.collect(),
        }
    }
}

// ============================================================================
// Statistics
// ============================================================================

/// Counters for one ring of one peer.
///
/// Owned by the ring loop for the duration of a single drain call.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BucketStat {
    /// Unseen nodes this ring has contributed so far.
    pub new_total: usize,
    /// Unseen nodes contributed by the most recent completed query.
    pub last_new: usize,
    /// Queries issued against this ring.
    pub attempts: usize,
    /// Consecutive completed queries that contributed nothing.
    pub empty_streak: usize,
    stopped: bool,
}

impl BucketStat {
    /// A query failed; it counts as an empty one.
    pub fn record_failure(&mut self) {
        self.empty_streak += 1;
        self.last_new = 0;
    }

    /// A query returned and `new` of its nodes were unseen.
    pub fn record_yield(&mut self, new: usize) {
        self.last_new = new;
        self.new_total += new;
        if new == 0 {
            self.empty_streak += 1;
        } else {
            self.empty_streak = 0;
        }
    }

    /// Diminishing-returns cutoff for the ring.
    pub fn should_stop(&self, config: &DrainConfig) -> bool {
        let last_ratio = self.last_new as f64 / config.find_node_count.max(1) as f64;
        self.empty_streak >= config.no_new_window
            || last_ratio < config.epsilon
            || self.attempts >= config.max_tries_per_bucket
    }

    /// Mark the ring finished. There is no way back.
    pub fn stop(&mut self) {
        self.stopped = true;
    }

    /// Whether [`stop`](Self::stop) has been called.
    pub fn is_stopped(&self) -> bool {
        self.stopped
    }
}

/// Per-peer summary of a drain, kept alongside the crawl result.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DrainStats {
    /// `find_node` calls issued.
    pub queries: usize,
    /// `find_node` calls that failed.
    pub failed_queries: usize,
    /// Rings that were started.
    pub buckets_probed: usize,
    /// Whether two consecutive empty rings ended the drain early.
    pub global_stop: bool,
}

/// Nodes and statistics produced by [`drain_buckets`].
#[derive(Clone, Debug, Default)]
pub struct DrainOutcome {
    /// Discovered nodes, one per key, sorted by ascending distance to the peer.
    pub nodes: Vec<Node>,
    pub stats: DrainStats,
}

// ============================================================================
// Merging
// ============================================================================

/// Merge `nodes` into `store`, keeping the highest version per key.
///
/// Returns how many keys were not present before. Replacing an existing key
/// with a newer version does not count as new.
pub fn merge_nodes(store: &mut HashMap<KeyId, Node>, nodes: Vec<Node>) -> usize {
    let before = store.len();
    for node in nodes {
        match store.get(&node.id) {
            Some(existing) if !node.supersedes(existing) => {}
            _ => {
                store.insert(node.id, node);
            }
        }
    }
    store.len() - before
}

// ============================================================================
// Draining
// ============================================================================

/// Drain the routing table of the peer behind `session`.
///
/// `peer` is the key of the drained peer; random targets are generated
/// relative to it and the result is sorted by distance to it. Query failures
/// never abort the drain, they only feed the ring's stop heuristics.
pub async fn drain_buckets<T: DhtTransport>(
    transport: &T,
    session: &T::Session,
    peer: &KeyId,
    config: &DrainConfig,
) -> DrainOutcome {
    let mut drainer = Drainer {
        transport,
        session,
        peer,
        config: config.clone().normalized(),
        rng: StdRng::from_entropy(),
        store: HashMap::new(),
        stats: DrainStats::default(),
    };

    let mut empty_rings = 0;
    for bucket in drainer.config.rings() {
        let stat = drainer.drain_ring(bucket).await;
        drainer.stats.buckets_probed += 1;

        if stat.new_total == 0 {
            empty_rings += 1;
            if empty_rings >= EMPTY_RINGS_BEFORE_GLOBAL_STOP {
                debug!(peer = %peer, bucket, "two empty rings in a row, stopping drain");
                drainer.stats.global_stop = true;
                break;
            }
        } else {
            empty_rings = 0;
        }
    }

    let Drainer { store, stats, .. } = drainer;
    let mut nodes: Vec<Node> = store.into_values().collect();
    nodes.sort_by_key(|node| peer.distance(&node.id));

    debug!(
        peer = %peer,
        discovered = nodes.len(),
        queries = stats.queries,
        failed = stats.failed_queries,
        rings = stats.buckets_probed,
        "drain finished"
    );
    DrainOutcome { nodes, stats }
}

/// State of a single drain call.
struct Drainer<'a, T: DhtTransport> {
    transport: &'a T,
    session: &'a T::Session,
    peer: &'a KeyId,
    config: DrainConfig,
    rng: StdRng,
    store: HashMap<KeyId, Node>,
    stats: DrainStats,
}

impl<'a, T: DhtTransport> Drainer<'a, T> {
    /// Probe one ring until its stop heuristics fire or its budget runs out.
    async fn drain_ring(&mut self, bucket: usize) -> BucketStat {
        let transport = self.transport;
        let session = self.session;
        let count = self.config.find_node_count;
        let parallelism = self.config.parallelism;

        let mut stat = BucketStat::default();
        let mut targets = VecDeque::new();
        let mut in_flight = FuturesUnordered::new();

        for _ in 0..parallelism.min(self.config.max_tries_per_bucket) {
            self.enqueue(bucket, &stat, &mut targets);
        }

        while !stat.is_stopped() && (!in_flight.is_empty() || !targets.is_empty()) {
            while in_flight.len() < parallelism {
                let Some(target) = targets.pop_front() else {
                    break;
                };
                in_flight.push(async move {
                    let result = transport.find_node(session, target, count).await;
                    (target, result)
                });
                stat.attempts += 1;
                self.stats.queries += 1;
            }

            let Some((target, result)) = in_flight.next().await else {
                break;
            };

            match result {
                Ok(nodes) => {
                    let returned = nodes.len();
                    let new = merge_nodes(&mut self.store, nodes);
                    stat.record_yield(new);
                    trace!(peer = %self.peer, bucket, %target, returned, new, "find_node answered");
                }
                Err(err) => {
                    self.stats.failed_queries += 1;
                    stat.record_failure();
                    debug!(peer = %self.peer, bucket, %target, error = %err, "find_node failed");
                }
            }

            if stat.should_stop(&self.config) {
                stat.stop();
            } else {
                self.enqueue(bucket, &stat, &mut targets);
            }
        }

        trace!(
            peer = %self.peer,
            bucket,
            new_total = stat.new_total,
            attempts = stat.attempts,
            "ring finished"
        );
        stat
    }

    /// Queue one more random target for `bucket` if the ring has budget left.
    fn enqueue(&mut self, bucket: usize, stat: &BucketStat, targets: &mut VecDeque<KeyId>) {
        if stat.attempts + targets.len() >= self.config.max_tries_per_bucket {
            return;
        }
        targets.push_back(random_key_at_distance(self.peer, bucket, &mut self.rng));
    }
}
