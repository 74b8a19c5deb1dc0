#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use anyhow::anyhow;
use rand::{rngs::StdRng, Rng, SeedableRng};
use tokio::sync::RwLock;
use tokio::time::{sleep, Duration};

use iroh_dht_crawler::{
    random_key_at_distance, ConnectionError, DhtTransport, KeyId, Node, QueryError,
};

/// How a synthetic peer answers `find_node`.
#[derive(Clone, Debug)]
pub enum PeerBehavior {
    /// Returns the `count` known nodes closest to the target.
    Closest(Vec<Node>),
    /// Returns only known nodes in the same ring as the target.
    RingScoped(Vec<Node>),
    /// Invents `count` fresh nodes in the target's ring on every query.
    Endless,
    /// Accepts sessions but fails every query.
    Failing,
    /// Refuses sessions.
    Unreachable,
}

#[derive(Default)]
struct Counters {
    sessions_opened: AtomicUsize,
    active_sessions: AtomicUsize,
    max_active_sessions: AtomicUsize,
    max_queries_per_peer: AtomicUsize,
}

/// Decrements a counter when dropped, including when a future is cancelled.
struct Active {
    counter: Arc<AtomicUsize>,
}

impl Active {
    fn enter(counter: Arc<AtomicUsize>, max: &AtomicUsize) -> Self {
        let now = counter.fetch_add(1, Ordering::SeqCst) + 1;
        max.fetch_max(now, Ordering::SeqCst);
        Self { counter }
    }
}

impl Drop for Active {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct TestSession {
    peer: KeyId,
    active_queries: Arc<AtomicUsize>,
    _open: Active,
}

/// In-memory network of synthetic peers with call instrumentation.
pub struct TestNetwork {
    peers: RwLock<HashMap<KeyId, PeerBehavior>>,
    latency: Option<Duration>,
    counters: Arc<Counters>,
    active_sessions: Arc<AtomicUsize>,
    queries: StdMutex<Vec<(KeyId, KeyId)>>,
    rng: StdMutex<StdRng>,
}

impl TestNetwork {
    pub fn new() -> Self {
        Self {
            peers: RwLock::new(HashMap::new()),
            latency: None,
            counters: Arc::new(Counters::default()),
            active_sessions: Arc::new(AtomicUsize::new(0)),
            queries: StdMutex::new(Vec::new()),
            rng: StdMutex::new(StdRng::seed_from_u64(0)),
        }
    }

    /// Delay every session setup and query by `latency`.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    pub async fn add_peer(&self, id: KeyId, behavior: PeerBehavior) {
        let mut peers = self.peers.write().await;
        peers.insert(id, behavior);
    }

    /// Every `find_node` call as `(queried peer, target)`, in issue order.
    pub fn queries(&self) -> Vec<(KeyId, KeyId)> {
        self.queries.lock().expect("query log poisoned").clone()
    }

    pub fn queries_to(&self, peer: &KeyId) -> Vec<KeyId> {
        self.queries()
            .into_iter()
            .filter(|(to, _)| to == peer)
            .map(|(_, target)| target)
            .collect()
    }

    pub fn sessions_opened(&self) -> usize {
        self.counters.sessions_opened.load(Ordering::SeqCst)
    }

    pub fn active_sessions(&self) -> usize {
        self.active_sessions.load(Ordering::SeqCst)
    }

    pub fn max_active_sessions(&self) -> usize {
        self.counters.max_active_sessions.load(Ordering::SeqCst)
    }

    pub fn max_queries_per_peer(&self) -> usize {
        self.counters.max_queries_per_peer.load(Ordering::SeqCst)
    }

    async fn maybe_sleep(&self) {
        if let Some(delay) = self.latency {
            sleep(delay).await;
        }
    }

    fn invent_nodes(&self, peer: &KeyId, target: &KeyId, count: usize) -> Vec<Node> {
        let ring = peer.distance(target).bucket_index();
        let mut rng = self.rng.lock().expect("rng poisoned");
        (0..count)
            .map(|_| {
                let id = random_key_at_distance(peer, ring, &mut *rng);
                Node {
                    id,
                    public_key: rng.gen(),
                    addrs: vec![format!("invented-{id}")],
                    version: 0,
                }
            })
            .collect()
    }
}

#[async_trait::async_trait]
impl DhtTransport for TestNetwork {
    type Session = TestSession;

    async fn open_session(&self, node: &Node) -> Result<TestSession, ConnectionError> {
        let open = Active::enter(
            self.active_sessions.clone(),
            &self.counters.max_active_sessions,
        );
        self.counters.sessions_opened.fetch_add(1, Ordering::SeqCst);
        self.maybe_sleep().await;

        let reachable = {
            let peers = self.peers.read().await;
            !matches!(peers.get(&node.id), None | Some(PeerBehavior::Unreachable))
        };
        if !reachable {
            return Err(ConnectionError::Unreachable(format!("{} is offline", node.id)));
        }
        Ok(TestSession {
            peer: node.id,
            active_queries: Arc::new(AtomicUsize::new(0)),
            _open: open,
        })
    }

    async fn find_node(
        &self,
        session: &TestSession,
        target: KeyId,
        count: usize,
    ) -> Result<Vec<Node>, QueryError> {
        let _query = Active::enter(
            session.active_queries.clone(),
            &self.counters.max_queries_per_peer,
        );
        self.queries
            .lock()
            .expect("query log poisoned")
            .push((session.peer, target));
        self.maybe_sleep().await;

        let behavior = {
            let peers = self.peers.read().await;
            peers.get(&session.peer).cloned()
        };
        let peer = session.peer;
        match behavior {
            Some(PeerBehavior::Closest(mut known)) => {
                known.sort_by_key(|n| target.distance(&n.id));
                known.truncate(count);
                Ok(known)
            }
            Some(PeerBehavior::RingScoped(known)) => {
                let ring = peer.distance(&target).bucket_index();
                Ok(known
                    .into_iter()
                    .filter(|n| peer.distance(&n.id).bucket_index() == ring)
                    .take(count)
                    .collect())
            }
            Some(PeerBehavior::Endless) => Ok(self.invent_nodes(&peer, &target, count)),
            Some(PeerBehavior::Failing) => Err(QueryError::Rejected("injected failure".into())),
            Some(PeerBehavior::Unreachable) | None => {
                Err(QueryError::Transport(anyhow!("peer vanished")))
            }
        }
    }
}

pub fn make_key_id(index: u32) -> KeyId {
    let mut id = [0u8; 32];
    id[..4].copy_from_slice(&index.to_be_bytes());
    KeyId(id)
}

pub fn make_node(index: u32) -> Node {
    let id = make_key_id(index);
    Node {
        id,
        public_key: id.0,
        addrs: vec![format!("node-{index}")],
        version: 0,
    }
}

/// A node placed in ring `ring` of `peer`.
pub fn node_in_ring(peer: &KeyId, ring: usize, rng: &mut StdRng) -> Node {
    let id = random_key_at_distance(peer, ring, rng);
    Node {
        id,
        public_key: rng.gen(),
        addrs: vec![format!("ring-{ring}-{id}")],
        version: 0,
    }
}

/// Register `count` peers that all know each other and return their records.
pub async fn fully_connected(network: &TestNetwork, count: u32) -> Vec<Node> {
    let nodes: Vec<Node> = (1..=count).map(make_node).collect();
    for node in &nodes {
        let others = nodes.iter().filter(|n| n.id != node.id).cloned().collect();
        network.add_peer(node.id, PeerBehavior::Closest(others)).await;
    }
    nodes
}
