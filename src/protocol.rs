//! DHT wire protocol spoken by the crawled peers.
//!
//! These are the irpc messages of an iroh-sdht node. The crawler only sends
//! `FindNode` and `Ping`, but every variant is declared in the peer's order so
//! the encoded variant tags match what the peer expects.

use irpc::channel::oneshot;
use irpc::rpc_requests;
use serde::{Deserialize, Serialize};

/// A routing table entry as it travels on the wire.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Contact {
    /// BLAKE3 hash of the endpoint's public key.
    pub id: [u8; 32],
    /// JSON-serialized iroh `EndpointAddr`.
    pub addr: String,
}

/// Ping request to check if a node is responsive.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PingRequest {
    /// The sender's contact information.
    pub from: Contact,
}

/// Find nodes closest to a target ID.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FindNodeRequest {
    /// The sender's contact information.
    pub from: Contact,
    /// The target ID to find neighbors for.
    pub target: [u8; 32],
}

/// Value lookup. Never sent by the crawler.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FindValueRequest {
    pub from: Contact,
    pub key: [u8; 32],
}

/// Answer to [`FindValueRequest`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FindValueResponse {
    pub value: Option<Vec<u8>>,
    pub closer: Vec<Contact>,
}

/// Value store. Never sent by the crawler.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StoreRequest {
    pub from: Contact,
    pub key: [u8; 32],
    pub value: Vec<u8>,
}

/// The DHT protocol definition using irpc's RPC framework.
#[rpc_requests(message = DhtMessage)]
#[derive(Debug, Serialize, Deserialize)]
pub enum DhtProtocol {
    /// Contacts closest to a target known to the peer.
    #[rpc(tx = oneshot::Sender<Vec<Contact>>)]
    FindNode(FindNodeRequest),
    #[rpc(tx = oneshot::Sender<FindValueResponse>)]
    FindValue(FindValueRequest),
    #[rpc(tx = oneshot::Sender<()>)]
    Store(StoreRequest),
    /// Ping to check responsiveness. Returns acknowledgment.
    #[rpc(tx = oneshot::Sender<()>)]
    Ping(PingRequest),
}
