//! Transport implementation using iroh QUIC endpoints.
//!
//! [`IrohTransport`] implements [`DhtTransport`] by speaking the iroh-sdht
//! [`DhtProtocol`] over irpc, so it can drain any node that serves
//! [`DHT_ALPN`]. Node addresses are JSON-serialized [`EndpointAddr`]s; the
//! first one that parses is dialed.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use iroh::{Endpoint, EndpointAddr};
use irpc::Client;
use tokio::time::timeout;
use tracing::debug;

use crate::core::{derive_key_id, DhtTransport, KeyId, Node};
use crate::error::{ConnectionError, QueryError};
use crate::protocol::{Contact, DhtProtocol, FindNodeRequest, PingRequest};

/// ALPN protocol identifier of iroh-sdht nodes.
pub const DHT_ALPN: &[u8] = b"myapp/dht/1";

/// Upper bound on dialing a peer and getting its ping answered.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Upper bound on a single `find_node` round trip.
pub const DEFAULT_QUERY_TIMEOUT: Duration = Duration::from_secs(5);

/// Network implementation using iroh QUIC transport.
pub struct IrohTransport {
    /// The iroh endpoint used for outgoing connections.
    pub endpoint: Endpoint,
    /// Our own contact, sent along with every request.
    self_contact: Contact,
    connect_timeout: Duration,
    query_timeout: Duration,
}

/// An open, ping-verified RPC client for one peer.
pub struct IrohSession {
    client: Client<DhtProtocol>,
}

impl IrohTransport {
    /// Wrap a bound endpoint, advertising its current address to peers.
    pub fn new(endpoint: Endpoint) -> Result<Self> {
        let addr: EndpointAddr = endpoint.addr();
        let self_contact = Contact {
            id: derive_key_id(endpoint.id().as_bytes()).0,
            addr: serde_json::to_string(&addr).context("encoding own endpoint address")?,
        };
        Ok(Self {
            endpoint,
            self_contact,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            query_timeout: DEFAULT_QUERY_TIMEOUT,
        })
    }

    /// Override the connect and query timeouts.
    pub fn with_timeouts(mut self, connect_timeout: Duration, query_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self.query_timeout = query_timeout;
        self
    }

    /// Pick the first address of `node` that decodes as an [`EndpointAddr`].
    fn parse_addr(node: &Node) -> Result<EndpointAddr, ConnectionError> {
        node.addrs
            .iter()
            .find_map(|addr| serde_json::from_str(addr).ok())
            .ok_or(ConnectionError::NoUsableAddress)
    }
}

/// Describe an iroh endpoint as a crawlable [`Node`].
///
/// The endpoint's public key becomes the node's public key and the full
/// address is stored JSON-encoded, the form [`IrohTransport`] dials.
pub fn node_from_endpoint_addr(addr: &EndpointAddr) -> Result<Node> {
    let encoded = serde_json::to_string(addr).context("encoding endpoint address")?;
    Ok(Node::from_public_key(*addr.id.as_bytes(), vec![encoded], 0))
}

/// Parse a JSON-encoded [`EndpointAddr`] given on the command line.
pub fn node_from_json(json: &str) -> Result<Node> {
    let addr: EndpointAddr =
        serde_json::from_str(json).with_context(|| format!("invalid endpoint address: {json}"))?;
    node_from_endpoint_addr(&addr)
}

/// Turn a wire contact into a [`Node`].
///
/// The public key is read from the contact's address. Contacts whose address
/// does not decode, or whose id is not the hash of that key, are dropped.
fn node_from_contact(contact: Contact) -> Option<Node> {
    let addr: EndpointAddr = match serde_json::from_str(&contact.addr) {
        Ok(addr) => addr,
        Err(err) => {
            debug!(contact = %hex::encode(contact.id), error = %err, "dropping contact without endpoint address");
            return None;
        }
    };
    let node = Node {
        id: KeyId::from(contact.id),
        public_key: *addr.id.as_bytes(),
        addrs: vec![contact.addr],
        version: 0,
    };
    if derive_key_id(&node.public_key) != node.id {
        debug!(contact = %node.id, "dropping contact that does not match its public key");
        return None;
    }
    Some(node)
}

#[async_trait]
impl DhtTransport for IrohTransport {
    type Session = IrohSession;

    /// Dial the peer and wait for a PING answer.
    async fn open_session(&self, node: &Node) -> Result<IrohSession, ConnectionError> {
        let addr = Self::parse_addr(node)?;
        let client = irpc_iroh::client::<DhtProtocol>(self.endpoint.clone(), addr, DHT_ALPN);
        let ping = PingRequest {
            from: self.self_contact.clone(),
        };
        match timeout(self.connect_timeout, client.rpc(ping)).await {
            Err(_) => Err(ConnectionError::Timeout),
            Ok(Err(err)) => Err(ConnectionError::Transport(err.into())),
            Ok(Ok(())) => Ok(IrohSession { client }),
        }
    }

    /// Send a FIND_NODE RPC and keep at most `count` well-formed records.
    async fn find_node(
        &self,
        session: &IrohSession,
        target: KeyId,
        count: usize,
    ) -> Result<Vec<Node>, QueryError> {
        let request = FindNodeRequest {
            from: self.self_contact.clone(),
            target: target.0,
        };
        let contacts = timeout(self.query_timeout, session.client.rpc(request))
            .await
            .map_err(|_| QueryError::Timeout)?
            .map_err(|err| QueryError::Transport(err.into()))?;

        Ok(contacts
            .into_iter()
            .filter_map(node_from_contact)
            .take(count)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use iroh::SecretKey;

    use super::*;

    fn contact_for(seed: u8) -> (Contact, [u8; 32]) {
        let public = SecretKey::from_bytes(&[seed; 32]).public();
        let addr = EndpointAddr::new(public);
        let contact = Contact {
            id: derive_key_id(public.as_bytes()).0,
            addr: serde_json::to_string(&addr).expect("encode addr"),
        };
        (contact, *public.as_bytes())
    }

    #[test]
    fn nodes_without_decodable_address_are_rejected() {
        let node = Node::from_public_key([1u8; 32], vec!["not json".into()], 0);
        assert!(matches!(
            IrohTransport::parse_addr(&node),
            Err(ConnectionError::NoUsableAddress)
        ));
    }

    #[test]
    fn contacts_become_unversioned_nodes() {
        let (contact, public_key) = contact_for(3);

        let node = node_from_contact(contact.clone()).expect("valid contact");

        assert_eq!(node.id, KeyId(contact.id));
        assert_eq!(node.public_key, public_key);
        assert_eq!(node.addrs, vec![contact.addr]);
        assert_eq!(node.version, 0);
        assert!(IrohTransport::parse_addr(&node).is_ok());
    }

    #[test]
    fn forged_contacts_are_dropped_without_losing_honest_ones() {
        let (honest, _) = contact_for(4);
        let (mut forged, _) = contact_for(5);
        forged.id = [0u8; 32];
        let garbled = Contact {
            id: [9u8; 32],
            addr: "not json".into(),
        };

        let nodes: Vec<Node> = [forged, honest.clone(), garbled]
            .into_iter()
            .filter_map(node_from_contact)
            .collect();

        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].id, KeyId(honest.id));
    }
}
