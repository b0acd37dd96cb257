//! gRPC transport for raft messages.
//!
//! Each node runs one gRPC server and lazily opens one client per peer.
//! The server does no processing: it decodes the frame payload back into
//! a raft message and enqueues it for the node's event loop. Delivery is
//! best-effort; raft tolerates dropped messages.
//!
//! The consensus library encodes its messages with an older protobuf
//! codec than the transport stack, so frames carry the message as opaque
//! payload bytes rather than mirroring its fields.

use std::collections::HashMap;

use prost_old::Message as _;
use raft::eraftpb;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex, RwLock};
use tonic::{Request, Response, Status};
use tracing::debug;

use tessera_common::NodeId;

// Generated from proto/transport.proto.
pub mod proto {
    tonic::include_proto!("transport");
}

pub use proto::raft_transport_client::RaftTransportClient;
pub use proto::raft_transport_server::{RaftTransport, RaftTransportServer};

/// Errors that can occur in the transport layer.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("grpc transport error: {0}")]
    GrpcTransport(#[from] tonic::transport::Error),

    #[error("grpc status error: {0}")]
    GrpcStatus(#[source] Box<tonic::Status>),

    #[error("failed to enqueue inbound message")]
    ChannelSend,

    #[error("unknown peer {0}")]
    UnknownPeer(NodeId),

    #[error("message codec error: {0}")]
    Codec(String),
}

impl From<tonic::Status> for TransportError {
    fn from(status: tonic::Status) -> Self {
        TransportError::GrpcStatus(Box::new(status))
    }
}

/// Pack a raft message into a wire frame.
pub fn to_frame(msg: &eraftpb::Message) -> proto::RaftFrame {
    proto::RaftFrame {
        from: msg.from,
        to: msg.to,
        payload: msg.encode_to_vec(),
    }
}

/// Unpack a wire frame back into a raft message.
pub fn from_frame(frame: &proto::RaftFrame) -> Result<eraftpb::Message, TransportError> {
    eraftpb::Message::decode(frame.payload.as_slice())
        .map_err(|e| TransportError::Codec(e.to_string()))
}

/// gRPC server half: receives frames from peers and enqueues the decoded
/// messages for the event loop.
pub struct TransportServer {
    msg_tx: mpsc::Sender<eraftpb::Message>,
}

impl TransportServer {
    pub fn new(msg_tx: mpsc::Sender<eraftpb::Message>) -> Self {
        Self { msg_tx }
    }

    /// Convert into a gRPC service.
    pub fn into_service(self) -> RaftTransportServer<Self> {
        RaftTransportServer::new(self)
    }
}

#[tonic::async_trait]
impl RaftTransport for TransportServer {
    async fn send_message(
        &self,
        request: Request<proto::RaftFrame>,
    ) -> Result<Response<proto::SendMessageResponse>, Status> {
        let frame = request.into_inner();
        let msg = from_frame(&frame)
            .map_err(|e| Status::invalid_argument(format!("bad raft frame: {e}")))?;

        self.msg_tx
            .try_send(msg)
            .map_err(|_| Status::resource_exhausted("raft message queue full"))?;

        Ok(Response::new(proto::SendMessageResponse {
            success: true,
            error: String::new(),
        }))
    }
}

/// Client half: one lazily-connected gRPC client per peer.
///
/// Addresses come from the cluster address book and may change when a
/// node rejoins under a new address; `set_peer` drops any stale client so
/// the next send reconnects.
pub struct PeerClientPool {
    addresses: RwLock<HashMap<NodeId, String>>,
    clients: Mutex<HashMap<NodeId, RaftTransportClient<tonic::transport::Channel>>>,
}

impl PeerClientPool {
    pub fn new() -> Self {
        Self {
            addresses: RwLock::new(HashMap::new()),
            clients: Mutex::new(HashMap::new()),
        }
    }

    /// Register or update a peer's address.
    pub async fn set_peer(&self, id: NodeId, address: String) {
        let mut addresses = self.addresses.write().await;
        let stale = addresses
            .insert(id, address.clone())
            .is_some_and(|old| old != address);
        drop(addresses);
        if stale {
            self.clients.lock().await.remove(&id);
        }
    }

    /// Forget a removed peer.
    pub async fn remove_peer(&self, id: NodeId) {
        self.addresses.write().await.remove(&id);
        self.clients.lock().await.remove(&id);
    }

    /// Replace the whole peer table.
    pub async fn set_peers(&self, peers: HashMap<NodeId, String>) {
        let mut addresses = self.addresses.write().await;
        let mut clients = self.clients.lock().await;
        clients.retain(|id, _| peers.get(id) == addresses.get(id));
        *addresses = peers;
    }

    /// Send one raft message to its addressee, connecting on first use.
    pub async fn send(&self, msg: eraftpb::Message) -> Result<(), TransportError> {
        let to = msg.to;
        let mut clients = self.clients.lock().await;
        if !clients.contains_key(&to) {
            let address = self
                .addresses
                .read()
                .await
                .get(&to)
                .cloned()
                .ok_or(TransportError::UnknownPeer(to))?;
            let endpoint = format!("http://{address}");
            debug!(peer = to, %endpoint, "connecting to peer");
            let client = RaftTransportClient::connect(endpoint).await?;
            clients.insert(to, client);
        }

        let frame = to_frame(&msg);
        let client = clients.get_mut(&to).expect("client just inserted");
        match client.send_message(Request::new(frame)).await {
            Ok(response) => {
                let result = response.into_inner();
                if !result.success {
                    return Err(TransportError::Codec(result.error));
                }
                Ok(())
            }
            Err(status) => {
                // Drop the broken client; the next send reconnects.
                clients.remove(&to);
                Err(status.into())
            }
        }
    }
}

impl Default for PeerClientPool {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_roundtrip() {
        let mut msg = eraftpb::Message::default();
        msg.from = 1;
        msg.to = 2;
        msg.term = 7;

        let frame = to_frame(&msg);
        assert_eq!(frame.from, 1);
        assert_eq!(frame.to, 2);

        let decoded = from_frame(&frame).unwrap();
        assert_eq!(decoded.term, 7);
        assert_eq!(decoded.to, 2);
    }

    #[test]
    fn test_garbage_frame_rejected() {
        let frame = proto::RaftFrame {
            from: 1,
            to: 2,
            payload: vec![0xde, 0xad, 0xbe, 0xef, 0x01, 0x02, 0x03],
        };
        assert!(from_frame(&frame).is_err());
    }

    #[tokio::test]
    async fn test_send_to_unknown_peer_fails() {
        let pool = PeerClientPool::new();
        let mut msg = eraftpb::Message::default();
        msg.to = 9;
        assert!(matches!(
            pool.send(msg).await,
            Err(TransportError::UnknownPeer(9))
        ));
    }

    #[tokio::test]
    async fn test_changed_address_drops_cached_client() {
        let pool = PeerClientPool::new();
        pool.set_peer(1, "127.0.0.1:1".into()).await;
        pool.set_peer(1, "127.0.0.1:2".into()).await;
        assert_eq!(
            pool.addresses.read().await.get(&1).map(String::as_str),
            Some("127.0.0.1:2")
        );
        assert!(pool.clients.lock().await.is_empty());
    }
}
