//! Framed UDP request/response transport for the federation.
//!
//! One node owns one UDP endpoint. Outbound calls register a pending entry
//! keyed by message id and complete through a oneshot when the matching
//! response, error response or timeout arrives. Inbound requests dispatch
//! to the node's RPC service on their own task so a slow handler never
//! stalls the receive loop.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::sync::{Notify, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, trace, warn};

use crate::domain::{NodeId, RpcId};
use crate::federation::wire::{
    Assembler, DATAGRAM_BUDGET, RpcMessage, WireError, WireValue, decode, encode, split_datagrams,
};

/// Default time to wait for an RPC response.
pub const RPC_TIMEOUT: Duration = Duration::from_millis(500);

/// Failures surfaced to RPC callers.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The peer did not answer in time. Carries the dead contact's id —
    /// this is the only retryable failure.
    #[error("rpc to {contact} timed out")]
    Timeout { contact: NodeId },

    /// The peer answered with a tagged error response.
    #[error("remote raised {exception}: {message}")]
    Remote { exception: String, message: String },

    #[error(transparent)]
    Wire(#[from] WireError),

    #[error("transport i/o failure: {0}")]
    Io(#[from] std::io::Error),

    #[error("transport is shut down")]
    Closed,
}

/// Outcome of handling one inbound request.
#[derive(Debug, Error)]
pub enum RpcServiceError {
    /// The method exists but is not marked RPC-exposed, or does not exist
    /// at all. Reported to the peer with a `MethodNotExposed` tag.
    #[error("method {0} is not callable over the wire")]
    MethodNotExposed(String),

    /// The handler ran and failed; the tag and message travel back in an
    /// error response.
    #[error("{exception}: {message}")]
    Failed { exception: String, message: String },
}

/// A successful RPC reply: the payload plus the responder's identity as
/// learned from the reply envelope.
#[derive(Debug, Clone)]
pub struct RpcReply {
    pub sender: NodeId,
    pub payload: WireValue,
}

/// Server side of the transport: the federation node implements this with
/// an explicit dispatch table of RPC-exposed methods.
#[async_trait]
pub trait RpcService: Send + Sync {
    async fn handle_rpc(
        &self,
        sender: NodeId,
        source: SocketAddr,
        method: &str,
        args: &[WireValue],
    ) -> Result<WireValue, RpcServiceError>;
}

type PendingReply = oneshot::Sender<Result<RpcReply, TransportError>>;

/// UDP endpoint with request/response correlation and fragmentation.
pub struct RpcTransport {
    socket: Arc<UdpSocket>,
    local_id: NodeId,
    pending: Arc<DashMap<RpcId, PendingReply>>,
    timeout: Duration,
    shutdown: Arc<Notify>,
}

impl RpcTransport {
    /// Binds the node's UDP endpoint.
    pub async fn bind(local_id: NodeId, port: u16) -> Result<Self, TransportError> {
        let socket = UdpSocket::bind(("0.0.0.0", port)).await?;
        Ok(Self {
            socket: Arc::new(socket),
            local_id,
            pending: Arc::new(DashMap::new()),
            timeout: RPC_TIMEOUT,
            shutdown: Arc::new(Notify::new()),
        })
    }

    /// Overrides the RPC timeout (tests shorten it).
    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    pub fn local_addr(&self) -> Result<SocketAddr, TransportError> {
        Ok(self.socket.local_addr()?)
    }

    #[must_use]
    pub fn local_id(&self) -> NodeId {
        self.local_id
    }

    /// Starts the receive worker, dispatching inbound requests to `service`.
    pub fn start(&self, service: Arc<dyn RpcService>) -> JoinHandle<()> {
        let socket = Arc::clone(&self.socket);
        let pending = Arc::clone(&self.pending);
        let shutdown = Arc::clone(&self.shutdown);
        let local_id = self.local_id;
        tokio::spawn(async move {
            let mut assembler = Assembler::new();
            let mut buffer = vec![0u8; DATAGRAM_BUDGET];
            loop {
                tokio::select! {
                    incoming = socket.recv_from(&mut buffer) => {
                        match incoming {
                            Ok((len, source)) => {
                                let datagram = &buffer[..len];
                                if let Err(err) = handle_datagram(
                                    datagram,
                                    source,
                                    &mut assembler,
                                    &socket,
                                    &pending,
                                    &service,
                                    local_id,
                                ) {
                                    debug!("dropping malformed datagram from {source}: {err}");
                                }
                            }
                            Err(err) => {
                                error!("unexpected error reading from udp socket: {err}");
                            }
                        }
                    }
                    () = shutdown.notified() => {
                        trace!("transport receive worker shutting down");
                        break;
                    }
                }
            }
        })
    }

    /// Stops the receive worker. Pending callers complete with `Closed`.
    pub fn stop(&self) {
        // notify_one stores a permit, so a stop issued while the worker is
        // mid-dispatch still lands.
        self.shutdown.notify_one();
        self.pending.retain(|_, _| false);
    }

    /// Issues an RPC to a peer endpoint and awaits the reply.
    ///
    /// `contact_id` identifies the peer for timeout reporting; during join
    /// the caller synthesizes a temporary id for a seed it has not met yet.
    pub async fn send_rpc(
        &self,
        contact_id: NodeId,
        peer: SocketAddr,
        method: &str,
        args: Vec<WireValue>,
    ) -> Result<RpcReply, TransportError> {
        let id = RpcId::generate();
        let message = RpcMessage::Request {
            id,
            sender: self.local_id,
            method: method.to_string(),
            args,
        };
        let (reply_tx, reply_rx) = oneshot::channel();
        self.pending.insert(id, reply_tx);

        let encoded = encode(&message.to_wire());
        for datagram in split_datagrams(id, &encoded, DATAGRAM_BUDGET) {
            if let Err(err) = self.socket.send_to(&datagram, peer).await {
                self.pending.remove(&id);
                return Err(err.into());
            }
        }
        trace!("sent rpc {method} ({id}) to {peer}");

        match tokio::time::timeout(self.timeout, reply_rx).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => Err(TransportError::Closed),
            Err(_) => {
                self.pending.remove(&id);
                Err(TransportError::Timeout { contact: contact_id })
            }
        }
    }
}

/// Feeds one datagram through reassembly and decodes/handles the message.
fn handle_datagram(
    datagram: &[u8],
    source: SocketAddr,
    assembler: &mut Assembler,
    socket: &Arc<UdpSocket>,
    pending: &Arc<DashMap<RpcId, PendingReply>>,
    service: &Arc<dyn RpcService>,
    local_id: NodeId,
) -> Result<(), TransportError> {
    let Some(encoded) = assembler.feed(datagram)? else {
        return Ok(());
    };
    let message = RpcMessage::from_wire(&decode(&encoded)?)?;
    match message {
        RpcMessage::Request { id, sender, method, args } => {
            let socket = Arc::clone(socket);
            let service = Arc::clone(service);
            tokio::spawn(async move {
                let reply = match service.handle_rpc(sender, source, &method, &args).await {
                    Ok(payload) => RpcMessage::Response {
                        id,
                        sender: local_id,
                        payload,
                    },
                    Err(RpcServiceError::MethodNotExposed(name)) => RpcMessage::Error {
                        id,
                        sender: local_id,
                        exception: "MethodNotExposed".into(),
                        message: format!("no such rpc: {name}"),
                    },
                    Err(RpcServiceError::Failed { exception, message }) => RpcMessage::Error {
                        id,
                        sender: local_id,
                        exception,
                        message,
                    },
                };
                let encoded = encode(&reply.to_wire());
                for datagram in split_datagrams(id, &encoded, DATAGRAM_BUDGET) {
                    if let Err(err) = socket.send_to(&datagram, source).await {
                        warn!("failed to send rpc reply to {source}: {err}");
                        break;
                    }
                }
            });
        }
        RpcMessage::Response { id, sender, payload } => {
            if let Some((_, reply_tx)) = pending.remove(&id) {
                let _ = reply_tx.send(Ok(RpcReply { sender, payload }));
            } else {
                debug!("unrequested response {id} from {source}");
            }
        }
        RpcMessage::Error { id, sender, exception, message } => {
            if let Some((_, reply_tx)) = pending.remove(&id) {
                debug!("rpc {id} failed at {sender}: {exception}");
                let _ = reply_tx.send(Err(TransportError::Remote { exception, message }));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EchoService;

    #[async_trait]
    impl RpcService for EchoService {
        async fn handle_rpc(
            &self,
            _sender: NodeId,
            _source: SocketAddr,
            method: &str,
            args: &[WireValue],
        ) -> Result<WireValue, RpcServiceError> {
            match method {
                "echo" => Ok(args.first().cloned().unwrap_or(WireValue::Int(0))),
                "blob" => {
                    // Exercises response fragmentation.
                    Ok(WireValue::Bytes(vec![9u8; 100_000]))
                }
                "boom" => Err(RpcServiceError::Failed {
                    exception: "HandlerFailed".into(),
                    message: "boom".into(),
                }),
                other => Err(RpcServiceError::MethodNotExposed(other.to_string())),
            }
        }
    }

    async fn endpoint() -> (RpcTransport, SocketAddr, NodeId) {
        let id = NodeId::generate();
        let transport = RpcTransport::bind(id, 0).await.unwrap();
        let addr = transport.local_addr().unwrap();
        transport.start(Arc::new(EchoService));
        (transport, addr, id)
    }

    #[tokio::test]
    async fn request_and_response_round_trip() {
        let (client, _, _) = endpoint().await;
        let (server, server_addr, server_id) = endpoint().await;

        let reply = client
            .send_rpc(server_id, server_addr, "echo", vec![WireValue::str("hi")])
            .await
            .unwrap();
        assert_eq!(reply.sender, server_id);
        assert_eq!(reply.payload, WireValue::str("hi"));
        drop(server);
    }

    #[tokio::test]
    async fn oversize_responses_reassemble() {
        let (client, _, _) = endpoint().await;
        let (_server, server_addr, server_id) = endpoint().await;

        let reply = client
            .send_rpc(server_id, server_addr, "blob", vec![])
            .await
            .unwrap();
        assert_eq!(reply.payload.as_bytes().unwrap().len(), 100_000);
    }

    #[tokio::test]
    async fn unexposed_method_raises_remote_error() {
        let (client, _, _) = endpoint().await;
        let (_server, server_addr, server_id) = endpoint().await;

        let err = client
            .send_rpc(server_id, server_addr, "not_a_method", vec![])
            .await
            .unwrap_err();
        match err {
            TransportError::Remote { exception, .. } => {
                assert_eq!(exception, "MethodNotExposed");
            }
            other => panic!("expected remote error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn handler_failures_carry_their_tag() {
        let (client, _, _) = endpoint().await;
        let (_server, server_addr, server_id) = endpoint().await;

        let err = client
            .send_rpc(server_id, server_addr, "boom", vec![])
            .await
            .unwrap_err();
        match err {
            TransportError::Remote { exception, message } => {
                assert_eq!(exception, "HandlerFailed");
                assert_eq!(message, "boom");
            }
            other => panic!("expected remote error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn dead_peer_times_out_with_contact_id() {
        let (mut client, _, _) = endpoint().await;
        client.set_timeout(Duration::from_millis(50));
        let dead_id = NodeId::generate();
        let dead_addr: SocketAddr = "127.0.0.1:1".parse().unwrap();

        let err = client
            .send_rpc(dead_id, dead_addr, "echo", vec![])
            .await
            .unwrap_err();
        match err {
            TransportError::Timeout { contact } => assert_eq!(contact, dead_id),
            other => panic!("expected timeout, got {other:?}"),
        }
    }
}
