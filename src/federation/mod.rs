//! Federation layer: a replicated tuple registry over a UDP RPC fabric.
//!
//! Nodes bootstrap from a static seed list, replicate each other's owned
//! tuples at join time, and afterwards lend resources and route events to
//! advertised handlers. The registry is eventually consistent: replication
//! is best-effort at join, and stale entries are pruned lazily when their
//! owners stop answering.

pub mod contact;
pub mod handle;
pub mod node;
pub mod store;
pub mod transport;
pub mod tuple;
pub mod wire;

pub use contact::{Contact, ContactRegistry};
pub use handle::NodeHandle;
pub use node::{
    ClaimedResource, Event, FederationNode, HandledEvent, HandlerClass, IvrEvent, IvrGatewayInfo,
    NodeConfig, NodeError, ResourceInfo, SmsEvent, SmsGatewayInfo, classify_ivr_handler,
};
pub use store::TupleStore;
pub use transport::{RpcReply, RpcService, RpcServiceError, RpcTransport, TransportError};
pub use tuple::{Tuple, TupleTemplate};
