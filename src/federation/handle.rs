//! Synchronous facade over the federation node for application threads.
//!
//! Application and FastAGI worker threads live outside the reactor; every
//! node operation they invoke is marshalled onto the runtime and awaited to
//! completion here. Never call these methods from inside the runtime — use
//! the async API on [`FederationNode`] there instead.

use std::net::IpAddr;
use std::sync::Arc;

use tokio::runtime::Handle;

use crate::application::Application;
use crate::domain::{NodeId, ResourceKind};
use crate::federation::node::{
    ClaimedResource, FederationNode, IvrEvent, NodeError, SmsEvent,
};
use crate::federation::tuple::Tuple;

/// Cloneable handle reaching the process's federation node from any thread.
#[derive(Clone)]
pub struct NodeHandle {
    node: Arc<FederationNode>,
    runtime: Handle,
}

impl NodeHandle {
    /// Captures the current runtime; called once at join time.
    pub(crate) fn new(node: Arc<FederationNode>) -> Self {
        Self {
            node,
            runtime: Handle::current(),
        }
    }

    #[must_use]
    pub fn node_id(&self) -> NodeId {
        self.node.id()
    }

    #[must_use]
    pub fn node(&self) -> &Arc<FederationNode> {
        &self.node
    }

    /// Claims a resource, blocking the calling thread.
    ///
    /// `exclusive` takes the tuple (claim/release lifecycle); otherwise the
    /// resource is only read, as for shared SMS gateways.
    pub fn claim_resource(
        &self,
        kind: ResourceKind,
        blocking: bool,
        exclusive: bool,
    ) -> Result<Option<ClaimedResource>, NodeError> {
        self.runtime
            .block_on(self.node.claim_resource(kind, blocking, exclusive))
    }

    /// Returns a claimed resource to the federation.
    pub fn release_resource(&self, claim: &ClaimedResource) {
        self.node.release_resource(claim);
    }

    /// Takes this node's own resource tuple as an inbound gate; blocks
    /// until one is free. Nodes lending nothing of this kind skip the gate.
    pub fn take_own_resource(&self, kind: ResourceKind) -> Option<Tuple> {
        self.runtime.block_on(self.node.take_own_resource(kind))
    }

    /// Puts a gate resource back.
    pub fn release_own_resource(&self, tuple: &Tuple) {
        self.node.release_own_resource(tuple);
    }

    /// Publishes a resource tuple.
    pub fn publish_resource(&self, kind: ResourceKind, original_publisher: Option<NodeId>) {
        self.node.publish_resource(kind, original_publisher);
    }

    /// Registers an application with the node.
    pub fn run_application(&self, app: Application) {
        self.node.run_application(app);
    }

    /// Routes an inbound call event; returns the FastAGI address to
    /// re-route the leg to, or `None` when no handler responded.
    pub fn notify_ivr_event(&self, event: IvrEvent) -> Option<(IpAddr, u16)> {
        self.runtime.block_on(self.node.notify_ivr_event(event))
    }

    /// Routes an inbound SMS event.
    pub fn notify_sms_event(&self, event: SmsEvent) {
        self.runtime.block_on(self.node.notify_sms_event(event));
    }

    /// Orderly node shutdown; blocks until claimed resources drain.
    pub fn shutdown(&self) {
        self.runtime.block_on(self.node.shutdown());
    }

    /// Runs a future to completion on the node's runtime; for in-crate
    /// callers on application threads.
    pub(crate) fn block_on<F: std::future::Future>(&self, future: F) -> F::Output {
        self.runtime.block_on(future)
    }
}
