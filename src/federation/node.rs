//! The federation node: composes the transport, contact registry and tuple
//! store, and exposes the user-facing join/publish/claim/route API.
//!
//! Only five methods are callable over the wire: `invokeResource`,
//! `handleEvent`, `findTuple`, `getOwnedTuples` and `getAllTuples`. The
//! dispatch table is explicit; anything else answers with a
//! `MethodNotExposed` error response.

use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::sleep;
use tracing::{info, warn};

use crate::agi::server::{FastAgiServer, HandlerSlot};
use crate::application::{
    Application, IvrApplication, IvrHandlerFilters, SmsApplication, spawn_ivr_worker,
    spawn_proactive_worker, spawn_sms_worker,
};
use crate::config::{IvrConfig, SmsConfig};
use crate::domain::{ClaimedResources, HandlerId, NodeId, ResourceKind};
use crate::federation::contact::{Contact, ContactRegistry};
use crate::federation::handle::NodeHandle;
use crate::federation::store::TupleStore;
use crate::federation::transport::{
    RpcService, RpcServiceError, RpcTransport, TransportError,
};
use crate::federation::tuple::{Tuple, TupleTemplate};
use crate::federation::wire::WireValue;
use crate::pbx::manager::ManagerClient;
use crate::sms::SmsReceiver;

/// Poll interval while waiting for claimed resources to drain at shutdown.
pub const SHUTDOWN_POLL: Duration = Duration::from_millis(500);

/// Retry interval for blocking claims when nothing matches yet.
pub const CLAIM_RETRY: Duration = Duration::from_millis(100);

/// An inbound call event routed across the federation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IvrEvent {
    pub handler_id: HandlerId,
    pub channel: String,
    pub caller_id: String,
    pub session_id: String,
}

/// An inbound SMS event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SmsEvent {
    pub caller_id: String,
    pub message: String,
}

/// Events a node can be asked to handle.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    Ivr(IvrEvent),
    Sms(SmsEvent),
    Shutdown { node_id: NodeId },
}

/// Direct-access credentials for an outgoing-call gateway.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IvrGatewayInfo {
    pub host: String,
    pub port: u16,
    pub channel: String,
    pub username: String,
    pub secret: String,
    pub gateway_address: Option<String>,
    pub prefix: Option<String>,
    pub internal_extension_length: Option<usize>,
}

/// Direct-access credentials for an outgoing-SMS gateway.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SmsGatewayInfo {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
}

/// What `invokeResource` hands back to a successful claimer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ResourceInfo {
    Ivr(IvrGatewayInfo),
    Sms(SmsGatewayInfo),
}

/// A successfully claimed (or read) resource.
#[derive(Debug, Clone)]
pub struct ClaimedResource {
    pub info: ResourceInfo,
    /// The matched tuple; its owner field names the original publisher and
    /// must be preserved across release.
    pub tuple: Tuple,
    /// The providing contact, when the resource is remote.
    pub provider: Option<Contact>,
    /// Whether the tuple was taken exclusively (and must be released).
    pub exclusive: bool,
}

impl ClaimedResource {
    /// The node the resource should be attributed to on release.
    #[must_use]
    pub fn original_owner(&self) -> NodeId {
        self.tuple.owner()
    }
}

/// Errors surfaced by federation-node operations.
#[derive(Debug, Error)]
pub enum NodeError {
    #[error("join failed: none of the contacts could be reached")]
    NoSeedsReachable,

    #[error("join failed: not all contacts responded")]
    NotAllContactsResponded,

    #[error("join failed: {0}")]
    JoinFailed(String),

    #[error(transparent)]
    Transport(#[from] TransportError),

    /// A claim RPC to the owner timed out after the tuple was consumed.
    #[error("claimed resource lost: no response from {contact}")]
    ClaimLost { contact: NodeId },

    #[error("event could not be handled: {0}")]
    EventNotHandled(String),

    #[error("malformed rpc payload: {0}")]
    BadPayload(String),

    #[error("fastagi server failed to start: {0}")]
    AgiServer(#[from] std::io::Error),
}

/// Construction parameters for a node.
#[derive(Debug, Default)]
pub struct NodeConfig {
    pub udp_port: u16,
    pub ivr: Option<IvrConfig>,
    pub sms: Option<SmsConfig>,
    /// Overrides the RPC timeout; tests shorten it.
    pub rpc_timeout: Option<Duration>,
}

#[derive(Default)]
struct RegisteredApplications {
    ivr: Vec<(Arc<dyn IvrApplication>, IvrHandlerFilters)>,
    sms: Vec<Arc<dyn SmsApplication>>,
}

/// A node in the telephony federation.
pub struct FederationNode {
    id: NodeId,
    transport: RpcTransport,
    contacts: ContactRegistry,
    store: TupleStore,
    claimed: ClaimedResources,
    ivr_config: Option<IvrConfig>,
    sms_config: Option<SmsConfig>,
    agi_server: OnceLock<Arc<FastAgiServer>>,
    applications: Mutex<RegisteredApplications>,
    deferred: Mutex<Vec<Application>>,
    joined: AtomicBool,
    handle_cell: OnceLock<NodeHandle>,
}

impl FederationNode {
    /// Binds the node's UDP endpoint and prepares it for `join`.
    pub async fn create(config: NodeConfig) -> Result<Arc<Self>, NodeError> {
        let id = NodeId::generate();
        let mut transport = RpcTransport::bind(id, config.udp_port).await?;
        if let Some(timeout) = config.rpc_timeout {
            transport.set_timeout(timeout);
        }
        info!("node {id} bound udp endpoint {}", transport.local_addr()?);
        Ok(Arc::new(Self {
            id,
            transport,
            contacts: ContactRegistry::new(),
            store: TupleStore::new(),
            claimed: ClaimedResources::new(),
            ivr_config: config.ivr,
            sms_config: config.sms,
            agi_server: OnceLock::new(),
            applications: Mutex::new(RegisteredApplications::default()),
            deferred: Mutex::new(Vec::new()),
            joined: AtomicBool::new(false),
            handle_cell: OnceLock::new(),
        }))
    }

    #[must_use]
    pub fn id(&self) -> NodeId {
        self.id
    }

    /// The node's UDP endpoint.
    pub fn udp_addr(&self) -> Result<SocketAddr, NodeError> {
        Ok(self.transport.local_addr()?)
    }

    /// The synchronous facade handed to application threads. Available once
    /// `join` has been called.
    #[must_use]
    pub fn handle(&self) -> NodeHandle {
        self.handle_cell
            .get()
            .cloned()
            .expect("node handle requested before join")
    }

    #[must_use]
    pub fn contacts(&self) -> &ContactRegistry {
        &self.contacts
    }

    #[must_use]
    pub fn store(&self) -> &TupleStore {
        &self.store
    }

    #[must_use]
    pub fn claimed_resources(&self) -> usize {
        self.claimed.current()
    }

    #[must_use]
    pub fn agi_server(&self) -> Option<Arc<FastAgiServer>> {
        self.agi_server.get().cloned()
    }

    /// Joins the federation through the given seed addresses.
    ///
    /// Each seed is polled with a `getOwnedTuples` RPC; its reply teaches us
    /// the real node id and replicates its owned tuples. Join succeeds only
    /// when every seed answered; with an empty seed list it succeeds
    /// immediately.
    pub async fn join(self: &Arc<Self>, seeds: &[SocketAddr]) -> Result<(), NodeError> {
        self.transport.start(Arc::clone(self) as Arc<dyn RpcService>);
        let _ = self.handle_cell.set(NodeHandle::new(Arc::clone(self)));
        info!("node {} joining federation via {} seed(s)", self.id, seeds.len());

        let mut timeouts = 0usize;
        for seed in seeds {
            // The real id is only learned from the reply envelope.
            let placeholder = NodeId::generate();
            match self
                .transport
                .send_rpc(placeholder, *seed, "getOwnedTuples", vec![])
                .await
            {
                Ok(reply) => {
                    self.contacts
                        .add(Contact::new(reply.sender, seed.ip(), seed.port()));
                    let Some(items) = reply.payload.as_list() else {
                        return Err(NodeError::JoinFailed(
                            "rpc response from contact invalid, expected a list".into(),
                        ));
                    };
                    for item in items {
                        let Some([owner, blob]) = item.as_list().and_then(|pair| {
                            <&[WireValue; 2]>::try_from(pair).ok()
                        }) else {
                            continue;
                        };
                        let (Some(owner_bytes), Some(blob_bytes)) =
                            (owner.as_bytes(), blob.as_bytes())
                        else {
                            continue;
                        };
                        let Some(owner_id) = NodeId::from_bytes(owner_bytes) else {
                            continue;
                        };
                        if let Err(err) = self.store.put_serialized(blob_bytes, owner_id) {
                            warn!("discarding unreadable replicated tuple: {err}");
                        }
                    }
                }
                Err(TransportError::Timeout { .. }) => timeouts += 1,
                Err(TransportError::Remote { exception, message }) => {
                    return Err(NodeError::JoinFailed(format!(
                        "error response from rpc call: {exception}: {message}"
                    )));
                }
                Err(err) => return Err(err.into()),
            }
        }

        if !seeds.is_empty() {
            if timeouts == seeds.len() {
                return Err(NodeError::NoSeedsReachable);
            }
            if timeouts > 0 {
                return Err(NodeError::NotAllContactsResponded);
            }
        }

        self.start_services().await?;
        self.drain_deferred();
        self.joined.store(true, Ordering::SeqCst);
        info!("node {} joined; {} contact(s) known", self.id, self.contacts.len());
        Ok(())
    }

    /// Starts the servers and publishes the resources this node lends, per
    /// its configuration.
    async fn start_services(self: &Arc<Self>) -> Result<(), NodeError> {
        let handle = self.handle();

        if let Some(sms) = &self.sms_config {
            if let Some(receive) = &sms.receive {
                if let Err(err) = SmsReceiver::new(handle.clone(), receive.port).start().await {
                    warn!("sms receiver failed to start: {err}");
                }
            }
            if sms.send.is_some() {
                self.publish_resource(ResourceKind::Sms, None);
            }
        }

        if let Some(ivr) = &self.ivr_config {
            let speech_server = ivr.outgoing.as_ref().map_or_else(
                || ("127.0.0.1".to_string(), 9000),
                |out| (out.speech_server_address.clone(), out.speech_server_port),
            );
            let server = FastAgiServer::new(ivr.default_tts.clone(), speech_server);
            server.start(handle.clone(), ivr.fastagi_port)?;
            let _ = self.agi_server.set(server);
            info!("created local fastagi server");

            if let Some(outgoing) = &ivr.outgoing {
                if ivr.incoming_enabled {
                    // Prime the PBX so its dialplan can reach us for
                    // incoming calls. Failure is survivable: incoming calls
                    // may simply not work, depending on the dialplan.
                    let manager = ManagerClient::new(
                        outgoing.host.clone(),
                        outgoing.port,
                        outgoing.username.clone(),
                        outgoing.secret.clone(),
                    );
                    let fastagi_port = self.agi_server().map_or(0, |s| s.port());
                    let primed = tokio::task::spawn_blocking(move || {
                        let local_ip = manager.local_ip()?;
                        manager.set_var("agihost", &local_ip)?;
                        manager.set_var("agiport", &fastagi_port.to_string())
                    })
                    .await;
                    match primed {
                        Ok(Ok(())) => {}
                        Ok(Err(err)) => {
                            warn!("error preparing the pbx for incoming calls: {err}");
                            warn!("depending on your dialplan, incoming calls may not work");
                        }
                        Err(err) => warn!("pbx priming task failed: {err}"),
                    }
                }
                self.publish_resource(ResourceKind::Ivr, None);
            }
        }
        Ok(())
    }

    fn drain_deferred(self: &Arc<Self>) {
        let queued: Vec<Application> = {
            let mut deferred = self.deferred.lock().expect("deferred queue poisoned");
            deferred.drain(..).collect()
        };
        for app in queued {
            self.register_application(app);
        }
    }

    /// Publishes a resource tuple into the local store. When returning a
    /// previously claimed resource, `original_publisher` preserves the
    /// attribution of the node that first lent it.
    pub fn publish_resource(&self, kind: ResourceKind, original_publisher: Option<NodeId>) {
        let owner = original_publisher.unwrap_or(self.id);
        info!("publishing resource: {kind}");
        self.store.put(&Tuple::resource(kind, owner), owner);
    }

    /// Publishes a handler tuple advertising a local handler.
    pub fn publish_ivr_handler(&self, filters: &IvrHandlerFilters) {
        info!("publishing handler: ivr");
        let tuple = Tuple::ivr_handler(self.id, &filters.channel, &filters.caller_id);
        self.store.put(&tuple, self.id);
    }

    /// Publishes the SMS handler tuple.
    pub fn publish_sms_handler(&self) {
        info!("publishing handler: sms");
        self.store.put(&Tuple::sms_handler(self.id), self.id);
    }

    /// Registers an application. Before join completes the registration is
    /// queued and drained once the node is part of the federation.
    pub fn run_application(self: &Arc<Self>, app: Application) {
        if !self.joined.load(Ordering::SeqCst) {
            self.deferred
                .lock()
                .expect("deferred queue poisoned")
                .push(app);
            return;
        }
        self.register_application(app);
    }

    fn register_application(self: &Arc<Self>, app: Application) {
        match app {
            Application::Ivr { app, filters } => {
                self.publish_ivr_handler(&filters);
                self.applications
                    .lock()
                    .expect("application registry poisoned")
                    .ivr
                    .push((app, filters));
            }
            Application::Sms { app } => {
                self.publish_sms_handler();
                self.applications
                    .lock()
                    .expect("application registry poisoned")
                    .sms
                    .push(app);
            }
            Application::Proactive { app } => {
                spawn_proactive_worker(app, self.handle());
            }
        }
    }

    /// What this node hands to a peer that claims one of its resources.
    #[must_use]
    pub fn invoke_resource(&self, kind: ResourceKind) -> Option<ResourceInfo> {
        match kind {
            ResourceKind::Sms => {
                let send = self.sms_config.as_ref()?.send.as_ref()?;
                Some(ResourceInfo::Sms(SmsGatewayInfo {
                    host: send.host.clone(),
                    port: send.port,
                    username: send.username.clone(),
                    password: send.password.clone(),
                }))
            }
            ResourceKind::Ivr => {
                let outgoing = self.ivr_config.as_ref()?.outgoing.as_ref()?;
                let channel = outgoing.channels.first()?.clone();
                info!("handing over location of the local outgoing ivr resource");
                Some(ResourceInfo::Ivr(IvrGatewayInfo {
                    host: outgoing.host.clone(),
                    port: outgoing.port,
                    channel,
                    username: outgoing.username.clone(),
                    secret: outgoing.secret.clone(),
                    gateway_address: outgoing.gateway_address.clone(),
                    prefix: outgoing.prefix.clone(),
                    internal_extension_length: outgoing.internal_extension_length,
                }))
            }
        }
    }

    /// Finds a resource of the given kind in the federation and invokes it,
    /// returning direct-access credentials.
    ///
    /// With `exclusive` the matched tuple is taken from the store and must
    /// be released by the claimer; otherwise it is only read. A blocking
    /// claim retries until a tuple appears, as long as remote peers exist
    /// that might publish one.
    pub async fn claim_resource(
        &self,
        kind: ResourceKind,
        blocking: bool,
        exclusive: bool,
    ) -> Result<Option<ClaimedResource>, NodeError> {
        let template = TupleTemplate::any_resource(kind);
        loop {
            let found = if exclusive {
                self.store.take(&template)
            } else {
                self.store.find_tuple(&template)
            };
            let Some((tuple, _)) = found else {
                if blocking && !self.contacts.is_empty() {
                    sleep(CLAIM_RETRY).await;
                    continue;
                }
                return Ok(None);
            };

            let owner = tuple.owner();
            if owner == self.id {
                info!("local resource found: {kind}");
                let Some(info) = self.invoke_resource(kind) else {
                    return Ok(None);
                };
                if exclusive {
                    self.claimed.increment();
                }
                return Ok(Some(ClaimedResource {
                    info,
                    tuple,
                    provider: None,
                    exclusive,
                }));
            }

            let Some(contact) = self.contacts.find(owner) else {
                // The entry names a node we no longer know. It is useless
                // now; make sure it is gone and look again.
                let _ = self.store.take(&TupleTemplate::exact(&tuple));
                continue;
            };

            match self
                .transport
                .send_rpc(
                    contact.id,
                    contact.socket_addr(),
                    "invokeResource",
                    vec![WireValue::str(kind.as_str())],
                )
                .await
            {
                Ok(reply) => {
                    let Some(mut info) = decode_resource_info(&reply.payload)? else {
                        return Ok(None);
                    };
                    rewrite_loopback_host(&mut info, &contact);
                    info!("remote resource found: {kind} at {}", contact.address);
                    if exclusive {
                        self.claimed.increment();
                    }
                    return Ok(Some(ClaimedResource {
                        info,
                        tuple,
                        provider: Some(contact),
                        exclusive,
                    }));
                }
                Err(TransportError::Timeout { contact: dead }) => {
                    warn!("rpc timeout, no response from remote contact {dead}");
                    self.contacts.remove(dead);
                    // The tuple is already consumed; the claim is lost.
                    return Err(NodeError::ClaimLost { contact: dead });
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    /// Returns a claimed resource: re-publish it locally under its original
    /// owner and drop the claim count.
    pub fn release_resource(&self, claim: &ClaimedResource) {
        if !claim.exclusive {
            return;
        }
        let kind = match claim.info {
            ResourceInfo::Ivr(_) => ResourceKind::Ivr,
            ResourceInfo::Sms(_) => ResourceKind::Sms,
        };
        self.publish_resource(kind, Some(claim.original_owner()));
        self.claimed.decrement();
    }

    /// Takes this node's own resource tuple as an inbound-concurrency gate.
    /// Blocks until one is free; nodes that lend nothing of this kind skip
    /// the gate entirely.
    pub async fn take_own_resource(&self, kind: ResourceKind) -> Option<Tuple> {
        if self.invoke_resource(kind).is_none() {
            return None;
        }
        let template = TupleTemplate::Resource {
            resource: kind,
            owner: Some(self.id),
        };
        loop {
            if let Some((tuple, _)) = self.store.take(&template) {
                self.claimed.increment();
                return Some(tuple);
            }
            sleep(CLAIM_RETRY).await;
        }
    }

    /// Puts a gate resource back.
    pub fn release_own_resource(&self, tuple: &Tuple) {
        let Tuple::Resource { resource, .. } = tuple else {
            return;
        };
        self.publish_resource(*resource, Some(tuple.owner()));
        self.claimed.decrement();
    }

    /// Routes an inbound SMS to whichever node advertised an SMS handler.
    pub async fn notify_sms_event(&self, event: SmsEvent) {
        let template = TupleTemplate::any_sms_handler();
        let Some((tuple, _)) = self.store.find_tuple(&template) else {
            warn!("dropping sms from {}: no handler advertised", event.caller_id);
            return;
        };
        let owner = tuple.owner();
        if owner == self.id {
            if let Err(err) = self.handle_event(Event::Sms(event)) {
                warn!("local sms handler refused event: {err}");
            }
            return;
        }
        let Some(contact) = self.contacts.find(owner) else {
            let _ = self.store.take(&TupleTemplate::exact(&tuple));
            return;
        };
        let payload = encode_event(&Event::Sms(event));
        if let Err(err) = self
            .transport
            .send_rpc(contact.id, contact.socket_addr(), "handleEvent", vec![payload])
            .await
        {
            warn!("remote sms handler failed ({err}); pruning handler tuple");
            let _ = self.store.take(&TupleTemplate::exact(&tuple));
        }
    }

    /// Finds the best IVR handler for an inbound call and asks its node to
    /// handle the event. Returns the FastAGI address the call leg should be
    /// re-routed to, or `None` when no handler responded.
    ///
    /// Candidates are partitioned into four priority classes — both filters
    /// match, channel only, caller id only, neither specified — and tried
    /// highest class first, picking uniformly at random within a class.
    /// A handler whose node times out is pruned from the local view.
    pub async fn notify_ivr_event(&self, event: IvrEvent) -> Option<(IpAddr, u16)> {
        info!("finding ivr handler | session id: {}", event.session_id);
        let mut classes: [Vec<Tuple>; 4] = [Vec::new(), Vec::new(), Vec::new(), Vec::new()];
        for (tuple, _) in self.store.find_all(&TupleTemplate::any_ivr_handler()) {
            if let Some(class) = classify_ivr_handler(&tuple, &event.channel, &event.caller_id) {
                classes[class as usize].push(tuple);
            }
        }

        for mut class in classes {
            while !class.is_empty() {
                let pick = rand::thread_rng().gen_range(0..class.len());
                let tuple = class.swap_remove(pick);
                let owner = tuple.owner();

                if owner == self.id {
                    match self.handle_event(Event::Ivr(event.clone())) {
                        Ok(HandledEvent::FastAgiPort(port)) => {
                            info!(
                                "local ivr handler found | session id: {}",
                                event.session_id
                            );
                            return Some(("127.0.0.1".parse().expect("loopback"), port));
                        }
                        _ => continue,
                    }
                }

                let Some(contact) = self.contacts.find(owner) else {
                    let _ = self.store.take(&TupleTemplate::exact(&tuple));
                    continue;
                };
                let payload = encode_event(&Event::Ivr(event.clone()));
                match self
                    .transport
                    .send_rpc(contact.id, contact.socket_addr(), "handleEvent", vec![payload])
                    .await
                {
                    Ok(reply) => {
                        let Some(port) = reply.payload.as_int().and_then(|p| u16::try_from(p).ok())
                        else {
                            continue;
                        };
                        info!(
                            "remote ivr handler found at {}:{port} | session id: {}",
                            contact.address, event.session_id
                        );
                        return Some((contact.address, port));
                    }
                    Err(TransportError::Timeout { contact: dead }) => {
                        warn!(
                            "rpc timeout, unable to reach ivr handler | session id: {}",
                            event.session_id
                        );
                        let _ = self.store.take(&TupleTemplate::exact(&tuple));
                        self.contacts.remove(dead);
                    }
                    Err(err) => {
                        warn!("ivr handler rpc failed: {err}");
                    }
                }
            }
        }
        warn!(
            "no ivr handler could be found | session id: {}",
            event.session_id
        );
        None
    }

    /// Handles an event on this node (local dispatch and the `handleEvent`
    /// RPC target).
    pub fn handle_event(&self, event: Event) -> Result<HandledEvent, NodeError> {
        match event {
            Event::Sms(sms) => {
                let app = {
                    let apps = self.applications.lock().expect("application registry poisoned");
                    apps.sms.first().cloned()
                };
                let Some(app) = app else {
                    return Err(NodeError::EventNotHandled("no local sms handler".into()));
                };
                spawn_sms_worker(app, self.handle(), sms.caller_id, sms.message);
                Ok(HandledEvent::Accepted)
            }
            Event::Ivr(ivr) => {
                let entry = {
                    let apps = self.applications.lock().expect("application registry poisoned");
                    apps.ivr.first().cloned()
                };
                let Some((app, _filters)) = entry else {
                    return Err(NodeError::EventNotHandled("no local ivr handler".into()));
                };
                let Some(server) = self.agi_server() else {
                    return Err(NodeError::EventNotHandled(
                        "no local fastagi server".into(),
                    ));
                };
                let (slot, session_rx, _rogue) = HandlerSlot::create();
                server.bind_handler(ivr.handler_id.clone(), slot);
                spawn_ivr_worker(app, self.handle(), session_rx);
                info!("handing over location of the local ivr handler");
                Ok(HandledEvent::FastAgiPort(server.port()))
            }
            Event::Shutdown { node_id } => {
                self.contacts.remove(node_id);
                Ok(HandledEvent::Accepted)
            }
        }
    }

    /// Orderly shutdown: waits for claimed resources to drain, then tells
    /// every known contact we are leaving and stops the endpoint.
    pub async fn shutdown(&self) {
        while !self.claimed.is_drained() {
            sleep(SHUTDOWN_POLL).await;
        }
        let event = Event::Shutdown { node_id: self.id };
        for contact in self.contacts.snapshot() {
            let _ = self
                .transport
                .send_rpc(
                    contact.id,
                    contact.socket_addr(),
                    "handleEvent",
                    vec![encode_event(&event)],
                )
                .await;
        }
        self.transport.stop();
        info!("node {} shut down", self.id);
    }

    /// Stops the UDP endpoint immediately, skipping the shutdown protocol.
    /// Peers observe this node as dead on their next RPC.
    pub fn halt(&self) {
        self.transport.stop();
    }
}

/// Result of handling one event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandledEvent {
    Accepted,
    /// The IVR event was accepted; the returning leg should dial this
    /// node's FastAGI port.
    FastAgiPort(u16),
}

/// Priority class of an IVR handler for a given event, highest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum HandlerClass {
    /// Both caller-id and channel filters match the event.
    Specific = 0,
    /// Channel filter matches, caller id unspecified.
    ChannelBound = 1,
    /// Caller-id filter matches, channel unspecified.
    CallerBound = 2,
    /// Neither filter specified.
    Generic = 3,
}

/// Classifies a handler tuple against an event; `None` when one of its
/// filters excludes the event outright.
#[must_use]
pub fn classify_ivr_handler(tuple: &Tuple, channel: &str, caller_id: &str) -> Option<HandlerClass> {
    let Tuple::IvrHandler {
        channel_filter,
        caller_id_filter,
        ..
    } = tuple
    else {
        return None;
    };
    let mut caller_matched = false;
    let mut channel_matched = false;
    if !caller_id_filter.is_empty() {
        if caller_id_filter == caller_id {
            caller_matched = true;
        } else {
            return None;
        }
    }
    if !channel_filter.is_empty() {
        if channel_filter == channel {
            channel_matched = true;
        } else {
            return None;
        }
    }
    Some(match (caller_matched, channel_matched) {
        (true, true) => HandlerClass::Specific,
        (false, true) => HandlerClass::ChannelBound,
        (true, false) => HandlerClass::CallerBound,
        (false, false) => HandlerClass::Generic,
    })
}

fn encode_event(event: &Event) -> WireValue {
    WireValue::Bytes(serde_json::to_vec(event).expect("events always serialize"))
}

fn decode_resource_info(payload: &WireValue) -> Result<Option<ResourceInfo>, NodeError> {
    match payload {
        WireValue::Int(0) => Ok(None),
        WireValue::Bytes(bytes) => serde_json::from_slice(bytes)
            .map(Some)
            .map_err(|err| NodeError::BadPayload(err.to_string())),
        other => Err(NodeError::BadPayload(format!(
            "unexpected resource payload: {other:?}"
        ))),
    }
}

/// A gateway that advertises itself on loopback is reachable at its owning
/// contact's address instead.
fn rewrite_loopback_host(info: &mut ResourceInfo, contact: &Contact) {
    let host = match info {
        ResourceInfo::Ivr(ivr) => &mut ivr.host,
        ResourceInfo::Sms(sms) => &mut sms.host,
    };
    if host == "127.0.0.1" || host == "localhost" {
        *host = contact.address.to_string();
    }
}

#[async_trait]
impl RpcService for FederationNode {
    async fn handle_rpc(
        &self,
        sender: NodeId,
        source: SocketAddr,
        method: &str,
        args: &[WireValue],
    ) -> Result<WireValue, RpcServiceError> {
        // A contact is born whenever a peer reaches us.
        self.contacts
            .add(Contact::new(sender, source.ip(), source.port()));

        match method {
            "invokeResource" => {
                let kind = args
                    .first()
                    .and_then(WireValue::as_utf8)
                    .and_then(|raw| ResourceKind::parse(&raw))
                    .ok_or_else(|| RpcServiceError::Failed {
                        exception: "BadArguments".into(),
                        message: "invokeResource expects a resource kind".into(),
                    })?;
                match self.invoke_resource(kind) {
                    Some(info) => Ok(WireValue::Bytes(
                        serde_json::to_vec(&info).expect("resource info serializes"),
                    )),
                    None => Ok(WireValue::Int(0)),
                }
            }
            "handleEvent" => {
                let event: Event = args
                    .first()
                    .and_then(WireValue::as_bytes)
                    .and_then(|bytes| serde_json::from_slice(bytes).ok())
                    .ok_or_else(|| RpcServiceError::Failed {
                        exception: "BadArguments".into(),
                        message: "handleEvent expects an event payload".into(),
                    })?;
                match self.handle_event(event) {
                    Ok(HandledEvent::Accepted) => Ok(WireValue::str("OK")),
                    Ok(HandledEvent::FastAgiPort(port)) => Ok(WireValue::Int(i64::from(port))),
                    Err(err) => Err(RpcServiceError::Failed {
                        exception: "EventNotHandled".into(),
                        message: err.to_string(),
                    }),
                }
            }
            "findTuple" => {
                let template: TupleTemplate = args
                    .first()
                    .and_then(WireValue::as_bytes)
                    .and_then(|bytes| serde_json::from_slice(bytes).ok())
                    .ok_or_else(|| RpcServiceError::Failed {
                        exception: "BadArguments".into(),
                        message: "findTuple expects a template payload".into(),
                    })?;
                let found = self.store.find_tuple(&template);
                Ok(WireValue::Bytes(
                    serde_json::to_vec(&found).expect("lookup result serializes"),
                ))
            }
            "getOwnedTuples" => Ok(encode_tuple_listing(self.store.owned_tuples(self.id))),
            "getAllTuples" => Ok(encode_tuple_listing(self.store.all_tuples())),
            other => Err(RpcServiceError::MethodNotExposed(other.to_string())),
        }
    }
}

fn encode_tuple_listing(entries: Vec<(NodeId, Vec<u8>)>) -> WireValue {
    WireValue::List(
        entries
            .into_iter()
            .map(|(owner, blob)| {
                WireValue::List(vec![
                    WireValue::Bytes(owner.as_bytes().to_vec()),
                    WireValue::Bytes(blob),
                ])
            })
            .collect(),
    )
}
