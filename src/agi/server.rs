//! FastAGI server: accepts inbound call legs from the PBX and wires each
//! one to the right handler session.
//!
//! Two kinds of leg arrive here. A leg carrying an `ivrhandlerid` variable
//! is the return half of an outbound dial (or a re-routed inbound call)
//! this node primed; it binds to the waiting handler slot. A leg without
//! one is a fresh inbound call: the node claims its own `ivr` resource as
//! a concurrency gate, asks the federation for a handler, and re-routes
//! the leg to whichever node answered.

use std::io::BufReader;
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, SyncSender, sync_channel};
use std::sync::{Arc, OnceLock};
use std::thread;

use dashmap::DashMap;
use tracing::{error, info, warn};

use crate::agi::session::{AgiSession, read_environment};
use crate::agi::{AgiError, HangupStatus};
use crate::domain::{HandlerId, ResourceKind};
use crate::federation::handle::NodeHandle;
use crate::federation::node::IvrEvent;

/// A primed handler waiting for its AGI leg.
///
/// The slot moves through three states: waiting, bound (the session was
/// delivered and the connection handed over), or rogue (the dialer gave up
/// waiting; a late leg is hung up instead of wired to a dead waiter).
pub struct HandlerSlot {
    session_tx: SyncSender<AgiSession>,
    rogue: Arc<AtomicBool>,
}

impl HandlerSlot {
    /// Creates a slot plus the receiving half the handler thread blocks on
    /// and the rogue flag its owner may raise.
    #[must_use]
    pub fn create() -> (Self, Receiver<AgiSession>, Arc<AtomicBool>) {
        let (session_tx, session_rx) = sync_channel(1);
        let rogue = Arc::new(AtomicBool::new(false));
        (
            Self {
                session_tx,
                rogue: Arc::clone(&rogue),
            },
            session_rx,
            rogue,
        )
    }
}

/// The FastAGI TCP server.
pub struct FastAgiServer {
    tts: String,
    speech_server: (String, u16),
    handlers: DashMap<HandlerId, HandlerSlot>,
    bound_port: OnceLock<u16>,
}

impl FastAgiServer {
    #[must_use]
    pub fn new(tts: String, speech_server: (String, u16)) -> Arc<Self> {
        Arc::new(Self {
            tts,
            speech_server,
            handlers: DashMap::new(),
            bound_port: OnceLock::new(),
        })
    }

    /// Registers a primed handler slot for an expected AGI leg.
    pub fn bind_handler(&self, id: HandlerId, slot: HandlerSlot) {
        self.handlers.insert(id, slot);
    }

    /// Drops a handler slot, e.g. when its dialer gave up.
    pub fn remove_handler(&self, id: &HandlerId) {
        self.handlers.remove(id);
    }

    /// The TCP port the server actually bound (resolves port 0).
    #[must_use]
    pub fn port(&self) -> u16 {
        self.bound_port.get().copied().unwrap_or(0)
    }

    /// Binds the listener and starts the accept thread. Each connection
    /// gets its own worker thread that owns the socket for its lifetime.
    pub fn start(self: &Arc<Self>, node: NodeHandle, port: u16) -> std::io::Result<u16> {
        let listener = TcpListener::bind(("0.0.0.0", port))?;
        let bound = listener.local_addr()?.port();
        let _ = self.bound_port.set(bound);
        info!("fastagi server listening on port {bound}");

        let server = Arc::clone(self);
        thread::Builder::new()
            .name("fastagi-accept".into())
            .spawn(move || {
                for connection in listener.incoming() {
                    match connection {
                        Ok(stream) => {
                            let server = Arc::clone(&server);
                            let node = node.clone();
                            let spawned = thread::Builder::new()
                                .name("fastagi-worker".into())
                                .spawn(move || {
                                    if let Err(err) = server.serve_connection(stream, &node) {
                                        warn!("agi connection ended with error: {err}");
                                    }
                                });
                            if let Err(err) = spawned {
                                error!("failed to spawn fastagi worker: {err}");
                            }
                        }
                        Err(err) => error!("fastagi accept failed: {err}"),
                    }
                }
            })?;
        Ok(bound)
    }

    fn serve_connection(&self, stream: TcpStream, node: &NodeHandle) -> Result<(), AgiError> {
        let writer = stream.try_clone()?;
        let mut reader = BufReader::new(stream);
        let env = read_environment(&mut reader)?;
        let session_id = env.unique_id.clone();
        let mut session = AgiSession::new(
            reader,
            writer,
            env,
            self.tts.clone(),
            self.speech_server.clone(),
        );
        session.resolve_dialed_number()?;

        let handler_id = session
            .get_variable("ivrhandlerid")?
            .and_then(|raw| HandlerId::try_new(raw).ok());

        if let Some(handler_id) = handler_id {
            self.bind_leg(handler_id, session, &session_id);
            Ok(())
        } else {
            self.route_inbound(session, node, &session_id)
        }
    }

    /// Return leg of a dial this node primed: deliver the session to the
    /// waiting handler. The connection is handed over, so the worker must
    /// not touch the socket afterwards.
    fn bind_leg(&self, handler_id: HandlerId, mut session: AgiSession, session_id: &str) {
        let Some((_, slot)) = self.handlers.remove(&handler_id) else {
            warn!(%session_id, "no handler waiting for leg {handler_id}; hanging up");
            let _ = session.hangup(HangupStatus::Hangup);
            return;
        };
        if slot.rogue.load(Ordering::SeqCst) {
            error!(
                %session_id,
                "rogue handler {handler_id} detected, hanging up call"
            );
            let _ = session.hangup(HangupStatus::Hangup);
            return;
        }
        info!(%session_id, "binding leg to waiting handler {handler_id}");
        if slot.session_tx.send(session).is_err() {
            warn!(%session_id, "handler {handler_id} went away before its leg arrived");
        }
    }

    /// Fresh inbound call: gate on the local `ivr` resource, find a handler
    /// across the federation and re-route the leg there. The gate resource
    /// is released on every exit path.
    fn route_inbound(
        &self,
        mut session: AgiSession,
        node: &NodeHandle,
        session_id: &str,
    ) -> Result<(), AgiError> {
        info!(%session_id, "incoming call on local fastagi server");
        let gate = node.take_own_resource(ResourceKind::Ivr);

        let outcome = (|| -> Result<(), AgiError> {
            let channel = session
                .environment()
                .channel
                .clone()
                .unwrap_or_else(|| "unknown".to_string());
            let handler_id = HandlerId::mint(&format!("incoming:{channel}"));
            session.set_variable("ivrhandlerid", handler_id.as_ref())?;

            let event = IvrEvent {
                handler_id,
                channel,
                caller_id: session.environment().caller_id.clone().unwrap_or_default(),
                session_id: session_id.to_string(),
            };
            match node.notify_ivr_event(event) {
                Some((host, port)) => {
                    info!(%session_id, "re-routing call to fastagi server {host}:{port}");
                    session.send_command(&format!("EXEC AGI agi://{host}:{port}"))?;
                    Ok(())
                }
                None => {
                    warn!(
                        %session_id,
                        "dropping call from {:?}: no suitable handler found",
                        session.environment().caller_id
                    );
                    let _ = session.hangup(HangupStatus::Failure);
                    Ok(())
                }
            }
        })();

        if let Some(tuple) = gate {
            node.release_own_resource(&tuple);
        }
        outcome
    }
}
