//! Call-back communication model: missed calls are queued by caller id and
//! returned with an outbound call.
//!
//! The queue registers twice on a node: as the IVR handler that captures
//! incoming caller ids without answering (so the caller pays nothing), and
//! as the proactive service thread that waits out the grace period, dials
//! each queued caller back and hands the live call to the application.

use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{error, info};

use crate::agi::{AgiSession, HangupStatus};
use crate::application::{Application, IvrApplication, ProactiveApplication};
use crate::dialer::OutboundDialer;
use crate::federation::handle::NodeHandle;

/// Grace period before a queued caller is rung back, giving them time to
/// hang up their missed call.
pub const DEFAULT_SERVICE_WAIT: Duration = Duration::from_secs(10);

/// The per-call entry point invoked once the call-back is live.
pub type CallbackHandler = Box<dyn Fn(AgiSession, &NodeHandle) + Send + Sync>;

#[derive(Debug, Clone)]
struct QueuedCall {
    caller_id: String,
    dialed_number: Option<String>,
    requested_at: Instant,
}

/// Queue of missed-call callers awaiting a call-back.
pub struct CallbackQueue {
    handler: CallbackHandler,
    service_wait: Duration,
    queue: Mutex<HashMap<String, QueuedCall>>,
    running: AtomicBool,
}

impl CallbackQueue {
    #[must_use]
    pub fn new(handler: CallbackHandler) -> Arc<Self> {
        Self::with_service_wait(handler, DEFAULT_SERVICE_WAIT)
    }

    #[must_use]
    pub fn with_service_wait(handler: CallbackHandler, service_wait: Duration) -> Arc<Self> {
        Arc::new(Self {
            handler,
            service_wait,
            queue: Mutex::new(HashMap::new()),
            running: AtomicBool::new(true),
        })
    }

    /// Registers both roles of the queue on the node: the missed-call IVR
    /// handler and the call-back service thread.
    pub fn register(self: &Arc<Self>, node: &NodeHandle) {
        node.run_application(Application::ivr(
            Arc::clone(self) as Arc<dyn IvrApplication>
        ));
        node.run_application(Application::proactive(
            Arc::clone(self) as Arc<dyn ProactiveApplication>,
        ));
    }

    /// Stops the service loop after its current pass.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    #[must_use]
    pub fn queue_len(&self) -> usize {
        self.queue.lock().expect("callback queue poisoned").len()
    }

    fn enqueue(&self, session_id: String, call: QueuedCall) {
        let mut queue = self.queue.lock().expect("callback queue poisoned");
        queue.insert(session_id, call);
        info!("queue length {}", queue.len());
    }

    /// Drops all but one queued request per caller id.
    fn remove_duplicates(&self) {
        let mut queue = self.queue.lock().expect("callback queue poisoned");
        let mut seen: HashSet<String> = HashSet::new();
        let mut keys: Vec<String> = queue.keys().cloned().collect();
        keys.sort();
        for key in keys {
            let Some(caller) = queue.get(&key).map(|call| call.caller_id.clone()) else {
                continue;
            };
            if !seen.insert(caller) {
                queue.remove(&key);
            }
        }
    }

    /// Queued calls whose grace period has elapsed.
    fn due_calls(&self) -> Vec<(String, QueuedCall)> {
        let queue = self.queue.lock().expect("callback queue poisoned");
        queue
            .iter()
            .filter(|(_, call)| call.requested_at.elapsed() >= self.service_wait)
            .map(|(id, call)| (id.clone(), call.clone()))
            .collect()
    }

    fn service_one(&self, session_id: &str, call: &QueuedCall, node: &NodeHandle) {
        info!("servicing call-back to {}", call.caller_id);
        let mut dialer = OutboundDialer::new(node.clone());
        if let Err(err) = dialer.acquire() {
            error!("no outgoing resource for call-back: {err}");
            return;
        }
        match dialer.dial(&call.caller_id) {
            Ok(mut session) => {
                // Restore what the caller originally dialled so the
                // application sees the missed-call context.
                session.environment_mut().caller_id = Some(call.caller_id.clone());
                session.environment_mut().dialed_number = call.dialed_number.clone();
                (self.handler)(session, node);
                info!("service completed for {}", call.caller_id);
            }
            Err(err) => error!("call-back to {} failed: {err}", call.caller_id),
        }
        dialer.release();
        self.queue
            .lock()
            .expect("callback queue poisoned")
            .remove(session_id);
    }
}

impl IvrApplication for CallbackQueue {
    /// Captures the caller id without answering, indicates ringing briefly
    /// and hangs up; the service thread calls back later.
    fn handle_ivr(&self, mut session: AgiSession, _node: &NodeHandle) {
        let env = session.environment().clone();
        info!("got call-back request from caller id {:?}", env.caller_id);
        if let Some(caller_id) = env.caller_id {
            self.enqueue(
                env.unique_id,
                QueuedCall {
                    caller_id,
                    dialed_number: env.dialed_number,
                    requested_at: Instant::now(),
                },
            );
        }
        let _ = session.execute("Ringing");
        let _ = session.execute("Wait 1");
        let _ = session.hangup(HangupStatus::Hangup);
    }
}

impl ProactiveApplication for CallbackQueue {
    /// Service loop: dials back every due caller, one at a time.
    fn run(&self, node: &NodeHandle) {
        while self.running.load(Ordering::SeqCst) {
            self.remove_duplicates();
            let due = self.due_calls();
            if due.is_empty() {
                thread::sleep(Duration::from_millis(100));
                continue;
            }
            for (session_id, call) in due {
                if !self.running.load(Ordering::SeqCst) {
                    break;
                }
                self.service_one(&session_id, &call, node);
            }
        }
    }
}
