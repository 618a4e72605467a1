//! Application surface: the handler variants a node can run.
//!
//! A handler is one of three tagged variants with a named entry point —
//! an IVR dialog handler, an SMS handler, or a proactive application that
//! runs as soon as the node has joined the federation. Each running
//! instance gets its own application thread and blocks on synchronous
//! AGI/node calls through its [`NodeHandle`].

use std::sync::Arc;
use std::thread;

use tracing::error;

use crate::agi::AgiSession;
use crate::federation::handle::NodeHandle;

/// Per-call IVR dialog entry point.
pub trait IvrApplication: Send + Sync {
    /// Runs the call. The session is the bound AGI leg for this call; the
    /// handle reaches the federation node.
    fn handle_ivr(&self, session: AgiSession, node: &NodeHandle);
}

/// Inbound-SMS entry point, one worker per message.
pub trait SmsApplication: Send + Sync {
    fn handle_sms(&self, caller_id: &str, message: &str, node: &NodeHandle);
}

/// Long-running application started right after join.
pub trait ProactiveApplication: Send + Sync {
    fn run(&self, node: &NodeHandle);
}

/// Filters an IVR handler advertises: empty strings mean *any*.
#[derive(Debug, Clone, Default)]
pub struct IvrHandlerFilters {
    pub channel: String,
    pub caller_id: String,
}

/// A registered application.
#[derive(Clone)]
pub enum Application {
    Ivr {
        app: Arc<dyn IvrApplication>,
        filters: IvrHandlerFilters,
    },
    Sms {
        app: Arc<dyn SmsApplication>,
    },
    Proactive {
        app: Arc<dyn ProactiveApplication>,
    },
}

impl Application {
    #[must_use]
    pub fn ivr(app: Arc<dyn IvrApplication>) -> Self {
        Self::Ivr {
            app,
            filters: IvrHandlerFilters::default(),
        }
    }

    #[must_use]
    pub fn ivr_filtered(app: Arc<dyn IvrApplication>, filters: IvrHandlerFilters) -> Self {
        Self::Ivr { app, filters }
    }

    #[must_use]
    pub fn sms(app: Arc<dyn SmsApplication>) -> Self {
        Self::Sms { app }
    }

    #[must_use]
    pub fn proactive(app: Arc<dyn ProactiveApplication>) -> Self {
        Self::Proactive { app }
    }
}

/// Spawns the per-message SMS worker thread.
pub(crate) fn spawn_sms_worker(
    app: Arc<dyn SmsApplication>,
    node: NodeHandle,
    caller_id: String,
    message: String,
) {
    thread::Builder::new()
        .name("sms-handler".into())
        .spawn(move || {
            app.handle_sms(&caller_id, &message, &node);
        })
        .unwrap_or_else(|err| {
            error!("failed to spawn sms handler thread: {err}");
            thread::spawn(|| {})
        });
}

/// Spawns the per-call IVR worker thread. The thread blocks until the
/// return AGI leg is bound to it, then runs the application.
pub(crate) fn spawn_ivr_worker(
    app: Arc<dyn IvrApplication>,
    node: NodeHandle,
    session_rx: std::sync::mpsc::Receiver<AgiSession>,
) {
    thread::Builder::new()
        .name("ivr-handler".into())
        .spawn(move || match session_rx.recv() {
            Ok(session) => app.handle_ivr(session, &node),
            Err(_) => {
                // The slot was torn down before a leg arrived.
            }
        })
        .unwrap_or_else(|err| {
            error!("failed to spawn ivr handler thread: {err}");
            thread::spawn(|| {})
        });
}

/// Spawns a proactive application thread.
pub(crate) fn spawn_proactive_worker(app: Arc<dyn ProactiveApplication>, node: NodeHandle) {
    thread::Builder::new()
        .name("application".into())
        .spawn(move || {
            app.run(&node);
        })
        .unwrap_or_else(|err| {
            error!("failed to spawn application thread: {err}");
            thread::spawn(|| {})
        });
}
