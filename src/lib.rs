//! # Trunkline - Federated Telephony Middleware
//!
//! Trunkline federates a pool of heterogeneous nodes, each exposing zero or
//! more telephony resources (outgoing-call gateways, SMS gateways, inbound
//! SMS endpoints) and zero or more application handlers (per-call IVR
//! dialogs, SMS handlers, long-running applications). The network routes
//! inbound events to whichever node advertised a matching handler, and
//! lends outgoing-call and outgoing-SMS resources to whichever application
//! needs to originate traffic.
//!
//! ## Architecture
//!
//! Three subsystems carry the weight:
//!
//! - **Federation** ([`federation`]): a replicated tuple registry over a
//!   UDP RPC fabric, with bootstrap, contact liveness, resource
//!   claim/release and priority-based handler lookup.
//! - **Call routing** ([`agi`]): the FastAGI server that receives inbound
//!   PBX legs, finds a matching handler across the federation and
//!   re-routes the leg there, plus the synchronous AGI client sessions
//!   applications drive.
//! - **Dialog scripting** ([`dialog`]): a finite state machine over named
//!   nodes with audio prompting, DTMF/ASR input, recording, custom hooks
//!   and structured call history.
//!
//! ```rust,no_run
//! use trunkline::federation::{FederationNode, NodeConfig};
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let node = FederationNode::create(NodeConfig {
//!     udp_port: 4000,
//!     ..NodeConfig::default()
//! })
//! .await?;
//! node.join(&["192.0.2.10:4000".parse()?]).await?;
//! # Ok(())
//! # }
//! ```

pub mod agi;
pub mod application;
pub mod callback;
pub mod config;
pub mod dialer;
pub mod dialog;
pub mod domain;
pub mod error;
pub mod federation;
pub mod pbx;
pub mod sms;

pub use crate::agi::{AgiError, AgiSession, HangupStatus, IvrSession, PromptResult};
pub use crate::application::{
    Application, IvrApplication, IvrHandlerFilters, ProactiveApplication, SmsApplication,
};
pub use crate::callback::CallbackQueue;
pub use crate::dialer::OutboundDialer;
pub use crate::dialog::{Dialog, DialogError, NodeBuilder};
pub use crate::domain::{HandlerId, NodeId, ResourceKind, SessionId};
pub use crate::error::TrunklineError;
pub use crate::federation::{FederationNode, NodeConfig, NodeHandle};
pub use crate::sms::{SmsReceiver, SmsSender};
