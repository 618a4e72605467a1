//! Outbound-call resource wrapper: claims an outgoing-call gateway from
//! the federation, originates the call through the Manager API, and hands
//! the connected AGI leg back to the application.

use std::sync::atomic::Ordering;
use std::time::Duration;

use thiserror::Error;
use tracing::{error, info};

use crate::agi::AgiSession;
use crate::agi::server::HandlerSlot;
use crate::domain::{HandlerId, ResourceKind};
use crate::federation::handle::NodeHandle;
use crate::federation::node::{ClaimedResource, IvrGatewayInfo, NodeError, ResourceInfo};
use crate::pbx::manager::{ManagerClient, ManagerError};

/// How long to wait for the PBX to connect the return AGI leg.
pub const DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// Errors raised while placing an outbound call.
#[derive(Debug, Error)]
pub enum DialerError {
    #[error("no outgoing ivr resource could be located")]
    ResourceNotFound,

    #[error("dialout failed, handler response timeout")]
    DialoutFailed,

    #[error("local fastagi server is not running")]
    NoAgiServer,

    #[error(transparent)]
    Node(#[from] NodeError),

    #[error(transparent)]
    Manager(#[from] ManagerError),
}

/// Claims an outgoing-call gateway and dials through it.
///
/// The claim is exclusive; the line goes back to the federation on
/// [`OutboundDialer::release`] (or when the dialer is dropped).
pub struct OutboundDialer {
    node: NodeHandle,
    claim: Option<ClaimedResource>,
}

impl OutboundDialer {
    #[must_use]
    pub fn new(node: NodeHandle) -> Self {
        Self { node, claim: None }
    }

    /// Locates and takes an outgoing-call gateway, blocking until one is
    /// available.
    pub fn acquire(&mut self) -> Result<(), DialerError> {
        info!("attempting to locate an outgoing ivr resource");
        let claim = self.node.claim_resource(ResourceKind::Ivr, true, true)?;
        self.claim = claim;
        if self.claim.is_none() {
            error!("no outgoing ivr resource could be located");
            return Err(DialerError::ResourceNotFound);
        }
        Ok(())
    }

    /// Non-blocking variant; reports whether a gateway was claimed.
    pub fn acquire_if_exists(&mut self) -> Result<bool, DialerError> {
        self.claim = self.node.claim_resource(ResourceKind::Ivr, false, true)?;
        Ok(self.claim.is_some())
    }

    /// Returns the claimed line to the federation.
    pub fn release(&mut self) {
        if let Some(claim) = self.claim.take() {
            self.node.release_resource(&claim);
        }
    }

    fn gateway(&self) -> Result<&IvrGatewayInfo, DialerError> {
        match &self.claim {
            Some(ClaimedResource {
                info: ResourceInfo::Ivr(info),
                ..
            }) => Ok(info),
            _ => Err(DialerError::ResourceNotFound),
        }
    }

    /// Dials `number` and blocks until the call is live, returning the AGI
    /// session for it. Waits at most [`DIAL_TIMEOUT`] for the return leg;
    /// after that the primed handler is marked rogue so a late leg gets
    /// hung up instead of wired to a dead waiter.
    pub fn dial(&mut self, number: &str) -> Result<AgiSession, DialerError> {
        let gateway = self.gateway()?.clone();
        let server = self
            .node
            .node()
            .agi_server()
            .ok_or(DialerError::NoAgiServer)?;

        // Prime the local FastAGI server for the return leg.
        let handler_id = HandlerId::mint(&gateway.channel);
        let (slot, session_rx, rogue) = HandlerSlot::create();
        server.bind_handler(handler_id.clone(), slot);

        let number = rewrite_number(number, &gateway);
        info!("invoking outgoing call to {number}");

        let manager = ManagerClient::new(
            gateway.host.clone(),
            gateway.port,
            gateway.username.clone(),
            gateway.secret.clone(),
        );
        if let Err(err) = manager.dial(&number, &gateway.channel, server.port(), handler_id.as_ref())
        {
            error!("error while attempting to invoke outgoing call: {err}");
            server.remove_handler(&handler_id);
            return Err(err.into());
        }

        match session_rx.recv_timeout(DIAL_TIMEOUT) {
            Ok(session) => {
                info!("handing control over to the ivr application");
                Ok(session)
            }
            Err(_) => {
                // Leave the slot bound: the rogue flag makes a late leg
                // hang itself up.
                rogue.store(true, Ordering::SeqCst);
                error!("dialout failed, handler response timeout");
                Err(DialerError::DialoutFailed)
            }
        }
    }
}

impl Drop for OutboundDialer {
    fn drop(&mut self) {
        self.release();
    }
}

/// Applies prefix and gateway rewriting to a dialled number.
fn rewrite_number(number: &str, gateway: &IvrGatewayInfo) -> String {
    let mut number = number.to_string();
    if let Some(prefix) = &gateway.prefix {
        match gateway.internal_extension_length {
            // No extension length configured: every number is external.
            None => number = format!("{prefix}{number}"),
            Some(length) if number.len() > length => number = format!("{prefix}{number}"),
            Some(_) => {}
        }
    }
    if let Some(gateway_address) = &gateway.gateway_address {
        number = format!("{number}@{gateway_address}");
    }
    number
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gateway(
        prefix: Option<&str>,
        internal_extension_length: Option<usize>,
        gateway_address: Option<&str>,
    ) -> IvrGatewayInfo {
        IvrGatewayInfo {
            host: "pbx".into(),
            port: 5038,
            channel: "SIP/line1".into(),
            username: "u".into(),
            secret: "s".into(),
            gateway_address: gateway_address.map(String::from),
            prefix: prefix.map(String::from),
            internal_extension_length,
        }
    }

    #[test]
    fn prefix_applies_to_every_number_without_extension_length() {
        assert_eq!(rewrite_number("1234", &gateway(Some("9"), None, None)), "91234");
    }

    #[test]
    fn prefix_skips_internal_extensions() {
        let info = gateway(Some("9"), Some(4), None);
        assert_eq!(rewrite_number("1234", &info), "1234");
        assert_eq!(rewrite_number("0726349901", &info), "90726349901");
    }

    #[test]
    fn gateway_address_is_appended() {
        let info = gateway(None, None, Some("voip.example.net"));
        assert_eq!(rewrite_number("1234", &info), "1234@voip.example.net");
    }

    #[test]
    fn prefix_and_gateway_compose() {
        let info = gateway(Some("00"), Some(3), Some("gw"));
        assert_eq!(rewrite_number("5551234", &info), "005551234@gw");
    }
}
