//! SMS send and receive paths.
//!
//! Sending claims (non-exclusively) an `sms` resource from the federation
//! and issues the gateway's sendsms HTTP GET. Receiving exposes the HTTP
//! endpoint the gateway delivers inbound messages to.

use std::collections::HashMap;

use axum::Router;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::routing::get;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::domain::ResourceKind;
use crate::federation::handle::NodeHandle;
use crate::federation::node::{NodeError, ResourceInfo, SmsGatewayInfo};

/// Default originator put on outgoing messages.
pub const DEFAULT_ORIGIN: &str = "Trunkline";

/// Errors raised by the SMS sender.
#[derive(Debug, Error)]
pub enum SmsError {
    #[error("no outgoing sms resource could be located")]
    ResourceNotFound,

    #[error(transparent)]
    Node(#[from] NodeError),

    #[error("sms gateway request failed: {0}")]
    Http(#[from] reqwest::Error),
}

/// Sends SMS messages through whichever gateway the federation lends.
pub struct SmsSender {
    node: NodeHandle,
    gateway: Option<SmsGatewayInfo>,
}

impl SmsSender {
    #[must_use]
    pub fn new(node: NodeHandle) -> Self {
        Self {
            node,
            gateway: None,
        }
    }

    /// Locates an SMS gateway, blocking until one is advertised.
    pub fn acquire(&mut self) -> Result<(), SmsError> {
        self.acquire_inner(true)?;
        if self.gateway.is_none() {
            return Err(SmsError::ResourceNotFound);
        }
        Ok(())
    }

    /// Non-blocking variant; reports whether a gateway was found.
    pub fn acquire_if_exists(&mut self) -> Result<bool, SmsError> {
        self.acquire_inner(false)?;
        Ok(self.gateway.is_some())
    }

    fn acquire_inner(&mut self, blocking: bool) -> Result<(), SmsError> {
        // SMS gateways are shared: read, never take.
        let claim = self
            .node
            .claim_resource(ResourceKind::Sms, blocking, false)?;
        self.gateway = claim.and_then(|claim| match claim.info {
            ResourceInfo::Sms(info) => Some(info),
            ResourceInfo::Ivr(_) => None,
        });
        Ok(())
    }

    /// Sends `message` to each destination; returns per-destination
    /// success. Success is any 2xx reply from the gateway.
    pub fn send_message(&self, message: &str, destinations: &[&str]) -> Result<Vec<bool>, SmsError> {
        self.send_message_from(message, destinations, DEFAULT_ORIGIN)
    }

    /// Sends with an explicit originator.
    pub fn send_message_from(
        &self,
        message: &str,
        destinations: &[&str],
        origin: &str,
    ) -> Result<Vec<bool>, SmsError> {
        let gateway = self.gateway.as_ref().ok_or(SmsError::ResourceNotFound)?;
        let url = format!("http://{}:{}/cgi-bin/sendsms", gateway.host, gateway.port);

        let mut outcomes = Vec::with_capacity(destinations.len());
        for destination in destinations {
            let request = reqwest::Client::new().get(&url).query(&[
                ("username", gateway.username.as_str()),
                ("password", gateway.password.as_str()),
                ("from", origin),
                ("to", destination),
                ("text", message),
            ]);
            let sent = self.node.block_on(async {
                match request.send().await {
                    Ok(response) => response.status().is_success(),
                    Err(err) => {
                        warn!("sms send to {destination} failed: {err}");
                        false
                    }
                }
            });
            outcomes.push(sent);
        }
        Ok(outcomes)
    }
}

/// HTTP endpoint the SMS gateway delivers inbound messages to.
pub struct SmsReceiver {
    node: NodeHandle,
    port: u16,
}

impl SmsReceiver {
    #[must_use]
    pub fn new(node: NodeHandle, port: u16) -> Self {
        Self { node, port }
    }

    /// Binds the endpoint and starts serving; returns the bound port.
    pub async fn start(self) -> std::io::Result<u16> {
        let app = Router::new()
            .route("/", get(receive_sms))
            .with_state(self.node);
        let listener = tokio::net::TcpListener::bind(("0.0.0.0", self.port)).await?;
        let port = listener.local_addr()?.port();
        info!("sms receiver listening on port {port}");
        tokio::spawn(async move {
            if let Err(err) = axum::serve(listener, app).await {
                error!("sms receiver stopped: {err}");
            }
        });
        Ok(port)
    }
}

async fn receive_sms(
    State(node): State<NodeHandle>,
    Query(params): Query<HashMap<String, String>>,
) -> (StatusCode, &'static str) {
    let lowered: HashMap<String, &String> = params
        .iter()
        .map(|(key, value)| (key.to_lowercase(), value))
        .collect();
    let Some(caller_id) = lowered.get("callerid") else {
        return (
            StatusCode::BAD_REQUEST,
            "Invalid request; missing \"callerid\" variable.\n",
        );
    };
    let Some(message) = lowered.get("message") else {
        return (
            StatusCode::BAD_REQUEST,
            "Invalid request; missing \"message\" variable.\n",
        );
    };

    let event = crate::federation::node::SmsEvent {
        caller_id: (*caller_id).clone(),
        message: (*message).clone(),
    };
    node.node().notify_sms_event(event).await;
    (StatusCode::OK, "Message received OK.\n")
}
