//! Control-plane dispatcher
//!
//! Turns one inbound message into exactly one response payload. Failures are
//! never raised to the channel: they come back as `{"error": "..."}` JSON so
//! the channel stays usable. Only input that is not UTF-8 gets no payload.

use std::sync::Arc;

use serde_json::json;

use crate::admin::AdminClient;
use crate::controller::TunnelController;
use crate::protocol::{ApiRequest, ControlMessage};
use crate::proxy::ProxyMode;

/// Acknowledgement for `setMode` and `restart`
pub const ACK: &str = "OK";

/// Reply to `ping`
pub const PONG: &str = "pong";

/// Dispatches control messages to the controller and the core's REST API
pub struct Dispatcher {
    controller: Arc<TunnelController>,
    admin: AdminClient,
}

impl Dispatcher {
    pub fn new(controller: Arc<TunnelController>, admin: AdminClient) -> Self {
        Self { controller, admin }
    }

    /// Handle one raw message
    ///
    /// Returns `None` only when the bytes are not valid UTF-8.
    pub async fn dispatch(&self, message: &[u8]) -> Option<Vec<u8>> {
        let text = match std::str::from_utf8(message) {
            Ok(text) => text,
            Err(e) => {
                log::warn!("Dropping undecodable control message ({} bytes): {}", message.len(), e);
                return None;
            }
        };

        let response = match ControlMessage::parse(text) {
            Some(msg) => self.handle(msg).await,
            None => {
                log::debug!("Unrecognized control message: {:?}", text);
                error_payload("unrecognized message format")
            }
        };
        Some(response.into_bytes())
    }

    /// Handle a message arriving from the controlling process
    ///
    /// `reply` is called exactly once, even if handling panics.
    pub async fn handle_app_message<F>(self: &Arc<Self>, message: Vec<u8>, reply: F)
    where
        F: FnOnce(Option<Vec<u8>>) + Send,
    {
        let this = Arc::clone(self);
        let response = match tokio::spawn(async move { this.dispatch(&message).await }).await {
            Ok(response) => response,
            Err(e) => {
                log::error!("Control message handler failed: {}", e);
                Some(error_payload("internal error").into_bytes())
            }
        };
        reply(response);
    }

    async fn handle(&self, message: ControlMessage) -> String {
        match message {
            ControlMessage::Ping => PONG.to_string(),
            ControlMessage::GetMode => self.controller.mode().await.to_string(),
            ControlMessage::SetMode(mode) => self.set_mode(&mode).await,
            ControlMessage::Stats => match serde_json::to_string(&self.controller.stats()) {
                Ok(json) => json,
                Err(e) => error_payload(&e.to_string()),
            },
            ControlMessage::Restart => match self.controller.restart().await {
                Ok(()) => ACK.to_string(),
                Err(e) => {
                    log::warn!("Restart failed: {}", e);
                    error_payload(&e.to_string())
                }
            },
            ControlMessage::Api(request) => self.forward(request).await,
        }
    }

    async fn set_mode(&self, mode: &str) -> String {
        let mode: ProxyMode = match mode.parse() {
            Ok(mode) => mode,
            Err(e) => return error_payload(&e.to_string()),
        };
        match self.controller.set_mode(mode).await {
            Ok(()) => ACK.to_string(),
            Err(e) => {
                log::warn!("setMode {} failed: {}", mode, e);
                error_payload(&e.to_string())
            }
        }
    }

    async fn forward(&self, request: ApiRequest) -> String {
        match self
            .admin
            .request(&request.method, &request.path, &request.body)
            .await
        {
            Ok(response) if response.is_no_content() => json!({ "success": true }).to_string(),
            Ok(response) => response.body,
            Err(e) => {
                log::debug!("{} {} failed: {}", request.method, request.path, e);
                error_payload(&e.to_string())
            }
        }
    }
}

/// `{"error": message}`
pub fn error_payload(message: &str) -> String {
    json!({ "error": message }).to_string()
}
