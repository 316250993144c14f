use std::sync::Arc;
use tracing::debug;

use crate::error::HubError;
use crate::pipeline::normalize_identifier;
use crate::websocket::{ConnectionRegistry, OutboundMessage};

/// At-most-once, unbuffered delivery of replies to connector sockets.
#[derive(Clone)]
pub struct Delivery {
    registry: Arc<ConnectionRegistry>,
}

impl Delivery {
    pub fn new(registry: Arc<ConnectionRegistry>) -> Self {
        Self { registry }
    }

    /// Send `{to, message}` to the connector registered as `bot_identifier`.
    ///
    /// Connectors register under the bare number but may report themselves as
    /// `number@domain` inside frames, so the bare form is tried when the exact
    /// identifier has no connection.
    pub async fn deliver(
        &self,
        bot_identifier: &str,
        destination_phone: &str,
        text: &str,
    ) -> Result<(), HubError> {
        let payload = OutboundMessage {
            to: destination_phone.to_string(),
            message: text.to_string(),
        };

        match self.registry.send_to(bot_identifier, &payload).await {
            Err(HubError::NotFound(_)) => {
                let bare = normalize_identifier(bot_identifier);
                if bare == bot_identifier {
                    return Err(HubError::NotFound(bot_identifier.to_string()));
                }
                self.registry.send_to(bare, &payload).await?;
            }
            other => other?,
        }

        debug!("Delivered reply for {} via bot {}", destination_phone, bot_identifier);
        Ok(())
    }
}
