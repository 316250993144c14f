//! Connector-facing side of the hub.
//!
//! Connectors open one socket per bot; the registry tracks them, the server
//! owns each socket's receive loop and the delivery layer routes replies back.

mod connection;
mod delivery;
mod registry;
mod server;

pub use connection::{BotConnection, InboundEnvelope, OutboundFrame, OutboundMessage};
#[cfg(test)]
pub(crate) use connection::loopback_connection;
pub use delivery::Delivery;
pub use registry::ConnectionRegistry;
pub use server::{WebSocketServer, BOT_ID_PARAM, WS_PATH};
