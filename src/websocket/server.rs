use std::net::SocketAddr;
use std::sync::Arc;
use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_hdr_async, WebSocketStream};
use tracing::{debug, error, info, warn};

use crate::config::HubConfig;
use crate::error::HubError;
use crate::pipeline::ConversationPipeline;
use crate::websocket::{BotConnection, ConnectionRegistry, InboundEnvelope, OutboundFrame};

/// Path of the connector upgrade endpoint.
pub const WS_PATH: &str = "/ws";

/// Query parameter carrying the connector's bot identifier.
pub const BOT_ID_PARAM: &str = "phone";

/// Accepts connector sockets and runs one receive loop per connection.
pub struct WebSocketServer {
    registry: Arc<ConnectionRegistry>,
    pipeline: Arc<ConversationPipeline>,
    config: HubConfig,
}

fn bot_id_from_query(query: Option<&str>) -> Option<String> {
    url::form_urlencoded::parse(query?.as_bytes())
        .find(|(key, _)| key == BOT_ID_PARAM)
        .map(|(_, value)| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn reject(status: StatusCode, reason: &str) -> ErrorResponse {
    let mut response = ErrorResponse::new(Some(reason.to_string()));
    *response.status_mut() = status;
    response
}

impl WebSocketServer {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        pipeline: Arc<ConversationPipeline>,
        config: HubConfig,
    ) -> Self {
        Self { registry, pipeline, config }
    }

    pub fn registry(&self) -> Arc<ConnectionRegistry> {
        self.registry.clone()
    }

    /// Accept connections until the listener fails.
    pub async fn run(self: Arc<Self>, listener: TcpListener) {
        match listener.local_addr() {
            Ok(addr) => info!("Accepting connector sockets at ws://{}/ws", addr),
            Err(e) => warn!("Listener has no local address: {}", e),
        }

        loop {
            match listener.accept().await {
                Ok((stream, addr)) => {
                    let server = self.clone();
                    tokio::spawn(async move {
                        server.handle_connection(stream, addr).await;
                    });
                }
                Err(e) => {
                    error!("Failed to accept connection: {}", e);
                    break;
                }
            }
        }
    }

    /// Upgrade, register and serve one connector socket until it goes away.
    pub async fn handle_connection(self: Arc<Self>, raw_stream: TcpStream, addr: SocketAddr) {
        debug!("New connection attempt from: {}", addr);

        let mut bot_id: Option<String> = None;
        let registry = self.registry.clone();
        // The handshake callback cannot await, so it checks against a snapshot;
        // try_register below is the authoritative check.
        let connected = registry.list_ids().await;

        let handshake = accept_hdr_async(raw_stream, |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
            if request.uri().path() != WS_PATH {
                warn!("Upgrade to unknown path {} from {}", request.uri().path(), addr);
                return Err(reject(StatusCode::NOT_FOUND, "not found"));
            }
            let Some(id) = bot_id_from_query(request.uri().query()) else {
                warn!("Bot phone number missing in connection from {}", addr);
                return Err(HubError::Handshake(format!("missing {} query parameter", BOT_ID_PARAM)).into());
            };
            if connected.contains(&id) {
                warn!("Bot {} is already registered", id);
                return Err(HubError::AlreadyConnected(id).into());
            }
            bot_id = Some(id);
            Ok(response)
        })
        .await;

        let ws_stream = match handshake {
            Ok(ws) => ws,
            Err(e) => {
                debug!("Handshake with {} rejected or failed: {}", addr, e);
                return;
            }
        };
        let Some(bot_id) = bot_id else {
            return;
        };

        let (tx, rx) = mpsc::unbounded_channel();
        let connection = BotConnection::new(tx);
        let (ws_sink, ws_stream) = ws_stream.split();
        let send_task = tokio::spawn(write_frames(ws_sink, rx, self.config.clone(), bot_id.clone()));

        if let Err(e) = registry.try_register(&bot_id, connection.clone()).await {
            warn!("Registration for bot {} from {} refused: {}", bot_id, addr, e);
            let _ = connection.send(Message::Close(Some(CloseFrame {
                code: CloseCode::Policy,
                reason: "bot already connected".into(),
            })));
            drop(connection);
            let _ = send_task.await;
            return;
        }

        self.receive_loop(&bot_id, &connection, ws_stream).await;

        registry.release(&bot_id, connection.id()).await;
        connection.close();
        if let Err(e) = send_task.await {
            error!("Writer task for bot {} panicked: {}", bot_id, e);
        }
        info!("Connection closed for bot: {}", bot_id);
    }

    /// Decode and process frames strictly in arrival order. Returns on peer
    /// close, read or decode error, or when the registry closes the connection.
    async fn receive_loop(
        &self,
        bot_id: &str,
        connection: &BotConnection,
        mut ws_stream: futures::stream::SplitStream<WebSocketStream<TcpStream>>,
    ) {
        loop {
            let frame = tokio::select! {
                _ = connection.closed() => {
                    info!("Connection {} for bot {} closed by hub", connection.id(), bot_id);
                    return;
                }
                frame = ws_stream.next() => frame,
            };

            let text = match frame {
                Some(Ok(Message::Text(text))) => text,
                Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes) {
                    Ok(text) => text,
                    Err(e) => {
                        warn!("Binary frame from bot {} is not UTF-8: {}", bot_id, e);
                        return;
                    }
                },
                Some(Ok(Message::Close(reason))) => {
                    info!("Bot {} closed the connection: {:?}", bot_id, reason);
                    return;
                }
                Some(Ok(_)) => continue,
                Some(Err(e)) => {
                    warn!("Error reading from bot {}: {}", bot_id, e);
                    return;
                }
                None => return,
            };

            let envelope = match InboundEnvelope::decode(&text) {
                Ok(envelope) => envelope,
                Err(e) => {
                    warn!("Dropping connection for bot {}: {}", bot_id, e);
                    return;
                }
            };

            if let Err(e) = self.pipeline.process(&envelope).await {
                error!("Error processing message from {}: {}", envelope.sender_phone, e);
            }
        }
    }
}

/// Forward queued frames to the socket, pinging on the configured interval,
/// and report each write back to whoever is waiting on it.
/// Stops after writing a close frame or on the first write error.
async fn write_frames(
    mut ws_sink: futures::stream::SplitSink<WebSocketStream<TcpStream>, Message>,
    mut rx: mpsc::UnboundedReceiver<OutboundFrame>,
    config: HubConfig,
    bot_id: String,
) {
    let mut heartbeat = config.ping_interval().map(|period| {
        let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        interval
    });

    loop {
        let OutboundFrame { message, written } = tokio::select! {
            frame = rx.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
            _ = async {
                match heartbeat.as_mut() {
                    Some(interval) => { interval.tick().await; }
                    None => futures::future::pending::<()>().await,
                }
            } => OutboundFrame { message: Message::Ping(Vec::new()), written: None },
        };

        let closing = matches!(message, Message::Close(_));
        let result = ws_sink
            .send(message)
            .await
            .map_err(|e| HubError::SendError(format!("write to bot {} failed: {}", bot_id, e)));
        let failed = result.is_err();
        if let Err(e) = &result {
            warn!("{}", e);
        }
        if let Some(written) = written {
            // The sender may have given up waiting.
            let _ = written.send(result);
        }
        if failed || closing {
            break;
        }
    }

    if let Err(e) = ws_sink.close().await {
        debug!("Error closing socket for bot {}: {}", bot_id, e);
    }
}

impl From<HubError> for ErrorResponse {
    fn from(err: HubError) -> Self {
        let status = match err {
            HubError::AlreadyConnected(_) => StatusCode::CONFLICT,
            HubError::InvalidFormat(_) | HubError::Handshake(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        reject(status, &err.to_string())
    }
}
