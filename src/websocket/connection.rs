use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot, Notify};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::error::HubError;

/// Frame sent by a connector for every message a WhatsApp user writes to the bot.
/// Absent fields decode as empty strings.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct InboundEnvelope {
    #[serde(rename = "phone")]
    pub sender_phone: String,
    #[serde(rename = "message")]
    pub message_text: String,
    #[serde(rename = "botNumber")]
    pub bot_identifier: String,
}

impl InboundEnvelope {
    pub fn decode(text: &str) -> Result<Self, HubError> {
        serde_json::from_str(text).map_err(|e| HubError::InvalidFormat(e.to_string()))
    }
}

/// Frame sent back to a connector: deliver `message` to the WhatsApp user `to`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OutboundMessage {
    pub to: String,
    pub message: String,
}

/// A frame queued for a connection's writer task. When `written` is set the
/// writer reports the outcome of the socket write through it.
#[derive(Debug)]
pub struct OutboundFrame {
    pub(crate) message: Message,
    pub(crate) written: Option<oneshot::Sender<Result<(), HubError>>>,
}

/// Write side of one connector socket.
///
/// All frames go through the connection's writer task. [`write`](Self::write)
/// waits until the frame is on the socket; control frames from
/// [`send`](Self::send) and [`close`](Self::close) do not. Clones share the
/// same socket and closed state.
#[derive(Debug, Clone)]
pub struct BotConnection {
    id: Uuid,
    tx: mpsc::UnboundedSender<OutboundFrame>,
    closed: Arc<AtomicBool>,
    shutdown: Arc<Notify>,
}

impl BotConnection {
    pub fn new(tx: mpsc::UnboundedSender<OutboundFrame>) -> Self {
        Self {
            id: Uuid::new_v4(),
            tx,
            closed: Arc::new(AtomicBool::new(false)),
            shutdown: Arc::new(Notify::new()),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    fn enqueue(
        &self,
        message: Message,
        written: Option<oneshot::Sender<Result<(), HubError>>>,
    ) -> Result<(), HubError> {
        if self.is_closed() {
            return Err(HubError::ConnectionClosed(self.id.to_string()));
        }
        self.tx
            .send(OutboundFrame { message, written })
            .map_err(|_| HubError::SendError(format!("writer for connection {} is gone", self.id)))
    }

    /// Hand a control frame to the writer without waiting for it.
    pub fn send(&self, msg: Message) -> Result<(), HubError> {
        self.enqueue(msg, None)
    }

    /// Write `msg` to the socket and wait for the result.
    pub async fn write(&self, msg: Message) -> Result<(), HubError> {
        let (written, result) = oneshot::channel();
        self.enqueue(msg, Some(written))?;
        result.await.map_err(|_| {
            HubError::SendError(format!("writer for connection {} stopped before writing", self.id))
        })?
    }

    pub async fn send_json<T: Serialize>(&self, payload: &T) -> Result<(), HubError> {
        let text = serde_json::to_string(payload)
            .map_err(|e| HubError::SendError(format!("Failed to serialize message: {}", e)))?;
        self.write(Message::Text(text)).await
    }

    /// Queue a close frame and wake the receive loop. Idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        // The writer may already have exited; nothing left to tell it then.
        let _ = self.tx.send(OutboundFrame { message: Message::Close(None), written: None });
        self.shutdown.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Resolves once [`close`](Self::close) has been called on any clone.
    pub async fn closed(&self) {
        let notified = self.shutdown.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        if self.is_closed() {
            return;
        }
        notified.await;
    }
}

/// Writer stand-in for unit tests: forwards every frame to the returned
/// receiver and acknowledges writes as successful.
#[cfg(test)]
pub(crate) fn loopback_connection() -> (BotConnection, mpsc::UnboundedReceiver<Message>) {
    let (tx, mut frames) = mpsc::unbounded_channel::<OutboundFrame>();
    let (out, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        while let Some(OutboundFrame { message, written }) = frames.recv().await {
            let _ = out.send(message);
            if let Some(written) = written {
                let _ = written.send(Ok(()));
            }
        }
    });
    (BotConnection::new(tx), rx)
}
