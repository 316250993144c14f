//! Per-message conversation flow: resolve the client and bot records, log the
//! inbound text, ask the NLU engine for replies, then log and deliver each reply.

use std::sync::Arc;
use tracing::{error, info, warn};

use crate::db::{
    BotRepository, ClientRepository, ConversationMessage, MessageRepository, NewClient, BOT_SENDER,
};
use crate::error::PipelineError;
use crate::nlu::{NluEngine, NluRequest};
use crate::websocket::{Delivery, InboundEnvelope};

/// Strip a `@domain` suffix: `"51999@s.whatsapp.net"` becomes `"51999"`.
pub fn normalize_identifier(raw: &str) -> &str {
    raw.split_once('@').map_or(raw, |(bare, _)| bare)
}

/// Outcome of one successful pipeline run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PipelineReport {
    pub client_id: i64,
    pub bot_id: i64,
    /// Non-empty replies returned by the engine.
    pub replies: usize,
    pub persisted: usize,
    pub delivered: usize,
}

pub struct ConversationPipeline {
    clients: Arc<dyn ClientRepository>,
    bots: Arc<dyn BotRepository>,
    messages: Arc<dyn MessageRepository>,
    nlu: Arc<dyn NluEngine>,
    delivery: Delivery,
    default_bot_name: String,
}

impl ConversationPipeline {
    pub fn new(
        clients: Arc<dyn ClientRepository>,
        bots: Arc<dyn BotRepository>,
        messages: Arc<dyn MessageRepository>,
        nlu: Arc<dyn NluEngine>,
        delivery: Delivery,
        default_bot_name: impl Into<String>,
    ) -> Self {
        Self {
            clients,
            bots,
            messages,
            nlu,
            delivery,
            default_bot_name: default_bot_name.into(),
        }
    }

    /// Run one inbound message through the pipeline.
    ///
    /// Record resolution, inbound persistence and the NLU call are each
    /// required for the next step and abort the run on failure. Reply
    /// persistence and delivery failures only affect the reply concerned.
    pub async fn process(&self, envelope: &InboundEnvelope) -> Result<PipelineReport, PipelineError> {
        info!(
            "Processing message from {} to bot {}: {}",
            envelope.sender_phone, envelope.bot_identifier, envelope.message_text
        );

        let phone = normalize_identifier(&envelope.sender_phone);
        let bot_number = normalize_identifier(&envelope.bot_identifier);

        let client = self
            .clients
            .get_or_create(NewClient::new(phone))
            .await
            .map_err(PipelineError::Client)?;

        let bot = self
            .bots
            .get_or_create(bot_number, &self.default_bot_name)
            .await
            .map_err(PipelineError::Bot)?;

        let inbound = ConversationMessage::new(
            client.id,
            bot.id,
            envelope.sender_phone.as_str(),
            envelope.message_text.as_str(),
        );
        self.messages
            .append(client.id, bot.id, inbound)
            .await
            .map_err(PipelineError::SaveInbound)?;

        let replies = self
            .nlu
            .classify(NluRequest {
                sender: envelope.sender_phone.clone(),
                message: envelope.message_text.clone(),
            })
            .await
            .map_err(PipelineError::Nlu)?;

        let mut report = PipelineReport {
            client_id: client.id,
            bot_id: bot.id,
            ..PipelineReport::default()
        };

        for reply in replies.into_iter().filter(|r| !r.text.is_empty()) {
            report.replies += 1;

            let outbound = ConversationMessage::new(client.id, bot.id, BOT_SENDER, reply.text.as_str());
            match self.messages.append(client.id, bot.id, outbound).await {
                Ok(()) => report.persisted += 1,
                Err(e) => warn!("Failed to save bot message for client {}: {}", client.id, e),
            }

            match self
                .delivery
                .deliver(&envelope.bot_identifier, &envelope.sender_phone, &reply.text)
                .await
            {
                Ok(()) => report.delivered += 1,
                Err(e) => error!(
                    "Failed to send reply to bot {} for {}: {}",
                    envelope.bot_identifier, envelope.sender_phone, e
                ),
            }
        }

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::memory::MemoryStore;
    use crate::db::repositories::{MockBotRepository, MockClientRepository, MockMessageRepository};
    use crate::db::{Bot, Client};
    use crate::error::{DatabaseError, NluError};
    use crate::nlu::{MockNluEngine, NluReply};
    use crate::websocket::loopback_connection;
    use crate::websocket::{BotConnection, ConnectionRegistry, OutboundFrame, OutboundMessage};
    use chrono::Utc;
    use mockall::predicate::eq;
    use tokio::sync::mpsc;
    use tokio_tungstenite::tungstenite::Message;

    fn envelope(text: &str) -> InboundEnvelope {
        InboundEnvelope {
            sender_phone: "5551234@c.us".to_string(),
            message_text: text.to_string(),
            bot_identifier: "5550001@c.us".to_string(),
        }
    }

    fn scripted_nlu(replies: &[&str]) -> MockNluEngine {
        let replies: Vec<NluReply> = replies.iter().map(|t| NluReply::new(*t)).collect();
        let mut nlu = MockNluEngine::new();
        nlu.expect_classify().returning(move |_| Ok(replies.clone()));
        nlu
    }

    fn sample_client() -> Client {
        Client {
            id: 7,
            name: String::new(),
            email: None,
            phone: "5551234".to_string(),
            company: String::new(),
            bot_id: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn sample_bot() -> Bot {
        Bot {
            id: 3,
            name: "Default Bot".to_string(),
            bot_type: String::new(),
            number: "5550001".to_string(),
            active: true,
        }
    }

    struct Harness {
        store: MemoryStore,
        pipeline: ConversationPipeline,
        rx: mpsc::UnboundedReceiver<Message>,
    }

    async fn harness(nlu: MockNluEngine) -> Harness {
        let store = MemoryStore::new();
        let registry = Arc::new(ConnectionRegistry::new());
        let (conn, rx) = loopback_connection();
        registry.register("5550001", conn).await;

        let pipeline = ConversationPipeline::new(
            Arc::new(store.clone()),
            Arc::new(store.clone()),
            Arc::new(store.clone()),
            Arc::new(nlu),
            Delivery::new(registry),
            "Default Bot",
        );
        Harness { store, pipeline, rx }
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<Message>) -> Vec<OutboundMessage> {
        let mut frames = Vec::new();
        while let Ok(Message::Text(text)) = rx.try_recv() {
            frames.push(serde_json::from_str(&text).unwrap());
        }
        frames
    }

    #[test]
    fn test_normalize_identifier() {
        assert_eq!(normalize_identifier("51999@s.whatsapp.net"), "51999");
        assert_eq!(normalize_identifier("51999"), "51999");
        assert_eq!(normalize_identifier(normalize_identifier("51999@c.us")), "51999");
        assert_eq!(normalize_identifier("a@b@c"), "a");
        assert_eq!(normalize_identifier(""), "");
    }

    #[tokio::test]
    async fn test_end_to_end_greeting() {
        let mut nlu = MockNluEngine::new();
        nlu.expect_classify()
            .with(eq(NluRequest {
                sender: "5551234@c.us".to_string(),
                message: "hola".to_string(),
            }))
            .times(1)
            .returning(|_| Ok(vec![NluReply::new("Hola, ¿en qué te ayudo?")]));
        let mut h = harness(nlu).await;

        let report = h.pipeline.process(&envelope("hola")).await.unwrap();

        assert_eq!(report.replies, 1);
        assert_eq!(report.persisted, 1);
        assert_eq!(report.delivered, 1);

        let clients = h.store.clients().await;
        assert_eq!(clients.len(), 1);
        assert_eq!(clients[0].phone, "5551234");
        let bots = h.store.bots().await;
        assert_eq!(bots.len(), 1);
        assert_eq!(bots[0].number, "5550001");
        assert_eq!(bots[0].name, "Default Bot");

        let messages = h.store.all_messages().await;
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].sender, "5551234@c.us");
        assert_eq!(messages[0].text, "hola");
        assert_eq!(messages[1].sender, BOT_SENDER);
        assert_eq!(messages[1].text, "Hola, ¿en qué te ayudo?");

        assert_eq!(
            drain(&mut h.rx),
            vec![OutboundMessage {
                to: "5551234@c.us".to_string(),
                message: "Hola, ¿en qué te ayudo?".to_string(),
            }]
        );
    }

    #[tokio::test]
    async fn test_empty_replies_are_skipped() {
        let mut h = harness(scripted_nlu(&["", "ok"])).await;

        let report = h.pipeline.process(&envelope("hola")).await.unwrap();

        assert_eq!(report.replies, 1);
        let bot_messages: Vec<_> = h
            .store
            .all_messages()
            .await
            .into_iter()
            .filter(|m| m.is_from_bot())
            .collect();
        assert_eq!(bot_messages.len(), 1);
        assert_eq!(bot_messages[0].text, "ok");

        let frames = drain(&mut h.rx);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].message, "ok");
    }

    #[tokio::test]
    async fn test_zero_replies_send_nothing() {
        let mut h = harness(scripted_nlu(&[])).await;

        let report = h.pipeline.process(&envelope("hola")).await.unwrap();

        assert_eq!(report.replies, 0);
        assert_eq!(h.store.all_messages().await.len(), 1);
        assert!(drain(&mut h.rx).is_empty());
    }

    #[tokio::test]
    async fn test_nlu_failure_keeps_inbound_only() {
        let mut nlu = MockNluEngine::new();
        nlu.expect_classify()
            .times(1)
            .returning(|_| Err(NluError::RequestFailed("timed out".to_string())));
        let mut h = harness(nlu).await;

        let result = h.pipeline.process(&envelope("hola")).await;

        assert!(matches!(result, Err(PipelineError::Nlu(_))));
        assert_eq!(h.store.all_messages().await.len(), 1);
        assert!(drain(&mut h.rx).is_empty());
    }

    #[tokio::test]
    async fn test_messages_persist_in_arrival_order() {
        let mut h = harness(scripted_nlu(&[])).await;

        for text in ["uno", "dos", "tres"] {
            h.pipeline.process(&envelope(text)).await.unwrap();
        }

        let texts: Vec<String> = h
            .store
            .all_messages()
            .await
            .into_iter()
            .filter(|m| m.sender == "5551234@c.us")
            .map(|m| m.text)
            .collect();
        assert_eq!(texts, vec!["uno", "dos", "tres"]);
        assert_eq!(h.store.clients().await.len(), 1);
        assert!(drain(&mut h.rx).is_empty());
    }

    #[tokio::test]
    async fn test_raw_and_bare_phone_resolve_same_client() {
        let mut h = harness(scripted_nlu(&[])).await;

        let first = h.pipeline.process(&envelope("hola")).await.unwrap();
        let mut bare = envelope("otra vez");
        bare.sender_phone = "5551234".to_string();
        bare.bot_identifier = "5550001".to_string();
        let second = h.pipeline.process(&bare).await.unwrap();

        assert_eq!(first.client_id, second.client_id);
        assert_eq!(first.bot_id, second.bot_id);
        assert!(drain(&mut h.rx).is_empty());
    }

    #[tokio::test]
    async fn test_delivery_failure_does_not_abort_replies() {
        let store = MemoryStore::new();
        let pipeline = ConversationPipeline::new(
            Arc::new(store.clone()),
            Arc::new(store.clone()),
            Arc::new(store.clone()),
            Arc::new(scripted_nlu(&["uno", "dos"])),
            Delivery::new(Arc::new(ConnectionRegistry::new())),
            "Default Bot",
        );

        let report = pipeline.process(&envelope("hola")).await.unwrap();

        assert_eq!(report.replies, 2);
        assert_eq!(report.persisted, 2);
        assert_eq!(report.delivered, 0);
    }

    #[tokio::test]
    async fn test_inbound_save_failure_skips_nlu() {
        let mut clients = MockClientRepository::new();
        clients.expect_get_or_create().returning(|_| Ok(sample_client()));
        let mut bots = MockBotRepository::new();
        bots.expect_get_or_create().returning(|_, _| Ok(sample_bot()));
        let mut messages = MockMessageRepository::new();
        messages
            .expect_append()
            .times(1)
            .returning(|_, _, _| Err(DatabaseError::ConnectionError("refused".to_string())));
        let mut nlu = MockNluEngine::new();
        nlu.expect_classify().times(0);

        let pipeline = ConversationPipeline::new(
            Arc::new(clients),
            Arc::new(bots),
            Arc::new(messages),
            Arc::new(nlu),
            Delivery::new(Arc::new(ConnectionRegistry::new())),
            "Default Bot",
        );

        let result = pipeline.process(&envelope("hola")).await;
        assert!(matches!(result, Err(PipelineError::SaveInbound(_))));
    }

    #[tokio::test]
    async fn test_client_failure_aborts_before_bot_lookup() {
        let mut clients = MockClientRepository::new();
        clients
            .expect_get_or_create()
            .withf(|new_client| new_client.phone == "5551234" && new_client.name.is_empty())
            .returning(|_| Err(DatabaseError::QueryError("boom".to_string())));
        let mut bots = MockBotRepository::new();
        bots.expect_get_or_create().times(0);
        let mut messages = MockMessageRepository::new();
        messages.expect_append().times(0);
        let mut nlu = MockNluEngine::new();
        nlu.expect_classify().times(0);

        let pipeline = ConversationPipeline::new(
            Arc::new(clients),
            Arc::new(bots),
            Arc::new(messages),
            Arc::new(nlu),
            Delivery::new(Arc::new(ConnectionRegistry::new())),
            "Default Bot",
        );

        let result = pipeline.process(&envelope("hola")).await;
        assert!(matches!(result, Err(PipelineError::Client(_))));
    }

    #[tokio::test]
    async fn test_bot_failure_aborts_before_persistence() {
        let mut clients = MockClientRepository::new();
        clients.expect_get_or_create().times(1).returning(|_| Ok(sample_client()));
        let mut bots = MockBotRepository::new();
        bots.expect_get_or_create()
            .times(1)
            .returning(|_, _| Err(DatabaseError::ConnectionError("pool timed out".to_string())));
        let mut messages = MockMessageRepository::new();
        messages.expect_append().times(0);
        let mut nlu = MockNluEngine::new();
        nlu.expect_classify().times(0);

        let pipeline = ConversationPipeline::new(
            Arc::new(clients),
            Arc::new(bots),
            Arc::new(messages),
            Arc::new(nlu),
            Delivery::new(Arc::new(ConnectionRegistry::new())),
            "Default Bot",
        );

        let result = pipeline.process(&envelope("hola")).await;
        assert!(matches!(
            result,
            Err(PipelineError::Bot(DatabaseError::ConnectionError(ref e))) if e == "pool timed out"
        ));
    }

    #[tokio::test]
    async fn test_failed_socket_write_is_not_counted_as_delivered() {
        let store = MemoryStore::new();
        let registry = Arc::new(ConnectionRegistry::new());
        let (tx, mut frames) = mpsc::unbounded_channel::<OutboundFrame>();
        registry.register("5550001", BotConnection::new(tx)).await;
        // The first write fails on the socket, the second goes through.
        tokio::spawn(async move {
            let mut first = true;
            while let Some(frame) = frames.recv().await {
                if let Some(written) = frame.written {
                    let result = if first {
                        Err(crate::error::HubError::SendError("broken pipe".to_string()))
                    } else {
                        Ok(())
                    };
                    first = false;
                    let _ = written.send(result);
                }
            }
        });

        let pipeline = ConversationPipeline::new(
            Arc::new(store.clone()),
            Arc::new(store.clone()),
            Arc::new(store.clone()),
            Arc::new(scripted_nlu(&["uno", "dos"])),
            Delivery::new(registry),
            "Default Bot",
        );

        let report = pipeline.process(&envelope("hola")).await.unwrap();

        assert_eq!(report.replies, 2);
        assert_eq!(report.persisted, 2);
        assert_eq!(report.delivered, 1);
    }

    #[tokio::test]
    async fn test_reply_save_failure_still_delivers_remaining() {
        let mut clients = MockClientRepository::new();
        clients.expect_get_or_create().returning(|_| Ok(sample_client()));
        let mut bots = MockBotRepository::new();
        bots.expect_get_or_create()
            .withf(|number, name| number.to_string() == "5550001" && name.to_string() == "Default Bot")
            .returning(|_, _| Ok(sample_bot()));
        let mut messages = MockMessageRepository::new();
        messages
            .expect_append()
            .withf(|_, _, m| m.sender != BOT_SENDER)
            .times(1)
            .returning(|_, _, _| Ok(()));
        messages
            .expect_append()
            .withf(|_, _, m| m.sender == BOT_SENDER)
            .times(2)
            .returning(|_, _, m| {
                if m.text == "uno" {
                    Err(DatabaseError::QueryError("boom".to_string()))
                } else {
                    Ok(())
                }
            });

        let registry = Arc::new(ConnectionRegistry::new());
        let (conn, mut rx) = loopback_connection();
        registry.register("5550001", conn).await;

        let pipeline = ConversationPipeline::new(
            Arc::new(clients),
            Arc::new(bots),
            Arc::new(messages),
            Arc::new(scripted_nlu(&["uno", "dos"])),
            Delivery::new(registry),
            "Default Bot",
        );

        let report = pipeline.process(&envelope("hola")).await.unwrap();

        assert_eq!(report, PipelineReport { client_id: 7, bot_id: 3, replies: 2, persisted: 1, delivered: 2 });
        let frames: Vec<String> = drain(&mut rx).into_iter().map(|f| f.message).collect();
        assert_eq!(frames, vec!["uno", "dos"]);
    }
}
