use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use sqlx::FromRow;

/// Sender tag stored on replies produced by the NLU engine.
pub const BOT_SENDER: &str = "bot";

/// A WhatsApp user talking to one of the bots, keyed by bare phone number.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow, PartialEq)]
pub struct Client {
    pub id: i64,
    pub name: String,
    pub email: Option<String>,
    pub phone: String,
    pub company: String,
    pub bot_id: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
pub struct NewClient {
    pub phone: String,
    pub name: String,
    pub email: Option<String>,
}

impl NewClient {
    pub fn new(phone: impl Into<String>) -> Self {
        Self {
            phone: phone.into(),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow, PartialEq)]
pub struct Bot {
    pub id: i64,
    pub name: String,
    pub bot_type: String,
    pub number: String,
    pub active: bool,
}

/// One entry of a conversation document.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConversationMessage {
    pub client_id: i64,
    pub bot_id: i64,
    pub sender: String,
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

impl ConversationMessage {
    pub fn new(client_id: i64, bot_id: i64, sender: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            client_id,
            bot_id,
            sender: sender.into(),
            text: text.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn is_from_bot(&self) -> bool {
        self.sender == BOT_SENDER
    }
}

/// Append-only message log for one (client, bot) pair.
#[derive(Debug, Clone, FromRow)]
pub struct Conversation {
    pub client_id: i64,
    pub bot_id: i64,
    pub messages: Json<Vec<ConversationMessage>>,
    pub created_at: DateTime<Utc>,
}

impl Conversation {
    pub fn messages(&self) -> &[ConversationMessage] {
        &self.messages.0
    }
}
