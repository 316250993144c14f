//! In-process storage backend. Used when `database.backend = "memory"` and by
//! the test suites; nothing survives a restart.

use async_trait::async_trait;
use chrono::Utc;
use sqlx::types::Json;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::db::models::{Bot, Client, Conversation, ConversationMessage, NewClient};
use crate::db::repositories::{BotRepository, ClientRepository, MessageRepository};
use crate::error::DatabaseError;

#[derive(Default)]
struct Tables {
    clients: Vec<Client>,
    bots: Vec<Bot>,
    conversations: HashMap<(i64, i64), Conversation>,
}

/// Implements all three repositories over one lock-guarded set of tables.
#[derive(Clone, Default)]
pub struct MemoryStore {
    tables: Arc<RwLock<Tables>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn clients(&self) -> Vec<Client> {
        self.tables.read().await.clients.clone()
    }

    pub async fn bots(&self) -> Vec<Bot> {
        self.tables.read().await.bots.clone()
    }

    /// Every stored message across all conversations, oldest document first.
    pub async fn all_messages(&self) -> Vec<ConversationMessage> {
        let tables = self.tables.read().await;
        let mut conversations: Vec<&Conversation> = tables.conversations.values().collect();
        conversations.sort_by_key(|c| c.created_at);
        conversations
            .into_iter()
            .flat_map(|c| c.messages().iter().cloned())
            .collect()
    }
}

#[async_trait]
impl ClientRepository for MemoryStore {
    async fn get_or_create(&self, defaults: NewClient) -> Result<Client, DatabaseError> {
        let mut tables = self.tables.write().await;
        if let Some(client) = tables.clients.iter().find(|c| c.phone == defaults.phone) {
            return Ok(client.clone());
        }
        if let Some(email) = &defaults.email {
            if tables.clients.iter().any(|c| c.email.as_ref() == Some(email)) {
                return Err(DatabaseError::Duplicate);
            }
        }

        let now = Utc::now();
        let client = Client {
            id: tables.clients.len() as i64 + 1,
            name: defaults.name,
            email: defaults.email,
            phone: defaults.phone,
            company: String::new(),
            bot_id: None,
            created_at: now,
            updated_at: now,
        };
        tables.clients.push(client.clone());
        Ok(client)
    }

    async fn get_by_phone(&self, phone: &str) -> Result<Option<Client>, DatabaseError> {
        let tables = self.tables.read().await;
        Ok(tables.clients.iter().find(|c| c.phone == phone).cloned())
    }
}

#[async_trait]
impl BotRepository for MemoryStore {
    async fn get_or_create(&self, number: &str, name: &str) -> Result<Bot, DatabaseError> {
        let mut tables = self.tables.write().await;
        if let Some(bot) = tables.bots.iter().find(|b| b.number == number) {
            return Ok(bot.clone());
        }

        let bot = Bot {
            id: tables.bots.len() as i64 + 1,
            name: name.to_string(),
            bot_type: String::new(),
            number: number.to_string(),
            active: true,
        };
        tables.bots.push(bot.clone());
        Ok(bot)
    }

    async fn get_by_number(&self, number: &str) -> Result<Option<Bot>, DatabaseError> {
        let tables = self.tables.read().await;
        Ok(tables.bots.iter().find(|b| b.number == number).cloned())
    }
}

#[async_trait]
impl MessageRepository for MemoryStore {
    async fn append(
        &self,
        client_id: i64,
        bot_id: i64,
        message: ConversationMessage,
    ) -> Result<(), DatabaseError> {
        let mut tables = self.tables.write().await;
        tables
            .conversations
            .entry((client_id, bot_id))
            .or_insert_with(|| Conversation {
                client_id,
                bot_id,
                messages: Json(Vec::new()),
                created_at: Utc::now(),
            })
            .messages
            .0
            .push(message);
        Ok(())
    }

    async fn conversation(
        &self,
        client_id: i64,
        bot_id: i64,
    ) -> Result<Option<Conversation>, DatabaseError> {
        let tables = self.tables.read().await;
        Ok(tables.conversations.get(&(client_id, bot_id)).cloned())
    }
}
