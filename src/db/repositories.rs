//! Repository seams used by the conversation pipeline, with their Postgres
//! implementations.
//!
//! Client and bot records live in plain relational tables. Conversations are
//! stored as one JSONB document per (client, bot) pair and only ever grow.

use async_trait::async_trait;
use sqlx::types::Json;
use sqlx::PgPool;
use std::sync::Arc;
use tracing::{debug, info};

#[cfg(test)]
use mockall::automock;

use crate::db::models::{Bot, Client, Conversation, ConversationMessage, NewClient};
use crate::error::DatabaseError;

#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClientRepository: Send + Sync {
    /// Fetch the client with this bare phone number, creating it from
    /// `defaults` when it does not exist yet.
    async fn get_or_create(&self, defaults: NewClient) -> Result<Client, DatabaseError>;

    async fn get_by_phone(&self, phone: &str) -> Result<Option<Client>, DatabaseError>;
}

#[cfg_attr(test, automock)]
#[async_trait]
pub trait BotRepository: Send + Sync {
    async fn get_or_create(&self, number: &str, name: &str) -> Result<Bot, DatabaseError>;

    async fn get_by_number(&self, number: &str) -> Result<Option<Bot>, DatabaseError>;
}

#[cfg_attr(test, automock)]
#[async_trait]
pub trait MessageRepository: Send + Sync {
    /// Append to the (client, bot) conversation, creating the document on the
    /// first message.
    async fn append(
        &self,
        client_id: i64,
        bot_id: i64,
        message: ConversationMessage,
    ) -> Result<(), DatabaseError>;

    async fn conversation(
        &self,
        client_id: i64,
        bot_id: i64,
    ) -> Result<Option<Conversation>, DatabaseError>;
}

const CLIENT_COLUMNS: &str = "id, name, email, phone, company, bot_id, created_at, updated_at";
const BOT_COLUMNS: &str = "id, name, bot_type, number, active";

#[derive(Clone)]
pub struct PgClientRepository {
    pool: Arc<PgPool>,
}

impl PgClientRepository {
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ClientRepository for PgClientRepository {
    async fn get_or_create(&self, defaults: NewClient) -> Result<Client, DatabaseError> {
        if let Some(client) = self.get_by_phone(&defaults.phone).await? {
            return Ok(client);
        }

        info!("Client not found, creating new one with phone: {}", defaults.phone);
        let created = sqlx::query_as::<_, Client>(&format!(
            "INSERT INTO clients (name, email, phone) VALUES ($1, $2, $3) \
             ON CONFLICT (phone) DO NOTHING RETURNING {CLIENT_COLUMNS}"
        ))
        .bind(&defaults.name)
        .bind(&defaults.email)
        .bind(&defaults.phone)
        .fetch_optional(self.pool.as_ref())
        .await?;

        match created {
            Some(client) => Ok(client),
            // Lost a race against a concurrent insert for the same phone.
            None => self
                .get_by_phone(&defaults.phone)
                .await?
                .ok_or(DatabaseError::NotFound),
        }
    }

    async fn get_by_phone(&self, phone: &str) -> Result<Option<Client>, DatabaseError> {
        let client = sqlx::query_as::<_, Client>(&format!(
            "SELECT {CLIENT_COLUMNS} FROM clients WHERE phone = $1"
        ))
        .bind(phone)
        .fetch_optional(self.pool.as_ref())
        .await?;

        Ok(client)
    }
}

#[derive(Clone)]
pub struct PgBotRepository {
    pool: Arc<PgPool>,
}

impl PgBotRepository {
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl BotRepository for PgBotRepository {
    async fn get_or_create(&self, number: &str, name: &str) -> Result<Bot, DatabaseError> {
        if let Some(bot) = self.get_by_number(number).await? {
            return Ok(bot);
        }

        info!("Bot not found, creating new one with number: {}", number);
        let created = sqlx::query_as::<_, Bot>(&format!(
            "INSERT INTO bots (name, number, active) VALUES ($1, $2, TRUE) \
             ON CONFLICT (number) DO NOTHING RETURNING {BOT_COLUMNS}"
        ))
        .bind(name)
        .bind(number)
        .fetch_optional(self.pool.as_ref())
        .await?;

        match created {
            Some(bot) => Ok(bot),
            None => self.get_by_number(number).await?.ok_or(DatabaseError::NotFound),
        }
    }

    async fn get_by_number(&self, number: &str) -> Result<Option<Bot>, DatabaseError> {
        let bot = sqlx::query_as::<_, Bot>(&format!(
            "SELECT {BOT_COLUMNS} FROM bots WHERE number = $1"
        ))
        .bind(number)
        .fetch_optional(self.pool.as_ref())
        .await?;

        Ok(bot)
    }
}

#[derive(Clone)]
pub struct PgMessageRepository {
    pool: Arc<PgPool>,
}

impl PgMessageRepository {
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl MessageRepository for PgMessageRepository {
    async fn append(
        &self,
        client_id: i64,
        bot_id: i64,
        message: ConversationMessage,
    ) -> Result<(), DatabaseError> {
        sqlx::query(
            r#"
            INSERT INTO conversations (client_id, bot_id, messages, created_at)
            VALUES ($1, $2, $3, NOW())
            ON CONFLICT (client_id, bot_id)
            DO UPDATE SET messages = conversations.messages || EXCLUDED.messages
            "#,
        )
        .bind(client_id)
        .bind(bot_id)
        .bind(Json(vec![message]))
        .execute(self.pool.as_ref())
        .await?;

        debug!("Appended message to conversation ({}, {})", client_id, bot_id);
        Ok(())
    }

    async fn conversation(
        &self,
        client_id: i64,
        bot_id: i64,
    ) -> Result<Option<Conversation>, DatabaseError> {
        let conversation = sqlx::query_as::<_, Conversation>(
            "SELECT client_id, bot_id, messages, created_at FROM conversations \
             WHERE client_id = $1 AND bot_id = $2",
        )
        .bind(client_id)
        .bind(bot_id)
        .fetch_optional(self.pool.as_ref())
        .await?;

        Ok(conversation)
    }
}
