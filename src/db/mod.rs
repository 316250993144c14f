//! Persistence for the conversation pipeline.
//!
//! Client and bot records, conversation documents, the Postgres pool and an
//! in-memory backend implementing the same repository traits.

pub mod memory;
pub mod models;
pub mod operations;
pub mod repositories;

pub use memory::MemoryStore;
pub use models::{Bot, Client, Conversation, ConversationMessage, NewClient, BOT_SENDER};
pub use operations::{DbOperations, DbPoolStatus};
pub use repositories::{
    BotRepository, ClientRepository, MessageRepository, PgBotRepository, PgClientRepository,
    PgMessageRepository,
};
