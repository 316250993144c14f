//! Intent classification collaborator.
//!
//! The pipeline only sees the [`NluEngine`] trait; [`RasaClient`] talks to a
//! Rasa REST webhook.

mod rasa;

pub use rasa::RasaClient;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

#[cfg(test)]
use mockall::automock;

use crate::error::NluError;

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct NluRequest {
    pub sender: String,
    pub message: String,
}

/// One reply produced for an inbound message. Items that carry only images,
/// buttons or custom payloads decode with an empty `text`.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct NluReply {
    #[serde(default)]
    pub text: String,
}

impl NluReply {
    pub fn new(text: impl Into<String>) -> Self {
        Self { text: text.into() }
    }
}

#[cfg_attr(test, automock)]
#[async_trait]
pub trait NluEngine: Send + Sync {
    /// Replies in the order the engine produced them.
    async fn classify(&self, request: NluRequest) -> Result<Vec<NluReply>, NluError>;
}
