use async_trait::async_trait;
use reqwest::Client;
use tracing::debug;

use super::{NluEngine, NluReply, NluRequest};
use crate::config::NluConfig;
use crate::error::NluError;

#[derive(Clone)]
pub struct RasaClient {
    http: Client,
    webhook_url: String,
}

impl RasaClient {
    pub fn new(config: &NluConfig) -> Result<Self, NluError> {
        let http = Client::builder()
            .timeout(config.timeout())
            .build()
            .map_err(|e| NluError::RequestFailed(e.to_string()))?;

        Ok(Self {
            http,
            webhook_url: config.url.clone(),
        })
    }
}

#[async_trait]
impl NluEngine for RasaClient {
    async fn classify(&self, request: NluRequest) -> Result<Vec<NluReply>, NluError> {
        let response = self
            .http
            .post(&self.webhook_url)
            .json(&request)
            .send()
            .await?
            .error_for_status()?;

        let replies: Vec<NluReply> = response.json().await?;
        debug!("NLU returned {} replies for {}", replies.len(), request.sender);
        Ok(replies)
    }
}
