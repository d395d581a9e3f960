use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;

use dispatch_common::{ChatCompletionRequest, ChatCompletionResponse};

use super::endpoint::{CallError, ModelClient, ModelEndpoint};

const HEALTH_TIMEOUT: Duration = Duration::from_secs(5);

/// [`ModelClient`] speaking the OpenAI-compatible HTTP API of compute nodes.
///
/// Request timeouts are enforced by the endpoint gateway, not here.
pub struct HttpModelClient {
    http_client: Client,
}

impl HttpModelClient {
    pub fn new() -> Result<Self, reqwest::Error> {
        let http_client = Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .build()?;
        Ok(Self { http_client })
    }
}

#[async_trait]
impl ModelClient for HttpModelClient {
    async fn complete(
        &self,
        endpoint: &ModelEndpoint,
        request: &ChatCompletionRequest,
    ) -> Result<ChatCompletionResponse, CallError> {
        let url = format!("{}/v1/chat/completions", endpoint.url);
        tracing::debug!("Calling model {} on node {} at {}", endpoint.model, endpoint.node_id, url);

        let response = self
            .http_client
            .post(&url)
            .json(request)
            .send()
            .await
            .map_err(|e| CallError::Transport {
                node_id: endpoint.node_id.clone(),
                message: e.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(CallError::Status {
                node_id: endpoint.node_id.clone(),
                status: status.as_u16(),
                body,
            });
        }

        response
            .json::<ChatCompletionResponse>()
            .await
            .map_err(|e| CallError::InvalidResponse {
                node_id: endpoint.node_id.clone(),
                message: e.to_string(),
            })
    }

    async fn health(&self, node_id: &str, node_url: &str) -> bool {
        let url = format!("{}/health", node_url);
        match self.http_client.get(&url).timeout(HEALTH_TIMEOUT).send().await {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                tracing::debug!("Health check for node {} failed: {}", node_id, e);
                false
            }
        }
    }
}
