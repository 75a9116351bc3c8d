use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use crate::error::EnrichError;

/// A chat-completion service that answers a prompt with a JSON document.
#[async_trait]
pub trait ChatBackend: Send + Sync + 'static {
    async fn complete_json(&self, prompt: &str) -> Result<String, EnrichError>;
}

/// OpenAI-compatible chat completions client.
pub struct OpenAiClient {
    http: reqwest::Client,
    api_key: String,
    base_url: String,
    model: String,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: Message,
}

#[derive(Deserialize)]
struct Message {
    content: Option<String>,
}

impl OpenAiClient {
    pub fn new(api_key: String, base_url: &str, model: &str) -> Self {
        OpenAiClient {
            http: reqwest::Client::new(),
            api_key,
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
        }
    }
}

#[async_trait]
impl ChatBackend for OpenAiClient {
    async fn complete_json(&self, prompt: &str) -> Result<String, EnrichError> {
        let body = serde_json::json!({
            "model": self.model,
            "response_format": { "type": "json_object" },
            "messages": [{ "role": "user", "content": prompt }],
        });

        let response = self
            .http
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            debug!(status = status.as_u16(), "chat completion rejected");
            return Err(EnrichError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: ChatResponse = response.json().await?;
        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .map(|c| c.trim().to_string())
            .ok_or_else(|| EnrichError::Malformed("no content in completion".into()))
    }
}
