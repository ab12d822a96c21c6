//! Minimal OpenAI-compatible chat-completions client (OpenRouter by default).

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::warn;

use rdmap_core::config::LlmSettings;
use rdmap_core::error::{Error, Result};

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: [ChatMessage<'a>; 2],
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Clone)]
pub struct ChatClient {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
}

impl ChatClient {
    pub fn new(base_url: &str, api_key: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Provider(e.to_string()))?;
        Ok(Self {
            client,
            endpoint: format!("{}/chat/completions", base_url.trim_end_matches('/')),
            api_key: api_key.into(),
        })
    }

    /// `None` when LLM features are disabled or no key is configured.
    pub fn from_settings(settings: &LlmSettings) -> Result<Option<Self>> {
        if !settings.is_available() {
            return Ok(None);
        }
        let key = settings.api_key.clone().unwrap_or_default();
        Self::new(&settings.base_url, key, Duration::from_millis(settings.timeout_ms)).map(Some)
    }

    /// Sends one system + user turn and returns the trimmed reply text.
    pub async fn complete(
        &self,
        model: &str,
        system: &str,
        user: &str,
        temperature: Option<f32>,
    ) -> Result<String> {
        let body = ChatRequest {
            model,
            messages: [
                ChatMessage { role: "system", content: system },
                ChatMessage { role: "user", content: user },
            ],
            temperature,
        };
        let resp = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::Provider(e.without_url().to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            warn!(%status, model, "chat completion rejected");
            return Err(Error::Provider(format!("chat provider returned HTTP {status}")));
        }
        let parsed: ChatResponse = resp
            .json()
            .await
            .map_err(|e| Error::Provider(format!("unparsable chat response: {e}")))?;
        let text = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .map(|s| s.trim().to_string())
            .unwrap_or_default();
        if text.is_empty() {
            return Err(Error::Provider("chat response has no content".into()));
        }
        Ok(text)
    }
}
