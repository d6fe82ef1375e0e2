use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{KgragError, Result};
use crate::llm::{ExecuteOptions, ExecuteResult, LlmExecutor, Payload};

/// Request structure for an OpenAI-compatible chat completions API
#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

/// Response structure from the chat completions API
#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Deserialize)]
struct ChatChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

/// OpenAI-compatible chat client
///
/// Sends one user message per call with no tool definitions, so the model can
/// only answer with text. Retries 429 and 5xx responses with exponential backoff.
pub struct OpenAIExecutor {
    client: Client,
    base_url: String,
    api_key: String,
    model: String,
    max_retries: usize,
}

impl OpenAIExecutor {
    /// Create a new executor
    ///
    /// # Arguments
    ///
    /// * `base_url` - API root, e.g. `https://api.openai.com/v1`
    /// * `api_key` - Bearer token
    /// * `model` - Default model, overridable per call
    pub fn new(base_url: String, api_key: String, model: String) -> Result<Self> {
        let client = Client::builder()
            .build()
            .map_err(|e| KgragError::Llm(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            model,
            max_retries: 2,
        })
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    async fn send_once(&self, prompt: &str, model: &str, timeout: Duration) -> Result<Vec<Payload>> {
        let request = ChatRequest {
            model,
            messages: vec![ChatMessage { role: "user", content: prompt }],
            temperature: 0.0,
        };

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .timeout(timeout)
            .json(&request)
            .send()
            .await
            .map_err(|e| KgragError::Llm(format!("Network error: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unable to read error response".to_string());
            return Err(KgragError::Llm(format!("API error {}: {}", status, body)));
        }

        let result: ChatResponse = response
            .json()
            .await
            .map_err(|e| KgragError::Llm(format!("Failed to parse response: {}", e)))?;

        Ok(result
            .choices
            .into_iter()
            .filter_map(|c| c.message.content)
            .map(|text| Payload { text })
            .collect())
    }
}

fn is_retryable(err: &KgragError) -> bool {
    let msg = err.to_string();
    ["429", "500", "502", "503", "504"].iter().any(|code| msg.contains(code))
}

#[async_trait]
impl LlmExecutor for OpenAIExecutor {
    async fn execute(&self, prompt: &str, options: &ExecuteOptions) -> Result<ExecuteResult> {
        let model = options.model.as_deref().unwrap_or(&self.model);
        if let Some(provider) = options.provider.as_deref() {
            log::debug!("Executing prompt via provider {} (model {})", provider, model);
        }

        // Keep a transcript of the call in the scratch area for debugging
        tokio::fs::write(options.work_dir.join("prompt.txt"), prompt).await?;

        let start = std::time::Instant::now();
        let mut attempt = 0;
        let mut delay = Duration::from_secs(1);

        let payloads = loop {
            match self.send_once(prompt, model, options.timeout).await {
                Ok(payloads) => break payloads,
                Err(e) if attempt < self.max_retries && is_retryable(&e) => {
                    log::warn!("Retry {}/{} after error: {}", attempt + 1, self.max_retries, e);
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        };

        log::debug!("LLM call took {:?} (attempt {})", start.elapsed(), attempt + 1);
        let result = ExecuteResult { payloads };
        tokio::fs::write(options.work_dir.join("response.txt"), result.joined_text()).await?;
        Ok(result)
    }
}
