use log::debug;
use serde::{Deserialize, Serialize};

use crate::error::{BotError, Result};
use crate::types::MessageRole;

const OPENROUTER_API_URL: &str = "https://openrouter.ai/api/v1/chat/completions";

// Discord's message limit is 2000 characters (standard users)
// Roughly 1 token ≈ 4 characters, so 2000 chars ≈ 500 tokens
// Using 512 tokens to be safe
const MAX_TOKENS: u32 = 512;

#[derive(Debug, Serialize)]
struct OpenRouterRequest<'a> {
    model: &'a str,
    messages: Vec<Message>,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: MessageRole,
    #[serde(default)]
    pub content: Option<String>,
}

impl Message {
    pub fn new(role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: Some(content.into()),
        }
    }
}

/// Sampling options for a single completion.
#[derive(Debug, Clone, Copy)]
pub struct CompletionOptions {
    pub max_tokens: u32,
    pub temperature: Option<f32>,
}

impl Default for CompletionOptions {
    fn default() -> Self {
        Self {
            max_tokens: MAX_TOKENS,
            temperature: None,
        }
    }
}

#[derive(Debug, Deserialize)]
struct OpenRouterResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: Message,
}

pub struct OpenRouterClient {
    api_key: String,
    client: reqwest::Client,
    model: String,
    system_prompt: String,
}

impl OpenRouterClient {
    pub fn new(api_key: String, model: String, system_prompt: String) -> Self {
        Self {
            api_key,
            client: reqwest::Client::new(),
            model,
            system_prompt,
        }
    }

    /// Chat with the configured model, prefixing the configured system prompt.
    pub async fn chat_with_history(
        &self,
        mut messages: Vec<Message>,
        dynamic_context: Option<String>,
    ) -> Result<String> {
        // Build the full system prompt with dynamic context
        let full_system_prompt = if let Some(context) = dynamic_context {
            format!("{}\n\n{}", context, self.system_prompt)
        } else {
            self.system_prompt.clone()
        };

        // Ensure system prompt is at the beginning
        if messages.is_empty() || messages[0].role != MessageRole::System {
            messages.insert(0, Message::new(MessageRole::System, full_system_prompt));
        }

        self.complete(&self.model, messages, CompletionOptions::default())
            .await
    }

    /// Run a single completion against an explicit model, without the bot's
    /// system prompt.
    pub async fn complete(
        &self,
        model: &str,
        messages: Vec<Message>,
        options: CompletionOptions,
    ) -> Result<String> {
        debug!(
            "Sending request to OpenRouter API ({model}) with {} messages",
            messages.len()
        );

        let request = OpenRouterRequest {
            model,
            messages,
            max_tokens: options.max_tokens,
            temperature: options.temperature,
        };

        let response = self
            .client
            .post(OPENROUTER_API_URL)
            .bearer_auth(&self.api_key)
            .header("Content-Type", "application/json")
            .json(&request)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let message = response
                .text()
                .await
                .unwrap_or_else(|e| format!("Failed to read error response: {e}"));
            return Err(BotError::OpenRouterApi { status, message });
        }

        let api_response: OpenRouterResponse = response.json().await?;

        let reply = api_response
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| BotError::OpenRouterResponse("No choices in response".to_string()))?
            .message
            .content
            .unwrap_or_default();

        debug!("Received response from OpenRouter API");
        Ok(reply)
    }
}
