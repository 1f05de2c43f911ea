//! Adapter between tracked sessions and the external judgment service.

use std::fmt::Write;
use std::sync::Arc;

use async_trait::async_trait;
use log::{debug, warn};

use crate::error::{BotError, Result};
use crate::openrouter::{CompletionOptions, Message, OpenRouterClient};
use crate::types::{ConversationId, MessageRole, TrackedMessage};

const CONTEXT_PLACEHOLDER: &str = "{context}";

const JUDGE_TEMPERATURE: f32 = 0.7;
const JUDGE_MAX_TOKENS: u32 = 200;

/// Everything the judgment service sees for one decision.
#[derive(Debug, Clone)]
pub struct DecisionRequest {
    pub conversation_id: ConversationId,
    /// Buffered messages, oldest first.
    pub context: Arc<[TrackedMessage]>,
    pub prompt: String,
    pub model: String,
}

/// Outcome of a decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecisionVerdict {
    pub should_continue: bool,
    pub content: Option<String>,
}

impl DecisionVerdict {
    #[must_use]
    pub fn proceed(content: Option<String>) -> Self {
        Self {
            should_continue: true,
            content,
        }
    }

    #[must_use]
    pub fn stop() -> Self {
        Self {
            should_continue: false,
            content: None,
        }
    }
}

/// Judgment service used by follow-up sessions.
///
/// Any error is treated by the caller as a "stop" verdict.
#[async_trait]
pub trait DecisionGateway: Send + Sync {
    async fn decide(&self, request: &DecisionRequest) -> Result<DecisionVerdict>;
}

/// Asks an OpenRouter model whether to continue the conversation.
pub struct OpenRouterGateway {
    client: Arc<OpenRouterClient>,
}

impl OpenRouterGateway {
    pub fn new(client: Arc<OpenRouterClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl DecisionGateway for OpenRouterGateway {
    async fn decide(&self, request: &DecisionRequest) -> Result<DecisionVerdict> {
        let prompt = render_prompt(&request.prompt, &request.context);
        debug!(
            "Requesting follow-up judgment for {} from {} ({} messages)",
            request.conversation_id,
            request.model,
            request.context.len()
        );

        let reply = self
            .client
            .complete(
                &request.model,
                vec![Message::new(MessageRole::User, prompt)],
                CompletionOptions {
                    max_tokens: JUDGE_MAX_TOKENS,
                    temperature: Some(JUDGE_TEMPERATURE),
                },
            )
            .await
            .map_err(|e| {
                warn!("Follow-up judgment call failed: {e}");
                BotError::JudgmentUnavailable(e.to_string())
            })?;

        parse_verdict(&reply)
    }
}

/// One `sender: content` line per message, in arrival order.
#[must_use]
pub fn render_context(messages: &[TrackedMessage]) -> String {
    let mut context = String::new();
    for (idx, message) in messages.iter().enumerate() {
        if idx > 0 {
            context.push('\n');
        }
        let _ = write!(context, "{}: {}", message.sender_name(), message.content());
    }
    context
}

/// Insert the rendered context into the prompt template.
///
/// Templates without a `{context}` placeholder get the conversation appended.
#[must_use]
pub fn render_prompt(template: &str, messages: &[TrackedMessage]) -> String {
    let context = render_context(messages);
    if template.contains(CONTEXT_PLACEHOLDER) {
        template.replace(CONTEXT_PLACEHOLDER, &context)
    } else {
        format!("{template}\n\nConversation:\n{context}")
    }
}

/// Parse a judge reply: the first non-empty line is the decision, the rest is
/// the message to send.
pub fn parse_verdict(reply: &str) -> Result<DecisionVerdict> {
    let mut lines = reply.lines().skip_while(|line| line.trim().is_empty());
    let Some(first) = lines.next() else {
        return Err(BotError::JudgmentUnavailable(
            "empty judgment reply".to_string(),
        ));
    };

    let decision = first
        .trim()
        .trim_end_matches(|c: char| c.is_ascii_punctuation() || c == '。' || c == '！')
        .to_lowercase();

    match decision.as_str() {
        "yes" | "y" | "continue" | "是" => {
            let content = lines.collect::<Vec<_>>().join("\n");
            let content = content.trim();
            Ok(DecisionVerdict::proceed(
                (!content.is_empty()).then(|| content.to_string()),
            ))
        }
        "no" | "n" | "stop" | "否" => Ok(DecisionVerdict::stop()),
        _ => Err(BotError::JudgmentUnavailable(format!(
            "malformed judgment reply: {first:?}"
        ))),
    }
}
