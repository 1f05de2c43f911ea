//! Main handler for bot mentions.

use log::{debug, error, info};
use poise::serenity_prelude::{Context, Message as SerenityMessage, UserId};

use crate::error::Result;
use crate::openrouter::OpenRouterClient;
use crate::types::MessageRole;

use super::context::build_dynamic_context;
use super::conversation::{build_conversation_history, message_to_openrouter_message};
use super::response::send_response;

/// Main handler for messages that mention the bot.
///
/// Returns `true` when the bot posted a reply, which is what makes the
/// conversation eligible for follow-up tracking.
pub async fn handle_bot_mention(
    ctx: &Context,
    new_message: &SerenityMessage,
    client: &OpenRouterClient,
    bot_user_id: UserId,
) -> Result<bool> {
    if !new_message.mentions_user_id(bot_user_id) {
        return Ok(false);
    }

    info!(
        "Received message from {} in channel {}: {}",
        new_message.author.tag(),
        new_message.channel_id,
        new_message.content
    );

    if let Err(e) = new_message.channel_id.broadcast_typing(&ctx.http).await {
        debug!("Failed to broadcast typing indicator: {e}");
    }

    let mut conversation_history = build_conversation_history(ctx, new_message, bot_user_id).await;
    conversation_history.push(message_to_openrouter_message(new_message, MessageRole::User));
    debug!(
        "Conversation history has {} messages",
        conversation_history.len()
    );

    let dynamic_context = build_dynamic_context(new_message);

    match client
        .chat_with_history(conversation_history, Some(dynamic_context))
        .await
    {
        Ok(text) => send_response(ctx, new_message, &text).await,
        Err(e) => {
            error!(
                "Error processing message from {}: {}",
                new_message.author.tag(),
                e
            );
            new_message.reply(&ctx.http, e.user_message()).await?;
            Ok(false)
        }
    }
}
