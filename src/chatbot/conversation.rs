//! Conversation history building from Discord reply chains.

use log::warn;
use poise::serenity_prelude::{Context, Message as SerenityMessage, UserId};

use crate::{openrouter::Message, types::MessageRole};

/// Converts a Discord message into an `OpenRouter` message.
pub fn message_to_openrouter_message(discord_msg: &SerenityMessage, role: MessageRole) -> Message {
    Message::new(role, discord_msg.content.clone())
}

/// Builds conversation history by walking up the Discord reply chain.
pub async fn build_conversation_history(
    ctx: &Context,
    message: &SerenityMessage,
    bot_user_id: UserId,
) -> Vec<Message> {
    let mut history = Vec::new();
    let mut current_message = message.clone();

    // Walk up the reply chain
    while let Some(ref_msg) = &current_message.referenced_message {
        // referenced_message can be partial, fetch the full one
        let full_msg = match ctx.http.get_message(ref_msg.channel_id, ref_msg.id).await {
            Ok(msg) => msg,
            Err(e) => {
                warn!("Failed to fetch message in reply chain: {e}");
                break;
            }
        };

        let role = if full_msg.author.id == bot_user_id {
            MessageRole::Assistant
        } else {
            MessageRole::User
        };

        history.push(message_to_openrouter_message(&full_msg, role));
        current_message = full_msg;
    }

    // Reverse to get chronological order
    history.reverse();
    history
}
