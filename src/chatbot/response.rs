//! Response sending utilities for Discord.

use log::{info, warn};
use poise::serenity_prelude::{Context, Message as SerenityMessage};

use crate::error::Result;

/// Reply to the triggering message.
///
/// Returns `true` if something was actually sent.
pub async fn send_response(
    ctx: &Context,
    new_message: &SerenityMessage,
    text: &str,
) -> Result<bool> {
    if text.trim().is_empty() {
        warn!("No response content generated");
        return Ok(false);
    }

    new_message.reply(&ctx.http, text).await?;
    info!(
        "Replied to {} in channel {}: {}",
        new_message.author.tag(),
        new_message.channel_id,
        text
    );
    Ok(true)
}
