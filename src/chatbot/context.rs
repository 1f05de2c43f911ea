//! Dynamic context building for system prompts.

use std::fmt::Write;

use chrono::Utc;
use poise::serenity_prelude::Message as SerenityMessage;

/// Builds the per-message context block prepended to the system prompt.
pub fn build_dynamic_context(message: &SerenityMessage) -> String {
    let timestamp = Utc::now().format("%Y-%m-%d %H:%M:%S UTC");
    let user = &message.author;
    let username = user.global_name.as_ref().unwrap_or(&user.name);

    let mut context = String::from(
        "You are a Discord bot. Users talk to you by mentioning you; after you answer you may \
         keep an eye on the channel and chime in again if the conversation calls for it.",
    );
    let _ = write!(context, "\nCurrent datetime: {timestamp}");
    let _ = write!(context, "\nUser: {} (ID: {})", username, user.id);

    match message.guild_id {
        Some(guild_id) => {
            let _ = write!(context, "\nServer ID: {guild_id}");
        }
        None => context.push_str("\nThis is a direct message."),
    }
    let _ = write!(context, "\nChannel ID: {}", message.channel_id);

    let others: Vec<String> = message
        .mentions
        .iter()
        .filter(|mentioned| !mentioned.bot)
        .map(|mentioned| {
            let display = mentioned.global_name.as_ref().unwrap_or(&mentioned.name);
            format!("- {} (mention: <@{}>)", display, mentioned.id)
        })
        .collect();
    if !others.is_empty() {
        context.push_str("\n\nUsers mentioned in this message:\n");
        context.push_str(&others.join("\n"));
    }

    context
}
