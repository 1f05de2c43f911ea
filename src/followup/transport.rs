//! Outbound side of the chat transport.

use std::sync::Arc;

use async_trait::async_trait;
use log::info;
use poise::serenity_prelude::{ChannelId, Http};

use crate::error::Result;
use crate::types::ConversationId;

/// Delivers follow-up messages into a conversation.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, conversation_id: ConversationId, content: String) -> Result<()>;
}

/// Posts follow-ups into Discord channels.
pub struct DiscordTransport {
    http: Arc<Http>,
}

impl DiscordTransport {
    pub fn new(http: Arc<Http>) -> Self {
        Self { http }
    }
}

#[async_trait]
impl Transport for DiscordTransport {
    async fn send(&self, conversation_id: ConversationId, content: String) -> Result<()> {
        let channel_id = ChannelId::new(conversation_id.target_channel());
        channel_id.say(&self.http, &content).await?;
        info!("Sent follow-up in channel {channel_id}: {content}");
        Ok(())
    }
}
