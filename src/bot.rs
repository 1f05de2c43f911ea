//! Discord bot core logic and event handling.

use std::error::Error as StdError;
use std::sync::{Arc, OnceLock};

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use poise::{
    Framework, FrameworkOptions,
    serenity_prelude::{ClientBuilder, Context, FullEvent, GatewayIntents, Message as SerenityMessage},
};

use crate::chatbot::handle_bot_mention;
use crate::config::{Config, FollowUpSettings};
use crate::error::{BotError, Result};
use crate::followup::{
    DiscordTransport, OpenRouterGateway, StartOutcome, TerminationReason, TrackerRegistry,
};
use crate::openrouter::OpenRouterClient;
use crate::types::{ConversationId, TrackedMessage};

type EventResult = std::result::Result<(), Box<dyn StdError + Send + Sync>>;

struct Data {
    openrouter_client: Arc<OpenRouterClient>,
    tracker: TrackerRegistry,
    follow_up: FollowUpSettings,
}

/// Run the Discord bot.
pub async fn run() -> Result<()> {
    info!("Initializing bot");
    let config = Config::from_env()?;

    debug!("Initializing OpenRouter client");
    let openrouter_client = Arc::new(OpenRouterClient::new(
        config.openrouter_api_key.clone(),
        config.openrouter_model.clone(),
        config.system_prompt.clone(),
    ));

    debug!("Setting up gateway intents");
    let intents = GatewayIntents::non_privileged() | GatewayIntents::MESSAGE_CONTENT;

    // The tracker posts through the client's own HTTP handle, which only
    // exists once the framework is set up.
    let tracker_slot: Arc<OnceLock<TrackerRegistry>> = Arc::new(OnceLock::new());
    let setup_slot = Arc::clone(&tracker_slot);
    let follow_up = config.follow_up.clone();

    debug!("Building framework");
    let framework = Framework::builder()
        .options(FrameworkOptions {
            event_handler: |ctx, event, _framework, data| Box::pin(event_handler(ctx, event, data)),
            ..Default::default()
        })
        .setup(move |ctx, _ready, _framework| {
            Box::pin(async move {
                info!("Bot is ready and connected to Discord");
                debug!("Initializing follow-up tracker");
                let tracker = setup_slot
                    .get_or_init(|| {
                        TrackerRegistry::new(
                            Arc::new(OpenRouterGateway::new(Arc::clone(&openrouter_client))),
                            Arc::new(DiscordTransport::new(Arc::clone(&ctx.http))),
                        )
                    })
                    .clone();
                Ok(Data {
                    openrouter_client,
                    tracker,
                    follow_up,
                })
            })
        })
        .build();

    debug!("Creating Discord client");
    let mut client = ClientBuilder::new(&config.discord_token, intents)
        .framework(framework)
        .await?;

    info!("Starting Discord client");

    let outcome = tokio::select! {
        result = client.start() => result.map_err(BotError::from),
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received, shutting down...");
            Ok(())
        }
    };

    if let Some(tracker) = tracker_slot.get() {
        tracker.shutdown().await;
    }
    outcome
}

async fn event_handler(ctx: &Context, event: &FullEvent, data: &Data) -> EventResult {
    match event {
        FullEvent::Message { new_message } => handle_message(ctx, new_message, data).await?,
        FullEvent::ChannelDelete { channel, .. } => {
            data.tracker
                .terminate(
                    ConversationId::new(channel.id.get()),
                    TerminationReason::ConversationClosed,
                )
                .await;
        }
        FullEvent::ThreadDelete { thread, .. } => {
            data.tracker
                .terminate(
                    ConversationId::new(thread.parent_id.get()).with_thread(thread.id.get()),
                    TerminationReason::ConversationClosed,
                )
                .await;
        }
        _ => {}
    }
    Ok(())
}

/// Where an incoming message goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Route {
    /// The bot's own messages.
    Ignore,
    /// Addressed to the bot: answered directly, never buffered for a follow-up.
    Reply,
    /// Everything else is fed to the follow-up tracker.
    Track,
}

fn route(from_bot: bool, mentions_bot: bool) -> Route {
    if from_bot {
        Route::Ignore
    } else if mentions_bot {
        Route::Reply
    } else {
        Route::Track
    }
}

async fn handle_message(ctx: &Context, new_message: &SerenityMessage, data: &Data) -> Result<()> {
    let bot_user_id = ctx.cache.current_user().id;
    let conversation_id = conversation_of(ctx, new_message);

    match route(
        new_message.author.id == bot_user_id,
        new_message.mentions_user_id(bot_user_id),
    ) {
        Route::Ignore => {}
        Route::Track => {
            let author = &new_message.author;
            let sender_name = author.global_name.as_ref().unwrap_or(&author.name).clone();
            let message = TrackedMessage::at(
                author.id.get(),
                sender_name,
                new_message.content.as_str(),
                sent_at(new_message.timestamp.to_rfc3339().as_deref()),
            );
            data.tracker
                .on_incoming_message(conversation_id, message)
                .await;
        }
        Route::Reply => {
            let replied =
                handle_bot_mention(ctx, new_message, &data.openrouter_client, bot_user_id).await?;
            if replied
                && let StartOutcome::AlreadyTracking(state) =
                    data.tracker.start_tracking(conversation_id, &data.follow_up).await
            {
                debug!("Conversation {conversation_id} already tracked ({state})");
            }
        }
    }

    Ok(())
}

/// Threads are scoped under their parent channel when the cache knows them.
fn conversation_of(ctx: &Context, message: &SerenityMessage) -> ConversationId {
    let parent = message.guild_id.and_then(|guild_id| {
        let guild = ctx.cache.guild(guild_id)?;
        guild
            .threads
            .iter()
            .find(|thread| thread.id == message.channel_id)
            .and_then(|thread| thread.parent_id)
    });
    match parent {
        Some(parent) => ConversationId::new(parent.get()).with_thread(message.channel_id.get()),
        None => ConversationId::new(message.channel_id.get()),
    }
}

/// Discord's own send time for a message, falling back to the receive time.
fn sent_at(rfc3339: Option<&str>) -> DateTime<Utc> {
    match rfc3339.map(DateTime::parse_from_rfc3339) {
        Some(Ok(timestamp)) => timestamp.with_timezone(&Utc),
        Some(Err(e)) => {
            warn!("Unparseable message timestamp: {e}");
            Utc::now()
        }
        None => Utc::now(),
    }
}
