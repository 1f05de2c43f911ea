use std::env;
use std::str::FromStr;
use std::time::Duration;

use log::{debug, error, info};

use crate::error::{BotError, Result};

const DEFAULT_FOLLOW_UP_TIMEOUT_SECONDS: u64 = 60;
const DEFAULT_FOLLOW_UP_MAX_MESSAGES: usize = 3;
const DEFAULT_JUDGMENT_TIMEOUT_SECONDS: u64 = 30;

/// Prompt used when `FOLLOW_UP_PROMPT` is not set.
pub const DEFAULT_FOLLOW_UP_PROMPT: &str = "You are a Discord bot that replied in a conversation a \
moment ago. Below are the messages people sent after your reply. Decide whether you should \
proactively say something more.\n\
Answer on the first line with exactly YES or NO. If YES, write the message you would send on \
the following lines.\n\n\
Conversation:\n{context}";

#[derive(Debug, Clone)]
pub struct Config {
    pub discord_token: String,
    pub openrouter_api_key: String,
    pub openrouter_model: String,
    pub system_prompt: String,
    pub follow_up: FollowUpSettings,
}

/// Follow-up tracking options.
///
/// A copy is handed to every session when it starts, so changing these never
/// affects a session that is already running.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FollowUpSettings {
    pub enabled: bool,
    /// Window after which a session expires. Zero disables time-based expiry.
    pub timeout: Duration,
    /// Messages buffered before a decision is requested. Zero disables
    /// count-based triggering.
    pub max_messages: usize,
    pub prompt: String,
    pub model: String,
    /// Upper bound on a single call to the judgment service. Zero means no
    /// limit.
    pub judgment_timeout: Duration,
}

impl FollowUpSettings {
    /// Whether `StartTracking` should create a session at all.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.enabled && (!self.timeout.is_zero() || self.max_messages > 0)
    }

    fn from_env(default_model: &str) -> Result<Self> {
        let enabled = match env::var("FOLLOW_UP_ENABLED") {
            Ok(raw) => parse_bool("FOLLOW_UP_ENABLED", &raw)?,
            Err(_) => false,
        };
        let timeout = Duration::from_secs(parse_or(
            "FOLLOW_UP_TIMEOUT_SECONDS",
            DEFAULT_FOLLOW_UP_TIMEOUT_SECONDS,
        )?);
        let max_messages = parse_or("FOLLOW_UP_MAX_MESSAGES", DEFAULT_FOLLOW_UP_MAX_MESSAGES)?;
        let judgment_timeout = Duration::from_secs(parse_or(
            "FOLLOW_UP_JUDGMENT_TIMEOUT_SECONDS",
            DEFAULT_JUDGMENT_TIMEOUT_SECONDS,
        )?);
        let prompt =
            env::var("FOLLOW_UP_PROMPT").unwrap_or_else(|_| DEFAULT_FOLLOW_UP_PROMPT.to_string());
        let model = env::var("FOLLOW_UP_MODEL").unwrap_or_else(|_| default_model.to_string());

        Ok(Self {
            enabled,
            timeout,
            max_messages,
            prompt,
            model,
            judgment_timeout,
        })
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        debug!("Loading configuration from environment");
        dotenvy::dotenv().ok();

        let discord_token = env::var("DISCORD_TOKEN").map_err(|e| {
            error!("Failed to load DISCORD_TOKEN from environment: {e}");
            e
        })?;

        let openrouter_api_key = env::var("OPENROUTER_API_KEY").map_err(|e| {
            error!("Failed to load OPENROUTER_API_KEY from environment: {e}");
            e
        })?;

        let openrouter_model = env::var("OPENROUTER_MODEL").map_err(|e| {
            error!("Failed to load OPENROUTER_MODEL from environment: {e}");
            e
        })?;

        let system_prompt = env::var("SYSTEM_PROMPT").map_err(|e| {
            error!("Failed to load SYSTEM_PROMPT from environment: {e}");
            e
        })?;

        let follow_up = FollowUpSettings::from_env(&openrouter_model).map_err(|e| {
            error!("Invalid follow-up configuration: {e}");
            e
        })?;

        info!("Configuration loaded successfully");
        debug!("Discord token length: {} characters", discord_token.len());
        debug!(
            "OpenRouter API key length: {} characters",
            openrouter_api_key.len()
        );
        debug!("OpenRouter model: {openrouter_model}");
        debug!("System prompt length: {} characters", system_prompt.len());
        debug!(
            "Follow-up: enabled={}, timeout={}s, max_messages={}, model={}",
            follow_up.enabled,
            follow_up.timeout.as_secs(),
            follow_up.max_messages,
            follow_up.model
        );

        Ok(Self {
            discord_token,
            openrouter_api_key,
            openrouter_model,
            system_prompt,
            follow_up,
        })
    }
}

fn parse_or<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|e| BotError::Config(format!("{key}={raw:?}: {e}"))),
        Err(_) => Ok(default),
    }
}

fn parse_bool(key: &str, raw: &str) -> Result<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        _ => Err(BotError::Config(format!(
            "{key}={raw:?}: expected a boolean"
        ))),
    }
}
