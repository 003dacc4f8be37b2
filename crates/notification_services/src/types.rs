/// Types for notification channels (Telegram, Discord, SMS).
#[derive(Debug, thiserror::Error)]
pub enum NotificationError {
    /// Telegram Bot API errors.
    #[error("Telegram error: {0}")]
    TelegramError(String),

    /// Discord webhook errors.
    #[error("Discord error: {0}")]
    DiscordError(String),

    /// Twilio SMS API errors.
    #[error("Twilio error: {0}")]
    TwilioError(String),
}

/// Telegram Bot API credentials and recipients.
#[derive(Debug, Clone)]
pub struct TelegramConfig {
    /// Bot token issued by BotFather
    pub bot_token: String,
    /// Chat ids to message
    pub chat_ids: Vec<String>,
}

/// Discord webhook target.
#[derive(Debug, Clone)]
pub struct DiscordConfig {
    /// Full webhook URL
    pub webhook_url: String,
}

/// Twilio SMS credentials and recipients.
#[derive(Debug, Clone)]
pub struct TwilioConfig {
    /// Account SID
    pub account_sid: String,
    /// Auth token
    pub auth_token: String,
    /// Sending number, E.164
    pub from_number: String,
    /// Recipient numbers, E.164
    pub to_numbers: Vec<String>,
}

/// Which channels are enabled; a channel with no config stays silent.
#[derive(Debug, Clone, Default)]
pub struct NotifierConfig {
    /// Telegram channel, when configured
    pub telegram: Option<TelegramConfig>,
    /// Discord channel, when configured
    pub discord: Option<DiscordConfig>,
    /// Twilio SMS channel, when configured
    pub twilio: Option<TwilioConfig>,
}

impl NotifierConfig {
    /// Whether at least one channel is configured.
    pub fn any_enabled(&self) -> bool {
        self.telegram.is_some() || self.discord.is_some() || self.twilio.is_some()
    }
}
