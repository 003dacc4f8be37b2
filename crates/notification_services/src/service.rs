use std::time::Duration;

use async_trait::async_trait;
use exam_scan::{ExamSlot, SlotNotifier};
use reqwest::Client;

use crate::channels::*;
use crate::types::*;

/// Fans slot alerts out to every configured channel.
///
/// Channel failures are logged and never stop the other channels or the
/// watch loop; a missed alert is recoverable, a crashed watcher is not.
pub struct Notifier {
    telegram: Option<TelegramChannel>,
    discord: Option<DiscordChannel>,
    twilio: Option<TwilioChannel>,
}

impl Notifier {
    /// Build senders for the configured channels.
    pub fn new(config: NotifierConfig) -> Result<Self, NotificationError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| NotificationError::TelegramError(format!("HTTP client: {}", e)))?;

        Ok(Self {
            telegram: config
                .telegram
                .map(|c| TelegramChannel::new(client.clone(), c)),
            discord: config
                .discord
                .map(|c| DiscordChannel::new(client.clone(), c)),
            twilio: config.twilio.map(|c| TwilioChannel::new(client, c)),
        })
    }

    /// Whether any channel will actually deliver.
    pub fn is_enabled(&self) -> bool {
        self.telegram.is_some() || self.discord.is_some() || self.twilio.is_some()
    }
}

#[async_trait]
impl SlotNotifier for Notifier {
    async fn notify_slots(&self, slots: &[ExamSlot]) {
        if slots.is_empty() {
            return;
        }

        if !self.is_enabled() {
            log::warn!(
                "{} slot(s) found but no notification channel is configured",
                slots.len()
            );
            return;
        }

        if let Some(telegram) = &self.telegram {
            if let Err(e) = telegram.send(&telegram_message(slots)).await {
                log::error!("Telegram delivery failed: {}", e);
            }
        }

        if let Some(discord) = &self.discord {
            if let Err(e) = discord.send(&discord_payload(slots)).await {
                log::error!("Discord delivery failed: {}", e);
            }
        }

        if let Some(twilio) = &self.twilio {
            if let Err(e) = twilio.send(&text_message(slots)).await {
                log::error!("SMS delivery failed: {}", e);
            }
        }
    }
}
