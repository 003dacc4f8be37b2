use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{Datelike, NaiveDate};
use exam_scan::ExamSlot;
use reqwest::Client;
use serde_json::{Value, json};

use crate::types::*;

/// Twilio rejects message bodies longer than this.
pub const SMS_MAX_CHARS: usize = 1600;

/// Discord caps embeds at this many fields.
pub const DISCORD_MAX_FIELDS: usize = 10;

const WEEKDAYS_FR: [&str; 7] = [
    "lundi", "mardi", "mercredi", "jeudi", "vendredi", "samedi", "dimanche",
];

const MONTHS_FR: [&str; 12] = [
    "janvier",
    "février",
    "mars",
    "avril",
    "mai",
    "juin",
    "juillet",
    "août",
    "septembre",
    "octobre",
    "novembre",
    "décembre",
];

/// Format a date the way the portal displays them, e.g. "mardi 1 septembre 2026".
pub fn format_date_fr(date: NaiveDate) -> String {
    format!(
        "{} {} {} {}",
        WEEKDAYS_FR[date.weekday().num_days_from_monday() as usize],
        date.day(),
        MONTHS_FR[date.month0() as usize],
        date.year()
    )
}

/// Group slots by département code, in code order.
pub fn group_by_departement(slots: &[ExamSlot]) -> BTreeMap<&str, Vec<&ExamSlot>> {
    let mut groups: BTreeMap<&str, Vec<&ExamSlot>> = BTreeMap::new();
    for slot in slots {
        groups.entry(slot.departement.as_str()).or_default().push(slot);
    }
    groups
}

fn slot_line(slot: &ExamSlot) -> String {
    let place = match &slot.ville {
        Some(ville) => format!("{} ({})", slot.centre, ville),
        None => slot.centre.clone(),
    };
    format!(
        "📍 {} — {} à {} (permis {})",
        place,
        format_date_fr(slot.date),
        slot.horaire,
        slot.permis_type
    )
}

/// Plain-text summary shared by the SMS channel and log output.
pub fn text_message(slots: &[ExamSlot]) -> String {
    let mut lines = vec![format!(
        "🚨 {} place(s) d'examen disponible(s) !",
        slots.len()
    )];

    for (dept, group) in group_by_departement(slots) {
        lines.push(format!("\nDépartement {} :", dept));
        for slot in group {
            lines.push(slot_line(slot));
        }
    }

    let mut message = lines.join("\n");
    if message.chars().count() > SMS_MAX_CHARS {
        let truncated: String = message.chars().take(SMS_MAX_CHARS - 1).collect();
        message = format!("{}…", truncated);
    }
    message
}

/// HTML message for Telegram's `parse_mode=HTML`.
pub fn telegram_message(slots: &[ExamSlot]) -> String {
    let mut lines = vec![format!(
        "🚨 <b>{} place(s) d'examen disponible(s) !</b>",
        slots.len()
    )];

    for (dept, group) in group_by_departement(slots) {
        lines.push(format!("\n<b>Département {}</b>", dept));
        for slot in group {
            lines.push(slot_line(slot));
        }
    }

    lines.join("\n")
}

/// Webhook payload with one embed field per département, capped at Discord's
/// field limit with an overflow note.
pub fn discord_payload(slots: &[ExamSlot]) -> Value {
    let groups = group_by_departement(slots);
    let mut fields: Vec<Value> = Vec::new();

    for (dept, group) in groups.iter().take(DISCORD_MAX_FIELDS) {
        let value: String = group
            .iter()
            .map(|s| slot_line(s))
            .collect::<Vec<_>>()
            .join("\n");
        fields.push(json!({
            "name": format!("Département {}", dept),
            "value": value,
        }));
    }

    if groups.len() > DISCORD_MAX_FIELDS {
        let hidden = groups.len() - DISCORD_MAX_FIELDS + 1;
        if let Some(last) = fields.last_mut() {
            *last = json!({
                "name": "…",
                "value": format!("et {} autre(s) département(s)", hidden),
            });
        }
    }

    json!({
        "embeds": [{
            "title": format!("🚨 {} place(s) d'examen disponible(s) !", slots.len()),
            "color": 0x2ECC71,
            "fields": fields,
        }]
    })
}

/// Telegram Bot API sender.
pub struct TelegramChannel {
    client: Client,
    config: TelegramConfig,
}

impl TelegramChannel {
    /// Create a sender over an existing HTTP client.
    pub fn new(client: Client, config: TelegramConfig) -> Self {
        Self { client, config }
    }

    /// Send the message to every configured chat, pausing between recipients
    /// to stay under the Bot API rate limit.
    pub async fn send(&self, html: &str) -> Result<(), NotificationError> {
        let url = format!(
            "https://api.telegram.org/bot{}/sendMessage",
            self.config.bot_token
        );

        for (i, chat_id) in self.config.chat_ids.iter().enumerate() {
            if i > 0 {
                tokio::time::sleep(Duration::from_secs(1)).await;
            }

            let response = self
                .client
                .post(&url)
                .json(&json!({
                    "chat_id": chat_id,
                    "text": html,
                    "parse_mode": "HTML",
                    "disable_web_page_preview": true,
                }))
                .send()
                .await
                .map_err(|e| NotificationError::TelegramError(e.to_string()))?;

            if !response.status().is_success() {
                let body = response.text().await.unwrap_or_default();
                return Err(NotificationError::TelegramError(format!(
                    "sendMessage to {} failed: {}",
                    chat_id, body
                )));
            }

            log::info!("Telegram notification sent to chat {}", chat_id);
        }

        Ok(())
    }
}

/// Discord webhook sender.
pub struct DiscordChannel {
    client: Client,
    config: DiscordConfig,
}

impl DiscordChannel {
    /// Create a sender over an existing HTTP client.
    pub fn new(client: Client, config: DiscordConfig) -> Self {
        Self { client, config }
    }

    /// Post the embed payload to the webhook.
    pub async fn send(&self, payload: &Value) -> Result<(), NotificationError> {
        let response = self
            .client
            .post(&self.config.webhook_url)
            .json(payload)
            .send()
            .await
            .map_err(|e| NotificationError::DiscordError(e.to_string()))?;

        if !response.status().is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(NotificationError::DiscordError(format!(
                "Webhook rejected the payload: {}",
                body
            )));
        }

        log::info!("Discord notification sent");
        Ok(())
    }
}

/// Twilio SMS sender.
pub struct TwilioChannel {
    client: Client,
    config: TwilioConfig,
}

impl TwilioChannel {
    /// Create a sender over an existing HTTP client.
    pub fn new(client: Client, config: TwilioConfig) -> Self {
        Self { client, config }
    }

    /// Send the message to every configured number, pausing between
    /// recipients.
    pub async fn send(&self, body: &str) -> Result<(), NotificationError> {
        let url = format!(
            "https://api.twilio.com/2010-04-01/Accounts/{}/Messages.json",
            self.config.account_sid
        );

        for (i, to) in self.config.to_numbers.iter().enumerate() {
            if i > 0 {
                tokio::time::sleep(Duration::from_secs(1)).await;
            }

            let response = self
                .client
                .post(&url)
                .basic_auth(&self.config.account_sid, Some(&self.config.auth_token))
                .form(&[
                    ("To", to.as_str()),
                    ("From", self.config.from_number.as_str()),
                    ("Body", body),
                ])
                .send()
                .await
                .map_err(|e| NotificationError::TwilioError(e.to_string()))?;

            if !response.status().is_success() {
                let text = response.text().await.unwrap_or_default();
                return Err(NotificationError::TwilioError(format!(
                    "SMS to {} failed: {}",
                    to, text
                )));
            }

            log::info!("SMS notification sent to {}", to);
        }

        Ok(())
    }
}
