use std::path::PathBuf;
use std::time::Duration;

use exam_scan::{ScanFilters, WatchError, WatcherConfig, all_departements};
use notification_services::{DiscordConfig, NotifierConfig, TelegramConfig, TwilioConfig};

/// Everything the watcher needs, assembled from environment variables.
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Portal account username
    pub username: String,
    /// Portal account password
    pub password: String,
    /// 2Captcha API key
    pub captcha_api_key: String,
    /// Filter grid to scan
    pub filters: ScanFilters,
    /// Watch-loop timing and retry knobs
    pub watcher: WatcherConfig,
    /// Where the session cache, snapshot, and diagnostics dumps land
    pub data_dir: PathBuf,
    /// Notification channels
    pub notifier: NotifierConfig,
}

fn parse_list(raw: &str, wildcard: impl FnOnce() -> Vec<String>) -> Vec<String> {
    if raw.trim() == "*" {
        return wildcard();
    }
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

fn parse_bool(raw: &str) -> bool {
    matches!(raw.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes")
}

impl AppConfig {
    /// Read the configuration from process environment variables.
    pub fn from_env() -> Result<Self, WatchError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read the configuration through an arbitrary variable lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, WatchError> {
        let username = lookup("PDC_USERNAME")
            .filter(|v| !v.is_empty())
            .ok_or_else(|| WatchError::Config("PDC_USERNAME is not set".to_string()))?;
        let password = lookup("PDC_PASSWORD")
            .filter(|v| !v.is_empty())
            .ok_or_else(|| WatchError::Config("PDC_PASSWORD is not set".to_string()))?;
        let captcha_api_key = lookup("CAPTCHA_API_KEY")
            .filter(|v| !v.is_empty())
            .ok_or_else(|| WatchError::Config("CAPTCHA_API_KEY is not set".to_string()))?;

        let all_permis = || {
            exam_scan::ALL_PERMIS_TYPES
                .iter()
                .map(|s| s.to_string())
                .collect()
        };
        let permis_types = lookup("PDC_PERMIS_TYPES")
            .map(|raw| parse_list(&raw, all_permis))
            .unwrap_or_else(all_permis);
        let departements = lookup("PDC_DEPARTEMENTS")
            .map(|raw| parse_list(&raw, all_departements))
            .unwrap_or_else(|| vec!["075".to_string()]);

        if permis_types.is_empty() || departements.is_empty() {
            return Err(WatchError::Config(
                "The scan filters resolve to an empty grid".to_string(),
            ));
        }

        let filters = ScanFilters {
            permis_types,
            departements,
            scan_par_centre: lookup("PDC_SCAN_PAR_CENTRE")
                .map(|raw| parse_bool(&raw))
                .unwrap_or(false),
        };

        let mut watcher = WatcherConfig::default();
        if let Some(raw) = lookup("PDC_INTERVAL_MINUTES") {
            let minutes: u64 = raw.trim().parse().map_err(|_| {
                WatchError::Config(format!("PDC_INTERVAL_MINUTES is not a number: {raw}"))
            })?;
            watcher.scan_interval = Duration::from_secs(minutes * 60);
        }
        if let Some(raw) = lookup("PDC_MAX_RETRIES") {
            watcher.max_retries = raw.trim().parse().map_err(|_| {
                WatchError::Config(format!("PDC_MAX_RETRIES is not a number: {raw}"))
            })?;
        }

        let data_dir = lookup("PDC_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."));

        Ok(Self {
            username,
            password,
            captcha_api_key,
            filters,
            watcher,
            data_dir,
            notifier: Self::notifier_from_lookup(&lookup),
        })
    }

    /// A channel is enabled only when its full credential set is present.
    fn notifier_from_lookup(lookup: &impl Fn(&str) -> Option<String>) -> NotifierConfig {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let telegram = match (non_empty("TELEGRAM_BOT_TOKEN"), non_empty("TELEGRAM_CHAT_IDS")) {
            (Some(bot_token), Some(raw_ids)) => {
                let chat_ids = parse_list(&raw_ids, Vec::new);
                (!chat_ids.is_empty()).then_some(TelegramConfig {
                    bot_token,
                    chat_ids,
                })
            }
            _ => None,
        };

        let discord = non_empty("DISCORD_WEBHOOK_URL").map(|webhook_url| DiscordConfig {
            webhook_url,
        });

        let twilio = match (
            non_empty("TWILIO_ACCOUNT_SID"),
            non_empty("TWILIO_AUTH_TOKEN"),
            non_empty("TWILIO_FROM_NUMBER"),
            non_empty("TWILIO_TO_NUMBERS"),
        ) {
            (Some(account_sid), Some(auth_token), Some(from_number), Some(raw_to)) => {
                let to_numbers = parse_list(&raw_to, Vec::new);
                (!to_numbers.is_empty()).then_some(TwilioConfig {
                    account_sid,
                    auth_token,
                    from_number,
                    to_numbers,
                })
            }
            _ => None,
        };

        NotifierConfig {
            telegram,
            discord,
            twilio,
        }
    }
}
