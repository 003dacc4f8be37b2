//! # Notification Services
//!
//! This crate delivers exam-slot alerts over Telegram, Discord, and SMS.
//! It includes message formatting, per-channel senders, and a fan-out
//! service plugged into the watch loop.

/// Message formatting and per-channel senders.
pub mod channels;
/// Fan-out notification service.
pub mod service;
/// Channel configuration and error types.
pub mod types;

pub use channels::{DiscordChannel, TelegramChannel, TwilioChannel};
pub use service::Notifier;
pub use types::{DiscordConfig, NotificationError, NotifierConfig, TelegramConfig, TwilioConfig};
