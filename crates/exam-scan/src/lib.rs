//! # Exam Scan
//!
//! This crate provides the core machinery for watching the driving-exam
//! booking portal: captcha-assisted login, session caching, scanning the
//! configured filter grid for available slots, and snapshot persistence.

/// Shared types for sessions, slots, and scan filters
mod scan_types;
pub use scan_types::*;

/// Turnstile challenge solving through the 2Captcha HTTP API
mod captcha;
pub use captcha::*;

/// Headless-browser login flow
mod browser;
pub use browser::*;

/// Full login orchestration producing a raw cookie jar
mod acquirer;
pub use acquirer::*;

/// File-backed session cache with TTL handling
mod session_store;
pub use session_store::*;

/// Authenticated booking API client
mod booking_client;
pub use booking_client::*;

/// Grid scanning and slot normalization
mod orchestrator;
pub use orchestrator::*;

/// Snapshot file persistence
mod snapshot;
pub use snapshot::*;

/// Long-lived watch loop and shutdown signalling
mod watcher;
pub use watcher::*;
