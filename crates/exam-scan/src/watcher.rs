use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::time::sleep;
use tracing::{error, info, warn};

use crate::orchestrator::ScanRunner;
use crate::scan_types::{ExamSlot, ScanOutcome, SessionCredentials, WatchError};
use crate::session_store::SessionProvider;
use crate::snapshot::SnapshotWriter;

/// Fans a batch of freshly found slots out to the configured channels.
#[async_trait]
pub trait SlotNotifier: Send + Sync {
    /// Deliver the slots. Delivery is best effort; implementations log their
    /// own failures instead of propagating them into the watch loop.
    async fn notify_slots(&self, slots: &[ExamSlot]);
}

/// Cooperative shutdown signal shared between the watch loop and the signal
/// handler task.
pub struct ShutdownFlag {
    flag: AtomicBool,
    notify: Notify,
}

impl ShutdownFlag {
    /// Create an untriggered flag.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            flag: AtomicBool::new(false),
            notify: Notify::new(),
        })
    }

    /// Request shutdown and wake every waiter.
    pub fn trigger(&self) {
        self.flag.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    /// Whether shutdown has been requested.
    pub fn is_triggered(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Wait until shutdown is requested.
    pub async fn wait(&self) {
        loop {
            let notified = self.notify.notified();
            if self.is_triggered() {
                return;
            }
            notified.await;
        }
    }
}

/// Timing and retry knobs for the watch loop.
#[derive(Debug, Clone)]
pub struct WatcherConfig {
    /// Pause between full scans (default: 60 minutes)
    pub scan_interval: Duration,
    /// Pause before re-authenticating after a rejected session (default: 5 minutes)
    pub reauth_cooldown: Duration,
    /// Consecutive errors tolerated before giving up (default: 3)
    pub max_retries: u32,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            scan_interval: Duration::from_secs(60 * 60),
            reauth_cooldown: Duration::from_secs(5 * 60),
            max_retries: 3,
        }
    }
}

/// Why the watch loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchExit {
    /// A shutdown was requested and honored
    ShutdownRequested,
    /// The consecutive-error budget was exhausted
    RetriesExhausted,
}

/// Long-lived loop: scan, publish, sleep, and re-authenticate as needed.
pub struct Watcher {
    sessions: Arc<dyn SessionProvider>,
    scanner: Arc<dyn ScanRunner>,
    notifier: Arc<dyn SlotNotifier>,
    snapshot: SnapshotWriter,
    config: WatcherConfig,
    shutdown: Arc<ShutdownFlag>,
}

impl Watcher {
    /// Wire a watcher over its collaborators.
    pub fn new(
        sessions: Arc<dyn SessionProvider>,
        scanner: Arc<dyn ScanRunner>,
        notifier: Arc<dyn SlotNotifier>,
        snapshot: SnapshotWriter,
        config: WatcherConfig,
        shutdown: Arc<ShutdownFlag>,
    ) -> Self {
        Self {
            sessions,
            scanner,
            notifier,
            snapshot,
            config,
            shutdown,
        }
    }

    /// Sleep for `duration`, returning early when shutdown is requested.
    /// Returns true when the sleep was interrupted.
    async fn sleep_or_shutdown(&self, duration: Duration) -> bool {
        tokio::select! {
            _ = sleep(duration) => false,
            _ = self.shutdown.wait() => true,
        }
    }

    /// Persist the snapshot and notify; cycles that found nothing change
    /// neither the snapshot nor the channels.
    async fn publish(&self, slots: &[ExamSlot]) -> Result<(), WatchError> {
        if slots.is_empty() {
            return Ok(());
        }
        self.snapshot.write(slots).await?;
        self.notifier.notify_slots(slots).await;
        Ok(())
    }

    /// Force a fresh login right away. Each failed attempt counts against
    /// the error budget and is followed by a cooldown before the next try;
    /// re-scanning with cookies the API already rejected is never an option.
    /// Returns `None` when the budget runs out or shutdown hits.
    async fn reauthenticate(&self, failures: &mut u32) -> Option<SessionCredentials> {
        loop {
            match self.sessions.load(true).await {
                Ok(Some(session)) => return Some(session),
                Ok(None) => {
                    *failures += 1;
                    warn!("Forced re-login failed ({} consecutive)", *failures);
                }
                Err(e) => {
                    *failures += 1;
                    warn!("Forced re-login errored ({} consecutive): {}", *failures, e);
                }
            }

            if *failures >= self.config.max_retries {
                error!(
                    "{} consecutive error(s), giving up",
                    self.config.max_retries
                );
                return None;
            }

            info!(
                "Waiting {}s before the next login attempt ({}/{})",
                self.config.reauth_cooldown.as_secs(),
                *failures,
                self.config.max_retries
            );
            if self.sleep_or_shutdown(self.config.reauth_cooldown).await {
                return None;
            }
        }
    }

    /// Run scans until shutdown or the consecutive-error budget is exhausted.
    pub async fn watch(&self) -> Result<WatchExit, WatchError> {
        let Some(mut session) = self.sessions.load(false).await? else {
            return Err(WatchError::Config(
                "Could not establish an initial session".to_string(),
            ));
        };

        let mut failures = 0u32;

        loop {
            if self.shutdown.is_triggered() {
                break;
            }

            match self.scanner.scan(&session).await {
                Ok(ScanOutcome::Slots(slots)) => {
                    match self.publish(&slots).await {
                        Ok(()) => failures = 0,
                        Err(e) => {
                            // Publish failures share the retry budget but do
                            // not force a re-login.
                            failures += 1;
                            warn!("Publish failed ({} consecutive): {}", failures, e);
                            if failures >= self.config.max_retries {
                                error!("{} consecutive error(s), giving up", failures);
                                return Ok(WatchExit::RetriesExhausted);
                            }
                        }
                    }

                    info!(
                        "Next scan in {} minute(s)",
                        self.config.scan_interval.as_secs() / 60
                    );
                    if self.sleep_or_shutdown(self.config.scan_interval).await {
                        break;
                    }
                }
                Ok(ScanOutcome::AuthFailure) => {
                    // A rejected session is not counted; only failed
                    // recovery from it is.
                    warn!("Session rejected mid-scan, forcing a fresh login");

                    match self.reauthenticate(&mut failures).await {
                        Some(fresh) => session = fresh,
                        None => {
                            if self.shutdown.is_triggered() {
                                break;
                            }
                            return Ok(WatchExit::RetriesExhausted);
                        }
                    }
                }
                Err(e) => {
                    failures += 1;
                    warn!("Scan cycle failed ({} consecutive): {}", failures, e);
                    if failures >= self.config.max_retries {
                        error!("{} consecutive error(s), giving up", failures);
                        return Ok(WatchExit::RetriesExhausted);
                    }
                    if self.sleep_or_shutdown(self.config.scan_interval).await {
                        break;
                    }
                }
            }
        }

        info!("Shutdown requested, persisting session before exit");
        if let Err(e) = self.sessions.persist(&session).await {
            warn!("Could not persist session on shutdown: {}", e);
        }
        Ok(WatchExit::ShutdownRequested)
    }

    /// One scan, one publication. A rejected session gets a single forced
    /// re-login before the scan is retried.
    pub async fn run_once(&self) -> Result<Vec<ExamSlot>, WatchError> {
        let Some(session) = self.sessions.load(false).await? else {
            return Err(WatchError::Config(
                "Could not establish an initial session".to_string(),
            ));
        };

        let outcome = self.scanner.scan(&session).await?;
        let slots = match outcome {
            ScanOutcome::Slots(slots) => slots,
            ScanOutcome::AuthFailure => {
                warn!("Session rejected, retrying once with a fresh login");
                let Some(fresh) = self.sessions.load(true).await? else {
                    return Err(WatchError::Config(
                        "Re-login failed after the session was rejected".to_string(),
                    ));
                };
                match self.scanner.scan(&fresh).await? {
                    ScanOutcome::Slots(slots) => slots,
                    ScanOutcome::AuthFailure => {
                        return Err(WatchError::SessionRejected(401));
                    }
                }
            }
        };

        self.publish(&slots).await?;
        Ok(slots)
    }
}
