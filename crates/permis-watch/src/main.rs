//! Main entry point for the exam-slot watcher.
//! Wires the login flow, scanner, and notification channels together and
//! runs either a single scan or the long-lived watch loop.

use std::sync::Arc;

use clap::Parser;
use exam_scan::{
    AcquirerConfig, BookingClient, BrowserOptions, HeadlessLoginFactory, ScanOrchestrator,
    ScanPacing, SessionAcquirer, SessionStore, ShutdownFlag, SnapshotWriter, TwoCaptchaSolver,
    WatchError, WatchExit, Watcher,
};
use notification_services::Notifier;

mod config;
use config::AppConfig;

/// Watch the driving-exam booking portal for available slots.
#[derive(Parser)]
#[command(name = "permis-watch", version, about)]
struct Cli {
    /// Keep scanning on an interval instead of running a single scan
    #[arg(short, long)]
    watch: bool,

    /// Run the login browser with a visible window and leave it open
    #[arg(long)]
    debug_browser: bool,
}

fn build_watcher(
    config: &AppConfig,
    cli: &Cli,
    shutdown: Arc<ShutdownFlag>,
) -> Result<Watcher, WatchError> {
    let solver = Arc::new(TwoCaptchaSolver::new(config.captcha_api_key.clone())?);
    let factory = Arc::new(HeadlessLoginFactory::new(BrowserOptions {
        headless: !cli.debug_browser,
        keep_open: cli.debug_browser,
        ..Default::default()
    }));
    let acquirer = Arc::new(SessionAcquirer::new(
        factory,
        solver,
        AcquirerConfig {
            username: config.username.clone(),
            password: config.password.clone(),
            diagnostics_dir: config.data_dir.clone(),
        },
    ));
    let sessions = Arc::new(SessionStore::new(
        config.data_dir.join("cookies_session.json"),
        acquirer,
    ));

    let api = Arc::new(BookingClient::new()?);
    let scanner = Arc::new(ScanOrchestrator::new(
        api,
        config.filters.clone(),
        ScanPacing::default(),
    ));

    let notifier = Arc::new(
        Notifier::new(config.notifier.clone())
            .map_err(|e| WatchError::Config(format!("Notification setup failed: {}", e)))?,
    );
    if !notifier.is_enabled() {
        log::warn!("⚠️ No notification channel configured, slots will only be logged");
    }

    Ok(Watcher::new(
        sessions,
        scanner,
        notifier,
        SnapshotWriter::new(&config.data_dir),
        config.watcher.clone(),
        shutdown,
    ))
}

#[tokio::main]
async fn main() {
    // Load environment variables
    dotenvy::dotenv().ok();

    // Initialize logger
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));

    let cli = Cli::parse();

    let config = match AppConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            log::error!("❌ Configuration error: {}", e);
            std::process::exit(1);
        }
    };

    log::info!(
        "🚀 Starting exam-slot watcher: {} permis type(s) x {} departement(s)",
        config.filters.permis_types.len(),
        config.filters.departements.len()
    );

    let shutdown = ShutdownFlag::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                log::info!("Interrupt received, finishing the current step...");
                shutdown.trigger();
            }
        });
    }

    let watcher = match build_watcher(&config, &cli, shutdown) {
        Ok(watcher) => watcher,
        Err(e) => {
            log::error!("❌ Startup failed: {}", e);
            std::process::exit(1);
        }
    };

    if cli.watch {
        match watcher.watch().await {
            Ok(WatchExit::ShutdownRequested) => {
                log::info!("👋 Watcher stopped cleanly");
            }
            Ok(WatchExit::RetriesExhausted) => {
                log::error!("❌ Giving up after repeated authentication failures");
                std::process::exit(1);
            }
            Err(e) => {
                log::error!("❌ Watcher failed: {}", e);
                std::process::exit(1);
            }
        }
    } else {
        match watcher.run_once().await {
            Ok(slots) if slots.is_empty() => {
                log::info!("No available slot found");
            }
            Ok(slots) => {
                log::info!("✅ {} available slot(s) found", slots.len());
            }
            Err(e) => {
                log::error!("❌ Scan failed: {}", e);
                std::process::exit(1);
            }
        }
    }
}
