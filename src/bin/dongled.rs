// ABOUTME: SMS gateway daemon wiring the connection manager, SMS pipeline and notification channels
// ABOUTME: Runs until interrupted, then stops the manager and drains the pipeline

//! # dongled
//!
//! ```bash
//! # Use /etc/dongle-ami/config.toml or ~/.config/dongle-ami/config.toml
//! dongled
//!
//! # Explicit config file, debug logging
//! dongled --config ./config.toml -d
//!
//! # Credentials from the environment
//! ASTERISK_AMI_USERNAME=admin ASTERISK_AMI_PASSWORD=secret dongled
//! ```

use argh::FromArgs;
use dongle_ami::client::{SmsNotification, Status, StatusInfo};
use dongle_ami::config::Config;
use dongle_ami::manager::{ConnectionManager, StatusSubscriber};
use dongle_ami::notify::NotifierRegistry;
use dongle_ami::pipeline::{SmsPipeline, scan_sims};
use dongle_ami::store::MemoryStore;
use std::error::Error;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{Level, debug, error, info};
use tracing_subscriber::FmtSubscriber;

/// SMS gateway daemon for GSM modems behind an Asterisk PBX
#[derive(FromArgs)]
struct CliArgs {
    /// whether or not to enable debugging
    #[argh(switch, short = 'd')]
    debugging: bool,

    /// path to the TOML configuration file
    #[argh(option, short = 'c')]
    config: Option<PathBuf>,
}

/// Logs status snapshots, at info level only when the status changes.
#[derive(Default)]
struct StatusLogger {
    last: Mutex<Option<Status>>,
}

impl StatusSubscriber for StatusLogger {
    fn on_status_update(&self, info: &StatusInfo) {
        let mut last = self.last.lock().unwrap_or_else(PoisonError::into_inner);
        if *last != Some(info.status) {
            info!(
                "PBX status {} (uptime {}s, {} channel(s), {} registration(s))",
                info.status, info.uptime, info.channels, info.registrations
            );
            *last = Some(info.status);
        } else {
            debug!(
                "PBX status {} (uptime {}s, {} channel(s), {} registration(s))",
                info.status, info.uptime, info.channels, info.registrations
            );
        }
    }

    fn on_sms_received(&self, sms: &SmsNotification) {
        debug!("SMS event from {} on {}", sms.sender, sms.device);
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error + Send + Sync>> {
    let cli_args: CliArgs = argh::from_env();

    let subscriber = FmtSubscriber::builder()
        .with_max_level(if cli_args.debugging { Level::DEBUG } else { Level::INFO })
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = Config::load(cli_args.config.as_deref())?;
    info!("Starting dongled against {}", config.ami.address());

    let manager = ConnectionManager::new(config.ami.clone(), config.manager.clone());
    let store = Arc::new(MemoryStore::new());
    let notifiers = NotifierRegistry::from_config(&config.notifications);
    let pipeline = SmsPipeline::from_config(&config.pipeline, store, notifiers, manager.clone());

    manager.subscribe(Arc::new(pipeline.queue()));
    manager.subscribe(Arc::new(StatusLogger::default()));

    // The PBX may still be starting; keep retrying whole rounds until it answers.
    loop {
        tokio::select! {
            result = manager.init() => match result {
                Ok(()) => break,
                Err(e) => {
                    error!("{}; retrying in {:?}", e, config.manager.reconnect_backoff());
                    tokio::time::sleep(config.manager.reconnect_backoff()).await;
                }
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted before connecting");
                manager.shutdown().await;
                pipeline.shutdown().await;
                return Ok(());
            }
        }
    }

    if !config.pipeline.devices.is_empty() {
        let mailbox = manager.clone();
        let queue = pipeline.queue();
        let devices = config.pipeline.devices.clone();
        let recover = config.pipeline.recover_on_startup;
        tokio::spawn(async move {
            let queued = scan_sims(&*mailbox, &devices, &queue, recover).await;
            if queued > 0 {
                info!("Recovered {} SMS from SIM storage", queued);
            }
        });
    }

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    manager.shutdown().await;
    pipeline.shutdown().await;
    Ok(())
}
