// ABOUTME: One-shot CLI that logs into the manager interface and hands one SMS to the dialplan
// ABOUTME: Connection settings come from a config file, the environment or command-line options

//! # send_sms
//!
//! ```bash
//! send_sms --username admin --password secret \
//!   --device quectel0 --to +8613800000000 --message "Hello from the PBX"
//!
//! # Settings from a config file, overridden by ASTERISK_AMI_* variables
//! send_sms -c /etc/dongle-ami/config.toml --device quectel0 --to 10086 --message "CXYE"
//! ```

use argh::FromArgs;
use dongle_ami::client::DefaultClient;
use dongle_ami::config::Config;
use std::error::Error;
use std::path::PathBuf;
use tracing::{Level, error, info};
use tracing_subscriber::FmtSubscriber;

/// Send one SMS through a modem attached to an Asterisk PBX
#[derive(FromArgs)]
struct CliArgs {
    /// whether or not to enable debugging
    #[argh(switch, short = 'd')]
    debugging: bool,

    /// path to the TOML configuration file
    #[argh(option, short = 'c')]
    config: Option<PathBuf>,

    /// the hostname or IP address of the PBX (default: localhost)
    #[argh(option)]
    host: Option<String>,

    /// the manager interface port (default: 5038)
    #[argh(option, short = 'p')]
    port: Option<u16>,

    /// the manager interface username
    #[argh(option)]
    username: Option<String>,

    /// the manager interface password
    #[argh(option)]
    password: Option<String>,

    /// the modem device to send from, e.g. quectel0
    #[argh(option)]
    device: String,

    /// the recipient telephone number
    #[argh(option, short = 't')]
    to: String,

    /// the message text; line breaks reach the dialplan only through
    /// SMS_MESSAGE_BASE64, SMS_MESSAGE has them replaced by spaces
    #[argh(option, short = 'm')]
    message: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error + Send + Sync>> {
    let cli_args: CliArgs = argh::from_env();

    let subscriber = FmtSubscriber::builder()
        .with_max_level(if cli_args.debugging { Level::DEBUG } else { Level::INFO })
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let mut config = match &cli_args.config {
        Some(path) => Config::from_file(path)?,
        None => Config::default(),
    };
    config.apply_env(|key| std::env::var(key).ok())?;
    if let Some(host) = cli_args.host {
        config.ami.host = host;
    }
    if let Some(port) = cli_args.port {
        config.ami.port = port;
    }
    if let Some(username) = cli_args.username {
        config.ami.username = username;
    }
    if let Some(password) = cli_args.password {
        config.ami.password = password;
    }
    config.validate()?;

    info!("Connecting to {}", config.ami.address());
    let client = DefaultClient::connect(&config.ami).await.map_err(|e| {
        error!("Connection failed: {e}");
        e
    })?;

    let result = client
        .send_sms(&cli_args.device, &cli_args.to, &cli_args.message)
        .await;
    client.close().await;

    match result {
        Ok(()) => {
            info!("SMS to {} queued on {}", cli_args.to, cli_args.device);
            Ok(())
        }
        Err(e) => {
            error!("Sending failed: {e}");
            Err(e.into())
        }
    }
}
