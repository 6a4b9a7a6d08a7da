// ABOUTME: Daemon configuration loaded from TOML with environment overrides and validation
// ABOUTME: Covers the manager-interface session, reconnect policy, SMS pipeline and notification channels

use crate::client::dongle::validate_device_id;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid environment value {key}={value:?}")]
    InvalidEnv { key: &'static str, value: String },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Daemon configuration.
///
/// File: `/etc/dongle-ami/config.toml` or `~/.config/dongle-ami/config.toml`,
/// unless a path is given explicitly. Environment overrides:
/// `ASTERISK_AMI_HOST`, `ASTERISK_AMI_PORT`, `ASTERISK_AMI_USERNAME`,
/// `ASTERISK_AMI_PASSWORD`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub ami: AmiConfig,
    #[serde(default)]
    pub manager: ManagerConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub notifications: NotificationsConfig,
}

/// Manager-interface session settings
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AmiConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    /// Deadline for control round trips.
    #[serde(default = "default_command_timeout")]
    pub command_timeout_secs: u64,
    /// Deadline for SIM listings.
    #[serde(default = "default_list_timeout")]
    pub list_timeout_secs: u64,
    #[serde(default = "default_event_queue_capacity")]
    pub event_queue_capacity: usize,
    #[serde(default = "default_error_queue_capacity")]
    pub error_queue_capacity: usize,
    /// CLI command reloading the SIP stack after a full reload.
    #[serde(default = "default_protocol_reload_command")]
    pub protocol_reload_command: String,
    /// Dialplan context handling outbound SMS.
    #[serde(default = "default_sms_context")]
    pub sms_context: String,
    /// CLI prefix of the modem channel driver (`quectel`, `dongle`).
    #[serde(default = "default_dongle_command_prefix")]
    pub dongle_command_prefix: String,
    #[serde(default = "default_sms_match_tolerance")]
    pub sms_match_tolerance_secs: u64,
}

fn default_host() -> String {
    "localhost".to_string()
}
fn default_port() -> u16 {
    5038
}
fn default_command_timeout() -> u64 {
    5
}
fn default_list_timeout() -> u64 {
    10
}
fn default_event_queue_capacity() -> usize {
    100
}
fn default_error_queue_capacity() -> usize {
    10
}
fn default_protocol_reload_command() -> String {
    "pjsip reload".to_string()
}
fn default_sms_context() -> String {
    "quectel-sms".to_string()
}
fn default_dongle_command_prefix() -> String {
    "quectel".to_string()
}
fn default_sms_match_tolerance() -> u64 {
    300
}

impl Default for AmiConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            username: String::new(),
            password: String::new(),
            command_timeout_secs: default_command_timeout(),
            list_timeout_secs: default_list_timeout(),
            event_queue_capacity: default_event_queue_capacity(),
            error_queue_capacity: default_error_queue_capacity(),
            protocol_reload_command: default_protocol_reload_command(),
            sms_context: default_sms_context(),
            dongle_command_prefix: default_dongle_command_prefix(),
            sms_match_tolerance_secs: default_sms_match_tolerance(),
        }
    }
}

impl AmiConfig {
    pub fn new(host: &str, port: u16, username: &str, password: &str) -> Self {
        Self {
            host: host.to_string(),
            port,
            username: username.to_string(),
            password: password.to_string(),
            ..Default::default()
        }
    }

    /// `host:port` to dial. `localhost` is pinned to IPv4 loopback, where the
    /// manager interface listens by default.
    pub fn address(&self) -> String {
        let host = match self.host.as_str() {
            "localhost" => "127.0.0.1",
            other => other,
        };
        if host.contains(':') && !host.starts_with('[') {
            format!("[{}]:{}", host, self.port)
        } else {
            format!("{}:{}", host, self.port)
        }
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    pub fn list_timeout(&self) -> Duration {
        Duration::from_secs(self.list_timeout_secs)
    }

    pub fn sms_match_tolerance(&self) -> Duration {
        Duration::from_secs(self.sms_match_tolerance_secs)
    }
}

/// Reconnect and polling policy
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ManagerConfig {
    #[serde(default = "default_max_connect_attempts")]
    pub max_connect_attempts: u32,
    #[serde(default = "default_retry_delay")]
    pub retry_delay_secs: u64,
    /// Pause before retrying after a whole reconnect round failed.
    #[serde(default = "default_reconnect_backoff")]
    pub reconnect_backoff_secs: u64,
    #[serde(default = "default_status_interval")]
    pub status_interval_secs: u64,
    /// Ceiling after which a restart is assumed complete.
    #[serde(default = "default_restart_timeout")]
    pub restart_timeout_secs: u64,
}

fn default_max_connect_attempts() -> u32 {
    10
}
fn default_retry_delay() -> u64 {
    2
}
fn default_reconnect_backoff() -> u64 {
    5
}
fn default_status_interval() -> u64 {
    5
}
fn default_restart_timeout() -> u64 {
    60
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            max_connect_attempts: default_max_connect_attempts(),
            retry_delay_secs: default_retry_delay(),
            reconnect_backoff_secs: default_reconnect_backoff(),
            status_interval_secs: default_status_interval(),
            restart_timeout_secs: default_restart_timeout(),
        }
    }
}

impl ManagerConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_secs)
    }

    pub fn reconnect_backoff(&self) -> Duration {
        Duration::from_secs(self.reconnect_backoff_secs)
    }

    pub fn status_interval(&self) -> Duration {
        Duration::from_secs(self.status_interval_secs)
    }

    pub fn restart_timeout(&self) -> Duration {
        Duration::from_secs(self.restart_timeout_secs)
    }
}

/// SMS ingestion settings
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PipelineConfig {
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// Enqueue every received message found on the SIM at startup.
    #[serde(default)]
    pub recover_on_startup: bool,
    /// Delete a message from the SIM once it has been delivered.
    #[serde(default)]
    pub delete_after_delivery: bool,
    /// Modem devices scanned at startup.
    #[serde(default)]
    pub devices: Vec<String>,
}

fn default_queue_capacity() -> usize {
    100
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
            recover_on_startup: false,
            delete_after_delivery: false,
            devices: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NotificationsConfig {
    /// Proxy used by channels with `use_proxy = true`.
    #[serde(default)]
    pub http_proxy: Option<String>,
    #[serde(default)]
    pub channels: Vec<ChannelConfig>,
}

/// One notification channel, tagged by `type`
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ChannelConfig {
    Slack(SlackConfig),
    Telegram(TelegramConfig),
    Webhook(WebhookConfig),
    Smtp(SmtpConfig),
}

impl ChannelConfig {
    pub fn enabled(&self) -> bool {
        match self {
            ChannelConfig::Slack(c) => c.enabled,
            ChannelConfig::Telegram(c) => c.enabled,
            ChannelConfig::Webhook(c) => c.enabled,
            ChannelConfig::Smtp(c) => c.enabled,
        }
    }

    pub fn use_proxy(&self) -> bool {
        match self {
            ChannelConfig::Slack(c) => c.use_proxy,
            ChannelConfig::Telegram(c) => c.use_proxy,
            ChannelConfig::Webhook(c) => c.use_proxy,
            ChannelConfig::Smtp(c) => c.use_proxy,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SlackConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub use_proxy: bool,
    pub webhook_url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TelegramConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub use_proxy: bool,
    pub bot_token: String,
    pub chat_id: String,
    /// Bot API base URL, overridable for self-hosted API servers.
    #[serde(default = "default_telegram_api")]
    pub api_base: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WebhookConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub use_proxy: bool,
    pub url: String,
    #[serde(default = "default_webhook_method")]
    pub method: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

/// Email delivery over SMTP
#[derive(Debug, Clone, Deserialize)]
pub struct SmtpConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub use_proxy: bool,
    pub host: String,
    #[serde(default = "default_smtp_port")]
    pub port: u16,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    pub from: String,
    pub to: Vec<String>,
    /// Chosen from the port when unset.
    #[serde(default)]
    pub security: Option<SmtpSecurity>,
}

/// How the SMTP session is protected
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SmtpSecurity {
    /// TLS from the first byte (usually port 465).
    Tls,
    /// Plain connection upgraded with STARTTLS, which the server must offer.
    Starttls,
    /// No encryption.
    Plain,
}

impl SmtpConfig {
    /// Port 465 is direct TLS; 25 and 587 require STARTTLS; anything else is
    /// plain unless `security` says otherwise.
    pub fn security(&self) -> SmtpSecurity {
        self.security.unwrap_or(match self.port {
            465 => SmtpSecurity::Tls,
            25 | 587 => SmtpSecurity::Starttls,
            _ => SmtpSecurity::Plain,
        })
    }
}

fn default_true() -> bool {
    true
}
fn default_telegram_api() -> String {
    "https://api.telegram.org".to_string()
}
fn default_webhook_method() -> String {
    "POST".to_string()
}
fn default_smtp_port() -> u16 {
    587
}

impl Config {
    /// Load from `path`, or from the first default location that exists, then
    /// apply environment overrides and validate.
    pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => match config_paths().into_iter().find(|p| p.exists()) {
                Some(path) => Self::from_file(&path)?,
                None => {
                    debug!("No config file found, using defaults");
                    Config::default()
                }
            },
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Config, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        debug!("Loaded config from {}", path.display());
        Self::from_toml(&text)
    }

    pub fn from_toml(text: &str) -> Result<Config, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    /// Apply `ASTERISK_AMI_*` overrides read through `lookup`.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(host) = lookup("ASTERISK_AMI_HOST").filter(|v| !v.is_empty()) {
            self.ami.host = host;
        }
        if let Some(port) = lookup("ASTERISK_AMI_PORT").filter(|v| !v.is_empty()) {
            self.ami.port = port.parse().map_err(|_| ConfigError::InvalidEnv {
                key: "ASTERISK_AMI_PORT",
                value: port.clone(),
            })?;
        }
        if let Some(username) = lookup("ASTERISK_AMI_USERNAME").filter(|v| !v.is_empty()) {
            self.ami.username = username;
        }
        if let Some(password) = lookup("ASTERISK_AMI_PASSWORD").filter(|v| !v.is_empty()) {
            self.ami.password = password;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::Invalid(msg.to_string()));

        if self.ami.username.is_empty() || self.ami.password.is_empty() {
            return invalid("ami.username and ami.password are required");
        }
        if self.ami.port == 0 {
            return invalid("ami.port must be non-zero");
        }
        if self.ami.event_queue_capacity == 0
            || self.ami.error_queue_capacity == 0
            || self.pipeline.queue_capacity == 0
        {
            return invalid("queue capacities must be at least 1");
        }
        if self.manager.max_connect_attempts == 0 {
            return invalid("manager.max_connect_attempts must be at least 1");
        }
        if self.manager.status_interval_secs == 0 {
            return invalid("manager.status_interval_secs must be at least 1");
        }
        if let Some(device) = self
            .pipeline
            .devices
            .iter()
            .find(|d| validate_device_id(d).is_err())
        {
            return Err(ConfigError::Invalid(format!(
                "pipeline.devices contains invalid device ID {:?}",
                device
            )));
        }
        Ok(())
    }
}

fn config_paths() -> Vec<PathBuf> {
    let mut out = Vec::new();
    if let Some(home) = std::env::var_os("HOME").map(PathBuf::from) {
        out.push(home.join(".config/dongle-ami/config.toml"));
    }
    out.push(PathBuf::from("/etc/dongle-ami/config.toml"));
    out
}
