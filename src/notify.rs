// ABOUTME: Outbound notification channels (Slack, Telegram, generic webhook, email) and concurrent fan-out
// ABOUTME: A failing channel never blocks or fails delivery attempts to the others

use crate::config::{
    ChannelConfig, NotificationsConfig, SlackConfig, SmtpConfig, SmtpSecurity, TelegramConfig,
    WebhookConfig,
};
use chrono::Local;
use futures::future::{BoxFuture, join_all};
use lettre::message::{Mailbox, header::ContentType};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Tokio1Executor};
use serde_json::json;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Per-request deadline for every notifier.
pub const NOTIFY_TIMEOUT: Duration = Duration::from_secs(10);

const EMAIL_SUBJECT: &str = "SMS notification";

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("SMTP error: {0}")]
    Smtp(#[from] lettre::transport::smtp::Error),

    #[error("{channel} returned status {status}")]
    Status { channel: ChannelKind, status: u16 },

    #[error("Invalid channel configuration: {0}")]
    Config(String),

    #[error("{0}")]
    Other(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelKind {
    Slack,
    Telegram,
    Webhook,
    Smtp,
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelKind::Slack => f.write_str("slack"),
            ChannelKind::Telegram => f.write_str("telegram"),
            ChannelKind::Webhook => f.write_str("webhook"),
            ChannelKind::Smtp => f.write_str("smtp"),
        }
    }
}

/// A destination for notification text
pub trait Notifier: Send + Sync {
    fn kind(&self) -> ChannelKind;

    fn send<'a>(&'a self, text: &'a str) -> BoxFuture<'a, Result<(), NotifyError>>;
}

/// Text sent for an inbound SMS.
pub fn format_sms_notification(sender: &str, device: &str, text: &str) -> String {
    format!("SMS from {} (device: {}):\n{}", sender, device, text)
}

fn http_client(proxy: Option<&str>) -> Result<reqwest::Client, NotifyError> {
    let mut builder = reqwest::Client::builder().timeout(NOTIFY_TIMEOUT);
    if let Some(proxy) = proxy {
        builder = builder.proxy(reqwest::Proxy::all(proxy)?);
    }
    Ok(builder.build()?)
}

/// Slack incoming webhook
#[derive(Debug)]
pub struct SlackNotifier {
    client: reqwest::Client,
    webhook_url: String,
}

impl SlackNotifier {
    pub fn new(config: &SlackConfig, proxy: Option<&str>) -> Result<Self, NotifyError> {
        if config.webhook_url.is_empty() {
            return Err(NotifyError::Config("slack webhook_url is empty".to_string()));
        }
        Ok(Self {
            client: http_client(proxy)?,
            webhook_url: config.webhook_url.clone(),
        })
    }
}

impl Notifier for SlackNotifier {
    fn kind(&self) -> ChannelKind {
        ChannelKind::Slack
    }

    fn send<'a>(&'a self, text: &'a str) -> BoxFuture<'a, Result<(), NotifyError>> {
        Box::pin(async move {
            let response = self
                .client
                .post(&self.webhook_url)
                .json(&json!({ "text": text }))
                .send()
                .await?;
            require_status(ChannelKind::Slack, response.status(), true)
        })
    }
}

/// Telegram bot `sendMessage`
#[derive(Debug)]
pub struct TelegramNotifier {
    client: reqwest::Client,
    endpoint: String,
    chat_id: String,
}

impl TelegramNotifier {
    pub fn new(config: &TelegramConfig, proxy: Option<&str>) -> Result<Self, NotifyError> {
        if config.bot_token.is_empty() || config.chat_id.is_empty() {
            return Err(NotifyError::Config(
                "telegram bot_token and chat_id are required".to_string(),
            ));
        }
        Ok(Self {
            client: http_client(proxy)?,
            endpoint: format!(
                "{}/bot{}/sendMessage",
                config.api_base.trim_end_matches('/'),
                config.bot_token
            ),
            chat_id: config.chat_id.clone(),
        })
    }
}

impl Notifier for TelegramNotifier {
    fn kind(&self) -> ChannelKind {
        ChannelKind::Telegram
    }

    fn send<'a>(&'a self, text: &'a str) -> BoxFuture<'a, Result<(), NotifyError>> {
        Box::pin(async move {
            let response = self
                .client
                .post(&self.endpoint)
                .json(&json!({ "chat_id": self.chat_id, "text": text }))
                .send()
                .await?;
            require_status(ChannelKind::Telegram, response.status(), true)
        })
    }
}

/// Generic JSON webhook: `{"message", "timestamp"}` with configurable method
/// and headers
#[derive(Debug)]
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
    method: reqwest::Method,
    headers: Vec<(String, String)>,
}

impl WebhookNotifier {
    pub fn new(config: &WebhookConfig, proxy: Option<&str>) -> Result<Self, NotifyError> {
        if config.url.is_empty() {
            return Err(NotifyError::Config("webhook url is empty".to_string()));
        }
        let method = reqwest::Method::from_bytes(config.method.to_ascii_uppercase().as_bytes())
            .map_err(|_| NotifyError::Config(format!("invalid method {:?}", config.method)))?;
        let mut headers: Vec<(String, String)> = config
            .headers
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        headers.sort();
        Ok(Self {
            client: http_client(proxy)?,
            url: config.url.clone(),
            method,
            headers,
        })
    }
}

impl Notifier for WebhookNotifier {
    fn kind(&self) -> ChannelKind {
        ChannelKind::Webhook
    }

    fn send<'a>(&'a self, text: &'a str) -> BoxFuture<'a, Result<(), NotifyError>> {
        Box::pin(async move {
            let mut request = self
                .client
                .request(self.method.clone(), &self.url)
                .json(&json!({ "message": text, "timestamp": Local::now().to_rfc3339() }));
            for (name, value) in &self.headers {
                request = request.header(name.as_str(), value.as_str());
            }
            let response = request.send().await?;
            require_status(ChannelKind::Webhook, response.status(), false)
        })
    }
}

/// Plain-text email through an SMTP relay.
///
/// A connection is opened per message. SMTP is never tunnelled through the
/// HTTP proxy; with `use_proxy` set the relay is still reached directly.
pub struct SmtpNotifier {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
    to: Vec<Mailbox>,
}

impl SmtpNotifier {
    pub fn new(config: &SmtpConfig, proxy: Option<&str>) -> Result<Self, NotifyError> {
        if config.host.is_empty() {
            return Err(NotifyError::Config("smtp host is empty".to_string()));
        }
        if config.to.is_empty() {
            return Err(NotifyError::Config("smtp needs at least one recipient".to_string()));
        }
        let from = mailbox(&config.from)?;
        let to = config
            .to
            .iter()
            .map(|address| mailbox(address))
            .collect::<Result<Vec<_>, _>>()?;

        if let Some(proxy) = proxy {
            warn!(
                "SMTP does not go through proxy {}; connecting to {} directly",
                proxy, config.host
            );
        }

        let builder = match config.security() {
            SmtpSecurity::Tls => AsyncSmtpTransport::<Tokio1Executor>::relay(&config.host)?,
            SmtpSecurity::Starttls => {
                AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.host)?
            }
            SmtpSecurity::Plain => {
                AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&config.host)
            }
        };
        let mut builder = builder.port(config.port).timeout(Some(NOTIFY_TIMEOUT));
        if !config.username.is_empty() {
            builder = builder.credentials(Credentials::new(
                config.username.clone(),
                config.password.clone(),
            ));
        }
        debug!(
            "SMTP relay {}:{} ({:?}) for {} recipient(s)",
            config.host,
            config.port,
            config.security(),
            to.len()
        );

        Ok(Self {
            transport: builder.build(),
            from,
            to,
        })
    }

    fn email(&self, text: &str) -> Result<lettre::Message, NotifyError> {
        let mut builder = lettre::Message::builder()
            .from(self.from.clone())
            .subject(EMAIL_SUBJECT)
            .header(ContentType::TEXT_PLAIN);
        for to in &self.to {
            builder = builder.to(to.clone());
        }
        builder
            .body(text.to_string())
            .map_err(|e| NotifyError::Other(format!("cannot build email: {}", e)))
    }
}

fn mailbox(address: &str) -> Result<Mailbox, NotifyError> {
    address
        .parse()
        .map_err(|e| NotifyError::Config(format!("invalid email address {:?}: {}", address, e)))
}

impl Notifier for SmtpNotifier {
    fn kind(&self) -> ChannelKind {
        ChannelKind::Smtp
    }

    fn send<'a>(&'a self, text: &'a str) -> BoxFuture<'a, Result<(), NotifyError>> {
        Box::pin(async move {
            let email = self.email(text)?;
            self.transport.send(email).await?;
            Ok(())
        })
    }
}

/// Slack and Telegram answer exactly 200 on success; webhooks may use any 2xx.
fn require_status(
    channel: ChannelKind,
    status: reqwest::StatusCode,
    exact_ok: bool,
) -> Result<(), NotifyError> {
    let ok = if exact_ok {
        status == reqwest::StatusCode::OK
    } else {
        status.is_success()
    };
    if ok {
        Ok(())
    } else {
        Err(NotifyError::Status {
            channel,
            status: status.as_u16(),
        })
    }
}

/// Outcome of one fan-out
#[derive(Debug, Default)]
pub struct NotifyReport {
    /// Channels a delivery was attempted on.
    pub attempted: usize,
    /// Failures in channel order.
    pub errors: Vec<(ChannelKind, NotifyError)>,
}

impl NotifyReport {
    pub fn is_success(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn first_error(&self) -> Option<&NotifyError> {
        self.errors.first().map(|(_, e)| e)
    }
}

/// The enabled notification channels
#[derive(Default, Clone)]
pub struct NotifierRegistry {
    notifiers: Vec<Arc<dyn Notifier>>,
}

impl fmt::Debug for NotifierRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NotifierRegistry")
            .field("channels", &self.kinds())
            .finish()
    }
}

impl NotifierRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a notifier for every enabled channel. A channel with broken
    /// configuration is skipped with a warning.
    pub fn from_config(config: &NotificationsConfig) -> Self {
        let mut registry = Self::new();
        for channel in config.channels.iter().filter(|c| c.enabled()) {
            let proxy = if channel.use_proxy() {
                config.http_proxy.as_deref().filter(|p| !p.is_empty())
            } else {
                None
            };
            let built: Result<Arc<dyn Notifier>, NotifyError> = match channel {
                ChannelConfig::Slack(c) => SlackNotifier::new(c, proxy).map(|n| Arc::new(n) as _),
                ChannelConfig::Telegram(c) => {
                    TelegramNotifier::new(c, proxy).map(|n| Arc::new(n) as _)
                }
                ChannelConfig::Webhook(c) => {
                    WebhookNotifier::new(c, proxy).map(|n| Arc::new(n) as _)
                }
                ChannelConfig::Smtp(c) => SmtpNotifier::new(c, proxy).map(|n| Arc::new(n) as _),
            };
            match built {
                Ok(notifier) => registry.register(notifier),
                Err(e) => warn!("Skipping notification channel: {}", e),
            }
        }
        info!("{} notification channel(s) enabled", registry.len());
        registry
    }

    pub fn register(&mut self, notifier: Arc<dyn Notifier>) {
        self.notifiers.push(notifier);
    }

    pub fn len(&self) -> usize {
        self.notifiers.len()
    }

    /// Channel kinds in registration order.
    pub fn kinds(&self) -> Vec<ChannelKind> {
        self.notifiers.iter().map(|n| n.kind()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.notifiers.is_empty()
    }

    /// Send `text` on every channel concurrently and collect the failures.
    pub async fn send(&self, text: &str) -> NotifyReport {
        let results = join_all(self.notifiers.iter().map(|n| n.send(text))).await;

        let mut report = NotifyReport {
            attempted: results.len(),
            errors: Vec::new(),
        };
        for (notifier, result) in self.notifiers.iter().zip(results) {
            match result {
                Ok(()) => debug!("Notification sent via {}", notifier.kind()),
                Err(e) => {
                    warn!("Notification via {} failed: {}", notifier.kind(), e);
                    report.errors.push((notifier.kind(), e));
                }
            }
        }
        report
    }
}
