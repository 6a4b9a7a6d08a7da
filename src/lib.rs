//! Asterisk manager-interface client and GSM modem SMS pipeline.
//!
//! The crate is layered leaves first:
//!
//! * [`codec`] / [`frame`] / [`connection`] - wire format, message
//!   classification and buffered TCP transport
//! * [`client`] - one authenticated session with action/response
//!   correlation, lifecycle status and modem operations
//! * [`sim`] - SIM listing parser and fuzzy message matching
//! * [`manager`] - reconnecting supervisor with status polling and subscribers
//! * [`pipeline`] / [`store`] / [`notify`] - ordered SMS ingestion with
//!   deduplication, persistence and concurrent notification

pub mod client;
pub mod codec;
pub mod config;
pub mod connection;
pub mod frame;
pub mod manager;
pub mod notify;
pub mod pipeline;
pub mod sim;
pub mod store;

#[cfg(test)]
mod tests;

// Re-export codec and frame types for direct access
pub use codec::{CodecError, Message};
pub use frame::{DomainEvent, Frame, LifecycleEvent};

// Re-export the main client API for easy access
pub use client::{AmiError, AmiResult, DefaultClient, SmsNotification, Status, StatusInfo};
pub use config::Config;
pub use manager::{ConnectionManager, SimMailbox, StatusSubscriber};
pub use pipeline::{SmsPipeline, SmsProcessor, SmsQueue, SmsRequest};
pub use sim::{SmsInfo, match_sms, parse_cmgl};

/// Error returned by most functions.
///
/// Library operations return typed errors ([`AmiError`], [`CodecError`],
/// ...). Binaries that only report failures can use this boxed form, which
/// every error type in the crate converts into.
pub type Error = Box<dyn std::error::Error + Send + Sync>;

/// A specialized `Result` type for the crate's binaries.
///
/// # Examples
///
/// ```rust,no_run
/// use dongle_ami::config::AmiConfig;
/// use dongle_ami::DefaultClient;
///
/// #[tokio::main]
/// async fn main() -> dongle_ami::Result<()> {
///     let config = AmiConfig::new("localhost", 5038, "admin", "secret");
///     let client = DefaultClient::connect(&config).await?;
///
///     client.send_sms("quectel0", "+8613800000000", "Hello, World!").await?;
///
///     client.close().await;
///     Ok(())
/// }
/// ```
pub type Result<T> = std::result::Result<T, Error>;
