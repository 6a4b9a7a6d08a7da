// ABOUTME: Manager-interface client module: session client, response correlation, lifecycle tracking
// ABOUTME: Exports the client, its error taxonomy and the data types it publishes

//! Manager-Interface Client Module
//!
//! [`DefaultClient`] owns one TCP session with the PBX manager interface:
//!
//! * **Login and subscription** - reads the greeting, authenticates and
//!   subscribes to the full event stream
//! * **Correlation** - every action that expects a reply gets a fresh
//!   `ActionID` and a single-use response slot registered before it is sent
//! * **Dispatch** - one background loop routes replies to their waiters and
//!   classifies everything else into [`Frame`](crate::frame::Frame)s on a
//!   bounded queue that drops when full
//! * **Lifecycle** - a coarse [`Status`] derived from boot and shutdown
//!   events, end-of-stream and explicit restarts
//! * **Modem operations** - SIM listing and deletion through AT commands
//!   proxied over the CLI `Command` action
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use dongle_ami::client::DefaultClient;
//! use dongle_ami::config::AmiConfig;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = AmiConfig::new("localhost", 5038, "admin", "secret");
//! let client = DefaultClient::connect(&config).await?;
//!
//! println!("uptime: {}s", client.get_uptime().await?);
//! client.send_sms("quectel0", "+8613800000000", "Hello!").await?;
//!
//! for sms in client.list_sms("quectel0").await? {
//!     println!("{} {} {}", sms.index, sms.sender, sms.content);
//! }
//!
//! client.close().await;
//! # Ok(())
//! # }
//! ```
//!
//! A client is single-shot: once its transport ends it reports
//! [`AmiError::ConnectionClosed`] and must be replaced. The
//! [`ConnectionManager`](crate::manager::ConnectionManager) does that.

pub mod correlator;
pub mod default;
pub mod dongle;
pub mod error;
pub mod lifecycle;
pub mod types;

pub use correlator::{PendingAction, PendingActions};
pub use default::{ClientStreams, DefaultClient, uptime_from_startup, validate_phone_number};
pub use dongle::{parse_device_state, validate_device_id};
pub use error::{AmiError, AmiResult};
pub use lifecycle::{LifecycleState, Status};
pub use types::{DongleStatus, PeerTable, SmsNotification, StatusInfo};
