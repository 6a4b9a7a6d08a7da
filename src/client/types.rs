// ABOUTME: Data types exchanged between the client, the connection manager and subscribers
// ABOUTME: Includes status snapshots, inbound SMS notifications, modem state and the peer registration table

use crate::client::lifecycle::Status;
use chrono::{DateTime, Local};
use serde::Serialize;
use std::collections::HashMap;

/// Aggregate health snapshot published to subscribers on every poll
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusInfo {
    pub status: Status,
    /// Seconds since the PBX started; 0 when unknown.
    pub uptime: u64,
    /// Active channel (call leg) count.
    pub channels: usize,
    /// Registered peer count.
    pub registrations: usize,
    pub last_update: DateTime<Local>,
}

impl StatusInfo {
    /// A snapshot carrying only a status, with every counter unknown.
    pub fn with_status(status: Status) -> Self {
        Self {
            status,
            uptime: 0,
            channels: 0,
            registrations: 0,
            last_update: Local::now(),
        }
    }
}

/// An SMS reported by the PBX as received on a modem
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SmsNotification {
    /// Modem device ID (for example `quectel0`).
    pub device: String,
    pub sender: String,
    pub text: String,
    /// Raw SIM timestamp (`YY/MM/DD HH:MM:SS`), when the event carried one.
    pub timestamp: Option<String>,
    /// 1-based SIM slot, when the event carried one.
    pub sim_index: Option<u32>,
}

/// State of one modem as reported by the channel driver
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DongleStatus {
    pub device: String,
    /// Driver state text (`Free`, `Ring`, `Not connected`, ...) or `offline`.
    pub state: String,
    pub imei: Option<String>,
    pub imsi: Option<String>,
    pub operator: Option<String>,
    pub signal: Option<i32>,
}

impl DongleStatus {
    pub fn offline(device: &str) -> Self {
        Self {
            device: device.to_string(),
            state: "offline".to_string(),
            ..Default::default()
        }
    }
}

/// Peer name to registered flag, fed by peer status events
#[derive(Debug, Default)]
pub struct PeerTable {
    peers: HashMap<String, bool>,
}

impl PeerTable {
    /// Record a peer's state. Returns the previous state when it changed.
    pub fn update(&mut self, peer: &str, registered: bool) -> Option<bool> {
        let previous = self.peers.insert(peer.to_string(), registered).unwrap_or(false);
        (previous != registered).then_some(previous)
    }

    pub fn registered_count(&self) -> usize {
        self.peers.values().filter(|registered| **registered).count()
    }
}
