//! Classification of decoded manager-interface messages.
//!
//! The dispatch loop decodes every inbound [`Message`] once, at the transport
//! boundary, into a closed [`Frame`] variant. Everything downstream (status
//! tracking, peer registration, SMS fan-out) pattern-matches on the variant
//! instead of comparing event-name strings.

use crate::client::types::SmsNotification;
use crate::codec::Message;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use tracing::debug;

/// A classified inbound message
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// A reply carrying an `ActionID` and no `Event` field.
    Response(Message),
    /// PBX lifecycle notifications that drive [`Status`](crate::client::Status).
    Lifecycle(LifecycleEvent),
    /// Domain notifications the client or manager acts upon.
    Domain(DomainEvent),
    /// Any other event; forwarded as-is.
    Unrecognized(Message),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
    FullyBooted,
    Shutdown,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DomainEvent {
    PeerStatus { peer: String, registered: bool },
    PeerEntry { peer: String },
    SmsReceived(SmsNotification),
}

impl Frame {
    /// Classify a decoded message.
    pub fn classify(message: Message) -> Frame {
        let Some(event) = message.event() else {
            return if message.action_id().is_some() {
                Frame::Response(message)
            } else {
                Frame::Unrecognized(message)
            };
        };

        match event {
            "FullyBooted" => Frame::Lifecycle(LifecycleEvent::FullyBooted),
            "Shutdown" => Frame::Lifecycle(LifecycleEvent::Shutdown),
            "PeerStatus" => match message.field("Peer").filter(|p| !p.is_empty()) {
                Some(peer) => Frame::Domain(DomainEvent::PeerStatus {
                    peer: peer.to_string(),
                    registered: message.field("PeerStatus").or(message.field("Status"))
                        == Some("Registered"),
                }),
                None => Frame::Unrecognized(message),
            },
            "PeerEntry" => match message.field("ObjectName").filter(|p| !p.is_empty()) {
                Some(peer) => Frame::Domain(DomainEvent::PeerEntry {
                    peer: peer.to_string(),
                }),
                None => Frame::Unrecognized(message),
            },
            "DongleSMSReceived" | "QuectelSMSReceived" => match modem_sms(&message) {
                Some(sms) => Frame::Domain(DomainEvent::SmsReceived(sms)),
                None => Frame::Unrecognized(message),
            },
            "UserEvent" if message.field("UserEvent") == Some("SMSReceived") => {
                match dialplan_sms(&message) {
                    Some(sms) => Frame::Domain(DomainEvent::SmsReceived(sms)),
                    None => Frame::Unrecognized(message),
                }
            }
            _ => Frame::Unrecognized(message),
        }
    }

    /// Whether this is a list-completion event (`EventList: Complete`), which
    /// closes a multi-message reply started by an action.
    pub fn is_list_complete(message: &Message) -> bool {
        message.event().is_some()
            && message
                .field("EventList")
                .is_some_and(|v| v.eq_ignore_ascii_case("Complete"))
    }
}

/// SMS notification raised by the modem channel driver itself.
fn modem_sms(message: &Message) -> Option<SmsNotification> {
    let device = message.first_field(&["Device", "QuectelDevice", "QuectelName"])?;
    let sender = message.first_field(&["Sender", "From"])?;
    let text = match message.first_field(&["Message"]) {
        Some(text) => text.to_string(),
        None => {
            let encoded = message.first_field(&["SMS_BASE64"])?;
            decode_base64(encoded).unwrap_or_else(|| encoded.to_string())
        }
    };
    build(message, device, sender, text)
}

/// SMS notification raised by the dialplan through `UserEvent(SMSReceived,...)`.
/// The base64 copy is preferred because raw text may contain bytes that do not
/// survive the text protocol.
fn dialplan_sms(message: &Message) -> Option<SmsNotification> {
    let device = message.first_field(&["Device"])?;
    let sender = message.first_field(&["Sender"])?;
    let text = message
        .first_field(&["MessageBase64"])
        .and_then(decode_base64)
        .or_else(|| message.first_field(&["Message"]).map(str::to_string))?;
    build(message, device, sender, text)
}

fn build(message: &Message, device: &str, sender: &str, text: String) -> Option<SmsNotification> {
    if text.is_empty() {
        return None;
    }
    Some(SmsNotification {
        device: device.to_string(),
        sender: sender.to_string(),
        text,
        timestamp: message.first_field(&["Timestamp"]).map(str::to_string),
        sim_index: message
            .first_field(&["SMSIndex", "Index"])
            .and_then(|v| v.trim().parse().ok())
            .filter(|index| *index > 0),
    })
}

fn decode_base64(encoded: &str) -> Option<String> {
    match STANDARD.decode(encoded.trim()) {
        Ok(bytes) => Some(String::from_utf8_lossy(&bytes).into_owned()),
        Err(e) => {
            debug!("Ignoring undecodable base64 SMS payload: {}", e);
            None
        }
    }
}
