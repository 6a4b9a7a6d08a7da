// ABOUTME: Parses modem AT+CMGL listings into structured SIM messages and locates a message by fuzzy match
// ABOUTME: Matching tolerates drift between the SIM clock and the system clock

use chrono::NaiveDateTime;
use std::fmt;
use std::time::Duration;
use tracing::{debug, info};

/// SIM timestamp layout: two-digit year, month, day, then 24h time.
const SIM_TIMESTAMP_FORMAT: &str = "%y/%m/%d %H:%M:%S";

/// Default tolerance between a reported timestamp and the SIM's own copy.
pub const DEFAULT_MATCH_TOLERANCE: Duration = Duration::from_secs(5 * 60);

/// Storage status of a SIM message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SimMessageStatus {
    Read,
    Unread,
    Sent,
    Unsent,
    Other(String),
}

impl SimMessageStatus {
    fn parse(raw: &str) -> Self {
        match raw {
            "REC READ" => SimMessageStatus::Read,
            "REC UNREAD" => SimMessageStatus::Unread,
            "STO SENT" => SimMessageStatus::Sent,
            "STO UNSENT" => SimMessageStatus::Unsent,
            other => SimMessageStatus::Other(other.to_string()),
        }
    }

    /// Whether the message was received (as opposed to stored for sending).
    pub fn is_received(&self) -> bool {
        matches!(self, SimMessageStatus::Read | SimMessageStatus::Unread)
    }
}

impl fmt::Display for SimMessageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SimMessageStatus::Read => f.write_str("REC READ"),
            SimMessageStatus::Unread => f.write_str("REC UNREAD"),
            SimMessageStatus::Sent => f.write_str("STO SENT"),
            SimMessageStatus::Unsent => f.write_str("STO UNSENT"),
            SimMessageStatus::Other(raw) => f.write_str(raw),
        }
    }
}

/// One message as stored on the SIM card
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SmsInfo {
    /// 1-based SIM slot.
    pub index: u32,
    pub status: SimMessageStatus,
    pub sender: String,
    /// Raw timestamp, e.g. `25/01/22 13:53:08+32`.
    pub timestamp: String,
    /// Body; multi-line bodies are joined with `\n`.
    pub content: String,
}

/// Parse text-mode `AT+CMGL="ALL"` output.
///
/// ```text
/// +CMGL: 1,"REC READ","+8613800000000",,"25/01/22 13:53:08+32"
/// first line of the body
/// second line of the body
///
/// +CMGL: 2,"REC UNREAD","10010",,"25/01/22 13:50:00+32"
/// Another message
/// ```
///
/// A body runs until a blank line or the next header. Lines that appear before
/// the first header are ignored.
pub fn parse_cmgl(output: &str) -> Vec<SmsInfo> {
    let mut messages = Vec::new();
    let mut current: Option<SmsInfo> = None;
    let mut body: Vec<&str> = Vec::new();

    for line in output.lines() {
        let line = line.trim();

        if let Some(header) = parse_header(line) {
            if let Some(mut sms) = current.take() {
                sms.content = body.join("\n");
                messages.push(sms);
            }
            body.clear();
            current = Some(header);
            continue;
        }

        if current.is_none() {
            continue;
        }

        if !line.is_empty() {
            body.push(line);
        } else if !body.is_empty() {
            if let Some(mut sms) = current.take() {
                sms.content = body.join("\n");
                messages.push(sms);
            }
            body.clear();
        }
    }

    if let Some(mut sms) = current {
        if !body.is_empty() {
            sms.content = body.join("\n");
            messages.push(sms);
        }
    }

    messages
}

/// `+CMGL: <index>,"<status>","<sender>",[<alpha>],"<timestamp>"`
fn parse_header(line: &str) -> Option<SmsInfo> {
    let rest = line.strip_prefix("+CMGL:")?.trim_start();
    let fields = split_quoted(rest);
    if fields.len() < 3 {
        return None;
    }

    let index = fields[0].trim().parse().ok()?;
    let status = unquote(fields[1])?;
    let sender = unquote(fields[2])?;
    // The timestamp is the last quoted field after the sender; an empty
    // alphanumeric-name field may sit in between.
    let timestamp = fields[3..]
        .iter()
        .rev()
        .find_map(|field| unquote(field).filter(|v| !v.is_empty()))
        .unwrap_or_default();

    Some(SmsInfo {
        index,
        status: SimMessageStatus::parse(status),
        sender: sender.to_string(),
        timestamp: timestamp.to_string(),
        content: String::new(),
    })
}

/// Split on commas that are not inside double quotes.
fn split_quoted(s: &str) -> Vec<&str> {
    let mut fields = Vec::new();
    let mut in_quotes = false;
    let mut start = 0;
    for (i, c) in s.char_indices() {
        match c {
            '"' => in_quotes = !in_quotes,
            ',' if !in_quotes => {
                fields.push(&s[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    fields.push(&s[start..]);
    fields
}

fn unquote(field: &str) -> Option<&str> {
    field.trim().strip_prefix('"')?.strip_suffix('"')
}

/// Parse a SIM timestamp, ignoring any trailing timezone offset
/// (`+32` / `-08`, in quarter hours).
pub fn parse_sim_timestamp(raw: &str) -> Option<NaiveDateTime> {
    let raw = raw.trim();
    let base = raw.split(['+', '-']).next().unwrap_or(raw).trim();
    NaiveDateTime::parse_from_str(base, SIM_TIMESTAMP_FORMAT).ok()
}

/// Replace CR and LF with spaces so bodies compare regardless of line endings.
pub fn normalize_content(content: &str) -> String {
    content.replace(['\r', '\n'], " ")
}

/// Find the SIM slot holding a given message.
///
/// A candidate must have the same sender and the same content after
/// [`normalize_content`]. When `timestamp` is non-empty and parses, a
/// candidate whose own timestamp parses must also lie within `tolerance`.
/// The first candidate satisfying every active constraint wins.
///
/// `None` is an ordinary outcome, not a failure: the message may already be
/// gone from the SIM.
pub fn match_sms(
    sender: &str,
    timestamp: &str,
    content: &str,
    candidates: &[SmsInfo],
    tolerance: Duration,
) -> Option<u32> {
    let wanted = normalize_content(content);
    let target = if timestamp.trim().is_empty() {
        None
    } else {
        let parsed = parse_sim_timestamp(timestamp);
        if parsed.is_none() {
            debug!(
                "Unparseable timestamp {:?}; matching on sender and content only",
                timestamp
            );
        }
        parsed
    };

    for sms in candidates {
        if sms.sender != sender {
            continue;
        }
        if normalize_content(&sms.content) != wanted {
            continue;
        }

        if let (Some(target), Some(candidate)) = (target, parse_sim_timestamp(&sms.timestamp)) {
            let diff = (target - candidate).abs();
            let within = diff
                .to_std()
                .map(|diff| diff <= tolerance)
                .unwrap_or(false);
            if !within {
                debug!(
                    "Timestamp mismatch at index {}: target={}, sim={}, diff={}s",
                    sms.index,
                    target,
                    candidate,
                    diff.num_seconds()
                );
                continue;
            }
        }

        info!(
            "Matched SMS at index {} (sender: {}, timestamp: {})",
            sms.index, sms.sender, sms.timestamp
        );
        return Some(sms.index);
    }

    debug!("No matching SMS found for sender={}, content={:?}", sender, wanted);
    None
}
