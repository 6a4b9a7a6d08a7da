// ABOUTME: Manager-interface wire codec: line-oriented `Key: Value` messages terminated by a blank line
// ABOUTME: Separates framing (check), decoding (parse) and encoding from the client and dispatch logic

use bytes::{BufMut, BytesMut};
use thiserror::Error;

/// Upper bound on a single buffered message. CLI command output (for example a
/// full SIM listing) travels inside one message, so this is generous.
pub const MAX_MESSAGE_SIZE: usize = 1024 * 1024;

/// Field names with protocol meaning.
pub const ACTION: &str = "Action";
pub const ACTION_ID: &str = "ActionID";
pub const EVENT: &str = "Event";
pub const RESPONSE: &str = "Response";
pub const MESSAGE: &str = "Message";

/// Codec errors with enough context to decide whether the session survives
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Incomplete message: need more data")]
    Incomplete,

    #[error("Message of {size} bytes exceeds maximum of {max} bytes")]
    MessageTooLarge { size: usize, max: usize },

    #[error("Message is not valid UTF-8")]
    InvalidUtf8,

    #[error("Malformed line: {0:?}")]
    MalformedLine(String),

    #[error("Field '{field}' contains a line break and cannot be framed")]
    UnsafeValue { field: String },
}

impl CodecError {
    /// Per-message errors leave the stream positioned at the next message, so
    /// the session can continue. Anything else means framing is lost.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, CodecError::InvalidUtf8 | CodecError::MalformedLine(_))
    }
}

/// A single manager-interface message.
///
/// Fields keep their wire order and duplicates are allowed: an `Originate`
/// action carries several `Variable` fields and command responses carry one
/// `Output` field per line of CLI output. Lookups are ASCII case-insensitive
/// on the key, matching how the peer treats field names.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Message {
    fields: Vec<(String, String)>,
}

impl Message {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start an outgoing action message.
    pub fn action(name: &str) -> Self {
        let mut message = Self::new();
        message.push(ACTION, name);
        message
    }

    /// Builder form of [`Message::push`].
    pub fn with(mut self, key: &str, value: impl Into<String>) -> Self {
        self.push(key, value);
        self
    }

    /// Append a field, keeping any existing field with the same key.
    pub fn push(&mut self, key: &str, value: impl Into<String>) {
        self.fields.push((key.to_string(), value.into()));
    }

    /// Replace every field named `key` with a single value.
    pub fn set(&mut self, key: &str, value: impl Into<String>) {
        self.fields.retain(|(k, _)| !k.eq_ignore_ascii_case(key));
        self.push(key, value);
    }

    /// First value for `key`.
    pub fn field(&self, key: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    }

    /// First non-empty value among `keys`, in the order given.
    pub fn first_field(&self, keys: &[&str]) -> Option<&str> {
        keys.iter()
            .filter_map(|key| self.field(key))
            .find(|value| !value.is_empty())
    }

    /// Every value for `key`, in wire order.
    pub fn fields<'a>(&'a self, key: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.fields
            .iter()
            .filter(move |(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    }

    pub fn action_id(&self) -> Option<&str> {
        self.field(ACTION_ID).filter(|id| !id.is_empty())
    }

    pub fn event(&self) -> Option<&str> {
        self.field(EVENT).filter(|name| !name.is_empty())
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Serialize into `dst` as `Key: Value\r\n` lines followed by a blank line.
    ///
    /// Values containing CR or LF are refused: they would end the message early
    /// and let the remainder be read as a second, attacker-shaped message.
    pub fn encode(&self, dst: &mut BytesMut) -> Result<(), CodecError> {
        for (key, value) in &self.fields {
            if has_line_break(key) || has_line_break(value) {
                return Err(CodecError::UnsafeValue { field: key.clone() });
            }
        }

        for (key, value) in &self.fields {
            dst.reserve(key.len() + value.len() + 4);
            dst.put_slice(key.as_bytes());
            dst.put_slice(b": ");
            dst.put_slice(value.as_bytes());
            dst.put_slice(b"\r\n");
        }
        dst.put_slice(b"\r\n");
        Ok(())
    }

    pub fn to_bytes(&self) -> Result<BytesMut, CodecError> {
        let mut buf = BytesMut::with_capacity(128);
        self.encode(&mut buf)?;
        Ok(buf)
    }
}

fn has_line_break(s: &str) -> bool {
    s.contains(['\r', '\n'])
}

/// Number of leading bytes that are stray line terminators between messages.
pub fn leading_blank_len(buf: &[u8]) -> usize {
    buf.iter().take_while(|b| **b == b'\r' || **b == b'\n').count()
}

/// Check whether `buf` starts with one complete message.
///
/// Returns the number of bytes the message occupies, terminator included.
/// Lines may end in `\r\n` or a bare `\n`; the message ends at the first empty
/// line. `buf` must not start with blank lines (see [`leading_blank_len`]).
pub fn check(buf: &[u8]) -> Result<usize, CodecError> {
    let mut line_start = 0;
    while let Some(offset) = buf[line_start..].iter().position(|b| *b == b'\n') {
        let line_end = line_start + offset;
        let line = &buf[line_start..line_end];
        if line.is_empty() || line == b"\r" {
            return Ok(line_end + 1);
        }
        line_start = line_end + 1;
    }

    if buf.len() > MAX_MESSAGE_SIZE {
        return Err(CodecError::MessageTooLarge {
            size: buf.len(),
            max: MAX_MESSAGE_SIZE,
        });
    }
    Err(CodecError::Incomplete)
}

/// Decode one complete message previously delimited by [`check`].
pub fn parse(raw: &[u8]) -> Result<Message, CodecError> {
    let text = std::str::from_utf8(raw).map_err(|_| CodecError::InvalidUtf8)?;
    let mut message = Message::new();

    for line in text.lines() {
        let line = line.strip_suffix('\r').unwrap_or(line);
        if line.is_empty() {
            continue;
        }
        let (key, value) = line
            .split_once(':')
            .ok_or_else(|| CodecError::MalformedLine(line.to_string()))?;
        let key = key.trim();
        if key.is_empty() {
            return Err(CodecError::MalformedLine(line.to_string()));
        }
        let value = value.strip_prefix(' ').unwrap_or(value);
        message.push(key, value);
    }

    Ok(message)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_requires_blank_line() {
        assert!(matches!(
            check(b"Response: Success\r\nActionID: 1\r\n"),
            Err(CodecError::Incomplete)
        ));
        assert_eq!(check(b"Response: Success\r\n\r\nEvent: X\r\n").unwrap(), 21);
    }

    #[test]
    fn test_check_accepts_bare_newlines() {
        let raw = b"Event: FullyBooted\n\nEvent: Next\n";
        assert_eq!(check(raw).unwrap(), 20);
    }

    #[test]
    fn test_parse_preserves_order_and_duplicates() {
        let raw = b"Response: Success\r\nActionID: a-1\r\nOutput: first\r\nOutput: second: with colon\r\n\r\n";
        let message = parse(raw).unwrap();
        assert_eq!(message.field("response"), Some("Success"));
        assert_eq!(message.action_id(), Some("a-1"));
        let output: Vec<&str> = message.fields("Output").collect();
        assert_eq!(output, vec!["first", "second: with colon"]);
    }

    #[test]
    fn test_parse_keeps_empty_values() {
        let message = parse(b"Event: Test\r\nOutput:\r\n\r\n").unwrap();
        assert_eq!(message.field("Output"), Some(""));
        assert_eq!(message.event(), Some("Test"));
    }

    #[test]
    fn test_parse_rejects_line_without_separator() {
        let err = parse(b"Event: Test\r\nnot a field\r\n\r\n").unwrap_err();
        assert!(matches!(err, CodecError::MalformedLine(_)));
        assert!(err.is_recoverable());
    }

    #[test]
    fn test_parse_rejects_invalid_utf8() {
        let err = parse(b"Event: SMS\r\nMessage: \xff\xfe\r\n\r\n").unwrap_err();
        assert!(matches!(err, CodecError::InvalidUtf8));
        assert!(err.is_recoverable());
    }

    #[test]
    fn test_encode_writes_crlf_and_terminator() {
        let message = Message::action("Originate")
            .with("Variable", "__A=1")
            .with("Variable", "__B=2");
        let bytes = message.to_bytes().unwrap();
        assert_eq!(
            &bytes[..],
            b"Action: Originate\r\nVariable: __A=1\r\nVariable: __B=2\r\n\r\n"
        );
    }

    #[test]
    fn test_encode_refuses_line_breaks() {
        let message = Message::action("Originate").with("Variable", "__SMS_MESSAGE=a\r\nAction: Logoff");
        let err = message.to_bytes().unwrap_err();
        assert!(matches!(err, CodecError::UnsafeValue { ref field } if field == "Variable"));
    }

    #[test]
    fn test_set_replaces_existing_field() {
        let mut message = Message::action("Command").with("ActionID", "old");
        message.set("actionid", "new");
        assert_eq!(message.action_id(), Some("new"));
        assert_eq!(message.len(), 2);
    }

    #[test]
    fn test_first_field_skips_empty_values() {
        let message = Message::new().with("Device", "").with("QuectelName", "quectel0");
        assert_eq!(
            message.first_field(&["Device", "QuectelDevice", "QuectelName"]),
            Some("quectel0")
        );
    }

    #[test]
    fn test_leading_blank_len() {
        assert_eq!(leading_blank_len(b"\r\n\r\nEvent: X"), 4);
        assert_eq!(leading_blank_len(b"Event: X"), 0);
    }

    #[test]
    fn test_check_reports_oversized_message() {
        let raw = vec![b'a'; MAX_MESSAGE_SIZE + 1];
        let err = check(&raw).unwrap_err();
        assert!(matches!(err, CodecError::MessageTooLarge { .. }));
        assert!(!err.is_recoverable());
    }
}
