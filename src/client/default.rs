// ABOUTME: Default manager-interface client: login, event subscription, dispatch loop and action API
// ABOUTME: Single-shot per TCP session; once the transport ends the client must be replaced

use crate::client::correlator::PendingActions;
use crate::client::error::{AmiError, AmiResult};
use crate::client::lifecycle::{LifecycleState, Status};
use crate::client::types::{PeerTable, StatusInfo};
use crate::codec::{self, Message};
use crate::config::AmiConfig;
use crate::connection::{self, ConnectionReader, ConnectionWriter};
use crate::frame::{DomainEvent, Frame};
use crate::sim;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use chrono::{DateTime, Local, NaiveDate, NaiveDateTime, NaiveTime, TimeZone};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Action identifiers are unique for the lifetime of the process, so a late
/// reply from an earlier session can never satisfy a waiter in a later one.
static NEXT_ACTION_ID: AtomicU64 = AtomicU64::new(1);

fn next_action_id() -> String {
    format!("dongle-ami-{}", NEXT_ACTION_ID.fetch_add(1, Ordering::Relaxed))
}

/// Key under which a list-completion event for `action_id` is delivered.
fn completion_key(action_id: &str) -> String {
    format!("{}:complete", action_id)
}

/// Receiving ends of the client's bounded queues.
///
/// `events` carries every classified message not consumed by a waiter;
/// `errors` carries the terminal transport error when the session ends.
#[derive(Debug)]
pub struct ClientStreams {
    pub events: mpsc::Receiver<Frame>,
    pub errors: mpsc::Receiver<AmiError>,
}

/// State shared between the client handle and its dispatch loop
#[derive(Debug, Default)]
struct Shared {
    lifecycle: Mutex<LifecycleState>,
    pending: PendingActions,
    peers: RwLock<PeerTable>,
    closed: AtomicBool,
}

impl Shared {
    fn lifecycle(&self) -> MutexGuard<'_, LifecycleState> {
        self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Deliver one inbound message to its waiter, or classify it, apply any
    /// state change and forward it to the event queue.
    fn route(&self, message: Message, events: &mpsc::Sender<Frame>) {
        let message = match message.action_id() {
            Some(id) if message.event().is_none() => {
                let id = id.to_string();
                match self.pending.fulfill(&id, message) {
                    Ok(()) => return,
                    Err(unclaimed) => unclaimed,
                }
            }
            Some(id) if Frame::is_list_complete(&message) => {
                // The completion closes a list reply; its waiter gets a copy
                // and the event still goes to subscribers.
                let _ = self.pending.fulfill(&completion_key(id), message.clone());
                message
            }
            _ => message,
        };

        let frame = Frame::classify(message);
        match &frame {
            Frame::Lifecycle(event) => {
                self.lifecycle().on_event(*event);
                debug!("Lifecycle event {:?}, status now {}", event, self.lifecycle().status());
            }
            Frame::Domain(DomainEvent::PeerStatus { peer, registered }) => {
                let changed = self
                    .peers
                    .write()
                    .unwrap_or_else(PoisonError::into_inner)
                    .update(peer, *registered);
                if changed.is_some() {
                    info!("Peer {} registered={}", peer, registered);
                }
            }
            Frame::Domain(DomainEvent::PeerEntry { peer }) => {
                debug!("Peer entry: {}", peer);
            }
            Frame::Domain(DomainEvent::SmsReceived(sms)) => {
                info!("SMS received on {} from {}", sms.device, sms.sender);
            }
            Frame::Response(_) | Frame::Unrecognized(_) => {}
        }

        match events.try_send(frame) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => warn!("Event queue full, dropping event"),
            Err(TrySendError::Closed(_)) => {}
        }
    }
}

/// Read messages until the transport ends, routing each one.
async fn dispatch(
    mut reader: ConnectionReader<OwnedReadHalf>,
    shared: Arc<Shared>,
    events: mpsc::Sender<Frame>,
    errors: mpsc::Sender<AmiError>,
) {
    let terminal = loop {
        match reader.read_message().await {
            Ok(Some(message)) => shared.route(message, &events),
            Ok(None) => {
                info!("Manager interface closed the connection");
                break AmiError::ConnectionClosed;
            }
            Err(AmiError::Codec(e)) if e.is_recoverable() => {
                warn!("Discarding undecodable message: {}", e);
            }
            Err(e) => {
                warn!("Dispatch loop stopping: {}", e);
                break e;
            }
        }
    };

    shared.closed.store(true, Ordering::SeqCst);
    shared.lifecycle().on_transport_closed();
    shared.pending.clear();
    if errors.try_send(terminal).is_err() {
        warn!("Error queue full, dropping terminal transport error");
    }
}

/// Default manager-interface client
///
/// Owns one TCP session. The read half belongs to a background dispatch loop
/// that routes replies to waiting callers and everything else to a bounded
/// event queue; the write half is shared by callers behind an async lock.
#[derive(Debug)]
pub struct DefaultClient {
    writer: tokio::sync::Mutex<ConnectionWriter<OwnedWriteHalf>>,
    shared: Arc<Shared>,
    streams: Mutex<Option<ClientStreams>>,
    dispatch: Mutex<Option<JoinHandle<()>>>,
    config: AmiConfig,
}

impl DefaultClient {
    /// Connect, read the greeting, log in, start the dispatch loop and
    /// subscribe to events.
    pub async fn connect(config: &AmiConfig) -> AmiResult<DefaultClient> {
        let address = config.address();
        debug!("Connecting to manager interface at {}", address);
        let socket = tokio::time::timeout(config.command_timeout(), TcpStream::connect(&address))
            .await
            .map_err(|_| AmiError::timeout("connect"))??;

        let (mut reader, mut writer) = connection::split(socket);

        let greeting = tokio::time::timeout(config.command_timeout(), reader.read_banner())
            .await
            .map_err(|_| AmiError::timeout("greeting"))??;
        debug!("Greeting: {}", greeting);

        tokio::time::timeout(
            config.command_timeout(),
            login(&mut reader, &mut writer, config),
        )
        .await
        .map_err(|_| AmiError::timeout("Login"))??;
        info!("Logged in to manager interface at {} as {}", address, config.username);

        let (events_tx, events_rx) = mpsc::channel(config.event_queue_capacity.max(1));
        let (errors_tx, errors_rx) = mpsc::channel(config.error_queue_capacity.max(1));
        let shared = Arc::new(Shared::default());
        let handle = tokio::spawn(dispatch(reader, shared.clone(), events_tx, errors_tx));

        let client = DefaultClient {
            writer: tokio::sync::Mutex::new(writer),
            shared,
            streams: Mutex::new(Some(ClientStreams {
                events: events_rx,
                errors: errors_rx,
            })),
            dispatch: Mutex::new(Some(handle)),
            config: config.clone(),
        };

        let subscribe = Message::action("Events").with("EventMask", "on");
        if let Err(e) = client.request_checked(subscribe, config.command_timeout()).await {
            client.close().await;
            return Err(e);
        }

        client.shared.lifecycle().on_connected();
        Ok(client)
    }

    pub fn config(&self) -> &AmiConfig {
        &self.config
    }

    /// Take the event and error queues. Returns `None` after the first call.
    pub fn take_streams(&self) -> Option<ClientStreams> {
        self.streams
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    /// Whether the transport has ended.
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    pub fn status(&self) -> Status {
        self.shared.lifecycle().status()
    }

    /// Number of actions still waiting for a reply.
    pub fn pending_actions(&self) -> usize {
        self.shared.pending.len()
    }

    /// Send an action without waiting for its reply.
    ///
    /// An `ActionID` is assigned and returned; the reply, having no waiter,
    /// is forwarded to the event queue.
    pub async fn send_action(&self, mut action: Message) -> AmiResult<String> {
        self.ensure_open()?;
        let id = next_action_id();
        action.set(codec::ACTION_ID, id.clone());
        self.writer.lock().await.write_message(&action).await?;
        Ok(id)
    }

    /// Send an action and wait up to `timeout` for its reply.
    ///
    /// The response slot is registered before the action is written and is
    /// removed on every exit path.
    pub async fn request(&self, mut action: Message, timeout: Duration) -> AmiResult<Message> {
        self.ensure_open()?;
        let name = action_name(&action);
        let id = next_action_id();
        action.set(codec::ACTION_ID, id.clone());

        let mut pending = self.shared.pending.register(&id);
        self.writer.lock().await.write_message(&action).await?;

        match tokio::time::timeout(timeout, pending.recv()).await {
            Ok(Some(reply)) => Ok(reply),
            Ok(None) => Err(AmiError::ConnectionClosed),
            Err(_) => {
                warn!("Timed out after {:?} waiting for {} ({})", timeout, name, id);
                Err(AmiError::timeout(&name))
            }
        }
    }

    /// [`request`](Self::request) that also requires a success reply.
    pub async fn request_checked(&self, action: Message, timeout: Duration) -> AmiResult<Message> {
        let reply = self.request(action, timeout).await?;
        check_success(&reply)?;
        Ok(reply)
    }

    /// Send a list action and wait for both its reply and the list-completion
    /// event that closes it.
    pub async fn request_list(
        &self,
        mut action: Message,
        timeout: Duration,
    ) -> AmiResult<(Message, Message)> {
        self.ensure_open()?;
        let name = action_name(&action);
        let id = next_action_id();
        action.set(codec::ACTION_ID, id.clone());

        let mut reply_slot = self.shared.pending.register(&id);
        let mut complete_slot = self.shared.pending.register(&completion_key(&id));
        self.writer.lock().await.write_message(&action).await?;

        let exchange = async {
            let reply = reply_slot.recv().await.ok_or(AmiError::ConnectionClosed)?;
            check_success(&reply)?;
            let complete = complete_slot.recv().await.ok_or(AmiError::ConnectionClosed)?;
            Ok::<_, AmiError>((reply, complete))
        };
        tokio::time::timeout(timeout, exchange)
            .await
            .map_err(|_| AmiError::timeout(&name))?
    }

    /// Run a CLI command and return its output, one line per `Output` field.
    pub async fn send_command(&self, command: &str, timeout: Duration) -> AmiResult<String> {
        debug!("CLI command: {}", command);
        let action = Message::action("Command").with("Command", command);
        let reply = self.request_checked(action, timeout).await?;
        Ok(command_output(&reply))
    }

    /// Full configuration reload followed by the SIP stack reload, which a
    /// full reload does not reliably trigger.
    pub async fn reload(&self) -> AmiResult<()> {
        let timeout = self.config.command_timeout();
        self.request_checked(Message::action("Reload"), timeout).await?;
        self.send_command(&self.config.protocol_reload_command, timeout)
            .await?;
        info!("Configuration reloaded");
        Ok(())
    }

    /// Request an immediate PBX restart.
    ///
    /// Status becomes `Restarting` before the command is sent. The PBX may drop
    /// the session before replying, so a closed transport or a missing reply
    /// counts as accepted.
    pub async fn restart(&self) -> AmiResult<()> {
        self.shared.lifecycle().begin_restart(Instant::now());
        info!("Restarting PBX");

        let action = Message::action("Command").with("Command", "core restart now");
        match self
            .request_checked(action, self.config.command_timeout())
            .await
        {
            Ok(_) => Ok(()),
            Err(e) if e.is_fatal() || matches!(e, AmiError::Timeout { .. }) => {
                debug!("Restart command not acknowledged: {}", e);
                Ok(())
            }
            Err(e) => {
                self.shared.lifecycle().complete_restart();
                Err(e)
            }
        }
    }

    /// Seconds since the PBX started, from the startup date and time it
    /// reports in its own local clock.
    pub async fn get_uptime(&self) -> AmiResult<u64> {
        let reply = self
            .request_checked(Message::action("CoreStatus"), self.config.command_timeout())
            .await?;
        let date = reply.first_field(&["CoreStartupDate"]);
        let time = reply.first_field(&["CoreStartupTime"]);
        match (date, time) {
            (Some(date), Some(time)) => uptime_from_startup(date, time, Local::now()),
            _ => Err(AmiError::InvalidResponse(
                "missing CoreStartupDate or CoreStartupTime".to_string(),
            )),
        }
    }

    /// Hand an outbound SMS to the dialplan.
    ///
    /// Device and text travel as channel variables, never inside free text.
    /// `SMS_MESSAGE` holds the text with line breaks turned into spaces;
    /// `SMS_MESSAGE_BASE64` holds the exact text, line breaks included, for
    /// dialplans that decode it with `BASE64_DECODE`.
    pub async fn send_sms(&self, device: &str, number: &str, text: &str) -> AmiResult<()> {
        crate::client::dongle::validate_device_id(device)?;
        validate_phone_number(number)?;
        if text.is_empty() {
            return Err(AmiError::InvalidData("message text is empty".to_string()));
        }

        let context = &self.config.sms_context;
        let action = Message::action("Originate")
            .with("Channel", format!("Local/{}@{}", number, context))
            .with("Context", context.as_str())
            .with("Exten", number)
            .with("Priority", "1")
            .with("Async", "true")
            .with("Variable", format!("__QUECTEL_DEVICE={}", device))
            .with("Variable", format!("__SMS_MESSAGE={}", sim::normalize_content(text)))
            .with("Variable", format!("__SMS_MESSAGE_BASE64={}", STANDARD.encode(text)));

        info!("Sending SMS via {} to {} ({} chars)", device, number, text.chars().count());
        self.request_checked(action, self.config.command_timeout())
            .await?;
        Ok(())
    }

    /// Number of active channels.
    pub async fn channel_count(&self) -> AmiResult<usize> {
        let (_, complete) = self
            .request_list(Message::action("CoreShowChannels"), self.config.command_timeout())
            .await?;
        let items = complete.first_field(&["ListItems"]).unwrap_or("0");
        items
            .trim()
            .parse()
            .map_err(|_| AmiError::InvalidResponse(format!("bad ListItems {:?}", items)))
    }

    /// Number of peers last reported as registered.
    pub fn registration_count(&self) -> usize {
        self.shared
            .peers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .registered_count()
    }

    /// Aggregate snapshot. Counters that cannot be read are reported as 0.
    pub async fn status_info(&self) -> StatusInfo {
        let mut info = StatusInfo::with_status(self.status());
        if self.is_closed() {
            return info;
        }

        info.uptime = match self.get_uptime().await {
            Ok(uptime) => uptime,
            Err(e) => {
                debug!("Uptime unavailable: {}", e);
                0
            }
        };
        info.channels = match self.channel_count().await {
            Ok(channels) => channels,
            Err(e) => {
                debug!("Channel count unavailable: {}", e);
                0
            }
        };
        info.registrations = self.registration_count();
        info.status = self.status();
        info
    }

    /// Confirm a pending restart. Returns false if none was in progress.
    pub fn complete_restart(&self) -> bool {
        self.shared.lifecycle().complete_restart()
    }

    /// Force a restart that has exceeded `ceiling` to complete.
    pub fn expire_restart(&self, ceiling: Duration) -> Option<Duration> {
        self.shared.lifecycle().expire_restart(Instant::now(), ceiling)
    }

    /// Time since the current restart began.
    pub fn restart_elapsed(&self) -> Option<Duration> {
        self.shared.lifecycle().restart_elapsed(Instant::now())
    }

    /// Log off and tear the session down.
    pub async fn close(&self) {
        if !self.is_closed() {
            let logoff = Message::action("Logoff");
            if let Err(e) = self.request(logoff, Duration::from_secs(1)).await {
                debug!("Logoff: {}", e);
            }
        }
        if let Err(e) = self.writer.lock().await.shutdown().await {
            debug!("Shutdown of write half: {}", e);
        }
        self.abort_dispatch();
        self.shared.closed.store(true, Ordering::SeqCst);
        self.shared.pending.clear();
    }

    fn abort_dispatch(&self) {
        if let Some(handle) = self
            .dispatch
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            handle.abort();
        }
    }

    fn ensure_open(&self) -> AmiResult<()> {
        if self.is_closed() {
            Err(AmiError::ConnectionClosed)
        } else {
            Ok(())
        }
    }
}

impl Drop for DefaultClient {
    fn drop(&mut self) {
        self.abort_dispatch();
    }
}

/// Send `Login` and read until its reply arrives. Events arriving first are
/// discarded; the subscription has not been made yet.
async fn login(
    reader: &mut ConnectionReader<OwnedReadHalf>,
    writer: &mut ConnectionWriter<OwnedWriteHalf>,
    config: &AmiConfig,
) -> AmiResult<()> {
    let id = next_action_id();
    let action = Message::action("Login")
        .with("Username", config.username.as_str())
        .with("Secret", config.password.as_str())
        .with(codec::ACTION_ID, id.as_str());
    writer.write_message(&action).await?;

    loop {
        let Some(reply) = reader.read_message().await? else {
            return Err(AmiError::ConnectionClosed);
        };
        if reply.event().is_some() || reply.action_id() != Some(id.as_str()) {
            continue;
        }
        return match reply.field(codec::RESPONSE) {
            Some(r) if r.eq_ignore_ascii_case("Success") => Ok(()),
            _ => Err(AmiError::Authentication(
                reply
                    .field(codec::MESSAGE)
                    .unwrap_or("login rejected")
                    .to_string(),
            )),
        };
    }
}

fn action_name(action: &Message) -> String {
    action.field(codec::ACTION).unwrap_or("action").to_string()
}

/// `Success` and `Follows` are success replies; `Error` carries the peer's
/// reason in `Message`.
pub(crate) fn check_success(reply: &Message) -> AmiResult<()> {
    match reply.field(codec::RESPONSE) {
        Some(r) if r.eq_ignore_ascii_case("Success") || r.eq_ignore_ascii_case("Follows") => {
            Ok(())
        }
        Some(_) => Err(AmiError::Rejected(
            reply
                .field(codec::MESSAGE)
                .unwrap_or("unknown error")
                .to_string(),
        )),
        None => Err(AmiError::InvalidResponse(
            "reply has no Response field".to_string(),
        )),
    }
}

/// CLI output of a `Command` reply: the `Output` fields joined with newlines,
/// or the `data` field some channel drivers use instead.
pub(crate) fn command_output(reply: &Message) -> String {
    let lines: Vec<&str> = reply.fields("Output").collect();
    if lines.is_empty() {
        reply.field("data").unwrap_or_default().to_string()
    } else {
        lines.join("\n")
    }
}

/// Seconds between a reported startup date (`YYYY-MM-DD`) and time
/// (`HH:MM:SS`) in local time, and `now`.
///
/// A startup in the future means the clocks disagree; that is reported as 0
/// rather than as a negative uptime.
pub fn uptime_from_startup(date: &str, time: &str, now: DateTime<Local>) -> AmiResult<u64> {
    let date = NaiveDate::parse_from_str(date.trim(), "%Y-%m-%d")
        .map_err(|e| AmiError::InvalidResponse(format!("bad startup date {:?}: {}", date, e)))?;
    let time = NaiveTime::parse_from_str(time.trim(), "%H:%M:%S")
        .map_err(|e| AmiError::InvalidResponse(format!("bad startup time {:?}: {}", time, e)))?;
    let started = Local
        .from_local_datetime(&NaiveDateTime::new(date, time))
        .earliest()
        .ok_or_else(|| AmiError::InvalidResponse("startup time does not exist locally".into()))?;

    let seconds = (now - started).num_seconds();
    if seconds < 0 {
        warn!(
            "Negative uptime {}s (startup {}, now {}); reporting 0",
            seconds, started, now
        );
        return Ok(0);
    }
    Ok(seconds as u64)
}

/// Digits with an optional leading `+`.
pub fn validate_phone_number(number: &str) -> AmiResult<()> {
    let digits = number.strip_prefix('+').unwrap_or(number);
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(AmiError::InvalidData(format!(
            "invalid phone number {:?}",
            number
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    #[test]
    fn test_action_ids_are_unique() {
        let a = next_action_id();
        let b = next_action_id();
        assert_ne!(a, b);
        assert!(a.starts_with("dongle-ami-"));
    }

    #[test]
    fn test_uptime_from_startup() {
        let now = Local.with_ymd_and_hms(2025, 1, 22, 14, 0, 0).unwrap();
        assert_eq!(uptime_from_startup("2025-01-22", "13:00:00", now).unwrap(), 3600);
    }

    #[test]
    fn test_negative_uptime_is_zero() {
        let now = Local.with_ymd_and_hms(2025, 1, 22, 14, 0, 0).unwrap();
        let later = now + ChronoDuration::hours(2);
        let date = later.format("%Y-%m-%d").to_string();
        let time = later.format("%H:%M:%S").to_string();
        assert_eq!(uptime_from_startup(&date, &time, now).unwrap(), 0);
    }

    #[test]
    fn test_uptime_rejects_garbage() {
        let now = Local::now();
        assert!(matches!(
            uptime_from_startup("yesterday", "13:00:00", now),
            Err(AmiError::InvalidResponse(_))
        ));
    }

    #[test]
    fn test_check_success() {
        assert!(check_success(&Message::new().with("Response", "Success")).is_ok());
        assert!(check_success(&Message::new().with("Response", "Follows")).is_ok());

        let err = check_success(
            &Message::new()
                .with("Response", "Error")
                .with("Message", "Permission denied"),
        )
        .unwrap_err();
        assert!(matches!(err, AmiError::Rejected(ref m) if m == "Permission denied"));

        assert!(matches!(
            check_success(&Message::new()),
            Err(AmiError::InvalidResponse(_))
        ));
    }

    #[test]
    fn test_command_output() {
        let reply = Message::new()
            .with("Response", "Success")
            .with("Output", "+CMGL: 1,\"REC READ\",\"10010\",,\"25/01/22 13:53:08+32\"")
            .with("Output", "Hello");
        assert_eq!(
            command_output(&reply),
            "+CMGL: 1,\"REC READ\",\"10010\",,\"25/01/22 13:53:08+32\"\nHello"
        );

        let legacy = Message::new().with("Response", "Success").with("data", "OK");
        assert_eq!(command_output(&legacy), "OK");
        assert_eq!(command_output(&Message::new()), "");
    }

    #[test]
    fn test_phone_number_validation() {
        assert!(validate_phone_number("+8613800000000").is_ok());
        assert!(validate_phone_number("10086").is_ok());
        assert!(validate_phone_number("").is_err());
        assert!(validate_phone_number("+").is_err());
        assert!(validate_phone_number("123;456").is_err());
        assert!(validate_phone_number("1 23").is_err());
    }

    #[test]
    fn test_route_fulfills_waiter_and_forwards_rest() {
        let shared = Shared::default();
        let (tx, mut rx) = mpsc::channel(4);

        let pending = shared.pending.register("x-1");
        shared.route(
            Message::new().with("Response", "Success").with("ActionID", "x-1"),
            &tx,
        );
        assert!(!shared.pending.contains("x-1"));
        assert!(rx.try_recv().is_err());
        drop(pending);

        // Unclaimed reply is forwarded as a response frame.
        shared.route(
            Message::new().with("Response", "Success").with("ActionID", "x-2"),
            &tx,
        );
        assert!(matches!(rx.try_recv().unwrap(), Frame::Response(_)));

        shared.route(
            Message::new()
                .with("Event", "PeerStatus")
                .with("Peer", "PJSIP/1001")
                .with("PeerStatus", "Registered"),
            &tx,
        );
        assert!(matches!(rx.try_recv().unwrap(), Frame::Domain(_)));
        assert_eq!(shared.peers.read().unwrap().registered_count(), 1);
    }

    #[test]
    fn test_route_drops_when_queue_full() {
        let shared = Shared::default();
        let (tx, mut rx) = mpsc::channel(1);
        shared.route(Message::new().with("Event", "First"), &tx);
        shared.route(Message::new().with("Event", "Second"), &tx);

        match rx.try_recv().unwrap() {
            Frame::Unrecognized(message) => assert_eq!(message.event(), Some("First")),
            other => panic!("unexpected frame {:?}", other),
        }
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_route_updates_lifecycle() {
        let shared = Shared::default();
        let (tx, _rx) = mpsc::channel(8);
        shared.lifecycle().on_connected();
        shared.route(Message::new().with("Event", "Shutdown"), &tx);
        assert_eq!(shared.lifecycle().status(), Status::Error);
        shared.route(Message::new().with("Event", "FullyBooted"), &tx);
        assert_eq!(shared.lifecycle().status(), Status::Normal);
    }

    #[tokio::test]
    async fn test_list_completion_delivered_and_forwarded() {
        let shared = Shared::default();
        let (tx, mut rx) = mpsc::channel(8);
        let mut complete = shared.pending.register(&completion_key("x-9"));

        shared.route(
            Message::new()
                .with("Event", "CoreShowChannelsComplete")
                .with("ActionID", "x-9")
                .with("EventList", "Complete")
                .with("ListItems", "3"),
            &tx,
        );

        let delivered = complete.recv().await.unwrap();
        assert_eq!(delivered.field("ListItems"), Some("3"));
        assert!(matches!(rx.try_recv().unwrap(), Frame::Unrecognized(_)));
    }
}
