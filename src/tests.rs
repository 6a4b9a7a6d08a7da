//! Integration tests against an in-process mock of the PBX manager interface

use crate::client::{AmiError, DefaultClient, SmsNotification, Status, StatusInfo};
use crate::codec::Message;
use crate::config::{AmiConfig, ManagerConfig, PipelineConfig};
use crate::connection;
use crate::frame::Frame;
use crate::manager::{ConnectionManager, ManagerState, StatusSubscriber};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

#[cfg(test)]
mod integration_tests {
    use super::*;
    use crate::notify::tests::RecordingNotifier;
    use crate::notify::{ChannelKind, NotifierRegistry};
    use crate::pipeline::SmsPipeline;
    use crate::store::MemoryStore;
    use base64::Engine as _;
    use base64::engine::general_purpose::STANDARD;
    use chrono::Local;

    const BANNER: &[u8] = b"Asterisk Call Manager/7.0.3\r\n";

    const SIM_LISTING: &[&str] = &[
        "+CMGL: 1,\"REC READ\",\"10010\",,\"25/01/22 09:00:00+32\"",
        "Balance 12.00",
        "",
        "+CMGL: 2,\"REC UNREAD\",\"+8613800000000\",,\"25/01/22 13:53:08+32\"",
        "Hello",
        "world",
        "",
        "OK",
    ];

    enum Control {
        Push(Message),
        Close,
    }

    /// Serves one session at a time, recording every action it receives.
    struct MockPbx {
        port: u16,
        received: Arc<Mutex<Vec<Message>>>,
        connections: Arc<AtomicUsize>,
        control: mpsc::UnboundedSender<Control>,
    }

    impl MockPbx {
        async fn start() -> MockPbx {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let port = listener.local_addr().unwrap().port();
            let received = Arc::new(Mutex::new(Vec::new()));
            let connections = Arc::new(AtomicUsize::new(0));
            let (control, control_rx) = mpsc::unbounded_channel();

            tokio::spawn(serve(
                listener,
                received.clone(),
                connections.clone(),
                control_rx,
            ));

            MockPbx {
                port,
                received,
                connections,
                control,
            }
        }

        fn config(&self) -> AmiConfig {
            AmiConfig::new("127.0.0.1", self.port, "admin", "secret")
        }

        fn push(&self, message: Message) {
            let _ = self.control.send(Control::Push(message));
        }

        fn close_session(&self) {
            let _ = self.control.send(Control::Close);
        }

        fn actions(&self) -> Vec<String> {
            self.received
                .lock()
                .unwrap()
                .iter()
                .filter_map(|m| m.field("Action").map(str::to_string))
                .collect()
        }

        fn commands(&self) -> Vec<String> {
            self.received
                .lock()
                .unwrap()
                .iter()
                .filter_map(|m| m.field("Command").map(str::to_string))
                .collect()
        }

        fn last_action(&self, name: &str) -> Option<Message> {
            self.received
                .lock()
                .unwrap()
                .iter()
                .rev()
                .find(|m| m.field("Action") == Some(name))
                .cloned()
        }
    }

    async fn serve(
        listener: TcpListener,
        received: Arc<Mutex<Vec<Message>>>,
        connections: Arc<AtomicUsize>,
        mut control: mpsc::UnboundedReceiver<Control>,
    ) {
        loop {
            let Ok((socket, _)) = listener.accept().await else {
                return;
            };
            connections.fetch_add(1, Ordering::SeqCst);
            session(socket, &received, &mut control).await;
        }
    }

    async fn session(
        mut socket: TcpStream,
        received: &Mutex<Vec<Message>>,
        control: &mut mpsc::UnboundedReceiver<Control>,
    ) {
        if socket.write_all(BANNER).await.is_err() {
            return;
        }
        let (mut reader, mut writer) = connection::split(socket);

        loop {
            tokio::select! {
                command = control.recv() => match command {
                    Some(Control::Push(message)) => {
                        if writer.write_message(&message).await.is_err() {
                            return;
                        }
                    }
                    Some(Control::Close) | None => return,
                },
                action = reader.read_message() => {
                    let Ok(Some(action)) = action else {
                        return;
                    };
                    received.lock().unwrap().push(action.clone());
                    let (replies, hang_up) = respond(&action);
                    for reply in &replies {
                        if writer.write_message(reply).await.is_err() {
                            return;
                        }
                    }
                    if hang_up {
                        return;
                    }
                }
            }
        }
    }

    /// Replies to one action, and whether to hang up afterwards.
    fn respond(action: &Message) -> (Vec<Message>, bool) {
        let id = action.action_id().unwrap_or_default();
        let reply = |response: &str| {
            Message::new()
                .with("Response", response)
                .with("ActionID", id)
        };

        let replies = match action.field("Action").unwrap_or_default() {
            "Login" if action.field("Secret") == Some("secret") => {
                vec![reply("Success").with("Message", "Authentication accepted")]
            }
            "Login" => vec![reply("Error").with("Message", "Authentication failed")],
            "Events" | "Reload" => vec![reply("Success")],
            "CoreStatus" => {
                let started = Local::now() - chrono::Duration::hours(1);
                vec![
                    reply("Success")
                        .with("CoreStartupDate", started.format("%Y-%m-%d").to_string())
                        .with("CoreStartupTime", started.format("%H:%M:%S").to_string())
                        .with("CoreCurrentCalls", "0"),
                ]
            }
            "CoreShowChannels" => {
                let channel = |name: &str| {
                    Message::new()
                        .with("Event", "CoreShowChannel")
                        .with("ActionID", id)
                        .with("Channel", name)
                };
                vec![
                    reply("Success")
                        .with("EventList", "start")
                        .with("Message", "Channels will follow"),
                    channel("PJSIP/1001-00000001"),
                    channel("Local/10086@quectel-sms-00000002;1"),
                    Message::new()
                        .with("Event", "CoreShowChannelsComplete")
                        .with("ActionID", id)
                        .with("EventList", "Complete")
                        .with("ListItems", "2"),
                ]
            }
            "Command" => {
                let command = action.field("Command").unwrap_or_default();
                if command.ends_with("AT+CMGL=\"ALL\"") {
                    let mut listing = reply("Success");
                    for line in SIM_LISTING {
                        listing.push("Output", *line);
                    }
                    vec![listing]
                } else if command.contains(" AT+CMGF=") || command.contains(" AT+CMGD=") {
                    vec![reply("Success").with("Output", "OK")]
                } else if command == "core restart now" || command == "pjsip reload" {
                    vec![reply("Success")]
                } else {
                    vec![reply("Error").with("Message", "No such command")]
                }
            }
            "Originate" => vec![reply("Success").with("Message", "Originate successfully queued")],
            "Logoff" => {
                return (
                    vec![reply("Goodbye").with("Message", "Thanks for all the fish.")],
                    true,
                );
            }
            "Silent" => Vec::new(),
            _ => vec![reply("Error").with("Message", "Invalid/unknown command")],
        };
        (replies, false)
    }

    /// Poll `condition` for up to five seconds.
    async fn eventually<F: Fn() -> bool>(condition: F) -> bool {
        for _ in 0..100 {
            if condition() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        condition()
    }

    fn sms_event(text: &str) -> Message {
        Message::new()
            .with("Event", "UserEvent")
            .with("UserEvent", "SMSReceived")
            .with("Device", "quectel0")
            .with("Sender", "+8613800000000")
            .with("MessageBase64", STANDARD.encode(text))
            .with("Timestamp", "25/01/22 13:53:08+32")
    }

    fn test_policy() -> ManagerConfig {
        ManagerConfig {
            max_connect_attempts: 3,
            retry_delay_secs: 0,
            reconnect_backoff_secs: 1,
            status_interval_secs: 60,
            ..Default::default()
        }
    }

    #[derive(Default)]
    struct Collector {
        statuses: Mutex<Vec<Status>>,
        sms: Mutex<Vec<SmsNotification>>,
    }

    impl StatusSubscriber for Collector {
        fn on_status_update(&self, info: &StatusInfo) {
            self.statuses.lock().unwrap().push(info.status);
        }

        fn on_sms_received(&self, sms: &SmsNotification) {
            self.sms.lock().unwrap().push(sms.clone());
        }
    }

    #[tokio::test]
    async fn test_login_and_event_subscription() {
        let pbx = MockPbx::start().await;
        let client = DefaultClient::connect(&pbx.config()).await.unwrap();

        assert_eq!(client.status(), Status::Normal);
        assert!(!client.is_closed());
        assert_eq!(pbx.actions(), vec!["Login", "Events"]);
        let events = pbx.last_action("Events").unwrap();
        assert_eq!(events.field("EventMask"), Some("on"));

        client.close().await;
        assert!(client.is_closed());
        assert_eq!(pbx.actions().last().map(String::as_str), Some("Logoff"));
    }

    #[tokio::test]
    async fn test_login_rejected() {
        let pbx = MockPbx::start().await;
        let mut config = pbx.config();
        config.password = "wrong".to_string();

        match DefaultClient::connect(&config).await {
            Err(AmiError::Authentication(reason)) => assert_eq!(reason, "Authentication failed"),
            other => panic!("expected authentication failure, got {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn test_timeout_releases_response_slot() {
        let pbx = MockPbx::start().await;
        let client = DefaultClient::connect(&pbx.config()).await.unwrap();

        let err = client
            .request(Message::action("Silent"), Duration::from_millis(200))
            .await
            .unwrap_err();
        assert!(matches!(err, AmiError::Timeout { ref action } if action == "Silent"));
        assert_eq!(client.pending_actions(), 0);

        // The session is still usable.
        let output = client
            .send_command("quectel cmd quectel0 AT+CMGF=1", Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(output, "OK");
        assert_eq!(client.pending_actions(), 0);
    }

    #[tokio::test]
    async fn test_command_rejection_carries_reason() {
        let pbx = MockPbx::start().await;
        let client = DefaultClient::connect(&pbx.config()).await.unwrap();

        let err = client
            .send_command("frobnicate", Duration::from_secs(2))
            .await
            .unwrap_err();
        assert!(matches!(err, AmiError::Rejected(ref reason) if reason == "No such command"));
        assert!(!client.is_closed());
    }

    #[tokio::test]
    async fn test_channel_count_waits_for_list_completion() {
        let pbx = MockPbx::start().await;
        let client = DefaultClient::connect(&pbx.config()).await.unwrap();
        let mut streams = client.take_streams().unwrap();
        assert!(client.take_streams().is_none());

        assert_eq!(client.channel_count().await.unwrap(), 2);

        // Items and the completion still reach the event queue.
        let mut names = Vec::new();
        while let Ok(Some(frame)) =
            tokio::time::timeout(Duration::from_millis(500), streams.events.recv()).await
        {
            if let Frame::Unrecognized(message) = frame {
                names.extend(message.event().map(str::to_string));
            }
            if names.last().map(String::as_str) == Some("CoreShowChannelsComplete") {
                break;
            }
        }
        assert_eq!(
            names,
            vec!["CoreShowChannel", "CoreShowChannel", "CoreShowChannelsComplete"]
        );
    }

    #[tokio::test]
    async fn test_uptime_from_core_status() {
        let pbx = MockPbx::start().await;
        let client = DefaultClient::connect(&pbx.config()).await.unwrap();

        let uptime = client.get_uptime().await.unwrap();
        assert!((3590..=3610).contains(&uptime), "uptime {}", uptime);

        let info = client.status_info().await;
        assert_eq!(info.status, Status::Normal);
        assert_eq!(info.channels, 2);
        assert_eq!(info.registrations, 0);
    }

    #[tokio::test]
    async fn test_list_and_find_and_delete_sms() {
        let pbx = MockPbx::start().await;
        let client = DefaultClient::connect(&pbx.config()).await.unwrap();

        let messages = client.list_sms("quectel0").await.unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].content, "Balance 12.00");
        assert_eq!(messages[1].index, 2);
        assert_eq!(messages[1].content, "Hello\nworld");

        let found = client
            .find_and_delete_sms("quectel0", "+8613800000000", "25/01/22 13:55:00+32", "Hello world")
            .await
            .unwrap();
        assert_eq!(found, Some(2));
        assert_eq!(
            pbx.commands().last().map(String::as_str),
            Some("quectel cmd quectel0 AT+CMGD=2")
        );

        // Outside the tolerance nothing is deleted.
        let missing = client
            .find_and_delete_sms("quectel0", "+8613800000000", "25/01/22 15:00:00+32", "Hello world")
            .await
            .unwrap();
        assert_eq!(missing, None);

        assert!(matches!(
            client.list_sms("quectel0; core stop now").await,
            Err(AmiError::InvalidData(_))
        ));
    }

    #[tokio::test]
    async fn test_deletes_switch_to_text_mode_first() {
        let pbx = MockPbx::start().await;
        let client = DefaultClient::connect(&pbx.config()).await.unwrap();

        client.delete_sms("quectel0", 3).await.unwrap();
        client.delete_all_sms("quectel1").await.unwrap();
        assert_eq!(
            pbx.commands(),
            vec![
                "quectel cmd quectel0 AT+CMGF=1",
                "quectel cmd quectel0 AT+CMGD=3",
                "quectel cmd quectel1 AT+CMGF=1",
                "quectel cmd quectel1 AT+CMGD=1,4",
            ]
        );

        assert!(matches!(
            client.delete_sms("quectel0", 0).await,
            Err(AmiError::InvalidData(_))
        ));
        assert_eq!(pbx.commands().len(), 4);
    }

    #[tokio::test]
    async fn test_send_sms_passes_text_as_variables() {
        let pbx = MockPbx::start().await;
        let client = DefaultClient::connect(&pbx.config()).await.unwrap();

        client.send_sms("quectel0", "10086", "CXYE").await.unwrap();

        let originate = pbx.last_action("Originate").unwrap();
        assert_eq!(originate.field("Channel"), Some("Local/10086@quectel-sms"));
        assert_eq!(originate.field("Exten"), Some("10086"));
        let variables: Vec<&str> = originate.fields("Variable").collect();
        assert_eq!(
            variables,
            vec![
                "__QUECTEL_DEVICE=quectel0",
                "__SMS_MESSAGE=CXYE",
                "__SMS_MESSAGE_BASE64=Q1hZRQ==",
            ]
        );

        assert!(matches!(
            client.send_sms("quectel0", "100 86", "hi").await,
            Err(AmiError::InvalidData(_))
        ));
        assert!(matches!(
            client.send_sms("quectel0", "10086", "").await,
            Err(AmiError::InvalidData(_))
        ));
        let originates = pbx.actions().iter().filter(|a| *a == "Originate").count();
        assert_eq!(originates, 1);
    }

    #[tokio::test]
    async fn test_send_multiline_sms() {
        let pbx = MockPbx::start().await;
        let client = DefaultClient::connect(&pbx.config()).await.unwrap();

        client
            .send_sms("quectel0", "10086", "line one\r\nline two")
            .await
            .unwrap();

        let originate = pbx.last_action("Originate").unwrap();
        let variables: Vec<&str> = originate.fields("Variable").collect();
        assert_eq!(variables[1], "__SMS_MESSAGE=line one  line two");
        let encoded = variables[2].strip_prefix("__SMS_MESSAGE_BASE64=").unwrap();
        assert_eq!(STANDARD.decode(encoded).unwrap(), b"line one\r\nline two");

        // The session survives and keeps answering.
        assert_eq!(client.status(), Status::Normal);
        client.send_sms("quectel0", "10086", "again").await.unwrap();
    }

    #[tokio::test]
    async fn test_transport_close_ends_session() {
        let pbx = MockPbx::start().await;
        let client = DefaultClient::connect(&pbx.config()).await.unwrap();
        let mut streams = client.take_streams().unwrap();

        pbx.close_session();

        let err = tokio::time::timeout(Duration::from_secs(2), streams.errors.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(err, AmiError::ConnectionClosed));
        assert!(client.is_closed());
        assert_eq!(client.status(), Status::Error);
        assert!(matches!(
            client.send_command("core show uptime", Duration::from_secs(1)).await,
            Err(AmiError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_restart_completes_on_fully_booted() {
        let pbx = MockPbx::start().await;
        let client = DefaultClient::connect(&pbx.config()).await.unwrap();

        client.restart().await.unwrap();
        assert_eq!(client.status(), Status::Restarting);
        assert!(client.restart_elapsed().is_some());
        assert!(pbx.commands().contains(&"core restart now".to_string()));

        pbx.push(Message::new().with("Event", "Shutdown"));
        pbx.push(Message::new().with("Event", "FullyBooted"));
        assert!(eventually(|| client.status() == Status::Normal).await);
        assert!(client.restart_elapsed().is_none());
    }

    #[tokio::test]
    async fn test_reload_runs_protocol_reload() {
        let pbx = MockPbx::start().await;
        let client = DefaultClient::connect(&pbx.config()).await.unwrap();

        client.reload().await.unwrap();
        assert!(pbx.actions().contains(&"Reload".to_string()));
        assert_eq!(pbx.commands().last().map(String::as_str), Some("pjsip reload"));
    }

    #[tokio::test]
    async fn test_manager_fans_out_sms_and_status() {
        let pbx = MockPbx::start().await;
        let manager = ConnectionManager::new(pbx.config(), test_policy());
        let collector = Arc::new(Collector::default());
        manager.subscribe(collector.clone());

        manager.init().await.unwrap();
        assert_eq!(manager.state(), ManagerState::Connected);

        pbx.push(sms_event("Hello\nworld"));
        assert!(eventually(|| !collector.sms.lock().unwrap().is_empty()).await);
        let sms = collector.sms.lock().unwrap()[0].clone();
        assert_eq!(sms.device, "quectel0");
        assert_eq!(sms.sender, "+8613800000000");
        assert_eq!(sms.text, "Hello world");

        // The status loop publishes once on start.
        assert!(eventually(|| !collector.statuses.lock().unwrap().is_empty()).await);
        assert_eq!(collector.statuses.lock().unwrap()[0], Status::Normal);

        manager.shutdown().await;
        assert_eq!(manager.state(), ManagerState::Disconnected);
        assert!(matches!(manager.client(), Err(AmiError::NotConnected)));
    }

    fn core_status_requests(pbx: &MockPbx) -> usize {
        pbx.actions().iter().filter(|a| *a == "CoreStatus").count()
    }

    /// Start a manager and wait for the first status round to finish.
    async fn settled_manager(pbx: &MockPbx, policy: ManagerConfig) -> Arc<ConnectionManager> {
        let manager = ConnectionManager::new(pbx.config(), policy);
        let collector = Arc::new(Collector::default());
        manager.subscribe(collector.clone());
        manager.init().await.unwrap();
        assert!(eventually(|| !collector.statuses.lock().unwrap().is_empty()).await);
        manager
    }

    #[tokio::test]
    async fn test_status_poll_completes_restart_when_uptime_answers() {
        let pbx = MockPbx::start().await;
        let manager = settled_manager(&pbx, test_policy()).await;

        manager.restart().await.unwrap();
        let client = manager.client().unwrap();
        assert_eq!(client.status(), Status::Restarting);
        let before = core_status_requests(&pbx);

        // No FullyBooted arrives; the uptime query is the confirmation.
        let info = manager.update_status().await;
        assert_eq!(info.status, Status::Normal);
        assert_eq!(client.status(), Status::Normal);
        assert!(client.restart_elapsed().is_none());
        assert_eq!(core_status_requests(&pbx), before + 2);

        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_status_poll_forces_restart_past_ceiling() {
        let pbx = MockPbx::start().await;
        let policy = ManagerConfig {
            restart_timeout_secs: 0,
            ..test_policy()
        };
        let manager = settled_manager(&pbx, policy).await;

        manager.restart().await.unwrap();
        let client = manager.client().unwrap();
        assert_eq!(client.status(), Status::Restarting);
        let before = core_status_requests(&pbx);

        let info = manager.update_status().await;
        assert_eq!(info.status, Status::Normal);
        assert!(client.restart_elapsed().is_none());
        // Only the snapshot queried uptime; completion did not wait for it.
        assert_eq!(core_status_requests(&pbx), before + 1);

        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_manager_reconnects_after_session_loss() {
        let pbx = MockPbx::start().await;
        let manager = ConnectionManager::new(pbx.config(), test_policy());
        manager.init().await.unwrap();
        let first = manager.client().unwrap();
        assert_eq!(pbx.connections.load(Ordering::SeqCst), 1);

        pbx.close_session();

        assert!(
            eventually(|| {
                pbx.connections.load(Ordering::SeqCst) == 2
                    && manager
                        .client()
                        .map(|current| !Arc::ptr_eq(&current, &first))
                        .unwrap_or(false)
            })
            .await
        );
        assert!(first.is_closed());
        assert_eq!(manager.client().unwrap().status(), Status::Normal);

        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_manager_gives_up_after_bounded_attempts() {
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };
        let policy = ManagerConfig {
            max_connect_attempts: 2,
            retry_delay_secs: 0,
            ..Default::default()
        };
        let manager = ConnectionManager::new(AmiConfig::new("127.0.0.1", port, "admin", "secret"), policy);

        match manager.init().await {
            Err(AmiError::RetriesExhausted { attempts, last }) => {
                assert_eq!(attempts, 2);
                assert!(last.is_fatal());
            }
            other => panic!("expected RetriesExhausted, got {:?}", other),
        }
        assert_eq!(manager.state(), ManagerState::Disconnected);
    }

    #[tokio::test]
    async fn test_sms_pipeline_end_to_end() {
        let pbx = MockPbx::start().await;
        let manager = ConnectionManager::new(pbx.config(), test_policy());

        let store = Arc::new(MemoryStore::new());
        let notifier = RecordingNotifier::new(ChannelKind::Telegram, false);
        let mut notifiers = NotifierRegistry::new();
        notifiers.register(notifier.clone());
        let config = PipelineConfig {
            delete_after_delivery: true,
            ..Default::default()
        };
        let pipeline = SmsPipeline::from_config(&config, store.clone(), notifiers, manager.clone());
        manager.subscribe(Arc::new(pipeline.queue()));

        manager.init().await.unwrap();
        pbx.push(sms_event("Hello\nworld"));
        // The same SMS reported twice is stored once.
        pbx.push(sms_event("Hello\nworld"));

        let deleted = "quectel cmd quectel0 AT+CMGD=2".to_string();
        assert!(eventually(|| pbx.commands().contains(&deleted)).await);

        pipeline.shutdown().await;
        manager.shutdown().await;

        let records = store.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].record.content, "Hello world");
        assert_eq!(records[0].record.sim_timestamp.as_deref(), Some("25/01/22 13:53:08+32"));
        assert!(records[0].pushed_at.is_some());
        assert_eq!(
            notifier.sent(),
            vec!["SMS from +8613800000000 (device: quectel0):\nHello world"]
        );
    }
}
