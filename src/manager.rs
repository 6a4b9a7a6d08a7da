// ABOUTME: Connection manager supervising one manager-interface client with bounded-retry reconnects
// ABOUTME: Polls aggregate status, fans status and inbound SMS out to subscribers, fails fast when disconnected

use crate::client::{
    AmiError, AmiResult, ClientStreams, DefaultClient, DongleStatus, SmsNotification, Status,
    StatusInfo,
};
use crate::config::{AmiConfig, ManagerConfig};
use crate::frame::{DomainEvent, Frame};
use crate::sim::{self, SmsInfo};
use futures::future::BoxFuture;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Receives status snapshots and inbound SMS from the [`ConnectionManager`].
///
/// Callbacks run on the manager's loops and must not block.
pub trait StatusSubscriber: Send + Sync {
    fn on_status_update(&self, info: &StatusInfo);

    fn on_sms_received(&self, sms: &SmsNotification);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManagerState {
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Debug)]
struct Session {
    state: ManagerState,
    client: Option<Arc<DefaultClient>>,
}

/// Supervises the manager-interface session for the whole process.
///
/// Constructed once by the composition root and shared as
/// `Arc<ConnectionManager>`. [`init`](Self::init) connects and starts two
/// loops: a supervision loop draining the client's queues and reconnecting on
/// transport failure, and a status loop publishing snapshots on a fixed
/// interval.
pub struct ConnectionManager {
    ami: AmiConfig,
    policy: ManagerConfig,
    session: RwLock<Session>,
    // Serializes reconnect rounds so two failures never race two clients.
    reconnecting: tokio::sync::Mutex<()>,
    subscribers: RwLock<Vec<Arc<dyn StatusSubscriber>>>,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("address", &self.ami.address())
            .field("state", &self.state())
            .finish()
    }
}

impl ConnectionManager {
    pub fn new(ami: AmiConfig, policy: ManagerConfig) -> Arc<Self> {
        let (shutdown, _) = watch::channel(false);
        Arc::new(Self {
            ami,
            policy,
            session: RwLock::new(Session {
                state: ManagerState::Disconnected,
                client: None,
            }),
            reconnecting: tokio::sync::Mutex::new(()),
            subscribers: RwLock::new(Vec::new()),
            shutdown,
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Connect with bounded retries, then start the supervision and status
    /// loops. On failure the manager stays usable and `init` may be called
    /// again.
    pub async fn init(self: &Arc<Self>) -> AmiResult<()> {
        self.reconnect().await?;

        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        if tasks.is_empty() {
            tasks.push(tokio::spawn(self.clone().supervise(self.shutdown.subscribe())));
            tasks.push(tokio::spawn(self.clone().poll_status(self.shutdown.subscribe())));
        }
        Ok(())
    }

    pub fn state(&self) -> ManagerState {
        self.session
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .state
    }

    /// The live client, or [`AmiError::NotConnected`].
    pub fn client(&self) -> AmiResult<Arc<DefaultClient>> {
        let session = self.session.read().unwrap_or_else(PoisonError::into_inner);
        match (&session.client, session.state) {
            (Some(client), ManagerState::Connected) => Ok(client.clone()),
            _ => Err(AmiError::NotConnected),
        }
    }

    fn set_session(&self, state: ManagerState, client: Option<Arc<DefaultClient>>) {
        let mut session = self.session.write().unwrap_or_else(PoisonError::into_inner);
        session.state = state;
        session.client = client;
    }

    fn is_shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Replace the current client, retrying up to the configured bound with a
    /// fixed delay between attempts.
    pub async fn reconnect(&self) -> AmiResult<Arc<DefaultClient>> {
        let _round = self.reconnecting.lock().await;

        let old = {
            let mut session = self.session.write().unwrap_or_else(PoisonError::into_inner);
            session.state = ManagerState::Connecting;
            session.client.take()
        };
        if let Some(old) = old {
            old.close().await;
        }

        let attempts = self.policy.max_connect_attempts.max(1);
        let mut last = AmiError::NotConnected;
        for attempt in 1..=attempts {
            if self.is_shutting_down() {
                break;
            }
            match DefaultClient::connect(&self.ami).await {
                Ok(client) => {
                    let client = Arc::new(client);
                    self.set_session(ManagerState::Connected, Some(client.clone()));
                    info!("Connected to manager interface at {}", self.ami.address());
                    return Ok(client);
                }
                Err(e) => {
                    warn!(
                        "Connection attempt {}/{} to {} failed: {}",
                        attempt,
                        attempts,
                        self.ami.address(),
                        e
                    );
                    last = e;
                    if attempt < attempts {
                        tokio::time::sleep(self.policy.retry_delay()).await;
                    }
                }
            }
        }

        self.set_session(ManagerState::Disconnected, None);
        Err(AmiError::RetriesExhausted {
            attempts,
            last: Box::new(last),
        })
    }

    pub fn subscribe(&self, subscriber: Arc<dyn StatusSubscriber>) {
        self.subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(subscriber);
    }

    /// Remove a subscriber by identity. Returns whether it was registered.
    pub fn unsubscribe(&self, subscriber: &Arc<dyn StatusSubscriber>) -> bool {
        let mut subscribers = self.subscribers.write().unwrap_or_else(PoisonError::into_inner);
        match subscribers.iter().position(|s| Arc::ptr_eq(s, subscriber)) {
            Some(index) => {
                subscribers.remove(index);
                true
            }
            None => false,
        }
    }

    /// Copy of the subscriber list, so callbacks run without the lock held.
    fn subscribers(&self) -> Vec<Arc<dyn StatusSubscriber>> {
        self.subscribers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    async fn supervise(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        loop {
            if *shutdown.borrow() {
                return;
            }

            let client = match self.client() {
                Ok(client) => client,
                Err(_) => match self.reconnect_until_connected(&mut shutdown).await {
                    Some(client) => client,
                    None => return,
                },
            };

            let Some(streams) = client.take_streams() else {
                // Someone else is draining this client; wait for it to end.
                warn!("Client queues already taken; reconnecting");
                self.set_session(ManagerState::Disconnected, None);
                continue;
            };

            let Some(cause) = self.pump(streams, &mut shutdown).await else {
                return;
            };

            // An explicit reconnect closes the old client first; let that round
            // finish before deciding whether this session was replaced.
            drop(self.reconnecting.lock().await);
            let replaced = match self.client() {
                Ok(current) => !Arc::ptr_eq(&current, &client),
                Err(_) => false,
            };
            if replaced {
                debug!("Client was replaced while supervised; following the new one");
                continue;
            }

            warn!("Manager interface session lost: {}; reconnecting", cause);
            self.set_session(ManagerState::Disconnected, None);
            if self.reconnect_until_connected(&mut shutdown).await.is_none() {
                return;
            }
        }
    }

    /// Reconnect rounds separated by the backoff. `None` on shutdown.
    async fn reconnect_until_connected(
        &self,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Option<Arc<DefaultClient>> {
        loop {
            if *shutdown.borrow() {
                return None;
            }
            let round = tokio::select! {
                result = self.reconnect() => result,
                _ = shutdown.changed() => return None,
            };
            match round {
                Ok(client) => return Some(client),
                Err(e) => {
                    error!(
                        "Reconnect failed: {}; retrying in {:?}",
                        e,
                        self.policy.reconnect_backoff()
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(self.policy.reconnect_backoff()) => {}
                        _ = shutdown.changed() => return None,
                    }
                }
            }
        }
    }

    /// Drain one client's queues until its session ends. Returns the cause,
    /// or `None` on shutdown.
    async fn pump(
        &self,
        streams: ClientStreams,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Option<AmiError> {
        let ClientStreams {
            mut events,
            mut errors,
        } = streams;

        loop {
            tokio::select! {
                _ = shutdown.changed() => return None,
                frame = events.recv() => match frame {
                    Some(frame) => self.handle_frame(frame),
                    None => return Some(errors.try_recv().unwrap_or(AmiError::ConnectionClosed)),
                },
                error = errors.recv() => match error {
                    Some(e) if e.is_fatal() => {
                        // Events queued ahead of the failure are still delivered.
                        while let Ok(frame) = events.try_recv() {
                            self.handle_frame(frame);
                        }
                        return Some(e);
                    }
                    Some(e) => warn!("Manager interface error: {}", e),
                    None => return Some(AmiError::ConnectionClosed),
                },
            }
        }
    }

    fn handle_frame(&self, frame: Frame) {
        match frame {
            Frame::Domain(DomainEvent::SmsReceived(mut sms)) => {
                sms.text = sim::normalize_content(&sms.text);
                for subscriber in self.subscribers() {
                    subscriber.on_sms_received(&sms);
                }
            }
            Frame::Unrecognized(message) => {
                if let Some(event) = message.event() {
                    debug!("Event {}", event);
                }
            }
            _ => {}
        }
    }

    async fn poll_status(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.policy.status_interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.update_status().await;
                }
                _ = shutdown.changed() => return,
            }
        }
    }

    /// One polling round: settle a pending restart, then publish a snapshot.
    ///
    /// While restarting, a restart older than the ceiling is forced to
    /// complete; otherwise a successful uptime check completes it. Both
    /// completions are idempotent with the boot event seen by the dispatch
    /// loop.
    pub async fn update_status(&self) -> StatusInfo {
        let info = match self.client() {
            Ok(client) => {
                if client.status() == Status::Restarting {
                    self.settle_restart(&client).await;
                }
                client.status_info().await
            }
            Err(_) => StatusInfo::with_status(Status::Error),
        };

        for subscriber in self.subscribers() {
            subscriber.on_status_update(&info);
        }
        info
    }

    async fn settle_restart(&self, client: &DefaultClient) {
        if let Some(elapsed) = client.expire_restart(self.policy.restart_timeout()) {
            warn!(
                "PBX restart not confirmed after {}s, assuming complete",
                elapsed.as_secs()
            );
            return;
        }
        if let Ok(uptime) = client.get_uptime().await {
            if client.complete_restart() {
                info!("PBX restart completed (uptime {}s)", uptime);
            }
        }
    }

    pub async fn reload(&self) -> AmiResult<()> {
        self.client()?.reload().await
    }

    pub async fn restart(&self) -> AmiResult<()> {
        self.client()?.restart().await
    }

    pub async fn send_sms(&self, device: &str, number: &str, text: &str) -> AmiResult<()> {
        self.client()?.send_sms(device, number, text).await
    }

    pub async fn list_sms(&self, device: &str) -> AmiResult<Vec<SmsInfo>> {
        self.client()?.list_sms(device).await
    }

    pub async fn delete_sms(&self, device: &str, index: u32) -> AmiResult<()> {
        self.client()?.delete_sms(device, index).await
    }

    pub async fn delete_all_sms(&self, device: &str) -> AmiResult<()> {
        self.client()?.delete_all_sms(device).await
    }

    pub async fn find_and_delete_sms(
        &self,
        device: &str,
        sender: &str,
        timestamp: &str,
        content: &str,
    ) -> AmiResult<Option<u32>> {
        self.client()?
            .find_and_delete_sms(device, sender, timestamp, content)
            .await
    }

    pub async fn device_state(&self, device: &str) -> AmiResult<DongleStatus> {
        self.client()?.device_state(device).await
    }

    /// Stop both loops and close the client.
    pub async fn shutdown(&self) {
        self.shutdown.send_replace(true);

        let tasks: Vec<JoinHandle<()>> = self
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for mut task in tasks {
            if tokio::time::timeout(Duration::from_secs(2), &mut task)
                .await
                .is_err()
            {
                task.abort();
            }
        }

        let client = {
            let mut session = self.session.write().unwrap_or_else(PoisonError::into_inner);
            session.state = ManagerState::Disconnected;
            session.client.take()
        };
        if let Some(client) = client {
            client.close().await;
        }
        info!("Connection manager stopped");
    }
}

/// SIM access used by the SMS pipeline for startup scans and cleanup
pub trait SimMailbox: Send + Sync {
    fn list_sms<'a>(&'a self, device: &'a str) -> BoxFuture<'a, AmiResult<Vec<SmsInfo>>>;

    fn find_and_delete_sms<'a>(
        &'a self,
        device: &'a str,
        sender: &'a str,
        timestamp: &'a str,
        content: &'a str,
    ) -> BoxFuture<'a, AmiResult<Option<u32>>>;
}

impl SimMailbox for ConnectionManager {
    fn list_sms<'a>(&'a self, device: &'a str) -> BoxFuture<'a, AmiResult<Vec<SmsInfo>>> {
        Box::pin(ConnectionManager::list_sms(self, device))
    }

    fn find_and_delete_sms<'a>(
        &'a self,
        device: &'a str,
        sender: &'a str,
        timestamp: &'a str,
        content: &'a str,
    ) -> BoxFuture<'a, AmiResult<Option<u32>>> {
        Box::pin(ConnectionManager::find_and_delete_sms(
            self, device, sender, timestamp, content,
        ))
    }
}
