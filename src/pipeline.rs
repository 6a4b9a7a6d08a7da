// ABOUTME: Inbound SMS ingestion: bounded drop-on-full queue feeding one strictly ordered consumer
// ABOUTME: Each request is deduplicated, persisted, notified on every channel concurrently and marked delivered

use crate::client::{SmsNotification, StatusInfo};
use crate::config::PipelineConfig;
use crate::manager::{SimMailbox, StatusSubscriber};
use crate::notify::{NotifierRegistry, NotifyReport, format_sms_notification};
use crate::sim::{self, SmsInfo};
use crate::store::{NewSmsRecord, SmsStore};
use chrono::Local;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// One inbound SMS awaiting processing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SmsRequest {
    pub device: String,
    pub sender: String,
    pub content: String,
    /// Raw SIM timestamp, if known.
    pub timestamp: Option<String>,
    pub sim_index: Option<u32>,
}

impl From<SmsNotification> for SmsRequest {
    fn from(sms: SmsNotification) -> Self {
        Self {
            device: sms.device,
            sender: sms.sender,
            content: sms.text,
            timestamp: sms.timestamp,
            sim_index: sms.sim_index,
        }
    }
}

impl SmsRequest {
    /// A request recovered from a SIM listing.
    pub fn from_sim(device: &str, sms: &SmsInfo) -> Self {
        Self {
            device: device.to_string(),
            sender: sms.sender.clone(),
            content: sms.content.clone(),
            timestamp: Some(sms.timestamp.clone()).filter(|t| !t.is_empty()),
            sim_index: Some(sms.index),
        }
    }
}

/// Producer side of the pipeline's fixed-capacity queue.
///
/// Enqueueing never blocks. When the queue is full the request is dropped;
/// the message still sits on the SIM and a later scan can recover it.
#[derive(Debug, Clone)]
pub struct SmsQueue {
    tx: mpsc::Sender<SmsRequest>,
}

impl SmsQueue {
    pub(crate) fn bounded(capacity: usize) -> (SmsQueue, mpsc::Receiver<SmsRequest>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (SmsQueue { tx }, rx)
    }

    /// Queue a request. Returns false if it was dropped.
    pub fn try_enqueue(&self, request: SmsRequest) -> bool {
        match self.tx.try_send(request) {
            Ok(()) => {
                debug!("SMS queued ({} pending)", self.len());
                true
            }
            Err(TrySendError::Full(request)) => {
                warn!(
                    "SMS queue full, leaving SMS from {} on {} for a later scan",
                    request.sender, request.device
                );
                false
            }
            Err(TrySendError::Closed(request)) => {
                warn!("SMS pipeline stopped, dropping SMS from {}", request.sender);
                false
            }
        }
    }

    /// Requests waiting to be processed.
    pub fn len(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.tx.max_capacity()
    }
}

impl StatusSubscriber for SmsQueue {
    fn on_status_update(&self, _info: &StatusInfo) {}

    fn on_sms_received(&self, sms: &SmsNotification) {
        self.try_enqueue(SmsRequest::from(sms.clone()));
    }
}

/// What happened to one request
#[derive(Debug)]
pub enum ProcessOutcome {
    /// Already stored; nothing done.
    Duplicate,
    /// Persisting failed; the request was abandoned.
    NotStored,
    /// Stored, notified (best effort) and marked delivered.
    Delivered { id: u64, report: NotifyReport },
}

/// The work done for each request, in order.
pub struct SmsProcessor<S> {
    store: Arc<S>,
    notifiers: NotifierRegistry,
    mailbox: Option<Arc<dyn SimMailbox>>,
    delete_after_delivery: bool,
}

impl<S: SmsStore> SmsProcessor<S> {
    pub fn new(store: Arc<S>, notifiers: NotifierRegistry) -> Self {
        Self {
            store,
            notifiers,
            mailbox: None,
            delete_after_delivery: false,
        }
    }

    /// Delete each delivered message from its SIM through `mailbox`.
    pub fn with_sim_cleanup(mut self, mailbox: Arc<dyn SimMailbox>) -> Self {
        self.mailbox = Some(mailbox);
        self.delete_after_delivery = true;
        self
    }

    pub async fn process(&self, request: SmsRequest) -> ProcessOutcome {
        info!(
            "Processing SMS from {} on {} (index {:?})",
            request.sender, request.device, request.sim_index
        );

        let received_at = match request.timestamp.as_deref() {
            Some(raw) => sim::parse_sim_timestamp(raw).unwrap_or_else(|| {
                debug!("Unparseable SIM timestamp {:?}, using current time", raw);
                Local::now().naive_local()
            }),
            None => Local::now().naive_local(),
        };

        let record = NewSmsRecord {
            device: request.device.clone(),
            sender: request.sender.clone(),
            content: request.content.clone(),
            sim_timestamp: request.timestamp.clone(),
            sim_index: request.sim_index,
            received_at,
        };

        match self.store.contains(&record.dedup_key()).await {
            Ok(true) => {
                debug!("SMS from {} on {} already stored", request.sender, request.device);
                return ProcessOutcome::Duplicate;
            }
            Ok(false) => {}
            Err(e) => warn!("Duplicate check failed, storing anyway: {}", e),
        }

        let id = match self.store.insert_inbound(record).await {
            Ok(id) => id,
            Err(e) => {
                error!("Failed to store SMS from {}: {}", request.sender, e);
                return ProcessOutcome::NotStored;
            }
        };
        debug!("Stored SMS {}", id);

        let report = if self.notifiers.is_empty() {
            info!("No notification channels enabled");
            NotifyReport::default()
        } else {
            let text = format_sms_notification(&request.sender, &request.device, &request.content);
            let report = self.notifiers.send(&text).await;
            if let Some(e) = report.first_error() {
                warn!(
                    "{} of {} notification(s) for SMS {} failed, first: {}",
                    report.errors.len(),
                    report.attempted,
                    id,
                    e
                );
            }
            report
        };

        match self.store.mark_pushed(id, Local::now()).await {
            Ok(()) => debug!("SMS {} marked delivered", id),
            Err(e) => error!("Failed to mark SMS {} delivered: {}", id, e),
        }

        if self.delete_after_delivery {
            self.cleanup(&request).await;
        }

        ProcessOutcome::Delivered { id, report }
    }

    async fn cleanup(&self, request: &SmsRequest) {
        let Some(mailbox) = &self.mailbox else {
            return;
        };
        let timestamp = request.timestamp.as_deref().unwrap_or_default();
        match mailbox
            .find_and_delete_sms(&request.device, &request.sender, timestamp, &request.content)
            .await
        {
            Ok(Some(index)) => info!("Removed SMS from SIM slot {} on {}", index, request.device),
            Ok(None) => info!(
                "SMS from {} not found on {}; nothing to delete",
                request.sender, request.device
            ),
            Err(e) => warn!("SIM cleanup on {} failed: {}", request.device, e),
        }
    }
}

/// The running pipeline: a queue and its single consumer task
#[derive(Debug)]
pub struct SmsPipeline {
    queue: SmsQueue,
    shutdown: watch::Sender<bool>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl SmsPipeline {
    /// Start the consumer.
    pub fn start<S: SmsStore>(processor: SmsProcessor<S>, capacity: usize) -> Self {
        let (queue, rx) = SmsQueue::bounded(capacity);
        let (shutdown, shutdown_rx) = watch::channel(false);
        let worker = tokio::spawn(consume(rx, shutdown_rx, processor));
        info!("SMS pipeline started (capacity {})", queue.capacity());
        Self {
            queue,
            shutdown,
            worker: Mutex::new(Some(worker)),
        }
    }

    /// Build the processor from configuration and start it.
    pub fn from_config<S: SmsStore>(
        config: &PipelineConfig,
        store: Arc<S>,
        notifiers: NotifierRegistry,
        mailbox: Arc<dyn SimMailbox>,
    ) -> Self {
        let mut processor = SmsProcessor::new(store, notifiers);
        if config.delete_after_delivery {
            processor = processor.with_sim_cleanup(mailbox);
        }
        Self::start(processor, config.queue_capacity)
    }

    /// A producer handle, also usable as a manager subscriber.
    pub fn queue(&self) -> SmsQueue {
        self.queue.clone()
    }

    pub fn enqueue(&self, request: SmsRequest) -> bool {
        self.queue.try_enqueue(request)
    }

    /// Stop accepting requests, process what is already queued, then stop.
    pub async fn shutdown(&self) {
        self.shutdown.send_replace(true);
        let worker = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(worker) = worker {
            if let Err(e) = worker.await {
                error!("SMS consumer task failed: {}", e);
            }
        }
        info!("SMS pipeline stopped");
    }
}

async fn consume<S: SmsStore>(
    mut rx: mpsc::Receiver<SmsRequest>,
    mut shutdown: watch::Receiver<bool>,
    processor: SmsProcessor<S>,
) {
    loop {
        tokio::select! {
            biased;
            request = rx.recv() => match request {
                Some(request) => {
                    processor.process(request).await;
                }
                None => return,
            },
            _ = shutdown.changed() => break,
        }
    }

    rx.close();
    while let Some(request) = rx.recv().await {
        processor.process(request).await;
    }
}

/// List every configured device's SIM and log what is there. With `recover`,
/// each received message is queued; deduplication keeps already stored
/// messages from being stored twice. Returns the number queued.
pub async fn scan_sims(
    mailbox: &dyn SimMailbox,
    devices: &[String],
    queue: &SmsQueue,
    recover: bool,
) -> usize {
    let mut queued = 0;
    for device in devices {
        let messages = match mailbox.list_sms(device).await {
            Ok(messages) => messages,
            Err(e) => {
                warn!("Could not list SMS on {}: {}", device, e);
                continue;
            }
        };
        info!("{} SMS stored on {}", messages.len(), device);
        for sms in &messages {
            debug!(
                "  [{}] {} from {} at {}",
                sms.index, sms.status, sms.sender, sms.timestamp
            );
        }

        if recover {
            for sms in messages.iter().filter(|sms| sms.status.is_received()) {
                if queue.try_enqueue(SmsRequest::from_sim(device, sms)) {
                    queued += 1;
                }
            }
        }
    }
    queued
}
