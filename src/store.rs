// ABOUTME: Persistence interface for inbound SMS records used by the ingestion pipeline
// ABOUTME: Ships an in-memory implementation; database-backed stores implement the same trait

use crate::sim;
use chrono::{DateTime, Local, NaiveDateTime};
use serde::Serialize;
use std::future::Future;
use std::sync::{Mutex, MutexGuard, PoisonError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Record {0} not found")]
    NotFound(u64),

    #[error("Storage backend error: {0}")]
    Backend(String),
}

/// Fields identifying one physical SMS.
///
/// Content is kept after [`sim::normalize_content`] and the SIM timestamp by
/// its parsed value without the zone offset, so a live event and a later SIM
/// scan of the same message produce keys that [`DedupKey::matches`] accepts.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct DedupKey {
    pub device: String,
    pub sender: String,
    pub content: String,
    /// `None` when the report carried no timestamp or it did not parse.
    pub sim_timestamp: Option<NaiveDateTime>,
}

impl DedupKey {
    /// Whether both keys identify the same message. When either side lacks a
    /// timestamp, device, sender and content decide alone.
    pub fn matches(&self, other: &DedupKey) -> bool {
        if self.device != other.device
            || self.sender != other.sender
            || self.content != other.content
        {
            return false;
        }
        match (self.sim_timestamp, other.sim_timestamp) {
            (Some(ours), Some(theirs)) => ours == theirs,
            _ => true,
        }
    }
}

/// An inbound SMS about to be stored, not yet delivered
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NewSmsRecord {
    pub device: String,
    pub sender: String,
    pub content: String,
    pub sim_timestamp: Option<String>,
    pub sim_index: Option<u32>,
    /// SIM timestamp when it parses, otherwise the time of processing.
    pub received_at: NaiveDateTime,
}

impl NewSmsRecord {
    pub fn dedup_key(&self) -> DedupKey {
        DedupKey {
            device: self.device.clone(),
            sender: self.sender.clone(),
            content: sim::normalize_content(&self.content),
            sim_timestamp: self
                .sim_timestamp
                .as_deref()
                .and_then(sim::parse_sim_timestamp),
        }
    }
}

/// A stored inbound SMS
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SmsRecord {
    pub id: u64,
    #[serde(flatten)]
    pub record: NewSmsRecord,
    /// Set once notification has been attempted.
    pub pushed_at: Option<DateTime<Local>>,
}

/// Persistence collaborator for the SMS pipeline.
///
/// Calls come from the pipeline's single consumer, one at a time.
pub trait SmsStore: Send + Sync + 'static {
    /// Whether a stored record's key [matches](DedupKey::matches) this one.
    fn contains(&self, key: &DedupKey) -> impl Future<Output = Result<bool, StoreError>> + Send;

    /// Store a new record with no delivery marker; returns its ID.
    fn insert_inbound(
        &self,
        record: NewSmsRecord,
    ) -> impl Future<Output = Result<u64, StoreError>> + Send;

    /// Record that notification was attempted.
    fn mark_pushed(
        &self,
        id: u64,
        at: DateTime<Local>,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;
}

/// Process-local store
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: Mutex<Vec<SmsRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every stored record in insertion order.
    pub fn records(&self) -> Vec<SmsRecord> {
        self.lock().clone()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<SmsRecord>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl SmsStore for MemoryStore {
    async fn contains(&self, key: &DedupKey) -> Result<bool, StoreError> {
        Ok(self.lock().iter().any(|r| r.record.dedup_key().matches(key)))
    }

    async fn insert_inbound(&self, record: NewSmsRecord) -> Result<u64, StoreError> {
        let mut records = self.lock();
        let id = records.len() as u64 + 1;
        records.push(SmsRecord {
            id,
            record,
            pushed_at: None,
        });
        Ok(id)
    }

    async fn mark_pushed(&self, id: u64, at: DateTime<Local>) -> Result<(), StoreError> {
        let mut records = self.lock();
        let record = records
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or(StoreError::NotFound(id))?;
        record.pushed_at = Some(at);
        Ok(())
    }
}
