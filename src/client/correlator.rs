// ABOUTME: Correlates outgoing actions with their replies through single-use response slots
// ABOUTME: Slots are registered before transmission and removed exactly once on delivery, timeout or cancellation

use crate::codec::Message;
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use tokio::sync::oneshot;

/// Pending actions keyed by action identifier.
///
/// Each identifier maps to at most one waiter. The lock is held only for the
/// insert/remove itself, never across an await.
#[derive(Debug, Default)]
pub struct PendingActions {
    waiters: Mutex<HashMap<String, oneshot::Sender<Message>>>,
}

impl PendingActions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a response slot for `action_id`.
    ///
    /// Must be called before the action is written so a fast reply cannot
    /// arrive ahead of its waiter. Identifiers are unique per session, so a
    /// slot is never shared.
    pub fn register(&self, action_id: &str) -> PendingAction<'_> {
        let (tx, rx) = oneshot::channel();
        self.lock().insert(action_id.to_string(), tx);
        PendingAction {
            table: self,
            action_id: action_id.to_string(),
            rx,
        }
    }

    /// Deliver `message` to the waiter for `action_id`.
    ///
    /// Returns the message back when nobody is waiting, so the caller can
    /// forward it elsewhere. The slot is removed either way.
    pub fn fulfill(&self, action_id: &str, message: Message) -> Result<(), Message> {
        let waiter = self.lock().remove(action_id);
        match waiter {
            // A waiter that already gave up dropped its receiver.
            Some(tx) => tx.send(message),
            None => Err(message),
        }
    }

    /// Whether a waiter is registered for `action_id`.
    pub fn contains(&self, action_id: &str) -> bool {
        self.lock().contains_key(action_id)
    }

    /// Remove a slot if it is still registered.
    pub fn remove(&self, action_id: &str) -> bool {
        self.lock().remove(action_id).is_some()
    }

    /// Drop every slot. Waiters see a closed channel.
    pub fn clear(&self) {
        self.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, oneshot::Sender<Message>>> {
        self.waiters.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A registered response slot.
///
/// Dropping it removes the slot if it is still present, which covers timeouts
/// and callers cancelled mid-await alike.
#[derive(Debug)]
pub struct PendingAction<'a> {
    table: &'a PendingActions,
    action_id: String,
    rx: oneshot::Receiver<Message>,
}

impl PendingAction<'_> {
    pub fn action_id(&self) -> &str {
        &self.action_id
    }

    /// Wait for the reply. `None` means the slot was torn down without one
    /// (the session ended).
    pub async fn recv(&mut self) -> Option<Message> {
        (&mut self.rx).await.ok()
    }
}

impl Drop for PendingAction<'_> {
    fn drop(&mut self) {
        self.table.remove(&self.action_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn reply(id: &str) -> Message {
        Message::new().with("Response", "Success").with("ActionID", id)
    }

    #[tokio::test]
    async fn test_delivers_once_and_removes_slot() {
        let table = PendingActions::new();
        let mut pending = table.register("a-1");
        assert!(table.contains("a-1"));

        assert!(table.fulfill("a-1", reply("a-1")).is_ok());
        assert!(!table.contains("a-1"));

        let message = pending.recv().await.unwrap();
        assert_eq!(message.action_id(), Some("a-1"));

        // A duplicate reply finds no waiter and is handed back.
        let duplicate = table.fulfill("a-1", reply("a-1"));
        assert!(duplicate.is_err());
        drop(pending);
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn test_timeout_removes_slot() {
        let table = PendingActions::new();
        {
            let mut pending = table.register("a-2");
            let result = tokio::time::timeout(Duration::from_millis(10), pending.recv()).await;
            assert!(result.is_err());
        }
        assert!(!table.contains("a-2"));

        // A reply arriving after the timeout is not delivered anywhere.
        assert!(table.fulfill("a-2", reply("a-2")).is_err());
    }

    #[tokio::test]
    async fn test_clear_closes_waiters() {
        let table = PendingActions::new();
        let mut pending = table.register("a-3");
        table.clear();
        assert!(pending.recv().await.is_none());
    }

    #[test]
    fn test_unknown_id_is_returned() {
        let table = PendingActions::new();
        let message = reply("nobody");
        assert_eq!(table.fulfill("nobody", message.clone()), Err(message));
    }
}
