// ABOUTME: PBX lifecycle status tracking with restart bookkeeping
// ABOUTME: Shared by the dispatch loop (event-driven) and the manager's polling loop (timer-driven)

use crate::frame::LifecycleEvent;
use serde::Serialize;
use std::fmt;
use std::time::{Duration, Instant};
use tracing::info;

/// Coarse PBX lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Unknown,
    Normal,
    Restarting,
    Error,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Status::Unknown => "unknown",
            Status::Normal => "normal",
            Status::Restarting => "restarting",
            Status::Error => "error",
        };
        f.write_str(name)
    }
}

/// Status plus the instant a requested restart began.
///
/// There are two writers: the client's dispatch loop (lifecycle events,
/// end-of-stream) and the manager's polling loop (uptime check, restart
/// ceiling). Both hold the same lock for the duration of a single transition.
/// Restart completion is idempotent, so whichever writer confirms first wins
/// and the other becomes a no-op.
#[derive(Debug)]
pub struct LifecycleState {
    status: Status,
    restart_started: Option<Instant>,
}

impl Default for LifecycleState {
    fn default() -> Self {
        Self::new()
    }
}

impl LifecycleState {
    pub fn new() -> Self {
        Self {
            status: Status::Unknown,
            restart_started: None,
        }
    }

    pub fn status(&self) -> Status {
        self.status
    }

    /// Login and event subscription succeeded.
    pub fn on_connected(&mut self) {
        self.status = Status::Normal;
        self.restart_started = None;
    }

    pub fn on_event(&mut self, event: LifecycleEvent) {
        match event {
            LifecycleEvent::FullyBooted => {
                if self.complete_restart() {
                    info!("PBX restart completed (fully booted)");
                } else {
                    self.status = Status::Normal;
                }
            }
            // A shutdown is expected while restarting.
            LifecycleEvent::Shutdown => {
                if self.status != Status::Restarting {
                    self.status = Status::Error;
                }
            }
        }
    }

    /// The transport reached end-of-stream.
    pub fn on_transport_closed(&mut self) {
        if self.status != Status::Restarting {
            self.status = Status::Error;
        }
    }

    pub fn begin_restart(&mut self, now: Instant) {
        self.status = Status::Restarting;
        self.restart_started = Some(now);
    }

    /// Move `Restarting` to `Normal`. Returns false if no restart was pending.
    pub fn complete_restart(&mut self) -> bool {
        if self.status != Status::Restarting {
            return false;
        }
        self.status = Status::Normal;
        self.restart_started = None;
        true
    }

    /// Time since the restart began, if one is in progress and was recorded.
    pub fn restart_elapsed(&self, now: Instant) -> Option<Duration> {
        match self.status {
            Status::Restarting => self
                .restart_started
                .map(|started| now.saturating_duration_since(started)),
            _ => None,
        }
    }

    /// Force `Normal` once a restart has run longer than `ceiling`.
    /// Returns the elapsed time when the ceiling forced the transition.
    pub fn expire_restart(&mut self, now: Instant, ceiling: Duration) -> Option<Duration> {
        let elapsed = self.restart_elapsed(now)?;
        if elapsed < ceiling {
            return None;
        }
        self.complete_restart();
        Some(elapsed)
    }
}
