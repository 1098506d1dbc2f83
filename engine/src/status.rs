//! Node status: counters, the current-round indicator and recent ceremony outcomes.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;

use crate::types::{CeremonyKind, Status};

/// Record of one finished ceremony.
#[derive(Debug, Clone, Serialize)]
pub struct CeremonyEvent {
    pub kind: CeremonyKind,
    pub msg_id: String,
    pub status: Status,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

/// Point-in-time copy of [`TssStatus`].
#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub start_time: DateTime<Utc>,
    pub keygen_success: u64,
    pub keygen_fail: u64,
    pub keysign_success: u64,
    pub keysign_fail: u64,
    pub current_round: String,
    pub recent: Vec<CeremonyEvent>,
}

pub struct TssStatus {
    start_time: DateTime<Utc>,
    keygen_success: AtomicU64,
    keygen_fail: AtomicU64,
    keysign_success: AtomicU64,
    keysign_fail: AtomicU64,
    /// Last round label any ceremony on this node emitted. Eventually
    /// consistent: concurrent ceremonies overwrite each other and readers may
    /// see a stale value. Only for progress reporting.
    current_round: watch::Sender<String>,
    events: Mutex<VecDeque<CeremonyEvent>>,
    max_events: usize,
}

impl TssStatus {
    pub fn new(max_events: usize) -> Self {
        let (current_round, _) = watch::channel(String::new());
        TssStatus {
            start_time: Utc::now(),
            keygen_success: AtomicU64::new(0),
            keygen_fail: AtomicU64::new(0),
            keysign_success: AtomicU64::new(0),
            keysign_fail: AtomicU64::new(0),
            current_round,
            events: Mutex::new(VecDeque::with_capacity(max_events)),
            max_events,
        }
    }

    pub fn set_current_round(&self, round: &str) {
        self.current_round.send_replace(round.to_string());
    }

    pub fn current_round(&self) -> String {
        self.current_round.borrow().clone()
    }

    /// Subscribe to round progress updates.
    pub fn watch_round(&self) -> watch::Receiver<String> {
        self.current_round.subscribe()
    }

    pub fn record(&self, kind: CeremonyKind, msg_id: &str, status: Status, message: impl Into<String>) {
        let counter = match (kind, status) {
            (CeremonyKind::Keygen, Status::Success) => &self.keygen_success,
            (CeremonyKind::Keygen, _) => &self.keygen_fail,
            (CeremonyKind::Keysign, Status::Success) => &self.keysign_success,
            (CeremonyKind::Keysign, _) => &self.keysign_fail,
        };
        counter.fetch_add(1, Ordering::Relaxed);

        if self.max_events == 0 {
            return;
        }
        let event = CeremonyEvent {
            kind,
            msg_id: msg_id.to_string(),
            status,
            message: message.into(),
            timestamp: Utc::now(),
        };
        // A poisoned history only loses observability, never a ceremony result.
        let mut events = match self.events.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if events.len() == self.max_events {
            events.pop_front(); // evict oldest
        }
        events.push_back(event);
    }

    /// Most recent events first.
    pub fn recent(&self, count: usize) -> Vec<CeremonyEvent> {
        let events = match self.events.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        events.iter().rev().take(count).cloned().collect()
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        StatusSnapshot {
            start_time: self.start_time,
            keygen_success: self.keygen_success.load(Ordering::Relaxed),
            keygen_fail: self.keygen_fail.load(Ordering::Relaxed),
            keysign_success: self.keysign_success.load(Ordering::Relaxed),
            keysign_fail: self.keysign_fail.load(Ordering::Relaxed),
            current_round: self.current_round(),
            recent: self.recent(self.max_events),
        }
    }
}
