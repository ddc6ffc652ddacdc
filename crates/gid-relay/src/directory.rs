//! Agent directory: who is registered, their public key and presence.
//!
//! Entries are created on first registration and are never removed while
//! the process runs, so an offline agent's key stays resolvable.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Local};
use gid_crypto::AgentPublicKey;
use gid_wire::{AgentSummary, Frame, PresenceStatus};
use tokio::sync::{mpsc, Notify};

/// `last_seen` rendering used on the wire.
pub const LAST_SEEN_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Why a frame could not be queued. Carries the frame back.
#[derive(Debug, PartialEq, Eq)]
pub enum SendError {
    /// The writer task is behind and the outbound queue is at capacity.
    Full(Frame),
    /// The connection is gone.
    Closed(Frame),
}

impl SendError {
    pub fn into_frame(self) -> Frame {
        match self {
            SendError::Full(frame) | SendError::Closed(frame) => frame,
        }
    }
}

#[derive(Debug)]
struct Backpressure {
    /// Consecutive sends refused because the queue was full.
    overflows: AtomicUsize,
    max_overflows: usize,
    evicted: Notify,
}

/// Outbound side of one live connection.
///
/// Cloning is cheap. Frames pushed here are written to the socket by the
/// connection's writer task, in push order. The queue is bounded: after
/// `max_overflows` consecutive full sends the connection is evicted and its
/// task is woken through [`ConnectionHandle::evicted`].
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    serial: u64,
    tx: mpsc::Sender<Frame>,
    backpressure: Arc<Backpressure>,
}

impl ConnectionHandle {
    pub fn new(serial: u64, tx: mpsc::Sender<Frame>, max_overflows: usize) -> Self {
        Self {
            serial,
            tx,
            backpressure: Arc::new(Backpressure {
                overflows: AtomicUsize::new(0),
                max_overflows: max_overflows.max(1),
                evicted: Notify::new(),
            }),
        }
    }

    pub fn serial(&self) -> u64 {
        self.serial
    }

    /// Queue a frame for the writer task without waiting.
    pub fn send(&self, frame: Frame) -> Result<(), SendError> {
        match self.tx.try_send(frame) {
            Ok(()) => {
                self.backpressure.overflows.store(0, Ordering::Relaxed);
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(frame)) => {
                let overflows = self.backpressure.overflows.fetch_add(1, Ordering::Relaxed) + 1;
                if overflows >= self.backpressure.max_overflows {
                    self.evict();
                }
                Err(SendError::Full(frame))
            }
            Err(mpsc::error::TrySendError::Closed(frame)) => Err(SendError::Closed(frame)),
        }
    }

    /// Ask the owning connection task to close.
    pub fn evict(&self) {
        self.backpressure.evicted.notify_one();
    }

    /// Resolves once the connection has been evicted.
    pub async fn evicted(&self) {
        self.backpressure.evicted.notified().await;
    }

    pub fn overflows(&self) -> usize {
        self.backpressure.overflows.load(Ordering::Relaxed)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

#[derive(Debug, Clone)]
pub struct DirectoryEntry {
    pub agent_id: String,
    pub connection: Option<ConnectionHandle>,
    pub public_key: AgentPublicKey,
    pub status: PresenceStatus,
    pub last_seen: DateTime<Local>,
}

impl DirectoryEntry {
    pub fn summary(&self) -> AgentSummary {
        AgentSummary {
            agent_id: self.agent_id.clone(),
            status: self.status,
            last_seen: self.last_seen.format(LAST_SEEN_FORMAT).to_string(),
        }
    }
}

#[derive(Debug, Default)]
pub struct Directory {
    entries: BTreeMap<String, DirectoryEntry>,
}

impl Directory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or update an entry and mark it online.
    ///
    /// Returns the connection this registration replaced, if any.
    pub fn register(
        &mut self,
        agent_id: &str,
        connection: ConnectionHandle,
        public_key: AgentPublicKey,
    ) -> Option<ConnectionHandle> {
        let now = Local::now();
        match self.entries.get_mut(agent_id) {
            Some(entry) => {
                entry.public_key = public_key;
                entry.status = PresenceStatus::Online;
                entry.last_seen = now;
                entry.connection.replace(connection)
            }
            None => {
                self.entries.insert(
                    agent_id.to_string(),
                    DirectoryEntry {
                        agent_id: agent_id.to_string(),
                        connection: Some(connection),
                        public_key,
                        status: PresenceStatus::Online,
                        last_seen: now,
                    },
                );
                None
            }
        }
    }

    pub fn get(&self, agent_id: &str) -> Option<&DirectoryEntry> {
        self.entries.get(agent_id)
    }

    pub fn lookup_key(&self, agent_id: &str) -> Option<AgentPublicKey> {
        self.entries.get(agent_id).map(|e| e.public_key)
    }

    pub fn lookup_presence(&self, agent_id: &str) -> Option<(PresenceStatus, DateTime<Local>)> {
        self.entries.get(agent_id).map(|e| (e.status, e.last_seen))
    }

    /// Snapshot of every known agent, ordered by id.
    pub fn list_all(&self) -> Vec<AgentSummary> {
        self.entries.values().map(DirectoryEntry::summary).collect()
    }

    /// Clear the live connection of `agent_id`.
    ///
    /// Ignored when `serial` no longer matches, i.e. a newer connection has
    /// registered under the same id since. Returns whether the entry changed.
    pub fn mark_offline(&mut self, agent_id: &str, serial: u64) -> bool {
        let Some(entry) = self.entries.get_mut(agent_id) else {
            return false;
        };
        match &entry.connection {
            Some(conn) if conn.serial() == serial => {
                entry.connection = None;
                entry.status = PresenceStatus::Offline;
                entry.last_seen = Local::now();
                true
            }
            _ => false,
        }
    }

    pub fn touch(&mut self, agent_id: &str) {
        if let Some(entry) = self.entries.get_mut(agent_id) {
            entry.last_seen = Local::now();
        }
    }

    pub fn live_connection(&self, agent_id: &str) -> Option<ConnectionHandle> {
        self.entries.get(agent_id).and_then(|e| e.connection.clone())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn online_count(&self) -> usize {
        self.entries
            .values()
            .filter(|e| e.status == PresenceStatus::Online)
            .count()
    }
}
