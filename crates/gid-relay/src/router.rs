//! Frame router.
//!
//! The router owns the [`Directory`] and the [`Mailbox`] behind one lock, so
//! that marking an agent online and draining its mailbox cannot interleave
//! with a concurrent enqueue for the same agent. Nothing awaits while the
//! lock is held: outbound queues are bounded and fed with `try_send`.
//!
//! A recipient whose queue is full is treated as stalled. Messages and
//! files go to its mailbox and the connection is evicted, so the mailbox is
//! flushed in order when the agent registers again. Signals are dropped and
//! only evict once the overflows repeat.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use gid_crypto::AgentPublicKey;
use gid_wire::{Frame, WireError};
use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::ServerConfig;
use crate::directory::{ConnectionHandle, Directory, SendError};
use crate::mailbox::{Envelope, Mailbox};
use crate::metrics::RelayMetrics;

#[derive(Debug, Error)]
pub enum RouterError {
    #[error("registration rejected: {0}")]
    RegistrationRejected(String),

    #[error("malformed frame: {0}")]
    Malformed(String),

    #[error(transparent)]
    Wire(#[from] WireError),
}

#[derive(Debug, Clone)]
pub struct RouterSettings {
    pub verify_agent_ids: bool,
    pub max_queue_length: usize,
    pub max_envelope_size: usize,
}

impl From<&ServerConfig> for RouterSettings {
    fn from(config: &ServerConfig) -> Self {
        Self {
            verify_agent_ids: config.verify_agent_ids,
            max_queue_length: config.max_queue_length,
            max_envelope_size: config.max_envelope_size,
        }
    }
}

impl Default for RouterSettings {
    fn default() -> Self {
        Self::from(&ServerConfig::default())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegisterOutcome {
    /// Envelopes flushed from the mailbox to the new connection.
    pub flushed: usize,
    /// Envelopes put back because the connection closed mid-flush.
    pub requeued: usize,
    /// A previous live connection was displaced.
    pub replaced: bool,
}

/// Per-recipient result of routing one message or file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RouteReport {
    pub delivered: Vec<String>,
    pub buffered: Vec<String>,
    /// No directory entry for these ids.
    pub rejected: Vec<String>,
    /// Refused by mailbox limits.
    pub dropped: Vec<String>,
}

/// What the connection task should do after [`Router::handle`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dispatch {
    /// Send this frame back to the requester.
    Reply(Frame),
    Routed(RouteReport),
    /// Typing or receipt signal. `delivered` is false when it was dropped.
    Signal { delivered: bool },
}

struct State {
    directory: Directory,
    mailbox: Mailbox,
}

pub struct Router {
    state: Mutex<State>,
    settings: RouterSettings,
    metrics: Arc<RelayMetrics>,
    next_serial: AtomicU64,
}

fn has_reserved_char(id: &str) -> bool {
    id.contains(|c: char| matches!(c, '|' | ',' | '[' | ']') || c.is_whitespace())
}

impl Router {
    pub fn new(settings: RouterSettings, metrics: Arc<RelayMetrics>) -> Self {
        let mailbox = Mailbox::new(settings.max_queue_length, settings.max_envelope_size);
        Self {
            state: Mutex::new(State {
                directory: Directory::new(),
                mailbox,
            }),
            settings,
            metrics,
            next_serial: AtomicU64::new(1),
        }
    }

    /// Serial for a newly accepted connection.
    pub fn next_connection_serial(&self) -> u64 {
        self.next_serial.fetch_add(1, Ordering::Relaxed)
    }

    /// Bind `agent_id` to a live connection and flush its mailbox into it.
    pub fn register(
        &self,
        agent_id: &str,
        public_key_hex: &str,
        handle: ConnectionHandle,
    ) -> Result<RegisterOutcome, RouterError> {
        if agent_id.is_empty() || has_reserved_char(agent_id) {
            return Err(RouterError::RegistrationRejected(format!(
                "invalid agent id {agent_id:?}"
            )));
        }
        let public_key = AgentPublicKey::from_hex(public_key_hex)
            .map_err(|e| RouterError::RegistrationRejected(e.to_string()))?;
        if self.settings.verify_agent_ids && public_key.agent_id() != agent_id {
            return Err(RouterError::RegistrationRejected(format!(
                "{agent_id} does not match its public key"
            )));
        }

        let mut state = self.state.lock();
        let replaced = state
            .directory
            .register(agent_id, handle.clone(), public_key)
            .is_some();

        let mut pending = state.mailbox.drain(agent_id).into_iter();
        let mut outcome = RegisterOutcome {
            replaced,
            ..Default::default()
        };
        while let Some(envelope) = pending.next() {
            let Envelope { frame, size, sequence } = envelope;
            if let Err(e) = handle.send(frame) {
                let stalled = matches!(e, SendError::Full(_));
                let mut undelivered = vec![Envelope {
                    frame: e.into_frame(),
                    size,
                    sequence,
                }];
                undelivered.extend(pending);
                outcome.requeued = undelivered.len();
                state.mailbox.requeue_front(agent_id, undelivered);
                if stalled {
                    warn!(agent_id, "outbound queue full during flush, evicting");
                    state.directory.mark_offline(agent_id, handle.serial());
                    handle.evict();
                }
                break;
            }
            outcome.flushed += 1;
        }

        self.metrics.envelopes_delivered.inc_by(outcome.flushed as f64);
        self.update_gauges(&state);
        drop(state);

        info!(
            agent_id,
            flushed = outcome.flushed,
            requeued = outcome.requeued,
            replaced = outcome.replaced,
            "agent registered"
        );
        Ok(outcome)
    }

    /// Connection `serial` for `agent_id` has closed.
    pub fn disconnect(&self, agent_id: &str, serial: u64) -> bool {
        let mut state = self.state.lock();
        let changed = state.directory.mark_offline(agent_id, serial);
        self.update_gauges(&state);
        drop(state);

        if changed {
            info!(agent_id, "agent offline");
        } else {
            debug!(agent_id, serial, "stale disconnect ignored");
        }
        changed
    }

    /// Dispatch one frame from a registered sender.
    pub fn handle(&self, sender: &str, frame: Frame) -> Result<Dispatch, RouterError> {
        if !frame.tag().is_client_to_server() {
            return Err(RouterError::Malformed(format!(
                "{} is not accepted from clients",
                frame.tag()
            )));
        }
        self.state.lock().directory.touch(sender);

        match frame {
            Frame::ListAgents => {
                let agents = self.state.lock().directory.list_all();
                Ok(Dispatch::Reply(Frame::AgentList(agents)))
            }
            Frame::GetKey(target) => {
                let key = self.lookup_key(&target);
                debug!(sender, peer = %target, found = key.is_some(), "key lookup");
                Ok(Dispatch::Reply(match key {
                    Some(key) => Frame::KeyFound(key.to_hex()),
                    None => Frame::KeyNotFound,
                }))
            }
            Frame::Typing(target) => {
                let delivered =
                    self.forward_live(&target, Frame::TypingIndicator(sender.to_string()));
                Ok(Dispatch::Signal { delivered })
            }
            Frame::ReadReceipt { target, timestamp } => {
                let delivered = self.forward_live(
                    &target,
                    Frame::Receipt {
                        sender: sender.to_string(),
                        timestamp,
                    },
                );
                Ok(Dispatch::Signal { delivered })
            }
            Frame::Msg { recipients, blob } => {
                let frame = Frame::Incoming {
                    sender: sender.to_string(),
                    blob,
                };
                self.route(sender, &recipients, frame).map(Dispatch::Routed)
            }
            Frame::File { recipients, blob } => {
                let frame = Frame::FileIncoming {
                    sender: sender.to_string(),
                    blob,
                };
                self.route(sender, &recipients, frame).map(Dispatch::Routed)
            }
            Frame::Register { .. } => Err(RouterError::Malformed(
                "already registered on this connection".to_string(),
            )),
            other => Err(RouterError::Malformed(format!(
                "{} is not accepted from clients",
                other.tag()
            ))),
        }
    }

    /// Deliver `frame` to each recipient, buffering for those offline.
    pub fn route(
        &self,
        sender: &str,
        recipients: &[String],
        frame: Frame,
    ) -> Result<RouteReport, RouterError> {
        let tag = frame.tag();
        let envelope = Envelope::new(frame)?;
        let mut report = RouteReport::default();
        let mut seen = HashSet::new();

        let mut state = self.state.lock();
        for recipient in recipients {
            if !seen.insert(recipient.as_str()) {
                continue;
            }
            let Some(entry) = state.directory.get(recipient) else {
                report.rejected.push(recipient.clone());
                continue;
            };

            if let Some(conn) = entry.connection.clone() {
                match conn.send(envelope.frame.clone()) {
                    Ok(()) => {
                        report.delivered.push(recipient.clone());
                        continue;
                    }
                    Err(SendError::Full(_)) => {
                        warn!(recipient = %recipient, "outbound queue full, evicting and buffering");
                        state.directory.mark_offline(recipient, conn.serial());
                        conn.evict();
                    }
                    Err(SendError::Closed(_)) => {
                        debug!(recipient = %recipient, "live delivery failed, buffering");
                    }
                }
            }

            match state.mailbox.enqueue(recipient, envelope.clone()) {
                Ok(_) => report.buffered.push(recipient.clone()),
                Err(e) => {
                    warn!(recipient = %recipient, error = %e, "envelope dropped");
                    report.dropped.push(recipient.clone());
                }
            }
        }
        self.update_gauges(&state);
        drop(state);

        self.metrics.envelopes_delivered.inc_by(report.delivered.len() as f64);
        self.metrics.envelopes_buffered.inc_by(report.buffered.len() as f64);
        self.metrics.envelopes_dropped.inc_by(report.dropped.len() as f64);
        self.metrics.envelopes_rejected.inc_by(report.rejected.len() as f64);

        if !report.rejected.is_empty() {
            warn!(sender, %tag, rejected = ?report.rejected, "unknown recipients");
        }
        debug!(
            sender,
            %tag,
            delivered = ?report.delivered,
            buffered = ?report.buffered,
            "routed"
        );
        Ok(report)
    }

    /// Best-effort live forward. Never buffered.
    fn forward_live(&self, target: &str, frame: Frame) -> bool {
        let conn = self.state.lock().directory.live_connection(target);
        let tag = frame.tag();
        let delivered = conn.map(|c| c.send(frame).is_ok()).unwrap_or(false);
        if !delivered {
            self.metrics.signals_dropped.inc();
            debug!(peer = target, %tag, "signal dropped, target offline or stalled");
        }
        delivered
    }

    fn update_gauges(&self, state: &State) {
        self.metrics.registered_agents.set(state.directory.len() as f64);
        self.metrics.online_agents.set(state.directory.online_count() as f64);
        self.metrics.queued_envelopes.set(state.mailbox.total_queued() as f64);
    }

    pub fn lookup_key(&self, agent_id: &str) -> Option<AgentPublicKey> {
        self.state.lock().directory.lookup_key(agent_id)
    }

    pub fn queue_length(&self, agent_id: &str) -> usize {
        self.state.lock().mailbox.queue_length(agent_id)
    }

    pub fn total_queued(&self) -> usize {
        self.state.lock().mailbox.total_queued()
    }

    pub fn is_online(&self, agent_id: &str) -> bool {
        self.state.lock().directory.live_connection(agent_id).is_some()
    }
}
