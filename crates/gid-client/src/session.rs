//! Connected agent session
//!
//! A session owns two tasks: a writer draining an outbound queue into the
//! socket, and a listener turning inbound frames into [`SessionEvent`]s.
//! Public key lookups are paired with relay replies by order: the relay
//! answers `GET_KEY` requests of one connection in the order it read them,
//! so each reply completes the oldest outstanding waiter.

use std::collections::{BTreeSet, VecDeque};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use gid_crypto::{
    open, open_message_or_sentinel, seal_file, seal_message, AgentKeypair, AgentPublicKey,
    CipherBlob, EnvelopeError, UNDECRYPTABLE_SENTINEL,
};
use gid_crypto::hash::is_well_formed_agent_id;
use gid_wire::{
    AgentSummary, Frame, FrameReader, FrameWriter, LengthCodec, WireError,
    DEFAULT_MAX_FRAME_SIZE, PRIMARY_SEPARATOR, RECIPIENT_SEPARATOR,
};
use parking_lot::Mutex;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

/// Timestamp format used in read receipts.
pub const RECEIPT_TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

#[derive(Debug, Clone)]
pub struct SessionSettings {
    /// Bound on the wait for a `KEY_FOUND`/`KEY_NOT_FOUND` reply
    pub key_timeout: Duration,
    /// Answer every decrypted message with a read receipt
    pub read_receipts: bool,
    pub typing_indicators: bool,
    /// Minimum spacing between outgoing typing signals
    pub typing_throttle: Duration,
    pub max_frame_size: usize,
    /// Reject a key whose derived id is not the id that was looked up
    pub verify_peer_keys: bool,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            key_timeout: Duration::from_millis(2000),
            read_receipts: true,
            typing_indicators: true,
            typing_throttle: Duration::from_secs(3),
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            verify_peer_keys: true,
        }
    }
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("failed to connect to {addr}: {source}")]
    Connect {
        addr: String,
        source: std::io::Error,
    },

    #[error("invalid agent id {0:?}")]
    InvalidRecipient(String),

    #[error("agent {0} is not known to the relay")]
    UnknownRecipient(String),

    #[error("timed out waiting for the public key of {0}")]
    HandshakeTimeout(String),

    #[error("connection to the relay is closed")]
    Closed,

    #[error(transparent)]
    Wire(#[from] WireError),

    #[error(transparent)]
    Envelope(#[from] EnvelopeError),

    #[error("relay returned an unusable key for {0}")]
    InvalidKey(String),

    #[error("key returned for {requested} belongs to {actual}")]
    KeyMismatch { requested: String, actual: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Something the relay told us.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    AgentList(Vec<AgentSummary>),
    Message {
        from: String,
        /// Plaintext, or the undecryptable sentinel
        text: String,
        decrypted: bool,
    },
    File {
        from: String,
        name: String,
        size: u64,
        /// `None` when the file could not be decrypted
        contents: Option<Vec<u8>>,
    },
    Typing {
        from: String,
    },
    Receipt {
        from: String,
        timestamp: String,
    },
    /// The listener stopped; no further events follow.
    Disconnected,
}

/// Per-recipient outcome of [`AgentSession::send_message_to_many`].
#[derive(Debug, Default)]
pub struct SendReport {
    pub sent: Vec<String>,
    pub failed: Vec<(String, SessionError)>,
}

enum WriterCommand {
    Send(Frame),
    Shutdown,
}

type KeyWaiter = oneshot::Sender<Option<String>>;

struct Shared {
    keypair: AgentKeypair,
    settings: SessionSettings,
    outbound: mpsc::UnboundedSender<WriterCommand>,
    pending_keys: Mutex<VecDeque<KeyWaiter>>,
    blocked: Mutex<BTreeSet<String>>,
    last_typing: Mutex<Option<Instant>>,
}

impl Shared {
    fn send(&self, frame: Frame) -> Result<(), SessionError> {
        self.outbound
            .send(WriterCommand::Send(frame))
            .map_err(|_| SessionError::Closed)
    }

    fn is_blocked(&self, agent_id: &str) -> bool {
        self.blocked.lock().contains(agent_id)
    }
}

pub struct AgentSession {
    agent_id: String,
    shared: Arc<Shared>,
    writer_task: Mutex<Option<JoinHandle<()>>>,
    listener_task: JoinHandle<()>,
}

impl AgentSession {
    /// Connect to `addr` and register as the owner of `keypair`.
    pub async fn connect(
        addr: &str,
        keypair: AgentKeypair,
        settings: SessionSettings,
    ) -> Result<(Self, mpsc::UnboundedReceiver<SessionEvent>), SessionError> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|source| SessionError::Connect {
                addr: addr.to_string(),
                source,
            })?;
        let _ = stream.set_nodelay(true);
        info!("Connected to relay at {}", addr);
        let (read_half, write_half) = stream.into_split();
        Ok(Self::start(read_half, write_half, keypair, settings))
    }

    /// Run a session over an already established byte stream.
    pub fn start<R, W>(
        reader: R,
        writer: W,
        keypair: AgentKeypair,
        settings: SessionSettings,
    ) -> (Self, mpsc::UnboundedReceiver<SessionEvent>)
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let codec = LengthCodec::new(settings.max_frame_size);
        let agent_id = keypair.agent_id();
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        // REGISTER must be the first frame on the wire
        let _ = outbound.send(WriterCommand::Send(Frame::Register {
            agent_id: agent_id.clone(),
            public_key_hex: keypair.public_key().to_hex(),
        }));

        let shared = Arc::new(Shared {
            keypair,
            settings,
            outbound,
            pending_keys: Mutex::new(VecDeque::new()),
            blocked: Mutex::new(BTreeSet::new()),
            last_typing: Mutex::new(None),
        });

        let writer_task = tokio::spawn(run_writer(FrameWriter::new(writer, codec), outbound_rx));
        let listener_task = tokio::spawn(run_listener(
            FrameReader::new(reader, codec),
            Arc::clone(&shared),
            events_tx,
        ));

        let session = Self {
            agent_id,
            shared,
            writer_task: Mutex::new(Some(writer_task)),
            listener_task,
        };
        (session, events_rx)
    }

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    /// Ask the relay for `target`'s public key.
    pub async fn resolve_key(&self, target: &str) -> Result<AgentPublicKey, SessionError> {
        check_target(target)?;
        // A key can only ever match an id in the derived form
        if self.shared.settings.verify_peer_keys && !is_well_formed_agent_id(target) {
            return Err(SessionError::InvalidRecipient(target.to_string()));
        }
        let (tx, rx) = oneshot::channel();
        {
            // Queue order must match frame order
            let mut pending = self.shared.pending_keys.lock();
            self.shared.send(Frame::GetKey(target.to_string()))?;
            pending.push_back(tx);
        }

        let reply = match tokio::time::timeout(self.shared.settings.key_timeout, rx).await {
            Err(_) => return Err(SessionError::HandshakeTimeout(target.to_string())),
            Ok(Err(_)) => return Err(SessionError::Closed),
            Ok(Ok(reply)) => reply,
        };
        let key_hex = reply.ok_or_else(|| SessionError::UnknownRecipient(target.to_string()))?;
        let key = AgentPublicKey::from_hex(&key_hex)
            .map_err(|_| SessionError::InvalidKey(target.to_string()))?;

        if self.shared.settings.verify_peer_keys && key.agent_id() != target {
            return Err(SessionError::KeyMismatch {
                requested: target.to_string(),
                actual: key.agent_id(),
            });
        }
        Ok(key)
    }

    /// Encrypt `text` for `target` and hand it to the relay.
    pub async fn send_message(&self, target: &str, text: &str) -> Result<(), SessionError> {
        let key = self.resolve_key(target).await?;
        let blob = seal_message(&key, text.as_bytes())?;
        self.shared.send(Frame::Msg {
            recipients: vec![target.to_string()],
            blob: blob.to_message_text(),
        })?;
        debug!("Queued message for {}", target);
        Ok(())
    }

    /// One frame per recipient, each sealed to that recipient's key.
    pub async fn send_message_to_many(&self, targets: &[String], text: &str) -> SendReport {
        let mut report = SendReport::default();
        for target in targets {
            if report.sent.contains(target) {
                continue;
            }
            match self.send_message(target, text).await {
                Ok(()) => report.sent.push(target.clone()),
                Err(e) => report.failed.push((target.clone(), e)),
            }
        }
        report
    }

    /// Read `path` and send it under its file name.
    pub async fn send_file(&self, target: &str, path: &Path) -> Result<u64, SessionError> {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or(SessionError::Envelope(EnvelopeError::InvalidFileName))?;
        let data = tokio::fs::read(path).await?;
        self.send_file_bytes(target, &name, &data).await?;
        Ok(data.len() as u64)
    }

    pub async fn send_file_bytes(
        &self,
        target: &str,
        name: &str,
        data: &[u8],
    ) -> Result<(), SessionError> {
        let key = self.resolve_key(target).await?;
        let blob = seal_file(&key, name, data)?;
        self.shared.send(Frame::File {
            recipients: vec![target.to_string()],
            blob: blob.to_file_text()?,
        })?;
        debug!("Queued file {} ({} bytes) for {}", name, data.len(), target);
        Ok(())
    }

    /// The reply arrives as [`SessionEvent::AgentList`].
    pub fn request_agent_list(&self) -> Result<(), SessionError> {
        self.shared.send(Frame::ListAgents)
    }

    /// Returns whether a signal went out; throttled and optional.
    pub fn notify_typing(&self, target: &str) -> Result<bool, SessionError> {
        if !self.shared.settings.typing_indicators {
            return Ok(false);
        }
        check_target(target)?;
        {
            let mut last = self.shared.last_typing.lock();
            let now = Instant::now();
            if let Some(prev) = *last {
                if now.duration_since(prev) < self.shared.settings.typing_throttle {
                    return Ok(false);
                }
            }
            *last = Some(now);
        }
        self.shared.send(Frame::Typing(target.to_string()))?;
        Ok(true)
    }

    pub fn send_read_receipt(&self, target: &str) -> Result<(), SessionError> {
        check_target(target)?;
        self.shared.send(read_receipt_for(target))
    }

    /// Drop further inbound traffic from `agent_id`. Returns false if already blocked.
    pub fn block(&self, agent_id: &str) -> bool {
        self.shared.blocked.lock().insert(agent_id.to_string())
    }

    pub fn unblock(&self, agent_id: &str) -> bool {
        self.shared.blocked.lock().remove(agent_id)
    }

    pub fn blocked(&self) -> Vec<String> {
        self.shared.blocked.lock().iter().cloned().collect()
    }

    pub fn is_blocked(&self, agent_id: &str) -> bool {
        self.shared.is_blocked(agent_id)
    }

    /// Flush queued frames and close the write side.
    ///
    /// The relay then drops the connection and the listener reports
    /// [`SessionEvent::Disconnected`].
    pub async fn close(&self) {
        let _ = self.shared.outbound.send(WriterCommand::Shutdown);
        let task = self.writer_task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}

impl Drop for AgentSession {
    fn drop(&mut self) {
        if let Some(task) = self.writer_task.lock().take() {
            task.abort();
        }
        self.listener_task.abort();
    }
}

fn check_target(target: &str) -> Result<(), SessionError> {
    let invalid = target.is_empty()
        || target.contains(PRIMARY_SEPARATOR)
        || target.contains(RECIPIENT_SEPARATOR)
        || target.contains(|c: char| c == '[' || c == ']')
        || target.chars().any(char::is_whitespace);
    if invalid {
        return Err(SessionError::InvalidRecipient(target.to_string()));
    }
    Ok(())
}

fn read_receipt_for(target: &str) -> Frame {
    Frame::ReadReceipt {
        target: target.to_string(),
        timestamp: chrono::Local::now()
            .format(RECEIPT_TIMESTAMP_FORMAT)
            .to_string(),
    }
}

async fn run_writer<W: AsyncWrite + Unpin>(
    mut writer: FrameWriter<W>,
    mut commands: mpsc::UnboundedReceiver<WriterCommand>,
) {
    while let Some(command) = commands.recv().await {
        match command {
            WriterCommand::Send(frame) => match writer.write_frame(&frame).await {
                Ok(()) => {}
                Err(e) if e.is_recoverable() => {
                    warn!("Not sending {} frame: {}", frame.tag(), e);
                }
                Err(e) => {
                    debug!("Write to relay failed: {}", e);
                    break;
                }
            },
            WriterCommand::Shutdown => break,
        }
    }
    let _ = writer.shutdown().await;
}

async fn run_listener<R: AsyncRead + Unpin>(
    mut reader: FrameReader<R>,
    shared: Arc<Shared>,
    events: mpsc::UnboundedSender<SessionEvent>,
) {
    loop {
        let frame = match reader.read_frame().await {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                info!("Relay closed the connection");
                break;
            }
            Err(e) if e.is_recoverable() => {
                warn!("Dropping frame from relay: {}", e);
                continue;
            }
            Err(e) => {
                warn!("Connection to relay failed: {}", e);
                break;
            }
        };

        // The receiver may be gone; key replies still need handling
        if let Some(event) = handle_inbound(&shared, frame) {
            let _ = events.send(event);
        }
    }

    // Outstanding lookups fail with Closed
    shared.pending_keys.lock().clear();
    let _ = events.send(SessionEvent::Disconnected);
}

fn handle_inbound(shared: &Shared, frame: Frame) -> Option<SessionEvent> {
    match frame {
        Frame::KeyFound(key_hex) => {
            complete_key_lookup(shared, Some(key_hex));
            None
        }
        Frame::KeyNotFound => {
            complete_key_lookup(shared, None);
            None
        }
        Frame::AgentList(agents) => Some(SessionEvent::AgentList(agents)),
        Frame::Incoming { sender, blob } => {
            if shared.is_blocked(&sender) {
                debug!("Dropped message from blocked agent {}", sender);
                return None;
            }
            let (text, decrypted) = match CipherBlob::parse_message_text(&blob) {
                Ok(blob) => {
                    let text = open_message_or_sentinel(&shared.keypair, &blob);
                    let decrypted = text != UNDECRYPTABLE_SENTINEL;
                    (text, decrypted)
                }
                Err(e) => {
                    warn!("Unreadable message blob from {}: {}", sender, e);
                    (UNDECRYPTABLE_SENTINEL.to_string(), false)
                }
            };
            if decrypted && shared.settings.read_receipts {
                let _ = shared.send(read_receipt_for(&sender));
            }
            Some(SessionEvent::Message {
                from: sender,
                text,
                decrypted,
            })
        }
        Frame::FileIncoming { sender, blob } => {
            if shared.is_blocked(&sender) {
                debug!("Dropped file from blocked agent {}", sender);
                return None;
            }
            let blob = match CipherBlob::parse_file_text(&blob) {
                Ok(blob) => blob,
                Err(e) => {
                    warn!("Unreadable file blob from {}: {}", sender, e);
                    return None;
                }
            };
            let contents = match open(&shared.keypair, &blob) {
                Ok(data) => Some(data),
                Err(e) => {
                    warn!("Could not decrypt file from {}: {}", sender, e);
                    None
                }
            };
            let (name, size) = blob
                .metadata
                .map(|meta| (meta.name, meta.size))
                .unwrap_or_default();
            Some(SessionEvent::File {
                from: sender,
                name,
                size,
                contents,
            })
        }
        Frame::TypingIndicator(sender) => {
            if shared.is_blocked(&sender) {
                return None;
            }
            Some(SessionEvent::Typing { from: sender })
        }
        Frame::Receipt { sender, timestamp } => {
            if shared.is_blocked(&sender) {
                return None;
            }
            Some(SessionEvent::Receipt {
                from: sender,
                timestamp,
            })
        }
        other => {
            warn!("Ignoring unexpected {} frame from relay", other.tag());
            None
        }
    }
}

fn complete_key_lookup(shared: &Shared, reply: Option<String>) {
    match shared.pending_keys.lock().pop_front() {
        // A waiter that already timed out just discards the reply
        Some(waiter) => {
            let _ = waiter.send(reply);
        }
        None => trace!("Key reply with no outstanding lookup"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, DuplexStream, ReadHalf, WriteHalf};

    /// The relay side of an in-memory session.
    struct FakeRelay {
        reader: FrameReader<ReadHalf<DuplexStream>>,
        writer: FrameWriter<WriteHalf<DuplexStream>>,
    }

    impl FakeRelay {
        async fn recv(&mut self) -> Frame {
            tokio::time::timeout(Duration::from_secs(5), self.reader.read_frame())
                .await
                .expect("timed out")
                .unwrap()
                .expect("session closed")
        }

        async fn send(&mut self, frame: Frame) {
            self.writer.write_frame(&frame).await.unwrap();
        }
    }

    fn session_with(
        keypair: AgentKeypair,
        settings: SessionSettings,
    ) -> (AgentSession, mpsc::UnboundedReceiver<SessionEvent>, FakeRelay) {
        let (client_io, relay_io) = duplex(1 << 16);
        let (client_r, client_w) = tokio::io::split(client_io);
        let (relay_r, relay_w) = tokio::io::split(relay_io);
        let (session, events) = AgentSession::start(client_r, client_w, keypair, settings);
        let relay = FakeRelay {
            reader: FrameReader::new(relay_r, LengthCodec::default()),
            writer: FrameWriter::new(relay_w, LengthCodec::default()),
        };
        (session, events, relay)
    }

    async fn next_event(events: &mut mpsc::UnboundedReceiver<SessionEvent>) -> SessionEvent {
        tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("timed out")
            .expect("event stream closed")
    }

    #[tokio::test]
    async fn test_register_is_first_frame() {
        let keypair = AgentKeypair::generate();
        let id = keypair.agent_id();
        let key_hex = keypair.public_key().to_hex();
        let (_session, _events, mut relay) = session_with(keypair, SessionSettings::default());

        assert_eq!(
            relay.recv().await,
            Frame::Register {
                agent_id: id,
                public_key_hex: key_hex
            }
        );
    }

    #[tokio::test]
    async fn test_concurrent_lookups_pair_in_order() {
        let (session, _events, mut relay) =
            session_with(AgentKeypair::generate(), SessionSettings::default());
        let _ = relay.recv().await;

        let b = AgentKeypair::generate();
        let c = AgentKeypair::generate();
        let (b_id, c_id) = (b.agent_id(), c.agent_id());

        let session = Arc::new(session);
        let s1 = Arc::clone(&session);
        let first = {
            let b_id = b_id.clone();
            tokio::spawn(async move { s1.resolve_key(&b_id).await })
        };
        assert_eq!(relay.recv().await, Frame::GetKey(b_id.clone()));

        let s2 = Arc::clone(&session);
        let second = {
            let c_id = c_id.clone();
            tokio::spawn(async move { s2.resolve_key(&c_id).await })
        };
        assert_eq!(relay.recv().await, Frame::GetKey(c_id.clone()));

        relay.send(Frame::KeyFound(b.public_key().to_hex())).await;
        relay.send(Frame::KeyNotFound).await;

        assert_eq!(first.await.unwrap().unwrap(), b.public_key());
        assert!(matches!(
            second.await.unwrap(),
            Err(SessionError::UnknownRecipient(id)) if id == c_id
        ));
    }

    #[tokio::test]
    async fn test_lookup_times_out_and_late_reply_is_discarded() {
        let settings = SessionSettings {
            key_timeout: Duration::from_millis(50),
            ..Default::default()
        };
        let (session, _events, mut relay) = session_with(AgentKeypair::generate(), settings);
        let _ = relay.recv().await;

        let b = AgentKeypair::generate();
        let err = session.resolve_key(&b.agent_id()).await.unwrap_err();
        assert!(matches!(err, SessionError::HandshakeTimeout(_)));
        let _ = relay.recv().await;

        // The stale reply is consumed by the timed-out waiter
        relay.send(Frame::KeyNotFound).await;
        let session = Arc::new(session);
        let s = Arc::clone(&session);
        let b_id = b.agent_id();
        let lookup = tokio::spawn(async move { s.resolve_key(&b_id).await });
        let _ = relay.recv().await;
        relay.send(Frame::KeyFound(b.public_key().to_hex())).await;
        assert_eq!(lookup.await.unwrap().unwrap(), b.public_key());
    }

    #[tokio::test]
    async fn test_key_for_wrong_agent_is_rejected() {
        let (session, _events, mut relay) =
            session_with(AgentKeypair::generate(), SessionSettings::default());
        let _ = relay.recv().await;

        let b = AgentKeypair::generate();
        let impostor = AgentKeypair::generate();
        let session = Arc::new(session);
        let s = Arc::clone(&session);
        let b_id = b.agent_id();
        let lookup = tokio::spawn(async move { s.resolve_key(&b_id).await });
        let _ = relay.recv().await;
        relay.send(Frame::KeyFound(impostor.public_key().to_hex())).await;

        assert!(matches!(
            lookup.await.unwrap(),
            Err(SessionError::KeyMismatch { .. })
        ));
    }

    #[tokio::test]
    async fn test_invalid_target_never_reaches_wire() {
        let (session, _events, _relay) =
            session_with(AgentKeypair::generate(), SessionSettings::default());
        for bad in ["", "A|B", "A,B", "[X]", "has space"] {
            assert!(matches!(
                session.resolve_key(bad).await,
                Err(SessionError::InvalidRecipient(_))
            ));
        }
    }

    #[tokio::test]
    async fn test_non_derived_id_rejected_only_when_verifying() {
        let (session, _events, mut relay) =
            session_with(AgentKeypair::generate(), SessionSettings::default());
        let _ = relay.recv().await;
        for bad in ["AGENT-abc", "bob", "AGENT-0123456789ab"] {
            assert!(matches!(
                session.resolve_key(bad).await,
                Err(SessionError::InvalidRecipient(_))
            ));
        }

        let settings = SessionSettings {
            verify_peer_keys: false,
            ..Default::default()
        };
        let (session, _events, mut relay) = session_with(AgentKeypair::generate(), settings);
        let _ = relay.recv().await;
        let b = AgentKeypair::generate();
        let session = Arc::new(session);
        let s = Arc::clone(&session);
        let lookup = tokio::spawn(async move { s.resolve_key("bob").await });
        assert_eq!(relay.recv().await, Frame::GetKey("bob".into()));
        relay.send(Frame::KeyFound(b.public_key().to_hex())).await;
        assert_eq!(lookup.await.unwrap().unwrap(), b.public_key());
    }

    #[tokio::test]
    async fn test_incoming_message_decrypts_and_sends_receipt() {
        let me = AgentKeypair::generate();
        let my_key = me.public_key();
        let (_session, mut events, mut relay) = session_with(me, SessionSettings::default());
        let _ = relay.recv().await;

        let blob = seal_message(&my_key, b"hello there").unwrap();
        relay
            .send(Frame::Incoming {
                sender: "AGENT-AAAAAAAAAAAA".into(),
                blob: blob.to_message_text(),
            })
            .await;

        assert_eq!(
            next_event(&mut events).await,
            SessionEvent::Message {
                from: "AGENT-AAAAAAAAAAAA".into(),
                text: "hello there".into(),
                decrypted: true,
            }
        );
        match relay.recv().await {
            Frame::ReadReceipt { target, .. } => assert_eq!(target, "AGENT-AAAAAAAAAAAA"),
            other => panic!("expected read receipt, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_message_for_another_key_yields_sentinel() {
        let settings = SessionSettings {
            read_receipts: false,
            ..Default::default()
        };
        let (_session, mut events, mut relay) = session_with(AgentKeypair::generate(), settings);
        let _ = relay.recv().await;

        let other = AgentKeypair::generate();
        let blob = seal_message(&other.public_key(), b"not for you").unwrap();
        relay
            .send(Frame::Incoming {
                sender: "AGENT-BBBBBBBBBBBB".into(),
                blob: blob.to_message_text(),
            })
            .await;

        match next_event(&mut events).await {
            SessionEvent::Message {
                text, decrypted, ..
            } => {
                assert_eq!(text, UNDECRYPTABLE_SENTINEL);
                assert!(!decrypted);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_blocked_sender_is_dropped() {
        let me = AgentKeypair::generate();
        let my_key = me.public_key();
        let (session, mut events, mut relay) = session_with(me, SessionSettings::default());
        let _ = relay.recv().await;

        assert!(session.block("AGENT-CCCCCCCCCCCC"));
        assert!(!session.block("AGENT-CCCCCCCCCCCC"));
        assert_eq!(session.blocked(), vec!["AGENT-CCCCCCCCCCCC".to_string()]);

        relay
            .send(Frame::TypingIndicator("AGENT-CCCCCCCCCCCC".into()))
            .await;
        relay
            .send(Frame::Incoming {
                sender: "AGENT-CCCCCCCCCCCC".into(),
                blob: seal_message(&my_key, b"spam").unwrap().to_message_text(),
            })
            .await;
        relay
            .send(Frame::TypingIndicator("AGENT-DDDDDDDDDDDD".into()))
            .await;

        assert_eq!(
            next_event(&mut events).await,
            SessionEvent::Typing {
                from: "AGENT-DDDDDDDDDDDD".into()
            }
        );

        assert!(session.unblock("AGENT-CCCCCCCCCCCC"));
        assert!(!session.is_blocked("AGENT-CCCCCCCCCCCC"));
    }

    #[tokio::test]
    async fn test_incoming_file_event() {
        let me = AgentKeypair::generate();
        let my_key = me.public_key();
        let (_session, mut events, mut relay) = session_with(me, SessionSettings::default());
        let _ = relay.recv().await;

        let blob = seal_file(&my_key, "notes.txt", b"file body").unwrap();
        relay
            .send(Frame::FileIncoming {
                sender: "AGENT-EEEEEEEEEEEE".into(),
                blob: blob.to_file_text().unwrap(),
            })
            .await;

        assert_eq!(
            next_event(&mut events).await,
            SessionEvent::File {
                from: "AGENT-EEEEEEEEEEEE".into(),
                name: "notes.txt".into(),
                size: 9,
                contents: Some(b"file body".to_vec()),
            }
        );
    }

    #[tokio::test]
    async fn test_typing_is_throttled() {
        let (session, _events, mut relay) =
            session_with(AgentKeypair::generate(), SessionSettings::default());
        let _ = relay.recv().await;

        assert!(session.notify_typing("AGENT-FFFFFFFFFFFF").unwrap());
        assert!(!session.notify_typing("AGENT-FFFFFFFFFFFF").unwrap());
        assert_eq!(
            relay.recv().await,
            Frame::Typing("AGENT-FFFFFFFFFFFF".into())
        );

        let disabled = SessionSettings {
            typing_indicators: false,
            ..Default::default()
        };
        let (quiet, _events, _relay) = session_with(AgentKeypair::generate(), disabled);
        assert!(!quiet.notify_typing("AGENT-FFFFFFFFFFFF").unwrap());
    }

    #[tokio::test]
    async fn test_manual_read_receipt() {
        let (session, _events, mut relay) =
            session_with(AgentKeypair::generate(), SessionSettings::default());
        let _ = relay.recv().await;

        session.send_read_receipt("AGENT-222222222222").unwrap();
        match relay.recv().await {
            Frame::ReadReceipt { target, timestamp } => {
                assert_eq!(target, "AGENT-222222222222");
                assert!(
                    chrono::NaiveDateTime::parse_from_str(&timestamp, RECEIPT_TIMESTAMP_FORMAT)
                        .is_ok()
                );
            }
            other => panic!("expected read receipt, got {other:?}"),
        }
        assert!(matches!(
            session.send_read_receipt("bad id"),
            Err(SessionError::InvalidRecipient(_))
        ));
    }

    #[tokio::test]
    async fn test_relay_close_fails_pending_lookup_and_emits_disconnected() {
        let (session, mut events, mut relay) =
            session_with(AgentKeypair::generate(), SessionSettings::default());
        let _ = relay.recv().await;

        let session = Arc::new(session);
        let s = Arc::clone(&session);
        let lookup = tokio::spawn(async move { s.resolve_key("AGENT-111111111111").await });
        let _ = relay.recv().await;
        drop(relay);

        assert!(matches!(lookup.await.unwrap(), Err(SessionError::Closed)));
        assert_eq!(next_event(&mut events).await, SessionEvent::Disconnected);
    }
}
