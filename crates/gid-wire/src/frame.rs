//! Tagged text frames.
//!
//! A frame body is `[TAG]payload`. Fields inside the payload are split by
//! [`PRIMARY_SEPARATOR`], repeated entries by [`SECONDARY_SEPARATOR`] and
//! recipient lists by [`RECIPIENT_SEPARATOR`]. The last field of every
//! payload is taken verbatim, so ciphertext blobs may contain separators.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

use crate::framing::FramingError;

pub const PRIMARY_SEPARATOR: char = '|';
pub const SECONDARY_SEPARATOR: &str = "||";
pub const RECIPIENT_SEPARATOR: char = ',';

#[derive(Debug, Error)]
pub enum WireError {
    #[error("malformed frame: {0}")]
    Malformed(String),

    #[error("{field} contains a reserved delimiter: {value:?}")]
    Delimiter { field: &'static str, value: String },

    #[error(transparent)]
    Framing(#[from] FramingError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl WireError {
    fn malformed(msg: impl Into<String>) -> Self {
        Self::Malformed(msg.into())
    }

    /// Whether the stream is still in sync after this error.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Malformed(_) | Self::Delimiter { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tag {
    Register,
    ListAgents,
    AgentList,
    GetKey,
    KeyFound,
    KeyNotFound,
    Msg,
    Incoming,
    File,
    FileIncoming,
    Typing,
    TypingIndicator,
    ReadReceipt,
    Receipt,
}

impl Tag {
    pub fn as_str(&self) -> &'static str {
        match self {
            Tag::Register => "REGISTER",
            Tag::ListAgents => "LIST_AGENTS",
            Tag::AgentList => "AGENT_LIST",
            Tag::GetKey => "GET_KEY",
            Tag::KeyFound => "KEY_FOUND",
            Tag::KeyNotFound => "KEY_NOT_FOUND",
            Tag::Msg => "MSG",
            Tag::Incoming => "INCOMING",
            Tag::File => "FILE",
            Tag::FileIncoming => "FILE_INCOMING",
            Tag::Typing => "TYPING",
            Tag::TypingIndicator => "TYPING_INDICATOR",
            Tag::ReadReceipt => "READ_RECEIPT",
            Tag::Receipt => "RECEIPT",
        }
    }

    /// Tags a client may send to the relay.
    pub fn is_client_to_server(&self) -> bool {
        matches!(
            self,
            Tag::Register
                | Tag::ListAgents
                | Tag::GetKey
                | Tag::Msg
                | Tag::File
                | Tag::Typing
                | Tag::ReadReceipt
        )
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Tag {
    type Err = WireError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "REGISTER" => Tag::Register,
            "LIST_AGENTS" => Tag::ListAgents,
            "AGENT_LIST" => Tag::AgentList,
            "GET_KEY" => Tag::GetKey,
            "KEY_FOUND" => Tag::KeyFound,
            "KEY_NOT_FOUND" => Tag::KeyNotFound,
            "MSG" => Tag::Msg,
            "INCOMING" => Tag::Incoming,
            "FILE" => Tag::File,
            "FILE_INCOMING" => Tag::FileIncoming,
            "TYPING" => Tag::Typing,
            "TYPING_INDICATOR" => Tag::TypingIndicator,
            "READ_RECEIPT" => Tag::ReadReceipt,
            "RECEIPT" => Tag::Receipt,
            other => return Err(WireError::malformed(format!("unknown tag {other:?}"))),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresenceStatus {
    Online,
    Offline,
}

impl PresenceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PresenceStatus::Online => "ONLINE",
            PresenceStatus::Offline => "OFFLINE",
        }
    }
}

impl fmt::Display for PresenceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PresenceStatus {
    type Err = WireError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ONLINE" => Ok(PresenceStatus::Online),
            "OFFLINE" => Ok(PresenceStatus::Offline),
            other => Err(WireError::malformed(format!("unknown status {other:?}"))),
        }
    }
}

/// One row of an `AGENT_LIST` reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentSummary {
    pub agent_id: String,
    pub status: PresenceStatus,
    pub last_seen: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Register { agent_id: String, public_key_hex: String },
    ListAgents,
    AgentList(Vec<AgentSummary>),
    GetKey(String),
    KeyFound(String),
    KeyNotFound,
    Msg { recipients: Vec<String>, blob: String },
    Incoming { sender: String, blob: String },
    File { recipients: Vec<String>, blob: String },
    FileIncoming { sender: String, blob: String },
    Typing(String),
    TypingIndicator(String),
    ReadReceipt { target: String, timestamp: String },
    Receipt { sender: String, timestamp: String },
}

fn check_field(field: &'static str, value: &str) -> Result<(), WireError> {
    if value.is_empty() {
        return Err(WireError::malformed(format!("empty {field}")));
    }
    if value.contains(PRIMARY_SEPARATOR)
        || value.contains(RECIPIENT_SEPARATOR)
        || value.contains(']')
    {
        return Err(WireError::Delimiter {
            field,
            value: value.to_string(),
        });
    }
    Ok(())
}

fn join_recipients(recipients: &[String]) -> Result<String, WireError> {
    if recipients.is_empty() {
        return Err(WireError::malformed("no recipients"));
    }
    for r in recipients {
        check_field("recipient", r)?;
    }
    Ok(recipients.join(&RECIPIENT_SEPARATOR.to_string()))
}

fn split_recipients(list: &str) -> Result<Vec<String>, WireError> {
    let recipients: Vec<String> = list
        .split(RECIPIENT_SEPARATOR)
        .map(str::trim)
        .filter(|r| !r.is_empty())
        .map(str::to_string)
        .collect();
    if recipients.is_empty() {
        return Err(WireError::malformed("no recipients"));
    }
    Ok(recipients)
}

/// Split `payload` into a leading field and the verbatim remainder.
fn split_head<'a>(tag: Tag, payload: &'a str) -> Result<(&'a str, &'a str), WireError> {
    let (head, rest) = payload
        .split_once(PRIMARY_SEPARATOR)
        .ok_or_else(|| WireError::malformed(format!("{tag} payload needs two fields")))?;
    if head.is_empty() || rest.is_empty() {
        return Err(WireError::malformed(format!("{tag} payload has an empty field")));
    }
    Ok((head, rest))
}

fn non_empty(tag: Tag, payload: &str) -> Result<String, WireError> {
    let value = payload.trim();
    if value.is_empty() {
        return Err(WireError::malformed(format!("{tag} payload is empty")));
    }
    Ok(value.to_string())
}

impl Frame {
    pub fn tag(&self) -> Tag {
        match self {
            Frame::Register { .. } => Tag::Register,
            Frame::ListAgents => Tag::ListAgents,
            Frame::AgentList(_) => Tag::AgentList,
            Frame::GetKey(_) => Tag::GetKey,
            Frame::KeyFound(_) => Tag::KeyFound,
            Frame::KeyNotFound => Tag::KeyNotFound,
            Frame::Msg { .. } => Tag::Msg,
            Frame::Incoming { .. } => Tag::Incoming,
            Frame::File { .. } => Tag::File,
            Frame::FileIncoming { .. } => Tag::FileIncoming,
            Frame::Typing(_) => Tag::Typing,
            Frame::TypingIndicator(_) => Tag::TypingIndicator,
            Frame::ReadReceipt { .. } => Tag::ReadReceipt,
            Frame::Receipt { .. } => Tag::Receipt,
        }
    }

    /// Render the text payload (everything after the tag).
    fn payload(&self) -> Result<String, WireError> {
        Ok(match self {
            Frame::Register { agent_id, public_key_hex } => {
                check_field("agent id", agent_id)?;
                check_field("public key", public_key_hex)?;
                format!("{agent_id}{PRIMARY_SEPARATOR}{public_key_hex}")
            }
            Frame::ListAgents | Frame::KeyNotFound => String::new(),
            Frame::AgentList(agents) => {
                let mut rows = Vec::with_capacity(agents.len());
                for a in agents {
                    check_field("agent id", &a.agent_id)?;
                    if a.last_seen.contains(PRIMARY_SEPARATOR) {
                        return Err(WireError::Delimiter {
                            field: "last seen",
                            value: a.last_seen.clone(),
                        });
                    }
                    rows.push(format!(
                        "{}{PRIMARY_SEPARATOR}{}{PRIMARY_SEPARATOR}{}",
                        a.agent_id, a.status, a.last_seen
                    ));
                }
                rows.join(SECONDARY_SEPARATOR)
            }
            Frame::GetKey(id) | Frame::Typing(id) | Frame::TypingIndicator(id) => {
                check_field("agent id", id)?;
                id.clone()
            }
            Frame::KeyFound(key) => {
                check_field("public key", key)?;
                key.clone()
            }
            Frame::Msg { recipients, blob } | Frame::File { recipients, blob } => {
                if blob.is_empty() {
                    return Err(WireError::malformed("empty blob"));
                }
                format!("{}{PRIMARY_SEPARATOR}{blob}", join_recipients(recipients)?)
            }
            Frame::Incoming { sender, blob } | Frame::FileIncoming { sender, blob } => {
                check_field("sender", sender)?;
                if blob.is_empty() {
                    return Err(WireError::malformed("empty blob"));
                }
                format!("{sender}{PRIMARY_SEPARATOR}{blob}")
            }
            Frame::ReadReceipt { target: id, timestamp } | Frame::Receipt { sender: id, timestamp } => {
                check_field("agent id", id)?;
                format!("{id}{PRIMARY_SEPARATOR}{timestamp}")
            }
        })
    }

    /// Encode to a frame body (without the length prefix).
    pub fn encode(&self) -> Result<Vec<u8>, WireError> {
        let payload = self.payload()?;
        let tag = self.tag();
        let mut out = String::with_capacity(tag.as_str().len() + 2 + payload.len());
        out.push('[');
        out.push_str(tag.as_str());
        out.push(']');
        out.push_str(&payload);
        Ok(out.into_bytes())
    }

    /// Decode a frame body.
    pub fn decode(body: &[u8]) -> Result<Self, WireError> {
        let text = std::str::from_utf8(body).map_err(|_| WireError::malformed("body is not UTF-8"))?;
        let rest = text
            .strip_prefix('[')
            .ok_or_else(|| WireError::malformed("missing tag"))?;
        let (tag, payload) = rest
            .split_once(']')
            .ok_or_else(|| WireError::malformed("unterminated tag"))?;
        let tag: Tag = tag.parse()?;

        Ok(match tag {
            Tag::Register => {
                let (agent_id, key) = split_head(tag, payload)?;
                Frame::Register {
                    agent_id: agent_id.trim().to_string(),
                    public_key_hex: key.trim().to_string(),
                }
            }
            Tag::ListAgents => Frame::ListAgents,
            Tag::KeyNotFound => Frame::KeyNotFound,
            Tag::AgentList => {
                let mut agents = Vec::new();
                for row in payload.split(SECONDARY_SEPARATOR).filter(|r| !r.is_empty()) {
                    let mut fields = row.splitn(3, PRIMARY_SEPARATOR);
                    let (Some(agent_id), Some(status), Some(last_seen)) =
                        (fields.next(), fields.next(), fields.next())
                    else {
                        return Err(WireError::malformed("agent list row needs three fields"));
                    };
                    agents.push(AgentSummary {
                        agent_id: agent_id.to_string(),
                        status: status.parse()?,
                        last_seen: last_seen.to_string(),
                    });
                }
                Frame::AgentList(agents)
            }
            Tag::GetKey => Frame::GetKey(non_empty(tag, payload)?),
            Tag::KeyFound => Frame::KeyFound(non_empty(tag, payload)?),
            Tag::Typing => Frame::Typing(non_empty(tag, payload)?),
            Tag::TypingIndicator => Frame::TypingIndicator(non_empty(tag, payload)?),
            Tag::Msg | Tag::File => {
                let (list, blob) = split_head(tag, payload)?;
                let recipients = split_recipients(list)?;
                let blob = blob.to_string();
                if tag == Tag::Msg {
                    Frame::Msg { recipients, blob }
                } else {
                    Frame::File { recipients, blob }
                }
            }
            Tag::Incoming | Tag::FileIncoming => {
                let (sender, blob) = split_head(tag, payload)?;
                let sender = sender.to_string();
                let blob = blob.to_string();
                if tag == Tag::Incoming {
                    Frame::Incoming { sender, blob }
                } else {
                    Frame::FileIncoming { sender, blob }
                }
            }
            Tag::ReadReceipt | Tag::Receipt => {
                let (id, timestamp) = split_head(tag, payload)?;
                let id = id.trim().to_string();
                let timestamp = timestamp.to_string();
                if tag == Tag::ReadReceipt {
                    Frame::ReadReceipt { target: id, timestamp }
                } else {
                    Frame::Receipt { sender: id, timestamp }
                }
            }
        })
    }
}
