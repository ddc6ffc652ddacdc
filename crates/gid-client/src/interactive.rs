//! Line-oriented chat front end over an [`AgentSession`].

use std::path::{Path, PathBuf};
use std::sync::Arc;

use gid_wire::{AgentSummary, PresenceStatus, RECIPIENT_SEPARATOR};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::session::{AgentSession, SessionEvent};

pub const HELP_TEXT: &str = "\
Commands:
  /agents             list agents known to the relay
  /to <id>[,<id>...]  set the recipient(s) of plain text lines
  /sendfile <path>    send a file to the current recipient(s)
  /block <id>         drop messages from an agent
  /unblock <id>       stop blocking an agent
  /blocklist          show blocked agents
  /help               show this help
  /exit, /quit        leave
Any other line is sent as a message to the current recipient(s).";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InteractiveCommand {
    Agents,
    To(Vec<String>),
    SendFile(PathBuf),
    Block(String),
    Unblock(String),
    Blocklist,
    Help,
    Exit,
    Text(String),
    Empty,
    /// Unknown command or a command missing its argument
    Invalid(String),
}

impl InteractiveCommand {
    pub fn parse(line: &str) -> Self {
        let line = line.trim();
        if line.is_empty() {
            return Self::Empty;
        }
        if !line.starts_with('/') {
            return Self::Text(line.to_string());
        }

        let (command, arg) = match line.split_once(char::is_whitespace) {
            Some((command, arg)) => (command, arg.trim()),
            None => (line, ""),
        };

        match (command, arg) {
            ("/agents", _) => Self::Agents,
            ("/blocklist", _) => Self::Blocklist,
            ("/help", _) => Self::Help,
            ("/exit" | "/quit", _) => Self::Exit,
            ("/to" | "/sendfile" | "/block" | "/unblock", "") => {
                Self::Invalid(format!("{command} needs an argument"))
            }
            ("/to", targets) => {
                let targets: Vec<String> = targets
                    .split(RECIPIENT_SEPARATOR)
                    .map(str::trim)
                    .filter(|t| !t.is_empty())
                    .map(str::to_string)
                    .collect();
                if targets.is_empty() {
                    Self::Invalid("/to needs at least one agent id".to_string())
                } else {
                    Self::To(targets)
                }
            }
            ("/sendfile", path) => Self::SendFile(PathBuf::from(path)),
            ("/block", id) => Self::Block(id.to_string()),
            ("/unblock", id) => Self::Unblock(id.to_string()),
            _ => Self::Invalid(format!("unknown command {command}, try /help")),
        }
    }
}

/// Where a received file is written: `<dir>/<sender>_<name>`.
///
/// Only the final path component of `name` is used.
pub fn download_path(dir: &Path, sender: &str, name: &str) -> PathBuf {
    let base = Path::new(name)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .filter(|n| !n.is_empty())
        .unwrap_or_else(|| "file".to_string());
    dir.join(format!("{sender}_{base}"))
}

pub fn render_agent_list(agents: &[AgentSummary], me: &str) -> String {
    if agents.is_empty() {
        return "No agents registered".to_string();
    }
    let mut out = String::from("Agents:");
    for agent in agents {
        let marker = if agent.agent_id == me { " (you)" } else { "" };
        let status = match agent.status {
            PresenceStatus::Online => "online".to_string(),
            PresenceStatus::Offline => format!("offline, last seen {}", agent.last_seen),
        };
        out.push_str(&format!("\n  {}{} [{}]", agent.agent_id, marker, status));
    }
    out
}

/// Save a decrypted file, returning its path.
pub async fn save_download(
    dir: &Path,
    sender: &str,
    name: &str,
    contents: &[u8],
) -> std::io::Result<PathBuf> {
    tokio::fs::create_dir_all(dir).await?;
    let path = download_path(dir, sender, name);
    tokio::fs::write(&path, contents).await?;
    Ok(path)
}

/// Print one event, saving decrypted files under `downloads`.
pub async fn show_event(event: SessionEvent, me: &str, downloads: &Path) {
    match event {
        SessionEvent::AgentList(agents) => println!("{}", render_agent_list(&agents, me)),
        SessionEvent::Message { from, text, .. } => println!("[{from}] {text}"),
        SessionEvent::File {
            from,
            name,
            size,
            contents: Some(contents),
        } => match save_download(downloads, &from, &name, &contents).await {
            Ok(path) => println!("[{from}] sent file {name} ({size} bytes), saved to {}", path.display()),
            Err(e) => println!("[{from}] sent file {name}, could not save it: {e}"),
        },
        SessionEvent::File { from, name, .. } => {
            println!("[{from}] sent file {name}, but it could not be decrypted");
        }
        SessionEvent::Typing { from } => println!("({from} is typing...)"),
        SessionEvent::Receipt { from, timestamp } => println!("(read by {from} at {timestamp})"),
        SessionEvent::Disconnected => println!("Disconnected from relay"),
    }
}

/// Drive the session from stdin until `/exit`, EOF or disconnection.
pub async fn run(
    session: Arc<AgentSession>,
    mut events: mpsc::UnboundedReceiver<SessionEvent>,
    downloads: PathBuf,
) -> anyhow::Result<()> {
    let me = session.agent_id().to_string();
    println!("You are {me}. Type /help for commands.");
    session.request_agent_list()?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut targets: Vec<String> = Vec::new();

    loop {
        tokio::select! {
            event = events.recv() => {
                match event {
                    Some(SessionEvent::Disconnected) | None => {
                        show_event(SessionEvent::Disconnected, &me, &downloads).await;
                        break;
                    }
                    Some(event) => show_event(event, &me, &downloads).await,
                }
            }
            line = lines.next_line() => {
                let Some(line) = line? else {
                    debug!("stdin closed");
                    break;
                };
                if !execute(&session, InteractiveCommand::parse(&line), &mut targets).await {
                    break;
                }
            }
        }
    }

    session.close().await;
    Ok(())
}

/// Returns false when the loop should end.
async fn execute(
    session: &AgentSession,
    command: InteractiveCommand,
    targets: &mut Vec<String>,
) -> bool {
    match command {
        InteractiveCommand::Empty => {}
        InteractiveCommand::Help => println!("{HELP_TEXT}"),
        InteractiveCommand::Exit => return false,
        InteractiveCommand::Invalid(reason) => println!("{reason}"),
        InteractiveCommand::Agents => {
            if session.request_agent_list().is_err() {
                return false;
            }
        }
        InteractiveCommand::To(new_targets) => {
            println!("Now talking to {}", new_targets.join(", "));
            *targets = new_targets;
        }
        InteractiveCommand::Block(id) => {
            if session.block(&id) {
                println!("Blocked {id}");
            } else {
                println!("{id} was already blocked");
            }
        }
        InteractiveCommand::Unblock(id) => {
            if session.unblock(&id) {
                println!("Unblocked {id}");
            } else {
                println!("{id} was not blocked");
            }
        }
        InteractiveCommand::Blocklist => {
            let blocked = session.blocked();
            if blocked.is_empty() {
                println!("Nobody is blocked");
            } else {
                println!("Blocked: {}", blocked.join(", "));
            }
        }
        InteractiveCommand::SendFile(path) => {
            if targets.is_empty() {
                println!("Pick a recipient with /to first");
                return true;
            }
            for target in targets.iter() {
                match session.send_file(target, &path).await {
                    Ok(size) => println!("Sent {} ({size} bytes) to {target}", path.display()),
                    Err(e) => println!("Could not send {} to {target}: {e}", path.display()),
                }
            }
        }
        InteractiveCommand::Text(text) => {
            if targets.is_empty() {
                println!("Pick a recipient with /to first");
                return true;
            }
            for target in targets.iter() {
                if let Err(e) = session.notify_typing(target) {
                    warn!("Typing signal to {} failed: {}", target, e);
                }
            }
            let report = session.send_message_to_many(targets, &text).await;
            for (target, err) in report.failed {
                println!("Could not send to {target}: {err}");
            }
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_commands() {
        assert_eq!(InteractiveCommand::parse("/agents"), InteractiveCommand::Agents);
        assert_eq!(InteractiveCommand::parse("  /quit "), InteractiveCommand::Exit);
        assert_eq!(InteractiveCommand::parse("/exit"), InteractiveCommand::Exit);
        assert_eq!(InteractiveCommand::parse("/blocklist"), InteractiveCommand::Blocklist);
        assert_eq!(InteractiveCommand::parse(""), InteractiveCommand::Empty);
        assert_eq!(
            InteractiveCommand::parse("/to AGENT-AAAAAAAAAAAA"),
            InteractiveCommand::To(vec!["AGENT-AAAAAAAAAAAA".into()])
        );
        assert_eq!(
            InteractiveCommand::parse("/to AGENT-A, AGENT-B"),
            InteractiveCommand::To(vec!["AGENT-A".into(), "AGENT-B".into()])
        );
        assert_eq!(
            InteractiveCommand::parse("/sendfile /tmp/report final.pdf"),
            InteractiveCommand::SendFile(PathBuf::from("/tmp/report final.pdf"))
        );
        assert_eq!(
            InteractiveCommand::parse("/block AGENT-X"),
            InteractiveCommand::Block("AGENT-X".into())
        );
        assert_eq!(
            InteractiveCommand::parse("/unblock AGENT-X"),
            InteractiveCommand::Unblock("AGENT-X".into())
        );
    }

    #[test]
    fn test_parse_text_and_errors() {
        assert_eq!(
            InteractiveCommand::parse("hello, world"),
            InteractiveCommand::Text("hello, world".into())
        );
        assert!(matches!(InteractiveCommand::parse("/to"), InteractiveCommand::Invalid(_)));
        assert!(matches!(InteractiveCommand::parse("/to ,"), InteractiveCommand::Invalid(_)));
        assert!(matches!(InteractiveCommand::parse("/dance"), InteractiveCommand::Invalid(_)));
    }

    #[test]
    fn test_download_path_strips_directories() {
        let dir = Path::new("downloads");
        assert_eq!(
            download_path(dir, "AGENT-A", "notes.txt"),
            PathBuf::from("downloads/AGENT-A_notes.txt")
        );
        assert_eq!(
            download_path(dir, "AGENT-A", "../../etc/passwd"),
            PathBuf::from("downloads/AGENT-A_passwd")
        );
        assert_eq!(
            download_path(dir, "AGENT-A", ".."),
            PathBuf::from("downloads/AGENT-A_file")
        );
    }

    #[test]
    fn test_render_agent_list() {
        let agents = vec![
            AgentSummary {
                agent_id: "AGENT-A".into(),
                status: PresenceStatus::Online,
                last_seen: "2026-01-01 10:00:00".into(),
            },
            AgentSummary {
                agent_id: "AGENT-B".into(),
                status: PresenceStatus::Offline,
                last_seen: "2026-01-01 09:00:00".into(),
            },
        ];
        let text = render_agent_list(&agents, "AGENT-A");
        assert!(text.contains("AGENT-A (you) [online]"));
        assert!(text.contains("AGENT-B [offline, last seen 2026-01-01 09:00:00]"));
        assert_eq!(render_agent_list(&[], "AGENT-A"), "No agents registered");
    }

    #[tokio::test]
    async fn test_save_download_writes_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = save_download(&dir.path().join("dl"), "AGENT-A", "x.bin", b"abc")
            .await
            .unwrap();
        assert_eq!(std::fs::read(path).unwrap(), b"abc");
    }
}
