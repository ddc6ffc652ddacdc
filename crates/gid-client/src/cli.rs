//! CLI command definitions and argument parsing

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use gid_wire::AgentSummary;
use tokio::sync::mpsc;
use tracing::info;

use crate::config::Config;
use crate::identity::IdentityManager;
use crate::interactive::{self, render_agent_list};
use crate::session::{AgentSession, SessionEvent};
use crate::ExitCode;

/// G.I.D agent client - end-to-end encrypted messaging through a relay
#[derive(Parser, Debug)]
#[command(name = "gid-client")]
#[command(version, about = "G.I.D agent client - end-to-end encrypted messaging")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Relay address as host or host:port
    #[arg(long, global = true, env = "GID_SERVER")]
    pub server: Option<String>,

    /// Verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Debug logging
    #[arg(long, global = true)]
    pub debug: bool,

    /// Config file path
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Interactive chat session (default)
    Run,

    /// Local identity management
    Identity {
        #[command(subcommand)]
        action: IdentityAction,
    },

    /// Print the agents known to the relay
    Agents,

    /// Send one message and exit
    Send {
        /// Recipient agent id
        target: String,
        /// Message text
        text: String,
    },

    /// Send one file and exit
    SendFile {
        /// Recipient agent id
        target: String,
        path: PathBuf,
    },
}

#[derive(Subcommand, Debug)]
pub enum IdentityAction {
    /// Show the agent id and public key
    Show {
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },
    /// Create a new identity
    Init {
        /// Replace an existing identity
        #[arg(long)]
        force: bool,
    },
}

/// How long one-shot commands wait for the relay to answer.
const ONE_SHOT_REPLY_TIMEOUT: Duration = Duration::from_secs(5);

impl Cli {
    /// Execute the CLI command with a pre-loaded configuration
    pub async fn execute_with_config(self, config: Config) -> anyhow::Result<ExitCode> {
        match self.command.unwrap_or(Commands::Run) {
            Commands::Run => run_interactive(&config).await,
            Commands::Identity { action } => identity_command(&config, action),
            Commands::Agents => list_agents(&config).await,
            Commands::Send { target, text } => {
                let Some((session, mut events)) = connect(&config).await? else {
                    return Ok(ExitCode::ConnectionFailed);
                };
                let code = match session.send_message(&target, &text).await {
                    Ok(()) => {
                        println!("Message sent to {target}");
                        ExitCode::Success
                    }
                    Err(e) => {
                        eprintln!("Error: {e}");
                        ExitCode::from(&e)
                    }
                };
                finish_one_shot(&session, &mut events, &config.downloads.dir, code).await
            }
            Commands::SendFile { target, path } => {
                let Some((session, mut events)) = connect(&config).await? else {
                    return Ok(ExitCode::ConnectionFailed);
                };
                let code = match session.send_file(&target, &path).await {
                    Ok(size) => {
                        println!("Sent {} ({size} bytes) to {target}", path.display());
                        ExitCode::Success
                    }
                    Err(e) => {
                        eprintln!("Error: {e}");
                        ExitCode::from(&e)
                    }
                };
                finish_one_shot(&session, &mut events, &config.downloads.dir, code).await
            }
        }
    }
}

fn identity_command(config: &Config, action: IdentityAction) -> anyhow::Result<ExitCode> {
    match action {
        IdentityAction::Show { json } => {
            let identity = IdentityManager::init(&config.identity)?;
            let info = identity.info();
            if json {
                println!("{}", serde_json::to_string_pretty(&info)?);
            } else {
                println!("Agent ID:   {}", info.agent_id);
                println!("Public key: {}", info.public_key);
                println!("Created:    {}", info.created_at);
                println!("Stored at:  {}", info.path.display());
            }
            Ok(ExitCode::Success)
        }
        IdentityAction::Init { force } => {
            match IdentityManager::create(&config.identity, force) {
                Ok(identity) => {
                    println!("Created identity {}", identity.agent_id());
                    Ok(ExitCode::Success)
                }
                Err(e @ crate::identity::IdentityError::AlreadyExists(_)) => {
                    eprintln!("Error: {e}");
                    Ok(ExitCode::InvalidInput)
                }
                Err(e) => Err(e.into()),
            }
        }
    }
}

/// Returns `None` after reporting a connection failure.
async fn connect(
    config: &Config,
) -> anyhow::Result<Option<(AgentSession, mpsc::UnboundedReceiver<SessionEvent>)>> {
    let identity = IdentityManager::init(&config.identity)?;
    let addr = config.server_addr();
    match AgentSession::connect(&addr, identity.into_keypair(), config.session_settings()).await {
        Ok(pair) => Ok(Some(pair)),
        Err(e) => {
            eprintln!("Error: {e}");
            Ok(None)
        }
    }
}

/// How a one-shot command's round trip to the relay ended.
enum Barrier {
    Reached(Vec<AgentSummary>),
    Closed,
    TimedOut,
}

/// Request the agent list and handle every event that arrives before it.
///
/// Registration flushes the agent's mailbox ahead of any reply, so once the
/// list arrives everything the relay handed over has been shown and any
/// files saved under `downloads`.
async fn sync_with_relay(
    session: &AgentSession,
    events: &mut mpsc::UnboundedReceiver<SessionEvent>,
    downloads: &Path,
) -> anyhow::Result<Barrier> {
    session.request_agent_list()?;
    let me = session.agent_id().to_string();

    let waited = tokio::time::timeout(ONE_SHOT_REPLY_TIMEOUT, async {
        while let Some(event) = events.recv().await {
            match event {
                SessionEvent::AgentList(agents) => return Barrier::Reached(agents),
                SessionEvent::Disconnected => return Barrier::Closed,
                event => interactive::show_event(event, &me, downloads).await,
            }
        }
        Barrier::Closed
    })
    .await;
    Ok(waited.unwrap_or(Barrier::TimedOut))
}

/// Settle with the relay, then close. A failed settle only downgrades success.
async fn finish_one_shot(
    session: &AgentSession,
    events: &mut mpsc::UnboundedReceiver<SessionEvent>,
    downloads: &Path,
    code: ExitCode,
) -> anyhow::Result<ExitCode> {
    let barrier = sync_with_relay(session, events, downloads).await;
    session.close().await;

    let settled = match barrier {
        Ok(Barrier::Reached(_)) => return Ok(code),
        Ok(Barrier::Closed) | Err(_) => ExitCode::ConnectionFailed,
        Ok(Barrier::TimedOut) => ExitCode::Timeout,
    };
    eprintln!("Warning: relay did not answer before exit ({})", settled.name());
    Ok(if code == ExitCode::Success { settled } else { code })
}

async fn list_agents(config: &Config) -> anyhow::Result<ExitCode> {
    let Some((session, mut events)) = connect(config).await? else {
        return Ok(ExitCode::ConnectionFailed);
    };
    let barrier = sync_with_relay(&session, &mut events, &config.downloads.dir).await;
    session.close().await;

    match barrier? {
        Barrier::Reached(agents) => {
            println!("{}", render_agent_list(&agents, session.agent_id()));
            Ok(ExitCode::Success)
        }
        Barrier::Closed => {
            eprintln!("Error: relay closed the connection");
            Ok(ExitCode::ConnectionFailed)
        }
        Barrier::TimedOut => {
            eprintln!("Error: no agent list within {:?}", ONE_SHOT_REPLY_TIMEOUT);
            Ok(ExitCode::Timeout)
        }
    }
}

async fn run_interactive(config: &Config) -> anyhow::Result<ExitCode> {
    let Some((session, events)) = connect(config).await? else {
        return Ok(ExitCode::ConnectionFailed);
    };
    let session = Arc::new(session);
    interactive::run(Arc::clone(&session), events, config.downloads.dir.clone()).await?;

    if config.client.auto_reconnect {
        info!(
            "Session ended; automatic reconnection is not performed (configured delay {}s, {} attempts)",
            config.client.reconnect_delay_secs, config.client.max_reconnect_attempts
        );
    }
    Ok(ExitCode::Success)
}
