//! Line-oriented operator console.
//!
//! Each input line parses into a `ConsoleCommand`, which maps onto exactly
//! one registry, gateway or clock operation. Every command produces a
//! single reply line.

use std::borrow::Cow;
use std::fmt;
use std::sync::Arc;

use anyhow::Result;
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::broadcast;

use loraptor_core::wire::{parse_address, WireError};
use loraptor_core::{Clock, MessageRecord, NodeAddress, SystemClock};
use loraptor_services::{ConnectionRegistry, RegistryError};

const USAGE: &str = "commands: create connection <id> <key> [addr,addr,...] | delete connection <id> | \
create recipient <id> <addr> | delete recipient <id> <addr> | send <id> <message> | flush <id> | \
list connections | list nodes | get nodeid | get clock | set clock <epoch> | ping | help";

// ── Parsing ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleCommand {
    CreateConnection {
        id: String,
        key: String,
        recipients: Vec<NodeAddress>,
    },
    DeleteConnection { id: String },
    CreateRecipient { id: String, addr: NodeAddress },
    DeleteRecipient { id: String, addr: NodeAddress },
    Send { id: String, message: String },
    Flush { id: String },
    ListConnections,
    ListNodes,
    GetNodeId,
    GetClock,
    SetClock(u32),
    Ping,
    Help,
}

#[derive(Debug, thiserror::Error)]
pub enum ConsoleError {
    #[error("empty command")]
    Empty,

    #[error("unknown command: {0:?}")]
    UnknownCommand(String),

    #[error("missing argument <{0}>")]
    MissingArgument(&'static str),

    #[error(transparent)]
    InvalidAddress(#[from] WireError),

    #[error("invalid epoch: {0:?}")]
    InvalidEpoch(String),
}

/// Split off the next whitespace-delimited word.
fn next_word<'a>(rest: &mut &'a str) -> Option<&'a str> {
    let trimmed = rest.trim_start();
    if trimmed.is_empty() {
        *rest = trimmed;
        return None;
    }
    let end = trimmed.find(char::is_whitespace).unwrap_or(trimmed.len());
    let (word, tail) = trimmed.split_at(end);
    *rest = tail;
    Some(word)
}

fn required<'a>(rest: &mut &'a str, name: &'static str) -> Result<&'a str, ConsoleError> {
    next_word(rest).ok_or(ConsoleError::MissingArgument(name))
}

fn parse_address_list(list: &str) -> Result<Vec<NodeAddress>, ConsoleError> {
    list.split(',')
        .filter(|s| !s.trim().is_empty())
        .map(|s| parse_address(s).map_err(ConsoleError::from))
        .collect()
}

impl std::str::FromStr for ConsoleCommand {
    type Err = ConsoleError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let mut rest = line.trim();
        let verb = next_word(&mut rest).ok_or(ConsoleError::Empty)?;

        let cmd = match verb.to_ascii_lowercase().as_str() {
            "create" | "delete" => {
                let create = verb.eq_ignore_ascii_case("create");
                let noun = required(&mut rest, "connection|recipient")?;
                match noun.to_ascii_lowercase().as_str() {
                    "connection" if create => {
                        let id = required(&mut rest, "id")?.to_string();
                        let key = required(&mut rest, "key")?.to_string();
                        let recipients = match next_word(&mut rest) {
                            Some(list) => parse_address_list(list)?,
                            None => Vec::new(),
                        };
                        Self::CreateConnection { id, key, recipients }
                    }
                    "connection" => Self::DeleteConnection {
                        id: required(&mut rest, "id")?.to_string(),
                    },
                    "recipient" => {
                        let id = required(&mut rest, "id")?.to_string();
                        let addr = parse_address(required(&mut rest, "addr")?)?;
                        if create {
                            Self::CreateRecipient { id, addr }
                        } else {
                            Self::DeleteRecipient { id, addr }
                        }
                    }
                    _ => return Err(ConsoleError::UnknownCommand(format!("{verb} {noun}"))),
                }
            }
            "send" => {
                let id = required(&mut rest, "id")?.to_string();
                let message = rest.trim();
                if message.is_empty() {
                    return Err(ConsoleError::MissingArgument("message"));
                }
                Self::Send {
                    id,
                    message: message.to_string(),
                }
            }
            "flush" => Self::Flush {
                id: required(&mut rest, "id")?.to_string(),
            },
            "list" => match required(&mut rest, "connections|nodes")?.to_ascii_lowercase().as_str() {
                "connections" => Self::ListConnections,
                "nodes" => Self::ListNodes,
                other => return Err(ConsoleError::UnknownCommand(format!("list {other}"))),
            },
            "get" => match required(&mut rest, "nodeid|clock")?.to_ascii_lowercase().as_str() {
                "nodeid" => Self::GetNodeId,
                "clock" => Self::GetClock,
                other => return Err(ConsoleError::UnknownCommand(format!("get {other}"))),
            },
            "set" => match required(&mut rest, "clock")?.to_ascii_lowercase().as_str() {
                "clock" => {
                    let raw = required(&mut rest, "epoch")?;
                    let epoch = raw
                        .parse()
                        .map_err(|_| ConsoleError::InvalidEpoch(raw.to_string()))?;
                    Self::SetClock(epoch)
                }
                other => return Err(ConsoleError::UnknownCommand(format!("set {other}"))),
            },
            "ping" => Self::Ping,
            "help" | "?" => Self::Help,
            _ => return Err(ConsoleError::UnknownCommand(verb.to_string())),
        };
        Ok(cmd)
    }
}

// ── Replies ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Ok(String),
    Json(serde_json::Value),
    Error(String),
}

impl fmt::Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reply::Ok(text) => write!(f, "ok: {text}"),
            Reply::Json(value) => write!(f, "{value}"),
            Reply::Error(text) => write!(f, "error: {text}"),
        }
    }
}

impl From<RegistryError> for Reply {
    fn from(e: RegistryError) -> Self {
        Reply::Error(e.to_string())
    }
}

/// Flushed message as shown to the operator.
#[derive(Serialize)]
struct InboxEntry<'a> {
    from: String,
    epoch: u32,
    hash: String,
    content: Cow<'a, str>,
}

fn inbox_entry(rec: &MessageRecord) -> InboxEntry<'_> {
    InboxEntry {
        from: format_address(rec.sender),
        epoch: rec.epoch,
        hash: rec.hash().to_string(),
        content: rec.text(),
    }
}

fn format_address(addr: NodeAddress) -> String {
    format!("0x{addr:04x}")
}

fn to_json<T: Serialize>(value: &T) -> Reply {
    match serde_json::to_value(value) {
        Ok(v) => Reply::Json(v),
        Err(e) => Reply::Error(format!("serialization failed: {e}")),
    }
}

// ── Console ───────────────────────────────────────────────────────────────────

pub struct Console {
    registry: Arc<ConnectionRegistry>,
    clock: Arc<SystemClock>,
}

impl Console {
    pub fn new(registry: Arc<ConnectionRegistry>, clock: Arc<SystemClock>) -> Self {
        Self { registry, clock }
    }

    /// Parse and run one input line. Blank lines produce no reply.
    pub fn handle_line(&self, line: &str) -> Option<Reply> {
        if line.trim().is_empty() {
            return None;
        }
        Some(match line.parse::<ConsoleCommand>() {
            Ok(cmd) => self.execute(cmd),
            Err(e) => Reply::Error(e.to_string()),
        })
    }

    pub fn execute(&self, cmd: ConsoleCommand) -> Reply {
        tracing::debug!(?cmd, "console command");
        let registry = &self.registry;
        match cmd {
            ConsoleCommand::CreateConnection { id, key, recipients } => {
                match registry.create_connection(&id, &key, &recipients) {
                    Ok(conn) => Reply::Ok(format!(
                        "connection {id} created with {} recipient(s)",
                        conn.recipients().len()
                    )),
                    Err(e) => e.into(),
                }
            }
            ConsoleCommand::DeleteConnection { id } => match registry.delete_connection(&id) {
                Ok(()) => Reply::Ok(format!("connection {id} deleted")),
                Err(e) => e.into(),
            },
            ConsoleCommand::CreateRecipient { id, addr } => match registry.add_recipient(&id, addr) {
                Ok(true) => Reply::Ok(format!("recipient {} added to {id}", format_address(addr))),
                Ok(false) => Reply::Ok(format!("recipient {} already in {id}", format_address(addr))),
                Err(e) => e.into(),
            },
            ConsoleCommand::DeleteRecipient { id, addr } => {
                match registry.remove_recipient(&id, addr) {
                    Ok(true) => Reply::Ok(format!("recipient {} removed from {id}", format_address(addr))),
                    Ok(false) => Reply::Ok(format!("recipient {} not in {id}", format_address(addr))),
                    Err(e) => e.into(),
                }
            }
            ConsoleCommand::Send { id, message } => match registry.send_message(&id, &message) {
                Ok(hash) => Reply::Ok(format!("queued {hash}")),
                Err(e) => e.into(),
            },
            ConsoleCommand::Flush { id } => match registry.flush_incoming(&id) {
                Ok(records) => {
                    let entries: Vec<InboxEntry<'_>> = records.iter().map(inbox_entry).collect();
                    to_json(&entries)
                }
                Err(e) => e.into(),
            },
            ConsoleCommand::ListConnections => to_json(&registry.connection_ids()),
            ConsoleCommand::ListNodes => {
                let nodes: Vec<String> = registry
                    .gateway()
                    .known_nodes()
                    .into_iter()
                    .map(format_address)
                    .collect();
                to_json(&nodes)
            }
            ConsoleCommand::GetNodeId => {
                let addr = registry.gateway().local_address();
                Reply::Ok(format!("{} ({addr})", format_address(addr)))
            }
            ConsoleCommand::GetClock => Reply::Ok(self.clock.epoch_secs().to_string()),
            ConsoleCommand::SetClock(epoch) => {
                self.clock.set_epoch(epoch);
                tracing::info!(epoch, "clock set");
                Reply::Ok(format!("clock set to {epoch}"))
            }
            ConsoleCommand::Ping => Reply::Ok("pong".to_string()),
            ConsoleCommand::Help => Reply::Ok(USAGE.to_string()),
        }
    }

    /// Serve stdin until EOF or shutdown.
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) -> Result<()> {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        let mut stdout = tokio::io::stdout();

        loop {
            let line = tokio::select! {
                _ = shutdown.recv() => break,
                line = lines.next_line() => line?,
            };
            let Some(line) = line else {
                tracing::debug!("console input closed");
                break;
            };
            if let Some(reply) = self.handle_line(&line) {
                stdout.write_all(format!("{reply}\n").as_bytes()).await?;
                stdout.flush().await?;
            }
        }
        Ok(())
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
