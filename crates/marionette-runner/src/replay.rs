//! Packet logs replayed into an agent.
//!
//! One step per line: `recv <packet>`, `send <packet>` or `wait <ms>`.
//! Blank lines and lines starting with `#` are skipped.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::trace;

use crate::agent::{AgentError, PacketFeed};

#[derive(Debug, thiserror::Error)]
pub enum ReplayError {
    #[error("line {line}: unknown command '{command}'")]
    UnknownCommand { line: usize, command: String },
    #[error("line {line}: '{command}' needs a packet")]
    MissingPacket { line: usize, command: &'static str },
    #[error("line {line}: invalid wait '{value}'")]
    InvalidWait { line: usize, value: String },
    #[error("{path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplayStep {
    Recv(String),
    Send(String),
    Wait(Duration),
}

pub fn parse(text: &str) -> Result<Vec<ReplayStep>, ReplayError> {
    let mut steps = Vec::new();
    for (i, line) in text.lines().enumerate() {
        let line_no = i + 1;
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let (command, rest) = line.split_once(char::is_whitespace).unwrap_or((line, ""));
        let rest = rest.trim();
        let step = match command {
            "recv" | "send" if rest.is_empty() => {
                return Err(ReplayError::MissingPacket {
                    line: line_no,
                    command: if command == "recv" { "recv" } else { "send" },
                })
            }
            "recv" => ReplayStep::Recv(rest.to_string()),
            "send" => ReplayStep::Send(rest.to_string()),
            "wait" => {
                let millis = rest.parse::<u64>().map_err(|_| ReplayError::InvalidWait {
                    line: line_no,
                    value: rest.to_string(),
                })?;
                ReplayStep::Wait(Duration::from_millis(millis))
            }
            other => {
                return Err(ReplayError::UnknownCommand {
                    line: line_no,
                    command: other.to_string(),
                })
            }
        };
        steps.push(step);
    }
    Ok(steps)
}

pub fn load(path: &Path) -> Result<Vec<ReplayStep>, ReplayError> {
    let text = std::fs::read_to_string(path).map_err(|source| ReplayError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    parse(&text)
}

/// Push every step into `feed`, sleeping on waits
pub async fn play(steps: &[ReplayStep], feed: &PacketFeed) -> Result<(), AgentError> {
    for step in steps {
        trace!(target: "runner", "Replay step {:?}", step);
        match step {
            ReplayStep::Recv(packet) => feed.recv(packet.as_str())?,
            ReplayStep::Send(packet) => feed.send(packet.as_str())?,
            ReplayStep::Wait(duration) => tokio::time::sleep(*duration).await,
        }
    }
    Ok(())
}
