//! Line commands on stdin: BACKUP, RESTORE, DELETE, RECLAIM, STATE, QUIT.

use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, BufReader};

use crate::peer::Peer;
use crate::restorer::RestoreOutcome;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Backup { path: String, degree: u8 },
    Restore { path: String },
    Delete { path: String },
    Reclaim { max_space: u64 },
    State,
    Quit,
}

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum ParseCommandError {
    #[error("empty command")]
    Empty,
    #[error("unknown command {0:?}")]
    Unknown(String),
    #[error("usage: {0}")]
    Usage(&'static str),
}

/// Parse one console line. Keywords are case-insensitive; paths may contain spaces.
pub fn parse_command(line: &str) -> Result<Command, ParseCommandError> {
    let line = line.trim();
    let (word, rest) = match line.split_once(char::is_whitespace) {
        Some((w, r)) => (w, r.trim()),
        None => (line, ""),
    };
    match word.to_ascii_uppercase().as_str() {
        "" => Err(ParseCommandError::Empty),
        "BACKUP" => {
            const USAGE: &str = "BACKUP <path> <degree>";
            let (path, degree) = rest
                .rsplit_once(char::is_whitespace)
                .ok_or(ParseCommandError::Usage(USAGE))?;
            let degree = degree.parse().map_err(|_| ParseCommandError::Usage(USAGE))?;
            let path = path.trim();
            if path.is_empty() {
                return Err(ParseCommandError::Usage(USAGE));
            }
            Ok(Command::Backup {
                path: path.to_owned(),
                degree,
            })
        }
        "RESTORE" => path_arg(rest, "RESTORE <path>").map(|path| Command::Restore { path }),
        "DELETE" => path_arg(rest, "DELETE <path>").map(|path| Command::Delete { path }),
        "RECLAIM" => rest
            .parse()
            .map(|max_space| Command::Reclaim { max_space })
            .map_err(|_| ParseCommandError::Usage("RECLAIM <max bytes>")),
        "STATE" => Ok(Command::State),
        "QUIT" | "EXIT" => Ok(Command::Quit),
        _ => Err(ParseCommandError::Unknown(word.to_owned())),
    }
}

fn path_arg(rest: &str, usage: &'static str) -> Result<String, ParseCommandError> {
    if rest.is_empty() {
        Err(ParseCommandError::Usage(usage))
    } else {
        Ok(rest.to_owned())
    }
}

/// Run a command and describe its result in one or more lines.
pub async fn execute(peer: &Arc<Peer>, cmd: Command) -> String {
    match cmd {
        Command::Backup { path, degree } => match peer.backup(&path, degree).await {
            Ok(r) if r.is_success() => format!("BACKUP {}: ok, {} chunk(s), file id {}", path, r.chunk_count, r.file_id),
            Ok(r) => format!(
                "BACKUP {}: failed, chunks {:?} below degree {}",
                path, r.failed, degree
            ),
            Err(e) => format!("BACKUP {}: {}", path, e),
        },
        Command::Restore { path } => match peer.restore(&path).await {
            Ok(RestoreOutcome::Restored { bytes }) => format!("RESTORE {}: ok, {} bytes", path, bytes),
            Ok(RestoreOutcome::Failed { missing }) => {
                format!("RESTORE {}: failed, missing chunks {:?}", path, missing)
            }
            Ok(RestoreOutcome::WriteFailed) => format!("RESTORE {}: cannot write restored file", path),
            Err(e) => format!("RESTORE {}: {}", path, e),
        },
        Command::Delete { path } => match peer.delete(&path).await {
            Ok(file_id) => format!("DELETE {}: ok, file id {}", path, file_id),
            Err(e) => format!("DELETE {}: {}", path, e),
        },
        Command::Reclaim { max_space } => {
            let r = peer.reclaim(max_space).await;
            format!(
                "RECLAIM {}: {} chunk(s) evicted, {} bytes used",
                r.capacity,
                r.evicted.len(),
                r.used
            )
        }
        Command::State => peer.state(),
        Command::Quit => "bye".to_owned(),
    }
}

/// Serve stdin until QUIT. Commands run concurrently; each prints its result
/// when done. If stdin closes the console goes quiet but never returns.
pub async fn run(peer: Arc<Peer>) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                tracing::warn!(error = %e, "cannot read console input");
                break;
            }
        };
        let cmd = match parse_command(&line) {
            Ok(cmd) => cmd,
            Err(ParseCommandError::Empty) => continue,
            Err(e) => {
                println!("{}", e);
                continue;
            }
        };
        if cmd == Command::Quit {
            return;
        }
        let peer = peer.clone();
        tokio::spawn(async move {
            println!("{}", execute(&peer, cmd).await);
        });
    }
    tracing::info!("console input closed");
    std::future::pending::<()>().await
}
