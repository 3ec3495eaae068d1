//! Line commands read from stdin, the agent's minimal conductor surface.
//!
//! ```text
//! start            request the synchronized start (conductor)
//! capture          trigger a capture (conductor)
//! select <id>      designate the aux-light device (conductor)
//! select none      clear the designation
//! status           print role, device count, state and (conductor)
//!                  the aux-capable device ids
//! ```

use std::sync::Arc;

use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::agent::DeviceAgent;
use crate::source::CaptureSource;
use crate::upload::Uploader;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Start,
    Capture,
    Select(Option<String>),
    Status,
}

pub fn parse_command(line: &str) -> Option<Command> {
    let mut words = line.split_whitespace();
    let cmd = match (words.next()?, words.next()) {
        ("start", None) => Command::Start,
        ("capture", None) => Command::Capture,
        ("status", None) => Command::Status,
        ("select", Some("none")) => Command::Select(None),
        ("select", Some(id)) => Command::Select(Some(id.to_string())),
        _ => return None,
    };
    if words.next().is_some() {
        return None;
    }
    Some(cmd)
}

/// Execute commands from `input` until EOF or `shutdown`.
pub async fn run<S, U, R>(agent: Arc<DeviceAgent<S, U>>, input: R, shutdown: CancellationToken)
where
    S: CaptureSource,
    U: Uploader,
    R: AsyncBufRead + Unpin,
{
    let mut lines = input.lines();
    loop {
        let line = tokio::select! {
            _ = shutdown.cancelled() => break,
            line = lines.next_line() => match line {
                Ok(Some(line)) => line,
                Ok(None) | Err(_) => break,
            },
        };
        if line.trim().is_empty() {
            continue;
        }
        let Some(cmd) = parse_command(&line) else {
            warn!("Unknown command: {}", line.trim());
            continue;
        };
        let sent = match cmd {
            Command::Start => agent.request_start(),
            Command::Capture => agent.trigger_capture(),
            Command::Select(target) => agent.select_aux(target),
            Command::Status => {
                info!("{}", agent.session().summary(&agent.status()));
                continue;
            }
        };
        if !sent {
            warn!("Command not sent (not the conductor, or already started)");
        }
    }
}
