//! Operator commands over TCP.
//!
//! One command per line, one reply line per command:
//!
//! | command        | reply                                               |
//! |----------------|-----------------------------------------------------|
//! | `health`       | `OK`                                                |
//! | `start`        | `started`, `already running` or `finished`          |
//! | `stop`         | `stopping` or `not running`                         |
//! | `step [n]`     | `stepped n`, after playing up to `n` steps          |
//! | `status`       | [`MatchStatus`](crate::controller::MatchStatus) as JSON |
//! | `results`      | [`MatchResults`](crate::results::MatchResults) as JSON  |
//! | `asset <path>` | base64 content of a file below the data directory   |
//!
//! Failures are reported as `error: <message>`.

use std::io::{self, BufRead, BufReader, Write};
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::thread::{self, JoinHandle};

use tracing::{debug, error, info, warn};

use crate::controller::{MatchController, StartOutcome, StepOutcome};

/// A parsed operator command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlCommand {
    /// Launch the step loop.
    Start,
    /// Stop the step loop at the next step boundary.
    Stop,
    /// Play this many steps by hand.
    Step(u32),
    /// Liveness check.
    Health,
    /// Match snapshot.
    Status,
    /// Results recorded so far.
    Results,
    /// Fetch a task sample by its path.
    Asset(String),
}

/// Parses one command line. `None` for anything unrecognized.
pub fn parse_command(input: &str) -> Option<ControlCommand> {
    let mut parts = input.split_whitespace();
    let command = match parts.next()? {
        "start" => ControlCommand::Start,
        "stop" => ControlCommand::Stop,
        "step" => {
            let amount = parts.next().unwrap_or("1").parse().ok()?;
            ControlCommand::Step(amount)
        }
        "health" => ControlCommand::Health,
        "status" => ControlCommand::Status,
        "results" => ControlCommand::Results,
        "asset" => ControlCommand::Asset(parts.next()?.to_string()),
        _ => return None,
    };
    // trailing garbage
    if parts.next().is_some() {
        return None;
    }
    Some(command)
}

/// Runs `command` and returns its reply line.
pub fn execute(controller: &MatchController, command: &ControlCommand) -> String {
    match command {
        ControlCommand::Health => "OK".to_string(),
        ControlCommand::Start => match controller.start() {
            StartOutcome::Started => "started",
            StartOutcome::AlreadyRunning => "already running",
            StartOutcome::Finished => "finished",
        }
        .to_string(),
        ControlCommand::Stop => {
            if controller.stop() {
                "stopping".to_string()
            } else {
                "not running".to_string()
            }
        }
        ControlCommand::Step(amount) => {
            let mut played = 0;
            for _ in 0..*amount {
                match controller.step() {
                    Ok(StepOutcome::AlreadyFinished) => break,
                    Ok(StepOutcome::MatchFinished) => {
                        played += 1;
                        break;
                    }
                    Ok(_) => played += 1,
                    Err(e) => return format!("error: {e:#}"),
                }
            }
            format!("stepped {played}")
        }
        ControlCommand::Status => to_json(&controller.status()),
        ControlCommand::Results => to_json(&controller.results()),
        ControlCommand::Asset(path) => match controller.assets().read_b64(path) {
            Ok(data) => data,
            Err(e) => format!("error: {e:#}"),
        },
    }
}

fn to_json<T: serde::Serialize>(value: &T) -> String {
    serde_json::to_string(value).unwrap_or_else(|e| format!("error: {e}"))
}

fn handle_client(stream: TcpStream, controller: &MatchController) -> io::Result<()> {
    let mut writer = stream.try_clone()?;
    let mut reader = BufReader::new(stream);
    let mut line = String::new();
    loop {
        line.clear();
        if reader.read_line(&mut line)? == 0 {
            return Ok(());
        }
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let reply = match parse_command(trimmed) {
            Some(command) => {
                debug!(?command);
                execute(controller, &command)
            }
            None => {
                warn!("Invalid command: {trimmed}");
                format!("error: unknown command '{trimmed}'")
            }
        };
        writeln!(writer, "{reply}")?;
    }
}

/// Binds `addr` and serves operator commands from a background thread.
pub fn spawn_control_listener(
    addr: impl ToSocketAddrs,
    controller: MatchController,
) -> io::Result<(SocketAddr, JoinHandle<()>)> {
    let listener = TcpListener::bind(addr)?;
    let local = listener.local_addr()?;
    info!(%local, "listening for control commands");
    let handle = thread::spawn(move || {
        for stream in listener.incoming() {
            match stream {
                Ok(stream) => {
                    let controller = controller.clone();
                    thread::spawn(move || {
                        if let Err(e) = handle_client(stream, &controller) {
                            warn!("control client error: {e}");
                        }
                    });
                }
                Err(e) => error!("Error accepting control client: {e}"),
            }
        }
    });
    Ok((local, handle))
}
