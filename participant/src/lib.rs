//! Client side of a scout-arena team session.
//!
//! Implement [`Participant`] and hand it to [`run`]: it connects, introduces the team, answers
//! health probes, and forwards observations and side-tasks to the participant until the match
//! is over. Side-tasks are solved on their own threads, so observations keep being answered
//! while the Scout works.
//!
//! ```no_run
//! use participant::{run, Participant, Reconnect};
//! use scout_arena::environment::Action;
//! use scout_arena::protocol::TaskPayload;
//! use scout_arena::task_queue::TaskType;
//! use serde_json::{json, Value};
//!
//! struct Idle;
//!
//! impl Participant for Idle {
//!     fn select_action(&self, _step: usize, _observation: &Value) -> Action {
//!         4
//!     }
//!
//!     fn solve(&self, _task: TaskType, _payload: &TaskPayload) -> anyhow::Result<Value> {
//!         Ok(json!(""))
//!     }
//! }
//!
//! fn main() -> anyhow::Result<()> {
//!     run("127.0.0.1:8000", "team-1", &Idle, Reconnect::default())
//! }
//! ```

use std::io::{BufRead, BufReader, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::Mutex;
use std::thread;
use std::time::Duration;

use anyhow::bail;
use serde_json::Value;
use tracing::{debug, info, warn};

use scout_arena::environment::Action;
use scout_arena::protocol::{
    ClientMessage, Hello, ServerMessage, TaskMessage, TaskPayload, TaskSubmission,
};
use scout_arena::task_queue::TaskType;

/// What a team plugs into the session.
///
/// [`solve`](Participant::solve) runs on a worker thread, concurrently with
/// [`select_action`](Participant::select_action).
pub trait Participant: Sync {
    /// Action of the team's agent for `step`.
    fn select_action(&self, step: usize, observation: &Value) -> Action;

    /// Answer to a side-task. Only called on the round's Scout.
    fn solve(&self, task: TaskType, payload: &TaskPayload) -> anyhow::Result<Value>;
}

/// Why a session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEnd {
    /// The match is over.
    Done,
    /// The server closed the session.
    Closed(String),
    /// The connection dropped.
    Disconnected,
}

/// Reconnection policy of [`run`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reconnect {
    /// Consecutive failed sessions tolerated.
    pub attempts: u32,
    /// Pause before reconnecting.
    pub delay: Duration,
}

impl Default for Reconnect {
    fn default() -> Self {
        Reconnect {
            attempts: 10,
            delay: Duration::from_millis(500),
        }
    }
}

fn send(writer: &Mutex<TcpStream>, value: &Value) -> anyhow::Result<()> {
    let mut writer = writer.lock().expect("poisoned");
    writeln!(writer, "{value}")?;
    writer.flush()?;
    Ok(())
}

/// Plays one session as `team`.
///
/// Returns once the session ends and every side-task it received has been answered.
pub fn run_session<P: Participant + ?Sized>(
    addr: impl ToSocketAddrs,
    team: &str,
    participant: &P,
) -> anyhow::Result<SessionEnd> {
    let stream = TcpStream::connect(addr)?;
    let writer = Mutex::new(stream.try_clone()?);
    let hello = Hello {
        team: team.to_string(),
    };
    send(&writer, &serde_json::to_value(&hello)?)?;

    thread::scope(|s| {
        for line in BufReader::new(stream).lines() {
            let Ok(line) = line else {
                return Ok(SessionEnd::Disconnected);
            };
            if line.trim().is_empty() {
                continue;
            }
            let message = match serde_json::from_str::<ServerMessage>(&line) {
                Ok(message) => message,
                Err(e) => {
                    warn!("unexpected line from the server: {e}");
                    continue;
                }
            };

            let reply = match message {
                ServerMessage::Health => ClientMessage::Health,
                ServerMessage::Done => return Ok(SessionEnd::Done),
                ServerMessage::Close { reason } => return Ok(SessionEnd::Closed(reason)),
                ServerMessage::Task(TaskMessage::Rl { step, observation }) => {
                    ClientMessage::Action {
                        step,
                        action: participant.select_action(step, &observation),
                    }
                }
                ServerMessage::Task(side_task) => {
                    let (task, payload) = match side_task {
                        TaskMessage::Asr(payload) => (TaskType::Asr, payload),
                        TaskMessage::Cv(payload) => (TaskType::Cv, payload),
                        TaskMessage::Ocr(payload) => (TaskType::Ocr, payload),
                        TaskMessage::Rl { .. } => continue,
                    };
                    debug!(%task, "side-task received");
                    let writer = &writer;
                    s.spawn(move || {
                        // an answer is always sent so the next task can follow
                        let result = participant.solve(task, &payload).unwrap_or_else(|e| {
                            warn!(%task, "could not solve: {e:#}");
                            Value::Null
                        });
                        let reply = ClientMessage::TaskResult(TaskSubmission { task, result });
                        if let Err(e) = send(writer, &reply.to_value()) {
                            warn!(%task, "could not send the answer: {e:#}");
                        }
                    });
                    continue;
                }
            };
            send(&writer, &reply.to_value())?;
        }
        Ok(SessionEnd::Disconnected)
    })
}

/// Plays sessions as `team` until the match is over, reconnecting when a session drops.
///
/// # Errors
/// When the server closes the session (unknown team, or another connection holds the team),
/// or after `reconnect.attempts` consecutive failed sessions.
pub fn run<P: Participant + ?Sized>(
    addr: impl ToSocketAddrs + Copy,
    team: &str,
    participant: &P,
    reconnect: Reconnect,
) -> anyhow::Result<()> {
    let mut failures = 0;
    loop {
        match run_session(addr, team, participant) {
            Ok(SessionEnd::Done) => {
                info!(team, "match over");
                return Ok(());
            }
            Ok(SessionEnd::Closed(reason)) => bail!("session closed by the server: {reason}"),
            Ok(SessionEnd::Disconnected) => info!(team, "disconnected"),
            Err(e) => warn!(team, "session failed: {e:#}"),
        }
        failures += 1;
        if failures > reconnect.attempts {
            bail!("gave up after {failures} failed sessions");
        }
        thread::sleep(reconnect.delay);
    }
}
