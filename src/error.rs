//! Error types shared by the arena components.
//!
//! Component entry points return `anyhow::Result`; the typed errors below are what ends up
//! inside when a caller needs to tell the cases apart (`err.downcast_ref::<ArenaError>()`).

use thiserror::Error;

use crate::task_queue::TaskType;

/// Violations of the match rules. None of them is fatal to the match itself: each one only
/// rejects the exchange that caused it.
#[derive(Debug, Error, PartialEq)]
pub enum ArenaError {
    /// The team identity is not part of this match.
    #[error("Invalid team {0}")]
    UnknownTeam(String),
    /// A healthy connection is already bound to this team.
    #[error("There is already a team connected with name {0}!")]
    AlreadyConnected(String),
    /// A task result was submitted while the task queue was empty.
    #[error("task result submitted while the task queue is empty")]
    EmptyQueue,
    /// A task result was submitted while no task had been dispatched.
    #[error("task result submitted while no task is in flight")]
    NoTaskInFlight,
    /// The submitted result does not answer the task currently in flight.
    #[error("expected a result for task type '{expected}', got '{actual}'")]
    TaskTypeMismatch {
        /// Type of the task at the head of the queue.
        expected: TaskType,
        /// Type declared by the submission.
        actual: TaskType,
    },
    /// Only the Scout of the current round may submit task results.
    #[error("team {team} is not the Scout of round {round}")]
    NotScout {
        /// Submitting team.
        team: String,
        /// Round during which the submission arrived.
        round: usize,
    },
    /// All rounds have been played.
    #[error("match is already finished")]
    MatchFinished,
}

/// A client line that does not belong to the closed set of client messages.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Not valid JSON, or a field of the wrong shape.
    #[error("malformed message: {0}")]
    Malformed(#[from] serde_json::Error),
    /// Valid JSON, but not an object.
    #[error("message is not a JSON object")]
    NotAnObject,
    /// The `task` discriminant names nothing we know.
    #[error("unknown task type {0:?}")]
    UnknownTask(String),
    /// A mandatory field is absent.
    #[error("message has no '{0}' field")]
    MissingField(&'static str),
}
