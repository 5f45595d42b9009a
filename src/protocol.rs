//! Wire messages exchanged with the teams.
//!
//! Every message is one JSON object on its own line. The server only ever sends
//! [`ServerMessage`]s; everything a client sends is parsed into a [`ClientMessage`] at the
//! boundary, and anything outside that closed set is rejected with a [`ProtocolError`].

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::environment::Action;
use crate::error::ProtocolError;
use crate::task_queue::TaskType;

/// Messages sent by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServerMessage {
    /// Work to do: a simulation step, or a side-task for the Scout.
    Task(TaskMessage),
    /// The match is over.
    Done,
    /// Liveness probe, must be answered with `{"health": "ok"}`.
    Health,
    /// The server is closing the session.
    Close {
        /// Human readable reason.
        reason: String,
    },
}

/// Payload of a [`ServerMessage::Task`], discriminated by its `task` field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "task", rename_all = "lowercase")]
pub enum TaskMessage {
    /// Observation for the current simulation step.
    Rl {
        /// Step the observation belongs to; the answer must echo it.
        step: usize,
        /// Observation of the team's agent.
        observation: Value,
    },
    /// Speech transcription task.
    Asr(TaskPayload),
    /// Object detection task.
    Cv(TaskPayload),
    /// Text recognition task.
    Ocr(TaskPayload),
}

impl TaskMessage {
    /// Wraps a side-task payload with the matching discriminant.
    pub fn side_task(task_type: TaskType, payload: TaskPayload) -> TaskMessage {
        match task_type {
            TaskType::Asr => TaskMessage::Asr(payload),
            TaskType::Cv => TaskMessage::Cv(payload),
            TaskType::Ocr => TaskMessage::Ocr(payload),
        }
    }

    /// Type of the side-task, `None` for a simulation step.
    pub fn task_type(&self) -> Option<TaskType> {
        match self {
            TaskMessage::Rl { .. } => None,
            TaskMessage::Asr(_) => Some(TaskType::Asr),
            TaskMessage::Cv(_) => Some(TaskType::Cv),
            TaskMessage::Ocr(_) => Some(TaskType::Ocr),
        }
    }
}

/// Raw task data, either embedded or as a path relative to the data directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskPayload {
    /// Base64 encoded file content.
    B64(String),
    /// Path of the file, relative to the data directory.
    Path(String),
}

/// First line a client sends on a new session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hello {
    /// Team identity.
    pub team: String,
}

/// A side-task answer as submitted by the Scout. Stored verbatim in the match results.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSubmission {
    /// Type of task this answers.
    pub task: TaskType,
    /// The prediction, in the task type's own format.
    pub result: Value,
}

/// Messages sent by a client once its session is established.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    /// Answer to a [`ServerMessage::Health`] probe.
    Health,
    /// Action chosen for a simulation step.
    Action {
        /// Step the action was computed for.
        step: usize,
        /// The action itself.
        action: Action,
    },
    /// Answer to a side-task.
    TaskResult(TaskSubmission),
}

#[derive(Deserialize)]
struct RlResult {
    step: usize,
    action: Action,
}

impl ClientMessage {
    /// Parses and validates one client line.
    pub fn parse(line: &str) -> Result<ClientMessage, ProtocolError> {
        let value: Value = serde_json::from_str(line)?;
        let Value::Object(mut map) = value else {
            return Err(ProtocolError::NotAnObject);
        };

        if map.contains_key("health") {
            return Ok(ClientMessage::Health);
        }

        let task = match map.remove("task") {
            Some(Value::String(task)) => task,
            Some(other) => return Err(ProtocolError::UnknownTask(other.to_string())),
            None => return Err(ProtocolError::MissingField("task")),
        };
        let result = map
            .remove("result")
            .ok_or(ProtocolError::MissingField("result"))?;

        if task == "rl" {
            let RlResult { step, action } = serde_json::from_value(result)?;
            return Ok(ClientMessage::Action { step, action });
        }

        let task = task
            .parse::<TaskType>()
            .map_err(|_| ProtocolError::UnknownTask(task))?;
        Ok(ClientMessage::TaskResult(TaskSubmission { task, result }))
    }

    /// JSON form of the message, as a client would send it.
    pub fn to_value(&self) -> Value {
        match self {
            ClientMessage::Health => json!({ "health": "ok" }),
            ClientMessage::Action { step, action } => {
                json!({ "task": "rl", "result": { "step": step, "action": action } })
            }
            ClientMessage::TaskResult(submission) => {
                let mut map = Map::new();
                map.insert("task".into(), Value::String(submission.task.to_string()));
                map.insert("result".into(), submission.result.clone());
                Value::Object(map)
            }
        }
    }
}
