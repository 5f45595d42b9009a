//! # Scout Arena
//!
//! Orchestration engine for timed multi-agent competition matches.
//!
//! Teams connect over a persistent TCP session and each drive one agent of a shared
//! simulation. The match is played in rounds; every round is a sequence of synchronized steps
//! with a fixed deadline. One agent per round is the *Scout*: on top of playing, its team
//! receives graded side-tasks (speech transcription, object detection, text recognition), one at
//! a time, scored on correctness and latency.
//!
//! It provides:
//! - The match state machine ([`MatchController`](crate::controller::MatchController))
//! - Team connections with health-probe preemption ([`registry`])
//! - The side-task queue and its single-flight gate ([`task_queue`])
//! - The composite side-task score ([`scoring`])
//! - A newline-delimited JSON session layer ([`transport`], [`protocol`]) and an operator
//!   command listener ([`control`])
//!
//! The simulation itself and the per-task correctness metrics are plugged in through the
//! [`Environment`](crate::environment::Environment) and [`Scorer`](crate::scoring::Scorer)
//! traits.
//!
//! # Usage Example
//!
//! ```no_run
//! # use std::collections::HashMap;
//! # use scout_arena::environment::*;
//! # struct YourEnv;
//! # impl Environment for YourEnv {
//! #     fn reset(&mut self) -> anyhow::Result<Observations> { Ok(Observations::new()) }
//! #     fn step(&mut self, _: &HashMap<AgentId, Action>) -> anyhow::Result<Transition> {
//! #         Ok(Transition::default())
//! #     }
//! #     fn scout(&self) -> AgentId { agent_for_slot(0) }
//! #     fn render(&self) -> anyhow::Result<Frame> { Ok(vec![]) }
//! #     fn noop_action(&self) -> Action { 4 }
//! # }
//! use std::sync::Arc;
//! use scout_arena::prelude::*;
//!
//! fn main() -> anyhow::Result<()> {
//!     let config = Configuration::from_env().with_log(true);
//!     let scorer = |_: TaskType, _: usize, _: &serde_json::Value| -> anyhow::Result<f64> {
//!         Ok(1.0)
//!     };
//!     let controller =
//!         MatchController::with_file_artifacts(config.clone(), Box::new(YourEnv), Arc::new(scorer))?;
//!
//!     spawn_session_listener(config.bind(), controller.clone())?;
//!     spawn_control_listener(config.control_bind(), controller.clone())?;
//!
//!     controller.start();
//!     controller.wait();
//!     Ok(())
//! }
//! ```
#![warn(missing_docs)]

pub use anyhow;

pub mod artifacts;
pub mod assets;
pub mod configuration;
pub mod control;
pub mod controller;
pub mod environment;
pub mod error;
mod logger;
pub mod protocol;
pub mod registry;
pub mod results;
pub mod scoring;
pub mod task_queue;
pub mod transport;

/// Commonly used types and traits for quick access.
///
/// ```rust
/// use scout_arena::prelude::*;
/// ```
pub mod prelude {
    pub use crate::artifacts::{ArtifactSink, FileArtifactSink};
    pub use crate::configuration::Configuration;
    pub use crate::control::spawn_control_listener;
    pub use crate::controller::{MatchController, StartOutcome, StepOutcome};
    pub use crate::environment::{Action, AgentId, Environment, Observations, Transition};
    pub use crate::error::ArenaError;
    pub use crate::scoring::{Scorer, ScoringWeights};
    pub use crate::task_queue::TaskType;
    pub use crate::transport::spawn_session_listener;
}
