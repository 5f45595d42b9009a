//! Traits the simulation must implement to be driven by the [`MatchController`].
//!
//! The arena does not know anything about the simulation itself: it only resets it, feeds it
//! one action per agent every step, and reads back observations, rewards and episode flags.
//!
//! [`MatchController`]: crate::controller::MatchController

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Identifier of a simulation agent slot (`player_0`, `player_1`, ...).
pub type AgentId = String;

/// Discrete action submitted by a team for its agent.
pub type Action = u32;

/// Per-agent observations, forwarded verbatim to the teams.
pub type Observations = HashMap<AgentId, Value>;

/// One rendered frame of the simulation. Encoding is left to the environment.
pub type Frame = Vec<u8>;

/// Agent slot driven by the team at position `slot` in the configured team list.
pub fn agent_for_slot(slot: usize) -> AgentId {
    format!("player_{slot}")
}

/// Extra per-agent information returned by a transition.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepInfo {
    /// The environment requests more side-tasks for the Scout.
    pub add_mission: bool,
}

/// Everything a single environment transition produces.
#[derive(Debug, Clone, Default)]
pub struct Transition {
    /// Observations for the next step.
    pub observations: Observations,
    /// Reward earned by each agent during this step.
    pub rewards: HashMap<AgentId, f64>,
    /// Agents whose episode ended naturally.
    pub terminations: HashMap<AgentId, bool>,
    /// Agents whose episode was cut short.
    pub truncations: HashMap<AgentId, bool>,
    /// Extra information per agent.
    pub infos: HashMap<AgentId, StepInfo>,
}

impl Transition {
    /// True if any agent reports a mission condition.
    pub fn mission_requested(&self) -> bool {
        self.infos.values().any(|info| info.add_mission)
    }

    /// True if any agent is terminated or truncated, which ends the round.
    pub fn is_round_over(&self) -> bool {
        self.terminations.values().any(|&done| done) || self.truncations.values().any(|&done| done)
    }
}

/// What the simulation should implement.
pub trait Environment: Send {
    /// Starts a new episode and returns the initial observations.
    fn reset(&mut self) -> anyhow::Result<Observations>;

    /// Applies one action per agent and advances the simulation by one tick.
    ///
    /// Agents without a team (or whose team stayed silent) receive [`Environment::noop_action`].
    fn step(&mut self, actions: &HashMap<AgentId, Action>) -> anyhow::Result<Transition>;

    /// The agent designated as Scout for the current episode.
    fn scout(&self) -> AgentId;

    /// Renders the current state.
    fn render(&self) -> anyhow::Result<Frame>;

    /// Action applied for an agent whose team did not answer in time.
    fn noop_action(&self) -> Action;

    /// Whether `action` belongs to the action space. Invalid actions are discarded.
    fn is_valid_action(&self, _action: Action) -> bool {
        true
    }
}
