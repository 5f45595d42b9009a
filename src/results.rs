//! The match-results document.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::environment::{Action, AgentId};
use crate::protocol::TaskSubmission;

/// Everything recorded about a match. Rewritten to disk at the end of every round.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchResults {
    /// Team names, in slot order.
    pub teams: Vec<String>,
    /// Configured number of rounds.
    pub num_rounds: usize,
    /// Free-form label of the match.
    pub track: String,
    /// One record per round, played or not.
    pub rounds: Vec<RoundRecord>,
}

impl MatchResults {
    /// Empty results for `num_rounds` rounds.
    pub fn new(teams: Vec<String>, num_rounds: usize, track: String) -> MatchResults {
        MatchResults {
            teams,
            num_rounds,
            track,
            rounds: (0..num_rounds).map(RoundRecord::new).collect(),
        }
    }
}

/// Log of one round.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoundRecord {
    /// Round index.
    pub round: usize,
    /// Steps, in order.
    pub steps: Vec<StepRecord>,
    /// Evaluated Scout answers, in order.
    pub scout_results: Vec<ScoutResult>,
}

impl RoundRecord {
    /// Empty log for round `round`.
    pub fn new(round: usize) -> RoundRecord {
        RoundRecord {
            round,
            steps: vec![],
            scout_results: vec![],
        }
    }
}

/// Actions applied and rewards earned during one step.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    /// Action applied for each agent.
    pub actions: BTreeMap<AgentId, Action>,
    /// Reward earned by each agent.
    pub rewards: BTreeMap<AgentId, f64>,
}

/// An evaluated Scout answer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoutResult {
    /// The submission, as received.
    pub data: TaskSubmission,
    /// Its composite score.
    pub score: f64,
}
