//! Config for the match behaviors
//!
//! This module provides configuration options for controlling the behavior of a match.
//!
//! Configuration can be created programmatically using [`Configuration::new()`] or by reading
//! environment variables using [`Configuration::from_env()`].
//!
//! # Environment Variables
//!
//! The following environment variables can be used to override configuration values. All
//! values are optional. Boolean flags are case-insensitive, set them to `"true"` to enable.
//!
//! - `ARENA_TEAMS`: Comma separated team names (default: `team-1,team-2,team-3,team-4`)
//! - `ARENA_TRACK`: Label stored in the match results (default: `default`)
//! - `ARENA_NUM_ROUNDS`: Number of rounds in the match (default: `4`)
//! - `ARENA_STEP_DEADLINE_MS`: Time given to the teams to act, per step (default: `2000`)
//! - `ARENA_TASKS_PER_MISSION`: Side-tasks queued per mission trigger (default: `5`)
//! - `ARENA_TASK_POOL_SIZE`: Number of samples per task type (default: `50`)
//! - `ARENA_SHUFFLE_TASKS`: Shuffle the task pools (default: `false`)
//! - `ARENA_SEED`: Seed of the task draws (default: random)
//! - `ARENA_PROBE_TIMEOUT_MS`: Time an existing connection has to answer a health probe when
//!   the same team connects again (default: `1000`)
//! - `ARENA_DATA_DIR`: Directory holding the task samples (default: `data`)
//! - `ARENA_ARTIFACTS_DIR`: Directory receiving match results and logs (default: `artifacts`)
//! - `ARENA_EMBED_PAYLOADS`: Send task samples as base64 rather than paths (default: `true`)
//! - `ARENA_LOG`: Enable logging to a file (default: `false`)
//! - `ARENA_BIND`: Address of the team session listener (default: `127.0.0.1:8000`)
//! - `ARENA_CONTROL_BIND`: Address of the control listener (default: `127.0.0.1:8001`)

use std::collections::HashSet;
use std::env;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, ensure};

use crate::scoring::ScoringWeights;

/// Default number of rounds.
pub const NUM_ROUNDS: usize = 4;
/// Default per-step deadline.
pub const STEP_DEADLINE: Duration = Duration::from_secs(2);
/// Default number of side-tasks queued per mission trigger.
pub const TASKS_PER_MISSION: usize = 5;
/// Default number of samples per task type.
pub const TASK_POOL_SIZE: usize = 50;
/// Default health-probe timeout.
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(1);

/// Configuration for match behaviors.
#[derive(Debug, Clone, PartialEq)]
pub struct Configuration {
    pub(crate) teams: Vec<String>,
    pub(crate) track: String,
    pub(crate) num_rounds: usize,
    pub(crate) step_deadline: Duration,
    pub(crate) tasks_per_mission: usize,
    pub(crate) task_pool_size: usize,
    pub(crate) shuffle_tasks: bool,
    pub(crate) seed: Option<u64>,
    pub(crate) probe_timeout: Duration,
    pub(crate) data_dir: PathBuf,
    pub(crate) artifacts_dir: PathBuf,
    pub(crate) embed_payloads: bool,
    pub(crate) log: bool,
    pub(crate) bind: SocketAddr,
    pub(crate) control_bind: SocketAddr,
    pub(crate) scoring: ScoringWeights,
}

impl Configuration {
    /// Create a new configuration with default parameters.
    ///
    /// By default:
    /// - Four teams, `team-1` to `team-4`, drive agents `player_0` to `player_3`.
    /// - A match has 4 rounds, and teams get 2 seconds to act at every step.
    /// - Each mission trigger queues 5 side-tasks, drawn from pools of 50 samples per type,
    ///   in order.
    /// - A reconnecting team preempts its previous connection if it fails to answer a health
    ///   probe within 1 second.
    /// - Task samples are embedded in base64.
    /// - Logging to file is disabled.
    pub fn new() -> Self {
        Self {
            teams: (1..=4).map(|i| format!("team-{i}")).collect(),
            track: "default".to_string(),
            num_rounds: NUM_ROUNDS,
            step_deadline: STEP_DEADLINE,
            tasks_per_mission: TASKS_PER_MISSION,
            task_pool_size: TASK_POOL_SIZE,
            shuffle_tasks: false,
            seed: None,
            probe_timeout: PROBE_TIMEOUT,
            data_dir: PathBuf::from("data"),
            artifacts_dir: PathBuf::from("artifacts"),
            embed_payloads: true,
            log: false,
            bind: SocketAddr::from(([127, 0, 0, 1], 8000)),
            control_bind: SocketAddr::from(([127, 0, 0, 1], 8001)),
            scoring: ScoringWeights::default(),
        }
    }

    /// Create configuration from environment variables.
    ///
    /// See the [module documentation](self) for the recognized variables. Unset or unparsable
    /// values fall back to the defaults of [`Configuration::new()`].
    pub fn from_env() -> Self {
        fn get_env_flag(var: &str, default: bool) -> bool {
            match env::var(var) {
                Ok(val) => val.eq_ignore_ascii_case("true"),
                Err(_) => default,
            }
        }

        fn parse<T: std::str::FromStr>(var: &str) -> Option<T> {
            env::var(var).ok()?.trim().parse().ok()
        }

        fn parse_millis(var: &str) -> Option<Duration> {
            parse::<u64>(var).map(Duration::from_millis)
        }

        let defaults = Self::new();
        let teams = env::var("ARENA_TEAMS")
            .ok()
            .map(|list| {
                list.split(',')
                    .map(str::trim)
                    .filter(|name| !name.is_empty())
                    .map(str::to_string)
                    .collect::<Vec<_>>()
            })
            .unwrap_or(defaults.teams);

        Self {
            teams,
            track: env::var("ARENA_TRACK").unwrap_or(defaults.track),
            num_rounds: parse("ARENA_NUM_ROUNDS").unwrap_or(defaults.num_rounds),
            step_deadline: parse_millis("ARENA_STEP_DEADLINE_MS")
                .unwrap_or(defaults.step_deadline),
            tasks_per_mission: parse("ARENA_TASKS_PER_MISSION")
                .unwrap_or(defaults.tasks_per_mission),
            task_pool_size: parse("ARENA_TASK_POOL_SIZE").unwrap_or(defaults.task_pool_size),
            shuffle_tasks: get_env_flag("ARENA_SHUFFLE_TASKS", defaults.shuffle_tasks),
            seed: parse("ARENA_SEED"),
            probe_timeout: parse_millis("ARENA_PROBE_TIMEOUT_MS")
                .unwrap_or(defaults.probe_timeout),
            data_dir: env::var_os("ARENA_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            artifacts_dir: env::var_os("ARENA_ARTIFACTS_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.artifacts_dir),
            embed_payloads: get_env_flag("ARENA_EMBED_PAYLOADS", defaults.embed_payloads),
            log: get_env_flag("ARENA_LOG", defaults.log),
            bind: parse("ARENA_BIND").unwrap_or(defaults.bind),
            control_bind: parse("ARENA_CONTROL_BIND").unwrap_or(defaults.control_bind),
            scoring: defaults.scoring,
        }
    }

    /// Checks that the configuration describes a playable match.
    ///
    /// # Errors
    /// Returned when there is no team, a team appears twice, there is no round, the step
    /// deadline or probe timeout is zero, or the scoring weights are invalid.
    pub fn validate(&self) -> anyhow::Result<()> {
        ensure!(!self.teams.is_empty(), "a match needs at least one team");
        let mut seen = HashSet::new();
        for team in &self.teams {
            if !seen.insert(team) {
                bail!("team '{team}' is listed twice");
            }
        }
        ensure!(self.num_rounds > 0, "a match needs at least one round");
        ensure!(!self.step_deadline.is_zero(), "step deadline must be positive");
        ensure!(!self.probe_timeout.is_zero(), "probe timeout must be positive");
        ensure!(
            self.scoring.performance >= 0.0 && self.scoring.speed >= 0.0,
            "scoring weights must be non-negative"
        );
        ensure!(
            !self.scoring.time_budget.is_zero(),
            "scoring time budget must be positive"
        );
        Ok(())
    }

    /// Set the participating teams. Team `i` drives agent `player_i`.
    pub fn with_teams<S: Into<String>>(mut self, teams: impl IntoIterator<Item = S>) -> Self {
        self.teams = teams.into_iter().map(Into::into).collect();
        self
    }

    /// Set the label stored in the match results.
    pub fn with_track(mut self, track: impl Into<String>) -> Self {
        self.track = track.into();
        self
    }

    /// Set the number of rounds.
    pub fn with_num_rounds(mut self, value: usize) -> Self {
        self.num_rounds = value;
        self
    }

    /// Set the time given to the teams to act, measured from the start of each step.
    pub fn with_step_deadline(mut self, value: Duration) -> Self {
        self.step_deadline = value;
        self
    }

    /// Set the number of side-tasks queued per mission trigger.
    pub fn with_tasks_per_mission(mut self, value: usize) -> Self {
        self.tasks_per_mission = value;
        self
    }

    /// Set the number of samples per task type.
    pub fn with_task_pool_size(mut self, value: usize) -> Self {
        self.task_pool_size = value;
        self
    }

    /// Enable or disable shuffling of the task pools.
    pub fn with_shuffle_tasks(mut self, value: bool) -> Self {
        self.shuffle_tasks = value;
        self
    }

    /// Seed the task draws, for reproducible matches.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Set how long an existing connection has to answer a health probe before a new
    /// connection of the same team replaces it.
    pub fn with_probe_timeout(mut self, value: Duration) -> Self {
        self.probe_timeout = value;
        self
    }

    /// Set the directory holding the task samples.
    pub fn with_data_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.data_dir = dir.as_ref().to_path_buf();
        self
    }

    /// Set the directory receiving match results, round artifacts and log files.
    pub fn with_artifacts_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.artifacts_dir = dir.as_ref().to_path_buf();
        self
    }

    /// Enable or disable base64 embedding of task samples. When disabled, the Scout receives
    /// paths relative to the data directory instead.
    pub fn with_embed_payloads(mut self, value: bool) -> Self {
        self.embed_payloads = value;
        self
    }

    /// Enable or disable logging to file.
    pub fn with_log(mut self, value: bool) -> Self {
        self.log = value;
        self
    }

    /// Set the address of the team session listener.
    pub fn with_bind(mut self, addr: SocketAddr) -> Self {
        self.bind = addr;
        self
    }

    /// Set the address of the control listener.
    pub fn with_control_bind(mut self, addr: SocketAddr) -> Self {
        self.control_bind = addr;
        self
    }

    /// Set the weights of the side-task score.
    pub fn with_scoring(mut self, weights: ScoringWeights) -> Self {
        self.scoring = weights;
        self
    }

    /// Participating teams, in slot order.
    pub fn teams(&self) -> &[String] {
        &self.teams
    }

    /// Number of rounds.
    pub fn num_rounds(&self) -> usize {
        self.num_rounds
    }

    /// Address of the team session listener.
    pub fn bind(&self) -> SocketAddr {
        self.bind
    }

    /// Address of the control listener.
    pub fn control_bind(&self) -> SocketAddr {
        self.control_bind
    }
}

impl Default for Configuration {
    fn default() -> Self {
        Self::new()
    }
}
