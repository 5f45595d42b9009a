//! The match state machine.
//!
//! A match is a sequence of rounds, each of them one episode of the [`Environment`]. A round is
//! played step by step: at every step the controller pushes each team the observation of its
//! agent, waits out the step deadline while actions come in, then feeds the collected actions to
//! the environment. Teams that stayed silent play the no-op action.
//!
//! When the environment asks for a mission, side-tasks are queued for the round's Scout and
//! handed to it one at a time (see [`TaskQueue`]). Only the Scout's team may answer them.
//!
//! Steps are driven either manually with [`MatchController::step`], or by a background loop
//! started with [`MatchController::start`] and stopped, at the next step boundary, by
//! [`MatchController::stop`]. A failing step stops the loop but keeps the match as it was, so
//! stepping can be resumed by hand.
//!
//! Locks are always taken in this order: step lock, environment, state. The environment lock is
//! never requested while the state lock is held.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Instant;

use anyhow::Context;
use serde::Serialize;
use time::OffsetDateTime;
use tracing::{debug, error, info, instrument, trace, warn};

use crate::artifacts::{ArtifactSink, FileArtifactSink};
use crate::assets::AssetStore;
use crate::configuration::Configuration;
use crate::environment::{agent_for_slot, Action, AgentId, Environment, Frame, Observations};
use crate::error::ArenaError;
use crate::logger::init_logger;
use crate::protocol::{ClientMessage, ServerMessage, TaskMessage, TaskSubmission};
use crate::registry::ConnectionRegistry;
use crate::results::{MatchResults, ScoutResult, StepRecord};
use crate::scoring::{Scorer, ScoringPipeline};
use crate::task_queue::{Completion, TaskQueue};

/// Result of [`MatchController::start`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    /// The step loop was launched.
    Started,
    /// The step loop was already running.
    AlreadyRunning,
    /// Every round has been played.
    Finished,
}

/// Result of [`MatchController::step`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// The round goes on.
    Advanced,
    /// The step ended the round.
    RoundFinished,
    /// The step ended the last round.
    MatchFinished,
    /// Nothing left to play.
    AlreadyFinished,
}

/// What happened to a submitted action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionOutcome {
    /// The action replaces the team's action for the current step.
    Accepted,
    /// The action was computed for another step.
    StaleStep,
    /// The step deadline has passed.
    WindowClosed,
    /// The action is outside the environment's action space.
    Invalid,
    /// The team is not part of the match.
    UnknownTeam,
}

/// Snapshot of the match, as reported by the control surface.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MatchStatus {
    /// Current round.
    pub round: usize,
    /// Current step within the round.
    pub step: usize,
    /// Configured number of rounds.
    pub num_rounds: usize,
    /// Every round has been played.
    pub finished: bool,
    /// The step loop is running.
    pub running: bool,
    /// The step loop will go on after the current step.
    pub auto_step: bool,
    /// Agent acting as Scout this round.
    pub scout: AgentId,
    /// Team driving the Scout, if any.
    pub scout_team: Option<String>,
    /// Teams with a live connection.
    pub connected_teams: Vec<String>,
    /// Side-tasks queued, the one in flight included.
    pub queued_tasks: usize,
    /// A side-task may be dispatched to the Scout.
    pub gate_open: bool,
}

#[derive(Debug)]
struct Team {
    name: String,
    agent: AgentId,
    last_action: Option<Action>,
}

#[derive(Debug)]
struct MatchState {
    round: usize,
    step: usize,
    finished: bool,
    teams: Vec<Team>,
    observations: Observations,
    scout: AgentId,
    actions: HashMap<AgentId, Action>,
    collecting: bool,
    frames: Vec<Frame>,
    results: MatchResults,
    /// The round has been persisted but the environment could not be reset for the next one.
    reset_pending: bool,
}

impl MatchState {
    fn team(&self, name: &str) -> Option<&Team> {
        self.teams.iter().find(|t| t.name == name)
    }

    fn scout_team(&self) -> Option<&Team> {
        self.teams.iter().find(|t| t.agent == self.scout)
    }
}

struct Inner {
    config: Configuration,
    registry: ConnectionRegistry,
    queue: TaskQueue,
    assets: AssetStore,
    env: Mutex<Box<dyn Environment>>,
    sink: Mutex<Box<dyn ArtifactSink>>,
    state: Mutex<MatchState>,
    step_lock: Mutex<()>,
    auto_step: AtomicBool,
    in_progress: AtomicBool,
    step_loop: Mutex<Option<JoinHandle<()>>>,
}

/// Drives a match. Cheap to clone: clones share the same match.
#[derive(Clone)]
pub struct MatchController {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for MatchController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MatchController")
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}

impl MatchController {
    /// Creates the controller of a new match and resets `env` for the first round.
    ///
    /// # Errors
    /// Returned if the configuration is invalid, the logger cannot be installed, or the
    /// environment fails to reset or render.
    #[instrument(skip_all)]
    pub fn new(
        config: Configuration,
        mut env: Box<dyn Environment>,
        scorer: Arc<dyn Scorer>,
        sink: Box<dyn ArtifactSink>,
    ) -> anyhow::Result<MatchController> {
        config.validate()?;
        if config.log {
            let path = init_logger(&config.artifacts_dir)?;
            info!(log_file = %path.display());
        }
        trace!(?config);

        let observations = env.reset().context("could not reset the environment")?;
        let scout = env.scout();
        let first_frame = env.render().context("could not render the environment")?;

        let teams = config
            .teams
            .iter()
            .enumerate()
            .map(|(slot, name)| Team {
                name: name.clone(),
                agent: agent_for_slot(slot),
                last_action: None,
            })
            .collect();
        let results = MatchResults::new(
            config.teams.clone(),
            config.num_rounds,
            config.track.clone(),
        );
        let state = MatchState {
            round: 0,
            step: 0,
            finished: false,
            teams,
            observations,
            scout,
            actions: HashMap::new(),
            collecting: false,
            frames: vec![first_frame],
            results,
            reset_pending: false,
        };

        let scoring = ScoringPipeline::new(scorer, config.scoring);
        let inner = Inner {
            registry: ConnectionRegistry::new(&config.teams, config.probe_timeout),
            queue: TaskQueue::from_config(&config, scoring),
            assets: AssetStore::new(&config.data_dir, config.embed_payloads),
            env: Mutex::new(env),
            sink: Mutex::new(sink),
            state: Mutex::new(state),
            step_lock: Mutex::new(()),
            auto_step: AtomicBool::new(false),
            in_progress: AtomicBool::new(false),
            step_loop: Mutex::new(None),
            config,
        };
        Ok(MatchController {
            inner: Arc::new(inner),
        })
    }

    /// Same as [`new`](Self::new), storing artifacts in a fresh directory below the
    /// configured artifacts directory.
    pub fn with_file_artifacts(
        config: Configuration,
        env: Box<dyn Environment>,
        scorer: Arc<dyn Scorer>,
    ) -> anyhow::Result<MatchController> {
        let started = OffsetDateTime::now_local().unwrap_or_else(|_| OffsetDateTime::now_utc());
        let sink = FileArtifactSink::create(&config.artifacts_dir, started)?;
        Self::new(config, env, scorer, Box::new(sink))
    }

    /// Registry of the team connections.
    pub fn registry(&self) -> &ConnectionRegistry {
        &self.inner.registry
    }

    /// Asset store serving the side-task samples.
    pub fn assets(&self) -> &AssetStore {
        &self.inner.assets
    }

    /// Launches the step loop in the background. Does nothing if it already runs or the match
    /// is over.
    #[instrument(skip(self))]
    pub fn start(&self) -> StartOutcome {
        if self.inner.lock_state().finished {
            return StartOutcome::Finished;
        }
        self.inner.auto_step.store(true, Ordering::SeqCst);
        if self.inner.in_progress.swap(true, Ordering::SeqCst) {
            return StartOutcome::AlreadyRunning;
        }
        info!("starting the step loop");
        let controller = self.clone();
        let handle = thread::spawn(move || controller.run_step_loop());
        *self.inner.step_loop.lock().expect("poisoned") = Some(handle);
        StartOutcome::Started
    }

    /// Asks the step loop to stop after the current step. Returns whether it was running.
    #[instrument(skip(self))]
    pub fn stop(&self) -> bool {
        let was_set = self.inner.auto_step.swap(false, Ordering::SeqCst);
        if was_set {
            info!("step loop will stop at the next step boundary");
        }
        was_set && self.inner.in_progress.load(Ordering::SeqCst)
    }

    /// Blocks until the step loop launched by [`start`](Self::start) exits.
    pub fn wait(&self) {
        let handle = self.inner.step_loop.lock().expect("poisoned").take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                error!("step loop panicked");
            }
        }
    }

    fn run_step_loop(&self) {
        loop {
            while self.inner.auto_step.load(Ordering::SeqCst) {
                match self.step() {
                    Ok(StepOutcome::MatchFinished | StepOutcome::AlreadyFinished) => break,
                    Ok(_) => {}
                    Err(e) => {
                        error!("step failed, stopping the step loop: {e:#}");
                        self.inner.auto_step.store(false, Ordering::SeqCst);
                    }
                }
            }
            self.inner.in_progress.store(false, Ordering::SeqCst);
            // a start() may have raced with the exit above
            if !self.inner.auto_step.load(Ordering::SeqCst)
                || self.inner.lock_state().finished
                || self.inner.in_progress.swap(true, Ordering::SeqCst)
            {
                break;
            }
        }
        debug!("step loop exited");
    }

    /// Plays one step.
    ///
    /// Does nothing once the match is over. Never runs concurrently with another step.
    ///
    /// # Errors
    /// Errors of the environment, or of the artifact sink when the step ends a round. In the
    /// latter case the round has been advanced all the same. When the environment cannot be
    /// reset for the next round, the next call only retries that reset.
    pub fn step(&self) -> anyhow::Result<StepOutcome> {
        let _step = self.inner.step_lock.lock().expect("poisoned");
        self.inner.step_once()
    }

    /// Records `action` as `team`'s action for `step`, if `step` is the current step and its
    /// deadline has not passed.
    pub fn submit_action(&self, team: &str, step: usize, action: Action) -> ActionOutcome {
        let valid = self.inner.lock_env().is_valid_action(action);

        let mut state = self.inner.lock_state();
        let Some(agent) = state.team(team).map(|t| t.agent.clone()) else {
            return ActionOutcome::UnknownTeam;
        };
        if !state.collecting {
            trace!(team, step, "action after the deadline");
            return ActionOutcome::WindowClosed;
        }
        if step != state.step {
            trace!(team, step, current = state.step, "stale action");
            return ActionOutcome::StaleStep;
        }
        if !valid {
            warn!(team, action, "invalid action");
            return ActionOutcome::Invalid;
        }
        state.actions.insert(agent, action);
        ActionOutcome::Accepted
    }

    /// Evaluates a side-task answer from `team`, records it, and hands the Scout its next task.
    ///
    /// # Errors
    /// [`ArenaError::NotScout`] if `team` does not drive the Scout, [`ArenaError::MatchFinished`]
    /// after the last round, and every error of [`TaskQueue::complete`].
    #[instrument(skip(self, submission), fields(task = %submission.task))]
    pub fn submit_task_result(
        &self,
        team: &str,
        submission: TaskSubmission,
    ) -> anyhow::Result<Completion> {
        let round = {
            let state = self.inner.lock_state();
            if state.finished {
                return Err(ArenaError::MatchFinished.into());
            }
            if state.scout_team().map(|t| t.name.as_str()) != Some(team) {
                return Err(ArenaError::NotScout {
                    team: team.to_string(),
                    round: state.round,
                }
                .into());
            }
            state.round
        };

        let completion = self.inner.queue.complete(&submission);
        if let Ok(completion) = &completion {
            info!(round, task = %completion.task, score = completion.score, "scout result");
            let mut state = self.inner.lock_state();
            // the round may have ended while the answer was being scored
            if let Some(record) = state.results.rounds.get_mut(round) {
                record.scout_results.push(ScoutResult {
                    data: submission,
                    score: completion.score,
                });
            }
        }
        // the gate reopens even when the answer is rejected
        self.inner.dispatch_to_scout();
        completion
    }

    /// Handles a message received on `team`'s session.
    pub fn handle_message(&self, team: &str, message: ClientMessage) {
        match message {
            ClientMessage::Health => {}
            ClientMessage::Action { step, action } => {
                let outcome = self.submit_action(team, step, action);
                trace!(team, step, action, ?outcome);
            }
            ClientMessage::TaskResult(submission) => {
                if let Err(e) = self.submit_task_result(team, submission) {
                    warn!(team, "task result rejected: {e:#}");
                }
            }
        }
    }

    /// Brings a freshly connected team up to date: tells it the match is over, or hands the
    /// Scout the task it is expected to work on.
    pub fn on_team_connected(&self, team: &str) {
        let (finished, is_scout) = {
            let state = self.inner.lock_state();
            let is_scout = state.scout_team().is_some_and(|t| t.name == team);
            (state.finished, is_scout)
        };
        if finished {
            if let Err(e) = self.inner.registry.send_to(team, &ServerMessage::Done) {
                debug!(team, "could not notify the end of the match: {e:#}");
            }
            return;
        }
        if !is_scout {
            return;
        }
        match self.inner.queue.in_flight() {
            Some(task) => match self.inner.assets.message(&task) {
                Ok(message) => {
                    if let Err(e) = self.inner.registry.send_to(team, &message) {
                        error!(team, %task, "could not resend task: {e:#}");
                    }
                }
                Err(e) => {
                    warn!(%task, "dropping undeliverable task: {e:#}");
                    self.inner.queue.discard_head();
                    self.inner.dispatch_to_scout();
                }
            },
            None => self.inner.dispatch_to_scout(),
        }
    }

    /// Current state of the match.
    pub fn status(&self) -> MatchStatus {
        let queued_tasks = self.inner.queue.len();
        let gate_open = self.inner.queue.gate_open();
        let connected_teams = self.inner.registry.connected_teams();
        let state = self.inner.lock_state();
        MatchStatus {
            round: state.round,
            step: state.step,
            num_rounds: self.inner.config.num_rounds,
            finished: state.finished,
            running: self.inner.in_progress.load(Ordering::SeqCst),
            auto_step: self.inner.auto_step.load(Ordering::SeqCst),
            scout: state.scout.clone(),
            scout_team: state.scout_team().map(|t| t.name.clone()),
            connected_teams,
            queued_tasks,
            gate_open,
        }
    }

    /// Results recorded so far.
    pub fn results(&self) -> MatchResults {
        self.inner.lock_state().results.clone()
    }

    /// Last action applied for each team, `None` before its first step.
    pub fn last_actions(&self) -> HashMap<String, Option<Action>> {
        self.inner
            .lock_state()
            .teams
            .iter()
            .map(|t| (t.name.clone(), t.last_action))
            .collect()
    }
}

impl Inner {
    fn lock_state(&self) -> MutexGuard<'_, MatchState> {
        self.state.lock().expect("poisoned")
    }

    fn lock_env(&self) -> MutexGuard<'_, Box<dyn Environment>> {
        self.env.lock().expect("poisoned")
    }

    #[instrument(skip(self))]
    fn step_once(&self) -> anyhow::Result<StepOutcome> {
        if self.lock_state().reset_pending {
            info!("retrying the reset of the environment");
            return self.advance_round();
        }
        let noop = self.lock_env().noop_action();

        // open the collection window
        let (step, messages) = {
            let mut state = self.lock_state();
            if state.finished {
                return Ok(StepOutcome::AlreadyFinished);
            }
            let mut actions = state
                .observations
                .keys()
                .map(|agent| (agent.clone(), noop))
                .collect::<HashMap<_, _>>();
            for team in &state.teams {
                actions.insert(team.agent.clone(), noop);
            }
            state.actions = actions;
            state.collecting = true;

            let step = state.step;
            let messages = state
                .teams
                .iter()
                .map(|team| {
                    let observation = state
                        .observations
                        .get(&team.agent)
                        .cloned()
                        .unwrap_or_default();
                    let message = ServerMessage::Task(TaskMessage::Rl { step, observation });
                    (team.name.clone(), message)
                })
                .collect::<Vec<_>>();
            (step, messages)
        };
        let started = Instant::now();
        let deadline = started + self.config.step_deadline;

        for (team, outcome) in self.registry.deliver(messages, deadline) {
            if let Err(e) = outcome {
                error!(team, step, "could not send observation: {e:#}");
            }
        }

        thread::sleep(deadline.saturating_duration_since(Instant::now()));

        let actions = {
            let mut state = self.lock_state();
            state.collecting = false;
            state.actions.clone()
        };
        trace!(?actions);

        let (transition, frame) = {
            let mut env = self.lock_env();
            let transition = env.step(&actions).context("environment step failed")?;
            let frame = env.render().context("could not render the environment")?;
            (transition, frame)
        };

        {
            let mut state = self.lock_state();
            let MatchState {
                round,
                teams,
                results,
                frames,
                observations,
                ..
            } = &mut *state;
            for team in teams.iter_mut() {
                team.last_action = actions.get(&team.agent).copied();
            }
            if let Some(record) = results.rounds.get_mut(*round) {
                record.steps.push(StepRecord {
                    actions: actions.clone().into_iter().collect(),
                    rewards: transition
                        .rewards
                        .iter()
                        .map(|(agent, reward)| (agent.clone(), *reward))
                        .collect(),
                });
            }
            frames.push(frame);
            *observations = transition.observations.clone();
        }
        debug!(step, elapsed = ?started.elapsed(), "step played");

        if transition.mission_requested() {
            self.trigger_mission();
        }

        if transition.is_round_over() {
            return self.finalize_round();
        }
        self.lock_state().step += 1;
        Ok(StepOutcome::Advanced)
    }

    /// Queues a batch of side-tasks. A queue that was empty hands its new head to the Scout
    /// right away.
    fn trigger_mission(&self) {
        let enqueued = self.queue.enqueue(self.config.tasks_per_mission);
        info!(added = enqueued.added.len(), "mission triggered");
        if enqueued.was_empty && !enqueued.added.is_empty() {
            self.dispatch_to_scout();
        }
    }

    /// Sends the head task to the Scout if the gate is open and the Scout is connected.
    ///
    /// A task whose payload cannot be read is dropped and the next one is tried. A failed send
    /// leaves the task in flight: it is sent again when the Scout reconnects.
    fn dispatch_to_scout(&self) {
        let Some(team) = self.lock_state().scout_team().map(|t| t.name.clone()) else {
            debug!("no team drives the Scout");
            return;
        };
        if self.registry.connection(&team).is_none() {
            debug!(team, "Scout not connected, dispatch deferred");
            return;
        }
        while let Some(task) = self.queue.dispatch() {
            match self.assets.message(&task) {
                Ok(message) => {
                    debug!(team, %task, "task sent to the Scout");
                    if let Err(e) = self.registry.send_to(&team, &message) {
                        error!(team, %task, "could not send task: {e:#}");
                    }
                    return;
                }
                Err(e) => {
                    warn!(%task, "dropping undeliverable task: {e:#}");
                    self.queue.discard_head();
                }
            }
        }
    }

    /// Persists the round, then moves on to the next one, or ends the match after the last.
    #[instrument(skip(self))]
    fn finalize_round(&self) -> anyhow::Result<StepOutcome> {
        let (round, frames, results) = {
            let mut state = self.lock_state();
            state.reset_pending = true;
            (
                state.round,
                std::mem::take(&mut state.frames),
                state.results.clone(),
            )
        };
        let persisted = {
            let mut sink = self.sink.lock().expect("poisoned");
            sink.save_round(round, &frames)
                .and_then(|()| sink.save_results(&results))
                .with_context(|| format!("could not persist round {round}"))
        };

        match self.advance_round() {
            Ok(outcome) => persisted.map(|()| outcome),
            Err(e) => {
                if let Err(p) = persisted {
                    error!("{p:#}");
                }
                Err(e)
            }
        }
    }

    /// Resets the environment for the round after the current one, or ends the match.
    ///
    /// On failure the match stays on the finished round with its reset pending.
    fn advance_round(&self) -> anyhow::Result<StepOutcome> {
        let round = self.lock_state().round;
        let next_round = round + 1;
        let finished = next_round >= self.config.num_rounds;
        let next = if finished {
            None
        } else {
            let mut env = self.lock_env();
            let observations = env.reset().context("could not reset the environment")?;
            let frame = env.render().context("could not render the environment")?;
            Some((observations, env.scout(), frame))
        };
        self.queue.reset();

        {
            let mut state = self.lock_state();
            state.round = next_round;
            state.step = 0;
            state.finished = finished;
            state.reset_pending = false;
            if let Some((observations, scout, frame)) = next {
                state.observations = observations;
                state.scout = scout;
                state.frames = vec![frame];
            }
        }
        info!(round, "round finished");

        let outcome = if finished {
            info!("match finished");
            self.auto_step.store(false, Ordering::SeqCst);
            for (team, outcome) in self.registry.broadcast(&ServerMessage::Done) {
                if let Err(e) = outcome {
                    warn!(team, "could not notify the end of the match: {e:#}");
                }
            }
            StepOutcome::MatchFinished
        } else {
            StepOutcome::RoundFinished
        };
        Ok(outcome)
    }
}
