#![allow(dead_code)]

use std::collections::HashMap;
use std::io::{BufRead, BufReader, Lines, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::bail;
use serde_json::{json, Value};
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

use scout_arena::artifacts::ArtifactSink;
use scout_arena::environment::*;
use scout_arena::prelude::*;
use scout_arena::protocol::ServerMessage;
use scout_arena::registry::{Connection, ProbeOutcome};
use scout_arena::results::MatchResults;

pub fn init_test_logger() {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::DEBUG)
        .with_test_writer()
        .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);
}

/// Environment whose rounds last a fixed number of steps.
pub struct ScriptedEnv {
    agents: usize,
    round_length: usize,
    mission_steps: Vec<usize>,
    scout_slot: usize,
    fail_at: Option<usize>,
    fail_next_reset: bool,
    padding: usize,
    episode: Option<usize>,
    tick: usize,
    log: Arc<Mutex<Vec<HashMap<AgentId, Action>>>>,
}

impl ScriptedEnv {
    pub fn new(agents: usize, round_length: usize) -> ScriptedEnv {
        ScriptedEnv {
            agents,
            round_length,
            mission_steps: vec![],
            scout_slot: 0,
            fail_at: None,
            fail_next_reset: false,
            padding: 0,
            episode: None,
            tick: 0,
            log: Arc::default(),
        }
    }

    /// Requests a mission after each of these steps of a round.
    pub fn with_missions(mut self, steps: impl IntoIterator<Item = usize>) -> Self {
        self.mission_steps = steps.into_iter().collect();
        self
    }

    /// Scout of the first round. It moves to the next slot every round.
    pub fn with_scout(mut self, slot: usize) -> Self {
        self.scout_slot = slot;
        self
    }

    /// Fails once at this step of the round.
    pub fn failing_at(mut self, step: usize) -> Self {
        self.fail_at = Some(step);
        self
    }

    /// Fails the first reset after the initial one.
    pub fn failing_next_reset(mut self) -> Self {
        self.fail_next_reset = true;
        self
    }

    /// Pads every observation with this many bytes.
    pub fn with_padding(mut self, bytes: usize) -> Self {
        self.padding = bytes;
        self
    }

    /// Every action map the environment was stepped with.
    pub fn log(&self) -> Arc<Mutex<Vec<HashMap<AgentId, Action>>>> {
        self.log.clone()
    }

    fn observations(&self) -> Observations {
        let padding = "x".repeat(self.padding);
        (0..self.agents)
            .map(|slot| {
                let observation = json!({ "tick": self.tick, "slot": slot, "padding": padding });
                (agent_for_slot(slot), observation)
            })
            .collect()
    }
}

impl Environment for ScriptedEnv {
    fn reset(&mut self) -> anyhow::Result<Observations> {
        if self.fail_next_reset && self.episode.is_some() {
            self.fail_next_reset = false;
            bail!("scripted reset failure");
        }
        self.tick = 0;
        self.episode = Some(self.episode.map_or(0, |e| e + 1));
        Ok(self.observations())
    }

    fn step(&mut self, actions: &HashMap<AgentId, Action>) -> anyhow::Result<Transition> {
        if self.fail_at == Some(self.tick) {
            self.fail_at = None;
            bail!("scripted failure at tick {}", self.tick);
        }
        self.log.lock().unwrap().push(actions.clone());
        let played = self.tick;
        self.tick += 1;

        let agents = (0..self.agents).map(agent_for_slot).collect::<Vec<_>>();
        let over = self.tick >= self.round_length;
        let mission = self.mission_steps.contains(&played);
        Ok(Transition {
            observations: self.observations(),
            rewards: agents.iter().map(|a| (a.clone(), 1.0)).collect(),
            terminations: agents.iter().map(|a| (a.clone(), over)).collect(),
            truncations: HashMap::new(),
            infos: agents
                .iter()
                .map(|a| (a.clone(), StepInfo { add_mission: mission }))
                .collect(),
        })
    }

    fn scout(&self) -> AgentId {
        agent_for_slot((self.scout_slot + self.episode.unwrap_or(0)) % self.agents)
    }

    fn render(&self) -> anyhow::Result<Frame> {
        Ok(vec![self.tick as u8])
    }

    fn noop_action(&self) -> Action {
        4
    }

    fn is_valid_action(&self, action: Action) -> bool {
        action <= 4
    }
}

/// Scorer giving the same correctness to every answer.
pub fn fixed_scorer(correctness: f64) -> Arc<dyn Scorer> {
    Arc::new(move |_: TaskType, _: usize, _: &Value| -> anyhow::Result<f64> { Ok(correctness) })
}

#[derive(Debug, Default)]
pub struct SinkLog {
    pub rounds: Vec<(usize, Vec<Vec<u8>>)>,
    pub results: Option<MatchResults>,
}

/// Keeps artifacts in memory.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    pub log: Arc<Mutex<SinkLog>>,
}

impl ArtifactSink for MemorySink {
    fn save_round(&mut self, round: usize, frames: &[Vec<u8>]) -> anyhow::Result<()> {
        self.log.lock().unwrap().rounds.push((round, frames.to_vec()));
        Ok(())
    }

    fn save_results(&mut self, results: &MatchResults) -> anyhow::Result<()> {
        self.log.lock().unwrap().results = Some(results.clone());
        Ok(())
    }
}

/// In-process connection recording what the server sends.
#[derive(Debug)]
pub struct RecordingConnection {
    pub sent: Mutex<Vec<ServerMessage>>,
    pub closed: AtomicBool,
}

impl RecordingConnection {
    pub fn new() -> Arc<RecordingConnection> {
        Arc::new(RecordingConnection {
            sent: Mutex::new(vec![]),
            closed: AtomicBool::new(false),
        })
    }

    pub fn sent(&self) -> Vec<ServerMessage> {
        self.sent.lock().unwrap().clone()
    }

    /// Side-tasks received so far.
    pub fn side_tasks(&self) -> Vec<TaskType> {
        self.sent()
            .into_iter()
            .filter_map(|m| match m {
                ServerMessage::Task(task) => task.task_type(),
                _ => None,
            })
            .collect()
    }
}

impl Connection for RecordingConnection {
    fn send(&self, message: &ServerMessage) -> anyhow::Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            bail!("connection closed");
        }
        self.sent.lock().unwrap().push(message.clone());
        Ok(())
    }

    fn probe(&self, _timeout: Duration) -> ProbeOutcome {
        if self.closed.load(Ordering::SeqCst) {
            ProbeOutcome::Gone
        } else {
            ProbeOutcome::Healthy
        }
    }

    fn close(&self, _reason: &str) -> anyhow::Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

pub fn config(teams: &[&str]) -> Configuration {
    Configuration::new()
        .with_teams(teams.iter().copied())
        .with_step_deadline(Duration::from_millis(50))
        .with_probe_timeout(Duration::from_millis(200))
        .with_embed_payloads(false)
        .with_seed(11)
}

pub fn controller(config: Configuration, env: ScriptedEnv) -> (MatchController, MemorySink) {
    let sink = MemorySink::default();
    let controller =
        MatchController::new(config, Box::new(env), fixed_scorer(1.0), Box::new(sink.clone()))
            .unwrap();
    (controller, sink)
}

/// Polls `condition` for at most two seconds.
pub fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(2);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    condition()
}

/// Raw TCP client speaking the session protocol.
pub struct TestClient {
    pub lines: Lines<BufReader<TcpStream>>,
    pub writer: TcpStream,
}

impl TestClient {
    pub fn connect(addr: SocketAddr, team: &str) -> TestClient {
        let stream = TcpStream::connect(addr).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        let mut writer = stream.try_clone().unwrap();
        writeln!(writer, "{}", json!({ "team": team })).unwrap();
        TestClient {
            lines: BufReader::new(stream).lines(),
            writer,
        }
    }

    pub fn send(&mut self, value: Value) {
        writeln!(self.writer, "{value}").unwrap();
    }

    /// Next server message, `None` at end of stream.
    pub fn recv(&mut self) -> Option<ServerMessage> {
        let line = self.lines.next()?.ok()?;
        Some(serde_json::from_str(&line).unwrap())
    }
}
