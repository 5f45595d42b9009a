//! Side-tasks for the Scout.
//!
//! Each [`TaskType`] owns a pool of sample indices `[0, pool_size)`. Mission triggers draw
//! tasks from these pools into a FIFO queue, and the head of the queue is handed to the Scout
//! one task at a time: the *gate* closes when a task is dispatched and only reopens once its
//! result has been evaluated by [`TaskQueue::complete`].
//!
//! All state lives behind a single mutex so that checking and closing the gate happen in one
//! critical section, whichever thread (step loop or Scout session) gets there first.

use std::collections::{HashMap, VecDeque};
use std::fmt::Display;
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::configuration::Configuration;
use crate::error::{ArenaError, ProtocolError};
use crate::protocol::TaskSubmission;
use crate::scoring::ScoringPipeline;

/// Kind of side-task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskType {
    /// Speech transcription.
    Asr,
    /// Object detection.
    Cv,
    /// Text recognition.
    Ocr,
}

impl TaskType {
    /// Every task type, in pool order.
    pub const ALL: [TaskType; 3] = [TaskType::Asr, TaskType::Cv, TaskType::Ocr];

    /// Wire name of the type.
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskType::Asr => "asr",
            TaskType::Cv => "cv",
            TaskType::Ocr => "ocr",
        }
    }

    /// Detection answers may legitimately be empty, and then score zero.
    pub fn is_detection(&self) -> bool {
        matches!(self, TaskType::Cv)
    }
}

impl Display for TaskType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskType {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TaskType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| ProtocolError::UnknownTask(s.to_string()))
    }
}

/// One sample of one task type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Task {
    /// Type of the task.
    pub task_type: TaskType,
    /// Index of the sample in the type's pool.
    pub index: usize,
}

impl Display for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}", self.task_type, self.index)
    }
}

/// Result of [`TaskQueue::enqueue`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Enqueued {
    /// Tasks appended to the queue, in order.
    pub added: Vec<Task>,
    /// The queue was empty before this call.
    pub was_empty: bool,
}

/// An evaluated task.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Completion {
    /// The task that was answered.
    pub task: Task,
    /// Time between dispatch and completion.
    pub elapsed: Duration,
    /// Composite score of the answer.
    pub score: f64,
}

#[derive(Debug)]
struct QueueState {
    queue: VecDeque<Task>,
    pools: HashMap<TaskType, VecDeque<usize>>,
    gate_open: bool,
    dispatched_at: Option<Instant>,
    rng: StdRng,
}

/// FIFO of side-tasks with a single-flight gate towards the Scout.
#[derive(Debug)]
pub struct TaskQueue {
    state: Mutex<QueueState>,
    scoring: ScoringPipeline,
    pool_size: usize,
    shuffle: bool,
}

impl TaskQueue {
    /// Creates a queue with `pool_size` samples per task type.
    ///
    /// With `shuffle`, each pool is shuffled on every (re)initialization. `seed` makes the
    /// draws reproducible.
    pub fn new(
        pool_size: usize,
        shuffle: bool,
        seed: Option<u64>,
        scoring: ScoringPipeline,
    ) -> TaskQueue {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let mut state = QueueState {
            queue: VecDeque::new(),
            pools: HashMap::new(),
            gate_open: true,
            dispatched_at: None,
            rng,
        };
        init_pools(&mut state, pool_size, shuffle);
        TaskQueue {
            state: Mutex::new(state),
            scoring,
            pool_size,
            shuffle,
        }
    }

    /// Creates a queue from the task settings of `config`.
    pub fn from_config(config: &Configuration, scoring: ScoringPipeline) -> TaskQueue {
        Self::new(
            config.task_pool_size,
            config.shuffle_tasks,
            config.seed,
            scoring,
        )
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().expect("poisoned")
    }

    /// Draws `n` tasks, each of a uniformly random type.
    ///
    /// A draw landing on an exhausted pool is skipped. Drawing stops early only when every pool
    /// is exhausted.
    #[instrument(skip(self))]
    pub fn enqueue(&self, n: usize) -> Enqueued {
        let mut guard = self.lock();
        let QueueState {
            queue, pools, rng, ..
        } = &mut *guard;
        let was_empty = queue.is_empty();

        let mut added = Vec::with_capacity(n);
        while added.len() < n {
            if pools.values().all(VecDeque::is_empty) {
                warn!("every task pool is exhausted, {} task(s) not added", n - added.len());
                break;
            }
            let task_type = TaskType::ALL[rng.gen_range(0..TaskType::ALL.len())];
            let Some(index) = pools.get_mut(&task_type).and_then(VecDeque::pop_front) else {
                info!("ran out of {task_type} tasks");
                continue;
            };
            let task = Task { task_type, index };
            queue.push_back(task);
            added.push(task);
        }
        debug!(?added, queued = queue.len());

        Enqueued { added, was_empty }
    }

    /// Head of the queue, if the gate is open. Does not modify the queue.
    pub fn peek(&self) -> Option<Task> {
        let state = self.lock();
        if state.gate_open {
            state.queue.front().copied()
        } else {
            None
        }
    }

    /// Closes the gate and returns the head task, if there is one and the gate is open.
    ///
    /// The dispatch instant is recorded; it is the start of the answer's elapsed time.
    pub fn dispatch(&self) -> Option<Task> {
        let mut state = self.lock();
        if !state.gate_open {
            return None;
        }
        let task = *state.queue.front()?;
        state.gate_open = false;
        state.dispatched_at = Some(Instant::now());
        debug!(%task, "dispatched");
        Some(task)
    }

    /// The task currently dispatched and not yet completed.
    pub fn in_flight(&self) -> Option<Task> {
        let state = self.lock();
        if state.gate_open {
            None
        } else {
            state.queue.front().copied()
        }
    }

    /// Pops the head task without scoring it and reopens the gate.
    ///
    /// Used when the head task cannot be delivered at all (e.g. its payload is unreadable).
    pub fn discard_head(&self) -> Option<Task> {
        let mut state = self.lock();
        state.gate_open = true;
        state.dispatched_at = None;
        state.queue.pop_front()
    }

    /// Evaluates `submission` against the task in flight, pops it and reopens the gate.
    ///
    /// # Errors
    /// - [`ArenaError::EmptyQueue`] if nothing is queued;
    /// - [`ArenaError::NoTaskInFlight`] if the head task was never dispatched;
    /// - [`ArenaError::TaskTypeMismatch`] if the submission answers another type. The head task
    ///   is consumed all the same;
    /// - any error of the [`Scorer`](crate::scoring::Scorer). The task is consumed as well.
    #[instrument(skip_all, fields(task = %submission.task))]
    pub fn complete(&self, submission: &TaskSubmission) -> anyhow::Result<Completion> {
        let (task, elapsed) = {
            let mut state = self.lock();
            if state.queue.is_empty() {
                return Err(ArenaError::EmptyQueue.into());
            }
            let Some(dispatched_at) = state.dispatched_at.filter(|_| !state.gate_open) else {
                return Err(ArenaError::NoTaskInFlight.into());
            };
            let Some(task) = state.queue.pop_front() else {
                return Err(ArenaError::EmptyQueue.into());
            };
            state.gate_open = true;
            state.dispatched_at = None;
            (task, dispatched_at.elapsed())
        };

        if task.task_type != submission.task {
            return Err(ArenaError::TaskTypeMismatch {
                expected: task.task_type,
                actual: submission.task,
            }
            .into());
        }

        let score = self.scoring.score(&task, &submission.result, elapsed)?;
        Ok(Completion {
            task,
            elapsed,
            score,
        })
    }

    /// Empties the queue, refills every pool and reopens the gate.
    pub fn reset(&self) {
        let mut state = self.lock();
        state.queue.clear();
        state.gate_open = true;
        state.dispatched_at = None;
        init_pools(&mut state, self.pool_size, self.shuffle);
    }

    /// Number of queued tasks, the in-flight one included.
    pub fn len(&self) -> usize {
        self.lock().queue.len()
    }

    /// True if no task is queued.
    pub fn is_empty(&self) -> bool {
        self.lock().queue.is_empty()
    }

    /// True if a new task may be dispatched.
    pub fn gate_open(&self) -> bool {
        self.lock().gate_open
    }

    /// Unused indices left for `task_type`.
    pub fn remaining(&self, task_type: TaskType) -> usize {
        self.lock().pools.get(&task_type).map_or(0, VecDeque::len)
    }
}

fn init_pools(state: &mut QueueState, pool_size: usize, shuffle: bool) {
    state.pools.clear();
    for task_type in TaskType::ALL {
        let mut indices = (0..pool_size).collect::<Vec<_>>();
        if shuffle {
            indices.shuffle(&mut state.rng);
        }
        state.pools.insert(task_type, indices.into());
    }
}
