//! Scoring of the Scout's side-task answers.
//!
//! A score mixes how good the answer is (delegated to a [`Scorer`]) with how fast it came
//! back:
//!
//! ```text
//! speed     = clamp((time_budget - elapsed) / time_budget, 0, 1)
//! composite = correctness * performance_weight + speed * speed_weight
//! ```

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, instrument};

use crate::task_queue::{Task, TaskType};

/// Default weight of the correctness sub-score.
pub const PERFORMANCE_WEIGHT: f64 = 0.75;
/// Default weight of the speed sub-score.
pub const SPEED_WEIGHT: f64 = 0.25;
/// Default time after which the speed sub-score reaches zero.
pub const TIME_BUDGET: Duration = Duration::from_secs(2);

/// Correctness of a prediction, for one task type.
///
/// Implementations load their ground truth themselves (see
/// [`AssetStore::ground_truth_path`](crate::assets::AssetStore::ground_truth_path)) and should
/// fail rather than guess when it is missing.
pub trait Scorer: Send + Sync {
    /// Returns a correctness value in `[0, 1]`.
    fn correctness(&self, task_type: TaskType, index: usize, prediction: &Value)
        -> anyhow::Result<f64>;
}

impl<F> Scorer for F
where
    F: Fn(TaskType, usize, &Value) -> anyhow::Result<f64> + Send + Sync,
{
    fn correctness(
        &self,
        task_type: TaskType,
        index: usize,
        prediction: &Value,
    ) -> anyhow::Result<f64> {
        self(task_type, index, prediction)
    }
}

/// Weights of the composite score.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoringWeights {
    /// Weight of the correctness sub-score.
    pub performance: f64,
    /// Weight of the speed sub-score.
    pub speed: f64,
    /// Elapsed time at which the speed sub-score drops to zero.
    pub time_budget: Duration,
}

impl Default for ScoringWeights {
    fn default() -> Self {
        Self {
            performance: PERFORMANCE_WEIGHT,
            speed: SPEED_WEIGHT,
            time_budget: TIME_BUDGET,
        }
    }
}

/// Combines a [`Scorer`] with the latency of the answer.
#[derive(Clone)]
pub struct ScoringPipeline {
    scorer: Arc<dyn Scorer>,
    weights: ScoringWeights,
}

impl std::fmt::Debug for ScoringPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScoringPipeline")
            .field("weights", &self.weights)
            .finish_non_exhaustive()
    }
}

impl ScoringPipeline {
    /// Creates a pipeline delegating correctness to `scorer`.
    pub fn new(scorer: Arc<dyn Scorer>, weights: ScoringWeights) -> ScoringPipeline {
        ScoringPipeline { scorer, weights }
    }

    /// Speed sub-score: 1 for an immediate answer, 0 once the time budget is spent.
    pub fn speed(&self, elapsed: Duration) -> f64 {
        let budget = self.weights.time_budget.as_secs_f64();
        ((budget - elapsed.as_secs_f64()) / budget).clamp(0.0, 1.0)
    }

    /// Composite score of `prediction` for `task`, answered after `elapsed`.
    ///
    /// An empty detection prediction scores exactly zero and the scorer is not consulted.
    ///
    /// # Errors
    /// Propagates the scorer's error, e.g. when its ground truth is missing.
    #[instrument(skip(self, prediction))]
    pub fn score(&self, task: &Task, prediction: &Value, elapsed: Duration) -> anyhow::Result<f64> {
        if task.task_type.is_detection() && is_empty_prediction(prediction) {
            debug!("empty detection prediction");
            return Ok(0.0);
        }

        let correctness = self
            .scorer
            .correctness(task.task_type, task.index, prediction)?
            .clamp(0.0, 1.0);
        let speed = self.speed(elapsed);
        debug!(correctness, speed);

        Ok(correctness * self.weights.performance + speed * self.weights.speed)
    }
}

fn is_empty_prediction(prediction: &Value) -> bool {
    match prediction {
        Value::Null => true,
        Value::Bool(b) => !b,
        Value::String(s) => s.is_empty(),
        Value::Array(a) => a.is_empty(),
        Value::Object(o) => o.is_empty(),
        Value::Number(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use anyhow::anyhow;
    use serde_json::json;

    use super::*;

    fn pipeline(correctness: f64) -> ScoringPipeline {
        let scorer = move |_: TaskType, _: usize, _: &Value| -> anyhow::Result<f64> {
            Ok(correctness)
        };
        ScoringPipeline::new(Arc::new(scorer), ScoringWeights::default())
    }

    fn task(task_type: TaskType) -> Task {
        Task {
            task_type,
            index: 7,
        }
    }

    #[test]
    fn speed_bounds() {
        let p = pipeline(1.0);
        assert_eq!(p.speed(Duration::ZERO), 1.0);
        assert_eq!(p.speed(Duration::from_secs(2)), 0.0);
        assert_eq!(p.speed(Duration::from_secs(30)), 0.0);
        assert!((p.speed(Duration::from_millis(500)) - 0.75).abs() < 1e-9);
    }

    #[test]
    fn composite_formula() {
        let p = pipeline(0.6);
        let score = p
            .score(&task(TaskType::Asr), &json!("hi"), Duration::from_secs(1))
            .unwrap();
        assert!((score - (0.6 * 0.75 + 0.5 * 0.25)).abs() < 1e-9);

        let instant = p
            .score(&task(TaskType::Ocr), &json!("hi"), Duration::ZERO)
            .unwrap();
        assert!((instant - (0.6 * 0.75 + 0.25)).abs() < 1e-9);
    }

    #[test]
    fn empty_detection_scores_zero_without_scorer() {
        let scorer = |_: TaskType, _: usize, _: &Value| -> anyhow::Result<f64> {
            panic!("scorer must not be called for empty detections")
        };
        let p = ScoringPipeline::new(Arc::new(scorer), ScoringWeights::default());
        for elapsed in [Duration::ZERO, Duration::from_millis(100), Duration::from_secs(5)] {
            assert_eq!(p.score(&task(TaskType::Cv), &json!([]), elapsed).unwrap(), 0.0);
            assert_eq!(p.score(&task(TaskType::Cv), &Value::Null, elapsed).unwrap(), 0.0);
        }
    }

    #[test]
    fn empty_transcription_still_consults_scorer() {
        let p = pipeline(0.0);
        let score = p
            .score(&task(TaskType::Asr), &json!(""), Duration::ZERO)
            .unwrap();
        assert_eq!(score, 0.25);
    }

    #[test]
    fn scorer_failure_propagates() {
        let scorer = |t: TaskType, i: usize, _: &Value| -> anyhow::Result<f64> {
            Err(anyhow!("no ground truth for {t} #{i}"))
        };
        let p = ScoringPipeline::new(Arc::new(scorer), ScoringWeights::default());
        let err = p
            .score(&task(TaskType::Ocr), &json!("text"), Duration::ZERO)
            .unwrap_err();
        assert_eq!(err.to_string(), "no ground truth for ocr #7");
    }

    #[test]
    fn correctness_is_clamped() {
        let p = pipeline(3.0);
        let score = p
            .score(&task(TaskType::Asr), &json!("x"), Duration::from_secs(9))
            .unwrap();
        assert_eq!(score, 0.75);
    }
}
