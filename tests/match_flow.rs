use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use serde_json::{json, Value};

use scout_arena::environment::agent_for_slot;
use scout_arena::prelude::*;
use scout_arena::protocol::{ServerMessage, TaskSubmission};

use crate::common::*;

mod common;

#[test]
fn silent_step_advances_after_the_deadline() {
    init_test_logger();
    let env = ScriptedEnv::new(2, 10);
    let log = env.log();
    let config = config(&["a", "b"]).with_step_deadline(Duration::from_millis(150));
    let (controller, _sink) = controller(config, env);

    let started = Instant::now();
    assert_eq!(controller.step().unwrap(), StepOutcome::Advanced);
    assert!(started.elapsed() >= Duration::from_millis(150));

    let applied = log.lock().unwrap()[0].clone();
    assert_eq!(applied[&agent_for_slot(0)], 4);
    assert_eq!(applied[&agent_for_slot(1)], 4);
    assert_eq!(controller.status().step, 1);
}

#[test]
fn connected_teams_receive_their_observation() {
    let (controller, _sink) = controller(config(&["a", "b"]), ScriptedEnv::new(2, 10));
    let a = RecordingConnection::new();
    controller.registry().register("a", a.clone()).unwrap();

    controller.step().unwrap();
    controller.step().unwrap();

    let steps = a
        .sent()
        .into_iter()
        .map(|m| match m {
            ServerMessage::Task(scout_arena::protocol::TaskMessage::Rl { step, observation }) => {
                assert_eq!(observation["slot"], 0);
                step
            }
            other => panic!("unexpected {other:?}"),
        })
        .collect::<Vec<_>>();
    assert_eq!(steps, [0, 1]);
}

#[test]
fn round_finalization_resets_step_and_tasks() {
    let env = ScriptedEnv::new(2, 2).with_missions([0]);
    let (controller, sink) = controller(config(&["a", "b"]), env);

    assert_eq!(controller.step().unwrap(), StepOutcome::Advanced);
    let status = controller.status();
    assert_eq!(status.queued_tasks, 5);
    // nobody drives the Scout yet
    assert!(status.gate_open);

    assert_eq!(controller.step().unwrap(), StepOutcome::RoundFinished);
    let status = controller.status();
    assert_eq!(status.round, 1);
    assert_eq!(status.step, 0);
    assert_eq!(status.queued_tasks, 0);
    assert!(status.gate_open);
    assert_eq!(status.scout, agent_for_slot(1));

    let log = sink.log.lock().unwrap();
    assert_eq!(log.rounds.len(), 1);
    let (round, frames) = &log.rounds[0];
    assert_eq!(*round, 0);
    // initial frame plus one per step
    assert_eq!(frames.len(), 3);
    let results = log.results.as_ref().unwrap();
    assert_eq!(results.rounds[0].steps.len(), 2);
    assert!(results.rounds[1].steps.is_empty());
}

#[test]
fn mission_on_empty_queue_dispatches_the_head() {
    let env = ScriptedEnv::new(2, 10).with_missions([0]).with_scout(1);
    let (controller, _sink) = controller(config(&["a", "b"]), env);
    let scout = RecordingConnection::new();
    let other = RecordingConnection::new();
    controller.registry().register("b", scout.clone()).unwrap();
    controller.registry().register("a", other.clone()).unwrap();

    controller.step().unwrap();
    let status = controller.status();
    assert_eq!(status.queued_tasks, 5);
    assert!(!status.gate_open);
    assert_eq!(status.scout_team.as_deref(), Some("b"));

    let dispatched = scout.side_tasks();
    assert_eq!(dispatched.len(), 1);
    assert!(other.side_tasks().is_empty());

    // answering hands out the next task
    let completion = controller
        .submit_task_result(
            "b",
            TaskSubmission {
                task: dispatched[0],
                result: json!("an answer"),
            },
        )
        .unwrap();
    assert!(completion.score >= 0.75);
    assert_eq!(scout.side_tasks().len(), 2);
    assert_eq!(controller.status().queued_tasks, 4);

    let results = controller.results();
    assert_eq!(results.rounds[0].scout_results.len(), 1);
    assert_eq!(results.rounds[0].scout_results[0].data.task, dispatched[0]);
}

#[test]
fn second_mission_does_not_dispatch_again() {
    let env = ScriptedEnv::new(1, 10).with_missions([0, 1]);
    let (controller, _sink) = controller(config(&["a"]), env);
    let scout = RecordingConnection::new();
    controller.registry().register("a", scout.clone()).unwrap();

    controller.step().unwrap();
    controller.step().unwrap();
    assert_eq!(controller.status().queued_tasks, 10);
    assert_eq!(scout.side_tasks().len(), 1);
}

#[test]
fn results_from_other_teams_are_rejected() {
    let env = ScriptedEnv::new(2, 10).with_missions([0]);
    let (controller, _sink) = controller(config(&["a", "b"]), env);
    let scout = RecordingConnection::new();
    controller.registry().register("a", scout.clone()).unwrap();
    controller.step().unwrap();

    let task = scout.side_tasks()[0];
    let err = controller
        .submit_task_result(
            "b",
            TaskSubmission {
                task,
                result: json!("not mine"),
            },
        )
        .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<ArenaError>(),
        Some(ArenaError::NotScout { .. })
    ));
    // still in flight
    assert_eq!(controller.status().queued_tasks, 5);
    assert!(!controller.status().gate_open);
}

#[test]
fn scout_reconnecting_gets_its_task_again() {
    let env = ScriptedEnv::new(1, 10).with_missions([0]);
    let (controller, _sink) = controller(config(&["a"]), env);
    let first = RecordingConnection::new();
    let id = controller.registry().register("a", first.clone()).unwrap();
    controller.step().unwrap();
    let task = first.side_tasks()[0];

    controller.registry().release("a", id);
    let second = RecordingConnection::new();
    controller.registry().register("a", second.clone()).unwrap();
    controller.on_team_connected("a");
    assert_eq!(second.side_tasks(), [task]);
}

#[test]
fn finished_match_broadcasts_done() {
    let env = ScriptedEnv::new(2, 1);
    let config = config(&["a", "b"]).with_num_rounds(2);
    let (controller, sink) = controller(config, env);
    let a = RecordingConnection::new();
    controller.registry().register("a", a.clone()).unwrap();

    assert_eq!(controller.step().unwrap(), StepOutcome::RoundFinished);
    assert_eq!(controller.step().unwrap(), StepOutcome::MatchFinished);
    assert_eq!(a.sent().last(), Some(&ServerMessage::Done));
    assert!(controller.status().finished);

    assert_eq!(controller.start(), StartOutcome::Finished);
    assert_eq!(controller.step().unwrap(), StepOutcome::AlreadyFinished);
    assert_eq!(sink.log.lock().unwrap().rounds.len(), 2);
}

#[test]
fn step_loop_runs_the_whole_match() {
    let env = ScriptedEnv::new(2, 3);
    let config = config(&["a", "b"])
        .with_num_rounds(2)
        .with_step_deadline(Duration::from_millis(10));
    let (controller, _sink) = controller(config, env);

    assert_eq!(controller.start(), StartOutcome::Started);
    controller.wait();
    let status = controller.status();
    assert!(status.finished);
    assert!(!status.running);
    let results = controller.results();
    assert!(results.rounds.iter().all(|r| r.steps.len() == 3));
}

#[test]
fn step_error_halts_the_loop_until_resumed() {
    let env = ScriptedEnv::new(2, 10).failing_at(2);
    let config = config(&["a", "b"]).with_step_deadline(Duration::from_millis(10));
    let (controller, _sink) = controller(config, env);

    assert_eq!(controller.start(), StartOutcome::Started);
    controller.wait();
    let status = controller.status();
    assert!(!status.running);
    assert!(!status.auto_step);
    assert!(!status.finished);
    assert_eq!(status.step, 2);

    assert_eq!(controller.step().unwrap(), StepOutcome::Advanced);
    assert_eq!(controller.status().step, 3);
}

#[test]
fn stop_takes_effect_at_the_next_step() {
    let env = ScriptedEnv::new(1, 1000);
    let config = config(&["a"]).with_step_deadline(Duration::from_millis(20));
    let (controller, _sink) = controller(config, env);

    assert_eq!(controller.start(), StartOutcome::Started);
    assert_eq!(controller.start(), StartOutcome::AlreadyRunning);
    assert!(wait_until(|| controller.status().step >= 2));
    assert!(controller.stop());
    controller.wait();

    let status = controller.status();
    assert!(!status.running);
    assert_eq!(controller.results().rounds[0].steps.len(), status.step);
}

#[test]
fn failed_reset_is_retried_without_replaying_the_round() {
    let env = ScriptedEnv::new(2, 1).failing_next_reset();
    let log = env.log();
    let config = config(&["a", "b"]).with_num_rounds(3);
    let (controller, sink) = controller(config, env);

    assert!(controller.step().is_err());
    let status = controller.status();
    assert_eq!(status.round, 0);
    assert!(!status.finished);

    assert_eq!(controller.step().unwrap(), StepOutcome::RoundFinished);
    assert_eq!(controller.status().round, 1);
    // the finished episode was not stepped again
    assert_eq!(log.lock().unwrap().len(), 1);
    let sink = sink.log.lock().unwrap();
    assert_eq!(sink.rounds.len(), 1);
    assert_eq!(sink.rounds[0].1.len(), 2);
}

#[test]
fn answer_scored_across_the_end_of_round_stays_in_its_round() {
    let (entered_tx, entered_rx) = mpsc::channel();
    let (release_tx, release_rx) = mpsc::channel::<()>();
    let (entered_tx, release_rx) = (Mutex::new(entered_tx), Mutex::new(release_rx));
    let scorer = move |_: TaskType, _: usize, _: &Value| -> anyhow::Result<f64> {
        entered_tx.lock().unwrap().send(()).unwrap();
        release_rx.lock().unwrap().recv().unwrap();
        Ok(1.0)
    };
    let env = ScriptedEnv::new(1, 2).with_missions([0]);
    let config = config(&["a"]).with_num_rounds(2);
    let controller = MatchController::new(
        config,
        Box::new(env),
        Arc::new(scorer),
        Box::new(MemorySink::default()),
    )
    .unwrap();
    let scout = RecordingConnection::new();
    controller.registry().register("a", scout.clone()).unwrap();
    controller.step().unwrap();
    let task = scout.side_tasks()[0];

    let submitter = {
        let controller = controller.clone();
        thread::spawn(move || {
            let submission = TaskSubmission {
                task,
                result: json!("an answer"),
            };
            controller.submit_task_result("a", submission)
        })
    };
    entered_rx.recv().unwrap();
    assert_eq!(controller.step().unwrap(), StepOutcome::RoundFinished);
    release_tx.send(()).unwrap();
    submitter.join().unwrap().unwrap();

    let results = controller.results();
    assert_eq!(results.rounds[0].scout_results.len(), 1);
    assert!(results.rounds[1].scout_results.is_empty());
}
