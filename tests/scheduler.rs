// tests/scheduler.rs

mod common;
use crate::common::fake_runner::{FakeRunner, StartLog};
use crate::common::recorder::Recorder;
use crate::common::{init_tracing, with_timeout};

use std::error::Error;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use proptest::prelude::*;

use qa::errors::QaError;
use qa::exec::worker_envs;
use qa::protocol::{Callbacks, ResultTally, Status, SuiteBegin, SuiteFinish, TraceEvent};
use qa::scheduler::{ALREADY_ABORTED, run_all, run_suite};

type TestResult = Result<(), Box<dyn Error>>;

#[tokio::test]
async fn test_single_worker_runs_largest_runner_first() -> TestResult {
    init_tracing();
    let started = StartLog::default();
    let runners = vec![
        FakeRunner::new("small", 1).log_starts(&started).into_arc(),
        FakeRunner::new("large", 3).log_starts(&started).into_arc(),
        FakeRunner::new("medium", 2).log_starts(&started).into_arc(),
        FakeRunner::new("medium2", 2).log_starts(&started).into_arc(),
    ];
    let mut recorder = Recorder::new();
    let mut tally = ResultTally::default();

    with_timeout(run_all(&mut recorder, &worker_envs(1), runners, &mut tally)).await?;

    assert_eq!(*started.lock().unwrap(), vec!["large", "medium", "medium2", "small"]);
    assert_eq!(tally.total, 8);
    assert_eq!(tally.pass, 8);
    assert_eq!(recorder.recorded().begins.len(), 8);
    Ok(())
}

#[tokio::test]
async fn test_failed_runner_reports_internal_error_and_aborts_queue() {
    init_tracing();
    let runners = vec![
        FakeRunner::new("broken", 3).failing("worker hung up").into_arc(),
        FakeRunner::new("later", 2).into_arc(),
    ];
    let mut recorder = Recorder::new();
    let mut tally = ResultTally::default();

    let result = with_timeout(run_all(&mut recorder, &worker_envs(1), runners, &mut tally)).await;

    assert!(matches!(result, Err(QaError::Transport(ref m)) if m == "worker hung up"));
    assert_eq!(
        recorder.finish_labels(),
        vec![
            "<internal error: Transport error: worker hung up>".to_string(),
            format!("<internal error: {ALREADY_ABORTED}>"),
            format!("<internal error: {ALREADY_ABORTED}>"),
        ]
    );
    let finishes = recorder.recorded().finishes;
    assert!(finishes.iter().all(|f| f.status == Status::Error));
    assert_eq!(finishes[1].filter.as_str(), "later:1");
    assert_eq!(tally.error, 3);
}

#[tokio::test]
async fn test_abort_skips_queued_runners_but_lets_running_ones_finish() {
    init_tracing();
    let runners = vec![
        FakeRunner::new("fails", 5)
            .delay(Duration::from_millis(50))
            .failing("boom")
            .into_arc(),
        FakeRunner::new("slow", 4)
            .delay(Duration::from_millis(300))
            .into_arc(),
        FakeRunner::new("queued", 1).into_arc(),
    ];
    let mut recorder = Recorder::new();
    let mut tally = ResultTally::default();

    let result = with_timeout(run_all(&mut recorder, &worker_envs(2), runners, &mut tally)).await;

    assert!(result.is_err());
    assert_eq!(tally.pass, 4, "in-flight runner completes");
    assert_eq!(tally.error, 2, "one transport failure, one skipped test");
    let skipped: Vec<String> = recorder
        .recorded()
        .finishes
        .iter()
        .filter(|f| f.label.contains(ALREADY_ABORTED))
        .map(|f| f.filter.as_str().to_string())
        .collect();
    assert_eq!(skipped, vec!["queued:1"]);
}

#[tokio::test]
async fn test_visitor_failure_stops_delivery_but_keeps_counting() {
    init_tracing();
    let runners = vec![
        FakeRunner::new("first", 2).into_arc(),
        FakeRunner::new("second", 1).into_arc(),
    ];
    let mut recorder = Recorder::failing_after(1);
    let mut tally = ResultTally::default();

    let result = with_timeout(run_all(&mut recorder, &worker_envs(1), runners, &mut tally)).await;

    assert!(result.unwrap_err().to_string().contains("recorder refused test"));
    assert_eq!(recorder.finish_labels(), vec!["first #1"]);
    assert_eq!(tally.total, 3);
}

#[tokio::test]
async fn test_run_all_requires_a_worker_slot() {
    let mut recorder = Recorder::new();
    let mut tally = ResultTally::default();
    let result = run_all(&mut recorder, &[], vec![FakeRunner::new("a", 1).into_arc()], &mut tally).await;
    assert!(matches!(result, Err(QaError::ConfigError(_))));
}

#[tokio::test]
async fn test_run_suite_frames_the_run() -> TestResult {
    init_tracing();
    let runners = vec![
        FakeRunner::new("a", 2).into_arc(),
        FakeRunner::new("b", 1).status(Status::Fail).into_arc(),
    ];
    let preamble = vec![TraceEvent {
        name: "enumerate".to_string(),
        ..TraceEvent::default()
    }];
    let mut recorder = Recorder::new();

    let tally =
        with_timeout(run_suite(&mut recorder, &worker_envs(2), runners, preamble, 1234)).await?;

    let seen = recorder.recorded();
    assert_eq!(seen.suites.len(), 1);
    assert_eq!(seen.suites[0].total_count, 3);
    assert_eq!(seen.suites[0].seed, 1234);
    assert_eq!(seen.traces[0].name, "enumerate");
    assert_eq!(seen.suite_finishes.len(), 1);
    assert_eq!(seen.suite_finishes[0].tally, tally);
    assert_eq!(seen.ends, vec![None]);
    assert_eq!((tally.pass, tally.fail), (2, 1));
    assert!(!tally.passed());
    Ok(())
}

#[tokio::test]
async fn test_run_suite_finishes_and_ends_even_when_aborted() {
    init_tracing();
    let runners = vec![FakeRunner::new("a", 2).failing("lost").into_arc()];
    let mut recorder = Recorder::new();

    let result = with_timeout(run_suite(&mut recorder, &worker_envs(1), runners, Vec::new(), 1)).await;

    assert!(result.is_err());
    let seen = recorder.recorded();
    assert_eq!(seen.suite_finishes.len(), 1);
    assert_eq!(seen.suite_finishes[0].tally.error, 1);
    assert_eq!(seen.ends.len(), 1);
    assert!(seen.ends[0].as_deref().unwrap().contains("lost"));
}

#[tokio::test]
async fn test_run_suite_finishes_when_suite_begin_is_rejected() {
    init_tracing();
    let started = StartLog::default();
    let runners = vec![FakeRunner::new("a", 2).log_starts(&started).into_arc()];
    let finishes: Arc<Mutex<Vec<ResultTally>>> = Arc::default();
    let ends: Arc<Mutex<Vec<Option<String>>>> = Arc::default();
    let mut callbacks = Callbacks {
        on_suite_begin: Some(Box::new(|_: &SuiteBegin| {
            Err::<(), _>(QaError::Transport("reporter gone".to_string()))
        })),
        on_suite_finish: Some(Box::new({
            let finishes = Arc::clone(&finishes);
            move |finish: &SuiteFinish| {
                finishes.lock().unwrap().push(finish.tally);
                Ok(())
            }
        })),
        on_end: Some(Box::new({
            let ends = Arc::clone(&ends);
            move |reason: Option<&QaError>| ends.lock().unwrap().push(reason.map(|e| e.to_string()))
        })),
        ..Callbacks::default()
    };

    let result = with_timeout(run_suite(&mut callbacks, &worker_envs(1), runners, Vec::new(), 1)).await;

    assert!(matches!(result, Err(QaError::Transport(ref m)) if m == "reporter gone"));
    assert!(started.lock().unwrap().is_empty());
    let finishes = finishes.lock().unwrap();
    assert_eq!(finishes.len(), 1);
    assert_eq!(finishes[0].total, 0);
    let ends = ends.lock().unwrap();
    assert_eq!(ends.len(), 1);
    assert!(ends[0].as_deref().unwrap().contains("reporter gone"));
}

#[tokio::test]
async fn test_large_runner_overlaps_small_ones_across_workers() -> TestResult {
    init_tracing();
    let per_test = Duration::from_millis(40);
    let started = StartLog::default();
    let mut runners: Vec<_> = (1..=4)
        .map(|n| FakeRunner::new(&format!("small{n}"), 1).delay(per_test).log_starts(&started).into_arc())
        .collect();
    runners.push(FakeRunner::new("big", 5).delay(per_test * 5).log_starts(&started).into_arc());
    runners.extend((5..=9).map(|n| {
        FakeRunner::new(&format!("small{n}"), 1).delay(per_test).log_starts(&started).into_arc()
    }));
    let serial = per_test * 14;
    let mut recorder = Recorder::new();
    let mut tally = ResultTally::default();

    let clock = Instant::now();
    with_timeout(run_all(&mut recorder, &worker_envs(3), runners, &mut tally)).await?;
    let elapsed = clock.elapsed();

    assert_eq!(started.lock().unwrap()[0], "big");
    assert_eq!(started.lock().unwrap().len(), 10);
    assert_eq!(tally.total, 14);
    assert_eq!(tally.pass, 14);
    assert!(elapsed >= per_test * 5, "{elapsed:?}");
    assert!(elapsed < serial * 4 / 5, "{elapsed:?} is close to the serial {serial:?}");
    Ok(())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn every_planned_test_is_counted_once(
        counts in proptest::collection::vec(0usize..6, 0..12),
        workers in 1usize..5,
        failing in proptest::collection::vec(any::<bool>(), 12),
    ) {
        let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
        let runners = counts
            .iter()
            .enumerate()
            .map(|(i, &n)| {
                let status = if failing[i] { Status::Fail } else { Status::Pass };
                FakeRunner::new(&format!("r{i}"), n).status(status).into_arc()
            })
            .collect::<Vec<_>>();
        let expected: usize = counts.iter().sum();
        let expected_failures: usize = counts
            .iter()
            .enumerate()
            .filter(|(i, _)| failing[*i])
            .map(|(_, n)| n)
            .sum();

        let mut recorder = Recorder::new();
        let mut tally = ResultTally::default();
        rt.block_on(run_all(&mut recorder, &worker_envs(workers), runners, &mut tally)).unwrap();

        prop_assert_eq!(tally.total, expected);
        prop_assert_eq!(tally.fail, expected_failures);
        prop_assert_eq!(tally.pass + tally.fail, expected);
        let seen = recorder.recorded();
        prop_assert_eq!(seen.finishes.len(), expected);
        prop_assert_eq!(seen.begins.len(), expected);
    }
}
