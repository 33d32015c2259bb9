// src/scheduler/mod.rs

//! Worker-pool scheduler.
//!
//! Runners are sorted longest-first into one shared queue. `W` worker tasks
//! pull from it, each owning one worker environment, and funnel their events
//! into a single results channel. One aggregator turns that stream into
//! visitor calls and keeps the tally.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::errors::{QaError, Result};
use crate::exec::{PlannedTest, TestRunner, WorkerEnv};
use crate::protocol::{
    Exception, ResultTally, Status, SuiteBegin, SuiteFinish, TestBegin, TestFinish, TraceEvent,
    Visitor,
};

/// Message attached to tests skipped because an earlier runner failed.
pub const ALREADY_ABORTED: &str = "already aborted";

enum Outcome {
    Begin(TestBegin),
    Finish(TestFinish),
    Trace(TraceEvent),
    Aborted(PlannedTest),
    Failed(QaError),
}

/// Forwards one runner's events onto the shared results channel.
struct Forwarder {
    tx: mpsc::UnboundedSender<Outcome>,
}

impl Forwarder {
    fn send(&self, outcome: Outcome) -> Result<()> {
        self.tx
            .send(outcome)
            .map_err(|_| QaError::Transport("results channel closed".to_string()))
    }
}

impl Visitor for Forwarder {
    fn test_begin(&mut self, test: &TestBegin) -> Result<()> {
        self.send(Outcome::Begin(test.clone()))
    }

    fn test_finish(&mut self, test: &TestFinish) -> Result<()> {
        self.send(Outcome::Finish(test.clone()))
    }

    fn trace(&mut self, trace: &TraceEvent) -> Result<()> {
        self.send(Outcome::Trace(trace.clone()))
    }
}

type RunnerQueue = Arc<Mutex<VecDeque<Arc<dyn TestRunner>>>>;

/// Sort runners descending by test count. Stable, so equal counts keep their
/// enumeration order.
pub fn dispatch_order(runners: &mut [Arc<dyn TestRunner>]) {
    runners.sort_by(|a, b| b.test_count().cmp(&a.test_count()));
}

/// Run every runner across `worker_envs.len()` worker slots.
///
/// Every test outcome, real or synthetic, is counted into `tally`. Returns the
/// first transport error reported by a runner, or else the first visitor
/// error.
pub async fn run_all(
    visitor: &mut dyn Visitor,
    worker_envs: &[WorkerEnv],
    mut runners: Vec<Arc<dyn TestRunner>>,
    tally: &mut ResultTally,
) -> Result<()> {
    if worker_envs.is_empty() {
        return Err(QaError::ConfigError(
            "at least one worker slot is required".to_string(),
        ));
    }

    dispatch_order(&mut runners);
    info!(
        runners = runners.len(),
        workers = worker_envs.len(),
        "dispatching runners"
    );

    let queue: RunnerQueue = Arc::new(Mutex::new(runners.into_iter().collect()));
    let aborted = Arc::new(AtomicBool::new(false));
    let (tx, mut rx) = mpsc::unbounded_channel::<Outcome>();

    let mut workers = JoinSet::new();
    for (slot, env) in worker_envs.iter().enumerate() {
        workers.spawn(worker_loop(
            slot,
            env.clone(),
            Arc::clone(&queue),
            Arc::clone(&aborted),
            tx.clone(),
        ));
    }
    drop(tx);

    let mut transport_error: Option<QaError> = None;
    let mut visitor_error: Option<QaError> = None;

    while let Some(outcome) = rx.recv().await {
        let delivered = match outcome {
            Outcome::Begin(test) => deliver(&visitor_error, || visitor.test_begin(&test)),
            Outcome::Trace(trace) => deliver(&visitor_error, || visitor.trace(&trace)),
            Outcome::Finish(test) => {
                tally.increment(test.status);
                deliver(&visitor_error, || visitor.test_finish(&test))
            }
            Outcome::Aborted(test) => {
                let finish = internal_error(ALREADY_ABORTED, Some(&test));
                tally.increment(finish.status);
                deliver(&visitor_error, || visitor.test_finish(&finish))
            }
            Outcome::Failed(err) => {
                let finish = internal_error(&err.to_string(), None);
                tally.increment(finish.status);
                let delivered = deliver(&visitor_error, || visitor.test_finish(&finish));
                if transport_error.is_none() {
                    transport_error = Some(err);
                }
                delivered
            }
        };

        if let Err(err) = delivered {
            warn!(error = %err, "visitor failed; aborting remaining runners");
            aborted.store(true, Ordering::SeqCst);
            visitor_error = Some(err);
        }
    }

    while let Some(joined) = workers.join_next().await {
        if let Err(err) = joined {
            warn!(error = %err, "worker task panicked");
        }
    }

    match (transport_error, visitor_error) {
        (Some(err), _) | (None, Some(err)) => Err(err),
        (None, None) => Ok(()),
    }
}

/// Skip visitor calls once the visitor has failed.
fn deliver(failed: &Option<QaError>, f: impl FnOnce() -> Result<()>) -> Result<()> {
    if failed.is_some() { Ok(()) } else { f() }
}

async fn worker_loop(
    slot: usize,
    env: WorkerEnv,
    queue: RunnerQueue,
    aborted: Arc<AtomicBool>,
    tx: mpsc::UnboundedSender<Outcome>,
) {
    loop {
        let next = queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front();
        let Some(runner) = next else { break };

        if aborted.load(Ordering::SeqCst) {
            debug!(worker = slot, tests = runner.test_count(), "skipping runner after abort");
            for test in runner.tests() {
                let _ = tx.send(Outcome::Aborted(test.clone()));
            }
            continue;
        }

        debug!(worker = slot, tests = runner.test_count(), "starting runner");
        let sink = Box::new(Forwarder { tx: tx.clone() });
        if let Err(err) = runner.run(env.clone(), sink).await {
            warn!(worker = slot, error = %err, "runner failed; aborting");
            aborted.store(true, Ordering::SeqCst);
            let _ = tx.send(Outcome::Failed(err));
        }
    }
    debug!(worker = slot, "worker finished");
}

fn internal_error(message: &str, test: Option<&PlannedTest>) -> TestFinish {
    let filter = test.map(|t| t.filter.clone()).unwrap_or_default();
    let mut finish = TestFinish::new(format!("<internal error: {message}>"), filter, Status::Error);
    finish.file = test.and_then(|t| t.file.clone());
    finish.exception = Some(Exception {
        message: message.to_string(),
        ..Exception::default()
    });
    finish
}

/// Wrap [`run_all`] in a full suite: one `suite_begin`, the runners, one
/// `suite_finish`, then exactly one `end`.
///
/// `preamble` trace events (from enumeration) are delivered right after
/// `suite_begin`.
pub async fn run_suite(
    visitor: &mut dyn Visitor,
    worker_envs: &[WorkerEnv],
    runners: Vec<Arc<dyn TestRunner>>,
    preamble: Vec<TraceEvent>,
    seed: i64,
) -> Result<ResultTally> {
    let started = Instant::now();
    let suite = SuiteBegin {
        start_time: unix_timestamp(),
        total_count: runners.iter().map(|r| r.test_count()).sum(),
        seed,
    };

    let mut tally = ResultTally::default();
    let opened = visitor
        .suite_begin(&suite)
        .and_then(|()| preamble.iter().try_for_each(|trace| visitor.trace(trace)));
    let ran = match opened {
        Ok(()) => run_all(visitor, worker_envs, runners, &mut tally).await,
        Err(err) => {
            warn!(error = %err, "visitor rejected the suite header; not dispatching runners");
            Err(err)
        }
    };
    let finished = visitor.suite_finish(&SuiteFinish {
        time: started.elapsed().as_secs_f64(),
        tally,
        suite: suite.clone(),
    });
    let result = ran.and(finished);

    visitor.end(result.as_ref().err());
    info!(%tally, elapsed = ?started.elapsed(), "suite finished");
    result.map(|()| tally)
}

fn unix_timestamp() -> String {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    format!("{}.{:03}", now.as_secs(), now.subsec_millis())
}
