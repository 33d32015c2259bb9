// src/engine/runtime.rs

use std::collections::{BTreeMap, VecDeque};
use std::fmt;

use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::errors::{QaError, Result};
use crate::protocol::{ResultTally, Visitor};
use crate::report::SummaryReporter;
use crate::watch::{WatchBackend, WatchEngine};

use super::{RunPlan, RuntimeEvent, Session};

/// Auto-mode loop: executes requested plans one at a time until shutdown.
///
/// Requests that arrive while a suite is running are queued in arrival
/// order and dropped on shutdown.
pub struct Runtime {
    session: Session,
    event_rx: mpsc::Receiver<RuntimeEvent>,
    engines: BTreeMap<String, WatchEngine>,
    backend: Option<Box<dyn WatchBackend>>,
    pending: VecDeque<RunPlan>,
    tally: ResultTally,
}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("session", &self.session)
            .field("engines", &self.engines.keys().collect::<Vec<_>>())
            .field("pending", &self.pending.len())
            .finish_non_exhaustive()
    }
}

impl Runtime {
    pub fn new(session: Session, event_rx: mpsc::Receiver<RuntimeEvent>) -> Self {
        Self {
            session,
            event_rx,
            engines: BTreeMap::new(),
            backend: None,
            pending: VecDeque::new(),
            tally: ResultTally::default(),
        }
    }

    pub fn with_engine(mut self, engine: WatchEngine) -> Self {
        self.engines.insert(engine.runner().to_string(), engine);
        self
    }

    /// Backend closed on shutdown, after every engine's subscription.
    pub fn with_backend(mut self, backend: Box<dyn WatchBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    /// Main event loop. Returns the tally of the last suite that ran.
    pub async fn run(mut self) -> Result<ResultTally> {
        info!(engines = self.engines.len(), "qa runtime started");

        let result = self.event_loop().await;
        stop_intake(&self.engines, &mut self.backend, &self.session).await;

        info!("runtime exiting");
        result.map(|()| self.tally)
    }

    async fn event_loop(&mut self) -> Result<()> {
        loop {
            let plan = match self.pending.pop_front() {
                Some(plan) => plan,
                None => match self.event_rx.recv().await {
                    Some(RuntimeEvent::RunRequested(plan)) => plan,
                    Some(RuntimeEvent::ShutdownRequested) => {
                        info!("shutdown requested");
                        return Ok(());
                    }
                    Some(RuntimeEvent::Failed { runner, error }) => {
                        error!(%runner, error = %error, "watch engine failed; shutting down");
                        return Err(error);
                    }
                    None => {
                        info!("runtime event channel closed; exiting");
                        return Ok(());
                    }
                },
            };

            if !self.run_plan(plan).await? {
                return Ok(());
            }
        }
    }

    /// Run one plan. Returns `false` if shutdown arrived mid-suite, and the
    /// engine's error if a watch engine failed mid-suite.
    ///
    /// Shutdown stops the watchers and the coordination server, then waits
    /// for the suite: workers already streaming finish their current job,
    /// runners not yet connected fail fast.
    async fn run_plan(&mut self, plan: RunPlan) -> Result<bool> {
        debug!(?plan, "running plan");
        let reporter: Box<dyn Visitor> = Box::new(SummaryReporter::new(plan.runner.clone()));
        let engine = self.engines.get(&plan.runner);

        let run = self.session.run(&plan, reporter, engine);
        tokio::pin!(run);
        let mut shutting_down = false;
        let mut fatal: Option<QaError> = None;

        loop {
            tokio::select! {
                result = &mut run => {
                    if let Some(error) = fatal {
                        if let Err(err) = result {
                            warn!(runner = %plan.runner, error = %err, "suite interrupted by watch failure");
                        }
                        return Err(error);
                    }
                    return match result {
                        Ok(tally) => {
                            self.tally = tally;
                            Ok(!shutting_down)
                        }
                        Err(err) if shutting_down => {
                            warn!(runner = %plan.runner, error = %err, "suite interrupted by shutdown");
                            Ok(false)
                        }
                        Err(err) => Err(err),
                    };
                }
                event = self.event_rx.recv(), if !shutting_down => {
                    match event {
                        Some(RuntimeEvent::RunRequested(next)) => {
                            debug!(runner = %next.runner, "queued plan behind running suite");
                            self.pending.push_back(next);
                            continue;
                        }
                        Some(RuntimeEvent::Failed { runner, error }) => {
                            error!(%runner, error = %error, "watch engine failed; stopping the running suite");
                            fatal = Some(error);
                        }
                        Some(RuntimeEvent::ShutdownRequested) | None => {
                            info!(runner = %plan.runner, "shutdown requested; letting running workers finish");
                        }
                    }
                    shutting_down = true;
                    stop_intake(&self.engines, &mut self.backend, &self.session).await;
                }
            }
        }
    }
}

/// Stop the watchers and the coordination server.
async fn stop_intake(
    engines: &BTreeMap<String, WatchEngine>,
    backend: &mut Option<Box<dyn WatchBackend>>,
    session: &Session,
) {
    for engine in engines.values() {
        engine.close();
    }
    if let Some(backend) = backend.as_mut() {
        backend.close();
    }
    session.server().close().await;
}
