// src/engine/session.rs

use std::sync::Arc;

use tracing::{info, warn};

use crate::config::{ConfigFile, RunnerConfig, SquashPolicy};
use crate::errors::{QaError, Result};
use crate::exec::{Context, ContextSpec, list_test_files, worker_envs};
use crate::fs::FileSystem;
use crate::protocol::{MultiVisitor, ResultTally, Visitor};
use crate::scheduler::{dispatch_order, run_suite};
use crate::server::Server;
use crate::watch::WatchEngine;

use super::RunPlan;

/// Everything shared by the suite runs of one `qa` invocation.
#[derive(Debug, Clone)]
pub struct Session {
    server: Server,
    config: Arc<ConfigFile>,
    fs: Arc<dyn FileSystem>,
    seed: i64,
    workers: usize,
    squash: Option<SquashPolicy>,
}

impl Session {
    pub fn new(server: Server, config: Arc<ConfigFile>, fs: Arc<dyn FileSystem>, seed: i64) -> Self {
        let workers = config.workers();
        Self {
            server,
            config,
            fs,
            seed,
            workers,
            squash: None,
        }
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    /// Override every runner's configured squash policy for full runs.
    pub fn with_squash(mut self, squash: Option<SquashPolicy>) -> Self {
        self.squash = squash;
        self
    }

    pub fn server(&self) -> &Server {
        &self.server
    }

    pub fn config(&self) -> &ConfigFile {
        &self.config
    }

    pub fn seed(&self) -> i64 {
        self.seed
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    fn runner_config(&self, name: &str) -> Result<&RunnerConfig> {
        self.config
            .runner
            .get(name)
            .ok_or_else(|| QaError::ConfigError(format!("unknown runner '{name}'")))
    }

    /// A plan covering every test file the runner's patterns match.
    pub fn full_plan(&self, runner: &str) -> Result<RunPlan> {
        let cfg = self.runner_config(runner)?;
        let files = list_test_files(
            self.fs.as_ref(),
            &self.config.run.dir,
            &self.config.run.ignore_dirs,
            &cfg.patterns,
        )?;
        Ok(RunPlan::full(runner, files))
    }

    /// Start a worker context for the plan, enumerate it, and run the suite.
    ///
    /// With a watch engine, enumeration primes its index and its visitor
    /// sees every result next to `reporter`.
    pub async fn run(
        &self,
        plan: &RunPlan,
        reporter: Box<dyn Visitor>,
        watch: Option<&WatchEngine>,
    ) -> Result<ResultTally> {
        let cfg = self.runner_config(&plan.runner)?;
        if plan.files.is_empty() {
            warn!(runner = %plan.runner, "no test files to run");
        }

        let mut spec =
            ContextSpec::from_config(&plan.runner, cfg, self.config.run.dir.clone(), self.seed)?;
        spec.squash = plan.squash.or(self.squash).unwrap_or(cfg.squash);

        let envs = worker_envs(self.workers);
        let context = Context::start(&self.server, spec, &envs, &plan.files).await?;

        let outcome = async {
            let enumeration = context.enumerate(&plan.filters).await?;
            if let Some(engine) = watch {
                engine.prime(&enumeration.runners, plan.is_filtered())?;
            }

            let mut runners = enumeration.runners;
            dispatch_order(&mut runners);
            info!(
                runner = %plan.runner,
                files = plan.files.len(),
                filters = plan.filters.len(),
                runners = runners.len(),
                workers = envs.len(),
                "starting suite"
            );

            let mut visitor = MultiVisitor::new(vec![reporter]);
            if let Some(engine) = watch {
                visitor.push(engine.visitor());
            }
            run_suite(&mut visitor, &envs, runners, enumeration.traces, self.seed).await
        }
        .await;

        if let Err(err) = context.close().await {
            warn!(runner = %plan.runner, error = %err, "failed to close worker context");
        }
        outcome
    }
}
