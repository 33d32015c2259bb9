// src/exec/context.rs

//! Persistent worker processes.
//!
//! A context is one adapter process that dials the coordination server for a
//! stream of job requests instead of exiting after a single unit of work.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex, PoisonError};

use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

use crate::config::{RunnerConfig, SquashPolicy};
use crate::errors::{QaError, Result};
use crate::protocol::{Callbacks, FilePath, TestFilter, TestFinish, TraceEvent, Visitor};
use crate::server::Server;

use super::runner::{PlannedTest, TestRunner, WorkerEnv, WorkerRunner};

/// Pending requests a context may hold before senders wait.
const REQUEST_QUEUE_LEN: usize = 16;

/// Everything needed to start one worker process.
#[derive(Debug, Clone)]
pub struct ContextSpec {
    pub name: String,
    pub command: Vec<String>,
    pub dir: PathBuf,
    pub env: BTreeMap<String, String>,
    pub passthrough: serde_json::Value,
    pub seed: i64,
    pub squash: SquashPolicy,
}

impl ContextSpec {
    pub fn from_config(name: &str, cfg: &RunnerConfig, dir: PathBuf, seed: i64) -> Result<Self> {
        Ok(Self {
            name: name.to_string(),
            command: cfg.command.clone(),
            dir,
            env: cfg.env.clone(),
            passthrough: serde_json::to_value(&cfg.passthrough)?,
            seed,
            squash: cfg.squash,
        })
    }
}

/// First message on every request queue.
#[derive(Debug, Serialize)]
struct InitMessage<'a> {
    #[serde(rename = "workerEnvs")]
    worker_envs: &'a [WorkerEnv],
    files: &'a [FilePath],
    passthrough: &'a serde_json::Value,
}

/// Subsequent messages: `[env, args]`.
#[derive(Debug, Serialize)]
struct JobRequest<'a>(&'a WorkerEnv, &'a [String]);

/// Output of a dry run.
pub struct Enumeration {
    pub traces: Vec<TraceEvent>,
    pub runners: Vec<Arc<dyn TestRunner>>,
}

pub struct Context {
    spec: ContextSpec,
    server: Server,
    requests: Mutex<Option<mpsc::Sender<String>>>,
    /// Set to the exit description once the worker process is gone.
    exited: watch::Receiver<Option<String>>,
    /// Dropping this kills a still-running worker.
    _reaper: oneshot::Sender<()>,
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("name", &self.spec.name)
            .finish_non_exhaustive()
    }
}

impl Context {
    /// Spawn the worker and queue its init message.
    ///
    /// The process is killed if the context is dropped without `close`.
    pub async fn start(
        server: &Server,
        spec: ContextSpec,
        worker_envs: &[WorkerEnv],
        files: &[FilePath],
    ) -> Result<Arc<Self>> {
        let Some((program, program_args)) = spec.command.split_first() else {
            return Err(QaError::ConfigError(format!(
                "runner '{}' has an empty command",
                spec.name
            )));
        };

        let (tx, rx) = mpsc::channel(REQUEST_QUEUE_LEN);
        let (address, completion) = server.expose(rx).await?;

        let init = serde_json::to_string(&InitMessage {
            worker_envs,
            files,
            passthrough: &spec.passthrough,
        })?;
        tx.send(init)
            .await
            .map_err(|_| QaError::Transport("request queue closed before init".to_string()))?;

        let mut cmd = Command::new(program);
        cmd.args(program_args)
            .arg(address.to_string())
            .envs(&spec.env)
            .current_dir(&spec.dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(source) => {
                let _ = server.cancel(&address);
                return Err(QaError::Spawn {
                    command: spec.command.join(" "),
                    source,
                });
            }
        };

        info!(
            runner = %spec.name,
            pid = child.id().unwrap_or_default(),
            files = files.len(),
            "worker context started"
        );

        if let Some(stdout) = child.stdout.take() {
            drain_lines(spec.name.clone(), "stdout", stdout);
        }
        if let Some(stderr) = child.stderr.take() {
            drain_lines(spec.name.clone(), "stderr", stderr);
        }

        let name = spec.name.clone();
        tokio::spawn(async move {
            match completion.await {
                Ok(Ok(())) => debug!(runner = %name, "request queue drained"),
                Ok(Err(err)) => debug!(runner = %name, error = %err, "request queue ended"),
                Err(_) => {}
            }
        });

        let (exit_tx, exited) = watch::channel(None);
        let (reaper, dropped) = oneshot::channel();
        tokio::spawn(reap(spec.name.clone(), child, dropped, exit_tx));

        Ok(Arc::new(Self {
            spec,
            server: server.clone(),
            requests: Mutex::new(Some(tx)),
            exited,
            _reaper: reaper,
        }))
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn spec(&self) -> &ContextSpec {
        &self.spec
    }

    /// Queue one job and stream its events into `visitor`.
    ///
    /// Resolves once the worker's event stream ends. `prefix` is placed before
    /// the seed and sink arguments, `extra` after them.
    pub async fn stream(
        &self,
        env: WorkerEnv,
        prefix: &[&str],
        extra: Vec<String>,
        visitor: Box<dyn Visitor>,
    ) -> Result<()> {
        let (sink, completion) = self.server.decode(visitor).await?;

        let mut args: Vec<String> = prefix.iter().map(|s| s.to_string()).collect();
        args.push("--seed".to_string());
        args.push(self.spec.seed.to_string());
        args.push("--tapj-sink".to_string());
        args.push(sink.to_string());
        args.extend(extra);

        if let Err(err) = self.request(&env, &args).await {
            let _ = self.server.cancel(&sink);
            return Err(err);
        }

        let mut exited = self.exited.clone();
        tokio::select! {
            biased;
            result = completion => {
                result.map_err(|_| QaError::Transport(format!("sink {sink} dropped without a result")))?
            }
            status = exited.wait_for(Option::is_some) => {
                let _ = self.server.cancel(&sink);
                let status = status.ok().and_then(|s| s.clone()).unwrap_or_default();
                Err(QaError::Transport(format!(
                    "worker '{}' {status} before finishing its job",
                    self.spec.name
                )))
            }
        }
    }

    async fn request(&self, env: &WorkerEnv, args: &[String]) -> Result<()> {
        let message = serde_json::to_string(&JobRequest(env, args))?;
        let tx = self
            .requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or_else(|| QaError::Transport(format!("context '{}' is closed", self.spec.name)))?;
        tx.send(message)
            .await
            .map_err(|_| QaError::Transport(format!("context '{}' stopped reading requests", self.spec.name)))
    }

    /// Dry-run every file and group the discovered tests into runners.
    ///
    /// With a non-empty `filters`, only those tests are kept.
    pub async fn enumerate(self: &Arc<Self>, filters: &[TestFilter]) -> Result<Enumeration> {
        let tests = Arc::new(Mutex::new(Vec::<TestFinish>::new()));
        let traces = Arc::new(Mutex::new(Vec::<TraceEvent>::new()));

        let visitor = Callbacks {
            on_test_finish: Some(Box::new({
                let tests = Arc::clone(&tests);
                move |t: &TestFinish| {
                    tests.lock().unwrap_or_else(PoisonError::into_inner).push(t.clone());
                    Ok(())
                }
            })),
            on_trace: Some(Box::new({
                let traces = Arc::clone(&traces);
                move |t: &TraceEvent| {
                    traces.lock().unwrap_or_else(PoisonError::into_inner).push(t.clone());
                    Ok(())
                }
            })),
            ..Callbacks::default()
        };

        self.stream(WorkerEnv::new(), &["--dry-run"], Vec::new(), Box::new(visitor))
            .await?;

        let tests = std::mem::take(&mut *tests.lock().unwrap_or_else(PoisonError::into_inner));
        let traces = std::mem::take(&mut *traces.lock().unwrap_or_else(PoisonError::into_inner));

        let planned: Vec<PlannedTest> = tests
            .iter()
            .filter(|t| filters.is_empty() || filters.contains(&t.filter))
            .map(PlannedTest::from)
            .collect();

        let runners = squash(planned, self.spec.squash)
            .into_iter()
            .map(|group| Arc::new(WorkerRunner::new(Arc::clone(self), group)) as Arc<dyn TestRunner>)
            .collect::<Vec<_>>();

        info!(
            runner = %self.spec.name,
            tests = tests.len(),
            runners = runners.len(),
            "enumerated tests"
        );
        Ok(Enumeration { traces, runners })
    }

    /// Close the request queue and wait for the worker to exit.
    pub async fn close(&self) -> Result<()> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let mut exited = self.exited.clone();
        let status = exited
            .wait_for(Option::is_some)
            .await
            .map_err(|_| QaError::Transport(format!("lost track of worker '{}'", self.spec.name)))?
            .clone()
            .unwrap_or_default();
        debug!(runner = %self.spec.name, %status, "worker context closed");
        Ok(())
    }
}

/// Wait for the worker to exit, killing it first if its context is dropped.
async fn reap(
    runner: String,
    mut child: Child,
    dropped: oneshot::Receiver<()>,
    exit_tx: watch::Sender<Option<String>>,
) {
    let status = tokio::select! {
        status = child.wait() => status,
        _ = dropped => {
            debug!(runner = %runner, "context dropped; killing worker");
            if let Err(err) = child.kill().await {
                warn!(runner = %runner, error = %err, "failed to kill worker");
            }
            child.wait().await
        }
    };
    let description = match status {
        Ok(status) if status.success() => "exited".to_string(),
        Ok(status) => format!("exited with {status}"),
        Err(err) => format!("could not be waited on ({err})"),
    };
    debug!(runner = %runner, status = %description, "worker process ended");
    let _ = exit_tx.send(Some(description));
}

/// Group enumerated tests into runner-sized batches.
pub fn squash(tests: Vec<PlannedTest>, policy: SquashPolicy) -> Vec<Vec<PlannedTest>> {
    let mut groups: Vec<Vec<PlannedTest>> = Vec::new();
    for test in tests {
        let start_new = match (policy, groups.last()) {
            (_, None) => true,
            (SquashPolicy::Nothing, Some(_)) => true,
            (SquashPolicy::File, Some(current)) => current[0].file != test.file,
            (SquashPolicy::All, Some(_)) => false,
        };
        if start_new {
            groups.push(vec![test]);
        } else if let Some(current) = groups.last_mut() {
            current.push(test);
        }
    }
    groups
}

fn drain_lines<R>(runner: String, stream: &'static str, reader: R)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => debug!(runner = %runner, stream, "{}", line),
                Ok(None) => break,
                Err(err) => {
                    warn!(runner = %runner, stream, error = %err, "failed reading worker output");
                    break;
                }
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn planned(file: &str, line: u32) -> PlannedTest {
        PlannedTest {
            label: format!("test {line}"),
            filter: TestFilter::new(format!("{file}:{line}")),
            file: Some(FilePath::from(file)),
            dependencies: None,
        }
    }

    fn sizes(groups: &[Vec<PlannedTest>]) -> Vec<usize> {
        groups.iter().map(|g| g.len()).collect()
    }

    #[test]
    fn squash_policies_group_tests() {
        let tests = vec![planned("a", 1), planned("a", 2), planned("b", 1), planned("a", 3)];

        assert_eq!(sizes(&squash(tests.clone(), SquashPolicy::Nothing)), vec![1, 1, 1, 1]);
        assert_eq!(sizes(&squash(tests.clone(), SquashPolicy::File)), vec![2, 1, 1]);
        assert_eq!(sizes(&squash(tests, SquashPolicy::All)), vec![4]);
        assert!(squash(Vec::new(), SquashPolicy::All).is_empty());
    }
}
