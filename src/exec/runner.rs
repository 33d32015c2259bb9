// src/exec/runner.rs

//! The unit of work the scheduler hands to a worker slot.

use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};

use tracing::debug;

use crate::errors::{QaError, Result};
use crate::protocol::{
    Dependencies, FilePath, SuiteBegin, SuiteFinish, TestBegin, TestFilter, TestFinish, TraceEvent,
    Visitor,
};

use super::context::Context;

/// Environment variables for one worker slot.
pub type WorkerEnv = BTreeMap<String, String>;

pub type RunFuture<'a> = Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;

/// Files one filter's most recent execution loaded or missed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestDependencyEntry {
    pub label: String,
    pub file: FilePath,
    pub filter: TestFilter,
    pub dependencies: Dependencies,
}

/// A test known from enumeration.
#[derive(Debug, Clone, PartialEq)]
pub struct PlannedTest {
    pub label: String,
    pub filter: TestFilter,
    pub file: Option<FilePath>,
    pub dependencies: Option<Dependencies>,
}

impl From<&TestFinish> for PlannedTest {
    fn from(test: &TestFinish) -> Self {
        Self {
            label: test.full_label(),
            filter: test.filter.clone(),
            file: test.file.clone(),
            dependencies: test.dependencies.clone(),
        }
    }
}

/// One or more filters executed together in a single worker invocation.
pub trait TestRunner: Send + Sync {
    fn tests(&self) -> &[PlannedTest];

    fn test_count(&self) -> usize {
        self.tests().len()
    }

    /// Execute every test, streaming events into `sink`.
    ///
    /// An `Err` means the transport failed, not that a test failed.
    fn run(&self, env: WorkerEnv, sink: Box<dyn Visitor>) -> RunFuture<'_>;

    /// Dependency entries for the tests that reported them during enumeration.
    fn dependencies(&self) -> Vec<TestDependencyEntry> {
        self.tests()
            .iter()
            .filter_map(|t| {
                Some(TestDependencyEntry {
                    label: t.label.clone(),
                    file: t.file.clone()?,
                    filter: t.filter.clone(),
                    dependencies: t.dependencies.clone()?,
                })
            })
            .collect()
    }
}

/// Runner backed by a persistent worker [`Context`].
pub struct WorkerRunner {
    context: Arc<Context>,
    tests: Vec<PlannedTest>,
}

impl std::fmt::Debug for WorkerRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerRunner")
            .field("context", &self.context.name())
            .field("tests", &self.tests.len())
            .finish()
    }
}

impl WorkerRunner {
    pub fn new(context: Arc<Context>, tests: Vec<PlannedTest>) -> Self {
        Self { context, tests }
    }

    fn filters(&self) -> Vec<TestFilter> {
        self.tests.iter().map(|t| t.filter.clone()).collect()
    }
}

impl TestRunner for WorkerRunner {
    fn tests(&self) -> &[PlannedTest] {
        &self.tests
    }

    fn run(&self, env: WorkerEnv, sink: Box<dyn Visitor>) -> RunFuture<'_> {
        Box::pin(async move {
            let filters = self.filters();
            let unfinished = Arc::new(Mutex::new(filters.clone()));
            let debiting = DebitingVisitor {
                unstarted: filters.clone(),
                unfinished: Arc::clone(&unfinished),
                inner: sink,
            };

            let args: Vec<String> = filters.iter().map(|f| f.to_string()).collect();
            self.context.stream(env, &[], args, Box::new(debiting)).await?;

            let never_seen = unfinished.lock().unwrap_or_else(PoisonError::into_inner).clone();
            if !never_seen.is_empty() {
                let names: Vec<&str> = never_seen.iter().map(|f| f.as_str()).collect();
                return Err(QaError::Transport(format!(
                    "Runner finished without emitting all expected tests. Never saw: {names:?}"
                )));
            }
            Ok(())
        })
    }
}

/// Checks that a worker only reports the filters it was asked for, each once.
struct DebitingVisitor {
    unstarted: Vec<TestFilter>,
    unfinished: Arc<Mutex<Vec<TestFilter>>>,
    inner: Box<dyn Visitor>,
}

fn debit(filters: &mut Vec<TestFilter>, filter: &TestFilter) -> Result<()> {
    match filters.iter().position(|f| f == filter) {
        Some(ix) => {
            filters.remove(ix);
            Ok(())
        }
        None => {
            let expected: Vec<&str> = filters.iter().map(|f| f.as_str()).collect();
            Err(QaError::Transport(format!(
                "Unexpected test filter: {filter}. Expected one of {expected:?}"
            )))
        }
    }
}

impl Visitor for DebitingVisitor {
    fn suite_begin(&mut self, suite: &SuiteBegin) -> Result<()> {
        debug!(count = suite.total_count, "worker suite started");
        Ok(())
    }

    fn test_begin(&mut self, test: &TestBegin) -> Result<()> {
        debit(&mut self.unstarted, &test.filter)?;
        self.inner.test_begin(test)
    }

    fn test_finish(&mut self, test: &TestFinish) -> Result<()> {
        {
            let mut unfinished = self.unfinished.lock().unwrap_or_else(PoisonError::into_inner);
            debit(&mut unfinished, &test.filter)?;
        }
        self.inner.test_finish(test)
    }

    fn trace(&mut self, trace: &TraceEvent) -> Result<()> {
        self.inner.trace(trace)
    }

    fn suite_finish(&mut self, _finish: &SuiteFinish) -> Result<()> {
        Ok(())
    }
}
