use std::sync::{Arc, Mutex};
use std::time::Duration;

use qa::errors::QaError;
use qa::exec::{PlannedTest, RunFuture, TestRunner, WorkerEnv};
use qa::protocol::{FilePath, Status, TestBegin, TestFilter, TestFinish, Visitor};

/// Shared record of runner names in the order they started.
pub type StartLog = Arc<Mutex<Vec<String>>>;

/// A runner that reports scripted results without any worker process.
pub struct FakeRunner {
    name: String,
    tests: Vec<PlannedTest>,
    status: Status,
    delay: Duration,
    failure: Option<String>,
    started: StartLog,
}

impl FakeRunner {
    /// `count` passing tests named `<name>:<n>` in file `<name>.rb`.
    pub fn new(name: &str, count: usize) -> Self {
        let tests = (1..=count)
            .map(|n| PlannedTest {
                label: format!("{name} #{n}"),
                filter: TestFilter::new(format!("{name}:{n}")),
                file: Some(FilePath::from(format!("{name}.rb"))),
                dependencies: None,
            })
            .collect();
        Self {
            name: name.to_string(),
            tests,
            status: Status::Pass,
            delay: Duration::ZERO,
            failure: None,
            started: StartLog::default(),
        }
    }

    pub fn status(mut self, status: Status) -> Self {
        self.status = status;
        self
    }

    /// Sleep this long before reporting anything.
    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Fail the transport after the delay, before reporting any test.
    pub fn failing(mut self, message: &str) -> Self {
        self.failure = Some(message.to_string());
        self
    }

    pub fn log_starts(mut self, started: &StartLog) -> Self {
        self.started = Arc::clone(started);
        self
    }

    pub fn into_arc(self) -> Arc<dyn TestRunner> {
        Arc::new(self)
    }
}

impl TestRunner for FakeRunner {
    fn tests(&self) -> &[PlannedTest] {
        &self.tests
    }

    fn run(&self, _env: WorkerEnv, mut sink: Box<dyn Visitor>) -> RunFuture<'_> {
        Box::pin(async move {
            self.started.lock().unwrap().push(self.name.clone());
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            if let Some(message) = &self.failure {
                return Err(QaError::Transport(message.clone()));
            }
            for test in self.tests.iter() {
                sink.test_begin(&TestBegin {
                    label: test.label.clone(),
                    filter: test.filter.clone(),
                    file: test.file.clone(),
                    ..TestBegin::default()
                })?;
                let mut finish = TestFinish::new(test.label.clone(), test.filter.clone(), self.status);
                finish.file = test.file.clone();
                sink.test_finish(&finish)?;
            }
            Ok(())
        })
    }
}
