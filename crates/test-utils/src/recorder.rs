use std::sync::{Arc, Mutex};

use qa::errors::{QaError, Result};
use qa::protocol::{SuiteBegin, SuiteFinish, TestBegin, TestFinish, TraceEvent, Visitor};

/// Everything a [`Recorder`] has seen.
#[derive(Debug, Clone, Default)]
pub struct Recorded {
    pub suites: Vec<SuiteBegin>,
    pub begins: Vec<TestBegin>,
    pub finishes: Vec<TestFinish>,
    pub traces: Vec<TraceEvent>,
    pub suite_finishes: Vec<SuiteFinish>,
    /// One entry per `end` call: the error message, if any.
    pub ends: Vec<Option<String>>,
}

/// Visitor that stores every event. Clones share the same log.
#[derive(Debug, Clone, Default)]
pub struct Recorder {
    log: Arc<Mutex<Recorded>>,
    fail_after_finishes: Option<usize>,
}

impl Recorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return an error from `test_finish` once `n` finishes were recorded.
    pub fn failing_after(n: usize) -> Self {
        Self {
            fail_after_finishes: Some(n),
            ..Self::default()
        }
    }

    pub fn boxed(&self) -> Box<dyn Visitor> {
        Box::new(self.clone())
    }

    pub fn recorded(&self) -> Recorded {
        self.log.lock().unwrap().clone()
    }

    pub fn finish_labels(&self) -> Vec<String> {
        self.log
            .lock()
            .unwrap()
            .finishes
            .iter()
            .map(|f| f.label.clone())
            .collect()
    }
}

impl Visitor for Recorder {
    fn suite_begin(&mut self, suite: &SuiteBegin) -> Result<()> {
        self.log.lock().unwrap().suites.push(suite.clone());
        Ok(())
    }

    fn test_begin(&mut self, test: &TestBegin) -> Result<()> {
        self.log.lock().unwrap().begins.push(test.clone());
        Ok(())
    }

    fn test_finish(&mut self, test: &TestFinish) -> Result<()> {
        let mut log = self.log.lock().unwrap();
        if self.fail_after_finishes == Some(log.finishes.len()) {
            return Err(QaError::Transport("recorder refused test".to_string()));
        }
        log.finishes.push(test.clone());
        Ok(())
    }

    fn trace(&mut self, trace: &TraceEvent) -> Result<()> {
        self.log.lock().unwrap().traces.push(trace.clone());
        Ok(())
    }

    fn suite_finish(&mut self, finish: &SuiteFinish) -> Result<()> {
        self.log.lock().unwrap().suite_finishes.push(finish.clone());
        Ok(())
    }

    fn end(&mut self, error: Option<&QaError>) {
        self.log.lock().unwrap().ends.push(error.map(|e| e.to_string()));
    }
}
