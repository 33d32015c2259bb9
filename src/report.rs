// src/report.rs

//! Human-facing suite output.
//!
//! Per-test detail goes through `tracing` on stderr; the summary lines go to
//! stdout so they survive `QA_LOG=error`.

use std::io::Write;

use tracing::{debug, warn};

use crate::errors::Result;
use crate::protocol::{Status, SuiteBegin, SuiteFinish, TestFinish, Visitor};

/// Collects failing tests and prints a summary at suite end.
#[derive(Debug)]
pub struct SummaryReporter<W: Write + Send = std::io::Stdout> {
    runner: String,
    out: W,
    failures: Vec<(String, Status, String)>,
}

impl SummaryReporter {
    pub fn new(runner: impl Into<String>) -> Self {
        Self::with_writer(runner, std::io::stdout())
    }
}

impl<W: Write + Send> SummaryReporter<W> {
    pub fn with_writer(runner: impl Into<String>, out: W) -> Self {
        Self {
            runner: runner.into(),
            out,
            failures: Vec::new(),
        }
    }

    pub fn into_writer(self) -> W {
        self.out
    }
}

impl<W: Write + Send> Visitor for SummaryReporter<W> {
    fn suite_begin(&mut self, suite: &SuiteBegin) -> Result<()> {
        writeln!(
            self.out,
            "[{}] running {} tests (seed {})",
            self.runner, suite.total_count, suite.seed
        )?;
        Ok(())
    }

    fn test_finish(&mut self, test: &TestFinish) -> Result<()> {
        let label = test.full_label();
        if !test.status.is_failure() {
            debug!(runner = %self.runner, %label, status = ?test.status, "test finished");
            return Ok(());
        }
        let message = test
            .exception
            .as_ref()
            .map(|e| e.message.clone())
            .unwrap_or_default();
        warn!(runner = %self.runner, %label, status = ?test.status, %message, "test failed");
        self.failures.push((label, test.status, message));
        Ok(())
    }

    fn suite_finish(&mut self, finish: &SuiteFinish) -> Result<()> {
        for (label, status, message) in self.failures.iter() {
            if message.is_empty() {
                writeln!(self.out, "  {status:?}: {label}")?;
            } else {
                writeln!(self.out, "  {status:?}: {label}: {message}")?;
            }
        }
        writeln!(
            self.out,
            "[{}] {} in {:.2}s",
            self.runner, finish.tally, finish.time
        )?;
        self.out.flush()?;
        self.failures.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Exception, ResultTally, TestFilter};

    #[test]
    fn summary_lists_failures_then_tally() {
        let mut reporter = SummaryReporter::with_writer("unit", Vec::new());
        reporter
            .test_finish(&TestFinish::new("adds", TestFilter::new("a.rb:1"), Status::Pass))
            .unwrap();
        let mut failed = TestFinish::new("divides", TestFilter::new("a.rb:9"), Status::Fail);
        failed.exception = Some(Exception {
            message: "expected 2".to_string(),
            ..Exception::default()
        });
        reporter.test_finish(&failed).unwrap();

        let mut tally = ResultTally::default();
        tally.increment(Status::Pass);
        tally.increment(Status::Fail);
        reporter
            .suite_finish(&SuiteFinish {
                time: 1.5,
                tally,
                suite: SuiteBegin::default(),
            })
            .unwrap();

        let out = String::from_utf8(reporter.into_writer()).unwrap();
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines[0], "  Fail: divides: expected 2");
        assert!(lines[1].starts_with("[unit] "));
        assert!(lines[1].ends_with("in 1.50s"));
    }
}
