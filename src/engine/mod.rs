// src/engine/mod.rs

//! Orchestration for `qa`.
//!
//! A [`Session`] turns one [`RunPlan`] into worker contexts, an enumeration,
//! and a scheduled suite. The [`Runtime`] is the auto-mode loop that executes
//! plans one at a time as the watch engines request them.

use crate::config::SquashPolicy;
use crate::errors::QaError;
use crate::protocol::{FilePath, TestFilter};

pub mod runtime;
pub mod session;

pub use runtime::Runtime;
pub use session::Session;

/// One requested suite run for a single runner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunPlan {
    pub runner: String,
    /// Test files handed to the worker.
    pub files: Vec<FilePath>,
    /// Keep only these tests. Empty keeps everything enumerated.
    pub filters: Vec<TestFilter>,
    /// Grouping override. `None` uses the runner's configured policy.
    pub squash: Option<SquashPolicy>,
}

impl RunPlan {
    /// Every test in `files`, grouped the runner's way.
    pub fn full(runner: impl Into<String>, files: Vec<FilePath>) -> Self {
        Self {
            runner: runner.into(),
            files,
            filters: Vec::new(),
            squash: None,
        }
    }

    /// Every test in `files`, as a watch re-run.
    pub fn files(runner: impl Into<String>, files: Vec<FilePath>) -> Self {
        let squash = Some(rerun_squash(&files));
        Self {
            runner: runner.into(),
            files,
            filters: Vec::new(),
            squash,
        }
    }

    /// Only `filters`, enumerated from `files`.
    pub fn filtered(runner: impl Into<String>, files: Vec<FilePath>, filters: Vec<TestFilter>) -> Self {
        let squash = Some(rerun_squash(&files));
        Self {
            runner: runner.into(),
            files,
            filters,
            squash,
        }
    }

    pub fn is_filtered(&self) -> bool {
        !self.filters.is_empty()
    }
}

/// Re-runs touching several files keep per-file grouping; a single file is
/// spread test by test across the workers.
fn rerun_squash(files: &[FilePath]) -> SquashPolicy {
    if files.len() > 1 {
        SquashPolicy::File
    } else {
        SquashPolicy::Nothing
    }
}

/// Events flowing into the auto-mode runtime.
#[derive(Debug)]
pub enum RuntimeEvent {
    /// A watch engine (or startup) wants a suite run.
    RunRequested(RunPlan),
    /// Graceful shutdown requested (e.g. Ctrl-C).
    ShutdownRequested,
    /// A watch engine stopped on an error. The runtime shuts down and
    /// returns it.
    Failed { runner: String, error: QaError },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_file_rerun_spreads_tests() {
        let plan = RunPlan::files("unit", vec![FilePath::from("/p/a_test.rb")]);
        assert_eq!(plan.squash, Some(SquashPolicy::Nothing));
        assert!(!plan.is_filtered());
    }

    #[test]
    fn multi_file_rerun_groups_by_file() {
        let plan = RunPlan::filtered(
            "unit",
            vec![FilePath::from("/p/a_test.rb"), FilePath::from("/p/b_test.rb")],
            vec![TestFilter::new("a_test.rb:3")],
        );
        assert_eq!(plan.squash, Some(SquashPolicy::File));
        assert!(plan.is_filtered());
    }

    #[test]
    fn full_plan_defers_to_runner_policy() {
        let plan = RunPlan::full("unit", Vec::new());
        assert_eq!(plan.squash, None);
    }
}
