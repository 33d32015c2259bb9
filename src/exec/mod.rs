// src/exec/mod.rs

//! Worker processes and the runners built on top of them.

pub mod context;
pub mod files;
pub mod runner;

pub use context::{Context, ContextSpec, Enumeration, squash};
pub use files::{build_globset, list_test_files};
pub use runner::{
    PlannedTest, RunFuture, TestDependencyEntry, TestRunner, WorkerEnv, WorkerRunner,
};

/// Environment for worker slot `index`.
pub fn worker_env(index: usize) -> WorkerEnv {
    WorkerEnv::from([("QA_WORKER".to_string(), index.to_string())])
}

/// One environment per worker slot.
pub fn worker_envs(workers: usize) -> Vec<WorkerEnv> {
    (0..workers).map(worker_env).collect()
}
