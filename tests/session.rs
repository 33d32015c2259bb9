// tests/session.rs

mod common;
use crate::common::builders::{ConfigFileBuilder, RunnerConfigBuilder};
use crate::common::recorder::Recorder;
use crate::common::{init_tracing, with_timeout};

use std::error::Error;
use std::fs;
use std::sync::Arc;

use tempfile::tempdir;

use qa::config::ConfigFile;
use qa::engine::{RunPlan, Session};
use qa::errors::QaError;
use qa::fs::RealFileSystem;
use qa::protocol::FilePath;
use qa::server::Server;

type TestResult = Result<(), Box<dyn Error>>;

fn config(dir: &std::path::Path, command: &[&str]) -> ConfigFile {
    ConfigFileBuilder::new()
        .with_dir(dir)
        .with_workers(2)
        .with_runner(
            "unit",
            RunnerConfigBuilder::new(command)
                .pattern("test/**/*_test.rb")
                .build(),
        )
        .build()
}

async fn session(cfg: ConfigFile) -> Result<Session, QaError> {
    let server = Server::bind_loopback().await?;
    Ok(Session::new(server, Arc::new(cfg), Arc::new(RealFileSystem), 7))
}

#[tokio::test]
async fn test_full_plan_lists_matching_test_files() -> TestResult {
    init_tracing();
    let root = tempdir()?;
    fs::create_dir_all(root.path().join("test/models"))?;
    fs::write(root.path().join("test/a_test.rb"), "")?;
    fs::write(root.path().join("test/models/b_test.rb"), "")?;
    fs::write(root.path().join("test/test_helper.rb"), "")?;

    let session = session(config(root.path(), &["worker"])).await?;
    let plan = session.full_plan("unit")?;

    assert_eq!(
        plan.files,
        vec![
            FilePath::from(root.path().join("test/a_test.rb")),
            FilePath::from(root.path().join("test/models/b_test.rb")),
        ]
    );
    assert!(plan.filters.is_empty());
    assert_eq!(plan.squash, None);
    assert_eq!(session.workers(), 2);
    assert_eq!(session.seed(), 7);
    Ok(())
}

#[tokio::test]
async fn test_unknown_runner_is_a_config_error() -> TestResult {
    let root = tempdir()?;
    let session = session(config(root.path(), &["worker"])).await?;

    assert!(matches!(session.full_plan("bench"), Err(QaError::ConfigError(_))));
    let result = session
        .run(&RunPlan::full("bench", Vec::new()), Recorder::new().boxed(), None)
        .await;
    assert!(matches!(result, Err(QaError::ConfigError(_))));
    Ok(())
}

#[tokio::test]
async fn test_missing_worker_binary_fails_to_spawn() -> TestResult {
    init_tracing();
    let root = tempdir()?;
    let session = session(config(root.path(), &["./definitely-not-a-qa-worker"])).await?;

    let result = session
        .run(&RunPlan::full("unit", Vec::new()), Recorder::new().boxed(), None)
        .await;

    match result {
        Err(QaError::Spawn { command, .. }) => assert_eq!(command, "./definitely-not-a-qa-worker"),
        other => panic!("Expected Spawn error, got: {:?}", other),
    }
    Ok(())
}

#[cfg(unix)]
#[tokio::test]
async fn test_worker_exiting_early_fails_the_run() -> TestResult {
    init_tracing();
    let root = tempdir()?;
    let session = session(config(root.path(), &["sh", "-c", "exit 3", "worker"])).await?;
    let recorder = Recorder::new();

    let result = with_timeout(session.run(
        &RunPlan::full("unit", Vec::new()),
        recorder.boxed(),
        None,
    ))
    .await;

    match result {
        Err(QaError::Transport(msg)) => {
            assert!(msg.contains("worker 'unit' exited with"), "{msg}");
            assert!(msg.contains("before finishing its job"), "{msg}");
        }
        other => panic!("Expected Transport error, got: {:?}", other),
    }
    // Enumeration failed, so no suite was ever started.
    assert!(recorder.recorded().suites.is_empty());
    Ok(())
}
