// src/lib.rs

pub mod cli;
pub mod config;
pub mod engine;
pub mod errors;
pub mod exec;
pub mod fs;
pub mod logging;
pub mod protocol;
pub mod report;
pub mod scheduler;
pub mod server;
pub mod watch;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Result, bail};
use rand::Rng;
use tokio::sync::mpsc;
use tracing::info;

use crate::cli::{CliArgs, Command};
use crate::config::{ConfigFile, load_and_validate};
use crate::engine::{Runtime, RuntimeEvent, Session};
use crate::fs::{FileSystem, RealFileSystem};
use crate::protocol::ResultTally;
use crate::report::SummaryReporter;
use crate::server::Server;
use crate::watch::{NotifyBackend, WatchBackend, WatchEngine, WatchScope};

/// High-level entry point used by `main.rs`.
///
/// Returns the combined tally of `qa run`, or the tally of the last suite
/// `qa auto` ran before shutdown.
pub async fn run(args: CliArgs) -> Result<ResultTally> {
    let config_path = PathBuf::from(&args.config);
    let cfg = Arc::new(load_and_validate(&config_path)?);
    let run_args = args.command.args();

    let runners = selected_runners(&cfg, &run_args.runners)?;
    if run_args.workers == Some(0) {
        bail!("--workers must be >= 1");
    }
    let seed = run_args
        .seed
        .or(cfg.run.seed)
        .unwrap_or_else(|| rand::rng().random_range(0..100_000));

    let server = Server::bind_loopback().await?;
    let fs: Arc<dyn FileSystem> = Arc::new(RealFileSystem);
    let mut session =
        Session::new(server, Arc::clone(&cfg), Arc::clone(&fs), seed).with_squash(run_args.squash);
    if let Some(workers) = run_args.workers {
        session = session.with_workers(workers);
    }

    info!(
        seed,
        workers = session.workers(),
        dir = %cfg.run.dir.display(),
        ?runners,
        "qa starting"
    );

    match &args.command {
        Command::Run(_) => run_once(&session, &runners).await,
        Command::Auto(_) => run_auto(session, fs, &runners).await,
    }
}

/// Requested runners in config order, or all of them.
fn selected_runners(cfg: &ConfigFile, requested: &[String]) -> Result<Vec<String>> {
    if requested.is_empty() {
        return Ok(cfg.runner.keys().cloned().collect());
    }
    for name in requested {
        if !cfg.runner.contains_key(name) {
            bail!("unknown runner '{name}' (configured: {:?})", cfg.runner.keys().collect::<Vec<_>>());
        }
    }
    Ok(cfg
        .runner
        .keys()
        .filter(|name| requested.contains(name))
        .cloned()
        .collect())
}

async fn run_once(session: &Session, runners: &[String]) -> Result<ResultTally> {
    let mut total = ResultTally::default();
    let outcome = async {
        for name in runners {
            let plan = session.full_plan(name)?;
            let tally = session
                .run(&plan, Box::new(SummaryReporter::new(name.clone())), None)
                .await?;
            total.merge(&tally);
        }
        Ok::<_, anyhow::Error>(())
    }
    .await;
    session.server().close().await;
    outcome.map(|()| total)
}

async fn run_auto(session: Session, fs: Arc<dyn FileSystem>, runners: &[String]) -> Result<ResultTally> {
    let cfg = session.config().clone();
    let (rt_tx, rt_rx) = mpsc::channel::<RuntimeEvent>(64);
    let scope = WatchScope::new(cfg.run.dir.clone(), cfg.run.ignore_dirs.clone());

    let mut backend = NotifyBackend::new();
    let mut runtime = Runtime::new(session.clone(), rt_rx);

    for name in runners {
        let patterns = cfg.runner[name].patterns.clone();
        let engine = WatchEngine::new(name.clone(), scope.clone(), patterns, Arc::clone(&fs))?;
        let (subscription, events) = backend.subscribe(&cfg.run.dir, name, engine.expression())?;
        engine.attach(subscription);

        engine.spawn(events, rt_tx.clone());

        rt_tx
            .send(RuntimeEvent::RunRequested(session.full_plan(name)?))
            .await?;
        runtime = runtime.with_engine(engine);
    }
    runtime = runtime.with_backend(Box::new(backend));

    // Ctrl-C → graceful shutdown.
    {
        let tx = rt_tx.clone();
        tokio::spawn(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                eprintln!("failed to listen for Ctrl+C: {e}");
                return;
            }
            let _ = tx.send(RuntimeEvent::ShutdownRequested).await;
        });
    }
    drop(rt_tx);

    Ok(runtime.run().await?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::load_from_str;

    fn config() -> ConfigFile {
        let raw = load_from_str(
            r#"
[runner.unit]
command = ["bin/worker"]
patterns = ["test/**/*_test.rb"]

[runner.spec]
command = ["bin/worker"]
patterns = ["spec/**/*_spec.rb"]
"#,
        )
        .unwrap();
        ConfigFile::try_from(raw).unwrap()
    }

    #[test]
    fn selected_runners_defaults_to_all_in_config_order() {
        let cfg = config();
        assert_eq!(selected_runners(&cfg, &[]).unwrap(), vec!["spec", "unit"]);
        assert_eq!(
            selected_runners(&cfg, &["unit".to_string()]).unwrap(),
            vec!["unit"]
        );
    }

    #[test]
    fn selected_runners_rejects_unknown_names() {
        let err = selected_runners(&config(), &["bench".to_string()]).unwrap_err();
        assert!(err.to_string().contains("unknown runner 'bench'"));
    }
}
