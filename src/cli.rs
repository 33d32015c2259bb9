// src/cli.rs

//! CLI argument parsing using `clap`.

use clap::{Args, Parser, Subcommand, ValueEnum};

use crate::config::SquashPolicy;

/// Command-line arguments for `qa`.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "qa",
    version,
    about = "Run test suites across persistent workers, and re-run what changes touch.",
    long_about = None
)]
pub struct CliArgs {
    /// Path to the config file (TOML).
    #[arg(long, global = true, value_name = "PATH", default_value = "qa.toml")]
    pub config: String,

    /// Logging level (error, warn, info, debug, trace).
    ///
    /// If omitted, `QA_LOG` or a default level will be used.
    #[arg(long, global = true, value_enum, value_name = "LEVEL")]
    pub log_level: Option<LogLevel>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Command {
    /// Run every configured runner once and exit.
    Run(RunArgs),
    /// Run once, then watch test files and their dependencies and re-run
    /// the affected tests on change.
    Auto(RunArgs),
}

impl Command {
    pub fn args(&self) -> &RunArgs {
        match self {
            Command::Run(args) | Command::Auto(args) => args,
        }
    }
}

#[derive(Debug, Clone, Default, Args)]
pub struct RunArgs {
    /// Only these runners (repeatable). Default: all of them.
    #[arg(long = "runner", value_name = "NAME")]
    pub runners: Vec<String>,

    /// Worker slots per runner. Overrides `[run].workers`.
    #[arg(long, short = 'j', value_name = "N")]
    pub workers: Option<usize>,

    /// Seed forwarded to workers. Overrides `[run].seed`.
    #[arg(long, value_name = "SEED")]
    pub seed: Option<i64>,

    /// Grouping for full runs. Overrides each runner's `squash`.
    #[arg(long, value_enum, value_name = "POLICY")]
    pub squash: Option<SquashPolicy>,
}

/// Log level as exposed on the CLI.
#[derive(Debug, Copy, Clone, ValueEnum)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

/// Convenience wrapper around `CliArgs::parse()`.
pub fn parse() -> CliArgs {
    CliArgs::parse()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_auto_with_overrides() {
        let args = CliArgs::try_parse_from([
            "qa", "auto", "--runner", "unit", "-j", "3", "--seed", "7", "--squash", "all",
        ])
        .unwrap();
        assert!(matches!(args.command, Command::Auto(_)));
        let run = args.command.args();
        assert_eq!(run.runners, vec!["unit".to_string()]);
        assert_eq!(run.workers, Some(3));
        assert_eq!(run.seed, Some(7));
        assert_eq!(run.squash, Some(SquashPolicy::All));
        assert_eq!(args.config, "qa.toml");
    }

    #[test]
    fn global_flags_follow_subcommand() {
        let args =
            CliArgs::try_parse_from(["qa", "run", "--config", "ci/qa.toml", "--log-level", "debug"])
                .unwrap();
        assert_eq!(args.config, "ci/qa.toml");
        assert!(matches!(args.log_level, Some(LogLevel::Debug)));
    }
}
