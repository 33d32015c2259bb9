// src/config/model.rs

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;

/// Configuration as read from `qa.toml`, before validation.
///
/// ```toml
/// [run]
/// workers = 4
/// seed = 1234
/// dir = "."
/// ignore_dirs = ["bundle", "tmp"]
///
/// [runner.rspec]
/// command = ["ruby", "adapters/rspec.rb"]
/// patterns = ["spec/**/*_spec.rb"]
/// squash = "file"
/// env = { RAILS_ENV = "test" }
/// passthrough = { warmup = false }
/// ```
#[derive(Debug, Clone, Deserialize)]
pub struct RawConfigFile {
    #[serde(default)]
    pub run: RunSection,

    #[serde(default)]
    pub runner: BTreeMap<String, RunnerConfig>,
}

/// `[run]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct RunSection {
    /// Number of worker slots. Defaults to the available parallelism.
    #[serde(default)]
    pub workers: Option<usize>,

    /// Seed forwarded to every worker. Random when omitted.
    #[serde(default)]
    pub seed: Option<i64>,

    /// Project root, relative to the config file.
    #[serde(default = "default_dir")]
    pub dir: PathBuf,

    /// Directories under `dir` whose files are never indexed or watched.
    #[serde(default = "default_ignore_dirs")]
    pub ignore_dirs: Vec<PathBuf>,
}

fn default_dir() -> PathBuf {
    PathBuf::from(".")
}

fn default_ignore_dirs() -> Vec<PathBuf> {
    vec![PathBuf::from("bundle"), PathBuf::from("tmp")]
}

impl Default for RunSection {
    fn default() -> Self {
        Self {
            workers: None,
            seed: None,
            dir: default_dir(),
            ignore_dirs: default_ignore_dirs(),
        }
    }
}

/// How enumerated tests are grouped into runners.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum SquashPolicy {
    /// One runner per test.
    Nothing,
    /// One runner per run of consecutive tests from the same file.
    #[default]
    File,
    /// A single runner for everything.
    All,
}

/// `[runner.<name>]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct RunnerConfig {
    /// Worker process argv. The queue address is appended as the final argument.
    pub command: Vec<String>,

    /// Test-file globs, relative to `[run].dir`.
    pub patterns: Vec<String>,

    #[serde(default)]
    pub squash: SquashPolicy,

    /// Extra environment variables for the worker process.
    #[serde(default)]
    pub env: BTreeMap<String, String>,

    /// Opaque table handed to the worker in its init message.
    #[serde(default)]
    pub passthrough: toml::Table,
}

/// Validated configuration. Construct via `TryFrom<RawConfigFile>`.
#[derive(Debug, Clone)]
pub struct ConfigFile {
    pub run: RunSection,
    pub runner: BTreeMap<String, RunnerConfig>,
}

impl ConfigFile {
    pub(crate) fn new_unchecked(run: RunSection, runner: BTreeMap<String, RunnerConfig>) -> Self {
        Self { run, runner }
    }

    /// Resolve `[run].dir` and the ignore dirs against `base`.
    pub fn resolve_dirs(mut self, base: &Path) -> Self {
        let dir = if self.run.dir.is_absolute() {
            self.run.dir.clone()
        } else {
            base.join(&self.run.dir)
        };
        let dir = dir.canonicalize().unwrap_or(dir);
        self.run.ignore_dirs = self
            .run
            .ignore_dirs
            .iter()
            .map(|d| if d.is_absolute() { d.clone() } else { dir.join(d) })
            .collect();
        self.run.dir = dir;
        self
    }

    pub fn workers(&self) -> usize {
        self.run.workers.unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        })
    }
}
