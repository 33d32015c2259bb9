#![allow(dead_code)]

use std::collections::BTreeMap;
use std::path::PathBuf;

use qa::config::{ConfigFile, RawConfigFile, RunSection, RunnerConfig, SquashPolicy};
use qa::exec::TestDependencyEntry;
use qa::protocol::{
    Dependencies, FileDigest, FilePath, LoadedFile, Status, TestFilter, TestFinish,
};

/// Builder for `ConfigFile` to simplify test setup.
pub struct ConfigFileBuilder {
    config: RawConfigFile,
}

impl ConfigFileBuilder {
    pub fn new() -> Self {
        Self {
            config: RawConfigFile {
                run: RunSection::default(),
                runner: BTreeMap::new(),
            },
        }
    }

    pub fn with_runner(mut self, name: &str, runner: RunnerConfig) -> Self {
        self.config.runner.insert(name.to_string(), runner);
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.config.run.workers = Some(workers);
        self
    }

    pub fn with_seed(mut self, seed: i64) -> Self {
        self.config.run.seed = Some(seed);
        self
    }

    pub fn with_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.run.dir = dir.into();
        self
    }

    pub fn raw(self) -> RawConfigFile {
        self.config
    }

    pub fn build(self) -> ConfigFile {
        ConfigFile::try_from(self.config).expect("Failed to build valid config from builder")
    }
}

impl Default for ConfigFileBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Builder for `RunnerConfig`.
pub struct RunnerConfigBuilder {
    runner: RunnerConfig,
}

impl RunnerConfigBuilder {
    pub fn new(command: &[&str]) -> Self {
        Self {
            runner: RunnerConfig {
                command: command.iter().map(|s| s.to_string()).collect(),
                patterns: Vec::new(),
                squash: SquashPolicy::default(),
                env: BTreeMap::new(),
                passthrough: Default::default(),
            },
        }
    }

    pub fn pattern(mut self, glob: &str) -> Self {
        self.runner.patterns.push(glob.to_string());
        self
    }

    pub fn squash(mut self, squash: SquashPolicy) -> Self {
        self.runner.squash = squash;
        self
    }

    pub fn env(mut self, key: &str, value: &str) -> Self {
        self.runner.env.insert(key.to_string(), value.to_string());
        self
    }

    pub fn build(self) -> RunnerConfig {
        self.runner
    }
}

/// Dependencies with a fixed fake digest per loaded path.
pub fn deps(loaded: &[&str], missing: &[&str]) -> Dependencies {
    Dependencies {
        loaded: loaded
            .iter()
            .map(|p| LoadedFile {
                path: FilePath::from(*p),
                digest: FileDigest::new(format!("digest-of-{p}")),
            })
            .collect(),
        missing: missing.iter().map(|p| FilePath::from(*p)).collect(),
    }
}

/// A finished test as a worker would report it.
pub fn finish(file: &str, filter: &str, status: Status, dependencies: Option<Dependencies>) -> TestFinish {
    let mut test = TestFinish::new(format!("test {filter}"), TestFilter::new(filter), status);
    test.file = Some(FilePath::from(file));
    test.dependencies = dependencies;
    test
}

pub fn entry(file: &str, filter: &str, dependencies: Dependencies) -> TestDependencyEntry {
    TestDependencyEntry {
        label: format!("test {filter}"),
        file: FilePath::from(file),
        filter: TestFilter::new(filter),
        dependencies,
    }
}
