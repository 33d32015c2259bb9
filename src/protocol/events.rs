// src/protocol/events.rs

//! Typed event model shared by the decoder, scheduler and watch engine.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Separator used when printing a case path together with a test label.
pub const LABEL_SEPARATOR: &str = " ▸ ";

/// Absolute path of a file the suite cares about (test file or dependency).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FilePath(PathBuf);

impl FilePath {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self(path.into())
    }

    pub fn as_path(&self) -> &Path {
        &self.0
    }

    /// True if this path is `dir` itself or lives somewhere beneath it.
    pub fn is_within(&self, dir: &Path) -> bool {
        self.0.starts_with(dir)
    }

    /// Path relative to `root` with forward slashes, if it is below `root`.
    pub fn relative_to(&self, root: &Path) -> Option<String> {
        self.0
            .strip_prefix(root)
            .ok()
            .map(|rel| rel.to_string_lossy().replace('\\', "/"))
    }
}

impl fmt::Display for FilePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.display())
    }
}

impl From<PathBuf> for FilePath {
    fn from(path: PathBuf) -> Self {
        Self(path)
    }
}

impl From<&Path> for FilePath {
    fn from(path: &Path) -> Self {
        Self(path.to_path_buf())
    }
}

impl From<String> for FilePath {
    fn from(path: String) -> Self {
        Self(PathBuf::from(path))
    }
}

impl From<&str> for FilePath {
    fn from(path: &str) -> Self {
        Self(PathBuf::from(path))
    }
}

impl AsRef<Path> for FilePath {
    fn as_ref(&self) -> &Path {
        &self.0
    }
}

/// Opaque identifier selecting a single test.
///
/// The filter `<file>:0` is the whole-file sentinel: the file failed to load,
/// so no finer-grained test could be identified.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TestFilter(String);

const WHOLE_FILE_SUFFIX: &str = ":0";

impl TestFilter {
    pub fn new(filter: impl Into<String>) -> Self {
        Self(filter.into())
    }

    pub fn whole_file(file: &FilePath) -> Self {
        Self(format!("{file}{WHOLE_FILE_SUFFIX}"))
    }

    pub fn is_whole_file(&self) -> bool {
        self.0.ends_with(WHOLE_FILE_SUFFIX)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for TestFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TestFilter {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Hex content digest. Empty means "unknown" and is never recorded.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FileDigest(String);

impl FileDigest {
    pub fn new(hex: impl Into<String>) -> Self {
        Self(hex.into())
    }

    pub fn is_unknown(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for FileDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Pass,
    Fail,
    Error,
    Omit,
    Todo,
}

impl Status {
    pub fn is_failure(self) -> bool {
        matches!(self, Status::Fail | Status::Error)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Status::Pass => "pass",
            Status::Fail => "fail",
            Status::Error => "error",
            Status::Omit => "omit",
            Status::Todo => "todo",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SuiteBegin {
    #[serde(rename = "start", default)]
    pub start_time: String,
    #[serde(rename = "count", default)]
    pub total_count: usize,
    #[serde(default)]
    pub seed: i64,
}

/// A grouping label (describe/context block) with its nesting level.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Case {
    #[serde(default)]
    pub label: String,
    #[serde(default)]
    pub subtype: String,
    #[serde(default)]
    pub level: i64,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TestBegin {
    pub label: String,
    pub subtype: String,
    pub filter: TestFilter,
    pub file: Option<FilePath>,
    pub timestamp: f64,
    /// Case path in effect when this event was read.
    pub cases: Vec<Case>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Exception {
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub class: String,
    #[serde(default)]
    pub file: String,
    #[serde(default)]
    pub line: i64,
    #[serde(default)]
    pub source: String,
    #[serde(default)]
    pub snippet: Vec<std::collections::BTreeMap<String, String>>,
    #[serde(default)]
    pub backtrace: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadedFile {
    pub path: FilePath,
    #[serde(default)]
    pub digest: FileDigest,
}

/// Files a test loaded (with digests) or tried to load and missed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Dependencies {
    pub loaded: Vec<LoadedFile>,
    pub missing: Vec<FilePath>,
}

impl Dependencies {
    /// Every path this test depends on, loaded or missing.
    pub fn paths(&self) -> impl Iterator<Item = &FilePath> {
        self.loaded.iter().map(|l| &l.path).chain(self.missing.iter())
    }

    pub fn is_empty(&self) -> bool {
        self.loaded.is_empty() && self.missing.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TestFinish {
    pub label: String,
    pub subtype: String,
    pub filter: TestFilter,
    pub file: Option<FilePath>,
    pub status: Status,
    pub timestamp: f64,
    /// Seconds.
    pub duration: f64,
    pub stdout: String,
    pub stderr: String,
    pub exception: Option<Exception>,
    pub dependencies: Option<Dependencies>,
    pub cases: Vec<Case>,
}

impl TestFinish {
    /// A finish record with no output, used for synthetic outcomes.
    pub fn new(label: impl Into<String>, filter: TestFilter, status: Status) -> Self {
        Self {
            label: label.into(),
            subtype: String::new(),
            filter,
            file: None,
            status,
            timestamp: 0.0,
            duration: 0.0,
            stdout: String::new(),
            stderr: String::new(),
            exception: None,
            dependencies: None,
            cases: Vec::new(),
        }
    }

    /// Case labels and the test label joined for display.
    pub fn full_label(&self) -> String {
        self.cases
            .iter()
            .map(|c| c.label.as_str())
            .chain(std::iter::once(self.label.as_str()))
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>()
            .join(LABEL_SEPARATOR)
    }
}

/// One Chrome-trace style profiling record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TraceEvent {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub pid: i64,
    #[serde(default)]
    pub tid: i64,
    #[serde(rename = "ph", default)]
    pub phase: String,
    #[serde(rename = "ts", default)]
    pub timestamp: f64,
    #[serde(rename = "dur", default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<serde_json::Value>,
}

/// Per-status counts. Only ever grows, one test at a time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultTally {
    #[serde(default)]
    pub total: usize,
    #[serde(default)]
    pub pass: usize,
    #[serde(default)]
    pub fail: usize,
    #[serde(default)]
    pub error: usize,
    #[serde(default)]
    pub omit: usize,
    #[serde(default)]
    pub todo: usize,
}

impl ResultTally {
    pub fn increment(&mut self, status: Status) {
        self.total += 1;
        match status {
            Status::Pass => self.pass += 1,
            Status::Fail => self.fail += 1,
            Status::Error => self.error += 1,
            Status::Omit => self.omit += 1,
            Status::Todo => self.todo += 1,
        }
    }

    /// Fold another suite's counts into this one.
    pub fn merge(&mut self, other: &ResultTally) {
        self.total += other.total;
        self.pass += other.pass;
        self.fail += other.fail;
        self.error += other.error;
        self.omit += other.omit;
        self.todo += other.todo;
    }

    /// No test failed or errored.
    pub fn passed(&self) -> bool {
        self.fail + self.error == 0
    }
}

impl fmt::Display for ResultTally {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} tests, {} passed, {} failed, {} errors, {} omitted, {} todo",
            self.total, self.pass, self.fail, self.error, self.omit, self.todo
        )
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SuiteFinish {
    /// Seconds.
    pub time: f64,
    pub tally: ResultTally,
    /// The suite header this finish closes.
    pub suite: SuiteBegin,
}
