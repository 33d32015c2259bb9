// src/protocol/wire.rs

//! Line-delimited JSON records as they travel between workers and the
//! coordination server.
//!
//! Every record carries a `type` discriminator. `note` records carry a second
//! discriminator under `qa:type`.

use serde::{Deserialize, Serialize};

use crate::errors::Result;

use super::events::{
    Case, Dependencies, Exception, FileDigest, FilePath, LoadedFile, ResultTally, Status,
    SuiteBegin, SuiteFinish, TestBegin, TestFilter, TestFinish, TraceEvent,
};

/// `qa:type` of a note announcing a test start.
pub const NOTE_TEST_BEGIN: &str = "test:begin";
/// `qa:type` of a note extending the interned loaded-file pool.
pub const NOTE_DEPENDENCY: &str = "dependency";

pub(crate) const KNOWN_TYPES: &[&str] = &["suite", "case", "note", "test", "trace", "final"];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Record {
    Suite(SuiteBegin),
    Case(Case),
    Note(NoteRecord),
    Test(TestRecord),
    Trace(TraceRecord),
    Final(FinalRecord),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NoteRecord {
    #[serde(rename = "qa:type", default)]
    pub kind: String,
    #[serde(rename = "qa:label", default, skip_serializing_if = "String::is_empty")]
    pub label: String,
    #[serde(rename = "qa:subtype", default, skip_serializing_if = "String::is_empty")]
    pub subtype: String,
    #[serde(rename = "qa:filter", default, skip_serializing_if = "String::is_empty")]
    pub filter: String,
    #[serde(rename = "qa:file", default, skip_serializing_if = "String::is_empty")]
    pub file: String,
    #[serde(rename = "qa:timestamp", default)]
    pub timestamp: f64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub files: Vec<FilePath>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub digests: Vec<FileDigest>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireDependencies {
    /// Indices into the stream's interned loaded-file pool.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub loaded_indices: Vec<usize>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub loaded: Vec<LoadedFile>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub missing: Vec<FilePath>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestRecord {
    #[serde(default)]
    pub label: String,
    #[serde(default)]
    pub subtype: String,
    pub status: Status,
    #[serde(default)]
    pub filter: TestFilter,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<FilePath>,
    #[serde(default)]
    pub timestamp: f64,
    #[serde(default)]
    pub time: f64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub stdout: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub stderr: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exception: Option<Exception>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dependencies: Option<WireDependencies>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceRecord {
    pub trace: TraceEvent,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FinalRecord {
    #[serde(default)]
    pub time: f64,
    #[serde(default)]
    pub counts: ResultTally,
}

impl Record {
    /// Serialize as one protocol line, without the trailing newline.
    pub fn to_line(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn dependency_note(loaded: &[LoadedFile]) -> Self {
        Record::Note(NoteRecord {
            kind: NOTE_DEPENDENCY.to_string(),
            files: loaded.iter().map(|l| l.path.clone()).collect(),
            digests: loaded.iter().map(|l| l.digest.clone()).collect(),
            ..NoteRecord::default()
        })
    }
}

impl From<&TestBegin> for Record {
    fn from(begin: &TestBegin) -> Self {
        Record::Note(NoteRecord {
            kind: NOTE_TEST_BEGIN.to_string(),
            label: begin.label.clone(),
            subtype: begin.subtype.clone(),
            filter: begin.filter.to_string(),
            file: begin.file.as_ref().map(|f| f.to_string()).unwrap_or_default(),
            timestamp: begin.timestamp,
            ..NoteRecord::default()
        })
    }
}

/// Dependencies are written inline; decoders accept both inline and
/// pool-indexed forms.
impl From<&TestFinish> for Record {
    fn from(finish: &TestFinish) -> Self {
        Record::Test(TestRecord {
            label: finish.label.clone(),
            subtype: finish.subtype.clone(),
            status: finish.status,
            filter: finish.filter.clone(),
            file: finish.file.clone(),
            timestamp: finish.timestamp,
            time: finish.duration,
            stdout: finish.stdout.clone(),
            stderr: finish.stderr.clone(),
            exception: finish.exception.clone(),
            dependencies: finish.dependencies.as_ref().map(|d: &Dependencies| WireDependencies {
                loaded_indices: Vec::new(),
                loaded: d.loaded.clone(),
                missing: d.missing.clone(),
            }),
        })
    }
}

impl From<&SuiteFinish> for Record {
    fn from(finish: &SuiteFinish) -> Self {
        Record::Final(FinalRecord {
            time: finish.time,
            counts: finish.tally,
        })
    }
}

impl From<&TraceEvent> for Record {
    fn from(trace: &TraceEvent) -> Self {
        Record::Trace(TraceRecord {
            trace: trace.clone(),
        })
    }
}
