// src/protocol/decode.rs

//! Streaming decoder: line-delimited records in, visitor calls out.

use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tracing::{debug, trace};

use crate::errors::{ProtocolError, Result};

use super::events::{
    Case, Dependencies, FilePath, LoadedFile, SuiteBegin, SuiteFinish, TestBegin, TestFilter,
    TestFinish,
};
use super::visitor::Visitor;
use super::wire::{
    KNOWN_TYPES, NOTE_DEPENDENCY, NOTE_TEST_BEGIN, NoteRecord, Record, TestRecord,
    WireDependencies,
};

/// Decode every record from `reader` into `visitor`.
///
/// `visitor.end` is invoked exactly once, after the last event or after the
/// first error, whichever comes first.
pub async fn decode<R>(reader: R, visitor: &mut dyn Visitor) -> Result<()>
where
    R: AsyncBufRead + Unpin,
{
    let result = Decoder::default().run(reader, visitor).await;
    visitor.end(result.as_ref().err());
    result
}

/// Per-stream decoding state.
#[derive(Debug, Default)]
pub struct Decoder {
    line: usize,
    cases: Vec<Case>,
    pool: Vec<LoadedFile>,
    suite: SuiteBegin,
}

impl Decoder {
    async fn run<R>(mut self, reader: R, visitor: &mut dyn Visitor) -> Result<()>
    where
        R: AsyncBufRead + Unpin,
    {
        let mut lines = reader.lines();
        while let Some(line) = lines.next_line().await? {
            self.feed(&line, visitor)?;
        }
        debug!(lines = self.line, "record stream finished");
        Ok(())
    }

    /// Process one raw line.
    pub fn feed(&mut self, line: &str, visitor: &mut dyn Visitor) -> Result<()> {
        self.line += 1;
        let line = line.trim();
        if line.is_empty() {
            return Ok(());
        }
        let record = self.parse(line)?;
        self.dispatch(record, visitor)
    }

    /// The case stack currently in effect.
    pub fn case_path(&self) -> &[Case] {
        &self.cases
    }

    fn parse(&self, line: &str) -> Result<Record> {
        let malformed = |source| ProtocolError::Malformed {
            line: self.line,
            source,
        };
        let value: serde_json::Value = serde_json::from_str(line).map_err(malformed)?;
        let kind = value.get("type").and_then(|t| t.as_str()).unwrap_or_default();
        if !KNOWN_TYPES.contains(&kind) {
            return Err(ProtocolError::UnknownType {
                line: self.line,
                kind: kind.to_string(),
            }
            .into());
        }
        Ok(serde_json::from_value(value).map_err(malformed)?)
    }

    fn dispatch(&mut self, record: Record, visitor: &mut dyn Visitor) -> Result<()> {
        match record {
            Record::Suite(suite) => {
                self.suite = suite;
                visitor.suite_begin(&self.suite)
            }
            Record::Case(case) => self.push_case(case),
            Record::Note(note) => self.note(note, visitor),
            Record::Test(test) => {
                let finish = self.finish(test)?;
                visitor.test_finish(&finish)
            }
            Record::Trace(t) => visitor.trace(&t.trace),
            Record::Final(f) => visitor.suite_finish(&SuiteFinish {
                time: f.time,
                tally: f.counts,
                suite: self.suite.clone(),
            }),
        }
    }

    fn push_case(&mut self, case: Case) -> Result<()> {
        if self.cases.is_empty() || case.level <= 0 {
            self.cases.clear();
        } else {
            let level = case.level as usize;
            if level > self.cases.len() {
                return Err(ProtocolError::CaseTooDeep {
                    line: self.line,
                    level: case.level,
                    depth: self.cases.len(),
                }
                .into());
            }
            self.cases.truncate(level);
        }
        trace!(label = %case.label, level = case.level, "case");
        self.cases.push(case);
        Ok(())
    }

    fn note(&mut self, note: NoteRecord, visitor: &mut dyn Visitor) -> Result<()> {
        match note.kind.as_str() {
            NOTE_TEST_BEGIN => visitor.test_begin(&TestBegin {
                label: note.label,
                subtype: note.subtype,
                filter: TestFilter::new(note.filter),
                file: non_empty_path(note.file),
                timestamp: note.timestamp,
                cases: self.cases.clone(),
            }),
            NOTE_DEPENDENCY => {
                if note.files.len() != note.digests.len() {
                    return Err(ProtocolError::DigestMismatch {
                        line: self.line,
                        files: note.files.len(),
                        digests: note.digests.len(),
                    }
                    .into());
                }
                self.pool.extend(
                    note.files
                        .into_iter()
                        .zip(note.digests)
                        .map(|(path, digest)| LoadedFile { path, digest }),
                );
                Ok(())
            }
            other => {
                debug!(kind = other, line = self.line, "ignoring note");
                Ok(())
            }
        }
    }

    fn finish(&self, test: TestRecord) -> Result<TestFinish> {
        let dependencies = test
            .dependencies
            .map(|deps| self.resolve(deps))
            .transpose()?;
        Ok(TestFinish {
            label: test.label,
            subtype: test.subtype,
            filter: test.filter,
            file: test.file.filter(|f| !f.as_path().as_os_str().is_empty()),
            status: test.status,
            timestamp: test.timestamp,
            duration: test.time,
            stdout: test.stdout,
            stderr: test.stderr,
            exception: test.exception,
            dependencies,
            cases: self.cases.clone(),
        })
    }

    fn resolve(&self, deps: WireDependencies) -> Result<Dependencies> {
        let mut loaded = Vec::with_capacity(deps.loaded_indices.len() + deps.loaded.len());
        for index in deps.loaded_indices {
            let entry = self.pool.get(index).ok_or(ProtocolError::UnknownDependency {
                line: self.line,
                index,
                pool: self.pool.len(),
            })?;
            loaded.push(entry.clone());
        }
        loaded.extend(deps.loaded);
        Ok(Dependencies {
            loaded,
            missing: deps.missing,
        })
    }
}

fn non_empty_path(s: String) -> Option<FilePath> {
    if s.is_empty() {
        None
    } else {
        Some(FilePath::from(s.as_str()))
    }
}
