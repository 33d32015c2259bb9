// src/watch/engine.rs

//! Turns realized dependencies and change batches into minimal re-runs.
//!
//! The dependency table, census, and subscription are mutated from two
//! flows (test results and file events) under one mutex.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use globset::GlobSet;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::engine::{RunPlan, RuntimeEvent};
use crate::errors::Result;
use crate::exec::{TestDependencyEntry, TestRunner, build_globset};
use crate::fs::FileSystem;
use crate::protocol::{
    Dependencies, FilePath, SuiteFinish, TestFilter, TestFinish, Visitor,
};

use super::backend::{FileEvent, Subscription};
use super::census::FilePathCensus;
use super::content_filter::ContentChangeFilter;
use super::dependency_table::{TestDependencyTable, WatchScope};
use super::expression::Expression;

struct WatchState {
    table: TestDependencyTable,
    census: FilePathCensus,
    /// Censused paths outside the test globs, as last pushed.
    other_watched: Vec<FilePath>,
    subscription: Option<Box<dyn Subscription>>,
}

struct Inner {
    runner: String,
    root: PathBuf,
    patterns: Vec<String>,
    globs: GlobSet,
    scope: WatchScope,
    state: Mutex<WatchState>,
    content: ContentChangeFilter,
}

/// Dependency-aware watch engine for one runner.
#[derive(Clone)]
pub struct WatchEngine {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for WatchEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WatchEngine")
            .field("runner", &self.inner.runner)
            .field("root", &self.inner.root)
            .finish_non_exhaustive()
    }
}

impl WatchEngine {
    pub fn new(
        runner: impl Into<String>,
        scope: WatchScope,
        patterns: Vec<String>,
        fs: Arc<dyn FileSystem>,
    ) -> Result<Self> {
        let globs = build_globset(&patterns)?;
        Ok(Self {
            inner: Arc::new(Inner {
                runner: runner.into(),
                root: scope.dir.clone(),
                patterns,
                globs,
                state: Mutex::new(WatchState {
                    table: TestDependencyTable::new(scope.clone()),
                    census: FilePathCensus::new(),
                    other_watched: Vec::new(),
                    subscription: None,
                }),
                scope,
                content: ContentChangeFilter::new(fs),
            }),
        })
    }

    pub fn runner(&self) -> &str {
        &self.inner.runner
    }

    pub fn root(&self) -> &Path {
        &self.inner.root
    }

    /// Expression over the test globs plus every other watched path.
    pub fn expression(&self) -> Expression {
        let state = self.lock();
        self.inner.expression_for(&state.other_watched)
    }

    /// Hand over the live subscription; later watch-set changes are pushed to it.
    pub fn attach(&self, subscription: Box<dyn Subscription>) {
        self.lock().subscription = Some(subscription);
    }

    pub fn close(&self) {
        if let Some(mut sub) = self.lock().subscription.take() {
            sub.close();
        }
    }

    /// Visitor that feeds realized dependencies back into the index.
    pub fn visitor(&self) -> Box<dyn Visitor> {
        Box::new(WatchVisitor {
            inner: Arc::clone(&self.inner),
            dirty: false,
        })
    }

    /// Seed the index from enumerated runners.
    ///
    /// Only unfiltered enumerations prime and purge: a filtered one saw a
    /// subset of each file and would wrongly purge the rest.
    pub fn prime(&self, runners: &[Arc<dyn TestRunner>], filtered: bool) -> Result<()> {
        let mut by_file: BTreeMap<FilePath, Vec<TestDependencyEntry>> = BTreeMap::new();
        for runner in runners {
            for mut entry in runner.dependencies() {
                entry.file = self.inner.expand(&entry.file);
                self.inner.record_digests(&entry.dependencies);
                by_file.entry(entry.file.clone()).or_default().push(entry);
            }
        }

        if filtered {
            return Ok(());
        }

        let mut state = self.lock();
        let mut changed = false;
        for (file, entries) in by_file {
            let (added, removed) = state.table.prime_and_purge(&file, entries);
            for entry in removed.iter() {
                changed |= release(&mut state.census, &entry.dependencies);
            }
            for entry in added.iter() {
                changed |= acquire(&mut state.census, &entry.dependencies);
            }
            if !added.is_empty() || !removed.is_empty() {
                changed = true;
            }
        }
        if changed {
            self.inner.update_subscription(&mut state)?;
        }
        Ok(())
    }

    /// Drop changes whose content is unchanged.
    pub fn filter_event(&self, event: FileEvent) -> Option<FileEvent> {
        self.inner.content.filter(event)
    }

    /// Decide what a batch of changes should re-run.
    ///
    /// Returns at most two plans: explicit whole files first, then implicit
    /// filter-scoped re-runs.
    pub fn classify(&self, event: &FileEvent) -> Result<Vec<RunPlan>> {
        let inner = &self.inner;
        let mut state = self.lock();

        let mut explicit: BTreeSet<FilePath> = BTreeSet::new();
        let mut implicit_entries: Vec<TestDependencyEntry> = Vec::new();
        let mut released = false;

        for changed in event.files.iter() {
            let path = FilePath::from(event.path_of(changed));

            if inner.is_test_file(&path) {
                if changed.exists {
                    info!(runner = %inner.runner, file = %changed.name, "test file changed");
                    explicit.insert(path);
                } else {
                    info!(runner = %inner.runner, file = %changed.name, "test file removed");
                    for entry in state.table.remove_file(&path) {
                        released |= release(&mut state.census, &entry.dependencies);
                    }
                }
                continue;
            }

            let entries = state.table.affected_entries(&path);
            info!(
                runner = %inner.runner,
                file = %changed.name,
                new = changed.new,
                exists = changed.exists,
                affected = entries.len(),
                "dependency changed"
            );

            for entry in entries {
                debug!(label = %entry.label, filter = %entry.filter, "affected test");
                if explicit.contains(&entry.file) {
                    continue;
                }
                // A load failure means the file's individual tests can't be trusted.
                if entry.filter.is_whole_file() {
                    explicit.insert(entry.file.clone());
                    continue;
                }
                implicit_entries.push(entry);
            }
        }

        // Batches are unordered: a file may turn explicit after its filters were seen.
        let mut implicit_files: BTreeSet<FilePath> = BTreeSet::new();
        let mut implicit_filters: BTreeSet<TestFilter> = BTreeSet::new();
        for entry in implicit_entries {
            if explicit.contains(&entry.file) {
                continue;
            }
            implicit_files.insert(entry.file);
            implicit_filters.insert(entry.filter);
        }

        if released {
            inner.update_subscription(&mut state)?;
        }

        let mut plans = Vec::new();
        if !explicit.is_empty() {
            plans.push(RunPlan::files(&inner.runner, explicit.into_iter().collect()));
        }
        if !implicit_files.is_empty() {
            plans.push(RunPlan::filtered(
                &inner.runner,
                implicit_files.into_iter().collect(),
                implicit_filters.into_iter().collect(),
            ));
        }
        Ok(plans)
    }

    /// Consume subscription batches until the stream or the runtime closes.
    pub async fn process_events(
        &self,
        mut events: mpsc::Receiver<FileEvent>,
        runtime_tx: mpsc::Sender<RuntimeEvent>,
    ) -> Result<()> {
        while let Some(event) = events.recv().await {
            let Some(event) = self.filter_event(event) else {
                continue;
            };
            for plan in self.classify(&event)? {
                if runtime_tx.send(RuntimeEvent::RunRequested(plan)).await.is_err() {
                    debug!(runner = %self.inner.runner, "runtime gone; stopping watch");
                    return Ok(());
                }
            }
        }
        debug!(runner = %self.inner.runner, "subscription closed");
        Ok(())
    }

    /// Run [`Self::process_events`] on its own task. An error is forwarded to
    /// the runtime as [`RuntimeEvent::Failed`].
    pub fn spawn(
        &self,
        events: mpsc::Receiver<FileEvent>,
        runtime_tx: mpsc::Sender<RuntimeEvent>,
    ) -> JoinHandle<()> {
        let engine = self.clone();
        tokio::spawn(async move {
            if let Err(error) = engine.process_events(events, runtime_tx.clone()).await {
                error!(runner = %engine.runner(), error = %error, "watch engine failed");
                let failed = RuntimeEvent::Failed {
                    runner: engine.runner().to_string(),
                    error,
                };
                if runtime_tx.send(failed).await.is_err() {
                    debug!(runner = %engine.runner(), "runtime gone; dropping watch failure");
                }
            }
        })
    }

    /// Every path currently censused, sorted.
    pub fn watched_paths(&self) -> Vec<FilePath> {
        self.lock().census.paths()
    }

    /// Censused paths outside the test globs, as last pushed.
    pub fn other_watched_paths(&self) -> Vec<FilePath> {
        self.lock().other_watched.clone()
    }

    /// Run `f` against the dependency table.
    pub fn with_table<T>(&self, f: impl FnOnce(&TestDependencyTable) -> T) -> T {
        f(&self.lock().table)
    }

    fn lock(&self) -> MutexGuard<'_, WatchState> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Inner {
    fn is_test_file(&self, path: &FilePath) -> bool {
        path.relative_to(&self.root)
            .is_some_and(|rel| self.globs.is_match(rel))
    }

    fn expand(&self, path: &FilePath) -> FilePath {
        if path.as_path().is_absolute() {
            path.clone()
        } else {
            FilePath::from(self.root.join(path.as_path()))
        }
    }

    fn record_digests(&self, deps: &Dependencies) {
        for loaded in deps.loaded.iter().rev() {
            if self.scope.should_watch(&loaded.path) {
                self.content.set_digest(loaded.path.as_path(), &loaded.digest);
            }
        }
    }

    fn expression_for(&self, other: &[FilePath]) -> Expression {
        let names: Vec<String> = other
            .iter()
            .filter_map(|p| p.relative_to(&self.root))
            .filter(|rel| !rel.is_empty())
            .collect();
        Expression::watching(&self.patterns, &names)
    }

    /// Recompute the non-glob watched paths and push them if they changed.
    fn update_subscription(&self, state: &mut WatchState) -> Result<()> {
        let other: Vec<FilePath> = state
            .census
            .paths()
            .into_iter()
            .filter(|p| self.scope.should_watch(p) && !self.is_test_file(p))
            .collect();

        if other == state.other_watched {
            return Ok(());
        }

        if let Some(sub) = state.subscription.as_mut() {
            sub.update_expression(self.expression_for(&other))?;
        }
        info!(
            runner = %self.runner,
            other_files = other.len(),
            "watch set updated"
        );
        state.other_watched = other;
        Ok(())
    }
}

fn acquire(census: &mut FilePathCensus, deps: &Dependencies) -> bool {
    let loaded = census.exchange(&[], &loaded_paths(deps));
    let missing = census.exchange(&[], &deps.missing);
    loaded || missing
}

fn release(census: &mut FilePathCensus, deps: &Dependencies) -> bool {
    let loaded = census.exchange(&loaded_paths(deps), &[]);
    let missing = census.exchange(&deps.missing, &[]);
    loaded || missing
}

fn loaded_paths(deps: &Dependencies) -> Vec<FilePath> {
    deps.loaded.iter().map(|l| l.path.clone()).collect()
}

/// Maintains the index from finished tests during a run.
struct WatchVisitor {
    inner: Arc<Inner>,
    dirty: bool,
}

impl Visitor for WatchVisitor {
    fn test_finish(&mut self, test: &TestFinish) -> Result<()> {
        let Some(deps) = &test.dependencies else {
            return Ok(());
        };
        let Some(reported) = &test.file else {
            warn!(filter = %test.filter, "finished test has dependencies but no file; not indexing");
            return Ok(());
        };
        let file = self.inner.expand(reported);
        self.inner.record_digests(deps);

        let mut state = self.inner.state.lock().unwrap_or_else(PoisonError::into_inner);

        // A file that loads again no longer needs its load-failure entry.
        if !test.filter.is_whole_file() {
            if let Some(stale) = state.table.remove_filter(&TestFilter::whole_file(reported)) {
                self.dirty |= release(&mut state.census, &stale.dependencies);
            }
        }

        let entry = TestDependencyEntry {
            label: test.full_label(),
            file,
            filter: test.filter.clone(),
            dependencies: deps.clone(),
        };
        let previous = state
            .table
            .replace_entry(entry)
            .map(|e| e.dependencies)
            .unwrap_or_default();

        let loaded = state
            .census
            .exchange(&loaded_paths(&previous), &loaded_paths(deps));
        let missing = state.census.exchange(&previous.missing, &deps.missing);
        self.dirty |= loaded || missing;
        Ok(())
    }

    fn suite_finish(&mut self, _finish: &SuiteFinish) -> Result<()> {
        if self.dirty {
            let mut state = self.inner.state.lock().unwrap_or_else(PoisonError::into_inner);
            self.inner.update_subscription(&mut state)?;
            self.dirty = false;
        }
        Ok(())
    }
}
