// src/watch/dependency_table.rs

//! Index from filters to their dependency entries, with the two inverse
//! indices the watch engine walks.

use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;

use tracing::trace;

use crate::exec::TestDependencyEntry;
use crate::protocol::{Dependencies, FilePath, TestFilter};

use super::filter_table::FilterTable;

/// Which paths may be indexed or watched.
#[derive(Debug, Clone)]
pub struct WatchScope {
    pub dir: PathBuf,
    pub ignore_dirs: Vec<PathBuf>,
}

impl WatchScope {
    pub fn new(dir: impl Into<PathBuf>, ignore_dirs: Vec<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            ignore_dirs,
        }
    }

    pub fn should_watch(&self, path: &FilePath) -> bool {
        path.is_within(&self.dir) && !self.ignore_dirs.iter().any(|d| path.is_within(d))
    }

    /// In-scope dependency paths of `deps`, loaded then missing, deduplicated.
    fn watched_paths(&self, deps: &Dependencies) -> BTreeSet<FilePath> {
        deps.paths()
            .filter(|p| self.should_watch(p))
            .cloned()
            .collect()
    }
}

#[derive(Debug, Clone)]
pub struct TestDependencyTable {
    scope: WatchScope,
    by_filter: HashMap<TestFilter, TestDependencyEntry>,
    /// For cleanup when a test file changes or disappears.
    filters_by_test_file: HashMap<FilePath, Vec<TestFilter>>,
    /// Walked for every changed non-test file.
    filters_by_dep_file: FilterTable,
}

impl TestDependencyTable {
    pub fn new(scope: WatchScope) -> Self {
        Self {
            scope,
            by_filter: HashMap::new(),
            filters_by_test_file: HashMap::new(),
            filters_by_dep_file: FilterTable::new(),
        }
    }

    pub fn scope(&self) -> &WatchScope {
        &self.scope
    }

    pub fn get(&self, filter: &TestFilter) -> Option<&TestDependencyEntry> {
        self.by_filter.get(filter)
    }

    pub fn entries(&self) -> impl Iterator<Item = &TestDependencyEntry> {
        self.by_filter.values()
    }

    pub fn len(&self) -> usize {
        self.by_filter.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_filter.is_empty()
    }

    pub fn filters_for_test_file(&self, file: &FilePath) -> &[TestFilter] {
        self.filters_by_test_file
            .get(file)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn dependency_index(&self) -> &FilterTable {
        &self.filters_by_dep_file
    }

    /// Install `entry`, returning the entry it superseded.
    ///
    /// Only the difference between the old and new dependency sets touches
    /// the inverse index.
    pub fn replace_entry(&mut self, entry: TestDependencyEntry) -> Option<TestDependencyEntry> {
        let filter = entry.filter.clone();
        let mut retired = self
            .by_filter
            .get(&filter)
            .map(|prev| self.scope.watched_paths(&prev.dependencies))
            .unwrap_or_default();

        for path in self.scope.watched_paths(&entry.dependencies) {
            if !retired.remove(&path) {
                self.filters_by_dep_file.add(&path, &filter);
            }
        }
        for path in retired.iter() {
            self.filters_by_dep_file.remove(path, &filter);
        }

        let owned = self.filters_by_test_file.entry(entry.file.clone()).or_default();
        if !owned.contains(&filter) {
            owned.push(filter.clone());
        }

        trace!(%filter, "replaced dependency entry");
        let prev = self.by_filter.insert(filter, entry);
        if let Some(prev) = &prev {
            self.disown_if_moved(prev);
        }
        prev
    }

    /// Record the entries of a complete, unfiltered run of `file`.
    ///
    /// Filters already present are left alone. Previously known filters of
    /// `file` missing from `entries` are purged. Returns `(added, removed)`.
    pub fn prime_and_purge(
        &mut self,
        file: &FilePath,
        entries: Vec<TestDependencyEntry>,
    ) -> (Vec<TestDependencyEntry>, Vec<TestDependencyEntry>) {
        let fresh: Vec<TestFilter> = entries.iter().map(|e| e.filter.clone()).collect();
        let mut added = Vec::new();

        for entry in entries {
            if self.by_filter.contains_key(&entry.filter) {
                continue;
            }
            for path in self.scope.watched_paths(&entry.dependencies) {
                self.filters_by_dep_file.add(&path, &entry.filter);
            }
            self.by_filter.insert(entry.filter.clone(), entry.clone());
            added.push(entry);
        }

        let previous = self
            .filters_by_test_file
            .insert(file.clone(), fresh.clone())
            .unwrap_or_default();

        let mut removed = Vec::new();
        for filter in previous {
            if fresh.contains(&filter) {
                continue;
            }
            if let Some(entry) = self.remove_indexed(&filter) {
                removed.push(entry);
            }
        }

        (added, removed)
    }

    /// Entries whose dependencies include `changed`.
    pub fn affected_entries(&self, changed: &FilePath) -> Vec<TestDependencyEntry> {
        self.filters_by_dep_file
            .filters(changed)
            .iter()
            .filter_map(|f| self.by_filter.get(f).cloned())
            .collect()
    }

    /// Purge every filter owned by test file `file`.
    pub fn remove_file(&mut self, file: &FilePath) -> Vec<TestDependencyEntry> {
        let Some(filters) = self.filters_by_test_file.remove(file) else {
            return Vec::new();
        };
        filters
            .iter()
            .filter_map(|f| self.remove_indexed(f))
            .collect()
    }

    pub fn remove_filter(&mut self, filter: &TestFilter) -> Option<TestDependencyEntry> {
        let entry = self.remove_indexed(filter)?;
        self.disown(&entry.file, filter);
        Some(entry)
    }

    /// Rebuild the dependency-file index from `by_filter` alone.
    pub fn rebuild_dependency_index(&self) -> FilterTable {
        let mut table = FilterTable::new();
        for (filter, entry) in self.by_filter.iter() {
            for path in self.scope.watched_paths(&entry.dependencies) {
                table.add(&path, filter);
            }
        }
        table
    }

    fn remove_indexed(&mut self, filter: &TestFilter) -> Option<TestDependencyEntry> {
        let prev = self.by_filter.remove(filter)?;
        for path in self.scope.watched_paths(&prev.dependencies) {
            self.filters_by_dep_file.remove(&path, filter);
        }
        Some(prev)
    }

    fn disown(&mut self, file: &FilePath, filter: &TestFilter) {
        if let Some(owned) = self.filters_by_test_file.get_mut(file) {
            owned.retain(|f| f != filter);
            if owned.is_empty() {
                self.filters_by_test_file.remove(file);
            }
        }
    }

    /// A filter reported under a different file than before.
    fn disown_if_moved(&mut self, prev: &TestDependencyEntry) {
        let moved = self
            .by_filter
            .get(&prev.filter)
            .is_some_and(|current| current.file != prev.file);
        if moved {
            self.disown(&prev.file, &prev.filter);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{FileDigest, LoadedFile};

    fn scope() -> WatchScope {
        WatchScope::new("/proj", vec![PathBuf::from("/proj/tmp")])
    }

    fn entry(file: &str, filter: &str, loaded: &[&str], missing: &[&str]) -> TestDependencyEntry {
        TestDependencyEntry {
            label: filter.to_string(),
            file: FilePath::from(file),
            filter: TestFilter::from(filter),
            dependencies: Dependencies {
                loaded: loaded
                    .iter()
                    .map(|p| LoadedFile {
                        path: FilePath::from(*p),
                        digest: FileDigest::new("d"),
                    })
                    .collect(),
                missing: missing.iter().map(|p| FilePath::from(*p)).collect(),
            },
        }
    }

    #[test]
    fn scope_excludes_outside_and_ignored_paths() {
        let scope = scope();
        assert!(scope.should_watch(&FilePath::from("/proj/lib/a.rb")));
        assert!(!scope.should_watch(&FilePath::from("/proj/tmp/cache.rb")));
        assert!(!scope.should_watch(&FilePath::from("/usr/lib/ruby/set.rb")));
    }

    #[test]
    fn replace_entry_moves_only_the_diff() {
        let mut table = TestDependencyTable::new(scope());
        table.replace_entry(entry("/proj/a_spec.rb", "/proj/a_spec.rb:3", &["/proj/lib/a.rb", "/proj/lib/b.rb"], &[]));
        let prev = table
            .replace_entry(entry("/proj/a_spec.rb", "/proj/a_spec.rb:3", &["/proj/lib/b.rb"], &["/proj/lib/c.rb"]))
            .unwrap();
        assert_eq!(prev.dependencies.loaded.len(), 2);

        let idx = table.dependency_index();
        assert!(!idx.contains_key(&FilePath::from("/proj/lib/a.rb")));
        assert!(idx.contains_key(&FilePath::from("/proj/lib/b.rb")));
        assert!(idx.contains_key(&FilePath::from("/proj/lib/c.rb")));
        assert_eq!(table.rebuild_dependency_index(), *idx);
    }

    #[test]
    fn out_of_scope_dependencies_are_not_indexed() {
        let mut table = TestDependencyTable::new(scope());
        table.replace_entry(entry("/proj/a_spec.rb", "/proj/a_spec.rb:3", &["/usr/lib/set.rb", "/proj/tmp/x.rb"], &[]));
        assert!(table.dependency_index().is_empty());
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn prime_and_purge_keeps_present_and_drops_stale() {
        let mut table = TestDependencyTable::new(scope());
        let file = FilePath::from("/proj/a_spec.rb");
        table.replace_entry(entry("/proj/a_spec.rb", "/proj/a_spec.rb:3", &["/proj/lib/a.rb"], &[]));
        table.replace_entry(entry("/proj/a_spec.rb", "/proj/a_spec.rb:9", &["/proj/lib/old.rb"], &[]));

        let (added, removed) = table.prime_and_purge(
            &file,
            vec![
                entry("/proj/a_spec.rb", "/proj/a_spec.rb:3", &["/proj/lib/ignored.rb"], &[]),
                entry("/proj/a_spec.rb", "/proj/a_spec.rb:12", &["/proj/lib/new.rb"], &[]),
            ],
        );

        assert_eq!(added.len(), 1);
        assert_eq!(added[0].filter.as_str(), "/proj/a_spec.rb:12");
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].filter.as_str(), "/proj/a_spec.rb:9");
        // The already-present entry keeps its original dependencies.
        assert_eq!(
            table.get(&TestFilter::from("/proj/a_spec.rb:3")).unwrap().dependencies.loaded[0].path,
            FilePath::from("/proj/lib/a.rb")
        );
        assert!(!table.dependency_index().contains_key(&FilePath::from("/proj/lib/old.rb")));
        assert_eq!(table.filters_for_test_file(&file).len(), 2);
    }

    #[test]
    fn remove_file_purges_owned_filters() {
        let mut table = TestDependencyTable::new(scope());
        table.replace_entry(entry("/proj/a_spec.rb", "/proj/a_spec.rb:3", &["/proj/lib/a.rb"], &[]));
        table.replace_entry(entry("/proj/b_spec.rb", "/proj/b_spec.rb:1", &["/proj/lib/a.rb"], &[]));

        let removed = table.remove_file(&FilePath::from("/proj/a_spec.rb"));
        assert_eq!(removed.len(), 1);
        let affected = table.affected_entries(&FilePath::from("/proj/lib/a.rb"));
        assert_eq!(affected.len(), 1);
        assert_eq!(affected[0].filter.as_str(), "/proj/b_spec.rb:1");
    }
}
