// src/watch/filter_table.rs

use std::collections::{BTreeSet, HashMap};

use crate::protocol::{FilePath, TestFilter};

/// Multimap from a file path to the filters that depend on it.
///
/// Keys with no filters are removed, so two tables describing the same
/// relation compare equal.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FilterTable {
    map: HashMap<FilePath, BTreeSet<TestFilter>>,
}

impl FilterTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, key: &FilePath, filter: &TestFilter) {
        self.map
            .entry(key.clone())
            .or_default()
            .insert(filter.clone());
    }

    pub fn remove(&mut self, key: &FilePath, filter: &TestFilter) {
        if let Some(set) = self.map.get_mut(key) {
            set.remove(filter);
            if set.is_empty() {
                self.map.remove(key);
            }
        }
    }

    /// Filters for `key`, sorted.
    pub fn filters(&self, key: &FilePath) -> Vec<TestFilter> {
        self.map
            .get(key)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn contains_key(&self, key: &FilePath) -> bool {
        self.map.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}
