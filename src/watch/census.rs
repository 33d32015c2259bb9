// src/watch/census.rs

//! Reference counts of watched paths.

use std::collections::HashMap;

use crate::protocol::FilePath;

/// How many dependency entries currently need each path watched.
///
/// A path is present exactly while its count is above zero.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FilePathCensus {
    counts: HashMap<FilePath, usize>,
}

impl FilePathCensus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the new count.
    pub fn increment(&mut self, path: &FilePath) -> usize {
        let count = self.counts.entry(path.clone()).or_insert(0);
        *count += 1;
        *count
    }

    /// Returns the new count.
    ///
    /// # Panics
    ///
    /// If `path` is not present: the count would go below zero.
    pub fn decrement(&mut self, path: &FilePath) -> usize {
        match self.counts.get_mut(path) {
            Some(count) if *count > 1 => {
                *count -= 1;
                *count
            }
            Some(_) => {
                self.counts.remove(path);
                0
            }
            None => panic!("census count for {path} would drop below zero"),
        }
    }

    pub fn count(&self, path: &FilePath) -> usize {
        self.counts.get(path).copied().unwrap_or(0)
    }

    pub fn contains(&self, path: &FilePath) -> bool {
        self.counts.contains_key(path)
    }

    pub fn len(&self) -> usize {
        self.counts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }

    /// Every censused path, sorted.
    pub fn paths(&self) -> Vec<FilePath> {
        let mut paths: Vec<FilePath> = self.counts.keys().cloned().collect();
        paths.sort();
        paths
    }

    /// Count `current` in and `previous` out.
    ///
    /// Identical slices are a no-op. Returns whether any path entered or left
    /// the watched set.
    pub fn exchange(&mut self, previous: &[FilePath], current: &[FilePath]) -> bool {
        if previous == current {
            return false;
        }

        let mut added = false;
        for path in current {
            if self.increment(path) == 1 {
                added = true;
            }
        }

        let mut removed = false;
        for path in previous {
            if self.decrement(path) == 0 {
                removed = true;
            }
        }

        added || removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn paths(names: &[&str]) -> Vec<FilePath> {
        names.iter().map(|n| FilePath::from(*n)).collect()
    }

    #[test]
    fn exchange_reports_membership_changes() {
        let mut census = FilePathCensus::new();
        assert!(census.exchange(&[], &paths(&["/a", "/b"])));
        // "/a" is already present; a second reference changes nothing.
        assert!(!census.exchange(&[], &paths(&["/a"])));
        // Moving a reference between present paths changes nothing either.
        assert!(!census.exchange(&paths(&["/a"]), &paths(&["/b"])));
        assert_eq!(census.count(&FilePath::from("/a")), 1);
        assert_eq!(census.count(&FilePath::from("/b")), 2);
        // The last reference leaving does.
        assert!(census.exchange(&paths(&["/a"]), &[]));
        assert!(!census.contains(&FilePath::from("/a")));
    }

    #[test]
    fn exchange_of_identical_slices_is_a_no_op() {
        let mut census = FilePathCensus::new();
        census.exchange(&[], &paths(&["/a"]));
        let before = census.clone();
        assert!(!census.exchange(&paths(&["/a"]), &paths(&["/a"])));
        assert_eq!(census, before);
    }

    #[test]
    #[should_panic(expected = "below zero")]
    fn decrement_below_zero_panics() {
        let mut census = FilePathCensus::new();
        census.decrement(&FilePath::from("/never"));
    }
}
