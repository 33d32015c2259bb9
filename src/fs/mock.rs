// src/fs/mock.rs

use std::collections::{BTreeMap, BTreeSet};
use std::io::{Cursor, Read};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::{Result, anyhow};

use super::FileSystem;

#[derive(Debug, Default)]
struct Tree {
    files: BTreeMap<PathBuf, Vec<u8>>,
    /// Directory -> child names. Directories appear as files are added.
    dirs: BTreeMap<PathBuf, BTreeSet<String>>,
}

/// In-memory filesystem for project trees in tests. Clones share contents,
/// so a test can edit files the code under test already holds.
#[derive(Debug, Clone, Default)]
pub struct MockFileSystem {
    tree: Arc<Mutex<Tree>>,
}

impl MockFileSystem {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create or overwrite a file, creating its parent directories.
    pub fn add_file(&self, path: impl AsRef<Path>, content: impl Into<Vec<u8>>) {
        let path = path.as_ref();
        let mut tree = self.lock();
        tree.files.insert(path.to_path_buf(), content.into());

        let mut child = path;
        while let Some(parent) = child.parent() {
            let Some(name) = child.file_name().and_then(|n| n.to_str()) else {
                break;
            };
            tree.dirs
                .entry(parent.to_path_buf())
                .or_default()
                .insert(name.to_string());
            child = parent;
        }
    }

    /// Delete a file and unlink it from its directory.
    pub fn remove_file(&self, path: impl AsRef<Path>) {
        let path = path.as_ref();
        let mut tree = self.lock();
        tree.files.remove(path);
        if let (Some(parent), Some(name)) = (path.parent(), path.file_name().and_then(|n| n.to_str())) {
            if let Some(children) = tree.dirs.get_mut(parent) {
                children.remove(name);
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, Tree> {
        self.tree.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl FileSystem for MockFileSystem {
    fn open_read(&self, path: &Path) -> Result<Box<dyn Read + Send>> {
        let tree = self.lock();
        match tree.files.get(path) {
            Some(content) => Ok(Box::new(Cursor::new(content.clone()))),
            None if tree.dirs.contains_key(path) => Err(anyhow!("{} is a directory", path.display())),
            None => Err(anyhow!("{} not found", path.display())),
        }
    }

    fn exists(&self, path: &Path) -> bool {
        let tree = self.lock();
        tree.files.contains_key(path) || tree.dirs.contains_key(path)
    }

    fn is_file(&self, path: &Path) -> bool {
        self.lock().files.contains_key(path)
    }

    fn is_dir(&self, path: &Path) -> bool {
        self.lock().dirs.contains_key(path)
    }

    fn read_dir(&self, path: &Path) -> Result<Vec<PathBuf>> {
        match self.lock().dirs.get(path) {
            Some(children) => Ok(children.iter().map(|name| path.join(name)).collect()),
            None => Err(anyhow!("{} is not a directory", path.display())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn removed_files_leave_their_directory_listing() {
        let fs = MockFileSystem::new();
        fs.add_file("/proj/lib/a.rb", "a");
        fs.add_file("/proj/lib/b.rb", "b");
        assert!(fs.is_dir(Path::new("/proj")));
        assert_eq!(fs.read_dir(Path::new("/proj")).unwrap(), vec![PathBuf::from("/proj/lib")]);

        fs.remove_file("/proj/lib/a.rb");
        assert!(!fs.exists(Path::new("/proj/lib/a.rb")));
        assert_eq!(
            fs.read_dir(Path::new("/proj/lib")).unwrap(),
            vec![PathBuf::from("/proj/lib/b.rb")]
        );
        assert!(fs.open_read(Path::new("/proj/lib/a.rb")).is_err());
    }
}
