// src/watch/content_filter.rs

//! Drops change notifications whose file content did not actually change.

use std::collections::HashMap;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::errors::Result;
use crate::fs::FileSystem;
use crate::protocol::FileDigest;

use super::backend::FileEvent;

/// Lowercase hex SHA-256 of a file's contents. Workers report the same
/// digest for the files they load.
pub fn digest_file(fs: &dyn FileSystem, path: &Path) -> Result<FileDigest> {
    let mut hasher = Sha256::new();
    let mut file = fs.open_read(path)?;
    let mut buf = [0u8; 8192];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(FileDigest::new(hex::encode(hasher.finalize())))
}

/// Last known digest per absolute path.
#[derive(Debug)]
pub struct ContentChangeFilter {
    fs: Arc<dyn FileSystem>,
    digests: Mutex<HashMap<PathBuf, FileDigest>>,
}

impl ContentChangeFilter {
    pub fn new(fs: Arc<dyn FileSystem>) -> Self {
        Self {
            fs,
            digests: Mutex::new(HashMap::new()),
        }
    }

    /// Record a digest learned elsewhere (e.g. reported by a worker).
    /// Unknown digests are ignored.
    pub fn set_digest(&self, path: &Path, digest: &FileDigest) {
        if digest.is_unknown() {
            return;
        }
        self.lock().insert(path.to_path_buf(), digest.clone());
    }

    pub fn digest(&self, path: &Path) -> Option<FileDigest> {
        self.lock().get(path).cloned()
    }

    /// Keep only files whose content differs from the last recorded digest.
    ///
    /// Returns `None` if nothing in the batch changed.
    pub fn filter(&self, mut event: FileEvent) -> Option<FileEvent> {
        let mut changed = Vec::with_capacity(event.files.len());

        for mut file in std::mem::take(&mut event.files) {
            let path = event.root.join(&file.name);
            let previous = self.digest(&path);

            if file.exists {
                match digest_file(self.fs.as_ref(), &path) {
                    Ok(digest) => {
                        if previous.as_ref() != Some(&digest) {
                            file.new = previous.is_none();
                            self.lock().insert(path.clone(), digest);
                            changed.push(file.clone());
                        } else {
                            debug!(path = %path.display(), "content unchanged; dropping");
                        }
                    }
                    Err(_) if !self.fs.exists(&path) => {
                        // Deleted between the notification and the digest.
                        file.exists = false;
                        file.new = false;
                    }
                    Err(err) => {
                        warn!(path = %path.display(), error = %err, "failed to digest changed file");
                        changed.push(file.clone());
                    }
                }
            }

            if !file.exists && previous.is_some() {
                self.lock().remove(&path);
                changed.push(file);
            }
        }

        if changed.is_empty() {
            None
        } else {
            event.files = changed;
            Some(event)
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<PathBuf, FileDigest>> {
        self.digests.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::mock::MockFileSystem;
    use crate::watch::backend::ChangedFile;

    const PUTS_1_SHA256: &str = "f2c7db2e825f0b1daa35dd6eedc190cdb1c29a2d2da229835336aa00b22d845e";

    fn event(files: Vec<ChangedFile>) -> FileEvent {
        FileEvent {
            root: PathBuf::from("/proj"),
            files,
        }
    }

    #[test]
    fn same_digest_is_dropped() {
        let fs = MockFileSystem::new();
        fs.add_file("/proj/lib/a.rb", "puts 1");
        let filter = ContentChangeFilter::new(Arc::new(fs.clone()));
        let digest = digest_file(&fs, Path::new("/proj/lib/a.rb")).unwrap();
        filter.set_digest(Path::new("/proj/lib/a.rb"), &digest);

        assert!(filter.filter(event(vec![ChangedFile::changed("lib/a.rb")])).is_none());
    }

    #[test]
    fn digests_are_hex_sha256() {
        let fs = MockFileSystem::new();
        fs.add_file("/proj/lib/a.rb", "puts 1");
        let digest = digest_file(&fs, Path::new("/proj/lib/a.rb")).unwrap();
        assert_eq!(digest.as_str(), PUTS_1_SHA256);
    }

    #[test]
    fn worker_reported_digest_absorbs_unchanged_touch() {
        let fs = MockFileSystem::new();
        fs.add_file("/proj/lib/a.rb", "puts 1");
        let filter = ContentChangeFilter::new(Arc::new(fs.clone()));
        filter.set_digest(Path::new("/proj/lib/a.rb"), &FileDigest::new(PUTS_1_SHA256));

        assert!(filter.filter(event(vec![ChangedFile::changed("lib/a.rb")])).is_none());

        fs.add_file("/proj/lib/a.rb", "puts 2");
        assert!(filter.filter(event(vec![ChangedFile::changed("lib/a.rb")])).is_some());
    }

    #[test]
    fn new_content_is_kept_and_recorded() {
        let fs = MockFileSystem::new();
        fs.add_file("/proj/lib/a.rb", "puts 1");
        let filter = ContentChangeFilter::new(Arc::new(fs.clone()));

        let kept = filter.filter(event(vec![ChangedFile::changed("lib/a.rb")])).unwrap();
        assert!(kept.files[0].new);
        // A duplicate notification for the same content is absorbed.
        assert!(filter.filter(event(vec![ChangedFile::changed("lib/a.rb")])).is_none());

        fs.add_file("/proj/lib/a.rb", "puts 2");
        let kept = filter.filter(event(vec![ChangedFile::changed("lib/a.rb")])).unwrap();
        assert!(!kept.files[0].new);
    }

    #[test]
    fn deletions_only_pass_for_known_files() {
        let fs = MockFileSystem::new();
        let filter = ContentChangeFilter::new(Arc::new(fs));
        assert!(filter.filter(event(vec![ChangedFile::deleted("lib/gone.rb")])).is_none());

        filter.set_digest(Path::new("/proj/lib/known.rb"), &FileDigest::new("abc"));
        let kept = filter.filter(event(vec![ChangedFile::deleted("lib/known.rb")])).unwrap();
        assert_eq!(kept.files.len(), 1);
        assert!(filter.digest(Path::new("/proj/lib/known.rb")).is_none());
    }

    #[test]
    fn vanished_file_is_treated_as_deleted() {
        let fs = MockFileSystem::new();
        let filter = ContentChangeFilter::new(Arc::new(fs));
        filter.set_digest(Path::new("/proj/lib/raced.rb"), &FileDigest::new("abc"));

        let kept = filter.filter(event(vec![ChangedFile::changed("lib/raced.rb")])).unwrap();
        assert!(!kept.files[0].exists);
    }
}
