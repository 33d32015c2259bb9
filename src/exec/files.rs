// src/exec/files.rs

//! Expanding a runner's test-file globs into concrete files.

use std::path::{Path, PathBuf};

use anyhow::Context as _;
use globset::{Glob, GlobSet, GlobSetBuilder};

use crate::errors::Result;
use crate::fs::FileSystem;
use crate::protocol::FilePath;

/// Compile simple string patterns into one matcher.
pub fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pat in patterns {
        let glob = Glob::new(pat).with_context(|| format!("invalid glob pattern: {pat}"))?;
        builder.add(glob);
    }
    Ok(builder.build().context("building globset")?)
}

/// Every file under `root` whose root-relative path matches `patterns`,
/// sorted by path. Directories in `ignore_dirs` are not descended into.
pub fn list_test_files(
    fs: &dyn FileSystem,
    root: &Path,
    ignore_dirs: &[PathBuf],
    patterns: &[String],
) -> Result<Vec<FilePath>> {
    let globs = build_globset(patterns)?;
    let mut files = Vec::new();
    let mut stack = vec![root.to_path_buf()];

    while let Some(dir) = stack.pop() {
        for path in fs.read_dir(&dir)? {
            if fs.is_dir(&path) {
                if !ignore_dirs.contains(&path) {
                    stack.push(path);
                }
            } else if fs.is_file(&path) {
                if let Ok(rel) = path.strip_prefix(root) {
                    let rel_str = rel.to_string_lossy().replace('\\', "/");
                    if globs.is_match(&rel_str) {
                        files.push(FilePath::from(path));
                    }
                }
            }
        }
    }

    files.sort();
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::mock::MockFileSystem;

    #[test]
    fn lists_only_matching_files() {
        let fs = MockFileSystem::new();
        fs.add_file("/proj/spec/a_spec.rb", "");
        fs.add_file("/proj/spec/models/b_spec.rb", "");
        fs.add_file("/proj/spec/spec_helper.rb", "");
        fs.add_file("/proj/lib/a.rb", "");
        fs.add_file("/proj/tmp/spec/c_spec.rb", "");

        let files = list_test_files(
            &fs,
            Path::new("/proj"),
            &[PathBuf::from("/proj/tmp")],
            &["spec/**/*_spec.rb".to_string(), "tmp/spec/*_spec.rb".to_string()],
        )
        .unwrap();

        assert_eq!(
            files,
            vec![
                FilePath::from("/proj/spec/a_spec.rb"),
                FilePath::from("/proj/spec/models/b_spec.rb"),
            ]
        );
    }
}
