//! Package root handling and change detection.
//!
//! The controller's warm state is only valid for the files it was built
//! from. A [`Fingerprint`] records size and modification time of every file
//! under the package root; comparing two fingerprints tells the runner
//! whether the controller has to be rebuilt.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use walkdir::{DirEntry, WalkDir};

use crate::config::IgnoreRules;
use crate::error::{Error, Result};

/// Resolve a package root to an absolute directory.
///
/// # Errors
/// Returns [`Error::PathNotFound`] if the path does not exist.
pub fn resolve_root(path: &Path) -> Result<PathBuf> {
    if !path.exists() {
        return Err(Error::PathNotFound(path.to_path_buf()));
    }
    Ok(fs::canonicalize(path)?)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FileStamp {
    size: u64,
    modified: Option<SystemTime>,
}

/// Snapshot of the files under a package root.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Fingerprint {
    files: BTreeMap<PathBuf, FileStamp>,
}

impl Fingerprint {
    /// Walk `root` and stamp every file the rules admit. Paths are stored
    /// relative to `root`.
    pub fn scan(root: &Path, rules: &IgnoreRules) -> Result<Self> {
        let mut files = BTreeMap::new();

        let walker = WalkDir::new(root)
            .follow_links(false)
            .into_iter()
            .filter_entry(|entry| {
                entry.depth() == 0
                    || !entry.file_type().is_dir()
                    || !rules.skips_dir(&entry.file_name().to_string_lossy())
            });

        for entry in walker {
            if let Some((relative, stamp)) = stamp_entry(entry, root, rules)? {
                files.insert(relative, stamp);
            }
        }

        Ok(Self { files })
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn contains(&self, relative: &Path) -> bool {
        self.files.contains_key(relative)
    }

    /// What changed going from `self` to `newer`.
    pub fn diff(&self, newer: &Fingerprint) -> FingerprintDiff {
        let mut diff = FingerprintDiff::default();

        for (path, stamp) in &newer.files {
            match self.files.get(path) {
                None => diff.added.push(path.clone()),
                Some(old) if old != stamp => diff.modified.push(path.clone()),
                Some(_) => {}
            }
        }
        diff.removed = self
            .files
            .keys()
            .filter(|path| !newer.files.contains_key(*path))
            .cloned()
            .collect();

        diff
    }
}

/// Stamp one walked entry. Files deleted while the walk runs are skipped.
fn stamp_entry(
    entry: walkdir::Result<DirEntry>,
    root: &Path,
    rules: &IgnoreRules,
) -> Result<Option<(PathBuf, FileStamp)>> {
    let entry = match entry {
        Ok(entry) => entry,
        Err(e) if vanished(&e) => return Ok(None),
        Err(e) => {
            return Err(Error::Io(e.into_io_error().unwrap_or_else(|| {
                io::Error::other("filesystem loop while scanning package")
            })));
        }
    };
    if !entry.file_type().is_file() || rules.skips_file(entry.path()) {
        return Ok(None);
    }

    let metadata = match entry.metadata() {
        Ok(metadata) => metadata,
        Err(e) if vanished(&e) => return Ok(None),
        Err(e) => {
            return Err(Error::Io(
                e.into_io_error()
                    .unwrap_or_else(|| io::Error::other("metadata unavailable")),
            ));
        }
    };
    let relative = entry
        .path()
        .strip_prefix(root)
        .unwrap_or(entry.path())
        .to_path_buf();
    Ok(Some((
        relative,
        FileStamp {
            size: metadata.len(),
            modified: metadata.modified().ok(),
        },
    )))
}

fn vanished(error: &walkdir::Error) -> bool {
    error
        .io_error()
        .is_some_and(|e| e.kind() == io::ErrorKind::NotFound)
}

/// Files that differ between two fingerprints, in path order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FingerprintDiff {
    pub added: Vec<PathBuf>,
    pub removed: Vec<PathBuf>,
    pub modified: Vec<PathBuf>,
}

impl FingerprintDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.modified.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::io::Write;
    use tempfile::TempDir;

    fn write(dir: &Path, relative: &str, contents: &str) {
        let path = dir.join(relative);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        File::create(path)
            .unwrap()
            .write_all(contents.as_bytes())
            .unwrap();
    }

    fn package() -> TempDir {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "pkg/__init__.py", "");
        write(dir.path(), "pkg/tools.py", "def helper(): pass\n");
        write(dir.path(), ".git/HEAD", "ref: refs/heads/main\n");
        write(dir.path(), "target/debug/out", "binary");
        dir
    }

    #[test]
    fn test_resolve_root() {
        let dir = package();
        assert!(resolve_root(dir.path()).unwrap().is_absolute());
        assert!(matches!(
            resolve_root(&dir.path().join("does-not-exist")),
            Err(Error::PathNotFound(_))
        ));
    }

    #[test]
    fn test_scan_respects_ignore_rules() {
        let dir = package();
        let fingerprint = Fingerprint::scan(dir.path(), &IgnoreRules::default()).unwrap();

        assert_eq!(fingerprint.len(), 2);
        assert!(fingerprint.contains(Path::new("pkg/tools.py")));
        assert!(!fingerprint.contains(Path::new(".git/HEAD")));
        assert!(!fingerprint.contains(Path::new("target/debug/out")));
    }

    #[test]
    fn test_unchanged_package_has_empty_diff() {
        let dir = package();
        let rules = IgnoreRules::default();
        let first = Fingerprint::scan(dir.path(), &rules).unwrap();
        let second = Fingerprint::scan(dir.path(), &rules).unwrap();

        assert!(first.diff(&second).is_empty());
        assert_eq!(first, second);
    }

    #[test]
    fn test_diff_classifies_changes() {
        let dir = package();
        let rules = IgnoreRules::default();
        let before = Fingerprint::scan(dir.path(), &rules).unwrap();

        write(dir.path(), "pkg/new_module.py", "x = 1\n");
        fs::remove_file(dir.path().join("pkg/__init__.py")).unwrap();
        // Size change, so the result does not depend on mtime granularity.
        write(dir.path(), "pkg/tools.py", "def helper():\n    return 42\n");
        // Ignored directories never show up.
        write(dir.path(), "target/debug/other", "binary");

        let after = Fingerprint::scan(dir.path(), &rules).unwrap();
        let diff = before.diff(&after);

        assert_eq!(diff.added, vec![PathBuf::from("pkg/new_module.py")]);
        assert_eq!(diff.removed, vec![PathBuf::from("pkg/__init__.py")]);
        assert_eq!(diff.modified, vec![PathBuf::from("pkg/tools.py")]);
    }

    #[test]
    fn test_files_deleted_mid_scan_are_skipped() {
        let dir = package();
        let rules = IgnoreRules::default();
        let entries: Vec<_> = WalkDir::new(dir.path()).into_iter().collect();
        fs::remove_file(dir.path().join("pkg/tools.py")).unwrap();

        let mut stamped = Vec::new();
        for entry in entries {
            if let Some((relative, _)) = stamp_entry(entry, dir.path(), &rules).unwrap() {
                stamped.push(relative);
            }
        }

        assert!(stamped.contains(&PathBuf::from("pkg/__init__.py")));
        assert!(!stamped.contains(&PathBuf::from("pkg/tools.py")));
    }
}
