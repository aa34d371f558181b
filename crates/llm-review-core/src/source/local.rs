use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::{debug, warn};
use walkdir::{DirEntry, WalkDir};

use super::{ContentFetcher, FileCandidate, SourceEnumerator, SourceKind};
use crate::error::ReviewError;

/// Directories never descended into, for review and secret scanning alike.
pub const EXCLUDED_DIRS: &[&str] = &[
    ".git",
    "__pycache__",
    "node_modules",
    "venv",
    ".vscode",
    ".idea",
];

pub fn is_excluded_dir(entry: &DirEntry) -> bool {
    entry.depth() > 0
        && entry.file_type().is_dir()
        && entry
            .file_name()
            .to_str()
            .is_some_and(|name| EXCLUDED_DIRS.contains(&name))
}

/// Walk `root` in file-name order, skipping excluded directories.
pub fn walk(root: &Path) -> impl Iterator<Item = walkdir::Result<DirEntry>> + Send {
    WalkDir::new(root)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| !is_excluded_dir(entry))
}

/// `/`-separated path of `path` relative to `root`.
pub fn relative_path(root: &Path, path: &Path) -> String {
    let relative = path.strip_prefix(root).unwrap_or(path);
    relative
        .components()
        .map(|component| component.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

/// Local directory enumerator; the walk is stable across runs.
pub struct LocalEnumerator {
    root: PathBuf,
    entries: Box<dyn Iterator<Item = walkdir::Result<DirEntry>> + Send>,
    next_ordinal: usize,
}

impl LocalEnumerator {
    /// Fails with an I/O error when `root` is missing, not a directory or
    /// unreadable.
    pub fn open(root: &Path) -> Result<Self, ReviewError> {
        let display = root.display().to_string();
        let metadata = std::fs::metadata(root).map_err(|err| ReviewError::io(&display, err))?;
        if !metadata.is_dir() {
            return Err(ReviewError::io(
                &display,
                io::Error::new(io::ErrorKind::InvalidInput, "not a directory"),
            ));
        }
        std::fs::read_dir(root).map_err(|err| ReviewError::io(&display, err))?;

        Ok(Self {
            root: root.to_path_buf(),
            entries: Box::new(walk(root)),
            next_ordinal: 0,
        })
    }
}

#[async_trait]
impl SourceEnumerator for LocalEnumerator {
    async fn next_candidate(&mut self) -> Result<Option<FileCandidate>, ReviewError> {
        for entry in self.entries.by_ref() {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    let path = err
                        .path()
                        .map(|path| path.display().to_string())
                        .unwrap_or_default();
                    warn!(%path, error = %err, "skipping unreadable entry");
                    continue;
                }
            };
            if entry.file_type().is_dir() {
                continue;
            }
            // Follows symlinks; a dangling link keeps an unknown size and
            // fails when fetched.
            let size = std::fs::metadata(entry.path()).ok().map(|meta| meta.len());
            let path = relative_path(&self.root, entry.path());
            debug!(%path, ?size, "local candidate");
            let ordinal = self.next_ordinal;
            self.next_ordinal += 1;
            return Ok(Some(FileCandidate {
                ordinal,
                path,
                size,
                kind: SourceKind::Local,
                diff: None,
            }));
        }
        Ok(None)
    }
}

#[derive(Debug, Clone)]
pub struct LocalFetcher {
    root: PathBuf,
}

impl LocalFetcher {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }
}

#[async_trait]
impl ContentFetcher for LocalFetcher {
    async fn fetch(&self, candidate: &FileCandidate) -> Result<Vec<u8>, ReviewError> {
        let path = self.root.join(&candidate.path);
        tokio::fs::read(&path)
            .await
            .map_err(|err| ReviewError::io(&candidate.path, err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::collect_all;
    use std::fs;

    fn tree() -> tempfile::TempDir {
        let temp = tempfile::tempdir().unwrap();
        let root = temp.path();
        fs::create_dir_all(root.join("src/nested")).unwrap();
        fs::create_dir_all(root.join("node_modules/pkg")).unwrap();
        fs::create_dir_all(root.join(".git")).unwrap();
        fs::write(root.join("main.py"), "print('hi')\n").unwrap();
        fs::write(root.join("src/b.py"), "b = 2\n").unwrap();
        fs::write(root.join("src/a.py"), "a = 1\n").unwrap();
        fs::write(root.join("src/nested/c.js"), "let c;\n").unwrap();
        fs::write(root.join("node_modules/pkg/index.js"), "x").unwrap();
        fs::write(root.join(".git/config"), "[core]").unwrap();
        temp
    }

    #[tokio::test]
    async fn walks_in_file_name_order_and_skips_excluded_dirs() {
        let temp = tree();
        let mut enumerator = LocalEnumerator::open(temp.path()).unwrap();
        let files = collect_all(&mut enumerator).await.unwrap();
        let paths: Vec<_> = files.iter().map(|c| c.path.as_str()).collect();
        assert_eq!(paths, vec!["main.py", "src/a.py", "src/b.py", "src/nested/c.js"]);
        assert_eq!(files[0].size, Some(12));
        assert_eq!(files[3].ordinal, 3);
    }

    #[tokio::test]
    async fn order_is_stable_across_runs() {
        let temp = tree();
        let first = collect_all(&mut LocalEnumerator::open(temp.path()).unwrap())
            .await
            .unwrap();
        let second = collect_all(&mut LocalEnumerator::open(temp.path()).unwrap())
            .await
            .unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn missing_root_is_io_error() {
        let temp = tempfile::tempdir().unwrap();
        let err = LocalEnumerator::open(&temp.path().join("absent")).err().unwrap();
        assert!(matches!(err, ReviewError::Io { .. }));
    }

    #[test]
    fn file_root_is_rejected() {
        let temp = tree();
        let err = LocalEnumerator::open(&temp.path().join("main.py")).err().unwrap();
        assert!(err.to_string().contains("not a directory"));
    }

    #[tokio::test]
    async fn fetcher_reads_relative_paths() {
        let temp = tree();
        let fetcher = LocalFetcher::new(temp.path().to_path_buf());
        let candidate = FileCandidate {
            ordinal: 0,
            path: "src/a.py".into(),
            size: None,
            kind: SourceKind::Local,
            diff: None,
        };
        assert_eq!(fetcher.fetch(&candidate).await.unwrap(), b"a = 1\n");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn dangling_symlink_is_listed_but_fails_to_fetch() {
        let temp = tree();
        std::os::unix::fs::symlink(temp.path().join("gone.py"), temp.path().join("broken.py"))
            .unwrap();
        let files = collect_all(&mut LocalEnumerator::open(temp.path()).unwrap())
            .await
            .unwrap();
        let broken = files.iter().find(|c| c.path == "broken.py").unwrap();
        assert_eq!(broken.size, None);

        let fetcher = LocalFetcher::new(temp.path().to_path_buf());
        let err = fetcher.fetch(broken).await.unwrap_err();
        assert!(matches!(err, ReviewError::Io { .. }));
        assert!(err.to_string().contains("broken.py"));
    }
}
