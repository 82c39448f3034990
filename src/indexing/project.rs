// Directory/project demultiplexer
//
// Expands one or more root paths into a bounded, materialized list of
// per-file work items. The listing is computed once because it also
// drives total-progress reporting.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use globset::{Glob, GlobSet, GlobSetBuilder};
use tracing::{debug, warn};
use walkdir::WalkDir;

use super::change;
use crate::error::StorageError;
use crate::normalize;
use crate::storage::{SourceFile, Storage};

/// One unit of file-index work produced by the demultiplexer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileCandidate {
    pub uri: String,
    pub path: PathBuf,
    pub disk_mtime: i64,
}

/// Extension and exclusion filters for candidate enumeration.
#[derive(Debug, Clone)]
pub struct ScanFilter {
    extensions: Vec<String>,
    excludes: GlobSet,
}

impl ScanFilter {
    pub fn new(extensions: &[String], exclude_globs: &[String]) -> Result<Self, StorageError> {
        let mut builder = GlobSetBuilder::new();
        for pattern in exclude_globs {
            let glob = Glob::new(pattern)
                .map_err(|e| StorageError::Backend(format!("bad exclusion glob `{pattern}`: {e}")))?;
            builder.add(glob);
        }
        Ok(Self {
            extensions: extensions.to_vec(),
            excludes: builder
                .build()
                .map_err(|e| StorageError::Backend(format!("bad exclusion globs: {e}")))?,
        })
    }

    pub fn matches(&self, path: &Path) -> bool {
        let has_extension = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| self.extensions.iter().any(|e| e == ext))
            .unwrap_or(false);
        has_extension && !self.excludes.is_match(path)
    }
}

/// Enumerate every indexable file under the given roots, in a
/// deterministic order, pre-filtered by the timestamp skip strategy.
/// Files whose override source is registered bypass the timestamp
/// filter (`overridden_uris`).
pub fn collect_candidates<S: Storage>(
    roots: &[PathBuf],
    filter: &ScanFilter,
    storage: &S,
    overridden_uris: &dyn Fn(&str) -> bool,
) -> Result<Vec<FileCandidate>, StorageError> {
    // One bulk lookup instead of a point query per file.
    let known: HashMap<String, SourceFile> = storage
        .files()?
        .into_iter()
        .map(|f| (f.uri.clone(), f))
        .collect();

    let mut candidates = Vec::new();
    for root in roots {
        if root.is_file() {
            if let Some(candidate) = candidate_for(root, filter) {
                candidates.push(candidate);
            }
            continue;
        }

        for entry in WalkDir::new(root)
            .sort_by_file_name()
            .into_iter()
            .filter_map(|entry| match entry {
                Ok(entry) => Some(entry),
                Err(e) => {
                    warn!("Skipping unreadable path: {}", e);
                    None
                }
            })
        {
            if !entry.file_type().is_file() {
                continue;
            }
            if let Some(candidate) = candidate_for(entry.path(), filter) {
                candidates.push(candidate);
            }
        }
    }

    let total_found = candidates.len();
    candidates.retain(|candidate| {
        !change::is_up_to_date(
            known.get(&candidate.uri),
            candidate.disk_mtime,
            overridden_uris(&candidate.uri),
        )
    });
    debug!(
        "Demultiplexed {} files ({} skipped as up to date)",
        candidates.len(),
        total_found - candidates.len()
    );

    Ok(candidates)
}

fn candidate_for(path: &Path, filter: &ScanFilter) -> Option<FileCandidate> {
    if !filter.matches(path) {
        return None;
    }
    let mtime = disk_mtime(path)?;
    Some(FileCandidate {
        uri: normalize::normalize_path(path),
        path: path.to_path_buf(),
        disk_mtime: mtime,
    })
}

/// Filesystem modification time in unix seconds. `None` for files that
/// vanished between enumeration and stat.
pub fn disk_mtime(path: &Path) -> Option<i64> {
    let modified = std::fs::metadata(path).ok()?.modified().ok()?;
    Some(
        modified
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or_default(),
    )
}

/// Progress for an originating bulk request: emitted after each file,
/// with a single completion signal decoupled from work-item production.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexProgress {
    pub uri: String,
    pub index: usize,
    pub total: usize,
}

impl IndexProgress {
    pub fn percentage(&self) -> f64 {
        if self.total == 0 {
            100.0
        } else {
            (self.index as f64 / self.total as f64) * 100.0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::sqlite::SqliteStorage;
    use std::fs;
    use tempfile::tempdir;

    fn write(dir: &Path, name: &str, contents: &str) -> PathBuf {
        let path = dir.join(name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(&path, contents).unwrap();
        path
    }

    fn php_filter(excludes: &[&str]) -> ScanFilter {
        let excludes: Vec<String> = excludes.iter().map(|s| s.to_string()).collect();
        ScanFilter::new(&["php".to_string(), "phpt".to_string()], &excludes).unwrap()
    }

    #[test]
    fn test_extension_and_exclusion_filtering() {
        let dir = tempdir().unwrap();
        write(dir.path(), "src/A.php", "<?php");
        write(dir.path(), "src/readme.md", "nope");
        write(dir.path(), "vendor/lib/B.php", "<?php");

        let storage = SqliteStorage::open_in_memory().unwrap();
        let filter = php_filter(&["**/vendor/**"]);
        let candidates = collect_candidates(
            &[dir.path().to_path_buf()],
            &filter,
            &storage,
            &|_| false,
        )
        .unwrap();

        assert_eq!(candidates.len(), 1);
        assert!(candidates[0].uri.ends_with("A.php"));
    }

    #[test]
    fn test_listing_is_deterministic() {
        let dir = tempdir().unwrap();
        write(dir.path(), "b.php", "<?php");
        write(dir.path(), "a.php", "<?php");
        write(dir.path(), "c.php", "<?php");

        let storage = SqliteStorage::open_in_memory().unwrap();
        let filter = php_filter(&[]);
        let first = collect_candidates(&[dir.path().to_path_buf()], &filter, &storage, &|_| false)
            .unwrap();
        let second = collect_candidates(&[dir.path().to_path_buf()], &filter, &storage, &|_| false)
            .unwrap();

        assert_eq!(first, second);
        let names: Vec<&str> = first
            .iter()
            .map(|c| c.path.file_name().unwrap().to_str().unwrap())
            .collect();
        assert_eq!(names, vec!["a.php", "b.php", "c.php"]);
    }

    #[test]
    fn test_timestamp_prefilter_drops_up_to_date_files() {
        let dir = tempdir().unwrap();
        let path = write(dir.path(), "a.php", "<?php");
        let uri = normalize::normalize_path(&path);
        let mtime = disk_mtime(&path).unwrap();

        let mut storage = SqliteStorage::open_in_memory().unwrap();
        storage.begin_transaction().unwrap();
        storage.upsert_file(&uri, mtime + 10, None).unwrap();
        storage.commit_transaction().unwrap();

        let filter = php_filter(&[]);
        let candidates =
            collect_candidates(&[dir.path().to_path_buf()], &filter, &storage, &|_| false).unwrap();
        assert!(candidates.is_empty());

        // An override source bypasses the timestamp filter for that
        // file only.
        let candidates =
            collect_candidates(&[dir.path().to_path_buf()], &filter, &storage, &|u| u == uri)
                .unwrap();
        assert_eq!(candidates.len(), 1);
    }

    #[test]
    fn test_single_file_root() {
        let dir = tempdir().unwrap();
        let path = write(dir.path(), "only.php", "<?php");

        let storage = SqliteStorage::open_in_memory().unwrap();
        let filter = php_filter(&[]);
        let candidates = collect_candidates(&[path], &filter, &storage, &|_| false).unwrap();
        assert_eq!(candidates.len(), 1);
    }

    #[test]
    fn test_progress_percentage() {
        let progress = IndexProgress {
            uri: "/src/a.php".to_string(),
            index: 25,
            total: 50,
        };
        assert_eq!(progress.percentage(), 50.0);

        let done = IndexProgress {
            uri: "/src/a.php".to_string(),
            index: 0,
            total: 0,
        };
        assert_eq!(done.percentage(), 100.0);
    }
}
