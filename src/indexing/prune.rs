// Index file pruner

use tracing::{debug, info};

use crate::error::StorageError;
use crate::normalize;
use crate::storage::Storage;

/// Remove index entries whose backing file no longer exists on disk,
/// in one transaction spanning the whole pass. Entities owned by a
/// pruned file go with it.
pub fn prune_missing_files<S: Storage>(storage: &mut S) -> Result<usize, StorageError> {
    let files = storage.files()?;

    storage.begin_transaction()?;
    let mut pruned = 0usize;
    for file in files {
        if normalize::uri_to_path(&file.uri).exists() {
            continue;
        }
        debug!("Pruning vanished file: {}", file.uri);
        if let Err(e) = storage.delete_file(file.id) {
            let _ = storage.rollback_transaction();
            return Err(e);
        }
        pruned += 1;
    }
    storage.commit_transaction()?;

    if pruned > 0 {
        info!("Pruned {} vanished files from the index", pruned);
    }
    Ok(pruned)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::indexing::pipeline::{FileIndexer, SkipStrategy};
    use crate::storage::sqlite::SqliteStorage;
    use tempfile::tempdir;

    #[test]
    fn test_prune_removes_vanished_files_and_their_entities() {
        let dir = tempdir().unwrap();
        let keep = dir.path().join("keep.php");
        let gone = dir.path().join("gone.php");
        std::fs::write(&keep, "<?php class Keep {}").unwrap();
        std::fs::write(&gone, "<?php class Gone { public $x; }").unwrap();

        let mut storage = SqliteStorage::open_in_memory().unwrap();
        for path in [&keep, &gone] {
            let uri = normalize::normalize_path(path);
            let source = std::fs::read_to_string(path).unwrap();
            FileIndexer::new(&mut storage)
                .index(
                    &uri,
                    &source,
                    SkipStrategy::Timestamp {
                        disk_mtime: 1,
                        overridden: false,
                    },
                )
                .unwrap();
        }
        let gone_structure = storage.structure_by_fqcn("\\Gone").unwrap();

        std::fs::remove_file(&gone).unwrap();
        let pruned = prune_missing_files(&mut storage).unwrap();
        assert_eq!(pruned, 1);

        // The vanished file is not found and its owned entities are
        // gone with it; the surviving file is untouched.
        let gone_uri = normalize::normalize_path(&gone);
        assert!(storage.file_by_uri(&gone_uri).unwrap_err().is_not_found());
        assert!(storage.structure_by_fqcn("\\Gone").is_err());
        assert!(storage
            .properties_of_structure(gone_structure.id)
            .unwrap()
            .is_empty());
        assert!(storage.structure_by_fqcn("\\Keep").is_ok());
    }

    #[test]
    fn test_prune_is_noop_when_everything_exists() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a.php");
        std::fs::write(&path, "<?php class A {}").unwrap();

        let mut storage = SqliteStorage::open_in_memory().unwrap();
        let uri = normalize::normalize_path(&path);
        FileIndexer::new(&mut storage)
            .index(
                &uri,
                "<?php class A {}",
                SkipStrategy::Timestamp {
                    disk_mtime: 1,
                    overridden: false,
                },
            )
            .unwrap();

        assert_eq!(prune_missing_files(&mut storage).unwrap(), 0);
        assert!(storage.file_by_uri(&uri).is_ok());
    }
}
