// Skip decisions: is indexing work needed for this file at all?

use crate::storage::SourceFile;

/// blake3 hex digest of a file's source text.
pub fn source_hash(source: &str) -> String {
    blake3::hash(source.as_bytes()).to_string()
}

/// Timestamp strategy, used by bulk/project indexing: a file is skipped
/// when its on-disk modification time is not newer than its last-indexed
/// timestamp. A caller-supplied override source (an unsaved editor
/// buffer) bypasses the check unconditionally; disk state says nothing
/// about the buffer.
pub fn is_up_to_date(prior: Option<&SourceFile>, disk_mtime: i64, has_override_source: bool) -> bool {
    if has_override_source {
        return false;
    }
    match prior {
        Some(file) => disk_mtime <= file.last_indexed,
        None => false,
    }
}

/// Outcome of the content-hash strategy, used by single-file
/// "did-change" indexing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HashDecision {
    /// Content is identical to the last indexed version; the index body
    /// can be skipped. The hash is still written back so a later
    /// identical edit is recognized without recomputation.
    SkipBody { hash: String },
    /// Content differs (or was never hashed); a full index is needed.
    IndexBody { hash: String },
}

pub fn check_hash(prior: Option<&SourceFile>, source: &str) -> HashDecision {
    let hash = source_hash(source);
    match prior.and_then(|file| file.source_hash.as_deref()) {
        Some(stored) if stored == hash => HashDecision::SkipBody { hash },
        _ => HashDecision::IndexBody { hash },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file(last_indexed: i64, hash: Option<&str>) -> SourceFile {
        SourceFile {
            id: 1,
            uri: "/src/A.php".to_string(),
            last_indexed,
            source_hash: hash.map(str::to_string),
        }
    }

    #[test]
    fn test_timestamp_skips_unmodified_file() {
        let prior = file(100, None);
        assert!(is_up_to_date(Some(&prior), 100, false));
        assert!(is_up_to_date(Some(&prior), 50, false));
        assert!(!is_up_to_date(Some(&prior), 150, false));
    }

    #[test]
    fn test_timestamp_never_skips_unknown_file() {
        assert!(!is_up_to_date(None, 0, false));
    }

    #[test]
    fn test_override_source_bypasses_timestamp() {
        let prior = file(100, None);
        assert!(!is_up_to_date(Some(&prior), 50, true));
    }

    #[test]
    fn test_hash_skip_on_identical_content() {
        let source = "<?php class A {}";
        let hash = source_hash(source);
        let prior = file(100, Some(&hash));

        assert_eq!(
            check_hash(Some(&prior), source),
            HashDecision::SkipBody { hash }
        );
    }

    #[test]
    fn test_hash_index_on_changed_or_unhashed_content() {
        let source = "<?php class A {}";
        let hash = source_hash(source);

        // Never hashed (bulk path indexed it) -> index.
        let unhashed = file(100, None);
        assert_eq!(
            check_hash(Some(&unhashed), source),
            HashDecision::IndexBody { hash: hash.clone() }
        );

        // Different content -> index.
        let prior = file(100, Some(&hash));
        assert!(matches!(
            check_hash(Some(&prior), "<?php class B {}"),
            HashDecision::IndexBody { .. }
        ));

        // Unknown file -> index.
        assert!(matches!(
            check_hash(None, source),
            HashDecision::IndexBody { .. }
        ));
    }
}
