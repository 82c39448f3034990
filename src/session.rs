// Workspace/session lifecycle

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::info;

use crate::config::Config;
use crate::storage::events::EventedStorage;
use crate::storage::sqlite::{DatabaseLocation, SqliteStorage};
use crate::storage::{AccessModifierRow, Storage, StructureTypeRow};

/// Latest-known source text per file, maintained by the external
/// editor-sync layer. When present it overrides disk content.
#[derive(Default)]
pub struct SourceRegistry {
    sources: RwLock<HashMap<String, String>>,
}

impl SourceRegistry {
    pub fn set_latest_source(&self, uri: &str, source: String) {
        self.sources.write().insert(uri.to_string(), source);
    }

    pub fn clear_latest_source(&self, uri: &str) {
        self.sources.write().remove(uri);
    }

    pub fn latest_source(&self, uri: &str) -> Option<String> {
        self.sources.read().get(uri).cloned()
    }

    pub fn has_latest_source(&self, uri: &str) -> bool {
        self.sources.read().contains_key(uri)
    }
}

/// One workspace's indexing state: the evented storage handle, the
/// latest-source registry, and the cached lookup tables. A session is
/// recreated, never mutated in place, when the workspace configuration
/// changes; everything that needs it receives a handle.
pub struct IndexSession {
    storage: EventedStorage<SqliteStorage>,
    sources: Arc<SourceRegistry>,
    access_modifiers: Vec<AccessModifierRow>,
    structure_types: Vec<StructureTypeRow>,
}

impl IndexSession {
    /// Open the session for a workspace configuration. Schema-version
    /// gating (and the forced rebuild on a stale version) happens inside
    /// the storage open; the fixed lookup tables are loaded once here.
    pub fn open(config: &Config) -> Result<Self, crate::error::StorageError> {
        let location = DatabaseLocation::parse(&config.index.database);
        let storage = SqliteStorage::open(&location)?;

        let access_modifiers = storage.access_modifiers()?;
        let structure_types = storage.structure_types()?;
        info!(
            "Index session ready ({} access modifiers, {} structure types cached)",
            access_modifiers.len(),
            structure_types.len()
        );

        Ok(Self {
            storage: EventedStorage::new(storage),
            sources: Arc::new(SourceRegistry::default()),
            access_modifiers,
            structure_types,
        })
    }

    pub fn storage(&self) -> &EventedStorage<SqliteStorage> {
        &self.storage
    }

    pub fn storage_mut(&mut self) -> &mut EventedStorage<SqliteStorage> {
        &mut self.storage
    }

    pub fn sources(&self) -> Arc<SourceRegistry> {
        Arc::clone(&self.sources)
    }

    pub fn access_modifiers(&self) -> &[AccessModifierRow] {
        &self.access_modifiers
    }

    pub fn structure_types(&self) -> &[StructureTypeRow] {
        &self.structure_types
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{AccessModifier, StructureKind};

    fn memory_config() -> Config {
        let mut config = Config::default();
        config.index.database = ":memory:".to_string();
        config
    }

    #[test]
    fn test_open_caches_lookup_tables() {
        let session = IndexSession::open(&memory_config()).unwrap();

        let modifiers: Vec<AccessModifier> =
            session.access_modifiers().iter().map(|row| row.code).collect();
        assert_eq!(
            modifiers,
            vec![
                AccessModifier::Public,
                AccessModifier::Protected,
                AccessModifier::Private
            ]
        );

        let kinds: Vec<StructureKind> =
            session.structure_types().iter().map(|row| row.code).collect();
        assert_eq!(
            kinds,
            vec![
                StructureKind::Class,
                StructureKind::Interface,
                StructureKind::Trait
            ]
        );
    }

    #[test]
    fn test_session_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.index.database = dir
            .path()
            .join("index.sqlite")
            .to_string_lossy()
            .into_owned();

        {
            let mut session = IndexSession::open(&config).unwrap();
            let storage = session.storage_mut();
            storage.begin_transaction().unwrap();
            storage.upsert_file("/src/A.php", 1, None).unwrap();
            storage.commit_transaction().unwrap();
        }

        // A recreated session (same configuration) sees committed state.
        let session = IndexSession::open(&config).unwrap();
        assert!(session.storage().file_by_uri("/src/A.php").is_ok());
    }

    #[test]
    fn test_source_registry_overrides() {
        let session = IndexSession::open(&memory_config()).unwrap();
        let sources = session.sources();

        assert!(!sources.has_latest_source("/src/A.php"));
        sources.set_latest_source("/src/A.php", "<?php class A {}".to_string());
        assert_eq!(
            sources.latest_source("/src/A.php").as_deref(),
            Some("<?php class A {}")
        );

        sources.clear_latest_source("/src/A.php");
        assert!(!sources.has_latest_source("/src/A.php"));
    }
}
