// SQLite schema for the declaration index

use rusqlite::{Connection, Result};
use tracing::{debug, info};

/// Expected schema version. A stored version lower than this forces a
/// rebuild (drop and recreate); schema evolution is handled by full
/// reconstruction, never by in-place migration. The index is derived
/// data and is always safe to regenerate.
pub const SCHEMA_VERSION: i64 = 1;

/// Connection pragmas favoring write throughput and concurrent
/// readability over crash-durability. A corrupted index is simply
/// rebuilt; it is not a correctness hazard for the code it describes.
pub fn apply_pragmas(conn: &Connection) -> Result<()> {
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "synchronous", "OFF")?;
    conn.pragma_update(None, "temp_store", "MEMORY")?;
    conn.pragma_update(None, "cache_size", -20000)?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    Ok(())
}

/// Read the stored schema version, if the settings table exists at all.
pub fn stored_version(conn: &Connection) -> Option<i64> {
    conn.query_row(
        "SELECT value FROM settings WHERE name = 'schema_version'",
        [],
        |row| row.get::<_, String>(0),
    )
    .ok()
    .and_then(|v| v.parse().ok())
}

/// Initialize the schema, rebuilding from scratch when the stored
/// version is stale. Returns true when a rebuild happened.
pub fn init_schema(conn: &Connection) -> Result<bool> {
    let stored = stored_version(conn);
    debug!("Stored schema version: {:?}", stored);

    match stored {
        Some(version) if version >= SCHEMA_VERSION => Ok(false),
        Some(version) => {
            info!(
                "Schema version {} is older than expected {}, rebuilding index",
                version, SCHEMA_VERSION
            );
            drop_schema(conn)?;
            create_schema(conn)?;
            Ok(true)
        }
        None => {
            info!("Creating index schema v{}", SCHEMA_VERSION);
            create_schema(conn)?;
            Ok(false)
        }
    }
}

fn create_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS settings (
            name TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS files (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            uri TEXT NOT NULL UNIQUE,
            last_indexed INTEGER NOT NULL,
            source_hash TEXT
        );

        CREATE TABLE IF NOT EXISTS access_modifiers (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            code TEXT NOT NULL UNIQUE
        );

        CREATE TABLE IF NOT EXISTS structure_types (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            code TEXT NOT NULL UNIQUE
        );

        CREATE TABLE IF NOT EXISTS namespaces (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            file_id INTEGER NOT NULL REFERENCES files(id) ON DELETE CASCADE,
            name TEXT,
            start_line INTEGER NOT NULL,
            end_line INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_namespaces_file ON namespaces(file_id);

        CREATE TABLE IF NOT EXISTS imports (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            namespace_id INTEGER NOT NULL REFERENCES namespaces(id) ON DELETE CASCADE,
            alias TEXT NOT NULL,
            name TEXT NOT NULL,
            kind TEXT NOT NULL,
            line INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_imports_namespace ON imports(namespace_id);

        CREATE TABLE IF NOT EXISTS structures (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            fqcn TEXT NOT NULL UNIQUE,
            structure_type_id INTEGER NOT NULL REFERENCES structure_types(id),
            file_id INTEGER NOT NULL REFERENCES files(id) ON DELETE CASCADE,
            start_line INTEGER NOT NULL,
            end_line INTEGER NOT NULL,
            short_description TEXT,
            long_description TEXT,
            is_abstract INTEGER NOT NULL DEFAULT 0,
            is_final INTEGER NOT NULL DEFAULT 0,
            is_deprecated INTEGER NOT NULL DEFAULT 0,
            is_anonymous INTEGER NOT NULL DEFAULT 0,
            has_docblock INTEGER NOT NULL DEFAULT 0
        );
        CREATE INDEX IF NOT EXISTS idx_structures_file ON structures(file_id);

        -- Cross-structure links are stored against the target's FQCN, not
        -- a row id: the target may not be indexed yet, and indexing order
        -- across files must not matter.
        CREATE TABLE IF NOT EXISTS structure_parents (
            structure_id INTEGER NOT NULL REFERENCES structures(id) ON DELETE CASCADE,
            parent_fqcn TEXT NOT NULL,
            PRIMARY KEY (structure_id, parent_fqcn)
        );
        CREATE INDEX IF NOT EXISTS idx_structure_parents_fqcn
            ON structure_parents(parent_fqcn);

        CREATE TABLE IF NOT EXISTS structure_interfaces (
            structure_id INTEGER NOT NULL REFERENCES structures(id) ON DELETE CASCADE,
            interface_fqcn TEXT NOT NULL,
            PRIMARY KEY (structure_id, interface_fqcn)
        );
        CREATE INDEX IF NOT EXISTS idx_structure_interfaces_fqcn
            ON structure_interfaces(interface_fqcn);

        CREATE TABLE IF NOT EXISTS structure_traits (
            structure_id INTEGER NOT NULL REFERENCES structures(id) ON DELETE CASCADE,
            trait_fqcn TEXT NOT NULL,
            PRIMARY KEY (structure_id, trait_fqcn)
        );
        CREATE INDEX IF NOT EXISTS idx_structure_traits_fqcn
            ON structure_traits(trait_fqcn);

        CREATE TABLE IF NOT EXISTS structure_trait_aliases (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            structure_id INTEGER NOT NULL REFERENCES structures(id) ON DELETE CASCADE,
            trait_fqcn TEXT,
            name TEXT NOT NULL,
            alias TEXT,
            access_modifier_id INTEGER REFERENCES access_modifiers(id)
        );
        CREATE INDEX IF NOT EXISTS idx_trait_aliases_structure
            ON structure_trait_aliases(structure_id);

        CREATE TABLE IF NOT EXISTS structure_trait_precedences (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            structure_id INTEGER NOT NULL REFERENCES structures(id) ON DELETE CASCADE,
            trait_fqcn TEXT NOT NULL,
            name TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_trait_precedences_structure
            ON structure_trait_precedences(structure_id);

        CREATE TABLE IF NOT EXISTS functions (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL,
            fqcn TEXT,
            file_id INTEGER NOT NULL REFERENCES files(id) ON DELETE CASCADE,
            structure_id INTEGER REFERENCES structures(id) ON DELETE CASCADE,
            access_modifier_id INTEGER REFERENCES access_modifiers(id),
            start_line INTEGER NOT NULL,
            end_line INTEGER NOT NULL,
            is_static INTEGER NOT NULL DEFAULT 0,
            is_abstract INTEGER NOT NULL DEFAULT 0,
            is_final INTEGER NOT NULL DEFAULT 0,
            is_magic INTEGER NOT NULL DEFAULT 0,
            is_deprecated INTEGER NOT NULL DEFAULT 0,
            has_docblock INTEGER NOT NULL DEFAULT 0,
            short_description TEXT,
            long_description TEXT,
            return_types TEXT NOT NULL,
            parameters TEXT NOT NULL,
            throws TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_functions_file ON functions(file_id);
        CREATE INDEX IF NOT EXISTS idx_functions_structure ON functions(structure_id);
        CREATE INDEX IF NOT EXISTS idx_functions_fqcn ON functions(fqcn);

        CREATE TABLE IF NOT EXISTS properties (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL,
            structure_id INTEGER NOT NULL REFERENCES structures(id) ON DELETE CASCADE,
            line INTEGER NOT NULL,
            access_modifier_id INTEGER NOT NULL REFERENCES access_modifiers(id),
            is_static INTEGER NOT NULL DEFAULT 0,
            is_magic INTEGER NOT NULL DEFAULT 0,
            is_deprecated INTEGER NOT NULL DEFAULT 0,
            has_docblock INTEGER NOT NULL DEFAULT 0,
            short_description TEXT,
            long_description TEXT,
            types TEXT NOT NULL,
            default_value TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_properties_structure ON properties(structure_id);

        CREATE TABLE IF NOT EXISTS constants (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL,
            fqcn TEXT,
            file_id INTEGER NOT NULL REFERENCES files(id) ON DELETE CASCADE,
            structure_id INTEGER REFERENCES structures(id) ON DELETE CASCADE,
            access_modifier_id INTEGER REFERENCES access_modifiers(id),
            line INTEGER NOT NULL,
            is_deprecated INTEGER NOT NULL DEFAULT 0,
            has_docblock INTEGER NOT NULL DEFAULT 0,
            short_description TEXT,
            long_description TEXT,
            types TEXT NOT NULL,
            default_value TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_constants_file ON constants(file_id);
        CREATE INDEX IF NOT EXISTS idx_constants_structure ON constants(structure_id);

        CREATE TABLE IF NOT EXISTS meta_static_method_types (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            fqcn TEXT NOT NULL,
            method TEXT NOT NULL,
            argument_index INTEGER NOT NULL,
            value TEXT NOT NULL,
            return_type TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_meta_static_method_types_target
            ON meta_static_method_types(fqcn, method);
        ",
    )?;

    seed_lookup_tables(conn)?;

    conn.execute(
        "INSERT OR REPLACE INTO settings (name, value) VALUES ('schema_version', ?1)",
        [SCHEMA_VERSION.to_string()],
    )?;

    Ok(())
}

/// Seed the fixed lookup tables. Loaded once and cached by callers.
fn seed_lookup_tables(conn: &Connection) -> Result<()> {
    for code in ["public", "protected", "private"] {
        conn.execute(
            "INSERT OR IGNORE INTO access_modifiers (code) VALUES (?1)",
            [code],
        )?;
    }
    for code in ["class", "interface", "trait"] {
        conn.execute(
            "INSERT OR IGNORE INTO structure_types (code) VALUES (?1)",
            [code],
        )?;
    }
    Ok(())
}

/// Drop every table. Used by the stale-version rebuild and by the CLI's
/// forced rebuild.
pub fn drop_schema(conn: &Connection) -> Result<()> {
    info!("Dropping all index tables");

    conn.execute_batch(
        "DROP TABLE IF EXISTS meta_static_method_types;
        DROP TABLE IF EXISTS constants;
        DROP TABLE IF EXISTS properties;
        DROP TABLE IF EXISTS functions;
        DROP TABLE IF EXISTS structure_trait_precedences;
        DROP TABLE IF EXISTS structure_trait_aliases;
        DROP TABLE IF EXISTS structure_traits;
        DROP TABLE IF EXISTS structure_interfaces;
        DROP TABLE IF EXISTS structure_parents;
        DROP TABLE IF EXISTS structures;
        DROP TABLE IF EXISTS imports;
        DROP TABLE IF EXISTS namespaces;
        DROP TABLE IF EXISTS structure_types;
        DROP TABLE IF EXISTS access_modifiers;
        DROP TABLE IF EXISTS files;
        DROP TABLE IF EXISTS settings;",
    )?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::Connection;

    #[test]
    fn test_init_schema() {
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn).unwrap();

        let tables: Vec<String> = conn
            .prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .collect::<Result<Vec<_>>>()
            .unwrap();

        assert!(tables.contains(&"files".to_string()));
        assert!(tables.contains(&"structures".to_string()));
        assert!(tables.contains(&"structure_parents".to_string()));
        assert!(tables.contains(&"functions".to_string()));
        assert!(tables.contains(&"settings".to_string()));
    }

    #[test]
    fn test_schema_version_stored() {
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn).unwrap();

        assert_eq!(stored_version(&conn), Some(SCHEMA_VERSION));
    }

    #[test]
    fn test_stale_version_forces_rebuild() {
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn).unwrap();

        // Plant a row that a rebuild must wipe, then age the version.
        conn.execute(
            "INSERT INTO files (uri, last_indexed) VALUES ('/tmp/a.php', 1)",
            [],
        )
        .unwrap();
        conn.execute(
            "UPDATE settings SET value = '0' WHERE name = 'schema_version'",
            [],
        )
        .unwrap();

        let rebuilt = init_schema(&conn).unwrap();
        assert!(rebuilt);

        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM files", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 0);
        assert_eq!(stored_version(&conn), Some(SCHEMA_VERSION));
    }

    #[test]
    fn test_idempotent_init() {
        let conn = Connection::open_in_memory().unwrap();
        assert!(!init_schema(&conn).unwrap());
        assert!(!init_schema(&conn).unwrap());
    }

    #[test]
    fn test_lookup_tables_seeded() {
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn).unwrap();

        let modifiers: i64 = conn
            .query_row("SELECT COUNT(*) FROM access_modifiers", [], |row| row.get(0))
            .unwrap();
        let types: i64 = conn
            .query_row("SELECT COUNT(*) FROM structure_types", [], |row| row.get(0))
            .unwrap();

        assert_eq!(modifiers, 3);
        assert_eq!(types, 3);
    }
}
