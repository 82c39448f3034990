// SQLite-backed storage engine

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::{debug, info};

use super::schema::{apply_pragmas, init_schema};
use super::{
    AccessModifier, AccessModifierRow, Constant, FunctionLike, Import, ImportKind, IndexStats,
    MetaStaticMethodType, NamespaceBlock, NewConstant, NewFunction, NewImport, NewNamespace,
    NewProperty, NewStructure, Parameter, Property, Result, SourceFile, Storage, Structure,
    StructureKind, StructureTypeRow, TraitAlias, TraitPrecedence, TypeRef,
};
use crate::error::StorageError;

/// Database location. In-memory mode exists for ephemeral and test use.
#[derive(Debug, Clone)]
pub enum DatabaseLocation {
    Path(std::path::PathBuf),
    InMemory,
}

impl DatabaseLocation {
    pub fn parse(value: &str) -> Self {
        if value == ":memory:" {
            DatabaseLocation::InMemory
        } else {
            DatabaseLocation::Path(value.into())
        }
    }
}

/// The storage engine. Owns a single pinned connection; only one
/// transaction may be open at a time, and every mutation must happen
/// inside one. Violations are programming errors and panic.
pub struct SqliteStorage {
    conn: Connection,
    in_tx: bool,
    access_modifier_ids: HashMap<AccessModifier, i64>,
    structure_type_ids: HashMap<StructureKind, i64>,
}

impl SqliteStorage {
    /// Open (or create) the index at the given location. Applies the
    /// fixed pragmas and performs the schema-version check, rebuilding a
    /// stale schema before use.
    pub fn open(location: &DatabaseLocation) -> Result<Self> {
        let conn = match location {
            DatabaseLocation::Path(path) => {
                info!("Opening index database at: {}", path.display());
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent).map_err(|e| {
                        StorageError::Fatal(format!(
                            "cannot create {}: {e}",
                            parent.display()
                        ))
                    })?;
                }
                Connection::open(path).map_err(map_err)?
            }
            DatabaseLocation::InMemory => {
                debug!("Opening in-memory index database");
                Connection::open_in_memory().map_err(map_err)?
            }
        };

        conn.busy_timeout(Duration::from_secs(5)).map_err(map_err)?;
        apply_pragmas(&conn).map_err(map_err)?;
        init_schema(&conn).map_err(map_err)?;

        let mut storage = Self {
            conn,
            in_tx: false,
            access_modifier_ids: HashMap::new(),
            structure_type_ids: HashMap::new(),
        };
        storage.load_lookup_caches()?;
        Ok(storage)
    }

    pub fn open_path(path: impl AsRef<Path>) -> Result<Self> {
        Self::open(&DatabaseLocation::Path(path.as_ref().to_path_buf()))
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::open(&DatabaseLocation::InMemory)
    }

    /// Drop and recreate the schema, discarding all indexed data.
    pub fn rebuild(&mut self) -> Result<()> {
        assert!(!self.in_tx, "cannot rebuild schema inside a transaction");
        super::schema::drop_schema(&self.conn).map_err(map_err)?;
        init_schema(&self.conn).map_err(map_err)?;
        self.load_lookup_caches()
    }

    fn load_lookup_caches(&mut self) -> Result<()> {
        self.access_modifier_ids = self
            .access_modifiers()?
            .into_iter()
            .map(|row| (row.code, row.id))
            .collect();
        self.structure_type_ids = self
            .structure_types()?
            .into_iter()
            .map(|row| (row.code, row.id))
            .collect();
        Ok(())
    }

    fn access_modifier_id(&self, modifier: AccessModifier) -> i64 {
        self.access_modifier_ids[&modifier]
    }

    fn structure_type_id(&self, kind: StructureKind) -> i64 {
        self.structure_type_ids[&kind]
    }

    fn assert_in_tx(&self) {
        assert!(
            self.in_tx,
            "storage mutation outside of an explicit transaction"
        );
    }
}

/// Map a driver error onto the engine's taxonomy. Lock contention and
/// disk-level failures are fatal and never retried.
fn map_err(e: rusqlite::Error) -> StorageError {
    use rusqlite::ErrorCode::*;

    if let rusqlite::Error::SqliteFailure(err, _) = &e {
        match err.code {
            DatabaseBusy | DatabaseLocked | SystemIoFailure | DatabaseCorrupt | DiskFull => {
                return StorageError::Fatal(e.to_string());
            }
            _ => {}
        }
    }
    StorageError::Backend(e.to_string())
}

fn json_err(e: serde_json::Error) -> StorageError {
    StorageError::Backend(format!("malformed serialized column: {e}"))
}

fn row_to_file(row: &Row) -> rusqlite::Result<SourceFile> {
    Ok(SourceFile {
        id: row.get(0)?,
        uri: row.get(1)?,
        last_indexed: row.get(2)?,
        source_hash: row.get(3)?,
    })
}

fn row_to_namespace(row: &Row) -> rusqlite::Result<NamespaceBlock> {
    Ok(NamespaceBlock {
        id: row.get(0)?,
        file_id: row.get(1)?,
        name: row.get(2)?,
        start_line: row.get::<_, i64>(3)? as u32,
        end_line: row.get::<_, i64>(4)? as u32,
    })
}

const STRUCTURE_COLUMNS: &str = "s.id, s.fqcn, st.code, s.file_id, s.start_line, s.end_line,
    s.short_description, s.long_description, s.is_abstract, s.is_final, s.is_deprecated,
    s.is_anonymous, s.has_docblock";

fn row_to_structure(row: &Row) -> rusqlite::Result<Structure> {
    let kind: String = row.get(2)?;
    Ok(Structure {
        id: row.get(0)?,
        fqcn: row.get(1)?,
        kind: StructureKind::from_str(&kind).expect("lookup table holds only known codes"),
        file_id: row.get(3)?,
        start_line: row.get::<_, i64>(4)? as u32,
        end_line: row.get::<_, i64>(5)? as u32,
        short_description: row.get(6)?,
        long_description: row.get(7)?,
        is_abstract: row.get(8)?,
        is_final: row.get(9)?,
        is_deprecated: row.get(10)?,
        is_anonymous: row.get(11)?,
        has_docblock: row.get(12)?,
    })
}

const FUNCTION_COLUMNS: &str = "f.id, f.name, f.fqcn, f.file_id, f.structure_id, am.code,
    f.start_line, f.end_line, f.is_static, f.is_abstract, f.is_final, f.is_magic,
    f.is_deprecated, f.has_docblock, f.short_description, f.long_description,
    f.return_types, f.parameters, f.throws";

fn row_to_function(row: &Row) -> rusqlite::Result<(FunctionLike, String, String, String)> {
    let modifier: Option<String> = row.get(5)?;
    let function = FunctionLike {
        id: row.get(0)?,
        name: row.get(1)?,
        fqcn: row.get(2)?,
        file_id: row.get(3)?,
        structure_id: row.get(4)?,
        access_modifier: modifier
            .map(|m| AccessModifier::from_str(&m).expect("lookup table holds only known codes")),
        start_line: row.get::<_, i64>(6)? as u32,
        end_line: row.get::<_, i64>(7)? as u32,
        is_static: row.get(8)?,
        is_abstract: row.get(9)?,
        is_final: row.get(10)?,
        is_magic: row.get(11)?,
        is_deprecated: row.get(12)?,
        has_docblock: row.get(13)?,
        short_description: row.get(14)?,
        long_description: row.get(15)?,
        return_types: Vec::new(),
        parameters: Vec::new(),
        throws: Vec::new(),
    };
    Ok((function, row.get(16)?, row.get(17)?, row.get(18)?))
}

fn finish_function(raw: (FunctionLike, String, String, String)) -> Result<FunctionLike> {
    let (mut function, return_types, parameters, throws) = raw;
    function.return_types = serde_json::from_str(&return_types).map_err(json_err)?;
    function.parameters = serde_json::from_str(&parameters).map_err(json_err)?;
    function.throws = serde_json::from_str(&throws).map_err(json_err)?;
    Ok(function)
}

const PROPERTY_COLUMNS: &str = "p.id, p.name, p.structure_id, p.line, am.code, p.is_static,
    p.is_magic, p.is_deprecated, p.has_docblock, p.short_description, p.long_description,
    p.types, p.default_value";

fn row_to_property(row: &Row) -> rusqlite::Result<(Property, String)> {
    let modifier: String = row.get(4)?;
    let property = Property {
        id: row.get(0)?,
        name: row.get(1)?,
        structure_id: row.get(2)?,
        line: row.get::<_, i64>(3)? as u32,
        access_modifier: AccessModifier::from_str(&modifier)
            .expect("lookup table holds only known codes"),
        is_static: row.get(5)?,
        is_magic: row.get(6)?,
        is_deprecated: row.get(7)?,
        has_docblock: row.get(8)?,
        short_description: row.get(9)?,
        long_description: row.get(10)?,
        types: Vec::new(),
        default_value: row.get(12)?,
    };
    Ok((property, row.get(11)?))
}

const CONSTANT_COLUMNS: &str = "c.id, c.name, c.fqcn, c.file_id, c.structure_id, am.code,
    c.line, c.is_deprecated, c.has_docblock, c.short_description, c.long_description,
    c.types, c.default_value";

fn row_to_constant(row: &Row) -> rusqlite::Result<(Constant, String)> {
    let modifier: Option<String> = row.get(5)?;
    let constant = Constant {
        id: row.get(0)?,
        name: row.get(1)?,
        fqcn: row.get(2)?,
        file_id: row.get(3)?,
        structure_id: row.get(4)?,
        access_modifier: modifier
            .map(|m| AccessModifier::from_str(&m).expect("lookup table holds only known codes")),
        line: row.get::<_, i64>(6)? as u32,
        is_deprecated: row.get(7)?,
        has_docblock: row.get(8)?,
        short_description: row.get(9)?,
        long_description: row.get(10)?,
        types: Vec::new(),
        default_value: row.get(12)?,
    };
    Ok((constant, row.get(11)?))
}

fn types_json(types: &[TypeRef]) -> Result<String> {
    serde_json::to_string(types).map_err(json_err)
}

impl Storage for SqliteStorage {
    fn begin_transaction(&mut self) -> Result<()> {
        assert!(!self.in_tx, "transaction already open; nesting is not supported");
        self.conn.execute_batch("BEGIN IMMEDIATE").map_err(map_err)?;
        self.in_tx = true;
        Ok(())
    }

    fn commit_transaction(&mut self) -> Result<()> {
        assert!(self.in_tx, "commit without an open transaction");
        self.conn.execute_batch("COMMIT").map_err(map_err)?;
        self.in_tx = false;
        Ok(())
    }

    fn rollback_transaction(&mut self) -> Result<()> {
        assert!(self.in_tx, "rollback without an open transaction");
        self.conn.execute_batch("ROLLBACK").map_err(map_err)?;
        self.in_tx = false;
        Ok(())
    }

    fn in_transaction(&self) -> bool {
        self.in_tx
    }

    fn upsert_file(
        &mut self,
        uri: &str,
        last_indexed: i64,
        source_hash: Option<&str>,
    ) -> Result<i64> {
        self.assert_in_tx();
        self.conn
            .execute(
                "INSERT INTO files (uri, last_indexed, source_hash) VALUES (?1, ?2, ?3)
                 ON CONFLICT(uri) DO UPDATE SET
                    last_indexed = excluded.last_indexed,
                    source_hash = excluded.source_hash",
                params![uri, last_indexed, source_hash],
            )
            .map_err(map_err)?;
        self.conn
            .query_row("SELECT id FROM files WHERE uri = ?1", [uri], |row| {
                row.get(0)
            })
            .map_err(map_err)
    }

    fn set_file_source_hash(&mut self, file_id: i64, hash: &str) -> Result<()> {
        self.assert_in_tx();
        self.conn
            .execute(
                "UPDATE files SET source_hash = ?1 WHERE id = ?2",
                params![hash, file_id],
            )
            .map_err(map_err)?;
        Ok(())
    }

    fn file_by_uri(&self, uri: &str) -> Result<SourceFile> {
        self.conn
            .query_row(
                "SELECT id, uri, last_indexed, source_hash FROM files WHERE uri = ?1",
                [uri],
                row_to_file,
            )
            .optional()
            .map_err(map_err)?
            .ok_or_else(|| StorageError::FileNotFound(uri.to_string()))
    }

    fn file_by_id(&self, id: i64) -> Result<SourceFile> {
        self.conn
            .query_row(
                "SELECT id, uri, last_indexed, source_hash FROM files WHERE id = ?1",
                [id],
                row_to_file,
            )
            .optional()
            .map_err(map_err)?
            .ok_or_else(|| StorageError::FileNotFound(format!("#{id}")))
    }

    fn files(&self) -> Result<Vec<SourceFile>> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, uri, last_indexed, source_hash FROM files ORDER BY uri")
            .map_err(map_err)?;
        let files = stmt
            .query_map([], row_to_file)
            .map_err(map_err)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(map_err)?;
        Ok(files)
    }

    fn delete_file(&mut self, file_id: i64) -> Result<()> {
        self.assert_in_tx();
        debug!("Deleting file #{} and all owned entities", file_id);
        self.conn
            .execute("DELETE FROM files WHERE id = ?1", [file_id])
            .map_err(map_err)?;
        Ok(())
    }

    fn delete_file_entities(&mut self, file_id: i64) -> Result<()> {
        self.assert_in_tx();
        debug!("Replacing entities of file #{}", file_id);

        // Structures cascade their members and links; what remains by
        // file id afterwards is free functions, global constants, and
        // namespace blocks (which cascade their imports).
        self.conn
            .execute("DELETE FROM structures WHERE file_id = ?1", [file_id])
            .map_err(map_err)?;
        self.conn
            .execute("DELETE FROM functions WHERE file_id = ?1", [file_id])
            .map_err(map_err)?;
        self.conn
            .execute("DELETE FROM constants WHERE file_id = ?1", [file_id])
            .map_err(map_err)?;
        self.conn
            .execute("DELETE FROM namespaces WHERE file_id = ?1", [file_id])
            .map_err(map_err)?;
        Ok(())
    }

    fn access_modifiers(&self) -> Result<Vec<AccessModifierRow>> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, code FROM access_modifiers ORDER BY id")
            .map_err(map_err)?;
        let rows = stmt
            .query_map([], |row| {
                Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
            })
            .map_err(map_err)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(map_err)?;
        rows.into_iter()
            .map(|(id, code)| {
                Ok(AccessModifierRow {
                    id,
                    code: AccessModifier::from_str(&code)?,
                })
            })
            .collect()
    }

    fn structure_types(&self) -> Result<Vec<StructureTypeRow>> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, code FROM structure_types ORDER BY id")
            .map_err(map_err)?;
        let rows = stmt
            .query_map([], |row| {
                Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
            })
            .map_err(map_err)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(map_err)?;
        rows.into_iter()
            .map(|(id, code)| {
                Ok(StructureTypeRow {
                    id,
                    code: StructureKind::from_str(&code)?,
                })
            })
            .collect()
    }

    fn insert_namespace(&mut self, ns: &NewNamespace) -> Result<i64> {
        self.assert_in_tx();
        self.conn
            .execute(
                "INSERT INTO namespaces (file_id, name, start_line, end_line)
                 VALUES (?1, ?2, ?3, ?4)",
                params![ns.file_id, ns.name, ns.start_line as i64, ns.end_line as i64],
            )
            .map_err(map_err)?;
        Ok(self.conn.last_insert_rowid())
    }

    fn namespaces_in_file(&self, file_id: i64) -> Result<Vec<NamespaceBlock>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, file_id, name, start_line, end_line
                 FROM namespaces WHERE file_id = ?1 ORDER BY start_line",
            )
            .map_err(map_err)?;
        let namespaces = stmt
            .query_map([file_id], row_to_namespace)
            .map_err(map_err)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(map_err)?;
        Ok(namespaces)
    }

    fn insert_import(&mut self, import: &NewImport) -> Result<i64> {
        self.assert_in_tx();
        self.conn
            .execute(
                "INSERT INTO imports (namespace_id, alias, name, kind, line)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    import.namespace_id,
                    import.alias,
                    import.name,
                    import.kind.as_str(),
                    import.line as i64,
                ],
            )
            .map_err(map_err)?;
        Ok(self.conn.last_insert_rowid())
    }

    fn imports_in_namespace(&self, namespace_id: i64) -> Result<Vec<Import>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, namespace_id, alias, name, kind, line
                 FROM imports WHERE namespace_id = ?1 ORDER BY line",
            )
            .map_err(map_err)?;
        let rows = stmt
            .query_map([namespace_id], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, i64>(5)?,
                ))
            })
            .map_err(map_err)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(map_err)?;
        rows.into_iter()
            .map(|(id, namespace_id, alias, name, kind, line)| {
                Ok(Import {
                    id,
                    namespace_id,
                    alias,
                    name,
                    kind: ImportKind::from_str(&kind)?,
                    line: line as u32,
                })
            })
            .collect()
    }

    fn insert_structure(&mut self, s: &NewStructure) -> Result<i64> {
        self.assert_in_tx();
        debug!("Inserting structure {}", s.fqcn);
        self.conn
            .execute(
                "INSERT INTO structures (
                    fqcn, structure_type_id, file_id, start_line, end_line,
                    short_description, long_description, is_abstract, is_final,
                    is_deprecated, is_anonymous, has_docblock
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                params![
                    s.fqcn,
                    self.structure_type_id(s.kind),
                    s.file_id,
                    s.start_line as i64,
                    s.end_line as i64,
                    s.short_description,
                    s.long_description,
                    s.is_abstract,
                    s.is_final,
                    s.is_deprecated,
                    s.is_anonymous,
                    s.has_docblock,
                ],
            )
            .map_err(map_err)?;
        Ok(self.conn.last_insert_rowid())
    }

    fn structure_by_fqcn(&self, fqcn: &str) -> Result<Structure> {
        let sql = format!(
            "SELECT {STRUCTURE_COLUMNS} FROM structures s
             JOIN structure_types st ON st.id = s.structure_type_id
             WHERE s.fqcn = ?1"
        );
        self.conn
            .query_row(&sql, [fqcn], row_to_structure)
            .optional()
            .map_err(map_err)?
            .ok_or_else(|| StorageError::StructureNotFound(fqcn.to_string()))
    }

    fn structures_in_file(&self, file_id: i64) -> Result<Vec<Structure>> {
        let sql = format!(
            "SELECT {STRUCTURE_COLUMNS} FROM structures s
             JOIN structure_types st ON st.id = s.structure_type_id
             WHERE s.file_id = ?1 ORDER BY s.start_line"
        );
        let mut stmt = self.conn.prepare(&sql).map_err(map_err)?;
        let structures = stmt
            .query_map([file_id], row_to_structure)
            .map_err(map_err)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(map_err)?;
        Ok(structures)
    }

    fn add_structure_parent(&mut self, structure_id: i64, parent_fqcn: &str) -> Result<()> {
        self.assert_in_tx();
        self.conn
            .execute(
                "INSERT OR IGNORE INTO structure_parents (structure_id, parent_fqcn)
                 VALUES (?1, ?2)",
                params![structure_id, parent_fqcn],
            )
            .map_err(map_err)?;
        Ok(())
    }

    fn add_structure_interface(&mut self, structure_id: i64, interface_fqcn: &str) -> Result<()> {
        self.assert_in_tx();
        self.conn
            .execute(
                "INSERT OR IGNORE INTO structure_interfaces (structure_id, interface_fqcn)
                 VALUES (?1, ?2)",
                params![structure_id, interface_fqcn],
            )
            .map_err(map_err)?;
        Ok(())
    }

    fn add_structure_trait(&mut self, structure_id: i64, trait_fqcn: &str) -> Result<()> {
        self.assert_in_tx();
        self.conn
            .execute(
                "INSERT OR IGNORE INTO structure_traits (structure_id, trait_fqcn)
                 VALUES (?1, ?2)",
                params![structure_id, trait_fqcn],
            )
            .map_err(map_err)?;
        Ok(())
    }

    fn add_trait_alias(&mut self, alias: &TraitAlias) -> Result<()> {
        self.assert_in_tx();
        self.conn
            .execute(
                "INSERT INTO structure_trait_aliases
                    (structure_id, trait_fqcn, name, alias, access_modifier_id)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    alias.structure_id,
                    alias.trait_fqcn,
                    alias.name,
                    alias.alias,
                    alias.access_modifier.map(|m| self.access_modifier_id(m)),
                ],
            )
            .map_err(map_err)?;
        Ok(())
    }

    fn add_trait_precedence(&mut self, precedence: &TraitPrecedence) -> Result<()> {
        self.assert_in_tx();
        self.conn
            .execute(
                "INSERT INTO structure_trait_precedences (structure_id, trait_fqcn, name)
                 VALUES (?1, ?2, ?3)",
                params![precedence.structure_id, precedence.trait_fqcn, precedence.name],
            )
            .map_err(map_err)?;
        Ok(())
    }

    fn structure_parents(&self, structure_id: i64) -> Result<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT parent_fqcn FROM structure_parents
                 WHERE structure_id = ?1 ORDER BY parent_fqcn",
            )
            .map_err(map_err)?;
        let parents = stmt
            .query_map([structure_id], |row| row.get(0))
            .map_err(map_err)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(map_err)?;
        Ok(parents)
    }

    fn structure_interfaces(&self, structure_id: i64) -> Result<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT interface_fqcn FROM structure_interfaces
                 WHERE structure_id = ?1 ORDER BY interface_fqcn",
            )
            .map_err(map_err)?;
        let interfaces = stmt
            .query_map([structure_id], |row| row.get(0))
            .map_err(map_err)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(map_err)?;
        Ok(interfaces)
    }

    fn structure_traits(&self, structure_id: i64) -> Result<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT trait_fqcn FROM structure_traits
                 WHERE structure_id = ?1 ORDER BY trait_fqcn",
            )
            .map_err(map_err)?;
        let traits = stmt
            .query_map([structure_id], |row| row.get(0))
            .map_err(map_err)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(map_err)?;
        Ok(traits)
    }

    fn trait_aliases(&self, structure_id: i64) -> Result<Vec<TraitAlias>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT a.structure_id, a.trait_fqcn, a.name, a.alias, am.code
                 FROM structure_trait_aliases a
                 LEFT JOIN access_modifiers am ON am.id = a.access_modifier_id
                 WHERE a.structure_id = ?1 ORDER BY a.id",
            )
            .map_err(map_err)?;
        let rows = stmt
            .query_map([structure_id], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, Option<String>>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, Option<String>>(3)?,
                    row.get::<_, Option<String>>(4)?,
                ))
            })
            .map_err(map_err)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(map_err)?;
        rows.into_iter()
            .map(|(structure_id, trait_fqcn, name, alias, modifier)| {
                Ok(TraitAlias {
                    structure_id,
                    trait_fqcn,
                    name,
                    alias,
                    access_modifier: modifier
                        .map(|m| AccessModifier::from_str(&m))
                        .transpose()?,
                })
            })
            .collect()
    }

    fn trait_precedences(&self, structure_id: i64) -> Result<Vec<TraitPrecedence>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT structure_id, trait_fqcn, name FROM structure_trait_precedences
                 WHERE structure_id = ?1 ORDER BY id",
            )
            .map_err(map_err)?;
        let precedences = stmt
            .query_map([structure_id], |row| {
                Ok(TraitPrecedence {
                    structure_id: row.get(0)?,
                    trait_fqcn: row.get(1)?,
                    name: row.get(2)?,
                })
            })
            .map_err(map_err)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(map_err)?;
        Ok(precedences)
    }

    fn child_structures_of(&self, fqcn: &str) -> Result<Vec<Structure>> {
        let sql = format!(
            "SELECT {STRUCTURE_COLUMNS} FROM structures s
             JOIN structure_types st ON st.id = s.structure_type_id
             JOIN structure_parents sp ON sp.structure_id = s.id
             WHERE sp.parent_fqcn = ?1 ORDER BY s.fqcn"
        );
        let mut stmt = self.conn.prepare(&sql).map_err(map_err)?;
        let children = stmt
            .query_map([fqcn], row_to_structure)
            .map_err(map_err)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(map_err)?;
        Ok(children)
    }

    fn insert_function(&mut self, f: &NewFunction) -> Result<i64> {
        self.assert_in_tx();
        let parameters = serde_json::to_string(&f.parameters).map_err(json_err)?;
        let return_types = types_json(&f.return_types)?;
        let throws = serde_json::to_string(&f.throws).map_err(json_err)?;

        self.conn
            .execute(
                "INSERT INTO functions (
                    name, fqcn, file_id, structure_id, access_modifier_id,
                    start_line, end_line, is_static, is_abstract, is_final,
                    is_magic, is_deprecated, has_docblock, short_description,
                    long_description, return_types, parameters, throws
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12,
                          ?13, ?14, ?15, ?16, ?17, ?18)",
                params![
                    f.name,
                    f.fqcn,
                    f.file_id,
                    f.structure_id,
                    f.access_modifier.map(|m| self.access_modifier_id(m)),
                    f.start_line as i64,
                    f.end_line as i64,
                    f.is_static,
                    f.is_abstract,
                    f.is_final,
                    f.is_magic,
                    f.is_deprecated,
                    f.has_docblock,
                    f.short_description,
                    f.long_description,
                    return_types,
                    parameters,
                    throws,
                ],
            )
            .map_err(map_err)?;
        Ok(self.conn.last_insert_rowid())
    }

    fn functions_in_file(&self, file_id: i64) -> Result<Vec<FunctionLike>> {
        let sql = format!(
            "SELECT {FUNCTION_COLUMNS} FROM functions f
             LEFT JOIN access_modifiers am ON am.id = f.access_modifier_id
             WHERE f.file_id = ?1 ORDER BY f.start_line"
        );
        let mut stmt = self.conn.prepare(&sql).map_err(map_err)?;
        let raw = stmt
            .query_map([file_id], row_to_function)
            .map_err(map_err)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(map_err)?;
        raw.into_iter().map(finish_function).collect()
    }

    fn methods_of_structure(&self, structure_id: i64) -> Result<Vec<FunctionLike>> {
        let sql = format!(
            "SELECT {FUNCTION_COLUMNS} FROM functions f
             LEFT JOIN access_modifiers am ON am.id = f.access_modifier_id
             WHERE f.structure_id = ?1 ORDER BY f.start_line"
        );
        let mut stmt = self.conn.prepare(&sql).map_err(map_err)?;
        let raw = stmt
            .query_map([structure_id], row_to_function)
            .map_err(map_err)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(map_err)?;
        raw.into_iter().map(finish_function).collect()
    }

    fn insert_property(&mut self, p: &NewProperty) -> Result<i64> {
        self.assert_in_tx();
        let types = types_json(&p.types)?;
        self.conn
            .execute(
                "INSERT INTO properties (
                    name, structure_id, line, access_modifier_id, is_static,
                    is_magic, is_deprecated, has_docblock, short_description,
                    long_description, types, default_value
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                params![
                    p.name,
                    p.structure_id,
                    p.line as i64,
                    self.access_modifier_id(p.access_modifier),
                    p.is_static,
                    p.is_magic,
                    p.is_deprecated,
                    p.has_docblock,
                    p.short_description,
                    p.long_description,
                    types,
                    p.default_value,
                ],
            )
            .map_err(map_err)?;
        Ok(self.conn.last_insert_rowid())
    }

    fn properties_of_structure(&self, structure_id: i64) -> Result<Vec<Property>> {
        let sql = format!(
            "SELECT {PROPERTY_COLUMNS} FROM properties p
             JOIN access_modifiers am ON am.id = p.access_modifier_id
             WHERE p.structure_id = ?1 ORDER BY p.line"
        );
        let mut stmt = self.conn.prepare(&sql).map_err(map_err)?;
        let raw = stmt
            .query_map([structure_id], row_to_property)
            .map_err(map_err)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(map_err)?;
        raw.into_iter()
            .map(|(mut property, types)| {
                property.types = serde_json::from_str(&types).map_err(json_err)?;
                Ok(property)
            })
            .collect()
    }

    fn insert_constant(&mut self, c: &NewConstant) -> Result<i64> {
        self.assert_in_tx();
        let types = types_json(&c.types)?;
        self.conn
            .execute(
                "INSERT INTO constants (
                    name, fqcn, file_id, structure_id, access_modifier_id, line,
                    is_deprecated, has_docblock, short_description,
                    long_description, types, default_value
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                params![
                    c.name,
                    c.fqcn,
                    c.file_id,
                    c.structure_id,
                    c.access_modifier.map(|m| self.access_modifier_id(m)),
                    c.line as i64,
                    c.is_deprecated,
                    c.has_docblock,
                    c.short_description,
                    c.long_description,
                    types,
                    c.default_value,
                ],
            )
            .map_err(map_err)?;
        Ok(self.conn.last_insert_rowid())
    }

    fn constants_of_structure(&self, structure_id: i64) -> Result<Vec<Constant>> {
        let sql = format!(
            "SELECT {CONSTANT_COLUMNS} FROM constants c
             LEFT JOIN access_modifiers am ON am.id = c.access_modifier_id
             WHERE c.structure_id = ?1 ORDER BY c.line"
        );
        let mut stmt = self.conn.prepare(&sql).map_err(map_err)?;
        let raw = stmt
            .query_map([structure_id], row_to_constant)
            .map_err(map_err)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(map_err)?;
        raw.into_iter()
            .map(|(mut constant, types)| {
                constant.types = serde_json::from_str(&types).map_err(json_err)?;
                Ok(constant)
            })
            .collect()
    }

    fn constants_in_file(&self, file_id: i64) -> Result<Vec<Constant>> {
        let sql = format!(
            "SELECT {CONSTANT_COLUMNS} FROM constants c
             LEFT JOIN access_modifiers am ON am.id = c.access_modifier_id
             WHERE c.file_id = ?1 ORDER BY c.line"
        );
        let mut stmt = self.conn.prepare(&sql).map_err(map_err)?;
        let raw = stmt
            .query_map([file_id], row_to_constant)
            .map_err(map_err)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(map_err)?;
        raw.into_iter()
            .map(|(mut constant, types)| {
                constant.types = serde_json::from_str(&types).map_err(json_err)?;
                Ok(constant)
            })
            .collect()
    }

    fn add_meta_static_method_type(&mut self, m: &MetaStaticMethodType) -> Result<()> {
        self.assert_in_tx();
        self.conn
            .execute(
                "INSERT INTO meta_static_method_types
                    (fqcn, method, argument_index, value, return_type)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![m.fqcn, m.method, m.argument_index, m.value, m.return_type],
            )
            .map_err(map_err)?;
        Ok(())
    }

    fn meta_static_method_types(
        &self,
        fqcn: &str,
        method: &str,
    ) -> Result<Vec<MetaStaticMethodType>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT fqcn, method, argument_index, value, return_type
                 FROM meta_static_method_types
                 WHERE fqcn = ?1 AND method = ?2 ORDER BY argument_index",
            )
            .map_err(map_err)?;
        let hints = stmt
            .query_map(params![fqcn, method], |row| {
                Ok(MetaStaticMethodType {
                    fqcn: row.get(0)?,
                    method: row.get(1)?,
                    argument_index: row.get(2)?,
                    value: row.get(3)?,
                    return_type: row.get(4)?,
                })
            })
            .map_err(map_err)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(map_err)?;
        Ok(hints)
    }

    fn stats(&self) -> Result<IndexStats> {
        let count = |sql: &str| -> Result<usize> {
            self.conn
                .query_row(sql, [], |row| row.get::<_, i64>(0))
                .map(|n| n as usize)
                .map_err(map_err)
        };

        Ok(IndexStats {
            total_files: count("SELECT COUNT(*) FROM files")?,
            total_structures: count("SELECT COUNT(*) FROM structures")?,
            total_functions: count("SELECT COUNT(*) FROM functions")?,
            total_constants: count("SELECT COUNT(*) FROM constants")?,
            total_properties: count("SELECT COUNT(*) FROM properties")?,
            last_indexed: self
                .conn
                .query_row("SELECT MAX(last_indexed) FROM files", [], |row| row.get(0))
                .map_err(map_err)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn new_structure(fqcn: &str, file_id: i64) -> NewStructure {
        NewStructure {
            fqcn: fqcn.to_string(),
            kind: StructureKind::Class,
            file_id,
            start_line: 3,
            end_line: 10,
            short_description: None,
            long_description: None,
            is_abstract: false,
            is_final: false,
            is_deprecated: false,
            is_anonymous: false,
            has_docblock: false,
        }
    }

    #[test]
    fn test_create_database_on_disk() {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("index.sqlite");

        SqliteStorage::open_path(&db_path).unwrap();
        assert!(db_path.exists());
    }

    #[test]
    fn test_upsert_and_lookup_file() {
        let mut storage = SqliteStorage::open_in_memory().unwrap();

        storage.begin_transaction().unwrap();
        let id = storage.upsert_file("/src/A.php", 100, None).unwrap();
        storage.commit_transaction().unwrap();

        let file = storage.file_by_uri("/src/A.php").unwrap();
        assert_eq!(file.id, id);
        assert_eq!(file.last_indexed, 100);
        assert!(file.source_hash.is_none());
        assert_eq!(storage.file_by_id(id).unwrap().uri, "/src/A.php");

        // Upsert keeps the row id stable.
        storage.begin_transaction().unwrap();
        let id2 = storage.upsert_file("/src/A.php", 200, Some("abc")).unwrap();
        storage.commit_transaction().unwrap();
        assert_eq!(id, id2);
        assert_eq!(
            storage.file_by_uri("/src/A.php").unwrap().source_hash,
            Some("abc".to_string())
        );
    }

    #[test]
    fn test_file_not_found_is_typed() {
        let storage = SqliteStorage::open_in_memory().unwrap();
        let err = storage.file_by_uri("/nowhere.php").unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_structure_roundtrip_and_unique_fqcn() {
        let mut storage = SqliteStorage::open_in_memory().unwrap();

        storage.begin_transaction().unwrap();
        let file_id = storage.upsert_file("/src/A.php", 1, None).unwrap();
        storage.insert_structure(&new_structure("\\App\\A", file_id)).unwrap();
        storage.commit_transaction().unwrap();

        let found = storage.structure_by_fqcn("\\App\\A").unwrap();
        assert_eq!(found.kind, StructureKind::Class);
        assert_eq!(found.file_id, file_id);

        // A second insert with the same FQCN surfaces a storage error,
        // it is never silently overwritten.
        storage.begin_transaction().unwrap();
        let err = storage
            .insert_structure(&new_structure("\\App\\A", file_id))
            .unwrap_err();
        assert!(matches!(err, StorageError::Backend(_)));
        storage.rollback_transaction().unwrap();
    }

    #[test]
    fn test_rollback_restores_prior_entities() {
        let mut storage = SqliteStorage::open_in_memory().unwrap();

        storage.begin_transaction().unwrap();
        let file_id = storage.upsert_file("/src/A.php", 1, None).unwrap();
        storage.insert_structure(&new_structure("\\A", file_id)).unwrap();
        storage.commit_transaction().unwrap();

        // Replacement pass that dies before commit.
        storage.begin_transaction().unwrap();
        storage.delete_file_entities(file_id).unwrap();
        storage.insert_structure(&new_structure("\\B", file_id)).unwrap();
        storage.rollback_transaction().unwrap();

        // The pre-replacement entity set is intact, never a partial one.
        assert!(storage.structure_by_fqcn("\\A").is_ok());
        assert!(storage.structure_by_fqcn("\\B").is_err());
        assert_eq!(storage.structures_in_file(file_id).unwrap().len(), 1);
    }

    #[test]
    fn test_delete_file_cascades() {
        let mut storage = SqliteStorage::open_in_memory().unwrap();

        storage.begin_transaction().unwrap();
        let file_id = storage.upsert_file("/src/A.php", 1, None).unwrap();
        let structure_id = storage
            .insert_structure(&new_structure("\\A", file_id))
            .unwrap();
        storage
            .insert_property(&NewProperty {
                name: "value".to_string(),
                structure_id,
                line: 4,
                access_modifier: AccessModifier::Private,
                is_static: false,
                is_magic: false,
                is_deprecated: false,
                has_docblock: false,
                short_description: None,
                long_description: None,
                types: vec![TypeRef::scalar("int")],
                default_value: None,
            })
            .unwrap();
        storage.delete_file(file_id).unwrap();
        storage.commit_transaction().unwrap();

        assert!(storage.file_by_uri("/src/A.php").is_err());
        assert!(storage.structure_by_fqcn("\\A").is_err());
        assert!(storage.properties_of_structure(structure_id).unwrap().is_empty());
    }

    #[test]
    fn test_dangling_parent_link_resolves_by_name() {
        let mut storage = SqliteStorage::open_in_memory().unwrap();

        storage.begin_transaction().unwrap();
        let file_id = storage.upsert_file("/src/B.php", 1, None).unwrap();
        let b = storage.insert_structure(&new_structure("\\B", file_id)).unwrap();
        // \A is not indexed yet; the link is stored by name and is a
        // valid, stable state.
        storage.add_structure_parent(b, "\\A").unwrap();
        storage.commit_transaction().unwrap();

        assert_eq!(storage.structure_parents(b).unwrap(), vec!["\\A".to_string()]);
        assert!(storage.structure_by_fqcn("\\A").is_err());

        // Once \A exists, the join finds B without B changing at all.
        storage.begin_transaction().unwrap();
        let file_a = storage.upsert_file("/src/A.php", 1, None).unwrap();
        storage.insert_structure(&new_structure("\\A", file_a)).unwrap();
        storage.commit_transaction().unwrap();

        let children = storage.child_structures_of("\\A").unwrap();
        assert_eq!(children.len(), 1);
        assert_eq!(children[0].fqcn, "\\B");
    }

    #[test]
    fn test_function_json_columns_roundtrip() {
        let mut storage = SqliteStorage::open_in_memory().unwrap();

        storage.begin_transaction().unwrap();
        let file_id = storage.upsert_file("/src/fn.php", 1, None).unwrap();
        storage
            .insert_function(&NewFunction {
                name: "render".to_string(),
                fqcn: Some("\\render".to_string()),
                file_id,
                structure_id: None,
                access_modifier: None,
                start_line: 3,
                end_line: 8,
                is_static: false,
                is_abstract: false,
                is_final: false,
                is_magic: false,
                is_deprecated: false,
                has_docblock: true,
                short_description: Some("Render a template.".to_string()),
                long_description: None,
                return_types: vec![TypeRef::scalar("string")],
                parameters: vec![Parameter {
                    name: "template".to_string(),
                    types: vec![TypeRef::scalar("string")],
                    default_value: None,
                    is_reference: false,
                    is_variadic: false,
                    is_optional: false,
                }],
                throws: vec!["\\RuntimeException".to_string()],
            })
            .unwrap();
        storage.commit_transaction().unwrap();

        let functions = storage.functions_in_file(file_id).unwrap();
        assert_eq!(functions.len(), 1);
        assert_eq!(functions[0].parameters[0].name, "template");
        assert_eq!(functions[0].return_types[0].fqcn, "string");
        assert_eq!(functions[0].throws, vec!["\\RuntimeException".to_string()]);
    }

    #[test]
    fn test_meta_static_method_types() {
        let mut storage = SqliteStorage::open_in_memory().unwrap();

        storage.begin_transaction().unwrap();
        storage
            .add_meta_static_method_type(&MetaStaticMethodType {
                fqcn: "\\Factory".to_string(),
                method: "create".to_string(),
                argument_index: 0,
                value: "user".to_string(),
                return_type: "\\App\\User".to_string(),
            })
            .unwrap();
        storage.commit_transaction().unwrap();

        let hints = storage.meta_static_method_types("\\Factory", "create").unwrap();
        assert_eq!(hints.len(), 1);
        assert_eq!(hints[0].return_type, "\\App\\User");
        assert!(storage
            .meta_static_method_types("\\Factory", "other")
            .unwrap()
            .is_empty());
    }

    #[test]
    #[should_panic(expected = "nesting is not supported")]
    fn test_nested_transaction_panics() {
        let mut storage = SqliteStorage::open_in_memory().unwrap();
        storage.begin_transaction().unwrap();
        storage.begin_transaction().unwrap();
    }

    #[test]
    #[should_panic(expected = "outside of an explicit transaction")]
    fn test_mutation_outside_transaction_panics() {
        let mut storage = SqliteStorage::open_in_memory().unwrap();
        storage.upsert_file("/src/A.php", 1, None).unwrap();
    }

    #[test]
    fn test_stats() {
        let mut storage = SqliteStorage::open_in_memory().unwrap();
        let stats = storage.stats().unwrap();
        assert_eq!(stats.total_files, 0);
        assert_eq!(stats.total_structures, 0);
        assert!(stats.last_indexed.is_none());

        storage.begin_transaction().unwrap();
        storage.upsert_file("/src/A.php", 42, None).unwrap();
        storage.commit_transaction().unwrap();

        let stats = storage.stats().unwrap();
        assert_eq!(stats.total_files, 1);
        assert_eq!(stats.last_indexed, Some(42));
    }
}
