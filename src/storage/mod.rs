// Index entities and the storage abstraction

pub mod events;
pub mod schema;
pub mod sqlite;

use serde::{Deserialize, Serialize};

use crate::error::StorageError;

pub type Result<T> = std::result::Result<T, StorageError>;

/// An indexed source file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceFile {
    pub id: i64,
    pub uri: String,
    /// Unix seconds; bumped strictly monotonically on every successful index.
    pub last_indexed: i64,
    /// blake3 hex of the last indexed source. The bulk timestamp path does
    /// not compute it, so it can be absent for an indexed file.
    pub source_hash: Option<String>,
}

/// A namespace block inside a file. `name` is `None` for the global
/// namespace.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NamespaceBlock {
    pub id: i64,
    pub file_id: i64,
    pub name: Option<String>,
    pub start_line: u32,
    pub end_line: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImportKind {
    Type,
    Function,
    Constant,
}

impl ImportKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ImportKind::Type => "type",
            ImportKind::Function => "function",
            ImportKind::Constant => "constant",
        }
    }

    pub fn from_str(s: &str) -> Result<Self> {
        match s {
            "type" => Ok(ImportKind::Type),
            "function" => Ok(ImportKind::Function),
            "constant" => Ok(ImportKind::Constant),
            _ => Err(StorageError::Backend(format!("unknown import kind: {s}"))),
        }
    }
}

/// A `use` import belonging to a namespace block.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Import {
    pub id: i64,
    pub namespace_id: i64,
    /// Local alias the imported name is known under in this file.
    pub alias: String,
    /// Imported fully qualified name.
    pub name: String,
    pub kind: ImportKind,
    pub line: u32,
}

/// Class-like kind codes; a fixed lookup table seeded at schema creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StructureKind {
    Class,
    Interface,
    Trait,
}

impl StructureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StructureKind::Class => "class",
            StructureKind::Interface => "interface",
            StructureKind::Trait => "trait",
        }
    }

    pub fn from_str(s: &str) -> Result<Self> {
        match s {
            "class" => Ok(StructureKind::Class),
            "interface" => Ok(StructureKind::Interface),
            "trait" => Ok(StructureKind::Trait),
            _ => Err(StorageError::Backend(format!("unknown structure type: {s}"))),
        }
    }
}

/// Member access levels; a fixed lookup table seeded at schema creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessModifier {
    Public,
    Protected,
    Private,
}

impl AccessModifier {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccessModifier::Public => "public",
            AccessModifier::Protected => "protected",
            AccessModifier::Private => "private",
        }
    }

    pub fn from_str(s: &str) -> Result<Self> {
        match s {
            "public" => Ok(AccessModifier::Public),
            "protected" => Ok(AccessModifier::Protected),
            "private" => Ok(AccessModifier::Private),
            _ => Err(StorageError::Backend(format!("unknown access modifier: {s}"))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessModifierRow {
    pub id: i64,
    pub code: AccessModifier,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StructureTypeRow {
    pub id: i64,
    pub code: StructureKind,
}

/// A resolved type reference. `name` is the type as written (after alias
/// resolution for class-likes), `fqcn` the fully qualified form; for
/// scalars the two coincide.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeRef {
    pub name: String,
    pub fqcn: String,
}

impl TypeRef {
    pub fn scalar(name: &str) -> Self {
        Self {
            name: name.to_string(),
            fqcn: name.to_string(),
        }
    }
}

/// A class, interface, or trait.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Structure {
    pub id: i64,
    pub fqcn: String,
    pub kind: StructureKind,
    pub file_id: i64,
    pub start_line: u32,
    pub end_line: u32,
    pub short_description: Option<String>,
    pub long_description: Option<String>,
    pub is_abstract: bool,
    pub is_final: bool,
    pub is_deprecated: bool,
    pub is_anonymous: bool,
    pub has_docblock: bool,
}

#[derive(Debug, Clone)]
pub struct NewStructure {
    pub fqcn: String,
    pub kind: StructureKind,
    pub file_id: i64,
    pub start_line: u32,
    pub end_line: u32,
    pub short_description: Option<String>,
    pub long_description: Option<String>,
    pub is_abstract: bool,
    pub is_final: bool,
    pub is_deprecated: bool,
    pub is_anonymous: bool,
    pub has_docblock: bool,
}

/// A trait-member alias (`use A { foo as protected bar; }`). `trait_fqcn`
/// is absent when the source names no trait (`use A { foo as bar; }` with
/// a single used trait).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraitAlias {
    pub structure_id: i64,
    pub trait_fqcn: Option<String>,
    pub name: String,
    pub alias: Option<String>,
    pub access_modifier: Option<AccessModifier>,
}

/// A trait-member precedence rule (`use A, B { A::foo insteadof B; }`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraitPrecedence {
    pub structure_id: i64,
    pub trait_fqcn: String,
    pub name: String,
}

/// A parameter of a function-like.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Parameter {
    pub name: String,
    pub types: Vec<TypeRef>,
    pub default_value: Option<String>,
    pub is_reference: bool,
    pub is_variadic: bool,
    pub is_optional: bool,
}

/// A free function or a method. Methods carry `structure_id` and an
/// access modifier; free functions carry an FQCN.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionLike {
    pub id: i64,
    pub name: String,
    pub fqcn: Option<String>,
    pub file_id: i64,
    pub structure_id: Option<i64>,
    pub access_modifier: Option<AccessModifier>,
    pub start_line: u32,
    pub end_line: u32,
    pub is_static: bool,
    pub is_abstract: bool,
    pub is_final: bool,
    pub is_magic: bool,
    pub is_deprecated: bool,
    pub has_docblock: bool,
    pub short_description: Option<String>,
    pub long_description: Option<String>,
    pub return_types: Vec<TypeRef>,
    pub parameters: Vec<Parameter>,
    pub throws: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct NewFunction {
    pub name: String,
    pub fqcn: Option<String>,
    pub file_id: i64,
    pub structure_id: Option<i64>,
    pub access_modifier: Option<AccessModifier>,
    pub start_line: u32,
    pub end_line: u32,
    pub is_static: bool,
    pub is_abstract: bool,
    pub is_final: bool,
    pub is_magic: bool,
    pub is_deprecated: bool,
    pub has_docblock: bool,
    pub short_description: Option<String>,
    pub long_description: Option<String>,
    pub return_types: Vec<TypeRef>,
    pub parameters: Vec<Parameter>,
    pub throws: Vec<String>,
}

/// A property declared (or documented as magic) on a structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Property {
    pub id: i64,
    pub name: String,
    pub structure_id: i64,
    pub line: u32,
    pub access_modifier: AccessModifier,
    pub is_static: bool,
    pub is_magic: bool,
    pub is_deprecated: bool,
    pub has_docblock: bool,
    pub short_description: Option<String>,
    pub long_description: Option<String>,
    pub types: Vec<TypeRef>,
    pub default_value: Option<String>,
}

#[derive(Debug, Clone)]
pub struct NewProperty {
    pub name: String,
    pub structure_id: i64,
    pub line: u32,
    pub access_modifier: AccessModifier,
    pub is_static: bool,
    pub is_magic: bool,
    pub is_deprecated: bool,
    pub has_docblock: bool,
    pub short_description: Option<String>,
    pub long_description: Option<String>,
    pub types: Vec<TypeRef>,
    pub default_value: Option<String>,
}

/// A class constant or a global constant. Global constants carry an FQCN
/// and no structure; the access modifier is absent outside classes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Constant {
    pub id: i64,
    pub name: String,
    pub fqcn: Option<String>,
    pub file_id: i64,
    pub structure_id: Option<i64>,
    pub access_modifier: Option<AccessModifier>,
    pub line: u32,
    pub is_deprecated: bool,
    pub has_docblock: bool,
    pub short_description: Option<String>,
    pub long_description: Option<String>,
    pub types: Vec<TypeRef>,
    pub default_value: Option<String>,
}

#[derive(Debug, Clone)]
pub struct NewConstant {
    pub name: String,
    pub fqcn: Option<String>,
    pub file_id: i64,
    pub structure_id: Option<i64>,
    pub access_modifier: Option<AccessModifier>,
    pub line: u32,
    pub is_deprecated: bool,
    pub has_docblock: bool,
    pub short_description: Option<String>,
    pub long_description: Option<String>,
    pub types: Vec<TypeRef>,
    pub default_value: Option<String>,
}

/// An authored type hint for a static factory method argument, used to
/// compensate for dynamic factory patterns that cannot be inferred.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetaStaticMethodType {
    pub fqcn: String,
    pub method: String,
    pub argument_index: i64,
    pub value: String,
    pub return_type: String,
}

#[derive(Debug, Clone)]
pub struct NewNamespace {
    pub file_id: i64,
    pub name: Option<String>,
    pub start_line: u32,
    pub end_line: u32,
}

#[derive(Debug, Clone)]
pub struct NewImport {
    pub namespace_id: i64,
    pub alias: String,
    pub name: String,
    pub kind: ImportKind,
    pub line: u32,
}

/// Index-wide counts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexStats {
    pub total_files: usize,
    pub total_structures: usize,
    pub total_functions: usize,
    pub total_constants: usize,
    pub total_properties: usize,
    pub last_indexed: Option<i64>,
}

/// The transactional persistence layer over index entities.
///
/// All mutation operations must occur inside an explicit transaction;
/// committing outside one, or nesting transactions, is a programming
/// error and panics. Relational links between structures are stored as
/// `(structure id, target FQCN)` pairs and are resolved by name at query
/// time; a dangling link is a valid, stable state.
pub trait Storage {
    fn begin_transaction(&mut self) -> Result<()>;
    fn commit_transaction(&mut self) -> Result<()>;
    fn rollback_transaction(&mut self) -> Result<()>;
    fn in_transaction(&self) -> bool;

    fn upsert_file(&mut self, uri: &str, last_indexed: i64, source_hash: Option<&str>)
        -> Result<i64>;
    fn set_file_source_hash(&mut self, file_id: i64, hash: &str) -> Result<()>;
    fn file_by_uri(&self, uri: &str) -> Result<SourceFile>;
    fn file_by_id(&self, id: i64) -> Result<SourceFile>;
    fn files(&self) -> Result<Vec<SourceFile>>;
    /// Delete the file row and, transitively, everything it owns.
    fn delete_file(&mut self, file_id: i64) -> Result<()>;
    /// Delete everything the file owns but keep the file row itself.
    fn delete_file_entities(&mut self, file_id: i64) -> Result<()>;

    fn access_modifiers(&self) -> Result<Vec<AccessModifierRow>>;
    fn structure_types(&self) -> Result<Vec<StructureTypeRow>>;

    fn insert_namespace(&mut self, ns: &NewNamespace) -> Result<i64>;
    fn namespaces_in_file(&self, file_id: i64) -> Result<Vec<NamespaceBlock>>;
    fn insert_import(&mut self, import: &NewImport) -> Result<i64>;
    fn imports_in_namespace(&self, namespace_id: i64) -> Result<Vec<Import>>;

    fn insert_structure(&mut self, s: &NewStructure) -> Result<i64>;
    fn structure_by_fqcn(&self, fqcn: &str) -> Result<Structure>;
    fn structures_in_file(&self, file_id: i64) -> Result<Vec<Structure>>;

    fn add_structure_parent(&mut self, structure_id: i64, parent_fqcn: &str) -> Result<()>;
    fn add_structure_interface(&mut self, structure_id: i64, interface_fqcn: &str) -> Result<()>;
    fn add_structure_trait(&mut self, structure_id: i64, trait_fqcn: &str) -> Result<()>;
    fn add_trait_alias(&mut self, alias: &TraitAlias) -> Result<()>;
    fn add_trait_precedence(&mut self, precedence: &TraitPrecedence) -> Result<()>;
    fn structure_parents(&self, structure_id: i64) -> Result<Vec<String>>;
    fn structure_interfaces(&self, structure_id: i64) -> Result<Vec<String>>;
    fn structure_traits(&self, structure_id: i64) -> Result<Vec<String>>;
    fn trait_aliases(&self, structure_id: i64) -> Result<Vec<TraitAlias>>;
    fn trait_precedences(&self, structure_id: i64) -> Result<Vec<TraitPrecedence>>;
    /// Structures whose parent link names the given FQCN. Resolved by a
    /// join on the stored name, so it works whether or not the parent
    /// itself is indexed.
    fn child_structures_of(&self, fqcn: &str) -> Result<Vec<Structure>>;

    fn insert_function(&mut self, f: &NewFunction) -> Result<i64>;
    fn functions_in_file(&self, file_id: i64) -> Result<Vec<FunctionLike>>;
    fn methods_of_structure(&self, structure_id: i64) -> Result<Vec<FunctionLike>>;

    fn insert_property(&mut self, p: &NewProperty) -> Result<i64>;
    fn properties_of_structure(&self, structure_id: i64) -> Result<Vec<Property>>;

    fn insert_constant(&mut self, c: &NewConstant) -> Result<i64>;
    fn constants_of_structure(&self, structure_id: i64) -> Result<Vec<Constant>>;
    fn constants_in_file(&self, file_id: i64) -> Result<Vec<Constant>>;

    fn add_meta_static_method_type(&mut self, m: &MetaStaticMethodType) -> Result<()>;
    fn meta_static_method_types(&self, fqcn: &str, method: &str)
        -> Result<Vec<MetaStaticMethodType>>;

    fn stats(&self) -> Result<IndexStats>;
}
