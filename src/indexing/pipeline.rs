// Per-file indexing pipeline
//
// Takes a file identity and its current source text and produces a fully
// replaced set of declaration entities inside one transaction, or fails
// leaving the previously committed state untouched.

use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::debug;

use super::change::{self, HashDecision};
use super::docblock::{Docblock, MagicMethod, MagicProperty};
use super::extract::{
    self, RawConstant, RawFileIndex, RawFunction, RawImport, RawParameter, RawProperty,
    RawStructure, RawTypeHint,
};
use crate::error::IndexError;
use crate::storage::{
    AccessModifier, ImportKind, NewConstant, NewFunction, NewImport, NewNamespace, NewProperty,
    NewStructure, Parameter, SourceFile, Storage, TraitAlias, TraitPrecedence, TypeRef,
};

/// Which skip strategy the call path selects. Bulk project indexing
/// compares filesystem mtimes; single-file did-change indexing compares
/// content hashes. The two have deliberately different semantics and are
/// never merged.
#[derive(Debug, Clone, Copy)]
pub enum SkipStrategy {
    Timestamp { disk_mtime: i64, overridden: bool },
    ContentHash,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexOutcome {
    Indexed,
    Skipped,
}

/// Built-in type words that never resolve against imports or the
/// current namespace.
const TYPE_KEYWORDS: &[&str] = &[
    "int", "integer", "float", "double", "string", "bool", "boolean", "array", "object", "mixed",
    "void", "null", "callable", "iterable", "never", "false", "true", "resource", "scalar",
    "number",
];

const UNKNOWN_TYPE: &str = "mixed";

pub struct FileIndexer<'a, S: Storage> {
    storage: &'a mut S,
}

impl<'a, S: Storage> FileIndexer<'a, S> {
    pub fn new(storage: &'a mut S) -> Self {
        Self { storage }
    }

    /// Index one file. On any failure after the entity deletion the
    /// whole transaction rolls back, so a mid-walk failure never leaves
    /// a half-replaced file.
    pub fn index(
        &mut self,
        uri: &str,
        source: &str,
        strategy: SkipStrategy,
    ) -> Result<IndexOutcome, IndexError> {
        let prior = match self.storage.file_by_uri(uri) {
            Ok(file) => Some(file),
            Err(e) if e.is_not_found() => None,
            Err(e) => return Err(e.into()),
        };

        let new_hash = match strategy {
            SkipStrategy::Timestamp { disk_mtime, overridden } => {
                if change::is_up_to_date(prior.as_ref(), disk_mtime, overridden) {
                    debug!("Skipping {} (not modified since last index)", uri);
                    return Ok(IndexOutcome::Skipped);
                }
                None
            }
            SkipStrategy::ContentHash => match change::check_hash(prior.as_ref(), source) {
                HashDecision::SkipBody { hash } => {
                    debug!("Skipping {} (content unchanged)", uri);
                    // The hash is refreshed even when the body is
                    // skipped, so a later identical edit is recognized
                    // without recomputation.
                    let file = prior.expect("hash can only match a known file");
                    self.storage.begin_transaction()?;
                    self.storage.set_file_source_hash(file.id, &hash)?;
                    self.storage.commit_transaction()?;
                    return Ok(IndexOutcome::Skipped);
                }
                HashDecision::IndexBody { hash } => Some(hash),
            },
        };

        self.storage.begin_transaction()?;
        match self.index_in_transaction(uri, source, prior.as_ref(), new_hash.as_deref()) {
            Ok(()) => {
                self.storage.commit_transaction()?;
                Ok(IndexOutcome::Indexed)
            }
            Err(e) => {
                let _ = self.storage.rollback_transaction();
                Err(e)
            }
        }
    }

    fn index_in_transaction(
        &mut self,
        uri: &str,
        source: &str,
        prior: Option<&SourceFile>,
        new_hash: Option<&str>,
    ) -> Result<(), IndexError> {
        // Parse first: a parse failure aborts before any deletion and
        // preserves the previously indexed version of the file.
        let tree = extract::parse_source(source).ok_or_else(|| IndexError::Parse {
            uri: uri.to_string(),
        })?;
        if tree.root_node().has_error() {
            return Err(IndexError::Parse {
                uri: uri.to_string(),
            });
        }

        // Timestamps are unique per pass even within one wall-clock
        // second, so "reindexed" is always observable.
        let last_indexed = prior
            .map(|f| f.last_indexed + 1)
            .unwrap_or(0)
            .max(now_unix());

        let file_id = self.storage.upsert_file(uri, last_indexed, new_hash)?;
        self.storage.delete_file_entities(file_id)?;

        let raw = extract::extract(&tree, source).map_err(|reason| IndexError::Extraction {
            uri: uri.to_string(),
            reason,
        })?;

        self.write_namespaces(file_id, &raw)?;
        debug!(
            "Indexing {}: {} namespaces, {} structures, {} functions, {} constants",
            uri,
            raw.namespaces.len(),
            raw.structures.len(),
            raw.functions.len(),
            raw.constants.len()
        );

        for constant in &raw.constants {
            self.write_global_constant(file_id, &raw, constant)?;
        }
        for function in &raw.functions {
            self.write_free_function(file_id, &raw, function)?;
        }
        for structure in &raw.structures {
            self.write_structure(uri, file_id, &raw, structure)?;
        }

        Ok(())
    }

    fn write_namespaces(&mut self, file_id: i64, raw: &RawFileIndex) -> Result<(), IndexError> {
        for namespace in &raw.namespaces {
            let namespace_id = self.storage.insert_namespace(&NewNamespace {
                file_id,
                name: namespace.name.clone(),
                start_line: namespace.start_line,
                end_line: namespace.end_line,
            })?;
            for import in &namespace.imports {
                self.storage.insert_import(&NewImport {
                    namespace_id,
                    alias: import.alias.clone(),
                    name: import.name.clone(),
                    kind: import.kind,
                    line: import.line,
                })?;
            }
        }
        Ok(())
    }

    fn write_global_constant(
        &mut self,
        file_id: i64,
        raw: &RawFileIndex,
        constant: &RawConstant,
    ) -> Result<(), IndexError> {
        let resolver = resolver_for_line(raw, constant.line);
        // `define()` names the constant absolutely, `const` declares it
        // into the surrounding namespace.
        let fqcn = if constant.is_define {
            format!("\\{}", constant.name.trim_start_matches('\\'))
        } else {
            resolver.qualify(&constant.name)
        };

        let docblock = constant.docblock.as_ref();
        let types = resolve_types(
            docblock.and_then(|d| d.var_type.as_deref()),
            None,
            constant.default_value.as_deref(),
            &resolver,
            None,
        );

        self.storage.insert_constant(&NewConstant {
            name: constant.name.clone(),
            fqcn: Some(fqcn),
            file_id,
            structure_id: None,
            access_modifier: None,
            line: constant.line,
            is_deprecated: docblock.map(|d| d.is_deprecated).unwrap_or(false),
            has_docblock: docblock.is_some(),
            short_description: docblock.and_then(|d| d.summary.clone()),
            long_description: docblock.and_then(|d| d.description.clone()),
            types,
            default_value: constant.default_value.clone(),
        })?;
        Ok(())
    }

    fn write_free_function(
        &mut self,
        file_id: i64,
        raw: &RawFileIndex,
        function: &RawFunction,
    ) -> Result<(), IndexError> {
        let resolver = resolver_for_line(raw, function.start_line);
        let fqcn = resolver.qualify(&function.name);
        let record = build_function(function, Some(fqcn), file_id, None, None, &resolver, None);
        self.storage.insert_function(&record)?;
        Ok(())
    }

    fn write_structure(
        &mut self,
        uri: &str,
        file_id: i64,
        raw: &RawFileIndex,
        structure: &RawStructure,
    ) -> Result<(), IndexError> {
        let resolver = resolver_for_line(raw, structure.start_line);
        let fqcn = match &structure.name {
            Some(name) => resolver.qualify(name),
            None => anonymous_fqcn(uri, structure.start_line),
        };

        let docblock = structure.docblock.as_ref();
        let structure_id = self.storage.insert_structure(&NewStructure {
            fqcn: fqcn.clone(),
            kind: structure.kind,
            file_id,
            start_line: structure.start_line,
            end_line: structure.end_line,
            short_description: docblock.and_then(|d| d.summary.clone()),
            long_description: docblock.and_then(|d| d.description.clone()),
            is_abstract: structure.is_abstract,
            is_final: structure.is_final,
            is_deprecated: docblock.map(|d| d.is_deprecated).unwrap_or(false),
            is_anonymous: structure.name.is_none(),
            has_docblock: docblock.is_some(),
        })?;

        // Links are stored against the resolved target name, never a row
        // id: the target may live in a file that is not indexed yet.
        for parent in &structure.extends {
            self.storage
                .add_structure_parent(structure_id, &resolver.resolve_type(parent))?;
        }
        for interface in &structure.implements {
            self.storage
                .add_structure_interface(structure_id, &resolver.resolve_type(interface))?;
        }
        for trait_use in &structure.trait_uses {
            for used_trait in &trait_use.traits {
                self.storage
                    .add_structure_trait(structure_id, &resolver.resolve_type(used_trait))?;
            }
            for alias in &trait_use.aliases {
                self.storage.add_trait_alias(&TraitAlias {
                    structure_id,
                    trait_fqcn: alias
                        .trait_name
                        .as_deref()
                        .map(|name| resolver.resolve_type(name)),
                    name: alias.method.clone(),
                    alias: alias.alias.clone(),
                    access_modifier: alias.visibility,
                })?;
            }
            for precedence in &trait_use.precedences {
                self.storage.add_trait_precedence(&TraitPrecedence {
                    structure_id,
                    trait_fqcn: resolver.resolve_type(&precedence.trait_name),
                    name: precedence.method.clone(),
                })?;
            }
        }

        for constant in &structure.constants {
            self.write_class_constant(file_id, structure_id, constant, &resolver, &fqcn)?;
        }
        for property in &structure.properties {
            self.write_property(structure_id, property, &resolver, &fqcn)?;
        }
        for method in &structure.methods {
            let record = build_function(
                &method.function,
                None,
                file_id,
                Some(structure_id),
                Some(method.visibility.unwrap_or(AccessModifier::Public)),
                &resolver,
                Some(&fqcn),
            );
            let record = NewFunction {
                is_static: method.is_static,
                is_abstract: method.is_abstract,
                is_final: method.is_final,
                ..record
            };
            self.storage.insert_function(&record)?;
        }

        if let Some(docblock) = docblock {
            self.write_magic_members(file_id, structure_id, structure, docblock, &resolver, &fqcn)?;
        }

        Ok(())
    }

    fn write_class_constant(
        &mut self,
        file_id: i64,
        structure_id: i64,
        constant: &extract::RawClassConstant,
        resolver: &NameResolver,
        structure_fqcn: &str,
    ) -> Result<(), IndexError> {
        let docblock = constant.docblock.as_ref();
        let types = resolve_types(
            docblock.and_then(|d| d.var_type.as_deref()),
            None,
            constant.default_value.as_deref(),
            resolver,
            Some(structure_fqcn),
        );

        self.storage.insert_constant(&NewConstant {
            name: constant.name.clone(),
            fqcn: None,
            file_id,
            structure_id: Some(structure_id),
            access_modifier: Some(constant.visibility.unwrap_or(AccessModifier::Public)),
            line: constant.line,
            is_deprecated: docblock.map(|d| d.is_deprecated).unwrap_or(false),
            has_docblock: docblock.is_some(),
            short_description: docblock.and_then(|d| d.summary.clone()),
            long_description: docblock.and_then(|d| d.description.clone()),
            types,
            default_value: constant.default_value.clone(),
        })?;
        Ok(())
    }

    fn write_property(
        &mut self,
        structure_id: i64,
        property: &RawProperty,
        resolver: &NameResolver,
        structure_fqcn: &str,
    ) -> Result<(), IndexError> {
        let docblock = property.docblock.as_ref();
        let types = resolve_types(
            docblock.and_then(|d| d.var_type.as_deref()),
            property.hint.as_ref(),
            property.default_value.as_deref(),
            resolver,
            Some(structure_fqcn),
        );

        self.storage.insert_property(&NewProperty {
            name: property.name.clone(),
            structure_id,
            line: property.line,
            access_modifier: property.visibility.unwrap_or(AccessModifier::Public),
            is_static: property.is_static,
            is_magic: false,
            is_deprecated: docblock.map(|d| d.is_deprecated).unwrap_or(false),
            has_docblock: docblock.is_some(),
            short_description: docblock.and_then(|d| d.summary.clone()),
            long_description: docblock.and_then(|d| d.description.clone()),
            types,
            default_value: property.default_value.clone(),
        })?;
        Ok(())
    }

    /// Members documented on the structure's docblock but not physically
    /// declared.
    fn write_magic_members(
        &mut self,
        file_id: i64,
        structure_id: i64,
        structure: &RawStructure,
        docblock: &Docblock,
        resolver: &NameResolver,
        structure_fqcn: &str,
    ) -> Result<(), IndexError> {
        for magic in &docblock.magic_methods {
            self.write_magic_method(file_id, structure_id, structure, magic, resolver, structure_fqcn)?;
        }
        for magic in &docblock.magic_properties {
            self.write_magic_property(structure_id, structure, magic, resolver, structure_fqcn)?;
        }
        Ok(())
    }

    fn write_magic_method(
        &mut self,
        file_id: i64,
        structure_id: i64,
        structure: &RawStructure,
        magic: &MagicMethod,
        resolver: &NameResolver,
        structure_fqcn: &str,
    ) -> Result<(), IndexError> {
        let parameters = magic
            .parameters
            .iter()
            .map(|parameter| Parameter {
                name: parameter.name.clone(),
                types: parameter
                    .type_expr
                    .as_deref()
                    .map(|expr| resolve_type_expression(expr, resolver, Some(structure_fqcn)))
                    .unwrap_or_default(),
                default_value: None,
                is_reference: false,
                is_variadic: false,
                is_optional: false,
            })
            .collect();

        self.storage.insert_function(&NewFunction {
            name: magic.name.clone(),
            fqcn: None,
            file_id,
            structure_id: Some(structure_id),
            access_modifier: Some(AccessModifier::Public),
            start_line: structure.start_line,
            end_line: structure.start_line,
            is_static: magic.is_static,
            is_abstract: false,
            is_final: false,
            is_magic: true,
            is_deprecated: false,
            has_docblock: false,
            short_description: None,
            long_description: None,
            return_types: magic
                .return_type
                .as_deref()
                .map(|expr| resolve_type_expression(expr, resolver, Some(structure_fqcn)))
                .unwrap_or_else(|| vec![TypeRef::scalar(UNKNOWN_TYPE)]),
            parameters,
            throws: Vec::new(),
        })?;
        Ok(())
    }

    fn write_magic_property(
        &mut self,
        structure_id: i64,
        structure: &RawStructure,
        magic: &MagicProperty,
        resolver: &NameResolver,
        structure_fqcn: &str,
    ) -> Result<(), IndexError> {
        self.storage.insert_property(&NewProperty {
            name: magic.name.clone(),
            structure_id,
            line: structure.start_line,
            access_modifier: AccessModifier::Public,
            is_static: false,
            is_magic: true,
            is_deprecated: false,
            has_docblock: false,
            short_description: None,
            long_description: None,
            types: magic
                .type_expr
                .as_deref()
                .map(|expr| resolve_type_expression(expr, resolver, Some(structure_fqcn)))
                .unwrap_or_else(|| vec![TypeRef::scalar(UNKNOWN_TYPE)]),
            default_value: None,
        })?;
        Ok(())
    }
}

fn build_function(
    function: &RawFunction,
    fqcn: Option<String>,
    file_id: i64,
    structure_id: Option<i64>,
    access_modifier: Option<AccessModifier>,
    resolver: &NameResolver,
    structure_fqcn: Option<&str>,
) -> NewFunction {
    let docblock = function.docblock.as_ref();

    let parameters = function
        .parameters
        .iter()
        .map(|parameter| build_parameter(parameter, docblock, resolver, structure_fqcn))
        .collect();

    let return_types = resolve_types(
        docblock.and_then(|d| d.return_type.as_deref()),
        function.return_hint.as_ref(),
        None,
        resolver,
        structure_fqcn,
    );

    let throws = docblock
        .map(|d| {
            d.throws
                .iter()
                .map(|name| resolver.resolve_type(name))
                .collect()
        })
        .unwrap_or_default();

    NewFunction {
        name: function.name.clone(),
        fqcn,
        file_id,
        structure_id,
        access_modifier,
        start_line: function.start_line,
        end_line: function.end_line,
        is_static: false,
        is_abstract: false,
        is_final: false,
        is_magic: false,
        is_deprecated: docblock.map(|d| d.is_deprecated).unwrap_or(false),
        has_docblock: docblock.is_some(),
        short_description: docblock.and_then(|d| d.summary.clone()),
        long_description: docblock.and_then(|d| d.description.clone()),
        return_types,
        parameters,
        throws,
    }
}

fn build_parameter(
    parameter: &RawParameter,
    docblock: Option<&Docblock>,
    resolver: &NameResolver,
    structure_fqcn: Option<&str>,
) -> Parameter {
    let annotated = docblock.and_then(|d| d.param_types.get(&parameter.name).map(String::as_str));
    Parameter {
        name: parameter.name.clone(),
        types: resolve_types(
            annotated,
            parameter.hint.as_ref(),
            parameter.default_value.as_deref(),
            resolver,
            structure_fqcn,
        ),
        default_value: parameter.default_value.clone(),
        is_reference: parameter.is_reference,
        is_variadic: parameter.is_variadic,
        is_optional: parameter.default_value.is_some(),
    }
}

/// Resolve a member's type list. Precedence, highest first: annotated
/// docblock type, declared hint, type deduced from a literal default,
/// the unknown fallback. Nullability from an explicit `?` marker or a
/// `null` default is appended as an extra entry rather than mutating the
/// primary type.
fn resolve_types(
    annotated: Option<&str>,
    hint: Option<&RawTypeHint>,
    default_value: Option<&str>,
    resolver: &NameResolver,
    structure_fqcn: Option<&str>,
) -> Vec<TypeRef> {
    let mut nullable = hint.map(|h| h.nullable).unwrap_or(false);
    if default_value.map(|v| v.trim().eq_ignore_ascii_case("null")).unwrap_or(false) {
        nullable = true;
    }

    let mut types = if let Some(annotated) = annotated {
        let expr = match annotated.strip_prefix('?') {
            Some(stripped) => {
                nullable = true;
                stripped
            }
            None => annotated,
        };
        resolve_type_expression(expr, resolver, structure_fqcn)
    } else if let Some(hint) = hint {
        resolve_type_expression(&hint.expr, resolver, structure_fqcn)
    } else if let Some(deduced) = default_value.and_then(deduce_type_from_literal) {
        vec![TypeRef::scalar(deduced)]
    } else {
        vec![TypeRef::scalar(UNKNOWN_TYPE)]
    };

    if nullable && !types.iter().any(|t| t.name == "null") {
        types.push(TypeRef::scalar("null"));
    }
    types
}

/// Resolve a written type expression (`A|B[]|null`) into type
/// references.
fn resolve_type_expression(
    expr: &str,
    resolver: &NameResolver,
    structure_fqcn: Option<&str>,
) -> Vec<TypeRef> {
    expr.split(['|', '&'])
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(|part| {
            let (inner, array_suffix) = match part.strip_suffix("[]") {
                Some(inner) => (inner, "[]"),
                None => (part, ""),
            };

            if TYPE_KEYWORDS.contains(&inner.to_ascii_lowercase().as_str()) {
                return TypeRef::scalar(part);
            }
            if matches!(inner, "self" | "static" | "parent" | "$this") {
                // `parent` cannot be resolved without the hierarchy;
                // `self`/`static`/`$this` name the declaring structure.
                if let Some(fqcn) = structure_fqcn {
                    if inner != "parent" {
                        return TypeRef {
                            name: part.to_string(),
                            fqcn: format!("{fqcn}{array_suffix}"),
                        };
                    }
                }
                return TypeRef::scalar(part);
            }

            TypeRef {
                name: part.to_string(),
                fqcn: format!("{}{}", resolver.resolve_type(inner), array_suffix),
            }
        })
        .collect()
}

/// What a literal default value says about the member's type.
fn deduce_type_from_literal(literal: &str) -> Option<&'static str> {
    let literal = literal.trim();
    if literal.is_empty() {
        return None;
    }
    if literal.starts_with('\'') || literal.starts_with('"') {
        return Some("string");
    }
    if literal.eq_ignore_ascii_case("true") || literal.eq_ignore_ascii_case("false") {
        return Some("bool");
    }
    if literal.eq_ignore_ascii_case("null") {
        return Some("null");
    }
    if literal.starts_with('[') || literal.to_ascii_lowercase().starts_with("array(") {
        return Some("array");
    }
    let numeric = literal.strip_prefix('-').unwrap_or(literal);
    if !numeric.is_empty() && numeric.chars().all(|c| c.is_ascii_digit()) {
        return Some("int");
    }
    if numeric.chars().all(|c| c.is_ascii_digit() || c == '.')
        && numeric.chars().filter(|c| *c == '.').count() == 1
    {
        return Some("float");
    }
    None
}

/// Resolves short names against the file's active imports and the
/// surrounding namespace.
struct NameResolver<'a> {
    namespace: Option<&'a str>,
    imports: &'a [RawImport],
}

impl<'a> NameResolver<'a> {
    /// The FQCN a declaration with this short name gets in the current
    /// namespace.
    fn qualify(&self, name: &str) -> String {
        match self.namespace {
            Some(namespace) => format!("\\{}\\{}", namespace, name),
            None => format!("\\{}", name),
        }
    }

    /// Resolve a written type/class reference to an FQCN.
    fn resolve_type(&self, name: &str) -> String {
        self.resolve(name, ImportKind::Type)
    }

    fn resolve(&self, name: &str, kind: ImportKind) -> String {
        let name = name.trim();
        if let Some(absolute) = name.strip_prefix('\\') {
            return format!("\\{}", absolute);
        }
        if let Some(relative) = name.strip_prefix("namespace\\") {
            return self.qualify(relative);
        }

        let (first, rest) = match name.split_once('\\') {
            Some((first, rest)) => (first, Some(rest)),
            None => (name, None),
        };

        // For qualified references only the leading segment is matched
        // against type imports; unqualified references match imports of
        // the requested kind.
        let lookup_kind = if rest.is_some() { ImportKind::Type } else { kind };
        if let Some(import) = self
            .imports
            .iter()
            .find(|import| import.kind == lookup_kind && import.alias == first)
        {
            return match rest {
                Some(rest) => format!("{}\\{}", import.name, rest),
                None => import.name.clone(),
            };
        }

        self.qualify(name)
    }
}

fn resolver_for_line(raw: &RawFileIndex, line: u32) -> NameResolver {
    let namespace = &raw.namespaces[raw.namespace_index_for_line(line)];
    NameResolver {
        namespace: namespace.name.as_deref(),
        imports: &namespace.imports,
    }
}

fn anonymous_fqcn(uri: &str, line: u32) -> String {
    let stem = Path::new(uri)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("file");
    format!("\\anonymous_{stem}_{line}")
}

fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or_default()
}
