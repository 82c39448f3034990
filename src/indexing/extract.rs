// Declaration extraction from a parsed syntax tree
//
// Turns a tree-sitter tree into raw field values only; name resolution
// and type precedence are applied by the pipeline on top of this.

use once_cell::sync::Lazy;
use regex::Regex;
use tree_sitter::{Node, Parser as TreeParser, Tree};

use super::docblock::Docblock;
use crate::storage::{AccessModifier, ImportKind, StructureKind};

static TRAIT_AS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?:([\w\\]+)\s*::\s*)?(\w+)\s+as\s+(?:(public|protected|private)\s+)?(\w+)?")
        .unwrap()
});
static TRAIT_INSTEADOF: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^([\w\\]+)\s*::\s*(\w+)\s+insteadof\s+").unwrap());

/// Parse PHP source into a tree. `None` means the parser itself gave up;
/// a tree whose root contains an error node is also treated as a parse
/// failure by the pipeline.
pub fn parse_source(source: &str) -> Option<Tree> {
    let mut parser = TreeParser::new();
    parser
        .set_language(&tree_sitter_php::LANGUAGE_PHP.into())
        .ok()?;
    parser.parse(source, None)
}

/// A declared type as written, with an explicit nullable marker
/// (`?int`) already split off.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawTypeHint {
    pub expr: String,
    pub nullable: bool,
}

#[derive(Debug, Clone)]
pub struct RawImport {
    pub alias: String,
    pub name: String,
    pub kind: ImportKind,
    pub line: u32,
}

#[derive(Debug, Clone)]
pub struct RawNamespace {
    pub name: Option<String>,
    pub start_line: u32,
    pub end_line: u32,
    pub imports: Vec<RawImport>,
}

#[derive(Debug, Clone)]
pub struct RawConstant {
    pub name: String,
    pub line: u32,
    pub default_value: Option<String>,
    pub docblock: Option<Docblock>,
    /// `define('X', ...)` constants live in the global namespace no
    /// matter where the call appears.
    pub is_define: bool,
}

#[derive(Debug, Clone)]
pub struct RawParameter {
    pub name: String,
    pub hint: Option<RawTypeHint>,
    pub default_value: Option<String>,
    pub is_reference: bool,
    pub is_variadic: bool,
}

#[derive(Debug, Clone)]
pub struct RawFunction {
    pub name: String,
    pub start_line: u32,
    pub end_line: u32,
    pub parameters: Vec<RawParameter>,
    pub return_hint: Option<RawTypeHint>,
    pub docblock: Option<Docblock>,
}

#[derive(Debug, Clone)]
pub struct RawMethod {
    pub function: RawFunction,
    pub visibility: Option<AccessModifier>,
    pub is_static: bool,
    pub is_abstract: bool,
    pub is_final: bool,
}

#[derive(Debug, Clone)]
pub struct RawProperty {
    pub name: String,
    pub line: u32,
    pub hint: Option<RawTypeHint>,
    pub default_value: Option<String>,
    pub visibility: Option<AccessModifier>,
    pub is_static: bool,
    pub docblock: Option<Docblock>,
}

#[derive(Debug, Clone)]
pub struct RawClassConstant {
    pub name: String,
    pub line: u32,
    pub default_value: Option<String>,
    pub visibility: Option<AccessModifier>,
    pub docblock: Option<Docblock>,
}

#[derive(Debug, Clone)]
pub struct RawTraitAlias {
    pub trait_name: Option<String>,
    pub method: String,
    pub alias: Option<String>,
    pub visibility: Option<AccessModifier>,
}

#[derive(Debug, Clone)]
pub struct RawTraitPrecedence {
    pub trait_name: String,
    pub method: String,
}

#[derive(Debug, Clone, Default)]
pub struct RawTraitUse {
    pub traits: Vec<String>,
    pub aliases: Vec<RawTraitAlias>,
    pub precedences: Vec<RawTraitPrecedence>,
}

#[derive(Debug, Clone)]
pub struct RawStructure {
    /// `None` for anonymous classes.
    pub name: Option<String>,
    pub kind: StructureKind,
    pub start_line: u32,
    pub end_line: u32,
    pub is_abstract: bool,
    pub is_final: bool,
    pub extends: Vec<String>,
    pub implements: Vec<String>,
    pub docblock: Option<Docblock>,
    pub constants: Vec<RawClassConstant>,
    pub properties: Vec<RawProperty>,
    pub methods: Vec<RawMethod>,
    pub trait_uses: Vec<RawTraitUse>,
}

/// Everything one extraction sweep finds in a file.
#[derive(Debug, Clone, Default)]
pub struct RawFileIndex {
    pub namespaces: Vec<RawNamespace>,
    pub constants: Vec<RawConstant>,
    pub functions: Vec<RawFunction>,
    pub structures: Vec<RawStructure>,
}

impl RawFileIndex {
    /// Index of the namespace block covering a source line. Falls back
    /// to the first block for anything outside every range.
    pub fn namespace_index_for_line(&self, line: u32) -> usize {
        self.namespaces
            .iter()
            .rposition(|ns| ns.start_line <= line && line <= ns.end_line)
            .unwrap_or(0)
    }
}

/// Walk the tree and collect raw declarations. The namespace pass runs
/// first so every later pass can be attributed to its covering block.
pub fn extract(tree: &Tree, source: &str) -> Result<RawFileIndex, String> {
    let root = tree.root_node();
    let mut index = RawFileIndex {
        namespaces: collect_namespaces(root, source),
        ..Default::default()
    };

    walk(root, source, &mut index)?;
    Ok(index)
}

fn collect_namespaces(root: Node, source: &str) -> Vec<RawNamespace> {
    let total_lines = source.lines().count().max(1) as u32;

    let mut definitions = Vec::new();
    collect_namespace_nodes(root, &mut definitions);

    if definitions.is_empty() {
        return vec![RawNamespace {
            name: None,
            start_line: 1,
            end_line: total_lines,
            imports: Vec::new(),
        }];
    }

    let starts: Vec<u32> = definitions.iter().map(|n| line_of(*n)).collect();
    definitions
        .iter()
        .enumerate()
        .map(|(i, node)| {
            let name = node
                .child_by_field_name("name")
                .map(|n| text_of(n, source).to_string());
            // A braced namespace ends with its block; an unbraced one
            // extends to the next namespace statement or the file end.
            let braced = node
                .named_children(&mut node.walk())
                .any(|child| child.kind() == "compound_statement");
            let end_line = if braced {
                node.end_position().row as u32 + 1
            } else {
                starts
                    .get(i + 1)
                    .map(|next| next.saturating_sub(1))
                    .unwrap_or(total_lines)
            };
            RawNamespace {
                name,
                start_line: line_of(*node),
                end_line,
                imports: Vec::new(),
            }
        })
        .collect()
}

fn collect_namespace_nodes<'tree>(node: Node<'tree>, out: &mut Vec<Node<'tree>>) {
    let mut cursor = node.walk();
    for child in node.named_children(&mut cursor) {
        if child.kind() == "namespace_definition" {
            out.push(child);
        }
        // Namespaces only nest one level (program > braced namespace),
        // but walking everything costs nothing and is shape-proof.
        collect_namespace_nodes(child, out);
    }
}

fn walk(node: Node, source: &str, index: &mut RawFileIndex) -> Result<(), String> {
    match node.kind() {
        "namespace_use_declaration" => {
            let line = line_of(node);
            let slot = index.namespace_index_for_line(line);
            let mut imports = Vec::new();
            extract_use_declaration(node, source, &mut imports);
            index.namespaces[slot].imports.extend(imports);
        }
        "function_definition" => {
            let function = extract_function(node, source)?;
            index.functions.push(function);
        }
        "const_declaration" => {
            // Class constants live inside a declaration_list and are
            // handled by the structure pass.
            if node.parent().map(|p| p.kind()) != Some("declaration_list") {
                extract_global_constants(node, source, &mut index.constants);
            }
        }
        "function_call_expression" => {
            if let Some(constant) = extract_define_call(node, source) {
                index.constants.push(constant);
            }
        }
        "class_declaration" => {
            let structure = extract_structure(node, source, StructureKind::Class)?;
            index.structures.push(structure);
        }
        "interface_declaration" => {
            let structure = extract_structure(node, source, StructureKind::Interface)?;
            index.structures.push(structure);
        }
        "trait_declaration" => {
            let structure = extract_structure(node, source, StructureKind::Trait)?;
            index.structures.push(structure);
        }
        _ => {
            if let Some(structure) = extract_anonymous_class(node, source)? {
                index.structures.push(structure);
            }
        }
    }

    let mut cursor = node.walk();
    for child in node.named_children(&mut cursor) {
        walk(child, source, index)?;
    }
    Ok(())
}

fn extract_use_declaration(node: Node, source: &str, imports: &mut Vec<RawImport>) {
    let line = line_of(node);

    // A leading `function` / `const` token sets the kind for the whole
    // statement; group-use clauses may override it per entry.
    let mut statement_kind = ImportKind::Type;
    let mut prefix: Option<String> = None;

    let mut cursor = node.walk();
    for child in node.children(&mut cursor) {
        match child.kind() {
            "function" => statement_kind = ImportKind::Function,
            "const" => statement_kind = ImportKind::Constant,
            "namespace_use_clause" => {
                if let Some(import) = extract_use_clause(child, source, statement_kind, None, line)
                {
                    imports.push(import);
                }
            }
            "namespace_name" | "name" | "qualified_name" => {
                // The shared prefix of a group use: `use App\{...};`
                prefix = Some(text_of(child, source).to_string());
            }
            "namespace_use_group" => {
                let mut group_cursor = child.walk();
                for clause in child.named_children(&mut group_cursor) {
                    if let Some(import) = extract_use_clause(
                        clause,
                        source,
                        statement_kind,
                        prefix.as_deref(),
                        line,
                    ) {
                        imports.push(import);
                    }
                }
            }
            _ => {}
        }
    }
}

fn extract_use_clause(
    node: Node,
    source: &str,
    statement_kind: ImportKind,
    prefix: Option<&str>,
    line: u32,
) -> Option<RawImport> {
    let mut kind = statement_kind;
    let mut name: Option<String> = None;
    let mut alias: Option<String> = None;

    let mut cursor = node.walk();
    for child in node.children(&mut cursor) {
        match child.kind() {
            "function" => kind = ImportKind::Function,
            "const" => kind = ImportKind::Constant,
            "name" | "qualified_name" | "namespace_name" => {
                if name.is_none() {
                    name = Some(text_of(child, source).to_string());
                }
            }
            "namespace_aliasing_clause" => {
                alias = child
                    .named_children(&mut child.walk())
                    .next()
                    .map(|n| text_of(n, source).to_string());
            }
            _ => {}
        }
    }

    let mut name = name?;
    if let Some(prefix) = prefix {
        name = format!("{}\\{}", prefix.trim_end_matches('\\'), name);
    }
    let name = format!("\\{}", name.trim_start_matches('\\'));
    let alias = alias.unwrap_or_else(|| {
        name.rsplit('\\').next().unwrap_or(&name).to_string()
    });

    Some(RawImport {
        alias,
        name,
        kind,
        line,
    })
}

fn extract_global_constants(node: Node, source: &str, constants: &mut Vec<RawConstant>) {
    let docblock = docblock_of(node, source);
    let mut cursor = node.walk();
    for element in node.named_children(&mut cursor) {
        if element.kind() != "const_element" {
            continue;
        }
        let Some(name_node) = element.named_child(0) else {
            continue;
        };
        let value = element
            .named_child(element.named_child_count() - 1)
            .filter(|n| n.id() != name_node.id())
            .map(|n| text_of(n, source).to_string());
        constants.push(RawConstant {
            name: text_of(name_node, source).to_string(),
            line: line_of(element),
            default_value: value,
            docblock: docblock.clone(),
            is_define: false,
        });
    }
}

fn extract_define_call(node: Node, source: &str) -> Option<RawConstant> {
    let function = node.child_by_field_name("function")?;
    if text_of(function, source) != "define" {
        return None;
    }

    let arguments = node.child_by_field_name("arguments")?;
    let mut args = Vec::new();
    let mut cursor = arguments.walk();
    for argument in arguments.named_children(&mut cursor) {
        if argument.kind() == "argument" {
            args.push(argument.named_child(0).unwrap_or(argument));
        }
    }

    let name_node = args.first()?;
    if name_node.kind() != "string" && name_node.kind() != "encapsed_string" {
        // Only string-literal names are indexable.
        return None;
    }
    let name = text_of(*name_node, source)
        .trim_matches(|c| c == '\'' || c == '"')
        .to_string();
    if name.is_empty() {
        return None;
    }

    Some(RawConstant {
        name,
        line: line_of(node),
        default_value: args.get(1).map(|n| text_of(*n, source).to_string()),
        docblock: docblock_of(node, source),
        is_define: true,
    })
}

fn extract_function(node: Node, source: &str) -> Result<RawFunction, String> {
    let name = node
        .child_by_field_name("name")
        .map(|n| text_of(n, source).to_string())
        .ok_or_else(|| format!("function without a name at line {}", line_of(node)))?;

    Ok(RawFunction {
        name,
        start_line: line_of(node),
        end_line: node.end_position().row as u32 + 1,
        parameters: extract_parameters(node, source),
        return_hint: node
            .child_by_field_name("return_type")
            .and_then(|n| parse_type_hint(n, source)),
        docblock: docblock_of(node, source),
    })
}

fn extract_parameters(function: Node, source: &str) -> Vec<RawParameter> {
    let Some(list) = function.child_by_field_name("parameters") else {
        return Vec::new();
    };

    let mut parameters = Vec::new();
    let mut cursor = list.walk();
    for parameter in list.named_children(&mut cursor) {
        match parameter.kind() {
            "simple_parameter" | "variadic_parameter" | "property_promotion_parameter" => {
                let Some(name_node) = parameter.child_by_field_name("name") else {
                    continue;
                };
                parameters.push(RawParameter {
                    name: text_of(name_node, source)
                        .trim_start_matches('$')
                        .to_string(),
                    hint: parameter
                        .child_by_field_name("type")
                        .and_then(|n| parse_type_hint(n, source)),
                    default_value: parameter
                        .child_by_field_name("default_value")
                        .map(|n| text_of(n, source).to_string()),
                    is_reference: has_child_kind(parameter, "reference_modifier"),
                    is_variadic: parameter.kind() == "variadic_parameter"
                        || has_token(parameter, source, "..."),
                });
            }
            _ => {}
        }
    }
    parameters
}

fn extract_structure(node: Node, source: &str, kind: StructureKind) -> Result<RawStructure, String> {
    let name = node
        .child_by_field_name("name")
        .map(|n| text_of(n, source).to_string());
    if name.is_none() {
        return Err(format!("{} without a name at line {}", kind.as_str(), line_of(node)));
    }

    let mut structure = RawStructure {
        name,
        kind,
        start_line: line_of(node),
        end_line: node.end_position().row as u32 + 1,
        is_abstract: has_child_kind(node, "abstract_modifier"),
        is_final: has_child_kind(node, "final_modifier"),
        extends: Vec::new(),
        implements: Vec::new(),
        docblock: docblock_of(node, source),
        constants: Vec::new(),
        properties: Vec::new(),
        methods: Vec::new(),
        trait_uses: Vec::new(),
    };

    collect_heritage(node, source, &mut structure);

    if let Some(body) = node.child_by_field_name("body") {
        extract_members(body, source, &mut structure)?;
    }

    Ok(structure)
}

fn extract_anonymous_class(node: Node, source: &str) -> Result<Option<RawStructure>, String> {
    // `new class { ... }`: either a dedicated node kind or an object
    // creation carrying a declaration list, depending on grammar
    // version.
    let is_anonymous = node.kind() == "anonymous_class"
        || (node.kind() == "object_creation_expression" && has_child_kind(node, "declaration_list"));
    if !is_anonymous {
        return Ok(None);
    }

    let mut structure = RawStructure {
        name: None,
        kind: StructureKind::Class,
        start_line: line_of(node),
        end_line: node.end_position().row as u32 + 1,
        is_abstract: false,
        is_final: false,
        extends: Vec::new(),
        implements: Vec::new(),
        docblock: docblock_of(node, source),
        constants: Vec::new(),
        properties: Vec::new(),
        methods: Vec::new(),
        trait_uses: Vec::new(),
    };

    collect_heritage(node, source, &mut structure);

    let mut cursor = node.walk();
    for child in node.named_children(&mut cursor) {
        if child.kind() == "declaration_list" {
            extract_members(child, source, &mut structure)?;
        }
    }

    Ok(Some(structure))
}

fn collect_heritage(node: Node, source: &str, structure: &mut RawStructure) {
    let mut cursor = node.walk();
    for child in node.named_children(&mut cursor) {
        match child.kind() {
            "base_clause" => {
                collect_names(child, source, &mut structure.extends);
            }
            "class_interface_clause" => {
                collect_names(child, source, &mut structure.implements);
            }
            _ => {}
        }
    }
}

fn collect_names(node: Node, source: &str, out: &mut Vec<String>) {
    let mut cursor = node.walk();
    for child in node.named_children(&mut cursor) {
        if matches!(child.kind(), "name" | "qualified_name") {
            out.push(text_of(child, source).to_string());
        }
    }
}

fn extract_members(body: Node, source: &str, structure: &mut RawStructure) -> Result<(), String> {
    let mut cursor = body.walk();
    for member in body.named_children(&mut cursor) {
        match member.kind() {
            "const_declaration" => {
                extract_class_constants(member, source, &mut structure.constants);
            }
            "property_declaration" => {
                extract_properties(member, source, &mut structure.properties);
            }
            "method_declaration" => {
                let method = extract_method(member, source)?;
                collect_promoted_properties(member, source, &mut structure.properties);
                structure.methods.push(method);
            }
            "use_declaration" => {
                structure.trait_uses.push(extract_trait_use(member, source));
            }
            _ => {}
        }
    }
    Ok(())
}

fn extract_class_constants(node: Node, source: &str, constants: &mut Vec<RawClassConstant>) {
    let docblock = docblock_of(node, source);
    let visibility = visibility_of(node, source);
    let mut cursor = node.walk();
    for element in node.named_children(&mut cursor) {
        if element.kind() != "const_element" {
            continue;
        }
        let Some(name_node) = element.named_child(0) else {
            continue;
        };
        let value = element
            .named_child(element.named_child_count() - 1)
            .filter(|n| n.id() != name_node.id())
            .map(|n| text_of(n, source).to_string());
        constants.push(RawClassConstant {
            name: text_of(name_node, source).to_string(),
            line: line_of(element),
            default_value: value,
            visibility,
            docblock: docblock.clone(),
        });
    }
}

fn extract_properties(node: Node, source: &str, properties: &mut Vec<RawProperty>) {
    let docblock = docblock_of(node, source);
    let visibility = visibility_of(node, source);
    let is_static = has_child_kind(node, "static_modifier");
    let hint = node
        .child_by_field_name("type")
        .and_then(|n| parse_type_hint(n, source));

    let mut cursor = node.walk();
    for element in node.named_children(&mut cursor) {
        if element.kind() != "property_element" {
            continue;
        }
        let Some(name_node) = element.named_child(0) else {
            continue;
        };
        let default_value = element
            .named_child(element.named_child_count() - 1)
            .filter(|n| n.id() != name_node.id())
            .map(|n| {
                // The initializer node is `= expr`; keep just the value.
                text_of(n, source).trim_start_matches('=').trim().to_string()
            });
        properties.push(RawProperty {
            name: text_of(name_node, source)
                .trim_start_matches('$')
                .to_string(),
            line: line_of(element),
            hint: hint.clone(),
            default_value,
            visibility,
            is_static,
            docblock: docblock.clone(),
        });
    }
}

fn extract_method(node: Node, source: &str) -> Result<RawMethod, String> {
    let name = node
        .child_by_field_name("name")
        .map(|n| text_of(n, source).to_string())
        .ok_or_else(|| format!("method without a name at line {}", line_of(node)))?;

    Ok(RawMethod {
        function: RawFunction {
            name,
            start_line: line_of(node),
            end_line: node.end_position().row as u32 + 1,
            parameters: extract_parameters(node, source),
            return_hint: node
                .child_by_field_name("return_type")
                .and_then(|n| parse_type_hint(n, source)),
            docblock: docblock_of(node, source),
        },
        visibility: visibility_of(node, source),
        is_static: has_child_kind(node, "static_modifier"),
        is_abstract: has_child_kind(node, "abstract_modifier"),
        is_final: has_child_kind(node, "final_modifier"),
    })
}

/// Constructor property promotion declares a property through a
/// parameter's visibility modifier.
fn collect_promoted_properties(method: Node, source: &str, properties: &mut Vec<RawProperty>) {
    let Some(list) = method.child_by_field_name("parameters") else {
        return;
    };
    let mut cursor = list.walk();
    for parameter in list.named_children(&mut cursor) {
        if parameter.kind() != "property_promotion_parameter" {
            continue;
        }
        let Some(name_node) = parameter.child_by_field_name("name") else {
            continue;
        };
        properties.push(RawProperty {
            name: text_of(name_node, source)
                .trim_start_matches('$')
                .to_string(),
            line: line_of(parameter),
            hint: parameter
                .child_by_field_name("type")
                .and_then(|n| parse_type_hint(n, source)),
            default_value: parameter
                .child_by_field_name("default_value")
                .map(|n| text_of(n, source).to_string()),
            visibility: visibility_of(parameter, source),
            is_static: false,
            docblock: None,
        });
    }
}

fn extract_trait_use(node: Node, source: &str) -> RawTraitUse {
    let mut trait_use = RawTraitUse::default();

    let mut cursor = node.walk();
    for child in node.children(&mut cursor) {
        match child.kind() {
            "name" | "qualified_name" => {
                trait_use.traits.push(text_of(child, source).to_string());
            }
            "use_list" => {
                let mut list_cursor = child.walk();
                for clause in child.named_children(&mut list_cursor) {
                    let text = text_of(clause, source);
                    if let Some(captures) = TRAIT_INSTEADOF.captures(text) {
                        trait_use.precedences.push(RawTraitPrecedence {
                            trait_name: captures[1].to_string(),
                            method: captures[2].to_string(),
                        });
                    } else if let Some(captures) = TRAIT_AS.captures(text) {
                        trait_use.aliases.push(RawTraitAlias {
                            trait_name: captures.get(1).map(|m| m.as_str().to_string()),
                            method: captures[2].to_string(),
                            alias: captures.get(4).map(|m| m.as_str().to_string()),
                            visibility: captures
                                .get(3)
                                .and_then(|m| AccessModifier::from_str(m.as_str()).ok()),
                        });
                    }
                }
            }
            _ => {}
        }
    }

    trait_use
}

/// Split a written type into a hint, peeling a leading `?`.
fn parse_type_hint(node: Node, source: &str) -> Option<RawTypeHint> {
    let text = text_of(node, source).trim().to_string();
    if text.is_empty() {
        return None;
    }
    // The return_type field wraps the actual type after the colon in
    // some grammar versions; the written text is authoritative either
    // way.
    let text = text.trim_start_matches(':').trim().to_string();
    if let Some(stripped) = text.strip_prefix('?') {
        Some(RawTypeHint {
            expr: stripped.to_string(),
            nullable: true,
        })
    } else {
        Some(RawTypeHint {
            expr: text,
            nullable: false,
        })
    }
}

fn visibility_of(node: Node, source: &str) -> Option<AccessModifier> {
    let mut cursor = node.walk();
    for child in node.children(&mut cursor) {
        if child.kind() == "visibility_modifier" {
            return AccessModifier::from_str(text_of(child, source)).ok();
        }
    }
    None
}

fn has_child_kind(node: Node, kind: &str) -> bool {
    let mut cursor = node.walk();
    let found = node.children(&mut cursor).any(|child| child.kind() == kind);
    found
}

fn has_token(node: Node, source: &str, token: &str) -> bool {
    let mut cursor = node.walk();
    let found = node
        .children(&mut cursor)
        .any(|child| text_of(child, source) == token);
    found
}

/// The docblock immediately preceding a declaration, if any.
fn docblock_of(node: Node, source: &str) -> Option<Docblock> {
    let previous = node.prev_named_sibling()?;
    if previous.kind() != "comment" {
        return None;
    }
    Docblock::parse(text_of(previous, source))
}

fn text_of<'a>(node: Node, source: &'a str) -> &'a str {
    node.utf8_text(source.as_bytes()).unwrap_or("")
}

fn line_of(node: Node) -> u32 {
    node.start_position().row as u32 + 1
}

#[cfg(test)]
mod tests {
    use super::*;

    fn extract_source(source: &str) -> RawFileIndex {
        let tree = parse_source(source).unwrap();
        assert!(!tree.root_node().has_error(), "fixture source must parse");
        extract(&tree, source).unwrap()
    }

    #[test]
    fn test_namespaces_and_imports() {
        let index = extract_source(
            "<?php\nnamespace App;\nuse Vendor\\Mailer as Mail;\nuse function Vendor\\helper;\nclass A {}\n",
        );

        assert_eq!(index.namespaces.len(), 1);
        let ns = &index.namespaces[0];
        assert_eq!(ns.name.as_deref(), Some("App"));
        assert_eq!(ns.imports.len(), 2);
        assert_eq!(ns.imports[0].alias, "Mail");
        assert_eq!(ns.imports[0].name, "\\Vendor\\Mailer");
        assert_eq!(ns.imports[0].kind, ImportKind::Type);
        assert_eq!(ns.imports[1].alias, "helper");
        assert_eq!(ns.imports[1].kind, ImportKind::Function);
    }

    #[test]
    fn test_file_without_namespace_gets_global_block() {
        let index = extract_source("<?php\nclass A {}\n");
        assert_eq!(index.namespaces.len(), 1);
        assert!(index.namespaces[0].name.is_none());
    }

    #[test]
    fn test_class_with_members() {
        let index = extract_source(
            "<?php\nclass Order {\n    const STATUS_OPEN = 'open';\n    private int $total = 0;\n    public static function create(): self { return new self(); }\n}\n",
        );

        assert_eq!(index.structures.len(), 1);
        let class = &index.structures[0];
        assert_eq!(class.name.as_deref(), Some("Order"));
        assert_eq!(class.kind, StructureKind::Class);

        assert_eq!(class.constants.len(), 1);
        assert_eq!(class.constants[0].name, "STATUS_OPEN");
        assert_eq!(class.constants[0].default_value.as_deref(), Some("'open'"));

        assert_eq!(class.properties.len(), 1);
        assert_eq!(class.properties[0].name, "total");
        assert_eq!(
            class.properties[0].hint,
            Some(RawTypeHint {
                expr: "int".to_string(),
                nullable: false
            })
        );
        assert_eq!(class.properties[0].default_value.as_deref(), Some("0"));
        assert_eq!(
            class.properties[0].visibility,
            Some(AccessModifier::Private)
        );

        assert_eq!(class.methods.len(), 1);
        let method = &class.methods[0];
        assert_eq!(method.function.name, "create");
        assert!(method.is_static);
        assert_eq!(method.visibility, Some(AccessModifier::Public));
        assert_eq!(
            method.function.return_hint.as_ref().map(|h| h.expr.as_str()),
            Some("self")
        );
    }

    #[test]
    fn test_heritage_clauses() {
        let index = extract_source(
            "<?php\ninterface Countable2 extends \\Countable {}\nabstract class Repo extends Base implements \\JsonSerializable, Countable2 {}\n",
        );

        let interface = &index.structures[0];
        assert_eq!(interface.kind, StructureKind::Interface);
        assert_eq!(interface.extends, vec!["\\Countable".to_string()]);

        let class = &index.structures[1];
        assert!(class.is_abstract);
        assert_eq!(class.extends, vec!["Base".to_string()]);
        assert_eq!(
            class.implements,
            vec!["\\JsonSerializable".to_string(), "Countable2".to_string()]
        );
    }

    #[test]
    fn test_free_function_with_parameters() {
        let index = extract_source(
            "<?php\nfunction clamp(int $value, ?int $max = null, int ...$rest): int { return $value; }\n",
        );

        assert_eq!(index.functions.len(), 1);
        let function = &index.functions[0];
        assert_eq!(function.name, "clamp");
        assert_eq!(function.parameters.len(), 3);
        assert_eq!(function.parameters[0].name, "value");
        assert!(!function.parameters[0].hint.as_ref().unwrap().nullable);
        assert_eq!(function.parameters[1].name, "max");
        assert!(function.parameters[1].hint.as_ref().unwrap().nullable);
        assert_eq!(function.parameters[1].default_value.as_deref(), Some("null"));
        assert!(function.parameters[2].is_variadic);
    }

    #[test]
    fn test_global_constants_and_define() {
        let index = extract_source(
            "<?php\nconst VERSION = '1.2.0';\ndefine('BUILD_DATE', '2024-01-01');\ndefine($dynamic, 1);\n",
        );

        assert_eq!(index.constants.len(), 2);
        assert_eq!(index.constants[0].name, "VERSION");
        assert!(!index.constants[0].is_define);
        assert_eq!(index.constants[1].name, "BUILD_DATE");
        assert!(index.constants[1].is_define);
    }

    #[test]
    fn test_trait_use_with_alias_and_precedence() {
        let index = extract_source(
            "<?php\nclass Worker {\n    use Loggable, Retryable {\n        Loggable::log as protected writeLog;\n        Loggable::retry insteadof Retryable;\n    }\n}\n",
        );

        let class = &index.structures[0];
        assert_eq!(class.trait_uses.len(), 1);
        let trait_use = &class.trait_uses[0];
        assert_eq!(
            trait_use.traits,
            vec!["Loggable".to_string(), "Retryable".to_string()]
        );

        assert_eq!(trait_use.aliases.len(), 1);
        let alias = &trait_use.aliases[0];
        assert_eq!(alias.trait_name.as_deref(), Some("Loggable"));
        assert_eq!(alias.method, "log");
        assert_eq!(alias.alias.as_deref(), Some("writeLog"));
        assert_eq!(alias.visibility, Some(AccessModifier::Protected));

        assert_eq!(trait_use.precedences.len(), 1);
        assert_eq!(trait_use.precedences[0].trait_name, "Loggable");
        assert_eq!(trait_use.precedences[0].method, "retry");
    }

    #[test]
    fn test_docblock_attached_to_declaration() {
        let index = extract_source(
            "<?php\n/**\n * Repository base.\n * @deprecated\n */\nclass Legacy {}\n",
        );

        let class = &index.structures[0];
        let docblock = class.docblock.as_ref().unwrap();
        assert_eq!(docblock.summary.as_deref(), Some("Repository base."));
        assert!(docblock.is_deprecated);
    }

    #[test]
    fn test_parse_error_is_detected() {
        let tree = parse_source("<?php class {{{{").unwrap();
        assert!(tree.root_node().has_error());
    }
}
