// Minimal docblock tag scanner
//
// Only the tags the indexing passes need are recognized: summary and
// description text, type annotations, deprecation, throws, and the
// magic-member conventions. Anything else in a docblock is ignored.

use std::collections::HashMap;

use once_cell::sync::Lazy;
use regex::Regex;

static TAG_VAR: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"@var\s+(\??[\w\\\|\[\]]+)").unwrap());
static TAG_PARAM: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"@param\s+(\??[\w\\\|\[\]]+)\s+\$(\w+)").unwrap());
static TAG_RETURN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"@return\s+(\??[\w\\\|\[\]]+)").unwrap());
static TAG_THROWS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"@throws\s+([\w\\]+)").unwrap());
static TAG_METHOD: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"@method\s+(static\s+)?(?:(\??[\w\\\|\[\]]+)\s+)?(\w+)\(([^)]*)\)").unwrap()
});
static TAG_PROPERTY: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"@property(-read|-write)?\s+(\??[\w\\\|\[\]]+)\s+\$(\w+)").unwrap()
});
static MAGIC_PARAM: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?:(\??[\w\\\|\[\]]+)\s+)?\$(\w+)").unwrap());

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MagicParameter {
    pub name: String,
    pub type_expr: Option<String>,
}

/// A method documented via `@method`, not physically declared.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MagicMethod {
    pub name: String,
    pub is_static: bool,
    pub return_type: Option<String>,
    pub parameters: Vec<MagicParameter>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MagicPropertyAccess {
    ReadWrite,
    Read,
    Write,
}

/// A property documented via `@property` / `@property-read` /
/// `@property-write`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MagicProperty {
    pub name: String,
    pub type_expr: Option<String>,
    pub access: MagicPropertyAccess,
}

/// Parsed docblock content relevant to indexing.
#[derive(Debug, Clone, Default)]
pub struct Docblock {
    pub summary: Option<String>,
    pub description: Option<String>,
    pub is_deprecated: bool,
    pub var_type: Option<String>,
    pub param_types: HashMap<String, String>,
    pub return_type: Option<String>,
    pub throws: Vec<String>,
    pub magic_methods: Vec<MagicMethod>,
    pub magic_properties: Vec<MagicProperty>,
}

impl Docblock {
    /// Parse a raw `/** ... */` comment. Returns None when the comment is
    /// not a docblock.
    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        if !raw.starts_with("/**") {
            return None;
        }

        let body = raw
            .trim_start_matches("/**")
            .trim_end_matches("*/")
            .lines()
            .map(|line| line.trim().trim_start_matches('*').trim())
            .collect::<Vec<_>>();

        let mut docblock = Docblock::default();
        let mut free_text: Vec<&str> = Vec::new();

        for line in &body {
            if line.starts_with('@') {
                docblock.scan_tag_line(line);
            } else if !line.is_empty() || !free_text.is_empty() {
                free_text.push(line);
            }
        }

        // First paragraph is the summary, the rest the long description.
        let mut paragraphs = free_text
            .split(|line| line.is_empty())
            .map(|lines| lines.join(" ").trim().to_string())
            .filter(|p| !p.is_empty());
        docblock.summary = paragraphs.next();
        let rest: Vec<String> = paragraphs.collect();
        if !rest.is_empty() {
            docblock.description = Some(rest.join("\n\n"));
        }

        Some(docblock)
    }

    fn scan_tag_line(&mut self, line: &str) {
        if line.starts_with("@deprecated") {
            self.is_deprecated = true;
        } else if let Some(captures) = TAG_VAR.captures(line) {
            self.var_type = Some(captures[1].to_string());
        } else if let Some(captures) = TAG_PARAM.captures(line) {
            self.param_types
                .insert(captures[2].to_string(), captures[1].to_string());
        } else if let Some(captures) = TAG_RETURN.captures(line) {
            self.return_type = Some(captures[1].to_string());
        } else if let Some(captures) = TAG_THROWS.captures(line) {
            self.throws.push(captures[1].to_string());
        } else if let Some(captures) = TAG_METHOD.captures(line) {
            self.magic_methods.push(MagicMethod {
                name: captures[3].to_string(),
                is_static: captures.get(1).is_some(),
                return_type: captures.get(2).map(|m| m.as_str().to_string()),
                parameters: parse_magic_parameters(&captures[4]),
            });
        } else if let Some(captures) = TAG_PROPERTY.captures(line) {
            self.magic_properties.push(MagicProperty {
                name: captures[3].to_string(),
                type_expr: Some(captures[2].to_string()),
                access: match captures.get(1).map(|m| m.as_str()) {
                    Some("-read") => MagicPropertyAccess::Read,
                    Some("-write") => MagicPropertyAccess::Write,
                    _ => MagicPropertyAccess::ReadWrite,
                },
            });
        }
    }
}

fn parse_magic_parameters(list: &str) -> Vec<MagicParameter> {
    list.split(',')
        .filter_map(|part| {
            let captures = MAGIC_PARAM.captures(part.trim())?;
            Some(MagicParameter {
                name: captures[2].to_string(),
                type_expr: captures.get(1).map(|m| m.as_str().to_string()),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_summary_and_description() {
        let docblock = Docblock::parse(
            "/**\n * Sends the welcome mail.\n *\n * Uses the configured transport and\n * retries once on failure.\n */",
        )
        .unwrap();

        assert_eq!(docblock.summary.as_deref(), Some("Sends the welcome mail."));
        assert_eq!(
            docblock.description.as_deref(),
            Some("Uses the configured transport and retries once on failure.")
        );
    }

    #[test]
    fn test_non_docblock_comment_rejected() {
        assert!(Docblock::parse("// line comment").is_none());
        assert!(Docblock::parse("/* plain block */").is_none());
    }

    #[test]
    fn test_type_tags() {
        let docblock = Docblock::parse(
            "/**\n * @param string|null $name\n * @param int $count\n * @return \\App\\User\n * @throws \\RuntimeException\n */",
        )
        .unwrap();

        assert_eq!(docblock.param_types["name"], "string|null");
        assert_eq!(docblock.param_types["count"], "int");
        assert_eq!(docblock.return_type.as_deref(), Some("\\App\\User"));
        assert_eq!(docblock.throws, vec!["\\RuntimeException".to_string()]);
    }

    #[test]
    fn test_var_and_deprecated() {
        let docblock = Docblock::parse("/** @var ?int @deprecated */").unwrap();
        // Same-line tags are unusual but occur in the wild.
        assert_eq!(docblock.var_type.as_deref(), Some("?int"));

        let docblock = Docblock::parse("/**\n * @deprecated since 2.0\n */").unwrap();
        assert!(docblock.is_deprecated);
    }

    #[test]
    fn test_magic_method_tag() {
        let docblock = Docblock::parse(
            "/**\n * @method static \\App\\Query where(string $column, $value)\n * @method void flush()\n */",
        )
        .unwrap();

        assert_eq!(docblock.magic_methods.len(), 2);
        let where_method = &docblock.magic_methods[0];
        assert_eq!(where_method.name, "where");
        assert!(where_method.is_static);
        assert_eq!(where_method.return_type.as_deref(), Some("\\App\\Query"));
        assert_eq!(where_method.parameters.len(), 2);
        assert_eq!(where_method.parameters[0].name, "column");
        assert_eq!(
            where_method.parameters[0].type_expr.as_deref(),
            Some("string")
        );
        assert_eq!(where_method.parameters[1].type_expr, None);

        assert_eq!(docblock.magic_methods[1].name, "flush");
        assert!(!docblock.magic_methods[1].is_static);
    }

    #[test]
    fn test_magic_property_tags() {
        let docblock = Docblock::parse(
            "/**\n * @property string $title\n * @property-read int $id\n * @property-write array $options\n */",
        )
        .unwrap();

        assert_eq!(docblock.magic_properties.len(), 3);
        assert_eq!(docblock.magic_properties[0].access, MagicPropertyAccess::ReadWrite);
        assert_eq!(docblock.magic_properties[1].access, MagicPropertyAccess::Read);
        assert_eq!(docblock.magic_properties[1].name, "id");
        assert_eq!(docblock.magic_properties[2].access, MagicPropertyAccess::Write);
    }
}
