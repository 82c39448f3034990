// Path/URI normalization
//
// Every component keys files by the canonical form produced here, so
// the same file never appears under two identities (slash direction,
// `file://` scheme, home shorthand, redundant components).

use std::path::{Component, Path, PathBuf};

/// Canonicalize a raw URI or path string.
pub fn normalize_uri(raw: &str) -> String {
    let stripped = raw.strip_prefix("file://").unwrap_or(raw);
    let forward = stripped.replace('\\', "/");

    let expanded = if let Some(rest) = forward.strip_prefix("~/") {
        match dirs::home_dir() {
            Some(home) => format!("{}/{}", home.to_string_lossy(), rest),
            None => forward.clone(),
        }
    } else {
        forward
    };

    normalize_path(Path::new(&expanded))
}

/// Canonicalize a filesystem path without touching the filesystem:
/// `.` components drop, `..` pops lexically.
pub fn normalize_path(path: &Path) -> String {
    let mut parts: Vec<String> = Vec::new();
    let mut prefix = String::new();

    for component in path.components() {
        match component {
            Component::Prefix(p) => {
                prefix = p.as_os_str().to_string_lossy().replace('\\', "/");
            }
            Component::RootDir => {}
            Component::CurDir => {}
            Component::ParentDir => {
                if parts.pop().is_none() {
                    parts.push("..".to_string());
                }
            }
            Component::Normal(part) => {
                parts.push(part.to_string_lossy().into_owned());
            }
        }
    }

    let root = if path.has_root() || !prefix.is_empty() {
        "/"
    } else {
        ""
    };
    format!("{}{}{}", prefix, root, parts.join("/"))
}

/// The filesystem path behind a normalized URI.
pub fn uri_to_path(uri: &str) -> PathBuf {
    PathBuf::from(uri)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_scheme_stripped() {
        assert_eq!(normalize_uri("file:///src/App/A.php"), "/src/App/A.php");
    }

    #[test]
    fn test_backslashes_become_forward_slashes() {
        assert_eq!(normalize_uri("/src\\App\\A.php"), "/src/App/A.php");
    }

    #[test]
    fn test_redundant_components_collapse() {
        assert_eq!(normalize_uri("/src/./App/../A.php"), "/src/A.php");
        assert_eq!(normalize_uri("/src//App/A.php"), "/src/App/A.php");
    }

    #[test]
    fn test_home_shorthand_expands() {
        if let Some(home) = dirs::home_dir() {
            let normalized = normalize_uri("~/project/A.php");
            assert!(normalized.starts_with(&normalize_path(&home)));
            assert!(normalized.ends_with("project/A.php"));
        }
    }

    #[test]
    fn test_same_file_same_identity() {
        let a = normalize_uri("file:///src/App/A.php");
        let b = normalize_uri("/src/App/./A.php");
        let c = normalize_uri("/src\\App\\A.php");
        assert_eq!(a, b);
        assert_eq!(b, c);
    }
}
