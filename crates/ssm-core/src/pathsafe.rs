//! Path safety and branch-link naming.
//!
//! Validates absolute paths, escapes reserved segments (`.`, `..`), produces
//! filesystem-safe branch-link names, and compares paths the way the host OS
//! would (collapsing separators, ignoring a trailing separator).

use std::path::{Path, PathBuf};

/// A path-level problem that must be rejected before it reaches the
/// filesystem.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum PathSafetyError {
    #[error("path is not absolute: {0}")]
    NotAbsolute(String),
    #[error("path segment is empty after escaping: {0}")]
    EmptySegment(String),
}

pub type Result<T> = std::result::Result<T, PathSafetyError>;

/// Reject anything that is not an absolute path.
///
/// Every root path in this system (`sources`, `override`, `merged`,
/// `state`) is configured as an absolute path; a relative path is always a
/// configuration mistake, never a valid input.
pub fn require_absolute(path: &Path) -> Result<()> {
    if path.is_absolute() {
        Ok(())
    } else {
        Err(PathSafetyError::NotAbsolute(path.display().to_string()))
    }
}

/// Escape a single path segment that would otherwise collide with a
/// reserved directory entry (`.`, `..`) or be empty.
///
/// Titles and directory names are used verbatim as path segments
/// elsewhere; this only guards the small set of reserved names that would
/// otherwise change the meaning of a path (`.` stays in place, `..` walks
/// up). Everything else passes through unchanged since `/` cannot occur
/// within a single segment.
pub fn escape_reserved_segment(segment: &str) -> String {
    match segment {
        "" => "_empty_".to_string(),
        "." => "_dot_".to_string(),
        ".." => "_dotdot_".to_string(),
        other => other.to_string(),
    }
}

/// Join a root with a single escaped segment, guaranteeing the result
/// cannot escape `root` via `.`/`..` tricks.
pub fn join_escaped(root: &Path, segment: &str) -> PathBuf {
    root.join(escape_reserved_segment(segment))
}

/// Produce a filesystem-safe branch-link name.
///
/// Branch link names are pure ASCII alphanumerics, `_` and `-`; any other
/// byte is replaced with `_`. This keeps branch specification strings
/// (colon- and equals-joined, per the Branch Planner) free of characters
/// that would need escaping.
pub fn sanitize_link_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for ch in name.chars() {
        if ch.is_ascii_alphanumeric() || ch == '_' || ch == '-' {
            out.push(ch);
        } else {
            out.push('_');
        }
    }
    if out.is_empty() {
        out.push('_');
    }
    out
}

/// Normalize a path for OS-aware equality comparison: collapse
/// back-slashes to forward-slashes and drop a trailing separator (except
/// for the root itself).
pub fn normalize_for_compare(path: &str) -> String {
    let forward = path.replace('\\', "/");
    if forward.len() > 1 && forward.ends_with('/') {
        forward.trim_end_matches('/').to_string()
    } else {
        forward
    }
}

/// Compare two paths the way the OS would: after normalization.
pub fn paths_equal(a: &str, b: &str) -> bool {
    normalize_for_compare(a) == normalize_for_compare(b)
}

/// OS-aware ordering comparator for paths (used to pick the "lowest
/// ordered path" among override volumes when none is named `priority`).
pub fn compare_paths(a: &str, b: &str) -> std::cmp::Ordering {
    normalize_for_compare(a).cmp(&normalize_for_compare(b))
}

/// Depth of `path` below `root`, or `None` if `path` is not below `root`.
///
/// Depth 1 means `path` is a direct child of `root`.
pub fn depth_below(root: &str, path: &str) -> Option<usize> {
    let root = normalize_for_compare(root);
    let path = normalize_for_compare(path);
    let rel = path.strip_prefix(&root)?;
    let rel = rel.strip_prefix('/').unwrap_or(rel);
    if rel.is_empty() {
        return Some(0);
    }
    Some(rel.split('/').count())
}

/// True if `path` is at or below `root` under OS-aware comparison.
pub fn is_at_or_below(root: &str, path: &str) -> bool {
    depth_below(root, path).is_some()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_relative_paths() {
        assert!(require_absolute(Path::new("relative/path")).is_err());
        assert!(require_absolute(Path::new("/absolute/path")).is_ok());
    }

    #[test]
    fn escapes_reserved_segments() {
        assert_eq!(escape_reserved_segment("."), "_dot_");
        assert_eq!(escape_reserved_segment(".."), "_dotdot_");
        assert_eq!(escape_reserved_segment(""), "_empty_");
        assert_eq!(escape_reserved_segment("Manga Title"), "Manga Title");
    }

    #[test]
    fn sanitizes_link_names() {
        assert_eq!(sanitize_link_name("My Source!"), "My_Source_");
        assert_eq!(sanitize_link_name(""), "_");
        assert_eq!(sanitize_link_name("Source-01_a"), "Source-01_a");
    }

    #[test]
    fn normalizes_separators_and_trailing_slash() {
        assert_eq!(normalize_for_compare("C:\\foo\\bar\\"), "C:/foo/bar");
        assert_eq!(normalize_for_compare("/foo/bar/"), "/foo/bar");
        assert_eq!(normalize_for_compare("/"), "/");
    }

    #[test]
    fn paths_equal_ignores_trailing_slash_and_slash_style() {
        assert!(paths_equal("/a/b/", "/a/b"));
        assert!(paths_equal("/a/b", "\\a\\b"));
        assert!(!paths_equal("/a/b", "/a/c"));
    }

    #[test]
    fn depth_below_counts_segments() {
        assert_eq!(depth_below("/ssm/sources", "/ssm/sources/disk1"), Some(1));
        assert_eq!(
            depth_below("/ssm/sources", "/ssm/sources/disk1/Source1"),
            Some(2)
        );
        assert_eq!(depth_below("/ssm/sources", "/ssm/sources"), Some(0));
        assert_eq!(depth_below("/ssm/sources", "/other/path"), None);
    }

    #[test]
    fn is_at_or_below_handles_trailing_slash() {
        assert!(is_at_or_below("/ssm/merged", "/ssm/merged/Title"));
        assert!(is_at_or_below("/ssm/merged/", "/ssm/merged/Title/"));
        assert!(!is_at_or_below("/ssm/merged", "/ssm/other/Title"));
    }
}
