//! Path validation and security utilities.
//!
//! This module provides functions to validate storage paths and prevent
//! security issues like path traversal attacks. Every backend runs caller
//! input through here before deriving a physical location (file path or
//! object key) from it.

use crate::error::{ErrorKind, Operation, Result};
use derive_more::{Display, Error};

/// Why a path or prefix was rejected.
#[derive(Debug, Display, Error, Clone, Copy, PartialEq, Eq)]
pub enum PathRejection {
    #[display("path cannot be empty")]
    Empty,
    #[display("directory traversal detected")]
    Traversal,
    #[display("null byte detected")]
    NullByte,
    /// The path names storage a backend keeps for itself.
    #[display("path is reserved for internal metadata")]
    Reserved,
}

/// Validates a storage path for security and correctness.
///
/// The path is lexically cleaned (`.` segments and repeated or trailing
/// slashes collapse away, one leading `/` or `\` is stripped) and returned in
/// forward-slash form relative to the backend root.
///
/// > **Note:** Any `..` segment is rejected outright, even one that would
/// >           resolve inside the root (`a/../b`). Backslashes count as
/// >           separators when looking for `..` segments, but are otherwise
/// >           treated as ordinary filename characters.
///
/// # Returns
/// Returns the normalized path if valid, or a [`PathRejection`] describing
/// why it is not. A path that normalizes to nothing (`""`, `.`, `/`) has no
/// referent and is rejected as [`Empty`](PathRejection::Empty).
///
/// # Examples
///
/// ```
/// use depot_storage::validate_path;
/// // Valid paths
/// assert!(validate_path("invoices/2024/march.pdf").is_ok());
/// assert!(validate_path("a/b/c/file.txt").is_ok());
/// // Invalid paths
/// assert!(validate_path("../etc/passwd").is_err());
/// assert!(validate_path("a/../../b").is_err());
/// assert!(validate_path("a\0b").is_err());
/// assert!(validate_path("").is_err());
/// // Paths get cleaned
/// assert_eq!(validate_path("/correct/.//path.txt/").unwrap(), "correct/path.txt");
/// ```
pub fn validate(raw: &str) -> std::result::Result<String, PathRejection> {
    match clean(raw)? {
        cleaned if cleaned.is_empty() => Err(PathRejection::Empty),
        cleaned => Ok(cleaned),
    }
}

/// Validates a listing prefix.
///
/// Identical to [`validate`] except that input normalizing to nothing (`""`,
/// `.`, `/`) is valid and yields the empty prefix, meaning "everything".
///
/// ```
/// use depot_storage::validate_prefix;
/// assert_eq!(validate_prefix("").unwrap(), "");
/// assert_eq!(validate_prefix(".").unwrap(), "");
/// assert_eq!(validate_prefix("/media/").unwrap(), "media");
/// assert!(validate_prefix("../media").is_err());
/// ```
pub fn validate_prefix(raw: &str) -> std::result::Result<String, PathRejection> {
    clean(raw)
}

fn clean(raw: &str) -> std::result::Result<String, PathRejection> {
    // Null bytes cause truncation in C-based syscalls; reject them before
    // anything else looks at the string.
    if raw.contains('\0') {
        return Err(PathRejection::NullByte);
    }
    // Reject on the raw text rather than the cleaned result: cleaning can
    // swallow an embedded `..` and hide that one was ever there.
    if raw.split(['/', '\\']).any(|segment| segment == "..") {
        return Err(PathRejection::Traversal);
    }
    let raw = raw.strip_prefix(['/', '\\']).unwrap_or(raw);
    let segments: Vec<&str> = raw.split('/').filter(|segment| !segment.is_empty() && *segment != ".").collect();
    Ok(segments.join("/"))
}

/// Validate a path on behalf of a contract operation, attaching the operation
/// and the caller's original input to any rejection.
pub(crate) fn checked(op: Operation, raw: &str) -> Result<String> {
    validate(raw).map_err(|reason| {
        exn::Exn::from(ErrorKind::InvalidPath {
            op,
            path: raw.to_string(),
            reason,
        })
    })
}

/// Prefix counterpart of [`checked`].
pub(crate) fn checked_prefix(op: Operation, raw: &str) -> Result<String> {
    validate_prefix(raw).map_err(|reason| {
        exn::Exn::from(ErrorKind::InvalidPath {
            op,
            path: raw.to_string(),
            reason,
        })
    })
}

/// Whether `path` lies strictly below `prefix`, comparing whole segments
/// (`dir1` contains `dir1/x` but not `dir10/x`, and not `dir1` itself).
/// The empty prefix contains every non-empty path.
#[cfg(any(test, feature = "mock", feature = "s3"))]
pub(crate) fn is_below(prefix: &str, path: &str) -> bool {
    if prefix.is_empty() {
        return !path.is_empty();
    }
    path.strip_prefix(prefix).is_some_and(|rest| rest.starts_with('/') && rest.len() > 1)
}

/// Every ancestor directory of `path` that lies strictly below `prefix`,
/// shallowest first.
#[cfg(any(test, feature = "mock", feature = "s3"))]
pub(crate) fn ancestors_below<'a>(prefix: &'a str, path: &'a str) -> impl Iterator<Item = &'a str> + 'a {
    path.match_indices('/').map(move |(i, _)| &path[..i]).filter(move |dir| is_below(prefix, dir))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("invoices/2024/march.pdf", "invoices/2024/march.pdf")]
    #[case("a/b/c/file.txt", "a/b/c/file.txt")]
    #[case("simple.txt", "simple.txt")]
    #[case("a//b//c", "a/b/c")]
    #[case("a/./b/./c", "a/b/c")]
    #[case("/leading/slash.txt", "leading/slash.txt")]
    #[case("\\leading/backslash.txt", "leading/backslash.txt")]
    #[case("invoices/", "invoices")]
    #[case("invoices///", "invoices")]
    #[case("..hidden/file", "..hidden/file")]
    #[case("a/...", "a/...")]
    fn test_valid_paths(#[case] input: &str, #[case] expected: &str) {
        assert_eq!(validate(input).unwrap(), expected);
    }

    #[rstest]
    #[case("../etc/passwd")]
    #[case("a/../../b")]
    #[case("a/../b")]
    #[case("a/b/..")]
    #[case("..")]
    #[case("../..")]
    #[case("/../escape.txt")]
    #[case("..\\escape.txt")]
    #[case("a\\..\\..\\b")]
    fn test_traversal_attempts(#[case] input: &str) {
        assert_eq!(validate(input), Err(PathRejection::Traversal));
        assert_eq!(validate_prefix(input), Err(PathRejection::Traversal));
    }

    #[rstest]
    #[case("a\0b")]
    #[case("\0")]
    fn test_null_bytes(#[case] input: &str) {
        assert_eq!(validate(input), Err(PathRejection::NullByte));
        assert_eq!(validate_prefix(input), Err(PathRejection::NullByte));
    }

    #[rstest]
    #[case("")]
    #[case(".")]
    #[case("./")]
    #[case("./.")]
    #[case("/")]
    #[case("//")]
    fn test_empty_paths(#[case] input: &str) {
        assert_eq!(validate(input), Err(PathRejection::Empty));
        // ... but an empty prefix means "everything".
        assert_eq!(validate_prefix(input).unwrap(), "");
    }

    #[test]
    fn test_normalized_form_is_stable() {
        let once = validate("/a/./b//c.txt").unwrap();
        assert_eq!(validate(&once).unwrap(), once);
    }

    #[test]
    fn test_checked_keeps_original_input() {
        let err = checked(Operation::Get, "../x").unwrap_err();
        assert!(matches!(
            &*err,
            ErrorKind::InvalidPath { op: Operation::Get, path, reason: PathRejection::Traversal } if path == "../x"
        ));
    }

    #[rstest]
    #[case("", "a", true)]
    #[case("", "", false)]
    #[case("dir1", "dir1/x", true)]
    #[case("dir1", "dir1/x/y", true)]
    #[case("dir1", "dir1", false)]
    #[case("dir1", "dir10/x", false)]
    #[case("a/b", "a/b/c.txt", true)]
    #[case("a/b", "a/bc/d.txt", false)]
    fn test_is_below(#[case] prefix: &str, #[case] path: &str, #[case] expected: bool) {
        assert_eq!(is_below(prefix, path), expected);
    }

    #[test]
    fn test_ancestors_below() {
        assert_eq!(ancestors_below("", "a/b/c.txt").collect::<Vec<_>>(), vec!["a", "a/b"]);
        assert_eq!(ancestors_below("a", "a/b/c.txt").collect::<Vec<_>>(), vec!["a/b"]);
        assert_eq!(ancestors_below("a/b", "a/b/c.txt").count(), 0);
    }
}
