//! Validation of client-supplied relative paths.
//!
//! Every externally driven create, read or delete passes through
//! [`validate_relative_path`] before the filesystem or the database is
//! touched.

use crate::domain::ValidationError;

fn invalid(path: &str, reason: &'static str) -> ValidationError {
    ValidationError::InvalidPath {
        path: path.to_string(),
        reason,
    }
}

/// Accept a slash-separated path that stays inside the directory it is
/// joined onto.
pub fn validate_relative_path(path: &str) -> Result<(), ValidationError> {
    match path {
        "" => return Err(invalid(path, "empty path")),
        "." | "./" => return Err(invalid(path, "refers to the root")),
        ".." => return Err(invalid(path, "parent directory")),
        _ => {}
    }
    if path.contains("../") {
        return Err(invalid(path, "contains a parent directory component"));
    }
    if path.starts_with('/') || path.starts_with('\\') {
        return Err(invalid(path, "absolute path"));
    }
    if path.contains('\0') {
        return Err(invalid(path, "contains a NUL byte"));
    }
    if path.rsplit('/').next() == Some("..") {
        return Err(invalid(path, "ends in a parent directory component"));
    }
    // a leading "./" is harmless; anywhere else "." aliases its parent
    if path.split('/').skip(1).any(|component| component == ".") {
        return Err(invalid(path, "contains a '.' component"));
    }
    Ok(())
}

/// Accept a user or project name: one non-empty path component.
pub fn validate_name(name: &str) -> Result<(), ValidationError> {
    validate_relative_path(name)?;
    if name.contains('/') || name.contains('\\') || name.starts_with('.') {
        return Err(invalid(name, "not a single path component"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_escapes() {
        for bad in [
            "", ".", "./", "..", "../x", "a/../b", "a/../../etc", "/etc/passwd", "\\share",
            "a\0b", "a/..", "x/.", "a/./b", "./a/.",
        ] {
            assert!(validate_relative_path(bad).is_err(), "{bad:?} should be rejected");
        }
    }

    #[test]
    fn accepts_nested_paths() {
        for good in [
            "a/b/c.txt", "main.tex", "fig/plot..png", ".latexmkrc", "a/.b/c", "./main.tex",
        ] {
            assert!(validate_relative_path(good).is_ok(), "{good:?} should be accepted");
        }
    }

    #[test]
    fn names_are_single_components() {
        assert!(validate_name("thesis").is_ok());
        assert!(validate_name("a/b").is_err());
        assert!(validate_name(".hidden").is_err());
        assert!(validate_name("..").is_err());
    }
}
