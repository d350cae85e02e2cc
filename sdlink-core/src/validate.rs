//! Policy checks on peer-supplied paths and sizes. Run before any storage call.

use crate::error::ValidationError;

/// Longest accepted peer-supplied path, in bytes.
pub const DEFAULT_MAX_PATH_LEN: usize = 256;

/// Largest accepted book.
pub const DEFAULT_MAX_BOOK_SIZE: u64 = 100 * 1024 * 1024; // 100 MB

/// Check a relative book path: not absolute, no `..` segment, bounded length, whitelisted extension.
pub fn check_lpath(
    lpath: &str,
    extensions: &[String],
    max_len: usize,
) -> Result<(), ValidationError> {
    if lpath.is_empty() {
        return Err(ValidationError::EmptyPath);
    }
    if lpath.len() > max_len {
        return Err(ValidationError::PathTooLong {
            len: lpath.len(),
            max: max_len,
        });
    }
    let bytes = lpath.as_bytes();
    let drive = bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':';
    if lpath.starts_with('/') || lpath.starts_with('\\') || drive {
        return Err(ValidationError::AbsolutePath(lpath.to_string()));
    }
    if lpath.split(['/', '\\']).any(|seg| seg == "..") {
        return Err(ValidationError::Traversal(lpath.to_string()));
    }
    let file_name = lpath.rsplit(['/', '\\']).next().unwrap_or(lpath);
    let ext = match file_name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() && !ext.is_empty() => ext,
        _ => return Err(ValidationError::Extension(String::new())),
    };
    if !extensions.iter().any(|e| e.eq_ignore_ascii_case(ext)) {
        return Err(ValidationError::Extension(ext.to_string()));
    }
    Ok(())
}

/// Check a declared transfer size: non-zero and at most `max`.
pub fn check_size(size: u64, max: u64) -> Result<(), ValidationError> {
    if size == 0 || size > max {
        return Err(ValidationError::Size { size, max });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exts() -> Vec<String> {
        vec!["epub".into(), "txt".into()]
    }

    fn check(lpath: &str) -> Result<(), ValidationError> {
        check_lpath(lpath, &exts(), DEFAULT_MAX_PATH_LEN)
    }

    #[test]
    fn accepts_relative_whitelisted() {
        assert_eq!(check("Books/novel.epub"), Ok(()));
        assert_eq!(check("notes.TXT"), Ok(()));
        assert_eq!(check("Author Name/Title - Author.epub"), Ok(()));
    }

    #[test]
    fn rejects_traversal() {
        assert!(matches!(
            check("../../etc/passwd"),
            Err(ValidationError::Traversal(_))
        ));
        assert!(matches!(
            check("Books/../../x.epub"),
            Err(ValidationError::Traversal(_))
        ));
        assert!(matches!(
            check("Books\\..\\x.epub"),
            Err(ValidationError::Traversal(_))
        ));
    }

    #[test]
    fn dotted_names_are_not_traversal() {
        assert_eq!(check("Books/..hidden.epub"), Ok(()));
    }

    #[test]
    fn rejects_absolute() {
        assert!(matches!(
            check("/etc/passwd"),
            Err(ValidationError::AbsolutePath(_))
        ));
        assert!(matches!(
            check("\\x.epub"),
            Err(ValidationError::AbsolutePath(_))
        ));
        assert!(matches!(
            check("C:x.epub"),
            Err(ValidationError::AbsolutePath(_))
        ));
    }

    #[test]
    fn rejects_long_path() {
        let long = format!("{}.epub", "a".repeat(300));
        assert!(matches!(
            check(&long),
            Err(ValidationError::PathTooLong { len: 305, max: 256 })
        ));
        let at_limit = format!("{}.epub", "a".repeat(DEFAULT_MAX_PATH_LEN - 5));
        assert_eq!(check(&at_limit), Ok(()));
    }

    #[test]
    fn rejects_unlisted_extension() {
        assert_eq!(
            check("malware.exe"),
            Err(ValidationError::Extension("exe".into()))
        );
        assert!(matches!(check("README"), Err(ValidationError::Extension(_))));
        assert!(matches!(check(".epub"), Err(ValidationError::Extension(_))));
        assert!(matches!(check("dir.epub/"), Err(ValidationError::Extension(_))));
        assert_eq!(check(""), Err(ValidationError::EmptyPath));
    }

    #[test]
    fn sizes() {
        assert!(check_size(1, DEFAULT_MAX_BOOK_SIZE).is_ok());
        assert!(check_size(DEFAULT_MAX_BOOK_SIZE, DEFAULT_MAX_BOOK_SIZE).is_ok());
        assert!(check_size(0, DEFAULT_MAX_BOOK_SIZE).is_err());
        assert!(check_size(DEFAULT_MAX_BOOK_SIZE + 1, DEFAULT_MAX_BOOK_SIZE).is_err());
    }
}
