//! Storage collaborator. The engine only ever touches files through this trait, using
//! `/`-separated paths relative to the storage root.

use std::fs;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

/// Fallback figures reported when the storage cannot measure itself.
pub const ESTIMATED_TOTAL_SPACE: u64 = 16 * 1024 * 1024 * 1024;
pub const ESTIMATED_FREE_SPACE: u64 = 8 * 1024 * 1024 * 1024;

pub trait Storage: Send {
    fn open_read(&self, path: &str) -> io::Result<Box<dyn Read + Send>>;

    /// Open for writing, creating or truncating.
    fn create(&self, path: &str) -> io::Result<Box<dyn Write + Send>>;

    fn exists(&self, path: &str) -> bool;

    fn create_dir_all(&self, path: &str) -> io::Result<()>;

    fn remove(&self, path: &str) -> io::Result<()>;

    fn free_space(&self) -> Option<u64> {
        None
    }

    fn total_space(&self) -> Option<u64> {
        None
    }
}

/// Plain filesystem storage rooted at a directory.
#[derive(Debug, Clone)]
pub struct FsStorage {
    root: PathBuf,
}

impl FsStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Map a storage path onto the root. Leading separators are ignored so `/Books/x` and
    /// `Books/x` name the same file.
    pub fn resolve(&self, path: &str) -> PathBuf {
        let mut out = self.root.clone();
        for part in path.split('/').filter(|p| !p.is_empty() && *p != ".") {
            out.push(part);
        }
        out
    }
}

impl Storage for FsStorage {
    fn open_read(&self, path: &str) -> io::Result<Box<dyn Read + Send>> {
        Ok(Box::new(fs::File::open(self.resolve(path))?))
    }

    fn create(&self, path: &str) -> io::Result<Box<dyn Write + Send>> {
        Ok(Box::new(fs::File::create(self.resolve(path))?))
    }

    fn exists(&self, path: &str) -> bool {
        self.resolve(path).exists()
    }

    fn create_dir_all(&self, path: &str) -> io::Result<()> {
        fs::create_dir_all(self.resolve(path))
    }

    fn remove(&self, path: &str) -> io::Result<()> {
        fs::remove_file(self.resolve(path))
    }
}

/// Parent directory of a `/`-separated path, if it has one.
pub fn parent_dir(path: &str) -> Option<&str> {
    let idx = path.trim_end_matches('/').rfind('/')?;
    let parent = &path[..idx];
    (!parent.is_empty()).then_some(parent)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fs_storage_create_read_remove() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FsStorage::new(dir.path());
        storage.create_dir_all("Books/Author").unwrap();
        {
            let mut w = storage.create("Books/Author/b.epub").unwrap();
            w.write_all(b"epub bytes").unwrap();
        }
        assert!(storage.exists("Books/Author/b.epub"));
        assert!(storage.exists("/Books/Author/b.epub"));
        let mut got = String::new();
        storage
            .open_read("Books/Author/b.epub")
            .unwrap()
            .read_to_string(&mut got)
            .unwrap();
        assert_eq!(got, "epub bytes");
        storage.remove("Books/Author/b.epub").unwrap();
        assert!(!storage.exists("Books/Author/b.epub"));
    }

    #[test]
    fn create_truncates() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FsStorage::new(dir.path());
        storage.create("a.txt").unwrap().write_all(b"long content").unwrap();
        storage.create("a.txt").unwrap().write_all(b"short").unwrap();
        assert_eq!(fs::read(dir.path().join("a.txt")).unwrap(), b"short");
    }

    #[test]
    fn parent_dirs() {
        assert_eq!(parent_dir("Books/a/b.epub"), Some("Books/a"));
        assert_eq!(parent_dir("b.epub"), None);
        assert_eq!(parent_dir("/b.epub"), None);
    }
}
