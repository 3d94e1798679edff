//! Abstractions for filesystem access to enable testing and mocking.
//!
//! Identifier discovery and archive existence checks go through the
//! `FileSystem` trait, so they can run against the real archive tree or an
//! in-memory `MockFs`.

use std::io;
use std::path::{Path, PathBuf};

/// Abstraction for the filesystem operations the pipeline needs.
pub trait FileSystem: Send + Sync {
    /// Reads the entire contents of a file as a string.
    fn read_to_string(&self, path: &Path) -> io::Result<String>;

    /// Checks if a path exists.
    fn exists(&self, path: &Path) -> bool;

    /// Lists entries in a directory, as full paths.
    fn read_dir(&self, path: &Path) -> io::Result<Vec<PathBuf>>;
}

/// Real filesystem implementation that delegates to `std::fs`.
#[derive(Debug, Default, Clone, Copy)]
pub struct RealFs;

impl RealFs {
    pub fn new() -> Self {
        Self
    }
}

impl FileSystem for RealFs {
    fn read_to_string(&self, path: &Path) -> io::Result<String> {
        std::fs::read_to_string(path)
    }

    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn read_dir(&self, path: &Path) -> io::Result<Vec<PathBuf>> {
        let entries = std::fs::read_dir(path)?;
        let mut paths = Vec::new();
        for entry in entries {
            paths.push(entry?.path());
        }
        Ok(paths)
    }
}

/// Lists directory entries, treating a missing directory as empty.
///
/// Archive directories come and go with the collector; a scan of a
/// directory that does not exist yet simply finds nothing.
pub fn read_dir_or_empty(fs: &dyn FileSystem, path: &Path) -> io::Result<Vec<PathBuf>> {
    match fs.read_dir(path) {
        Ok(entries) => Ok(entries),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(e),
    }
}
