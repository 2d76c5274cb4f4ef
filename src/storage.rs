//! Local storage disk the dumps live on.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use walkdir::WalkDir;

/// A named storage root. Relative paths handed to it are resolved below `root`.
#[derive(Debug, Clone)]
pub struct LocalDisk {
    root: PathBuf,
}

/// One regular file directly inside a listed directory.
#[derive(Debug, Clone)]
pub struct DiskFile {
    pub path: PathBuf,
    pub size: u64,
    pub modified: SystemTime,
}

impl LocalDisk {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        LocalDisk { root: root.into() }
    }

    /// Absolute path of `relative` on this disk.
    pub fn path(&self, relative: impl AsRef<Path>) -> io::Result<PathBuf> {
        std::path::absolute(self.root.join(relative))
    }

    pub fn is_directory(&self, relative: impl AsRef<Path>) -> bool {
        self.root.join(relative).is_dir()
    }

    pub fn make_directory(&self, relative: impl AsRef<Path>) -> io::Result<PathBuf> {
        let path = self.path(relative)?;
        fs::create_dir_all(&path)?;
        Ok(path)
    }

    /// Regular files directly inside `relative`, sorted by path.
    ///
    /// Subdirectories are not descended into.
    pub fn files(&self, relative: impl AsRef<Path>) -> io::Result<Vec<DiskFile>> {
        let dir = self.path(relative)?;
        let mut files = Vec::new();
        for entry in WalkDir::new(&dir).min_depth(1).max_depth(1).sort_by_file_name() {
            let entry = entry.map_err(io::Error::other)?;
            if !entry.file_type().is_file() {
                continue;
            }
            let metadata = entry.metadata().map_err(io::Error::other)?;
            files.push(DiskFile {
                path: entry.into_path(),
                size: metadata.len(),
                modified: metadata.modified()?,
            });
        }
        Ok(files)
    }
}
