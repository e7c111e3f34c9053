//! Local model directories

use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use tracing::debug;

use crate::{CoreError, Result};

/// Model files on local disk.
///
/// The first directory is where new files land. Lookups search all
/// directories in order.
#[derive(Debug, Clone)]
pub struct ModelStore {
    directories: Vec<PathBuf>,
}

impl ModelStore {
    /// Create a store over a primary directory
    pub fn new(primary: impl Into<PathBuf>) -> Self {
        Self {
            directories: vec![primary.into()],
        }
    }

    /// Add a directory searched after the existing ones
    pub fn with_directory(mut self, directory: impl Into<PathBuf>) -> Self {
        self.directories.push(directory.into());
        self
    }

    /// Directory new files are written to
    pub fn primary_dir(&self) -> &Path {
        &self.directories[0]
    }

    /// All searched directories
    pub fn directories(&self) -> &[PathBuf] {
        &self.directories
    }

    /// Path of an existing file, searching all directories
    pub fn locate(&self, name: &str) -> Option<PathBuf> {
        self.directories
            .iter()
            .map(|dir| dir.join(name))
            .find(|path| path.is_file())
    }

    /// Path a file should be written to
    pub fn path_for(&self, name: &str) -> PathBuf {
        self.primary_dir().join(name)
    }

    /// Whether a non-empty file with this name is present
    pub fn is_downloaded(&self, name: &str) -> bool {
        self.directories.iter().any(|dir| {
            fs::metadata(dir.join(name))
                .map(|meta| meta.is_file() && meta.len() > 0)
                .unwrap_or(false)
        })
    }

    /// Hex SHA-256 of a stored file
    pub fn sha256_of(&self, name: &str) -> Result<String> {
        let path = self
            .locate(name)
            .ok_or_else(|| CoreError::Store(format!("{} not found", name)))?;
        Ok(sha256_file(&path)?)
    }

    /// Non-empty `.ckpt` files across all directories, sorted and deduplicated
    pub fn list_ckpt_files(&self) -> Vec<String> {
        let mut files = Vec::new();
        for dir in &self.directories {
            let entries = match fs::read_dir(dir) {
                Ok(entries) => entries,
                Err(e) => {
                    debug!(dir = %dir.display(), "Skipping model directory: {}", e);
                    continue;
                }
            };
            for entry in entries.flatten() {
                let path = entry.path();
                if path.extension().and_then(|e| e.to_str()) != Some("ckpt") {
                    continue;
                }
                let non_empty = entry
                    .metadata()
                    .map(|meta| meta.is_file() && meta.len() > 0)
                    .unwrap_or(false);
                if !non_empty {
                    continue;
                }
                if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                    files.push(name.to_string());
                }
            }
        }
        files.sort();
        files.dedup();
        files
    }
}

/// Path of the in-progress file for a destination
pub fn part_path(destination: &Path) -> PathBuf {
    let mut name = destination.as_os_str().to_owned();
    name.push(".part");
    PathBuf::from(name)
}

/// Hex SHA-256 of a file, streamed
pub fn sha256_file(path: &Path) -> io::Result<String> {
    let mut file = fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; 1024 * 1024];
    loop {
        let n = file.read(&mut buffer)?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}
