//! Content-addressed file storage
//!
//! Keys are mapped to on-disk paths by a [`PathTransform`]. With the SHA-1
//! transform a key lands at `root/c1/c2/c3/c4/<sha1>`, which spreads files
//! across buckets and lets every node derive the same location on its own.

pub mod transform;

pub use transform::{plain_path_transform, sha1_path_transform, PathKey, PathTransform};

use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Component, Path, PathBuf};
use thiserror::Error;

/// Root directory used when none is configured
pub const DEFAULT_ROOT: &str = "peerstore-data";

/// Storage errors
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("key not found: {0}")]
    NotFound(String),

    #[error("invalid key: {0}")]
    InvalidKey(String),
}

/// Result type for storage operations
pub type StoreResult<T> = Result<T, StoreError>;

/// Storage configuration
#[derive(Debug, Clone)]
pub struct StoreOpts {
    /// Directory that holds every stored file
    pub root: PathBuf,
    /// Key to path mapping
    pub transform: PathTransform,
}

impl Default for StoreOpts {
    fn default() -> Self {
        Self {
            root: PathBuf::from(DEFAULT_ROOT),
            transform: plain_path_transform,
        }
    }
}

/// File store rooted at a fixed directory
pub struct Store {
    root: PathBuf,
    transform: PathTransform,
}

impl Store {
    /// Create a store. An empty root falls back to [`DEFAULT_ROOT`].
    pub fn new(opts: StoreOpts) -> Self {
        let root = if opts.root.as_os_str().is_empty() {
            PathBuf::from(DEFAULT_ROOT)
        } else {
            opts.root
        };
        Self {
            root,
            transform: opts.transform,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Absolute location of the file backing `key`
    pub fn full_path(&self, key: &str) -> StoreResult<PathBuf> {
        let path_key = self.path_key(key)?;
        Ok(self.root.join(path_key.relative_path()))
    }

    /// Write the whole stream under `key`, replacing any previous content.
    ///
    /// A failed copy leaves whatever was written so far on disk.
    pub fn write<R: Read + ?Sized>(&self, key: &str, reader: &mut R) -> StoreResult<u64> {
        let path_key = self.path_key(key)?;

        let full_path = self.root.join(path_key.relative_path());
        if let Some(parent) = full_path.parent() {
            fs::create_dir_all(parent)?;
        }

        let mut file = File::create(&full_path)?;
        let written = io::copy(reader, &mut file)?;

        log::debug!("Wrote {} bytes to {}", written, full_path.display());
        Ok(written)
    }

    /// Open the file backing `key` for streaming reads
    pub fn open(&self, key: &str) -> StoreResult<File> {
        let full_path = self.full_path(key)?;
        File::open(&full_path).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => StoreError::NotFound(key.to_string()),
            _ => StoreError::Io(e),
        })
    }

    /// Read the full contents stored under `key`
    pub fn read(&self, key: &str) -> StoreResult<Vec<u8>> {
        let mut file = self.open(key)?;
        let mut data = Vec::new();
        file.read_to_end(&mut data)?;
        Ok(data)
    }

    /// Check whether a file exists for `key`
    pub fn has(&self, key: &str) -> bool {
        match self.full_path(key) {
            Ok(path) => fs::metadata(path).is_ok(),
            Err(_) => false,
        }
    }

    /// Remove the top-level bucket directory holding `key`.
    ///
    /// Every other key that lives in the same bucket is removed with it.
    pub fn delete(&self, key: &str) -> StoreResult<()> {
        let path_key = self.path_key(key)?;
        let bucket = path_key
            .first_segment()
            .unwrap_or(path_key.file_name.as_str());
        let bucket_path = self.root.join(bucket);

        let removed = if bucket_path.is_dir() {
            fs::remove_dir_all(&bucket_path)
        } else {
            fs::remove_file(&bucket_path)
        };

        match removed {
            Ok(()) => {
                log::debug!("Deleted bucket {}", bucket_path.display());
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Remove the storage root and everything below it
    pub fn clear(&self) -> StoreResult<()> {
        match fs::remove_dir_all(&self.root) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }

    fn path_key(&self, key: &str) -> StoreResult<PathKey> {
        let path_key = (self.transform)(key);
        let relative = path_key.relative_path();
        let contained = relative
            .components()
            .all(|component| matches!(component, Component::Normal(_)));
        if !contained || path_key.file_name.is_empty() {
            return Err(StoreError::InvalidKey(key.to_string()));
        }
        Ok(path_key)
    }
}
