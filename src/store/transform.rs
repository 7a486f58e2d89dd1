//! Key to path transforms
//!
//! A transform is a pure function from a storage key to a [`PathKey`]. The
//! same key always maps to the same path on every node.

use sha1::{Digest, Sha1};
use std::path::PathBuf;

/// Width of each directory segment cut from the hex digest
pub const CHUNK_WIDTH: usize = 10;

/// Maps a storage key to its on-disk location
pub type PathTransform = fn(&str) -> PathKey;

/// Location of a key relative to the storage root
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathKey {
    /// Directory segments, outermost first
    pub path: Vec<String>,
    /// Leaf file name
    pub file_name: String,
}

impl PathKey {
    /// Directory segments joined with `/`
    pub fn path_string(&self) -> String {
        self.path.join("/")
    }

    /// Path of the leaf file relative to the root
    pub fn relative_path(&self) -> PathBuf {
        let mut rel: PathBuf = self.path.iter().collect();
        rel.push(&self.file_name);
        rel
    }

    /// Top-level bucket directory of this key
    pub fn first_segment(&self) -> Option<&str> {
        self.path
            .iter()
            .flat_map(|segment| segment.split('/'))
            .find(|part| !part.is_empty())
    }
}

/// SHA-1 the key and spread the hex digest over nested directories
pub fn sha1_path_transform(key: &str) -> PathKey {
    let digest = Sha1::digest(key.as_bytes());
    let hash = hex::encode(digest);

    let path = hash
        .as_bytes()
        .chunks(CHUNK_WIDTH)
        .map(|chunk| String::from_utf8_lossy(chunk).into_owned())
        .collect();

    PathKey {
        path,
        file_name: hash,
    }
}

/// Use the raw key as both directory and file name
pub fn plain_path_transform(key: &str) -> PathKey {
    PathKey {
        path: vec![key.to_string()],
        file_name: key.to_string(),
    }
}
