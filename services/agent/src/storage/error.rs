//! Errors from durable state operations.

use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

/// Errors from the disk store and the action log.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Any failure to create, write, sync, rename, chmod, open or remove a file.
    #[error("{context} {}: {source}", path.display())]
    Filesystem {
        context: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("could not encode action store: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("could not decode action store {}: {source}", path.display())]
    Decode {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("action store {} has format version {found}, expected {expected}", path.display())]
    UnsupportedVersion {
        path: PathBuf,
        found: u32,
        expected: u32,
    },
}

impl StorageError {
    pub(crate) fn fs(context: &'static str, path: &Path, source: io::Error) -> Self {
        Self::Filesystem {
            context,
            path: path.to_path_buf(),
            source,
        }
    }

    /// Path of the file the failing operation touched, if any.
    pub fn path(&self) -> Option<&Path> {
        match self {
            Self::Filesystem { path, .. }
            | Self::Decode { path, .. }
            | Self::UnsupportedVersion { path, .. } => Some(path),
            Self::Encode(_) => None,
        }
    }
}
