#![forbid(unsafe_code)]

use rustc_hash::FxHasher;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// A binary path together with the process that caused it to be activated.
///
/// The path is the registry key; the PID is only informational (it is the
/// first referrer of the activation) and is used by checks that need process
/// metadata, such as the buildkit exclusion.
#[derive(Clone, PartialEq, Eq)]
pub struct FilePath {
    pub path: Arc<Path>,
    pub pid: u32,
}

impl FilePath {
    pub fn new(path: impl Into<PathBuf>, pid: u32) -> Self {
        Self {
            path: Arc::from(path.into().as_path()),
            pid,
        }
    }

    pub fn from_arc(path: Arc<Path>, pid: u32) -> Self {
        Self { path, pid }
    }

    /// Short identifier derived from the path, used to build probe UIDs.
    ///
    /// Kernel uprobe event names are limited to 64 characters, so only five
    /// hex digits are kept.
    pub fn uid(&self) -> String {
        let mut hasher = FxHasher::default();
        self.path.hash(&mut hasher);
        let digest = format!("{:016x}", hasher.finish());
        digest[..5].to_string()
    }
}

impl fmt::Debug for FilePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FilePath")
            .field("path", &self.path)
            .field("pid", &self.pid)
            .finish()
    }
}

impl fmt::Display for FilePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (pid {})", self.path.display(), self.pid)
    }
}
