use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use engine_logging::{engine_debug, engine_warn};

/// Shared ownership of a scratch directory.
///
/// Clones share one directory. When the last clone is dropped the directory and
/// everything in it is removed. Hold a clone for as long as any work reads from it.
#[derive(Clone)]
pub struct TempDirGuard {
    inner: Arc<GuardInner>,
}

struct GuardInner {
    path: PathBuf,
}

impl TempDirGuard {
    /// Creates a fresh uniquely named directory under `base`.
    pub fn create_in(base: &Path) -> io::Result<Self> {
        fs::create_dir_all(base)?;
        let dir = tempfile::Builder::new().prefix("crawler-").tempdir_in(base)?;
        // Cleanup is owned by the guard from here on.
        let path = dir.keep();
        Ok(Self::adopt(path))
    }

    /// Takes ownership of an existing directory.
    pub fn adopt(path: PathBuf) -> Self {
        Self {
            inner: Arc::new(GuardInner { path }),
        }
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    /// Number of live clones, including this one.
    pub fn owners(&self) -> usize {
        Arc::strong_count(&self.inner)
    }
}

impl fmt::Debug for TempDirGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TempDirGuard")
            .field("path", &self.inner.path)
            .finish()
    }
}

impl Drop for GuardInner {
    fn drop(&mut self) {
        match fs::remove_dir_all(&self.path) {
            Ok(()) => engine_debug!("removed temp dir {}", self.path.display()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => engine_warn!(
                "failed to remove temp dir {}: {}",
                self.path.display(),
                err
            ),
        }
    }
}
