use std::path::{Path, PathBuf};

use tempfile::TempDir;
use tracing::{debug, warn};

use crate::error::{HarnessError, Result};

/// A private temporary directory backing one harness instance.
///
/// Sockets, generated configuration, databases and state files for a managed
/// process all live under the workspace root. The directory is removed by
/// [`Workspace::cleanup`] exactly once; a second call reports
/// [`HarnessError::WorkspaceCleaned`]. A workspace dropped without cleanup is
/// still removed by the underlying [`TempDir`].
#[derive(Debug)]
pub struct Workspace {
    root: PathBuf,
    dir: Option<TempDir>,
    prev_dir: Option<PathBuf>,
}

impl Workspace {
    /// Creates a fresh, uniquely named workspace whose name starts with `prefix`.
    pub fn new(prefix: &str) -> Result<Self> {
        let dir = tempfile::Builder::new()
            .prefix(&format!("{prefix}-"))
            .tempdir()
            .map_err(|source| HarnessError::Workspace {
                path: std::env::temp_dir(),
                source,
            })?;

        let root = std::fs::canonicalize(dir.path()).map_err(|source| HarnessError::Workspace {
            path: dir.path().to_path_buf(),
            source,
        })?;

        debug!("Created workspace {}", root.display());
        Ok(Self {
            root,
            dir: Some(dir),
            prev_dir: None,
        })
    }

    /// Creates a workspace and moves the process working directory into it.
    ///
    /// The previous working directory is restored by [`Workspace::cleanup`].
    /// The working directory is process-wide, so only collaborators that
    /// resolve relative paths should ask for this.
    pub fn entered(prefix: &str) -> Result<Self> {
        let mut workspace = Self::new(prefix)?;

        let cwd = std::env::current_dir().map_err(|source| HarnessError::Workspace {
            path: workspace.root.clone(),
            source,
        })?;
        std::env::set_current_dir(&workspace.root).map_err(|source| HarnessError::Workspace {
            path: workspace.root.clone(),
            source,
        })?;

        workspace.prev_dir = Some(cwd);
        Ok(workspace)
    }

    /// Absolute path of the workspace root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Joins `segments` under the workspace root.
    pub fn path<I, S>(&self, segments: I) -> PathBuf
    where
        I: IntoIterator<Item = S>,
        S: AsRef<Path>,
    {
        let mut path = self.root.clone();
        for segment in segments {
            path.push(segment);
        }
        path
    }

    /// True once [`Workspace::cleanup`] has run.
    pub fn is_cleaned(&self) -> bool {
        self.dir.is_none()
    }

    /// Restores the previous working directory (if any) and removes the workspace.
    pub fn cleanup(&mut self) -> Result<()> {
        if let Some(prev) = self.prev_dir.take() {
            if let Err(e) = std::env::set_current_dir(&prev) {
                warn!("Unable to move back to previous dir {}: {}", prev.display(), e);
            }
        }

        let dir = self
            .dir
            .take()
            .ok_or_else(|| HarnessError::WorkspaceCleaned(self.root.clone()))?;

        debug!("Removing workspace {}", self.root.display());
        dir.close().map_err(|source| HarnessError::Workspace {
            path: self.root.clone(),
            source,
        })
    }
}
