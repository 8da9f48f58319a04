use std::io::ErrorKind as StdIoErrorKind;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tracing::{debug, warn};
use uuid::Uuid;

pub const JOBS_DIR: &str = "jobs";

pub fn init_workspace(workspace: &Path) -> std::io::Result<PathBuf> {
    let jobs_dir = workspace.join(JOBS_DIR);
    std::fs::create_dir_all(&jobs_dir)?;
    Ok(jobs_dir)
}

/// A per-request output directory owned exclusively by one request.
///
/// Dropping it removes the tree silently, which covers cancelled requests.
/// Normal completion should go through [`ScopedDir::release`] so that a
/// failed removal is logged.
#[derive(Debug)]
pub struct ScopedDir {
    request_id: Uuid,
    dir: TempDir,
}

impl ScopedDir {
    pub fn create(jobs_dir: &Path, request_id: Uuid) -> std::io::Result<Self> {
        let dir = tempfile::Builder::new()
            .prefix(&format!("{request_id}-"))
            .tempdir_in(jobs_dir)?;
        debug!(%request_id, path = ?dir.path(), "Scoped output dir created");
        Ok(Self { request_id, dir })
    }

    pub fn request_id(&self) -> Uuid {
        self.request_id
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn output_path(&self, file_name: &str) -> PathBuf {
        self.dir.path().join(file_name)
    }

    /// Remove the directory tree. Never fails the request: an already absent
    /// tree counts as removed, anything else is logged.
    pub fn release(self) {
        let request_id = self.request_id;
        let path = self.dir.path().to_path_buf();
        match self.dir.close() {
            Ok(()) => debug!(%request_id, ?path, "Scoped output dir removed"),
            Err(error) if error.kind() == StdIoErrorKind::NotFound => {
                debug!(%request_id, ?path, "Scoped output dir already gone");
            }
            Err(error) => {
                warn!(%request_id, ?path, %error, "Failed to remove scoped output dir");
            }
        }
    }
}
