//! Per-request session isolation.
//!
//! Every request gets a UUID-named workdir under the sessions root; all
//! temporary artefacts of the request live inside it, and it is removed
//! on every exit path, panics included, via the drop guard. Stale
//! storage (dead sessions, download cache, old subtitle artefacts) is
//! swept at a bounded frequency of once per session start.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use tracing::{debug, info, warn};
use uuid::Uuid;

/// Error type for session workspace operations.
#[derive(Debug)]
pub enum SessionError {
    /// The workdir could not be created.
    Workspace(String),
    /// A user input could not be copied into the workdir.
    Import(String),
}

impl std::fmt::Display for SessionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionError::Workspace(msg) => write!(f, "Failed to create session workspace: {}", msg),
            SessionError::Import(msg) => write!(f, "Failed to import input: {}", msg),
        }
    }
}

impl std::error::Error for SessionError {}

/// On-disk layout the service owns.
#[derive(Debug, Clone)]
pub struct StorageLayout {
    /// `<root>/sessions/<uuid>/`: transient per-request workdirs.
    pub sessions_root: PathBuf,
    /// `<root>/downloads/`: fetched media cache.
    pub downloads_dir: PathBuf,
    /// `<root>/outputs/`: persisted subtitle artefacts.
    pub outputs_dir: PathBuf,
}

impl StorageLayout {
    pub fn under(root: &Path) -> Self {
        Self {
            sessions_root: root.join("sessions"),
            downloads_dir: root.join("downloads"),
            outputs_dir: root.join("outputs"),
        }
    }

    pub fn ensure(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.sessions_root)?;
        std::fs::create_dir_all(&self.downloads_dir)?;
        std::fs::create_dir_all(&self.outputs_dir)?;
        Ok(())
    }
}

/// Creates isolated sessions and sweeps stale storage.
pub struct SessionManager {
    layout: StorageLayout,
    /// Artefacts older than this are swept.
    max_artifact_age: Duration,
}

impl SessionManager {
    pub fn new(layout: StorageLayout, max_artifact_age: Duration) -> Self {
        Self {
            layout,
            max_artifact_age,
        }
    }

    pub fn layout(&self) -> &StorageLayout {
        &self.layout
    }

    /// Create a fresh, exclusively owned workdir.
    pub fn create_session(&self) -> Result<Session, SessionError> {
        let id = Uuid::new_v4();
        let workdir = self.layout.sessions_root.join(id.to_string());
        std::fs::create_dir_all(&workdir)
            .map_err(|e| SessionError::Workspace(format!("{}: {}", workdir.display(), e)))?;

        info!("Session {} started ({})", id, workdir.display());
        Ok(Session {
            id,
            workdir,
            cleaned: false,
        })
    }

    /// Remove stale session dirs, cached downloads and old artefacts.
    /// Sweep failures are logged and absorbed; they never fail a
    /// request.
    pub fn sweep_stale(&self) {
        self.sweep_dir(&self.layout.sessions_root);
        self.sweep_dir(&self.layout.downloads_dir);
        self.sweep_dir(&self.layout.outputs_dir);
    }

    fn sweep_dir(&self, dir: &Path) {
        let entries = match std::fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) => {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!("Sweep of {} failed: {}", dir.display(), e);
                }
                return;
            }
        };

        let now = SystemTime::now();
        let mut removed = 0usize;
        for entry in entries.flatten() {
            let path = entry.path();
            let age = entry
                .metadata()
                .and_then(|m| m.modified())
                .ok()
                .and_then(|mtime| now.duration_since(mtime).ok());
            let Some(age) = age else { continue };
            if age < self.max_artifact_age {
                continue;
            }

            let result = if path.is_dir() {
                std::fs::remove_dir_all(&path)
            } else {
                std::fs::remove_file(&path)
            };
            match result {
                Ok(()) => removed += 1,
                Err(e) => warn!("Failed to sweep {}: {}", path.display(), e),
            }
        }

        if removed > 0 {
            info!("Swept {} stale entr(ies) from {}", removed, dir.display());
        }
    }
}

/// One request's isolated workspace. Deleting the workdir is tied to
/// this value's lifetime: explicit `close()` on the happy path, the
/// drop guard everywhere else.
pub struct Session {
    id: Uuid,
    workdir: PathBuf,
    cleaned: bool,
}

impl Session {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    /// Staging area for per-unit audio files.
    pub fn units_dir(&self) -> PathBuf {
        self.workdir.join("units")
    }

    /// Copy a user-provided input into the workdir under a fresh
    /// UUID-prefixed name, so identical original filenames across
    /// concurrent sessions can never collide.
    pub fn import_input(&self, source: &Path) -> Result<PathBuf, SessionError> {
        let file_name = source
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("input");
        let dest = self
            .workdir
            .join(format!("{}-{}", Uuid::new_v4(), file_name));

        std::fs::copy(source, &dest).map_err(|e| {
            SessionError::Import(format!("{} -> {}: {}", source.display(), dest.display(), e))
        })?;
        debug!("Session {}: imported {}", self.id, dest.display());
        Ok(dest)
    }

    /// Delete the workdir now instead of at drop time.
    pub fn close(mut self) {
        self.cleanup();
    }

    fn cleanup(&mut self) {
        if self.cleaned {
            return;
        }
        self.cleaned = true;
        match std::fs::remove_dir_all(&self.workdir) {
            Ok(()) => info!("Session {} closed, workdir removed", self.id),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            // Cleanup failure must never mask a result that is already
            // computed.
            Err(e) => warn!(
                "Session {}: failed to remove workdir {}: {}",
                self.id,
                self.workdir.display(),
                e
            ),
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.cleanup();
    }
}
