//! Filesystem-backed object store.
//!
//! Objects are addressed as `{folder}/{name}` and land at
//! `<root>/{folder}/{name}`.  Writes go to a hidden temp file first and are
//! renamed into place, so a listing never shows a half-written object.
//!
//! The folder names double as the persistent capture counter: on startup
//! the coordinator resumes one past the highest counter found here.

use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, info, warn};

use syncam_common::naming;
use syncam_common::protocol::ObjectInfo;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("invalid object key component: {0:?}")]
    InvalidKey(String),
    #[error("object not found: {0}")]
    NotFound(String),
    #[error("storage I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> StoreError + '_ {
    move |source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    }
}

#[derive(Debug, Clone)]
pub struct LocalStore {
    root: PathBuf,
}

impl LocalStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn object_path(&self, folder: &str, name: &str) -> Result<PathBuf, StoreError> {
        for part in [folder, name] {
            if !naming::is_safe_component(part) {
                return Err(StoreError::InvalidKey(part.to_string()));
            }
        }
        Ok(self.root.join(folder).join(name))
    }

    /// Write one named object.  An existing object with the same key is
    /// replaced.
    pub async fn put(
        &self,
        folder: &str,
        name: &str,
        content: &[u8],
        content_type: &str,
    ) -> Result<PathBuf, StoreError> {
        let path = self.object_path(folder, name)?;
        let dir = self.root.join(folder);
        tokio::fs::create_dir_all(&dir).await.map_err(io_err(&dir))?;

        let tmp = dir.join(format!(".{name}.part"));
        tokio::fs::write(&tmp, content).await.map_err(io_err(&tmp))?;
        tokio::fs::rename(&tmp, &path).await.map_err(io_err(&path))?;

        info!(
            "Stored {folder}/{name} ({} bytes, {content_type})",
            content.len()
        );
        Ok(path)
    }

    /// Capture folder names in creation order.
    pub fn list_folders(&self) -> Result<Vec<String>, StoreError> {
        if !self.root.exists() {
            return Ok(vec![]);
        }
        let entries = std::fs::read_dir(&self.root).map_err(io_err(&self.root))?;
        let mut folders: Vec<String> = entries
            .flatten()
            .filter(|e| e.file_type().map(|t| t.is_dir()).unwrap_or(false))
            .filter_map(|e| e.file_name().to_str().map(str::to_string))
            .filter(|name| !name.starts_with('.'))
            .collect();
        folders.sort_by(|a, b| naming::creation_order(a, b));
        Ok(folders)
    }

    /// Objects inside one capture folder.
    pub fn list_objects(&self, folder: &str) -> Result<Vec<ObjectInfo>, StoreError> {
        if !naming::is_safe_component(folder) {
            return Err(StoreError::InvalidKey(folder.to_string()));
        }
        let dir = self.root.join(folder);
        if !dir.is_dir() {
            return Err(StoreError::NotFound(folder.to_string()));
        }

        let mut objects = Vec::new();
        for entry in std::fs::read_dir(&dir).map_err(io_err(&dir))?.flatten() {
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with('.') {
                continue;
            }
            let Ok(meta) = entry.metadata() else { continue };
            if !meta.is_file() {
                continue;
            }
            let modified = meta
                .modified()
                .ok()
                .map(|t| chrono::DateTime::<chrono::Utc>::from(t).to_rfc3339())
                .unwrap_or_default();
            objects.push(ObjectInfo {
                name,
                size: meta.len(),
                modified,
            });
        }
        objects.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(objects)
    }

    /// First capture counter for this run: one past the highest folder
    /// counter in storage, or `baseline` when none exist or the scan fails.
    pub fn resume_counter(&self, baseline: u32) -> u32 {
        match self.list_folders() {
            Ok(folders) => {
                let next = naming::next_counter(folders.iter().map(String::as_str), baseline);
                debug!("Scanned {} folder(s) in {}", folders.len(), self.root.display());
                info!("Capture counter resumes at {next}");
                next
            }
            Err(e) => {
                warn!("Cannot scan storage for capture counter ({e}); using baseline {baseline}");
                baseline
            }
        }
    }
}
