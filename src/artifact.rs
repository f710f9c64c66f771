//! Transient upload storage.
//!
//! An uploaded image lives on local disk only for the duration of the request
//! that created it. [`ArtifactStore::save`] validates and writes the bytes;
//! [`ArtifactStore::delete`] removes them and is a no-op when the file is
//! already gone. [`ArtifactGuard`] ties the file's lifetime to a scope: when
//! the guard is dropped (including when the request future is cancelled) the
//! file is removed.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{Context, Result};
use uuid::Uuid;

use crate::error::IngestError;

/// A stored upload, owned by exactly one request.
#[derive(Debug, Clone)]
pub struct ArtifactHandle {
    path: PathBuf,
    file_name: String,
    original_name: String,
    media_type: String,
    size: usize,
}

impl ArtifactHandle {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Generated on-disk name (`receipt-<millis>-<random>.<ext>`).
    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    /// Name the client declared for the upload.
    pub fn original_name(&self) -> &str {
        &self.original_name
    }

    pub fn media_type(&self) -> &str {
        &self.media_type
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub async fn read(&self) -> Result<Vec<u8>> {
        tokio::fs::read(&self.path)
            .await
            .with_context(|| format!("Failed to read artifact {}", self.path.display()))
    }
}

/// Directory-backed store for in-flight uploads.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    dir: PathBuf,
    max_bytes: usize,
}

impl ArtifactStore {
    pub fn new(dir: impl Into<PathBuf>, max_bytes: usize) -> Self {
        Self {
            dir: dir.into(),
            max_bytes,
        }
    }

    pub fn max_bytes(&self) -> usize {
        self.max_bytes
    }

    /// Checks media type and size without touching the disk.
    pub fn validate(&self, size: usize, media_type: &str) -> Result<(), IngestError> {
        if !is_image_type(media_type) {
            return Err(IngestError::InvalidMediaType(media_type.to_string()));
        }
        if size > self.max_bytes {
            return Err(IngestError::SizeExceeded {
                limit: self.max_bytes,
            });
        }
        Ok(())
    }

    /// Validates and writes an upload under a collision-resistant name.
    ///
    /// The returned guard owns the file. If this future is dropped before it
    /// resolves, the file is removed once the write on the blocking pool
    /// finishes, so a cancelled save never leaves anything behind.
    pub async fn save(
        &self,
        bytes: &[u8],
        declared_name: &str,
        media_type: &str,
    ) -> Result<ArtifactGuard, IngestError> {
        self.validate(bytes.len(), media_type)?;

        tokio::fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("Failed to create upload directory {}", self.dir.display()))?;

        let file_name = generate_file_name(declared_name);
        let path = self.dir.join(&file_name);

        let pending = PendingWrite::new(path.clone());
        let state = pending.state.clone();
        let contents = bytes.to_vec();
        let write_path = path.clone();

        tokio::task::spawn_blocking(move || {
            write_new_file(&write_path, &contents)?;
            let mut state = lock_state(&state);
            if state.abandoned {
                remove_quietly(&write_path);
            } else {
                state.written = true;
            }
            Ok::<(), anyhow::Error>(())
        })
        .await
        .context("Artifact write task failed")??;

        pending.disarm();
        Ok(ArtifactGuard::new(ArtifactHandle {
            path,
            file_name,
            original_name: declared_name.to_string(),
            media_type: media_type.to_string(),
            size: bytes.len(),
        }))
    }

    /// Removes an artifact. Deleting a missing file succeeds.
    pub async fn delete(&self, handle: &ArtifactHandle) -> Result<()> {
        match tokio::fs::remove_file(&handle.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(anyhow::Error::new(e)
                .context(format!("Failed to delete artifact {}", handle.path.display()))),
        }
    }

    /// Number of artifacts currently on disk.
    pub async fn count(&self) -> Result<usize> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };

        let mut count = 0;
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_file() {
                count += 1;
            }
        }
        Ok(count)
    }
}

/// Scoped ownership of an artifact.
///
/// Call [`ArtifactGuard::cleanup`] on normal exit paths; `Drop` covers
/// everything else, including cancellation of the owning future.
#[derive(Debug)]
pub struct ArtifactGuard {
    handle: ArtifactHandle,
    removed: bool,
}

impl ArtifactGuard {
    fn new(handle: ArtifactHandle) -> Self {
        Self {
            handle,
            removed: false,
        }
    }

    pub fn handle(&self) -> &ArtifactHandle {
        &self.handle
    }

    pub async fn cleanup(mut self, store: &ArtifactStore) -> Result<()> {
        store.delete(&self.handle).await?;
        self.removed = true;
        Ok(())
    }
}

impl Drop for ArtifactGuard {
    fn drop(&mut self) {
        if self.removed {
            return;
        }
        match std::fs::remove_file(&self.handle.path) {
            Ok(()) => {
                tracing::debug!(artifact = %self.handle.file_name, "artifact removed on drop");
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                tracing::warn!(artifact = %self.handle.file_name, error = %e, "failed to remove artifact");
            }
        }
    }
}

/// Progress of a write running on the blocking pool.
#[derive(Debug, Default)]
struct WriteState {
    /// The awaiting future was dropped.
    abandoned: bool,
    /// The file is complete and owned by the awaiting future.
    written: bool,
}

/// Removes a file whose save was cancelled mid-write.
///
/// Whichever side observes the other under the lock does the removal: the
/// blocking write if it finishes after cancellation, this guard otherwise.
struct PendingWrite {
    path: PathBuf,
    state: Arc<Mutex<WriteState>>,
    armed: bool,
}

impl PendingWrite {
    fn new(path: PathBuf) -> Self {
        Self {
            path,
            state: Arc::new(Mutex::new(WriteState::default())),
            armed: true,
        }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for PendingWrite {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut state = lock_state(&self.state);
        state.abandoned = true;
        if state.written {
            remove_quietly(&self.path);
        }
    }
}

fn lock_state(state: &Mutex<WriteState>) -> MutexGuard<'_, WriteState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Creates `path` (never clobbering an existing file) and writes `bytes`.
/// A partially written file is removed before the error is returned.
fn write_new_file(path: &Path, bytes: &[u8]) -> Result<()> {
    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .with_context(|| format!("Failed to create artifact {}", path.display()))?;

    if let Err(e) = file.write_all(bytes).and_then(|_| file.flush()) {
        drop(file);
        remove_quietly(path);
        return Err(anyhow::Error::new(e).context("Failed to write artifact"));
    }
    Ok(())
}

fn remove_quietly(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "failed to remove artifact");
        }
    }
}

/// True for `image/*`, ignoring parameters and case.
pub fn is_image_type(media_type: &str) -> bool {
    let essence = media_type
        .split(';')
        .next()
        .map(|s| s.trim())
        .unwrap_or("")
        .to_ascii_lowercase();
    essence
        .strip_prefix("image/")
        .is_some_and(|subtype| !subtype.is_empty())
}

fn generate_file_name(declared_name: &str) -> String {
    let millis = chrono::Utc::now().timestamp_millis();
    let suffix = Uuid::new_v4().simple().to_string();
    let ext = Path::new(declared_name)
        .extension()
        .and_then(|e| e.to_str())
        .filter(|e| !e.is_empty() && e.len() <= 8 && e.chars().all(|c| c.is_ascii_alphanumeric()))
        .map(|e| format!(".{}", e.to_ascii_lowercase()))
        .unwrap_or_default();
    format!("receipt-{}-{}{}", millis, &suffix[..12], ext)
}
