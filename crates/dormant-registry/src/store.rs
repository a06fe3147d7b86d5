//! Durable storage for the encoded job document.
//!
//! A store only moves opaque bytes. Encoding lives in [`crate::codec`].

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::RegistryError;

/// Somewhere the job document can be read from and replaced in full.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// Current contents, or `None` if nothing has been written yet.
    async fn load(&self) -> Result<Option<Vec<u8>>, RegistryError>;

    /// Replace the contents. Readers never observe a partial write.
    async fn replace(&self, contents: Vec<u8>) -> Result<(), RegistryError>;
}

/// Store backed by a single file, replaced via write-to-temp and rename.
#[derive(Debug, Clone)]
pub struct FileStore {
    path: PathBuf,
}

impl FileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl SnapshotStore for FileStore {
    async fn load(&self) -> Result<Option<Vec<u8>>, RegistryError> {
        match fs::read(&self.path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn replace(&self, contents: Vec<u8>) -> Result<(), RegistryError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let temp_path = self.path.with_extension("tmp");
        let mut file = fs::File::create(&temp_path).await?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mut perms = file.metadata().await?.permissions();
            perms.set_mode(0o600);
            file.set_permissions(perms).await?;
        }

        file.write_all(&contents).await?;
        file.sync_all().await?;
        fs::rename(&temp_path, &self.path).await?;

        debug!(path = %self.path.display(), bytes = contents.len(), "replaced job document");
        Ok(())
    }
}

/// In-memory store for tests and ephemeral registries.
#[derive(Debug, Default)]
pub struct MemoryStore {
    contents: Mutex<Option<Vec<u8>>>,
    writes: AtomicUsize,
    fail_writes: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store that starts out holding `contents`.
    pub fn with_contents(contents: Vec<u8>) -> Self {
        Self {
            contents: Mutex::new(Some(contents)),
            ..Self::default()
        }
    }

    /// Last successfully written contents.
    pub fn contents(&self) -> Option<Vec<u8>> {
        self.contents.lock().clone()
    }

    /// Number of successful writes.
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// Make subsequent writes fail with an I/O error.
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl SnapshotStore for MemoryStore {
    async fn load(&self) -> Result<Option<Vec<u8>>, RegistryError> {
        Ok(self.contents())
    }

    async fn replace(&self, contents: Vec<u8>) -> Result<(), RegistryError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(std::io::Error::other("simulated write failure").into());
        }
        *self.contents.lock() = Some(contents);
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
