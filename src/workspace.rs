use std::fs::{File, OpenOptions};
use std::io::Write as _;
use std::path::{Path, PathBuf};

use anyhow::Context as _;
use fs2::FileExt as _;

use crate::error::StateError;

/// On-disk layout shared by every stage. Stages only talk to each other
/// through the files below.
#[derive(Debug, Clone)]
pub struct Workspace {
    root: PathBuf,
}

impl Workspace {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn state_dir(&self, slug: &str) -> PathBuf {
        self.root.join("state").join(slug)
    }

    pub fn status_path(&self, slug: &str) -> PathBuf {
        self.state_dir(slug).join("download_status.json")
    }

    pub fn markers_path(&self, slug: &str) -> PathBuf {
        self.state_dir(slug).join("processed.json")
    }

    fn lock_path(&self, slug: &str) -> PathBuf {
        self.state_dir(slug).join(".lock")
    }

    pub fn raw_dir(&self, slug: &str) -> PathBuf {
        self.root.join("raw").join(slug)
    }

    pub fn processed_dir(&self, slug: &str) -> PathBuf {
        self.root.join("processed").join(slug)
    }

    pub fn volumes_dir(&self) -> PathBuf {
        self.root.join("volumes")
    }

    /// Takes the per-series advisory lock. Fails fast when another run
    /// (in this or another process) already holds it.
    pub fn lock_series(&self, slug: &str) -> anyhow::Result<SeriesLock> {
        let state_dir = self.state_dir(slug);
        std::fs::create_dir_all(&state_dir)
            .with_context(|| format!("create state dir: {}", state_dir.display()))?;

        let path = self.lock_path(slug);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .with_context(|| format!("open lock file: {}", path.display()))?;

        if let Err(err) = file.try_lock_exclusive() {
            if err.kind() == fs2::lock_contended_error().kind() {
                return Err(StateError::Locked {
                    slug: slug.to_owned(),
                }
                .into());
            }
            return Err(err).with_context(|| format!("lock: {}", path.display()));
        }

        tracing::debug!(slug, lock = %path.display(), "acquired series lock");
        Ok(SeriesLock { file, path })
    }
}

#[derive(Debug)]
pub struct SeriesLock {
    file: File,
    path: PathBuf,
}

impl SeriesLock {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for SeriesLock {
    fn drop(&mut self) {
        let _ = fs2::FileExt::unlock(&self.file);
    }
}

pub fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> anyhow::Result<Option<T>> {
    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err).with_context(|| format!("read: {}", path.display())),
    };
    let value = serde_json::from_slice(&bytes)
        .with_context(|| format!("parse json: {}", path.display()))?;
    Ok(Some(value))
}

pub fn write_json_atomic<T: serde::Serialize>(path: &Path, value: &T) -> anyhow::Result<()> {
    let data = serde_json::to_vec_pretty(value).context("serialize json")?;
    write_atomic(path, &data)
}

/// Write-temp-then-rename in the target directory. Readers see either the old
/// or the new contents, never a partial file.
pub fn write_atomic(path: &Path, data: &[u8]) -> anyhow::Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| anyhow::anyhow!("path has no parent: {}", path.display()))?;
    std::fs::create_dir_all(parent)
        .with_context(|| format!("create parent dir: {}", parent.display()))?;

    let file_name = path
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| anyhow::anyhow!("path has no file name: {}", path.display()))?;
    let tmp_path = parent.join(format!(
        ".{file_name}.tmp.{}",
        uuid::Uuid::new_v4().simple()
    ));

    let result = (|| {
        let mut file = OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&tmp_path)
            .with_context(|| format!("create tmp: {}", tmp_path.display()))?;
        file.write_all(data)
            .with_context(|| format!("write tmp: {}", tmp_path.display()))?;
        file.sync_all()
            .with_context(|| format!("sync tmp: {}", tmp_path.display()))?;
        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("rename tmp to final: {}", path.display()))
    })();

    if result.is_err() {
        let _ = std::fs::remove_file(&tmp_path);
    }
    result
}

/// Removes a directory tree; a missing directory is not an error.
pub fn remove_dir_if_exists(path: &Path) -> anyhow::Result<()> {
    match std::fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err).with_context(|| format!("remove dir: {}", path.display())),
    }
}

pub fn remove_file_if_exists(path: &Path) -> anyhow::Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err).with_context(|| format!("remove file: {}", path.display())),
    }
}

pub fn sha256_hex(data: &[u8]) -> String {
    use sha2::Digest as _;
    hex::encode(sha2::Sha256::digest(data))
}
