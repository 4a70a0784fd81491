//! Process-local staging area for file content.

use crate::cadapter::path::normalize_path;
use crate::error::{FsError, Result};
use log::debug;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tokio::fs;

pub struct TempStore {
    root: PathBuf,
}

impl TempStore {
    pub async fn open<P: AsRef<Path>>(root: P) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root).await?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub async fn create_tmp_dir(&self, relative: &str) -> Result<PathBuf> {
        let relative = normalize_path(relative)?;
        let dir = self.root.join(relative.trim_start_matches('/'));
        fs::create_dir_all(&dir).await?;
        Ok(dir)
    }

    /// Creates an empty file under `dir` (relative to the root). Without a
    /// name a unique one is generated.
    pub async fn create_tmp_file(&self, dir: Option<&str>, name: Option<&str>) -> Result<PathBuf> {
        let dir = match dir {
            Some(d) => self.create_tmp_dir(d).await?,
            None => self.root.clone(),
        };
        let name = match name {
            Some(n) if n.is_empty() || n.contains('/') || n == "." || n == ".." => {
                return Err(FsError::invalid_path(n, "not a valid file name"));
            }
            Some(n) => n.to_string(),
            None => format!("{}.tmp", uuid::Uuid::new_v4()),
        };
        let path = dir.join(name);
        fs::File::create(&path).await?;
        Ok(path)
    }

    /// Deletes every file under the root last modified more than `ttl` ago.
    /// Directories are kept.
    pub async fn sweep(&self, ttl: Duration) -> Result<usize> {
        let now = SystemTime::now();
        let mut removed = 0;
        let mut pending = vec![self.root.clone()];
        while let Some(dir) = pending.pop() {
            let mut entries = match fs::read_dir(&dir).await {
                Ok(e) => e,
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            while let Some(entry) = entries.next_entry().await? {
                let meta = match entry.metadata().await {
                    Ok(m) => m,
                    Err(e) if e.kind() == ErrorKind::NotFound => continue,
                    Err(e) => return Err(e.into()),
                };
                if meta.is_dir() {
                    pending.push(entry.path());
                    continue;
                }
                let age = now
                    .duration_since(meta.modified()?)
                    .unwrap_or(Duration::ZERO);
                if age > ttl {
                    match fs::remove_file(entry.path()).await {
                        Ok(()) => {
                            debug!("evicted {}", entry.path().display());
                            removed += 1;
                        }
                        Err(e) if e.kind() == ErrorKind::NotFound => {}
                        Err(e) => return Err(e.into()),
                    }
                }
            }
        }
        Ok(removed)
    }
}
