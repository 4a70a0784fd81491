use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

pub const MIN_TMP_TTL_MS: u64 = 60 * 1000;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FsSettings {
    // file-system name, part of the coordination base path and temp paths
    pub name: String,
    // client id, owner of content locks taken by this process
    pub id: String,
    pub coordination: CoordinationConfig,
    #[serde(default)]
    pub tmp: TmpConfig,
    #[serde(default = "default_upload_threads")]
    pub upload_threads: usize,
    #[serde(default = "default_download_timeout_ms")]
    pub download_timeout_ms: u64,
    pub containers: Vec<Container>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CoordinationConfig {
    #[serde(default)]
    pub endpoints: Vec<String>,
    #[serde(default = "default_zk_path")]
    pub zk_path: String,
    #[serde(default = "default_lock_timeout_ms")]
    pub lock_timeout_ms: u64,
    #[serde(default = "default_lease_ttl")]
    pub lock_lease_ttl_secs: i64,
    #[serde(default = "default_lock_prefix")]
    pub lock_prefix: String,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl Default for CoordinationConfig {
    fn default() -> Self {
        Self {
            endpoints: Vec::new(),
            zk_path: default_zk_path(),
            lock_timeout_ms: default_lock_timeout_ms(),
            lock_lease_ttl_secs: default_lease_ttl(),
            lock_prefix: default_lock_prefix(),
            username: None,
            password: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TmpConfig {
    #[serde(default = "default_tmp_path")]
    pub path: PathBuf,
    #[serde(default = "default_tmp_ttl_ms")]
    pub ttl_ms: u64,
    #[serde(default = "default_true")]
    pub clean: bool,
}

impl Default for TmpConfig {
    fn default() -> Self {
        Self {
            path: default_tmp_path(),
            ttl_ms: default_tmp_ttl_ms(),
            clean: true,
        }
    }
}

/// Physical backend bound to one domain.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Container {
    pub domain: String,
    #[serde(flatten)]
    pub kind: ContainerKind,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ContainerKind {
    Local {
        root: PathBuf,
    },
    S3 {
        bucket: String,
        region: Option<String>,
        endpoint: Option<String>,
        prefix: Option<String>,
    },
}

fn default_upload_threads() -> usize {
    4
}

fn default_download_timeout_ms() -> u64 {
    30_000
}

fn default_zk_path() -> String {
    "/coordfs".to_string()
}

fn default_lock_timeout_ms() -> u64 {
    60_000
}

fn default_lease_ttl() -> i64 {
    60
}

fn default_lock_prefix() -> String {
    "/__locks".to_string()
}

fn default_tmp_path() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("coordfs")
}

fn default_tmp_ttl_ms() -> u64 {
    15 * 60 * 1000
}

fn default_true() -> bool {
    true
}

impl FsSettings {
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() || self.name.contains('/') {
            bail!("invalid file-system name {:?}", self.name);
        }
        if self.id.trim().is_empty() {
            bail!("client id must not be empty");
        }
        if !self.coordination.zk_path.starts_with('/') {
            bail!(
                "coordination path must be absolute: {}",
                self.coordination.zk_path
            );
        }
        if self.upload_threads == 0 {
            bail!("upload_threads must be at least 1");
        }
        if self.tmp.clean && self.tmp.ttl_ms < MIN_TMP_TTL_MS {
            bail!(
                "tmp.ttl_ms must be at least {MIN_TMP_TTL_MS} when cleaning is enabled, got {}",
                self.tmp.ttl_ms
            );
        }
        if self.containers.is_empty() {
            bail!("no containers configured");
        }
        let mut seen = HashSet::new();
        for c in &self.containers {
            if c.domain.is_empty() || c.domain.contains('/') {
                bail!("invalid domain name {:?}", c.domain);
            }
            if !seen.insert(c.domain.as_str()) {
                bail!("domain {} configured twice", c.domain);
            }
        }
        Ok(())
    }

    /// Coordination-tree node holding every domain of this file system.
    pub fn base_path(&self) -> String {
        let zk = self.coordination.zk_path.trim_end_matches('/');
        format!("{zk}/{}", self.name)
    }

    /// Process-local staging root.
    pub fn temp_root(&self) -> PathBuf {
        self.tmp.path.join("fs").join(&self.name)
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.coordination.lock_timeout_ms)
    }

    pub fn tmp_ttl(&self) -> Duration {
        Duration::from_millis(self.tmp.ttl_ms)
    }

    pub fn download_timeout(&self) -> Duration {
        Duration::from_millis(self.download_timeout_ms)
    }

    pub fn domains(&self) -> Vec<String> {
        self.containers.iter().map(|c| c.domain.clone()).collect()
    }
}

pub fn load_config(path: &str) -> Result<FsSettings> {
    let content =
        fs::read_to_string(path).with_context(|| format!("Failed to read config from {path}"))?;
    let cfg: FsSettings = serde_yaml::from_str(&content).context("Failed to parse YAML config")?;
    cfg.validate()
        .with_context(|| format!("Invalid config in {path}"))?;
    Ok(cfg)
}
