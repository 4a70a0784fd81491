//! Inode CRUD over the coordination tree.
//!
//! Layout: `{base}/{domain}` is the domain root and every other inode lives
//! at `{base}/{domain}{relative path}`. Structural mutations hold the
//! coordination mutex of the node being changed (update/delete) or of its
//! immediate parent (create); reads take no lock.

use crate::cadapter::PathResolver;
use crate::cadapter::path::{normalize_path, segments};
use crate::coord::lock::release_quietly;
use crate::coord::{CoordError, CoordinationClient, LockManager, join};
use crate::error::{FsError, Result};
use crate::meta::inode::{Inode, InodeType, next_timestamp};
use log::{debug, info};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, RwLock};

pub struct InodeStore {
    client: Arc<dyn CoordinationClient>,
    locks: LockManager,
    roots: RwLock<HashMap<String, Inode>>,
}

impl InodeStore {
    pub fn new(client: Arc<dyn CoordinationClient>, locks: LockManager) -> Self {
        Self {
            client,
            locks,
            roots: RwLock::new(HashMap::new()),
        }
    }

    pub fn locks(&self) -> &LockManager {
        &self.locks
    }

    pub fn base_path(&self) -> &str {
        self.locks.base_path()
    }

    /// Registers every domain under a single root-lock acquisition. Existing
    /// roots are read back, so repeated bootstraps keep their identity.
    pub async fn bootstrap(&self, domains: &[(String, Arc<dyn PathResolver>)]) -> Result<()> {
        self.client.create_recursive(self.base_path()).await?;
        let lock = self.locks.root_lock().await?;
        let result: Result<()> = async {
            for (domain, resolver) in domains {
                let root = self.register_domain(domain, resolver.as_ref()).await?;
                self.roots
                    .write()
                    .map_err(|_| FsError::Io(std::io::Error::other("domain table poisoned")))?
                    .insert(domain.clone(), root);
            }
            Ok(())
        }
        .await;
        release_quietly(lock).await;
        result
    }

    async fn register_domain(&self, domain: &str, resolver: &dyn PathResolver) -> Result<Inode> {
        let zk = self.locks.domain_path(domain);
        let existing = self.client.get_data(&zk).await?;
        if let Some(bytes) = existing.as_deref().filter(|b| !b.is_empty()) {
            let root = Inode::decode(bytes)?;
            info!("domain {domain} already registered (root {})", root.uuid);
            return Ok(root);
        }
        let info = resolver.resolve(domain, "/")?;
        let root = Inode::new(
            InodeType::Directory,
            domain,
            domain,
            "/",
            &zk,
            None,
            info.path_config(),
        );
        if existing.is_some() {
            self.client.set_data(&zk, &root.encode()?).await?;
        } else {
            self.client.create(&zk, &root.encode()?).await?;
        }
        info!("registered domain {domain} at {zk} (root {})", root.uuid);
        Ok(root)
    }

    pub fn domain_root(&self, domain: &str) -> Result<Inode> {
        let roots = self
            .roots
            .read()
            .map_err(|_| FsError::Io(std::io::Error::other("domain table poisoned")))?;
        roots
            .get(domain)
            .cloned()
            .ok_or_else(|| FsError::DomainNotRegistered(domain.to_string()))
    }

    pub fn domains(&self) -> Vec<String> {
        let mut domains: Vec<String> = match self.roots.read() {
            Ok(roots) => roots.keys().cloned().collect(),
            Err(poisoned) => poisoned.into_inner().keys().cloned().collect(),
        };
        domains.sort();
        domains
    }

    /// Coordination-tree path of `relative` inside `domain`.
    pub fn zk_path(&self, domain: &str, relative: &str) -> Result<String> {
        let root = self.domain_root(domain)?;
        let relative = normalize_path(relative)?;
        if relative == "/" {
            Ok(root.zk_path)
        } else {
            Ok(format!("{}{relative}", root.zk_path))
        }
    }

    async fn read(&self, zk_path: &str) -> Result<Option<Inode>> {
        match self.client.get_data(zk_path).await? {
            Some(bytes) if !bytes.is_empty() => Ok(Some(Inode::decode(&bytes)?)),
            _ => Ok(None),
        }
    }

    pub async fn get(&self, domain: &str, relative: &str) -> Result<Option<Inode>> {
        let zk = self.zk_path(domain, relative)?;
        self.read(&zk).await
    }

    pub async fn get_by_zk_path(&self, zk_path: &str) -> Result<Option<Inode>> {
        self.read(zk_path).await
    }

    /// Walks from the domain root creating missing directories, each under
    /// the lock of its own parent. An existing node of the requested type is
    /// returned as is.
    pub async fn create_path(
        &self,
        domain: &str,
        relative: &str,
        inode_type: InodeType,
        resolver: &dyn PathResolver,
    ) -> Result<Inode> {
        self.create_inner(domain, relative, inode_type, resolver, false)
            .await
    }

    /// Like [`InodeStore::create_path`] but fails with `PathConflict` when
    /// the leaf already exists.
    pub async fn create_new(
        &self,
        domain: &str,
        relative: &str,
        inode_type: InodeType,
        resolver: &dyn PathResolver,
    ) -> Result<Inode> {
        self.create_inner(domain, relative, inode_type, resolver, true)
            .await
    }

    async fn create_inner(
        &self,
        domain: &str,
        relative: &str,
        inode_type: InodeType,
        resolver: &dyn PathResolver,
        exclusive: bool,
    ) -> Result<Inode> {
        let root = self.domain_root(domain)?;
        let relative = normalize_path(relative)?;
        if relative == "/" {
            return match inode_type {
                InodeType::Directory => Ok(root),
                other => Err(FsError::conflict(
                    format!("{domain}:/"),
                    format!("domain root is a directory, not {other:?}"),
                )),
            };
        }

        let segs: Vec<&str> = segments(&relative).collect();
        let mut parent = root;
        let mut current = String::new();
        for (i, seg) in segs.iter().enumerate() {
            current.push('/');
            current.push_str(seg);
            let leaf = i + 1 == segs.len();
            let wanted = if leaf {
                inode_type
            } else {
                InodeType::Directory
            };
            let zk = join(&parent.zk_path, seg);
            let (node, created) = match self.read(&zk).await? {
                Some(existing) => (existing, false),
                None => {
                    self.create_child(&parent, seg, &current, wanted, resolver)
                        .await?
                }
            };
            if leaf && exclusive && !created {
                return Err(FsError::conflict(
                    format!("{domain}:{current}"),
                    "already exists",
                ));
            }
            if node.inode_type() != wanted {
                return Err(FsError::conflict(
                    format!("{domain}:{current}"),
                    format!("exists as {:?}, expected {wanted:?}", node.inode_type()),
                ));
            }
            parent = node;
        }
        Ok(parent)
    }

    async fn create_child(
        &self,
        parent: &Inode,
        name: &str,
        relative: &str,
        inode_type: InodeType,
        resolver: &dyn PathResolver,
    ) -> Result<(Inode, bool)> {
        let zk = join(&parent.zk_path, name);
        let lock = self.locks.acquire(&parent.zk_path).await?;
        let result: Result<(Inode, bool)> = async {
            // someone may have created it while we waited for the lock
            if let Some(existing) = self.read(&zk).await? {
                return Ok((existing, false));
            }
            let info = resolver.resolve(&parent.domain, relative)?;
            let inode = Inode::new(
                inode_type,
                &parent.domain,
                name,
                relative,
                &zk,
                Some(parent.zk_path.clone()),
                info.path_config(),
            );
            self.client.create(&zk, &inode.encode()?).await?;
            debug!("created {inode_type:?} {zk}");
            Ok((inode, true))
        }
        .await;
        release_quietly(lock).await;
        result
    }

    /// Persists `inode` if it is not older than the stored record and
    /// returns it with a fresh `update_timestamp`.
    pub async fn update(&self, inode: Inode) -> Result<Inode> {
        let lock = self.locks.acquire(&inode.zk_path).await?;
        let result: Result<Inode> = async move {
            let current = self
                .read(&inode.zk_path)
                .await?
                .ok_or_else(|| FsError::PathNotFound(inode.zk_path.clone()))?;
            if current.uuid != inode.uuid || current.inode_type() != inode.inode_type() {
                return Err(FsError::conflict(
                    inode.zk_path.clone(),
                    format!("stored node {} is not inode {}", current.uuid, inode.uuid),
                ));
            }
            if current.update_timestamp > inode.update_timestamp {
                return Err(FsError::StaleInode {
                    path: inode.zk_path.clone(),
                    local: inode.update_timestamp,
                    stored: current.update_timestamp,
                });
            }
            let mut inode = inode;
            inode.update_timestamp = next_timestamp(current.update_timestamp);
            self.client.set_data(&inode.zk_path, &inode.encode()?).await?;
            Ok(inode)
        }
        .await;
        release_quietly(lock).await;
        result
    }

    /// `Ok(false)` when nothing exists at the path. Domain roots are never deleted.
    pub async fn delete(&self, domain: &str, relative: &str, recursive: bool) -> Result<bool> {
        let relative = normalize_path(relative)?;
        if relative == "/" {
            return Err(FsError::RootNotDeletable {
                domain: domain.to_string(),
            });
        }
        let zk = self.zk_path(domain, &relative)?;
        let lock = match self.locks.acquire(&zk).await {
            Ok(lock) => lock,
            Err(FsError::PathNotFound(_)) => return Ok(false),
            Err(e) => return Err(e),
        };
        let result = self.client.delete(&zk, recursive).await.map_err(FsError::from);
        release_quietly(lock).await;
        if let Ok(true) = result {
            debug!("deleted {zk} (recursive: {recursive})");
        }
        result
    }

    /// Lock-free walk. Files and archives are always returned; directories
    /// are descended into when `recursive`, returned otherwise.
    pub async fn list(&self, domain: &str, relative: &str, recursive: bool) -> Result<Vec<Inode>> {
        let start = self
            .get(domain, relative)
            .await?
            .ok_or_else(|| FsError::PathNotFound(format!("{domain}:{relative}")))?;
        if !start.is_directory() {
            return Ok(vec![start]);
        }
        let mut out = Vec::new();
        let mut pending = VecDeque::from([start.zk_path]);
        while let Some(dir) = pending.pop_front() {
            let children = match self.client.list_children(&dir).await {
                Ok(c) => c,
                Err(CoordError::NoNode(_)) => continue,
                Err(e) => return Err(e.into()),
            };
            for name in children {
                let zk = join(&dir, &name);
                // removed between listing and reading
                let Some(node) = self.read(&zk).await? else {
                    continue;
                };
                if node.is_directory() && recursive {
                    pending.push_back(zk);
                } else {
                    out.push(node);
                }
            }
        }
        Ok(out)
    }
}
