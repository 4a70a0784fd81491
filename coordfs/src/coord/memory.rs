//! In-process coordination tree. Shared through an `Arc` it behaves like one
//! coordination service seen by several mounts, which is how the tests model
//! multiple processes.

use super::{CoordError, CoordinationClient, ScopedLock, child_prefix, parent_of};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

type PathMutex = Arc<tokio::sync::Mutex<()>>;
type MutexTable = Arc<Mutex<HashMap<String, PathMutex>>>;

#[derive(Default)]
pub struct MemoryCoordinator {
    nodes: Mutex<BTreeMap<String, Vec<u8>>>,
    // entries live only while a lock is held or awaited
    mutexes: MutexTable,
}

/// Removes `path`'s entry when `mutex` is the last handle besides the table's.
fn forget_if_idle(table: &MutexTable, path: &str, mutex: PathMutex) {
    let Ok(mut mutexes) = table.lock() else {
        return;
    };
    let idle = Arc::strong_count(&mutex) == 2
        && mutexes.get(path).is_some_and(|m| Arc::ptr_eq(m, &mutex));
    if idle {
        mutexes.remove(path);
    }
}

impl MemoryCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    fn node_exists(nodes: &BTreeMap<String, Vec<u8>>, path: &str) -> bool {
        path == "/" || nodes.contains_key(path)
    }

    fn descendants<'a>(
        nodes: &'a BTreeMap<String, Vec<u8>>,
        path: &str,
    ) -> impl Iterator<Item = &'a String> + 'a {
        let prefix = child_prefix(path);
        nodes
            .range(prefix.clone()..)
            .map(|(k, _)| k)
            .take_while(move |k| k.starts_with(&prefix))
    }

    fn mutex_for(&self, path: &str) -> Result<PathMutex, CoordError> {
        let mut mutexes = self
            .mutexes
            .lock()
            .map_err(|_| CoordError::Other("mutex table poisoned".into()))?;
        Ok(mutexes
            .entry(path.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone())
    }

    fn nodes(&self) -> Result<std::sync::MutexGuard<'_, BTreeMap<String, Vec<u8>>>, CoordError> {
        self.nodes
            .lock()
            .map_err(|_| CoordError::Other("node table poisoned".into()))
    }
}

#[async_trait]
impl CoordinationClient for MemoryCoordinator {
    async fn exists(&self, path: &str) -> Result<bool, CoordError> {
        Ok(Self::node_exists(&*self.nodes()?, path))
    }

    async fn create_recursive(&self, path: &str) -> Result<(), CoordError> {
        let mut nodes = self.nodes()?;
        let mut current = String::new();
        for seg in path.split('/').filter(|s| !s.is_empty()) {
            current.push('/');
            current.push_str(seg);
            nodes.entry(current.clone()).or_default();
        }
        Ok(())
    }

    async fn create(&self, path: &str, data: &[u8]) -> Result<(), CoordError> {
        let mut nodes = self.nodes()?;
        if Self::node_exists(&nodes, path) {
            return Err(CoordError::NodeExists(path.to_string()));
        }
        if let Some(parent) = parent_of(path) {
            if !Self::node_exists(&nodes, parent) {
                return Err(CoordError::NoNode(parent.to_string()));
            }
        }
        nodes.insert(path.to_string(), data.to_vec());
        Ok(())
    }

    async fn get_data(&self, path: &str) -> Result<Option<Vec<u8>>, CoordError> {
        Ok(self.nodes()?.get(path).cloned())
    }

    async fn set_data(&self, path: &str, data: &[u8]) -> Result<(), CoordError> {
        let mut nodes = self.nodes()?;
        match nodes.get_mut(path) {
            Some(value) => {
                *value = data.to_vec();
                Ok(())
            }
            None => Err(CoordError::NoNode(path.to_string())),
        }
    }

    async fn delete(&self, path: &str, recursive: bool) -> Result<bool, CoordError> {
        let mut nodes = self.nodes()?;
        if !nodes.contains_key(path) {
            return Ok(false);
        }
        let children: Vec<String> = Self::descendants(&nodes, path).cloned().collect();
        if !children.is_empty() && !recursive {
            return Err(CoordError::NotEmpty(path.to_string()));
        }
        for child in children {
            nodes.remove(&child);
        }
        nodes.remove(path);
        Ok(true)
    }

    async fn list_children(&self, path: &str) -> Result<Vec<String>, CoordError> {
        let nodes = self.nodes()?;
        if !Self::node_exists(&nodes, path) {
            return Err(CoordError::NoNode(path.to_string()));
        }
        let prefix = child_prefix(path);
        Ok(Self::descendants(&nodes, path)
            .filter_map(|k| {
                let rest = &k[prefix.len()..];
                (!rest.contains('/')).then(|| rest.to_string())
            })
            .collect())
    }

    async fn acquire_mutex(
        &self,
        path: &str,
        timeout: Duration,
    ) -> Result<ScopedLock, CoordError> {
        let mutex = self.mutex_for(path)?;
        match tokio::time::timeout(timeout, mutex.clone().lock_owned()).await {
            Ok(guard) => {
                let table = self.mutexes.clone();
                let owned_path = path.to_string();
                Ok(ScopedLock::new(path, async move {
                    drop(guard);
                    forget_if_idle(&table, &owned_path, mutex);
                    Ok(())
                }))
            }
            Err(_) => {
                forget_if_idle(&self.mutexes, path, mutex);
                Err(CoordError::LockTimeout {
                    path: path.to_string(),
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
        }
    }
}
