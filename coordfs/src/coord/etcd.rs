//! etcd-backed coordination client.
//!
//! Every tree node is a key whose value is the node data; the children of
//! `/a/b` are the keys under `/a/b/` with no further separator. Mutexes go
//! through the etcd lock service under a separate key prefix, each
//! acquisition owning a lease that is kept alive while held and revoked on
//! release, so a crashed holder's lock expires with its lease.

use super::{CoordError, CoordinationClient, ScopedLock, child_prefix, parent_of};
use crate::config::CoordinationConfig;
use async_trait::async_trait;
use etcd_client::{
    Client, Compare, CompareOp, ConnectOptions, DeleteOptions, GetOptions, KvClient, LeaseClient,
    LockOptions, Txn, TxnOp,
};
use log::{debug, info, warn};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub struct EtcdCoordinator {
    client: Client,
    lock_prefix: String,
    lease_ttl: i64,
}

impl EtcdCoordinator {
    pub async fn connect(cfg: &CoordinationConfig) -> Result<Self, CoordError> {
        let options = match (&cfg.username, &cfg.password) {
            (Some(user), Some(password)) => {
                Some(ConnectOptions::new().with_user(user.clone(), password.clone()))
            }
            _ => None,
        };
        let client = Client::connect(cfg.endpoints.clone(), options).await?;
        info!("connected to coordination service at {:?}", cfg.endpoints);
        Ok(Self {
            client,
            lock_prefix: cfg.lock_prefix.clone(),
            lease_ttl: cfg.lock_lease_ttl_secs,
        })
    }

    fn kv(&self) -> KvClient {
        self.client.kv_client()
    }

    fn lock_name(&self, path: &str) -> String {
        format!("{}{}", self.lock_prefix, path)
    }

    async fn put_if_absent(&self, path: &str, data: &[u8]) -> Result<bool, CoordError> {
        let txn = Txn::new()
            .when([Compare::version(path, CompareOp::Equal, 0)])
            .and_then([TxnOp::put(path, data, None)]);
        Ok(self.kv().txn(txn).await?.succeeded())
    }
}

fn spawn_keep_alive(mut lease: LeaseClient, id: i64, ttl: i64, cancel: CancellationToken) {
    let period = Duration::from_secs((ttl / 3).max(1) as u64);
    tokio::spawn(async move {
        let (mut keeper, mut stream) = match lease.keep_alive(id).await {
            Ok(v) => v,
            Err(e) => {
                warn!("could not start keep-alive for lease {id}: {e}");
                return;
            }
        };
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(period) => {
                    if let Err(e) = keeper.keep_alive().await {
                        warn!("keep-alive for lease {id} failed: {e}");
                        break;
                    }
                    match stream.message().await {
                        Ok(Some(_)) => {}
                        Ok(None) => break,
                        Err(e) => {
                            warn!("keep-alive stream for lease {id} failed: {e}");
                            break;
                        }
                    }
                }
            }
        }
    });
}

#[async_trait]
impl CoordinationClient for EtcdCoordinator {
    async fn exists(&self, path: &str) -> Result<bool, CoordError> {
        if path == "/" {
            return Ok(true);
        }
        let resp = self
            .kv()
            .get(path, Some(GetOptions::new().with_count_only()))
            .await?;
        Ok(resp.count() > 0)
    }

    async fn create_recursive(&self, path: &str) -> Result<(), CoordError> {
        let mut current = String::new();
        for seg in path.split('/').filter(|s| !s.is_empty()) {
            current.push('/');
            current.push_str(seg);
            if self.put_if_absent(&current, &[]).await? {
                debug!("created node {current}");
            }
        }
        Ok(())
    }

    async fn create(&self, path: &str, data: &[u8]) -> Result<(), CoordError> {
        let mut compares = vec![Compare::version(path, CompareOp::Equal, 0)];
        let parent = parent_of(path).filter(|p| *p != "/");
        if let Some(parent) = parent {
            compares.push(Compare::version(parent, CompareOp::Greater, 0));
        }
        let txn = Txn::new()
            .when(compares)
            .and_then([TxnOp::put(path, data, None)]);
        if self.kv().txn(txn).await?.succeeded() {
            return Ok(());
        }
        if self.exists(path).await? {
            Err(CoordError::NodeExists(path.to_string()))
        } else {
            Err(CoordError::NoNode(parent.unwrap_or("/").to_string()))
        }
    }

    async fn get_data(&self, path: &str) -> Result<Option<Vec<u8>>, CoordError> {
        let resp = self.kv().get(path, None).await?;
        Ok(resp.kvs().first().map(|kv| kv.value().to_vec()))
    }

    async fn set_data(&self, path: &str, data: &[u8]) -> Result<(), CoordError> {
        let txn = Txn::new()
            .when([Compare::version(path, CompareOp::Greater, 0)])
            .and_then([TxnOp::put(path, data, None)]);
        if self.kv().txn(txn).await?.succeeded() {
            Ok(())
        } else {
            Err(CoordError::NoNode(path.to_string()))
        }
    }

    async fn delete(&self, path: &str, recursive: bool) -> Result<bool, CoordError> {
        let prefix = child_prefix(path);
        let present = Compare::version(path, CompareOp::Greater, 0);
        let txn = if recursive {
            Txn::new().when([present]).and_then([
                TxnOp::delete(path, None),
                TxnOp::delete(prefix, Some(DeleteOptions::new().with_prefix())),
            ])
        } else {
            // an empty range compares as version 0
            let childless = Compare::version(prefix, CompareOp::Equal, 0).with_prefix();
            Txn::new()
                .when([present, childless])
                .and_then([TxnOp::delete(path, None)])
        };
        if self.kv().txn(txn).await?.succeeded() {
            debug!("deleted node {path} (recursive: {recursive})");
            return Ok(true);
        }
        if !recursive && self.exists(path).await? {
            return Err(CoordError::NotEmpty(path.to_string()));
        }
        Ok(false)
    }

    async fn list_children(&self, path: &str) -> Result<Vec<String>, CoordError> {
        if !self.exists(path).await? {
            return Err(CoordError::NoNode(path.to_string()));
        }
        let prefix = child_prefix(path);
        let resp = self
            .kv()
            .get(
                prefix.as_str(),
                Some(GetOptions::new().with_prefix().with_keys_only()),
            )
            .await?;
        let mut names: Vec<String> = resp
            .kvs()
            .iter()
            .filter_map(|kv| kv.key_str().ok())
            .filter_map(|k| k.strip_prefix(prefix.as_str()))
            .filter(|rest| !rest.is_empty() && !rest.contains('/'))
            .map(str::to_string)
            .collect();
        names.sort();
        Ok(names)
    }

    async fn acquire_mutex(
        &self,
        path: &str,
        timeout: Duration,
    ) -> Result<ScopedLock, CoordError> {
        let name = self.lock_name(path);
        let mut lease = self.client.lease_client();
        let lease_id = lease.grant(self.lease_ttl, None).await?.id();
        let cancel = CancellationToken::new();
        spawn_keep_alive(lease.clone(), lease_id, self.lease_ttl, cancel.clone());

        let mut locker = self.client.lock_client();
        let acquired = tokio::time::timeout(
            timeout,
            locker.lock(name.as_str(), Some(LockOptions::new().with_lease(lease_id))),
        )
        .await;

        match acquired {
            Ok(Ok(resp)) => {
                let key = resp.key().to_vec();
                debug!("acquired mutex {name} (lease {lease_id})");
                Ok(ScopedLock::new(path, async move {
                    cancel.cancel();
                    let unlocked = locker.unlock(key).await;
                    lease.revoke(lease_id).await?;
                    unlocked?;
                    Ok::<(), CoordError>(())
                }))
            }
            Ok(Err(e)) => {
                cancel.cancel();
                let _ = lease.revoke(lease_id).await;
                Err(e.into())
            }
            Err(_) => {
                cancel.cancel();
                // revoking the lease also withdraws our waiter key
                let _ = lease.revoke(lease_id).await;
                Err(CoordError::LockTimeout {
                    path: path.to_string(),
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
        }
    }
}
