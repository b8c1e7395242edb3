//! Deterministic in-process counter store.
//!
//! Behaves like the remote store from the sync task's point of view, with knobs
//! to take it offline, reject credentials, or fail recompute writes. Used by
//! tests and for running the filesystem without a counter service.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;

use async_trait::async_trait;

use super::store::CounterConnection;
use super::store::CounterKey;
use super::store::CounterReply;
use super::store::CounterStore;
use crate::constants::RECOMPUTE_REQUEST_VALUE;
use crate::error::RemoteStoreError;

#[derive(Debug, Default)]
struct Inner {
    offline: bool,
    secret: Option<String>,
    fail_requests: bool,
    /// `(hash, field) -> reply` for usage queries.
    usage: HashMap<(String, String), CounterReply>,
    /// `(hash, field) -> value` written by recompute requests.
    requests: HashMap<(String, String), i64>,
    request_writes: u64,
    connects: u64,
}

/// In-memory counter store. Clones share state.
#[derive(Debug, Clone, Default)]
pub struct InMemoryCounterStore {
    inner: Arc<Mutex<Inner>>,
}

impl InMemoryCounterStore {
    /// Reachable store accepting any secret.
    pub fn new() -> Self {
        Self::default()
    }

    /// Reachable store accepting only `secret`.
    pub fn with_secret(secret: impl Into<String>) -> Self {
        let store = Self::default();
        store.lock().secret = Some(secret.into());
        store
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Make connection attempts fail (or succeed again).
    pub fn set_offline(&self, offline: bool) {
        self.lock().offline = offline;
    }

    /// Make recompute writes fail (or succeed again).
    pub fn set_fail_requests(&self, fail: bool) {
        self.lock().fail_requests = fail;
    }

    /// Set the reply to the usage query for `key`.
    pub fn set_usage_reply(&self, key: &CounterKey, reply: CounterReply) {
        self.lock().usage.insert((key.usage_hash(), key.field().to_string()), reply);
    }

    /// Set an integer usage figure for `key`.
    pub fn set_usage(&self, key: &CounterKey, usage_bytes: i64) {
        self.set_usage_reply(key, CounterReply::Integer(usage_bytes));
    }

    /// Value of the recompute request field for `key`, if ever written.
    pub fn request_flag(&self, key: &CounterKey) -> Option<i64> {
        self.lock().requests.get(&(key.request_hash(), key.field().to_string())).copied()
    }

    /// Remove the recompute request for `key`, as a recompute worker would.
    pub fn clear_request_flag(&self, key: &CounterKey) {
        self.lock().requests.remove(&(key.request_hash(), key.field().to_string()));
    }

    /// Number of successful recompute writes.
    pub fn request_writes(&self) -> u64 {
        self.lock().request_writes
    }

    /// Number of connection attempts, successful or not.
    pub fn connects(&self) -> u64 {
        self.lock().connects
    }
}

#[async_trait]
impl CounterStore for InMemoryCounterStore {
    async fn connect(&self) -> Result<Box<dyn CounterConnection>, RemoteStoreError> {
        let mut inner = self.lock();
        inner.connects += 1;
        if inner.offline {
            return Err(RemoteStoreError::Unavailable {
                reason: "connection refused".to_string(),
            });
        }
        Ok(Box::new(InMemoryConnection {
            store: self.clone(),
            authenticated: false,
        }))
    }
}

struct InMemoryConnection {
    store: InMemoryCounterStore,
    authenticated: bool,
}

impl InMemoryConnection {
    fn ensure_authenticated(&self) -> Result<(), RemoteStoreError> {
        if self.authenticated {
            Ok(())
        } else {
            Err(RemoteStoreError::Unavailable {
                reason: "NOAUTH authentication required".to_string(),
            })
        }
    }
}

#[async_trait]
impl CounterConnection for InMemoryConnection {
    async fn authenticate(&mut self, secret: &str) -> Result<(), RemoteStoreError> {
        let inner = self.store.lock();
        match &inner.secret {
            Some(expected) if expected != secret => Err(RemoteStoreError::Unavailable {
                reason: "WRONGPASS invalid password".to_string(),
            }),
            _ => {
                self.authenticated = true;
                Ok(())
            }
        }
    }

    async fn set_flag(&mut self, key: &CounterKey) -> Result<(), RemoteStoreError> {
        self.ensure_authenticated()?;
        let mut inner = self.store.lock();
        if inner.fail_requests {
            return Err(RemoteStoreError::Unavailable {
                reason: "write rejected".to_string(),
            });
        }
        inner.requests.insert((key.request_hash(), key.field().to_string()), RECOMPUTE_REQUEST_VALUE);
        inner.request_writes += 1;
        Ok(())
    }

    async fn get_counter(&mut self, key: &CounterKey) -> Result<CounterReply, RemoteStoreError> {
        self.ensure_authenticated()?;
        let inner = self.store.lock();
        Ok(inner
            .usage
            .get(&(key.usage_hash(), key.field().to_string()))
            .cloned()
            .unwrap_or_else(|| CounterReply::NotInteger("nil".to_string())))
    }
}
