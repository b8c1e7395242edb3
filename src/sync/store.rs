//! Remote counter store seam.
//!
//! The sync task only needs four things from the store: open a connection,
//! authenticate it, raise a recompute flag, and read a usage counter. Keeping
//! that behind a trait lets the loop be exercised without a network.

use async_trait::async_trait;

use crate::config::Identity;
use crate::constants::RECOMPUTE_REQUEST_KEY_PREFIX;
use crate::constants::USAGE_KEY_PREFIX;
use crate::error::RemoteStoreError;

/// Address of this node/tenant's entries in the counter store.
///
/// Both entries are hash fields: the hash key carries the node id, the field
/// carries the tenant id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CounterKey {
    node_id: String,
    tenant_id: String,
}

impl CounterKey {
    /// Key for the given identity.
    pub fn new(identity: &Identity) -> Self {
        Self {
            node_id: identity.node_id.clone(),
            tenant_id: identity.tenant_id.clone(),
        }
    }

    /// Hash receiving recompute requests (`fss_req:<node>`).
    pub fn request_hash(&self) -> String {
        format!("{}{}", RECOMPUTE_REQUEST_KEY_PREFIX, self.node_id)
    }

    /// Hash holding usage figures (`fss_usage:<node>`).
    pub fn usage_hash(&self) -> String {
        format!("{}{}", USAGE_KEY_PREFIX, self.node_id)
    }

    /// Field inside either hash.
    pub fn field(&self) -> &str {
        &self.tenant_id
    }
}

/// Reply to a usage query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CounterReply {
    /// Integer-typed reply.
    Integer(i64),
    /// Any other reply type (nil, string, array, ...), rendered for logging.
    NotInteger(String),
}

/// Factory for connections to the remote counter store.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Open a fresh connection. Callers bound this with their own timeout.
    async fn connect(&self) -> Result<Box<dyn CounterConnection>, RemoteStoreError>;
}

/// One connection, released on drop.
#[async_trait]
pub trait CounterConnection: Send {
    /// `AUTH <secret>`; an error reply is an error.
    async fn authenticate(&mut self, secret: &str) -> Result<(), RemoteStoreError>;

    /// `HSET fss_req:<node> <tenant> 1`.
    async fn set_flag(&mut self, key: &CounterKey) -> Result<(), RemoteStoreError>;

    /// `HGET fss_usage:<node> <tenant>`.
    async fn get_counter(&mut self, key: &CounterKey) -> Result<CounterReply, RemoteStoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter_key_layout() {
        let identity = Identity::new("tenant-7", "node-3").unwrap();
        let key = CounterKey::new(&identity);

        assert_eq!(key.request_hash(), "fss_req:node-3");
        assert_eq!(key.usage_hash(), "fss_usage:node-3");
        assert_eq!(key.field(), "tenant-7");
    }
}
