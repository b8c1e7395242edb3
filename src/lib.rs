//! Passthrough FUSE filesystem with a soft, cluster-wide usage quota.
//!
//! A directory on the local host is exposed through a FUSE mount. Every
//! operation is forwarded to the backing directory, except that operations
//! able to grow stored bytes are first checked against a cached usage figure.
//! The figure is owned by a remote counter store and refreshed by a background
//! task; this process never computes usage itself.
//!
//! # Components
//!
//! - [`quota::QuotaState`]: limit, cached usage estimate and recompute flag
//! - [`quota::QuotaGuard`]: admission rules for create, write and truncate
//! - [`sync::UsageSync`]: periodic exchange with the counter store
//! - [`fs::QuotaFs`]: the passthrough layer, a `fuse_backend_rs` filesystem
//!
//! # Quota semantics
//!
//! The quota is soft. Decisions use whatever estimate is cached, which lags
//! behind local writes by up to one sync interval and behind other nodes'
//! writes indefinitely. Denials surface as `EDQUOT`, never `ENOSPC`.
//!
//! # Usage
//!
//! ```bash
//! ROOT_DIR=/srv/data FSS_ID=tenant-a FSS_NODE_ID=node-1 QUOTA=1024 \
//! REDIS_IP=10.0.0.5 REDIS_PORT=6379 REDIS_PASSWD=secret \
//!     quotafs --mount-point /mnt/data
//! ```
//!
//! # Tiger Style
//!
//! - Explicit resource bounds (see [`constants`])
//! - Fail-fast on configuration errors
//! - No backoff: a failed sync tick simply waits for the next one

pub mod config;
pub mod constants;
pub mod error;
pub mod fs;
pub mod handle;
pub mod inode;
pub mod quota;
pub mod sync;

pub use config::Identity;
pub use config::QuotaFsConfig;
pub use config::RemoteStoreConfig;
pub use config::SyncTiming;
pub use error::ConfigError;
pub use error::QuotaError;
pub use error::RemoteStoreError;
pub use fs::QuotaFs;
pub use quota::GatedOp;
pub use quota::QuotaGuard;
pub use quota::QuotaState;
pub use sync::InMemoryCounterStore;
pub use sync::RedisCounterStore;
pub use sync::SyncLauncher;
pub use sync::UsageSync;
