//! Tiger Style resource bounds for the quota filesystem.
//!
//! All limits are explicitly defined to prevent unbounded resource use.

use std::time::Duration;

/// Maximum number of concurrently open file handles.
pub const MAX_FILE_HANDLES: usize = 4096;

/// Inode cache size past which unreferenced entries are evicted.
///
/// Entries the kernel still holds a lookup on are never evicted.
pub const MAX_INODE_CACHE: usize = 10_000;

/// Maximum entries returned in a single readdir call.
pub const MAX_READDIR_ENTRIES: u32 = 1000;

/// TTL for cached file attributes (1 second).
pub const ATTR_TTL: Duration = Duration::from_secs(1);

/// TTL for cached directory entries (1 second).
pub const ENTRY_TTL: Duration = Duration::from_secs(1);

/// Root inode number (always 1 per FUSE convention).
pub const ROOT_INODE: u64 = 1;

/// Maximum extended attribute name length.
pub const MAX_XATTR_NAME_SIZE: usize = 255;

/// Maximum extended attribute value size (64 KB).
pub const MAX_XATTR_VALUE_SIZE: usize = 64 * 1024;

/// Default number of threads serving FUSE requests.
pub const DEFAULT_FUSE_THREADS: usize = 4;

// ============================================================================
// Quota
// ============================================================================

/// Bytes per mebibyte; quotas are configured in whole MiB.
pub const BYTES_PER_MIB: u64 = 1024 * 1024;

// ============================================================================
// Usage Sync
// ============================================================================

/// Interval between usage sync ticks.
pub const SYNC_INTERVAL: Duration = Duration::from_secs(1);

/// Bound on connecting to the counter store and on each command round-trip.
pub const SYNC_TIMEOUT: Duration = Duration::from_millis(1500);

/// Hash holding recompute requests, suffixed with the node id.
pub const RECOMPUTE_REQUEST_KEY_PREFIX: &str = "fss_req:";

/// Hash holding usage figures, suffixed with the node id.
pub const USAGE_KEY_PREFIX: &str = "fss_usage:";

/// Value written into the recompute request hash.
pub const RECOMPUTE_REQUEST_VALUE: i64 = 1;

// ============================================================================
// Compile-Time Constant Assertions
// ============================================================================

const _: () = assert!(MAX_FILE_HANDLES > 0);
const _: () = assert!(MAX_INODE_CACHE > 0);
const _: () = assert!(MAX_READDIR_ENTRIES > 0);
const _: () = assert!(MAX_XATTR_NAME_SIZE > 0);
const _: () = assert!(MAX_XATTR_NAME_SIZE < MAX_XATTR_VALUE_SIZE);
const _: () = assert!(DEFAULT_FUSE_THREADS > 0);

// Root inode must be 1 per FUSE convention
const _: () = assert!(ROOT_INODE == 1);

const _: () = assert!(BYTES_PER_MIB == 1 << 20);

// Timeouts stay under two ticks
const _: () = assert!(SYNC_INTERVAL.as_millis() > 0);
const _: () = assert!(SYNC_TIMEOUT.as_millis() > 0);
const _: () = assert!(SYNC_TIMEOUT.as_millis() < 2 * SYNC_INTERVAL.as_millis());
