//! Process-wide quota state shared by the FUSE workers and the usage sync task.
//!
//! The limit and identity are fixed at startup. The usage estimate and the
//! recompute flag are plain atomics: readers never block and no lock is ever
//! held across network I/O.

use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use crate::config::Identity;

/// Shared quota state.
///
/// Only the usage sync task replaces the usage estimate and only the usage sync
/// task clears the recompute flag. Filesystem operations read the estimate and
/// set the flag.
#[derive(Debug)]
pub struct QuotaState {
    limit_bytes: u64,
    usage_estimate_bytes: AtomicU64,
    recompute_requested: AtomicBool,
    identity: Identity,
}

impl QuotaState {
    /// Create the state with an unknown (zero) usage estimate.
    ///
    /// A recompute is requested up front so the first sync tick asks the remote
    /// store for a fresh figure.
    pub fn new(limit_bytes: u64, identity: Identity) -> Self {
        Self::with_usage_estimate(limit_bytes, identity, 0)
    }

    /// Create the state seeded with a known usage estimate.
    pub fn with_usage_estimate(limit_bytes: u64, identity: Identity, usage_estimate_bytes: u64) -> Self {
        Self {
            limit_bytes,
            usage_estimate_bytes: AtomicU64::new(usage_estimate_bytes),
            recompute_requested: AtomicBool::new(true),
            identity,
        }
    }

    /// Quota limit in bytes.
    pub fn limit_bytes(&self) -> u64 {
        self.limit_bytes
    }

    /// Last usage figure reported by the remote store.
    pub fn usage_estimate(&self) -> u64 {
        self.usage_estimate_bytes.load(Ordering::Acquire)
    }

    /// Tenant/node identity.
    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// Ask the sync task to request a full recompute on its next tick.
    pub fn request_recompute(&self) {
        self.recompute_requested.store(true, Ordering::Release);
    }

    /// Whether a recompute request is pending.
    pub fn recompute_requested(&self) -> bool {
        self.recompute_requested.load(Ordering::Acquire)
    }

    /// Clear the recompute flag, returning whether it was set.
    ///
    /// A setter racing with this call either lands before the swap (and is
    /// drained now) or after it (and is drained next tick).
    pub(crate) fn take_recompute_request(&self) -> bool {
        self.recompute_requested.swap(false, Ordering::AcqRel)
    }

    /// Overwrite the usage estimate wholesale.
    pub(crate) fn replace_usage_estimate(&self, usage_bytes: u64) {
        self.usage_estimate_bytes.store(usage_bytes, Ordering::Release);
    }
}
