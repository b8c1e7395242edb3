//! Admission rules for operations that can grow stored bytes.
//!
//! Every decision reads the cached usage estimate once and never blocks. The
//! estimate may be stale by up to one sync interval (or indefinitely while the
//! counter store is unreachable); decisions are made against it regardless.

use std::fmt;
use std::sync::Arc;

use tracing::debug;

use super::QuotaState;
use crate::error::QuotaError;

/// Operations the guard decides on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatedOp {
    /// Directory creation.
    Mkdir,
    /// Symbolic link creation.
    Symlink,
    /// File creation.
    Create,
    /// Open with `O_CREAT`.
    OpenCreate,
    /// Data write.
    Write,
    /// Truncate by path or by handle.
    Truncate,
}

impl fmt::Display for GatedOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            GatedOp::Mkdir => "mkdir",
            GatedOp::Symlink => "symlink",
            GatedOp::Create => "create",
            GatedOp::OpenCreate => "open(O_CREAT)",
            GatedOp::Write => "write",
            GatedOp::Truncate => "truncate",
        };
        f.write_str(name)
    }
}

/// Quota guard consulted by the passthrough layer.
#[derive(Debug, Clone)]
pub struct QuotaGuard {
    state: Arc<QuotaState>,
}

impl QuotaGuard {
    /// Create a guard over shared state.
    pub fn new(state: Arc<QuotaState>) -> Self {
        Self { state }
    }

    /// Shared state this guard decides against.
    pub fn state(&self) -> &Arc<QuotaState> {
        &self.state
    }

    /// Entry creation is admitted unless usage is already over the limit.
    ///
    /// The size of the new entry is not accounted for.
    pub fn check_create(&self, op: GatedOp) -> Result<(), QuotaError> {
        let usage = self.state.usage_estimate();
        let limit = self.state.limit_bytes();
        if usage <= limit {
            return Ok(());
        }
        Err(self.deny(op, 0, usage, limit))
    }

    /// A write of `size` bytes is admitted iff `usage + size <= limit`.
    pub fn check_write(&self, size: u64) -> Result<(), QuotaError> {
        let usage = self.state.usage_estimate();
        let limit = self.state.limit_bytes();
        if fits(usage, size, limit) {
            return Ok(());
        }
        Err(self.deny(GatedOp::Write, size, usage, limit))
    }

    /// Truncating a file of `current_size` bytes to `new_size` bytes.
    ///
    /// Shrinking (or keeping the size) is always admitted. Growing is admitted
    /// iff the growth fits in the remaining headroom.
    pub fn check_truncate(&self, current_size: u64, new_size: u64) -> Result<(), QuotaError> {
        let delta = i128::from(current_size) - i128::from(new_size);
        if delta >= 0 {
            return Ok(());
        }

        let growth = new_size - current_size;
        let usage = self.state.usage_estimate();
        let limit = self.state.limit_bytes();
        if fits(usage, growth, limit) {
            return Ok(());
        }
        Err(self.deny(GatedOp::Truncate, growth, usage, limit))
    }

    /// Record that an admitted size-affecting operation succeeded.
    pub fn record_success(&self) {
        self.state.request_recompute();
    }

    fn deny(&self, operation: GatedOp, requested_bytes: u64, usage_bytes: u64, limit_bytes: u64) -> QuotaError {
        debug!(%operation, requested_bytes, usage_bytes, limit_bytes, "quota exceeded");
        QuotaError::Exceeded {
            operation,
            requested_bytes,
            usage_bytes,
            limit_bytes,
        }
    }
}

fn fits(usage: u64, additional: u64, limit: u64) -> bool {
    usage.checked_add(additional).is_some_and(|projected| projected <= limit)
}

#[cfg(test)]
mod tests {
    use bolero::check;

    use super::*;
    use crate::config::Identity;
    use crate::constants::BYTES_PER_MIB;

    fn guard(limit: u64, usage: u64) -> QuotaGuard {
        let identity = Identity::new("tenant", "node").unwrap();
        QuotaGuard::new(Arc::new(QuotaState::with_usage_estimate(limit, identity, usage)))
    }

    #[test]
    fn test_create_boundary() {
        assert!(guard(10, 10).check_create(GatedOp::Create).is_ok());
        assert!(guard(10, 11).check_create(GatedOp::Mkdir).is_err());
        assert!(guard(0, 0).check_create(GatedOp::Symlink).is_ok());
    }

    #[test]
    fn test_write_boundary() {
        assert!(guard(10, 9).check_write(1).is_ok());
        assert!(guard(10, 9).check_write(2).is_err());
        assert!(guard(10, 10).check_write(0).is_ok());
        assert!(guard(10, 11).check_write(0).is_err());
    }

    #[test]
    fn test_write_overflow_is_denied() {
        assert!(guard(u64::MAX, 1).check_write(u64::MAX).is_err());
    }

    #[test]
    fn test_truncate_shrink_always_admitted() {
        let g = guard(10, 1000);
        assert!(g.check_truncate(500, 0).is_ok());
        assert!(g.check_truncate(500, 500).is_ok());
    }

    #[test]
    fn test_truncate_growth_boundary() {
        let g = guard(10, 5);
        assert!(g.check_truncate(100, 105).is_ok());
        assert!(g.check_truncate(100, 106).is_err());
    }

    #[test]
    fn test_denial_reports_context() {
        let err = guard(10, 9).check_write(2).unwrap_err();
        assert_eq!(err, QuotaError::Exceeded {
            operation: GatedOp::Write,
            requested_bytes: 2,
            usage_bytes: 9,
            limit_bytes: 10,
        });
    }

    #[test]
    fn test_guard_never_mutates_estimate() {
        let g = guard(10 * BYTES_PER_MIB, 9 * BYTES_PER_MIB);
        let _ = g.check_write(2 * BYTES_PER_MIB);
        let _ = g.check_truncate(0, BYTES_PER_MIB);
        let _ = g.check_create(GatedOp::Create);
        assert_eq!(g.state().usage_estimate(), 9 * BYTES_PER_MIB);
    }

    #[test]
    fn test_record_success_sets_flag() {
        let g = guard(10, 0);
        g.state().take_recompute_request();
        assert!(!g.state().recompute_requested());
        g.record_success();
        assert!(g.state().recompute_requested());
    }

    #[test]
    fn test_create_admission_property() {
        check!().with_iterations(1000).with_type::<(u64, u64)>().for_each(|(usage, limit)| {
            let admitted = guard(*limit, *usage).check_create(GatedOp::Create).is_ok();
            assert_eq!(admitted, usage <= limit);
        });
    }

    #[test]
    fn test_write_admission_property() {
        check!().with_iterations(1000).with_type::<(u32, u32, u32)>().for_each(|(usage, size, limit)| {
            let (usage, size, limit) = (u64::from(*usage), u64::from(*size), u64::from(*limit));
            let admitted = guard(limit, usage).check_write(size).is_ok();
            assert_eq!(admitted, usage + size <= limit);
        });
    }

    #[test]
    fn test_truncate_admission_property() {
        check!().with_iterations(1000).with_type::<(u32, u32, u32, u32)>().for_each(
            |(usage, current, offset, limit)| {
                let (usage, current, offset, limit) =
                    (u64::from(*usage), u64::from(*current), u64::from(*offset), u64::from(*limit));
                let admitted = guard(limit, usage).check_truncate(current, offset).is_ok();
                if offset <= current {
                    assert!(admitted);
                } else {
                    assert_eq!(admitted, usage + (offset - current) <= limit);
                }
            },
        );
    }
}
