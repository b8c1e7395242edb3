//! Soft quota enforcement against a cached, remotely maintained usage figure.

mod guard;
mod state;

pub use guard::GatedOp;
pub use guard::QuotaGuard;
pub use state::QuotaState;
