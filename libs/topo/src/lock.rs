//! Lock variant dispatch.
//!
//! The four public lock entry points funnel into one routine; this module is
//! the pure mapping from `(kind, ttl)` to the underlying call and the metrics
//! label that call is reported under.
use std::time::Duration;

use crate::metrics::Operation;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockKind {
    /// wait until the lock is free
    Blocking,
    /// fail immediately if the lock is held
    NonBlocking,
    /// lock keyed by a logical name rather than a path
    Named,
}

/// Underlying connection call a lock request routes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockCall {
    Lock,
    LockWithTtl(Duration),
    LockName,
    TryLock,
}

/// A resolved lock request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockDispatch {
    pub call: LockCall,
    pub operation: Operation,
}

impl LockDispatch {
    /// Resolve `(kind, ttl)`. A zero ttl means no expiry.
    ///
    /// The label starts as `Lock` (also used for `TryLock`); `Named` wins over
    /// a nonzero ttl, which yields `LockWithTTL`.
    pub fn resolve(kind: LockKind, ttl: Duration) -> Self {
        let operation = match kind {
            LockKind::Named => Operation::LockName,
            _ if !ttl.is_zero() => Operation::LockWithTtl,
            _ => Operation::Lock,
        };
        let call = match kind {
            LockKind::NonBlocking => LockCall::TryLock,
            LockKind::Named => LockCall::LockName,
            LockKind::Blocking if !ttl.is_zero() => LockCall::LockWithTtl(ttl),
            LockKind::Blocking => LockCall::Lock,
        };
        Self { call, operation }
    }
}
