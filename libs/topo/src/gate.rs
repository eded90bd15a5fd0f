//! Admission gate bounding concurrent reads against the coordination store.
//!
//! Cloning a [`ReadGate`] shares the same budget, so one gate handed to every
//! per-cell facade yields a single process-wide read concurrency limit.
use std::{num::NonZeroU32, sync::Arc};

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::trace;

use crate::context::Context;
use crate::error::{TopoError, TopoResult};
use crate::metrics::READ_PERMITS_IN_USE;

/// Weighted counting gate over a fixed number of read slots.
#[derive(Debug, Clone)]
pub struct ReadGate {
    permits: Arc<Semaphore>,
    capacity: u32,
}

/// Slots held by one admitted read. Released on drop.
#[derive(Debug)]
pub struct ReadPermit {
    _permit: OwnedSemaphorePermit,
    weight: u32,
}

impl Drop for ReadPermit {
    fn drop(&mut self) {
        READ_PERMITS_IN_USE.sub(self.weight as i64);
    }
}

impl ReadGate {
    pub fn new(capacity: NonZeroU32) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(capacity.get() as usize)),
            capacity: capacity.get(),
        }
    }

    /// Waits for one slot.
    pub async fn acquire(&self, ctx: &Context) -> TopoResult<ReadPermit> {
        self.acquire_many(ctx, 1).await
    }

    /// Waits for `n` slots, or fails once `ctx` is cancelled or past its
    /// deadline. A context that is already done never queues.
    pub async fn acquire_many(&self, ctx: &Context, n: u32) -> TopoResult<ReadPermit> {
        if let Some(err) = ctx.err() {
            return Err(err);
        }
        if n > self.capacity {
            return Err(TopoError::Interrupted(format!(
                "requested {n} read slots from a gate of {}",
                self.capacity
            )));
        }
        let permit = tokio::select! {
            biased;
            err = ctx.done() => {
                trace!(?err, "read gate wait aborted");
                return Err(err);
            }
            permit = self.permits.clone().acquire_many_owned(n) => permit
                .map_err(|_| TopoError::Interrupted("read gate closed".into()))?,
        };
        READ_PERMITS_IN_USE.add(n as i64);
        Ok(ReadPermit {
            _permit: permit,
            weight: n,
        })
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Slots currently free.
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    /// Slots currently held.
    pub fn in_use(&self) -> usize {
        self.capacity as usize - self.available()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn gate(capacity: u32) -> ReadGate {
        ReadGate::new(NonZeroU32::new(capacity).unwrap())
    }

    #[tokio::test]
    async fn permits_release_on_drop() {
        let gate = gate(2);
        let ctx = Context::background();
        let a = gate.acquire(&ctx).await.expect("first slot");
        let b = gate.acquire(&ctx).await.expect("second slot");
        assert_eq!(gate.in_use(), 2);
        drop(a);
        assert_eq!(gate.available(), 1);
        drop(b);
        assert_eq!(gate.available(), 2);
    }

    #[tokio::test]
    async fn smallest_gate_admits_one_read() {
        let gate = ReadGate::new(NonZeroU32::MIN);
        assert_eq!(gate.capacity(), 1);
        let ctx = Context::background();
        let _held = gate.acquire(&ctx).await.expect("slot");
        let timed = ctx.with_timeout(Duration::from_millis(10));
        assert!(matches!(
            gate.acquire(&timed).await,
            Err(TopoError::Timeout(_))
        ));
    }

    #[tokio::test]
    async fn clones_share_budget() {
        let gate = gate(1);
        let other = gate.clone();
        let ctx = Context::background();
        let _held = gate.acquire(&ctx).await.expect("slot");
        assert_eq!(other.available(), 0);
    }

    #[tokio::test]
    async fn cancelled_context_fails_fast() {
        let gate = gate(1);
        let ctx = Context::background();
        ctx.cancel();
        let err = gate.acquire(&ctx).await.unwrap_err();
        assert!(matches!(err, TopoError::Interrupted(_)));
        assert_eq!(gate.available(), 1);
    }

    #[tokio::test]
    async fn deadline_elapses_while_waiting() {
        let gate = gate(1);
        let ctx = Context::background();
        let _held = gate.acquire(&ctx).await.expect("slot");

        let timed = ctx.with_timeout(Duration::from_millis(20));
        let err = gate.acquire(&timed).await.unwrap_err();
        assert!(matches!(err, TopoError::Timeout(_)));
    }

    #[tokio::test]
    async fn waiter_admitted_after_release() {
        let gate = gate(1);
        let ctx = Context::background();
        let held = gate.acquire(&ctx).await.expect("slot");

        let waiter = {
            let gate = gate.clone();
            let ctx = ctx.clone();
            tokio::spawn(async move { gate.acquire(&ctx).await.map(|_| ()) })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());
        drop(held);
        waiter.await.expect("join").expect("admitted");
    }

    #[tokio::test]
    async fn weighted_acquire() {
        let gate = gate(3);
        let ctx = Context::background();
        let permit = gate.acquire_many(&ctx, 2).await.expect("two slots");
        assert_eq!(gate.available(), 1);
        drop(permit);
        assert_eq!(gate.available(), 3);
        assert!(gate.acquire_many(&ctx, 4).await.is_err());
    }
}
