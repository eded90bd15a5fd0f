//! Instrumented, admission-controlled [`Conn`] facade.
//!
//! Reads (`list_dir`, `get`, `get_version`, `list`) take one slot from the
//! shared [`ReadGate`] before reaching the store and report how long they
//! queued. Mutations (`create`, `update`, `delete` and every lock variant) are
//! rejected locally while the connection is read-only. Watches, leader
//! participation and `close` are neither gated nor subject to read-only.
//!
//! Every call that reaches the store records one execution sample labeled
//! `(operation, cell)`; every delegated error also bumps the error counter and
//! is returned unchanged.
use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::{
    Conn,
    context::Context,
    error::{TopoError, TopoResult},
    gate::{ReadGate, ReadPermit},
    lock::{LockCall, LockDispatch, LockKind},
    metrics::{OpTimer, Operation, PrometheusStats, StatsSink},
    types::{
        DirEntry, KvInfo, LeaderParticipation, LockDescriptor, Version, WatchChannel, WatchData,
        WatchDataRecursive, WatchRecursiveChannel,
    },
};

/// Wraps a [`Conn`] and emits stats for every operation.
pub struct StatsConn {
    cell: String,
    conn: Box<dyn Conn>,
    read_only: AtomicBool,
    read_gate: ReadGate,
    sink: Arc<dyn StatsSink>,
}

impl StatsConn {
    /// Facade for `cell` reporting to the process-wide prometheus collectors.
    pub fn new(cell: impl Into<String>, conn: Box<dyn Conn>, read_gate: ReadGate) -> Self {
        Self::with_sink(cell, conn, read_gate, Arc::new(PrometheusStats))
    }

    pub fn with_sink(
        cell: impl Into<String>,
        conn: Box<dyn Conn>,
        read_gate: ReadGate,
        sink: Arc<dyn StatsSink>,
    ) -> Self {
        Self {
            cell: cell.into(),
            conn,
            read_only: AtomicBool::new(false),
            read_gate,
            sink,
        }
    }

    pub fn cell(&self) -> &str {
        &self.cell
    }

    /// With `true`, every mutation fails locally without reaching the store.
    ///
    /// Not ordered against in-flight mutations: a write racing the toggle may
    /// land on either side of it.
    pub fn set_read_only(&self, read_only: bool) {
        debug!(cell = %self.cell, read_only, "setting topology connection access");
        self.read_only.store(read_only, Ordering::Relaxed);
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only.load(Ordering::Relaxed)
    }

    fn check_writable(&self, op: Operation, path: &str) -> TopoResult<()> {
        if self.is_read_only() {
            debug!(cell = %self.cell, %op, path, "rejecting mutation on read-only connection");
            return Err(TopoError::ReadOnly {
                operation: op.as_str().to_owned(),
                path: path.to_owned(),
            });
        }
        Ok(())
    }

    /// Waits for a read slot and records the queueing delay.
    async fn admit(&self, ctx: &Context, op: Operation) -> TopoResult<ReadPermit> {
        let wait_start = Instant::now();
        let permit = self.read_gate.acquire(ctx).await?;
        let waited = wait_start.elapsed();
        trace!(cell = %self.cell, %op, ?waited, "read admitted");
        self.sink.record_read_wait(op, &self.cell, waited);
        Ok(permit)
    }

    fn timer(&self, op: Operation) -> OpTimer<'_> {
        OpTimer::start(&self.sink, op, &self.cell)
    }

    fn counted<T>(&self, op: Operation, res: TopoResult<T>) -> TopoResult<T> {
        if res.is_err() {
            self.sink.add_error(op, &self.cell);
        }
        res
    }

    async fn internal_lock(
        &self,
        ctx: &Context,
        dir_path: &str,
        contents: &str,
        kind: LockKind,
        ttl: Duration,
    ) -> TopoResult<Box<dyn LockDescriptor>> {
        let dispatch = LockDispatch::resolve(kind, ttl);
        self.check_writable(dispatch.operation, dir_path)?;
        let _timer = self.timer(dispatch.operation);
        let res = match dispatch.call {
            LockCall::TryLock => self.conn.try_lock(ctx, dir_path, contents).await,
            LockCall::LockName => self.conn.lock_name(ctx, dir_path, contents).await,
            LockCall::LockWithTtl(ttl) => {
                self.conn
                    .lock_with_ttl(ctx, dir_path, contents, ttl)
                    .await
            }
            LockCall::Lock => self.conn.lock(ctx, dir_path, contents).await,
        };
        self.counted(dispatch.operation, res)
    }
}

impl fmt::Debug for StatsConn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StatsConn")
            .field("cell", &self.cell)
            .field("read_only", &self.is_read_only())
            .field("read_gate", &self.read_gate)
            .field("sink", &self.sink)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Conn for StatsConn {
    async fn list_dir(
        &self,
        ctx: &Context,
        dir_path: &str,
        full: bool,
    ) -> TopoResult<Vec<DirEntry>> {
        let _permit = self.admit(ctx, Operation::ListDir).await?;
        let _timer = self.timer(Operation::ListDir);
        let res = self.conn.list_dir(ctx, dir_path, full).await;
        self.counted(Operation::ListDir, res)
    }

    async fn create(&self, ctx: &Context, file_path: &str, contents: &[u8]) -> TopoResult<Version> {
        self.check_writable(Operation::Create, file_path)?;
        let _timer = self.timer(Operation::Create);
        let res = self.conn.create(ctx, file_path, contents).await;
        self.counted(Operation::Create, res)
    }

    async fn update(
        &self,
        ctx: &Context,
        file_path: &str,
        contents: &[u8],
        version: Option<Version>,
    ) -> TopoResult<Version> {
        self.check_writable(Operation::Update, file_path)?;
        let _timer = self.timer(Operation::Update);
        let res = self.conn.update(ctx, file_path, contents, version).await;
        self.counted(Operation::Update, res)
    }

    async fn get(&self, ctx: &Context, file_path: &str) -> TopoResult<(Vec<u8>, Version)> {
        let _permit = self.admit(ctx, Operation::Get).await?;
        let _timer = self.timer(Operation::Get);
        let res = self.conn.get(ctx, file_path).await;
        self.counted(Operation::Get, res)
    }

    async fn get_version(
        &self,
        ctx: &Context,
        file_path: &str,
        version: i64,
    ) -> TopoResult<Vec<u8>> {
        let _permit = self.admit(ctx, Operation::GetVersion).await?;
        let _timer = self.timer(Operation::GetVersion);
        let res = self.conn.get_version(ctx, file_path, version).await;
        self.counted(Operation::GetVersion, res)
    }

    async fn list(&self, ctx: &Context, file_path_prefix: &str) -> TopoResult<Vec<KvInfo>> {
        let _permit = self.admit(ctx, Operation::List).await?;
        let _timer = self.timer(Operation::List);
        let res = self.conn.list(ctx, file_path_prefix).await;
        self.counted(Operation::List, res)
    }

    async fn delete(
        &self,
        ctx: &Context,
        file_path: &str,
        version: Option<Version>,
    ) -> TopoResult<()> {
        self.check_writable(Operation::Delete, file_path)?;
        let _timer = self.timer(Operation::Delete);
        let res = self.conn.delete(ctx, file_path, version).await;
        self.counted(Operation::Delete, res)
    }

    async fn lock(
        &self,
        ctx: &Context,
        dir_path: &str,
        contents: &str,
    ) -> TopoResult<Box<dyn LockDescriptor>> {
        self.internal_lock(ctx, dir_path, contents, LockKind::Blocking, Duration::ZERO)
            .await
    }

    async fn lock_with_ttl(
        &self,
        ctx: &Context,
        dir_path: &str,
        contents: &str,
        ttl: Duration,
    ) -> TopoResult<Box<dyn LockDescriptor>> {
        self.internal_lock(ctx, dir_path, contents, LockKind::Blocking, ttl)
            .await
    }

    async fn lock_name(
        &self,
        ctx: &Context,
        dir_path: &str,
        contents: &str,
    ) -> TopoResult<Box<dyn LockDescriptor>> {
        self.internal_lock(ctx, dir_path, contents, LockKind::Named, Duration::ZERO)
            .await
    }

    async fn try_lock(
        &self,
        ctx: &Context,
        dir_path: &str,
        contents: &str,
    ) -> TopoResult<Box<dyn LockDescriptor>> {
        self.internal_lock(ctx, dir_path, contents, LockKind::NonBlocking, Duration::ZERO)
            .await
    }

    async fn watch(&self, ctx: &Context, file_path: &str) -> TopoResult<(WatchData, WatchChannel)> {
        let _timer = self.timer(Operation::Watch);
        self.conn.watch(ctx, file_path).await
    }

    async fn watch_recursive(
        &self,
        ctx: &Context,
        path: &str,
    ) -> TopoResult<(Vec<WatchDataRecursive>, WatchRecursiveChannel)> {
        let _timer = self.timer(Operation::WatchRecursive);
        self.conn.watch_recursive(ctx, path).await
    }

    fn new_leader_participation(
        &self,
        name: &str,
        id: &str,
    ) -> TopoResult<Box<dyn LeaderParticipation>> {
        let _timer = self.timer(Operation::NewLeaderParticipation);
        let res = self.conn.new_leader_participation(name, id);
        self.counted(Operation::NewLeaderParticipation, res)
    }

    fn close(&self) {
        let _timer = self.timer(Operation::Close);
        self.conn.close();
    }
}
