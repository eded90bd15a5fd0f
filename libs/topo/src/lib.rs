//! # topo
//!
//! Connection contract for a distributed coordination store (shared
//! configuration, locking, leader election) and an instrumented facade over
//! it.
//!
//! This library provides:
//! - **[`Conn`]**, the contract every store connection implements: versioned
//!   key/value CRUD, directory and prefix listing, four lock variants,
//!   watches, and leader-election registration.
//! - **[`StatsConn`]**, a drop-in `Conn` that times every operation, counts
//!   errors per `(operation, cell)`, bounds concurrent reads through a shared
//!   [`ReadGate`], and rejects mutations while read-only.
//! - **[`memory::MemoryTopo`]**, an in-process store for tests and local runs.
//! - **[`TopoServer`]**, which hands out one facade per cell, all sharing a
//!   single read budget.
#![warn(
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub,
    non_snake_case,
    non_upper_case_globals
)]
#![deny(rustdoc::broken_intra_doc_links)]

use std::time::Duration;

use async_trait::async_trait;

pub mod config;
pub mod context;
pub mod error;
pub mod gate;
pub mod lock;
pub mod memory;
pub mod metrics;
pub mod server;
pub mod stats_conn;
pub mod types;

pub use config::Config;
pub use context::Context;
pub use error::{TopoError, TopoResult};
pub use gate::{ReadGate, ReadPermit};
pub use lock::{LockCall, LockDispatch, LockKind};
pub use metrics::{Operation, PrometheusStats, StatsSink};
pub use server::{Factory, TopoServer};
pub use stats_conn::StatsConn;
pub use types::{
    DirEntry, DirEntryType, KvInfo, LeaderParticipation, LockDescriptor, Version, WatchChannel,
    WatchData, WatchDataRecursive, WatchRecursiveChannel,
};

/// A connection to one cell of a coordination store.
///
/// Paths are `/`-separated and relative to the connection's root.
#[async_trait]
pub trait Conn: Send + Sync + 'static {
    /// Children of `dir_path`. Entry types are only filled in when `full`.
    async fn list_dir(&self, ctx: &Context, dir_path: &str, full: bool)
    -> TopoResult<Vec<DirEntry>>;

    /// Creates a node, failing with `NodeExists` if present.
    async fn create(&self, ctx: &Context, file_path: &str, contents: &[u8]) -> TopoResult<Version>;

    /// Replaces a node's contents. With `Some(version)` the write only
    /// succeeds if the node is still at that version; `None` overwrites
    /// unconditionally, creating the node if needed.
    async fn update(
        &self,
        ctx: &Context,
        file_path: &str,
        contents: &[u8],
        version: Option<Version>,
    ) -> TopoResult<Version>;

    async fn get(&self, ctx: &Context, file_path: &str) -> TopoResult<(Vec<u8>, Version)>;

    /// Contents of `file_path` as of a specific historical version.
    async fn get_version(&self, ctx: &Context, file_path: &str, version: i64)
    -> TopoResult<Vec<u8>>;

    /// Every node whose path starts with `file_path_prefix`.
    async fn list(&self, ctx: &Context, file_path_prefix: &str) -> TopoResult<Vec<KvInfo>>;

    async fn delete(&self, ctx: &Context, file_path: &str, version: Option<Version>)
    -> TopoResult<()>;

    /// Blocks until the lock on `dir_path` is acquired or `ctx` is done.
    async fn lock(
        &self,
        ctx: &Context,
        dir_path: &str,
        contents: &str,
    ) -> TopoResult<Box<dyn LockDescriptor>>;

    /// Like [`lock`](Self::lock), but the store releases the lock after `ttl`
    /// if the holder never does.
    async fn lock_with_ttl(
        &self,
        ctx: &Context,
        dir_path: &str,
        contents: &str,
        ttl: Duration,
    ) -> TopoResult<Box<dyn LockDescriptor>>;

    /// Lock keyed by a logical name instead of an existing path.
    async fn lock_name(
        &self,
        ctx: &Context,
        dir_path: &str,
        contents: &str,
    ) -> TopoResult<Box<dyn LockDescriptor>>;

    /// Returns `WouldBlock` instead of waiting when the lock is held.
    async fn try_lock(
        &self,
        ctx: &Context,
        dir_path: &str,
        contents: &str,
    ) -> TopoResult<Box<dyn LockDescriptor>>;

    /// Current value of `file_path` plus a stream of later changes.
    async fn watch(&self, ctx: &Context, file_path: &str) -> TopoResult<(WatchData, WatchChannel)>;

    /// Current values under `path` plus a stream of later changes.
    async fn watch_recursive(
        &self,
        ctx: &Context,
        path: &str,
    ) -> TopoResult<(Vec<WatchDataRecursive>, WatchRecursiveChannel)>;

    fn new_leader_participation(
        &self,
        name: &str,
        id: &str,
    ) -> TopoResult<Box<dyn LeaderParticipation>>;

    fn close(&self);
}
