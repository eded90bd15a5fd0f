//! In-process coordination store.
//!
//! [`MemoryTopo`] holds every cell's tree in one shared structure; cloning it
//! shares the store. [`MemoryTopo::conn`] hands out a [`MemoryConn`] for a
//! single cell. Versions come from one counter across the whole store, and
//! every node keeps its history so that `get_version` can read old values.
use std::{
    collections::{BTreeMap, HashMap},
    fmt,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::{
    sync::{Notify, mpsc, mpsc::error::TrySendError},
    time::Instant,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
    Conn,
    context::Context,
    error::{TopoError, TopoResult},
    server::Factory,
    types::{
        DirEntry, DirEntryType, KvInfo, LeaderParticipation, LockDescriptor, Version,
        WatchChannel, WatchData, WatchDataRecursive, WatchRecursiveChannel,
    },
};

/// Buffered changes per watch before events are dropped.
const WATCH_CHANNEL_SIZE: usize = 16;

/// Named locks are not tied to a node, so they always carry an expiry.
const NAMED_LOCK_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Shared in-memory store for any number of cells.
#[derive(Debug, Clone, Default)]
pub struct MemoryTopo {
    shared: Arc<Shared>,
}

#[derive(Debug, Default)]
struct Shared {
    state: Mutex<State>,
    /// lock releases and election changes
    changed: Notify,
    fault: Mutex<Option<TopoError>>,
}

#[derive(Debug, Default)]
struct State {
    nodes: BTreeMap<String, Node>,
    last_version: u64,
    watches: Vec<Watcher>,
    locks: HashMap<String, LockEntry>,
    elections: HashMap<String, String>,
    next_id: u64,
}

#[derive(Debug)]
struct Node {
    /// oldest first, the last entry is current
    history: Vec<(Version, Vec<u8>)>,
}

impl Node {
    fn current(&self) -> (&[u8], Version) {
        // history is never empty
        let (version, contents) = &self.history[self.history.len() - 1];
        (contents, *version)
    }
}

#[derive(Debug)]
struct LockEntry {
    id: u64,
    contents: String,
    expires_at: Option<Instant>,
}

impl LockEntry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|at| now < at)
    }
}

#[derive(Debug)]
enum WatchSender {
    Node(mpsc::Sender<WatchData>),
    Recursive(mpsc::Sender<WatchDataRecursive>),
}

#[derive(Debug)]
struct Watcher {
    id: u64,
    key: String,
    /// strip this to get a cell-relative path
    cell_root: String,
    sender: WatchSender,
    /// ends the task watching the caller's context
    stop: CancellationToken,
}

impl Drop for Watcher {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

impl Watcher {
    fn matches(&self, key: &str) -> bool {
        match self.sender {
            WatchSender::Node(_) => self.key == key,
            WatchSender::Recursive(_) => is_under(key, &self.key),
        }
    }

    /// Delivers a change. Returns false once the watch should be dropped.
    fn send(&self, key: &str, data: WatchData) -> bool {
        let terminal = data.err.is_some();
        let res = match &self.sender {
            WatchSender::Node(tx) => delivered(tx.try_send(data)),
            WatchSender::Recursive(tx) => delivered(tx.try_send(WatchDataRecursive {
                path: relative(key, &self.cell_root),
                data,
            })),
        };
        match res {
            Ok(()) => !(terminal && matches!(self.sender, WatchSender::Node(_))),
            Err(TrySendError::Full(())) => {
                warn!(path = key, watch_id = self.id, "watch channel full, dropping change");
                true
            }
            Err(TrySendError::Closed(())) => false,
        }
    }
}

fn delivered<T>(res: Result<(), TrySendError<T>>) -> Result<(), TrySendError<()>> {
    res.map_err(|err| match err {
        TrySendError::Full(_) => TrySendError::Full(()),
        TrySendError::Closed(_) => TrySendError::Closed(()),
    })
}

fn is_under(key: &str, prefix: &str) -> bool {
    key == prefix
        || key
            .strip_prefix(prefix)
            .is_some_and(|rest| rest.starts_with('/') || prefix.ends_with('/'))
}

fn relative(key: &str, cell_root: &str) -> String {
    match key.strip_prefix(cell_root) {
        Some("") | None => "/".to_owned(),
        Some(rest) => rest.to_owned(),
    }
}

/// `/a//b/` -> `/a/b`, `` -> `/`
fn normalize(path: &str) -> String {
    let parts = path.split('/').filter(|p| !p.is_empty()).collect::<Vec<_>>();
    format!("/{}", parts.join("/"))
}

impl State {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn next_version(&mut self) -> Version {
        self.last_version += 1;
        Version::new(self.last_version)
    }

    /// A node at `key`, or any node below it.
    fn path_exists(&self, key: &str) -> bool {
        let dir = format!("{key}/");
        self.nodes.contains_key(key)
            || self
                .nodes
                .range(dir.clone()..)
                .next()
                .is_some_and(|(k, _)| k.starts_with(&dir))
    }

    fn notify(&mut self, key: &str, data: WatchData) {
        self.watches
            .retain(|w| !w.matches(key) || w.send(key, data.clone()));
    }

    fn put(&mut self, key: &str, contents: &[u8]) -> Version {
        let version = self.next_version();
        self.nodes
            .entry(key.to_owned())
            .or_insert_with(|| Node {
                history: Vec::new(),
            })
            .history
            .push((version, contents.to_vec()));
        self.notify(key, WatchData::value(contents.to_vec(), version));
        version
    }
}

impl Shared {
    fn remove_watch(&self, id: u64) -> Option<Watcher> {
        let mut state = self.state.lock();
        let pos = state.watches.iter().position(|w| w.id == id)?;
        Some(state.watches.swap_remove(pos))
    }
}

impl MemoryTopo {
    pub fn new() -> Self {
        Self::default()
    }

    /// A connection to `cell`.
    pub fn conn(&self, cell: &str) -> MemoryConn {
        MemoryConn {
            cell_root: format!("/{}", cell.trim_matches('/')),
            cell: cell.to_owned(),
            shared: Arc::clone(&self.shared),
            closed: AtomicBool::new(false),
        }
    }

    /// With `Some(err)`, every subsequent data operation on every connection
    /// fails with `err` until cleared with `None`.
    pub fn set_error(&self, err: Option<TopoError>) {
        *self.shared.fault.lock() = err;
    }

    /// Number of watches still registered.
    pub fn watch_count(&self) -> usize {
        self.shared.state.lock().watches.len()
    }
}

impl Factory for MemoryTopo {
    fn create(&self, cell: &str, _server_addr: &str, _root: &str) -> TopoResult<Box<dyn Conn>> {
        Ok(Box::new(self.conn(cell)))
    }
}

/// Connection to one cell of a [`MemoryTopo`].
pub struct MemoryConn {
    cell: String,
    cell_root: String,
    shared: Arc<Shared>,
    closed: AtomicBool,
}

impl fmt::Debug for MemoryConn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryConn")
            .field("cell", &self.cell)
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Copy)]
enum Acquire {
    Wait(Option<Duration>),
    Try,
    Named,
}

impl MemoryConn {
    fn key(&self, path: &str) -> String {
        match normalize(path).as_str() {
            "/" => self.cell_root.clone(),
            path => format!("{}{path}", self.cell_root),
        }
    }

    fn check(&self, ctx: &Context) -> TopoResult<()> {
        if self.closed.load(Ordering::Relaxed) {
            return Err(TopoError::Interrupted(format!(
                "connection to cell {} is closed",
                self.cell
            )));
        }
        if let Some(err) = self.shared.fault.lock().clone() {
            return Err(err);
        }
        match ctx.err() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    async fn acquire(
        &self,
        ctx: &Context,
        path: &str,
        contents: &str,
        mode: Acquire,
    ) -> TopoResult<Box<dyn LockDescriptor>> {
        self.check(ctx)?;
        let key = match mode {
            Acquire::Named => format!("named:{}", self.key(path)),
            _ => self.key(path),
        };
        let ttl = match mode {
            Acquire::Wait(ttl) => ttl,
            Acquire::Named => Some(NAMED_LOCK_TTL),
            Acquire::Try => None,
        };
        loop {
            let notified = self.shared.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let wake_at = {
                let mut state = self.shared.state.lock();
                if !matches!(mode, Acquire::Named) && !state.path_exists(&key) {
                    return Err(TopoError::NoNode(path.to_owned()));
                }
                let now = Instant::now();
                let holder = state
                    .locks
                    .get(&key)
                    .filter(|held| held.is_live(now))
                    .map(|held| (held.contents.clone(), held.expires_at));
                match holder {
                    Some((holder, _)) if matches!(mode, Acquire::Try) => {
                        return Err(TopoError::WouldBlock(format!(
                            "{path} is locked by {holder}"
                        )));
                    }
                    Some((_, expires_at)) => expires_at,
                    None => {
                        let id = state.next_id();
                        state.locks.insert(
                            key.clone(),
                            LockEntry {
                                id,
                                contents: contents.to_owned(),
                                // a ttl past the clock's range never expires
                                expires_at: ttl.and_then(|ttl| now.checked_add(ttl)),
                            },
                        );
                        debug!(cell = %self.cell, path, lock_id = id, ?ttl, "lock acquired");
                        return Ok(Box::new(MemoryLockDescriptor {
                            shared: Arc::clone(&self.shared),
                            path: path.to_owned(),
                            key,
                            id,
                        }));
                    }
                }
            };

            match wake_at {
                Some(at) => tokio::select! {
                    _ = &mut notified => {}
                    _ = tokio::time::sleep_until(at) => {}
                    err = ctx.done() => return Err(err),
                },
                None => tokio::select! {
                    _ = &mut notified => {}
                    err = ctx.done() => return Err(err),
                },
            }
        }
    }

    /// Registers a watch and spawns the task that ends it with the context.
    ///
    /// Callers hold the state lock while reading the initial value, so a
    /// concurrent write is either part of that value or delivered on the channel.
    fn register_watch(&self, state: &mut State, ctx: &Context, key: String, sender: WatchSender) {
        let stop = CancellationToken::new();
        let id = state.next_id();
        state.watches.retain(|w| match &w.sender {
            WatchSender::Node(tx) => !tx.is_closed(),
            WatchSender::Recursive(tx) => !tx.is_closed(),
        });
        state.watches.push(Watcher {
            id,
            key,
            cell_root: self.cell_root.clone(),
            sender,
            stop: stop.clone(),
        });

        let shared = Arc::clone(&self.shared);
        let ctx = ctx.clone();
        tokio::spawn(async move {
            tokio::select! {
                err = ctx.done() => {
                    if let Some(watcher) = shared.remove_watch(id) {
                        let key = watcher.key.clone();
                        watcher.send(&key, WatchData::error(err));
                    }
                }
                _ = stop.cancelled() => {}
            }
        });
    }
}

#[async_trait]
impl Conn for MemoryConn {
    async fn list_dir(
        &self,
        ctx: &Context,
        dir_path: &str,
        full: bool,
    ) -> TopoResult<Vec<DirEntry>> {
        self.check(ctx)?;
        let dir = self.key(dir_path);
        let prefix = format!("{dir}/");
        let state = self.shared.state.lock();
        let mut children = BTreeMap::new();
        for key in state.nodes.range(prefix.clone()..).map(|(k, _)| k) {
            let Some(rest) = key.strip_prefix(&prefix) else {
                break;
            };
            let (name, kind) = match rest.split_once('/') {
                Some((name, _)) => (name, DirEntryType::Directory),
                None => (rest, DirEntryType::File),
            };
            children
                .entry(name.to_owned())
                .and_modify(|t| {
                    if kind == DirEntryType::Directory {
                        *t = DirEntryType::Directory;
                    }
                })
                .or_insert(kind);
        }
        if children.is_empty() {
            return Err(TopoError::NoNode(dir_path.to_owned()));
        }
        Ok(children
            .into_iter()
            .map(|(name, entry_type)| DirEntry {
                name,
                entry_type: full.then_some(entry_type),
                ephemeral: false,
            })
            .collect())
    }

    async fn create(&self, ctx: &Context, file_path: &str, contents: &[u8]) -> TopoResult<Version> {
        self.check(ctx)?;
        let key = self.key(file_path);
        let mut state = self.shared.state.lock();
        if state.nodes.contains_key(&key) {
            return Err(TopoError::NodeExists(file_path.to_owned()));
        }
        Ok(state.put(&key, contents))
    }

    async fn update(
        &self,
        ctx: &Context,
        file_path: &str,
        contents: &[u8],
        version: Option<Version>,
    ) -> TopoResult<Version> {
        self.check(ctx)?;
        let key = self.key(file_path);
        let mut state = self.shared.state.lock();
        if let Some(expected) = version {
            let node = state
                .nodes
                .get(&key)
                .ok_or_else(|| TopoError::NoNode(file_path.to_owned()))?;
            let (_, current) = node.current();
            if current != expected {
                return Err(TopoError::BadVersion(format!(
                    "{file_path}: expected version {expected}, found {current}"
                )));
            }
        }
        Ok(state.put(&key, contents))
    }

    async fn get(&self, ctx: &Context, file_path: &str) -> TopoResult<(Vec<u8>, Version)> {
        self.check(ctx)?;
        let state = self.shared.state.lock();
        let node = state
            .nodes
            .get(&self.key(file_path))
            .ok_or_else(|| TopoError::NoNode(file_path.to_owned()))?;
        let (contents, version) = node.current();
        Ok((contents.to_vec(), version))
    }

    async fn get_version(
        &self,
        ctx: &Context,
        file_path: &str,
        version: i64,
    ) -> TopoResult<Vec<u8>> {
        self.check(ctx)?;
        let state = self.shared.state.lock();
        state
            .nodes
            .get(&self.key(file_path))
            .and_then(|node| {
                node.history
                    .iter()
                    .find(|(v, _)| i64::try_from(v.get()).is_ok_and(|v| v == version))
            })
            .map(|(_, contents)| contents.clone())
            .ok_or_else(|| TopoError::NoNode(format!("{file_path} at version {version}")))
    }

    async fn list(&self, ctx: &Context, file_path_prefix: &str) -> TopoResult<Vec<KvInfo>> {
        self.check(ctx)?;
        let prefix = match file_path_prefix.strip_prefix('/') {
            Some(rest) => format!("{}/{rest}", self.cell_root),
            None => format!("{}/{file_path_prefix}", self.cell_root),
        };
        let state = self.shared.state.lock();
        let entries = state
            .nodes
            .range(prefix.clone()..)
            .take_while(|(k, _)| k.starts_with(&prefix))
            .map(|(key, node)| {
                let (value, version) = node.current();
                KvInfo {
                    key: relative(key, &self.cell_root),
                    value: value.to_vec(),
                    version,
                }
            })
            .collect::<Vec<_>>();
        if entries.is_empty() {
            return Err(TopoError::NoNode(file_path_prefix.to_owned()));
        }
        Ok(entries)
    }

    async fn delete(
        &self,
        ctx: &Context,
        file_path: &str,
        version: Option<Version>,
    ) -> TopoResult<()> {
        self.check(ctx)?;
        let key = self.key(file_path);
        let mut state = self.shared.state.lock();
        let Some(node) = state.nodes.get(&key) else {
            // only an implicit directory over other nodes
            if state.path_exists(&key) {
                return Err(TopoError::NodeNotEmpty(file_path.to_owned()));
            }
            return Err(TopoError::NoNode(file_path.to_owned()));
        };
        if let Some(expected) = version {
            let (_, current) = node.current();
            if current != expected {
                return Err(TopoError::BadVersion(format!(
                    "{file_path}: expected version {expected}, found {current}"
                )));
            }
        }
        state.nodes.remove(&key);
        state.notify(&key, WatchData::error(TopoError::NoNode(file_path.to_owned())));
        Ok(())
    }

    async fn lock(
        &self,
        ctx: &Context,
        dir_path: &str,
        contents: &str,
    ) -> TopoResult<Box<dyn LockDescriptor>> {
        self.acquire(ctx, dir_path, contents, Acquire::Wait(None))
            .await
    }

    async fn lock_with_ttl(
        &self,
        ctx: &Context,
        dir_path: &str,
        contents: &str,
        ttl: Duration,
    ) -> TopoResult<Box<dyn LockDescriptor>> {
        let ttl = (!ttl.is_zero()).then_some(ttl);
        self.acquire(ctx, dir_path, contents, Acquire::Wait(ttl))
            .await
    }

    async fn lock_name(
        &self,
        ctx: &Context,
        dir_path: &str,
        contents: &str,
    ) -> TopoResult<Box<dyn LockDescriptor>> {
        self.acquire(ctx, dir_path, contents, Acquire::Named).await
    }

    async fn try_lock(
        &self,
        ctx: &Context,
        dir_path: &str,
        contents: &str,
    ) -> TopoResult<Box<dyn LockDescriptor>> {
        self.acquire(ctx, dir_path, contents, Acquire::Try).await
    }

    async fn watch(&self, ctx: &Context, file_path: &str) -> TopoResult<(WatchData, WatchChannel)> {
        self.check(ctx)?;
        let key = self.key(file_path);
        let (tx, rx) = mpsc::channel(WATCH_CHANNEL_SIZE);
        let mut state = self.shared.state.lock();
        let node = state
            .nodes
            .get(&key)
            .ok_or_else(|| TopoError::NoNode(file_path.to_owned()))?;
        let (contents, version) = node.current();
        let current = WatchData::value(contents.to_vec(), version);
        self.register_watch(&mut state, ctx, key, WatchSender::Node(tx));
        Ok((current, rx))
    }

    async fn watch_recursive(
        &self,
        ctx: &Context,
        path: &str,
    ) -> TopoResult<(Vec<WatchDataRecursive>, WatchRecursiveChannel)> {
        self.check(ctx)?;
        let key = self.key(path);
        let (tx, rx) = mpsc::channel(WATCH_CHANNEL_SIZE);
        let mut state = self.shared.state.lock();
        let current = state
            .nodes
            .range(key.clone()..)
            .take_while(|(k, _)| k.starts_with(&key))
            .filter(|(k, _)| is_under(k, &key))
            .map(|(k, node)| {
                let (contents, version) = node.current();
                WatchDataRecursive {
                    path: relative(k, &self.cell_root),
                    data: WatchData::value(contents.to_vec(), version),
                }
            })
            .collect::<Vec<_>>();
        self.register_watch(&mut state, ctx, key, WatchSender::Recursive(tx));
        Ok((current, rx))
    }

    fn new_leader_participation(
        &self,
        name: &str,
        id: &str,
    ) -> TopoResult<Box<dyn LeaderParticipation>> {
        self.check(&Context::background())?;
        Ok(Box::new(MemoryParticipation {
            shared: Arc::clone(&self.shared),
            key: format!("{}/elections/{name}", self.cell_root),
            id: id.to_owned(),
            stop: CancellationToken::new(),
            leadership: Mutex::new(None),
        }))
    }

    fn close(&self) {
        debug!(cell = %self.cell, "closing memory topo connection");
        self.closed.store(true, Ordering::Relaxed);
    }
}

/// Lock held in a [`MemoryTopo`].
#[derive(Debug)]
pub struct MemoryLockDescriptor {
    shared: Arc<Shared>,
    path: String,
    key: String,
    id: u64,
}

#[async_trait]
impl LockDescriptor for MemoryLockDescriptor {
    async fn check(&self, _ctx: &Context) -> TopoResult<()> {
        let state = self.shared.state.lock();
        match state.locks.get(&self.key) {
            Some(held) if held.id == self.id && held.is_live(Instant::now()) => Ok(()),
            _ => Err(TopoError::NoNode(format!("lock on {} was lost", self.path))),
        }
    }

    async fn unlock(&self, _ctx: &Context) -> TopoResult<()> {
        {
            let mut state = self.shared.state.lock();
            let ours = state.locks.get(&self.key).is_some_and(|held| held.id == self.id);
            if !ours {
                return Err(TopoError::NoNode(format!(
                    "lock on {} is not held",
                    self.path
                )));
            }
            state.locks.remove(&self.key);
        }
        self.shared.changed.notify_waiters();
        Ok(())
    }
}

/// Participant in a [`MemoryTopo`] election.
#[derive(Debug)]
pub struct MemoryParticipation {
    shared: Arc<Shared>,
    key: String,
    id: String,
    stop: CancellationToken,
    leadership: Mutex<Option<Context>>,
}

#[async_trait]
impl LeaderParticipation for MemoryParticipation {
    async fn wait_for_leadership(&self) -> TopoResult<Context> {
        loop {
            let notified = self.shared.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.stop.is_cancelled() {
                return Err(TopoError::Interrupted(format!(
                    "participation of {} in {} was stopped",
                    self.id, self.key
                )));
            }
            {
                let mut state = self.shared.state.lock();
                let vacant = state
                    .elections
                    .get(&self.key)
                    .is_none_or(|leader| *leader == self.id);
                if vacant {
                    state.elections.insert(self.key.clone(), self.id.clone());
                    drop(state);
                    debug!(election = %self.key, id = %self.id, "leadership acquired");
                    let mut leadership = self.leadership.lock();
                    let ctx = leadership
                        .get_or_insert_with(Context::background)
                        .clone();
                    return Ok(ctx);
                }
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = self.stop.cancelled() => {}
            }
        }
    }

    fn stop(&self) {
        self.stop.cancel();
        {
            let mut state = self.shared.state.lock();
            if state.elections.get(&self.key) == Some(&self.id) {
                state.elections.remove(&self.key);
            }
        }
        if let Some(ctx) = self.leadership.lock().take() {
            ctx.cancel();
        }
        self.shared.changed.notify_waiters();
    }

    async fn current_leader_id(&self, ctx: &Context) -> TopoResult<String> {
        if let Some(err) = ctx.err() {
            return Err(err);
        }
        let state = self.shared.state.lock();
        Ok(state.elections.get(&self.key).cloned().unwrap_or_default())
    }
}
