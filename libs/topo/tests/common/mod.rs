#![allow(dead_code)]

use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use parking_lot::Mutex;
use tokio::sync::mpsc;
use topo::{
    Conn, Context, DirEntry, KvInfo, LeaderParticipation, LockDescriptor, Operation, StatsSink,
    TopoError, TopoResult, Version, WatchChannel, WatchData, WatchDataRecursive,
    WatchRecursiveChannel,
};

/// Shared view of what a [`MockConn`] was asked to do.
#[derive(Debug, Default)]
pub struct Calls {
    counts: Mutex<HashMap<&'static str, usize>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    watch_tx: Mutex<Option<mpsc::Sender<WatchData>>>,
}

impl Calls {
    pub fn count(&self, method: &str) -> usize {
        self.counts
            .lock()
            .get(method)
            .copied()
            .unwrap_or_default()
    }

    pub fn total(&self) -> usize {
        self.counts.lock().values().sum()
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    /// Sender feeding the stream handed out by the last `watch`.
    pub fn watch_sender(&self) -> mpsc::Sender<WatchData> {
        self.watch_tx
            .lock()
            .clone()
            .expect("watch was called")
    }

    fn hit(&self, method: &'static str) {
        *self.counts.lock().entry(method).or_default() += 1;
    }
}

/// Test double counting every call, optionally failing or slowing reads.
#[derive(Debug, Clone)]
pub struct MockConn {
    calls: Arc<Calls>,
    fail: Option<TopoError>,
    read_delay: Duration,
    value: (Vec<u8>, Version),
}

impl MockConn {
    pub fn new() -> (Self, Arc<Calls>) {
        let calls = Arc::new(Calls::default());
        let conn = Self {
            calls: Arc::clone(&calls),
            fail: None,
            read_delay: Duration::ZERO,
            value: (b"v1".to_vec(), Version::new(7)),
        };
        (conn, calls)
    }

    pub fn failing(mut self, err: TopoError) -> Self {
        self.fail = Some(err);
        self
    }

    pub fn with_read_delay(mut self, delay: Duration) -> Self {
        self.read_delay = delay;
        self
    }

    fn outcome<T>(&self, ok: T) -> TopoResult<T> {
        match &self.fail {
            Some(err) => Err(err.clone()),
            None => Ok(ok),
        }
    }

    async fn read<T>(&self, method: &'static str, ok: T) -> TopoResult<T> {
        self.calls.hit(method);
        let now = self.calls.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.calls.max_in_flight.fetch_max(now, Ordering::SeqCst);
        if !self.read_delay.is_zero() {
            tokio::time::sleep(self.read_delay).await;
        }
        self.calls.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.outcome(ok)
    }

    fn locked(&self, method: &'static str) -> TopoResult<Box<dyn LockDescriptor>> {
        self.calls.hit(method);
        self.outcome(Box::new(MockLock) as Box<dyn LockDescriptor>)
    }
}

#[derive(Debug)]
pub struct MockLock;

#[async_trait::async_trait]
impl LockDescriptor for MockLock {
    async fn check(&self, _ctx: &Context) -> TopoResult<()> {
        Ok(())
    }

    async fn unlock(&self, _ctx: &Context) -> TopoResult<()> {
        Ok(())
    }
}

#[derive(Debug)]
pub struct MockParticipation;

#[async_trait::async_trait]
impl LeaderParticipation for MockParticipation {
    async fn wait_for_leadership(&self) -> TopoResult<Context> {
        Ok(Context::background())
    }

    fn stop(&self) {}

    async fn current_leader_id(&self, _ctx: &Context) -> TopoResult<String> {
        Ok("mock".into())
    }
}

#[async_trait::async_trait]
impl Conn for MockConn {
    async fn list_dir(
        &self,
        _ctx: &Context,
        dir_path: &str,
        _full: bool,
    ) -> TopoResult<Vec<DirEntry>> {
        let entry = DirEntry {
            name: dir_path.to_owned(),
            entry_type: None,
            ephemeral: false,
        };
        self.read("list_dir", vec![entry]).await
    }

    async fn create(&self, _ctx: &Context, _path: &str, _contents: &[u8]) -> TopoResult<Version> {
        self.calls.hit("create");
        self.outcome(Version::new(1))
    }

    async fn update(
        &self,
        _ctx: &Context,
        _path: &str,
        _contents: &[u8],
        _version: Option<Version>,
    ) -> TopoResult<Version> {
        self.calls.hit("update");
        self.outcome(Version::new(2))
    }

    async fn get(&self, _ctx: &Context, _path: &str) -> TopoResult<(Vec<u8>, Version)> {
        self.read("get", self.value.clone()).await
    }

    async fn get_version(
        &self,
        _ctx: &Context,
        _path: &str,
        _version: i64,
    ) -> TopoResult<Vec<u8>> {
        self.read("get_version", self.value.0.clone()).await
    }

    async fn list(&self, _ctx: &Context, prefix: &str) -> TopoResult<Vec<KvInfo>> {
        let info = KvInfo {
            key: prefix.to_owned(),
            value: self.value.0.clone(),
            version: self.value.1,
        };
        self.read("list", vec![info]).await
    }

    async fn delete(&self, _ctx: &Context, _path: &str, _version: Option<Version>) -> TopoResult<()> {
        self.calls.hit("delete");
        self.outcome(())
    }

    async fn lock(&self, _ctx: &Context, _path: &str, _contents: &str) -> TopoResult<Box<dyn LockDescriptor>> {
        self.locked("lock")
    }

    async fn lock_with_ttl(
        &self,
        _ctx: &Context,
        _path: &str,
        _contents: &str,
        _ttl: Duration,
    ) -> TopoResult<Box<dyn LockDescriptor>> {
        self.locked("lock_with_ttl")
    }

    async fn lock_name(&self, _ctx: &Context, _path: &str, _contents: &str) -> TopoResult<Box<dyn LockDescriptor>> {
        self.locked("lock_name")
    }

    async fn try_lock(&self, _ctx: &Context, _path: &str, _contents: &str) -> TopoResult<Box<dyn LockDescriptor>> {
        self.locked("try_lock")
    }

    async fn watch(&self, _ctx: &Context, _path: &str) -> TopoResult<(WatchData, WatchChannel)> {
        self.calls.hit("watch");
        let (tx, rx) = mpsc::channel(8);
        *self.calls.watch_tx.lock() = Some(tx);
        let current = WatchData::value(self.value.0.clone(), self.value.1);
        self.outcome((current, rx))
    }

    async fn watch_recursive(
        &self,
        _ctx: &Context,
        path: &str,
    ) -> TopoResult<(Vec<WatchDataRecursive>, WatchRecursiveChannel)> {
        self.calls.hit("watch_recursive");
        let (_tx, rx) = mpsc::channel(8);
        let current = WatchDataRecursive {
            path: path.to_owned(),
            data: WatchData::value(self.value.0.clone(), self.value.1),
        };
        self.outcome((vec![current], rx))
    }

    fn new_leader_participation(
        &self,
        _name: &str,
        _id: &str,
    ) -> TopoResult<Box<dyn LeaderParticipation>> {
        self.calls.hit("new_leader_participation");
        self.outcome(Box::new(MockParticipation) as Box<dyn LeaderParticipation>)
    }

    fn close(&self) {
        self.calls.hit("close");
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    Timing,
    ReadWait,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sample {
    pub kind: Kind,
    pub op: Operation,
    pub cell: String,
    pub elapsed: Duration,
}

/// Sink keeping every sample in memory.
#[derive(Debug, Default)]
pub struct RecordingSink {
    samples: Mutex<Vec<Sample>>,
}

impl RecordingSink {
    pub fn samples(&self) -> Vec<Sample> {
        self.samples.lock().clone()
    }

    pub fn count(&self, kind: Kind, op: Operation) -> usize {
        self.samples
            .lock()
            .iter()
            .filter(|s| s.kind == kind && s.op == op)
            .count()
    }

    pub fn of_kind(&self, kind: Kind) -> Vec<Sample> {
        self.samples
            .lock()
            .iter()
            .filter(|s| s.kind == kind)
            .cloned()
            .collect()
    }

    fn push(&self, kind: Kind, op: Operation, cell: &str, elapsed: Duration) {
        self.samples.lock().push(Sample {
            kind,
            op,
            cell: cell.to_owned(),
            elapsed,
        });
    }
}

impl StatsSink for RecordingSink {
    fn record_timing(&self, op: Operation, cell: &str, elapsed: Duration) {
        self.push(Kind::Timing, op, cell, elapsed);
    }

    fn record_read_wait(&self, op: Operation, cell: &str, elapsed: Duration) {
        self.push(Kind::ReadWait, op, cell, elapsed);
    }

    fn add_error(&self, op: Operation, cell: &str) {
        self.push(Kind::Error, op, cell, Duration::ZERO);
    }
}
