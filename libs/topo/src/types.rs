//! Values exchanged with a coordination store.
use std::fmt;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::context::Context;
use crate::error::{TopoError, TopoResult};

/// Opaque version token of a stored node.
///
/// Only the store interprets it; callers hand it back unchanged for
/// optimistic `update`/`delete`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Version(u64);

impl Version {
    pub const fn new(v: u64) -> Self {
        Self(v)
    }

    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for Version {
    fn from(v: u64) -> Self {
        Self(v)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirEntryType {
    File,
    Directory,
}

/// One child of a directory listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    /// only populated for `full` listings
    pub entry_type: Option<DirEntryType>,
    pub ephemeral: bool,
}

/// A key/value pair returned by a prefix listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KvInfo {
    pub key: String,
    pub value: Vec<u8>,
    pub version: Version,
}

/// A watched node's value, or the error that ended the watch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchData {
    pub contents: Vec<u8>,
    pub version: Version,
    /// set on the last message of a stream
    pub err: Option<TopoError>,
}

impl WatchData {
    pub fn value(contents: Vec<u8>, version: Version) -> Self {
        Self {
            contents,
            version,
            err: None,
        }
    }

    pub fn error(err: TopoError) -> Self {
        Self {
            contents: Vec::new(),
            version: Version::default(),
            err: Some(err),
        }
    }
}

/// A change under a recursively watched prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchDataRecursive {
    pub path: String,
    pub data: WatchData,
}

/// Change stream returned by `watch`. Owned by the connection that made it.
pub type WatchChannel = mpsc::Receiver<WatchData>;

/// Change stream returned by `watch_recursive`.
pub type WatchRecursiveChannel = mpsc::Receiver<WatchDataRecursive>;

/// Handle to an acquired distributed lock.
#[async_trait]
pub trait LockDescriptor: Send + Sync + fmt::Debug {
    /// Returns an error if the lock is no longer held.
    async fn check(&self, ctx: &Context) -> TopoResult<()>;
    /// Releases the lock.
    async fn unlock(&self, ctx: &Context) -> TopoResult<()>;
}

/// Registration in a leader election for one election name.
#[async_trait]
pub trait LeaderParticipation: Send + Sync + fmt::Debug {
    /// Blocks until this participant is leader. The returned context is
    /// cancelled when leadership is lost or [`stop`](Self::stop) is called.
    async fn wait_for_leadership(&self) -> TopoResult<Context>;
    /// Leaves the election, giving up leadership if held.
    fn stop(&self);
    /// Id of the current leader, empty if there is none.
    async fn current_leader_id(&self, ctx: &Context) -> TopoResult<String>;
}
