//! # metrics
//!
//! Per-operation timing and error statistics for topology connections.
//!
//! Collectors are process-wide and lazily registered with the default
//! prometheus registry. A [`StatsConn`](crate::StatsConn) reports through a
//! [`StatsSink`], which defaults to [`PrometheusStats`].
use std::{
    fmt,
    sync::Arc,
    time::Duration,
};

use lazy_static::lazy_static;
use prometheus::{
    HistogramVec, IntCounterVec, IntGauge, register_histogram_vec, register_int_counter_vec,
    register_int_gauge,
};
use tokio::time::Instant;

lazy_static! {
    /// histogram of topology operation durations
    pub static ref TOPOLOGY_CONN_OPERATIONS: HistogramVec = register_histogram_vec!(
        "topology_conn_operations",
        "topology connection operation duration (seconds)",
        &["operation", "cell"]
    )
    .unwrap();

    /// count of topology operation errors
    pub static ref TOPOLOGY_CONN_ERRORS: IntCounterVec = register_int_counter_vec!(
        "topology_conn_errors",
        "topology connection errors per operation",
        &["operation", "cell"]
    )
    .unwrap();

    /// histogram of time spent waiting on the read gate
    pub static ref TOPOLOGY_CONN_READ_WAITS: HistogramVec = register_histogram_vec!(
        "topology_conn_read_waits",
        "topology connection read gate wait (seconds)",
        &["operation", "cell"]
    )
    .unwrap();

    /// # of read gate slots currently held
    pub static ref READ_PERMITS_IN_USE: IntGauge = register_int_gauge!(
        "topology_read_permits_in_use",
        "count of read gate slots currently held"
    )
    .unwrap();
}

/// Operation name a metrics sample is labeled with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    ListDir,
    Create,
    Update,
    Get,
    GetVersion,
    List,
    Delete,
    Lock,
    LockWithTtl,
    LockName,
    Watch,
    WatchRecursive,
    NewLeaderParticipation,
    Close,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::ListDir => "ListDir",
            Operation::Create => "Create",
            Operation::Update => "Update",
            Operation::Get => "Get",
            Operation::GetVersion => "GetVersion",
            Operation::List => "List",
            Operation::Delete => "Delete",
            Operation::Lock => "Lock",
            Operation::LockWithTtl => "LockWithTTL",
            Operation::LockName => "LockName",
            Operation::Watch => "Watch",
            Operation::WatchRecursive => "WatchRecursive",
            Operation::NewLeaderParticipation => "NewLeaderParticipation",
            Operation::Close => "Close",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Destination for facade statistics, keyed by `(operation, cell)`.
pub trait StatsSink: Send + Sync + fmt::Debug {
    /// execution time of one operation
    fn record_timing(&self, op: Operation, cell: &str, elapsed: Duration);
    /// time a read spent queued on the read gate
    fn record_read_wait(&self, op: Operation, cell: &str, elapsed: Duration);
    /// one failed delegated call
    fn add_error(&self, op: Operation, cell: &str);
}

/// Sink backed by the process-wide prometheus collectors above.
#[derive(Debug, Default, Clone, Copy)]
pub struct PrometheusStats;

impl StatsSink for PrometheusStats {
    fn record_timing(&self, op: Operation, cell: &str, elapsed: Duration) {
        TOPOLOGY_CONN_OPERATIONS
            .with_label_values(&[op.as_str(), cell])
            .observe(elapsed.as_secs_f64());
    }

    fn record_read_wait(&self, op: Operation, cell: &str, elapsed: Duration) {
        TOPOLOGY_CONN_READ_WAITS
            .with_label_values(&[op.as_str(), cell])
            .observe(elapsed.as_secs_f64());
    }

    fn add_error(&self, op: Operation, cell: &str) {
        TOPOLOGY_CONN_ERRORS
            .with_label_values(&[op.as_str(), cell])
            .inc();
    }
}

/// Records one execution sample when dropped, so every exit path is timed.
pub(crate) struct OpTimer<'a> {
    sink: &'a Arc<dyn StatsSink>,
    op: Operation,
    cell: &'a str,
    start: Instant,
}

impl<'a> OpTimer<'a> {
    pub(crate) fn start(sink: &'a Arc<dyn StatsSink>, op: Operation, cell: &'a str) -> Self {
        Self {
            sink,
            op,
            cell,
            start: Instant::now(),
        }
    }
}

impl Drop for OpTimer<'_> {
    fn drop(&mut self) {
        self.sink
            .record_timing(self.op, self.cell, self.start.elapsed());
    }
}
