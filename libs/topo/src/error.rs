//! Error types for coordination-store operations.
//!
//! Underlying connections report failures with these variants and the
//! [`StatsConn`] facade passes them through untouched. The facade only ever
//! raises two errors of its own: [`TopoError::ReadOnly`] before a mutation
//! reaches the store, and the cancellation errors produced while a read waits
//! on the admission gate.
//!
//! [`StatsConn`]: crate::StatsConn

use thiserror::Error;

/// Top-level error type for the topo crate.
///
/// `Clone` so that watch channels can carry the terminal error of a stream.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TopoError {
    /// Node already exists (create on an existing path, or a held lock).
    #[error("node already exists: {0}")]
    NodeExists(String),

    /// Node does not exist.
    #[error("node doesn't exist: {0}")]
    NoNode(String),

    /// Directory is not empty.
    #[error("node not empty: {0}")]
    NodeNotEmpty(String),

    /// Caller's version token does not match the store's current one.
    #[error("bad node version: {0}")]
    BadVersion(String),

    /// Deadline elapsed before the operation completed.
    #[error("deadline exceeded: {0}")]
    Timeout(String),

    /// Operation was cancelled by its context or the connection was closed.
    #[error("interrupted: {0}")]
    Interrupted(String),

    /// Non-blocking lock attempt found the lock held.
    #[error("lock would block: {0}")]
    WouldBlock(String),

    /// Mutation rejected locally because the connection is read-only.
    #[error(
        "cannot perform {operation} on {path} as the topology server connection is read-only"
    )]
    ReadOnly { operation: String, path: String },

    /// Requested implementation is not registered.
    #[error("no such topology implementation: {0}")]
    NoImplementation(String),

    /// Transport or backend failure from the remote store.
    #[error("backend error: {0}")]
    Backend(String),
}

impl TopoError {
    /// Returns true if this error was raised by the read-only gate.
    pub fn is_read_only(&self) -> bool {
        matches!(self, TopoError::ReadOnly { .. })
    }

    /// Returns true if the target node does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(self, TopoError::NoNode(_))
    }

    /// Returns true for context cancellation or an elapsed deadline.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, TopoError::Interrupted(_) | TopoError::Timeout(_))
    }

    /// Returns true if this error indicates a transient failure that may
    /// succeed on retry (timeout, contention, or backend failure).
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TopoError::Timeout(_)
                | TopoError::WouldBlock(_)
                | TopoError::BadVersion(_)
                | TopoError::Backend(_)
        )
    }
}

/// Shorthand result alias for topo operations.
pub type TopoResult<T> = Result<T, TopoError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        let read_only = TopoError::ReadOnly {
            operation: "Create".into(),
            path: "/keyspaces/ks".into(),
        };
        assert!(read_only.is_read_only());
        assert!(!read_only.is_retryable());
        assert!(!read_only.is_cancelled());

        let no_node = TopoError::NoNode("/a".into());
        assert!(no_node.is_not_found());
        assert!(!no_node.is_retryable());

        assert!(TopoError::Interrupted("cancelled".into()).is_cancelled());
        assert!(TopoError::Timeout("deadline".into()).is_cancelled());
        assert!(TopoError::Timeout("deadline".into()).is_retryable());
        assert!(TopoError::WouldBlock("/locks/a".into()).is_retryable());
        assert!(!TopoError::NodeExists("/a".into()).is_retryable());
    }

    #[test]
    fn test_read_only_display() {
        let err = TopoError::ReadOnly {
            operation: "LockWithTTL".into(),
            path: "/keyspaces/ks".into(),
        };
        assert_eq!(
            err.to_string(),
            "cannot perform LockWithTTL on /keyspaces/ks as the topology server connection is read-only"
        );
    }
}
