//! The `RemoteStoreClient` trait (§4.A): the seam between the watcher loop
//! and whatever concrete client speaks to the remote hierarchical store.
//! This crate never implements it against a real transport — that binding
//! lives outside this reconciliation core. [`crate::testing::FakeStoreClient`]
//! is the only implementation in this workspace, used by tests.

use std::time::Duration;

use async_trait::async_trait;
use sync_types::{
    Event,
    Hwm,
};

/// Failure modes the watcher loop distinguishes when driving a client.
///
/// The distinctions matter: [`StoreError::ConnectionFailed`] and
/// [`StoreError::Generic`] are retried with a flat delay,
/// [`StoreError::ClusterIdChanged`] and [`StoreError::EventIndexCleared`]
/// force a resync (the store told us our event history is no longer valid),
/// [`StoreError::KeyNotFound`] on a `wait` call means the watched prefix
/// itself was removed, which also forces a resync, and
/// [`StoreError::ReadTimeout`] is the one variant the watcher does not treat
/// as a failure at all — it means "no news yet", and the loop immediately
/// issues another `wait` from the same index.
#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    #[error("connection to remote store failed: {cause}")]
    ConnectionFailed { cause: String },

    #[error("remote store cluster id changed, event history is no longer valid")]
    ClusterIdChanged,

    #[error("requested event index has been compacted out of the remote store's history")]
    EventIndexCleared,

    #[error("watched key {key:?} no longer exists")]
    KeyNotFound { key: String },

    #[error("wait call's read timeout elapsed with no event")]
    ReadTimeout,

    #[error("remote store call failed: {0}")]
    Generic(String),
}

/// One leaf read while streaming a snapshot: see [`crate::snapshot::Leaf`].
pub use crate::snapshot::Leaf;

/// A snapshot response: the store index the snapshot was taken at, plus a
/// stream of leaves read under it. The watcher applies every leaf to the
/// high-water tracker (seeded at `index`) before switching to polling.
pub struct Snapshot<S> {
    pub index: Hwm,
    /// The remote store's cluster identity at snapshot time, if the client
    /// implementation tracks one. Carried forward by the watcher across a
    /// reconnect when `carry_cluster_identity` is set, so a later `wait`
    /// reporting a different identity can be distinguished from the first
    /// observation.
    pub cluster_id: Option<String>,
    pub leaves: S,
}

/// Abstraction over a client for a remote etcd-like hierarchical key/value
/// store. Implementations own their own connection pooling/retries at the
/// transport level; this trait only needs to expose the two RPCs the watcher
/// loop drives directly.
#[async_trait]
pub trait RemoteStoreClient: Send + Sync {
    type LeafStream: tokio_stream::Stream<Item = Result<Leaf, StoreError>> + Send + Unpin;

    /// Reads a full recursive snapshot of `prefix`, returning the index the
    /// snapshot was taken at and a stream of every leaf under it. The
    /// watcher consumes the stream fully before considering the snapshot
    /// load complete.
    ///
    /// `expected_cluster_id`, when `Some`, is the cluster identity the
    /// watcher observed on a previous snapshot and is carrying across this
    /// reconnect (see `Watcher::with_carry_cluster_identity`). An
    /// implementation that tracks cluster identity should validate it
    /// against the store's current one and fail with
    /// `StoreError::ClusterIdChanged` on a mismatch, so a reconnect to a
    /// different cluster than last observed is caught at snapshot time
    /// rather than surfacing later as a confusing event-index error.
    async fn snapshot(
        &self,
        prefix: &str,
        expected_cluster_id: Option<&str>,
    ) -> Result<Snapshot<Self::LeafStream>, StoreError>;

    /// Long-polls for the next change under `prefix` with index strictly
    /// greater than `from_index`. `connect_timeout` bounds the time to
    /// establish the underlying connection; `read_timeout` bounds the time
    /// waiting for a response once connected. Implementations report a
    /// `read_timeout` expiring as `Err(StoreError::ReadTimeout)`; the watcher
    /// loop treats that specific variant as "no news yet" rather than a
    /// failure, and polls again immediately from the same index.
    async fn wait(
        &self,
        prefix: &str,
        from_index: Hwm,
        recursive: bool,
        connect_timeout: Duration,
        read_timeout: Duration,
    ) -> Result<Event, StoreError>;
}
