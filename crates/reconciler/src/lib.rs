//! Snapshot/event reconciliation core for a dataplane agent that mirrors a
//! remote hierarchical key/value store into local state. Two subsystems:
//! the [`hwm`] module resolves the race between a recursive snapshot and a
//! concurrently-streamed event log into one consistent index per key, and
//! the [`watcher`] module drives the connect/snapshot/poll session that
//! feeds it, dispatching each event through [`dispatch::PathDispatcher`].
//!
//! This crate stops at the [`client::RemoteStoreClient`] seam: it never
//! implements a concrete transport, and it never programs ipset/iptables or
//! any other local dataplane state. Those are external collaborators.

pub mod client;
pub mod dispatch;
pub mod hwm;
pub mod snapshot;
pub mod watcher;

#[cfg(any(test, feature = "testing"))]
pub mod testing;
