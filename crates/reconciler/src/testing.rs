//! Test-only scaffolding: an in-memory [`RemoteStoreClient`] fixture and a
//! bounded-mailbox consumer harness, analogous to the teacher's
//! `convex::sync::testing` module. Neither type is meant for production use;
//! this crate implements no real transport or dataplane actor.

use std::{
    collections::VecDeque,
    time::Duration,
};

use async_trait::async_trait;
use parking_lot::Mutex;
use sync_types::{
    Event,
    Hwm,
};
use tokio::sync::mpsc;

use crate::{
    client::{
        RemoteStoreClient,
        Snapshot,
        StoreError,
    },
    snapshot::Leaf,
};

/// An in-memory [`RemoteStoreClient`] driven entirely by pre-seeded fixtures.
/// `snapshot` consults a keyed table of canned snapshots; `wait` drains a
/// FIFO queue of canned outcomes, panicking if the queue runs dry (a test
/// bug, not a runtime condition to handle gracefully).
pub struct FakeStoreClient {
    snapshots: Mutex<std::collections::HashMap<String, (Hwm, Option<String>, Vec<Leaf>)>>,
    wait_outcomes: Mutex<VecDeque<Result<Event, StoreError>>>,
}

impl FakeStoreClient {
    pub fn new() -> Self {
        Self {
            snapshots: Mutex::new(std::collections::HashMap::new()),
            wait_outcomes: Mutex::new(VecDeque::new()),
        }
    }

    /// Registers the snapshot `snapshot(prefix)` should return.
    pub fn seed_snapshot(&self, index: Hwm, leaves: Vec<Leaf>) {
        self.seed_snapshot_for("/", index, leaves);
    }

    pub fn seed_snapshot_for(&self, prefix: &str, index: Hwm, leaves: Vec<Leaf>) {
        self.snapshots
            .lock()
            .insert(prefix.to_string(), (index, None, leaves));
    }

    /// Like [`Self::seed_snapshot_for`], but also stamps the snapshot with a
    /// cluster identity, so a watcher carrying its previously observed
    /// identity can be exercised against a mismatch.
    pub fn seed_snapshot_with_cluster_id(
        &self,
        prefix: &str,
        index: Hwm,
        cluster_id: impl Into<String>,
        leaves: Vec<Leaf>,
    ) {
        self.snapshots
            .lock()
            .insert(prefix.to_string(), (index, Some(cluster_id.into()), leaves));
    }

    pub fn push_event(&self, event: Event) {
        self.wait_outcomes.lock().push_back(Ok(event));
    }

    pub fn push_read_timeout(&self) {
        self.wait_outcomes.lock().push_back(Err(StoreError::ReadTimeout));
    }

    pub fn push_cluster_id_changed(&self) {
        self.wait_outcomes.lock().push_back(Err(StoreError::ClusterIdChanged));
    }

    pub fn push_wait_error(&self, error: StoreError) {
        self.wait_outcomes.lock().push_back(Err(error));
    }
}

impl Default for FakeStoreClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RemoteStoreClient for FakeStoreClient {
    type LeafStream = tokio_stream::Iter<std::vec::IntoIter<Result<Leaf, StoreError>>>;

    async fn snapshot(
        &self,
        prefix: &str,
        expected_cluster_id: Option<&str>,
    ) -> Result<Snapshot<Self::LeafStream>, StoreError> {
        let (index, cluster_id, leaves) = self
            .snapshots
            .lock()
            .get(prefix)
            .cloned()
            .unwrap_or((0, None, Vec::new()));
        if let (Some(expected), Some(actual)) = (expected_cluster_id, &cluster_id) {
            if expected != actual {
                return Err(StoreError::ClusterIdChanged);
            }
        }
        let leaves: Vec<Result<Leaf, StoreError>> = leaves.into_iter().map(Ok).collect();
        Ok(Snapshot {
            index,
            cluster_id,
            leaves: tokio_stream::iter(leaves),
        })
    }

    async fn wait(
        &self,
        _prefix: &str,
        _from_index: Hwm,
        _recursive: bool,
        _connect_timeout: Duration,
        _read_timeout: Duration,
    ) -> Result<Event, StoreError> {
        self.wait_outcomes
            .lock()
            .pop_front()
            .expect("FakeStoreClient::wait called with no fixture queued")
    }
}

/// A minimal bounded-mailbox consumer: demonstrates that a slow consumer
/// back-pressures a dispatcher callback blocking on `send`, per the spec's
/// concurrency notes. Not a production dataplane actor — there is no
/// equivalent of `endpoint_data_by_ep_id` or an ipset/iptables binding here,
/// only the mailbox shape itself.
pub struct MailboxConsumer {
    sender: mpsc::Sender<Event>,
}

impl MailboxConsumer {
    /// Spawns a task that drains its mailbox one event at a time, calling
    /// `on_event` for each. `capacity` bounds the mailbox; a full mailbox
    /// makes `sender().send(..)` (and therefore a dispatcher callback that
    /// awaits it) block until the consumer catches up.
    pub fn spawn<F>(capacity: usize, mut on_event: F) -> Self
    where
        F: FnMut(Event) + Send + 'static,
    {
        let (sender, mut receiver) = mpsc::channel(capacity);
        tokio::spawn(async move {
            while let Some(event) = receiver.recv().await {
                on_event(event);
            }
        });
        Self { sender }
    }

    pub fn sender(&self) -> mpsc::Sender<Event> {
        self.sender.clone()
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::Arc,
        time::Duration,
    };

    use super::*;

    #[tokio::test]
    async fn fake_snapshot_returns_seeded_leaves() {
        let client = FakeStoreClient::new();
        client.seed_snapshot(
            7,
            vec![Leaf {
                key: "/a".into(),
                value: "v".into(),
            }],
        );
        let mut snapshot = client.snapshot("/", None).await.unwrap();
        assert_eq!(snapshot.index, 7);
        use tokio_stream::StreamExt;
        let leaf = snapshot.leaves.next().await.unwrap().unwrap();
        assert_eq!(leaf.key, "/a");
    }

    #[tokio::test]
    async fn fake_wait_drains_the_queued_outcomes_in_order() {
        let client = FakeStoreClient::new();
        client.push_read_timeout();
        client.push_event(Event {
            action: "set".into(),
            key: "/a".into(),
            value: Some("v".into()),
            modified_index: 1,
        });
        let err = client
            .wait("/", 0, true, Duration::from_secs(1), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::ReadTimeout));
        let event = client
            .wait("/", 0, true, Duration::from_secs(1), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(event.key, "/a");
    }

    // Demonstrates back-pressure: a mailbox of capacity 1 makes a second
    // send block until the consumer has drained the first.
    #[tokio::test]
    async fn slow_consumer_back_pressures_the_mailbox() {
        let received: Arc<Mutex<Vec<u64>>> = Arc::new(Mutex::new(Vec::new()));
        let received_clone = received.clone();
        let consumer = MailboxConsumer::spawn(1, move |event| {
            received_clone.lock().push(event.modified_index);
        });
        for i in 0..5 {
            consumer
                .sender()
                .send(Event {
                    action: "set".into(),
                    key: "/a".into(),
                    value: None,
                    modified_index: i,
                })
                .await
                .unwrap();
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(received.lock().len(), 5);
    }
}
