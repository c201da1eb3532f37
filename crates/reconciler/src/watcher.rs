//! The Watcher Loop (§4.E): connect → snapshot → poll state machine. Owns
//! the [`crate::hwm::HighWaterTracker`] and [`crate::dispatch::PathDispatcher`]
//! exclusively and runs as a single task, modeled on the reconnect loop in
//! the teacher's sync client worker.

use std::{
    sync::{
        atomic::{
            AtomicBool,
            Ordering,
        },
        Arc,
    },
    time::Duration,
};

use sync_types::{
    Event,
    Hwm,
};
use tokio_stream::StreamExt;

use crate::{
    client::{
        RemoteStoreClient,
        Snapshot,
        StoreError,
    },
    dispatch::PathDispatcher,
    hwm::HighWaterTracker,
    snapshot::Leaf,
};

/// Connect requests time out after this long.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
/// A `wait` call with no event within this long returns
/// `StoreError::ReadTimeout`, which is not treated as a failure.
pub const READ_TIMEOUT: Duration = Duration::from_secs(90);
/// Flat retry delay after a generic connection failure, to cap load against
/// a remote store that's down.
pub const GENERIC_FAILURE_RETRY_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatcherState {
    Idle,
    Connecting,
    Snapshotting,
    Polling,
    Resyncing,
    Stopped,
}

/// Why the loop is abandoning its current snapshot/poll cycle and restarting
/// from a fresh snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResyncReason {
    /// `request_resync()` was called by some other task.
    ExternalRequest,
    ClusterIdChanged,
    EventIndexCleared,
    /// Any other store error the loop doesn't otherwise know how to recover
    /// from without rebuilding state from scratch.
    UnexpectedError,
}

/// The tagged result of one polling step, in place of the exception the
/// Python original raises to unwind out of its poll loop.
#[derive(Debug)]
pub enum PollOutcome {
    Event(Event),
    ResyncRequired(ResyncReason),
    Stop,
}

#[derive(thiserror::Error, Debug)]
pub enum WatcherError {
    /// A key encountered during snapshot ingestion failed validation. Per
    /// the crate's error taxonomy this is a programmer error (the remote
    /// store sent a key outside the accepted character set) and is not
    /// swallowed — it propagates out of `run` and terminates the loop.
    #[error(transparent)]
    InvalidKey(#[from] sync_types::InvalidKey),
}

#[derive(thiserror::Error, Debug)]
enum SnapshotLoadError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    InvalidKey(#[from] sync_types::InvalidKey),
}

/// A cooperative handle to a running [`Watcher`]: cheap to clone, safe to
/// hand to any task that needs to request a resync or ask the loop to stop.
/// Mirrors the spec's "single-writer-per-call booleans with release/acquire
/// semantics" — these are the only fields written from outside the watcher's
/// own task.
#[derive(Clone)]
pub struct WatcherHandle {
    resync_after_current_poll: Arc<AtomicBool>,
    stopped: Arc<AtomicBool>,
}

impl WatcherHandle {
    /// Creates a detached handle with its own fresh flags. Pass it to
    /// [`Watcher::with_handle`] to wire a shutdown/resync trigger up before
    /// the watcher it controls exists yet — e.g. to capture it in dispatcher
    /// callbacks that themselves need to be able to stop the loop.
    pub fn new() -> Self {
        Self {
            resync_after_current_poll: Arc::new(AtomicBool::new(false)),
            stopped: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Asks the loop to abandon its current poll cycle and restart from a
    /// fresh snapshot. Takes effect at the next poll check point, not
    /// immediately.
    pub fn request_resync(&self) {
        self.resync_after_current_poll.store(true, Ordering::Release);
    }

    /// Asks the loop to stop. Cooperative: the loop finishes any in-flight
    /// I/O and returns at the next safe point (between events, or between
    /// poll iterations) rather than being aborted.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
    }
}

impl Default for WatcherHandle {
    fn default() -> Self {
        Self::new()
    }
}

/// One-leaf-at-a-time extension point fired while a snapshot is being
/// ingested, in place of the Python original's `on_snapshot_loaded(snapshot)`
/// template method (which hands the whole lazy sequence to the consumer for
/// it to drain). Since the watcher — not an overriding subclass — owns the
/// `HighWaterTracker` exclusively, the equivalent shape here is a callback
/// invoked once per leaf immediately after the tracker has recorded it.
pub type OnLeafHook = Box<dyn Fn(&Leaf) + Send + Sync>;
/// Fired once per reconnect, before the snapshot load begins. The default
/// behavior (starting deletion tracking) always runs; this hook runs in
/// addition to it.
pub type PreResyncHook = Box<dyn Fn() + Send + Sync>;

/// Drives one remote store session through connect → snapshot → poll,
/// dispatching events through a [`PathDispatcher`] and reconciling both
/// snapshot leaves and events through a [`HighWaterTracker`] it owns
/// exclusively. Runs to completion only when stopped or on a fatal
/// `WatcherError`; all other failures are retried internally.
pub struct Watcher<C: RemoteStoreClient> {
    client: Arc<C>,
    prefix: String,
    dispatcher: PathDispatcher,
    hwt: HighWaterTracker,
    state: WatcherState,
    next_index: Hwm,
    /// Whether to carry `observed_cluster_id` across a reconnect (so the
    /// next `snapshot` call can validate it) rather than starting fresh
    /// each time.
    carry_cluster_identity: bool,
    observed_cluster_id: Option<String>,
    resync_after_current_poll: Arc<AtomicBool>,
    stopped: Arc<AtomicBool>,
    on_leaf: Option<OnLeafHook>,
    pre_resync: Option<PreResyncHook>,
}

impl<C: RemoteStoreClient> Watcher<C> {
    pub fn new(client: Arc<C>, prefix: impl Into<String>, dispatcher: PathDispatcher) -> Self {
        Self::with_handle(client, prefix, dispatcher, WatcherHandle::new())
    }

    /// Like [`Watcher::new`], but wired up to a [`WatcherHandle`] created
    /// ahead of time — useful when something needs to reference the handle
    /// (e.g. a dispatcher callback that stops the loop) before the watcher
    /// itself can be constructed.
    pub fn with_handle(
        client: Arc<C>,
        prefix: impl Into<String>,
        dispatcher: PathDispatcher,
        handle: WatcherHandle,
    ) -> Self {
        Self {
            client,
            prefix: prefix.into(),
            dispatcher,
            hwt: HighWaterTracker::new(),
            state: WatcherState::Idle,
            next_index: 0,
            carry_cluster_identity: false,
            observed_cluster_id: None,
            resync_after_current_poll: handle.resync_after_current_poll,
            stopped: handle.stopped,
            on_leaf: None,
            pre_resync: None,
        }
    }

    /// When `carry` is true, the cluster identity observed on the last
    /// snapshot is passed to the next reconnect's `snapshot` call as
    /// `expected_cluster_id` instead of being reset to `None`, letting a
    /// client implementation that tracks cluster identity catch a reconnect
    /// landing on a different cluster than last observed.
    pub fn with_carry_cluster_identity(mut self, carry: bool) -> Self {
        self.carry_cluster_identity = carry;
        self
    }

    pub fn with_on_leaf_hook(mut self, hook: impl Fn(&Leaf) + Send + Sync + 'static) -> Self {
        self.on_leaf = Some(Box::new(hook));
        self
    }

    pub fn with_pre_resync_hook(mut self, hook: impl Fn() + Send + Sync + 'static) -> Self {
        self.pre_resync = Some(Box::new(hook));
        self
    }

    pub fn handle(&self) -> WatcherHandle {
        WatcherHandle {
            resync_after_current_poll: self.resync_after_current_poll.clone(),
            stopped: self.stopped.clone(),
        }
    }

    pub fn state(&self) -> WatcherState {
        self.state
    }

    pub fn next_index(&self) -> Hwm {
        self.next_index
    }

    pub fn high_water_tracker(&self) -> &HighWaterTracker {
        &self.hwt
    }

    /// Polls `ready_key` (via a single-leaf snapshot read) until its value
    /// is `"true"`, sleeping `delay` between attempts, exactly matching the
    /// source's `time.sleep(retry_delay)` loop. A connection-level failure
    /// (the store itself unreachable, as opposed to merely not ready yet) is
    /// backed off separately via [`sync_types::backoff::Backoff`] rather
    /// than hammering at the fixed `delay`, since the source leaves that
    /// case's timing unspecified. Returns early if stopped while waiting.
    pub async fn wait_for_ready(&self, ready_key: &str, delay: Duration) {
        let mut unreachable_backoff =
            sync_types::backoff::Backoff::new(Duration::from_millis(100), Duration::from_secs(30));
        let mut rng = rand::rng();
        loop {
            if self.stopped.load(Ordering::Acquire) {
                return;
            }
            match self.client.snapshot(ready_key, None).await {
                Ok(mut snapshot) => {
                    unreachable_backoff.reset();
                    let ready = matches!(snapshot.leaves.next().await, Some(Ok(leaf)) if leaf.value == "true");
                    if ready {
                        tracing::info!(ready_key, "remote store is ready");
                        return;
                    }
                    tracing::debug!(ready_key, "remote store not ready yet");
                    tokio::time::sleep(delay).await;
                },
                Err(e) => {
                    let backoff = unreachable_backoff.fail(&mut rng);
                    tracing::warn!(error = %e, ?backoff, "remote store unreachable while waiting for ready");
                    tokio::time::sleep(backoff).await;
                },
            }
        }
    }

    /// Runs the connect → snapshot → poll cycle until stopped or until a
    /// key encountered along the way fails validation (a programmer error
    /// that terminates the loop rather than being retried).
    pub async fn run(&mut self) -> Result<(), WatcherError> {
        loop {
            if self.stopped.load(Ordering::Acquire) {
                self.state = WatcherState::Stopped;
                return Ok(());
            }

            self.state = WatcherState::Connecting;
            tracing::info!(prefix = %self.prefix, "connecting");
            if !self.carry_cluster_identity {
                self.observed_cluster_id = None;
            }
            if let Some(hook) = &self.pre_resync {
                hook();
            }

            self.state = WatcherState::Snapshotting;
            let snapshot = match self
                .client
                .snapshot(&self.prefix, self.observed_cluster_id.as_deref())
                .await
            {
                Ok(snapshot) => snapshot,
                Err(e) => {
                    tracing::warn!(error = %e, "snapshot request failed, restarting loop");
                    tokio::time::sleep(GENERIC_FAILURE_RETRY_DELAY).await;
                    continue;
                },
            };

            match self.load_snapshot(snapshot).await {
                Ok(()) => {},
                Err(SnapshotLoadError::InvalidKey(e)) => return Err(WatcherError::InvalidKey(e)),
                Err(SnapshotLoadError::Store(e)) => {
                    tracing::warn!(error = %e, "snapshot ingestion failed, restarting loop");
                    tokio::time::sleep(GENERIC_FAILURE_RETRY_DELAY).await;
                    continue;
                },
            }

            self.state = WatcherState::Polling;
            loop {
                if self.stopped.load(Ordering::Acquire) {
                    self.state = WatcherState::Stopped;
                    return Ok(());
                }
                match self.poll_once().await {
                    PollOutcome::Event(event) => {
                        // If a stop was requested while this wait() call was
                        // in flight, don't dispatch the event it carried.
                        if self.stopped.load(Ordering::Acquire) {
                            self.state = WatcherState::Stopped;
                            return Ok(());
                        }
                        self.dispatcher.handle_event(&event);
                        self.next_index = self.next_index.max(event.modified_index) + 1;
                    },
                    PollOutcome::ResyncRequired(reason) => {
                        tracing::info!(?reason, "resync triggered");
                        self.state = WatcherState::Resyncing;
                        break;
                    },
                    PollOutcome::Stop => {
                        self.state = WatcherState::Stopped;
                        return Ok(());
                    },
                }
            }
        }
    }

    async fn load_snapshot(&mut self, snapshot: Snapshot<C::LeafStream>) -> Result<(), SnapshotLoadError> {
        let Snapshot {
            index,
            cluster_id,
            mut leaves,
        } = snapshot;
        tracing::info!(index, "loading snapshot");
        self.hwt.start_tracking_deletions();
        while let Some(leaf) = leaves.next().await {
            let leaf = leaf?;
            self.hwt.update_hwm(&leaf.key, index)?;
            if let Some(hook) = &self.on_leaf {
                hook(&leaf);
            }
        }
        self.hwt.stop_tracking_deletions();
        // Every leaf just ingested was stamped with exactly `index`; anything
        // still below it is a key the new snapshot didn't mention and has no
        // chance of being swept by a future `store_deletion` call, since no
        // explicit delete event for it was ever observed while disconnected.
        let swept = self.hwt.remove_old_keys(index);
        if !swept.is_empty() {
            tracing::info!(count = swept.len(), "swept stale keys absent from new snapshot");
        }
        self.next_index = index + 1;
        if self.carry_cluster_identity {
            self.observed_cluster_id = cluster_id;
        }
        tracing::info!(len = self.hwt.len(), next_index = self.next_index, "snapshot loaded");
        Ok(())
    }

    /// Issues one `wait` call, transparently retrying on the two failure
    /// modes that don't require a resync: a read timeout (no news yet) and a
    /// generic connection failure (sleep, then retry). Returns as soon as a
    /// real event arrives, a resync-worthy error is seen, or a stop/resync
    /// request is observed.
    async fn poll_once(&mut self) -> PollOutcome {
        loop {
            if self.stopped.load(Ordering::Acquire) {
                return PollOutcome::Stop;
            }
            if self.resync_after_current_poll.swap(false, Ordering::AcqRel) {
                return PollOutcome::ResyncRequired(ResyncReason::ExternalRequest);
            }

            let outcome = self
                .client
                .wait(&self.prefix, self.next_index, true, CONNECT_TIMEOUT, READ_TIMEOUT)
                .await;
            match outcome {
                Ok(event) => return PollOutcome::Event(event),
                Err(StoreError::ReadTimeout) => {
                    tracing::debug!("read timeout, rebuilding connection and retrying");
                    continue;
                },
                Err(StoreError::ConnectionFailed { cause }) => {
                    tracing::warn!(cause = %cause, "connection failed, retrying");
                    tokio::time::sleep(GENERIC_FAILURE_RETRY_DELAY).await;
                    continue;
                },
                Err(StoreError::ClusterIdChanged) => {
                    return PollOutcome::ResyncRequired(ResyncReason::ClusterIdChanged)
                },
                Err(StoreError::EventIndexCleared) => {
                    return PollOutcome::ResyncRequired(ResyncReason::EventIndexCleared)
                },
                Err(StoreError::KeyNotFound { key }) => {
                    tracing::warn!(key = %key, "watched key no longer exists");
                    return PollOutcome::ResyncRequired(ResyncReason::UnexpectedError);
                },
                Err(StoreError::Generic(msg)) => {
                    tracing::warn!(error = %msg, "unexpected store error");
                    return PollOutcome::ResyncRequired(ResyncReason::UnexpectedError);
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use parking_lot::Mutex;
    use sync_types::Event;

    use super::*;
    use crate::testing::FakeStoreClient;

    fn event(action: &str, key: &str, modified_index: Hwm) -> Event {
        Event {
            action: action.to_string(),
            key: key.to_string(),
            value: Some("v".to_string()),
            modified_index,
        }
    }

    // §8 Watcher property: next_index after an event with modified_index=m
    // equals max(prev_next_index, m) + 1.
    #[tokio::test]
    async fn next_index_jump() {
        let client = Arc::new(FakeStoreClient::new());
        client.seed_snapshot(0, vec![]);
        client.push_event(event("set", "/a", 42));
        let mut watcher = Watcher::new(client, "/", PathDispatcher::new());
        watcher.next_index = 5;
        let outcome = watcher.poll_once().await;
        match outcome {
            PollOutcome::Event(e) => {
                watcher.next_index = watcher.next_index.max(e.modified_index) + 1;
            },
            other => panic!("expected an event, got {other:?}"),
        }
        assert_eq!(watcher.next_index, 43);
    }

    // §8 Watcher property: a read timeout produces no dispatch and
    // preserves next_index.
    #[tokio::test]
    async fn read_timeout_preserves_next_index_and_dispatches_nothing() {
        let dispatched = Arc::new(Mutex::new(0));
        let dispatched_clone = dispatched.clone();
        let mut dispatcher = PathDispatcher::new();
        dispatcher
            .register(
                "/a",
                Some(Box::new(move |_, _| *dispatched_clone.lock() += 1)),
                None,
            )
            .unwrap();

        let client = Arc::new(FakeStoreClient::new());
        client.push_read_timeout();
        client.push_event(event("set", "/a", 10));
        let mut watcher = Watcher::new(client, "/", dispatcher);
        watcher.next_index = 1;

        let outcome = watcher.poll_once().await;
        assert_eq!(*dispatched.lock(), 0);
        match outcome {
            PollOutcome::Event(e) => assert_eq!(e.modified_index, 10),
            other => panic!("expected the event behind the read timeout, got {other:?}"),
        }
        assert_eq!(watcher.next_index, 1, "poll_once never mutates next_index itself");
    }

    // §8 Watcher property: a cluster-id change raises resync without
    // dispatching.
    #[tokio::test]
    async fn cluster_id_change_raises_resync_without_dispatching() {
        let dispatched = Arc::new(Mutex::new(0));
        let dispatched_clone = dispatched.clone();
        let mut dispatcher = PathDispatcher::new();
        dispatcher
            .register("/a", Some(Box::new(move |_, _| *dispatched_clone.lock() += 1)), None)
            .unwrap();

        let client = Arc::new(FakeStoreClient::new());
        client.push_cluster_id_changed();
        let mut watcher = Watcher::new(client, "/", dispatcher);

        let outcome = watcher.poll_once().await;
        assert_eq!(*dispatched.lock(), 0);
        assert!(matches!(
            outcome,
            PollOutcome::ResyncRequired(ResyncReason::ClusterIdChanged)
        ));
    }

    #[tokio::test]
    async fn external_resync_request_takes_effect_before_the_next_wait_call() {
        let client = Arc::new(FakeStoreClient::new());
        // No events/timeouts queued: if poll_once tried to call wait() it
        // would panic on an empty fixture queue, proving the resync flag
        // short-circuits before reaching the client.
        let watcher = Watcher::new(client, "/", PathDispatcher::new());
        let handle = watcher.handle();
        handle.request_resync();
        let mut watcher = watcher;
        let outcome = watcher.poll_once().await;
        assert!(matches!(
            outcome,
            PollOutcome::ResyncRequired(ResyncReason::ExternalRequest)
        ));
    }

    #[tokio::test]
    async fn stop_request_is_observed_before_the_next_wait_call() {
        let client = Arc::new(FakeStoreClient::new());
        let watcher = Watcher::new(client, "/", PathDispatcher::new());
        let handle = watcher.handle();
        handle.stop();
        let mut watcher = watcher;
        let outcome = watcher.poll_once().await;
        assert!(matches!(outcome, PollOutcome::Stop));
    }
}
