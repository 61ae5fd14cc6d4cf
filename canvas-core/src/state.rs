//! # State Store
//!
//! Namespaced diagram state with subscriptions, persistence, debounced sync,
//! batching and snapshots.
//!
//! [`StateStore`] is a cheap cloneable handle. All clones share one
//! instance. Read-modify-write operations compute the new value from the
//! current one, run the validator with the lock released, and only insert
//! if no other write landed in between; otherwise they retry against the
//! fresh value. Subscriber callbacks, validators and collaborators are
//! always invoked with the lock released.
//!
//! After [`StateStore::destroy`] every operation except
//! [`StateStore::status`] returns [`CanvasError::Destroyed`].

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::clock::{current_timestamp_ms, Clock, SystemClock};
use crate::id::{SnapshotId, SubscriptionId};
use crate::namespace::{JsonCodec, Namespace, NamespaceCodec};
use crate::persistence::PersistenceBackend;
use crate::sync::{SyncFailure, SyncQueue, SyncRecord, SyncSink};
use crate::{CanvasError, CanvasResult};

const COMPONENT: &str = "StateStore";

/// Options for a single write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[allow(clippy::struct_excessive_bools)]
pub struct SetOptions {
    /// Skip subscriber notification.
    pub silent: bool,
    /// Write through to the persistence backend.
    pub persist: bool,
    /// Queue for debounced sync.
    pub sync: bool,
    /// Run the namespace validator.
    pub validate: bool,
    /// Join the open batch instead of applying immediately.
    pub batch: bool,
}

impl Default for SetOptions {
    fn default() -> Self {
        Self {
            silent: false,
            persist: true,
            sync: true,
            validate: true,
            batch: true,
        }
    }
}

impl SetOptions {
    /// Default options without notification.
    #[must_use]
    pub fn silent() -> Self {
        Self {
            silent: true,
            ..Self::default()
        }
    }

    /// Default options that stay in memory.
    #[must_use]
    pub fn transient() -> Self {
        Self {
            persist: false,
            sync: false,
            ..Self::default()
        }
    }
}

/// What produced a change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeSource {
    /// `set_state`.
    Set,
    /// `update_state`.
    Update,
    /// `merge_state`.
    Merge,
    /// `delete_state`.
    Delete,
    /// `reset_state`.
    Reset,
    /// `restore_snapshot`.
    Restore,
    /// End of a batch.
    Batch,
    /// `subscribe` with `immediate`.
    Immediate,
}

/// A change delivered to subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateChange {
    /// Namespace that changed.
    pub namespace: Namespace,
    /// Value after the change; `Null` after a whole-namespace delete.
    pub value: Value,
    /// Value before the change.
    pub previous: Option<Value>,
    /// What produced the change.
    pub source: ChangeSource,
}

type Callback = Arc<dyn Fn(&StateChange) + Send + Sync>;
type ChangeFilter = Arc<dyn Fn(&StateChange) -> bool + Send + Sync>;
type Validator = Arc<dyn Fn(&Value) -> Result<(), String> + Send + Sync>;

/// Options for [`StateStore::subscribe`].
#[derive(Clone, Default)]
pub struct SubscribeOptions {
    /// Call back right away with the current value.
    pub immediate: bool,
    /// Only deliver changes this predicate accepts.
    pub filter: Option<ChangeFilter>,
}

impl std::fmt::Debug for SubscribeOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscribeOptions")
            .field("immediate", &self.immediate)
            .field("filter", &self.filter.is_some())
            .finish()
    }
}

impl SubscribeOptions {
    /// Deliver the current value on subscribe.
    #[must_use]
    pub fn immediate() -> Self {
        Self {
            immediate: true,
            filter: None,
        }
    }

    /// Attach a change filter.
    #[must_use]
    pub fn with_filter<F>(mut self, filter: F) -> Self
    where
        F: Fn(&StateChange) -> bool + Send + Sync + 'static,
    {
        self.filter = Some(Arc::new(filter));
        self
    }
}

struct Subscription {
    id: SubscriptionId,
    namespace: Namespace,
    callback: Callback,
    filter: Option<ChangeFilter>,
}

/// A named copy of some namespaces.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Snapshot id.
    pub id: SnapshotId,
    /// Caller-supplied name.
    pub name: String,
    /// Copied values.
    pub values: BTreeMap<Namespace, Value>,
    /// Creation time (ms since epoch).
    pub created_at: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BatchOpKind {
    Set,
    Update,
    Merge,
}

#[derive(Debug, Clone)]
struct BatchOp {
    namespace: Namespace,
    kind: BatchOpKind,
    value: Value,
    options: SetOptions,
}

/// Store configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Prefix of persistence keys, `{persistence_key}.{namespace}`.
    pub persistence_key: String,
    /// Quiet period before queued changes are flushed.
    pub sync_debounce_ms: u64,
    /// Failed flushes kept in the error log.
    pub max_sync_errors: usize,
    /// Snapshots kept before the oldest is evicted.
    pub max_snapshots: usize,
    /// Master switch for persistence.
    pub persist: bool,
    /// Master switch for sync.
    pub sync: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            persistence_key: "flowCanvas".to_string(),
            sync_debounce_ms: 200,
            max_sync_errors: 20,
            max_snapshots: 50,
            persist: true,
            sync: true,
        }
    }
}

/// Diagnostic snapshot of the store.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreStatus {
    /// Committed changes.
    pub changes: u64,
    /// Live subscriptions.
    pub subscriptions: usize,
    /// Successful persistence writes.
    pub persisted_writes: u64,
    /// Failed persistence calls.
    pub persistence_errors: u64,
    /// Rejected writes.
    pub validation_failures: u64,
    /// Completed sync flushes.
    pub sync_flushes: u64,
    /// Time of the last flush.
    pub last_sync: Option<u64>,
    /// Records waiting for the next flush.
    pub pending_sync: usize,
    /// Recent flush failures.
    pub sync_errors: Vec<SyncFailure>,
    /// Stored snapshots.
    pub snapshots: usize,
    /// Whether a batch is open.
    pub batching: bool,
    /// Whether the store was destroyed.
    pub destroyed: bool,
}

#[derive(Debug, Default)]
struct StoreStats {
    changes: u64,
    persisted_writes: u64,
    persistence_errors: u64,
    validation_failures: u64,
}

struct StoreInner {
    values: HashMap<Namespace, Value>,
    validators: HashMap<Namespace, Validator>,
    subscriptions: Vec<Subscription>,
    snapshots: Vec<Snapshot>,
    batch_depth: usize,
    batch_ops: Vec<BatchOp>,
    revision: u64,
    sync: SyncQueue,
    stats: StoreStats,
    destroyed: bool,
}

impl StoreInner {
    fn new(config: &StoreConfig) -> Self {
        Self {
            values: Namespace::ALL
                .into_iter()
                .map(|ns| (ns, ns.default_value()))
                .collect(),
            validators: HashMap::new(),
            subscriptions: Vec::new(),
            snapshots: Vec::new(),
            batch_depth: 0,
            batch_ops: Vec::new(),
            revision: 0,
            sync: SyncQueue::new(
                Duration::from_millis(config.sync_debounce_ms),
                config.max_sync_errors,
            ),
            stats: StoreStats::default(),
            destroyed: false,
        }
    }

    fn listeners(&self, namespace: Namespace) -> Vec<(Callback, Option<ChangeFilter>)> {
        self.subscriptions
            .iter()
            .filter(|s| s.namespace == namespace)
            .map(|s| (Arc::clone(&s.callback), s.filter.clone()))
            .collect()
    }
}

/// Builder wiring collaborators into a [`StateStore`].
#[derive(Default)]
pub struct StoreBuilder {
    config: StoreConfig,
    persistence: Option<Arc<dyn PersistenceBackend>>,
    sink: Option<Arc<dyn SyncSink>>,
    clock: Option<Arc<dyn Clock>>,
    codecs: HashMap<Namespace, Arc<dyn NamespaceCodec>>,
}

impl StoreBuilder {
    /// Set the configuration.
    #[must_use]
    pub fn config(mut self, config: StoreConfig) -> Self {
        self.config = config;
        self
    }

    /// Attach a persistence backend.
    #[must_use]
    pub fn persistence(mut self, backend: Arc<dyn PersistenceBackend>) -> Self {
        self.persistence = Some(backend);
        self
    }

    /// Attach a sync sink.
    #[must_use]
    pub fn sync_sink(mut self, sink: Arc<dyn SyncSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Use a custom clock for debouncing.
    #[must_use]
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Use a codec for one namespace at the persistence boundary.
    #[must_use]
    pub fn codec(mut self, namespace: Namespace, codec: Arc<dyn NamespaceCodec>) -> Self {
        self.codecs.insert(namespace, codec);
        self
    }

    /// Build the store and silently apply persisted values.
    #[must_use]
    pub fn build(self) -> StateStore {
        let store = StateStore {
            inner: Arc::new(Mutex::new(StoreInner::new(&self.config))),
            persistence: self.persistence,
            sink: self.sink,
            clock: self.clock.unwrap_or_else(|| Arc::new(SystemClock)),
            codecs: Arc::new(self.codecs),
            config: Arc::new(self.config),
        };
        store.load_persisted();
        store
    }
}

/// Thread-safe namespaced state shared by the engine and its consumers.
///
/// # Example
///
/// ```
/// use flowcanvas_core::{Namespace, SetOptions, StateStore};
/// use serde_json::json;
///
/// let store = StateStore::new();
/// store
///     .set_state(Namespace::Zoom, json!({ "scale": 1.5 }), SetOptions::default())
///     .unwrap();
/// let zoom = store.get_state(Namespace::Zoom).unwrap().unwrap();
/// assert_eq!(zoom["scale"], 1.5);
/// ```
#[derive(Clone)]
pub struct StateStore {
    inner: Arc<Mutex<StoreInner>>,
    persistence: Option<Arc<dyn PersistenceBackend>>,
    sink: Option<Arc<dyn SyncSink>>,
    clock: Arc<dyn Clock>,
    codecs: Arc<HashMap<Namespace, Arc<dyn NamespaceCodec>>>,
    config: Arc<StoreConfig>,
}

impl std::fmt::Debug for StateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateStore")
            .field("config", &self.config)
            .field("persistence", &self.persistence)
            .field("sink", &self.sink)
            .finish_non_exhaustive()
    }
}

impl Default for StateStore {
    fn default() -> Self {
        Self::new()
    }
}

impl StateStore {
    /// Create an in-memory store with default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::builder().build()
    }

    /// Start building a store with collaborators.
    #[must_use]
    pub fn builder() -> StoreBuilder {
        StoreBuilder::default()
    }

    /// Configuration in use.
    #[must_use]
    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    /// Current value of a namespace.
    ///
    /// # Errors
    ///
    /// Returns [`CanvasError::Destroyed`] after `destroy`.
    pub fn get_state(&self, namespace: Namespace) -> CanvasResult<Option<Value>> {
        let inner = self.live()?;
        Ok(inner.values.get(&namespace).cloned())
    }

    /// One key of an object-valued namespace.
    ///
    /// # Errors
    ///
    /// Returns [`CanvasError::Destroyed`] after `destroy`.
    pub fn get_state_key(&self, namespace: Namespace, key: &str) -> CanvasResult<Option<Value>> {
        let inner = self.live()?;
        Ok(inner
            .values
            .get(&namespace)
            .and_then(|v| v.get(key))
            .cloned())
    }

    // -----------------------------------------------------------------------
    // Writes
    // -----------------------------------------------------------------------

    /// Replace a namespace value.
    ///
    /// While a batch is open and `options.batch` is set, the write is queued
    /// and applied when the batch ends.
    ///
    /// # Errors
    ///
    /// Returns [`CanvasError::Validation`] if the validator rejects the value
    /// (nothing is mutated) and [`CanvasError::Destroyed`] after `destroy`.
    pub fn set_state(
        &self,
        namespace: Namespace,
        value: Value,
        options: SetOptions,
    ) -> CanvasResult<()> {
        if self.enqueue_batch_op(namespace, BatchOpKind::Set, &value, options)? {
            return Ok(());
        }
        self.commit(namespace, value, options, ChangeSource::Set)
    }

    /// Shallow-merge `partial` into an object-valued namespace.
    ///
    /// # Errors
    ///
    /// Returns [`CanvasError::InvalidOperation`] if the current value or
    /// `partial` is not an object, plus the errors of [`Self::set_state`].
    pub fn update_state(
        &self,
        namespace: Namespace,
        partial: Value,
        options: SetOptions,
    ) -> CanvasResult<()> {
        if self.enqueue_batch_op(namespace, BatchOpKind::Update, &partial, options)? {
            return Ok(());
        }
        self.commit_with(namespace, options, ChangeSource::Update, |current| {
            shallow_merge(current, &partial).map(Some).ok_or_else(|| {
                CanvasError::InvalidOperation(format!(
                    "cannot update {namespace}: current value or patch is not an object"
                ))
            })
        })?;
        Ok(())
    }

    /// Deep-merge `partial` into a namespace.
    ///
    /// Nested objects merge key by key; any other value replaces.
    ///
    /// # Errors
    ///
    /// Same as [`Self::set_state`].
    pub fn merge_state(
        &self,
        namespace: Namespace,
        partial: Value,
        options: SetOptions,
    ) -> CanvasResult<()> {
        if self.enqueue_batch_op(namespace, BatchOpKind::Merge, &partial, options)? {
            return Ok(());
        }
        self.commit_with(namespace, options, ChangeSource::Merge, |current| {
            let mut merged = current.cloned().unwrap_or(Value::Null);
            deep_merge(&mut merged, &partial);
            Ok(Some(merged))
        })?;
        Ok(())
    }

    /// Delete one key of an object-valued namespace, or the whole namespace.
    ///
    /// Returns whether anything was removed. Deleting the whole namespace
    /// also removes its persisted copy; `get_state` then yields `None` until
    /// the next write or reset.
    ///
    /// # Errors
    ///
    /// Returns [`CanvasError::Destroyed`] after `destroy`.
    pub fn delete_state(&self, namespace: Namespace, key: Option<&str>) -> CanvasResult<bool> {
        match key {
            Some(key) => self.commit_with(
                namespace,
                SetOptions::default(),
                ChangeSource::Delete,
                |current| {
                    let mut next = current.cloned();
                    let removed = next
                        .as_mut()
                        .and_then(Value::as_object_mut)
                        .and_then(|map| map.shift_remove(key))
                        .is_some();
                    Ok(next.filter(|_| removed))
                },
            ),
            None => {
                let (previous, listeners) = {
                    let mut inner = self.live()?;
                    let previous = inner.values.remove(&namespace);
                    if previous.is_some() {
                        inner.stats.changes += 1;
                        inner.revision += 1;
                    }
                    (previous, inner.listeners(namespace))
                };
                let Some(previous) = previous else {
                    return Ok(false);
                };
                self.unpersist(namespace);
                notify(
                    &listeners,
                    &StateChange {
                        namespace,
                        value: Value::Null,
                        previous: Some(previous),
                        source: ChangeSource::Delete,
                    },
                );
                Ok(true)
            }
        }
    }

    /// Restore constructor defaults for one namespace, or all of them.
    ///
    /// # Errors
    ///
    /// Returns [`CanvasError::Destroyed`] after `destroy`.
    pub fn reset_state(&self, namespace: Option<Namespace>) -> CanvasResult<()> {
        let targets: Vec<Namespace> =
            namespace.map_or_else(|| Namespace::ALL.to_vec(), |ns| vec![ns]);
        let options = SetOptions {
            validate: false,
            batch: false,
            ..SetOptions::default()
        };
        for ns in targets {
            self.commit(ns, ns.default_value(), options, ChangeSource::Reset)?;
        }
        Ok(())
    }

    /// Register a validator for a namespace, replacing any previous one.
    ///
    /// # Errors
    ///
    /// Returns [`CanvasError::Destroyed`] after `destroy`.
    pub fn register_validator<F>(&self, namespace: Namespace, validator: F) -> CanvasResult<()>
    where
        F: Fn(&Value) -> Result<(), String> + Send + Sync + 'static,
    {
        self.live()?.validators.insert(namespace, Arc::new(validator));
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Subscriptions
    // -----------------------------------------------------------------------

    /// Subscribe to changes of a namespace.
    ///
    /// # Errors
    ///
    /// Returns [`CanvasError::Destroyed`] after `destroy`.
    pub fn subscribe<F>(
        &self,
        namespace: Namespace,
        callback: F,
        options: SubscribeOptions,
    ) -> CanvasResult<SubscriptionId>
    where
        F: Fn(&StateChange) + Send + Sync + 'static,
    {
        let id = SubscriptionId::new();
        let callback: Callback = Arc::new(callback);
        let current = {
            let mut inner = self.live()?;
            inner.subscriptions.push(Subscription {
                id,
                namespace,
                callback: Arc::clone(&callback),
                filter: options.filter.clone(),
            });
            inner.values.get(&namespace).cloned()
        };
        tracing::debug!("Subscription {id} on {namespace}");

        if options.immediate {
            let change = StateChange {
                namespace,
                value: current.unwrap_or(Value::Null),
                previous: None,
                source: ChangeSource::Immediate,
            };
            notify(&[(callback, options.filter)], &change);
        }
        Ok(id)
    }

    /// Remove a subscription. Returns whether it existed.
    ///
    /// # Errors
    ///
    /// Returns [`CanvasError::Destroyed`] after `destroy`.
    pub fn unsubscribe(&self, id: SubscriptionId) -> CanvasResult<bool> {
        let mut inner = self.live()?;
        let before = inner.subscriptions.len();
        inner.subscriptions.retain(|s| s.id != id);
        Ok(inner.subscriptions.len() != before)
    }

    // -----------------------------------------------------------------------
    // Batching
    // -----------------------------------------------------------------------

    /// Run `f` with writes queued, then apply them per namespace.
    ///
    /// SET overwrites, UPDATE shallow-merges, MERGE deep-merges, in call
    /// order. Each touched namespace is committed once, so subscribers,
    /// persistence and sync see one change per namespace. Not atomic: a
    /// rejected namespace is logged and the others still apply.
    ///
    /// If the returned future is dropped before `f` completes, or `f`
    /// panics, the batch is closed and its queued writes are discarded.
    ///
    /// # Errors
    ///
    /// Returns [`CanvasError::Destroyed`] if the store is destroyed before
    /// or during the batch.
    pub async fn batch<F, Fut, T>(&self, f: F) -> CanvasResult<T>
    where
        F: FnOnce(StateStore) -> Fut,
        Fut: Future<Output = T>,
    {
        self.begin_batch()?;
        let guard = BatchGuard::new(self);
        let output = f(self.clone()).await;
        guard.disarm();
        self.end_batch()?;
        Ok(output)
    }

    /// Open a batch. Batches nest; only the outermost `end_batch` applies.
    ///
    /// # Errors
    ///
    /// Returns [`CanvasError::Destroyed`] after `destroy`.
    pub fn begin_batch(&self) -> CanvasResult<()> {
        self.live()?.batch_depth += 1;
        Ok(())
    }

    /// Close a batch, applying queued writes if it was the outermost one.
    ///
    /// Returns the number of namespaces committed.
    ///
    /// # Errors
    ///
    /// Returns [`CanvasError::InvalidOperation`] if no batch is open and
    /// [`CanvasError::Destroyed`] after `destroy`.
    pub fn end_batch(&self) -> CanvasResult<usize> {
        let ops = {
            let mut inner = self.live()?;
            if inner.batch_depth == 0 {
                return Err(CanvasError::InvalidOperation("no batch is open".to_string()));
            }
            inner.batch_depth -= 1;
            if inner.batch_depth > 0 {
                return Ok(0);
            }
            std::mem::take(&mut inner.batch_ops)
        };
        Ok(self.apply_batch(ops))
    }

    /// Close a batch without applying it. The outermost close drops every
    /// queued write.
    fn abort_batch(&self) {
        let mut inner = self.lock();
        if inner.destroyed || inner.batch_depth == 0 {
            return;
        }
        inner.batch_depth -= 1;
        if inner.batch_depth == 0 {
            let dropped = std::mem::take(&mut inner.batch_ops).len();
            tracing::warn!("Batch abandoned, {dropped} queued writes discarded");
        }
    }

    // -----------------------------------------------------------------------
    // Snapshots
    // -----------------------------------------------------------------------

    /// Copy namespaces (all by default) under a name.
    ///
    /// # Errors
    ///
    /// Returns [`CanvasError::Destroyed`] after `destroy`.
    pub fn create_snapshot(
        &self,
        name: &str,
        namespaces: Option<&[Namespace]>,
    ) -> CanvasResult<SnapshotId> {
        let mut inner = self.live()?;
        let targets = namespaces.unwrap_or(&Namespace::ALL);
        let values = targets
            .iter()
            .filter_map(|ns| inner.values.get(ns).map(|v| (*ns, v.clone())))
            .collect();
        let snapshot = Snapshot {
            id: SnapshotId::new(),
            name: name.to_string(),
            values,
            created_at: current_timestamp_ms(),
        };
        let id = snapshot.id;
        if self.config.max_snapshots > 0 {
            while inner.snapshots.len() >= self.config.max_snapshots {
                let evicted = inner.snapshots.remove(0);
                tracing::debug!("Evicting snapshot {} ({})", evicted.id, evicted.name);
            }
        }
        inner.snapshots.push(snapshot);
        tracing::debug!("Created snapshot {id} ({name})");
        Ok(id)
    }

    /// Write a snapshot's values back.
    ///
    /// # Errors
    ///
    /// Returns [`CanvasError::NotFound`] for an unknown id and
    /// [`CanvasError::Destroyed`] after `destroy`.
    pub fn restore_snapshot(&self, id: SnapshotId) -> CanvasResult<()> {
        let snapshot = {
            let inner = self.live()?;
            inner
                .snapshots
                .iter()
                .find(|s| s.id == id)
                .cloned()
                .ok_or_else(|| CanvasError::NotFound(format!("snapshot {id}")))?
        };
        let options = SetOptions {
            validate: false,
            batch: false,
            ..SetOptions::default()
        };
        for (ns, value) in snapshot.values {
            self.commit(ns, value, options, ChangeSource::Restore)?;
        }
        tracing::info!("Restored snapshot {id} ({})", snapshot.name);
        Ok(())
    }

    /// Delete a snapshot. Returns whether it existed.
    ///
    /// # Errors
    ///
    /// Returns [`CanvasError::Destroyed`] after `destroy`.
    pub fn delete_snapshot(&self, id: SnapshotId) -> CanvasResult<bool> {
        let mut inner = self.live()?;
        let before = inner.snapshots.len();
        inner.snapshots.retain(|s| s.id != id);
        Ok(inner.snapshots.len() != before)
    }

    /// Stored snapshots, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`CanvasError::Destroyed`] after `destroy`.
    pub fn snapshots(&self) -> CanvasResult<Vec<Snapshot>> {
        Ok(self.live()?.snapshots.clone())
    }

    // -----------------------------------------------------------------------
    // Sync
    // -----------------------------------------------------------------------

    /// Flush queued changes if the debounce window has elapsed.
    ///
    /// Returns whether a flush happened.
    ///
    /// # Errors
    ///
    /// Returns [`CanvasError::Destroyed`] after `destroy`.
    pub fn poll_sync(&self) -> CanvasResult<bool> {
        let now = self.clock.now();
        let due = self.live()?.sync.take_due(now);
        match due {
            Some(records) => {
                self.deliver(&records);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Flush queued changes now.
    ///
    /// # Errors
    ///
    /// Returns [`CanvasError::Destroyed`] after `destroy`.
    pub fn flush_sync(&self) -> CanvasResult<bool> {
        let records = {
            let mut inner = self.live()?;
            if inner.sync.is_empty() {
                return Ok(false);
            }
            inner.sync.take_all()
        };
        self.deliver(&records);
        Ok(true)
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Diagnostic snapshot. Still answers after `destroy`.
    #[must_use]
    pub fn status(&self) -> StoreStatus {
        let inner = self.lock();
        StoreStatus {
            changes: inner.stats.changes,
            subscriptions: inner.subscriptions.len(),
            persisted_writes: inner.stats.persisted_writes,
            persistence_errors: inner.stats.persistence_errors,
            validation_failures: inner.stats.validation_failures,
            sync_flushes: inner.sync.flush_count(),
            last_sync: inner.sync.last_sync(),
            pending_sync: inner.sync.len(),
            sync_errors: inner.sync.failures(),
            snapshots: inner.snapshots.len(),
            batching: inner.batch_depth > 0,
            destroyed: inner.destroyed,
        }
    }

    /// Drop all state, subscriptions, snapshots and pending sync.
    ///
    /// # Errors
    ///
    /// Returns [`CanvasError::Destroyed`] if already destroyed.
    pub fn destroy(&self) -> CanvasResult<()> {
        let mut inner = self.live()?;
        inner.values.clear();
        inner.validators.clear();
        inner.subscriptions.clear();
        inner.snapshots.clear();
        inner.batch_ops.clear();
        inner.batch_depth = 0;
        inner.sync.clear();
        inner.destroyed = true;
        tracing::info!("State store destroyed");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    fn lock(&self) -> MutexGuard<'_, StoreInner> {
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn live(&self) -> CanvasResult<MutexGuard<'_, StoreInner>> {
        let inner = self.lock();
        if inner.destroyed {
            return Err(CanvasError::Destroyed(COMPONENT));
        }
        Ok(inner)
    }

    fn persistence_key(&self, namespace: Namespace) -> String {
        format!("{}.{}", self.config.persistence_key, namespace)
    }

    fn codec(&self, namespace: Namespace) -> &dyn NamespaceCodec {
        self.codecs
            .get(&namespace)
            .map_or(&JsonCodec as &dyn NamespaceCodec, |codec| &**codec)
    }

    /// Queue an op if a batch is open. Returns whether it was queued.
    fn enqueue_batch_op(
        &self,
        namespace: Namespace,
        kind: BatchOpKind,
        value: &Value,
        options: SetOptions,
    ) -> CanvasResult<bool> {
        let mut inner = self.live()?;
        if inner.batch_depth == 0 || !options.batch {
            return Ok(false);
        }
        inner.batch_ops.push(BatchOp {
            namespace,
            kind,
            value: value.clone(),
            options,
        });
        Ok(true)
    }

    fn commit(
        &self,
        namespace: Namespace,
        value: Value,
        options: SetOptions,
        source: ChangeSource,
    ) -> CanvasResult<()> {
        self.commit_with(namespace, options, source, move |_| Ok(Some(value.clone())))?;
        Ok(())
    }

    /// Compute a namespace's next value from its current one and insert it.
    ///
    /// `next` returning `None` leaves the namespace alone. If another write
    /// lands while the validator runs, the value is recomputed. Returns
    /// whether anything was written.
    fn commit_with<F>(
        &self,
        namespace: Namespace,
        options: SetOptions,
        source: ChangeSource,
        next: F,
    ) -> CanvasResult<bool>
    where
        F: Fn(Option<&Value>) -> CanvasResult<Option<Value>>,
    {
        loop {
            let (value, revision, validator) = {
                let inner = self.live()?;
                let Some(value) = next(inner.values.get(&namespace))? else {
                    return Ok(false);
                };
                let validator = if options.validate {
                    inner.validators.get(&namespace).cloned()
                } else {
                    None
                };
                (value, inner.revision, validator)
            };

            if let Some(validator) = validator {
                if let Err(reason) = validator(&value) {
                    self.lock().stats.validation_failures += 1;
                    tracing::warn!("Rejected write to {namespace}: {reason}");
                    return Err(CanvasError::Validation {
                        namespace: namespace.to_string(),
                        reason,
                    });
                }
            }

            let now = self.clock.now();
            let (previous, listeners) = {
                let mut inner = self.live()?;
                if inner.revision != revision {
                    tracing::trace!("Write to {namespace} raced, recomputing");
                    continue;
                }
                let previous = inner.values.insert(namespace, value.clone());
                inner.revision += 1;
                inner.stats.changes += 1;
                if options.sync && self.config.sync {
                    inner.sync.enqueue(
                        SyncRecord {
                            namespace,
                            value: value.clone(),
                            timestamp: current_timestamp_ms(),
                        },
                        now,
                    );
                }
                let listeners = if options.silent {
                    Vec::new()
                } else {
                    inner.listeners(namespace)
                };
                (previous, listeners)
            };

            if options.persist {
                self.persist(namespace, &value);
            }

            notify(
                &listeners,
                &StateChange {
                    namespace,
                    value,
                    previous,
                    source,
                },
            );
            return Ok(true);
        }
    }

    fn apply_batch(&self, ops: Vec<BatchOp>) -> usize {
        let mut order: Vec<Namespace> = Vec::new();
        for op in &ops {
            if !order.contains(&op.namespace) {
                order.push(op.namespace);
            }
        }

        let mut committed = 0;
        for ns in order {
            let ns_ops: Vec<&BatchOp> = ops.iter().filter(|op| op.namespace == ns).collect();
            let mut options = SetOptions {
                silent: true,
                persist: false,
                sync: false,
                validate: false,
                batch: false,
            };
            for op in &ns_ops {
                options.silent &= op.options.silent;
                options.persist |= op.options.persist;
                options.sync |= op.options.sync;
                options.validate |= op.options.validate;
            }
            let folded = self.commit_with(ns, options, ChangeSource::Batch, |current| {
                Ok(Some(fold_ops(ns, current, &ns_ops)))
            });
            match folded {
                Ok(_) => committed += 1,
                Err(CanvasError::Destroyed(_)) => {
                    tracing::warn!("Batch aborted at {ns}: store destroyed");
                    break;
                }
                Err(e) => tracing::warn!("Batch write to {ns} failed: {e}"),
            }
        }
        tracing::debug!("Batch applied to {committed} namespaces");
        committed
    }

    fn persist(&self, namespace: Namespace, value: &Value) {
        if !self.config.persist {
            return;
        }
        let Some(backend) = &self.persistence else {
            return;
        };
        let key = self.persistence_key(namespace);
        let result = self
            .codec(namespace)
            .encode(value)
            .and_then(|raw| backend.save(&key, &raw));
        let mut inner = self.lock();
        match result {
            Ok(()) => inner.stats.persisted_writes += 1,
            Err(e) => {
                inner.stats.persistence_errors += 1;
                tracing::warn!("Failed to persist {key}: {e}");
            }
        }
    }

    fn unpersist(&self, namespace: Namespace) {
        if !self.config.persist {
            return;
        }
        let Some(backend) = &self.persistence else {
            return;
        };
        let key = self.persistence_key(namespace);
        if let Err(e) = backend.remove(&key) {
            self.lock().stats.persistence_errors += 1;
            tracing::warn!("Failed to remove {key}: {e}");
        }
    }

    fn load_persisted(&self) {
        let Some(backend) = &self.persistence else {
            return;
        };
        for ns in Namespace::ALL {
            let key = self.persistence_key(ns);
            let loaded = backend
                .load(&key)
                .and_then(|raw| raw.map(|r| self.codec(ns).decode(&r)).transpose());
            let mut inner = self.lock();
            match loaded {
                Ok(Some(value)) => {
                    inner.values.insert(ns, value);
                    tracing::debug!("Loaded persisted {key}");
                }
                Ok(None) => {}
                Err(e) => {
                    inner.stats.persistence_errors += 1;
                    tracing::warn!("Failed to load {key}, keeping default: {e}");
                }
            }
        }
    }

    fn deliver(&self, records: &[SyncRecord]) {
        let result = self.sink.as_ref().map_or(Ok(()), |sink| sink.flush(records));
        let timestamp = current_timestamp_ms();
        let mut inner = self.lock();
        match result {
            Ok(()) => {
                inner.sync.mark_synced(timestamp);
                tracing::debug!("Synced {} records", records.len());
            }
            Err(e) => {
                tracing::warn!("Sync flush of {} records failed: {e}", records.len());
                inner.sync.record_failure(SyncFailure {
                    message: e.to_string(),
                    records: records.len(),
                    timestamp,
                });
            }
        }
    }
}

/// Closes an open batch if `StateStore::batch` never reaches `end_batch`.
struct BatchGuard<'a> {
    store: &'a StateStore,
    armed: bool,
}

impl<'a> BatchGuard<'a> {
    fn new(store: &'a StateStore) -> Self {
        Self { store, armed: true }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for BatchGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.store.abort_batch();
        }
    }
}

/// Apply queued SET / UPDATE / MERGE ops on top of `current`, in order.
fn fold_ops(namespace: Namespace, current: Option<&Value>, ops: &[&BatchOp]) -> Value {
    let mut acc = current.cloned().unwrap_or(Value::Null);
    for op in ops {
        match op.kind {
            BatchOpKind::Set => acc = op.value.clone(),
            BatchOpKind::Update => match shallow_merge(Some(&acc), &op.value) {
                Some(merged) => acc = merged,
                None => {
                    tracing::warn!("Batch update on {namespace} skipped: value is not an object");
                }
            },
            BatchOpKind::Merge => deep_merge(&mut acc, &op.value),
        }
    }
    acc
}

fn notify(listeners: &[(Callback, Option<ChangeFilter>)], change: &StateChange) {
    for (callback, filter) in listeners {
        if filter.as_ref().is_none_or(|f| f(change)) {
            callback(change);
        }
    }
}

/// Shallow merge. `None` unless both sides are objects.
fn shallow_merge(current: Option<&Value>, partial: &Value) -> Option<Value> {
    let mut base: Map<String, Value> = current?.as_object()?.clone();
    for (k, v) in partial.as_object()? {
        base.insert(k.clone(), v.clone());
    }
    Some(Value::Object(base))
}

/// Deep merge `patch` into `target`.
fn deep_merge(target: &mut Value, patch: &Value) {
    match (target, patch) {
        (Value::Object(target), Value::Object(patch)) => {
            for (k, v) in patch {
                match target.get_mut(k) {
                    Some(existing) => deep_merge(existing, v),
                    None => {
                        target.insert(k.clone(), v.clone());
                    }
                }
            }
        }
        (target, patch) => *target = patch.clone(),
    }
}
