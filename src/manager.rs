//! Lifecycle of the locally evaluated snapshot.
//!
//! [`OfflineManager`] bootstraps a snapshot (from storage or from the network), keeps it fresh in
//! the background and evaluates flags against it without any network round trip.
use std::{
    fmt::{self, Display},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, OnceLock, Weak,
    },
    time::Duration,
};

use rand::{thread_rng, Rng};
use tokio::{runtime::Handle, task::JoinHandle};
use tokio_util::sync::CancellationToken;

use crate::{
    eval::{evaluate, evaluate_batch},
    fetcher::SnapshotFetcher,
    snapshot_store::SnapshotStore,
    sse::{ConnectionStatus, SseClient, SseReceivers},
    EntityContext, Error, EvaluationRequest, EvaluationResult, FileSnapshotStorage, FlagSelector,
    InMemorySnapshotStorage, OfflineConfig, Result, Snapshot, SnapshotSource, SnapshotStorage,
};

/// Lifecycle state of an [`OfflineManager`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecycleState {
    /// No snapshot installed yet, or the cache was cleared.
    Uninitialized,
    /// The first bootstrap is in progress. A forced re-bootstrap stays [`LifecycleState::Ready`].
    Bootstrapping,
    /// A snapshot is installed and evaluations are served.
    Ready,
}

#[derive(Debug, Clone, Copy)]
enum RefreshTrigger {
    Expired,
    Timer,
    Realtime,
}

impl Display for RefreshTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RefreshTrigger::Expired => "expired",
            RefreshTrigger::Timer => "timer",
            RefreshTrigger::Realtime => "realtime",
        })
    }
}

/// Evaluates flags locally against a snapshot that is kept fresh in the background.
///
/// The manager is cheap to clone. All clones share the same snapshot and background tasks.
///
/// Background tasks run on the Tokio runtime that drove [`OfflineManager::bootstrap`].
/// Evaluations are synchronous and may be called from any thread.
#[derive(Clone)]
pub struct OfflineManager {
    inner: Arc<ManagerInner>,
}

struct ManagerInner {
    config: OfflineConfig,
    fetcher: SnapshotFetcher,
    storage: Arc<dyn SnapshotStorage>,
    store: SnapshotStore,
    state: Mutex<LifecycleState>,
    /// Serializes bootstrap and refresh so that only one fetch installs a snapshot at a time.
    update_lock: tokio::sync::Mutex<()>,
    auto_refresh_started: AtomicBool,
    expired_refresh_in_flight: AtomicBool,
    shutdown: CancellationToken,
    runtime: OnceLock<Handle>,
    realtime: Mutex<Option<Realtime>>,
}

struct Realtime {
    client: SseClient,
    dispatch: JoinHandle<()>,
}

impl OfflineManager {
    /// Create a manager fetching snapshots from `source`.
    ///
    /// No network or storage access happens until [`OfflineManager::bootstrap`].
    pub fn new(config: OfflineConfig, source: Arc<dyn SnapshotSource>) -> OfflineManager {
        let storage: Arc<dyn SnapshotStorage> = match &config.storage {
            Some(storage) => storage.clone(),
            None if config.enable_persistence => {
                Arc::new(FileSnapshotStorage::new(config.storage_dir.clone()))
            }
            None => Arc::new(InMemorySnapshotStorage::new()),
        };

        OfflineManager {
            inner: Arc::new(ManagerInner {
                config,
                fetcher: SnapshotFetcher::new(source),
                storage,
                store: SnapshotStore::new(),
                state: Mutex::new(LifecycleState::Uninitialized),
                update_lock: tokio::sync::Mutex::new(()),
                auto_refresh_started: AtomicBool::new(false),
                expired_refresh_in_flight: AtomicBool::new(false),
                shutdown: CancellationToken::new(),
                runtime: OnceLock::new(),
                realtime: Mutex::new(None),
            }),
        }
    }

    /// Install a snapshot so that evaluations can be served.
    ///
    /// Unless `force_refresh` is set, a non-expired snapshot from storage is used without touching
    /// the network, and calling this on a ready manager does nothing. Otherwise a live snapshot is
    /// fetched and persisted. If the fetch fails, any stored snapshot is used even if expired.
    ///
    /// Fails with [`Error::NoSnapshotAvailable`] only if both the fetch and the storage fallback
    /// come up empty.
    pub async fn bootstrap(&self, force_refresh: bool) -> Result<()> {
        let inner = &self.inner;
        if let Ok(runtime) = Handle::try_current() {
            let _ = inner.runtime.set(runtime);
        }

        let _guard = inner.update_lock.lock().await;
        let was_ready = inner.state() == LifecycleState::Ready;
        if !force_refresh && was_ready {
            return Ok(());
        }

        // A forced bootstrap keeps serving the installed snapshot until a new one replaces it.
        if !was_ready {
            inner.set_state(LifecycleState::Bootstrapping);
        }
        log::debug!(target: "flagent", force_refresh = force_refresh; "bootstrapping");

        if !force_refresh {
            match inner.load_stored().await {
                Ok(Some(snapshot)) if !snapshot.is_expired() => {
                    log::debug!(target: "flagent",
                                flags = snapshot.len(),
                                revision:? = snapshot.revision;
                                "loaded snapshot from storage");
                    inner.store.set_snapshot(snapshot);
                    inner.finish_bootstrap();
                    return Ok(());
                }
                Ok(_) => {}
                Err(err) => {
                    log::warn!(target: "flagent", error:display = err; "failed to load stored snapshot");
                }
            }
        }

        let fetch_error = match inner.fetch_and_save().await {
            Ok(()) => {
                inner.finish_bootstrap();
                return Ok(());
            }
            Err(err) => err,
        };

        log::warn!(target: "flagent",
                   error:display = fetch_error;
                   "failed to fetch snapshot, falling back to storage");

        match inner.load_stored().await {
            Ok(Some(snapshot)) => {
                log::warn!(target: "flagent",
                           flags = snapshot.len(),
                           age_ms = snapshot.age_ms(),
                           expired = snapshot.is_expired();
                           "using stored snapshot");
                inner.store.set_snapshot(snapshot);
                inner.finish_bootstrap();
                Ok(())
            }
            Ok(None) => inner.fail_bootstrap(was_ready, fetch_error),
            Err(err) => {
                log::warn!(target: "flagent", error:display = err; "failed to load stored snapshot");
                inner.fail_bootstrap(was_ready, fetch_error)
            }
        }
    }

    /// Fetch a new snapshot now and install it.
    ///
    /// A failure to persist the new snapshot is logged and otherwise ignored.
    pub async fn refresh(&self) -> Result<()> {
        self.inner.refresh().await
    }

    /// Evaluate `flag` for `entity_id`.
    ///
    /// Fails only with [`Error::NotBootstrapped`]. Missing or disabled flags are reported through
    /// [`EvaluationResult::reason`].
    pub fn evaluate(
        &self,
        flag: impl Into<FlagSelector>,
        entity_id: impl Into<String>,
        entity_context: EntityContext,
    ) -> Result<EvaluationResult> {
        let request = EvaluationRequest::new(flag, entity_id)
            .with_context(entity_context)
            .with_debug(self.inner.config.enable_debug_logging);
        self.evaluate_request(&request)
    }

    /// Evaluate a fully specified request.
    pub fn evaluate_request(&self, request: &EvaluationRequest) -> Result<EvaluationResult> {
        let snapshot = self.current_snapshot()?;
        Ok(evaluate(request, &snapshot))
    }

    /// Evaluate all `requests` against the same snapshot.
    pub fn evaluate_batch(&self, requests: &[EvaluationRequest]) -> Result<Vec<EvaluationResult>> {
        let snapshot = self.current_snapshot()?;
        Ok(evaluate_batch(requests, &snapshot))
    }

    /// Return `true` if `flag` assigns a variant to `entity_id`.
    pub fn is_enabled(
        &self,
        flag: impl Into<FlagSelector>,
        entity_id: impl Into<String>,
        entity_context: EntityContext,
    ) -> Result<bool> {
        Ok(self.evaluate(flag, entity_id, entity_context)?.is_enabled())
    }

    /// Return the variant key `flag` assigns to `entity_id`, if any.
    pub fn get_variant(
        &self,
        flag: impl Into<FlagSelector>,
        entity_id: impl Into<String>,
        entity_context: EntityContext,
    ) -> Result<Option<String>> {
        Ok(self.evaluate(flag, entity_id, entity_context)?.variant_key)
    }

    /// Return `true` if evaluations are served.
    pub fn is_ready(&self) -> bool {
        self.inner.state() == LifecycleState::Ready && self.inner.store.get_snapshot().is_some()
    }

    #[allow(missing_docs)]
    pub fn state(&self) -> LifecycleState {
        self.inner.state()
    }

    /// Time since the installed snapshot was fetched.
    pub fn snapshot_age(&self) -> Result<Duration> {
        let snapshot = self.inner.store.get_snapshot().ok_or(Error::NotBootstrapped)?;
        Ok(Duration::from_millis(snapshot.age_ms().max(0) as u64))
    }

    /// Return `true` if the installed snapshot outlived its TTL, or if there is none.
    pub fn is_snapshot_expired(&self) -> bool {
        self.inner
            .store
            .get_snapshot()
            .map_or(true, |snapshot| snapshot.is_expired())
    }

    /// The installed snapshot.
    pub fn snapshot(&self) -> Option<Arc<Snapshot>> {
        self.inner.store.get_snapshot()
    }

    /// Drop the installed snapshot and the stored copy. Evaluations fail with
    /// [`Error::NotBootstrapped`] until the next successful bootstrap.
    pub fn clear_cache(&self) -> Result<()> {
        self.inner.store.clear();
        self.inner.set_state(LifecycleState::Uninitialized);
        log::debug!(target: "flagent", "cleared snapshot cache");
        self.inner.storage.clear()
    }

    /// Refresh the snapshot whenever the server announces a change.
    ///
    /// `flag_keys` and `flag_ids` restrict notifications to the given flags. Both empty means all
    /// flags. Fails with [`Error::RealtimeAlreadyEnabled`] if updates are already running.
    pub fn enable_realtime_updates(
        &self,
        base_url: impl Into<String>,
        flag_keys: &[String],
        flag_ids: &[i64],
    ) -> Result<()> {
        let inner = &self.inner;
        let mut realtime = inner
            .realtime
            .lock()
            .expect("thread holding realtime lock should not panic");
        if realtime
            .as_ref()
            .is_some_and(|running| running.client.is_running())
        {
            return Err(Error::RealtimeAlreadyEnabled);
        }

        let runtime = inner.runtime().ok_or(Error::RuntimeUnavailable)?;
        // SseClient spawns its connection loop on the current runtime.
        let _enter = runtime.enter();

        let client = SseClient::new(base_url, inner.config.realtime.clone())?;
        let receivers = client.connect(flag_keys, flag_ids)?;
        let dispatch = runtime.spawn(dispatch_realtime(Arc::downgrade(inner), receivers));

        if let Some(previous) = realtime.replace(Realtime { client, dispatch }) {
            previous.stop();
        }
        log::debug!(target: "flagent", "real-time updates enabled");
        Ok(())
    }

    /// Stop real-time updates. Does nothing if they are not running.
    pub fn disable_realtime_updates(&self) {
        self.inner.disable_realtime_updates();
    }

    /// Return `true` if the real-time connection loop is running.
    pub fn is_realtime_enabled(&self) -> bool {
        self.inner
            .realtime
            .lock()
            .expect("thread holding realtime lock should not panic")
            .as_ref()
            .is_some_and(|running| running.client.is_running())
    }

    /// Status of the real-time connection.
    pub fn realtime_status(&self) -> ConnectionStatus {
        self.inner
            .realtime
            .lock()
            .expect("thread holding realtime lock should not panic")
            .as_ref()
            .map_or(ConnectionStatus::Disconnected, |running| {
                running.client.status()
            })
    }

    /// Stop background refresh and real-time updates. The installed snapshot keeps serving
    /// evaluations. Safe to call more than once.
    pub fn close(&self) {
        if !self.inner.shutdown.is_cancelled() {
            log::debug!(target: "flagent", "closing manager");
        }
        self.inner.shutdown.cancel();
        self.inner.disable_realtime_updates();
    }

    fn current_snapshot(&self) -> Result<Arc<Snapshot>> {
        if self.inner.state() != LifecycleState::Ready {
            return Err(Error::NotBootstrapped);
        }
        let snapshot = self.inner.store.get_snapshot().ok_or(Error::NotBootstrapped)?;

        // Stale reads are fine, the refresh only affects later calls.
        if snapshot.is_expired() && self.inner.config.auto_refresh {
            self.inner.spawn_refresh(RefreshTrigger::Expired);
        }

        Ok(snapshot)
    }
}

impl ManagerInner {
    fn state(&self) -> LifecycleState {
        *self
            .state
            .lock()
            .expect("thread holding state lock should not panic")
    }

    fn set_state(&self, state: LifecycleState) {
        *self
            .state
            .lock()
            .expect("thread holding state lock should not panic") = state;
    }

    fn runtime(&self) -> Option<Handle> {
        self.runtime
            .get()
            .cloned()
            .or_else(|| Handle::try_current().ok())
    }

    fn finish_bootstrap(self: &Arc<Self>) {
        self.set_state(LifecycleState::Ready);
        log::debug!(target: "flagent", "manager ready");
        self.start_auto_refresh();
    }

    fn fail_bootstrap(&self, was_ready: bool, fetch_error: Error) -> Result<()> {
        if !was_ready {
            self.set_state(LifecycleState::Uninitialized);
        }
        Err(Error::NoSnapshotAvailable {
            source: Box::new(fetch_error),
        })
    }

    async fn refresh(&self) -> Result<()> {
        let _guard = self.update_lock.lock().await;
        self.fetch_and_save().await
    }

    /// Must be called with `update_lock` held.
    async fn fetch_and_save(&self) -> Result<()> {
        let snapshot = Arc::new(self.fetcher.fetch(self.config.snapshot_ttl).await?);

        if let Err(err) = self.save_stored(snapshot.clone()).await {
            log::warn!(target: "flagent", error:display = err; "failed to persist snapshot");
        }

        log::debug!(target: "flagent",
                    flags = snapshot.len(),
                    revision:? = snapshot.revision;
                    "installed fetched snapshot");
        self.store.set_snapshot(snapshot);
        Ok(())
    }

    async fn load_stored(&self) -> Result<Option<Snapshot>> {
        let storage = self.storage.clone();
        self.run_storage(move || storage.load()).await
    }

    async fn save_stored(&self, snapshot: Arc<Snapshot>) -> Result<()> {
        let storage = self.storage.clone();
        self.run_storage(move || storage.save(&snapshot)).await
    }

    /// Storage backends may block on file I/O, so keep them off the async workers.
    async fn run_storage<T: Send + 'static>(
        &self,
        f: impl FnOnce() -> Result<T> + Send + 'static,
    ) -> Result<T> {
        let Some(runtime) = self.runtime() else {
            return f();
        };
        runtime.spawn_blocking(f).await.map_err(|err| {
            Error::persistence("storage task failed", std::io::Error::other(err))
        })?
    }

    /// Refresh in the background, bounded by `refresh_timeout`.
    fn spawn_refresh(self: &Arc<Self>, trigger: RefreshTrigger) {
        let coalesce = matches!(trigger, RefreshTrigger::Expired);
        if coalesce && self.expired_refresh_in_flight.swap(true, Ordering::SeqCst) {
            return;
        }

        let Some(runtime) = self.runtime() else {
            log::warn!(target: "flagent",
                       trigger:display = trigger;
                       "no tokio runtime available, skipping background refresh");
            if coalesce {
                self.expired_refresh_in_flight.store(false, Ordering::SeqCst);
            }
            return;
        };

        let inner = Arc::clone(self);
        runtime.spawn(async move {
            inner.bounded_refresh(trigger).await;
            if coalesce {
                inner.expired_refresh_in_flight.store(false, Ordering::SeqCst);
            }
        });
    }

    async fn bounded_refresh(&self, trigger: RefreshTrigger) {
        match tokio::time::timeout(self.config.refresh_timeout, self.refresh()).await {
            Ok(Ok(())) => {
                log::debug!(target: "flagent", trigger:display = trigger; "background refresh finished");
            }
            Ok(Err(err)) => {
                log::warn!(target: "flagent",
                           trigger:display = trigger,
                           error:display = err;
                           "background refresh failed");
            }
            Err(_) => {
                log::warn!(target: "flagent",
                           trigger:display = trigger,
                           timeout:? = self.config.refresh_timeout;
                           "background refresh timed out");
            }
        }
    }

    fn start_auto_refresh(self: &Arc<Self>) {
        if !self.config.auto_refresh || self.config.refresh_interval.is_zero() {
            return;
        }
        if self.auto_refresh_started.swap(true, Ordering::SeqCst) {
            return;
        }
        let Some(runtime) = self.runtime() else {
            log::warn!(target: "flagent", "no tokio runtime available, auto-refresh disabled");
            self.auto_refresh_started.store(false, Ordering::SeqCst);
            return;
        };

        let manager = Arc::downgrade(self);
        let shutdown = self.shutdown.clone();
        let interval = self.config.refresh_interval;
        let max_jitter = self.config.refresh_jitter;

        runtime.spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(jitter(interval, max_jitter)) => {}
                }

                let Some(inner) = manager.upgrade() else {
                    break;
                };
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = inner.bounded_refresh(RefreshTrigger::Timer) => {}
                }
            }
            log::debug!(target: "flagent", "auto-refresh stopped");
        });
    }

    fn disable_realtime_updates(&self) {
        let running = self
            .realtime
            .lock()
            .expect("thread holding realtime lock should not panic")
            .take();
        if let Some(running) = running {
            running.stop();
            log::debug!(target: "flagent", "real-time updates disabled");
        }
    }
}

impl Drop for ManagerInner {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

impl Realtime {
    fn stop(self) {
        self.client.disconnect();
        self.dispatch.abort();
    }
}

/// Shorten `interval` by a random amount of up to `max_jitter`.
fn jitter(interval: Duration, max_jitter: Duration) -> Duration {
    let max_jitter = max_jitter.min(interval);
    if max_jitter.is_zero() {
        return interval;
    }
    interval - thread_rng().gen_range(Duration::ZERO..max_jitter)
}

/// Turn change notifications into refreshes until the connection loop exits.
async fn dispatch_realtime(manager: Weak<ManagerInner>, mut receivers: SseReceivers) {
    loop {
        tokio::select! {
            event = receivers.events.recv() => {
                let Some(event) = event else { break };
                log::debug!(target: "flagent",
                            event_type:display = event.event_type,
                            flag_key:? = event.flag_key,
                            flag_id:? = event.flag_id;
                            "received flag change");
                let Some(inner) = manager.upgrade() else { break };
                inner.spawn_refresh(RefreshTrigger::Realtime);
            }
            status = receivers.status.recv() => {
                let Some(status) = status else { break };
                log::debug!(target: "flagent", status:? = status; "real-time connection status");
            }
            error = receivers.errors.recv() => {
                let Some(error) = error else { break };
                log::warn!(target: "flagent", error:display = error; "real-time connection error");
            }
        }
    }
}
