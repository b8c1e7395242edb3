//! Background usage sync task.
//!
//! Once per interval the task connects to the counter store, authenticates,
//! forwards a pending recompute request and replaces the cached usage estimate
//! with the figure the store reports. Every remote failure is swallowed: the
//! tick is skipped and the estimate stays as it was. There is no backoff and
//! no retry faster than the interval.
//!
//! # Architecture
//!
//! - [`UsageSync`] owns everything one iteration needs and runs it via
//!   [`UsageSync::run_once`].
//! - [`UsageSync::spawn`] drives it from a `tokio` interval until cancelled.
//! - [`SyncLauncher`] ties the task to the mount lifecycle: started on FUSE
//!   `init`, cancelled on `destroy`.

mod memory;
mod redis_store;
mod store;

use std::future::Future;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

pub use memory::InMemoryCounterStore;
pub use redis_store::RedisCounterStore;
pub use store::CounterConnection;
pub use store::CounterKey;
pub use store::CounterReply;
pub use store::CounterStore;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::trace;
use tracing::warn;

use crate::config::SyncTiming;
use crate::error::RemoteStoreError;
use crate::quota::QuotaState;

/// What a single sync iteration achieved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    /// No connection could be made; nothing else was attempted.
    ConnectFailed,
    /// The store rejected the credentials; nothing else was attempted.
    AuthFailed,
    /// Connected and authenticated.
    Synced {
        /// A recompute request was drained from the flag this tick.
        request_sent: bool,
        /// The new usage estimate, if the store returned a usable figure.
        usage_bytes: Option<u64>,
    },
}

/// The usage sync task.
pub struct UsageSync {
    state: Arc<QuotaState>,
    store: Arc<dyn CounterStore>,
    key: CounterKey,
    secret: String,
    timing: SyncTiming,
}

impl UsageSync {
    /// Sync `state` against `store`, authenticating with `secret`.
    pub fn new(state: Arc<QuotaState>, store: Arc<dyn CounterStore>, secret: String, timing: SyncTiming) -> Self {
        let key = CounterKey::new(state.identity());
        Self {
            state,
            store,
            key,
            secret,
            timing,
        }
    }

    /// Run one iteration.
    ///
    /// Connect, authenticate and every command are each bounded by the sync
    /// timeout.
    pub async fn run_once(&self) -> SyncOutcome {
        let timeout = self.timing.timeout;

        let mut conn = match bounded(timeout, "connect", self.store.connect()).await {
            Ok(conn) => conn,
            Err(e) => {
                debug!(error = %e, "usage sync: counter store unreachable, skipping tick");
                return SyncOutcome::ConnectFailed;
            }
        };

        if let Err(e) = bounded(timeout, "AUTH", conn.authenticate(&self.secret)).await {
            warn!(error = %e, "usage sync: authentication failed, skipping tick");
            return SyncOutcome::AuthFailed;
        }

        // The flag is cleared before the write lands; a failed write loses the request.
        let request_sent = self.state.take_recompute_request();
        if request_sent && let Err(e) = bounded(timeout, "HSET", conn.set_flag(&self.key)).await {
            warn!(error = %e, "usage sync: recompute request lost");
        }

        let usage_bytes = match bounded(timeout, "HGET", conn.get_counter(&self.key)).await {
            Ok(CounterReply::Integer(usage)) if usage >= 0 => {
                let usage = usage as u64;
                self.state.replace_usage_estimate(usage);
                Some(usage)
            }
            Ok(reply) => {
                debug!(?reply, "usage sync: unusable usage reply, keeping estimate");
                None
            }
            Err(e) => {
                warn!(error = %e, "usage sync: usage query failed, keeping estimate");
                None
            }
        };

        SyncOutcome::Synced {
            request_sent,
            usage_bytes,
        }
    }

    /// Tick until `cancel` fires.
    ///
    /// An iteration in flight when `cancel` fires is abandoned.
    pub async fn run(self, cancel: CancellationToken) {
        let mut ticker = interval(self.timing.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(
            interval_ms = self.timing.interval.as_millis() as u64,
            timeout_ms = self.timing.timeout.as_millis() as u64,
            tenant_id = %self.state.identity().tenant_id,
            node_id = %self.state.identity().node_id,
            "usage sync task started"
        );

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                outcome = self.run_once() => {
                    trace!(?outcome, estimate = self.state.usage_estimate(), "usage sync tick");
                }
            }
        }

        info!("usage sync task shutting down");
    }

    /// Spawn [`run`](Self::run) onto `runtime`.
    pub fn spawn(self, runtime: &Handle) -> UsageSyncHandle {
        let cancel = CancellationToken::new();
        let task = runtime.spawn(self.run(cancel.clone()));
        UsageSyncHandle { cancel, task }
    }
}

/// Handle to a spawned sync task.
pub struct UsageSyncHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl UsageSyncHandle {
    /// Request cooperative shutdown. Does not wait.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Whether the task has exited.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Cancel and wait for the task to exit.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            warn!(error = %e, "usage sync task ended abnormally");
        }
    }
}

enum LauncherState {
    Idle(UsageSync),
    Running(UsageSyncHandle),
    Stopped,
}

/// Starts the sync task when the filesystem is initialised and stops it when
/// the filesystem is torn down.
///
/// Both calls come from FUSE worker threads, outside the runtime.
pub struct SyncLauncher {
    runtime: Handle,
    state: Mutex<LauncherState>,
}

impl SyncLauncher {
    /// Launcher that will spawn `sync` onto `runtime`.
    pub fn new(runtime: Handle, sync: UsageSync) -> Self {
        Self {
            runtime,
            state: Mutex::new(LauncherState::Idle(sync)),
        }
    }

    /// Spawn the task. Only the first call has an effect.
    pub fn start(&self) {
        let mut state = self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        match std::mem::replace(&mut *state, LauncherState::Stopped) {
            LauncherState::Idle(sync) => {
                *state = LauncherState::Running(sync.spawn(&self.runtime));
            }
            other => *state = other,
        }
    }

    /// Cancel the task if it is running. A launcher that was never started
    /// will not start afterwards.
    pub fn stop(&self) {
        let mut state = self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if let LauncherState::Running(handle) = std::mem::replace(&mut *state, LauncherState::Stopped) {
            handle.cancel();
            info!("usage sync task cancelled");
        }
    }

    /// Whether the task is currently spawned and not yet finished.
    pub fn is_running(&self) -> bool {
        let state = self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        matches!(&*state, LauncherState::Running(handle) if !handle.is_finished())
    }
}

async fn bounded<T, F>(timeout: Duration, operation: &'static str, fut: F) -> Result<T, RemoteStoreError>
where
    F: Future<Output = Result<T, RemoteStoreError>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(RemoteStoreError::Timeout {
            operation,
            timeout_ms: timeout.as_millis() as u64,
        }),
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;

    use super::*;
    use crate::config::Identity;
    use crate::constants::BYTES_PER_MIB;

    const MIB: u64 = BYTES_PER_MIB;

    fn state(usage: u64) -> Arc<QuotaState> {
        let identity = Identity::new("tenant-a", "node-1").unwrap();
        Arc::new(QuotaState::with_usage_estimate(10 * MIB, identity, usage))
    }

    fn timing() -> SyncTiming {
        SyncTiming {
            interval: Duration::from_secs(1),
            timeout: Duration::from_millis(1500),
        }
    }

    fn key(state: &QuotaState) -> CounterKey {
        CounterKey::new(state.identity())
    }

    fn sync(state: &Arc<QuotaState>, store: &InMemoryCounterStore) -> UsageSync {
        UsageSync::new(state.clone(), Arc::new(store.clone()), "secret".to_string(), timing())
    }

    #[tokio::test]
    async fn test_refresh_replaces_estimate() {
        let state = state(9 * MIB);
        let store = InMemoryCounterStore::with_secret("secret");
        store.set_usage(&key(&state), (3 * MIB) as i64);

        let outcome = sync(&state, &store).run_once().await;

        assert_eq!(outcome, SyncOutcome::Synced {
            request_sent: true,
            usage_bytes: Some(3 * MIB),
        });
        assert_eq!(state.usage_estimate(), 3 * MIB);
    }

    #[tokio::test]
    async fn test_flag_drained_into_request() {
        let state = state(0);
        let store = InMemoryCounterStore::new();
        let k = key(&state);
        store.set_usage(&k, 0);
        let sync = sync(&state, &store);

        sync.run_once().await;
        assert!(!state.recompute_requested());
        assert_eq!(store.request_flag(&k), Some(1));
        assert_eq!(store.request_writes(), 1);

        // Clean flag: no request on the next tick.
        sync.run_once().await;
        assert_eq!(store.request_writes(), 1);

        state.request_recompute();
        state.request_recompute();
        sync.run_once().await;
        assert_eq!(store.request_writes(), 2);
    }

    #[tokio::test]
    async fn test_failed_request_still_clears_flag() {
        let state = state(MIB);
        let store = InMemoryCounterStore::new();
        store.set_fail_requests(true);
        store.set_usage(&key(&state), (2 * MIB) as i64);

        let outcome = sync(&state, &store).run_once().await;

        assert!(!state.recompute_requested());
        assert_eq!(store.request_writes(), 0);
        // The usage query still runs after a lost request.
        assert_eq!(outcome, SyncOutcome::Synced {
            request_sent: true,
            usage_bytes: Some(2 * MIB),
        });
    }

    #[tokio::test]
    async fn test_unreachable_store_keeps_estimate_and_flag() {
        let state = state(9 * MIB);
        let store = InMemoryCounterStore::new();
        store.set_offline(true);
        let sync = sync(&state, &store);

        for _ in 0..5 {
            assert_eq!(sync.run_once().await, SyncOutcome::ConnectFailed);
        }

        assert_eq!(state.usage_estimate(), 9 * MIB);
        assert!(state.recompute_requested());
        assert_eq!(store.connects(), 5);
    }

    #[tokio::test]
    async fn test_bad_secret_skips_tick() {
        let state = state(9 * MIB);
        let store = InMemoryCounterStore::with_secret("other");
        store.set_usage(&key(&state), 0);

        let outcome = sync(&state, &store).run_once().await;

        assert_eq!(outcome, SyncOutcome::AuthFailed);
        assert_eq!(state.usage_estimate(), 9 * MIB);
        assert!(state.recompute_requested());
        assert_eq!(store.request_writes(), 0);
    }

    #[tokio::test]
    async fn test_unusable_replies_keep_estimate() {
        let state = state(4 * MIB);
        let store = InMemoryCounterStore::new();
        let k = key(&state);
        let sync = sync(&state, &store);

        // Missing field.
        assert_eq!(sync.run_once().await, SyncOutcome::Synced {
            request_sent: true,
            usage_bytes: None,
        });

        store.set_usage_reply(&k, CounterReply::NotInteger("bulk(\"123\")".to_string()));
        sync.run_once().await;
        assert_eq!(state.usage_estimate(), 4 * MIB);

        store.set_usage(&k, -1);
        sync.run_once().await;
        assert_eq!(state.usage_estimate(), 4 * MIB);
    }

    #[tokio::test]
    async fn test_recovery_after_outage() {
        let state = state(9 * MIB);
        let store = InMemoryCounterStore::new();
        store.set_offline(true);
        store.set_usage(&key(&state), MIB as i64);
        let sync = sync(&state, &store);

        sync.run_once().await;
        assert_eq!(state.usage_estimate(), 9 * MIB);

        store.set_offline(false);
        sync.run_once().await;
        assert_eq!(state.usage_estimate(), MIB);
    }

    struct HangingStore;

    #[async_trait]
    impl CounterStore for HangingStore {
        async fn connect(&self) -> Result<Box<dyn CounterConnection>, RemoteStoreError> {
            std::future::pending().await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_hung_connect_is_bounded() {
        let state = state(5 * MIB);
        let sync = UsageSync::new(state.clone(), Arc::new(HangingStore), String::new(), timing());

        assert_eq!(sync.run_once().await, SyncOutcome::ConnectFailed);
        assert_eq!(state.usage_estimate(), 5 * MIB);
    }

    #[tokio::test(start_paused = true)]
    async fn test_loop_ticks_until_cancelled() {
        let state = state(9 * MIB);
        let store = InMemoryCounterStore::new();
        store.set_usage(&key(&state), (2 * MIB) as i64);

        let handle = sync(&state, &store).spawn(&Handle::current());
        tokio::time::sleep(Duration::from_millis(3500)).await;

        assert_eq!(state.usage_estimate(), 2 * MIB);
        let connects = store.connects();
        assert!((3..=5).contains(&connects), "connects = {connects}");

        handle.shutdown().await;
        let after = store.connects();
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(store.connects(), after);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hung_store_does_not_block_cancel() {
        let state = state(0);
        let sync = UsageSync::new(state, Arc::new(HangingStore), String::new(), SyncTiming {
            interval: Duration::from_secs(1),
            timeout: Duration::from_secs(3600),
        });

        let handle = sync.spawn(&Handle::current());
        tokio::time::sleep(Duration::from_millis(10)).await;
        handle.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn test_launcher_start_stop() {
        let state = state(0);
        let store = InMemoryCounterStore::new();
        let launcher = SyncLauncher::new(Handle::current(), sync(&state, &store));

        assert!(!launcher.is_running());
        launcher.start();
        launcher.start();
        assert!(launcher.is_running());

        launcher.stop();
        tokio::time::timeout(Duration::from_secs(5), async {
            while launcher.is_running() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        // Stopped launchers stay stopped.
        launcher.start();
        assert!(!launcher.is_running());
    }
}
