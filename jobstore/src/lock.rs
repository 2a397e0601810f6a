// Distributed locking with compare-and-set lock documents
//
// A lock is a document named after the lock. Claiming it is a conditional
// insert; taking it over from a dead owner or reclaiming one this node leaked
// is a conditional overwrite of the exact version that was inspected. The
// store arbitrates every race, so at most one live owner exists per name.

use crate::config::RetryConfig;
use crate::errors::JobStoreError;
use crate::models::{LockDocument, SchedulerStateRecord};
use crate::repository::{ConcurrencyToken, EntityStore};
use crate::retry::{ExponentialBackoff, RetryStrategy};
use crate::telemetry;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, instrument, warn};

/// Serializes trigger acquisition, firing and misfire handling
pub const LOCK_TRIGGER_ACCESS: &str = "trigger-access";

/// Serializes cluster recovery
pub const LOCK_STATE_ACCESS: &str = "state-access";

const CLAIM_BACKOFF_BASE_MS: u64 = 10;
const CLAIM_BACKOFF_MAX_MS: u64 = 250;
const CLAIM_BACKOFF_JITTER: f64 = 0.5;

/// Locks this node holds (`Some`) or is in the middle of claiming (`None`)
type HeldLocks = Arc<Mutex<HashMap<String, Option<ConcurrencyToken>>>>;

fn lock_held(held: &HeldLocks) -> MutexGuard<'_, HashMap<String, Option<ConcurrencyToken>>> {
    held.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Proof of ownership of a named lock
///
/// Dropping a handle without releasing it forgets the lock locally; the
/// document it left behind is reclaimed by the next claim from this node.
#[derive(Debug)]
pub struct LockHandle {
    lock_name: String,
    owner: String,
    token: ConcurrencyToken,
    acquired_at: Instant,
    held: HeldLocks,
}

impl LockHandle {
    pub fn lock_name(&self) -> &str {
        &self.lock_name
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// Time elapsed since the lock was acquired
    pub fn elapsed(&self) -> Duration {
        self.acquired_at.elapsed()
    }
}

impl Drop for LockHandle {
    fn drop(&mut self) {
        let mut held = lock_held(&self.held);
        if held.get(&self.lock_name) == Some(&Some(self.token.clone())) {
            held.remove(&self.lock_name);
        }
    }
}

/// Local claim in progress; withdrawn unless the store write succeeds
struct Reservation<'a> {
    held: &'a HeldLocks,
    lock_name: &'a str,
    committed: bool,
}

impl<'a> Reservation<'a> {
    fn try_new(held: &'a HeldLocks, lock_name: &'a str) -> Option<Self> {
        let mut map = lock_held(held);
        if map.contains_key(lock_name) {
            return None;
        }
        map.insert(lock_name.to_string(), None);
        Some(Self {
            held,
            lock_name,
            committed: false,
        })
    }

    fn commit(mut self, token: ConcurrencyToken) {
        lock_held(self.held).insert(self.lock_name.to_string(), Some(token));
        self.committed = true;
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if !self.committed {
            let mut map = lock_held(self.held);
            if map.get(self.lock_name) == Some(&None) {
                map.remove(self.lock_name);
            }
        }
    }
}

/// Outcome of one claim attempt
enum Claim {
    Acquired(ConcurrencyToken),
    Contended { owner: String },
}

/// Named mutual exclusion across cluster nodes
pub struct LockManager {
    store: EntityStore,
    instance_id: String,
    default_timeout: Duration,
    claim_backoff: ExponentialBackoff,
    release_retry: ExponentialBackoff,
    orphan_grace: Duration,
    held: HeldLocks,
    shutdown: watch::Receiver<bool>,
}

impl LockManager {
    pub fn new(
        store: EntityStore,
        instance_id: impl Into<String>,
        default_timeout: Duration,
        retry: &RetryConfig,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            store,
            instance_id: instance_id.into(),
            default_timeout,
            claim_backoff: ExponentialBackoff::unbounded(
                CLAIM_BACKOFF_BASE_MS,
                CLAIM_BACKOFF_MAX_MS,
                CLAIM_BACKOFF_JITTER,
            ),
            release_retry: ExponentialBackoff::from(retry),
            orphan_grace: default_timeout,
            held: Arc::new(Mutex::new(HashMap::new())),
            shutdown,
        }
    }

    /// How long a lock whose owner has no liveness record is still honoured
    ///
    /// Covers owners that have not checked in yet or have just left the cluster.
    pub fn with_orphan_grace(mut self, grace: Duration) -> Self {
        self.orphan_grace = grace;
        self
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    /// Whether this node currently holds `lock_name`
    pub fn holds(&self, lock_name: &str) -> bool {
        matches!(lock_held(&self.held).get(lock_name), Some(Some(_)))
    }

    /// Claim `lock_name`, waiting with jittered backoff up to `timeout`
    ///
    /// Fails with `LockTimeout` once the timeout elapses, or promptly once
    /// shutdown has been signalled.
    #[instrument(skip(self), fields(lock = %lock_name, owner = %self.instance_id))]
    pub async fn acquire(
        &self,
        lock_name: &str,
        timeout: Duration,
    ) -> Result<LockHandle, JobStoreError> {
        let started = Instant::now();
        let deadline = started + timeout;
        let mut shutdown = self.shutdown.clone();
        let mut attempt = 0u32;

        loop {
            if *shutdown.borrow() {
                debug!("Shutdown signalled, abandoning lock acquisition");
                return Err(self.timed_out(lock_name, started));
            }

            if let Some(reservation) = Reservation::try_new(&self.held, lock_name) {
                match self.try_claim(lock_name).await? {
                    Claim::Acquired(token) => {
                        reservation.commit(token.clone());
                        telemetry::record_lock_wait(lock_name, started.elapsed().as_secs_f64());
                        debug!(attempts = attempt + 1, "Lock acquired");
                        return Ok(LockHandle {
                            lock_name: lock_name.to_string(),
                            owner: self.instance_id.clone(),
                            token,
                            acquired_at: Instant::now(),
                            held: Arc::clone(&self.held),
                        });
                    }
                    Claim::Contended { owner } => {
                        debug!(current_owner = %owner, attempt, "Lock held elsewhere");
                    }
                }
            }

            let now = Instant::now();
            if now >= deadline {
                warn!(attempts = attempt + 1, "Failed to acquire lock before timeout");
                return Err(self.timed_out(lock_name, started));
            }
            let delay = self
                .claim_backoff
                .next_delay(attempt)
                .unwrap_or(Duration::from_millis(CLAIM_BACKOFF_MAX_MS))
                .min(deadline - now);

            tokio::select! {
                _ = sleep(delay) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        // sender gone: nobody can signal shutdown any more
                        sleep(delay).await;
                    }
                }
            }
            attempt = attempt.saturating_add(1);
        }
    }

    fn timed_out(&self, lock_name: &str, started: Instant) -> JobStoreError {
        telemetry::record_lock_timeout(lock_name);
        JobStoreError::LockTimeout {
            lock: lock_name.to_string(),
            waited_ms: started.elapsed().as_millis() as u64,
        }
    }

    /// One conditional write against the lock document
    async fn try_claim(&self, lock_name: &str) -> Result<Claim, JobStoreError> {
        let claim = LockDocument {
            lock_name: lock_name.to_string(),
            owner: self.instance_id.clone(),
            acquired_at: Utc::now(),
        };

        let current = match self.store.find::<LockDocument>(lock_name).await? {
            None => {
                return match self.store.insert(&claim).await {
                    Ok(token) => Ok(Claim::Acquired(token)),
                    Err(JobStoreError::ConcurrencyConflict(_)) => Ok(Claim::Contended {
                        owner: "unknown".to_string(),
                    }),
                    Err(e) => Err(e),
                };
            }
            Some(current) => current,
        };

        let owner = current.entity.owner.clone();
        if owner == self.instance_id {
            // no local task holds it (we reserved the name), so an earlier holder leaked it
            info!(lock = %lock_name, "Reclaiming lock leaked by this node");
        } else if self.owner_is_alive(&current.entity, Utc::now()).await? {
            return Ok(Claim::Contended { owner });
        } else {
            warn!(lock = %lock_name, stale_owner = %owner, "Taking over lock from stale owner");
        }

        match self.store.replace(&claim, &current.token).await {
            Ok(token) => Ok(Claim::Acquired(token)),
            Err(JobStoreError::ConcurrencyConflict(_)) | Err(JobStoreError::NotFound(_)) => {
                Ok(Claim::Contended { owner })
            }
            Err(e) => Err(e),
        }
    }

    /// Whether the owner of `lock` must still be presumed to hold it at `now`
    ///
    /// A stale liveness record means the owner is dead. Without any record the
    /// lock is honoured until it is older than the orphan grace period.
    pub async fn owner_is_alive(
        &self,
        lock: &LockDocument,
        now: DateTime<Utc>,
    ) -> Result<bool, JobStoreError> {
        let state = self.store.find::<SchedulerStateRecord>(&lock.owner).await?;
        Ok(match state {
            Some(state) => !state.entity.is_stale_at(now),
            None => {
                let grace = chrono::Duration::from_std(self.orphan_grace)
                    .unwrap_or_else(|_| chrono::Duration::zero());
                now - lock.acquired_at <= grace
            }
        })
    }

    /// Give the lock back; a lock already taken over by another owner is left alone
    #[instrument(skip(self, handle), fields(lock = %handle.lock_name, owner = %self.instance_id))]
    pub async fn release(&self, handle: LockHandle) {
        let mut attempt = 0;
        loop {
            match self
                .store
                .remove::<LockDocument>(&handle.lock_name, &handle.token)
                .await
            {
                Ok(()) => {
                    debug!(held_ms = handle.elapsed().as_millis() as u64, "Lock released");
                    break;
                }
                Err(JobStoreError::NotFound(_)) | Err(JobStoreError::ConcurrencyConflict(_)) => {
                    debug!("Lock was already taken over, nothing to release");
                    break;
                }
                Err(JobStoreError::StoreUnavailable(reason)) => {
                    match self.release_retry.next_delay(attempt) {
                        Some(delay) => {
                            debug!(attempt, error = %reason, "Retrying lock release");
                            sleep(delay).await;
                            attempt += 1;
                        }
                        None => {
                            warn!(error = %reason, "Failed to release lock, it will be reclaimed later");
                            break;
                        }
                    }
                }
                Err(e) => {
                    warn!(error = %e, "Failed to release lock");
                    break;
                }
            }
        }
        drop(handle);
    }

    /// Run `op` while holding `lock_name`, releasing it afterwards whatever the outcome
    pub async fn with_lock<T, F, Fut>(&self, lock_name: &str, op: F) -> Result<T, JobStoreError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, JobStoreError>>,
    {
        let handle = self.acquire(lock_name, self.default_timeout).await?;
        let result = op().await;
        self.release(handle).await;
        result
    }

    /// Release every lock this node still holds
    #[instrument(skip(self), fields(owner = %self.instance_id))]
    pub async fn release_all(&self) {
        let held: Vec<(String, ConcurrencyToken)> = lock_held(&self.held)
            .drain()
            .filter_map(|(name, token)| token.map(|t| (name, t)))
            .collect();

        for (name, token) in held {
            match self.store.remove::<LockDocument>(&name, &token).await {
                Ok(()) => info!(lock = %name, "Released lock on shutdown"),
                Err(JobStoreError::NotFound(_)) | Err(JobStoreError::ConcurrencyConflict(_)) => {}
                Err(e) => warn!(lock = %name, error = %e, "Failed to release lock on shutdown"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::InMemoryDocumentStore;
    use crate::serialization::DocumentSerializer;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn shared_store(repo: &InMemoryDocumentStore) -> EntityStore {
        EntityStore::new(
            Arc::new(repo.clone()),
            "QUARTZ_TEST",
            DocumentSerializer::default(),
        )
    }

    async fn check_in(store: &EntityStore, node: &str) {
        store
            .put(&SchedulerStateRecord {
                instance_id: node.to_string(),
                last_checkin: Utc::now(),
                checkin_interval_ms: 60_000,
            })
            .await
            .unwrap();
    }

    fn manager(repo: &InMemoryDocumentStore, node: &str) -> (LockManager, watch::Sender<bool>) {
        let (tx, rx) = watch::channel(false);
        let retry = RetryConfig {
            max_attempts: 2,
            base_delay_ms: 1,
            max_delay_ms: 2,
            jitter_factor: 0.0,
        };
        (
            LockManager::new(shared_store(repo), node, Duration::from_secs(5), &retry, rx),
            tx,
        )
    }

    #[tokio::test]
    async fn test_acquire_and_release() {
        let repo = InMemoryDocumentStore::new();
        let (a, _tx) = manager(&repo, "A");
        let handle = a
            .acquire(LOCK_TRIGGER_ACCESS, Duration::from_millis(100))
            .await
            .unwrap();
        assert!(a.holds(LOCK_TRIGGER_ACCESS));
        assert_eq!(handle.owner(), "A");
        a.release(handle).await;
        assert!(!a.holds(LOCK_TRIGGER_ACCESS));
        assert_eq!(repo.count("QUARTZ_TEST", crate::repository::Collection::Locks), 0);
    }

    #[tokio::test]
    async fn test_live_owner_blocks_until_timeout() {
        let repo = InMemoryDocumentStore::new();
        let (a, _ta) = manager(&repo, "A");
        let (b, _tb) = manager(&repo, "B");
        check_in(&shared_store(&repo), "A").await;

        let handle = a
            .acquire(LOCK_TRIGGER_ACCESS, Duration::from_secs(5))
            .await
            .unwrap();

        let started = std::time::Instant::now();
        let err = b
            .acquire(LOCK_TRIGGER_ACCESS, Duration::from_millis(200))
            .await
            .unwrap_err();
        assert!(matches!(err, JobStoreError::LockTimeout { .. }));
        assert!(started.elapsed() >= Duration::from_millis(200));

        a.release(handle).await;
        let started = std::time::Instant::now();
        b.acquire(LOCK_TRIGGER_ACCESS, Duration::from_millis(200))
            .await
            .unwrap();
        assert!(started.elapsed() < Duration::from_millis(100));
    }

    #[tokio::test]
    async fn test_stale_owner_is_taken_over() {
        let repo = InMemoryDocumentStore::new();
        let store = shared_store(&repo);
        let (a, _ta) = manager(&repo, "A");
        let (b, _tb) = manager(&repo, "B");

        store
            .put(&SchedulerStateRecord {
                instance_id: "A".to_string(),
                last_checkin: Utc::now() - chrono::Duration::seconds(10),
                checkin_interval_ms: 1_000,
            })
            .await
            .unwrap();
        let stolen_from = a
            .acquire(LOCK_STATE_ACCESS, Duration::from_millis(100))
            .await
            .unwrap();

        let handle = b
            .acquire(LOCK_STATE_ACCESS, Duration::from_millis(100))
            .await
            .unwrap();
        let doc = store
            .find::<LockDocument>(LOCK_STATE_ACCESS)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(doc.entity.owner, "B");

        // the previous owner's release is a no-op and does not free B's lock
        a.release(stolen_from).await;
        assert!(store
            .find::<LockDocument>(LOCK_STATE_ACCESS)
            .await
            .unwrap()
            .is_some());
        b.release(handle).await;
    }

    #[tokio::test]
    async fn test_holder_without_checkin_keeps_recent_lock() {
        let repo = InMemoryDocumentStore::new();
        let (a, _ta) = manager(&repo, "A");
        let (b, _tb) = manager(&repo, "B");
        check_in(&shared_store(&repo), "B").await;

        // A never checked in, as before its scheduler is started
        let handle = a
            .acquire(LOCK_TRIGGER_ACCESS, Duration::from_secs(5))
            .await
            .unwrap();
        assert!(matches!(
            b.acquire(LOCK_TRIGGER_ACCESS, Duration::from_millis(300)).await,
            Err(JobStoreError::LockTimeout { .. })
        ));
        a.release(handle).await;
    }

    #[tokio::test]
    async fn test_old_lock_without_owner_record_is_taken_over() {
        let repo = InMemoryDocumentStore::new();
        let store = shared_store(&repo);
        let (b, _tb) = manager(&repo, "B");
        let b = b.with_orphan_grace(Duration::from_secs(1));
        store
            .insert(&LockDocument {
                lock_name: LOCK_TRIGGER_ACCESS.to_string(),
                owner: "gone".to_string(),
                acquired_at: Utc::now() - chrono::Duration::seconds(2),
            })
            .await
            .unwrap();

        let handle = b
            .acquire(LOCK_TRIGGER_ACCESS, Duration::from_millis(100))
            .await
            .unwrap();
        assert_eq!(handle.owner(), "B");
        b.release(handle).await;
    }

    #[tokio::test]
    async fn test_same_node_tasks_exclude_each_other() {
        let repo = InMemoryDocumentStore::new();
        let (a, _ta) = manager(&repo, "A");
        let handle = a
            .acquire(LOCK_TRIGGER_ACCESS, Duration::from_millis(100))
            .await
            .unwrap();
        assert!(matches!(
            a.acquire(LOCK_TRIGGER_ACCESS, Duration::from_millis(50)).await,
            Err(JobStoreError::LockTimeout { .. })
        ));
        a.release(handle).await;
    }

    #[tokio::test]
    async fn test_leaked_lock_is_reclaimed_by_owner() {
        let repo = InMemoryDocumentStore::new();
        let (a, _ta) = manager(&repo, "A");
        let handle = a
            .acquire(LOCK_TRIGGER_ACCESS, Duration::from_millis(100))
            .await
            .unwrap();
        // dropped without release, as when the holding task is cancelled
        drop(handle);
        assert!(!a.holds(LOCK_TRIGGER_ACCESS));

        let again = a
            .acquire(LOCK_TRIGGER_ACCESS, Duration::from_millis(100))
            .await
            .unwrap();
        a.release(again).await;
    }

    #[tokio::test]
    async fn test_shutdown_abandons_acquisition_promptly() {
        let repo = InMemoryDocumentStore::new();
        let (a, _ta) = manager(&repo, "A");
        let (b, tb) = manager(&repo, "B");
        check_in(&shared_store(&repo), "A").await;
        let _handle = a
            .acquire(LOCK_TRIGGER_ACCESS, Duration::from_secs(5))
            .await
            .unwrap();

        let started = std::time::Instant::now();
        let waiter = tokio::spawn(async move {
            b.acquire(LOCK_TRIGGER_ACCESS, Duration::from_secs(10)).await
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        tb.send(true).unwrap();
        let result = waiter.await.unwrap();
        assert!(matches!(result, Err(JobStoreError::LockTimeout { .. })));
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_release_all_frees_held_locks() {
        let repo = InMemoryDocumentStore::new();
        let (a, _ta) = manager(&repo, "A");
        let h1 = a
            .acquire(LOCK_TRIGGER_ACCESS, Duration::from_millis(100))
            .await
            .unwrap();
        let h2 = a
            .acquire(LOCK_STATE_ACCESS, Duration::from_millis(100))
            .await
            .unwrap();
        a.release_all().await;
        assert_eq!(repo.count("QUARTZ_TEST", crate::repository::Collection::Locks), 0);
        drop(h1);
        drop(h2);
    }

    #[tokio::test]
    async fn test_unavailable_store_surfaces_from_acquire() {
        let repo = InMemoryDocumentStore::new();
        let (a, _ta) = manager(&repo, "A");
        repo.set_online(false);
        assert!(matches!(
            a.acquire(LOCK_TRIGGER_ACCESS, Duration::from_millis(50)).await,
            Err(JobStoreError::StoreUnavailable(_))
        ));
        repo.set_online(true);
        // the failed attempt left no local reservation behind
        a.acquire(LOCK_TRIGGER_ACCESS, Duration::from_millis(50))
            .await
            .unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_at_most_one_holder_across_nodes() {
        let repo = InMemoryDocumentStore::new();
        let store = shared_store(&repo);
        let inside = Arc::new(AtomicUsize::new(0));
        let entries = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for node in 0..6 {
            let name = format!("node-{}", node);
            check_in(&store, &name).await;
            let (node_locks, tx) = manager(&repo, &name);
            let inside = Arc::clone(&inside);
            let entries = Arc::clone(&entries);
            tasks.push(tokio::spawn(async move {
                let _tx = tx;
                for _ in 0..5 {
                    let handle = node_locks
                        .acquire(LOCK_TRIGGER_ACCESS, Duration::from_secs(10))
                        .await
                        .unwrap();
                    assert_eq!(inside.fetch_add(1, Ordering::SeqCst), 0);
                    entries.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(2)).await;
                    inside.fetch_sub(1, Ordering::SeqCst);
                    node_locks.release(handle).await;
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(entries.load(Ordering::SeqCst), 30);
    }
}
