// Cluster coordinator: liveness check-in and recovery of failed nodes
//
// Each node refreshes its SchedulerStateRecord on a fixed interval. Nodes that
// stop refreshing, and owners of fired-trigger records that never checked in
// at all, are recovered under the state-access lock. Recovery is idempotent:
// every step is a conditional write and a repeated pass finds nothing to do.

use crate::acquisition::{is_paused, unblock_job_triggers, TriggerAcquisitionEngine};
use crate::errors::JobStoreError;
use crate::lock::{LockManager, LOCK_STATE_ACCESS};
use crate::models::{
    misfire, FiredState, FiredTriggerRecord, JobDetail, LockDocument, RecoveryPolicy, Schedule,
    SchedulerStateRecord, Trigger, TriggerKey, TriggerState, RECOVERING_JOBS_GROUP,
};
use crate::repository::{job_id, trigger_id, Entity, EntityStore, Query};
use crate::telemetry;
use chrono::{DateTime, Utc};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, instrument, warn};

/// Data-map keys carried by recovery triggers
pub const RECOVERING_TRIGGER_NAME: &str = "recovering_trigger_name";
pub const RECOVERING_TRIGGER_GROUP: &str = "recovering_trigger_group";
pub const RECOVERING_SCHEDULED_FIRE_TIME: &str = "recovering_scheduled_fire_time";
pub const RECOVERING_FIRED_TIME: &str = "recovering_fired_time";

/// Name of the one-shot trigger that replays `fire_instance_id` of `instance_id`
pub fn recovery_trigger_key(instance_id: &str, fire_instance_id: &str) -> TriggerKey {
    TriggerKey::new(
        format!("recover_{}_{}", instance_id, fire_instance_id),
        RECOVERING_JOBS_GROUP,
    )
}

/// What one coordinator cycle did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub checked_in: bool,
    pub failed_instances: Vec<String>,
    pub recovered_records: usize,
    pub misfires_handled: usize,
}

pub struct ClusterCoordinator {
    store: EntityStore,
    locks: Arc<LockManager>,
    engine: Arc<TriggerAcquisitionEngine>,
    instance_id: String,
    checkin_interval: Duration,
    clustered: bool,
    max_misfires_per_sweep: usize,
}

impl ClusterCoordinator {
    pub fn new(
        store: EntityStore,
        locks: Arc<LockManager>,
        engine: Arc<TriggerAcquisitionEngine>,
        checkin_interval: Duration,
        clustered: bool,
        max_misfires_per_sweep: usize,
    ) -> Self {
        let instance_id = locks.instance_id().to_string();
        Self {
            store,
            locks,
            engine,
            instance_id,
            checkin_interval,
            clustered,
            max_misfires_per_sweep,
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn checkin_interval(&self) -> Duration {
        self.checkin_interval
    }

    /// Refresh this node's liveness record
    #[instrument(skip(self), fields(instance_id = %self.instance_id))]
    pub async fn check_in(&self, now: DateTime<Utc>) -> Result<(), JobStoreError> {
        let record = SchedulerStateRecord {
            instance_id: self.instance_id.clone(),
            last_checkin: now,
            checkin_interval_ms: self.checkin_interval.as_millis() as i64,
        };
        self.store.put(&record).await?;
        debug!("Checked in");
        Ok(())
    }

    /// Remove this node's liveness record on graceful shutdown
    ///
    /// Locks this node holds must be released first, or peers would see a
    /// recent lock with no owner record.
    pub async fn remove_own_state(&self) -> Result<(), JobStoreError> {
        if self
            .store
            .remove_if_present::<SchedulerStateRecord>(&self.instance_id)
            .await?
        {
            info!(instance_id = %self.instance_id, "Removed scheduler state record");
        }
        Ok(())
    }

    /// Nodes presumed dead: stale check-ins, plus owners of fired records that never checked in
    #[instrument(skip(self), fields(instance_id = %self.instance_id))]
    pub async fn find_failed_instances(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<String>, JobStoreError> {
        let states = self
            .store
            .query::<SchedulerStateRecord>(Query::new())
            .await?;

        let mut failed = BTreeSet::new();
        let mut known = BTreeSet::new();
        for state in states {
            let record = state.entity;
            if record.instance_id != self.instance_id && record.is_stale_at(now) {
                failed.insert(record.instance_id.clone());
            }
            known.insert(record.instance_id);
        }

        for fired in self
            .store
            .query::<FiredTriggerRecord>(Query::new())
            .await?
        {
            let owner = fired.entity.instance_id;
            if owner != self.instance_id && !known.contains(&owner) {
                failed.insert(owner);
            }
        }

        for instance in &failed {
            warn!(failed_instance = %instance, "Detected failed scheduler instance");
            telemetry::record_failed_instance();
        }
        Ok(failed.into_iter().collect())
    }

    /// Reclaim everything `failed_instance` left behind; returns the number of fired records recovered
    ///
    /// The node's liveness is re-checked under the lock, so a node that came
    /// back in the meantime is left alone.
    #[instrument(skip(self), fields(instance_id = %self.instance_id))]
    pub async fn recover_instance(
        &self,
        failed_instance: &str,
        now: DateTime<Utc>,
    ) -> Result<usize, JobStoreError> {
        if failed_instance == self.instance_id {
            return Ok(0);
        }
        self.locks
            .with_lock(LOCK_STATE_ACCESS, || async {
                if let Some(state) = self
                    .store
                    .find::<SchedulerStateRecord>(failed_instance)
                    .await?
                {
                    if !state.entity.is_stale_at(now) {
                        info!(instance = %failed_instance, "Instance checked in again, skipping recovery");
                        return Ok(0);
                    }
                }

                let recovered = self.recover_records(Some(failed_instance), now).await?;
                self.release_locks_of(failed_instance, now).await?;
                self.remove_state_of(failed_instance, now).await?;

                info!(instance = %failed_instance, recovered, "Recovered failed instance");
                Ok(recovered)
            })
            .await
    }

    /// Reclaim records this node left behind in an earlier run
    ///
    /// Clustered nodes only recover records carrying their own id; a
    /// standalone node owns the whole partition, so it recovers every record
    /// and returns stuck `Acquired` and `Blocked` triggers to `Waiting`.
    #[instrument(skip(self), fields(instance_id = %self.instance_id, clustered = self.clustered))]
    pub async fn recover_on_startup(&self, now: DateTime<Utc>) -> Result<usize, JobStoreError> {
        self.locks
            .with_lock(LOCK_STATE_ACCESS, || async {
                if self.clustered {
                    return self.recover_records(Some(self.instance_id.as_str()), now).await;
                }

                let recovered = self.recover_records(None, now).await?;
                let mut reset = 0;
                for state in [TriggerState::Acquired, TriggerState::Blocked] {
                    let stuck = self
                        .store
                        .query::<Trigger>(Query::new().eq("state", state.as_str()))
                        .await?;
                    for found in stuck {
                        let updated = self
                            .store
                            .update::<Trigger, _>(&found.entity.document_id(), |t| {
                                if t.state != state {
                                    return false;
                                }
                                t.state = TriggerState::Waiting;
                                true
                            })
                            .await?;
                        if updated.is_some() {
                            reset += 1;
                        }
                    }
                }
                if recovered > 0 || reset > 0 {
                    info!(recovered, reset, "Recovered state left by a previous run");
                }
                Ok(recovered)
            })
            .await
    }

    async fn recover_records(
        &self,
        owner: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<usize, JobStoreError> {
        let query = match owner {
            Some(owner) => Query::new().eq("instance_id", owner),
            None => Query::new(),
        };
        let records = self.store.query::<FiredTriggerRecord>(query).await?;

        let mut recovered = 0;
        for found in records {
            let record = &found.entity;
            match record.state {
                FiredState::Acquired => self.revert_acquired(record).await?,
                FiredState::Executing => self.recover_execution(record, now).await?,
            }
            if record.concurrent_execution_disallowed {
                unblock_job_triggers(&self.store, &record.job_key).await?;
            }

            match self
                .store
                .remove::<FiredTriggerRecord>(&record.fire_instance_id, &found.token)
                .await
            {
                Ok(()) => {
                    recovered += 1;
                    telemetry::record_recovered_fired_trigger();
                }
                Err(JobStoreError::NotFound(_)) | Err(JobStoreError::ConcurrencyConflict(_)) => {
                    debug!(fire_instance_id = %record.fire_instance_id, "Fired record already reclaimed");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(recovered)
    }

    /// The trigger was reserved but never fired: hand it back
    async fn revert_acquired(&self, record: &FiredTriggerRecord) -> Result<(), JobStoreError> {
        let reverted = self
            .store
            .update::<Trigger, _>(&trigger_id(&record.trigger_key), |t| {
                if t.state != TriggerState::Acquired
                    || t.fire_instance_id.as_deref() != Some(record.fire_instance_id.as_str())
                {
                    return false;
                }
                t.state = TriggerState::Waiting;
                true
            })
            .await?;
        if let Some(trigger) = reverted {
            debug!(trigger = %record.trigger_key, state = %trigger.entity.state, "Reverted acquired trigger");
        }
        Ok(())
    }

    /// The job was running when its node died: apply the trigger's recovery policy
    async fn recover_execution(
        &self,
        record: &FiredTriggerRecord,
        now: DateTime<Utc>,
    ) -> Result<(), JobStoreError> {
        let trigger = self
            .store
            .find::<Trigger>(&trigger_id(&record.trigger_key))
            .await?
            .map(|found| found.entity);
        let policy = trigger
            .as_ref()
            .map(|t| t.recovery_policy)
            .unwrap_or_default();

        match policy {
            RecoveryPolicy::MarkError => {
                self.store
                    .update::<Trigger, _>(&trigger_id(&record.trigger_key), |t| {
                        t.state = TriggerState::Error;
                        true
                    })
                    .await?;
                warn!(trigger = %record.trigger_key, "Interrupted execution marked as error");
                Ok(())
            }
            RecoveryPolicy::Reschedule => {
                if self
                    .store
                    .find::<JobDetail>(&job_id(&record.job_key))
                    .await?
                    .is_none()
                {
                    warn!(job = %record.job_key, "Job of interrupted execution no longer exists");
                    return Ok(());
                }
                self.insert_recovery_trigger(record, trigger.as_ref(), now).await
            }
        }
    }

    async fn insert_recovery_trigger(
        &self,
        record: &FiredTriggerRecord,
        original: Option<&Trigger>,
        now: DateTime<Utc>,
    ) -> Result<(), JobStoreError> {
        let key = recovery_trigger_key(&record.instance_id, &record.fire_instance_id);
        let mut recovery = Trigger::new(key, record.job_key.clone(), Schedule::once())
            .starting_at(now)
            .with_next_fire_time(now)
            .with_priority(record.priority)
            .with_misfire_instruction(misfire::FIRE_NOW);

        if let Some(original) = original {
            recovery.job_data.merge(&original.job_data);
        }
        recovery
            .job_data
            .insert(RECOVERING_TRIGGER_NAME, record.trigger_key.name.clone());
        recovery
            .job_data
            .insert(RECOVERING_TRIGGER_GROUP, record.trigger_key.group.clone());
        recovery
            .job_data
            .insert(RECOVERING_SCHEDULED_FIRE_TIME, record.scheduled_at);
        recovery.job_data.insert(RECOVERING_FIRED_TIME, record.fired_at);

        if is_paused(&self.store, RECOVERING_JOBS_GROUP, &record.job_key.group).await? {
            recovery.state = TriggerState::Paused;
        }

        match self.store.insert(&recovery).await {
            Ok(_) => {
                info!(
                    trigger = %record.trigger_key,
                    recovery_trigger = %recovery.key,
                    "Scheduled recovery of interrupted execution"
                );
                Ok(())
            }
            Err(JobStoreError::ConcurrencyConflict(_)) => {
                debug!(recovery_trigger = %recovery.key, "Recovery trigger already exists");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn release_locks_of(&self, instance: &str, now: DateTime<Utc>) -> Result<(), JobStoreError> {
        let held = self
            .store
            .query::<LockDocument>(Query::new().eq("owner", instance))
            .await?;
        for lock in held {
            if self.locks.owner_is_alive(&lock.entity, now).await? {
                debug!(lock = %lock.entity.lock_name, owner = %instance, "Lock still within its grace period");
                continue;
            }
            match self
                .store
                .remove::<LockDocument>(&lock.entity.lock_name, &lock.token)
                .await
            {
                Ok(()) => info!(lock = %lock.entity.lock_name, owner = %instance, "Released lock of failed instance"),
                Err(JobStoreError::NotFound(_)) | Err(JobStoreError::ConcurrencyConflict(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    async fn remove_state_of(&self, instance: &str, now: DateTime<Utc>) -> Result<(), JobStoreError> {
        if let Some(state) = self.store.find::<SchedulerStateRecord>(instance).await? {
            if !state.entity.is_stale_at(now) {
                return Ok(());
            }
            match self
                .store
                .remove::<SchedulerStateRecord>(instance, &state.token)
                .await
            {
                Ok(()) | Err(JobStoreError::NotFound(_)) | Err(JobStoreError::ConcurrencyConflict(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// One coordinator pass; failures are logged and left to the next pass
    pub async fn run_cycle(&self, now: DateTime<Utc>) -> CycleReport {
        let mut report = CycleReport::default();

        match self.check_in(now).await {
            Ok(()) => report.checked_in = true,
            Err(e) => {
                telemetry::record_checkin_failure();
                warn!(error = %e, "Cluster check-in failed");
            }
        }

        if self.clustered {
            match self.find_failed_instances(now).await {
                Ok(failed) => {
                    for instance in &failed {
                        match self.recover_instance(instance, now).await {
                            Ok(count) => report.recovered_records += count,
                            Err(e) => warn!(
                                failed_instance = %instance,
                                error = %e,
                                "Recovery did not complete, retrying next cycle"
                            ),
                        }
                    }
                    report.failed_instances = failed;
                }
                Err(e) => warn!(error = %e, "Failed to scan for failed instances"),
            }
        }

        match self
            .engine
            .handle_misfires(now, self.max_misfires_per_sweep)
            .await
        {
            Ok(count) => report.misfires_handled = count,
            Err(e) => warn!(error = %e, "Misfire sweep failed"),
        }

        report
    }

    /// Run `run_cycle` every check-in interval until shutdown is signalled
    pub fn spawn(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(
                instance_id = %self.instance_id,
                checkin_interval_ms = self.checkin_interval.as_millis() as u64,
                "Starting cluster coordinator"
            );
            let mut ticker = interval(self.checkin_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let report = self.run_cycle(Utc::now()).await;
                        if !report.failed_instances.is_empty() || report.misfires_handled > 0 {
                            info!(
                                failed_instances = report.failed_instances.len(),
                                recovered = report.recovered_records,
                                misfires = report.misfires_handled,
                                "Coordinator cycle"
                            );
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }

            info!(instance_id = %self.instance_id, "Cluster coordinator stopped");
        })
    }
}
