// Job store facade
//
// The single interface the scheduler engine calls. It validates input and
// delegates to the acquisition engine, lock manager and cluster coordinator.
// Mutations spanning several documents run under the trigger-access lock, and
// every operation is retried with backoff while the store is unavailable.

use crate::acquisition::{
    apply_misfire_instruction, is_paused, job_executing_exclusively, job_triggers_query,
    load_calendar, remove_trigger_cascade, TriggerAcquisitionEngine,
};
use crate::calendar::Calendar;
use crate::cluster::ClusterCoordinator;
use crate::config::Settings;
use crate::errors::{JobStoreError, ValidationError};
use crate::lock::{LockManager, LOCK_TRIGGER_ACCESS};
use crate::models::{
    CommitInstruction, CompletedExecutionInstruction, FiredTriggerRecord, JobDetail,
    JobKey, MisfireInstruction, PausedJobGroup, PausedTriggerGroup, Trigger, TriggerKey,
    TriggerState, ALL_GROUPS_PAUSED,
};
use crate::repository::{job_id, trigger_id, DocumentRepository, Entity, EntityStore, Query};
use crate::retry::{retry_on_unavailable, ExponentialBackoff};
use crate::schedule;
use crate::serialization::DocumentSerializer;
use crate::telemetry;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeSet;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, instrument, warn};

/// Operations the scheduler engine performs against persistent storage
#[async_trait]
pub trait JobStore: Send + Sync {
    fn instance_id(&self) -> &str;
    fn is_clustered(&self) -> bool;

    /// Check in, recover leftovers and start the cluster coordinator
    async fn start(&self) -> Result<(), JobStoreError>;
    /// Stop the coordinator, abandon pending lock waits and release held locks
    async fn shutdown(&self) -> Result<(), JobStoreError>;

    async fn store_job(&self, job: JobDetail, replace_existing: bool) -> Result<(), JobStoreError>;
    async fn store_job_and_trigger(
        &self,
        job: JobDetail,
        trigger: Trigger,
    ) -> Result<(), JobStoreError>;
    async fn retrieve_job(&self, key: &JobKey) -> Result<Option<JobDetail>, JobStoreError>;
    /// Remove a job together with all of its triggers
    async fn remove_job(&self, key: &JobKey) -> Result<bool, JobStoreError>;
    async fn check_job_exists(&self, key: &JobKey) -> Result<bool, JobStoreError>;

    async fn store_trigger(
        &self,
        trigger: Trigger,
        replace_existing: bool,
    ) -> Result<(), JobStoreError>;
    async fn retrieve_trigger(&self, key: &TriggerKey) -> Result<Option<Trigger>, JobStoreError>;
    async fn remove_trigger(&self, key: &TriggerKey) -> Result<bool, JobStoreError>;
    /// Swap the trigger stored under `key` for `trigger`; both must target the same job
    async fn replace_trigger(
        &self,
        key: &TriggerKey,
        trigger: Trigger,
    ) -> Result<bool, JobStoreError>;
    async fn check_trigger_exists(&self, key: &TriggerKey) -> Result<bool, JobStoreError>;
    async fn get_triggers_for_job(&self, key: &JobKey) -> Result<Vec<Trigger>, JobStoreError>;
    async fn get_trigger_state(
        &self,
        key: &TriggerKey,
    ) -> Result<Option<TriggerState>, JobStoreError>;

    async fn store_calendar(
        &self,
        calendar: Calendar,
        replace_existing: bool,
        update_triggers: bool,
    ) -> Result<(), JobStoreError>;
    async fn retrieve_calendar(&self, name: &str) -> Result<Option<Calendar>, JobStoreError>;
    /// Fails while any trigger still references the calendar
    async fn remove_calendar(&self, name: &str) -> Result<bool, JobStoreError>;

    async fn get_job_keys(&self, group: Option<&str>) -> Result<Vec<JobKey>, JobStoreError>;
    async fn get_trigger_keys(&self, group: Option<&str>)
        -> Result<Vec<TriggerKey>, JobStoreError>;
    async fn get_job_group_names(&self) -> Result<Vec<String>, JobStoreError>;
    async fn get_trigger_group_names(&self) -> Result<Vec<String>, JobStoreError>;
    async fn get_calendar_names(&self) -> Result<Vec<String>, JobStoreError>;
    async fn number_of_jobs(&self) -> Result<usize, JobStoreError>;
    async fn number_of_triggers(&self) -> Result<usize, JobStoreError>;
    async fn number_of_calendars(&self) -> Result<usize, JobStoreError>;

    async fn pause_trigger(&self, key: &TriggerKey) -> Result<(), JobStoreError>;
    async fn resume_trigger(&self, key: &TriggerKey) -> Result<(), JobStoreError>;
    async fn pause_trigger_group(&self, group: &str) -> Result<(), JobStoreError>;
    async fn resume_trigger_group(&self, group: &str) -> Result<(), JobStoreError>;
    async fn pause_job(&self, key: &JobKey) -> Result<(), JobStoreError>;
    async fn resume_job(&self, key: &JobKey) -> Result<(), JobStoreError>;
    async fn pause_job_group(&self, group: &str) -> Result<(), JobStoreError>;
    async fn resume_job_group(&self, group: &str) -> Result<(), JobStoreError>;
    async fn pause_all(&self) -> Result<(), JobStoreError>;
    async fn resume_all(&self) -> Result<(), JobStoreError>;
    async fn get_paused_trigger_groups(&self) -> Result<Vec<String>, JobStoreError>;

    async fn acquire_next_triggers(
        &self,
        now: DateTime<Utc>,
        window: Duration,
        max_count: usize,
    ) -> Result<Vec<Trigger>, JobStoreError>;
    async fn trigger_fired(&self, trigger: &Trigger) -> Result<CommitInstruction, JobStoreError>;
    async fn release_acquired_trigger(&self, trigger: &Trigger) -> Result<(), JobStoreError>;
    async fn triggered_job_complete(
        &self,
        trigger: &Trigger,
        job: &JobDetail,
        instruction: CompletedExecutionInstruction,
    ) -> Result<(), JobStoreError>;

    /// Delete every job, trigger, calendar, fired record and pause marker of this scheduler
    async fn clear_all_scheduling_data(&self) -> Result<(), JobStoreError>;
}

fn validate_key(kind: &str, name: &str, group: &str) -> Result<(), ValidationError> {
    if name.trim().is_empty() {
        return Err(ValidationError::MissingField(format!("{} name", kind)));
    }
    if group.trim().is_empty() {
        return Err(ValidationError::MissingField(format!("{} group", kind)));
    }
    Ok(())
}

fn validate_job(job: &JobDetail) -> Result<(), JobStoreError> {
    validate_key("job", &job.key.name, &job.key.group)?;
    if job.job_type.trim().is_empty() {
        return Err(ValidationError::MissingField("job type".to_string()).into());
    }
    Ok(())
}

fn validate_trigger(trigger: &Trigger) -> Result<(), JobStoreError> {
    validate_key("trigger", &trigger.key.name, &trigger.key.group)?;
    validate_key("job", &trigger.job_key.name, &trigger.job_key.group)?;
    if MisfireInstruction::from_code(trigger.misfire_instruction).is_none() {
        return Err(ValidationError::InvalidFieldValue {
            field: "misfire_instruction".to_string(),
            reason: format!("unknown instruction code {}", trigger.misfire_instruction),
        }
        .into());
    }
    if let Some(end) = trigger.end_time {
        if end < trigger.start_time {
            return Err(ValidationError::InvalidFieldValue {
                field: "end_time".to_string(),
                reason: "end time precedes start time".to_string(),
            }
            .into());
        }
    }
    schedule::validate_schedule(&trigger.schedule)?;
    Ok(())
}

/// Document-store backed `JobStore`
pub struct DocumentJobStore {
    store: EntityStore,
    locks: Arc<LockManager>,
    engine: Arc<TriggerAcquisitionEngine>,
    coordinator: Arc<ClusterCoordinator>,
    retry: ExponentialBackoff,
    instance_id: String,
    clustered: bool,
    started: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
    coordinator_task: Mutex<Option<JoinHandle<()>>>,
}

impl DocumentJobStore {
    pub fn new(
        repo: Arc<dyn DocumentRepository>,
        settings: &Settings,
    ) -> Result<Self, JobStoreError> {
        settings.validate().map_err(JobStoreError::Configuration)?;
        let scheduler = &settings.scheduler;
        let instance_id = scheduler.resolve_instance_id();

        let store = EntityStore::new(
            repo,
            scheduler.instance_name.clone(),
            DocumentSerializer::new(scheduler.serializer),
        );
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        // a node holds locks before its first check-in and after its last one
        let orphan_grace = scheduler.lock_timeout().max(scheduler.checkin_interval() * 2);
        let locks = Arc::new(
            LockManager::new(
                store.clone(),
                instance_id.clone(),
                scheduler.lock_timeout(),
                &settings.retry,
                shutdown_rx,
            )
            .with_orphan_grace(orphan_grace),
        );
        let engine = Arc::new(TriggerAcquisitionEngine::new(
            store.clone(),
            Arc::clone(&locks),
            instance_id.clone(),
            scheduler.misfire_threshold(),
        ));
        let coordinator = Arc::new(ClusterCoordinator::new(
            store.clone(),
            Arc::clone(&locks),
            Arc::clone(&engine),
            scheduler.checkin_interval(),
            scheduler.clustered,
            scheduler.max_misfires_per_sweep,
        ));

        info!(
            instance_name = %scheduler.instance_name,
            instance_id = %instance_id,
            clustered = scheduler.clustered,
            serializer = scheduler.serializer.as_str(),
            "Job store created"
        );

        Ok(Self {
            store,
            locks,
            engine,
            coordinator,
            retry: ExponentialBackoff::from(&settings.retry),
            instance_id,
            clustered: scheduler.clustered,
            started: AtomicBool::new(false),
            shutdown_tx,
            coordinator_task: Mutex::new(None),
        })
    }

    pub fn coordinator(&self) -> &Arc<ClusterCoordinator> {
        &self.coordinator
    }

    pub fn locks(&self) -> &Arc<LockManager> {
        &self.locks
    }

    pub fn engine(&self) -> &Arc<TriggerAcquisitionEngine> {
        &self.engine
    }

    pub fn entity_store(&self) -> &EntityStore {
        &self.store
    }

    fn task_slot(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.coordinator_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn ensure_running(&self) -> Result<(), JobStoreError> {
        if *self.shutdown_tx.borrow() {
            return Err(JobStoreError::ShuttingDown);
        }
        Ok(())
    }

    /// Read-only operation with retries
    async fn read<T, F, Fut>(&self, operation: &str, op: F) -> Result<T, JobStoreError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, JobStoreError>>,
    {
        retry_on_unavailable(&self.retry, operation, op).await
    }

    /// Mutation under the trigger-access lock, retried as a whole
    async fn locked<T, F, Fut>(&self, operation: &str, op: F) -> Result<T, JobStoreError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, JobStoreError>>,
    {
        self.ensure_running()?;
        retry_on_unavailable(&self.retry, operation, || {
            self.locks.with_lock(LOCK_TRIGGER_ACCESS, &op)
        })
        .await
    }

    async fn initial_state(&self, trigger: &Trigger) -> Result<TriggerState, JobStoreError> {
        if is_paused(&self.store, &trigger.key.group, &trigger.job_key.group).await? {
            Ok(TriggerState::Paused)
        } else if job_executing_exclusively(&self.store, &trigger.job_key).await? {
            Ok(TriggerState::Blocked)
        } else {
            Ok(TriggerState::Waiting)
        }
    }

    async fn store_job_locked(
        &self,
        job: &JobDetail,
        replace_existing: bool,
    ) -> Result<(), JobStoreError> {
        match self.store.find::<JobDetail>(&job.document_id()).await? {
            Some(_) if !replace_existing => {
                Err(JobStoreError::ObjectAlreadyExists(format!("job {}", job.key)))
            }
            Some(existing) => {
                self.store.replace(job, &existing.token).await?;
                Ok(())
            }
            None => {
                self.store.insert(job).await?;
                Ok(())
            }
        }
    }

    async fn store_trigger_locked(
        &self,
        trigger: &Trigger,
        replace_existing: bool,
    ) -> Result<(), JobStoreError> {
        let existing = self.store.find::<Trigger>(&trigger.document_id()).await?;
        if existing.is_some() && !replace_existing {
            return Err(JobStoreError::ObjectAlreadyExists(format!(
                "trigger {}",
                trigger.key
            )));
        }
        if self
            .store
            .find::<JobDetail>(&job_id(&trigger.job_key))
            .await?
            .is_none()
        {
            return Err(JobStoreError::NotFound(format!("job {}", trigger.job_key)));
        }
        let calendar = load_calendar(&self.store, trigger.calendar_name.as_deref()).await?;

        let mut stored = trigger.clone();
        stored.fire_instance_id = None;
        if stored.next_fire_time.is_none() {
            stored.next_fire_time = schedule::first_fire_time(&stored, calendar.as_ref())?;
            if stored.next_fire_time.is_none() {
                return Err(ValidationError::ConstraintViolation(format!(
                    "trigger {} will never fire",
                    stored.key
                ))
                .into());
            }
        }
        stored.state = self.initial_state(&stored).await?;

        match existing {
            Some(found) => self.store.replace(&stored, &found.token).await?,
            None => self.store.insert(&stored).await?,
        };
        info!(trigger = %stored.key, job = %stored.job_key, state = %stored.state, "Trigger stored");
        Ok(())
    }

    async fn pause_one(&self, id: &str) -> Result<(), JobStoreError> {
        self.store
            .update::<Trigger, _>(id, |t| match t.state {
                TriggerState::Waiting | TriggerState::Acquired | TriggerState::Blocked => {
                    t.state = TriggerState::Paused;
                    true
                }
                _ => false,
            })
            .await?;
        Ok(())
    }

    /// Return a paused trigger to service, applying its misfire instruction when it fell behind
    async fn resume_one(&self, id: &str, now: DateTime<Utc>) -> Result<(), JobStoreError> {
        let current = match self.store.find::<Trigger>(id).await? {
            Some(found) if found.entity.state == TriggerState::Paused => found.entity,
            _ => return Ok(()),
        };
        let blocked = job_executing_exclusively(&self.store, &current.job_key).await?;
        let calendar = load_calendar(&self.store, current.calendar_name.as_deref())
            .await
            .unwrap_or(None);
        let cutoff = now - self.engine.misfire_threshold();

        let mut misfired = None;
        self.store
            .update::<Trigger, _>(id, |t| {
                if t.state != TriggerState::Paused {
                    return false;
                }
                t.state = if blocked {
                    TriggerState::Blocked
                } else {
                    TriggerState::Waiting
                };
                misfired = None;
                if t.next_fire_time.map_or(false, |nft| nft < cutoff) {
                    misfired = Some(apply_misfire_instruction(t, calendar.as_ref(), now));
                }
                true
            })
            .await?;

        match misfired {
            Some(Ok(instruction)) => {
                telemetry::record_misfire(instruction.as_str());
                info!(trigger = %current.key, instruction = instruction.as_str(), "Applied misfire instruction on resume");
            }
            Some(Err(e)) => {
                telemetry::record_misfire("error");
                warn!(trigger = %current.key, error = %e, "Misfire handling failed on resume");
            }
            None => {}
        }
        Ok(())
    }

    async fn triggers_matching(&self, query: Query) -> Result<Vec<Trigger>, JobStoreError> {
        Ok(self
            .store
            .query::<Trigger>(query)
            .await?
            .into_iter()
            .map(|found| found.entity)
            .collect())
    }

    /// Resume paused triggers unless a remaining pause marker still covers them
    async fn resume_unless_covered(&self, query: Query) -> Result<(), JobStoreError> {
        let now = Utc::now();
        let paused = self
            .triggers_matching(query.eq("state", TriggerState::Paused.as_str()))
            .await?;
        for trigger in paused {
            if !is_paused(&self.store, &trigger.key.group, &trigger.job_key.group).await? {
                self.resume_one(&trigger.document_id(), now).await?;
            }
        }
        Ok(())
    }

    async fn clear<E: Entity>(&self) -> Result<usize, JobStoreError> {
        let all = self.store.query::<E>(Query::new()).await?;
        let mut removed = 0;
        for found in all {
            if self
                .store
                .remove_if_present::<E>(&found.entity.document_id())
                .await?
            {
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn group_names<E: Entity>(
        &self,
        group_of: impl Fn(&E) -> String + Send + Sync,
    ) -> Result<Vec<String>, JobStoreError> {
        let names: BTreeSet<String> = self
            .store
            .query::<E>(Query::new())
            .await?
            .iter()
            .map(|found| group_of(&found.entity))
            .collect();
        Ok(names.into_iter().collect())
    }
}

#[async_trait]
impl JobStore for DocumentJobStore {
    fn instance_id(&self) -> &str {
        &self.instance_id
    }

    fn is_clustered(&self) -> bool {
        self.clustered
    }

    #[instrument(skip(self), fields(instance_id = %self.instance_id))]
    async fn start(&self) -> Result<(), JobStoreError> {
        self.ensure_running()?;
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let now = Utc::now();
        retry_on_unavailable(&self.retry, "check_in", || self.coordinator.check_in(now)).await?;
        let recovered = retry_on_unavailable(&self.retry, "recover_on_startup", || {
            self.coordinator.recover_on_startup(now)
        })
        .await?;

        let task = Arc::clone(&self.coordinator).spawn(self.shutdown_tx.subscribe());
        *self.task_slot() = Some(task);

        info!(clustered = self.clustered, recovered, "Job store started");
        Ok(())
    }

    #[instrument(skip(self), fields(instance_id = %self.instance_id))]
    async fn shutdown(&self) -> Result<(), JobStoreError> {
        if self.shutdown_tx.send_replace(true) {
            return Ok(());
        }
        info!("Shutting down job store");

        let task = self.task_slot().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!(error = %e, "Cluster coordinator task ended abnormally");
            }
        }
        self.locks.release_all().await;
        if self.started.load(Ordering::SeqCst) {
            if let Err(e) = self.coordinator.remove_own_state().await {
                warn!(error = %e, "Failed to remove scheduler state record");
            }
        }

        info!("Job store shut down");
        Ok(())
    }

    #[instrument(skip(self, job), fields(job = %job.key))]
    async fn store_job(&self, job: JobDetail, replace_existing: bool) -> Result<(), JobStoreError> {
        validate_job(&job)?;
        self.locked("store_job", || self.store_job_locked(&job, replace_existing))
            .await
    }

    #[instrument(skip(self, job, trigger), fields(job = %job.key, trigger = %trigger.key))]
    async fn store_job_and_trigger(
        &self,
        job: JobDetail,
        trigger: Trigger,
    ) -> Result<(), JobStoreError> {
        validate_job(&job)?;
        validate_trigger(&trigger)?;
        if trigger.job_key != job.key {
            return Err(ValidationError::ConstraintViolation(format!(
                "trigger {} targets job {}, not {}",
                trigger.key, trigger.job_key, job.key
            ))
            .into());
        }

        self.locked("store_job_and_trigger", || async {
            if self
                .store
                .find::<Trigger>(&trigger.document_id())
                .await?
                .is_some()
            {
                return Err(JobStoreError::ObjectAlreadyExists(format!(
                    "trigger {}",
                    trigger.key
                )));
            }
            self.store_job_locked(&job, false).await?;
            if let Err(e) = self.store_trigger_locked(&trigger, false).await {
                // keep the pair all-or-nothing
                let _ = self.store.remove_if_present::<JobDetail>(&job.document_id()).await;
                return Err(e);
            }
            Ok(())
        })
        .await
    }

    async fn retrieve_job(&self, key: &JobKey) -> Result<Option<JobDetail>, JobStoreError> {
        self.read("retrieve_job", || async {
            Ok(self
                .store
                .find::<JobDetail>(&job_id(key))
                .await?
                .map(|found| found.entity))
        })
        .await
    }

    #[instrument(skip(self), fields(job = %key))]
    async fn remove_job(&self, key: &JobKey) -> Result<bool, JobStoreError> {
        self.locked("remove_job", || async {
            for trigger in self.triggers_matching(job_triggers_query(key)).await? {
                self.store
                    .remove_if_present::<Trigger>(&trigger.document_id())
                    .await?;
            }
            let removed = self.store.remove_if_present::<JobDetail>(&job_id(key)).await?;
            if removed {
                info!("Job removed");
            }
            Ok(removed)
        })
        .await
    }

    async fn check_job_exists(&self, key: &JobKey) -> Result<bool, JobStoreError> {
        Ok(self.retrieve_job(key).await?.is_some())
    }

    #[instrument(skip(self, trigger), fields(trigger = %trigger.key))]
    async fn store_trigger(
        &self,
        trigger: Trigger,
        replace_existing: bool,
    ) -> Result<(), JobStoreError> {
        validate_trigger(&trigger)?;
        self.locked("store_trigger", || {
            self.store_trigger_locked(&trigger, replace_existing)
        })
        .await
    }

    async fn retrieve_trigger(&self, key: &TriggerKey) -> Result<Option<Trigger>, JobStoreError> {
        self.read("retrieve_trigger", || async {
            Ok(self
                .store
                .find::<Trigger>(&trigger_id(key))
                .await?
                .map(|found| found.entity))
        })
        .await
    }

    #[instrument(skip(self), fields(trigger = %key))]
    async fn remove_trigger(&self, key: &TriggerKey) -> Result<bool, JobStoreError> {
        self.locked("remove_trigger", || async {
            match self.store.find::<Trigger>(&trigger_id(key)).await? {
                Some(found) => remove_trigger_cascade(&self.store, &found.entity).await,
                None => Ok(false),
            }
        })
        .await
    }

    #[instrument(skip(self, trigger), fields(old = %key, new = %trigger.key))]
    async fn replace_trigger(
        &self,
        key: &TriggerKey,
        trigger: Trigger,
    ) -> Result<bool, JobStoreError> {
        validate_trigger(&trigger)?;
        self.locked("replace_trigger", || async {
            let old = match self.store.find::<Trigger>(&trigger_id(key)).await? {
                Some(found) => found.entity,
                None => return Ok(false),
            };
            if old.job_key != trigger.job_key {
                return Err(ValidationError::ConstraintViolation(format!(
                    "replacement trigger {} must target job {}",
                    trigger.key, old.job_key
                ))
                .into());
            }
            if trigger.key == *key {
                self.store_trigger_locked(&trigger, true).await?;
            } else {
                self.store_trigger_locked(&trigger, false).await?;
                self.store.remove_if_present::<Trigger>(&old.document_id()).await?;
            }
            Ok(true)
        })
        .await
    }

    async fn check_trigger_exists(&self, key: &TriggerKey) -> Result<bool, JobStoreError> {
        Ok(self.retrieve_trigger(key).await?.is_some())
    }

    async fn get_triggers_for_job(&self, key: &JobKey) -> Result<Vec<Trigger>, JobStoreError> {
        self.read("get_triggers_for_job", || {
            self.triggers_matching(job_triggers_query(key))
        })
        .await
    }

    async fn get_trigger_state(
        &self,
        key: &TriggerKey,
    ) -> Result<Option<TriggerState>, JobStoreError> {
        Ok(self.retrieve_trigger(key).await?.map(|t| t.state))
    }

    #[instrument(skip(self, calendar), fields(calendar = %calendar.name))]
    async fn store_calendar(
        &self,
        calendar: Calendar,
        replace_existing: bool,
        update_triggers: bool,
    ) -> Result<(), JobStoreError> {
        if calendar.name.trim().is_empty() {
            return Err(ValidationError::MissingField("calendar name".to_string()).into());
        }
        calendar.validate()?;

        self.locked("store_calendar", || async {
            match self.store.find::<Calendar>(&calendar.name).await? {
                Some(_) if !replace_existing => {
                    return Err(JobStoreError::ObjectAlreadyExists(format!(
                        "calendar {}",
                        calendar.name
                    )))
                }
                Some(existing) => self.store.replace(&calendar, &existing.token).await?,
                None => self.store.insert(&calendar).await?,
            };

            if update_triggers {
                let affected = self
                    .triggers_matching(Query::new().eq("calendar_name", calendar.name.as_str()))
                    .await?;
                for trigger in affected {
                    self.store
                        .update::<Trigger, _>(&trigger.document_id(), |t| {
                            let nft = match t.next_fire_time {
                                Some(nft) if !calendar.is_time_included(nft) => nft,
                                _ => return false,
                            };
                            match schedule::next_fire_time_after(t, Some(&calendar), nft) {
                                Ok(next) => {
                                    t.next_fire_time = next;
                                    if next.is_none() && t.state == TriggerState::Waiting {
                                        t.state = TriggerState::Complete;
                                    }
                                    true
                                }
                                Err(_) => false,
                            }
                        })
                        .await?;
                }
            }
            Ok(())
        })
        .await
    }

    async fn retrieve_calendar(&self, name: &str) -> Result<Option<Calendar>, JobStoreError> {
        self.read("retrieve_calendar", || async {
            Ok(self
                .store
                .find::<Calendar>(name)
                .await?
                .map(|found| found.entity))
        })
        .await
    }

    #[instrument(skip(self))]
    async fn remove_calendar(&self, name: &str) -> Result<bool, JobStoreError> {
        self.locked("remove_calendar", || async {
            let users = self
                .triggers_matching(Query::new().eq("calendar_name", name).limit(1))
                .await?;
            if let Some(user) = users.first() {
                return Err(ValidationError::ConstraintViolation(format!(
                    "calendar {} is still referenced by trigger {}",
                    name, user.key
                ))
                .into());
            }
            self.store.remove_if_present::<Calendar>(name).await
        })
        .await
    }

    async fn get_job_keys(&self, group: Option<&str>) -> Result<Vec<JobKey>, JobStoreError> {
        self.read("get_job_keys", || async {
            let query = match group {
                Some(group) => Query::new().eq("key.group", group),
                None => Query::new(),
            };
            let mut keys: Vec<JobKey> = self
                .store
                .query::<JobDetail>(query)
                .await?
                .into_iter()
                .map(|found| found.entity.key)
                .collect();
            keys.sort();
            Ok(keys)
        })
        .await
    }

    async fn get_trigger_keys(
        &self,
        group: Option<&str>,
    ) -> Result<Vec<TriggerKey>, JobStoreError> {
        self.read("get_trigger_keys", || async {
            let query = match group {
                Some(group) => Query::new().eq("group", group),
                None => Query::new(),
            };
            let mut keys: Vec<TriggerKey> = self
                .triggers_matching(query)
                .await?
                .into_iter()
                .map(|t| t.key)
                .collect();
            keys.sort();
            Ok(keys)
        })
        .await
    }

    async fn get_job_group_names(&self) -> Result<Vec<String>, JobStoreError> {
        self.read("get_job_group_names", || {
            self.group_names(|job: &JobDetail| job.key.group.clone())
        })
        .await
    }

    async fn get_trigger_group_names(&self) -> Result<Vec<String>, JobStoreError> {
        self.read("get_trigger_group_names", || {
            self.group_names(|trigger: &Trigger| trigger.key.group.clone())
        })
        .await
    }

    async fn get_calendar_names(&self) -> Result<Vec<String>, JobStoreError> {
        self.read("get_calendar_names", || {
            self.group_names(|calendar: &Calendar| calendar.name.clone())
        })
        .await
    }

    async fn number_of_jobs(&self) -> Result<usize, JobStoreError> {
        Ok(self.get_job_keys(None).await?.len())
    }

    async fn number_of_triggers(&self) -> Result<usize, JobStoreError> {
        Ok(self.get_trigger_keys(None).await?.len())
    }

    async fn number_of_calendars(&self) -> Result<usize, JobStoreError> {
        Ok(self.get_calendar_names().await?.len())
    }

    #[instrument(skip(self), fields(trigger = %key))]
    async fn pause_trigger(&self, key: &TriggerKey) -> Result<(), JobStoreError> {
        self.locked("pause_trigger", || async {
            self.pause_one(&trigger_id(key)).await
        })
        .await
    }

    #[instrument(skip(self), fields(trigger = %key))]
    async fn resume_trigger(&self, key: &TriggerKey) -> Result<(), JobStoreError> {
        self.locked("resume_trigger", || async {
            self.resume_one(&trigger_id(key), Utc::now()).await
        })
        .await
    }

    #[instrument(skip(self))]
    async fn pause_trigger_group(&self, group: &str) -> Result<(), JobStoreError> {
        self.locked("pause_trigger_group", || async {
            self.store
                .put(&PausedTriggerGroup {
                    group: group.to_string(),
                })
                .await?;
            for trigger in self.triggers_matching(Query::new().eq("group", group)).await? {
                self.pause_one(&trigger.document_id()).await?;
            }
            info!("Trigger group paused");
            Ok(())
        })
        .await
    }

    #[instrument(skip(self))]
    async fn resume_trigger_group(&self, group: &str) -> Result<(), JobStoreError> {
        self.locked("resume_trigger_group", || async {
            self.store.remove_if_present::<PausedTriggerGroup>(group).await?;
            self.resume_unless_covered(Query::new().eq("group", group))
                .await?;
            info!("Trigger group resumed");
            Ok(())
        })
        .await
    }

    #[instrument(skip(self), fields(job = %key))]
    async fn pause_job(&self, key: &JobKey) -> Result<(), JobStoreError> {
        self.locked("pause_job", || async {
            for trigger in self.triggers_matching(job_triggers_query(key)).await? {
                self.pause_one(&trigger.document_id()).await?;
            }
            Ok(())
        })
        .await
    }

    #[instrument(skip(self), fields(job = %key))]
    async fn resume_job(&self, key: &JobKey) -> Result<(), JobStoreError> {
        self.locked("resume_job", || async {
            let now = Utc::now();
            for trigger in self.triggers_matching(job_triggers_query(key)).await? {
                self.resume_one(&trigger.document_id(), now).await?;
            }
            Ok(())
        })
        .await
    }

    #[instrument(skip(self))]
    async fn pause_job_group(&self, group: &str) -> Result<(), JobStoreError> {
        self.locked("pause_job_group", || async {
            self.store
                .put(&PausedJobGroup {
                    group: group.to_string(),
                })
                .await?;
            for trigger in self
                .triggers_matching(Query::new().eq("job_key.group", group))
                .await?
            {
                self.pause_one(&trigger.document_id()).await?;
            }
            info!("Job group paused");
            Ok(())
        })
        .await
    }

    #[instrument(skip(self))]
    async fn resume_job_group(&self, group: &str) -> Result<(), JobStoreError> {
        self.locked("resume_job_group", || async {
            self.store.remove_if_present::<PausedJobGroup>(group).await?;
            self.resume_unless_covered(Query::new().eq("job_key.group", group))
                .await?;
            info!("Job group resumed");
            Ok(())
        })
        .await
    }

    #[instrument(skip(self))]
    async fn pause_all(&self) -> Result<(), JobStoreError> {
        self.locked("pause_all", || async {
            self.store
                .put(&PausedTriggerGroup {
                    group: ALL_GROUPS_PAUSED.to_string(),
                })
                .await?;
            let triggers = self.triggers_matching(Query::new()).await?;
            let groups: BTreeSet<&str> = triggers.iter().map(|t| t.key.group.as_str()).collect();
            for group in groups {
                self.store
                    .put(&PausedTriggerGroup {
                        group: group.to_string(),
                    })
                    .await?;
            }
            for trigger in &triggers {
                self.pause_one(&trigger.document_id()).await?;
            }
            info!("All triggers paused");
            Ok(())
        })
        .await
    }

    #[instrument(skip(self))]
    async fn resume_all(&self) -> Result<(), JobStoreError> {
        self.locked("resume_all", || async {
            self.clear::<PausedTriggerGroup>().await?;
            self.clear::<PausedJobGroup>().await?;
            self.resume_unless_covered(Query::new()).await?;
            info!("All triggers resumed");
            Ok(())
        })
        .await
    }

    async fn get_paused_trigger_groups(&self) -> Result<Vec<String>, JobStoreError> {
        let groups = self
            .read("get_paused_trigger_groups", || {
                self.group_names(|marker: &PausedTriggerGroup| marker.group.clone())
            })
            .await?;
        Ok(groups
            .into_iter()
            .filter(|group| group != ALL_GROUPS_PAUSED)
            .collect())
    }

    async fn acquire_next_triggers(
        &self,
        now: DateTime<Utc>,
        window: Duration,
        max_count: usize,
    ) -> Result<Vec<Trigger>, JobStoreError> {
        self.ensure_running()?;
        retry_on_unavailable(&self.retry, "acquire_next_triggers", || {
            self.engine.acquire_next_triggers(now, window, max_count)
        })
        .await
    }

    async fn trigger_fired(&self, trigger: &Trigger) -> Result<CommitInstruction, JobStoreError> {
        self.ensure_running()?;
        retry_on_unavailable(&self.retry, "trigger_fired", || {
            self.engine.trigger_fired(trigger)
        })
        .await
    }

    async fn release_acquired_trigger(&self, trigger: &Trigger) -> Result<(), JobStoreError> {
        retry_on_unavailable(&self.retry, "release_acquired_trigger", || {
            self.engine.release_acquired_trigger(trigger)
        })
        .await
    }

    async fn triggered_job_complete(
        &self,
        trigger: &Trigger,
        job: &JobDetail,
        instruction: CompletedExecutionInstruction,
    ) -> Result<(), JobStoreError> {
        retry_on_unavailable(&self.retry, "triggered_job_complete", || {
            self.engine.triggered_job_complete(trigger, job, instruction)
        })
        .await
    }

    #[instrument(skip(self), fields(instance_id = %self.instance_id))]
    async fn clear_all_scheduling_data(&self) -> Result<(), JobStoreError> {
        self.locked("clear_all_scheduling_data", || async {
            let triggers = self.clear::<Trigger>().await?;
            let jobs = self.clear::<JobDetail>().await?;
            let calendars = self.clear::<Calendar>().await?;
            self.clear::<FiredTriggerRecord>().await?;
            self.clear::<PausedTriggerGroup>().await?;
            self.clear::<PausedJobGroup>().await?;
            warn!(jobs, triggers, calendars, "Cleared all scheduling data");
            Ok(())
        })
        .await
    }
}
