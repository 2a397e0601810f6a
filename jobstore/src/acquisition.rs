// Trigger acquisition, firing and misfire handling
//
// All state transitions here run under the trigger-access lock. Inside it,
// each document is still written with its concurrency token, so writers that
// bypass the lock (cluster recovery) can never be silently overwritten.

use crate::calendar::Calendar;
use crate::errors::JobStoreError;
use crate::lock::{LockManager, LOCK_TRIGGER_ACCESS};
use crate::models::{
    CommitInstruction, CompletedExecutionInstruction, FiredState, FiredTriggerRecord, JobDetail,
    JobKey, MisfireInstruction, PausedJobGroup, PausedTriggerGroup, Trigger, TriggerFiredBundle,
    TriggerState, ALL_GROUPS_PAUSED, RECOVERING_JOBS_GROUP,
};
use crate::repository::{job_id, Entity, EntityStore, FieldKind, Query, Versioned};
use crate::schedule;
use crate::telemetry;
use chrono::{DateTime, Duration, Utc};
use std::cmp::Ordering;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// Ordering in which due triggers are handed out: priority descending, then
/// next fire time ascending, then group and name ascending
pub fn acquisition_order(a: &Trigger, b: &Trigger) -> Ordering {
    b.priority
        .cmp(&a.priority)
        .then_with(|| match (a.next_fire_time, b.next_fire_time) {
            (Some(x), Some(y)) => x.cmp(&y),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        })
        .then_with(|| a.key.group.cmp(&b.key.group))
        .then_with(|| a.key.name.cmp(&b.key.name))
}

/// Waiting triggers due by `horizon`, in acquisition order
fn due_triggers_query(horizon: DateTime<Utc>) -> Query {
    Query::new()
        .eq("state", TriggerState::Waiting.as_str())
        .lte("next_fire_time", horizon.timestamp_millis())
        .order_desc("priority", FieldKind::Integer)
        .order_asc("next_fire_time", FieldKind::Integer)
        .order_asc("group", FieldKind::Text)
        .order_asc("name", FieldKind::Text)
}

/// Waiting triggers whose fire time is older than `cutoff`, oldest first
fn misfired_triggers_query(cutoff: DateTime<Utc>) -> Query {
    Query::new()
        .eq("state", TriggerState::Waiting.as_str())
        .lt("next_fire_time", cutoff.timestamp_millis())
        .order_asc("next_fire_time", FieldKind::Integer)
        .order_desc("priority", FieldKind::Integer)
}

pub(crate) fn job_triggers_query(job_key: &JobKey) -> Query {
    Query::new()
        .eq("job_key.group", job_key.group.as_str())
        .eq("job_key.name", job_key.name.as_str())
}

fn is_overdue(trigger: &Trigger, cutoff: DateTime<Utc>) -> bool {
    trigger.next_fire_time.map_or(false, |t| t < cutoff)
}

/// Apply the trigger's misfire instruction in place and report which one ran
///
/// An unknown instruction code or a schedule that can no longer be evaluated
/// moves the trigger to `Error` and is reported as an error; the trigger still
/// has to be written back.
pub fn apply_misfire_instruction(
    trigger: &mut Trigger,
    calendar: Option<&Calendar>,
    now: DateTime<Utc>,
) -> Result<MisfireInstruction, JobStoreError> {
    let instruction = match MisfireInstruction::from_code(trigger.misfire_instruction) {
        Some(instruction) => instruction,
        None => {
            trigger.state = TriggerState::Error;
            return Err(JobStoreError::MisfirePolicy {
                trigger: trigger.key.to_string(),
                code: trigger.misfire_instruction,
            });
        }
    };

    let next = match instruction {
        MisfireInstruction::MarkError => {
            trigger.state = TriggerState::Error;
            return Ok(instruction);
        }
        MisfireInstruction::FireNow => {
            Ok(Some(now).filter(|t| trigger.end_time.map_or(true, |end| *t <= end)))
        }
        MisfireInstruction::RescheduleNext => schedule::next_fire_time_after(trigger, calendar, now),
        MisfireInstruction::SkipOccurrence => {
            let missed = trigger.next_fire_time.unwrap_or(now);
            schedule::next_fire_time_after(trigger, calendar, missed)
        }
    };
    let next = match next {
        Ok(next) => next,
        Err(e) => {
            trigger.state = TriggerState::Error;
            return Err(e.into());
        }
    };

    trigger.next_fire_time = next;
    if next.is_none() {
        trigger.state = TriggerState::Complete;
    }
    Ok(instruction)
}

/// Load a calendar by name; `Ok(None)` when no calendar is named
pub(crate) async fn load_calendar(
    store: &EntityStore,
    name: Option<&str>,
) -> Result<Option<Calendar>, JobStoreError> {
    match name {
        None => Ok(None),
        Some(name) => match store.find::<Calendar>(name).await? {
            Some(found) => Ok(Some(found.entity)),
            None => Err(JobStoreError::NotFound(format!("calendar {}", name))),
        },
    }
}

/// Whether a trigger in `trigger_group` for a job in `job_group` is currently paused
pub(crate) async fn is_paused(
    store: &EntityStore,
    trigger_group: &str,
    job_group: &str,
) -> Result<bool, JobStoreError> {
    Ok(store
        .find::<PausedTriggerGroup>(ALL_GROUPS_PAUSED)
        .await?
        .is_some()
        || store
            .find::<PausedTriggerGroup>(trigger_group)
            .await?
            .is_some()
        || store.find::<PausedJobGroup>(job_group).await?.is_some())
}

/// Return the job's blocked triggers to `Waiting`, or `Paused` where their group is paused
pub(crate) async fn unblock_job_triggers(
    store: &EntityStore,
    job_key: &JobKey,
) -> Result<usize, JobStoreError> {
    let blocked = store
        .query::<Trigger>(job_triggers_query(job_key).eq("state", TriggerState::Blocked.as_str()))
        .await?;

    let mut unblocked = 0;
    for found in blocked {
        let paused = is_paused(store, &found.entity.key.group, &job_key.group).await?;
        let target = if paused {
            TriggerState::Paused
        } else {
            TriggerState::Waiting
        };
        let updated = store
            .update::<Trigger, _>(&found.entity.document_id(), |t| {
                if t.state != TriggerState::Blocked {
                    return false;
                }
                t.state = target;
                true
            })
            .await?;
        if updated.is_some() {
            unblocked += 1;
        }
    }
    Ok(unblocked)
}

/// Whether a non-concurrent execution of the job is running anywhere in the cluster
pub(crate) async fn job_executing_exclusively(
    store: &EntityStore,
    job_key: &JobKey,
) -> Result<bool, JobStoreError> {
    let running = store
        .query::<FiredTriggerRecord>(
            Query::new()
                .eq("job_key.group", job_key.group.as_str())
                .eq("job_key.name", job_key.name.as_str())
                .eq("state", FiredState::Executing.as_str())
                .eq("concurrent_execution_disallowed", true)
                .limit(1),
        )
        .await?;
    Ok(!running.is_empty())
}

/// Block the job's waiting and acquired triggers while one of its occurrences executes
///
/// An acquired trigger that gets blocked fails its fire-instance check when
/// its node calls `trigger_fired`, so it is skipped instead of executed.
pub(crate) async fn block_job_triggers(
    store: &EntityStore,
    job_key: &JobKey,
) -> Result<(), JobStoreError> {
    let blockable = |state: TriggerState| {
        matches!(state, TriggerState::Waiting | TriggerState::Acquired)
    };
    let candidates = store.query::<Trigger>(job_triggers_query(job_key)).await?;
    for found in candidates {
        if !blockable(found.entity.state) {
            continue;
        }
        let blocked = store
            .update::<Trigger, _>(&found.entity.document_id(), |t| {
                if !blockable(t.state) {
                    return false;
                }
                t.state = TriggerState::Blocked;
                true
            })
            .await?;
        if let Some(blocked) = blocked {
            debug!(trigger = %blocked.entity.key, "Blocked trigger of non-concurrent job");
        }
    }
    Ok(())
}

/// Delete a trigger, and its job as well when that job is not durable and has no triggers left
pub(crate) async fn remove_trigger_cascade(
    store: &EntityStore,
    trigger: &Trigger,
) -> Result<bool, JobStoreError> {
    if !store
        .remove_if_present::<Trigger>(&trigger.document_id())
        .await?
    {
        return Ok(false);
    }

    let job_doc_id = job_id(&trigger.job_key);
    if let Some(job) = store.find::<JobDetail>(&job_doc_id).await? {
        if !job.entity.durable {
            let remaining = store
                .query::<Trigger>(job_triggers_query(&trigger.job_key).limit(1))
                .await?;
            if remaining.is_empty() {
                debug!(job = %trigger.job_key, "Removing non-durable job without triggers");
                store.remove_if_present::<JobDetail>(&job_doc_id).await?;
            }
        }
    }
    Ok(true)
}

/// Selects, reserves, fires and releases triggers for one node
pub struct TriggerAcquisitionEngine {
    store: EntityStore,
    locks: Arc<LockManager>,
    instance_id: String,
    misfire_threshold: Duration,
}

impl TriggerAcquisitionEngine {
    pub fn new(
        store: EntityStore,
        locks: Arc<LockManager>,
        instance_id: impl Into<String>,
        misfire_threshold: std::time::Duration,
    ) -> Self {
        Self {
            store,
            locks,
            instance_id: instance_id.into(),
            misfire_threshold: Duration::from_std(misfire_threshold)
                .unwrap_or_else(|_| Duration::milliseconds(i64::MAX / 1_000)),
        }
    }

    pub fn misfire_threshold(&self) -> Duration {
        self.misfire_threshold
    }

    /// Reserve up to `max_count` triggers due by `now + window` for this node
    ///
    /// Overdue triggers have their misfire instruction applied instead and are
    /// never part of the result.
    #[instrument(skip(self), fields(instance_id = %self.instance_id))]
    pub async fn acquire_next_triggers(
        &self,
        now: DateTime<Utc>,
        window: std::time::Duration,
        max_count: usize,
    ) -> Result<Vec<Trigger>, JobStoreError> {
        if max_count == 0 {
            return Ok(Vec::new());
        }
        let window = Duration::from_std(window).unwrap_or_else(|_| Duration::zero());

        let acquired = self
            .locks
            .with_lock(LOCK_TRIGGER_ACCESS, || {
                self.acquire_locked(now, now + window, max_count)
            })
            .await?;

        if !acquired.is_empty() {
            telemetry::record_triggers_acquired(acquired.len());
            info!(count = acquired.len(), "Acquired triggers");
        }
        Ok(acquired)
    }

    async fn acquire_locked(
        &self,
        now: DateTime<Utc>,
        horizon: DateTime<Utc>,
        max_count: usize,
    ) -> Result<Vec<Trigger>, JobStoreError> {
        let cutoff = now - self.misfire_threshold;
        let mut acquired: Vec<Trigger> = Vec::new();
        // keys already looked at in this call, acquired or not
        let mut seen: HashSet<String> = HashSet::new();
        let mut non_concurrent_jobs: HashSet<JobKey> = HashSet::new();

        while acquired.len() < max_count {
            let limit = max_count - acquired.len() + seen.len();
            let candidates = self
                .store
                .query::<Trigger>(due_triggers_query(horizon).limit(limit))
                .await?;
            let exhausted = candidates.len() < limit;
            let mut progressed = false;

            for candidate in candidates {
                if acquired.len() >= max_count {
                    break;
                }
                if !seen.insert(candidate.entity.document_id()) {
                    continue;
                }
                progressed = true;

                if is_overdue(&candidate.entity, cutoff) {
                    self.misfire(candidate, now, cutoff).await?;
                    continue;
                }

                let job = match self
                    .store
                    .find::<JobDetail>(&job_id(&candidate.entity.job_key))
                    .await?
                {
                    Some(job) => job.entity,
                    None => {
                        warn!(trigger = %candidate.entity.key, job = %candidate.entity.job_key,
                            "Trigger references a missing job, moving it to error");
                        self.set_state(&candidate.entity, TriggerState::Error).await?;
                        continue;
                    }
                };
                if job.concurrent_execution_disallowed && !non_concurrent_jobs.insert(job.key.clone()) {
                    continue;
                }

                if let Some(trigger) = self.reserve(candidate, &job, now).await? {
                    acquired.push(trigger);
                }
            }

            if exhausted || !progressed {
                break;
            }
        }

        acquired.sort_by(acquisition_order);
        Ok(acquired)
    }

    /// Record this node's claim, then flip the trigger to `Acquired`
    async fn reserve(
        &self,
        candidate: Versioned<Trigger>,
        job: &JobDetail,
        now: DateTime<Utc>,
    ) -> Result<Option<Trigger>, JobStoreError> {
        let Versioned { entity, token } = candidate;
        let scheduled_at = match entity.next_fire_time {
            Some(t) => t,
            None => return Ok(None),
        };

        // the record goes first: a crash in between leaves an orphan record, never an orphan trigger
        let record = FiredTriggerRecord {
            fire_instance_id: Uuid::new_v4().to_string(),
            trigger_key: entity.key.clone(),
            job_key: entity.job_key.clone(),
            instance_id: self.instance_id.clone(),
            fired_at: now,
            scheduled_at,
            priority: entity.priority,
            state: FiredState::Acquired,
            concurrent_execution_disallowed: job.concurrent_execution_disallowed,
        };
        self.store.insert(&record).await?;

        let mut trigger = entity;
        trigger.state = TriggerState::Acquired;
        trigger.fire_instance_id = Some(record.fire_instance_id.clone());

        match self.store.replace(&trigger, &token).await {
            Ok(_) => {
                debug!(trigger = %trigger.key, fire_instance_id = %record.fire_instance_id, "Trigger acquired");
                Ok(Some(trigger))
            }
            Err(JobStoreError::ConcurrencyConflict(_)) | Err(JobStoreError::NotFound(_)) => {
                debug!(trigger = %trigger.key, "Trigger changed before it could be acquired");
                self.store
                    .remove_if_present::<FiredTriggerRecord>(&record.fire_instance_id)
                    .await?;
                Ok(None)
            }
            Err(e) => {
                if let Err(cleanup) = self
                    .store
                    .remove_if_present::<FiredTriggerRecord>(&record.fire_instance_id)
                    .await
                {
                    warn!(
                        trigger = %trigger.key,
                        fire_instance_id = %record.fire_instance_id,
                        error = %cleanup,
                        "Failed to drop fired record of an unfinished acquisition"
                    );
                }
                Err(e)
            }
        }
    }

    async fn set_state(&self, trigger: &Trigger, state: TriggerState) -> Result<(), JobStoreError> {
        self.store
            .update::<Trigger, _>(&trigger.document_id(), |t| {
                t.state = state;
                true
            })
            .await?;
        Ok(())
    }

    /// Apply the misfire instruction of one overdue trigger; policy failures are logged, not raised
    async fn misfire(
        &self,
        candidate: Versioned<Trigger>,
        now: DateTime<Utc>,
        cutoff: DateTime<Utc>,
    ) -> Result<(), JobStoreError> {
        let key = candidate.entity.key.clone();
        let calendar = match load_calendar(&self.store, candidate.entity.calendar_name.as_deref()).await {
            Ok(calendar) => calendar,
            Err(JobStoreError::NotFound(what)) => {
                warn!(trigger = %key, missing = %what, "Calendar vanished, applying misfire without it");
                None
            }
            Err(e) => return Err(e),
        };

        let mut outcome: Option<Result<MisfireInstruction, JobStoreError>> = None;
        self.store
            .update::<Trigger, _>(&candidate.entity.document_id(), |t| {
                if t.state != TriggerState::Waiting || !is_overdue(t, cutoff) {
                    outcome = None;
                    return false;
                }
                outcome = Some(apply_misfire_instruction(t, calendar.as_ref(), now));
                true
            })
            .await?;

        match outcome {
            Some(Ok(instruction)) => {
                telemetry::record_misfire(instruction.as_str());
                info!(trigger = %key, instruction = instruction.as_str(), "Applied misfire instruction");
            }
            Some(Err(e)) => {
                telemetry::record_misfire("error");
                warn!(trigger = %key, error = %e, "Misfire handling failed, trigger moved to error");
            }
            None => debug!(trigger = %key, "Trigger no longer misfired"),
        }
        Ok(())
    }

    /// Apply misfire instructions to up to `max` overdue waiting triggers
    #[instrument(skip(self), fields(instance_id = %self.instance_id))]
    pub async fn handle_misfires(
        &self,
        now: DateTime<Utc>,
        max: usize,
    ) -> Result<usize, JobStoreError> {
        let cutoff = now - self.misfire_threshold;
        // cheap check first so an idle cluster never contends for the lock
        let pending = self
            .store
            .query::<Trigger>(misfired_triggers_query(cutoff).limit(1))
            .await?;
        if pending.is_empty() || max == 0 {
            return Ok(0);
        }

        self.locks
            .with_lock(LOCK_TRIGGER_ACCESS, || async {
                let overdue = self
                    .store
                    .query::<Trigger>(misfired_triggers_query(cutoff).limit(max))
                    .await?;
                let count = overdue.len();
                for candidate in overdue {
                    self.misfire(candidate, now, cutoff).await?;
                }
                Ok(count)
            })
            .await
    }

    /// Move an acquired trigger into execution and schedule its next occurrence
    #[instrument(skip(self, trigger), fields(trigger = %trigger.key, instance_id = %self.instance_id))]
    pub async fn trigger_fired(&self, trigger: &Trigger) -> Result<CommitInstruction, JobStoreError> {
        self.locks
            .with_lock(LOCK_TRIGGER_ACCESS, || self.fire_locked(trigger))
            .await
    }

    async fn fire_locked(&self, trigger: &Trigger) -> Result<CommitInstruction, JobStoreError> {
        let now = Utc::now();
        let skip = |reason: &str| -> Result<CommitInstruction, JobStoreError> {
            debug!(trigger = %trigger.key, reason, "Skipping fired trigger");
            Ok(CommitInstruction::Skip {
                reason: reason.to_string(),
            })
        };

        let current = match self.store.find::<Trigger>(&trigger.document_id()).await? {
            Some(current) => current,
            None => {
                if let Some(ours) = &trigger.fire_instance_id {
                    self.store
                        .remove_if_present::<FiredTriggerRecord>(ours)
                        .await?;
                }
                return skip("trigger no longer exists");
            }
        };
        let fire_instance_id = match (&trigger.fire_instance_id, &current.entity.fire_instance_id) {
            (Some(ours), Some(stored))
                if ours == stored && current.entity.state == TriggerState::Acquired =>
            {
                ours.clone()
            }
            _ => {
                // drop our claim unless an execution is already running under it
                if let Some(ours) = &trigger.fire_instance_id {
                    if let Some(record) = self.store.find::<FiredTriggerRecord>(ours).await? {
                        if record.entity.state == FiredState::Acquired {
                            match self
                                .store
                                .remove::<FiredTriggerRecord>(ours, &record.token)
                                .await
                            {
                                Ok(())
                                | Err(JobStoreError::NotFound(_))
                                | Err(JobStoreError::ConcurrencyConflict(_)) => {}
                                Err(e) => return Err(e),
                            }
                        }
                    }
                }
                return skip("trigger is no longer acquired by this fire instance");
            }
        };
        let scheduled = match current.entity.next_fire_time {
            Some(t) => t,
            None => return skip("trigger has no fire time"),
        };

        let job = match self
            .store
            .find::<JobDetail>(&job_id(&current.entity.job_key))
            .await?
        {
            Some(job) => job.entity,
            None => {
                self.store
                    .remove_if_present::<FiredTriggerRecord>(&fire_instance_id)
                    .await?;
                self.set_state(&current.entity, TriggerState::Error).await?;
                return skip("job no longer exists");
            }
        };
        let calendar = match load_calendar(&self.store, current.entity.calendar_name.as_deref()).await {
            Ok(calendar) => calendar,
            Err(JobStoreError::NotFound(_)) => {
                self.store
                    .remove_if_present::<FiredTriggerRecord>(&fire_instance_id)
                    .await?;
                self.set_state(&current.entity, TriggerState::Error).await?;
                return skip("calendar no longer exists");
            }
            Err(e) => return Err(e),
        };

        if job.concurrent_execution_disallowed
            && job_executing_exclusively(&self.store, &job.key).await?
        {
            self.store
                .remove_if_present::<FiredTriggerRecord>(&fire_instance_id)
                .await?;
            let mut blocked = current.entity.clone();
            blocked.state = TriggerState::Blocked;
            self.store.replace(&blocked, &current.token).await?;
            return skip("job is already executing and disallows concurrent execution");
        }

        let executing = self
            .store
            .update::<FiredTriggerRecord, _>(&fire_instance_id, |r| {
                r.state = FiredState::Executing;
                r.fired_at = now;
                true
            })
            .await?;
        if executing.is_none() {
            return skip("fired record was reclaimed");
        }

        let previous_fire_time = current.entity.previous_fire_time;
        let mut fired = current.entity.clone();
        fired.previous_fire_time = Some(scheduled);
        fired.next_fire_time = schedule::next_fire_time_after(&fired, calendar.as_ref(), scheduled)?;
        fired.times_triggered = fired.times_triggered.saturating_add(1);
        fired.state = if fired.next_fire_time.is_none() {
            TriggerState::Complete
        } else if job.concurrent_execution_disallowed {
            TriggerState::Blocked
        } else {
            TriggerState::Waiting
        };
        self.store.replace(&fired, &current.token).await?;

        if job.concurrent_execution_disallowed {
            block_job_triggers(&self.store, &job.key).await?;
        }

        info!(
            trigger = %fired.key,
            job = %job.key,
            fire_instance_id = %fire_instance_id,
            next_fire_time = ?fired.next_fire_time,
            "Trigger fired"
        );

        Ok(CommitInstruction::Execute(Box::new(TriggerFiredBundle {
            recovering: fired.key.group == RECOVERING_JOBS_GROUP,
            next_fire_time: fired.next_fire_time,
            job,
            trigger: fired,
            calendar,
            fire_instance_id,
            fire_time: now,
            scheduled_fire_time: scheduled,
            previous_fire_time,
        })))
    }

    /// Hand an acquired trigger back without firing it
    #[instrument(skip(self, trigger), fields(trigger = %trigger.key, instance_id = %self.instance_id))]
    pub async fn release_acquired_trigger(&self, trigger: &Trigger) -> Result<(), JobStoreError> {
        self.locks
            .with_lock(LOCK_TRIGGER_ACCESS, || async {
                self.store
                    .update::<Trigger, _>(&trigger.document_id(), |t| {
                        if t.state != TriggerState::Acquired
                            || t.fire_instance_id != trigger.fire_instance_id
                        {
                            return false;
                        }
                        t.state = TriggerState::Waiting;
                        true
                    })
                    .await?;
                if let Some(fire_instance_id) = &trigger.fire_instance_id {
                    self.store
                        .remove_if_present::<FiredTriggerRecord>(fire_instance_id)
                        .await?;
                }
                debug!("Released acquired trigger");
                Ok(())
            })
            .await
    }

    /// Record the end of an execution started by `trigger_fired`
    #[instrument(skip(self, trigger, job), fields(trigger = %trigger.key, job = %job.key))]
    pub async fn triggered_job_complete(
        &self,
        trigger: &Trigger,
        job: &JobDetail,
        instruction: CompletedExecutionInstruction,
    ) -> Result<(), JobStoreError> {
        self.locks
            .with_lock(LOCK_TRIGGER_ACCESS, || self.complete_locked(trigger, job, instruction))
            .await
    }

    async fn complete_locked(
        &self,
        trigger: &Trigger,
        job: &JobDetail,
        instruction: CompletedExecutionInstruction,
    ) -> Result<(), JobStoreError> {
        if job.persist_job_data_after_execution {
            self.store
                .update::<JobDetail, _>(&job.document_id(), |stored| {
                    stored.job_data = job.job_data.clone();
                    true
                })
                .await?;
        }
        if job.concurrent_execution_disallowed {
            unblock_job_triggers(&self.store, &job.key).await?;
        }

        match instruction {
            CompletedExecutionInstruction::Noop | CompletedExecutionInstruction::ReExecuteJob => {}
            CompletedExecutionInstruction::SetTriggerComplete => {
                self.set_state(trigger, TriggerState::Complete).await?;
            }
            CompletedExecutionInstruction::SetTriggerError => {
                self.set_state(trigger, TriggerState::Error).await?;
            }
            CompletedExecutionInstruction::DeleteTrigger => {
                // a trigger rescheduled while its job ran keeps living
                if let Some(stored) = self.store.find::<Trigger>(&trigger.document_id()).await? {
                    if stored.entity.next_fire_time.is_none() {
                        remove_trigger_cascade(&self.store, &stored.entity).await?;
                    }
                }
            }
            CompletedExecutionInstruction::SetAllJobTriggersComplete
            | CompletedExecutionInstruction::SetAllJobTriggersError => {
                let state = if instruction == CompletedExecutionInstruction::SetAllJobTriggersComplete {
                    TriggerState::Complete
                } else {
                    TriggerState::Error
                };
                for found in self
                    .store
                    .query::<Trigger>(job_triggers_query(&job.key))
                    .await?
                {
                    self.set_state(&found.entity, state).await?;
                }
            }
        }

        if let Some(fire_instance_id) = &trigger.fire_instance_id {
            self.store
                .remove_if_present::<FiredTriggerRecord>(fire_instance_id)
                .await?;
        }
        debug!(instruction = ?instruction, "Job execution completed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetryConfig;
    use crate::models::{misfire, Schedule, TriggerKey};
    use crate::repository::{Collection, InMemoryDocumentStore};
    use crate::serialization::DocumentSerializer;
    use chrono::TimeZone;
    use proptest::prelude::*;
    use tokio::sync::watch;

    const P: &str = "QUARTZ_TEST";

    struct Fixture {
        repo: InMemoryDocumentStore,
        store: EntityStore,
        engine: TriggerAcquisitionEngine,
        _shutdown: watch::Sender<bool>,
    }

    fn fixture() -> Fixture {
        let repo = InMemoryDocumentStore::new();
        let store = EntityStore::new(Arc::new(repo.clone()), P, DocumentSerializer::default());
        let (tx, rx) = watch::channel(false);
        let locks = Arc::new(LockManager::new(
            store.clone(),
            "node-a",
            std::time::Duration::from_secs(5),
            &RetryConfig::default(),
            rx,
        ));
        let engine = TriggerAcquisitionEngine::new(
            store.clone(),
            locks,
            "node-a",
            std::time::Duration::from_secs(60),
        );
        Fixture {
            repo,
            store,
            engine,
            _shutdown: tx,
        }
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 3, 9, 0, 0).unwrap()
    }

    async fn store_job(store: &EntityStore, name: &str) -> JobDetail {
        let job = JobDetail::new(JobKey::in_default_group(name), "TestJob");
        store.insert(&job).await.unwrap();
        job
    }

    async fn store_trigger(
        store: &EntityStore,
        name: &str,
        job: &JobKey,
        priority: i32,
        next_fire_time: DateTime<Utc>,
    ) -> Trigger {
        let trigger = Trigger::new(
            TriggerKey::in_default_group(name),
            job.clone(),
            Schedule::every(Duration::minutes(1)),
        )
        .starting_at(next_fire_time - Duration::hours(1))
        .with_priority(priority)
        .with_next_fire_time(next_fire_time);
        store.insert(&trigger).await.unwrap();
        trigger
    }

    async fn stored(store: &EntityStore, trigger: &Trigger) -> Trigger {
        store
            .find::<Trigger>(&trigger.document_id())
            .await
            .unwrap()
            .unwrap()
            .entity
    }

    #[tokio::test]
    async fn test_priority_wins_over_earlier_fire_time() {
        let f = fixture();
        let job = store_job(&f.store, "j").await;
        store_trigger(&f.store, "t1", &job.key, 10, t0()).await;
        store_trigger(&f.store, "t2", &job.key, 5, t0() - Duration::seconds(1)).await;

        let acquired = f
            .engine
            .acquire_next_triggers(t0(), std::time::Duration::ZERO, 1)
            .await
            .unwrap();
        assert_eq!(acquired.len(), 1);
        assert_eq!(acquired[0].key.name, "t1");
        assert_eq!(acquired[0].state, TriggerState::Acquired);
        assert_eq!(f.repo.count(P, Collection::FiredTriggers), 1);
    }

    #[tokio::test]
    async fn test_misfired_trigger_is_rescheduled_not_acquired() {
        let f = fixture();
        let job = store_job(&f.store, "j").await;
        let t = store_trigger(&f.store, "t", &job.key, 5, t0()).await;
        let now = t0() + Duration::seconds(120);

        let acquired = f
            .engine
            .acquire_next_triggers(now, std::time::Duration::ZERO, 10)
            .await
            .unwrap();
        assert!(acquired.is_empty());

        let after = stored(&f.store, &t).await;
        assert_eq!(after.state, TriggerState::Waiting);
        assert!(after.next_fire_time.unwrap() >= now);
        assert_eq!(f.repo.count(P, Collection::FiredTriggers), 0);

        // no longer overdue, so the next call acquires it normally
        let acquired = f
            .engine
            .acquire_next_triggers(now, std::time::Duration::ZERO, 10)
            .await
            .unwrap();
        assert_eq!(acquired.len(), 1);
    }

    #[tokio::test]
    async fn test_misfire_does_not_starve_the_batch() {
        let f = fixture();
        let job = store_job(&f.store, "j").await;
        let now = t0() + Duration::minutes(10);
        // highest priority trigger is overdue; the rest are due
        store_trigger(&f.store, "late", &job.key, 100, t0()).await;
        for name in ["a", "b"] {
            store_trigger(&f.store, name, &job.key, 5, now).await;
        }
        let acquired = f
            .engine
            .acquire_next_triggers(now, std::time::Duration::ZERO, 2)
            .await
            .unwrap();
        let names: Vec<_> = acquired.iter().map(|t| t.key.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_unknown_misfire_code_moves_only_that_trigger_to_error() {
        let f = fixture();
        let job = store_job(&f.store, "j").await;
        let now = t0() + Duration::minutes(10);
        let bad = Trigger::new(
            TriggerKey::in_default_group("bad"),
            job.key.clone(),
            Schedule::once(),
        )
        .starting_at(t0())
        .with_next_fire_time(t0())
        .with_misfire_instruction(99);
        f.store.insert(&bad).await.unwrap();
        store_trigger(&f.store, "ok", &job.key, 5, now).await;

        let acquired = f
            .engine
            .acquire_next_triggers(now, std::time::Duration::ZERO, 5)
            .await
            .unwrap();
        assert_eq!(acquired.len(), 1);
        assert_eq!(acquired[0].key.name, "ok");
        assert_eq!(stored(&f.store, &bad).await.state, TriggerState::Error);
    }

    #[test]
    fn test_misfire_instructions() {
        let now = t0() + Duration::seconds(150);
        let base = Trigger::new(
            TriggerKey::in_default_group("t"),
            JobKey::in_default_group("j"),
            Schedule::every(Duration::minutes(1)),
        )
        .starting_at(t0())
        .with_next_fire_time(t0());

        let mut t = base.clone().with_misfire_instruction(misfire::FIRE_NOW);
        apply_misfire_instruction(&mut t, None, now).unwrap();
        assert_eq!(t.next_fire_time, Some(now));

        let mut t = base.clone().with_misfire_instruction(misfire::RESCHEDULE_NEXT);
        apply_misfire_instruction(&mut t, None, now).unwrap();
        assert_eq!(t.next_fire_time, Some(t0() + Duration::minutes(3)));

        let mut t = base.clone().with_misfire_instruction(misfire::SKIP_OCCURRENCE);
        apply_misfire_instruction(&mut t, None, now).unwrap();
        assert_eq!(t.next_fire_time, Some(t0() + Duration::minutes(1)));

        let mut t = base.clone().with_misfire_instruction(misfire::MARK_ERROR);
        apply_misfire_instruction(&mut t, None, now).unwrap();
        assert_eq!(t.state, TriggerState::Error);

        let mut t = base.with_misfire_instruction(7);
        assert!(matches!(
            apply_misfire_instruction(&mut t, None, now),
            Err(JobStoreError::MisfirePolicy { code: 7, .. })
        ));
        assert_eq!(t.state, TriggerState::Error);
    }

    #[test]
    fn test_one_shot_rescheduled_past_its_end_completes() {
        let mut t = Trigger::new(
            TriggerKey::in_default_group("t"),
            JobKey::in_default_group("j"),
            Schedule::once(),
        )
        .starting_at(t0())
        .with_next_fire_time(t0())
        .with_misfire_instruction(misfire::RESCHEDULE_NEXT);
        apply_misfire_instruction(&mut t, None, t0() + Duration::minutes(5)).unwrap();
        assert_eq!(t.state, TriggerState::Complete);
        assert_eq!(t.next_fire_time, None);
    }

    #[tokio::test]
    async fn test_fire_and_complete_cycle() {
        let f = fixture();
        let job = store_job(&f.store, "j").await;
        let t = store_trigger(&f.store, "t", &job.key, 5, t0()).await;

        let acquired = f
            .engine
            .acquire_next_triggers(t0(), std::time::Duration::ZERO, 1)
            .await
            .unwrap();
        let bundle = match f.engine.trigger_fired(&acquired[0]).await.unwrap() {
            CommitInstruction::Execute(bundle) => bundle,
            other => panic!("expected execute, got {:?}", other),
        };
        assert_eq!(bundle.scheduled_fire_time, t0());
        assert_eq!(bundle.next_fire_time, Some(t0() + Duration::minutes(1)));
        assert!(!bundle.recovering);

        let after = stored(&f.store, &t).await;
        assert_eq!(after.state, TriggerState::Waiting);
        assert_eq!(after.times_triggered, 1);
        assert_eq!(after.previous_fire_time, Some(t0()));

        let record = f
            .store
            .find::<FiredTriggerRecord>(&bundle.fire_instance_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.entity.state, FiredState::Executing);

        f.engine
            .triggered_job_complete(&bundle.trigger, &bundle.job, bundle.default_completion())
            .await
            .unwrap();
        assert_eq!(f.repo.count(P, Collection::FiredTriggers), 0);
    }

    #[tokio::test]
    async fn test_second_fire_of_same_acquisition_is_skipped() {
        let f = fixture();
        let job = store_job(&f.store, "j").await;
        store_trigger(&f.store, "t", &job.key, 5, t0()).await;
        let acquired = f
            .engine
            .acquire_next_triggers(t0(), std::time::Duration::ZERO, 1)
            .await
            .unwrap();
        assert!(matches!(
            f.engine.trigger_fired(&acquired[0]).await.unwrap(),
            CommitInstruction::Execute(_)
        ));
        assert!(matches!(
            f.engine.trigger_fired(&acquired[0]).await.unwrap(),
            CommitInstruction::Skip { .. }
        ));
    }

    #[tokio::test]
    async fn test_release_acquired_trigger() {
        let f = fixture();
        let job = store_job(&f.store, "j").await;
        let t = store_trigger(&f.store, "t", &job.key, 5, t0()).await;
        let acquired = f
            .engine
            .acquire_next_triggers(t0(), std::time::Duration::ZERO, 1)
            .await
            .unwrap();
        f.engine.release_acquired_trigger(&acquired[0]).await.unwrap();

        assert_eq!(stored(&f.store, &t).await.state, TriggerState::Waiting);
        assert_eq!(f.repo.count(P, Collection::FiredTriggers), 0);
    }

    #[tokio::test]
    async fn test_non_concurrent_job_blocks_its_other_triggers() {
        let f = fixture();
        let job = JobDetail::new(JobKey::in_default_group("serial"), "TestJob")
            .disallow_concurrent_execution();
        f.store.insert(&job).await.unwrap();
        let t1 = store_trigger(&f.store, "t1", &job.key, 5, t0()).await;
        let t2 = store_trigger(&f.store, "t2", &job.key, 5, t0()).await;

        let acquired = f
            .engine
            .acquire_next_triggers(t0(), std::time::Duration::ZERO, 5)
            .await
            .unwrap();
        assert_eq!(acquired.len(), 1, "one trigger per non-concurrent job per batch");

        let bundle = match f.engine.trigger_fired(&acquired[0]).await.unwrap() {
            CommitInstruction::Execute(bundle) => bundle,
            other => panic!("expected execute, got {:?}", other),
        };
        assert_eq!(stored(&f.store, &t1).await.state, TriggerState::Blocked);
        assert_eq!(stored(&f.store, &t2).await.state, TriggerState::Blocked);
        assert!(f
            .engine
            .acquire_next_triggers(t0(), std::time::Duration::ZERO, 5)
            .await
            .unwrap()
            .is_empty());

        f.engine
            .triggered_job_complete(&bundle.trigger, &bundle.job, CompletedExecutionInstruction::Noop)
            .await
            .unwrap();
        assert_eq!(stored(&f.store, &t1).await.state, TriggerState::Waiting);
        assert_eq!(stored(&f.store, &t2).await.state, TriggerState::Waiting);
    }

    #[tokio::test]
    async fn test_sibling_acquired_in_earlier_batch_is_skipped() {
        let f = fixture();
        let job = JobDetail::new(JobKey::in_default_group("serial"), "TestJob")
            .disallow_concurrent_execution();
        f.store.insert(&job).await.unwrap();
        store_trigger(&f.store, "t1", &job.key, 5, t0()).await;
        let t2 = store_trigger(&f.store, "t2", &job.key, 5, t0()).await;

        let first = f
            .engine
            .acquire_next_triggers(t0(), std::time::Duration::ZERO, 1)
            .await
            .unwrap();
        let second = f
            .engine
            .acquire_next_triggers(t0(), std::time::Duration::ZERO, 1)
            .await
            .unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].key, t2.key);

        let bundle = match f.engine.trigger_fired(&first[0]).await.unwrap() {
            CommitInstruction::Execute(bundle) => bundle,
            other => panic!("expected execute, got {:?}", other),
        };
        assert_eq!(stored(&f.store, &second[0]).await.state, TriggerState::Blocked);
        assert!(matches!(
            f.engine.trigger_fired(&second[0]).await.unwrap(),
            CommitInstruction::Skip { .. }
        ));
        // only the running execution keeps a fired record
        assert_eq!(f.repo.count(P, Collection::FiredTriggers), 1);

        f.engine
            .triggered_job_complete(&bundle.trigger, &bundle.job, CompletedExecutionInstruction::Noop)
            .await
            .unwrap();
        assert_eq!(stored(&f.store, &t2).await.state, TriggerState::Waiting);
    }

    #[tokio::test]
    async fn test_fire_is_skipped_while_job_executes_on_another_node() {
        let f = fixture();
        let job = JobDetail::new(JobKey::in_default_group("serial"), "TestJob")
            .disallow_concurrent_execution();
        f.store.insert(&job).await.unwrap();
        let t = store_trigger(&f.store, "t", &job.key, 5, t0()).await;

        let acquired = f
            .engine
            .acquire_next_triggers(t0(), std::time::Duration::ZERO, 1)
            .await
            .unwrap();
        assert_eq!(acquired.len(), 1);

        // an execution another node started without having blocked this trigger
        f.store
            .insert(&FiredTriggerRecord {
                fire_instance_id: "elsewhere".to_string(),
                trigger_key: TriggerKey::in_default_group("other"),
                job_key: job.key.clone(),
                instance_id: "node-b".to_string(),
                fired_at: t0(),
                scheduled_at: t0(),
                priority: 5,
                state: FiredState::Executing,
                concurrent_execution_disallowed: true,
            })
            .await
            .unwrap();

        assert!(matches!(
            f.engine.trigger_fired(&acquired[0]).await.unwrap(),
            CommitInstruction::Skip { .. }
        ));
        let after = stored(&f.store, &t).await;
        assert_eq!(after.state, TriggerState::Blocked);
        assert_eq!(after.next_fire_time, Some(t0()));
        assert_eq!(f.repo.count(P, Collection::FiredTriggers), 1);
    }

    #[tokio::test]
    async fn test_stale_fire_drops_its_own_fired_record() {
        let f = fixture();
        let job = store_job(&f.store, "j").await;
        store_trigger(&f.store, "t", &job.key, 5, t0()).await;
        let acquired = f
            .engine
            .acquire_next_triggers(t0(), std::time::Duration::ZERO, 1)
            .await
            .unwrap();
        assert_eq!(f.repo.count(P, Collection::FiredTriggers), 1);

        // the trigger was handed back and re-acquired under a new fire instance
        f.engine.release_acquired_trigger(&acquired[0]).await.unwrap();
        let again = f
            .engine
            .acquire_next_triggers(t0(), std::time::Duration::ZERO, 1)
            .await
            .unwrap();
        assert!(matches!(
            f.engine.trigger_fired(&acquired[0]).await.unwrap(),
            CommitInstruction::Skip { .. }
        ));
        assert_eq!(f.repo.count(P, Collection::FiredTriggers), 1);
        assert!(matches!(
            f.engine.trigger_fired(&again[0]).await.unwrap(),
            CommitInstruction::Execute(_)
        ));
    }

    #[tokio::test]
    async fn test_persisted_job_data_after_execution() {
        let f = fixture();
        let job = JobDetail::new(JobKey::in_default_group("counter"), "TestJob")
            .persist_job_data_after_execution();
        f.store.insert(&job).await.unwrap();
        store_trigger(&f.store, "t", &job.key, 5, t0()).await;

        let acquired = f
            .engine
            .acquire_next_triggers(t0(), std::time::Duration::ZERO, 1)
            .await
            .unwrap();
        let bundle = match f.engine.trigger_fired(&acquired[0]).await.unwrap() {
            CommitInstruction::Execute(bundle) => bundle,
            other => panic!("expected execute, got {:?}", other),
        };
        let mut ran = bundle.job.clone();
        ran.job_data.insert("runs", 1i64);
        f.engine
            .triggered_job_complete(&bundle.trigger, &ran, CompletedExecutionInstruction::Noop)
            .await
            .unwrap();

        let saved = f
            .store
            .find::<JobDetail>(&job.document_id())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(saved.entity.job_data, ran.job_data);
    }

    #[tokio::test]
    async fn test_delete_trigger_removes_non_durable_job() {
        let f = fixture();
        let job = store_job(&f.store, "once").await;
        let t = Trigger::new(
            TriggerKey::in_default_group("t"),
            job.key.clone(),
            Schedule::once(),
        )
        .starting_at(t0())
        .with_next_fire_time(t0());
        f.store.insert(&t).await.unwrap();

        let acquired = f
            .engine
            .acquire_next_triggers(t0(), std::time::Duration::ZERO, 1)
            .await
            .unwrap();
        let bundle = match f.engine.trigger_fired(&acquired[0]).await.unwrap() {
            CommitInstruction::Execute(bundle) => bundle,
            other => panic!("expected execute, got {:?}", other),
        };
        assert_eq!(bundle.default_completion(), CompletedExecutionInstruction::DeleteTrigger);
        f.engine
            .triggered_job_complete(&bundle.trigger, &bundle.job, bundle.default_completion())
            .await
            .unwrap();
        assert_eq!(f.repo.count(P, Collection::Triggers), 0);
        assert_eq!(f.repo.count(P, Collection::Jobs), 0);
    }

    #[tokio::test]
    async fn test_handle_misfires_sweep() {
        let f = fixture();
        let job = store_job(&f.store, "j").await;
        let t = store_trigger(&f.store, "t", &job.key, 5, t0()).await;
        let now = t0() + Duration::minutes(5);
        assert_eq!(f.engine.handle_misfires(now, 10).await.unwrap(), 1);
        assert_eq!(stored(&f.store, &t).await.next_fire_time, Some(now));
        assert_eq!(f.engine.handle_misfires(now, 10).await.unwrap(), 0);
    }

    fn arb_trigger() -> impl Strategy<Value = (i32, i64, String, String)> {
        (-5i32..5, 0i64..5, "[a-c]{1,2}", "[a-c]{1,2}")
    }

    proptest! {
        #[test]
        fn property_query_order_matches_acquisition_order(
            specs in proptest::collection::vec(arb_trigger(), 1..12)
        ) {
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap();
            rt.block_on(async {
                let f = fixture();
                let mut expected = Vec::new();
                for (priority, offset, group, name) in specs {
                    let t = Trigger::new(
                        TriggerKey::new(name, group),
                        JobKey::in_default_group("j"),
                        Schedule::once(),
                    )
                    .starting_at(t0())
                    .with_priority(priority)
                    .with_next_fire_time(t0() + Duration::seconds(offset));
                    // duplicate keys simply fail to insert
                    if f.store.insert(&t).await.is_ok() {
                        expected.push(t);
                    }
                }
                expected.sort_by(acquisition_order);

                let found: Vec<Trigger> = f
                    .store
                    .query::<Trigger>(due_triggers_query(t0() + Duration::hours(1)))
                    .await
                    .unwrap()
                    .into_iter()
                    .map(|v| v.entity)
                    .collect();
                prop_assert_eq!(found, expected);
                Ok(())
            })?;
        }
    }
}
