// Node runner: acquire due triggers, fire them, hand them to an executor and
// report completion back to the job store

use async_trait::async_trait;
use chrono::Utc;
use jobstore::{
    CommitInstruction, CompletedExecutionInstruction, JobStore, JobStoreError, TriggerFiredBundle,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, instrument, warn};

#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// How often to poll for due triggers
    pub poll_interval: Duration,
    /// Look-ahead window handed to acquisition
    pub acquire_window: Duration,
    pub max_batch_size: usize,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            acquire_window: Duration::ZERO,
            max_batch_size: 10,
        }
    }
}

/// Runs the job behind a fired trigger
#[async_trait]
pub trait JobExecutor: Send + Sync {
    async fn execute(&self, bundle: &TriggerFiredBundle) -> CompletedExecutionInstruction;
}

/// Executor that only logs the firing
pub struct LoggingExecutor;

#[async_trait]
impl JobExecutor for LoggingExecutor {
    async fn execute(&self, bundle: &TriggerFiredBundle) -> CompletedExecutionInstruction {
        info!(
            job = %bundle.job.key,
            job_type = %bundle.job.job_type,
            trigger = %bundle.trigger.key,
            fire_instance_id = %bundle.fire_instance_id,
            scheduled_fire_time = %bundle.scheduled_fire_time,
            recovering = bundle.recovering,
            "Job fired"
        );
        bundle.default_completion()
    }
}

pub struct SchedulerRunner {
    config: RunnerConfig,
    store: Arc<dyn JobStore>,
    executor: Arc<dyn JobExecutor>,
    shutdown_tx: watch::Sender<bool>,
}

impl SchedulerRunner {
    pub fn new(
        config: RunnerConfig,
        store: Arc<dyn JobStore>,
        executor: Arc<dyn JobExecutor>,
    ) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            config,
            store,
            executor,
            shutdown_tx,
        }
    }

    /// Poll until `stop` is called
    #[instrument(skip(self), fields(instance_id = %self.store.instance_id()))]
    pub async fn run(&self) {
        info!(
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            max_batch_size = self.config.max_batch_size,
            "Starting scheduler runner"
        );

        let mut poll = interval(self.config.poll_interval);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut shutdown = self.shutdown_tx.subscribe();

        while !*shutdown.borrow() {
            tokio::select! {
                _ = poll.tick() => {
                    match self.process_due_triggers().await {
                        Ok(0) => debug!("No triggers due"),
                        Ok(count) => info!(fired = count, "Processed due triggers"),
                        Err(JobStoreError::ShuttingDown) => break,
                        Err(e) if e.is_retryable() => {
                            warn!(error = %e, "Job store busy, retrying next poll");
                        }
                        Err(e) => error!(error = %e, "Error processing due triggers"),
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Shutdown signal received, stopping runner");
                        break;
                    }
                }
            }
        }

        info!("Scheduler runner stopped");
    }

    pub fn stop(&self) {
        self.shutdown_tx.send_replace(true);
    }

    /// One poll: returns how many triggers were executed
    pub async fn process_due_triggers(&self) -> Result<usize, JobStoreError> {
        let triggers = self
            .store
            .acquire_next_triggers(
                Utc::now(),
                self.config.acquire_window,
                self.config.max_batch_size,
            )
            .await?;

        let mut executed = 0;
        for trigger in &triggers {
            let bundle = match self.store.trigger_fired(trigger).await {
                Ok(CommitInstruction::Execute(bundle)) => bundle,
                Ok(CommitInstruction::Skip { reason }) => {
                    debug!(trigger = %trigger.key, reason = %reason, "Firing skipped");
                    continue;
                }
                Err(e) => {
                    error!(trigger = %trigger.key, error = %e, "Failed to fire trigger");
                    if let Err(e) = self.store.release_acquired_trigger(trigger).await {
                        warn!(trigger = %trigger.key, error = %e, "Failed to release trigger");
                    }
                    continue;
                }
            };

            let instruction = self.executor.execute(&bundle).await;
            if let Err(e) = self
                .store
                .triggered_job_complete(&bundle.trigger, &bundle.job, instruction)
                .await
            {
                error!(trigger = %bundle.trigger.key, error = %e, "Failed to record completion");
                continue;
            }
            executed += 1;
        }
        Ok(executed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jobstore::{
        DocumentJobStore, InMemoryDocumentStore, JobDetail, JobKey, Schedule, Settings, Trigger,
        TriggerKey, TriggerState,
    };
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingExecutor(AtomicUsize);

    #[async_trait]
    impl JobExecutor for CountingExecutor {
        async fn execute(&self, bundle: &TriggerFiredBundle) -> CompletedExecutionInstruction {
            self.0.fetch_add(1, Ordering::SeqCst);
            bundle.default_completion()
        }
    }

    fn store() -> Arc<DocumentJobStore> {
        let mut settings = Settings::default();
        settings.scheduler.instance_id = "runner-test".to_string();
        Arc::new(
            DocumentJobStore::new(Arc::new(InMemoryDocumentStore::new()), &settings).unwrap(),
        )
    }

    #[tokio::test]
    async fn test_one_shot_trigger_fires_once() {
        let store = store();
        let job = JobDetail::new(JobKey::in_default_group("report"), "ReportJob");
        let trigger = Trigger::new(TriggerKey::in_default_group("once"), job.key.clone(), Schedule::once())
            .starting_at(Utc::now() - chrono::Duration::seconds(1));
        store.store_job_and_trigger(job, trigger.clone()).await.unwrap();

        let executor = Arc::new(CountingExecutor(AtomicUsize::new(0)));
        let runner = SchedulerRunner::new(RunnerConfig::default(), store.clone(), executor.clone());

        assert_eq!(runner.process_due_triggers().await.unwrap(), 1);
        assert_eq!(runner.process_due_triggers().await.unwrap(), 0);
        assert_eq!(executor.0.load(Ordering::SeqCst), 1);
        // one-shot triggers are deleted once complete
        assert_eq!(store.get_trigger_state(&trigger.key).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_paused_trigger_is_not_fired() {
        let store = store();
        let job = JobDetail::new(JobKey::in_default_group("report"), "ReportJob");
        let trigger = Trigger::new(
            TriggerKey::in_default_group("every"),
            job.key.clone(),
            Schedule::every(chrono::Duration::minutes(1)),
        )
        .starting_at(Utc::now() - chrono::Duration::seconds(1));
        store.store_job_and_trigger(job, trigger.clone()).await.unwrap();
        store.pause_trigger(&trigger.key).await.unwrap();

        let runner = SchedulerRunner::new(RunnerConfig::default(), store.clone(), Arc::new(LoggingExecutor));
        assert_eq!(runner.process_due_triggers().await.unwrap(), 0);
        assert_eq!(
            store.get_trigger_state(&trigger.key).await.unwrap(),
            Some(TriggerState::Paused)
        );
    }

    #[tokio::test]
    async fn test_run_stops_on_signal() {
        let runner = Arc::new(SchedulerRunner::new(
            RunnerConfig {
                poll_interval: Duration::from_millis(20),
                ..RunnerConfig::default()
            },
            store(),
            Arc::new(LoggingExecutor),
        ));
        let task = {
            let runner = runner.clone();
            tokio::spawn(async move { runner.run().await })
        };
        tokio::time::sleep(Duration::from_millis(60)).await;
        runner.stop();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
    }
}
